use std::{env, time::Duration};

/// Runtime settings, read once at startup.
///
/// Every value has a default so the service boots in a local demo mode; remote
/// collaborators that are left unconfigured are replaced by in-process fallbacks.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub request_timeout: Duration,
    pub request_max_bytes: usize,
    pub redis_url: Option<String>,
    pub session_ttl: Duration,
    pub dedupe_ttl: Duration,
    pub photos: PhotoLimits,
    pub whatsapp: WhatsAppSettings,
    pub flow_private_key_pem: Option<String>,
    pub metrics_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhotoLimits {
    pub min: usize,
    pub max: usize,
}

impl Default for PhotoLimits {
    fn default() -> Self {
        Self { min: 3, max: 10 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WhatsAppSettings {
    pub token: Option<String>,
    pub phone_number_id: Option<String>,
    pub app_secret: Option<String>,
    pub verify_token: String,
    pub graph_api_base: String,
}

impl Settings {
    pub fn from_env() -> Self {
        let min = env_parse::<usize>("MIN_PHOTOS")
            .filter(|v| *v >= 1)
            .unwrap_or(3);
        let max = env_parse::<usize>("MAX_PHOTOS")
            .filter(|v| *v >= min)
            .unwrap_or(min.max(10));

        Self {
            port: env_parse("PORT").unwrap_or(8000),
            request_timeout: Duration::from_secs(
                env_parse("REQUEST_TIMEOUT_SECS")
                    .filter(|v| *v > 0)
                    .unwrap_or(20),
            ),
            request_max_bytes: env_parse("REQUEST_MAX_BYTES")
                .filter(|v| *v > 0)
                .unwrap_or(1024 * 1024),
            redis_url: env_string("REDIS_URL"),
            session_ttl: Duration::from_secs(
                env_parse::<u64>("SESSION_TTL_MINUTES")
                    .filter(|v| *v > 0)
                    .unwrap_or(24 * 60)
                    * 60,
            ),
            dedupe_ttl: Duration::from_secs(
                env_parse("MESSAGE_DEDUPE_TTL_SECS")
                    .filter(|v| *v > 0)
                    .unwrap_or(86_400),
            ),
            photos: PhotoLimits { min, max },
            whatsapp: WhatsAppSettings {
                token: env_string("WHATSAPP_TOKEN"),
                phone_number_id: env_string("WHATSAPP_PHONE_NUMBER_ID"),
                app_secret: env_string("WHATSAPP_APP_SECRET"),
                verify_token: env_string("WHATSAPP_VERIFY_TOKEN").unwrap_or_default(),
                graph_api_base: env_string("GRAPH_API_BASE")
                    .unwrap_or_else(|| "https://graph.facebook.com/v19.0".to_string())
                    .trim_end_matches('/')
                    .to_string(),
            },
            flow_private_key_pem: load_flow_private_key(),
            metrics_key: env_string("METRICS_KEY"),
        }
    }
}

fn load_flow_private_key() -> Option<String> {
    if let Some(pem) = env_string("FLOW_PRIVATE_KEY") {
        // Single-line env values usually carry escaped newlines.
        return Some(pem.replace("\\n", "\n"));
    }
    let path = env_string("FLOW_PRIVATE_KEY_PATH")?;
    match std::fs::read_to_string(&path) {
        Ok(pem) => Some(pem),
        Err(err) => {
            tracing::warn!(target = "closet.api", path = %path, error = %err, "flow_private_key_unreadable");
            None
        }
    }
}

pub fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}
