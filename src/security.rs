use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Credentials for the inbound webhook.
#[derive(Debug, Clone, Default)]
pub struct WebhookAuth {
    pub app_secret: Option<String>,
    pub verify_token: String,
}

impl WebhookAuth {
    /// Without an app secret every body is accepted, which is only meant for
    /// local runs.
    pub fn accepts(&self, signature_header: Option<&str>, body: &[u8]) -> bool {
        match &self.app_secret {
            None => true,
            Some(secret) => signature_header
                .is_some_and(|header| verify_signature(secret, header, body)),
        }
    }

    pub fn subscription_challenge<'a>(
        &self,
        mode: Option<&str>,
        token: Option<&str>,
        challenge: Option<&'a str>,
    ) -> Option<&'a str> {
        verify_webhook_subscription(&self.verify_token, mode, token, challenge)
    }
}

/// Checks an `X-Hub-Signature-256` header (`sha256=<hex>`) against the raw
/// request body. Comparison is constant-time.
pub fn verify_signature(app_secret: &str, header: &str, body: &[u8]) -> bool {
    let Some(hex_digest) = header.trim().strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Returns the challenge to echo when the handshake is valid.
pub fn verify_webhook_subscription<'a>(
    verify_token: &str,
    mode: Option<&str>,
    token: Option<&str>,
    challenge: Option<&'a str>,
) -> Option<&'a str> {
    if verify_token.is_empty() {
        warn!(target = "closet.api", "webhook_verify_token_unset");
        return None;
    }
    if mode == Some("subscribe") && token == Some(verify_token) {
        challenge
    } else {
        None
    }
}
