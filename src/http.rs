use crate::config::env_parse;
use reqwest::Client;
use std::time::Duration;

/// Shared outbound client. Timeouts stay well under the provider's webhook
/// redelivery window so a slow collaborator surfaces as a retryable failure.
pub fn build_client() -> Client {
    let timeout = env_parse::<u64>("HTTP_TIMEOUT_SECS")
        .filter(|v| *v > 0)
        .unwrap_or(10);
    let connect = env_parse::<u64>("HTTP_CONNECT_TIMEOUT_SECS")
        .filter(|v| *v > 0)
        .unwrap_or(5);
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .build()
        .unwrap_or_else(|_| Client::new())
}
