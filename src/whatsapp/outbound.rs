use crate::http::build_client;
use crate::ports::{ChoiceOption, MAX_CHOICE_OPTIONS, Messenger, ServiceError, mask_phone};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{info, warn};

/// Reply-button titles are capped by the provider.
const BUTTON_TITLE_MAX: usize = 20;

/// Sends messages through the WhatsApp Cloud API.
#[derive(Debug, Clone)]
pub struct CloudApiMessenger {
    http: Client,
    base_url: String,
    phone_number_id: String,
    token: String,
}

impl CloudApiMessenger {
    pub fn new(base_url: &str, phone_number_id: &str, token: &str) -> Self {
        Self {
            http: build_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            phone_number_id: phone_number_id.to_string(),
            token: token.to_string(),
        }
    }

    async fn post(&self, payload: Value) -> Result<(), ServiceError> {
        let url = format!("{}/{}/messages", self.base_url, self.phone_number_id);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await
            .map_err(|err| ServiceError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ServiceError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

pub fn text_payload(to: &str, text: &str) -> Value {
    json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": "text",
        "text": { "preview_url": false, "body": text },
    })
}

pub fn choice_payload(to: &str, text: &str, options: &[ChoiceOption]) -> Value {
    let buttons = options
        .iter()
        .take(MAX_CHOICE_OPTIONS)
        .map(|option| {
            json!({
                "type": "reply",
                "reply": {
                    "id": option.id,
                    "title": option.title.chars().take(BUTTON_TITLE_MAX).collect::<String>(),
                },
            })
        })
        .collect::<Vec<_>>();
    json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": "interactive",
        "interactive": {
            "type": "button",
            "body": { "text": text },
            "action": { "buttons": buttons },
        },
    })
}

#[async_trait]
impl Messenger for CloudApiMessenger {
    async fn send_text(&self, to: &str, text: &str) -> Result<(), ServiceError> {
        self.post(text_payload(to, text)).await
    }

    async fn send_choice(
        &self,
        to: &str,
        text: &str,
        options: &[ChoiceOption],
    ) -> Result<(), ServiceError> {
        if options.len() > MAX_CHOICE_OPTIONS {
            warn!(
                target = "closet.whatsapp",
                to = %mask_phone(to),
                requested = options.len(),
                "choice_options_truncated"
            );
        }
        if options.is_empty() {
            return self.send_text(to, text).await;
        }
        self.post(choice_payload(to, text, options)).await
    }
}

/// Messenger used when no Cloud API credentials are configured.
#[derive(Debug, Clone, Default)]
pub struct LogMessenger;

#[async_trait]
impl Messenger for LogMessenger {
    async fn send_text(&self, to: &str, text: &str) -> Result<(), ServiceError> {
        info!(target = "closet.whatsapp", to = %mask_phone(to), text, "outbound_text");
        Ok(())
    }

    async fn send_choice(
        &self,
        to: &str,
        text: &str,
        options: &[ChoiceOption],
    ) -> Result<(), ServiceError> {
        let titles = options
            .iter()
            .take(MAX_CHOICE_OPTIONS)
            .map(|o| o.title.as_str())
            .collect::<Vec<_>>()
            .join(" | ");
        info!(target = "closet.whatsapp", to = %mask_phone(to), text, options = %titles, "outbound_choice");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choice_payload_caps_buttons_and_titles() {
        let options = vec![
            ChoiceOption::new("a", "First option with a very long title"),
            ChoiceOption::new("b", "Second"),
            ChoiceOption::new("c", "Third"),
            ChoiceOption::new("d", "Fourth"),
        ];
        let payload = choice_payload("15550100000", "Pick one", &options);
        let buttons = payload["interactive"]["action"]["buttons"]
            .as_array()
            .expect("buttons");
        assert_eq!(buttons.len(), 3);
        let title = buttons[0]["reply"]["title"].as_str().unwrap();
        assert!(title.chars().count() <= BUTTON_TITLE_MAX);
        assert_eq!(buttons[2]["reply"]["id"], "c");
    }

    #[test]
    fn text_payload_shape() {
        let payload = text_payload("15550100000", "hi");
        assert_eq!(payload["type"], "text");
        assert_eq!(payload["text"]["body"], "hi");
        assert_eq!(payload["messaging_product"], "whatsapp");
    }
}
