use crate::config::env_string;
use crate::http::build_client;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub gateway_url: Option<String>,
    pub api_key: Option<String>,
    pub function_name: String,
    pub model: Option<String>,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            gateway_url: env_string("TENSORZERO_GATEWAY_URL"),
            api_key: env_string("TENSORZERO_API_KEY"),
            function_name: env_string("TENSORZERO_FUNCTION")
                .unwrap_or_else(|| "listing_field_extraction".into()),
            model: env_string("TENSORZERO_MODEL"),
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing gateway url")]
    MissingGateway,
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

pub struct LlmClient {
    http: Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.gateway_url.is_some()
    }

    /// Runs one inference against the gateway and returns the first text block.
    pub async fn chat(&self, messages: &[LlmMessage]) -> Result<String, LlmError> {
        let gateway = self
            .config
            .gateway_url
            .as_deref()
            .map(|url| url.trim_end_matches('/'))
            .ok_or(LlmError::MissingGateway)?;

        let body = ChatRequest {
            function_name: self.config.function_name.clone(),
            model_name: self.config.model.clone(),
            input: ChatInput {
                messages: messages.to_vec(),
            },
        };

        let mut request = self.http.post(format!("{gateway}/inference")).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::Http(format!("HTTP {}", response.status())));
        }

        let payload: TensorZeroResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;

        payload
            .content
            .into_iter()
            .find(|item| item.r#type == "text")
            .map(|item| item.text)
            .ok_or_else(|| LlmError::InvalidResponse("missing text".into()))
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    function_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_name: Option<String>,
    input: ChatInput,
}

#[derive(Debug, Serialize)]
struct ChatInput {
    messages: Vec<LlmMessage>,
}

#[derive(Debug, Deserialize)]
struct TensorZeroResponse {
    content: Vec<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    r#type: String,
    #[serde(default)]
    text: String,
}
