use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One inbound chat event, normalized from the provider payload.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub from: String,
    pub message_id: String,
    pub received_at: DateTime<Utc>,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Text(String),
    /// A tapped reply button or list row.
    Choice {
        id: String,
        title: String,
    },
    Image {
        media_id: String,
        caption: Option<String>,
    },
    Voice {
        media_id: String,
    },
    Unsupported(String),
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Text(_) => "text",
            MessageBody::Choice { .. } => "choice",
            MessageBody::Image { .. } => "image",
            MessageBody::Voice { .. } => "voice",
            MessageBody::Unsupported(_) => "unsupported",
        }
    }
}

impl InboundMessage {
    pub fn text(from: &str, message_id: &str, body: &str) -> Self {
        Self {
            from: from.to_string(),
            message_id: message_id.to_string(),
            received_at: Utc::now(),
            body: MessageBody::Text(body.to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
