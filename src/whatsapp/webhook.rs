//! Inbound webhook payloads and their normalization into [`InboundMessage`].

use crate::models::{InboundMessage, MessageBody};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookChange {
    #[serde(default)]
    pub field: String,
    pub value: ChangeValue,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangeValue {
    #[serde(default)]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub messages: Vec<WireMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub phone_number_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireMessage {
    pub from: String,
    pub id: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(rename = "type", default)]
    pub message_type: String,
    #[serde(default)]
    pub text: Option<WireText>,
    #[serde(default)]
    pub image: Option<WireMedia>,
    #[serde(default)]
    pub audio: Option<WireMedia>,
    #[serde(default)]
    pub interactive: Option<WireInteractive>,
    #[serde(default)]
    pub button: Option<WireButton>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireText {
    pub body: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireMedia {
    pub id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub voice: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireInteractive {
    #[serde(rename = "type", default)]
    pub interactive_type: String,
    #[serde(default)]
    pub button_reply: Option<WireReply>,
    #[serde(default)]
    pub list_reply: Option<WireReply>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireReply {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

/// Quick-reply buttons on template messages.
#[derive(Debug, Clone, Deserialize)]
pub struct WireButton {
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub text: String,
}

impl WireMessage {
    pub fn normalize(&self) -> InboundMessage {
        let received_at = self
            .timestamp
            .as_deref()
            .and_then(|raw| raw.parse::<i64>().ok())
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now);
        InboundMessage {
            from: self.from.clone(),
            message_id: self.id.clone(),
            received_at,
            body: self.body(),
        }
    }

    fn body(&self) -> MessageBody {
        match self.message_type.as_str() {
            "text" => match &self.text {
                Some(text) => MessageBody::Text(text.body.clone()),
                None => MessageBody::Unsupported("text".into()),
            },
            "image" => match &self.image {
                Some(image) => MessageBody::Image {
                    media_id: image.id.clone(),
                    caption: image.caption.clone().filter(|c| !c.trim().is_empty()),
                },
                None => MessageBody::Unsupported("image".into()),
            },
            "audio" => match &self.audio {
                Some(audio) => MessageBody::Voice {
                    media_id: audio.id.clone(),
                },
                None => MessageBody::Unsupported("audio".into()),
            },
            "interactive" => self
                .interactive
                .as_ref()
                .and_then(|i| i.button_reply.as_ref().or(i.list_reply.as_ref()))
                .map(|reply| MessageBody::Choice {
                    id: reply.id.clone(),
                    title: reply.title.clone(),
                })
                .unwrap_or_else(|| MessageBody::Unsupported("interactive".into())),
            "button" => match &self.button {
                Some(button) => MessageBody::Choice {
                    id: button.payload.clone(),
                    title: button.text.clone(),
                },
                None => MessageBody::Unsupported("button".into()),
            },
            other => MessageBody::Unsupported(other.to_string()),
        }
    }
}

/// Every chat message in the payload, in delivery order. Status callbacks and
/// changes addressed to another business number are skipped.
pub fn inbound_messages(
    payload: &WebhookPayload,
    phone_number_id: Option<&str>,
) -> Vec<InboundMessage> {
    let mut out = Vec::new();
    for entry in &payload.entry {
        for change in &entry.changes {
            if change.field != "messages" {
                debug!(target = "closet.whatsapp", field = %change.field, "ignoring non-message webhook");
                continue;
            }
            if let (Some(expected), Some(metadata)) = (phone_number_id, &change.value.metadata)
                && metadata.phone_number_id != expected
            {
                debug!(target = "closet.whatsapp", received = %metadata.phone_number_id, "phone_number_id_mismatch");
                continue;
            }
            out.extend(change.value.messages.iter().map(WireMessage::normalize));
        }
    }
    out
}
