use crate::config::env_string;
use crate::http::build_client;
use crate::ports::{MediaAsset, ServiceError, Transcriber};
use async_trait::async_trait;
use reqwest::{Client, multipart};
use serde::Deserialize;
use tracing::debug;

const DEFAULT_TRANSCRIBE_URL: &str = "https://api.openai.com/v1/audio/transcriptions";

#[derive(Debug, Clone)]
pub struct WhisperConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl WhisperConfig {
    pub fn from_env() -> Self {
        Self {
            api_url: env_string("TRANSCRIBE_API_URL")
                .unwrap_or_else(|| DEFAULT_TRANSCRIBE_URL.to_string()),
            api_key: env_string("TRANSCRIBE_API_KEY"),
            model: env_string("TRANSCRIBE_MODEL").unwrap_or_else(|| "whisper-1".to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Speech-to-text over a Whisper-compatible multipart endpoint.
#[derive(Debug, Clone)]
pub struct WhisperTranscriber {
    http: Client,
    config: WhisperConfig,
}

impl WhisperTranscriber {
    pub fn new(config: WhisperConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.api_key.is_some()
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: &MediaAsset) -> Result<String, ServiceError> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            return Err(ServiceError::NotConfigured("transcription"));
        };
        let part = multipart::Part::bytes(audio.bytes.clone())
            .file_name(format!("voice.{}", audio_extension(&audio.content_type)))
            .mime_str(&audio.content_type)
            .map_err(|err| ServiceError::Request(err.to_string()))?;
        let form = multipart::Form::new()
            .text("model", self.config.model.clone())
            .part("file", part);
        let response = self
            .http
            .post(&self.config.api_url)
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|err| ServiceError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ServiceError::Request(format!("HTTP {}", response.status())));
        }
        let payload: TranscriptionResponse = response
            .json()
            .await
            .map_err(|err| ServiceError::Deserialize(err.to_string()))?;
        let text = payload.text.trim().to_string();
        debug!(target = "closet.llm", chars = text.len(), "voice_transcribed");
        if text.is_empty() {
            return Err(ServiceError::Deserialize("empty transcript".into()));
        }
        Ok(text)
    }
}

fn audio_extension(content_type: &str) -> &'static str {
    // Cloud API voice notes are "audio/ogg; codecs=opus".
    let base = content_type.split(';').next().unwrap_or_default().trim();
    match base {
        "audio/mpeg" => "mp3",
        "audio/mp4" | "audio/aac" => "m4a",
        "audio/amr" => "amr",
        "audio/wav" | "audio/x-wav" => "wav",
        _ => "ogg",
    }
}
