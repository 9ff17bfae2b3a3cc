use crate::listing::fields::{DraftListing, ListingField, parse_price};
use crate::listing::matcher::CANONICAL_VALUES;
use crate::llm::{LlmClient, LlmMessage};
use crate::ports::FieldExtractor;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str = r#"
You extract listing details for a secondhand clothing item from a seller's chat message.
Respond with a single JSON object with exactly these keys: designer, item_type, size, condition,
asking_price, color, material, details. Use null for anything the message does not state.
Never guess. asking_price is a number without currency symbols. Output JSON only.
"#;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("llm request failed: {0}")]
    Llm(String),
    #[error("unable to parse extraction json")]
    Parse,
}

/// LLM-backed extractor with a keyword fallback. Any gateway or parse failure
/// degrades to the keyword pass; the caller never sees an error.
pub struct LlmFieldExtractor {
    llm: Arc<LlmClient>,
    fallback: KeywordExtractor,
}

impl LlmFieldExtractor {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self {
            llm,
            fallback: KeywordExtractor,
        }
    }

    async fn infer(&self, text: &str) -> Result<DraftListing, ExtractError> {
        let messages = vec![LlmMessage::system(SYSTEM_PROMPT), LlmMessage::user(text)];
        let response = self
            .llm
            .chat(&messages)
            .await
            .map_err(|err| ExtractError::Llm(err.to_string()))?;
        let cleaned = strip_markdown_fence(&response);
        let value: Value = serde_json::from_str(&cleaned).map_err(|_| ExtractError::Parse)?;
        let object = value.as_object().ok_or(ExtractError::Parse)?;
        Ok(draft_from_json(object))
    }
}

#[async_trait]
impl FieldExtractor for LlmFieldExtractor {
    async fn extract(&self, text: &str) -> DraftListing {
        if text.trim().is_empty() {
            return DraftListing::default();
        }
        if !self.llm.is_configured() {
            return self.fallback.extract(text).await;
        }
        match self.infer(text).await {
            Ok(draft) => draft,
            Err(err) => {
                warn!(target = "closet.llm", error = %err, "field_extraction_fallback");
                self.fallback.extract(text).await
            }
        }
    }
}

/// Reads whatever fields are present, ignoring wrong types and junk values.
pub fn draft_from_json(object: &Map<String, Value>) -> DraftListing {
    let mut draft = DraftListing::default();
    for field in ListingField::ALL {
        let Some(value) = object.get(field.key()) else {
            continue;
        };
        let raw = match value {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => continue,
        };
        if raw.is_empty() || raw.eq_ignore_ascii_case("null") || raw.eq_ignore_ascii_case("unknown")
        {
            continue;
        }
        if let Err(err) = draft.set(field, &raw) {
            debug!(target = "closet.llm", field = %field, error = %err, "extracted_value_dropped");
        }
    }
    draft
}

fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}

static PRICE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:\$|\busd\s*|\brs\.?\s*|\binr\s*|\b(?:price|asking|for)\s*[:=]?\s*\$?)\s*(\d[\d,]*(?:\.\d{1,2})?)|(\d[\d,]*(?:\.\d{1,2})?)\s*(?:\$|usd\b|dollars\b|bucks\b)",
    )
    .expect("valid price pattern")
});

static SIZE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bsize\s*[:=]?\s*([a-z0-9-]+)").expect("valid size pattern"));

static DESIGNER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\b[Bb]y|\b[Ff]rom|\b[Dd]esigner:?)\s+([A-Z][\w&'.-]*(?:\s+[A-Z][\w&'.-]*)*)")
        .expect("valid designer pattern")
});

/// Deterministic extraction from keywords and a few patterns. Used when the
/// LLM gateway is unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordExtractor;

impl KeywordExtractor {
    pub fn extract_sync(&self, text: &str) -> DraftListing {
        let mut draft = DraftListing::default();
        let lowered = text.to_lowercase();

        if let Some(price) = PRICE_RE.captures(text).and_then(|caps| {
            caps.get(1)
                .or_else(|| caps.get(2))
                .and_then(|m| parse_price(m.as_str()).ok())
        }) {
            draft.asking_price = Some(price);
        }

        let size = SIZE_RE
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| CANONICAL_VALUES.match_to_dropdown(m.as_str(), ListingField::Size))
            .filter(|s| !s.is_empty())
            .or_else(|| find_keyword(&lowered, ListingField::Size));
        draft.size = size;

        if let Some(caps) = DESIGNER_RE.captures(text)
            && let Some(name) = caps.get(1)
        {
            draft.designer = Some(name.as_str().trim().to_string());
        }

        for field in [
            ListingField::ItemType,
            ListingField::Condition,
            ListingField::Color,
            ListingField::Material,
        ] {
            if let Some(value) = find_keyword(&lowered, field) {
                let _ = draft.set(field, &value);
            }
        }
        draft
    }
}

#[async_trait]
impl FieldExtractor for KeywordExtractor {
    async fn extract(&self, text: &str) -> DraftListing {
        self.extract_sync(text)
    }
}

/// First canonical option with a keyword (or value) appearing as a whole word
/// in `lowered`.
fn find_keyword(lowered: &str, field: ListingField) -> Option<String> {
    CANONICAL_VALUES
        .options(field)
        .iter()
        .find(|option| {
            let value = option.value.to_lowercase();
            // Single letters ("s", "m") are too ambiguous to spot in free text.
            (value.len() > 1 && contains_word(lowered, &value))
                || option.keywords.iter().any(|k| contains_word(lowered, k))
        })
        .map(|option| option.value.clone())
}

fn contains_word(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    haystack.match_indices(needle).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}
