//! Contracts for the collaborators the conversation core talks to.
//!
//! Each trait has a network-backed implementation (WhatsApp Cloud API,
//! Supabase, the catalog REST API, the LLM gateway) and an in-process fallback
//! used when the remote side is not configured.

use crate::listing::fields::DraftListing;
use crate::session::store::SessionStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("not ready: {0}")]
    NotReady(String),
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seller {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Raw media pulled from the channel provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaAsset {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// A photo accepted by the catalog. `url` stays `None` when the catalog did not
/// publish one within the polling budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPhoto {
    pub asset_id: String,
    pub url: Option<String>,
}

/// Seller metadata attached to a catalog draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SellerMeta {
    pub seller_id: String,
    pub email: String,
    pub phone: String,
}

/// The row written once a listing is fully submitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalListing {
    pub seller_id: String,
    pub external_draft_id: String,
    pub phone: String,
    #[serde(flatten)]
    pub fields: DraftListing,
    pub photo_urls: Vec<String>,
    pub source: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChoiceOption {
    pub id: String,
    pub title: String,
}

impl ChoiceOption {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
        }
    }
}

/// Inline options the provider renders as reply buttons.
pub const MAX_CHOICE_OPTIONS: usize = 3;

#[async_trait]
pub trait SellerDirectory: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<Seller>, ServiceError>;
    async fn create(&self, email: &str, phone: &str) -> Result<Seller, ServiceError>;
    async fn update_phone(&self, seller_id: &str, phone: &str) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait CatalogApi: Send + Sync {
    async fn create_draft(
        &self,
        seller: &SellerMeta,
        fields: &DraftListing,
    ) -> Result<String, ServiceError>;
    async fn attach_photo(
        &self,
        draft_id: &str,
        asset: &MediaAsset,
    ) -> Result<StoredPhoto, ServiceError>;
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn insert(&self, listing: &FinalListing) -> Result<String, ServiceError>;
}

#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(&self, to: &str, text: &str) -> Result<(), ServiceError>;
    /// At most [`MAX_CHOICE_OPTIONS`] options are delivered.
    async fn send_choice(
        &self,
        to: &str,
        text: &str,
        options: &[ChoiceOption],
    ) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait MediaTranscoder: Send + Sync {
    async fn fetch(&self, media_id: &str) -> Result<MediaAsset, ServiceError>;
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &MediaAsset) -> Result<String, ServiceError>;
}

/// Best-effort extraction. Never fails: nothing learned is an empty draft.
#[async_trait]
pub trait FieldExtractor: Send + Sync {
    async fn extract(&self, text: &str) -> DraftListing;
}

/// Everything the conversation engine and the flow endpoint share.
#[derive(Clone)]
pub struct Services {
    pub sessions: Arc<dyn SessionStore>,
    pub sellers: Arc<dyn SellerDirectory>,
    pub catalog: Arc<dyn CatalogApi>,
    pub listings: Arc<dyn ListingStore>,
    pub messenger: Arc<dyn Messenger>,
    pub media: Arc<dyn MediaTranscoder>,
    pub transcriber: Arc<dyn Transcriber>,
    pub extractor: Arc<dyn FieldExtractor>,
}

/// Phone numbers are compared on digits only so `+1 (555) 010-0000` and
/// `15550100000` are the same identity.
pub fn normalize_phone(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

/// Last four digits, for logs.
pub fn mask_phone(raw: &str) -> String {
    let digits = normalize_phone(raw);
    let tail: String = digits
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("***{tail}")
}
