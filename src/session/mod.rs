pub mod locks;
pub mod store;

use crate::listing::fields::{DraftListing, ListingField};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use locks::IdentityLocks;
pub use store::{MemorySessionStore, RedisSessionStore, SessionStore, SessionStoreError};

/// Where a conversation is. Data that only makes sense in one state lives in
/// that variant, so e.g. at most one field can be in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConversationState {
    Welcome,
    AwaitingIdentity,
    AwaitingIdentityConfirmation {
        email: String,
    },
    AwaitingDescription,
    AwaitingMissingField {
        field: ListingField,
    },
    CollectingPhotos,
    Submitted {
        listing_id: String,
    },
    ErrorRetry {
        failed_stage: String,
        message: String,
    },
}

impl ConversationState {
    pub fn name(&self) -> &'static str {
        match self {
            ConversationState::Welcome => "welcome",
            ConversationState::AwaitingIdentity => "awaiting_identity",
            ConversationState::AwaitingIdentityConfirmation { .. } => {
                "awaiting_identity_confirmation"
            }
            ConversationState::AwaitingDescription => "awaiting_description",
            ConversationState::AwaitingMissingField { .. } => "awaiting_missing_field",
            ConversationState::CollectingPhotos => "collecting_photos",
            ConversationState::Submitted { .. } => "submitted",
            ConversationState::ErrorRetry { .. } => "error_retry",
        }
    }
}

/// Seller identity bound to a conversation once the email is verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellerIdentity {
    pub seller_id: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub remote_media_id: String,
    #[serde(default)]
    pub stored_asset_id: Option<String>,
    #[serde(default)]
    pub stored_url: Option<String>,
    /// Confirmed attached to the current catalog draft.
    #[serde(default)]
    pub uploaded: bool,
}

impl PhotoRecord {
    pub fn pending(remote_media_id: impl Into<String>) -> Self {
        Self {
            remote_media_id: remote_media_id.into(),
            stored_asset_id: None,
            stored_url: None,
            uploaded: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSession {
    pub phone: String,
    pub state: ConversationState,
    #[serde(default)]
    pub identity: Option<SellerIdentity>,
    #[serde(default)]
    pub draft: DraftListing,
    #[serde(default)]
    pub photos: Vec<PhotoRecord>,
    #[serde(default)]
    pub external_draft_id: Option<String>,
    /// Set once the final listing row exists, so a retried submission never
    /// inserts it twice.
    #[serde(default)]
    pub listing_id: Option<String>,
    #[serde(default)]
    pub last_notified_photo_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationSession {
    pub fn new(phone: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            phone: phone.into(),
            state: ConversationState::Welcome,
            identity: None,
            draft: DraftListing::default(),
            photos: Vec::new(),
            external_draft_id: None,
            listing_id: None,
            last_notified_photo_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn current_field(&self) -> Option<ListingField> {
        match self.state {
            ConversationState::AwaitingMissingField { field } => Some(field),
            _ => None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return false;
        };
        now.signed_duration_since(self.updated_at) > ttl
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn has_photo(&self, media_id: &str) -> bool {
        self.photos.iter().any(|p| p.remote_media_id == media_id)
    }

    /// Appends unless the media id is already recorded. Returns whether the
    /// photo was added.
    pub fn append_photo(&mut self, record: PhotoRecord) -> bool {
        if self.has_photo(&record.remote_media_id) {
            return false;
        }
        self.photos.push(record);
        true
    }

    /// Records the catalog draft id. An id that is already set is never
    /// replaced; returns whether the value was stored.
    pub fn set_external_draft_id(&mut self, id: impl Into<String>) -> bool {
        if self.external_draft_id.is_some() {
            return false;
        }
        self.external_draft_id = Some(id.into());
        true
    }

    pub fn uploaded_photo_urls(&self) -> Vec<String> {
        self.photos
            .iter()
            .filter(|p| p.uploaded)
            .filter_map(|p| p.stored_url.clone())
            .collect()
    }
}
