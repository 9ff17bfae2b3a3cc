//! The three-step submission saga: ensure the catalog draft, upload pending
//! photos, persist the final listing. Every step writes its result into the
//! session and checkpoints it before the next one starts, so re-running the
//! saga resumes at the first incomplete step.

use super::photos::upload;
use crate::models::StageReport;
use crate::ports::{FinalListing, SellerMeta, Services};
use crate::session::ConversationSession;
use serde_json::{Value, json};
use std::{future::Future, time::Instant};
use thiserror::Error;
use tracing::{info, warn};

pub const STAGE_ENSURE_DRAFT: &str = "ensure_draft";
pub const STAGE_UPLOAD_PHOTOS: &str = "upload_photos";
pub const STAGE_PERSIST_LISTING: &str = "persist_listing";

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct SubmissionError {
    stage: &'static str,
    message: String,
    kind: SubmissionErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionErrorKind {
    InvalidInput,
    Internal,
}

impl SubmissionError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: SubmissionErrorKind::InvalidInput,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: SubmissionErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> SubmissionErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone)]
pub struct SubmissionReceipt {
    pub listing_id: String,
    pub draft_id: String,
    pub stages: Vec<StageReport>,
}

/// Runs the saga for the session stored under `key`. `source` tags the final
/// row with the transport it came through.
pub async fn submit(
    services: &Services,
    key: &str,
    session: &mut ConversationSession,
    source: &'static str,
) -> Result<SubmissionReceipt, SubmissionError> {
    let mut stages = Vec::new();

    let draft_id = capture_stage(STAGE_ENSURE_DRAFT, &mut stages, async {
        ensure_draft(services, session).await
    })
    .await?;
    checkpoint(services, key, session, STAGE_ENSURE_DRAFT).await?;

    capture_stage(STAGE_UPLOAD_PHOTOS, &mut stages, async {
        upload_pending_photos(services, key, session, &draft_id).await
    })
    .await?;

    let listing_id = capture_stage(STAGE_PERSIST_LISTING, &mut stages, async {
        persist_listing(services, session, &draft_id, source).await
    })
    .await?;
    checkpoint(services, key, session, STAGE_PERSIST_LISTING).await?;

    info!(
        target = "closet.conversation",
        listing_id = %listing_id,
        draft_id = %draft_id,
        photos = session.photos.len(),
        "listing_submitted"
    );
    Ok(SubmissionReceipt {
        listing_id,
        draft_id,
        stages,
    })
}

/// Creates the catalog draft unless the session already has one. Also used
/// when photo collection starts.
pub async fn ensure_draft(
    services: &Services,
    session: &mut ConversationSession,
) -> Result<(String, Value), SubmissionError> {
    if let Some(existing) = &session.external_draft_id {
        return Ok((existing.clone(), json!({ "draft_id": existing, "reused": true })));
    }
    let identity = session.identity.clone().ok_or_else(|| {
        SubmissionError::invalid_input(STAGE_ENSURE_DRAFT, "no verified seller on this session")
    })?;
    let meta = SellerMeta {
        seller_id: identity.seller_id,
        email: identity.email,
        phone: session.phone.clone(),
    };
    let draft_id = services
        .catalog
        .create_draft(&meta, &session.draft)
        .await
        .map_err(|err| SubmissionError::internal(STAGE_ENSURE_DRAFT, err.to_string()))?;
    session.set_external_draft_id(draft_id.clone());
    Ok((draft_id.clone(), json!({ "draft_id": draft_id, "reused": false })))
}

async fn upload_pending_photos(
    services: &Services,
    key: &str,
    session: &mut ConversationSession,
    draft_id: &str,
) -> Result<((), Value), SubmissionError> {
    let mut uploaded = 0usize;
    for index in 0..session.photos.len() {
        if session.photos[index].uploaded {
            continue;
        }
        let media_id = session.photos[index].remote_media_id.clone();
        let stored = upload(services, draft_id, &media_id)
            .await
            .map_err(|err| SubmissionError::internal(STAGE_UPLOAD_PHOTOS, err.to_string()))?;
        let photo = &mut session.photos[index];
        photo.stored_asset_id = Some(stored.asset_id);
        photo.stored_url = stored.url;
        photo.uploaded = true;
        uploaded += 1;
        checkpoint(services, key, session, STAGE_UPLOAD_PHOTOS).await?;
    }
    Ok(((), json!({ "uploaded": uploaded, "total": session.photos.len() })))
}

async fn persist_listing(
    services: &Services,
    session: &mut ConversationSession,
    draft_id: &str,
    source: &'static str,
) -> Result<(String, Value), SubmissionError> {
    if let Some(existing) = &session.listing_id {
        return Ok((existing.clone(), json!({ "listing_id": existing, "reused": true })));
    }
    let identity = session.identity.as_ref().ok_or_else(|| {
        SubmissionError::invalid_input(STAGE_PERSIST_LISTING, "no verified seller on this session")
    })?;
    let missing = session.draft.missing_required();
    if !missing.is_empty() {
        let keys = missing.iter().map(|f| f.key()).collect::<Vec<_>>().join(", ");
        return Err(SubmissionError::invalid_input(
            STAGE_PERSIST_LISTING,
            format!("missing required fields: {keys}"),
        ));
    }
    let listing = FinalListing {
        seller_id: identity.seller_id.clone(),
        external_draft_id: draft_id.to_string(),
        phone: session.phone.clone(),
        fields: session.draft.clone(),
        photo_urls: session.uploaded_photo_urls(),
        source,
    };
    let listing_id = services
        .listings
        .insert(&listing)
        .await
        .map_err(|err| SubmissionError::internal(STAGE_PERSIST_LISTING, err.to_string()))?;
    session.listing_id = Some(listing_id.clone());
    Ok((listing_id.clone(), json!({ "listing_id": listing_id, "reused": false })))
}

async fn checkpoint(
    services: &Services,
    key: &str,
    session: &mut ConversationSession,
    stage: &'static str,
) -> Result<(), SubmissionError> {
    session.touch();
    services.sessions.put(key, session).await.map_err(|err| {
        warn!(target = "closet.conversation", stage, error = %err, "checkpoint_failed");
        SubmissionError::internal(stage, err.to_string())
    })
}

async fn capture_stage<T, Fut>(
    name: &'static str,
    stages: &mut Vec<StageReport>,
    fut: Fut,
) -> Result<T, SubmissionError>
where
    Fut: Future<Output = Result<(T, Value), SubmissionError>>,
{
    let started = Instant::now();
    let (value, output) = fut.await?;
    let elapsed_ms = started.elapsed().as_millis();
    crate::metrics::stage_elapsed(name, elapsed_ms);
    stages.push(StageReport::new(name, elapsed_ms, output));
    Ok(value)
}
