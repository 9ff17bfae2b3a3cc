//! Hand-written fakes for every collaborator, shared by unit tests.

use crate::listing::extractor::KeywordExtractor;
use crate::listing::fields::DraftListing;
use crate::ports::{
    CatalogApi, ChoiceOption, FieldExtractor, FinalListing, ListingStore, MediaAsset,
    MediaTranscoder, Messenger, SellerMeta, ServiceError, Services, StoredPhoto, Transcriber,
};
use crate::session::MemorySessionStore;
use crate::supabase::MemorySellerDirectory;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub to: String,
    pub text: String,
    pub options: Vec<ChoiceOption>,
}

#[derive(Default)]
pub struct RecordingMessenger {
    sent: Mutex<Vec<Sent>>,
}

impl RecordingMessenger {
    pub async fn sent(&self) -> Vec<Sent> {
        self.sent.lock().await.clone()
    }

    pub async fn texts(&self) -> Vec<String> {
        self.sent().await.into_iter().map(|s| s.text).collect()
    }

    pub async fn last(&self) -> Option<Sent> {
        self.sent.lock().await.last().cloned()
    }

    pub async fn clear(&self) {
        self.sent.lock().await.clear();
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send_text(&self, to: &str, text: &str) -> Result<(), ServiceError> {
        self.sent.lock().await.push(Sent {
            to: to.to_string(),
            text: text.to_string(),
            options: Vec::new(),
        });
        Ok(())
    }

    async fn send_choice(
        &self,
        to: &str,
        text: &str,
        options: &[ChoiceOption],
    ) -> Result<(), ServiceError> {
        self.sent.lock().await.push(Sent {
            to: to.to_string(),
            text: text.to_string(),
            options: options.to_vec(),
        });
        Ok(())
    }
}

/// Catalog that counts drafts and can be told to fail.
#[derive(Default)]
pub struct FakeCatalog {
    drafts: AtomicUsize,
    attached: Mutex<Vec<String>>,
    fail_create: AtomicBool,
    fail_attach: AtomicBool,
}

impl FakeCatalog {
    pub fn drafts_created(&self) -> usize {
        self.drafts.load(Ordering::SeqCst)
    }

    pub async fn attached(&self) -> Vec<String> {
        self.attached.lock().await.clone()
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_attach(&self, fail: bool) {
        self.fail_attach.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CatalogApi for FakeCatalog {
    async fn create_draft(
        &self,
        _seller: &SellerMeta,
        _fields: &DraftListing,
    ) -> Result<String, ServiceError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ServiceError::Request("catalog down".into()));
        }
        let n = self.drafts.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("draft-{n}"))
    }

    async fn attach_photo(
        &self,
        draft_id: &str,
        _asset: &MediaAsset,
    ) -> Result<StoredPhoto, ServiceError> {
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(ServiceError::Request("upload rejected".into()));
        }
        let mut attached = self.attached.lock().await;
        attached.push(draft_id.to_string());
        let n = attached.len();
        Ok(StoredPhoto {
            asset_id: format!("asset-{n}"),
            url: Some(format!("https://cdn.example.com/{draft_id}/{n}.jpg")),
        })
    }
}

#[derive(Default)]
pub struct FakeListingStore {
    rows: Mutex<Vec<FinalListing>>,
    fail: AtomicBool,
}

impl FakeListingStore {
    pub async fn rows(&self) -> Vec<FinalListing> {
        self.rows.lock().await.clone()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ListingStore for FakeListingStore {
    async fn insert(&self, listing: &FinalListing) -> Result<String, ServiceError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ServiceError::Request("insert failed".into()));
        }
        let mut rows = self.rows.lock().await;
        rows.push(listing.clone());
        Ok(format!("listing-{}", rows.len()))
    }
}

/// Returns a few bytes for any media id.
#[derive(Default)]
pub struct FakeMedia;

#[async_trait]
impl MediaTranscoder for FakeMedia {
    async fn fetch(&self, media_id: &str) -> Result<MediaAsset, ServiceError> {
        let content_type = if media_id.starts_with("voice") {
            "audio/ogg"
        } else {
            "image/jpeg"
        };
        Ok(MediaAsset {
            bytes: media_id.as_bytes().to_vec(),
            content_type: content_type.to_string(),
        })
    }
}

/// Transcribes by looking the media bytes (the id) up in a script.
#[derive(Default)]
pub struct ScriptedTranscriber {
    script: std::sync::Mutex<HashMap<String, String>>,
}

impl ScriptedTranscriber {
    pub fn say(&self, media_id: &str, transcript: &str) {
        if let Ok(mut script) = self.script.lock() {
            script.insert(media_id.to_string(), transcript.to_string());
        }
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(&self, audio: &MediaAsset) -> Result<String, ServiceError> {
        let key = String::from_utf8_lossy(&audio.bytes).to_string();
        self.script
            .lock()
            .ok()
            .and_then(|script| script.get(&key).cloned())
            .ok_or_else(|| ServiceError::Deserialize("inaudible".into()))
    }
}

/// Extractor returning scripted drafts for exact texts, keywords otherwise.
#[derive(Default)]
pub struct ScriptedExtractor {
    script: std::sync::Mutex<HashMap<String, DraftListing>>,
}

impl ScriptedExtractor {
    pub fn respond(&self, text: &str, draft: DraftListing) {
        if let Ok(mut script) = self.script.lock() {
            script.insert(text.to_string(), draft);
        }
    }
}

#[async_trait]
impl FieldExtractor for ScriptedExtractor {
    async fn extract(&self, text: &str) -> DraftListing {
        let scripted = self
            .script
            .lock()
            .ok()
            .and_then(|script| script.get(text).cloned());
        match scripted {
            Some(draft) => draft,
            None => KeywordExtractor.extract_sync(text),
        }
    }
}

/// All fakes wired together, each still reachable for assertions.
pub struct TestHarness {
    pub sessions: Arc<MemorySessionStore>,
    pub sellers: Arc<MemorySellerDirectory>,
    pub catalog: Arc<FakeCatalog>,
    pub listings: Arc<FakeListingStore>,
    pub messenger: Arc<RecordingMessenger>,
    pub transcriber: Arc<ScriptedTranscriber>,
    pub extractor: Arc<ScriptedExtractor>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(MemorySessionStore::new()),
            sellers: Arc::new(MemorySellerDirectory::new()),
            catalog: Arc::new(FakeCatalog::default()),
            listings: Arc::new(FakeListingStore::default()),
            messenger: Arc::new(RecordingMessenger::default()),
            transcriber: Arc::new(ScriptedTranscriber::default()),
            extractor: Arc::new(ScriptedExtractor::default()),
        }
    }

    pub fn services(&self) -> Services {
        Services {
            sessions: self.sessions.clone(),
            sellers: self.sellers.clone(),
            catalog: self.catalog.clone(),
            listings: self.listings.clone(),
            messenger: self.messenger.clone(),
            media: Arc::new(FakeMedia),
            transcriber: self.transcriber.clone(),
            extractor: self.extractor.clone(),
        }
    }
}
