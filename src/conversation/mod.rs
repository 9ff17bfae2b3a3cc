//! Per-seller conversation engine. One inbound message is one turn: load the
//! session, apply the transition for its state, persist or discard it.

pub mod commands;
pub mod photos;
pub mod prompts;
pub mod submission;

use crate::config::PhotoLimits;
use crate::listing::fields::{ListingField, next_missing_field, safe_merge};
use crate::listing::matcher::{CANONICAL_VALUES, parse_option_id};
use crate::models::{InboundMessage, MessageBody};
use crate::ports::{
    ChoiceOption, Seller, SellerDirectory, ServiceError, Services, mask_phone, normalize_phone,
};
use crate::session::{
    ConversationSession, ConversationState, IdentityLocks, SellerIdentity, SessionStoreError,
};
use crate::supabase::phone_conflicts;
use chrono::Utc;
use commands::{Command, affirmation, classify, looks_like_email};
use photos::{PhotoIntake, PhotoNotice, accept_photo, notice_for};
use prompts::FieldQuestion;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] SessionStoreError),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Whether the session survives the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Persist {
    Save,
    Discard,
}

/// Outcome of looking a seller up by email for a given phone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SellerLookup {
    Verified(Seller),
    /// The email belongs to a seller bound to another phone.
    Refused,
    NotFound,
}

/// Directory lookup with the anti-hijack guard. A seller without a phone on
/// file gets this phone bound.
pub async fn lookup_seller(
    directory: &dyn SellerDirectory,
    email: &str,
    phone: &str,
) -> Result<SellerLookup, ServiceError> {
    let Some(mut seller) = directory.find_by_email(email).await? else {
        return Ok(SellerLookup::NotFound);
    };
    if phone_conflicts(&seller, phone) {
        warn!(
            target = "closet.conversation",
            phone = %mask_phone(phone),
            seller_id = %seller.id,
            "identity_phone_mismatch"
        );
        return Ok(SellerLookup::Refused);
    }
    if seller.phone.is_none() {
        directory.update_phone(&seller.id, phone).await?;
        seller.phone = Some(phone.to_string());
    }
    Ok(SellerLookup::Verified(seller))
}

#[derive(Clone)]
pub struct ConversationEngine {
    services: Services,
    locks: IdentityLocks,
    limits: PhotoLimits,
    session_ttl: Duration,
}

impl ConversationEngine {
    pub fn new(
        services: Services,
        locks: IdentityLocks,
        limits: PhotoLimits,
        session_ttl: Duration,
    ) -> Self {
        Self {
            services,
            locks,
            limits,
            session_ttl,
        }
    }

    /// Handles one message. Never fails: any internal error leaves the stored
    /// session untouched and asks the seller to resend.
    pub async fn handle(&self, message: InboundMessage) {
        let _guard = self.locks.acquire(&normalize_phone(&message.from)).await;
        crate::metrics::inbound_message(message.body.kind());
        if let Err(err) = self.process(&message).await {
            error!(
                target = "closet.conversation",
                phone = %mask_phone(&message.from),
                message_id = %message.message_id,
                error = %err,
                "turn_failed"
            );
            self.say(&message.from, prompts::TRY_AGAIN).await;
        }
    }

    async fn process(&self, message: &InboundMessage) -> Result<(), EngineError> {
        let phone = message.from.as_str();
        let Some(body) = self.resolve_voice(phone, &message.body).await else {
            return Ok(());
        };

        let mut session = self.load(phone).await?;
        let before = session.state.name();

        let persist = match classify(&body) {
            Some(Command::StartOver) => {
                session = ConversationSession::new(phone);
                session.state = ConversationState::AwaitingIdentity;
                self.say(phone, prompts::START_OVER).await;
                Persist::Save
            }
            Some(Command::Cancel) => {
                self.say(phone, prompts::CANCELLED).await;
                Persist::Discard
            }
            command => self.step(&mut session, &body, command).await?,
        };

        crate::metrics::transition(before, session.state.name());
        match persist {
            Persist::Save => {
                session.touch();
                self.services.sessions.put(phone, &session).await?;
            }
            Persist::Discard => self.services.sessions.delete(phone).await?,
        }
        debug!(
            target = "closet.conversation",
            phone = %mask_phone(phone),
            from = before,
            to = session.state.name(),
            persisted = persist == Persist::Save,
            "turn_complete"
        );
        Ok(())
    }

    async fn load(&self, phone: &str) -> Result<ConversationSession, EngineError> {
        match self.services.sessions.get(phone).await? {
            Some(session) if session.is_expired(Utc::now(), self.session_ttl) => {
                info!(target = "closet.conversation", phone = %mask_phone(phone), "session_expired");
                Ok(ConversationSession::new(phone))
            }
            Some(session) => Ok(session),
            None => Ok(ConversationSession::new(phone)),
        }
    }

    /// Voice notes become text. `None` means the seller was already told the
    /// note could not be read.
    async fn resolve_voice(&self, phone: &str, body: &MessageBody) -> Option<MessageBody> {
        let MessageBody::Voice { media_id } = body else {
            return Some(body.clone());
        };
        let transcript = async {
            let audio = self.services.media.fetch(media_id).await?;
            self.services.transcriber.transcribe(&audio).await
        }
        .await;
        match transcript {
            Ok(text) => Some(MessageBody::Text(text)),
            Err(err) => {
                warn!(target = "closet.conversation", media_id = %media_id, error = %err, "voice_transcription_failed");
                self.say(phone, prompts::VOICE_FAILED).await;
                None
            }
        }
    }

    async fn step(
        &self,
        session: &mut ConversationSession,
        body: &MessageBody,
        command: Option<Command>,
    ) -> Result<Persist, EngineError> {
        let phone = session.phone.clone();
        let fresh = matches!(
            session.state,
            ConversationState::Welcome | ConversationState::Submitted { .. }
        );
        if let MessageBody::Unsupported(kind) = body
            && !fresh
        {
            debug!(target = "closet.conversation", kind = %kind, "unsupported_message");
            self.say(&phone, prompts::UNSUPPORTED).await;
            return Ok(Persist::Save);
        }

        match session.state.clone() {
            ConversationState::Welcome | ConversationState::Submitted { .. } => {
                *session = ConversationSession::new(phone.as_str());
                session.state = ConversationState::AwaitingIdentity;
                self.say(&phone, prompts::WELCOME).await;
                Ok(Persist::Save)
            }
            ConversationState::AwaitingIdentity => self.on_identity(session, body).await,
            ConversationState::AwaitingIdentityConfirmation { email } => {
                self.on_confirmation(session, body, &email).await
            }
            ConversationState::AwaitingDescription => {
                match body {
                    MessageBody::Text(text) => self.on_description(session, text).await,
                    MessageBody::Image { .. } => self.say(&phone, prompts::DESCRIBE_FIRST).await,
                    _ => self.say(&phone, prompts::DESCRIBE_ITEM).await,
                }
                Ok(Persist::Save)
            }
            ConversationState::AwaitingMissingField { field } => {
                self.on_missing_field(session, field, body).await;
                Ok(Persist::Save)
            }
            ConversationState::CollectingPhotos => {
                self.on_collecting(session, body, command).await
            }
            ConversationState::ErrorRetry { .. } => match (body, command) {
                (MessageBody::Image { .. }, _) => {
                    session.state = ConversationState::CollectingPhotos;
                    self.on_collecting(session, body, command).await
                }
                (_, Some(Command::Submit)) => self.on_submit(session).await,
                (MessageBody::Text(text), _) if text.trim().eq_ignore_ascii_case("retry") => {
                    self.on_submit(session).await
                }
                _ => {
                    self.say(&phone, prompts::retry_hint()).await;
                    Ok(Persist::Save)
                }
            },
        }
    }

    async fn on_identity(
        &self,
        session: &mut ConversationSession,
        body: &MessageBody,
    ) -> Result<Persist, EngineError> {
        let phone = session.phone.clone();
        let email = match body {
            MessageBody::Text(text) if looks_like_email(text) => text.trim().to_lowercase(),
            MessageBody::Text(_) => {
                self.say(&phone, prompts::INVALID_EMAIL).await;
                return Ok(Persist::Save);
            }
            _ => {
                self.say(&phone, prompts::ASK_EMAIL).await;
                return Ok(Persist::Save);
            }
        };

        match lookup_seller(self.services.sellers.as_ref(), &email, &phone).await? {
            SellerLookup::Refused => {
                self.say(&phone, prompts::IDENTITY_REFUSED).await;
            }
            SellerLookup::Verified(seller) => {
                self.bind(session, seller);
                self.say(&phone, prompts::DESCRIBE_ITEM).await;
            }
            SellerLookup::NotFound => {
                let (text, options) = prompts::confirm_account(&email);
                session.state = ConversationState::AwaitingIdentityConfirmation { email };
                self.choose(&phone, &text, &options).await;
            }
        }
        Ok(Persist::Save)
    }

    async fn on_confirmation(
        &self,
        session: &mut ConversationSession,
        body: &MessageBody,
        email: &str,
    ) -> Result<Persist, EngineError> {
        let phone = session.phone.clone();
        match affirmation(body) {
            Some(true) => {
                // The directory may have changed since the question was asked.
                let seller = match lookup_seller(self.services.sellers.as_ref(), email, &phone).await? {
                    SellerLookup::Refused => {
                        session.state = ConversationState::AwaitingIdentity;
                        self.say(&phone, prompts::IDENTITY_REFUSED).await;
                        return Ok(Persist::Save);
                    }
                    SellerLookup::Verified(seller) => seller,
                    SellerLookup::NotFound => {
                        let seller = self.services.sellers.create(email, &phone).await?;
                        info!(target = "closet.conversation", seller_id = %seller.id, "seller_account_created");
                        seller
                    }
                };
                self.bind(session, seller);
                self.say(&phone, prompts::DESCRIBE_ITEM).await;
                Ok(Persist::Save)
            }
            Some(false) => {
                self.say(&phone, prompts::DECLINED_ACCOUNT).await;
                Ok(Persist::Discard)
            }
            None => {
                let (text, options) = prompts::confirm_account(email);
                self.choose(&phone, &text, &options).await;
                Ok(Persist::Save)
            }
        }
    }

    fn bind(&self, session: &mut ConversationSession, seller: Seller) {
        session.identity = Some(SellerIdentity {
            seller_id: seller.id,
            email: seller.email,
        });
        session.state = ConversationState::AwaitingDescription;
    }

    async fn on_description(&self, session: &mut ConversationSession, text: &str) {
        let extracted = self.services.extractor.extract(text).await;
        let canonical = CANONICAL_VALUES.canonicalize(&extracted);
        session.draft = safe_merge(&session.draft, &canonical);
        self.say(&session.phone.clone(), &session.draft.summary()).await;
        self.advance(session).await;
    }

    async fn on_missing_field(
        &self,
        session: &mut ConversationSession,
        field: ListingField,
        body: &MessageBody,
    ) {
        let phone = session.phone.clone();
        let raw = match body {
            MessageBody::Choice { id, title } => match parse_option_id(id) {
                Some((chosen, value)) if chosen == field => value,
                _ => title.clone(),
            },
            MessageBody::Text(text) => text.clone(),
            MessageBody::Image { .. } => {
                self.say(&phone, prompts::DESCRIBE_FIRST).await;
                self.ask(&phone, field).await;
                return;
            }
            _ => {
                self.ask(&phone, field).await;
                return;
            }
        };

        let value = if CANONICAL_VALUES.has_closed_set(field) {
            let matched = CANONICAL_VALUES.match_to_dropdown(&raw, field);
            if matched.is_empty() { raw } else { matched }
        } else {
            raw
        };
        if let Err(err) = session.draft.set(field, &value) {
            debug!(target = "closet.conversation", field = %field, error = %err, "field_answer_rejected");
            if field == ListingField::AskingPrice {
                self.say(&phone, prompts::INVALID_PRICE).await;
            } else {
                self.ask(&phone, field).await;
            }
            return;
        }
        self.advance(session).await;
    }

    /// Asks for the next missing required field, or starts photo collection.
    async fn advance(&self, session: &mut ConversationSession) {
        let phone = session.phone.clone();
        match next_missing_field(&session.draft) {
            Some(field) => {
                session.state = ConversationState::AwaitingMissingField { field };
                self.ask(&phone, field).await;
            }
            None => {
                session.state = ConversationState::CollectingPhotos;
                self.prepare_draft(session).await;
                self.say(&phone, &prompts::request_photos(self.limits.min)).await;
            }
        }
    }

    /// Creates the catalog draft when photo collection starts. A failure is not
    /// fatal here; the submission saga retries it.
    async fn prepare_draft(&self, session: &mut ConversationSession) {
        if session.external_draft_id.is_some() {
            return;
        }
        match submission::ensure_draft(&self.services, session).await {
            Ok((draft_id, _)) => {
                session.touch();
                if let Err(err) = self.services.sessions.put(&session.phone, session).await {
                    warn!(target = "closet.conversation", draft_id = %draft_id, error = %err, "draft_checkpoint_failed");
                }
            }
            Err(err) => {
                warn!(target = "closet.conversation", error = %err, "draft_creation_deferred");
                self.say(&session.phone, prompts::DRAFT_DEFERRED).await;
            }
        }
    }

    async fn on_collecting(
        &self,
        session: &mut ConversationSession,
        body: &MessageBody,
        command: Option<Command>,
    ) -> Result<Persist, EngineError> {
        let phone = session.phone.clone();
        match (body, command) {
            (MessageBody::Image { media_id, .. }, _) => {
                match accept_photo(&self.services, session, media_id, self.limits).await {
                    PhotoIntake::Duplicate => {}
                    PhotoIntake::AtLimit => {
                        self.say(&phone, &prompts::photo_limit(self.limits.max)).await;
                    }
                    PhotoIntake::Added { count } => {
                        let notice = notice_for(count, session.last_notified_photo_count, self.limits.min);
                        session.last_notified_photo_count = count;
                        match notice {
                            Some(PhotoNotice::Progress { count }) => {
                                self.say(&phone, &prompts::photo_progress(count, self.limits.min)).await;
                            }
                            Some(PhotoNotice::Ready { count }) => {
                                let (text, options) = prompts::photos_ready(count);
                                self.choose(&phone, &text, &options).await;
                            }
                            None => {}
                        }
                    }
                }
                Ok(Persist::Save)
            }
            (_, Some(Command::Submit)) => self.on_submit(session).await,
            (_, Some(Command::AddMore)) => {
                self.say(&phone, prompts::ADD_MORE).await;
                Ok(Persist::Save)
            }
            _ => {
                let count = session.photos.len();
                if count >= self.limits.min {
                    let (text, options) = prompts::photos_ready(count);
                    self.choose(&phone, &text, &options).await;
                } else {
                    self.say(&phone, &prompts::photo_reminder(count, self.limits.min)).await;
                }
                Ok(Persist::Save)
            }
        }
    }

    async fn on_submit(&self, session: &mut ConversationSession) -> Result<Persist, EngineError> {
        let phone = session.phone.clone();
        let count = session.photos.len();
        if count < self.limits.min {
            self.say(&phone, &prompts::need_more_photos(count, self.limits.min)).await;
            return Ok(Persist::Save);
        }
        match submission::submit(&self.services, &phone, session, "chat").await {
            Ok(receipt) => {
                session.state = ConversationState::Submitted {
                    listing_id: receipt.listing_id.clone(),
                };
                self.say(&phone, &prompts::submitted(&receipt.listing_id)).await;
                Ok(Persist::Discard)
            }
            Err(err) => {
                warn!(
                    target = "closet.conversation",
                    phone = %mask_phone(&phone),
                    stage = err.stage(),
                    error = %err,
                    "submission_failed"
                );
                session.state = ConversationState::ErrorRetry {
                    failed_stage: err.stage().to_string(),
                    message: err.detail().to_string(),
                };
                self.say(&phone, &prompts::submission_failed(err.stage())).await;
                Ok(Persist::Save)
            }
        }
    }

    async fn ask(&self, phone: &str, field: ListingField) {
        match prompts::ask_field(field) {
            FieldQuestion::Text(text) => self.say(phone, &text).await,
            FieldQuestion::Choice(text, options) => self.choose(phone, &text, &options).await,
        }
    }

    async fn say(&self, phone: &str, text: &str) {
        if let Err(err) = self.services.messenger.send_text(phone, text).await {
            warn!(target = "closet.whatsapp", phone = %mask_phone(phone), error = %err, "send_text_failed");
        }
    }

    async fn choose(&self, phone: &str, text: &str, options: &[ChoiceOption]) {
        if let Err(err) = self.services.messenger.send_choice(phone, text, options).await {
            warn!(target = "closet.whatsapp", phone = %mask_phone(phone), error = %err, "send_choice_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::extractor::KeywordExtractor;
    use crate::listing::fields::DraftListing;
    use crate::session::{PhotoRecord, SessionStore};
    use crate::testing::TestHarness;
    use chrono::Duration as ChronoDuration;

    const PHONE: &str = "15550100000";

    fn engine(harness: &TestHarness) -> ConversationEngine {
        ConversationEngine::new(
            harness.services(),
            IdentityLocks::new(),
            PhotoLimits::default(),
            Duration::from_secs(3600),
        )
    }

    fn text(body: &str) -> InboundMessage {
        InboundMessage::text(PHONE, &format!("wamid.{body}"), body)
    }

    fn image(media_id: &str) -> InboundMessage {
        InboundMessage {
            body: MessageBody::Image {
                media_id: media_id.to_string(),
                caption: None,
            },
            ..InboundMessage::text(PHONE, media_id, "")
        }
    }

    fn tap(id: &str) -> InboundMessage {
        InboundMessage {
            body: MessageBody::Choice {
                id: id.to_string(),
                title: id.to_string(),
            },
            ..InboundMessage::text(PHONE, id, "")
        }
    }

    async fn state(harness: &TestHarness) -> Option<ConversationState> {
        harness
            .sessions
            .get(PHONE)
            .await
            .unwrap()
            .map(|session| session.state)
    }

    async fn seed(harness: &TestHarness, session: &ConversationSession) {
        harness.sessions.put(PHONE, session).await.unwrap();
    }

    fn verified_session(state: ConversationState) -> ConversationSession {
        let mut session = ConversationSession::new(PHONE);
        session.state = state;
        session.identity = Some(SellerIdentity {
            seller_id: "seller-1".into(),
            email: "a@b.co".into(),
        });
        session
    }

    fn complete_draft() -> DraftListing {
        let mut draft = DraftListing::default();
        for (field, value) in [
            (ListingField::Designer, "Elan"),
            (ListingField::ItemType, "Kurta"),
            (ListingField::Size, "M"),
            (ListingField::Condition, "Like New"),
            (ListingField::AskingPrice, "80"),
        ] {
            draft.set(field, value).unwrap();
        }
        draft
    }

    #[tokio::test]
    async fn onboarding_a_new_seller() {
        let harness = TestHarness::new();
        let engine = engine(&harness);

        engine.handle(text("SELL")).await;
        assert_eq!(harness.messenger.texts().await, vec![prompts::WELCOME]);
        assert_eq!(state(&harness).await, Some(ConversationState::AwaitingIdentity));

        engine.handle(text("notanemail")).await;
        assert_eq!(harness.messenger.last().await.unwrap().text, prompts::INVALID_EMAIL);
        assert_eq!(state(&harness).await, Some(ConversationState::AwaitingIdentity));

        engine.handle(text("new@example.com")).await;
        let prompt = harness.messenger.last().await.unwrap();
        let ids: Vec<_> = prompt.options.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec![prompts::CONFIRM_YES_ID, prompts::CONFIRM_NO_ID]);
        assert_eq!(
            state(&harness).await,
            Some(ConversationState::AwaitingIdentityConfirmation {
                email: "new@example.com".into()
            })
        );
        assert!(harness.sellers.find_by_email("new@example.com").await.unwrap().is_none());

        engine.handle(tap(prompts::CONFIRM_YES_ID)).await;
        assert_eq!(harness.messenger.last().await.unwrap().text, prompts::DESCRIBE_ITEM);
        assert_eq!(state(&harness).await, Some(ConversationState::AwaitingDescription));
        let seller = harness
            .sellers
            .find_by_email("new@example.com")
            .await
            .unwrap()
            .expect("account created");
        assert_eq!(seller.phone.as_deref(), Some(PHONE));
    }

    #[tokio::test]
    async fn declining_account_creation_clears_the_session() {
        let harness = TestHarness::new();
        let engine = engine(&harness);
        seed(
            &harness,
            &ConversationSession {
                state: ConversationState::AwaitingIdentityConfirmation {
                    email: "typo@example.com".into(),
                },
                ..ConversationSession::new(PHONE)
            },
        )
        .await;
        engine.handle(text("no")).await;
        assert_eq!(state(&harness).await, None);
        assert!(harness.sellers.find_by_email("typo@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn known_email_on_another_phone_is_refused() {
        let harness = TestHarness::new();
        harness.sellers.add("owner@example.com", Some("15550109999")).await;
        let engine = engine(&harness);
        seed(&harness, &ConversationSession {
            state: ConversationState::AwaitingIdentity,
            ..ConversationSession::new(PHONE)
        })
        .await;

        engine.handle(text("owner@example.com")).await;
        assert_eq!(harness.messenger.last().await.unwrap().text, prompts::IDENTITY_REFUSED);
        assert_eq!(state(&harness).await, Some(ConversationState::AwaitingIdentity));
        let stored = harness.sessions.get(PHONE).await.unwrap().unwrap();
        assert!(stored.identity.is_none());
    }

    #[tokio::test]
    async fn confirming_an_email_registered_meanwhile_from_another_phone_is_refused() {
        let harness = TestHarness::new();
        let engine = engine(&harness);
        seed(&harness, &ConversationSession {
            state: ConversationState::AwaitingIdentityConfirmation {
                email: "owner@example.com".into(),
            },
            ..ConversationSession::new(PHONE)
        })
        .await;
        harness.sellers.add("owner@example.com", Some("15550109999")).await;

        engine.handle(tap(prompts::CONFIRM_YES_ID)).await;
        assert_eq!(harness.messenger.last().await.unwrap().text, prompts::IDENTITY_REFUSED);
        let stored = harness.sessions.get(PHONE).await.unwrap().unwrap();
        assert!(stored.identity.is_none());
        assert_eq!(stored.state, ConversationState::AwaitingIdentity);
        let seller = harness.sellers.find_by_email("owner@example.com").await.unwrap().unwrap();
        assert_eq!(seller.phone.as_deref(), Some("15550109999"));
    }

    #[tokio::test]
    async fn confirming_an_email_registered_meanwhile_without_phone_binds_it() {
        let harness = TestHarness::new();
        let engine = engine(&harness);
        seed(&harness, &ConversationSession {
            state: ConversationState::AwaitingIdentityConfirmation {
                email: "owner@example.com".into(),
            },
            ..ConversationSession::new(PHONE)
        })
        .await;
        let existing = harness.sellers.add("owner@example.com", None).await;

        engine.handle(tap(prompts::CONFIRM_YES_ID)).await;
        let stored = harness.sessions.get(PHONE).await.unwrap().unwrap();
        assert_eq!(stored.state, ConversationState::AwaitingDescription);
        assert_eq!(stored.identity.unwrap().seller_id, existing.id);
    }

    #[tokio::test]
    async fn known_email_without_phone_binds_this_phone() {
        let harness = TestHarness::new();
        harness.sellers.add("owner@example.com", None).await;
        let engine = engine(&harness);
        seed(&harness, &ConversationSession {
            state: ConversationState::AwaitingIdentity,
            ..ConversationSession::new(PHONE)
        })
        .await;

        engine.handle(text("Owner@Example.com")).await;
        assert_eq!(state(&harness).await, Some(ConversationState::AwaitingDescription));
        let seller = harness.sellers.find_by_email("owner@example.com").await.unwrap().unwrap();
        assert_eq!(seller.phone.as_deref(), Some(PHONE));
    }

    #[tokio::test]
    async fn description_never_overwrites_known_fields() {
        let harness = TestHarness::new();
        let engine = engine(&harness);
        let mut session = verified_session(ConversationState::AwaitingDescription);
        session.draft.set(ListingField::Designer, "Elan").unwrap();
        seed(&harness, &session).await;

        let mut extracted = KeywordExtractor.extract_sync("kurta size M like new $80");
        extracted.designer = Some("Sabyasachi".into());
        harness
            .extractor
            .respond("kurta size M like new $80", extracted);

        engine.handle(text("kurta size M like new $80")).await;
        let stored = harness.sessions.get(PHONE).await.unwrap().unwrap();
        assert_eq!(stored.draft.designer.as_deref(), Some("Elan"));
        assert_eq!(stored.draft.size.as_deref(), Some("M"));
        assert_eq!(stored.draft.condition.as_deref(), Some("Like New"));
        assert_eq!(stored.draft.asking_price, Some(80.0));
        assert_eq!(stored.state, ConversationState::CollectingPhotos);
        assert_eq!(stored.external_draft_id.as_deref(), Some("draft-1"));
        assert_eq!(harness.catalog.drafts_created(), 1);
        assert!(harness.messenger.texts().await.iter().any(|t| t.contains("Designer: Elan")));
    }

    #[tokio::test]
    async fn missing_fields_are_asked_one_at_a_time() {
        let harness = TestHarness::new();
        let engine = engine(&harness);
        seed(&harness, &verified_session(ConversationState::AwaitingDescription)).await;
        let mut extracted = DraftListing::default();
        extracted.designer = Some("Elan".into());
        extracted.item_type = Some("kurti".into());
        harness.extractor.respond("Elan kurti", extracted);

        engine.handle(text("Elan kurti")).await;
        assert_eq!(
            state(&harness).await,
            Some(ConversationState::AwaitingMissingField { field: ListingField::Size })
        );
        assert!(harness.messenger.last().await.unwrap().text.contains("Free Size"));

        engine.handle(text("medium")).await;
        assert_eq!(
            state(&harness).await,
            Some(ConversationState::AwaitingMissingField { field: ListingField::Condition })
        );
        assert_eq!(harness.messenger.last().await.unwrap().options.len(), 3);

        engine.handle(tap("field:condition:Like New")).await;
        assert_eq!(
            state(&harness).await,
            Some(ConversationState::AwaitingMissingField { field: ListingField::AskingPrice })
        );

        engine.handle(text("whatever you think")).await;
        assert_eq!(harness.messenger.last().await.unwrap().text, prompts::INVALID_PRICE);
        assert_eq!(
            state(&harness).await,
            Some(ConversationState::AwaitingMissingField { field: ListingField::AskingPrice })
        );

        engine.handle(text("$1,200")).await;
        let stored = harness.sessions.get(PHONE).await.unwrap().unwrap();
        assert_eq!(stored.state, ConversationState::CollectingPhotos);
        assert_eq!(stored.draft.item_type.as_deref(), Some("Kurta"));
        assert_eq!(stored.draft.size.as_deref(), Some("M"));
        assert_eq!(stored.draft.condition.as_deref(), Some("Like New"));
        assert_eq!(stored.draft.asking_price, Some(1200.0));
    }

    #[tokio::test]
    async fn direct_answers_may_overwrite() {
        let harness = TestHarness::new();
        let engine = engine(&harness);
        let mut session = verified_session(ConversationState::AwaitingMissingField {
            field: ListingField::Designer,
        });
        session.draft = complete_draft();
        seed(&harness, &session).await;

        engine.handle(text("Anita Dongre")).await;
        let stored = harness.sessions.get(PHONE).await.unwrap().unwrap();
        assert_eq!(stored.draft.designer.as_deref(), Some("Anita Dongre"));
        assert_eq!(stored.state, ConversationState::CollectingPhotos);
    }

    #[tokio::test]
    async fn duplicate_photo_delivery_counts_once() {
        let harness = TestHarness::new();
        let engine = engine(&harness);
        let mut session = verified_session(ConversationState::CollectingPhotos);
        session.draft = complete_draft();
        session.set_external_draft_id("draft-9");
        seed(&harness, &session).await;

        for media_id in ["m1", "m2", "m2", "m3"] {
            engine.handle(image(media_id)).await;
        }
        let stored = harness.sessions.get(PHONE).await.unwrap().unwrap();
        assert_eq!(stored.photos.len(), 3);
        assert!(stored.photos.iter().all(|p| p.uploaded));

        let texts = harness.messenger.texts().await;
        assert_eq!(
            texts,
            vec![
                prompts::photo_progress(1, 3),
                prompts::photo_progress(2, 3),
                prompts::photos_ready(3).0,
            ]
        );
        assert_eq!(
            texts.iter().filter(|t| t.starts_with("Got 3 photos, ready to submit")).count(),
            1
        );

        engine.handle(image("m4")).await;
        assert_eq!(harness.messenger.texts().await.len(), 3);
    }

    #[tokio::test]
    async fn early_photos_are_deferred() {
        let harness = TestHarness::new();
        let engine = engine(&harness);
        seed(&harness, &verified_session(ConversationState::AwaitingDescription)).await;
        engine.handle(image("m1")).await;
        assert_eq!(harness.messenger.last().await.unwrap().text, prompts::DESCRIBE_FIRST);
        let stored = harness.sessions.get(PHONE).await.unwrap().unwrap();
        assert!(stored.photos.is_empty());
    }

    #[tokio::test]
    async fn submit_below_minimum_is_rejected() {
        let harness = TestHarness::new();
        let engine = engine(&harness);
        let mut session = verified_session(ConversationState::CollectingPhotos);
        session.draft = complete_draft();
        session.append_photo(PhotoRecord::pending("m1"));
        session.append_photo(PhotoRecord::pending("m2"));
        seed(&harness, &session).await;

        engine.handle(text("SUBMIT")).await;
        assert_eq!(
            harness.messenger.last().await.unwrap().text,
            prompts::need_more_photos(2, 3)
        );
        assert_eq!(state(&harness).await, Some(ConversationState::CollectingPhotos));
        assert_eq!(harness.catalog.drafts_created(), 0);
        assert!(harness.listings.rows().await.is_empty());
    }

    #[tokio::test]
    async fn failed_submission_resumes_with_the_same_draft() {
        let harness = TestHarness::new();
        let engine = engine(&harness);
        let mut session = verified_session(ConversationState::CollectingPhotos);
        session.draft = complete_draft();
        for id in ["m1", "m2", "m3"] {
            session.append_photo(PhotoRecord::pending(id));
        }
        seed(&harness, &session).await;

        harness.catalog.fail_attach(true);
        engine.handle(tap(prompts::SUBMIT_ID)).await;
        let stored = harness.sessions.get(PHONE).await.unwrap().unwrap();
        assert!(matches!(
            stored.state,
            ConversationState::ErrorRetry { ref failed_stage, .. } if failed_stage == "upload_photos"
        ));
        assert_eq!(stored.external_draft_id.as_deref(), Some("draft-1"));

        engine.handle(text("hello?")).await;
        assert_eq!(harness.messenger.last().await.unwrap().text, prompts::retry_hint());

        harness.catalog.fail_attach(false);
        engine.handle(text("submit")).await;
        assert_eq!(state(&harness).await, None);
        assert_eq!(harness.catalog.drafts_created(), 1);
        let rows = harness.listings.rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].external_draft_id, "draft-1");
        assert_eq!(rows[0].source, "chat");
        assert_eq!(
            harness.messenger.last().await.unwrap().text,
            prompts::submitted("listing-1")
        );
    }

    #[tokio::test]
    async fn draft_failure_on_photo_entry_is_retried_at_submission() {
        let harness = TestHarness::new();
        let engine = engine(&harness);
        let mut session = verified_session(ConversationState::AwaitingMissingField {
            field: ListingField::AskingPrice,
        });
        session.draft = complete_draft();
        session.draft.asking_price = None;
        seed(&harness, &session).await;

        harness.catalog.fail_create(true);
        engine.handle(text("80")).await;
        let stored = harness.sessions.get(PHONE).await.unwrap().unwrap();
        assert_eq!(stored.state, ConversationState::CollectingPhotos);
        assert!(stored.external_draft_id.is_none());
        assert!(harness.messenger.texts().await.contains(&prompts::DRAFT_DEFERRED.to_string()));

        harness.catalog.fail_create(false);
        for id in ["m1", "m2", "m3"] {
            engine.handle(image(id)).await;
        }
        engine.handle(text("submit")).await;
        assert_eq!(state(&harness).await, None);
        assert_eq!(harness.catalog.drafts_created(), 1);
        assert_eq!(harness.catalog.attached().await.len(), 3);
    }

    #[tokio::test]
    async fn start_over_wins_in_any_state() {
        let harness = TestHarness::new();
        let engine = engine(&harness);
        let mut session = verified_session(ConversationState::CollectingPhotos);
        session.draft = complete_draft();
        session.append_photo(PhotoRecord::pending("m1"));
        seed(&harness, &session).await;

        engine.handle(text("Start over")).await;
        let stored = harness.sessions.get(PHONE).await.unwrap().unwrap();
        assert_eq!(stored.state, ConversationState::AwaitingIdentity);
        assert!(stored.photos.is_empty());
        assert!(stored.draft.is_empty());
        assert!(stored.identity.is_none());
        assert_eq!(harness.messenger.last().await.unwrap().text, prompts::START_OVER);
    }

    #[tokio::test]
    async fn cancel_discards_the_session() {
        let harness = TestHarness::new();
        let engine = engine(&harness);
        seed(&harness, &verified_session(ConversationState::AwaitingDescription)).await;
        engine.handle(text("cancel")).await;
        assert_eq!(state(&harness).await, None);
        assert_eq!(harness.messenger.last().await.unwrap().text, prompts::CANCELLED);
    }

    #[tokio::test]
    async fn voice_notes_are_handled_as_text() {
        let harness = TestHarness::new();
        let engine = engine(&harness);
        seed(&harness, &ConversationSession {
            state: ConversationState::AwaitingIdentity,
            ..ConversationSession::new(PHONE)
        })
        .await;
        harness.transcriber.say("voice-1", "new@example.com");

        let voice = |id: &str| InboundMessage {
            body: MessageBody::Voice { media_id: id.to_string() },
            ..InboundMessage::text(PHONE, id, "")
        };
        engine.handle(voice("voice-unknown")).await;
        assert_eq!(harness.messenger.last().await.unwrap().text, prompts::VOICE_FAILED);
        assert_eq!(state(&harness).await, Some(ConversationState::AwaitingIdentity));

        engine.handle(voice("voice-1")).await;
        assert!(matches!(
            state(&harness).await,
            Some(ConversationState::AwaitingIdentityConfirmation { .. })
        ));
    }

    #[tokio::test]
    async fn expired_sessions_restart_from_welcome() {
        let harness = TestHarness::new();
        let engine = engine(&harness);
        let mut session = verified_session(ConversationState::CollectingPhotos);
        session.updated_at = Utc::now() - ChronoDuration::hours(2);
        seed(&harness, &session).await;

        engine.handle(text("hi")).await;
        assert_eq!(harness.messenger.last().await.unwrap().text, prompts::WELCOME);
        let stored = harness.sessions.get(PHONE).await.unwrap().unwrap();
        assert_eq!(stored.state, ConversationState::AwaitingIdentity);
        assert!(stored.identity.is_none());
    }
}
