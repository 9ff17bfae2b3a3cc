use super::crypto::{EncryptedEnvelope, FlowCipher, FlowCryptoError, encrypt_response};
use crate::config::PhotoLimits;
use crate::conversation::commands::looks_like_email;
use crate::conversation::prompts::IDENTITY_REFUSED;
use crate::conversation::submission;
use crate::conversation::{SellerLookup, lookup_seller};
use crate::listing::fields::{DraftListing, ListingField};
use crate::listing::matcher::CANONICAL_VALUES;
use crate::ports::{Seller, Services, mask_phone, normalize_phone};
use crate::session::{ConversationSession, IdentityLocks, PhotoRecord, SellerIdentity};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

pub const SCREEN_DETAILS: &str = "DETAILS";
pub const SCREEN_EXTRAS: &str = "EXTRAS";
pub const SCREEN_PHOTOS: &str = "PHOTOS";
pub const SCREEN_SUCCESS: &str = "SUCCESS";

const DETAILS_FIELDS: [ListingField; 5] = ListingField::REQUIRED;
const EXTRAS_FIELDS: [ListingField; 3] = [
    ListingField::Color,
    ListingField::Material,
    ListingField::Details,
];

/// Decrypted request body.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowRequest {
    #[serde(default)]
    pub version: Option<String>,
    pub action: String,
    #[serde(default)]
    pub screen: Option<String>,
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
    #[serde(default)]
    pub flow_token: Option<String>,
}

/// What the HTTP layer sends back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowReply {
    /// Base64 response body.
    Encrypted(String),
    BadRequest,
    /// Key unwrap or tag check failed; the client should refresh its key.
    DecryptFailed,
    NotConfigured,
}

#[derive(Clone)]
pub struct FlowEndpoint {
    cipher: Option<FlowCipher>,
    services: Services,
    locks: IdentityLocks,
    limits: PhotoLimits,
}

impl FlowEndpoint {
    pub fn new(
        cipher: Option<FlowCipher>,
        services: Services,
        locks: IdentityLocks,
        limits: PhotoLimits,
    ) -> Self {
        Self {
            cipher,
            services,
            locks,
            limits,
        }
    }

    pub async fn handle(&self, body: &[u8]) -> FlowReply {
        let Some(cipher) = &self.cipher else {
            return FlowReply::NotConfigured;
        };
        let Ok(envelope) = serde_json::from_slice::<EncryptedEnvelope>(body) else {
            return FlowReply::BadRequest;
        };
        let (plaintext, key) = match cipher.decrypt_request(&envelope) {
            Ok(opened) => opened,
            Err(FlowCryptoError::Malformed) => return FlowReply::BadRequest,
            Err(err) => {
                debug!(target = "closet.flows", error = %err, "flow_decrypt_failed");
                return FlowReply::DecryptFailed;
            }
        };
        let Ok(request) = serde_json::from_slice::<FlowRequest>(&plaintext) else {
            warn!(target = "closet.flows", "flow_plaintext_not_json");
            return FlowReply::BadRequest;
        };

        debug!(
            target = "closet.flows",
            version = ?request.version,
            action = %request.action,
            screen = ?request.screen,
            "flow_request"
        );
        let response = self.dispatch(&request).await;
        let failed = response
            .get("data")
            .is_some_and(|data| data.get("error_message").is_some());
        crate::metrics::flow_action(&request.action, !failed);
        let Ok(encoded) = serde_json::to_vec(&response) else {
            return FlowReply::BadRequest;
        };
        match encrypt_response(&key, &encoded) {
            Ok(body) => FlowReply::Encrypted(body),
            Err(err) => {
                warn!(target = "closet.flows", error = %err, "flow_encrypt_failed");
                FlowReply::DecryptFailed
            }
        }
    }

    pub async fn dispatch(&self, request: &FlowRequest) -> Value {
        let empty = Map::new();
        let data = request.data.as_ref().unwrap_or(&empty);

        if request.action.eq_ignore_ascii_case("ping") {
            return json!({ "data": { "status": "active" } });
        }
        if data.contains_key("error") {
            warn!(
                target = "closet.flows",
                screen = ?request.screen,
                error = ?data.get("error"),
                "flow_client_error_reported"
            );
            return json!({ "data": { "acknowledged": true } });
        }

        match request.action.as_str() {
            "INIT" => self.init(request.flow_token.as_deref()).await,
            "BACK" => {
                let screen = request.screen.as_deref().unwrap_or(SCREEN_DETAILS);
                render(screen, data, None)
            }
            "data_exchange" => self.exchange(request, data).await,
            other => {
                debug!(target = "closet.flows", action = other, "flow_unknown_action");
                render(SCREEN_DETAILS, data, Some("Something went wrong. Please try again."))
            }
        }
    }

    async fn init(&self, flow_token: Option<&str>) -> Value {
        let mut prefill = Map::new();
        if let Some(phone) = flow_token.and_then(phone_from_token) {
            match self.services.sessions.get(&phone).await {
                Ok(Some(session)) => {
                    for field in ListingField::ALL {
                        if let Some(value) = session.draft.get(field) {
                            prefill.insert(field.key().to_string(), Value::String(value));
                        }
                    }
                    if let Some(identity) = session.identity {
                        prefill.insert("email".into(), Value::String(identity.email));
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(target = "closet.flows", phone = %mask_phone(&phone), error = %err, "flow_prefill_unavailable");
                }
            }
        }
        render(SCREEN_DETAILS, &prefill, None)
    }

    async fn exchange(&self, request: &FlowRequest, data: &Map<String, Value>) -> Value {
        match request.screen.as_deref().unwrap_or(SCREEN_DETAILS) {
            SCREEN_DETAILS => {
                let mut missing: Vec<&str> = DETAILS_FIELDS
                    .iter()
                    .filter(|field| text_value(data, field.key()).is_none())
                    .map(|field| field.label())
                    .collect();
                if !text_value(data, "email").is_some_and(|e| looks_like_email(&e)) {
                    missing.push("Email");
                }
                if !missing.is_empty() {
                    let message = format!("Please fill in: {}", missing.join(", "));
                    return render(SCREEN_DETAILS, data, Some(&message));
                }
                if let Err(err) = form_draft(data) {
                    return render(SCREEN_DETAILS, data, Some(&err));
                }
                render(SCREEN_EXTRAS, data, None)
            }
            SCREEN_EXTRAS => render(SCREEN_PHOTOS, data, None),
            SCREEN_PHOTOS => self.submit(request.flow_token.as_deref(), data).await,
            other => {
                debug!(target = "closet.flows", screen = other, "flow_unknown_screen");
                render(SCREEN_DETAILS, data, None)
            }
        }
    }

    async fn submit(&self, flow_token: Option<&str>, data: &Map<String, Value>) -> Value {
        let media_ids = photo_ids(data);
        if media_ids.len() < self.limits.min {
            let message = format!("Please add at least {} photos.", self.limits.min);
            return render(SCREEN_PHOTOS, data, Some(&message));
        }
        let (Some(token), Some(phone)) = (flow_token, flow_token.and_then(phone_from_token)) else {
            return render(SCREEN_PHOTOS, data, Some("This form has expired. Please start again from the chat."));
        };
        let draft = match form_draft(data) {
            Ok(draft) => draft,
            Err(message) => return render(SCREEN_DETAILS, data, Some(&message)),
        };
        let email = text_value(data, "email").unwrap_or_default();

        // Same lock as the chat turn for this phone, held through the saga.
        let _guard = self.locks.acquire(&phone).await;
        let key = format!("flow:{token}");
        let mut session = match self.services.sessions.get(&key).await {
            Ok(Some(session)) => session,
            Ok(None) => ConversationSession::new(phone.as_str()),
            Err(err) => {
                warn!(target = "closet.flows", error = %err, "flow_checkpoint_unavailable");
                return render(SCREEN_PHOTOS, data, Some(RETRY_MESSAGE));
            }
        };
        if let Some(listing_id) = &session.listing_id {
            debug!(target = "closet.flows", phone = %mask_phone(&phone), "flow_submission_replayed");
            return success(token, listing_id);
        }

        let seller = match self.resolve_seller(&email, &phone).await {
            Ok(Some(seller)) => seller,
            Ok(None) => return render(SCREEN_PHOTOS, data, Some(IDENTITY_REFUSED)),
            Err(message) => return render(SCREEN_PHOTOS, data, Some(&message)),
        };
        session.identity = Some(SellerIdentity {
            seller_id: seller.id,
            email: seller.email,
        });
        session.draft = draft;
        let wanted: Vec<&String> = media_ids.iter().take(self.limits.max).collect();
        session
            .photos
            .retain(|photo| wanted.iter().any(|id| **id == photo.remote_media_id));
        for media_id in wanted {
            session.append_photo(PhotoRecord::pending(media_id.as_str()));
        }

        // The checkpoint keeps the listing id so a redelivery answers from it.
        match submission::submit(&self.services, &key, &mut session, "flow").await {
            Ok(receipt) => {
                info!(
                    target = "closet.flows",
                    phone = %mask_phone(&phone),
                    listing_id = %receipt.listing_id,
                    "flow_listing_submitted"
                );
                success(token, &receipt.listing_id)
            }
            Err(err) => {
                warn!(target = "closet.flows", stage = err.stage(), error = %err, "flow_submission_failed");
                render(SCREEN_PHOTOS, data, Some(RETRY_MESSAGE))
            }
        }
    }

    /// `Ok(None)` is the anti-hijack refusal.
    async fn resolve_seller(&self, email: &str, phone: &str) -> Result<Option<Seller>, String> {
        let lookup = lookup_seller(self.services.sellers.as_ref(), email, phone)
            .await
            .map_err(|err| {
                warn!(target = "closet.flows", error = %err, "flow_directory_unavailable");
                RETRY_MESSAGE.to_string()
            })?;
        match lookup {
            SellerLookup::Verified(seller) => Ok(Some(seller)),
            SellerLookup::Refused => Ok(None),
            SellerLookup::NotFound => self
                .services
                .sellers
                .create(email, phone)
                .await
                .map(Some)
                .map_err(|err| {
                    warn!(target = "closet.flows", error = %err, "flow_seller_create_failed");
                    RETRY_MESSAGE.to_string()
                }),
        }
    }
}

fn success(token: &str, listing_id: &str) -> Value {
    json!({
        "screen": SCREEN_SUCCESS,
        "data": {
            "extension_message_response": {
                "params": {
                    "flow_token": token,
                    "listing_id": listing_id,
                }
            }
        }
    })
}

const RETRY_MESSAGE: &str = "We couldn't submit your listing just now. Please try again.";

/// `<phone>` or `<phone>:<nonce>`.
pub fn phone_from_token(token: &str) -> Option<String> {
    let phone = normalize_phone(token.split(':').next().unwrap_or_default());
    (!phone.is_empty()).then_some(phone)
}

fn text_value(data: &Map<String, Value>, key: &str) -> Option<String> {
    match data.get(key)? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Form values are direct answers, so closed-set fields keep the raw text
/// when nothing matches.
fn form_draft(data: &Map<String, Value>) -> Result<DraftListing, String> {
    let mut draft = DraftListing::default();
    for field in DETAILS_FIELDS.iter().chain(EXTRAS_FIELDS.iter()) {
        let Some(raw) = text_value(data, field.key()) else {
            continue;
        };
        let matched = CANONICAL_VALUES.match_to_dropdown(&raw, *field);
        let value = if matched.is_empty() { raw } else { matched };
        draft
            .set(*field, &value)
            .map_err(|_| format!("{} looks invalid. Please check it.", field.label()))?;
    }
    Ok(draft)
}

/// Photo picker results arrive as ids or as objects carrying an id.
fn photo_ids(data: &Map<String, Value>) -> Vec<String> {
    let Some(Value::Array(items)) = data.get("photos") else {
        return Vec::new();
    };
    let mut ids: Vec<String> = Vec::new();
    for item in items {
        let id = match item {
            Value::String(s) => Some(s.clone()),
            Value::Object(obj) => obj
                .get("media_id")
                .or_else(|| obj.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        };
        if let Some(id) = id.filter(|id| !id.is_empty())
            && !ids.contains(&id)
        {
            ids.push(id);
        }
    }
    ids
}

fn options(field: ListingField) -> Value {
    Value::Array(
        CANONICAL_VALUES
            .options(field)
            .iter()
            .map(|o| json!({ "id": o.value, "title": o.value }))
            .collect(),
    )
}

/// Screen payload carrying every known value forward so the client echoes it
/// back on the next exchange.
fn render(screen: &str, carried: &Map<String, Value>, error: Option<&str>) -> Value {
    let mut data = Map::new();
    for field in ListingField::ALL {
        if let Some(value) = text_value(carried, field.key()) {
            data.insert(field.key().to_string(), Value::String(value));
        }
    }
    if let Some(email) = text_value(carried, "email") {
        data.insert("email".into(), Value::String(email));
    }
    match screen {
        SCREEN_DETAILS => {
            data.insert("item_type_options".into(), options(ListingField::ItemType));
            data.insert("size_options".into(), options(ListingField::Size));
            data.insert("condition_options".into(), options(ListingField::Condition));
        }
        SCREEN_EXTRAS => {
            data.insert("color_options".into(), options(ListingField::Color));
            data.insert("material_options".into(), options(ListingField::Material));
        }
        _ => {}
    }
    if let Some(message) = error {
        data.insert("error_message".into(), Value::String(message.to_string()));
    }
    json!({ "screen": screen, "data": data })
}
