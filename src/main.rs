mod catalog;
mod config;
mod conversation;
mod flows;
mod http;
mod idempotency;
mod jobs;
mod listing;
mod llm;
mod metrics;
mod models;
mod ports;
mod security;
mod session;
mod supabase;
#[cfg(test)]
mod testing;
mod voice;
mod whatsapp;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use config::Settings;
use conversation::ConversationEngine;
use eyre::WrapErr;
use flows::{FlowCipher, FlowEndpoint, FlowReply};
use idempotency::MessageDeduper;
use jobs::InboundQueue;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use ports::{Services, mask_phone};
use security::WebhookAuth;
use serde::Deserialize;
use serde_json::json;
use session::{IdentityLocks, MemorySessionStore, RedisSessionStore};
use std::{net::SocketAddr, sync::Arc};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "closet.api", "server crashed: {err:?}");
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let settings = Settings::from_env();
    let redis = match &settings.redis_url {
        Some(url) => Some(redis::Client::open(url.as_str()).wrap_err("invalid REDIS_URL")?),
        None => None,
    };

    let services = build_services(&settings, redis.clone());
    let locks = IdentityLocks::new();
    let engine = ConversationEngine::new(
        services.clone(),
        locks.clone(),
        settings.photos,
        settings.session_ttl,
    );
    let (queue, _worker) = InboundQueue::spawn(engine);

    let cipher = match settings.flow_private_key_pem.as_deref().map(FlowCipher::from_pem) {
        Some(Ok(cipher)) => Some(cipher),
        Some(Err(err)) => {
            error!(target = "closet.flows", error = %err, "flow_private_key_rejected");
            None
        }
        None => {
            warn!(target = "closet.flows", "no flow private key configured; /flows answers 503");
            None
        }
    };
    let flows = FlowEndpoint::new(cipher, services, locks, settings.photos);

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| eyre::eyre!("prometheus recorder: {err}"))?;

    let state = AppState {
        queue,
        deduper: MessageDeduper::new(redis, settings.dedupe_ttl),
        auth: Arc::new(WebhookAuth {
            app_secret: settings.whatsapp.app_secret.clone(),
            verify_token: settings.whatsapp.verify_token.clone(),
        }),
        flows,
        prometheus_handle,
        metrics_key: settings.metrics_key.clone(),
        phone_number_id: settings.whatsapp.phone_number_id.clone(),
    };
    if state.auth.app_secret.is_none() {
        warn!(target = "closet.api", "WHATSAPP_APP_SECRET unset; webhook signatures are not checked");
    }

    let app = with_layers(router(state), &settings);

    let addr: SocketAddr = ([0, 0, 0, 0], settings.port).into();
    info!(target = "closet.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("bind {addr}"))?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

/// Wires each port to its remote adapter, or to the in-process fallback when
/// that collaborator is not configured.
fn build_services(settings: &Settings, redis: Option<redis::Client>) -> Services {
    let sessions: Arc<dyn session::SessionStore> = match redis {
        Some(client) => Arc::new(RedisSessionStore::new(client, settings.session_ttl)),
        None => {
            warn!(target = "closet.api", "REDIS_URL unset; sessions are kept in memory");
            Arc::new(MemorySessionStore::new())
        }
    };

    let (sellers, listings): (Arc<dyn ports::SellerDirectory>, Arc<dyn ports::ListingStore>) =
        match supabase::SupabaseClient::from_env() {
            Some(client) => {
                let client = Arc::new(client);
                let sellers: Arc<dyn ports::SellerDirectory> = client.clone();
                let listings: Arc<dyn ports::ListingStore> = client;
                (sellers, listings)
            }
            None => {
                warn!(target = "closet.supabase", "Supabase not configured; sellers and listings are kept in memory");
                let sellers: Arc<dyn ports::SellerDirectory> =
                    Arc::new(supabase::MemorySellerDirectory::new());
                let listings: Arc<dyn ports::ListingStore> =
                    Arc::new(supabase::MemoryListingStore::new());
                (sellers, listings)
            }
        };

    let catalog: Arc<dyn ports::CatalogApi> = match catalog::CatalogClient::from_env() {
        Some(client) => Arc::new(client),
        None => {
            warn!(target = "closet.catalog", "catalog API not configured; issuing offline draft ids");
            Arc::new(catalog::OfflineCatalog)
        }
    };

    let wa = &settings.whatsapp;
    let messenger: Arc<dyn ports::Messenger> = match (&wa.token, &wa.phone_number_id) {
        (Some(token), Some(phone_number_id)) => Arc::new(whatsapp::CloudApiMessenger::new(
            &wa.graph_api_base,
            phone_number_id,
            token,
        )),
        _ => {
            warn!(target = "closet.whatsapp", "Cloud API not configured; outbound messages are only logged");
            Arc::new(whatsapp::LogMessenger)
        }
    };
    let media: Arc<dyn ports::MediaTranscoder> = match &wa.token {
        Some(token) => Arc::new(whatsapp::GraphMediaClient::new(&wa.graph_api_base, token)),
        None => Arc::new(whatsapp::UnconfiguredMedia),
    };

    let transcriber = voice::WhisperTranscriber::new(voice::WhisperConfig::from_env());
    if !transcriber.is_configured() {
        warn!(target = "closet.api", "speech-to-text not configured; voice notes will be re-prompted");
    }
    let llm = Arc::new(llm::LlmClient::new(llm::LlmConfig::from_env()));
    if !llm.is_configured() {
        warn!(target = "closet.llm", "LLM gateway not configured; using keyword extraction");
    }

    Services {
        sessions,
        sellers,
        catalog,
        listings,
        messenger,
        media,
        transcriber: Arc::new(transcriber),
        extractor: Arc::new(listing::extractor::LlmFieldExtractor::new(llm)),
    }
}

#[derive(Clone)]
struct AppState {
    queue: InboundQueue,
    deduper: MessageDeduper,
    auth: Arc<WebhookAuth>,
    flows: FlowEndpoint,
    prometheus_handle: PrometheusHandle,
    metrics_key: Option<String>,
    phone_number_id: Option<String>,
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/webhook", get(webhook_subscribe).post(webhook_receive))
        .route("/flows", axum::routing::post(flows_endpoint))
        .with_state(state)
}

fn with_layers(router: Router, settings: &Settings) -> Router {
    router
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            settings.request_timeout,
        ))
        .layer(DefaultBodyLimit::max(settings.request_max_bytes))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "closet-sell-api",
    }))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.metrics_key {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct SubscriptionQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

/// Provider subscription handshake.
///
/// - Method: `GET`
/// - Path: `/webhook`
/// - Query: `hub.mode`, `hub.verify_token`, `hub.challenge`
/// - Response: the challenge as plain text, or 403.
async fn webhook_subscribe(
    State(state): State<AppState>,
    Query(query): Query<SubscriptionQuery>,
) -> Response {
    crate::metrics::inc_requests("/webhook:get");
    match state.auth.subscription_challenge(
        query.mode.as_deref(),
        query.verify_token.as_deref(),
        query.challenge.as_deref(),
    ) {
        Some(challenge) => (StatusCode::OK, challenge.to_string()).into_response(),
        None => {
            warn!(target = "closet.api", "webhook_subscription_rejected");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

/// Inbound chat events.
///
/// - Method: `POST`
/// - Path: `/webhook`
/// - Auth: `X-Hub-Signature-256` over the raw body
/// - Response: 200 once every new message is queued; handling happens on the
///   sender's lane.
async fn webhook_receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    crate::metrics::inc_requests("/webhook");
    let signature = headers
        .get("X-Hub-Signature-256")
        .and_then(|v| v.to_str().ok());
    if !state.auth.accepts(signature, &body) {
        warn!(target = "closet.api", "webhook_signature_rejected");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let payload: whatsapp::WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(target = "closet.api", error = %err, "webhook_payload_invalid");
            return (
                StatusCode::BAD_REQUEST,
                Json(models::ApiError {
                    error: "invalid_payload".into(),
                    detail: Some(err.to_string()),
                }),
            )
                .into_response();
        }
    };

    for message in whatsapp::inbound_messages(&payload, state.phone_number_id.as_deref()) {
        if !state.deduper.first_delivery(&message.message_id).await {
            debug!(target = "closet.api", message_id = %message.message_id, "duplicate_delivery_dropped");
            continue;
        }
        let phone = mask_phone(&message.from);
        let message_id = message.message_id.clone();
        if let Err(err) = state.queue.enqueue(message).await {
            error!(target = "closet.api", phone = %phone, error = %err.error, "inbound_enqueue_failed");
            // Let the provider's redelivery through.
            state.deduper.release(&message_id).await;
            return (StatusCode::SERVICE_UNAVAILABLE, Json(err)).into_response();
        }
    }
    StatusCode::OK.into_response()
}

/// Encrypted structured-form endpoint.
///
/// - Method: `POST`
/// - Path: `/flows`
/// - Body: `{encrypted_flow_data, encrypted_aes_key, initial_vector}`
/// - Response: base64 ciphertext as `text/plain`; 421 asks the client to
///   refresh its key.
async fn flows_endpoint(State(state): State<AppState>, body: Bytes) -> Response {
    crate::metrics::inc_requests("/flows");
    match state.flows.handle(&body).await {
        FlowReply::Encrypted(payload) => {
            ([(header::CONTENT_TYPE, "text/plain")], payload).into_response()
        }
        FlowReply::BadRequest => StatusCode::BAD_REQUEST.into_response(),
        FlowReply::DecryptFailed => StatusCode::MISDIRECTED_REQUEST.into_response(),
        FlowReply::NotConfigured => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
