//! HTTP + WebSocket surface: carrier webhooks, relay sockets and the
//! campaign API.

use std::sync::Arc;

use axum::{
    Form, Json, Router,
    extract::{
        Path, Query, State,
        ws::WebSocketUpgrade,
    },
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::NurtureError;
use crate::leads::model::Tenant;
use crate::nurture::{NurtureEngine, Prospect};
use crate::prompts;
use crate::session::{SessionController, SessionMode, serve_relay};
use crate::sms::SmsResponder;
use crate::store::Database;
use crate::transport::RelayDocument;
use crate::transport::twiml;

/// Where inbound calls are connected and how the relay should listen.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Relay WebSocket endpoint for inbound calls (`wss://…/ws`).
    pub url: String,
    pub language: String,
    pub hints: Vec<String>,
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub sessions: Arc<SessionController>,
    pub sms: Arc<SmsResponder>,
    pub nurture: Arc<NurtureEngine>,
    pub default_tenant: Tenant,
    pub relay: RelaySettings,
}

/// Build the Axum router.
pub fn app_routes(state: AppState) -> Router {
    let campaign = Router::new()
        .route("/outbound/prospects", get(list_prospects).post(register_prospect))
        .route("/outbound/prospects/{phone}/send", post(send_initial))
        .route("/outbound/prospects/{phone}/paid", post(mark_paid))
        .route("/outbound/prospects/{phone}/events", get(prospect_events))
        .route("/outbound/batch", post(send_batch))
        .route("/outbound/followups", post(process_followups))
        .route("/outbound/retry-no-answers", post(retry_no_answers))
        .layer(CorsLayer::permissive());

    Router::new()
        .route("/health", get(health))
        .route("/sms", post(sms_webhook))
        .route("/voice", post(voice_webhook))
        .route("/call-status", post(call_status_webhook))
        .route("/ws", get(relay_ws))
        .route("/demo-ws", get(demo_relay_ws))
        .merge(campaign)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "tradie-desk"
    }))
}

// ── Carrier webhooks ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SmsWebhook {
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VoiceWebhook {
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallStatusWebhook {
    #[serde(default)]
    to: String,
    #[serde(default)]
    call_status: String,
}

fn xml(body: String) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/xml")], body)
}

async fn sms_webhook(State(state): State<AppState>, Form(hook): Form<SmsWebhook>) -> impl IntoResponse {
    let reply = state.sms.handle(&hook.from, &hook.to, &hook.body).await;
    xml(twiml::message_reply(&reply))
}

async fn voice_webhook(
    State(state): State<AppState>,
    Form(hook): Form<VoiceWebhook>,
) -> impl IntoResponse {
    let tenant = match state.db.get_tenant_by_address(&hook.to).await {
        Ok(Some(tenant)) => tenant,
        Ok(None) => state.default_tenant.clone(),
        Err(e) => {
            warn!(error = %e, "Tenant lookup failed; using default tenant");
            state.default_tenant.clone()
        }
    };
    info!(from = %hook.from, tenant = %tenant.id, "Inbound call");

    let document = RelayDocument::new(state.relay.url.clone(), prompts::voice_welcome_greeting(&tenant))
        .with_language(state.relay.language.clone())
        .with_hints(state.relay.hints.clone());
    xml(document.render())
}

async fn call_status_webhook(
    State(state): State<AppState>,
    Form(hook): Form<CallStatusWebhook>,
) -> impl IntoResponse {
    match state.nurture.handle_call_status(&hook.to, &hook.call_status).await {
        Ok(_) | Err(NurtureError::NotFound { .. }) => {}
        Err(e) => warn!(to = %hook.to, status = %hook.call_status, error = %e, "Call status not applied"),
    }
    StatusCode::NO_CONTENT
}

// ── Relay sockets ───────────────────────────────────────────────────────

async fn relay_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| serve_relay(socket, state.sessions, SessionMode::Inbound))
}

async fn demo_relay_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| serve_relay(socket, state.sessions, SessionMode::Demo))
}

// ── Campaign API ────────────────────────────────────────────────────────

fn error_response(e: NurtureError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &e {
        NurtureError::NotFound { .. } => StatusCode::NOT_FOUND,
        NurtureError::InvalidTransition { .. } | NurtureError::Conflict { .. } => {
            StatusCode::CONFLICT
        }
        NurtureError::Transport(_) => StatusCode::BAD_GATEWAY,
        NurtureError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() })))
}

#[derive(Debug, Deserialize)]
struct RegisterProspect {
    phone: String,
    business_name: String,
    #[serde(default)]
    owner_name: Option<String>,
    #[serde(default)]
    city: Option<String>,
}

async fn register_prospect(
    State(state): State<AppState>,
    Json(body): Json<RegisterProspect>,
) -> impl IntoResponse {
    if body.phone.trim().is_empty() || body.business_name.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "phone and business_name are required" })),
        );
    }

    let mut prospect = Prospect::new(body.phone.trim(), body.business_name.trim());
    prospect.owner_name = body.owner_name.filter(|o| !o.trim().is_empty());
    prospect.city = body.city;

    match state.nurture.register(&prospect).await {
        Ok(true) => (StatusCode::CREATED, Json(serde_json::json!(prospect))),
        Ok(false) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "prospect already registered" })),
        ),
        Err(e) => error_response(e),
    }
}

async fn list_prospects(State(state): State<AppState>) -> impl IntoResponse {
    match state.nurture.list_prospects().await {
        Ok(prospects) => (StatusCode::OK, Json(serde_json::json!(prospects))),
        Err(e) => error_response(e),
    }
}

async fn send_initial(State(state): State<AppState>, Path(phone): Path<String>) -> impl IntoResponse {
    match state.nurture.send_initial(&phone).await {
        Ok(sent) => (StatusCode::OK, Json(serde_json::json!({ "sent": sent }))),
        Err(e) => error_response(e),
    }
}

async fn mark_paid(State(state): State<AppState>, Path(phone): Path<String>) -> impl IntoResponse {
    match state.nurture.mark_paid(&phone).await {
        Ok(prospect) => (StatusCode::OK, Json(serde_json::json!(prospect))),
        Err(e) => error_response(e),
    }
}

async fn prospect_events(State(state): State<AppState>, Path(phone): Path<String>) -> impl IntoResponse {
    match state.db.list_outbound_events(&phone).await {
        Ok(events) => (StatusCode::OK, Json(serde_json::json!(events))),
        Err(e) => error_response(e.into()),
    }
}

#[derive(Debug, Deserialize)]
struct BatchQuery {
    limit: Option<usize>,
}

async fn send_batch(State(state): State<AppState>, Query(query): Query<BatchQuery>) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(state.nurture.config().batch_size);
    match state.nurture.send_batch(limit).await {
        Ok(result) => (StatusCode::OK, Json(serde_json::json!(result))),
        Err(e) => error_response(e),
    }
}

async fn process_followups(State(state): State<AppState>) -> impl IntoResponse {
    match state.nurture.process_followups().await {
        Ok(result) => (StatusCode::OK, Json(serde_json::json!(result))),
        Err(e) => error_response(e),
    }
}

async fn retry_no_answers(State(state): State<AppState>) -> impl IntoResponse {
    match state.nurture.retry_no_answers().await {
        Ok(result) => (StatusCode::OK, Json(serde_json::json!(result))),
        Err(e) => error_response(e),
    }
}
