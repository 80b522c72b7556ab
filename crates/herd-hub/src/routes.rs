use crate::extract::JsonOrForm;
use crate::gateway::SmsGateway;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use herd_core::identity::{normalize_identity, split_recipients};
use herd_core::ConversationTurn;
use herd_fuser::ContextFuser;
use herd_storage::ConversationLedger;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

pub const FALLBACK_REPLY: &str =
    "Sorry, I'm having trouble processing your request right now. Please try again later.";

const OPERATOR_IDENTITY: &str = "operator";

#[derive(Clone)]
pub struct AppState {
    pub fuser: Arc<ContextFuser>,
    pub ledger: Arc<ConversationLedger>,
    pub gateway: Arc<dyn SmsGateway>,
    pub country_code: Arc<str>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/health", get(|| async { "ok" }))
        .route("/send", post(send_sms))
        .route("/sms/receive", post(receive_sms))
        .route("/sms/delivery", post(delivery_report))
        .route("/test", post(test_reply))
        .route("/conversations", get(list_conversations))
        .route("/conversations/clear", post(clear_conversations))
        .route("/conversations/:identity/clear", post(clear_conversation))
        .fallback(not_found)
        .with_state(state)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn home() -> Json<Value> {
    Json(json!({
        "status": "Herd SMS service is running",
        "endpoints": [
            "/send",
            "/sms/receive",
            "/sms/delivery",
            "/test",
            "/conversations",
            "/conversations/clear",
        ],
    }))
}

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "Endpoint not found")
}

#[derive(Debug, Deserialize)]
struct InboundSms {
    from: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    date: Option<String>,
}

async fn receive_sms(
    State(state): State<AppState>,
    JsonOrForm(sms): JsonOrForm<InboundSms>,
) -> Response {
    let Some(raw_from) = sms.from.filter(|from| !from.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "message": "Missing 'from'" })),
        )
            .into_response();
    };
    let identity = normalize_identity(&raw_from, &state.country_code);
    let text = sms.text.unwrap_or_default();
    info!(
        event = "sms_received",
        from = %identity,
        id = sms.id.as_deref().unwrap_or(""),
        to = sms.to.as_deref().unwrap_or(""),
        date = sms.date.as_deref().unwrap_or(""),
        chars = text.len()
    );

    let reply = state.fuser.respond(&identity, &text).await;
    state
        .ledger
        .append(&identity, ConversationTurn::inbound(text));
    let outbound = if reply.is_degraded() {
        FALLBACK_REPLY.to_string()
    } else {
        reply.text
    };

    let recipients = [identity.clone()];
    if state.gateway.send(&recipients, &outbound).await.is_none() {
        warn!(event = "sms_reply_undelivered", to = %identity, gateway = state.gateway.name());
    }
    state
        .ledger
        .append(&identity, ConversationTurn::outbound(outbound));

    Json(json!({ "status": "success", "message": "SMS processed" })).into_response()
}

async fn delivery_report(JsonOrForm(report): JsonOrForm<BTreeMap<String, Value>>) -> Json<Value> {
    let report = Value::Object(serde_json::Map::from_iter(report));
    info!(event = "sms_delivery_report", report = %report);
    Json(json!({ "status": "success" }))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Recipients {
    List(Vec<String>),
    Joined(String),
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    recipients: Option<Recipients>,
}

async fn send_sms(
    State(state): State<AppState>,
    JsonOrForm(request): JsonOrForm<SendRequest>,
) -> Response {
    let message = request.message.filter(|message| !message.trim().is_empty());
    let recipients: Vec<String> = match request.recipients {
        Some(Recipients::List(list)) => list
            .iter()
            .map(|entry| entry.trim())
            .filter(|entry| !entry.is_empty())
            .map(|entry| normalize_identity(entry, &state.country_code))
            .collect(),
        Some(Recipients::Joined(joined)) => split_recipients(&joined)
            .iter()
            .map(|entry| normalize_identity(entry, &state.country_code))
            .collect(),
        None => Vec::new(),
    };
    let Some(message) = message.filter(|_| !recipients.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'message' or 'recipients'");
    };

    let reply = state.fuser.respond(OPERATOR_IDENTITY, &message).await;
    info!(
        event = "sms_broadcast",
        recipients = recipients.len(),
        degraded = reply.is_degraded()
    );
    let result = state.gateway.send(&recipients, &reply.text).await;

    Json(json!({
        "status": "success",
        "result": result,
        "response": reply.text,
        "recipients": recipients,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct TestRequest {
    #[serde(default)]
    message: Option<String>,
}

async fn test_reply(
    State(state): State<AppState>,
    JsonOrForm(request): JsonOrForm<TestRequest>,
) -> Response {
    let Some(message) = request.message.filter(|message| !message.trim().is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'message' parameter");
    };
    let reply = state.fuser.respond(OPERATOR_IDENTITY, &message).await;
    Json(json!({
        "input": message,
        "response": reply.text,
        "failure": reply.failure,
        "status": "success",
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct ConversationsQuery {
    phone_number: Option<String>,
}

/// Query strings decode `+` as a space, so `?phone_number=+2547..` arrives as
/// ` 2547..`. Numbers already carrying the country code get their `+` back.
fn resolve_identity_query(raw: &str, country_code: &str) -> String {
    let trimmed = raw.trim();
    let digits = country_code.trim_start_matches('+');
    if !trimmed.starts_with('+')
        && !digits.is_empty()
        && trimmed.starts_with(digits)
        && trimmed.len() > digits.len() + 6
    {
        return format!("+{trimmed}");
    }
    normalize_identity(trimmed, country_code)
}

async fn list_conversations(
    State(state): State<AppState>,
    Query(query): Query<ConversationsQuery>,
) -> Json<Value> {
    match query.phone_number.filter(|number| !number.trim().is_empty()) {
        Some(number) => {
            let identity = resolve_identity_query(&number, &state.country_code);
            Json(json!({
                "phone_number": identity,
                "conversation": state.ledger.get(&identity),
            }))
        }
        None => {
            let conversations = state.ledger.snapshot_all();
            Json(json!({
                "total_conversations": conversations.len(),
                "conversations": conversations,
            }))
        }
    }
}

async fn clear_conversations(State(state): State<AppState>) -> Json<Value> {
    state.ledger.clear_all();
    Json(json!({ "status": "success", "message": "Conversation history cleared" }))
}

async fn clear_conversation(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> Json<Value> {
    let identity = resolve_identity_query(&identity, &state.country_code);
    let cleared = state.ledger.clear_identity(&identity);
    info!(event = "conversation_cleared", identity = %identity, cleared);
    Json(json!({ "status": "success", "phone_number": identity, "cleared": cleared }))
}
