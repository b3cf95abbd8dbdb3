use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::realtime::{broadcast_conversation, ws_handler};
use crate::types::{
    now_iso, AiConfig, AppState, AutomationRule, CalendarEvent, Platform, PlatformConnection,
    Service,
};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/webhook", get(webhook_verify).post(webhook_event))
        .route("/api/conversations", get(get_conversations))
        .route(
            "/api/conversations/{conversation_id}/messages",
            post(post_conversation_message),
        )
        .route("/api/connections", get(get_connections).post(save_connection))
        .route("/api/ai-config", get(get_ai_config).post(save_ai_config))
        .route(
            "/api/webhook-config",
            get(get_webhook_config).post(save_webhook_config),
        )
        .route("/api/services", get(get_services).post(create_service))
        .route(
            "/api/services/{service_id}",
            put(update_service).delete(delete_service),
        )
        .route(
            "/api/automation-rules",
            get(get_automation_rules).post(create_automation_rule),
        )
        .route(
            "/api/automation-rules/{rule_id}",
            put(update_automation_rule).delete(delete_automation_rule),
        )
        .route(
            "/api/calendar-events",
            get(get_calendar_events).post(create_calendar_event),
        )
        .route(
            "/api/calendar-events/{event_id}",
            put(update_calendar_event).delete(delete_calendar_event),
        )
        .route(
            "/api/welcome-message",
            get(get_welcome_message).post(save_welcome_message),
        )
        .route("/api/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

// --- Webhook (inbound, platform -> server) ---

/// Meta-style subscription handshake: echo the challenge only when the caller
/// knows the configured verify token. No side effects.
async fn webhook_verify(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let mode = params.get("hub.mode").cloned().unwrap_or_default();
    let token = params.get("hub.verify_token").cloned().unwrap_or_default();
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();

    let expected = state
        .store
        .read(|db| db.webhook_config.verify_token.clone())
        .await;

    if mode == "subscribe" && !expected.is_empty() && token == expected {
        info!("webhook verified");
        return (StatusCode::OK, challenge).into_response();
    }

    warn!("webhook verification failed");
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "error": "invalid webhook verification token" })),
    )
        .into_response()
}

fn verify_hub_signature(app_secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    let Some(header) = signature_header else {
        return false;
    };
    let Some(expected_hex) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let computed = hex::encode(mac.finalize().into_bytes());
    computed.eq_ignore_ascii_case(expected_hex)
}

/// Event ingestion. The upstream platform retries aggressively on non-2xx, so
/// every outcome short of process death answers `200 EVENT_RECEIVED`; one
/// unrecognized or corrupt entry never blocks its siblings.
async fn webhook_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let app_secret = state
        .store
        .read(|db| {
            db.connection(Platform::Facebook)
                .map(|c| c.app_secret.clone())
                .unwrap_or_default()
        })
        .await;
    if !app_secret.is_empty() {
        if let Some(signature) = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok())
        {
            if !verify_hub_signature(&app_secret, Some(signature), &body) {
                warn!("webhook signature mismatch, ignoring payload");
                return (StatusCode::OK, "EVENT_RECEIVED");
            }
        }
    }

    let payload = serde_json::from_slice::<Value>(&body).unwrap_or_else(|err| {
        warn!(%err, "malformed webhook payload");
        json!({})
    });

    if payload.get("object").and_then(Value::as_str) != Some("page") {
        return (StatusCode::OK, "EVENT_RECEIVED");
    }

    let entries = payload
        .get("entry")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for entry in entries {
        let Some(event) = entry
            .get("messaging")
            .and_then(Value::as_array)
            .and_then(|events| events.first())
        else {
            continue;
        };

        // Only actual text messages; delivery receipts, postbacks and other
        // event shapes are skipped without failing the batch.
        let Some(text) = event
            .get("message")
            .and_then(|m| m.get("text"))
            .and_then(Value::as_str)
        else {
            continue;
        };
        let Some(sender_id) = event
            .get("sender")
            .and_then(|s| s.get("id"))
            .and_then(Value::as_str)
        else {
            continue;
        };

        let timestamp = event
            .get("timestamp")
            .and_then(Value::as_i64)
            .and_then(chrono::DateTime::from_timestamp_millis)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(now_iso);

        let conversation = state
            .store
            .update(|db| db.record_inbound(sender_id, text, timestamp))
            .await;
        info!(sender_id, conversation_id = %conversation.id, "processed inbound message");

        broadcast_conversation(&state, &conversation).await;
    }

    (StatusCode::OK, "EVENT_RECEIVED")
}

// --- Conversations / outbound relay ---

async fn get_conversations(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let conversations = state.store.read(|db| db.conversations.clone()).await;
    Json(conversations)
}

#[derive(Debug, Deserialize)]
struct SendMessageBody {
    text: String,
}

/// The single path by which any outgoing text reaches the customer. The
/// upstream send and the persisted append happen together or not at all.
async fn post_conversation_message(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendMessageBody>,
) -> impl IntoResponse {
    if body.text.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "text is required" })),
        )
            .into_response();
    }

    let target = state
        .store
        .read(|db| {
            db.conversation(&conversation_id).map(|conversation| {
                (
                    conversation.customer.id.clone(),
                    conversation.customer.platform,
                )
            })
        })
        .await;
    let Some((recipient_id, platform)) = target else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "conversation not found" })),
        )
            .into_response();
    };

    let credential = state
        .store
        .read(|db| {
            db.connection(platform).and_then(|connection| {
                if connection.connected
                    && !connection.access_token.is_empty()
                    && !connection.page_id.is_empty()
                {
                    Some((connection.page_id.clone(), connection.access_token.clone()))
                } else {
                    None
                }
            })
        })
        .await;
    let Some((page_id, access_token)) = credential else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("platform {platform:?} is not connected") })),
        )
            .into_response();
    };

    if let Err(err) =
        send_platform_message(&state, &page_id, &access_token, &recipient_id, &body.text).await
    {
        warn!(%conversation_id, %err, "upstream send failed");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to deliver message to platform" })),
        )
            .into_response();
    }

    let Some((message, conversation)) = state
        .store
        .update(|db| db.record_outbound(&conversation_id, &body.text))
        .await
    else {
        // Conversation vanished between the credential check and the append.
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "conversation not found" })),
        )
            .into_response();
    };

    broadcast_conversation(&state, &conversation).await;

    (StatusCode::CREATED, Json(message)).into_response()
}

async fn send_platform_message(
    state: &Arc<AppState>,
    page_id: &str,
    access_token: &str,
    recipient_id: &str,
    text: &str,
) -> Result<(), String> {
    let url = format!("{}/{page_id}/messages", state.graph_base_url);
    let response = state
        .http
        .post(&url)
        .query(&[("access_token", access_token)])
        .json(&json!({
            "recipient": { "id": recipient_id },
            "messaging_type": "RESPONSE",
            "message": { "text": text }
        }))
        .send()
        .await
        .map_err(|err| format!("send request failed: {err}"))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(format!("send API returned {status}: {body}"));
    }
    Ok(())
}

// --- Platform connections ---

async fn get_connections(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.store.read(|db| db.connections.clone()).await)
}

async fn save_connection(
    State(state): State<Arc<AppState>>,
    Json(updated): Json<PlatformConnection>,
) -> impl IntoResponse {
    state
        .store
        .update(|db| {
            for connection in &mut db.connections {
                if connection.platform == updated.platform {
                    *connection = updated.clone();
                }
            }
        })
        .await;
    Json(json!({ "message": "Connection updated successfully" }))
}

// --- AI / webhook configuration ---

async fn get_ai_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.store.read(|db| db.ai_config.clone()).await)
}

async fn save_ai_config(
    State(state): State<Arc<AppState>>,
    Json(config): Json<AiConfig>,
) -> impl IntoResponse {
    state.store.update(|db| db.ai_config = config).await;
    Json(json!({ "message": "AI configuration saved." }))
}

async fn get_webhook_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.store.read(|db| db.webhook_config.clone()).await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookConfigBody {
    verify_token: String,
}

async fn save_webhook_config(
    State(state): State<Arc<AppState>>,
    Json(body): Json<WebhookConfigBody>,
) -> impl IntoResponse {
    state
        .store
        .update(|db| db.webhook_config.verify_token = body.verify_token)
        .await;
    Json(json!({ "message": "Webhook token updated." }))
}

// --- Service catalog ---

async fn get_services(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.store.read(|db| db.services.clone()).await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceBody {
    name: String,
    price: String,
    description: String,
}

async fn create_service(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ServiceBody>,
) -> impl IntoResponse {
    let service = Service {
        id: format!("serv_{}", Uuid::new_v4().simple()),
        name: body.name,
        price: body.price,
        description: body.description,
    };
    state
        .store
        .update(|db| db.services.push(service.clone()))
        .await;
    (StatusCode::CREATED, Json(service))
}

async fn update_service(
    Path(service_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<ServiceBody>,
) -> impl IntoResponse {
    let updated = state
        .store
        .update(|db| {
            db.services
                .iter_mut()
                .find(|s| s.id == service_id)
                .map(|service| {
                    service.name = body.name.clone();
                    service.price = body.price.clone();
                    service.description = body.description.clone();
                    service.clone()
                })
        })
        .await;

    match updated {
        Some(service) => Json(service).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "service not found" })),
        )
            .into_response(),
    }
}

async fn delete_service(
    Path(service_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let removed = state
        .store
        .update(|db| {
            let before = db.services.len();
            db.services.retain(|s| s.id != service_id);
            db.services.len() != before
        })
        .await;

    if removed {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "service not found" })),
        )
            .into_response()
    }
}

// --- Automation rules ---

async fn get_automation_rules(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.store.read(|db| db.automation_rules.clone()).await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AutomationRuleBody {
    platform: Platform,
    trigger: String,
    keywords: Vec<String>,
    public_reply: String,
    system_prompt: String,
}

async fn create_automation_rule(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AutomationRuleBody>,
) -> impl IntoResponse {
    let rule = AutomationRule {
        id: format!("rule_{}", Uuid::new_v4().simple()),
        platform: body.platform,
        trigger: body.trigger,
        keywords: body.keywords,
        public_reply: body.public_reply,
        system_prompt: body.system_prompt,
    };
    state
        .store
        .update(|db| db.automation_rules.push(rule.clone()))
        .await;
    (StatusCode::CREATED, Json(rule))
}

async fn update_automation_rule(
    Path(rule_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<AutomationRuleBody>,
) -> impl IntoResponse {
    let updated = state
        .store
        .update(|db| {
            db.automation_rules
                .iter_mut()
                .find(|r| r.id == rule_id)
                .map(|rule| {
                    rule.platform = body.platform;
                    rule.trigger = body.trigger.clone();
                    rule.keywords = body.keywords.clone();
                    rule.public_reply = body.public_reply.clone();
                    rule.system_prompt = body.system_prompt.clone();
                    rule.clone()
                })
        })
        .await;

    match updated {
        Some(rule) => Json(rule).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "rule not found" })),
        )
            .into_response(),
    }
}

async fn delete_automation_rule(
    Path(rule_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let removed = state
        .store
        .update(|db| {
            let before = db.automation_rules.len();
            db.automation_rules.retain(|r| r.id != rule_id);
            db.automation_rules.len() != before
        })
        .await;

    if removed {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "rule not found" })),
        )
            .into_response()
    }
}

// --- Appointment calendar ---

async fn get_calendar_events(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.store.read(|db| db.calendar_events.clone()).await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarEventBody {
    title: String,
    start: String,
    end: String,
    #[serde(default)]
    customer_name: Option<String>,
    #[serde(default)]
    service: Option<String>,
}

async fn create_calendar_event(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CalendarEventBody>,
) -> impl IntoResponse {
    let event = CalendarEvent {
        id: format!("evt_{}", Uuid::new_v4().simple()),
        title: body.title,
        start: body.start,
        end: body.end,
        customer_name: body.customer_name,
        service: body.service,
    };
    state
        .store
        .update(|db| db.calendar_events.push(event.clone()))
        .await;
    (StatusCode::CREATED, Json(event))
}

async fn update_calendar_event(
    Path(event_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<CalendarEventBody>,
) -> impl IntoResponse {
    let updated = state
        .store
        .update(|db| {
            db.calendar_events
                .iter_mut()
                .find(|e| e.id == event_id)
                .map(|event| {
                    event.title = body.title.clone();
                    event.start = body.start.clone();
                    event.end = body.end.clone();
                    event.customer_name = body.customer_name.clone();
                    event.service = body.service.clone();
                    event.clone()
                })
        })
        .await;

    match updated {
        Some(event) => Json(event).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "event not found" })),
        )
            .into_response(),
    }
}

async fn delete_calendar_event(
    Path(event_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let removed = state
        .store
        .update(|db| {
            let before = db.calendar_events.len();
            db.calendar_events.retain(|e| e.id != event_id);
            db.calendar_events.len() != before
        })
        .await;

    if removed {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "event not found" })),
        )
            .into_response()
    }
}

// --- Automation welcome message ---

async fn get_welcome_message(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let message = state.store.read(|db| db.welcome_message.clone()).await;
    Json(json!({ "message": message }))
}

#[derive(Debug, Deserialize)]
struct WelcomeMessageBody {
    message: String,
}

async fn save_welcome_message(
    State(state): State<Arc<AppState>>,
    Json(body): Json<WelcomeMessageBody>,
) -> impl IntoResponse {
    state
        .store
        .update(|db| db.welcome_message = body.message)
        .await;
    Json(json!({ "message": "Welcome message saved." }))
}
