use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    Json,
};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::AppState;
use crate::bus::Event;
use crate::conversation::ChatRequest;
use crate::error::{ApiError, FieldError};

const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 200;

// -----------------------------------------------------------------------------
// POST /api/communication/message
// -----------------------------------------------------------------------------

/// Raw request body. Fields stay loosely typed so that validation can report
/// every bad field at once.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBody {
    #[serde(default)]
    user_id: Option<Value>,
    #[serde(default)]
    message: Option<Value>,
    #[serde(default)]
    message_type: Option<Value>,
    #[serde(default)]
    context: Option<Value>,
    #[serde(default)]
    options: Option<Value>,
}

impl MessageBody {
    pub fn validate(self) -> Result<ChatRequest, ApiError> {
        let mut errors = Vec::new();

        let user_id = required_string("userId", self.user_id, &mut errors);
        let message = required_string("message", self.message, &mut errors);

        let message_type = match self.message_type {
            None | Some(Value::Null) => "text".to_string(),
            Some(Value::String(s)) if !s.trim().is_empty() => s,
            Some(_) => {
                errors.push(FieldError::new("messageType", "\"messageType\" must be a non-empty string"));
                String::new()
            }
        };

        let context = optional_object("context", self.context, &mut errors);
        let options = optional_object("options", self.options, &mut errors);

        match (user_id, message) {
            (Some(user_id), Some(message)) if errors.is_empty() => Ok(ChatRequest {
                user_id,
                message,
                message_type,
                context,
                options,
            }),
            _ => Err(ApiError::Validation(errors)),
        }
    }
}

pub(super) fn required_string(field: &str, value: Option<Value>, errors: &mut Vec<FieldError>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
        Some(Value::String(_)) => {
            errors.push(FieldError::new(field, format!("\"{}\" is not allowed to be empty", field)));
            None
        }
        None | Some(Value::Null) => {
            errors.push(FieldError::new(field, format!("\"{}\" is required", field)));
            None
        }
        Some(_) => {
            errors.push(FieldError::new(field, format!("\"{}\" must be a string", field)));
            None
        }
    }
}

pub(super) fn optional_object(
    field: &str,
    value: Option<Value>,
    errors: &mut Vec<FieldError>,
) -> Map<String, Value> {
    match value {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map,
        Some(_) => {
            errors.push(FieldError::new(field, format!("\"{}\" must be of type object", field)));
            Map::new()
        }
    }
}

pub(super) async fn send_message(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<MessageBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = payload?;
    let request = body.validate()?;
    info!("Message from {} ({})", request.user_id, request.message_type);

    let user_id = request.user_id.clone();
    let message_type = request.message_type.clone();

    let turn = state
        .chat
        .handle(request)
        .await
        .map_err(|e| ApiError::internal("Message processing failed", format!("{:#}", e)))?;

    let mut metadata = json!({
        "timestamp": turn.timestamp.to_rfc3339(),
        "messageType": message_type,
        "userId": user_id,
        "processingTime": turn.processing_time_ms,
        "parsedTags": turn.parsed.tags,
        "outcome": turn.outcome.label(),
    });
    if let Some(reason) = turn.outcome.reason() {
        metadata["degradedReason"] = json!(reason);
    }
    if let Some(calendar) = turn.outcome.calendar() {
        metadata["calendar"] = json!(calendar);
    }

    Ok(Json(json!({
        "success": true,
        "messageId": turn.message_id,
        "sessionId": turn.session_id,
        "response": {
            "content": turn.outcome.content(),
            "type": "text",
            "llm_raw": turn.raw,
        },
        "metadata": metadata,
    })))
}

// -----------------------------------------------------------------------------
// GET /api/chat/history
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    user_id: Option<String>,
    session_id: Option<String>,
    limit: Option<i64>,
}

pub(super) async fn history(
    State(state): State<Arc<AppState>>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::field("query", e.body_text()))?;
    let user_id = query
        .user_id
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ApiError::field("userId", "\"userId\" is required"))?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);

    let messages = state
        .store
        .get_chat_history(&user_id, query.session_id.as_deref(), limit)
        .await
        .map_err(|e| ApiError::internal("History fetch failed", format!("{:#}", e)))?;

    Ok(Json(json!({
        "success": true,
        "count": messages.len(),
        "messages": messages,
    })))
}

// -----------------------------------------------------------------------------
// GET /api/communication/events (SSE)
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    user_id: Option<String>,
}

/// Events without an owner are only sent to unfiltered subscribers.
fn visible_to(event: &Event, user_id: Option<&str>) -> bool {
    match user_id {
        None => true,
        Some(wanted) => event.user_id() == Some(wanted),
    }
}

pub(super) async fn events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, axum::BoxError>>> {
    info!("New SSE subscriber (user={:?})", query.user_id);

    let mut rx = state.bus.subscribe();
    let user_id = query.user_id;

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if !visible_to(&event, user_id.as_deref()) {
                        continue;
                    }
                    match SseEvent::default().event(event.name()).json_data(&event) {
                        Ok(sse) => yield Ok(sse),
                        Err(e) => warn!("Failed to encode {} event: {}", event.name(), e),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("SSE subscriber lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatMessage, Role};
    use crate::entity::{GoogleCredentials, User, CALENDAR_READ};
    use crate::server::router;
    use crate::speech::jobs::SttJob;
    use crate::testing::{test_state, FakeCalendar, FakeLlm};
    use axum::http::StatusCode;
    use axum_test::TestServer;

    async fn server_with(llm: FakeLlm, calendar: FakeCalendar) -> (TestServer, Arc<AppState>) {
        let state = test_state(llm, calendar, Vec::new()).await;
        let server = TestServer::new(router(state.clone())).unwrap();
        (server, state)
    }

    async fn link_calendar(state: &AppState, grant: bool) {
        let mut user = User::new("u1", "Mei");
        user.google_credentials = Some(GoogleCredentials {
            access_token: "token".into(),
            refresh_token: None,
        });
        if grant {
            user.grant_permission(CALENDAR_READ);
        }
        state.store.save_user(&user).await.unwrap();
    }

    #[tokio::test]
    async fn test_greeting_end_to_end() {
        let (server, _) = server_with(
            FakeLlm::replying("LLM-TAGS:\nこんにちは！今日はどんなことをお話ししましょうか？"),
            FakeCalendar::with_events(0),
        )
        .await;

        let response = server
            .post("/api/communication/message")
            .json(&json!({ "userId": "u1", "message": "こんにちは" }))
            .await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["success"], true);
        assert_eq!(
            body["response"]["content"].as_str().unwrap().trim(),
            "こんにちは！今日はどんなことをお話ししましょうか？"
        );
        assert_eq!(body["response"]["type"], "text");
        assert_eq!(
            body["response"]["llm_raw"],
            "LLM-TAGS:\nこんにちは！今日はどんなことをお話ししましょうか？"
        );
        assert_eq!(body["metadata"]["parsedTags"], json!({}));
        assert_eq!(body["metadata"]["messageType"], "text");
        assert_eq!(body["metadata"]["userId"], "u1");
        assert_eq!(body["metadata"]["outcome"], "ok");
        assert!(body["metadata"].get("calendar").is_none());
        assert!(body["messageId"].as_str().unwrap().starts_with("msg_"));
        assert!(body["sessionId"].as_str().unwrap().starts_with("session_"));
    }

    #[tokio::test]
    async fn test_missing_message_is_rejected() {
        let (server, _) = server_with(FakeLlm::replying("hi"), FakeCalendar::with_events(0)).await;

        let response = server
            .post("/api/communication/message")
            .json(&json!({ "userId": "u1" }))
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Validation failed");
        let details = body["details"].as_array().unwrap();
        assert!(details.iter().any(|d| d["field"] == "message"));
        assert!(!details.iter().any(|d| d["field"] == "userId"));
    }

    #[tokio::test]
    async fn test_every_invalid_field_is_reported() {
        let (server, _) = server_with(FakeLlm::replying("hi"), FakeCalendar::with_events(0)).await;

        let response = server
            .post("/api/communication/message")
            .json(&json!({ "userId": 7, "message": "", "context": "nope" }))
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        let fields: Vec<&str> = body["details"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|d| d["field"].as_str())
            .collect();
        assert_eq!(fields, ["userId", "message", "context"]);
    }

    #[tokio::test]
    async fn test_non_json_body_is_rejected() {
        let (server, _) = server_with(FakeLlm::replying("hi"), FakeCalendar::with_events(0)).await;

        let response = server.post("/api/communication/message").text("hello").await;

        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["details"][0]["field"], "body");
    }

    #[tokio::test]
    async fn test_calendar_events_in_metadata() {
        let (server, state) = server_with(
            FakeLlm::replying("LLM-TAGS: calendar_api=true;date=2024-05-01\n予定を確認しました。"),
            FakeCalendar::with_events(3),
        )
        .await;
        link_calendar(&state, true).await;

        let response = server
            .post("/api/communication/message")
            .json(&json!({ "userId": "u1", "message": "5月1日の予定は？" }))
            .await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["metadata"]["calendar"]["total"], 3);
        assert_eq!(body["metadata"]["calendar"]["date"], "2024-05-01");
        assert_eq!(body["metadata"]["calendar"]["events"].as_array().unwrap().len(), 3);
        assert_eq!(body["metadata"]["parsedTags"]["calendar_api"], "true");
        assert!(body["response"]["content"].as_str().unwrap().contains('3'));
    }

    #[tokio::test]
    async fn test_calendar_without_permission_still_answers() {
        let (server, state) = server_with(
            FakeLlm::replying("LLM-TAGS: calendar_api=true\n予定を見てみますね。"),
            FakeCalendar::with_events(3),
        )
        .await;
        link_calendar(&state, false).await;

        let response = server
            .post("/api/communication/message")
            .json(&json!({ "userId": "u1", "message": "今日の予定は？" }))
            .await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["metadata"]["outcome"], "degraded");
        assert_eq!(body["metadata"]["degradedReason"], "calendar_permission_missing");
        assert!(body["metadata"].get("calendar").is_none());
        assert!(body["response"]["content"]
            .as_str()
            .unwrap()
            .starts_with("予定を見てみますね。"));
    }

    #[tokio::test]
    async fn test_llm_failure_still_returns_ok() {
        let (server, _) = server_with(FakeLlm::failing(), FakeCalendar::with_events(0)).await;

        let response = server
            .post("/api/communication/message")
            .json(&json!({ "userId": "u1", "message": "hello" }))
            .await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["metadata"]["outcome"], "failed");
        assert!(!body["response"]["content"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_returns_turn() {
        let (server, _) = server_with(FakeLlm::replying("LLM-TAGS:\nやあ"), FakeCalendar::with_events(0)).await;

        server
            .post("/api/communication/message")
            .json(&json!({ "userId": "u1", "message": "hi", "options": { "sessionId": "s1" } }))
            .await
            .assert_status_ok();

        let response = server
            .get("/api/chat/history")
            .add_query_param("userId", "u1")
            .add_query_param("sessionId", "s1")
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["count"], 2);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "やあ");

        let response = server.get("/api/chat/history").await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_event_visibility() {
        let msg = Event::ChatMessage(ChatMessage::new("u1", "s1", Role::User, "hi", "text"));
        assert!(visible_to(&msg, None));
        assert!(visible_to(&msg, Some("u1")));
        assert!(!visible_to(&msg, Some("u2")));

        let anonymous = Event::SttJob(SttJob::queued(None));
        assert!(visible_to(&anonymous, None));
        assert!(!visible_to(&anonymous, Some("u1")));
    }
}
