//! One chat turn: LLM call, tag parsing, dispatch, persistence.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::bus::{Event, EventBus};
use crate::chat::{new_session_id, ChatMessage, Role};
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::entity::UsageKind;
use crate::llm::{parse_llm_tags, LlmGateway, LlmRequest, ParsedTags};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub user_id: String,
    pub message: String,
    pub message_type: String,
    pub context: Map<String, Value>,
    pub options: Map<String, Value>,
}

impl ChatRequest {
    /// `options.sessionId` when the client continues a session.
    pub fn session_id(&self) -> Option<&str> {
        self.options
            .get("sessionId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct ChatTurn {
    /// Id of the persisted assistant message.
    pub message_id: String,
    pub session_id: String,
    pub raw: String,
    pub parsed: ParsedTags,
    pub outcome: DispatchOutcome,
    pub processing_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

pub struct ChatService {
    store: Store,
    llm: Arc<dyn LlmGateway>,
    dispatcher: Dispatcher,
    bus: Arc<EventBus>,
}

impl ChatService {
    pub fn new(
        store: Store,
        llm: Arc<dyn LlmGateway>,
        dispatcher: Dispatcher,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            llm,
            dispatcher,
            bus,
        }
    }

    /// Run a turn. Upstream failures end up in the returned outcome; only
    /// persistence errors are returned as `Err`.
    pub async fn handle(&self, request: ChatRequest) -> Result<ChatTurn> {
        let started = Instant::now();
        let session_id = request
            .session_id()
            .map(str::to_string)
            .unwrap_or_else(new_session_id);

        let mut user_meta = Map::new();
        if !request.context.is_empty() {
            user_meta.insert("context".to_string(), Value::Object(request.context.clone()));
        }
        let user_msg = ChatMessage::new(
            &request.user_id,
            &session_id,
            Role::User,
            &request.message,
            &request.message_type,
        )
        .with_metadata(user_meta);
        self.store.save_message(&user_msg).await?;
        self.bus.publish(Event::ChatMessage(user_msg));

        let user = self.store.find_user(&request.user_id).await?;

        let llm_request = LlmRequest {
            user_id: &request.user_id,
            message: &request.message,
            context: &request.context,
            options: &request.options,
        };
        let (raw, parsed, outcome) = match self.llm.complete(llm_request).await {
            Ok(raw) => {
                let parsed = parse_llm_tags(&raw);
                let outcome = self.dispatcher.dispatch(&parsed, user.as_ref()).await;
                (raw, parsed, outcome)
            }
            Err(e) => {
                warn!("LLM call failed for {}: {}", request.user_id, e);
                (String::new(), ParsedTags::default(), DispatchOutcome::failed(e.code()))
            }
        };

        let processing_time_ms = started.elapsed().as_millis() as u64;

        let mut meta = Map::new();
        meta.insert("parsedTags".to_string(), json!(parsed.tags));
        meta.insert("outcome".to_string(), json!(outcome.label()));
        if let Some(reason) = outcome.reason() {
            meta.insert("degradedReason".to_string(), json!(reason));
        }
        if let Some(calendar) = outcome.calendar() {
            meta.insert("calendar".to_string(), json!(calendar));
        }
        meta.insert("processingTime".to_string(), json!(processing_time_ms));

        let reply = ChatMessage::new(
            &request.user_id,
            &session_id,
            Role::Assistant,
            outcome.content(),
            "text",
        )
        .with_metadata(meta);
        self.store.save_message(&reply).await?;

        if user.is_some() {
            self.store
                .increment_usage(&request.user_id, UsageKind::Message, 1)
                .await?;
        }

        info!(
            "Chat turn for {} in {} finished: {} ({} ms)",
            request.user_id,
            session_id,
            outcome.label(),
            processing_time_ms
        );

        let turn = ChatTurn {
            message_id: reply.message_id.clone(),
            session_id,
            raw,
            parsed,
            outcome,
            processing_time_ms,
            timestamp: reply.timestamp,
        };
        self.bus.publish(Event::ChatMessage(reply));

        Ok(turn)
    }
}
