use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::bus::EventBus;
use crate::calendar::CalendarProvider;
use crate::config::Config;
use crate::conversation::ChatService;
use crate::dispatch::Dispatcher;
use crate::kv::{InMemoryTtlStore, TtlStore};
use crate::llm::LlmGateway;
use crate::session::AssistantSession;
use crate::speech::jobs::SttJob;
use crate::speech::{SttChain, TtsChain};
use crate::store::Store;
use crate::vision::VisionProvider;

mod assistant;
mod communication;
mod users;
mod vision;

/// Base64 audio and image uploads are far larger than axum's 2 MB default.
const BODY_LIMIT: usize = 25 * 1024 * 1024;

// -----------------------------------------------------------------------------
// Server State
// -----------------------------------------------------------------------------

pub struct AppState {
    pub config: Config,
    pub store: Store,
    pub chat: ChatService,
    pub tts: TtsChain,
    pub stt: Arc<SttChain>,
    pub vision: Arc<dyn VisionProvider>,
    pub sessions: Arc<dyn TtlStore<AssistantSession>>,
    pub stt_jobs: Arc<dyn TtlStore<SttJob>>,
    pub bus: Arc<EventBus>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Store,
        llm: Arc<dyn LlmGateway>,
        calendar: Arc<dyn CalendarProvider>,
        tts: TtsChain,
        stt: SttChain,
        vision: Arc<dyn VisionProvider>,
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        let chat = ChatService::new(store.clone(), llm, Dispatcher::new(calendar), bus.clone());
        Self {
            config,
            store,
            chat,
            tts,
            stt: Arc::new(stt),
            vision,
            sessions: Arc::new(InMemoryTtlStore::new()),
            stt_jobs: Arc::new(InMemoryTtlStore::new()),
            bus,
        }
    }
}

// -----------------------------------------------------------------------------
// Router
// -----------------------------------------------------------------------------

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/communication/message", post(communication::send_message))
        .route("/api/communication/events", get(communication::events))
        .route("/api/chat/history", get(communication::history))
        .route("/api/users/:user_id", get(users::get_user).put(users::upsert_user))
        .route("/api/users/:user_id/permissions", post(users::set_permission))
        .route("/api/assistant/session", post(assistant::start_session))
        .route(
            "/api/assistant/session/:session_id",
            get(assistant::get_session).delete(assistant::end_session),
        )
        .route("/api/tts", post(assistant::synthesize))
        .route("/api/stt", post(assistant::transcribe))
        .route("/api/stt/async", post(assistant::create_stt_job))
        .route("/api/stt/async/:job_id", get(assistant::get_stt_job))
        .route("/api/vision/analyze", post(vision::analyze))
        .with_state(state)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
