//! Fakes and helpers shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use chrono::NaiveDate;

use crate::calendar::{CalendarError, CalendarEvent, CalendarProvider};
use crate::config::Config;
use crate::entity::User;
use crate::llm::{LlmError, LlmGateway, LlmRequest};
use crate::server::AppState;
use crate::speech::stt::{SttProvider, Transcript};
use crate::speech::{SpeechError, SttChain, SttRequest, TtsChain};
use crate::store::Store;
use crate::vision::{VisionAnalysis, VisionError, VisionProvider, VisionRequest};

/// Serve `router` on an ephemeral loopback port and return its base URL.
pub async fn spawn_upstream(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

pub struct FakeLlm {
    reply: Option<String>,
}

impl FakeLlm {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
        }
    }

    pub fn failing() -> Self {
        Self { reply: None }
    }
}

#[async_trait]
impl LlmGateway for FakeLlm {
    async fn complete(&self, _request: LlmRequest<'_>) -> Result<String, LlmError> {
        match &self.reply {
            Some(reply) => Ok(reply.clone()),
            None => Err(LlmError::Status {
                status: 500,
                body: "boom".to_string(),
            }),
        }
    }
}

pub struct FakeCalendar {
    events: Option<usize>,
    calls: AtomicUsize,
    last_date: Mutex<Option<NaiveDate>>,
}

impl FakeCalendar {
    pub fn with_events(n: usize) -> Self {
        Self {
            events: Some(n),
            calls: AtomicUsize::new(0),
            last_date: Mutex::new(None),
        }
    }

    pub fn failing() -> Self {
        Self {
            events: None,
            calls: AtomicUsize::new(0),
            last_date: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        *self.last_date.lock().unwrap()
    }
}

#[async_trait]
impl CalendarProvider for FakeCalendar {
    async fn events_for_day(
        &self,
        _user: &User,
        date: NaiveDate,
    ) -> Result<Vec<CalendarEvent>, CalendarError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_date.lock().unwrap() = Some(date);
        let n = self.events.ok_or(CalendarError::Status {
            status: 500,
            body: "backend error".to_string(),
        })?;
        Ok((0..n)
            .map(|i| CalendarEvent {
                id: format!("e{}", i),
                summary: Some(format!("予定{}", i)),
                description: None,
                start: Some(date.to_string()),
                end: None,
                location: None,
                status: Some("confirmed".to_string()),
            })
            .collect())
    }
}

pub struct FakeStt {
    name: &'static str,
    text: Option<String>,
    calls: AtomicUsize,
}

impl FakeStt {
    pub fn ok(name: &'static str, text: &str) -> Self {
        Self {
            name,
            text: Some(text.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: &'static str) -> Self {
        Self {
            name,
            text: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SttProvider for FakeStt {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn transcribe(&self, _request: &SttRequest) -> Result<Transcript, SpeechError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.text {
            Some(text) => Ok(Transcript {
                text: text.clone(),
                confidence: Some(0.9),
                provider: self.name,
            }),
            None => Err(SpeechError::provider(self.name, "unavailable")),
        }
    }
}

/// Clones share the recorded request.
#[derive(Clone)]
pub struct FakeVision {
    description: Option<String>,
    last_request: Arc<Mutex<Option<VisionRequest>>>,
}

impl FakeVision {
    pub fn describing(description: &str) -> Self {
        Self {
            description: Some(description.to_string()),
            last_request: Arc::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            description: None,
            last_request: Arc::default(),
        }
    }

    pub fn last_request(&self) -> Option<VisionRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl VisionProvider for FakeVision {
    async fn analyze(&self, request: &VisionRequest) -> Result<VisionAnalysis, VisionError> {
        *self.last_request.lock().unwrap() = Some(request.clone());
        match &self.description {
            Some(description) => Ok(VisionAnalysis {
                description: description.clone(),
                model: "fake-vlm".to_string(),
            }),
            None => Err(VisionError::Status {
                status: 500,
                body: "model not loaded".to_string(),
            }),
        }
    }
}

/// Application state over an in-memory database, with fake LLM, calendar,
/// STT and vision collaborators and a tone-only TTS chain.
pub async fn test_state(llm: FakeLlm, calendar: FakeCalendar, stt: Vec<Arc<dyn SttProvider>>) -> Arc<AppState> {
    build_state(llm, calendar, stt, FakeVision::describing("画像")).await
}

pub async fn test_state_with_vision(vision: FakeVision) -> Arc<AppState> {
    build_state(FakeLlm::replying("hi"), FakeCalendar::with_events(0), Vec::new(), vision).await
}

async fn build_state(
    llm: FakeLlm,
    calendar: FakeCalendar,
    stt: Vec<Arc<dyn SttProvider>>,
    vision: FakeVision,
) -> Arc<AppState> {
    let store = Store::in_memory().await.unwrap();
    Arc::new(AppState::new(
        Config::default(),
        store,
        Arc::new(llm),
        Arc::new(calendar),
        TtsChain::new(vec![Arc::new(crate::speech::tts::ToneTts)]),
        SttChain::new(stt),
        Arc::new(vision),
    ))
}
