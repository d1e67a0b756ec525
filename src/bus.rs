use crate::chat::ChatMessage;
use crate::speech::jobs::SttJob;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// A chat message was persisted
    ChatMessage(ChatMessage),

    /// An asynchronous transcription finished (successfully or not)
    SttJob(SttJob),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::ChatMessage(_) => "chat_message",
            Event::SttJob(_) => "stt_job",
        }
    }

    /// The user the event belongs to, if any.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Event::ChatMessage(msg) => Some(&msg.user_id),
            Event::SttJob(job) => job.user_id.as_deref(),
        }
    }
}

pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(100);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) {
        // We ignore the error if there are no receivers
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
