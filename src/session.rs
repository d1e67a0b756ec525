use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

/// A short-lived assistant session opened by a device.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantSession {
    pub session_id: String,
    pub user_id: String,
    pub locale: String,
    pub model: String,
    pub options: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AssistantSession {
    pub fn new(
        user_id: String,
        locale: String,
        model: String,
        options: Map<String, Value>,
        ttl: std::time::Duration,
    ) -> Self {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            session_id: format!("sess_{}", Uuid::new_v4().simple()),
            user_id,
            locale,
            model,
            options,
            created_at: now,
            expires_at,
        }
    }
}
