use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Capability required before the assistant may read a user's calendar.
pub const CALENDAR_READ: &str = "calendar.read";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleCredentials {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageKind {
    Message,
    Voice,
    Image,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub total_messages: i64,
    pub total_voice_minutes: i64,
    pub total_image_analyses: i64,
    pub monthly_messages: i64,
    pub monthly_voice_minutes: i64,
    pub monthly_image_analyses: i64,
    /// `YYYY-MM` the monthly counters belong to.
    pub month: String,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl Usage {
    /// Add `amount` to the counters for `kind`. Monthly counters restart when
    /// `now` falls in a different month than the one recorded.
    pub fn increment(&mut self, kind: UsageKind, amount: i64, now: DateTime<Utc>) {
        let month = now.format("%Y-%m").to_string();
        if self.month != month {
            self.month = month;
            self.monthly_messages = 0;
            self.monthly_voice_minutes = 0;
            self.monthly_image_analyses = 0;
        }

        match kind {
            UsageKind::Message => {
                self.total_messages += amount;
                self.monthly_messages += amount;
            }
            UsageKind::Voice => {
                self.total_voice_minutes += amount;
                self.monthly_voice_minutes += amount;
            }
            UsageKind::Image => {
                self.total_image_analyses += amount;
                self.monthly_image_analyses += amount;
            }
        }
        self.last_activity_at = Some(now);
    }
}

/// A registered user with linked accounts and granted capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: String,
    pub display_name: String,
    pub google_credentials: Option<GoogleCredentials>,
    pub permissions: Vec<String>,
    pub usage: Usage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            google_credentials: None,
            permissions: Vec::new(),
            usage: Usage::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }

    pub fn grant_permission(&mut self, permission: &str) {
        if !self.has_permission(permission) {
            self.permissions.push(permission.to_string());
        }
    }

    pub fn revoke_permission(&mut self, permission: &str) {
        self.permissions.retain(|p| p != permission);
    }

    pub fn can_read_calendar(&self) -> bool {
        self.google_credentials.is_some() && self.has_permission(CALENDAR_READ)
    }

    pub fn public_profile(&self) -> PublicProfile {
        PublicProfile {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            google_linked: self.google_credentials.is_some(),
            permissions: self.permissions.clone(),
            usage: self.usage.clone(),
            created_at: self.created_at,
        }
    }
}

/// What the API exposes about a user; never carries tokens.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicProfile {
    pub user_id: String,
    pub display_name: String,
    pub google_linked: bool,
    pub permissions: Vec<String>,
    pub usage: Usage,
    pub created_at: DateTime<Utc>,
}
