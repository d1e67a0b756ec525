//! Google Calendar v3 client used by the tag dispatcher.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::GoogleOAuthConfig;
use crate::entity::User;
use crate::store::Store;

const CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3";
const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    /// `dateTime` for timed events, `date` for all-day ones.
    pub start: Option<String>,
    pub end: Option<String>,
    pub location: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CalendarError {
    #[error("Google Calendar authentication required")]
    NotLinked,

    #[error("calendar request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Google Calendar returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("access token refresh failed: {0}")]
    Refresh(String),
}

#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// Events of the user's primary calendar on `date` (local time).
    async fn events_for_day(
        &self,
        user: &User,
        date: NaiveDate,
    ) -> Result<Vec<CalendarEvent>, CalendarError>;
}

/// `[start, end)` of a local calendar day as UTC instants.
pub fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    let start = Local
        .from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&midnight));
    (start, start + Duration::days(1))
}

// -----------------------------------------------------------------------------
// Google API wire types
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EventList {
    #[serde(default)]
    items: Vec<GoogleEvent>,
}

#[derive(Debug, Deserialize)]
struct GoogleEvent {
    id: String,
    summary: Option<String>,
    description: Option<String>,
    start: Option<EventTime>,
    end: Option<EventTime>,
    location: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventTime {
    date_time: Option<String>,
    date: Option<String>,
}

impl EventTime {
    fn into_string(self) -> Option<String> {
        self.date_time.or(self.date)
    }
}

impl From<GoogleEvent> for CalendarEvent {
    fn from(e: GoogleEvent) -> Self {
        Self {
            id: e.id,
            summary: e.summary,
            description: e.description,
            start: e.start.and_then(EventTime::into_string),
            end: e.end.and_then(EventTime::into_string),
            location: e.location,
            status: e.status,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

// -----------------------------------------------------------------------------
// Client
// -----------------------------------------------------------------------------

pub struct GoogleCalendar {
    client: reqwest::Client,
    oauth: GoogleOAuthConfig,
    store: Option<Store>,
    api_base: String,
    token_url: String,
}

impl GoogleCalendar {
    pub fn new(oauth: GoogleOAuthConfig, store: Option<Store>) -> Result<Self, CalendarError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            oauth,
            store,
            api_base: CALENDAR_API_BASE.to_string(),
            token_url: OAUTH_TOKEN_URL.to_string(),
        })
    }

    /// Point the client at other endpoints (used against local fakes).
    pub fn with_endpoints(mut self, api_base: impl Into<String>, token_url: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self.token_url = token_url.into();
        self
    }

    async fn list_events(
        &self,
        access_token: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, CalendarError> {
        let url = format!("{}/calendars/primary/events", self.api_base);
        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .query(&[
                ("timeMin", start.to_rfc3339()),
                ("timeMax", end.to_rfc3339()),
                ("singleEvents", "true".to_string()),
                ("orderBy", "startTime".to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CalendarError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let list: EventList = response.json().await?;
        Ok(list.items.into_iter().map(CalendarEvent::from).collect())
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<String, CalendarError> {
        let (Some(client_id), Some(client_secret)) =
            (&self.oauth.client_id, &self.oauth.client_secret)
        else {
            return Err(CalendarError::Refresh(
                "OAuth client id/secret not configured".to_string(),
            ));
        };

        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CalendarError::Refresh(format!("HTTP {}: {}", status.as_u16(), body)));
        }

        let token: TokenResponse = response.json().await?;
        Ok(token.access_token)
    }
}

#[async_trait]
impl CalendarProvider for GoogleCalendar {
    async fn events_for_day(
        &self,
        user: &User,
        date: NaiveDate,
    ) -> Result<Vec<CalendarEvent>, CalendarError> {
        let credentials = user
            .google_credentials
            .as_ref()
            .ok_or(CalendarError::NotLinked)?;
        let (start, end) = day_bounds(date);

        match self.list_events(&credentials.access_token, start, end).await {
            Err(CalendarError::Status { status: 401, .. }) if credentials.refresh_token.is_some() => {
                info!("Access token rejected for {}, refreshing", user.user_id);
                let refresh_token = credentials.refresh_token.as_deref().unwrap_or_default();
                let access_token = self.refresh_access_token(refresh_token).await?;

                if let Some(store) = &self.store {
                    if let Err(e) = store
                        .update_google_access_token(&user.user_id, &access_token)
                        .await
                    {
                        warn!("Failed to persist refreshed token for {}: {}", user.user_id, e);
                    }
                }

                self.list_events(&access_token, start, end).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::GoogleCredentials;
    use crate::testing::spawn_upstream;
    use axum::{
        extract::Query,
        http::{HeaderMap, StatusCode},
        response::IntoResponse,
        routing::{get, post},
        Json, Router,
    };
    use serde_json::json;
    use std::collections::HashMap;

    fn linked_user(access: &str, refresh: Option<&str>) -> User {
        let mut user = User::new("u1", "Mei");
        user.google_credentials = Some(GoogleCredentials {
            access_token: access.to_string(),
            refresh_token: refresh.map(str::to_string),
        });
        user
    }

    async fn events(headers: HeaderMap, Query(q): Query<HashMap<String, String>>) -> impl IntoResponse {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if auth != "Bearer fresh" {
            return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid" })));
        }
        assert_eq!(q.get("singleEvents").map(String::as_str), Some("true"));
        assert_eq!(q.get("orderBy").map(String::as_str), Some("startTime"));
        assert!(q.contains_key("timeMin") && q.contains_key("timeMax"));
        (
            StatusCode::OK,
            Json(json!({
                "items": [
                    { "id": "e1", "summary": "歯医者", "start": { "dateTime": "2024-05-01T10:00:00+09:00" }, "end": { "dateTime": "2024-05-01T11:00:00+09:00" } },
                    { "id": "e2", "summary": "誕生日", "start": { "date": "2024-05-01" }, "end": { "date": "2024-05-02" } }
                ]
            })),
        )
    }

    async fn token() -> Json<serde_json::Value> {
        Json(json!({ "access_token": "fresh", "expires_in": 3600 }))
    }

    async fn fake_google() -> String {
        let router = Router::new()
            .route("/calendars/primary/events", get(events))
            .route("/token", post(token));
        spawn_upstream(router).await
    }

    fn oauth() -> GoogleOAuthConfig {
        GoogleOAuthConfig {
            client_id: Some("id".into()),
            client_secret: Some("secret".into()),
        }
    }

    #[test]
    fn test_day_bounds_span_one_day() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let (start, end) = day_bounds(date);
        assert_eq!(end - start, Duration::days(1));
    }

    #[tokio::test]
    async fn test_events_for_day_maps_fields() {
        let base = fake_google().await;
        let calendar = GoogleCalendar::new(oauth(), None)
            .unwrap()
            .with_endpoints(base.clone(), format!("{}/token", base));

        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let events = calendar
            .events_for_day(&linked_user("fresh", None), date)
            .await
            .unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].summary.as_deref(), Some("歯医者"));
        assert_eq!(events[0].start.as_deref(), Some("2024-05-01T10:00:00+09:00"));
        assert_eq!(events[1].start.as_deref(), Some("2024-05-01"));
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_and_persisted() {
        let base = fake_google().await;
        let store = Store::in_memory().await.unwrap();
        let user = linked_user("stale", Some("refresh"));
        store.save_user(&user).await.unwrap();

        let calendar = GoogleCalendar::new(oauth(), Some(store.clone()))
            .unwrap()
            .with_endpoints(base.clone(), format!("{}/token", base));

        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let events = calendar.events_for_day(&user, date).await.unwrap();
        assert_eq!(events.len(), 2);

        let saved = store.find_user("u1").await.unwrap().unwrap();
        assert_eq!(saved.google_credentials.unwrap().access_token, "fresh");
    }

    #[tokio::test]
    async fn test_unauthorized_without_refresh_token() {
        let base = fake_google().await;
        let calendar = GoogleCalendar::new(oauth(), None)
            .unwrap()
            .with_endpoints(base.clone(), format!("{}/token", base));

        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let err = calendar
            .events_for_day(&linked_user("stale", None), date)
            .await
            .unwrap_err();
        assert!(matches!(err, CalendarError::Status { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_unlinked_user() {
        let calendar = GoogleCalendar::new(oauth(), None).unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let err = calendar
            .events_for_day(&User::new("u1", "Mei"), date)
            .await
            .unwrap_err();
        assert!(matches!(err, CalendarError::NotLinked));
    }
}
