use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::AppState;
use crate::entity::{GoogleCredentials, PublicProfile, User};
use crate::error::ApiError;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertUserBody {
    display_name: Option<String>,
    google_credentials: Option<GoogleCredentials>,
    permissions: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct PermissionBody {
    permission: String,
    granted: bool,
}

pub(super) async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<PublicProfile>, ApiError> {
    let user = find(&state, &user_id).await?;
    Ok(Json(user.public_profile()))
}

pub(super) async fn upsert_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    payload: Result<Json<UpsertUserBody>, JsonRejection>,
) -> Result<Json<PublicProfile>, ApiError> {
    let Json(body) = payload?;

    let existing = state
        .store
        .find_user(&user_id)
        .await
        .map_err(|e| ApiError::internal("User lookup failed", format!("{:#}", e)))?;
    let created = existing.is_none();
    let mut user = existing.unwrap_or_else(|| User::new(&user_id, &user_id));

    if let Some(name) = body.display_name.filter(|n| !n.trim().is_empty()) {
        user.display_name = name;
    }
    if let Some(credentials) = body.google_credentials {
        user.google_credentials = Some(credentials);
    }
    if let Some(permissions) = body.permissions {
        user.permissions.clear();
        for permission in permissions {
            user.grant_permission(&permission);
        }
    }
    user.updated_at = chrono::Utc::now();

    state
        .store
        .save_user(&user)
        .await
        .map_err(|e| ApiError::internal("User update failed", format!("{:#}", e)))?;
    info!("{} user {}", if created { "Created" } else { "Updated" }, user_id);

    Ok(Json(user.public_profile()))
}

pub(super) async fn set_permission(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    payload: Result<Json<PermissionBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = payload?;
    if body.permission.trim().is_empty() {
        return Err(ApiError::field("permission", "\"permission\" is not allowed to be empty"));
    }

    let mut user = find(&state, &user_id).await?;
    if body.granted {
        user.grant_permission(&body.permission);
    } else {
        user.revoke_permission(&body.permission);
    }
    user.updated_at = chrono::Utc::now();

    state
        .store
        .save_user(&user)
        .await
        .map_err(|e| ApiError::internal("User update failed", format!("{:#}", e)))?;
    info!(
        "Permission {} {} for {}",
        body.permission,
        if body.granted { "granted" } else { "revoked" },
        user_id
    );

    Ok(Json(json!({
        "success": true,
        "permissions": user.permissions,
    })))
}

async fn find(state: &AppState, user_id: &str) -> Result<User, ApiError> {
    state
        .store
        .find_user(user_id)
        .await
        .map_err(|e| ApiError::internal("User lookup failed", format!("{:#}", e)))?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))
}

#[cfg(test)]
mod tests {
    use crate::entity::CALENDAR_READ;
    use crate::server::router;
    use crate::testing::{test_state, FakeCalendar, FakeLlm};
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use serde_json::{json, Value};

    async fn server() -> TestServer {
        let state = test_state(FakeLlm::replying("hi"), FakeCalendar::with_events(0), Vec::new()).await;
        TestServer::new(router(state)).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_user_is_not_found() {
        let server = server().await;
        let response = server.get("/api/users/nobody").await;
        response.assert_status(StatusCode::NOT_FOUND);
        let body: Value = response.json();
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_upsert_hides_tokens() {
        let server = server().await;

        let response = server
            .put("/api/users/u1")
            .json(&json!({
                "displayName": "Mei",
                "googleCredentials": { "accessToken": "secret", "refreshToken": "r" },
                "permissions": [CALENDAR_READ],
            }))
            .await;
        response.assert_status_ok();

        let body: Value = server.get("/api/users/u1").await.json();
        assert_eq!(body["userId"], "u1");
        assert_eq!(body["displayName"], "Mei");
        assert_eq!(body["googleLinked"], true);
        assert_eq!(body["permissions"], json!([CALENDAR_READ]));
        assert!(!body.to_string().contains("secret"));
    }

    #[tokio::test]
    async fn test_upsert_keeps_unspecified_fields() {
        let server = server().await;
        server
            .put("/api/users/u1")
            .json(&json!({ "displayName": "Mei", "permissions": ["a"] }))
            .await
            .assert_status_ok();

        let body: Value = server
            .put("/api/users/u1")
            .json(&json!({ "displayName": "Mei Chan" }))
            .await
            .json();
        assert_eq!(body["displayName"], "Mei Chan");
        assert_eq!(body["permissions"], json!(["a"]));
        assert_eq!(body["googleLinked"], false);
    }

    #[tokio::test]
    async fn test_grant_and_revoke_permission() {
        let server = server().await;
        server.put("/api/users/u1").json(&json!({})).await.assert_status_ok();

        let body: Value = server
            .post("/api/users/u1/permissions")
            .json(&json!({ "permission": CALENDAR_READ, "granted": true }))
            .await
            .json();
        assert_eq!(body["permissions"], json!([CALENDAR_READ]));

        let body: Value = server
            .post("/api/users/u1/permissions")
            .json(&json!({ "permission": CALENDAR_READ, "granted": false }))
            .await
            .json();
        assert_eq!(body["permissions"], json!([]));

        server
            .post("/api/users/ghost/permissions")
            .json(&json!({ "permission": CALENDAR_READ, "granted": true }))
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}
