use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::communication::{optional_object, required_string};
use super::AppState;
use crate::chat::new_message_id;
use crate::entity::UsageKind;
use crate::error::{ApiError, FieldError};
use crate::vision::{split_data_uri, VisionRequest, DEFAULT_PROMPT};

const DEFAULT_MAX_TOKENS: u32 = 1000;
const DEFAULT_TEMPERATURE: f64 = 0.7;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeBody {
    #[serde(default)]
    user_id: Option<Value>,
    #[serde(default)]
    image_data: Option<Value>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    options: Option<Value>,
}

impl AnalyzeBody {
    fn validate(self) -> Result<(String, VisionRequest), ApiError> {
        let mut errors = Vec::new();

        let user_id = required_string("userId", self.user_id, &mut errors);
        let image = required_string("imageData", self.image_data, &mut errors).and_then(|data| {
            let (mime, payload) = split_data_uri(&data);
            match STANDARD.decode(payload) {
                Ok(bytes) if !bytes.is_empty() => Some((mime.to_string(), bytes)),
                Ok(_) => {
                    errors.push(FieldError::new("imageData", "\"imageData\" is empty"));
                    None
                }
                Err(e) => {
                    errors.push(FieldError::new(
                        "imageData",
                        format!("\"imageData\" is not valid base64: {}", e),
                    ));
                    None
                }
            }
        });
        let options = optional_object("options", self.options, &mut errors);

        let (Some(user_id), Some((mime_type, image))) = (user_id, image) else {
            return Err(ApiError::Validation(errors));
        };
        if !errors.is_empty() {
            return Err(ApiError::Validation(errors));
        }

        let max_tokens = ["maxTokens", "max_tokens"]
            .iter()
            .find_map(|k| options.get(*k).and_then(Value::as_u64))
            .filter(|n| *n > 0)
            .map_or(DEFAULT_MAX_TOKENS, |n| n.min(u32::MAX as u64) as u32);
        let temperature = options
            .get("temperature")
            .and_then(Value::as_f64)
            .filter(|t| *t > 0.0)
            .unwrap_or(DEFAULT_TEMPERATURE);

        let request = VisionRequest {
            image,
            mime_type,
            prompt: self
                .prompt
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_PROMPT.to_string()),
            max_tokens,
            temperature,
        };
        Ok((user_id, request))
    }
}

pub(super) async fn analyze(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<AnalyzeBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = payload?;
    let (user_id, request) = body.validate()?;
    let started = Instant::now();

    let analysis = state.vision.analyze(&request).await.map_err(|e| {
        warn!("Image analysis failed for {}: {}", user_id, e);
        ApiError::upstream("Image analysis failed", e)
    })?;
    info!("Image analysis done for {} via {}", user_id, analysis.model);

    if let Err(e) = state.store.increment_usage(&user_id, UsageKind::Image, 1).await {
        warn!("Failed to record image usage for {}: {:#}", user_id, e);
    }

    Ok(Json(json!({
        "success": true,
        "messageId": new_message_id(),
        "result": {
            "description": analysis.description,
            "model": analysis.model,
        },
        "metadata": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "processingTime": started.elapsed().as_millis() as u64,
            "userId": user_id,
            "prompt": request.prompt,
        },
    })))
}

#[cfg(test)]
mod tests {
    use crate::entity::User;
    use crate::server::router;
    use crate::testing::{test_state_with_vision, FakeVision};
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde_json::{json, Value};

    fn image() -> String {
        format!("data:image/png;base64,{}", STANDARD.encode([0x89, b'P', b'N', b'G']))
    }

    #[tokio::test]
    async fn test_analyze_counts_image_usage() {
        let vision = FakeVision::describing("猫が寝ています。");
        let state = test_state_with_vision(vision.clone()).await;
        state.store.save_user(&User::new("u1", "Mei")).await.unwrap();
        let server = TestServer::new(router(state.clone())).unwrap();

        let response = server
            .post("/api/vision/analyze")
            .json(&json!({
                "userId": "u1",
                "imageData": image(),
                "options": { "maxTokens": 64 },
            }))
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["success"], true);
        assert_eq!(body["result"]["description"], "猫が寝ています。");
        assert_eq!(body["metadata"]["userId"], "u1");
        assert_eq!(body["metadata"]["prompt"], "この画像について説明してください。");
        assert!(body["messageId"].as_str().unwrap().starts_with("msg_"));

        let seen = vision.last_request().unwrap();
        assert_eq!(seen.mime_type, "image/png");
        assert_eq!(seen.image, vec![0x89, b'P', b'N', b'G']);
        assert_eq!(seen.max_tokens, 64);

        let user = state.store.find_user("u1").await.unwrap().unwrap();
        assert_eq!(user.usage.total_image_analyses, 1);
        assert_eq!(user.usage.monthly_image_analyses, 1);
    }

    #[tokio::test]
    async fn test_analyze_reports_every_missing_field() {
        let state = test_state_with_vision(FakeVision::describing("x")).await;
        let server = TestServer::new(router(state)).unwrap();

        let response = server.post("/api/vision/analyze").json(&json!({ "prompt": "?" })).await;
        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        let fields: Vec<_> = body["details"]
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["field"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(fields, ["userId", "imageData"]);

        let response = server
            .post("/api/vision/analyze")
            .json(&json!({ "userId": "u1", "imageData": "not base64!" }))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["details"][0]["field"], "imageData");
    }

    #[tokio::test]
    async fn test_analyze_upstream_failure() {
        let state = test_state_with_vision(FakeVision::failing()).await;
        state.store.save_user(&User::new("u1", "Mei")).await.unwrap();
        let server = TestServer::new(router(state.clone())).unwrap();

        let response = server
            .post("/api/vision/analyze")
            .json(&json!({ "userId": "u1", "imageData": image() }))
            .await;
        response.assert_status(StatusCode::BAD_GATEWAY);
        let body: Value = response.json();
        assert_eq!(body["error"], "Image analysis failed");

        let user = state.store.find_user("u1").await.unwrap().unwrap();
        assert_eq!(user.usage.total_image_analyses, 0);
    }
}
