//! Runtime configuration endpoints: `GET` / `PUT /api/v1/config`.
//!
//! Updates apply to realtime sessions opened afterwards; a running session
//! keeps the policy it started with.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

/// Apply a partial update such as `{"realtime": {"chunk_threshold": 3}}`.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    info!("Configuration updated at runtime: {}", json_str);

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": current_config
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::testing::state_with;
    use crate::transcription::backend::testing::FakeLoader;
    use crate::transcription::ModelIdentifier;
    use actix_web::{http::StatusCode, test, App};
    use std::sync::Arc;

    #[actix_web::test]
    async fn test_get_and_update_config() {
        let state = state_with(Arc::new(FakeLoader::new()), AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/api/v1/config", web::get().to(get_config))
                .route("/api/v1/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["models"]["default_model"], "medium");
        assert_eq!(body["config"]["realtime"]["chunk_threshold"], 2);

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"models": {"default_model": "small"}, "realtime": {"chunk_threshold": 4}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let policy = state.session_policy();
        assert_eq!(policy.default_model, ModelIdentifier::Small);
        assert_eq!(policy.chunk_threshold, 4);
    }

    #[actix_web::test]
    async fn test_invalid_update_is_rejected_and_not_applied() {
        let state = state_with(Arc::new(FakeLoader::new()), AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/api/v1/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"realtime": {"chunk_threshold": 0}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.session_policy().chunk_threshold, 2);
    }
}
