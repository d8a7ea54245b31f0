//! # Model Status API
//!
//! `GET /api/v1/models` lists every model a client may request together with
//! its state in the process-wide cache.
//!
//! ## Response:
//! ```json
//! {
//!   "default_model": "medium",
//!   "models": [
//!     {"id": "small", "repo": "openai/whisper-small", "size_mb": 244,
//!      "description": "...", "status": "not_loaded"}
//!   ]
//! }
//! ```

use crate::{error::AppError, state::AppState};
use crate::transcription::{ModelIdentifier, ModelStatus};
use actix_web::{web, HttpResponse};
use serde::Serialize;
use serde_json::json;

/// One entry of the model list.
#[derive(Debug, Serialize)]
pub struct ModelInfoResponse {
    pub id: ModelIdentifier,
    pub repo: &'static str,
    pub size_mb: u32,
    pub description: &'static str,
    /// Flattened so the cache status reads `"status": "loaded", "loaded_at": ...`
    #[serde(flatten)]
    pub status: ModelStatus,
}

pub async fn list_models(app_state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let models: Vec<ModelInfoResponse> = app_state
        .engine
        .cache()
        .statuses()
        .into_iter()
        .map(|(id, status)| ModelInfoResponse {
            id,
            repo: id.repo_name(),
            size_mb: id.size_mb(),
            description: id.description(),
            status,
        })
        .collect();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "default_model": app_state.get_config().models.default_model,
        "device": app_state.device,
        "models": models
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::testing::state_with;
    use crate::transcription::backend::testing::FakeLoader;
    use actix_web::{test, App};
    use std::sync::Arc;

    #[actix_web::test]
    async fn test_list_models_reports_cache_status() {
        let loader = Arc::new(FakeLoader::new());
        let state = state_with(loader, AppConfig::default());
        state
            .engine
            .cache()
            .acquire(ModelIdentifier::Small)
            .await
            .unwrap();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/api/v1/models", web::get().to(list_models)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/models").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["default_model"], "medium");
        let models = body["models"].as_array().unwrap();
        assert_eq!(models.len(), 3);

        let small = models.iter().find(|m| m["id"] == "small").unwrap();
        assert_eq!(small["status"], "loaded");
        assert_eq!(small["repo"], "openai/whisper-small");

        let turbo = models.iter().find(|m| m["id"] == "turbo").unwrap();
        assert_eq!(turbo["status"], "not_loaded");
    }
}
