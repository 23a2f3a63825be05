use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Model readiness for the front end to poll while the model loads.
///
/// ## Endpoint: `GET /status`
///
/// ## Response:
/// ```json
/// {
///   "model_loaded": false,
///   "device": "cuda:0",
///   "state": "loading",
///   "error": null
/// }
/// ```
pub async fn get_status(state: web::Data<AppState>) -> HttpResponse {
    let status = state.model.status();

    HttpResponse::Ok().json(json!({
        "model_loaded": status.is_ready(),
        "device": status.device,
        "state": status.state,
        "error": status.error
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::transcription::testing::ready_manager;
    use crate::transcription::ModelManager;
    use actix_web::{test, App};
    use candle_core::Device;
    use std::sync::Arc;

    async fn status_of(manager: Arc<ModelManager>) -> serde_json::Value {
        let state = AppState::new(AppConfig::default(), manager);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/status", web::get().to(get_status)),
        )
        .await;
        let req = test::TestRequest::get().uri("/status").to_request();
        test::call_and_read_body_json(&app, req).await
    }

    #[actix_web::test]
    async fn test_status_before_load() {
        let body = status_of(Arc::new(ModelManager::new(Device::Cpu))).await;
        assert_eq!(body["model_loaded"], false);
        assert_eq!(body["device"], "cpu");
        assert_eq!(body["state"], "unloaded");
        assert!(body["error"].is_null());
    }

    #[actix_web::test]
    async fn test_status_after_load() {
        let body = status_of(ready_manager().await).await;
        assert_eq!(body["model_loaded"], true);
        assert_eq!(body["state"], "ready");
    }
}
