use actix_web::{web, HttpResponse, Responder};
use log::info;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::capture::manager::CaptureManager;
use crate::models::filter::FilterConditions;

/// Get the active display filter
pub async fn get_filters(
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
) -> impl Responder {
    let engine = capture_manager.read().await.engine();
    HttpResponse::Ok().json(engine.filters())
}

/// Replace the active display filter
pub async fn set_filters(
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
    req: web::Json<FilterConditions>,
) -> impl Responder {
    let engine = capture_manager.read().await.engine();
    engine.set_filters(req.into_inner());
    let matching = engine.visible_packets(Some(chrono::Utc::now().timestamp_millis())).len();
    info!("Display filter updated, {} packets match", matching);

    HttpResponse::Ok().json(serde_json::json!({
        "status": "success",
        "message": "Filter updated",
        "filters": engine.filters(),
        "matching": matching
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::facade::RuleEngine;
    use crate::engine::fixtures::captured;
    use crate::models::config::AppConfig;
    use crate::models::packet::{PacketFunction, Protocol};
    use actix_web::{test, App};

    #[actix_rt::test]
    async fn test_replace_and_read_filter() {
        let engine = Arc::new(RuleEngine::default());
        engine.ingest(captured(Protocol::Tcp, PacketFunction::Send, &[0u8; 10]));
        engine.ingest(captured(Protocol::Tcp, PacketFunction::Send, &[0u8; 100]));
        let manager = CaptureManager::new(AppConfig::default(), engine);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(Arc::new(RwLock::new(manager))))
                .route("/filters", web::get().to(get_filters))
                .route("/filters", web::put().to(set_filters)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/filters")
            .set_json(serde_json::json!({ "minSize": 50 }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["matching"], 1);

        let req = test::TestRequest::get().uri("/filters").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["minSize"], 50);
    }
}
