use actix_web::{web, HttpResponse, Responder};
use log::info;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{error_response, persist_rules};
use crate::capture::manager::CaptureManager;
use crate::models::rule::{PacketFeatureRule, ReplaceRule};

/// Body of the enable/disable endpoints
#[derive(Deserialize)]
pub struct EnabledRequest {
    enabled: bool,
}

/// List replace rules
pub async fn list_replace_rules(
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
) -> impl Responder {
    let engine = capture_manager.read().await.engine();
    HttpResponse::Ok().json(engine.replace_rules())
}

/// Create or update a replace rule
pub async fn set_replace_rule(
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
    req: web::Json<ReplaceRule>,
) -> impl Responder {
    let capture_manager = capture_manager.read().await;

    match capture_manager.engine().set_replace_rule(req.into_inner()) {
        Ok(rule) => {
            persist_rules(&capture_manager);
            HttpResponse::Ok().json(rule)
        }
        Err(e) => error_response(&e),
    }
}

/// Delete a replace rule
pub async fn remove_replace_rule(
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
    path: web::Path<String>,
) -> impl Responder {
    let id = path.into_inner();
    let capture_manager = capture_manager.read().await;

    match capture_manager.engine().remove_replace_rule(&id) {
        Ok(()) => {
            persist_rules(&capture_manager);
            HttpResponse::Ok().json(serde_json::json!({
                "status": "success",
                "message": format!("Replace rule {} removed", id)
            }))
        }
        Err(e) => error_response(&e),
    }
}

/// Enable or disable a replace rule
pub async fn enable_replace_rule(
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
    path: web::Path<String>,
    req: web::Json<EnabledRequest>,
) -> impl Responder {
    let capture_manager = capture_manager.read().await;

    match capture_manager.engine().enable_replace_rule(&path, req.enabled) {
        Ok(rule) => {
            persist_rules(&capture_manager);
            HttpResponse::Ok().json(rule)
        }
        Err(e) => error_response(&e),
    }
}

/// List feature rules
pub async fn list_feature_rules(
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
) -> impl Responder {
    let engine = capture_manager.read().await.engine();
    HttpResponse::Ok().json(engine.feature_rules())
}

/// Add a feature rule
pub async fn add_feature_rule(
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
    req: web::Json<PacketFeatureRule>,
) -> impl Responder {
    let capture_manager = capture_manager.read().await;

    match capture_manager.engine().add_feature_rule(req.into_inner()) {
        Ok(rule) => {
            persist_rules(&capture_manager);
            HttpResponse::Created().json(rule)
        }
        Err(e) => error_response(&e),
    }
}

/// Delete a feature rule
pub async fn remove_feature_rule(
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
    path: web::Path<String>,
) -> impl Responder {
    let id = path.into_inner();
    let capture_manager = capture_manager.read().await;

    match capture_manager.engine().remove_feature_rule(&id) {
        Ok(()) => {
            persist_rules(&capture_manager);
            HttpResponse::Ok().json(serde_json::json!({
                "status": "success",
                "message": format!("Feature rule {} removed", id)
            }))
        }
        Err(e) => error_response(&e),
    }
}

/// Enable or disable a feature rule
pub async fn enable_feature_rule(
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
    path: web::Path<String>,
    req: web::Json<EnabledRequest>,
) -> impl Responder {
    let capture_manager = capture_manager.read().await;

    match capture_manager.engine().set_feature_rule_enabled(&path, req.enabled) {
        Ok(rule) => {
            persist_rules(&capture_manager);
            HttpResponse::Ok().json(rule)
        }
        Err(e) => error_response(&e),
    }
}

/// Zero every feature rule's match counter
pub async fn reset_feature_counters(
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
) -> impl Responder {
    let capture_manager = capture_manager.read().await;
    capture_manager.engine().reset_feature_counters();
    persist_rules(&capture_manager);
    info!("Feature rule counters reset");

    HttpResponse::Ok().json(serde_json::json!({
        "status": "success",
        "message": "Feature rule counters reset"
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::facade::RuleEngine;
    use crate::engine::persist::RuleFile;
    use crate::models::config::AppConfig;
    use actix_web::{test, App};
    use std::path::PathBuf;

    fn state(rules_path: Option<PathBuf>) -> web::Data<Arc<RwLock<CaptureManager>>> {
        let config = AppConfig {
            rules_path,
            ..AppConfig::default()
        };
        let manager = CaptureManager::new(config, Arc::new(RuleEngine::default()));
        web::Data::new(Arc::new(RwLock::new(manager)))
    }

    #[actix_rt::test]
    async fn test_replace_rule_crud() {
        let dir = tempfile::tempdir().unwrap();
        let rules_path = dir.path().join("rules.json");
        let app = test::init_service(
            App::new()
                .app_data(state(Some(rules_path.clone())))
                .route("/replace", web::get().to(list_replace_rules))
                .route("/replace", web::post().to(set_replace_rule))
                .route("/replace/{id}", web::delete().to(remove_replace_rule))
                .route("/replace/{id}/enabled", web::post().to(enable_replace_rule)),
        )
        .await;

        let rule = serde_json::json!({
            "id": "r1",
            "name": "not found",
            "matchConditions": { "method": "GET" },
            "replacement": { "ops": [{ "op": "statusCode", "value": 404 }] },
            "applyTo": "all"
        });
        let req = test::TestRequest::post().uri("/replace").set_json(&rule).to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["id"], "r1");
        assert_eq!(RuleFile::load(&rules_path).unwrap().replace_rules.len(), 1);

        let req = test::TestRequest::post()
            .uri("/replace/r1/enabled")
            .set_json(serde_json::json!({ "enabled": false }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["enabled"], false);

        let req = test::TestRequest::delete().uri("/replace/r1").to_request();
        assert!(test::call_service(&app, req).await.status().is_success());
        let req = test::TestRequest::delete().uri("/replace/r1").to_request();
        assert_eq!(test::call_service(&app, req).await.status().as_u16(), 404);

        let req = test::TestRequest::get().uri("/replace").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert!(body.as_array().unwrap().is_empty());
        assert!(RuleFile::load(&rules_path).unwrap().replace_rules.is_empty());
    }

    #[actix_rt::test]
    async fn test_count_without_count_is_rejected() {
        let app = test::init_service(
            App::new()
                .app_data(state(None))
                .route("/replace", web::post().to(set_replace_rule)),
        )
        .await;

        let rule = serde_json::json!({
            "name": "broken",
            "replacement": { "ops": [{ "op": "statusCode", "value": 500 }] },
            "applyTo": "count"
        });
        let req = test::TestRequest::post().uri("/replace").set_json(&rule).to_request();
        assert_eq!(test::call_service(&app, req).await.status().as_u16(), 400);
    }

    #[actix_rt::test]
    async fn test_feature_rule_crud() {
        let app = test::init_service(
            App::new()
                .app_data(state(None))
                .route("/feature", web::get().to(list_feature_rules))
                .route("/feature", web::post().to(add_feature_rule))
                .route("/feature/reset", web::post().to(reset_feature_counters))
                .route("/feature/{id}", web::delete().to(remove_feature_rule))
                .route("/feature/{id}/enabled", web::post().to(enable_feature_rule)),
        )
        .await;

        let rule = serde_json::json!({ "type": "Send", "feature": "de ad ?? ef", "filter": true });
        let req = test::TestRequest::post().uri("/feature").set_json(&rule).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 201);
        let created: serde_json::Value = test::read_body_json(resp).await;
        let id = created["id"].as_str().unwrap().to_string();
        assert!(!id.is_empty());

        let req = test::TestRequest::post()
            .uri(&format!("/feature/{}/enabled", id))
            .set_json(serde_json::json!({ "enabled": false }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["enabled"], false);

        let req = test::TestRequest::post().uri("/feature/reset").to_request();
        assert!(test::call_service(&app, req).await.status().is_success());

        let req = test::TestRequest::delete().uri(&format!("/feature/{}", id)).to_request();
        assert!(test::call_service(&app, req).await.status().is_success());

        let req = test::TestRequest::post()
            .uri("/feature/missing/enabled")
            .set_json(serde_json::json!({ "enabled": true }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status().as_u16(), 404);
    }
}
