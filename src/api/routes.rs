use actix_web::{web, HttpResponse, Responder};
use serde_json::json;
use crate::api::handlers::{
    capture::{
        start_capture,
        stop_capture,
        get_capture_status,
        ingest_packets,
        get_capture_settings,
        update_capture_settings,
    },
    filters::{
        get_filters,
        set_filters,
    },
    packets::{
        get_packets,
        query_packets,
        clear_packets,
        get_packet_count,
        get_packet_stats,
        get_packet,
        edit_packet,
        export_packets,
    },
    rules::{
        list_replace_rules,
        set_replace_rule,
        remove_replace_rule,
        enable_replace_rule,
        list_feature_rules,
        add_feature_rule,
        remove_feature_rule,
        enable_feature_rule,
        reset_feature_counters,
    },
};
use crate::api::websocket::ws_index;

/// Root endpoint to provide information about the API
async fn index() -> impl Responder {
    HttpResponse::Ok().json(json!({
        "name": "hookshark API",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Packet interception and rewrite rule engine with REST API",
        "endpoints": [
            { "path": "/api/capture/start", "method": "POST", "description": "Start packet capture" },
            { "path": "/api/capture/stop", "method": "POST", "description": "Stop packet capture" },
            { "path": "/api/capture/status", "method": "GET", "description": "Get status of the capture" },
            { "path": "/api/capture/ingest", "method": "POST", "description": "Push one or many captured packets" },
            { "path": "/api/capture/settings", "method": "GET", "description": "Get capture settings" },
            { "path": "/api/capture/settings", "method": "POST", "description": "Update capture settings" },
            { "path": "/api/packets", "method": "GET", "description": "List packets passing the active filter" },
            { "path": "/api/packets", "method": "DELETE", "description": "Clear retained packets" },
            { "path": "/api/packets/query", "method": "POST", "description": "List packets passing the given filter" },
            { "path": "/api/packets/count", "method": "GET", "description": "Number of retained packets" },
            { "path": "/api/packets/stats", "method": "GET", "description": "Get packet statistics" },
            { "path": "/api/packets/export", "method": "POST", "description": "Export packets as json, csv, har or pcap" },
            { "path": "/api/packets/{id}", "method": "GET", "description": "Get details of a specific packet" },
            { "path": "/api/packets/{id}", "method": "PATCH", "description": "Edit a retained packet" },
            { "path": "/api/filters", "method": "GET", "description": "Get the active display filter" },
            { "path": "/api/filters", "method": "PUT", "description": "Replace the active display filter" },
            { "path": "/api/rules/replace", "method": "GET", "description": "List replace rules" },
            { "path": "/api/rules/replace", "method": "POST", "description": "Create or update a replace rule" },
            { "path": "/api/rules/replace/{id}", "method": "DELETE", "description": "Delete a replace rule" },
            { "path": "/api/rules/replace/{id}/enabled", "method": "POST", "description": "Enable or disable a replace rule" },
            { "path": "/api/rules/feature", "method": "GET", "description": "List feature rules" },
            { "path": "/api/rules/feature", "method": "POST", "description": "Add a feature rule" },
            { "path": "/api/rules/feature/reset", "method": "POST", "description": "Reset feature rule match counters" },
            { "path": "/api/rules/feature/{id}", "method": "DELETE", "description": "Delete a feature rule" },
            { "path": "/api/rules/feature/{id}/enabled", "method": "POST", "description": "Enable or disable a feature rule" },
            { "path": "/api/ws", "method": "GET", "description": "WebSocket endpoint for real-time updates" }
        ]
    }))
}

/// Configure API routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg
        // Root endpoint
        .route("/", web::get().to(index))
        .service(
            web::scope("/api")
                // WebSocket route for real-time updates
                .route("/ws", web::get().to(ws_index))

                // Capture management
                .service(
                    web::scope("/capture")
                        .route("/start", web::post().to(start_capture))
                        .route("/stop", web::post().to(stop_capture))
                        .route("/status", web::get().to(get_capture_status))
                        .route("/ingest", web::post().to(ingest_packets))
                        .route("/settings", web::get().to(get_capture_settings))
                        .route("/settings", web::post().to(update_capture_settings))
                )
                // Packet data; fixed paths before /{id}
                .service(
                    web::scope("/packets")
                        .route("", web::get().to(get_packets))
                        .route("", web::delete().to(clear_packets))
                        .route("/query", web::post().to(query_packets))
                        .route("/count", web::get().to(get_packet_count))
                        .route("/stats", web::get().to(get_packet_stats))
                        .route("/export", web::post().to(export_packets))
                        .route("/{id}", web::get().to(get_packet))
                        .route("/{id}", web::patch().to(edit_packet))
                )
                .service(
                    web::scope("/filters")
                        .route("", web::get().to(get_filters))
                        .route("", web::put().to(set_filters))
                )
                // Rule sets
                .service(
                    web::scope("/rules")
                        .route("/replace", web::get().to(list_replace_rules))
                        .route("/replace", web::post().to(set_replace_rule))
                        .route("/replace/{id}", web::delete().to(remove_replace_rule))
                        .route("/replace/{id}/enabled", web::post().to(enable_replace_rule))
                        .route("/feature", web::get().to(list_feature_rules))
                        .route("/feature", web::post().to(add_feature_rule))
                        .route("/feature/reset", web::post().to(reset_feature_counters))
                        .route("/feature/{id}", web::delete().to(remove_feature_rule))
                        .route("/feature/{id}/enabled", web::post().to(enable_feature_rule))
                )
        );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::manager::CaptureManager;
    use crate::engine::facade::RuleEngine;
    use crate::models::config::AppConfig;
    use actix_web::{test, App};
    use std::sync::Arc;
    use tokio::sync::RwLock;

    #[actix_rt::test]
    async fn test_routes_resolve() {
        let manager = CaptureManager::new(AppConfig::default(), Arc::new(RuleEngine::default()));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(Arc::new(RwLock::new(manager))))
                .configure(configure),
        )
        .await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(body["name"], "hookshark API");

        for uri in ["/api/packets/stats", "/api/packets/count", "/api/filters", "/api/rules/feature"] {
            let resp = test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
            assert!(resp.status().is_success(), "{}", uri);
        }

        let req = test::TestRequest::post().uri("/api/rules/feature/reset").to_request();
        assert!(test::call_service(&app, req).await.status().is_success());
    }
}
