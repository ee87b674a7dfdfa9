use actix_web::{web, HttpResponse, Responder};
use chrono::Utc;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::error_response;
use crate::capture::manager::CaptureManager;
use crate::engine::export::{export_packets as write_export, ExportFormat};
use crate::models::filter::FilterConditions;
use crate::models::packet::{Packet, PacketEdit, PacketSummary};

/// Query parameters for listing packets
#[derive(Deserialize)]
pub struct PacketsQuery {
    /// Offset for pagination
    #[serde(default = "default_offset")]
    offset: usize,

    /// Limit for pagination
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_offset() -> usize { 0 }
fn default_limit() -> usize { 100 }

/// Export request body
#[derive(Deserialize)]
pub struct ExportRequest {
    format: ExportFormat,

    /// Packets to export; every retained packet when absent
    #[serde(default)]
    ids: Option<Vec<u64>>,

    /// Target file; a kept temp file when absent
    #[serde(default)]
    path: Option<PathBuf>,
}

/// Response for listing packets
#[derive(Serialize)]
struct PacketsResponse {
    packets: Vec<PacketSummary>,
    total: usize,
    offset: usize,
    limit: usize,
}

fn page(packets: Vec<Packet>, query: &PacketsQuery) -> PacketsResponse {
    let total = packets.len();
    let packets = packets
        .iter()
        .skip(query.offset)
        .take(query.limit)
        .map(Packet::summary)
        .collect();
    PacketsResponse {
        packets,
        total,
        offset: query.offset,
        limit: query.limit,
    }
}

fn now_ms() -> Option<i64> {
    Some(Utc::now().timestamp_millis())
}

/// Get retained packets passing the active filter
pub async fn get_packets(
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
    query: web::Query<PacketsQuery>,
) -> impl Responder {
    let engine = capture_manager.read().await.engine();
    let response = page(engine.visible_packets(now_ms()), &query);

    info!(
        "Retrieved {} packets (offset: {}, limit: {}, matching: {})",
        response.packets.len(),
        query.offset,
        query.limit,
        response.total
    );

    HttpResponse::Ok().json(response)
}

/// Get retained packets passing an explicit set of conditions
pub async fn query_packets(
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
    query: web::Query<PacketsQuery>,
    conditions: web::Json<FilterConditions>,
) -> impl Responder {
    let engine = capture_manager.read().await.engine();
    let packets = engine.packets(&conditions, now_ms());
    HttpResponse::Ok().json(page(packets, &query))
}

/// Drop every retained packet
pub async fn clear_packets(
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
) -> impl Responder {
    let removed = capture_manager.read().await.clear_packets();

    HttpResponse::Ok().json(serde_json::json!({
        "status": "success",
        "message": format!("Cleared {} packets", removed),
        "removed": removed
    }))
}

/// Get the number of retained packets
pub async fn get_packet_count(
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
) -> impl Responder {
    let count = capture_manager.read().await.engine().packet_count();
    HttpResponse::Ok().json(serde_json::json!({ "count": count }))
}

/// Get packet statistics
pub async fn get_packet_stats(
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
) -> impl Responder {
    let engine = capture_manager.read().await.engine();
    HttpResponse::Ok().json(engine.statistics(now_ms()))
}

/// Get a specific packet with its parsed fields
pub async fn get_packet(
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
    path: web::Path<u64>,
) -> impl Responder {
    let engine = capture_manager.read().await.engine();

    match engine.packet_detail(path.into_inner()) {
        Ok(detail) => HttpResponse::Ok().json(detail.as_ref()),
        Err(e) => error_response(&e),
    }
}

/// Apply user edits to a retained packet
pub async fn edit_packet(
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
    path: web::Path<u64>,
    edits: web::Json<Vec<PacketEdit>>,
) -> impl Responder {
    let engine = capture_manager.read().await.engine();

    match engine.edit_packet(path.into_inner(), &edits) {
        Ok(packet) => HttpResponse::Ok().json(packet),
        Err(e) => error_response(&e),
    }
}

/// Export retained packets to a file
pub async fn export_packets(
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
    req: web::Json<ExportRequest>,
) -> impl Responder {
    let req = req.into_inner();
    let engine = capture_manager.read().await.engine();
    let packets = engine.select(req.ids.as_deref());

    match write_export(&packets, req.format, req.path.as_deref()) {
        Ok(path) => HttpResponse::Ok().json(serde_json::json!({
            "status": "success",
            "message": format!("Exported {} packets", packets.len()),
            "path": path,
            "count": packets.len()
        })),
        Err(e) => error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::facade::RuleEngine;
    use crate::engine::fixtures::captured;
    use crate::models::config::AppConfig;
    use crate::models::packet::{PacketFunction, Protocol};
    use actix_web::{test, App};

    fn state() -> web::Data<Arc<RwLock<CaptureManager>>> {
        let engine = Arc::new(RuleEngine::default());
        engine.ingest(captured(Protocol::Tcp, PacketFunction::Send, b"alpha"));
        engine.ingest(captured(Protocol::Udp, PacketFunction::SendTo, b"beta"));
        engine.ingest(captured(Protocol::Tcp, PacketFunction::Recv, b"gamma"));
        let manager = CaptureManager::new(AppConfig::default(), engine);
        web::Data::new(Arc::new(RwLock::new(manager)))
    }

    #[actix_rt::test]
    async fn test_list_with_paging() {
        let app = test::init_service(
            App::new()
                .app_data(state())
                .route("/packets", web::get().to(get_packets)),
        )
        .await;

        let req = test::TestRequest::get().uri("/packets?offset=1&limit=1").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["total"], 3);
        assert_eq!(body["packets"].as_array().unwrap().len(), 1);
        assert_eq!(body["packets"][0]["id"], 2);
    }

    #[actix_rt::test]
    async fn test_query_by_protocol() {
        let app = test::init_service(
            App::new()
                .app_data(state())
                .route("/query", web::post().to(query_packets)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/query")
            .set_json(serde_json::json!({ "protocols": ["UDP"] }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["packets"][0]["id"], 2);
    }

    #[actix_rt::test]
    async fn test_detail_edit_and_missing() {
        let app = test::init_service(
            App::new()
                .app_data(state())
                .route("/packets/{id}", web::get().to(get_packet))
                .route("/packets/{id}", web::patch().to(edit_packet)),
        )
        .await;

        let req = test::TestRequest::get().uri("/packets/1").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["id"], 1);
        assert!(body.get("parsedData").is_some());

        let req = test::TestRequest::patch()
            .uri("/packets/1")
            .set_json(serde_json::json!([{ "op": "processName", "value": "other.exe" }]))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["processName"], "other.exe");

        let req = test::TestRequest::get().uri("/packets/99").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 404);
    }

    #[actix_rt::test]
    async fn test_clear_and_count() {
        let app = test::init_service(
            App::new()
                .app_data(state())
                .route("/packets", web::delete().to(clear_packets))
                .route("/count", web::get().to(get_packet_count)),
        )
        .await;

        let req = test::TestRequest::get().uri("/count").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], 3);

        let req = test::TestRequest::delete().uri("/packets").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["removed"], 3);

        let req = test::TestRequest::get().uri("/count").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], 0);
    }

    #[actix_rt::test]
    async fn test_export_selected_packets() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.json");
        let app = test::init_service(
            App::new()
                .app_data(state())
                .route("/export", web::post().to(export_packets)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/export")
            .set_json(serde_json::json!({ "format": "json", "ids": [1, 3], "path": target }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], 2);

        let written: Vec<Packet> =
            serde_json::from_str(&std::fs::read_to_string(&target).unwrap()).unwrap();
        assert_eq!(written.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1, 3]);
    }
}
