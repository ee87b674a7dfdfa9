use actix_web::{web, HttpResponse, Responder};
use log::info;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::error_response;
use crate::capture::manager::CaptureManager;
use crate::models::config::CaptureSettings;
use crate::models::packet::CapturedPacket;

/// Body of an ingest request: one packet or a batch
#[derive(Deserialize)]
#[serde(untagged)]
pub enum IngestRequest {
    Batch(Vec<CapturedPacket>),
    Single(Box<CapturedPacket>),
}

impl IngestRequest {
    fn into_packets(self) -> Vec<CapturedPacket> {
        match self {
            IngestRequest::Batch(packets) => packets,
            IngestRequest::Single(packet) => vec![*packet],
        }
    }
}

/// Start packet capture
pub async fn start_capture(
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
) -> impl Responder {
    let mut capture_manager = capture_manager.write().await;

    match capture_manager.start_capture().await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({
            "status": "success",
            "message": "Capture started",
            "capture": capture_manager.status_report()
        })),
        Err(e) => error_response(&e),
    }
}

/// Stop packet capture
pub async fn stop_capture(
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
) -> impl Responder {
    let mut capture_manager = capture_manager.write().await;

    match capture_manager.stop_capture().await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({
            "status": "success",
            "message": "Capture stopped",
            "capture": capture_manager.status_report()
        })),
        Err(e) => error_response(&e),
    }
}

/// Get capture status
pub async fn get_capture_status(
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
) -> impl Responder {
    let capture_manager = capture_manager.read().await;
    HttpResponse::Ok().json(capture_manager.status_report())
}

/// Push packets from an external hook into the running capture
pub async fn ingest_packets(
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
    req: web::Json<IngestRequest>,
) -> impl Responder {
    let packets = req.into_inner().into_packets();
    let submitted = packets.len();
    let capture_manager = capture_manager.read().await;

    match capture_manager.ingest_remote(packets).await {
        Ok(accepted) => HttpResponse::Accepted().json(serde_json::json!({
            "status": "success",
            "message": format!("Accepted {} of {} packets", accepted, submitted),
            "accepted": accepted
        })),
        Err(e) => error_response(&e),
    }
}

/// Get capture settings
pub async fn get_capture_settings(
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
) -> impl Responder {
    let capture_manager = capture_manager.read().await;
    HttpResponse::Ok().json(capture_manager.settings())
}

/// Update capture settings
pub async fn update_capture_settings(
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
    req: web::Json<CaptureSettings>,
) -> impl Responder {
    let mut capture_manager = capture_manager.write().await;
    capture_manager.update_settings(req.into_inner());
    info!("Capture settings updated");

    HttpResponse::Ok().json(serde_json::json!({
        "status": "success",
        "message": "Capture settings updated",
        "settings": capture_manager.settings()
    }))
}
