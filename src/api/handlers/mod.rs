pub mod capture;
pub mod filters;
pub mod packets;
pub mod rules;

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use log::{error, warn};
use serde_json::json;

use crate::capture::manager::CaptureManager;
use crate::utils::error::AppError;

/// Map a domain error to a JSON error response
pub fn error_response(err: &AppError) -> HttpResponse {
    let status = match err {
        AppError::RuleNotFound(_) | AppError::PacketNotFound(_) => StatusCode::NOT_FOUND,
        AppError::InvalidPattern(_) | AppError::InvalidRule(_) | AppError::JsonError(_) => {
            StatusCode::BAD_REQUEST
        }
        AppError::CaptureError(_) => StatusCode::CONFLICT,
        AppError::CaptureUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        AppError::ExportError(_) | AppError::IoError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        warn!("Request rejected: {}", err);
    }

    HttpResponse::build(status).json(json!({
        "status": "error",
        "message": err.to_string()
    }))
}

/// Save rule sets after a mutation; the mutation itself stands either way
fn persist_rules(manager: &CaptureManager) {
    if let Err(e) = manager.persist_rules() {
        error!("Failed to save rules: {}", e);
    }
}
