use actix_web::{web, Error, HttpRequest, Responder};
use actix_ws::{self, Message};
use futures_util::StreamExt;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::time::interval;

use crate::capture::manager::{CaptureManager, CaptureStatusReport, EngineEvent};
use crate::models::stats::EngineStatistics;

// How often heartbeat pings are sent
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

// How often statistics are pushed
const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// WebSocket message types that can be sent to clients
#[derive(Serialize)]
#[serde(tag = "type")]
enum WsOutMessage<'a> {
    #[serde(rename = "stats")]
    Stats { stats: EngineStatistics },

    #[serde(rename = "status")]
    Status { capture: CaptureStatusReport },

    #[serde(rename = "event")]
    Event { event: &'a EngineEvent },

    #[serde(rename = "ping")]
    Ping { timestamp: i64 },
}

async fn send(session: &mut actix_ws::Session, msg: &WsOutMessage<'_>) -> Result<(), actix_ws::Closed> {
    if let Ok(json) = serde_json::to_string(msg) {
        session.text(json).await?;
    }
    Ok(())
}

/// Handle WebSocket connections
pub async fn ws_index(
    req: HttpRequest,
    body: web::Payload,
    capture_manager: web::Data<Arc<RwLock<CaptureManager>>>,
) -> Result<impl Responder, Error> {
    let addr = req
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    info!("WebSocket connection from: {}", addr);

    let (response, session, mut msg_stream) = actix_ws::handle(&req, body)?;
    let cm = capture_manager.into_inner();

    actix_web::rt::spawn(async move {
        let mut events = cm.read().await.subscribe();
        let last_pong = Arc::new(AtomicI64::new(chrono::Utc::now().timestamp()));

        let mut initial = session.clone();
        if let Err(e) = send_status(&mut initial, &cm).await {
            warn!("Failed to send initial status: {}", e);
            return;
        }
        if let Err(e) = send_stats(&mut initial, &cm).await {
            warn!("Failed to send initial stats: {}", e);
            return;
        }

        // Client messages: pings, pongs and text commands
        let ws_msg_task = {
            let mut session = session.clone();
            let cm = cm.clone();
            let last_pong = last_pong.clone();

            async move {
                while let Some(Ok(msg)) = msg_stream.next().await {
                    match msg {
                        Message::Ping(bytes) => {
                            last_pong.store(chrono::Utc::now().timestamp(), Ordering::SeqCst);
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Pong(_) => {
                            last_pong.store(chrono::Utc::now().timestamp(), Ordering::SeqCst);
                        }
                        Message::Text(text) => {
                            debug!("Received text message: {}", text);
                            let sent = match text.trim() {
                                "status" => send_status(&mut session, &cm).await,
                                "stats" => send_stats(&mut session, &cm).await,
                                _ => Ok(()),
                            };
                            if sent.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => {
                            info!("Client requested close");
                            break;
                        }
                        _ => {}
                    }
                }
            }
        };

        // Engine events as they happen
        let events_task = {
            let mut session = session.clone();

            async move {
                loop {
                    match events.recv().await {
                        Ok(event) => {
                            if send(&mut session, &WsOutMessage::Event { event: &event }).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!("WebSocket client lagging, skipped {} events", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        };

        // Statistics once per interval
        let stats_task = {
            let mut session = session.clone();
            let cm = cm.clone();

            async move {
                let mut ticker = interval(STATS_INTERVAL);
                loop {
                    ticker.tick().await;
                    if send_stats(&mut session, &cm).await.is_err() {
                        break;
                    }
                }
            }
        };

        let heartbeat_task = {
            let mut session = session.clone();

            async move {
                let mut heartbeat = interval(HEARTBEAT_INTERVAL);
                loop {
                    heartbeat.tick().await;

                    let now = chrono::Utc::now().timestamp();
                    let last = last_pong.load(Ordering::SeqCst);
                    if now - last > HEARTBEAT_INTERVAL.as_secs() as i64 * 3 {
                        warn!("WebSocket client heartbeat timed out");
                        let _ = session.close(None).await;
                        break;
                    }

                    if session.ping(b"").await.is_err() {
                        break;
                    }
                    if send(&mut session, &WsOutMessage::Ping { timestamp: now }).await.is_err() {
                        break;
                    }
                }
            }
        };

        tokio::select! {
            _ = ws_msg_task => {},
            _ = events_task => {},
            _ = stats_task => {},
            _ = heartbeat_task => {},
        }

        info!("WebSocket connection from {} closed", addr);
    });

    Ok(response)
}

/// Send current status to WebSocket client
async fn send_status(
    session: &mut actix_ws::Session,
    cm: &Arc<RwLock<CaptureManager>>,
) -> Result<(), actix_ws::Closed> {
    let capture = cm.read().await.status_report();
    send(session, &WsOutMessage::Status { capture }).await
}

/// Send current statistics to WebSocket client
async fn send_stats(
    session: &mut actix_ws::Session,
    cm: &Arc<RwLock<CaptureManager>>,
) -> Result<(), actix_ws::Closed> {
    let engine = cm.read().await.engine();
    let stats = engine.statistics(Some(chrono::Utc::now().timestamp_millis()));
    send(session, &WsOutMessage::Stats { stats }).await
}
