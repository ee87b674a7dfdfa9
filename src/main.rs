mod api;
mod capture;
mod engine;
mod models;
mod utils;

use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::api::routes;
use crate::capture::manager::CaptureManager;
use crate::engine::facade::RuleEngine;
use crate::engine::persist::RuleFile;
use crate::engine::store::RetentionPolicy;
use crate::models::config::{AppConfig, AppSettings, SourceKind};
use crate::utils::logging;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Packet interception and rewrite rule engine with REST API")]
struct Args {
    /// Port for the REST API server
    #[clap(short, long, default_value = "3000")]
    port: u16,

    /// Log level (trace, debug, info, warn, error, off); overrides the settings file
    #[clap(long)]
    log_level: Option<String>,

    /// Maximum number of retained packets
    #[clap(long)]
    max_packets: Option<usize>,

    /// Maximum retained payload bytes
    #[clap(long)]
    buffer_size: Option<usize>,

    /// Capture source feeding the engine
    #[clap(long, value_enum, default_value = "simulated")]
    source: SourceKind,

    /// JSON settings file
    #[clap(long)]
    settings: Option<PathBuf>,

    /// JSON rule file, loaded at start and rewritten on every rule change
    #[clap(long)]
    rules: Option<PathBuf>,
}

#[actix_web::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    let mut settings = match &args.settings {
        Some(path) => AppSettings::load(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?,
        None => AppSettings::default(),
    };
    if let Some(level) = args.log_level {
        settings.advanced.log_level = level;
    }
    if let Some(max_packets) = args.max_packets {
        settings.capture.max_packets = max_packets;
    }
    if let Some(buffer_size) = args.buffer_size {
        settings.capture.buffer_size = buffer_size;
    }

    // Initialize logger with specified level
    logging::init_logger(logging::get_log_level(&settings.advanced.log_level));

    info!("Starting hookshark v{}", env!("CARGO_PKG_VERSION"));

    let rules = match &args.rules {
        Some(path) => RuleFile::load(path)
            .with_context(|| format!("failed to read rules from {}", path.display()))?,
        None => {
            warn!("No rule file given, rule changes will not be saved");
            RuleFile::default()
        }
    };

    let engine = RuleEngine::with_rules(RetentionPolicy::from(&settings.capture), rules)?;

    // Create application config
    let config = AppConfig {
        port: args.port,
        source: args.source,
        settings,
        rules_path: args.rules,
    };

    let mut capture_manager = CaptureManager::new(config.clone(), Arc::new(engine));
    capture_manager.start_cleanup();
    let capture_manager = Arc::new(RwLock::new(capture_manager));

    // Create a shared state for our application
    let app_state = web::Data::new(capture_manager);

    info!(
        "Starting hookshark API server on port {} with {:?} source",
        config.port, config.source
    );

    // Start the HTTP server
    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .configure(routes::configure)
    })
    .bind(format!("127.0.0.1:{}", config.port))?
    .run()
    .await?;

    Ok(())
}
