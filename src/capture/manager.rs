use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::capture::source::{CaptureSource, RemoteFeed, SimulatedSource};
use crate::engine::facade::{IngestOutcome, RuleEngine};
use crate::engine::store::RetentionPolicy;
use crate::models::config::{AppConfig, CaptureSettings, SourceKind};
use crate::models::packet::{CapturedPacket, PacketSummary};
use crate::models::stats::CaptureStatus;
use crate::utils::error::{AppError, AppResult};

/// Capacity of the source -> ingestion channel
const PACKET_CHANNEL_CAPACITY: usize = 1024;

/// Capacity of the live event channel
const EVENT_CHANNEL_CAPACITY: usize = 512;

/// Live notifications pushed to websocket clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    /// A packet was retained
    Packet { packet: PacketSummary },

    /// A feature filter rule dropped a packet
    Dropped {
        id: u64,
        #[serde(rename = "firedRules")]
        fired_rules: Vec<String>,
    },

    /// Retention pushed packets out of the buffer
    Evicted { ids: Vec<u64> },

    /// Capture lifecycle changed
    Status { status: CaptureStatus },

    /// The packet buffer was cleared
    Cleared { removed: usize },
}

/// Capture status as reported by the API
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStatusReport {
    pub status: CaptureStatus,
    pub source: Option<&'static str>,
    pub started_at: Option<DateTime<Utc>>,
    pub packet_count: usize,
}

/// Drives a capture source into the rule engine
pub struct CaptureManager {
    /// Application configuration
    config: AppConfig,

    /// Rule sets, packet buffer and counters
    engine: Arc<RuleEngine>,

    /// Collaborator delivering packets, if any
    source: Option<Arc<dyn CaptureSource>>,

    /// Set when the source accepts pushed packets
    feed: Option<Arc<RemoteFeed>>,

    status: CaptureStatus,

    started_at: Option<DateTime<Utc>>,

    /// Flipped to true to stop the source and ingestion task
    stop_tx: Option<watch::Sender<bool>>,

    source_task: Option<JoinHandle<()>>,

    ingest_task: Option<JoinHandle<()>>,

    /// Periodic retention pass
    cleanup_task: Option<JoinHandle<()>>,

    events: broadcast::Sender<EngineEvent>,
}

impl CaptureManager {
    /// Create a manager with the source named in `config`
    pub fn new(config: AppConfig, engine: Arc<RuleEngine>) -> Self {
        match config.source {
            SourceKind::Simulated => {
                let source: Arc<dyn CaptureSource> = Arc::new(SimulatedSource::default());
                Self::with_source(config, engine, Some(source), None)
            }
            SourceKind::Remote => {
                let feed = Arc::new(RemoteFeed::new());
                let source: Arc<dyn CaptureSource> = feed.clone();
                Self::with_source(config, engine, Some(source), Some(feed))
            }
            SourceKind::None => Self::with_source(config, engine, None, None),
        }
    }

    pub fn with_source(
        config: AppConfig,
        engine: Arc<RuleEngine>,
        source: Option<Arc<dyn CaptureSource>>,
        feed: Option<Arc<RemoteFeed>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            engine,
            source,
            feed,
            status: CaptureStatus::Idle,
            started_at: None,
            stop_tx: None,
            source_task: None,
            ingest_task: None,
            cleanup_task: None,
            events,
        }
    }

    pub fn engine(&self) -> Arc<RuleEngine> {
        self.engine.clone()
    }

    pub fn status(&self) -> CaptureStatus {
        self.status
    }

    pub fn status_report(&self) -> CaptureStatusReport {
        CaptureStatusReport {
            status: self.status,
            source: self.source.as_ref().map(|s| s.name()),
            started_at: self.started_at,
            packet_count: self.engine.packet_count(),
        }
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.config.settings.capture
    }

    /// Subscribe to live engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: EngineEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_status(&mut self, status: CaptureStatus) {
        self.status = status;
        self.publish(EngineEvent::Status { status });
    }

    /// Start delivering packets from the configured source into the engine
    pub async fn start_capture(&mut self) -> AppResult<()> {
        if self.status != CaptureStatus::Idle {
            return Err(AppError::CaptureError("Capture is already running".to_string()));
        }
        let source = self
            .source
            .clone()
            .ok_or_else(|| AppError::CaptureUnavailable("no capture source configured".to_string()))?;

        info!("Starting capture from {} source", source.name());

        let (tx, rx) = mpsc::channel(PACKET_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);

        let source_task = source.spawn(tx, stop_rx.clone())?;
        let ingest_task = tokio::spawn(Self::run_ingestion(
            self.engine.clone(),
            rx,
            stop_rx,
            self.events.clone(),
        ));

        self.stop_tx = Some(stop_tx);
        self.source_task = Some(source_task);
        self.ingest_task = Some(ingest_task);
        self.started_at = Some(Utc::now());
        self.set_status(CaptureStatus::Capturing);
        Ok(())
    }

    /// Evaluate packets from the source until stopped or the source ends
    async fn run_ingestion(
        engine: Arc<RuleEngine>,
        mut rx: mpsc::Receiver<CapturedPacket>,
        mut stop: watch::Receiver<bool>,
        events: broadcast::Sender<EngineEvent>,
    ) {
        let mut processed: u64 = 0;
        info!("Packet ingestion task started");

        loop {
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                received = rx.recv() => {
                    let Some(captured) = received else {
                        debug!("Capture source closed its channel");
                        break;
                    };
                    processed += 1;
                    let event = match engine.ingest(captured) {
                        IngestOutcome::Stored { packet, evicted } => {
                            if !evicted.is_empty() {
                                let _ = events.send(EngineEvent::Evicted { ids: evicted });
                            }
                            EngineEvent::Packet { packet: packet.summary() }
                        }
                        IngestOutcome::Dropped { id, fired_rules } => {
                            EngineEvent::Dropped { id, fired_rules }
                        }
                        IngestOutcome::SampledOut { .. } => continue,
                    };
                    let _ = events.send(event);
                }
            }
        }

        info!("Packet ingestion task stopped after {} packets", processed);
    }

    /// Signal the source and wait for both tasks to finish
    pub async fn stop_capture(&mut self) -> AppResult<()> {
        if self.status != CaptureStatus::Capturing {
            return Err(AppError::CaptureError("Capture is not running".to_string()));
        }

        info!("Stopping packet capture");
        self.set_status(CaptureStatus::Stopping);

        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        for task in [self.source_task.take(), self.ingest_task.take()].into_iter().flatten() {
            if let Err(e) = task.await {
                error!("Capture task ended abnormally: {}", e);
            }
        }

        self.started_at = None;
        self.set_status(CaptureStatus::Idle);

        // match counters moved while capturing
        if let Err(e) = self.persist_rules() {
            warn!("Failed to save rules after capture: {}", e);
        }
        Ok(())
    }

    /// Push packets through the remote feed
    pub async fn ingest_remote(&self, packets: Vec<CapturedPacket>) -> AppResult<usize> {
        let feed = self
            .feed
            .as_ref()
            .ok_or_else(|| AppError::CaptureUnavailable("remote feed is not configured".to_string()))?;
        let accepted = feed.push(packets).await?;
        debug!("Remote feed accepted {} packets", accepted);
        Ok(accepted)
    }

    /// Clear retained packets and tell subscribers
    pub fn clear_packets(&self) -> usize {
        let removed = self.engine.clear_packets();
        self.publish(EngineEvent::Cleared { removed });
        removed
    }

    /// Save the current rule sets when a rule file is configured
    pub fn persist_rules(&self) -> AppResult<()> {
        match &self.config.rules_path {
            Some(path) => self.engine.rule_file().save(path),
            None => Ok(()),
        }
    }

    /// Replace capture settings and re-apply retention
    pub fn update_settings(&mut self, settings: CaptureSettings) {
        info!(
            "Updating capture settings: maxPackets={}, bufferSize={}, sampleRate={}",
            settings.max_packets, settings.buffer_size, settings.sample_rate
        );
        self.engine.set_retention(RetentionPolicy::from(&settings));
        let restart_cleanup = settings.auto_cleanup != self.config.settings.capture.auto_cleanup
            || settings.cleanup_interval != self.config.settings.capture.cleanup_interval;
        self.config.settings.capture = settings;
        if restart_cleanup {
            self.start_cleanup();
        }
    }

    /// (Re)start the periodic retention pass according to the settings
    pub fn start_cleanup(&mut self) {
        if let Some(task) = self.cleanup_task.take() {
            task.abort();
        }
        let settings = &self.config.settings.capture;
        if !settings.auto_cleanup {
            info!("Automatic cleanup disabled");
            return;
        }

        let period = Duration::from_secs(settings.cleanup_interval.max(1));
        let engine = self.engine.clone();
        info!("Automatic cleanup every {}s", period.as_secs());

        self.cleanup_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = engine.enforce_retention();
                if removed > 0 {
                    info!("Cleanup removed {} packets", removed);
                }
            }
        }));
    }
}

impl Drop for CaptureManager {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        for task in [
            self.source_task.take(),
            self.ingest_task.take(),
            self.cleanup_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}
