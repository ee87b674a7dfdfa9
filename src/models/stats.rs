use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Capture lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStatus {
    #[default]
    Idle,
    Capturing,
    Stopping,
}

/// Snapshot of engine statistics, recomputed from current state on each call
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatistics {
    /// Packets currently retained
    pub total_packets: usize,

    /// Retained packets passing the active display filter
    pub filtered_packets: usize,

    pub active_replace_rules: usize,

    pub active_feature_rules: usize,

    /// Sum of retained packet sizes in bytes
    pub memory_usage: usize,

    /// Bytes captured during the last second of capture time
    pub network_speed: usize,

    /// Packets received from the capture source this session
    pub ingested_packets: u64,

    /// Packets dropped by intercept filter rules
    pub dropped_packets: u64,

    /// Packets skipped by sampling
    pub sampled_out_packets: u64,

    /// Packets evicted to honour the retention bounds
    pub evicted_packets: u64,

    /// Retained packets per protocol
    pub protocols: BTreeMap<String, usize>,
}
