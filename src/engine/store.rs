//! Bounded FIFO packet buffer.

use log::{debug, warn};
use std::collections::{BTreeMap, VecDeque};

use crate::models::config::CaptureSettings;
use crate::models::packet::Packet;

/// Capture time window used for the throughput figure
const SPEED_WINDOW_MS: i64 = 1_000;

/// Retention bounds and sampling rate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionPolicy {
    pub max_packets: usize,
    pub max_bytes: usize,
    pub sample_rate: f64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::from(&CaptureSettings::default())
    }
}

impl From<&CaptureSettings> for RetentionPolicy {
    fn from(settings: &CaptureSettings) -> Self {
        let sample_rate = if (0.0..=1.0).contains(&settings.sample_rate) {
            settings.sample_rate
        } else {
            warn!(
                "Sample rate {} is outside 0..=1, keeping every packet",
                settings.sample_rate
            );
            1.0
        };
        Self {
            max_packets: settings.max_packets,
            max_bytes: settings.buffer_size,
            sample_rate,
        }
    }
}

/// Retained packets in ingestion order, oldest first
#[derive(Debug, Default)]
pub struct PacketStore {
    packets: VecDeque<Packet>,
    bytes: usize,
    policy: RetentionPolicy,
    sample_seen: u64,
    sampled_out: u64,
    evicted: u64,
}

impl PacketStore {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Swap the policy and apply the new bounds right away
    pub fn set_policy(&mut self, policy: RetentionPolicy) -> Vec<u64> {
        self.policy = policy;
        self.enforce()
    }

    /// Sampling decision for the next passing packet.
    ///
    /// Of the first `n` packets offered, exactly `floor(n * rate)` are kept,
    /// spread evenly.
    pub fn admit(&mut self) -> bool {
        let rate = self.policy.sample_rate;
        let n = self.sample_seen as f64;
        self.sample_seen += 1;
        let keep = ((n + 1.0) * rate).floor() > (n * rate).floor();
        if !keep {
            self.sampled_out += 1;
        }
        keep
    }

    /// Append a packet and evict from the front until within bounds.
    /// Returns the ids of evicted packets.
    pub fn push(&mut self, packet: Packet) -> Vec<u64> {
        self.bytes += packet.size;
        self.packets.push_back(packet);
        self.enforce()
    }

    /// Evict oldest packets until both bounds hold. The newest packet is always kept.
    pub fn enforce(&mut self) -> Vec<u64> {
        let mut evicted = Vec::new();
        while self.packets.len() > 1
            && (self.packets.len() > self.policy.max_packets || self.bytes > self.policy.max_bytes)
        {
            if let Some(oldest) = self.packets.pop_front() {
                self.bytes -= oldest.size;
                evicted.push(oldest.id);
            }
        }
        if !evicted.is_empty() {
            self.evicted += evicted.len() as u64;
            debug!(
                "Evicted {} packets to stay within {} packets / {} bytes",
                evicted.len(),
                self.policy.max_packets,
                self.policy.max_bytes
            );
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.packets.iter()
    }

    fn index_of(&self, id: u64) -> Option<usize> {
        // ids are appended in increasing order
        self.packets.binary_search_by_key(&id, |p| p.id).ok()
    }

    pub fn get(&self, id: u64) -> Option<&Packet> {
        self.index_of(id).map(|i| &self.packets[i])
    }

    /// Replace a retained packet with a new state of itself
    pub fn replace(&mut self, packet: Packet) -> bool {
        let Some(i) = self.index_of(packet.id) else {
            return false;
        };
        self.bytes = self.bytes - self.packets[i].size + packet.size;
        self.packets[i] = packet;
        true
    }

    /// Drop every retained packet, returning how many there were
    pub fn clear(&mut self) -> usize {
        let count = self.packets.len();
        self.packets.clear();
        self.bytes = 0;
        count
    }

    /// Sum of retained packet sizes
    pub fn memory_usage(&self) -> usize {
        self.bytes
    }

    /// Bytes captured within the last second before the newest packet
    pub fn network_speed(&self) -> usize {
        let Some(newest) = self.packets.back() else {
            return 0;
        };
        let since = newest.timestamp - SPEED_WINDOW_MS;
        self.packets
            .iter()
            .rev()
            .take_while(|p| p.timestamp > since)
            .map(|p| p.size)
            .sum()
    }

    pub fn protocol_breakdown(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for packet in &self.packets {
            *counts.entry(packet.protocol.as_str().to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub fn sampled_out(&self) -> u64 {
        self.sampled_out
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}
