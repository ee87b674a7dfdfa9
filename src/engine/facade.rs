//! The rule engine: per-packet pipeline, retained buffer, rule sets and queries.

use dashmap::DashMap;
use log::{debug, info, trace};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::capture::parser::PacketParser;
use crate::engine::filter::CompiledFilter;
use crate::engine::intercept::InterceptRuleSet;
use crate::engine::persist::RuleFile;
use crate::engine::replace::ReplaceRuleSet;
use crate::engine::store::{PacketStore, RetentionPolicy};
use crate::models::filter::FilterConditions;
use crate::models::packet::{CapturedPacket, Packet, PacketDetail, PacketEdit, Payload};
use crate::models::rule::{PacketFeatureRule, ReplaceRule};
use crate::models::stats::EngineStatistics;
use crate::utils::error::{AppError, AppResult};

/// What happened to an ingested packet
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// Retained; `evicted` lists packets pushed out to make room
    Stored { packet: Packet, evicted: Vec<u64> },
    /// Dropped by a feature filter rule
    Dropped { id: u64, fired_rules: Vec<String> },
    /// Passed every rule but skipped by sampling
    SampledOut { id: u64 },
}

impl IngestOutcome {
    pub fn id(&self) -> u64 {
        match self {
            IngestOutcome::Stored { packet, .. } => packet.id,
            IngestOutcome::Dropped { id, .. } | IngestOutcome::SampledOut { id } => *id,
        }
    }

    pub fn passed(&self) -> bool {
        !matches!(self, IngestOutcome::Dropped { .. })
    }
}

/// Owns rule sets, the packet buffer and session counters.
///
/// Ingestion is serialized by the evaluation lock. Rule sets are immutable
/// snapshots swapped on edit, so a packet is evaluated against the rules
/// that were current when its pass began.
pub struct RuleEngine {
    evaluation: Mutex<()>,
    next_id: AtomicU64,
    feature_rules: RwLock<Arc<InterceptRuleSet>>,
    replace_rules: RwLock<Arc<ReplaceRuleSet>>,
    filter: RwLock<Arc<CompiledFilter>>,
    store: RwLock<PacketStore>,
    details: DashMap<u64, Arc<PacketDetail>>,
    parser: PacketParser,
    ingested: AtomicU64,
    dropped: AtomicU64,
}

impl Default for RuleEngine {
    fn default() -> Self {
        RuleEngine::new(RetentionPolicy::default())
    }
}

impl RuleEngine {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            evaluation: Mutex::new(()),
            next_id: AtomicU64::new(1),
            feature_rules: RwLock::new(Arc::new(InterceptRuleSet::new())),
            replace_rules: RwLock::new(Arc::new(ReplaceRuleSet::new())),
            filter: RwLock::new(Arc::new(CompiledFilter::default())),
            store: RwLock::new(PacketStore::new(policy)),
            details: DashMap::new(),
            parser: PacketParser::new(),
            ingested: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Engine preloaded with persisted rule sets
    pub fn with_rules(policy: RetentionPolicy, rules: RuleFile) -> AppResult<Self> {
        let engine = Self::new(policy);
        *engine.feature_rules.write() = Arc::new(InterceptRuleSet::from_rules(rules.feature_rules)?);
        *engine.replace_rules.write() = Arc::new(ReplaceRuleSet::from_rules(rules.replace_rules)?);
        Ok(engine)
    }

    /// Run one captured packet through the pipeline:
    /// id, HTTP view, feature rules, replace rules, sampling, retention.
    pub fn ingest(&self, captured: CapturedPacket) -> IngestOutcome {
        let _pass = self.evaluation.lock();

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.ingested.fetch_add(1, Ordering::Relaxed);
        let mut packet = captured.into_packet(id);
        self.parser.annotate(&mut packet);

        let features = self.feature_rules.read().clone();
        let replaces = self.replace_rules.read().clone();

        let intercepted = features.apply(packet);
        if !intercepted.passed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return IngestOutcome::Dropped {
                id,
                fired_rules: intercepted.fired_rules,
            };
        }
        let mut packet = intercepted.packet;
        if packet.was_modified() {
            self.parser.refresh_http(&mut packet);
        }
        let (packet, _) = replaces.apply(packet, &self.parser);

        let evicted = {
            let mut store = self.store.write();
            if !store.admit() {
                trace!("Packet {} skipped by sampling", id);
                return IngestOutcome::SampledOut { id };
            }
            store.push(packet.clone())
        };
        self.forget_details(&evicted);

        trace!("Stored packet {} ({} bytes)", id, packet.size);
        IngestOutcome::Stored { packet, evicted }
    }

    fn forget_details(&self, ids: &[u64]) {
        for id in ids {
            self.details.remove(id);
        }
    }

    /// Retained packets passing `conditions`, oldest first
    pub fn packets(&self, conditions: &FilterConditions, now: Option<i64>) -> Vec<Packet> {
        self.filtered(&CompiledFilter::new(conditions.clone()), now)
    }

    pub fn filtered(&self, filter: &CompiledFilter, now: Option<i64>) -> Vec<Packet> {
        self.store
            .read()
            .iter()
            .filter(|p| filter.keep(p, now))
            .cloned()
            .collect()
    }

    /// Retained packets passing the active display filter
    pub fn visible_packets(&self, now: Option<i64>) -> Vec<Packet> {
        let filter = self.active_filter();
        self.filtered(&filter, now)
    }

    pub fn active_filter(&self) -> Arc<CompiledFilter> {
        self.filter.read().clone()
    }

    pub fn filters(&self) -> FilterConditions {
        self.filter.read().conditions().clone()
    }

    /// Replace the active display filter wholesale
    pub fn set_filters(&self, conditions: FilterConditions) {
        debug!("Display filter set to {:?}", conditions);
        *self.filter.write() = Arc::new(CompiledFilter::new(conditions));
    }

    pub fn packet(&self, id: u64) -> AppResult<Packet> {
        self.store
            .read()
            .get(id)
            .cloned()
            .ok_or(AppError::PacketNotFound(id))
    }

    /// Packet with parsed protocol fields, computed once and cached
    pub fn packet_detail(&self, id: u64) -> AppResult<Arc<PacketDetail>> {
        if let Some(detail) = self.details.get(&id) {
            return Ok(detail.clone());
        }
        let packet = self.packet(id)?;
        let detail = Arc::new(self.parser.detail(&packet));
        self.details.insert(id, detail.clone());
        Ok(detail)
    }

    /// Apply user edits to a retained packet, producing its new state
    pub fn edit_packet(&self, id: u64, edits: &[PacketEdit]) -> AppResult<Packet> {
        let mut packet = self.packet(id)?;
        for edit in edits {
            match edit {
                PacketEdit::ProcessName(name) => packet.process_name = name.clone(),
                PacketEdit::Protocol(protocol) => packet.protocol = *protocol,
                PacketEdit::Direction(direction) => packet.direction = *direction,
                PacketEdit::SrcAddr(addr) => packet.src_addr = addr.clone(),
                PacketEdit::DstAddr(addr) => packet.dst_addr = addr.clone(),
                PacketEdit::Data(content) => {
                    packet.set_payload(Payload::from(content.to_bytes()?));
                    self.parser.refresh_http(&mut packet);
                }
            }
        }

        if !self.store.write().replace(packet.clone()) {
            return Err(AppError::PacketNotFound(id));
        }
        self.details.remove(&id);
        info!("Edited packet {} ({} changes)", id, edits.len());
        Ok(packet)
    }

    /// Drop every retained packet. Ids keep increasing afterwards.
    pub fn clear_packets(&self) -> usize {
        let cleared = self.store.write().clear();
        self.details.clear();
        info!("Cleared {} packets", cleared);
        cleared
    }

    pub fn packet_count(&self) -> usize {
        self.store.read().len()
    }

    /// Export view: the packets with the given ids, or every retained packet
    pub fn select(&self, ids: Option<&[u64]>) -> Vec<Packet> {
        let store = self.store.read();
        match ids {
            Some(ids) => ids.iter().filter_map(|id| store.get(*id).cloned()).collect(),
            None => store.iter().cloned().collect(),
        }
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.store.read().policy()
    }

    pub fn set_retention(&self, policy: RetentionPolicy) {
        let evicted = self.store.write().set_policy(policy);
        self.forget_details(&evicted);
    }

    /// Re-apply the retention bounds, returning how many packets went
    pub fn enforce_retention(&self) -> usize {
        let evicted = self.store.write().enforce();
        self.forget_details(&evicted);
        evicted.len()
    }

    /// Statistics recomputed from current state
    pub fn statistics(&self, now: Option<i64>) -> EngineStatistics {
        let filter = self.active_filter();
        let active_feature_rules = self.feature_rules.read().active_count();
        let active_replace_rules = self.replace_rules.read().active_count();

        let store = self.store.read();
        EngineStatistics {
            total_packets: store.len(),
            filtered_packets: store.iter().filter(|p| filter.keep(p, now)).count(),
            active_replace_rules,
            active_feature_rules,
            memory_usage: store.memory_usage(),
            network_speed: store.network_speed(),
            ingested_packets: self.ingested.load(Ordering::Relaxed),
            dropped_packets: self.dropped.load(Ordering::Relaxed),
            sampled_out_packets: store.sampled_out(),
            evicted_packets: store.evicted(),
            protocols: store.protocol_breakdown(),
        }
    }

    // feature rules

    pub fn feature_rules(&self) -> Vec<PacketFeatureRule> {
        self.feature_rules.read().rules()
    }

    pub fn add_feature_rule(&self, rule: PacketFeatureRule) -> AppResult<PacketFeatureRule> {
        let mut slot = self.feature_rules.write();
        let next = slot.with_rule(rule)?;
        let added = next.rules().pop().ok_or_else(|| {
            AppError::InvalidRule("feature rule was not added".to_string())
        })?;
        *slot = Arc::new(next);
        Ok(added)
    }

    pub fn remove_feature_rule(&self, id: &str) -> AppResult<()> {
        let mut slot = self.feature_rules.write();
        *slot = Arc::new(slot.without(id)?);
        Ok(())
    }

    pub fn set_feature_rule_enabled(&self, id: &str, enabled: bool) -> AppResult<PacketFeatureRule> {
        let mut slot = self.feature_rules.write();
        let next = slot.with_enabled(id, enabled)?;
        let rule = next
            .get(id)
            .ok_or_else(|| AppError::RuleNotFound(id.to_string()))?;
        *slot = Arc::new(next);
        Ok(rule)
    }

    pub fn reset_feature_counters(&self) {
        self.feature_rules.read().reset_counters();
        info!("Feature rule counters reset");
    }

    // replace rules

    pub fn replace_rules(&self) -> Vec<ReplaceRule> {
        self.replace_rules.read().rules()
    }

    /// Add a replace rule or update the one with the same id
    pub fn set_replace_rule(&self, rule: ReplaceRule) -> AppResult<ReplaceRule> {
        let mut slot = self.replace_rules.write();
        let requested = rule.id.clone();
        let next = slot.with_rule(rule)?;
        let stored = if requested.is_empty() {
            next.rules().pop()
        } else {
            next.get(&requested)
        };
        let stored =
            stored.ok_or_else(|| AppError::InvalidRule("replace rule was not stored".to_string()))?;
        *slot = Arc::new(next);
        Ok(stored)
    }

    pub fn remove_replace_rule(&self, id: &str) -> AppResult<()> {
        let mut slot = self.replace_rules.write();
        *slot = Arc::new(slot.without(id)?);
        Ok(())
    }

    pub fn enable_replace_rule(&self, id: &str, enabled: bool) -> AppResult<ReplaceRule> {
        let mut slot = self.replace_rules.write();
        let next = slot.with_enabled(id, enabled)?;
        let rule = next
            .get(id)
            .ok_or_else(|| AppError::RuleNotFound(id.to_string()))?;
        *slot = Arc::new(next);
        Ok(rule)
    }

    /// Both rule sets with their current counters, for persistence
    pub fn rule_file(&self) -> RuleFile {
        RuleFile {
            feature_rules: self.feature_rules(),
            replace_rules: self.replace_rules(),
        }
    }
}
