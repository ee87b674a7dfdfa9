//! Feature rules: byte/text patterns bound to record, filter and replace actions.

use log::{debug, info, log_enabled, warn, Level};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::engine::matcher::CompiledPattern;
use crate::models::packet::{Packet, Payload};
use crate::models::rule::PacketFeatureRule;
use crate::utils::error::{AppError, AppResult};

/// A compiled feature rule. Entries are shared between rule set snapshots so
/// counters carry over when the list is edited.
#[derive(Debug)]
struct FeatureEntry {
    rule: PacketFeatureRule,
    pattern: Option<CompiledPattern>,
    replacement: Option<Vec<u8>>,
    error: Option<String>,
    match_count: Arc<AtomicU64>,
}

impl FeatureEntry {
    fn compile(rule: PacketFeatureRule, match_count: Arc<AtomicU64>) -> Self {
        let compiled = CompiledPattern::compile(&rule.pattern())
            .and_then(|pattern| rule.replacement_bytes().map(|bytes| (pattern, bytes)));
        let (pattern, replacement, error) = match compiled {
            Ok((pattern, replacement)) => (Some(pattern), replacement, None),
            Err(e) => {
                warn!("Feature rule {} is inactive: {}", rule.id, e);
                (None, None, Some(e.to_string()))
            }
        };
        Self {
            rule,
            pattern,
            replacement,
            error,
            match_count,
        }
    }

    fn is_active(&self) -> bool {
        self.rule.enabled && self.pattern.is_some()
    }

    fn view(&self) -> PacketFeatureRule {
        PacketFeatureRule {
            match_count: self.match_count.load(Ordering::Relaxed),
            error: self.error.clone(),
            ..self.rule.clone()
        }
    }
}

/// Result of running a packet through the feature rules
#[derive(Debug)]
pub struct InterceptOutcome {
    /// False when a filter rule dropped the packet
    pub passed: bool,
    pub packet: Packet,
    /// Ids of the rules that matched, in evaluation order
    pub fired_rules: Vec<String>,
}

/// Ordered, immutable list of feature rules
#[derive(Debug, Clone, Default)]
pub struct InterceptRuleSet {
    entries: Vec<Arc<FeatureEntry>>,
}

impl InterceptRuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from persisted rules, keeping their stored counters
    pub fn from_rules(rules: Vec<PacketFeatureRule>) -> AppResult<Self> {
        let mut set = Self::new();
        for rule in rules {
            let count = rule.match_count;
            set = set.with_rule(rule)?;
            if let Some(entry) = set.entries.last() {
                entry.match_count.store(count, Ordering::Relaxed);
            }
        }
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Enabled rules whose pattern compiled
    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_active()).count()
    }

    pub fn rules(&self) -> Vec<PacketFeatureRule> {
        self.entries.iter().map(|e| e.view()).collect()
    }

    pub fn get(&self, id: &str) -> Option<PacketFeatureRule> {
        self.entries.iter().find(|e| e.rule.id == id).map(|e| e.view())
    }

    /// Copy of this set with `rule` appended; an empty id gets a fresh uuid
    pub fn with_rule(&self, mut rule: PacketFeatureRule) -> AppResult<Self> {
        if rule.id.is_empty() {
            rule.id = uuid::Uuid::new_v4().to_string();
        }
        if self.entries.iter().any(|e| e.rule.id == rule.id) {
            return Err(AppError::InvalidRule(format!(
                "feature rule id '{}' already exists",
                rule.id
            )));
        }
        rule.match_count = 0;
        rule.error = None;

        info!(
            "Adding feature rule {} ({} '{}')",
            rule.id,
            rule.function.as_str(),
            rule.feature
        );
        let mut entries = self.entries.clone();
        entries.push(Arc::new(FeatureEntry::compile(rule, Arc::new(AtomicU64::new(0)))));
        Ok(Self { entries })
    }

    /// Copy of this set without the rule `id`
    pub fn without(&self, id: &str) -> AppResult<Self> {
        let position = self.position(id)?;
        let mut entries = self.entries.clone();
        entries.remove(position);
        info!("Removed feature rule {}", id);
        Ok(Self { entries })
    }

    /// Copy of this set with the rule `id` switched on or off
    pub fn with_enabled(&self, id: &str, enabled: bool) -> AppResult<Self> {
        let position = self.position(id)?;
        let mut entries = self.entries.clone();
        let current = &entries[position];
        let toggled = FeatureEntry {
            rule: PacketFeatureRule {
                enabled,
                ..current.rule.clone()
            },
            pattern: current.pattern.clone(),
            replacement: current.replacement.clone(),
            error: current.error.clone(),
            match_count: current.match_count.clone(),
        };
        entries[position] = Arc::new(toggled);
        info!("Feature rule {} {}", id, if enabled { "enabled" } else { "disabled" });
        Ok(Self { entries })
    }

    /// Zero every match counter
    pub fn reset_counters(&self) {
        for entry in &self.entries {
            entry.match_count.store(0, Ordering::Relaxed);
        }
    }

    fn position(&self, id: &str) -> AppResult<usize> {
        self.entries
            .iter()
            .position(|e| e.rule.id == id)
            .ok_or_else(|| AppError::RuleNotFound(id.to_string()))
    }

    /// Run `packet` through every active rule in order.
    ///
    /// Each matching rule counts once. A filter rule drops the packet and
    /// stops evaluation, even when it also asks for a replacement. A replace
    /// rule splices its bytes over the match and later rules see the result.
    pub fn apply(&self, mut packet: Packet) -> InterceptOutcome {
        let mut fired_rules = Vec::new();

        for entry in &self.entries {
            let Some(pattern) = entry.pattern.as_ref().filter(|_| entry.rule.enabled) else {
                continue;
            };
            if packet.packet_function != Some(entry.rule.function) {
                continue;
            }
            let Some(raw) = packet.raw_data.as_ref() else {
                continue;
            };
            let Some(span) = pattern.find_payload(raw) else {
                continue;
            };

            entry.match_count.fetch_add(1, Ordering::Relaxed);
            fired_rules.push(entry.rule.id.clone());
            packet.fired_rules.push(entry.rule.id.clone());

            if entry.rule.filter {
                debug!("Packet {} dropped by feature rule {}", packet.id, entry.rule.id);
                return InterceptOutcome {
                    passed: false,
                    packet,
                    fired_rules,
                };
            }

            if entry.rule.replace && !entry.rule.only_record {
                if let Some(replacement) = &entry.replacement {
                    let bytes = raw.as_bytes();
                    let mut spliced =
                        Vec::with_capacity(bytes.len() - (span.end - span.start) + replacement.len());
                    spliced.extend_from_slice(&bytes[..span.start]);
                    spliced.extend_from_slice(replacement);
                    spliced.extend_from_slice(&bytes[span.end..]);

                    if log_enabled!(Level::Debug) {
                        debug!(
                            "Feature rule {} rewrote packet {} bytes {}..{}",
                            entry.rule.id, packet.id, span.start, span.end
                        );
                    }
                    packet.set_payload(Payload::from(spliced));
                }
            }
        }

        InterceptOutcome {
            passed: true,
            packet,
            fired_rules,
        }
    }
}
