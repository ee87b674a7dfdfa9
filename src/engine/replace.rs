//! Protocol-aware replace rules with lifetime firing policies.

use log::{debug, info, warn};
use regex::Regex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::capture::parser::{reason_phrase, PacketParser};
use crate::models::packet::{Packet, Payload};
use crate::models::rule::{ApplyPolicy, MatchConditions, ReplaceRule, ReplacementOp};
use crate::utils::error::{AppError, AppResult};

/// Counters shared by every snapshot holding the same rule
#[derive(Debug, Default)]
struct FireState {
    match_count: AtomicU64,
    fire_count: AtomicU64,
    has_fired: AtomicBool,
}

/// A replacement op with its content already decoded
#[derive(Debug, Clone)]
enum Op {
    Method(String),
    Url(String),
    Headers(Vec<(String, String)>),
    RequestBody(String),
    ResponseBody(String),
    StatusCode(u16),
    Data(Vec<u8>),
}

impl Op {
    fn compile(op: &ReplacementOp) -> AppResult<Self> {
        Ok(match op {
            ReplacementOp::Method(method) => Op::Method(method.clone()),
            ReplacementOp::Url(url) => Op::Url(url.clone()),
            ReplacementOp::Headers(headers) => Op::Headers(
                headers
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect(),
            ),
            ReplacementOp::RequestBody(content) => {
                Op::RequestBody(String::from_utf8_lossy(&content.to_bytes()?).into_owned())
            }
            ReplacementOp::ResponseBody(content) => {
                Op::ResponseBody(String::from_utf8_lossy(&content.to_bytes()?).into_owned())
            }
            ReplacementOp::StatusCode(code) => Op::StatusCode(*code),
            ReplacementOp::Data(content) => Op::Data(content.to_bytes()?),
        })
    }

    /// Whether the op has something to change on this packet
    fn applies_to(&self, packet: &Packet) -> bool {
        match self {
            Op::Data(_) => true,
            _ => packet.http.is_some(),
        }
    }
}

/// Matches a URL against a `*` glob or a `re:` regex
#[derive(Debug, Clone)]
struct UrlMatcher(Regex);

impl UrlMatcher {
    fn compile(pattern: &str) -> AppResult<Self> {
        let expr = match pattern.strip_prefix("re:") {
            Some(expr) => expr.to_string(),
            None => {
                let parts: Vec<String> = pattern.split('*').map(regex::escape).collect();
                format!("^{}$", parts.join(".*"))
            }
        };
        Regex::new(&expr)
            .map(UrlMatcher)
            .map_err(|e| AppError::InvalidPattern(format!("url pattern '{}': {}", pattern, e)))
    }

    fn is_match(&self, url: &str) -> bool {
        self.0.is_match(url)
    }
}

#[derive(Debug)]
struct ReplaceEntry {
    rule: ReplaceRule,
    policy: ApplyPolicy,
    url: Option<UrlMatcher>,
    ops: Vec<Op>,
    error: Option<String>,
    state: Arc<FireState>,
}

impl ReplaceEntry {
    fn compile(rule: ReplaceRule, policy: ApplyPolicy, state: Arc<FireState>) -> Self {
        let url = rule
            .match_conditions
            .url_pattern
            .as_deref()
            .map(UrlMatcher::compile)
            .transpose();
        let ops: AppResult<Vec<Op>> = rule.replacement.ops.iter().map(Op::compile).collect();

        let (url, ops, error) = match (url, ops) {
            (Ok(url), Ok(ops)) => (url, ops, None),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Replace rule {} ({}) is inactive: {}", rule.id, rule.name, e);
                (None, Vec::new(), Some(e.to_string()))
            }
        };
        Self {
            rule,
            policy,
            url,
            ops,
            error,
            state,
        }
    }

    fn is_active(&self) -> bool {
        self.rule.enabled && self.error.is_none()
    }

    fn view(&self) -> ReplaceRule {
        ReplaceRule {
            match_count: self.state.match_count.load(Ordering::Relaxed),
            fire_count: self.state.fire_count.load(Ordering::Relaxed),
            has_fired: self.state.has_fired.load(Ordering::Relaxed),
            error: self.error.clone(),
            ..self.rule.clone()
        }
    }

    fn conditions_hold(&self, packet: &Packet) -> bool {
        let conditions: &MatchConditions = &self.rule.match_conditions;

        if !conditions.protocol.is_empty() && !conditions.protocol.contains(&packet.protocol) {
            return false;
        }
        if let Some(direction) = conditions.direction {
            if !direction.admits(packet.direction) {
                return false;
            }
        }

        let needs_http = self.url.is_some()
            || conditions.domain.is_some()
            || conditions.method.is_some()
            || conditions.status_code.is_some()
            || !conditions.header_match.is_empty();
        if !needs_http {
            return true;
        }
        let Some(http) = &packet.http else {
            return false;
        };

        if let Some(url) = &self.url {
            match &http.url {
                Some(value) if url.is_match(value) => {}
                _ => return false,
            }
        }
        if let Some(domain) = &conditions.domain {
            match http.host() {
                Some(host) if host.to_ascii_lowercase().contains(&domain.to_ascii_lowercase()) => {}
                _ => return false,
            }
        }
        if let Some(method) = &conditions.method {
            match &http.method {
                Some(m) if m.eq_ignore_ascii_case(method) => {}
                _ => return false,
            }
        }
        if let Some(code) = conditions.status_code {
            if http.status_code != Some(code) {
                return false;
            }
        }
        conditions.header_match.iter().all(|(name, expected)| {
            http.header(name)
                .map_or(false, |value| value.eq_ignore_ascii_case(expected))
        })
    }

    /// Consume one unit of the firing budget, if any is left
    fn take_budget(&self) -> bool {
        match self.policy {
            ApplyPolicy::All => true,
            ApplyPolicy::First => !self.state.has_fired.swap(true, Ordering::AcqRel),
            ApplyPolicy::Count(limit) => self
                .state
                .fire_count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < u64::from(limit)).then_some(n + 1)
                })
                .is_ok(),
        }
    }

    fn record_fire(&self) {
        // count policy already bumped the counter in take_budget
        if !matches!(self.policy, ApplyPolicy::Count(_)) {
            self.state.fire_count.fetch_add(1, Ordering::Relaxed);
        }
        self.state.has_fired.store(true, Ordering::Relaxed);
    }
}

/// Ordered, immutable list of replace rules
#[derive(Debug, Clone, Default)]
pub struct ReplaceRuleSet {
    entries: Vec<Arc<ReplaceEntry>>,
}

impl ReplaceRuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from persisted rules, keeping their stored counters
    pub fn from_rules(rules: Vec<ReplaceRule>) -> AppResult<Self> {
        let mut set = Self::new();
        for rule in rules {
            let state = FireState {
                match_count: AtomicU64::new(rule.match_count),
                fire_count: AtomicU64::new(rule.fire_count),
                has_fired: AtomicBool::new(rule.has_fired),
            };
            set = set.upsert(rule, Some(Arc::new(state)))?;
        }
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_active()).count()
    }

    pub fn rules(&self) -> Vec<ReplaceRule> {
        self.entries.iter().map(|e| e.view()).collect()
    }

    pub fn get(&self, id: &str) -> Option<ReplaceRule> {
        self.entries.iter().find(|e| e.rule.id == id).map(|e| e.view())
    }

    /// Copy of this set with `rule` added, or replacing the rule with the same id.
    ///
    /// An empty id gets a fresh uuid. Updating a rule restarts its counters
    /// and keeps its creation time.
    pub fn with_rule(&self, rule: ReplaceRule) -> AppResult<Self> {
        self.upsert(rule, None)
    }

    fn upsert(&self, mut rule: ReplaceRule, state: Option<Arc<FireState>>) -> AppResult<Self> {
        let policy = rule.policy()?;
        if rule.id.is_empty() {
            rule.id = uuid::Uuid::new_v4().to_string();
        }
        let now = chrono::Utc::now().timestamp_millis();
        let mut entries = self.entries.clone();
        let existing = entries.iter().position(|e| e.rule.id == rule.id);

        rule.created_at = existing
            .and_then(|i| entries[i].rule.created_at)
            .or(rule.created_at)
            .or(Some(now));
        if state.is_none() {
            rule.updated_at = Some(now);
        }
        rule.match_count = 0;
        rule.fire_count = 0;
        rule.has_fired = false;
        rule.error = None;

        let entry = Arc::new(ReplaceEntry::compile(rule, policy, state.unwrap_or_default()));
        match existing {
            Some(i) => {
                info!("Updated replace rule {} ({})", entry.rule.id, entry.rule.name);
                entries[i] = entry;
            }
            None => {
                info!("Added replace rule {} ({})", entry.rule.id, entry.rule.name);
                entries.push(entry);
            }
        }
        Ok(Self { entries })
    }

    /// Copy of this set without the rule `id`
    pub fn without(&self, id: &str) -> AppResult<Self> {
        let position = self.position(id)?;
        let mut entries = self.entries.clone();
        entries.remove(position);
        info!("Removed replace rule {}", id);
        Ok(Self { entries })
    }

    /// Copy of this set with rule `id` switched on or off. Re-enabling a
    /// disabled rule gives it a fresh firing budget.
    pub fn with_enabled(&self, id: &str, enabled: bool) -> AppResult<Self> {
        let position = self.position(id)?;
        let mut entries = self.entries.clone();
        let current = &entries[position];

        if enabled && !current.rule.enabled {
            current.state.fire_count.store(0, Ordering::Relaxed);
            current.state.has_fired.store(false, Ordering::Relaxed);
        }
        let toggled = ReplaceEntry {
            rule: ReplaceRule {
                enabled,
                updated_at: Some(chrono::Utc::now().timestamp_millis()),
                ..current.rule.clone()
            },
            policy: current.policy,
            url: current.url.clone(),
            ops: current.ops.clone(),
            error: current.error.clone(),
            state: current.state.clone(),
        };
        entries[position] = Arc::new(toggled);
        info!("Replace rule {} {}", id, if enabled { "enabled" } else { "disabled" });
        Ok(Self { entries })
    }

    fn position(&self, id: &str) -> AppResult<usize> {
        self.entries
            .iter()
            .position(|e| e.rule.id == id)
            .ok_or_else(|| AppError::RuleNotFound(id.to_string()))
    }

    /// Run `packet` through the enabled rules in order; each firing rule sees
    /// the previous one's output. Returns the ids of the rules that fired.
    pub fn apply(&self, mut packet: Packet, parser: &PacketParser) -> (Packet, Vec<String>) {
        let mut fired = Vec::new();

        for entry in &self.entries {
            if !entry.is_active() || !entry.conditions_hold(&packet) {
                continue;
            }
            entry.state.match_count.fetch_add(1, Ordering::Relaxed);

            if !entry.rule.replacement.replace_direction.admits(packet.direction) {
                continue;
            }
            if !entry.ops.iter().any(|op| op.applies_to(&packet)) {
                continue;
            }
            if !entry.take_budget() {
                continue;
            }

            apply_ops(&entry.ops, &mut packet, parser);
            entry.record_fire();
            debug!("Replace rule {} fired on packet {}", entry.rule.id, packet.id);
            fired.push(entry.rule.id.clone());
            packet.fired_rules.push(entry.rule.id.clone());
        }

        (packet, fired)
    }
}

fn apply_ops(ops: &[Op], packet: &mut Packet, parser: &PacketParser) {
    let mut http_dirty = false;

    for op in ops {
        if let Op::Data(bytes) = op {
            packet.set_payload(Payload::from(bytes.clone()));
            parser.refresh_http(packet);
            http_dirty = false;
            continue;
        }

        let Some(http) = packet.http.as_mut() else {
            continue;
        };
        match op {
            Op::Method(method) => http.method = Some(method.clone()),
            Op::Url(url) => http.url = Some(url.clone()),
            Op::Headers(headers) => {
                for (name, value) in headers {
                    http.set_header(name, value);
                }
            }
            Op::RequestBody(body) => http.set_request_body(body),
            Op::ResponseBody(body) => http.set_response_body(body),
            Op::StatusCode(code) => {
                http.status_code = Some(*code);
                let reason = reason_phrase(*code);
                http.reason = (!reason.is_empty()).then(|| reason.to_string());
            }
            Op::Data(_) => {}
        }
        http_dirty = true;
    }

    if http_dirty {
        if let Some(bytes) = packet.http.as_ref().and_then(|http| parser.render_http(http)) {
            packet.set_payload(Payload::from(bytes));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fixtures::{http_exchange, http_request, packet};
    use crate::models::filter::DirectionFilter;
    use crate::models::packet::{Direction, PacketFunction, Protocol};
    use crate::models::rule::{ApplyTo, Content, PacketReplacement, ReplaceDirection};
    use std::collections::BTreeMap;

    fn rule(id: &str, conditions: MatchConditions, ops: Vec<ReplacementOp>) -> ReplaceRule {
        ReplaceRule {
            id: id.to_string(),
            match_conditions: conditions,
            ..ReplaceRule::new(
                id,
                PacketReplacement {
                    ops,
                    replace_direction: ReplaceDirection::Both,
                },
            )
        }
    }

    fn get_only() -> MatchConditions {
        MatchConditions {
            method: Some("GET".into()),
            ..MatchConditions::default()
        }
    }

    fn status_of(packet: &Packet) -> Option<u16> {
        packet.http.as_ref().and_then(|h| h.status_code)
    }

    #[test]
    fn test_status_override_for_get_only() {
        let set = ReplaceRuleSet::new()
            .with_rule(rule("r1", get_only(), vec![ReplacementOp::StatusCode(404)]))
            .unwrap();
        let parser = PacketParser::new();

        let (get, fired) = set.apply(http_exchange(1, "GET", 200), &parser);
        assert_eq!(status_of(&get), Some(404));
        assert_eq!(get.http.as_ref().unwrap().reason.as_deref(), Some("Not Found"));
        assert_eq!(fired, vec!["r1".to_string()]);

        let (post, fired) = set.apply(http_exchange(2, "POST", 200), &parser);
        assert_eq!(status_of(&post), Some(200));
        assert!(fired.is_empty());
        assert!(post.fired_rules.is_empty());
    }

    #[test]
    fn test_first_fires_once() {
        let mut r = rule("r1", get_only(), vec![ReplacementOp::StatusCode(404)]);
        r.apply_to = ApplyTo::First;
        let set = ReplaceRuleSet::new().with_rule(r).unwrap();
        let parser = PacketParser::new();

        let mutated = (0..10)
            .map(|i| set.apply(http_exchange(i, "GET", 200), &parser).0)
            .filter(|p| status_of(p) == Some(404))
            .count();
        assert_eq!(mutated, 1);
        let view = set.get("r1").unwrap();
        assert!(view.has_fired);
        assert_eq!(view.fire_count, 1);
        assert_eq!(view.match_count, 10);
    }

    #[test]
    fn test_count_fires_at_most_n_times() {
        const N: u32 = 3;
        let mut r = rule("r1", get_only(), vec![ReplacementOp::StatusCode(404)]);
        r.apply_to = ApplyTo::Count;
        r.apply_count = Some(N);
        let set = ReplaceRuleSet::new().with_rule(r).unwrap();
        let parser = PacketParser::new();

        let mutated = (0..u64::from(N) + 5)
            .map(|i| set.apply(http_exchange(i, "GET", 200), &parser).0)
            .filter(|p| status_of(p) == Some(404))
            .count();
        assert_eq!(mutated, N as usize);
        assert_eq!(set.get("r1").unwrap().fire_count, u64::from(N));
    }

    #[test]
    fn test_count_without_apply_count_is_rejected() {
        let mut r = rule("r1", get_only(), vec![]);
        r.apply_to = ApplyTo::Count;
        assert!(matches!(
            ReplaceRuleSet::new().with_rule(r),
            Err(AppError::InvalidRule(_))
        ));
    }

    #[test]
    fn test_url_glob_and_regex() {
        let glob = UrlMatcher::compile("/api/*/users").unwrap();
        assert!(glob.is_match("/api/v1/users"));
        assert!(!glob.is_match("/api/v1/users/7"));
        assert!(!glob.is_match("/api.v1/users"));

        let re = UrlMatcher::compile(r"re:^/items/\d+$").unwrap();
        assert!(re.is_match("/items/42"));
        assert!(UrlMatcher::compile("re:(").is_err());
    }

    #[test]
    fn test_header_match_and_domain() {
        let mut headers = BTreeMap::new();
        headers.insert("HOST".to_string(), "API.example.com".to_string());
        let conditions = MatchConditions {
            domain: Some("example.com".into()),
            header_match: headers,
            ..MatchConditions::default()
        };
        let set = ReplaceRuleSet::new()
            .with_rule(rule("r1", conditions, vec![ReplacementOp::Method("PUT".into())]))
            .unwrap();
        let parser = PacketParser::new();

        let (hit, _) = set.apply(http_request(1, "GET", "/", "api.example.com"), &parser);
        assert_eq!(hit.http.unwrap().method.as_deref(), Some("PUT"));
        let (miss, _) = set.apply(http_request(2, "GET", "/", "www.example.com"), &parser);
        assert_eq!(miss.http.unwrap().method.as_deref(), Some("GET"));
    }

    #[test]
    fn test_http_conditions_need_http_view() {
        let set = ReplaceRuleSet::new()
            .with_rule(rule(
                "r1",
                get_only(),
                vec![ReplacementOp::Data(Content::Hex("00".into()))],
            ))
            .unwrap();
        let (p, fired) = set.apply(
            packet(1, Protocol::Tcp, PacketFunction::Send, b"GET"),
            &PacketParser::new(),
        );
        assert!(fired.is_empty());
        assert!(!p.was_modified());
    }

    #[test]
    fn test_replace_direction_gates() {
        let mut r = rule(
            "r1",
            MatchConditions {
                direction: Some(DirectionFilter::All),
                ..MatchConditions::default()
            },
            vec![ReplacementOp::Data(Content::Text("x".into()))],
        );
        r.replacement.replace_direction = ReplaceDirection::Receive;
        let set = ReplaceRuleSet::new().with_rule(r).unwrap();
        let parser = PacketParser::new();

        let (sent, _) = set.apply(packet(1, Protocol::Tcp, PacketFunction::Send, b"a"), &parser);
        assert!(!sent.was_modified());
        let (received, _) = set.apply(packet(2, Protocol::Tcp, PacketFunction::Recv, b"a"), &parser);
        assert_eq!(received.direction, Direction::Receive);
        assert_eq!(received.raw_data.unwrap().as_bytes(), b"x");
        assert_eq!(set.get("r1").unwrap().match_count, 2);
    }

    #[test]
    fn test_derived_view_is_rendered_into_payload() {
        let parser = PacketParser::new();
        let mut p = packet(
            1,
            Protocol::Http,
            PacketFunction::Recv,
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
        );
        parser.annotate(&mut p);

        let set = ReplaceRuleSet::new()
            .with_rule(rule(
                "r1",
                MatchConditions::default(),
                vec![
                    ReplacementOp::StatusCode(404),
                    ReplacementOp::ResponseBody(Content::Text("gone".into())),
                ],
            ))
            .unwrap();
        let (p, _) = set.apply(p, &parser);
        assert_eq!(
            p.raw_data.as_ref().unwrap().as_bytes(),
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 4\r\n\r\ngone"
        );
        assert!(p.original_data.is_some());
    }

    #[test]
    fn test_header_rewrite_keeps_binary_body() {
        let parser = PacketParser::new();
        let mut data = b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: 4\r\n\r\n".to_vec();
        data.extend_from_slice(&[0x1f, 0x8b, 0xff, 0x00]);
        let mut p = packet(1, Protocol::Http, PacketFunction::Recv, &data);
        parser.annotate(&mut p);

        let set = ReplaceRuleSet::new()
            .with_rule(rule(
                "r1",
                MatchConditions::default(),
                vec![ReplacementOp::Headers(BTreeMap::from([("X-Debug".to_string(), "1".to_string())]))],
            ))
            .unwrap();
        let (p, fired) = set.apply(p, &parser);
        assert_eq!(fired, vec!["r1".to_string()]);

        let bytes = p.raw_data.as_ref().unwrap().as_bytes();
        assert!(bytes.ends_with(&[0x1f, 0x8b, 0xff, 0x00]));
        let head_len = bytes.len() - 4;
        let head = std::str::from_utf8(&bytes[..head_len]).unwrap();
        assert!(head.contains("Content-Length: 4\r\n"));
        assert!(head.ends_with("X-Debug: 1\r\n\r\n"));
    }

    #[test]
    fn test_chained_rules_see_previous_output() {
        let set = ReplaceRuleSet::new()
            .with_rule(rule("a", get_only(), vec![ReplacementOp::Method("POST".into())]))
            .unwrap()
            .with_rule(rule(
                "b",
                MatchConditions {
                    method: Some("POST".into()),
                    ..MatchConditions::default()
                },
                vec![ReplacementOp::StatusCode(201)],
            ))
            .unwrap();
        let (p, fired) = set.apply(http_exchange(1, "GET", 200), &PacketParser::new());
        assert_eq!(fired, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(status_of(&p), Some(201));
    }

    #[test]
    fn test_update_keeps_position_and_resets_counters() {
        let set = ReplaceRuleSet::new()
            .with_rule(rule("r1", get_only(), vec![ReplacementOp::StatusCode(404)]))
            .unwrap()
            .with_rule(rule("r2", get_only(), vec![]))
            .unwrap();
        set.apply(http_exchange(1, "GET", 200), &PacketParser::new());
        let created = set.get("r1").unwrap().created_at;

        let updated = set
            .with_rule(rule("r1", get_only(), vec![ReplacementOp::StatusCode(500)]))
            .unwrap();
        let view = updated.get("r1").unwrap();
        assert_eq!(view.match_count, 0);
        assert_eq!(view.created_at, created);
        assert_eq!(updated.rules()[0].id, "r1");
        assert_eq!(updated.len(), 2);
    }

    #[test]
    fn test_reenabling_restores_budget() {
        let mut r = rule("r1", get_only(), vec![ReplacementOp::StatusCode(404)]);
        r.apply_to = ApplyTo::First;
        let parser = PacketParser::new();
        let set = ReplaceRuleSet::new().with_rule(r).unwrap();
        set.apply(http_exchange(1, "GET", 200), &parser);

        let set = set.with_enabled("r1", false).unwrap();
        let (p, _) = set.apply(http_exchange(2, "GET", 200), &parser);
        assert_eq!(status_of(&p), Some(200));

        let set = set.with_enabled("r1", true).unwrap();
        let (p, _) = set.apply(http_exchange(3, "GET", 200), &parser);
        assert_eq!(status_of(&p), Some(404));
    }

    #[test]
    fn test_invalid_content_marks_rule() {
        let set = ReplaceRuleSet::new()
            .with_rule(rule(
                "r1",
                MatchConditions::default(),
                vec![ReplacementOp::Data(Content::Hex("zz".into()))],
            ))
            .unwrap();
        assert!(set.get("r1").unwrap().error.is_some());
        assert_eq!(set.active_count(), 0);
    }

    #[test]
    fn test_unknown_rule_errors() {
        let set = ReplaceRuleSet::new();
        assert!(matches!(set.without("x"), Err(AppError::RuleNotFound(_))));
        assert!(matches!(
            set.with_enabled("x", true),
            Err(AppError::RuleNotFound(_))
        ));
    }
}
