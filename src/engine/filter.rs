//! Display filter evaluation.
//!
//! A [`CompiledFilter`] is built once per [`FilterConditions`] edit and is
//! then a pure predicate over packets: evaluating it has no side effects.

use log::warn;

use crate::engine::matcher::CompiledPattern;
use crate::models::filter::{FilterConditions, SearchTarget};
use crate::models::packet::{HttpInfo, Packet};

/// Keyword stage after compilation
#[derive(Debug, Clone)]
enum Keyword {
    None,
    Pattern(CompiledPattern),
    /// The expression did not compile; no packet passes this stage
    Invalid,
}

#[derive(Debug, Clone)]
pub struct CompiledFilter {
    conditions: FilterConditions,
    keyword: Keyword,
    method: Option<String>,
    domain: Option<String>,
}

impl Default for CompiledFilter {
    fn default() -> Self {
        CompiledFilter::new(FilterConditions::default())
    }
}

impl CompiledFilter {
    pub fn new(conditions: FilterConditions) -> Self {
        let keyword = match conditions.keyword.as_deref() {
            None | Some("") => Keyword::None,
            Some(keyword) => match CompiledPattern::keyword(keyword, conditions.use_regex) {
                Ok(pattern) => Keyword::Pattern(pattern),
                Err(e) => {
                    warn!("Keyword filter rejects every packet: {}", e);
                    Keyword::Invalid
                }
            },
        };
        let method = conditions
            .method
            .as_ref()
            .filter(|m| !m.is_empty())
            .map(|m| m.to_ascii_uppercase());
        let domain = conditions
            .domain
            .as_ref()
            .filter(|d| !d.is_empty())
            .map(|d| d.to_ascii_lowercase());
        Self {
            conditions,
            keyword,
            method,
            domain,
        }
    }

    pub fn conditions(&self) -> &FilterConditions {
        &self.conditions
    }

    /// Whether the packet passes every configured stage. The keyword scan
    /// runs last.
    ///
    /// `now` (ms since the epoch) is only consulted by `recentMs`; without it
    /// that stage is skipped.
    pub fn keep(&self, packet: &Packet, now: Option<i64>) -> bool {
        self.protocol_stage(packet)
            && self.function_stage(packet)
            && self.direction_stage(packet)
            && self.http_stage(packet)
            && self.size_stage(packet)
            && self.time_stage(packet, now)
            && self.keyword_stage(packet)
    }

    fn protocol_stage(&self, packet: &Packet) -> bool {
        let protocols = &self.conditions.protocols;
        protocols.is_empty() || protocols.contains(&packet.protocol)
    }

    fn direction_stage(&self, packet: &Packet) -> bool {
        self.conditions
            .direction
            .map_or(true, |direction| direction.admits(packet.direction))
    }

    fn function_stage(&self, packet: &Packet) -> bool {
        match (&self.conditions.packet_functions, packet.packet_function) {
            (Some(functions), Some(function)) if !functions.is_empty() => {
                functions.contains(&function)
            }
            _ => true,
        }
    }

    fn http_stage(&self, packet: &Packet) -> bool {
        let Some(http) = &packet.http else {
            return true;
        };
        if let Some(domain) = &self.domain {
            match http.host() {
                Some(host) if host.to_ascii_lowercase().contains(domain.as_str()) => {}
                _ => return false,
            }
        }
        if let Some(method) = &self.method {
            match &http.method {
                Some(m) if m.eq_ignore_ascii_case(method) => {}
                _ => return false,
            }
        }
        if let Some(status) = self.conditions.status_code {
            if http.status_code != Some(status) {
                return false;
            }
        }
        true
    }

    fn size_stage(&self, packet: &Packet) -> bool {
        if let Some(min) = self.conditions.min_size.filter(|n| *n > 0) {
            if packet.size < min {
                return false;
            }
        }
        if let Some(max) = self.conditions.max_size.filter(|n| *n > 0) {
            if packet.size > max {
                return false;
            }
        }
        true
    }

    fn keyword_stage(&self, packet: &Packet) -> bool {
        let pattern = match &self.keyword {
            Keyword::None => return true,
            Keyword::Invalid => return false,
            Keyword::Pattern(pattern) => pattern,
        };
        match &packet.http {
            Some(http) => self.search_http(pattern, http),
            None => search_payload(pattern, packet),
        }
    }

    fn search_http(&self, pattern: &CompiledPattern, http: &HttpInfo) -> bool {
        let targets = &self.conditions.search_in;
        let wants = |target: SearchTarget| targets.is_empty() || targets.contains(&target);

        if wants(SearchTarget::Url) {
            if let Some(url) = &http.url {
                if pattern.is_match_literal(url.as_bytes()) {
                    return true;
                }
            }
        }
        if wants(SearchTarget::Header) {
            let hit = http.headers.iter().any(|h| {
                pattern.is_match_literal(format!("{}: {}", h.name, h.value).as_bytes())
            });
            if hit {
                return true;
            }
        }
        if wants(SearchTarget::Body) {
            let bodies = [&http.request_body, &http.response_body];
            if bodies
                .iter()
                .filter_map(|body| body.as_deref())
                .any(|body| pattern.is_match_literal(body.as_bytes()))
            {
                return true;
            }
        }
        false
    }

    fn time_stage(&self, packet: &Packet, now: Option<i64>) -> bool {
        if let Some(range) = self.conditions.time_range {
            if packet.timestamp < range.start || packet.timestamp > range.end {
                return false;
            }
        }
        if let (Some(window), Some(now)) = (self.conditions.recent_ms, now) {
            if packet.timestamp < now.saturating_sub(window) {
                return false;
            }
        }
        true
    }
}

/// Search the pre-rendered data, then the hex projection, then the raw bytes
fn search_payload(pattern: &CompiledPattern, packet: &Packet) -> bool {
    if let Some(data) = &packet.packet_data {
        if pattern.is_match_literal(data.as_bytes()) {
            return true;
        }
    }
    match &packet.raw_data {
        Some(raw) => {
            pattern.is_match_literal(raw.hex().as_bytes()) || pattern.is_match_literal(raw.as_bytes())
        }
        None => false,
    }
}
