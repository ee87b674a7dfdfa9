use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::engine::hex;
use crate::engine::matcher::{FeaturePattern, PatternKind};
use crate::models::filter::DirectionFilter;
use crate::models::packet::{Direction, PacketFunction, Protocol};
use crate::utils::error::{AppError, AppResult};

fn default_true() -> bool {
    true
}

/// Byte/text feature bound to record, filter and replace actions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketFeatureRule {
    #[serde(default)]
    pub id: String,

    /// Socket call the rule applies to
    #[serde(rename = "type")]
    pub function: PacketFunction,

    pub feature: String,

    /// Explicit interpretation of `feature`; inferred when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_kind: Option<PatternKind>,

    #[serde(default)]
    pub ignore_case: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement_kind: Option<PatternKind>,

    #[serde(default)]
    pub only_record: bool,

    #[serde(default)]
    pub filter: bool,

    #[serde(default)]
    pub replace: bool,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Packets matched so far; owned by the engine
    #[serde(default)]
    pub match_count: u64,

    /// Set when the feature or replacement cannot be compiled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PacketFeatureRule {
    pub fn new(function: PacketFunction, feature: &str) -> Self {
        Self {
            id: String::new(),
            function,
            feature: feature.to_string(),
            feature_kind: None,
            ignore_case: false,
            replacement: None,
            replacement_kind: None,
            only_record: false,
            filter: false,
            replace: false,
            enabled: true,
            match_count: 0,
            error: None,
        }
    }

    pub fn pattern(&self) -> FeaturePattern {
        FeaturePattern::with_kind(&self.feature, self.feature_kind, self.ignore_case)
    }

    /// Bytes spliced in place of a match, if a replacement is configured
    pub fn replacement_bytes(&self) -> AppResult<Option<Vec<u8>>> {
        let Some(replacement) = &self.replacement else {
            return Ok(None);
        };
        let kind = match self.replacement_kind {
            Some(kind) => kind,
            None if hex::looks_like_hex(replacement) => PatternKind::Hex,
            None => PatternKind::Text,
        };
        match kind {
            PatternKind::Hex => hex::decode(replacement).map(Some),
            PatternKind::Text => Ok(Some(replacement.as_bytes().to_vec())),
            PatternKind::Regex => Err(AppError::InvalidPattern(
                "a replacement cannot be a regex".to_string(),
            )),
        }
    }
}

/// How often a replace rule may fire over its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyTo {
    #[default]
    All,
    First,
    Count,
}

/// Validated form of `applyTo` + `applyCount`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPolicy {
    All,
    First,
    Count(u32),
}

/// Structured conditions; absent fields always pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MatchConditions {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub protocol: Vec<Protocol>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<DirectionFilter>,

    /// Glob with `*` wildcards, or a regex when prefixed with `re:`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_pattern: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    /// Every listed header must be present with an equal value (case-insensitive)
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub header_match: BTreeMap<String, String>,
}

/// Replacement body or raw data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Content {
    Text(String),
    Hex(String),
}

impl Content {
    pub fn to_bytes(&self) -> AppResult<Vec<u8>> {
        match self {
            Content::Text(text) => Ok(text.as_bytes().to_vec()),
            Content::Hex(digits) => hex::decode(digits),
        }
    }
}

/// One overridden field of a packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "camelCase")]
pub enum ReplacementOp {
    Method(String),
    Url(String),
    /// Merge-overwrite, header names compared case-insensitively
    Headers(BTreeMap<String, String>),
    RequestBody(Content),
    ResponseBody(Content),
    StatusCode(u16),
    /// Replace the raw payload bytes
    Data(Content),
}

/// Which packet direction a replacement is allowed to touch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplaceDirection {
    Send,
    Receive,
    #[default]
    Both,
}

impl ReplaceDirection {
    pub fn admits(&self, direction: Direction) -> bool {
        match self {
            ReplaceDirection::Both => true,
            ReplaceDirection::Send => direction == Direction::Send,
            ReplaceDirection::Receive => direction == Direction::Receive,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketReplacement {
    #[serde(default)]
    pub ops: Vec<ReplacementOp>,
    #[serde(default)]
    pub replace_direction: ReplaceDirection,
}

/// Protocol-aware rewrite rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceRule {
    #[serde(default)]
    pub id: String,

    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub match_conditions: MatchConditions,

    #[serde(default)]
    pub replacement: PacketReplacement,

    #[serde(default)]
    pub apply_to: ApplyTo,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,

    /// Packets whose conditions matched; owned by the engine
    #[serde(default)]
    pub match_count: u64,

    /// Times the replacement was applied; owned by the engine
    #[serde(default)]
    pub fire_count: u64,

    #[serde(default)]
    pub has_fired: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReplaceRule {
    pub fn new(name: &str, replacement: PacketReplacement) -> Self {
        Self {
            id: String::new(),
            name: name.to_string(),
            enabled: true,
            match_conditions: MatchConditions::default(),
            replacement,
            apply_to: ApplyTo::All,
            apply_count: None,
            created_at: None,
            updated_at: None,
            match_count: 0,
            fire_count: 0,
            has_fired: false,
            error: None,
        }
    }

    /// `applyTo=count` requires a positive `applyCount`
    pub fn policy(&self) -> AppResult<ApplyPolicy> {
        match (self.apply_to, self.apply_count) {
            (ApplyTo::All, _) => Ok(ApplyPolicy::All),
            (ApplyTo::First, _) => Ok(ApplyPolicy::First),
            (ApplyTo::Count, Some(n)) if n > 0 => Ok(ApplyPolicy::Count(n)),
            (ApplyTo::Count, _) => Err(AppError::InvalidRule(format!(
                "rule '{}': applyTo=count needs applyCount > 0",
                self.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_rule_wire_format() {
        let rule: PacketFeatureRule = serde_json::from_value(serde_json::json!({
            "type": "WSASend",
            "feature": "AA BB",
            "filter": true
        }))
        .unwrap();
        assert_eq!(rule.function, PacketFunction::WsaSend);
        assert!(rule.filter && !rule.replace && !rule.only_record);
        assert!(rule.enabled);
        assert_eq!(rule.pattern(), FeaturePattern::Hex("AA BB".into()));
    }

    #[test]
    fn test_replacement_bytes_inference() {
        let mut rule = PacketFeatureRule::new(PacketFunction::Send, "aa");
        rule.replacement = Some("01 02".into());
        assert_eq!(rule.replacement_bytes().unwrap(), Some(vec![1, 2]));
        rule.replacement = Some("hi!".into());
        assert_eq!(rule.replacement_bytes().unwrap(), Some(b"hi!".to_vec()));
        rule.replacement_kind = Some(PatternKind::Regex);
        assert!(rule.replacement_bytes().is_err());
    }

    #[test]
    fn test_apply_count_validation() {
        let mut rule = ReplaceRule::new("r", PacketReplacement::default());
        rule.apply_to = ApplyTo::Count;
        assert!(matches!(rule.policy(), Err(AppError::InvalidRule(_))));
        rule.apply_count = Some(0);
        assert!(rule.policy().is_err());
        rule.apply_count = Some(3);
        assert_eq!(rule.policy().unwrap(), ApplyPolicy::Count(3));
    }

    #[test]
    fn test_replacement_op_wire_format() {
        let replacement: PacketReplacement = serde_json::from_value(serde_json::json!({
            "ops": [
                { "op": "statusCode", "value": 404 },
                { "op": "responseBody", "value": { "text": "gone" } },
                { "op": "headers", "value": { "X-Test": "1" } }
            ],
            "replaceDirection": "receive"
        }))
        .unwrap();
        assert_eq!(replacement.ops[0], ReplacementOp::StatusCode(404));
        assert_eq!(
            replacement.ops[1],
            ReplacementOp::ResponseBody(Content::Text("gone".into()))
        );
        assert_eq!(replacement.replace_direction, ReplaceDirection::Receive);
    }
}
