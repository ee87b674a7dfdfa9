//! Byte/text/regex feature matching against packet payloads.

use regex::bytes::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

use crate::engine::hex;
use crate::models::packet::Payload;
use crate::utils::error::{AppError, AppResult};

/// How a feature string is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    Hex,
    Text,
    Regex,
}

/// A feature pattern before compilation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeaturePattern {
    Hex(String),
    Text { value: String, ignore_case: bool },
    Regex(String),
}

impl FeaturePattern {
    /// Build a pattern from a free-form feature string.
    ///
    /// `re:` forces a regex; a string of only hex digits, `?` and whitespace
    /// is hex; anything else is literal text.
    pub fn infer(feature: &str) -> Self {
        if let Some(expr) = feature.strip_prefix("re:") {
            return FeaturePattern::Regex(expr.to_string());
        }
        if hex::looks_like_hex(feature) {
            FeaturePattern::Hex(feature.to_string())
        } else {
            FeaturePattern::Text {
                value: feature.to_string(),
                ignore_case: false,
            }
        }
    }

    /// Build a pattern with an explicit kind, inferring when none is given
    pub fn with_kind(feature: &str, kind: Option<PatternKind>, ignore_case: bool) -> Self {
        match kind {
            Some(PatternKind::Hex) => FeaturePattern::Hex(feature.to_string()),
            Some(PatternKind::Text) => FeaturePattern::Text {
                value: feature.to_string(),
                ignore_case,
            },
            Some(PatternKind::Regex) => FeaturePattern::Regex(feature.to_string()),
            None => match Self::infer(feature) {
                FeaturePattern::Text { value, .. } => FeaturePattern::Text { value, ignore_case },
                other => other,
            },
        }
    }
}

/// Byte offsets of a match, end exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MatchSpan {
    pub start: usize,
    pub end: usize,
}

/// A pattern ready to run against payloads. Compile once per rule.
#[derive(Debug, Clone)]
pub enum CompiledPattern {
    Bytes(Vec<Option<u8>>),
    Text {
        needle: Vec<u8>,
        hex_needle: String,
        ignore_case: bool,
    },
    Regex(Regex),
}

impl CompiledPattern {
    pub fn compile(pattern: &FeaturePattern) -> AppResult<Self> {
        match pattern {
            FeaturePattern::Hex(value) => Ok(CompiledPattern::Bytes(hex::decode_pattern(value)?)),
            FeaturePattern::Text { value, ignore_case } => {
                if value.is_empty() {
                    return Err(AppError::InvalidPattern("empty text pattern".to_string()));
                }
                Ok(CompiledPattern::Text {
                    needle: value.as_bytes().to_vec(),
                    hex_needle: value.to_ascii_lowercase(),
                    ignore_case: *ignore_case,
                })
            }
            FeaturePattern::Regex(expr) => RegexBuilder::new(expr)
                .build()
                .map(CompiledPattern::Regex)
                .map_err(|e| AppError::InvalidPattern(format!("regex '{}': {}", expr, e))),
        }
    }

    /// Compile a case-insensitive text or a regex search term
    pub fn keyword(keyword: &str, use_regex: bool) -> AppResult<Self> {
        if use_regex {
            Self::compile(&FeaturePattern::Regex(keyword.to_string()))
        } else {
            Self::compile(&FeaturePattern::Text {
                value: keyword.to_string(),
                ignore_case: true,
            })
        }
    }

    /// First match in a raw buffer. Text patterns also search the hex projection.
    pub fn find(&self, haystack: &[u8]) -> Option<MatchSpan> {
        self.find_with_projection(haystack, || Cow::Owned(hex::encode(haystack)))
    }

    /// Same as [`find`](Self::find) but reuses the payload's cached hex projection
    pub fn find_payload(&self, payload: &Payload) -> Option<MatchSpan> {
        self.find_with_projection(payload.as_bytes(), || Cow::Borrowed(payload.hex()))
    }

    /// First match in the literal bytes only
    pub fn find_literal(&self, haystack: &[u8]) -> Option<MatchSpan> {
        match self {
            CompiledPattern::Bytes(pattern) => find_wildcard(haystack, pattern),
            CompiledPattern::Text {
                needle,
                ignore_case,
                ..
            } => find_bytes(haystack, needle, *ignore_case),
            CompiledPattern::Regex(re) => re.find(haystack).map(|m| MatchSpan {
                start: m.start(),
                end: m.end(),
            }),
        }
    }

    pub fn is_match_literal(&self, haystack: &[u8]) -> bool {
        self.find_literal(haystack).is_some()
    }

    fn find_with_projection<'a, F>(&self, haystack: &[u8], projection: F) -> Option<MatchSpan>
    where
        F: FnOnce() -> Cow<'a, str>,
    {
        if let Some(span) = self.find_literal(haystack) {
            return Some(span);
        }
        match self {
            CompiledPattern::Text { hex_needle, .. } => {
                // the projection is lowercase, so compare without case
                let rendered = projection();
                let pos = find_bytes(rendered.as_bytes(), hex_needle.as_bytes(), true)?;
                let (start, end) = hex::projection_span_to_bytes(pos.start, pos.end);
                Some(MatchSpan {
                    start: start.min(haystack.len()),
                    end: end.min(haystack.len()),
                })
            }
            _ => None,
        }
    }
}

fn find_bytes(haystack: &[u8], needle: &[u8], ignore_case: bool) -> Option<MatchSpan> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| {
            if ignore_case {
                window.eq_ignore_ascii_case(needle)
            } else {
                window == needle
            }
        })
        .map(|start| MatchSpan {
            start,
            end: start + needle.len(),
        })
}

fn find_wildcard(haystack: &[u8], pattern: &[Option<u8>]) -> Option<MatchSpan> {
    if pattern.is_empty() || pattern.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(pattern.len())
        .position(|window| {
            window
                .iter()
                .zip(pattern)
                .all(|(byte, expected)| expected.map_or(true, |e| e == *byte))
        })
        .map(|start| MatchSpan {
            start,
            end: start + pattern.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(feature: &str) -> CompiledPattern {
        CompiledPattern::compile(&FeaturePattern::infer(feature)).unwrap()
    }

    #[test]
    fn test_infer_kinds() {
        assert_eq!(FeaturePattern::infer("AA BB"), FeaturePattern::Hex("AA BB".into()));
        assert_eq!(FeaturePattern::infer("re:^GET"), FeaturePattern::Regex("^GET".into()));
        assert!(matches!(FeaturePattern::infer("GET /"), FeaturePattern::Text { .. }));
    }

    #[test]
    fn test_hex_match_position() {
        let span = compile("bb cc").find(&[0xaa, 0xbb, 0xcc, 0xdd]).unwrap();
        assert_eq!(span, MatchSpan { start: 1, end: 3 });
    }

    #[test]
    fn test_hex_wildcard_match() {
        let pattern = compile("bb ?? dd");
        assert!(pattern.find(&[0x11, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]).is_some());
        assert!(pattern.find(&[0xbb, 0xcc, 0xde]).is_none());
    }

    #[test]
    fn test_hex_pattern_longer_than_data() {
        assert!(compile("aa bb cc dd").find(&[0xaa, 0xbb, 0xcc]).is_none());
    }

    #[test]
    fn test_malformed_hex_is_invalid_pattern() {
        let err = CompiledPattern::compile(&FeaturePattern::Hex("aa b".into())).unwrap_err();
        assert!(matches!(err, AppError::InvalidPattern(_)));
    }

    #[test]
    fn test_text_case_sensitivity() {
        let sensitive = CompiledPattern::compile(&FeaturePattern::Text {
            value: "Host".into(),
            ignore_case: false,
        })
        .unwrap();
        let insensitive = CompiledPattern::compile(&FeaturePattern::Text {
            value: "Host".into(),
            ignore_case: true,
        })
        .unwrap();
        assert!(sensitive.find_literal(b"host: a").is_none());
        assert_eq!(
            insensitive.find_literal(b"xhost: a"),
            Some(MatchSpan { start: 1, end: 5 })
        );
    }

    #[test]
    fn test_text_searches_hex_projection() {
        // "c dd" only exists in the rendered form "aa bc dd"
        let pattern = CompiledPattern::compile(&FeaturePattern::Text {
            value: "c dd".into(),
            ignore_case: false,
        })
        .unwrap();
        let span = pattern.find(&[0xaa, 0xbc, 0xdd]).unwrap();
        assert_eq!(span, MatchSpan { start: 1, end: 3 });
    }

    #[test]
    fn test_payload_projection_is_reused() {
        let payload = Payload::from(vec![0x01, 0x02, 0x03]);
        let pattern = CompiledPattern::compile(&FeaturePattern::Text {
            value: "02 03".into(),
            ignore_case: false,
        })
        .unwrap();
        assert_eq!(pattern.find_payload(&payload), Some(MatchSpan { start: 1, end: 3 }));
    }

    #[test]
    fn test_regex_first_match() {
        let pattern = compile("re:[0-9]+");
        assert_eq!(pattern.find(b"ab12cd345"), Some(MatchSpan { start: 2, end: 4 }));
    }

    #[test]
    fn test_bad_regex_reports_invalid_pattern() {
        let err = CompiledPattern::compile(&FeaturePattern::Regex("(unclosed".into())).unwrap_err();
        assert!(matches!(err, AppError::InvalidPattern(_)));
    }
}
