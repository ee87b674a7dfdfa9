use serde::{Deserialize, Serialize};

use crate::models::packet::{Direction, PacketFunction, Protocol};

/// Direction constraint; `All` is the same as no constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectionFilter {
    Send,
    Receive,
    All,
}

impl DirectionFilter {
    pub fn admits(&self, direction: Direction) -> bool {
        match self {
            DirectionFilter::All => true,
            DirectionFilter::Send => direction == Direction::Send,
            DirectionFilter::Receive => direction == Direction::Receive,
        }
    }
}

/// Packet fields a keyword search looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchTarget {
    Url,
    Header,
    Body,
}

/// Inclusive timestamp window in ms since the epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

/// Display filter criteria. Every absent field is "no constraint".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterConditions {
    /// Empty matches any protocol
    pub protocols: Vec<Protocol>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<DirectionFilter>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_functions: Option<Vec<PacketFunction>>,

    /// Substring of the HTTP host
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_size: Option<usize>,

    /// Zero is treated as unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,

    pub use_regex: bool,

    pub search_in: Vec<SearchTarget>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,

    /// Keep only packets newer than `now - recentMs`; needs an explicit `now`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_ms: Option<i64>,
}

impl FilterConditions {
    /// True when no field constrains anything
    pub fn is_empty(&self) -> bool {
        *self == FilterConditions::default()
    }
}
