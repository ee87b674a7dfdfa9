use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::utils::error::AppResult;

/// Which capture collaborator feeds the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Generated demo traffic
    #[default]
    Simulated,
    /// Packets pushed to `/api/capture/ingest`
    Remote,
    /// No collaborator; starting a capture fails
    None,
}

/// Retention and sampling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureSettings {
    /// Maximum number of retained packets
    pub max_packets: usize,

    /// Periodically re-apply the retention bounds
    pub auto_cleanup: bool,

    /// Seconds between cleanup passes
    pub cleanup_interval: u64,

    /// Maximum retained payload bytes
    pub buffer_size: usize,

    /// Fraction of passing packets that are retained, 0.0..=1.0
    pub sample_rate: f64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            max_packets: 10_000,
            auto_cleanup: true,
            cleanup_interval: 60,
            buffer_size: 1024 * 1024,
            sample_rate: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdvancedSettings {
    pub log_level: String,
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// User settings file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub capture: CaptureSettings,
    pub advanced: AdvancedSettings,
}

impl AppSettings {
    /// Read settings from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> AppResult<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Port for the REST API server
    pub port: u16,

    pub source: SourceKind,

    pub settings: AppSettings,

    /// Where rule sets are loaded from and saved to
    pub rules_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            source: SourceKind::Simulated,
            settings: AppSettings::default(),
            rules_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_settings_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "capture": {{ "maxPackets": 50, "sampleRate": 0.5 }} }}"#).unwrap();

        let settings = AppSettings::load(file.path()).unwrap();
        assert_eq!(settings.capture.max_packets, 50);
        assert_eq!(settings.capture.sample_rate, 0.5);
        assert_eq!(settings.capture.cleanup_interval, 60);
        assert!(settings.capture.auto_cleanup);
        assert_eq!(settings.advanced.log_level, "info");
    }

    #[test]
    fn test_missing_settings_file() {
        assert!(AppSettings::load(Path::new("/nonexistent/settings.json")).is_err());
    }
}
