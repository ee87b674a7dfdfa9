//! Rule sets saved as JSON between sessions.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::models::rule::{PacketFeatureRule, ReplaceRule};
use crate::utils::error::AppResult;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleFile {
    pub feature_rules: Vec<PacketFeatureRule>,
    pub replace_rules: Vec<ReplaceRule>,
}

impl RuleFile {
    /// Read a rule file; a missing file is an empty rule set
    pub fn load(path: &Path) -> AppResult<Self> {
        if !path.exists() {
            info!("No rule file at {}, starting with empty rule sets", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let rules: RuleFile = serde_json::from_str(&content)?;
        info!(
            "Loaded {} feature rules and {} replace rules from {}",
            rules.feature_rules.len(),
            rules.replace_rules.len(),
            path.display()
        );
        Ok(rules)
    }

    /// Write the rule file, replacing it atomically
    pub fn save(&self, path: &Path) -> AppResult<()> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.persist(path).map_err(|e| e.error)?;
        debug!("Saved rules to {}", path.display());
        Ok(())
    }
}
