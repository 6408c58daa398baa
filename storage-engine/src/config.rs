// SPDX-License-Identifier: GPL-3.0-only

//! Engine configuration
//!
//! Disk filtering and device protection, loaded from TOML. Ignored
//! disks are hidden from the visible tree rather than removed, so no
//! topology information is lost.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Disks to hide from the visible tree
    pub ignored_disks: Vec<String>,

    /// When non-empty, only these disks stay visible
    pub exclusive_disks: Vec<String>,

    /// Devices that are never torn down automatically
    pub protected_devices: Vec<String>,
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading engine config {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("parsing engine config")
    }

    /// Whether a disk should be hidden from the visible tree.
    pub fn is_ignored(&self, name: &str) -> bool {
        if !self.exclusive_disks.is_empty() {
            return !self.exclusive_disks.iter().any(|d| d == name);
        }
        self.ignored_disks.iter().any(|d| d == name)
    }

    pub fn is_protected(&self, name: &str) -> bool {
        self.protected_devices.iter().any(|d| d == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config = EngineConfig::from_toml_str(
            r#"
            ignored_disks = ["sdz"]
            protected_devices = ["sda1"]
            "#,
        )
        .expect("parse config");

        assert!(config.is_ignored("sdz"));
        assert!(!config.is_ignored("sda"));
        assert!(config.is_protected("sda1"));
    }

    #[test]
    fn exclusive_disks_invert_the_filter() {
        let config = EngineConfig::from_toml_str(r#"exclusive_disks = ["sda"]"#).expect("parse");
        assert!(!config.is_ignored("sda"));
        assert!(config.is_ignored("sdb"));
    }

    #[test]
    fn empty_config_ignores_nothing() {
        let config = EngineConfig::from_toml_str("").expect("parse");
        assert!(!config.is_ignored("sda"));
        assert!(!config.is_protected("sda"));
    }
}
