//! Worker inventory.
//!
//! The inventory is an explicitly passed configuration struct handed to the
//! orchestrator at construction, never ambient state, so tests inject
//! fixtures freely. The TOML loader only serves the CLI boundary.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Inventory errors.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

fn default_port() -> u16 {
    22
}

/// One configured worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerEntry {
    /// Worker name, referenced by jobs and the CLI.
    pub name: String,
    /// SSH host.
    pub host: String,
    /// SSH user.
    #[serde(default)]
    pub user: Option<String>,
    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Remote work root override.
    #[serde(default)]
    pub work_root: Option<String>,
    /// Free-form tags for selection.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// The worker inventory (workers.toml shape).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerInventory {
    #[serde(default)]
    pub workers: Vec<WorkerEntry>,
}

impl WorkerInventory {
    /// Load the inventory from a TOML file.
    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Find a worker by name.
    pub fn find(&self, name: &str) -> Option<&WorkerEntry> {
        self.workers.iter().find(|worker| worker.name == name)
    }

    /// Workers carrying all of the given tags.
    pub fn with_tags(&self, tags: &[String]) -> Vec<&WorkerEntry> {
        self.workers
            .iter()
            .filter(|worker| tags.iter().all(|tag| worker.tags.contains(tag)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[workers]]
name = "mac-01"
host = "mac-01.example"
user = "relay"
tags = ["macos", "xcode"]

[[workers]]
name = "mac-02"
host = "mac-02.example"
port = 2222
tags = ["macos"]
"#;

    #[test]
    fn test_parse_inventory() {
        let inventory: WorkerInventory = toml::from_str(SAMPLE).unwrap();
        assert_eq!(inventory.workers.len(), 2);
        assert_eq!(inventory.workers[0].port, 22);
        assert_eq!(inventory.workers[1].port, 2222);
        assert_eq!(inventory.workers[0].user.as_deref(), Some("relay"));
    }

    #[test]
    fn test_find_by_name() {
        let inventory: WorkerInventory = toml::from_str(SAMPLE).unwrap();
        assert!(inventory.find("mac-02").is_some());
        assert!(inventory.find("mac-99").is_none());
    }

    #[test]
    fn test_filter_by_tags() {
        let inventory: WorkerInventory = toml::from_str(SAMPLE).unwrap();
        let macos = inventory.with_tags(&["macos".to_string()]);
        assert_eq!(macos.len(), 2);
        let xcode = inventory.with_tags(&["xcode".to_string()]);
        assert_eq!(xcode.len(), 1);
        assert_eq!(xcode[0].name, "mac-01");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("workers.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let inventory = WorkerInventory::load(&path).unwrap();
        assert_eq!(inventory.workers.len(), 2);
    }
}
