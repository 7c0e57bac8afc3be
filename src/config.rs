//! Configuration for the vnode core
//!
//! This module provides the process-level options shared by every vnode on a
//! node. Per-vnode replication and WAL settings live in each vnode's own
//! config file, see [`crate::vnode::read_config`].

use std::path::{Path, PathBuf};
use serde::{Serialize, Deserialize};

use crate::error::{Result, Error};
use crate::vnode::VnodeId;

/// Upper bound on the number of WAL files a vnode may keep
pub const MAX_WAL_FILE_COUNT: u32 = 10;

/// Configuration options for a vnode manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VnodeConfig {
    /// Parent directory of every `vnode<id>` root
    pub vnode_dir: PathBuf,
    /// Maximum number of vnodes reported in a status message
    pub max_vnodes: usize,
    /// Number of WAL files written into new vnode configs
    pub wal_file_count: u32,
    /// Quorum written into new vnode configs
    pub quorum: u8,
    /// Whether to sync each WAL record to disk
    pub sync_wal_writes: bool,
    /// Whether a dropped vnode's directory is removed once it is released
    pub remove_dropped_data: bool,
}

impl Default for VnodeConfig {
    fn default() -> Self {
        Self {
            vnode_dir: PathBuf::from("vnode"),
            max_vnodes: 2048,
            wal_file_count: 3,
            quorum: 1,
            sync_wal_writes: false,
            remove_dropped_data: true,
        }
    }
}

impl VnodeConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the parent directory for vnode roots
    pub fn with_vnode_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.vnode_dir = path.as_ref().to_path_buf();
        self
    }

    /// Set the status report cap
    pub fn with_max_vnodes(mut self, max: usize) -> Self {
        self.max_vnodes = max;
        self
    }

    /// Set the WAL file count for new vnodes
    pub fn with_wal_file_count(mut self, count: u32) -> Self {
        self.wal_file_count = count;
        self
    }

    /// Set the quorum for new vnodes
    pub fn with_quorum(mut self, quorum: u8) -> Self {
        self.quorum = quorum;
        self
    }

    /// Set whether to sync WAL writes
    pub fn with_sync_wal_writes(mut self, sync: bool) -> Self {
        self.sync_wal_writes = sync;
        self
    }

    /// Set whether dropped vnode data is removed from disk
    pub fn with_remove_dropped_data(mut self, remove: bool) -> Self {
        self.remove_dropped_data = remove;
        self
    }

    /// Root directory of a vnode
    pub fn vnode_root(&self, vg_id: VnodeId) -> PathBuf {
        self.vnode_dir.join(format!("{}{}", crate::vnode::VNODE_DIR_PREFIX, vg_id))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_vnodes < 1 {
            return Err(Error::config("Max vnodes must be at least 1"));
        }

        if self.wal_file_count < 1 || self.wal_file_count > MAX_WAL_FILE_COUNT {
            return Err(Error::config(format!(
                "WAL file count must be between 1 and {}",
                MAX_WAL_FILE_COUNT
            )));
        }

        if self.quorum < 1 {
            return Err(Error::config("Quorum must be at least 1"));
        }

        Ok(())
    }

    /// Create a human-readable string representation of the configuration
    pub fn to_string_pretty(&self) -> String {
        let mut result = String::new();

        result.push_str("=== Vnode Configuration ===\n\n");
        result.push_str(&format!("  Vnode Directory: {:?}\n", self.vnode_dir));
        result.push_str(&format!("  Max Vnodes: {}\n", self.max_vnodes));
        result.push_str(&format!("  WAL File Count: {}\n", self.wal_file_count));
        result.push_str(&format!("  Quorum: {}\n", self.quorum));
        result.push_str(&format!("  Sync WAL Writes: {}\n", self.sync_wal_writes));
        result.push_str(&format!("  Remove Dropped Data: {}\n", self.remove_dropped_data));

        result
    }

    /// Load configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = VnodeConfig::default();

        assert_eq!(config.max_vnodes, 2048);
        assert_eq!(config.wal_file_count, 3);
        assert_eq!(config.quorum, 1);
        assert!(!config.sync_wal_writes);
        assert!(config.remove_dropped_data);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = VnodeConfig::new()
            .with_vnode_dir("/var/lib/taos/vnode")
            .with_max_vnodes(64)
            .with_wal_file_count(5)
            .with_quorum(2)
            .with_sync_wal_writes(true);

        assert_eq!(config.vnode_root(12), PathBuf::from("/var/lib/taos/vnode/vnode12"));
        assert_eq!(config.max_vnodes, 64);
        assert_eq!(config.wal_file_count, 5);
        assert_eq!(config.quorum, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let invalid_configs = vec![
            VnodeConfig::new().with_max_vnodes(0),
            VnodeConfig::new().with_wal_file_count(0),
            VnodeConfig::new().with_wal_file_count(MAX_WAL_FILE_COUNT + 1),
            VnodeConfig::new().with_quorum(0),
        ];

        for config in invalid_configs {
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_json_file_roundtrip() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("vnode.json");

        let config = VnodeConfig::new()
            .with_vnode_dir(dir.path())
            .with_remove_dropped_data(false);
        config.to_json_file(&path)?;

        let loaded = VnodeConfig::from_json_file(&path)?;
        assert_eq!(loaded, config);

        // Missing fields fall back to defaults
        std::fs::write(&path, r#"{ "max_vnodes": 16 }"#)?;
        let partial = VnodeConfig::from_json_file(&path)?;
        assert_eq!(partial.max_vnodes, 16);
        assert_eq!(partial.wal_file_count, 3);

        Ok(())
    }

    #[test]
    fn test_config_pretty_string() {
        let pretty = VnodeConfig::new().to_string_pretty();
        assert!(pretty.contains("Vnode Configuration"));
        assert!(pretty.contains("WAL File Count: 3"));
    }
}
