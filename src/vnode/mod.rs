//! Vnode lifecycle management
//!
//! A vnode is one partition of the node's data with its own directory,
//! write-ahead log, storage engine repository and request queues. This module
//! keeps the registry of vnodes, drives each one through
//! `Init -> Ready -> {Closing | Deleting}`, and hands out reference-counted
//! handles that keep a vnode's resources alive until the last holder lets go.

mod cfg_file;
mod handle;
mod manager;
mod registry;
mod state;
mod status;

pub use cfg_file::{
    parse_config, read_config, save_config, validate_config, NodeInfo, SyncConfig, CONFIG_FILE,
    MAX_REPLICA,
};
pub use handle::VnodeRef;
pub use manager::{CreateVnodeRequest, PeerDesc, VnodeManager};
pub use registry::VnodeRegistry;
pub use state::Vnode;
pub use status::{StatusReport, VnodeLoad, LOAD_RECORD_SIZE};

use serde::{Deserialize, Serialize};

/// Vnode id type, chosen by the caller
pub type VnodeId = i32;

/// Directory name prefix of a vnode root
pub(crate) const VNODE_DIR_PREFIX: &str = "vnode";

/// Infix of the name a dropped vnode root is moved to
pub(crate) const DROPPED_DIR_INFIX: &str = ".dropped.";

/// Sub-directory of a vnode root holding the write-ahead log
pub(crate) const WAL_DIR: &str = "wal";

/// Sub-directory of a vnode root holding the storage engine repository
pub(crate) const TSDB_DIR: &str = "tsdb";

/// Lifecycle state of a vnode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum VnodeStatus {
    /// Registered, still opening
    Init = 0,
    /// Accepting work
    Ready = 1,
    /// Closed, waiting for the last reference
    Closing = 2,
    /// Dropped, waiting for the last reference
    Deleting = 3,
}

impl VnodeStatus {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Init,
            1 => Self::Ready,
            2 => Self::Closing,
            _ => Self::Deleting,
        }
    }

    /// Whether this is one of the teardown states
    pub fn is_tearing_down(&self) -> bool {
        matches!(self, Self::Closing | Self::Deleting)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Deleting => "deleting",
        }
    }
}

impl std::fmt::Display for VnodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        for status in [
            VnodeStatus::Init,
            VnodeStatus::Ready,
            VnodeStatus::Closing,
            VnodeStatus::Deleting,
        ] {
            assert_eq!(VnodeStatus::from_u8(status as u8), status);
        }

        assert!(!VnodeStatus::Ready.is_tearing_down());
        assert!(VnodeStatus::Deleting.is_tearing_down());
        assert_eq!(VnodeStatus::Closing.to_string(), "closing");
    }
}
