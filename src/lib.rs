//! # vnode_rs
//!
//! Vnode lifecycle core for a distributed time-series database node.
//!
//! A node hosts many vnodes. Each one lives in its own `vnode<id>` directory
//! with a config file, a write-ahead log and a storage engine repository.
//! [`VnodeManager`] creates, opens, closes and drops vnodes, replays the log
//! into the engine on open, and hands out counted [`VnodeRef`] handles that
//! keep a vnode's resources alive until the last holder releases them.
//!
//! ## Example
//!
//! ```no_run
//! use vnode_rs::{CreateVnodeRequest, VnodeConfig, VnodeManager};
//!
//! # fn main() -> vnode_rs::Result<()> {
//! let config = VnodeConfig::new().with_vnode_dir("/var/lib/tsdb/vnode");
//! let manager = VnodeManager::with_defaults(config)?;
//!
//! manager.create(&CreateVnodeRequest::new(1).with_peer(1, 16_777_343))?;
//!
//! let vnode = manager.acquire(1)?;
//! vnode.write(1, b"cpu,host=a usage=0.5".to_vec())?;
//! manager.release(vnode);
//!
//! let report = manager.status_report();
//! assert_eq!(report.ids(), vec![1]);
//!
//! manager.drop_vnode(1)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod tsdb;
pub mod vnode;
pub mod wal;

pub use config::VnodeConfig;
pub use error::{Error, ErrorCode, Result};
pub use metrics::VnodeMetrics;
pub use vnode::{
    CreateVnodeRequest, PeerDesc, StatusReport, SyncConfig, Vnode, VnodeId, VnodeLoad, VnodeManager,
    VnodeRef, VnodeStatus,
};
