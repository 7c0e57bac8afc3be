//! Storage engine contract used by vnodes
//!
//! A vnode creates, opens and closes its engine repository through
//! [`TsdbEngine`] and feeds rows through [`TsdbRepo::insert`]. The engine calls
//! back into the vnode through [`TsdbAppHandle::wal_callback`] when it wants
//! the write-ahead log to roll to a new segment.
//!
//! [`MemTsdbEngine`] is a small reference engine that keeps rows in memory.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::vnode::VnodeId;
use crate::wal::WalRecord;

/// Name of the settings file inside a repository
const REPO_CFG_FILE: &str = "tsdb.json";

/// Rollover callback handed to the engine
pub type WalCallback = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// Repository settings. `None` leaves the value to the engine default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsdbCfg {
    /// Timestamp precision code
    pub precision: u8,
    /// Owning vnode
    pub tsdb_id: VnodeId,
    /// Maximum number of tables
    pub max_tables: u32,
    pub days_per_file: Option<u32>,
    pub min_rows_per_file_block: Option<u32>,
    pub max_rows_per_file_block: Option<u32>,
    pub keep: Option<u32>,
    pub max_cache_size: Option<u64>,
}

impl TsdbCfg {
    /// Settings with everything but identity and table limit left to the engine
    pub fn new(precision: u8, tsdb_id: VnodeId, max_tables: u32) -> Self {
        Self {
            precision,
            tsdb_id,
            max_tables,
            days_per_file: None,
            min_rows_per_file_block: None,
            max_rows_per_file_block: None,
            keep: None,
            max_cache_size: None,
        }
    }
}

/// Context the engine keeps about the vnode that opened it
#[derive(Clone)]
pub struct TsdbAppHandle {
    pub vg_id: VnodeId,
    pub wal_callback: WalCallback,
}

impl fmt::Debug for TsdbAppHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TsdbAppHandle")
            .field("vg_id", &self.vg_id)
            .finish_non_exhaustive()
    }
}

/// Storage engine factory
pub trait TsdbEngine: Send + Sync {
    /// Lay out a new repository at `path`
    fn create_repository(&self, path: &Path, cfg: &TsdbCfg) -> Result<()>;

    /// Open an existing repository
    fn open_repository(&self, path: &Path, app: TsdbAppHandle) -> Result<Arc<dyn TsdbRepo>>;
}

/// An open repository
pub trait TsdbRepo: Send + Sync {
    /// Apply one mutation
    fn insert(&self, record: &WalRecord) -> Result<()>;

    /// Highest version applied, 0 for an empty repository
    fn last_version(&self) -> u64;

    /// Close the repository. No callbacks are issued afterwards.
    fn close(&self) -> Result<()>;
}

/// Rows held for one repository path
#[derive(Debug, Default)]
struct RepoData {
    rows: Mutex<Vec<WalRecord>>,
}

/// In-memory reference engine.
///
/// Rows survive close/reopen of a repository for the life of the engine, and
/// rows whose version was already applied are skipped, so replaying a log
/// twice is harmless. Creating a repository starts it empty.
pub struct MemTsdbEngine {
    /// Rows between two rollover callbacks
    commit_every: usize,
    repos: RwLock<HashMap<PathBuf, Arc<RepoData>>>,
}

impl MemTsdbEngine {
    pub fn new(commit_every: usize) -> Self {
        Self {
            commit_every: commit_every.max(1),
            repos: RwLock::new(HashMap::new()),
        }
    }

    /// Rows applied to the repository at `path`
    pub fn rows(&self, path: &Path) -> Vec<WalRecord> {
        self.repos
            .read()
            .get(path)
            .map(|data| data.rows.lock().clone())
            .unwrap_or_default()
    }

    /// Read the settings of the repository at `path`
    pub fn read_cfg(path: &Path) -> Result<TsdbCfg> {
        let cfg_path = path.join(REPO_CFG_FILE);
        let content = fs::read_to_string(&cfg_path).map_err(|e| {
            Error::tsdb(format!("Repository not found at {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl Default for MemTsdbEngine {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl TsdbEngine for MemTsdbEngine {
    fn create_repository(&self, path: &Path, cfg: &TsdbCfg) -> Result<()> {
        fs::create_dir_all(path).map_err(|e| {
            Error::tsdb(format!("Failed to create repository {}: {}", path.display(), e))
        })?;

        let content = serde_json::to_string_pretty(cfg)?;
        fs::write(path.join(REPO_CFG_FILE), content).map_err(|e| {
            Error::tsdb(format!("Failed to write repository settings: {}", e))
        })?;

        // Rows of an earlier repository at this path are not carried over
        self.repos.write().insert(path.to_path_buf(), Arc::default());

        debug!(vg_id = cfg.tsdb_id, path = %path.display(), "tsdb repository created");
        Ok(())
    }

    fn open_repository(&self, path: &Path, app: TsdbAppHandle) -> Result<Arc<dyn TsdbRepo>> {
        let cfg = Self::read_cfg(path)?;
        let data = self
            .repos
            .write()
            .entry(path.to_path_buf())
            .or_default()
            .clone();

        Ok(Arc::new(MemRepo {
            cfg,
            data,
            app,
            commit_every: self.commit_every,
            uncommitted: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Repository handle of [`MemTsdbEngine`]
struct MemRepo {
    cfg: TsdbCfg,
    data: Arc<RepoData>,
    app: TsdbAppHandle,
    commit_every: usize,
    uncommitted: AtomicUsize,
    closed: AtomicBool,
}

impl TsdbRepo for MemRepo {
    fn insert(&self, record: &WalRecord) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::tsdb(format!("Repository of vnode {} is closed", self.cfg.tsdb_id)));
        }

        {
            let mut rows = self.data.rows.lock();
            if rows.last().is_some_and(|last| last.version >= record.version) {
                return Ok(());
            }
            rows.push(record.clone());
        }

        let pending = self.uncommitted.fetch_add(1, Ordering::AcqRel) + 1;
        if pending >= self.commit_every {
            self.uncommitted.store(0, Ordering::Release);
            debug!(vg_id = self.app.vg_id, rows = pending, "tsdb commit, renewing wal");
            (self.app.wal_callback)()?;
        }

        Ok(())
    }

    fn last_version(&self) -> u64 {
        self.data.rows.lock().last().map_or(0, |last| last.version)
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
