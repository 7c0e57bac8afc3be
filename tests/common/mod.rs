#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use vnode_rs::dispatch::ChannelDispatcher;
use vnode_rs::tsdb::{MemTsdbEngine, TsdbAppHandle, TsdbCfg, TsdbEngine, TsdbRepo};
use vnode_rs::wal::{FileWalFactory, Wal, WalConfig, WalFactory, WalRecord};
use vnode_rs::{Error, Result, VnodeConfig, VnodeId, VnodeManager};

/// Engine whose inserts can be made to fail, standing in for a process that
/// dies after logging a write but before the engine applies it
pub struct FlakyEngine {
    inner: MemTsdbEngine,
    fail_inserts: Arc<AtomicBool>,
}

impl FlakyEngine {
    pub fn new(commit_every: usize) -> Self {
        Self {
            inner: MemTsdbEngine::new(commit_every),
            fail_inserts: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_inserts.store(failing, Ordering::SeqCst);
    }

    pub fn rows(&self, path: &Path) -> Vec<WalRecord> {
        self.inner.rows(path)
    }
}

impl TsdbEngine for FlakyEngine {
    fn create_repository(&self, path: &Path, cfg: &TsdbCfg) -> Result<()> {
        self.inner.create_repository(path, cfg)
    }

    fn open_repository(&self, path: &Path, app: TsdbAppHandle) -> Result<Arc<dyn TsdbRepo>> {
        let inner = self.inner.open_repository(path, app)?;
        Ok(Arc::new(FlakyRepo {
            inner,
            fail_inserts: self.fail_inserts.clone(),
        }))
    }
}

struct FlakyRepo {
    inner: Arc<dyn TsdbRepo>,
    fail_inserts: Arc<AtomicBool>,
}

impl TsdbRepo for FlakyRepo {
    fn insert(&self, record: &WalRecord) -> Result<()> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(Error::tsdb(format!("insert of version {} lost", record.version)));
        }
        self.inner.insert(record)
    }

    fn last_version(&self) -> u64 {
        self.inner.last_version()
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

/// File log whose renew can be made to fail
pub struct FlakyWalFactory {
    inner: FileWalFactory,
    fail_renew: Arc<AtomicBool>,
}

impl FlakyWalFactory {
    pub fn new() -> Self {
        Self {
            inner: FileWalFactory::new(false),
            fail_renew: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_failing_renew(&self, failing: bool) {
        self.fail_renew.store(failing, Ordering::SeqCst);
    }
}

impl WalFactory for FlakyWalFactory {
    fn open(&self, path: &Path, config: &WalConfig) -> Result<Arc<dyn Wal>> {
        Ok(Arc::new(FlakyWal {
            inner: self.inner.open(path, config)?,
            fail_renew: self.fail_renew.clone(),
        }))
    }
}

struct FlakyWal {
    inner: Arc<dyn Wal>,
    fail_renew: Arc<AtomicBool>,
}

impl Wal for FlakyWal {
    fn write(&self, record: &WalRecord) -> Result<()> {
        self.inner.write(record)
    }

    fn restore(&self, apply: &mut dyn FnMut(WalRecord) -> Result<()>) -> Result<usize> {
        self.inner.restore(apply)
    }

    fn renew(&self) -> Result<()> {
        if self.fail_renew.load(Ordering::SeqCst) {
            return Err(Error::wal("no space for a new segment"));
        }
        self.inner.renew()
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

/// A manager plus handles on its collaborators
pub struct Harness {
    pub manager: VnodeManager,
    pub engine: Arc<FlakyEngine>,
    pub wal: Arc<FlakyWalFactory>,
    pub dispatcher: Arc<ChannelDispatcher>,
    pub vnode_dir: PathBuf,
}

impl Harness {
    pub fn new(vnode_dir: &Path) -> Self {
        Self::with_engine(vnode_dir, Arc::new(FlakyEngine::new(1024)))
    }

    pub fn with_engine(vnode_dir: &Path, engine: Arc<FlakyEngine>) -> Self {
        let dispatcher = Arc::new(ChannelDispatcher::new());
        let wal = Arc::new(FlakyWalFactory::new());
        let manager = VnodeManager::new(
            VnodeConfig::new().with_vnode_dir(vnode_dir),
            wal.clone(),
            engine.clone(),
            dispatcher.clone(),
        )
        .expect("manager");

        Self {
            manager,
            engine,
            wal,
            dispatcher,
            vnode_dir: vnode_dir.to_path_buf(),
        }
    }

    pub fn tsdb_path(&self, id: VnodeId) -> PathBuf {
        self.vnode_dir.join(format!("vnode{}", id)).join("tsdb")
    }

    /// Bodies of the rows the engine holds for vnode `id`
    pub fn bodies(&self, id: VnodeId) -> Vec<String> {
        self.engine
            .rows(&self.tsdb_path(id))
            .into_iter()
            .map(|row| String::from_utf8_lossy(&row.body).into_owned())
            .collect()
    }

    /// Names of the entries under the vnode root directory, sorted
    pub fn dir_entries(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.vnode_dir)
            .expect("vnode dir")
            .map(|entry| entry.expect("dir entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}
