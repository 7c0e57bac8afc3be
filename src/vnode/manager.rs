use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{
    read_config, save_config, validate_config, NodeInfo, StatusReport, SyncConfig, Vnode, VnodeId,
    VnodeRef, VnodeRegistry, VnodeStatus, DROPPED_DIR_INFIX, TSDB_DIR, VNODE_DIR_PREFIX, WAL_DIR,
};
use crate::config::VnodeConfig;
use crate::dispatch::{ChannelDispatcher, Dispatcher, QueueHandle};
use crate::error::{Error, Result};
use crate::metrics::VnodeMetrics;
use crate::tsdb::{MemTsdbEngine, TsdbAppHandle, TsdbCfg, TsdbEngine};
use crate::wal::{FileWalFactory, WalConfig, WalFactory};

/// A replica of a vnode as named by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDesc {
    pub dnode_id: i32,
    pub ip: u32,
}

/// Parameters of a vnode create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVnodeRequest {
    pub vg_id: VnodeId,
    /// Timestamp precision code
    pub precision: u8,
    pub max_tables: u32,
    /// Days covered by one data file, 0 for the engine default
    pub days_per_file: u32,
    pub commit_log: bool,
    pub peers: Vec<PeerDesc>,
}

impl CreateVnodeRequest {
    pub fn new(vg_id: VnodeId) -> Self {
        Self {
            vg_id,
            precision: 0,
            max_tables: 1000,
            days_per_file: 0,
            commit_log: true,
            peers: Vec::new(),
        }
    }

    pub fn with_precision(mut self, precision: u8) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_max_tables(mut self, max_tables: u32) -> Self {
        self.max_tables = max_tables;
        self
    }

    pub fn with_days_per_file(mut self, days: u32) -> Self {
        self.days_per_file = days;
        self
    }

    pub fn with_commit_log(mut self, commit_log: bool) -> Self {
        self.commit_log = commit_log;
        self
    }

    pub fn with_peer(mut self, dnode_id: i32, ip: u32) -> Self {
        self.peers.push(PeerDesc { dnode_id, ip });
        self
    }

    /// Replica-set settings persisted for this vnode
    pub fn sync_config(&self, quorum: u8) -> SyncConfig {
        SyncConfig {
            arbitrator_ip: self.peers.first().map(|peer| peer.ip).unwrap_or(0),
            quorum,
            node_info: self
                .peers
                .iter()
                .map(|peer| NodeInfo {
                    node_id: peer.dnode_id,
                    node_ip: peer.ip,
                    name: format!("n{}", peer.dnode_id),
                })
                .collect(),
        }
    }

    fn tsdb_cfg(&self) -> TsdbCfg {
        let mut cfg = TsdbCfg::new(self.precision, self.vg_id, self.max_tables);
        if self.days_per_file > 0 {
            cfg.days_per_file = Some(self.days_per_file);
        }
        cfg
    }
}

/// Owns the vnodes of one node
pub struct VnodeManager {
    config: VnodeConfig,
    registry: VnodeRegistry,
    wal_factory: Arc<dyn WalFactory>,
    engine: Arc<dyn TsdbEngine>,
    dispatcher: Arc<dyn Dispatcher>,
    metrics: Arc<VnodeMetrics>,
    /// Keeps tombstone names unique within one timestamp
    drop_seq: AtomicU64,
}

impl VnodeManager {
    /// Create a manager over `config.vnode_dir`, creating the directory if
    /// needed.
    pub fn new(
        config: VnodeConfig,
        wal_factory: Arc<dyn WalFactory>,
        engine: Arc<dyn TsdbEngine>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Self> {
        config.validate()?;

        fs::create_dir_all(&config.vnode_dir)
            .map_err(|e| Error::from_dir_error(&config.vnode_dir, e))?;

        info!(path = %config.vnode_dir.display(), "vnode manager started");

        Ok(Self {
            config,
            registry: VnodeRegistry::new(),
            wal_factory,
            engine,
            dispatcher,
            metrics: Arc::new(VnodeMetrics::new()),
            drop_seq: AtomicU64::new(0),
        })
    }

    /// Manager using the file log, in-memory engine and channel queues
    pub fn with_defaults(config: VnodeConfig) -> Result<Self> {
        let wal_factory = Arc::new(FileWalFactory::new(config.sync_wal_writes));
        Self::new(
            config,
            wal_factory,
            Arc::new(MemTsdbEngine::default()),
            Arc::new(ChannelDispatcher::new()),
        )
    }

    pub fn config(&self) -> &VnodeConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<VnodeMetrics> {
        &self.metrics
    }

    pub fn registry(&self) -> &VnodeRegistry {
        &self.registry
    }

    pub fn contains(&self, id: VnodeId) -> bool {
        self.registry.contains(id)
    }

    /// Look up a vnode without taking a reference
    pub fn lookup(&self, id: VnodeId) -> Option<Arc<Vnode>> {
        self.registry.lookup(id)
    }

    /// Create a vnode on disk and open it.
    ///
    /// Creating a vnode that is already registered succeeds without doing
    /// anything. A directory left by an earlier failed create is reused. A
    /// request whose config could not be read back is refused before anything
    /// touches the disk.
    pub fn create(&self, req: &CreateVnodeRequest) -> Result<()> {
        let vg_id = req.vg_id;
        if let Some(existing) = self.registry.lookup(vg_id) {
            debug!(vg_id, status = %existing.status(), "vnode already exist");
            return Ok(());
        }

        let wal_cfg = WalConfig {
            commit_log: req.commit_log,
            wal_file_count: self.config.wal_file_count,
        };
        let sync_cfg = req.sync_config(self.config.quorum);
        validate_config(vg_id, &wal_cfg, &sync_cfg).map_err(|e| {
            error!(vg_id, error = %e, "refusing to create vnode");
            e
        })?;

        let root = self.config.vnode_root(vg_id);
        match fs::create_dir(&root) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!(vg_id, path = %root.display(), "reusing vnode directory");
            }
            Err(e) => {
                error!(vg_id, path = %root.display(), error = %e, "failed to create vnode directory");
                return Err(Error::from_dir_error(&root, e));
            }
        }

        save_config(vg_id, &root, &wal_cfg, &sync_cfg)?;

        self.engine
            .create_repository(&root.join(TSDB_DIR), &req.tsdb_cfg())
            .map_err(|e| {
                error!(vg_id, error = %e, "failed to create tsdb in vnode");
                e
            })?;

        self.metrics.increment_creates();
        info!(vg_id, commit_log = req.commit_log, "vnode is created");

        self.open_at(vg_id, &root)
    }

    /// Open the vnode under its default root
    pub fn open(&self, id: VnodeId) -> Result<()> {
        let root = self.config.vnode_root(id);
        self.open_at(id, &root)
    }

    /// Open the vnode stored in `root_dir` and replay its log.
    ///
    /// Opening an id that is already registered returns success and leaves
    /// the registered vnode alone. Opens of the same id must not run
    /// concurrently.
    pub fn open_at(&self, id: VnodeId, root_dir: &Path) -> Result<()> {
        let start = Instant::now();

        let vnode = Arc::new(Vnode::new(
            id,
            root_dir.to_path_buf(),
            self.config.remove_dropped_data,
            self.dispatcher.clone(),
            self.metrics.clone(),
        ));

        let (registered, inserted) = self.registry.insert(vnode.clone());
        if !inserted {
            debug!(vg_id = id, status = %registered.status(), "vnode already registered");
            return Ok(());
        }

        let (wal_cfg, sync_cfg) = match read_config(id, root_dir) {
            Ok(cfg) => cfg,
            Err(e) => {
                self.abort_open(&vnode);
                return Err(e);
            }
        };
        vnode.set_config(wal_cfg, sync_cfg);

        let replayed = match self.bring_online(&vnode, root_dir) {
            Ok(replayed) => replayed,
            Err(e) => {
                error!(vg_id = id, path = %root_dir.display(), error = %e, "failed to open vnode");
                self.abort_open(&vnode);
                return Err(e);
            }
        };

        vnode.mark_ready();
        self.metrics.record_open(start.elapsed());
        info!(
            vg_id = id,
            replayed,
            version = vnode.version(),
            path = %root_dir.display(),
            "vnode is opened"
        );

        Ok(())
    }

    /// Allocate queues, open log and engine, then replay the log
    fn bring_online(&self, vnode: &Arc<Vnode>, root_dir: &Path) -> Result<usize> {
        vnode.allocate_queues();

        let wal = self
            .wal_factory
            .open(&root_dir.join(WAL_DIR), &vnode.wal_config())?;
        vnode.attach_wal(wal);

        let app = TsdbAppHandle {
            vg_id: vnode.id(),
            wal_callback: vnode.rollover_callback(),
        };
        let tsdb = self.engine.open_repository(&root_dir.join(TSDB_DIR), app)?;
        vnode.seed_version(tsdb.last_version());
        vnode.attach_tsdb(tsdb);

        vnode.replay_wal()
    }

    /// Undo a partial open
    fn abort_open(&self, vnode: &Arc<Vnode>) {
        self.registry.remove_if_same(vnode);

        if let Err(e) = vnode.close_tsdb() {
            warn!(vg_id = vnode.id(), error = %e, "failed to close tsdb of vnode");
        }
        if let Err(e) = vnode.close_wal() {
            warn!(vg_id = vnode.id(), error = %e, "failed to close wal of vnode");
        }

        vnode.release_ref();
    }

    /// Close a vnode. Closing an unknown id succeeds.
    pub fn close(&self, id: VnodeId) -> Result<()> {
        let Some(vnode) = self.registry.lookup(id) else {
            return Ok(());
        };

        debug!(vg_id = id, "vnode will be closed");
        vnode.begin_teardown(VnodeStatus::Closing)?;
        self.teardown(&vnode, VnodeStatus::Closing)
    }

    /// Drop a vnode.
    ///
    /// The root directory is moved aside right away, so the id can be
    /// created again while old handles are still held. The moved data is
    /// removed once the last reference goes away.
    pub fn drop_vnode(&self, id: VnodeId) -> Result<()> {
        let Some(vnode) = self.registry.lookup(id) else {
            debug!(vg_id = id, "failed to drop, vgId not exist");
            return Err(Error::InvalidVgroupId(id));
        };

        debug!(vg_id = id, "vnode will be dropped");
        vnode.begin_teardown(VnodeStatus::Deleting)?;

        // The root is only moved while no other vnode can claim the id.
        // Data that cannot be moved stays where it is.
        let tombstone = self.tombstone_path(id);
        if self.registry.while_registered(&vnode, || vnode.mark_drop(tombstone)).is_none() {
            debug!(vg_id = id, "vnode already left the registry, data is kept");
        }
        self.teardown(&vnode, VnodeStatus::Deleting)
    }

    /// Unique name a dropped vnode's root is moved to
    fn tombstone_path(&self, id: VnodeId) -> PathBuf {
        let seq = self.drop_seq.fetch_add(1, Ordering::Relaxed);
        self.config.vnode_dir.join(format!(
            "{}{}{}{}-{}",
            VNODE_DIR_PREFIX,
            id,
            DROPPED_DIR_INFIX,
            Utc::now().timestamp_micros(),
            seq
        ))
    }

    /// Remove from the registry, close engine then log, and give up the
    /// implicit reference. Only the caller that removes the entry does this.
    fn teardown(&self, vnode: &Arc<Vnode>, kind: VnodeStatus) -> Result<()> {
        if !self.registry.remove_if_same(vnode) {
            debug!(vg_id = vnode.id(), "vnode teardown already in progress");
            return Ok(());
        }

        match kind {
            VnodeStatus::Deleting => self.metrics.increment_drops(),
            _ => self.metrics.increment_closes(),
        }

        let tsdb_result = vnode.close_tsdb();
        if let Err(e) = &tsdb_result {
            error!(vg_id = vnode.id(), error = %e, "failed to close tsdb of vnode");
        }

        let wal_result = vnode.close_wal();
        if let Err(e) = &wal_result {
            error!(vg_id = vnode.id(), error = %e, "failed to close wal of vnode");
        }

        info!(vg_id = vnode.id(), status = %kind, ref_count = vnode.ref_count(), "vnode is closed");
        vnode.release_ref();

        tsdb_result.and(wal_result)
    }

    /// Take a reference to a ready vnode
    pub fn acquire(&self, id: VnodeId) -> Result<VnodeRef> {
        self.registry.acquire(id)
    }

    /// Give a reference back
    pub fn release(&self, handle: VnodeRef) {
        handle.release();
    }

    /// Take a reference together with the vnode's write queue
    pub fn get_write_queue(&self, id: VnodeId) -> Result<(VnodeRef, QueueHandle)> {
        let handle = self.acquire(id)?;
        let queue = handle.write_queue().ok_or(Error::NotActiveVnode(id))?;
        Ok((handle, queue))
    }

    /// Take a reference together with the vnode's read queue
    pub fn get_read_queue(&self, id: VnodeId) -> Result<(VnodeRef, QueueHandle)> {
        let handle = self.acquire(id)?;
        let queue = handle.read_queue().ok_or(Error::NotActiveVnode(id))?;
        Ok((handle, queue))
    }

    /// Apply one mutation to a vnode. Returns its version.
    pub fn write(&self, id: VnodeId, msg_type: u8, body: impl Into<Vec<u8>>) -> Result<u64> {
        let handle = self.acquire(id)?;
        handle.write(msg_type, body)
    }

    /// Loads of up to `max_entries` vnodes
    pub fn build_status_report(&self, max_entries: usize) -> StatusReport {
        StatusReport::build(&self.registry, max_entries)
    }

    /// Loads of up to the configured number of vnodes
    pub fn status_report(&self) -> StatusReport {
        self.build_status_report(self.config.max_vnodes)
    }

    /// Open every vnode directory found under the vnode root.
    ///
    /// A vnode that fails to open is logged and skipped. Returns the ids that
    /// are registered afterwards, in order.
    pub fn open_existing(&self) -> Result<Vec<VnodeId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.config.vnode_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };

            if name.contains(DROPPED_DIR_INFIX) {
                self.remove_tombstone(&entry.path());
                continue;
            }

            let id = name
                .strip_prefix(VNODE_DIR_PREFIX)
                .and_then(|id| id.parse::<VnodeId>().ok());

            if let Some(id) = id {
                ids.push(id);
            }
        }
        ids.sort_unstable();

        let mut opened = Vec::with_capacity(ids.len());
        for id in ids {
            match self.open(id) {
                Ok(()) => opened.push(id),
                Err(e) => error!(vg_id = id, error = %e, "failed to open vnode at startup"),
            }
        }

        info!(count = opened.len(), "vnodes opened");
        Ok(opened)
    }

    /// Data of a vnode dropped before the last shutdown
    fn remove_tombstone(&self, path: &Path) {
        if !self.config.remove_dropped_data {
            return;
        }

        match fs::remove_dir_all(path) {
            Ok(()) => info!(path = %path.display(), "removed data of dropped vnode"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove data of dropped vnode"),
        }
    }

    /// Close every registered vnode in parallel. Returns the first error.
    pub fn close_all(&self) -> Result<()> {
        let ids = self.registry.ids();
        let results: Vec<Result<()>> = ids.par_iter().map(|&id| self.close(id)).collect();

        info!(count = ids.len(), "vnodes closed");
        results.into_iter().collect()
    }
}

impl Drop for VnodeManager {
    fn drop(&mut self) {
        if let Err(e) = self.close_all() {
            error!(error = %e, "failed to close vnodes on shutdown");
        }
    }
}
