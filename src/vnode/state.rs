use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use super::{SyncConfig, VnodeId, VnodeStatus};
use crate::dispatch::{Dispatcher, QueueHandle, QueueKind};
use crate::error::{Error, Result};
use crate::metrics::VnodeMetrics;
use crate::tsdb::{TsdbRepo, WalCallback};
use crate::wal::{Wal, WalConfig, WalRecord};

/// One vnode and the resources it owns.
///
/// A `Vnode` is shared between the registry and every [`VnodeRef`] handed out
/// for it. The reference count tracks logical holders: it starts at 1 for the
/// implicit reference taken at construction, and the holder whose release
/// moves it from 1 to 0 frees the queues and, for a dropped vnode, its data.
///
/// [`VnodeRef`]: super::VnodeRef
pub struct Vnode {
    id: VnodeId,
    root_dir: PathBuf,
    status: AtomicU8,
    ref_count: AtomicI32,
    version: AtomicU64,

    /// Set by drop, read on the final free
    drop_data: AtomicBool,
    /// Where drop moved the data directory
    drop_dir: Mutex<Option<PathBuf>>,
    remove_dropped_data: bool,

    wal_cfg: RwLock<WalConfig>,
    sync_cfg: RwLock<SyncConfig>,

    wqueue: Mutex<Option<QueueHandle>>,
    rqueue: Mutex<Option<QueueHandle>>,
    wal: RwLock<Option<Arc<dyn Wal>>>,
    tsdb: RwLock<Option<Arc<dyn TsdbRepo>>>,

    /// Serializes version assignment with the log append
    write_lock: Mutex<()>,

    opened_at: RwLock<Option<DateTime<Utc>>>,
    dispatcher: Arc<dyn Dispatcher>,
    metrics: Arc<VnodeMetrics>,
}

impl Vnode {
    pub(crate) fn new(
        id: VnodeId,
        root_dir: PathBuf,
        remove_dropped_data: bool,
        dispatcher: Arc<dyn Dispatcher>,
        metrics: Arc<VnodeMetrics>,
    ) -> Self {
        Self {
            id,
            root_dir,
            status: AtomicU8::new(VnodeStatus::Init as u8),
            ref_count: AtomicI32::new(1),
            version: AtomicU64::new(0),
            drop_data: AtomicBool::new(false),
            drop_dir: Mutex::new(None),
            remove_dropped_data,
            wal_cfg: RwLock::new(WalConfig::default()),
            sync_cfg: RwLock::new(SyncConfig::default()),
            wqueue: Mutex::new(None),
            rqueue: Mutex::new(None),
            wal: RwLock::new(None),
            tsdb: RwLock::new(None),
            write_lock: Mutex::new(()),
            opened_at: RwLock::new(None),
            dispatcher,
            metrics,
        }
    }

    pub fn id(&self) -> VnodeId {
        self.id
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn status(&self) -> VnodeStatus {
        VnodeStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: VnodeStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.status() == VnodeStatus::Ready
    }

    /// Current number of logical holders
    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Highest version applied so far
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Raise the version to what the engine already holds
    pub(crate) fn seed_version(&self, version: u64) {
        self.version.fetch_max(version, Ordering::AcqRel);
    }

    /// Whether the data directory goes away with the last reference
    pub fn is_drop_pending(&self) -> bool {
        self.drop_data.load(Ordering::Acquire)
    }

    /// Record the drop intent and move the data directory to `tombstone`.
    ///
    /// Only the moved directory is ever deleted, so the root path is free for
    /// a new vnode with the same id as soon as this returns. If the move
    /// fails nothing is deleted on the final free. Only the first call moves
    /// anything.
    pub(crate) fn mark_drop(&self, tombstone: PathBuf) -> Result<()> {
        if self.drop_data.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        fs::rename(&self.root_dir, &tombstone).map_err(|e| {
            warn!(
                vg_id = self.id,
                from = %self.root_dir.display(),
                to = %tombstone.display(),
                error = %e,
                "failed to move dropped vnode data aside"
            );
            Error::from(e)
        })?;

        debug!(vg_id = self.id, path = %tombstone.display(), "vnode data moved aside");
        *self.drop_dir.lock() = Some(tombstone);
        Ok(())
    }

    /// Current location of the vnode's data
    pub fn data_dir(&self) -> PathBuf {
        self.drop_dir
            .lock()
            .clone()
            .unwrap_or_else(|| self.root_dir.clone())
    }

    pub fn wal_config(&self) -> WalConfig {
        *self.wal_cfg.read()
    }

    pub fn sync_config(&self) -> SyncConfig {
        self.sync_cfg.read().clone()
    }

    /// Install a fully validated configuration
    pub(crate) fn set_config(&self, wal: WalConfig, sync: SyncConfig) {
        *self.wal_cfg.write() = wal;
        *self.sync_cfg.write() = sync;
    }

    pub fn write_queue(&self) -> Option<QueueHandle> {
        self.wqueue.lock().clone()
    }

    pub fn read_queue(&self) -> Option<QueueHandle> {
        self.rqueue.lock().clone()
    }

    pub fn wal(&self) -> Option<Arc<dyn Wal>> {
        self.wal.read().clone()
    }

    pub fn tsdb(&self) -> Option<Arc<dyn TsdbRepo>> {
        self.tsdb.read().clone()
    }

    /// When the vnode became ready
    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        *self.opened_at.read()
    }

    pub(crate) fn allocate_queues(&self) {
        *self.wqueue.lock() = Some(self.dispatcher.allocate_queue(self.id, QueueKind::Write));
        *self.rqueue.lock() = Some(self.dispatcher.allocate_queue(self.id, QueueKind::Read));
    }

    pub(crate) fn attach_wal(&self, wal: Arc<dyn Wal>) {
        *self.wal.write() = Some(wal);
    }

    pub(crate) fn attach_tsdb(&self, tsdb: Arc<dyn TsdbRepo>) {
        *self.tsdb.write() = Some(tsdb);
    }

    pub(crate) fn mark_ready(&self) {
        *self.opened_at.write() = Some(Utc::now());
        self.set_status(VnodeStatus::Ready);
    }

    /// Move into a teardown state.
    ///
    /// A vnode still opening cannot be torn down, and `Deleting` is never
    /// weakened back to `Closing`.
    pub(crate) fn begin_teardown(&self, target: VnodeStatus) -> Result<()> {
        let result = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match VnodeStatus::from_u8(current) {
                    VnodeStatus::Init | VnodeStatus::Deleting => None,
                    _ => Some(target as u8),
                }
            });

        match result {
            Err(current) if current == VnodeStatus::Init as u8 => Err(Error::NotActiveVnode(self.id)),
            _ => Ok(()),
        }
    }

    /// Rollover callback for the storage engine.
    ///
    /// Holds the vnode weakly and never takes a reference: the engine only
    /// calls it while the vnode still owns the engine.
    pub(crate) fn rollover_callback(self: &Arc<Self>) -> WalCallback {
        let id = self.id;
        let weak: Weak<Vnode> = Arc::downgrade(self);
        Arc::new(move || match weak.upgrade() {
            Some(vnode) => vnode.renew_wal(),
            None => Err(Error::NotActiveVnode(id)),
        })
    }

    /// Ask the log to start a new segment
    pub(crate) fn renew_wal(&self) -> Result<()> {
        let wal = self.wal().ok_or(Error::NotActiveVnode(self.id))?;
        wal.renew()?;

        self.metrics.increment_wal_renews();
        debug!(vg_id = self.id, "wal renewed");
        Ok(())
    }

    /// Apply a mutation to the storage engine.
    ///
    /// Both live writes and log replay go through here.
    pub fn process_write(&self, record: &WalRecord) -> Result<()> {
        let tsdb = self.tsdb().ok_or(Error::NotActiveVnode(self.id))?;
        tsdb.insert(record)?;

        self.version.fetch_max(record.version, Ordering::AcqRel);
        Ok(())
    }

    /// Append a mutation to the log, then apply it. Returns its version.
    pub fn write(&self, msg_type: u8, body: impl Into<Vec<u8>>) -> Result<u64> {
        if !self.is_ready() {
            return Err(Error::NotActiveVnode(self.id));
        }

        let wal = self.wal().ok_or(Error::NotActiveVnode(self.id))?;

        let _guard = self.write_lock.lock();
        let version = self.version() + 1;
        let record = WalRecord::new(version, msg_type, body);

        // Once logged the version is taken, applied or not
        wal.write(&record)?;
        self.version.fetch_max(version, Ordering::AcqRel);
        self.process_write(&record)?;

        self.metrics.increment_writes();
        trace!(vg_id = self.id, version, msg_type, "write applied");
        Ok(version)
    }

    /// Replay the log into the storage engine
    pub(crate) fn replay_wal(&self) -> Result<usize> {
        let wal = self.wal().ok_or(Error::NotActiveVnode(self.id))?;
        let replayed = wal.restore(&mut |record| self.process_write(&record))?;

        self.metrics.add_replayed_records(replayed);
        Ok(replayed)
    }

    /// Close the storage engine, if open
    pub(crate) fn close_tsdb(&self) -> Result<()> {
        let tsdb = self.tsdb.write().take();
        match tsdb {
            Some(tsdb) => tsdb.close(),
            None => Ok(()),
        }
    }

    /// Close the write-ahead log, if open
    pub(crate) fn close_wal(&self) -> Result<()> {
        let wal = self.wal.write().take();
        match wal {
            Some(wal) => wal.close(),
            None => Ok(()),
        }
    }

    /// Take one more reference. Returns the new count.
    pub(crate) fn retain(&self) -> i32 {
        let count = self.ref_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.metrics.increment_acquires();
        trace!(vg_id = self.id, ref_count = count, "vnode acquired");
        count
    }

    /// Give up a reference taken through [`Vnode::retain`]
    pub(crate) fn release_handle(&self) -> bool {
        self.metrics.increment_releases();
        self.release_ref()
    }

    /// Give up one reference. The caller that drops the count to zero frees
    /// the vnode; returns whether that was this call.
    pub(crate) fn release_ref(&self) -> bool {
        let old = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        trace!(vg_id = self.id, ref_count = old - 1, "vnode released");

        if old > 1 {
            return false;
        }

        if old < 1 {
            warn!(vg_id = self.id, ref_count = old - 1, "vnode released more often than acquired");
            return false;
        }

        self.free();
        true
    }

    fn free(&self) {
        if let Some(queue) = self.wqueue.lock().take() {
            self.dispatcher.free_queue(queue);
        }
        if let Some(queue) = self.rqueue.lock().take() {
            self.dispatcher.free_queue(queue);
        }

        let drop_dir = self.drop_dir.lock().take();
        if let Some(dir) = drop_dir.filter(|_| self.remove_dropped_data) {
            match fs::remove_dir_all(&dir) {
                Ok(()) => debug!(vg_id = self.id, path = %dir.display(), "vnode data removed"),
                Err(e) => warn!(
                    vg_id = self.id,
                    path = %dir.display(),
                    error = %e,
                    "failed to remove vnode data"
                ),
            }
        }

        self.metrics.record_free(self.opened_at().is_some());
        info!(vg_id = self.id, status = %self.status(), "vnode is released");
    }
}

impl std::fmt::Debug for Vnode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vnode")
            .field("id", &self.id)
            .field("root_dir", &self.root_dir)
            .field("status", &self.status())
            .field("ref_count", &self.ref_count())
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}
