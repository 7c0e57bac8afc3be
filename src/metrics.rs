use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use parking_lot::Mutex;

/// Lifecycle and recovery metrics for the vnodes of one node
#[derive(Debug)]
pub struct VnodeMetrics {
    // Lifecycle counts
    /// Number of successful creates
    create_count: AtomicUsize,
    /// Number of successful opens
    open_count: AtomicUsize,
    /// Number of closes that started a teardown
    close_count: AtomicUsize,
    /// Number of drops that started a teardown
    drop_count: AtomicUsize,
    /// Number of vnodes whose resources were freed
    free_count: AtomicUsize,
    /// Number of vnodes currently open
    open_vnodes: AtomicUsize,

    // Reference counts
    /// Number of successful acquires
    acquire_count: AtomicUsize,
    /// Number of releases
    release_count: AtomicUsize,

    // Write and recovery
    /// Number of live writes applied
    write_count: AtomicUsize,
    /// Number of WAL records replayed on open
    replayed_records: AtomicUsize,
    /// Number of WAL renewals requested by storage engines
    wal_renew_count: AtomicUsize,

    // Timing metrics
    /// Total open duration in nanoseconds
    open_duration_ns: AtomicU64,
    /// Last open duration
    last_open_duration: Mutex<Duration>,

    // Internal state
    /// Start time of the metrics collector
    start_time: Instant,
}

impl Default for VnodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl VnodeMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            create_count: AtomicUsize::new(0),
            open_count: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
            drop_count: AtomicUsize::new(0),
            free_count: AtomicUsize::new(0),
            open_vnodes: AtomicUsize::new(0),

            acquire_count: AtomicUsize::new(0),
            release_count: AtomicUsize::new(0),

            write_count: AtomicUsize::new(0),
            replayed_records: AtomicUsize::new(0),
            wal_renew_count: AtomicUsize::new(0),

            open_duration_ns: AtomicU64::new(0),
            last_open_duration: Mutex::new(Duration::from_secs(0)),

            start_time: Instant::now(),
        }
    }

    /// Increment create count
    pub fn increment_creates(&self) {
        self.create_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a vnode reaching Ready
    pub fn record_open(&self, duration: Duration) {
        self.open_count.fetch_add(1, Ordering::Relaxed);
        self.open_vnodes.fetch_add(1, Ordering::Relaxed);
        self.open_duration_ns.fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        *self.last_open_duration.lock() = duration;
    }

    /// Increment close count
    pub fn increment_closes(&self) {
        self.close_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment drop count
    pub fn increment_drops(&self) {
        self.drop_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the final release of a vnode's resources
    pub fn record_free(&self, was_open: bool) {
        self.free_count.fetch_add(1, Ordering::Relaxed);
        if was_open {
            self.open_vnodes.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Increment acquire count
    pub fn increment_acquires(&self) {
        self.acquire_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment release count
    pub fn increment_releases(&self) {
        self.release_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment live write count
    pub fn increment_writes(&self) {
        self.write_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Add replayed WAL records
    pub fn add_replayed_records(&self, count: usize) {
        self.replayed_records.fetch_add(count, Ordering::Relaxed);
    }

    /// Increment WAL renew count
    pub fn increment_wal_renews(&self) {
        self.wal_renew_count.fetch_add(1, Ordering::Relaxed);
    }

    // Getters

    /// Get number of creates
    pub fn get_create_count(&self) -> usize {
        self.create_count.load(Ordering::Relaxed)
    }

    /// Get number of opens
    pub fn get_open_count(&self) -> usize {
        self.open_count.load(Ordering::Relaxed)
    }

    /// Get number of closes
    pub fn get_close_count(&self) -> usize {
        self.close_count.load(Ordering::Relaxed)
    }

    /// Get number of drops
    pub fn get_drop_count(&self) -> usize {
        self.drop_count.load(Ordering::Relaxed)
    }

    /// Get number of freed vnodes
    pub fn get_free_count(&self) -> usize {
        self.free_count.load(Ordering::Relaxed)
    }

    /// Get number of currently open vnodes
    pub fn get_open_vnodes(&self) -> usize {
        self.open_vnodes.load(Ordering::Relaxed)
    }

    /// Get number of acquires
    pub fn get_acquire_count(&self) -> usize {
        self.acquire_count.load(Ordering::Relaxed)
    }

    /// Get number of releases
    pub fn get_release_count(&self) -> usize {
        self.release_count.load(Ordering::Relaxed)
    }

    /// Get number of live writes
    pub fn get_write_count(&self) -> usize {
        self.write_count.load(Ordering::Relaxed)
    }

    /// Get number of replayed WAL records
    pub fn get_replayed_records(&self) -> usize {
        self.replayed_records.load(Ordering::Relaxed)
    }

    /// Get number of WAL renewals
    pub fn get_wal_renew_count(&self) -> usize {
        self.wal_renew_count.load(Ordering::Relaxed)
    }

    /// Get total open duration
    pub fn get_open_duration(&self) -> Duration {
        Duration::from_nanos(self.open_duration_ns.load(Ordering::Relaxed))
    }

    /// Get last open duration
    pub fn get_last_open_duration(&self) -> Duration {
        *self.last_open_duration.lock()
    }

    /// Get average open latency
    pub fn get_avg_open_duration(&self) -> Duration {
        let opens = self.open_count.load(Ordering::Relaxed);
        if opens == 0 {
            return Duration::from_secs(0);
        }

        self.get_open_duration() / opens as u32
    }

    /// Get the time since the collector was created
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Create a human-readable report of the metrics
    pub fn report(&self) -> String {
        let mut result = String::new();

        result.push_str("=== Vnode Metrics ===\n\n");
        result.push_str(&format!("Open Vnodes: {}\n", self.get_open_vnodes()));
        result.push_str(&format!("Creates: {}\n", self.get_create_count()));
        result.push_str(&format!("Opens: {}\n", self.get_open_count()));
        result.push_str(&format!("Closes: {}\n", self.get_close_count()));
        result.push_str(&format!("Drops: {}\n", self.get_drop_count()));
        result.push_str(&format!("Freed: {}\n", self.get_free_count()));
        result.push_str(&format!("Acquires: {}\n", self.get_acquire_count()));
        result.push_str(&format!("Releases: {}\n", self.get_release_count()));
        result.push_str(&format!("Writes: {}\n", self.get_write_count()));
        result.push_str(&format!("Replayed Records: {}\n", self.get_replayed_records()));
        result.push_str(&format!("WAL Renewals: {}\n", self.get_wal_renew_count()));
        result.push_str(&format!("Avg. Open Latency: {:?}\n", self.get_avg_open_duration()));

        result
    }
}
