//! Write-ahead log for vnode durability
//!
//! A vnode only depends on the [`Wal`] and [`WalFactory`] contracts. The
//! [`FileWal`] implementation keeps records in numbered segment files and is
//! what a node uses unless another log is plugged in.

use bincode::{deserialize, serialize};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Error, Result};

// Magic bytes to identify WAL files
const WAL_MAGIC: &[u8; 4] = b"VNWL";
const WAL_VERSION: u32 = 1;
const HEADER_SIZE: u64 = 8; // Magic(4) + Version(4)
const FRAME_HEADER_SIZE: u64 = 8; // Length(4) + Checksum(4)

/// WAL settings stored in a vnode's config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalConfig {
    /// Whether records are persisted at all
    pub commit_log: bool,
    /// Number of segment files retained after a renew
    pub wal_file_count: u32,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            commit_log: true,
            wal_file_count: 3,
        }
    }
}

/// A single mutation recorded in the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecord {
    /// Vnode version assigned to the mutation
    pub version: u64,
    /// Request type as delivered by the dispatch layer
    pub msg_type: u8,
    /// Request payload
    pub body: Vec<u8>,
}

impl WalRecord {
    pub fn new(version: u64, msg_type: u8, body: impl Into<Vec<u8>>) -> Self {
        Self {
            version,
            msg_type,
            body: body.into(),
        }
    }
}

/// Write-ahead log owned by one vnode
pub trait Wal: Send + Sync {
    /// Append a record
    fn write(&self, record: &WalRecord) -> Result<()>;

    /// Feed every retained record, in log order, to `apply`.
    ///
    /// Returns the number of records replayed. An error from `apply` stops the
    /// replay and is returned as is.
    fn restore(&self, apply: &mut dyn FnMut(WalRecord) -> Result<()>) -> Result<usize>;

    /// Start a new segment
    fn renew(&self) -> Result<()>;

    /// Flush and close the log
    fn close(&self) -> Result<()>;
}

/// Opens the write-ahead log of a vnode
pub trait WalFactory: Send + Sync {
    fn open(&self, path: &Path, config: &WalConfig) -> Result<Arc<dyn Wal>>;
}

/// Factory for [`FileWal`]
#[derive(Debug, Clone, Default)]
pub struct FileWalFactory {
    /// Whether to sync each record to disk
    pub sync_writes: bool,
}

impl FileWalFactory {
    pub fn new(sync_writes: bool) -> Self {
        Self { sync_writes }
    }
}

impl WalFactory for FileWalFactory {
    fn open(&self, path: &Path, config: &WalConfig) -> Result<Arc<dyn Wal>> {
        Ok(Arc::new(FileWal::open(path, *config, self.sync_writes)?))
    }
}

/// State of the WAL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalState {
    Open,
    Closed,
}

/// Segment currently being appended to
struct WalWriter {
    state: WalState,
    /// Sequence number of the active segment
    seq: u64,
    /// Active segment, created on the first write
    file: Option<BufWriter<File>>,
    /// Bytes written to the active segment
    position: u64,
}

/// Segment-file write-ahead log
pub struct FileWal {
    /// Directory holding the segment files
    dir: PathBuf,
    config: WalConfig,
    sync_writes: bool,
    writer: Mutex<WalWriter>,
}

impl FileWal {
    /// Open the log in `dir`, creating the directory if needed.
    ///
    /// Existing segments are kept for [`Wal::restore`]; new records go to a
    /// fresh segment numbered after the newest one found.
    pub fn open<P: AsRef<Path>>(dir: P, config: WalConfig, sync_writes: bool) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            Error::wal(format!("Failed to create WAL directory {}: {}", dir.display(), e))
        })?;

        let segments = Self::find_segments(&dir)?;
        let next_seq = segments.last().map_or(1, |(seq, _)| seq + 1);

        debug!(
            dir = %dir.display(),
            segments = segments.len(),
            commit_log = config.commit_log,
            "wal opened"
        );

        Ok(Self {
            dir,
            config,
            sync_writes,
            writer: Mutex::new(WalWriter {
                state: WalState::Open,
                seq: next_seq,
                file: None,
                position: 0,
            }),
        })
    }

    /// Settings the log was opened with
    pub fn config(&self) -> WalConfig {
        self.config
    }

    /// Paths of the segment files currently on disk, oldest first
    pub fn segment_paths(&self) -> Result<Vec<PathBuf>> {
        Ok(Self::find_segments(&self.dir)?
            .into_iter()
            .map(|(_, path)| path)
            .collect())
    }

    fn segment_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("wal-{:010}.log", seq))
    }

    /// List segment files sorted by sequence number
    fn find_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
        let mut segments = Vec::new();

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }

            let seq = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_prefix("wal-"))
                .and_then(|name| name.strip_suffix(".log"))
                .and_then(|seq| seq.parse::<u64>().ok());

            if let Some(seq) = seq {
                segments.push((seq, path));
            }
        }

        segments.sort_by_key(|(seq, _)| *seq);
        Ok(segments)
    }

    /// Create the active segment and write its header
    fn initialize_segment(&self, writer: &mut WalWriter) -> Result<()> {
        let path = self.segment_path(writer.seq);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| {
                Error::wal(format!("Failed to create WAL file {}: {}", path.display(), e))
            })?;

        let mut out = BufWriter::new(file);
        out.write_all(WAL_MAGIC)?;
        out.write_u32::<LittleEndian>(WAL_VERSION)?;
        out.flush()?;

        writer.file = Some(out);
        writer.position = HEADER_SIZE;
        Ok(())
    }

    /// Flush and sync the active segment, then drop its handle
    fn finish_segment(writer: &mut WalWriter) -> Result<()> {
        if let Some(mut out) = writer.file.take() {
            out.flush()?;
            out.get_ref()
                .sync_all()
                .map_err(|e| Error::wal(format!("Failed to sync WAL file: {}", e)))?;
        }
        Ok(())
    }

    /// Remove the oldest segments beyond the configured file count
    fn prune_segments(&self) -> Result<()> {
        let segments = Self::find_segments(&self.dir)?;
        let keep = self.config.wal_file_count.max(1) as usize;

        if segments.len() <= keep {
            return Ok(());
        }

        for (seq, path) in &segments[..segments.len() - keep] {
            fs::remove_file(path).map_err(|e| {
                Error::wal(format!("Failed to remove WAL file {}: {}", path.display(), e))
            })?;
            debug!(seq, "wal segment pruned");
        }

        Ok(())
    }

    /// Replay one segment file, stopping at the first damaged frame
    fn replay_segment(
        path: &Path,
        apply: &mut dyn FnMut(WalRecord) -> Result<()>,
    ) -> Result<usize> {
        let file = File::open(path)
            .map_err(|e| Error::wal(format!("Cannot open WAL file {}: {}", path.display(), e)))?;
        let mut reader = BufReader::new(file);

        if !Self::read_and_validate_header(&mut reader)? {
            warn!(path = %path.display(), "skipping wal file with bad header");
            return Ok(0);
        }

        let mut position = HEADER_SIZE;
        let mut replayed = 0;

        loop {
            match Self::read_frame(&mut reader) {
                Ok(Some((record, frame_size))) => {
                    apply(record)?;
                    replayed += 1;
                    position += frame_size;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        position,
                        error = %e,
                        "wal replay stopped at damaged record"
                    );
                    break;
                }
            }
        }

        Ok(replayed)
    }

    /// Read a frame. `Ok(None)` means a clean end of file.
    fn read_frame<R: Read>(reader: &mut R) -> Result<Option<(WalRecord, u64)>> {
        let len = match reader.read_u32::<LittleEndian>() {
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Error::wal(format!("Read error: {}", e))),
        };

        let checksum = reader
            .read_u32::<LittleEndian>()
            .map_err(|e| Error::wal(format!("Truncated record header: {}", e)))?;

        let mut data = vec![0; len as usize];
        reader
            .read_exact(&mut data)
            .map_err(|e| Error::wal(format!("Truncated record body: {}", e)))?;

        let actual = compute_checksum(&data);
        if actual != checksum {
            return Err(Error::wal(format!(
                "Checksum mismatch: expected {:#x}, got {:#x}",
                checksum, actual
            )));
        }

        let record: WalRecord = deserialize(&data)?;
        Ok(Some((record, FRAME_HEADER_SIZE + len as u64)))
    }

    /// Read and validate the segment header
    fn read_and_validate_header<R: Read>(reader: &mut R) -> Result<bool> {
        let mut magic = [0u8; 4];
        if reader.read_exact(&mut magic).is_err() {
            return Ok(false);
        }

        if magic != *WAL_MAGIC {
            return Ok(false);
        }

        match reader.read_u32::<LittleEndian>() {
            Ok(version) => Ok(version == WAL_VERSION),
            Err(_) => Ok(false),
        }
    }
}

impl Wal for FileWal {
    fn write(&self, record: &WalRecord) -> Result<()> {
        if !self.config.commit_log {
            return Ok(());
        }

        let data = serialize(record)?;
        let checksum = compute_checksum(&data);

        let mut writer = self.writer.lock();
        if writer.state == WalState::Closed {
            return Err(Error::wal("WAL is closed"));
        }

        if writer.file.is_none() {
            self.initialize_segment(&mut writer)?;
        }

        let out = writer
            .file
            .as_mut()
            .ok_or_else(|| Error::wal("WAL file not open"))?;
        out.write_u32::<LittleEndian>(data.len() as u32)?;
        out.write_u32::<LittleEndian>(checksum)?;
        out.write_all(&data)?;
        out.flush()?;

        if self.sync_writes {
            out.get_ref().sync_data()?;
        }

        writer.position += FRAME_HEADER_SIZE + data.len() as u64;
        Ok(())
    }

    fn restore(&self, apply: &mut dyn FnMut(WalRecord) -> Result<()>) -> Result<usize> {
        if !self.config.commit_log {
            return Ok(0);
        }

        let active_seq = self.writer.lock().seq;
        let mut replayed = 0;

        for (seq, path) in Self::find_segments(&self.dir)? {
            if seq >= active_seq {
                break;
            }
            replayed += Self::replay_segment(&path, apply)?;
        }

        Ok(replayed)
    }

    fn renew(&self) -> Result<()> {
        {
            let mut writer = self.writer.lock();
            if writer.state == WalState::Closed {
                return Err(Error::wal("WAL is closed"));
            }

            // An untouched segment is reused
            if writer.file.is_none() {
                return Ok(());
            }

            Self::finish_segment(&mut writer)?;
            writer.seq += 1;
            writer.position = 0;
        }

        self.prune_segments()
    }

    fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        if writer.state == WalState::Closed {
            return Ok(());
        }

        writer.state = WalState::Closed;
        Self::finish_segment(&mut writer)
    }
}

/// Compute checksum for data
fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
