//! Error handling for vnode operations
//!
//! This module provides the crate error type, the categorical codes surfaced
//! to callers, and result aliases.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::vnode::VnodeId;

/// Errors that can occur in vnode operations
#[derive(Error, Debug)]
pub enum Error {
    /// The process may not create or write vnode files
    #[error("No disk permission: {0}")]
    NoDiskPermission(String),

    /// The volume holding the vnode directory is full
    #[error("No disk space: {0}")]
    NoDiskSpace(String),

    /// Any other failure while laying out a vnode on disk
    #[error("Vnode init failed: {0}")]
    VnodeInitFailed(String),

    /// No vnode is registered under this id
    #[error("Invalid vgroup id: {0}")]
    InvalidVgroupId(VnodeId),

    /// The vnode config file is missing fields, truncated, or malformed
    #[error("Invalid file format in {path:?}: {reason}")]
    InvalidFileFormat {
        path: PathBuf,
        reason: String,
    },

    /// The vnode exists but is not accepting work
    #[error("Vnode {0} is not active")]
    NotActiveVnode(VnodeId),

    /// Errors reported by the write-ahead log
    #[error("WAL error: {0}")]
    Wal(String),

    /// Errors reported by the storage engine
    #[error("TSDB error: {0}")]
    Tsdb(String),

    /// Errors related to process configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to I/O operations
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Errors related to serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for vnode operations
pub type Result<T> = std::result::Result<T, Error>;

/// Categorical result codes returned to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success,
    NoDiskPermission,
    NoDiskSpace,
    VnodeInitFailed,
    InvalidVgroupId,
    InvalidFileFormat,
    NotActiveVnode,
    WalError,
    TsdbError,
    ConfigError,
    IoError,
}

impl ErrorCode {
    /// Get the code for an operation result
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(err) => err.code(),
        }
    }

    /// Get the name of the code
    pub fn name(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NoDiskPermission => "no_disk_permission",
            Self::NoDiskSpace => "no_disk_space",
            Self::VnodeInitFailed => "vnode_init_failed",
            Self::InvalidVgroupId => "invalid_vgroup_id",
            Self::InvalidFileFormat => "invalid_file_format",
            Self::NotActiveVnode => "not_active_vnode",
            Self::WalError => "wal_error",
            Self::TsdbError => "tsdb_error",
            Self::ConfigError => "config_error",
            Self::IoError => "io_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Error {
    /// Map a failure to create a vnode directory or file to its category
    pub fn from_dir_error(path: &Path, err: io::Error) -> Self {
        let message = format!("{}: {}", path.display(), err);
        match err.kind() {
            io::ErrorKind::PermissionDenied => Self::NoDiskPermission(message),
            io::ErrorKind::StorageFull => Self::NoDiskSpace(message),
            _ => Self::VnodeInitFailed(message),
        }
    }

    /// Create a new invalid file format error
    pub fn invalid_format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidFileFormat {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a new WAL error
    pub fn wal(message: impl Into<String>) -> Self {
        Self::Wal(message.into())
    }

    /// Create a new TSDB error
    pub fn tsdb(message: impl Into<String>) -> Self {
        Self::Tsdb(message.into())
    }

    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Get the categorical code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NoDiskPermission(_) => ErrorCode::NoDiskPermission,
            Self::NoDiskSpace(_) => ErrorCode::NoDiskSpace,
            Self::VnodeInitFailed(_) => ErrorCode::VnodeInitFailed,
            Self::InvalidVgroupId(_) => ErrorCode::InvalidVgroupId,
            Self::InvalidFileFormat { .. } => ErrorCode::InvalidFileFormat,
            Self::NotActiveVnode(_) => ErrorCode::NotActiveVnode,
            Self::Wal(_) => ErrorCode::WalError,
            Self::Tsdb(_) => ErrorCode::TsdbError,
            Self::Config(_) => ErrorCode::ConfigError,
            Self::Io(_) | Self::Serialization(_) => ErrorCode::IoError,
        }
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::InvalidVgroupId(_))
    }

    /// Check if this is a config file format error
    pub fn is_invalid_format(&self) -> bool {
        matches!(self, Self::InvalidFileFormat { .. })
    }

    /// Check if this is an I/O error
    pub fn is_io_error(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Get a user-friendly suggestion for resolving the error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::NoDiskPermission(_) => {
                Some("Verify permissions on the vnode data directory".to_string())
            }
            Self::NoDiskSpace(_) => Some("Free disk space on the vnode data volume".to_string()),
            Self::InvalidFileFormat { .. } => Some(
                "The vnode config file is damaged. Drop and recreate the vnode".to_string(),
            ),
            Self::Io(err) if err.kind() == io::ErrorKind::NotFound => {
                Some("The specified file or directory does not exist".to_string())
            }
            _ => None,
        }
    }
}

// Conversion from bincode error to vnode error
impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Self::Wal(format!("Bincode error: {}", err))
    }
}
