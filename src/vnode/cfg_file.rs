//! Vnode config file
//!
//! Each vnode root holds a `config` text file written once at creation. One
//! field group per line, space-separated tokens, in this fixed order:
//!
//! ```text
//! commitLog 1
//! wals 3
//! arbitratorIp 16777343
//! quorum 1
//! replica 2
//! index0 nodeId 1 nodeIp 16777343 name n1
//! index1 nodeId 2 nodeIp 33554559 name n2
//! ```
//!
//! Reading is all-or-nothing: nothing is returned unless every field parses.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::str::Lines;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::vnode::VnodeId;
use crate::wal::WalConfig;

/// File name of the config inside a vnode root
pub const CONFIG_FILE: &str = "config";

/// Maximum number of replica lines in a config
pub const MAX_REPLICA: usize = 5;

/// Marker for an unset numeric field
const SENTINEL: i64 = -1;

/// One member of a vnode's replica set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: i32,
    pub node_ip: u32,
    pub name: String,
}

/// Replica-set settings of a vnode
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub arbitrator_ip: u32,
    pub quorum: u8,
    pub node_info: Vec<NodeInfo>,
}

impl SyncConfig {
    /// Number of replicas
    pub fn replica(&self) -> usize {
        self.node_info.len()
    }
}

/// Check that a config would read back as written.
///
/// The reader treats `-1` and `u32::MAX` as unset and rejects negatives, so
/// those values are refused here too.
pub fn validate_config(vg_id: VnodeId, wal: &WalConfig, sync: &SyncConfig) -> Result<()> {
    if wal.wal_file_count == u32::MAX {
        return Err(Error::config(format!("vnode {}: wal file count is unset", vg_id)));
    }
    if sync.arbitrator_ip == u32::MAX {
        return Err(Error::config(format!("vnode {}: arbitrator ip is unset", vg_id)));
    }

    if sync.replica() > MAX_REPLICA {
        return Err(Error::config(format!(
            "vnode {} has {} replicas, at most {} are allowed",
            vg_id,
            sync.replica(),
            MAX_REPLICA
        )));
    }

    if let Some(node) = sync
        .node_info
        .iter()
        .find(|node| node.name.is_empty() || node.name.contains(char::is_whitespace))
    {
        return Err(Error::config(format!(
            "node name {:?} must be a single non-empty token",
            node.name
        )));
    }

    if let Some(node) = sync.node_info.iter().find(|node| node.node_id < 0) {
        return Err(Error::config(format!(
            "vnode {}: node id {} must not be negative",
            vg_id, node.node_id
        )));
    }

    if let Some(node) = sync.node_info.iter().find(|node| node.node_ip == u32::MAX) {
        return Err(Error::config(format!(
            "vnode {}: ip of node {} is unset",
            vg_id, node.node_id
        )));
    }

    Ok(())
}

/// Write the config file of vnode `vg_id` into `root_dir`
pub fn save_config(
    vg_id: VnodeId,
    root_dir: &Path,
    wal: &WalConfig,
    sync: &SyncConfig,
) -> Result<()> {
    let path = root_dir.join(CONFIG_FILE);
    validate_config(vg_id, wal, sync)?;

    let file = File::create(&path).map_err(|e| Error::from_dir_error(&path, e))?;
    write_config(BufWriter::new(file), wal, sync).map_err(|e| {
        error!(vg_id, path = %path.display(), error = %e, "failed to save vnode cfg");
        Error::from_dir_error(&path, e)
    })?;

    debug!(vg_id, "save vnode cfg successed");
    Ok(())
}

fn write_config(mut out: BufWriter<File>, wal: &WalConfig, sync: &SyncConfig) -> io::Result<()> {
    writeln!(out, "commitLog {}", u8::from(wal.commit_log))?;
    writeln!(out, "wals {}", wal.wal_file_count)?;
    writeln!(out, "arbitratorIp {}", sync.arbitrator_ip)?;
    writeln!(out, "quorum {}", sync.quorum)?;
    writeln!(out, "replica {}", sync.replica())?;
    for (i, node) in sync.node_info.iter().enumerate() {
        writeln!(
            out,
            "index{} nodeId {} nodeIp {} name {}",
            i, node.node_id, node.node_ip, node.name
        )?;
    }

    out.flush()?;
    out.get_ref().sync_all()
}

/// Read and validate the config file of vnode `vg_id` in `root_dir`
pub fn read_config(vg_id: VnodeId, root_dir: &Path) -> Result<(WalConfig, SyncConfig)> {
    let path = root_dir.join(CONFIG_FILE);
    let content = fs::read_to_string(&path)?;

    let parsed = parse_config(&path, &content);
    match &parsed {
        Ok(_) => debug!(vg_id, "read vnode cfg successed"),
        Err(e) => error!(vg_id, error = %e, "failed to read vnode cfg"),
    }
    parsed
}

/// Parse config text. `path` is only used in error messages.
pub fn parse_config(path: &Path, content: &str) -> Result<(WalConfig, SyncConfig)> {
    let mut parser = CfgParser::new(path, content);

    let commit_log: i64 = parser.field("commitLog")?;
    let wals: u32 = parser.field("wals")?;
    let arbitrator_ip: u32 = parser.field("arbitratorIp")?;
    let quorum: u8 = parser.field("quorum")?;
    let replica: usize = parser.field("replica")?;

    if replica > MAX_REPLICA {
        return Err(parser.invalid(format!(
            "replica {} exceeds the maximum of {}",
            replica, MAX_REPLICA
        )));
    }

    let mut node_info = Vec::with_capacity(replica);
    for i in 0..replica {
        node_info.push(parser.node(i)?);
    }

    let wal = WalConfig {
        commit_log: commit_log != 0,
        wal_file_count: wals,
    };
    let sync = SyncConfig {
        arbitrator_ip,
        quorum,
        node_info,
    };

    Ok((wal, sync))
}

/// Line tokenizer enforcing field names, order and arity
struct CfgParser<'a> {
    path: &'a Path,
    lines: Lines<'a>,
    line_no: usize,
}

impl<'a> CfgParser<'a> {
    fn new(path: &'a Path, content: &'a str) -> Self {
        Self {
            path,
            lines: content.lines(),
            line_no: 0,
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> Error {
        Error::invalid_format(self.path, format!("line {}: {}", self.line_no, reason.into()))
    }

    /// Tokens of the next non-blank line
    fn next_tokens(&mut self, expected: &str) -> Result<Vec<&'a str>> {
        for line in self.lines.by_ref() {
            self.line_no += 1;
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if !tokens.is_empty() {
                return Ok(tokens);
            }
        }

        self.line_no += 1;
        Err(self.invalid(format!("unexpected end of file, expected `{}`", expected)))
    }

    /// A `<name> <value>` line
    fn field<T: TryFrom<i64>>(&mut self, name: &str) -> Result<T> {
        let tokens = self.next_tokens(name)?;
        if tokens.len() != 2 {
            return Err(self.invalid(format!("expected `{} <value>`, got {} tokens", name, tokens.len())));
        }
        if tokens[0] != name {
            return Err(self.invalid(format!("expected `{}`, found `{}`", name, tokens[0])));
        }

        self.number(name, tokens[1])
    }

    /// An `index<i> nodeId <id> nodeIp <ip> name <name>` line
    fn node(&mut self, index: usize) -> Result<NodeInfo> {
        let label = format!("index{}", index);
        let tokens = self.next_tokens(&label)?;
        if tokens.len() != 7 {
            return Err(self.invalid(format!("expected 7 tokens for `{}`, got {}", label, tokens.len())));
        }

        for (pos, name) in [(0, label.as_str()), (1, "nodeId"), (3, "nodeIp"), (5, "name")] {
            if tokens[pos] != name {
                return Err(self.invalid(format!("expected `{}`, found `{}`", name, tokens[pos])));
            }
        }

        Ok(NodeInfo {
            node_id: self.number("nodeId", tokens[2])?,
            node_ip: self.number("nodeIp", tokens[4])?,
            name: tokens[6].to_string(),
        })
    }

    /// Parse a numeric value, rejecting the sentinel and out-of-range values
    fn number<T: TryFrom<i64>>(&self, name: &str, token: &str) -> Result<T> {
        let value: i64 = token
            .parse()
            .map_err(|_| self.invalid(format!("`{}` is not a number: `{}`", name, token)))?;

        if value == SENTINEL || value == u32::MAX as i64 {
            return Err(self.invalid(format!("`{}` is unset", name)));
        }
        if value < 0 {
            return Err(self.invalid(format!("`{}` is negative: {}", name, value)));
        }

        T::try_from(value).map_err(|_| self.invalid(format!("`{}` is out of range: {}", name, value)))
    }
}
