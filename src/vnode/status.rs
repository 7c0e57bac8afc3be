//! Status reports
//!
//! The node periodically reports the load of its vnodes. On the wire each
//! vnode takes a fixed five-byte record: the id as a big-endian 32-bit
//! integer followed by the status code.

use std::io::{self, Read};

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use serde::{Deserialize, Serialize};

use super::{VnodeId, VnodeRegistry, VnodeStatus};

/// Size of one encoded [`VnodeLoad`]
pub const LOAD_RECORD_SIZE: usize = 5;

/// Load entry of one vnode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VnodeLoad {
    pub vg_id: VnodeId,
    pub status: VnodeStatus,
}

impl VnodeLoad {
    /// Wire record of this load
    pub fn to_bytes(&self) -> [u8; LOAD_RECORD_SIZE] {
        let mut record = [0u8; LOAD_RECORD_SIZE];
        BigEndian::write_i32(&mut record[..4], self.vg_id);
        record[4] = self.status as u8;
        record
    }

    pub fn read_from<R: Read>(input: &mut R) -> io::Result<Self> {
        let vg_id = input.read_i32::<BigEndian>()?;
        let status = input.read_u8()?;
        if status > VnodeStatus::Deleting as u8 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown vnode status {}", status),
            ));
        }

        Ok(Self {
            vg_id,
            status: VnodeStatus::from_u8(status),
        })
    }
}

/// Loads of the opened vnodes, in id order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub loads: Vec<VnodeLoad>,
}

impl StatusReport {
    /// Collect up to `max_entries` loads. Extra vnodes are left out silently.
    pub fn build(registry: &VnodeRegistry, max_entries: usize) -> Self {
        let mut loads = Vec::new();
        registry.visit_all(|vnode| {
            if loads.len() < max_entries {
                loads.push(VnodeLoad {
                    vg_id: vnode.id(),
                    status: vnode.status(),
                });
            }
        });

        Self { loads }
    }

    pub fn len(&self) -> usize {
        self.loads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loads.is_empty()
    }

    pub fn ids(&self) -> Vec<VnodeId> {
        self.loads.iter().map(|load| load.vg_id).collect()
    }

    /// Wire form: the records back to back
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.loads.len() * LOAD_RECORD_SIZE);
        for load in &self.loads {
            out.extend_from_slice(&load.to_bytes());
        }
        out
    }

    pub fn decode(mut data: &[u8]) -> io::Result<Self> {
        if data.len() % LOAD_RECORD_SIZE != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("status report of {} bytes is not a whole number of records", data.len()),
            ));
        }

        let mut loads = Vec::with_capacity(data.len() / LOAD_RECORD_SIZE);
        while !data.is_empty() {
            loads.push(VnodeLoad::read_from(&mut data)?);
        }
        Ok(Self { loads })
    }
}
