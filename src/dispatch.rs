//! Per-vnode request queues
//!
//! The dispatch layer owns the worker threads that drain vnode queues. A vnode
//! only allocates its write and read queues through [`Dispatcher`] when it is
//! opened and hands them back exactly once when it is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::trace;

use crate::error::{Error, Result};
use crate::vnode::VnodeId;

/// Which side of a vnode a queue feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Write,
    Read,
}

/// A request routed to a vnode queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMsg {
    pub vg_id: VnodeId,
    pub msg_type: u8,
    pub body: Vec<u8>,
}

/// Sending side of a vnode queue
#[derive(Debug, Clone)]
pub struct QueueHandle {
    id: u64,
    kind: QueueKind,
    vg_id: VnodeId,
    sender: Sender<RequestMsg>,
}

impl QueueHandle {
    pub fn new(id: u64, kind: QueueKind, vg_id: VnodeId, sender: Sender<RequestMsg>) -> Self {
        Self {
            id,
            kind,
            vg_id,
            sender,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn vg_id(&self) -> VnodeId {
        self.vg_id
    }

    /// Enqueue a request for the vnode's workers
    pub fn submit(&self, msg_type: u8, body: impl Into<Vec<u8>>) -> Result<()> {
        let msg = RequestMsg {
            vg_id: self.vg_id,
            msg_type,
            body: body.into(),
        };
        self.sender
            .send(msg)
            .map_err(|_| Error::NotActiveVnode(self.vg_id))
    }
}

/// Allocates and frees vnode queues
pub trait Dispatcher: Send + Sync {
    fn allocate_queue(&self, vg_id: VnodeId, kind: QueueKind) -> QueueHandle;

    fn free_queue(&self, queue: QueueHandle);
}

/// Dispatcher backed by unbounded crossbeam channels.
///
/// Receivers stay with the dispatcher until the queue is freed; worker threads
/// take a clone through [`ChannelDispatcher::receiver`].
#[derive(Default)]
pub struct ChannelDispatcher {
    next_id: AtomicU64,
    receivers: Mutex<HashMap<u64, Receiver<RequestMsg>>>,
    freed: AtomicUsize,
}

impl ChannelDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receiving side of a live queue
    pub fn receiver(&self, queue_id: u64) -> Option<Receiver<RequestMsg>> {
        self.receivers.lock().get(&queue_id).cloned()
    }

    /// Number of queues allocated and not yet freed
    pub fn live_queues(&self) -> usize {
        self.receivers.lock().len()
    }

    /// Number of queues freed so far
    pub fn freed_queues(&self) -> usize {
        self.freed.load(Ordering::Relaxed)
    }
}

impl Dispatcher for ChannelDispatcher {
    fn allocate_queue(&self, vg_id: VnodeId, kind: QueueKind) -> QueueHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = channel::unbounded();
        self.receivers.lock().insert(id, receiver);

        trace!(vg_id, queue_id = id, ?kind, "queue allocated");
        QueueHandle::new(id, kind, vg_id, sender)
    }

    fn free_queue(&self, queue: QueueHandle) {
        if self.receivers.lock().remove(&queue.id).is_some() {
            self.freed.fetch_add(1, Ordering::Relaxed);
            trace!(vg_id = queue.vg_id, queue_id = queue.id, kind = ?queue.kind, "queue freed");
        }
    }
}
