use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{Vnode, VnodeId, VnodeRef, VnodeStatus};
use crate::error::{Error, Result};

/// Map of every vnode that has not finished teardown
#[derive(Default)]
pub struct VnodeRegistry {
    vnodes: RwLock<BTreeMap<VnodeId, Arc<Vnode>>>,
}

impl VnodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `vnode` unless its id is taken.
    ///
    /// Returns the vnode now registered under the id, which is the existing
    /// one if there was one.
    pub fn insert(&self, vnode: Arc<Vnode>) -> (Arc<Vnode>, bool) {
        let mut vnodes = self.vnodes.write();
        match vnodes.get(&vnode.id()) {
            Some(existing) => (existing.clone(), false),
            None => {
                vnodes.insert(vnode.id(), vnode.clone());
                (vnode, true)
            }
        }
    }

    pub fn lookup(&self, id: VnodeId) -> Option<Arc<Vnode>> {
        self.vnodes.read().get(&id).cloned()
    }

    pub fn contains(&self, id: VnodeId) -> bool {
        self.vnodes.read().contains_key(&id)
    }

    pub fn remove(&self, id: VnodeId) -> Option<Arc<Vnode>> {
        self.vnodes.write().remove(&id)
    }

    /// Remove the entry for `vnode.id()` only if it is this very vnode
    pub fn remove_if_same(&self, vnode: &Arc<Vnode>) -> bool {
        let mut vnodes = self.vnodes.write();
        match vnodes.get(&vnode.id()) {
            Some(current) if Arc::ptr_eq(current, vnode) => {
                vnodes.remove(&vnode.id());
                true
            }
            _ => false,
        }
    }

    /// Run `f` while `vnode` is the registered entry for its id. Returns
    /// `None` without running it otherwise.
    pub(crate) fn while_registered<R>(&self, vnode: &Arc<Vnode>, f: impl FnOnce() -> R) -> Option<R> {
        let vnodes = self.vnodes.read();
        match vnodes.get(&vnode.id()) {
            Some(current) if Arc::ptr_eq(current, vnode) => Some(f()),
            _ => None,
        }
    }

    /// Take a reference to a ready vnode.
    ///
    /// The count is bumped under the read lock, so a concurrent teardown
    /// either removes the entry first and the lookup misses, or sees the extra
    /// reference before it releases the implicit one.
    pub fn acquire(&self, id: VnodeId) -> Result<VnodeRef> {
        let vnodes = self.vnodes.read();
        let vnode = vnodes.get(&id).ok_or(Error::InvalidVgroupId(id))?;

        if !vnode.is_ready() {
            return Err(Error::InvalidVgroupId(id));
        }

        vnode.retain();
        Ok(VnodeRef::adopt(vnode.clone()))
    }

    /// Call `f` for every opened vnode in id order, skipping vnodes that are
    /// still opening or are being deleted
    pub fn visit_all<F: FnMut(&Vnode)>(&self, mut f: F) {
        let vnodes = self.vnodes.read();
        for vnode in vnodes.values() {
            match vnode.status() {
                VnodeStatus::Init | VnodeStatus::Deleting => continue,
                _ => f(vnode),
            }
        }
    }

    /// Snapshot of the registered ids
    pub fn ids(&self) -> Vec<VnodeId> {
        self.vnodes.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.vnodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.vnodes.read().is_empty()
    }
}
