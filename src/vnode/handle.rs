use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use super::Vnode;

/// A counted reference to a vnode.
///
/// Dropping the handle releases the reference. The vnode stays usable through
/// the handle after it is closed or dropped; the last release frees it.
pub struct VnodeRef {
    vnode: Arc<Vnode>,
}

impl VnodeRef {
    /// Wrap a vnode whose count was already incremented for this handle
    pub(crate) fn adopt(vnode: Arc<Vnode>) -> Self {
        Self { vnode }
    }

    /// The shared vnode behind this handle
    pub fn vnode(&self) -> &Arc<Vnode> {
        &self.vnode
    }

    /// Release the reference now
    pub fn release(self) {
        drop(self)
    }
}

impl Deref for VnodeRef {
    type Target = Vnode;

    fn deref(&self) -> &Vnode {
        &self.vnode
    }
}

impl Clone for VnodeRef {
    fn clone(&self) -> Self {
        self.vnode.retain();
        Self {
            vnode: self.vnode.clone(),
        }
    }
}

impl Drop for VnodeRef {
    fn drop(&mut self) {
        self.vnode.release_handle();
    }
}

impl fmt::Debug for VnodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VnodeRef").field(&self.vnode).finish()
    }
}
