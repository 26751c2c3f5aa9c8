use std::fmt;
use std::sync::Arc;

use super::stack::StackShared;
use super::{longterm, HandleId, LockMode, StackId};
use crate::znode::Znode;

/// A granted long-term lock. Released when dropped.
pub struct LockHandle {
    id: HandleId,
    node: Arc<Znode>,
    pub(crate) stack: Arc<StackShared>,
    mode: LockMode,
    released: bool,
}

impl LockHandle {
    pub(crate) fn new(
        id: HandleId,
        node: Arc<Znode>,
        stack: Arc<StackShared>,
        mode: LockMode,
    ) -> Self {
        Self {
            id,
            node,
            stack,
            mode,
            released: false,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn node(&self) -> &Arc<Znode> {
        &self.node
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn stack_id(&self) -> StackId {
        self.stack.id()
    }

    /// Whether a high priority request asked the owning stack to give this
    /// lock up.
    pub fn is_signaled(&self) -> bool {
        self.node
            .lock
            .state
            .lock()
            .owners
            .get(&self.id)
            .is_some_and(|owner| owner.signaled)
    }

    /// Take the same lock a second time for the same stack.
    pub fn duplicate(&self) -> LockHandle {
        longterm::duplicate(self)
    }

    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if !self.released {
            longterm::longterm_unlock(&self.node, &self.stack, self.id);
            self.released = true;
        }
    }

    pub(crate) fn mark_released(&mut self) {
        self.released = true;
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.do_release();
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("id", &self.id)
            .field("node", &self.node.block())
            .field("mode", &self.mode)
            .finish()
    }
}
