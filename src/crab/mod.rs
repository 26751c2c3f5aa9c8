//! Crab locks: optimistic holds for descending parent to child without
//! ever sleeping. A hold keeps writers off the node, so the version seen
//! when it was taken stays valid until the hold goes away. Any contention
//! is reported as `Retry` and left to the caller.

use std::mem;
use std::sync::Arc;

use log::trace;

use crate::error::{ZTreeError, ZTreeResult};
use crate::lock::{crab_hold, crab_release};
use crate::znode::Znode;

#[derive(Debug, Default)]
pub struct CrabLock {
    node: Option<Arc<Znode>>,
    version: u64,
    held: bool,
}

impl CrabLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self) -> Option<&Arc<Znode>> {
        self.node.as_ref()
    }

    pub fn is_locked(&self) -> bool {
        self.held
    }

    /// Version of the node when the hold was taken.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Start a chain at `node`. Fails if it is write-locked, dying or
    /// captured by a transaction.
    pub fn lock_root(&mut self, node: &Arc<Znode>) -> ZTreeResult<()> {
        assert!(!self.held, "crab lock taken twice");
        if !crab_hold(node) {
            trace!("{}: crab hold refused", node.block());
            return Err(ZTreeError::Retry);
        }
        self.node = Some(node.clone());
        self.version = node.version();
        self.held = true;
        Ok(())
    }

    /// Take a hold on `child` through `child_crab` while this crab still
    /// holds the parent, provided the parent has not changed since.
    pub fn lock_child(&self, child_crab: &mut CrabLock, child: &Arc<Znode>) -> ZTreeResult<()> {
        let Some(parent) = self.node.as_ref().filter(|_| self.held) else {
            return Err(ZTreeError::Internal(
                "crab descent from an unlocked parent".to_string(),
            ));
        };
        if parent.version() != self.version || parent.is_captured() {
            trace!("{}: parent changed under crab hold", parent.block());
            return Err(ZTreeError::Retry);
        }
        child_crab.lock_root(child)
    }

    /// Drop the hold and keep the node reference.
    pub fn unlock(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        if let Some(node) = &self.node {
            crab_release(node);
        }
    }

    /// Drop the hold and the node reference.
    pub fn done(&mut self) {
        self.unlock();
        self.node = None;
        self.version = 0;
    }

    /// Move the hold out, leaving this crab empty.
    pub fn take(&mut self) -> CrabLock {
        mem::take(self)
    }
}

impl Drop for CrabLock {
    fn drop(&mut self) {
        self.done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TreeConfig;
    use crate::lock::{LockMode, LockRequest};
    use crate::tree::{MemStore, Tree};
    use crate::znode::{BlockNr, MemNode};

    fn tree() -> Tree {
        let store = MemStore::new();
        store.insert(BlockNr(1), MemNode::empty());
        store.insert(BlockNr(2), MemNode::empty());
        Tree::new(Arc::new(store), TreeConfig::default())
    }

    #[test]
    fn crabbing_descent_holds_two_nodes_at_most() {
        let tree = tree();
        let root = tree.zget(BlockNr(1), 2);
        let leaf = tree.zget(BlockNr(2), 1);

        let mut parent = CrabLock::new();
        parent.lock_root(&root).unwrap();
        let mut child = CrabLock::new();
        parent.lock_child(&mut child, &leaf).unwrap();
        assert_eq!(root.lock().crab_holds(), 1);
        assert_eq!(leaf.lock().crab_holds(), 1);

        parent.unlock();
        assert_eq!(root.lock().crab_holds(), 0);
        assert!(parent.node().is_some());
        parent.done();
        assert!(parent.node().is_none());

        let moved = child.take();
        assert!(!child.is_locked());
        assert!(moved.is_locked());
        drop(moved);
        assert_eq!(leaf.lock().crab_holds(), 0);
    }

    #[test]
    fn write_locked_or_captured_nodes_refuse_holds() {
        let tree = tree();
        let root = tree.zget(BlockNr(1), 2);
        let stack = tree.new_lock_stack();
        let writer = stack
            .longterm_lock(&root, LockMode::Write, LockRequest::HIGH)
            .unwrap();
        let mut crab = CrabLock::new();
        assert_eq!(crab.lock_root(&root), Err(ZTreeError::Retry));
        drop(writer);

        root.set_captured(true);
        assert_eq!(crab.lock_root(&root), Err(ZTreeError::Retry));
        root.set_captured(false);
        crab.lock_root(&root).unwrap();

        // Writers wait for crab holders.
        assert_eq!(
            stack.try_lock(&root, LockMode::Write, crate::lock::Priority::High).err(),
            Some(ZTreeError::WouldBlock)
        );
        assert!(stack
            .try_lock(&root, LockMode::Read, crate::lock::Priority::Low)
            .is_ok());
    }

    #[test]
    fn captured_parent_stops_descent() {
        let tree = tree();
        let root = tree.zget(BlockNr(1), 2);
        let leaf = tree.zget(BlockNr(2), 1);
        let mut parent = CrabLock::new();
        parent.lock_root(&root).unwrap();
        root.set_captured(true);
        let mut child = CrabLock::new();
        assert_eq!(parent.lock_child(&mut child, &leaf), Err(ZTreeError::Retry));
        assert!(!child.is_locked());
        assert_eq!(leaf.lock().crab_holds(), 0);
    }
}
