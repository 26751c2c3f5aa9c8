//! Seals remember a node version so that a later operation can reuse a
//! coordinate without searching the tree again. Nothing is held between
//! `init` and `validate`: the node may be edited, evicted or removed in the
//! meantime, and only the version comparison made under the lock decides.

use log::trace;

use crate::coord::{Betweenness, Coordinate};
use crate::error::{ZTreeError, ZTreeResult};
use crate::key::Key;
use crate::lock::{LockHandle, LockMode, LockRequest, LockStack};
use crate::tree::Tree;
use crate::znode::{BlockNr, Level};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Seal {
    version: u64,
    block: BlockNr,
    item_pos: usize,
    unit_pos: usize,
    between: Betweenness,
    key: Option<Key>,
}

/// A coordinate whose node is locked by `handle`.
#[derive(Debug)]
pub struct SealedCoord {
    pub coord: Coordinate,
    pub handle: LockHandle,
}

impl Seal {
    pub fn new(coord: &Coordinate, key: Option<&Key>) -> Self {
        let mut seal = Self::default();
        seal.init(coord, key);
        seal
    }

    /// Bind to the current version of `coord`'s node, replacing any
    /// previous binding.
    pub fn init(&mut self, coord: &Coordinate, key: Option<&Key>) {
        let Some(node) = coord.node() else {
            panic!("sealing a coordinate without a node");
        };
        *self = Seal {
            version: node.version(),
            block: node.block(),
            item_pos: coord.item_pos,
            unit_pos: coord.unit_pos,
            between: coord.between,
            key: key.copied(),
        };
        debug_assert!(self.version != 0);
    }

    pub fn done(&mut self) {
        self.version = 0;
    }

    pub fn is_set(&self) -> bool {
        self.version != 0
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn block(&self) -> BlockNr {
        self.block
    }

    /// Lock the sealed node and check nothing changed since `init`.
    ///
    /// `Stale` when the node is no longer cached, left the tree, sits at a
    /// different level or has a different version; the caller then searches
    /// from the root. Lock failures other than `Dying` (`WouldBlock`,
    /// `Restart`) are passed through. The seal is spent either way.
    pub fn validate(
        &mut self,
        tree: &Tree,
        stack: &LockStack,
        key: &Key,
        level: Level,
        mode: LockMode,
        request: LockRequest,
    ) -> ZTreeResult<SealedCoord> {
        if !self.is_set() {
            return Err(ZTreeError::Stale);
        }
        debug_assert!(
            self.key.map_or(true, |k| k == *key),
            "seal for {:?} validated with {}",
            self.key,
            key
        );
        let version = self.version;
        self.done();

        let Some(node) = tree.zlook(self.block) else {
            trace!("{}: seal out of cache", self.block);
            return Err(ZTreeError::Stale);
        };
        let handle = match stack.longterm_lock(&node, mode, request) {
            Ok(handle) => handle,
            Err(ZTreeError::Dying) => return Err(ZTreeError::Stale),
            Err(e) => return Err(e),
        };
        if node.level() != level || node.version() != version {
            trace!(
                "{}: seal broken (version {} -> {})",
                self.block,
                version,
                node.version()
            );
            return Err(ZTreeError::Stale);
        }
        Ok(SealedCoord {
            coord: Coordinate::at(Some(node), self.item_pos, self.unit_pos, self.between),
            handle,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::TreeConfig;
    use crate::key::KeyType;
    use crate::tree::MemStore;
    use crate::znode::{MemNode, LEAF_LEVEL};

    fn key(off: u64) -> Key {
        Key::new(3, KeyType::Body, 1, off)
    }

    fn setup() -> Tree {
        let store = MemStore::new();
        store.insert(BlockNr(10), MemNode::from_keys([key(1), key(2)]));
        Tree::new(Arc::new(store), TreeConfig::default())
    }

    fn sealed(tree: &Tree) -> (Coordinate, Seal) {
        let node = tree.zget(BlockNr(10), LEAF_LEVEL);
        let coord = Coordinate::at(Some(node), 1, 0, Betweenness::AtUnit);
        let seal = Seal::new(&coord, Some(&key(2)));
        (coord, seal)
    }

    #[test]
    fn pristine_seal_yields_the_sealed_coordinate() {
        let tree = setup();
        let stack = tree.new_lock_stack();
        let (coord, mut seal) = sealed(&tree);
        assert!(seal.is_set());
        let sealed = seal
            .validate(&tree, &stack, &key(2), LEAF_LEVEL, LockMode::Read, LockRequest::LOW)
            .unwrap();
        assert_eq!(sealed.coord, coord);
        assert!(Arc::ptr_eq(sealed.handle.node(), coord.node().unwrap()));
        assert!(!seal.is_set());
    }

    #[test]
    fn modified_node_breaks_the_seal() {
        let tree = setup();
        let stack = tree.new_lock_stack();
        let (coord, mut seal) = sealed(&tree);
        let node = coord.node().unwrap().clone();
        let writer = stack
            .longterm_lock(&node, LockMode::Write, LockRequest::HIGH)
            .unwrap();
        node.mark_modified(&writer);
        drop(writer);
        let result =
            seal.validate(&tree, &stack, &key(2), LEAF_LEVEL, LockMode::Read, LockRequest::LOW);
        assert_eq!(result.unwrap_err(), ZTreeError::Stale);
        assert!(stack.is_clean());
    }

    #[test]
    fn evicted_or_removed_node_is_stale() {
        let tree = setup();
        let stack = tree.new_lock_stack();
        let (coord, mut seal) = sealed(&tree);
        drop(coord);
        assert!(tree.evict(BlockNr(10)));
        let result =
            seal.validate(&tree, &stack, &key(2), LEAF_LEVEL, LockMode::Read, LockRequest::LOW);
        assert_eq!(result.unwrap_err(), ZTreeError::Stale);

        let (coord, mut seal) = sealed(&tree);
        let writer = stack
            .longterm_lock(coord.node().unwrap(), LockMode::Write, LockRequest::HIGH)
            .unwrap();
        tree.delete_node(writer);
        let result =
            seal.validate(&tree, &stack, &key(2), LEAF_LEVEL, LockMode::Read, LockRequest::LOW);
        assert_eq!(result.unwrap_err(), ZTreeError::Stale);
    }

    #[test]
    fn recreated_node_never_matches_an_old_seal() {
        let tree = setup();
        let stack = tree.new_lock_stack();
        let (coord, mut seal) = sealed(&tree);
        drop(coord);
        assert!(tree.evict(BlockNr(10)));
        let _again = tree.zget(BlockNr(10), LEAF_LEVEL);
        let result =
            seal.validate(&tree, &stack, &key(2), LEAF_LEVEL, LockMode::Read, LockRequest::LOW);
        assert_eq!(result.unwrap_err(), ZTreeError::Stale);
    }

    #[test]
    fn wrong_level_and_spent_seal_are_stale() {
        let tree = setup();
        let stack = tree.new_lock_stack();
        let (_coord, mut seal) = sealed(&tree);
        let mut copy = seal.clone();
        let result = seal.validate(&tree, &stack, &key(2), 2, LockMode::Read, LockRequest::LOW);
        assert_eq!(result.unwrap_err(), ZTreeError::Stale);
        let result =
            seal.validate(&tree, &stack, &key(2), LEAF_LEVEL, LockMode::Read, LockRequest::LOW);
        assert_eq!(result.unwrap_err(), ZTreeError::Stale);
        assert!(copy
            .validate(&tree, &stack, &key(2), LEAF_LEVEL, LockMode::Read, LockRequest::LOW)
            .is_ok());
    }
}
