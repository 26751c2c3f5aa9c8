//! Tree access pointers: a coordinate together with the lock on its node,
//! moved as one unit by scans that cross node boundaries.

use std::sync::Arc;

use log::{trace, warn};

use crate::coord::Coordinate;
use crate::error::{ZTreeError, ZTreeResult};
use crate::key::Key;
use crate::lock::{LockHandle, LockMode, LockRequest, LockStack};
use crate::tree::{Side, Tree};
use crate::znode::Znode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Next,
    Prev,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Unit,
    Item,
}

/// Invariant: while the tap is live, `coord.node` is the node `handle`
/// locks. `loaded` counts nested pins of that node's content.
#[derive(Debug)]
pub struct Tap<'a> {
    tree: &'a Tree,
    stack: &'a LockStack,
    coord: Coordinate,
    handle: Option<LockHandle>,
    mode: LockMode,
    loaded: u32,
}

impl<'a> Tap<'a> {
    /// Bind `coord` to `handle` without loading anything.
    pub fn new(
        tree: &'a Tree,
        stack: &'a LockStack,
        coord: Coordinate,
        handle: LockHandle,
        mode: LockMode,
    ) -> Self {
        assert!(coord.is_on(handle.node()), "tap coordinate off its locked node");
        assert_eq!(handle.stack_id(), stack.id(), "tap handle of another stack");
        Self {
            tree,
            stack,
            coord,
            handle: Some(handle),
            mode,
            loaded: 0,
        }
    }

    pub fn coord(&self) -> &Coordinate {
        &self.coord
    }

    pub fn handle(&self) -> Option<&LockHandle> {
        self.handle.as_ref()
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn load_count(&self) -> u32 {
        self.loaded
    }

    pub fn is_done(&self) -> bool {
        self.handle.is_none()
    }

    pub fn node(&self) -> ZTreeResult<&Arc<Znode>> {
        self.handle
            .as_ref()
            .map(|h| h.node())
            .ok_or(ZTreeError::TapDone)
    }

    /// Key of the unit the tap points at. The node must be loaded.
    pub fn unit_key(&self) -> ZTreeResult<Key> {
        let layout = self.node()?.layout()?;
        if !self.coord.is_existing_unit(&*layout) {
            return Err(ZTreeError::Internal(format!(
                "tap is not at a unit: {:?}",
                self.coord
            )));
        }
        Ok(layout.unit_key(self.coord.item_pos, self.coord.unit_pos))
    }

    pub fn load(&mut self) -> ZTreeResult<()> {
        let node = self.node()?;
        if self.loaded == 0 {
            self.tree.zload(node)?;
        }
        self.loaded += 1;
        Ok(())
    }

    pub fn release(&mut self) {
        assert!(self.loaded > 0, "tap released more than loaded");
        self.loaded -= 1;
        if self.loaded == 0 {
            if let Some(handle) = &self.handle {
                self.tree.zrelse(handle.node());
            }
        }
    }

    /// Swap the held lock for `target`, re-pinning content when loaded. On
    /// failure the tap is left as it was and `target` is released.
    pub fn move_to(&mut self, target: LockHandle) -> ZTreeResult<()> {
        let current = self.handle.as_ref().ok_or(ZTreeError::TapDone)?;
        assert!(self.coord.is_on(current.node()), "tap coordinate off its locked node");
        assert_eq!(target.stack_id(), self.stack.id(), "tap moved to a foreign lock");
        if self.loaded > 0 {
            self.tree.zload(target.node())?;
            self.tree.zrelse(current.node());
        }
        trace!("tap: {} -> {}", current.node().block(), target.node().block());
        self.coord.node = Some(target.node().clone());
        self.handle = Some(target);
        Ok(())
    }

    /// Lock `node` at high priority and move there. The in-node position is
    /// kept as is.
    pub fn to_node(&mut self, node: &Arc<Znode>) -> ZTreeResult<()> {
        if Arc::ptr_eq(self.node()?, node) {
            return Ok(());
        }
        let handle = self
            .stack
            .longterm_lock(node, self.mode, LockRequest::HIGH)?;
        self.move_to(handle)
    }

    pub fn to_coord(&mut self, target: &Coordinate) -> ZTreeResult<()> {
        let Some(node) = target.node() else {
            return Err(ZTreeError::Internal("tap moved to a detached coordinate".to_string()));
        };
        self.to_node(node)?;
        self.coord = target.clone();
        Ok(())
    }

    /// Advance one unit or item. Leaving the node locks the sibling (left
    /// at low priority, right at high) and lands on its first or last unit,
    /// skipping empty nodes. A tap parked between units lands on the
    /// adjacent unit instead. `NoNeighbor` at the end of the tree leaves the
    /// tap where it was.
    pub fn step(&mut self, dir: Direction, granularity: Granularity) -> ZTreeResult<()> {
        self.load()?;
        let result = self.step_loaded(dir, granularity);
        self.release();
        result
    }

    pub fn next_unit(&mut self) -> ZTreeResult<()> {
        self.step(Direction::Next, Granularity::Unit)
    }

    pub fn prev_unit(&mut self) -> ZTreeResult<()> {
        self.step(Direction::Prev, Granularity::Unit)
    }

    fn step_loaded(&mut self, dir: Direction, granularity: Granularity) -> ZTreeResult<()> {
        let layout = self.node()?.layout()?;
        let mut dup = self.coord.clone();
        if dup.is_invalid() {
            return Err(ZTreeError::Internal(format!(
                "tap step from an invalid coordinate on {}",
                self.node()?.block()
            )));
        }
        let moved = if dup.is_empty() {
            false
        } else if !dup.is_existing_unit(&*layout) {
            // Between units: landing on the adjacent unit is the step.
            match dir {
                Direction::Next => dup.set_to_right(&*layout),
                Direction::Prev => dup.set_to_left(&*layout),
            }
        } else {
            match (dir, granularity) {
                (Direction::Next, Granularity::Unit) => dup.next_unit(&*layout),
                (Direction::Prev, Granularity::Unit) => dup.prev_unit(&*layout),
                (Direction::Next, Granularity::Item) => dup.next_item(&*layout),
                (Direction::Prev, Granularity::Item) => dup.prev_item(&*layout),
            }
        };
        if moved {
            self.coord = dup;
            return Ok(());
        }

        let side = match dir {
            Direction::Next => Side::Right,
            Direction::Prev => Side::Left,
        };
        let mut skipped: Option<LockHandle> = None;
        loop {
            let from = match &skipped {
                Some(handle) => handle.node().clone(),
                None => self.node()?.clone(),
            };
            let next = self
                .tree
                .get_neighbor(self.stack, &from, side, self.mode, false)?;
            let layout = self.tree.zload(next.node())?;
            self.tree.zrelse(next.node());
            if layout.is_empty() {
                trace!("tap: skipping empty {}", next.node().block());
                skipped = Some(next);
                continue;
            }
            let node = next.node().clone();
            self.move_to(next)?;
            self.coord = match dir {
                Direction::Next => Coordinate::first_unit(Some(node), &*layout),
                Direction::Prev => Coordinate::last_unit(Some(node), &*layout),
            };
            return Ok(());
        }
    }

    fn rewind(&mut self, dir: Direction, shift: usize) -> ZTreeResult<()> {
        self.load()?;
        let mut result = Ok(());
        for _ in 0..shift {
            result = self.step(dir, Granularity::Unit);
            if result.is_err() {
                break;
            }
        }
        self.release();
        result
    }

    pub fn rewind_right(&mut self, shift: usize) -> ZTreeResult<()> {
        self.rewind(Direction::Next, shift)
    }

    pub fn rewind_left(&mut self, shift: usize) -> ZTreeResult<()> {
        self.rewind(Direction::Prev, shift)
    }

    /// Release the lock and any pins. A second call is refused.
    pub fn done(&mut self) -> ZTreeResult<()> {
        let Some(handle) = self.handle.take() else {
            warn!("tap finished twice");
            return Err(ZTreeError::TapDone);
        };
        assert!(self.coord.is_on(handle.node()), "tap coordinate off its locked node");
        if self.loaded > 0 {
            self.tree.zrelse(handle.node());
        }
        self.loaded = 0;
        self.coord.node = None;
        handle.release();
        Ok(())
    }
}

impl Drop for Tap<'_> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.done();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TreeConfig;
    use crate::key::KeyType;
    use crate::tree::MemStore;
    use crate::znode::{BlockNr, MemNode, LEAF_LEVEL};

    fn key(off: u64) -> Key {
        Key::new(5, KeyType::Body, 9, off)
    }

    #[test]
    fn nested_loads_pin_once() {
        let store = MemStore::new();
        store.insert(BlockNr(1), MemNode::from_keys([key(1), key(2)]));
        let tree = Tree::new(Arc::new(store), TreeConfig::default());
        let stack = tree.new_lock_stack();
        let node = tree.zget(BlockNr(1), LEAF_LEVEL);
        let handle = stack
            .longterm_lock(&node, LockMode::Read, LockRequest::LOW)
            .unwrap();
        let coord = Coordinate::at(Some(node.clone()), 0, 0, crate::coord::Betweenness::AtUnit);
        let mut tap = Tap::new(&tree, &stack, coord, handle, LockMode::Read);
        tap.load().unwrap();
        tap.load().unwrap();
        assert_eq!(node.load_count(), 1);
        assert_eq!(tap.unit_key().unwrap(), key(1));
        tap.release();
        assert_eq!(node.load_count(), 1);
        tap.release();
        assert_eq!(node.load_count(), 0);

        tap.load().unwrap();
        tap.done().unwrap();
        assert_eq!(node.load_count(), 0);
        assert!(stack.is_clean());
        assert_eq!(tap.done(), Err(ZTreeError::TapDone));
        assert_eq!(tap.load(), Err(ZTreeError::TapDone));
    }
}
