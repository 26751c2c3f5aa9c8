use std::sync::{Arc, Weak};

use log::debug;

use super::Tree;
use crate::error::{ZTreeError, ZTreeResult};
use crate::lock::{LockHandle, LockMode, LockRequest, LockStack, Priority};
use crate::znode::{BlockNr, NodeLayout, ParentLink, Znode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl Tree {
    /// Make `left` and `right` siblings. `None` marks the tree edge on that
    /// side of the other node.
    pub fn link_left_and_right(&self, left: Option<&Arc<Znode>>, right: Option<&Arc<Znode>>) {
        let _links = self.link_lock.lock();
        if let Some(l) = left {
            let mut links = l.links.lock();
            links.right = right.map(Arc::downgrade).unwrap_or_default();
            links.right_connected = true;
        }
        if let Some(r) = right {
            let mut links = r.links.lock();
            links.left = left.map(Arc::downgrade).unwrap_or_default();
            links.left_connected = true;
        }
    }

    /// Insert `node` right after `left`, or as the leftmost node of its
    /// level when `left` is `None`.
    pub fn sibling_list_insert(&self, node: &Arc<Znode>, left: Option<&Arc<Znode>>) {
        let _links = self.link_lock.lock();
        let Some(left) = left else {
            let mut links = node.links.lock();
            links.left = Weak::new();
            links.left_connected = true;
            return;
        };
        let old_right = {
            let mut links = left.links.lock();
            let old = links.right_connected.then(|| links.right.clone());
            links.right = Arc::downgrade(node);
            links.right_connected = true;
            old
        };
        {
            let mut links = node.links.lock();
            links.left = Arc::downgrade(left);
            links.left_connected = true;
            if let Some(right) = &old_right {
                links.right = right.clone();
                links.right_connected = true;
            }
        }
        if let Some(right) = old_right.and_then(|w| w.upgrade()) {
            let mut links = right.links.lock();
            links.left = Arc::downgrade(node);
            links.left_connected = true;
        }
    }

    /// Unlink `node`, joining its neighbours to each other.
    pub fn sibling_list_remove(&self, node: &Arc<Znode>) {
        let _links = self.link_lock.lock();
        let (left, left_connected, right, right_connected) = {
            let mut links = node.links.lock();
            let taken = (
                std::mem::take(&mut links.left),
                links.left_connected,
                std::mem::take(&mut links.right),
                links.right_connected,
            );
            links.left_connected = false;
            links.right_connected = false;
            taken
        };
        if let Some(l) = left.upgrade() {
            let mut links = l.links.lock();
            links.right = right.clone();
            links.right_connected = right_connected;
        }
        if let Some(r) = right.upgrade() {
            let mut links = r.links.lock();
            links.left = left;
            links.left_connected = left_connected;
        }
    }

    /// Forget `node` on both neighbours without joining them; used when a
    /// node leaves the cache but not the tree.
    pub(crate) fn sibling_list_drop(&self, node: &Znode) {
        let _links = self.link_lock.lock();
        let (left, right) = {
            let mut links = node.links.lock();
            links.left_connected = false;
            links.right_connected = false;
            (
                std::mem::take(&mut links.left),
                std::mem::take(&mut links.right),
            )
        };
        if let Some(l) = left.upgrade() {
            let mut links = l.links.lock();
            links.right = Weak::new();
            links.right_connected = false;
        }
        if let Some(r) = right.upgrade() {
            let mut links = r.links.lock();
            links.left = Weak::new();
            links.left_connected = false;
        }
    }

    pub fn set_parent(&self, node: &Arc<Znode>, parent: &Arc<Znode>, item_pos: usize) {
        assert_eq!(
            parent.level(),
            node.level() + 1,
            "{} is not one level above {}",
            parent.block(),
            node.block()
        );
        node.links.lock().parent = Some(ParentLink {
            node: Arc::downgrade(parent),
            item_pos,
        });
    }

    /// Lock the neighbour of `node` on `side`. Leftward moves run at low
    /// priority, rightward at high. A link lost to eviction is renewed
    /// through the parent; `NoNeighbor` means `node` sits at the edge of its
    /// level, or has no parent to renew the link through.
    pub fn get_neighbor(
        &self,
        stack: &LockStack,
        node: &Arc<Znode>,
        side: Side,
        mode: LockMode,
        non_blocking: bool,
    ) -> ZTreeResult<LockHandle> {
        let priority = match side {
            Side::Left => Priority::Low,
            Side::Right => Priority::High,
        };
        let mut request = LockRequest::new(priority);
        if non_blocking {
            request = request.non_blocking();
        }
        self.lock_link(
            stack,
            node,
            mode,
            request,
            || match sibling_link(node, side) {
                SiblingLink::Linked(target) => Ok(target),
                SiblingLink::Edge => Err(ZTreeError::NoNeighbor),
                SiblingLink::Broken => self.renew_sibling(stack, node, side, non_blocking),
            },
            |n| sibling(n, side),
        )
    }

    pub fn get_left_neighbor(
        &self,
        stack: &LockStack,
        node: &Arc<Znode>,
        mode: LockMode,
    ) -> ZTreeResult<LockHandle> {
        self.get_neighbor(stack, node, Side::Left, mode, false)
    }

    pub fn get_right_neighbor(
        &self,
        stack: &LockStack,
        node: &Arc<Znode>,
        mode: LockMode,
    ) -> ZTreeResult<LockHandle> {
        self.get_neighbor(stack, node, Side::Right, mode, false)
    }

    /// Lock the parent of `node` at high priority.
    pub fn get_parent(
        &self,
        stack: &LockStack,
        node: &Arc<Znode>,
        mode: LockMode,
    ) -> ZTreeResult<LockHandle> {
        self.lock_parent(stack, node, mode, false)
    }

    fn lock_parent(
        &self,
        stack: &LockStack,
        node: &Arc<Znode>,
        mode: LockMode,
        non_blocking: bool,
    ) -> ZTreeResult<LockHandle> {
        let mut request = LockRequest::HIGH;
        if non_blocking {
            request = request.non_blocking();
        }
        self.lock_link(
            stack,
            node,
            mode,
            request,
            || parent_of(node).ok_or(ZTreeError::NoNeighbor),
            parent_of,
        )
    }

    /// Find the `side` neighbour of `node` through its read-locked parent
    /// and connect the two. At the parent's edge the neighbour is the
    /// nearest child of the parent's own neighbour.
    fn renew_sibling(
        &self,
        stack: &LockStack,
        node: &Arc<Znode>,
        side: Side,
        non_blocking: bool,
    ) -> ZTreeResult<Arc<Znode>> {
        let Some((_, hint)) = node.parent() else {
            return Err(ZTreeError::NoNeighbor);
        };
        let parent = self.lock_parent(stack, node, LockMode::Read, non_blocking)?;
        let layout = self.zload(parent.node())?;
        let found = match child_pos(&*layout, node.block(), hint) {
            Some(pos) => self.child_beside(stack, &parent, &*layout, pos, side, non_blocking),
            None => Err(ZTreeError::Internal(format!(
                "{} has no pointer to {}",
                parent.node().block(),
                node.block()
            ))),
        };
        self.zrelse(parent.node());

        let neighbor = match found {
            Ok(neighbor) => neighbor,
            Err(ZTreeError::NoNeighbor) => {
                debug!("{}: no {:?} neighbour on level {}", node.block(), side, node.level());
                match side {
                    Side::Left => self.link_left_and_right(None, Some(node)),
                    Side::Right => self.link_left_and_right(Some(node), None),
                }
                return Err(ZTreeError::NoNeighbor);
            }
            Err(e) => return Err(e),
        };
        debug!(
            "{}: renewed {:?} link to {} through {}",
            node.block(),
            side,
            neighbor.block(),
            parent.node().block()
        );
        match side {
            Side::Left => self.link_left_and_right(Some(&neighbor), Some(node)),
            Side::Right => self.link_left_and_right(Some(node), Some(&neighbor)),
        }
        Ok(neighbor)
    }

    /// The node next to child `pos` of the locked `parent` on `side`.
    fn child_beside(
        &self,
        stack: &LockStack,
        parent: &LockHandle,
        layout: &dyn NodeLayout,
        pos: usize,
        side: Side,
        non_blocking: bool,
    ) -> ZTreeResult<Arc<Znode>> {
        match side {
            Side::Left if pos > 0 => self.child_at(parent.node(), layout, pos - 1),
            Side::Right if pos + 1 < layout.num_items() => {
                self.child_at(parent.node(), layout, pos + 1)
            }
            _ => {
                let uncle =
                    self.get_neighbor(stack, parent.node(), side, LockMode::Read, non_blocking)?;
                let uncle_layout = self.zload(uncle.node())?;
                let pos = match side {
                    Side::Left => uncle_layout.num_items().checked_sub(1),
                    Side::Right => (!uncle_layout.is_empty()).then_some(0),
                };
                let child = match pos {
                    Some(pos) => self.child_at(uncle.node(), &*uncle_layout, pos),
                    None => Err(ZTreeError::Internal(format!(
                        "internal node {} is empty",
                        uncle.node().block()
                    ))),
                };
                self.zrelse(uncle.node());
                child
            }
        }
    }

    fn child_at(
        &self,
        parent: &Arc<Znode>,
        layout: &dyn NodeLayout,
        pos: usize,
    ) -> ZTreeResult<Arc<Znode>> {
        let block = layout.child(pos).ok_or_else(|| {
            ZTreeError::Internal(format!("item {} of {} is not a pointer", pos, parent.block()))
        })?;
        let child = self.zget(block, parent.level() - 1);
        self.set_parent(&child, parent, pos);
        Ok(child)
    }

    /// Find a link target, lock it, then check the link still points there.
    /// Links can change while we sleep on the lock; a dying target has
    /// already been unlinked, so both cases simply look again.
    fn lock_link(
        &self,
        stack: &LockStack,
        node: &Arc<Znode>,
        mode: LockMode,
        request: LockRequest,
        find: impl Fn() -> ZTreeResult<Arc<Znode>>,
        current: impl Fn(&Znode) -> Option<Arc<Znode>>,
    ) -> ZTreeResult<LockHandle> {
        loop {
            let target = find()?;
            let handle = match stack.longterm_lock(&target, mode, request) {
                Ok(handle) => handle,
                Err(ZTreeError::Dying) => {
                    debug!("{}: neighbour {} died, retrying", node.block(), target.block());
                    continue;
                }
                Err(e) => return Err(e),
            };
            if current(node.as_ref()).is_some_and(|now| Arc::ptr_eq(&now, &target)) {
                return Ok(handle);
            }
            debug!("{}: link to {} changed, retrying", node.block(), target.block());
        }
    }
}

enum SiblingLink {
    Linked(Arc<Znode>),
    /// Connected, with nothing on that side.
    Edge,
    /// Not connected in memory.
    Broken,
}

fn sibling_link(node: &Znode, side: Side) -> SiblingLink {
    let links = node.links.lock();
    let (link, connected) = match side {
        Side::Left => (&links.left, links.left_connected),
        Side::Right => (&links.right, links.right_connected),
    };
    match (connected, link.upgrade()) {
        (false, _) => SiblingLink::Broken,
        (true, Some(target)) => SiblingLink::Linked(target),
        (true, None) => SiblingLink::Edge,
    }
}

fn sibling(node: &Znode, side: Side) -> Option<Arc<Znode>> {
    match sibling_link(node, side) {
        SiblingLink::Linked(target) => Some(target),
        _ => None,
    }
}

fn parent_of(node: &Znode) -> Option<Arc<Znode>> {
    node.parent().map(|(parent, _)| parent)
}

/// Position of the pointer to `block`, trying the remembered `hint` first.
fn child_pos(layout: &dyn NodeLayout, block: BlockNr, hint: usize) -> Option<usize> {
    if hint < layout.num_items() && layout.child(hint) == Some(block) {
        return Some(hint);
    }
    (0..layout.num_items()).find(|&pos| layout.child(pos) == Some(block))
}
