//! The znode cache and the operations that span several nodes.

mod store;
mod walk;

pub use store::{MemStore, NodeStore};
pub use walk::Side;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, trace};
use parking_lot::Mutex;

use crate::config::TreeConfig;
use crate::error::{ZTreeError, ZTreeResult};
use crate::lock::{invalidate_lock, LockHandle, LockMode, LockStack, StackRegistry};
use crate::znode::{BlockNr, Level, NodeLayout, Znode, HEARD_BANSHEE};

#[derive(Debug)]
pub struct Tree {
    znodes: DashMap<BlockNr, Arc<Znode>>,
    store: Arc<dyn NodeStore>,
    epoch: Arc<AtomicU64>,
    /// Serializes updates that touch the links of several nodes.
    link_lock: Mutex<()>,
    registry: Arc<StackRegistry>,
    config: TreeConfig,
}

impl Tree {
    pub fn new(store: Arc<dyn NodeStore>, config: TreeConfig) -> Self {
        Self::with_registry(store, config, Arc::new(StackRegistry::new()))
    }

    pub fn with_registry(
        store: Arc<dyn NodeStore>,
        config: TreeConfig,
        registry: Arc<StackRegistry>,
    ) -> Self {
        Self {
            znodes: DashMap::new(),
            store,
            epoch: Arc::new(AtomicU64::new(0)),
            link_lock: Mutex::new(()),
            registry,
            config,
        }
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<StackRegistry> {
        &self.registry
    }

    pub fn new_lock_stack(&self) -> LockStack {
        LockStack::new(&self.registry, &self.config.lock)
    }

    /// Find the handle for `block`, creating it on first reference.
    pub fn zget(&self, block: BlockNr, level: Level) -> Arc<Znode> {
        let node = self
            .znodes
            .entry(block)
            .or_insert_with(|| {
                trace!("{}: new znode at level {}", block, level);
                Arc::new(Znode::new(block, level, self.epoch.clone()))
            })
            .value()
            .clone();
        assert_eq!(node.level(), level, "{} looked up at the wrong level", block);
        node
    }

    /// Cache lookup only. Nodes removed from the tree are not returned.
    pub fn zlook(&self, block: BlockNr) -> Option<Arc<Znode>> {
        self.znodes
            .get(&block)
            .map(|entry| entry.value().clone())
            .filter(|node| !node.test_flag(HEARD_BANSHEE))
    }

    pub fn cached_count(&self) -> usize {
        self.znodes.len()
    }

    /// Pin the content of `node`, reading it from the store on first use.
    pub fn zload(&self, node: &Arc<Znode>) -> ZTreeResult<Arc<dyn NodeLayout>> {
        {
            let data = node.data.read();
            if let Some(layout) = &*data {
                node.d_count.fetch_add(1, Ordering::AcqRel);
                return Ok(layout.clone());
            }
        }
        let mut data = node.data.write();
        let layout = match data.clone() {
            Some(layout) => layout,
            None => {
                let layout = self.store.load(node.block())?;
                trace!("{}: loaded", node.block());
                *data = Some(layout.clone());
                layout
            }
        };
        node.d_count.fetch_add(1, Ordering::AcqRel);
        Ok(layout)
    }

    pub fn zrelse(&self, node: &Znode) {
        let prev = node.d_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "{}: released more than loaded", node.block());
    }

    /// Drop the content of an unpinned node. Returns false if pinned.
    pub fn unload(&self, node: &Znode) -> bool {
        let mut data = node.data.write();
        if node.load_count() != 0 {
            return false;
        }
        *data = None;
        true
    }

    /// Replace the content of a node write-locked through `handle`.
    /// Returns the new version.
    pub fn write_node(
        &self,
        handle: &LockHandle,
        layout: Arc<dyn NodeLayout>,
    ) -> ZTreeResult<u64> {
        if handle.mode() != LockMode::Write {
            return Err(ZTreeError::Internal(format!(
                "{}: content written under a read lock",
                handle.node().block()
            )));
        }
        let node = handle.node();
        self.store.store(node.block(), layout.clone())?;
        *node.data.write() = Some(layout);
        Ok(node.mark_modified(handle))
    }

    /// Drop `block` from the cache if nobody references, locks or pins it.
    pub fn evict(&self, block: BlockNr) -> bool {
        let removed = self.znodes.remove_if(&block, |_, node| {
            Arc::strong_count(node) == 1 && !node.lock.is_locked() && node.load_count() == 0
        });
        match removed {
            Some((_, node)) => {
                self.sibling_list_drop(&node);
                trace!("{}: evicted", block);
                true
            }
            None => false,
        }
    }

    /// Evict everything evictable. Returns how many nodes went away.
    pub fn shrink(&self) -> usize {
        let blocks: Vec<BlockNr> = self.znodes.iter().map(|e| *e.key()).collect();
        blocks.into_iter().filter(|b| self.evict(*b)).count()
    }

    /// Remove the node write-locked through `handle` from the tree. Every
    /// request queued on its lock fails with `Dying`.
    pub fn delete_node(&self, handle: LockHandle) {
        let node = handle.node().clone();
        assert!(
            handle.mode() == LockMode::Write,
            "{}: deleted under a read lock",
            node.block()
        );
        node.set_flag(HEARD_BANSHEE);
        self.sibling_list_remove(&node);
        self.znodes
            .remove_if(&node.block(), |_, cached| Arc::ptr_eq(cached, &node));
        invalidate_lock(handle);
        debug!("{}: removed from the tree", node.block());
    }

    /// Run `op` until it finishes with anything but `Restart`. Between
    /// attempts every lock the stack still holds is released. After
    /// `max_restarts` consecutive restarts the loop backs off exponentially.
    pub fn run_with_restart<T, F>(&self, stack: &LockStack, mut op: F) -> ZTreeResult<T>
    where
        F: FnMut(&LockStack) -> ZTreeResult<T>,
    {
        let lock_config = &self.config.lock;
        let mut restarts = 0usize;
        loop {
            match op(stack) {
                Err(ZTreeError::Restart) => {
                    let released = stack.release_all();
                    stack.shared.record_restart();
                    restarts += 1;
                    debug!(
                        "stack {}: restart {} (released {} leftover locks)",
                        stack.id(),
                        restarts,
                        released
                    );
                    if restarts > lock_config.max_restarts {
                        thread::sleep(Duration::from_micros(
                            lock_config
                                .restart_backoff_base_us
                                .saturating_mul(1 << (restarts.min(10) - 1)),
                        ));
                        restarts = 0;
                    } else {
                        thread::yield_now();
                    }
                }
                result => return result,
            }
        }
    }
}
