//! In-memory node handles.
//!
//! A [`Znode`] is created the first time a block is referenced through
//! [`crate::tree::Tree::zget`] and lives as long as someone holds an `Arc`
//! to it. Sibling and parent links are weak so they never keep a neighbour
//! alive on their own.

mod layout;

pub use layout::{MemItem, MemNode, NodeLayout};

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::error::{ZTreeError, ZTreeResult};
use crate::key::Key;
use crate::lock::{LockHandle, LockMode, ZLock};

#[derive(derive_new::new, Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockNr(pub u64);

impl fmt::Display for BlockNr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub type Level = u8;
pub const LEAF_LEVEL: Level = 1;

/// Node removed from the tree; excluded from lookups.
pub const HEARD_BANSHEE: u32 = 1 << 0;
/// Content modified since it was loaded.
pub const DIRTY: u32 = 1 << 1;
/// Node belongs to a running transaction.
pub const CAPTURED: u32 = 1 << 2;

#[derive(Debug, Default)]
pub(crate) struct Links {
    pub(crate) left: Weak<Znode>,
    pub(crate) right: Weak<Znode>,
    pub(crate) left_connected: bool,
    pub(crate) right_connected: bool,
    pub(crate) parent: Option<ParentLink>,
}

#[derive(Debug, Clone)]
pub(crate) struct ParentLink {
    pub(crate) node: Weak<Znode>,
    pub(crate) item_pos: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelimKeys {
    pub left: Key,
    pub right: Key,
}

impl Default for DelimKeys {
    fn default() -> Self {
        Self {
            left: Key::MIN,
            right: Key::MAX,
        }
    }
}

pub struct Znode {
    block: BlockNr,
    level: Level,
    version: AtomicU64,
    epoch: Arc<AtomicU64>,
    state: AtomicU32,
    pub(crate) lock: ZLock,
    pub(crate) links: Mutex<Links>,
    delim: RwLock<DelimKeys>,
    pub(crate) data: RwLock<Option<Arc<dyn NodeLayout>>>,
    pub(crate) d_count: AtomicU32,
}

impl Znode {
    pub(crate) fn new(block: BlockNr, level: Level, epoch: Arc<AtomicU64>) -> Self {
        let version = epoch.fetch_add(1, Ordering::SeqCst) + 1;
        Self {
            block,
            level,
            version: AtomicU64::new(version),
            epoch,
            state: AtomicU32::new(0),
            lock: ZLock::new(),
            links: Mutex::new(Links::default()),
            delim: RwLock::new(DelimKeys::default()),
            data: RwLock::new(None),
            d_count: AtomicU32::new(0),
        }
    }

    pub fn block(&self) -> BlockNr {
        self.block
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn lock(&self) -> &ZLock {
        &self.lock
    }

    pub fn test_flag(&self, flag: u32) -> bool {
        self.state.load(Ordering::Acquire) & flag != 0
    }

    pub(crate) fn set_flag(&self, flag: u32) {
        self.state.fetch_or(flag, Ordering::AcqRel);
    }

    pub(crate) fn clear_flag(&self, flag: u32) {
        self.state.fetch_and(!flag, Ordering::AcqRel);
    }

    pub fn is_removed(&self) -> bool {
        self.test_flag(HEARD_BANSHEE)
    }

    pub fn is_dirty(&self) -> bool {
        self.test_flag(DIRTY)
    }

    /// Whether a transaction has captured this node. Crab locks refuse
    /// captured nodes.
    pub fn is_captured(&self) -> bool {
        self.test_flag(CAPTURED)
    }

    pub fn set_captured(&self, captured: bool) {
        if captured {
            self.set_flag(CAPTURED);
        } else {
            self.clear_flag(CAPTURED);
        }
    }

    /// Record a content change made under `handle`. The new version comes
    /// from the tree-wide epoch, so it is larger than any version this block
    /// ever had, including under a previous incarnation of the handle.
    pub fn mark_modified(&self, handle: &LockHandle) -> u64 {
        self.assert_write_locked_by(handle);
        let version = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.version.store(version, Ordering::Release);
        self.set_flag(DIRTY);
        version
    }

    pub fn delim_keys(&self) -> DelimKeys {
        *self.delim.read()
    }

    pub fn set_delim_keys(&self, handle: &LockHandle, left: Key, right: Key) {
        self.assert_write_locked_by(handle);
        assert!(left <= right, "delimiting keys out of order: {} > {}", left, right);
        *self.delim.write() = DelimKeys { left, right };
    }

    /// `left_delim <= key < right_delim`
    pub fn contains_key(&self, key: &Key) -> bool {
        let dk = self.delim.read();
        dk.left <= *key && *key < dk.right
    }

    pub fn is_loaded(&self) -> bool {
        self.data.read().is_some()
    }

    pub fn load_count(&self) -> u32 {
        self.d_count.load(Ordering::Acquire)
    }

    pub fn layout(&self) -> ZTreeResult<Arc<dyn NodeLayout>> {
        self.data
            .read()
            .clone()
            .ok_or(ZTreeError::NotLoaded(self.block.0))
    }

    pub fn is_left_connected(&self) -> bool {
        self.links.lock().left_connected
    }

    pub fn is_right_connected(&self) -> bool {
        self.links.lock().right_connected
    }

    pub fn parent(&self) -> Option<(Arc<Znode>, usize)> {
        let links = self.links.lock();
        let parent = links.parent.as_ref()?;
        Some((parent.node.upgrade()?, parent.item_pos))
    }

    fn assert_write_locked_by(&self, handle: &LockHandle) {
        assert!(
            std::ptr::eq(handle.node().as_ref(), self),
            "handle for {} used on {}",
            handle.node().block(),
            self.block
        );
        assert!(
            handle.mode() == LockMode::Write && self.lock.is_write_owner(handle.stack_id()),
            "{} modified without a write lock",
            self.block
        );
    }
}

impl fmt::Debug for Znode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Znode")
            .field("block", &self.block)
            .field("level", &self.level)
            .field("version", &self.version())
            .field("state", &format_args!("{:#x}", self.state.load(Ordering::Relaxed)))
            .field("readers", &self.lock.reader_count())
            .finish()
    }
}
