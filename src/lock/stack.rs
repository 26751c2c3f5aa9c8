use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{trace, warn};
use parking_lot::{Condvar, Mutex};

use super::registry::StackRegistry;
use super::{HandleId, LockMode, PendingRequest, Priority, StackId};
use crate::config::LockConfig;
use crate::error::{ZTreeError, ZTreeResult};
use crate::znode::Znode;

#[derive(Debug, Clone)]
pub(crate) struct HeldLock {
    pub(crate) node: Arc<Znode>,
    pub(crate) mode: LockMode,
}

/// The part of a lock stack other threads may touch: the signal counter and
/// the wake channel. Everything else is only used by the owning thread.
pub(crate) struct StackShared {
    id: StackId,
    hipri: AtomicBool,
    nr_signaled: AtomicUsize,
    woken: Mutex<bool>,
    wake_cond: Condvar,
    next_seq: AtomicU64,
    debug_checks: bool,
    pub(crate) locks: Mutex<BTreeMap<HandleId, HeldLock>>,
    pending: Mutex<Option<PendingRequest>>,
    acquired: AtomicU64,
    sleeps: AtomicU64,
    restarts: AtomicU64,
}

impl StackShared {
    pub(crate) fn new(id: StackId, debug_checks: bool) -> Self {
        Self {
            id,
            hipri: AtomicBool::new(true),
            nr_signaled: AtomicUsize::new(0),
            woken: Mutex::new(false),
            wake_cond: Condvar::new(),
            next_seq: AtomicU64::new(1),
            debug_checks,
            locks: Mutex::new(BTreeMap::new()),
            pending: Mutex::new(None),
            acquired: AtomicU64::new(0),
            sleeps: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        }
    }

    pub(crate) fn id(&self) -> StackId {
        self.id
    }

    pub(crate) fn is_hipri(&self) -> bool {
        self.hipri.load(Ordering::Acquire)
    }

    pub(crate) fn set_hipri(&self, hipri: bool) {
        self.hipri.store(hipri, Ordering::Release);
    }

    pub(crate) fn debug_checks(&self) -> bool {
        self.debug_checks
    }

    pub(crate) fn next_handle_id(&self) -> HandleId {
        HandleId {
            stack: self.id,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub(crate) fn nr_signaled(&self) -> usize {
        self.nr_signaled.load(Ordering::SeqCst)
    }

    /// Called with the signaled node's guard held.
    pub(crate) fn signal(&self) {
        self.nr_signaled.fetch_add(1, Ordering::SeqCst);
        self.wake_up();
    }

    pub(crate) fn unsignal(&self) {
        let prev = self.nr_signaled.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "stack {}: signal count underflow", self.id);
    }

    pub(crate) fn wake_up(&self) {
        let mut woken = self.woken.lock();
        *woken = true;
        self.wake_cond.notify_one();
    }

    /// Arms the wake channel. A wake-up that lands after this call is never
    /// lost, even if it arrives before `go_to_sleep`.
    pub(crate) fn arm_wakeup(&self) {
        *self.woken.lock() = false;
    }

    /// Arms the wake channel, refusing to sleep when a low priority stack
    /// has been signaled.
    pub(crate) fn prepare_to_sleep(&self) -> ZTreeResult<()> {
        self.arm_wakeup();
        if self.nr_signaled() != 0 && !self.is_hipri() {
            return Err(ZTreeError::Restart);
        }
        Ok(())
    }

    pub(crate) fn go_to_sleep(&self) {
        self.sleeps.fetch_add(1, Ordering::Relaxed);
        let mut woken = self.woken.lock();
        while !*woken {
            self.wake_cond.wait(&mut woken);
        }
        *woken = false;
    }

    pub(crate) fn set_pending(&self, pending: Option<PendingRequest>) {
        *self.pending.lock() = pending;
    }

    pub(crate) fn pending(&self) -> Option<PendingRequest> {
        *self.pending.lock()
    }

    pub(crate) fn held_locks(&self) -> Vec<(HandleId, HeldLock)> {
        self.locks
            .lock()
            .iter()
            .map(|(id, held)| (*id, held.clone()))
            .collect()
    }

    pub(crate) fn record_acquired(&self) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for StackShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackShared")
            .field("id", &self.id)
            .field("hipri", &self.is_hipri())
            .field("nr_signaled", &self.nr_signaled())
            .finish()
    }
}

/// Per-operation record of held long-term locks.
///
/// A stack belongs to one thread of control; it can be moved between threads
/// but not shared. Other threads reach it only through a [`StackWaker`] or by
/// signaling it from a node lock.
pub struct LockStack {
    pub(crate) shared: Arc<StackShared>,
    registry: Arc<StackRegistry>,
    _not_sync: PhantomData<Cell<()>>,
}

impl LockStack {
    pub fn new(registry: &Arc<StackRegistry>, config: &LockConfig) -> Self {
        let shared = registry.register(config.debug_checks);
        trace!("stack {} created", shared.id());
        Self {
            shared,
            registry: registry.clone(),
            _not_sync: PhantomData,
        }
    }

    pub fn id(&self) -> StackId {
        self.shared.id()
    }

    pub fn priority(&self) -> Priority {
        if self.shared.is_hipri() {
            Priority::High
        } else {
            Priority::Low
        }
    }

    /// No long-term locks held.
    pub fn is_clean(&self) -> bool {
        self.shared.locks.lock().is_empty()
    }

    pub fn held_count(&self) -> usize {
        self.shared.locks.lock().len()
    }

    /// Mode of the first lock this stack holds on `node`.
    pub fn holds(&self, node: &Arc<Znode>) -> Option<LockMode> {
        self.shared
            .locks
            .lock()
            .values()
            .find(|held| Arc::ptr_eq(&held.node, node))
            .map(|held| held.mode)
    }

    /// True once some high priority request asked this stack to yield.
    pub fn check_deadlock(&self) -> bool {
        self.shared.nr_signaled() != 0
    }

    /// The cancellation point used by long operations between lock requests.
    pub fn check_restart(&self) -> ZTreeResult<()> {
        if self.check_deadlock() {
            trace!("stack {}: restart requested", self.id());
            return Err(ZTreeError::Restart);
        }
        Ok(())
    }

    pub fn prepare_to_sleep(&self) -> ZTreeResult<()> {
        self.shared.prepare_to_sleep()
    }

    pub fn go_to_sleep(&self) {
        self.shared.go_to_sleep()
    }

    pub fn wake_up(&self) {
        self.shared.wake_up()
    }

    pub fn waker(&self) -> StackWaker {
        StackWaker {
            shared: self.shared.clone(),
        }
    }

    pub fn counters(&self) -> LockCounters {
        let locks = self.shared.locks.lock();
        let write_locked = locks
            .values()
            .filter(|held| held.mode == LockMode::Write)
            .count();
        LockCounters {
            held: locks.len(),
            read_locked: locks.len() - write_locked,
            write_locked,
            signaled: self.shared.nr_signaled(),
            priority: self.priority(),
            pending: self.shared.pending(),
            acquired: self.shared.acquired.load(Ordering::Relaxed),
            sleeps: self.shared.sleeps.load(Ordering::Relaxed),
            restarts: self.shared.restarts.load(Ordering::Relaxed),
        }
    }

    /// Release every lock still held. Returns how many were released.
    pub fn release_all(&self) -> usize {
        let held = std::mem::take(&mut *self.shared.locks.lock());
        let count = held.len();
        for (id, lock) in held {
            super::longterm::unlock_node(&lock.node, &self.shared, id);
        }
        count
    }
}

impl Drop for LockStack {
    fn drop(&mut self) {
        let leftover = self.release_all();
        if leftover > 0 {
            warn!("stack {} dropped with {} locks held", self.id(), leftover);
        }
        self.registry.deregister(self.id());
    }
}

impl fmt::Debug for LockStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockStack")
            .field("id", &self.id())
            .field("priority", &self.priority())
            .field("held", &self.held_count())
            .finish()
    }
}

/// Cross-thread handle able to wake a sleeping stack.
#[derive(Debug, Clone)]
pub struct StackWaker {
    shared: Arc<StackShared>,
}

impl StackWaker {
    pub fn wake_up(&self) {
        self.shared.wake_up()
    }
}

/// Snapshot of what the calling context holds and has done.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockCounters {
    pub held: usize,
    pub read_locked: usize,
    pub write_locked: usize,
    pub signaled: usize,
    pub priority: Priority,
    pub pending: Option<PendingRequest>,
    pub acquired: u64,
    pub sleeps: u64,
    pub restarts: u64,
}
