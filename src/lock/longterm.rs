use std::sync::Arc;

use log::{debug, trace};
use parking_lot::MutexGuard;

use super::stack::{HeldLock, LockStack, StackShared};
use super::zlock::Holders;
use super::{HandleId, LockHandle, LockMode, LockRequest, PendingRequest, Priority};
use crate::error::{ZTreeError, ZTreeResult};
use crate::znode::Znode;

impl LockStack {
    /// Acquire a long-term lock on `node`.
    ///
    /// Grants at once when compatible, or when this stack already write-locks
    /// the node (recursion). Otherwise fails with `WouldBlock` for a
    /// non-blocking request, or queues the stack and sleeps until a release
    /// wakes it. A low priority stack that has been signaled gets `Restart`
    /// instead of sleeping. `Dying` means the node left the tree.
    pub fn longterm_lock(
        &self,
        node: &Arc<Znode>,
        mode: LockMode,
        request: LockRequest,
    ) -> ZTreeResult<LockHandle> {
        let shared = &self.shared;
        let hipri = request.priority == Priority::High;
        if hipri {
            self.set_high_priority();
        } else {
            self.set_low_priority();
        }

        let id = shared.next_handle_id();
        let mut state = node.lock.state.lock();

        if state.is_write_owner(shared.id()) {
            state.grant(shared, id, mode);
            trace!("{}: recursive {} by stack {}", node.block(), mode, shared.id());
            drop(state);
            return Ok(self.adopt(node, id, mode));
        }
        assert!(
            mode == LockMode::Read || !state.owned_by(shared.id()),
            "{}: stack {} upgrades its read lock",
            node.block(),
            shared.id()
        );

        shared.set_pending(Some(PendingRequest {
            block: node.block(),
            mode,
            priority: request.priority,
        }));
        let result = loop {
            match state.can_lock(shared, mode) {
                Ok(()) => break Ok(()),
                Err(ZTreeError::Dying) => {
                    state.wake_all_requestors();
                    break Err(ZTreeError::Dying);
                }
                Err(e) if request.non_blocking => break Err(e),
                Err(_) => {}
            }

            if let Err(e) = shared.prepare_to_sleep() {
                debug!("{}: stack {} signaled, restarting", node.block(), shared.id());
                break Err(e);
            }
            if hipri {
                state.hipri_requests += 1;
                if state.hipri_owners == 0 {
                    state.signal_lopri_owners(node.block());
                }
            }
            state.enqueue(shared.clone(), hipri);
            trace!(
                "{}: stack {} sleeps for {} ({} readers)",
                node.block(),
                shared.id(),
                mode,
                state.reader_count()
            );
            MutexGuard::unlocked(&mut state, || shared.go_to_sleep());
            if hipri {
                assert!(state.hipri_requests > 0, "hipri request count underflow");
                state.hipri_requests -= 1;
            }
            state.remove_requestor(shared.id());
        };
        shared.set_pending(None);
        result?;

        state.grant(shared, id, mode);
        if shared.debug_checks() {
            state.check_invariants(node.block());
        }
        trace!(
            "{}: {} {} granted to stack {} ({} readers)",
            node.block(),
            request.priority,
            mode,
            shared.id(),
            state.reader_count()
        );
        drop(state);
        Ok(self.adopt(node, id, mode))
    }

    /// Non-blocking shorthand for [`LockStack::longterm_lock`].
    pub fn try_lock(
        &self,
        node: &Arc<Znode>,
        mode: LockMode,
        priority: Priority,
    ) -> ZTreeResult<LockHandle> {
        self.longterm_lock(node, mode, LockRequest::new(priority).non_blocking())
    }

    fn adopt(&self, node: &Arc<Znode>, id: HandleId, mode: LockMode) -> LockHandle {
        self.shared.locks.lock().insert(
            id,
            HeldLock {
                node: node.clone(),
                mode,
            },
        );
        self.shared.record_acquired();
        LockHandle::new(id, node.clone(), self.shared.clone(), mode)
    }

    /// Count every held lock as a high priority owner and forget pending
    /// signals.
    pub fn set_high_priority(&self) {
        let shared = &self.shared;
        if shared.is_hipri() {
            return;
        }
        for (id, held) in shared.held_locks() {
            let mut guard = held.node.lock.state.lock();
            let state = &mut *guard;
            if let Some(owner) = state.owners.get_mut(&id) {
                if !owner.hipri {
                    owner.hipri = true;
                    state.hipri_owners += 1;
                }
                if owner.signaled {
                    owner.signaled = false;
                    shared.unsignal();
                }
            }
        }
        shared.set_hipri(true);
    }

    /// Drop to low priority. Any held node that now has a high priority
    /// request and no high priority owner signals its low priority owners,
    /// this stack included.
    pub fn set_low_priority(&self) {
        let shared = &self.shared;
        if !shared.is_hipri() {
            return;
        }
        shared.set_hipri(false);
        for (id, held) in shared.held_locks() {
            let mut guard = held.node.lock.state.lock();
            let state = &mut *guard;
            if let Some(owner) = state.owners.get_mut(&id) {
                if owner.hipri {
                    owner.hipri = false;
                    state.hipri_owners -= 1;
                }
            }
            if state.deadlock_condition() {
                state.signal_lopri_owners(held.node.block());
            }
        }
    }
}

pub(crate) fn longterm_unlock(node: &Arc<Znode>, stack: &Arc<StackShared>, id: HandleId) {
    // Already gone if the stack released everything on restart.
    if stack.locks.lock().remove(&id).is_none() {
        return;
    }
    unlock_node(node, stack, id);
}

pub(crate) fn unlock_node(node: &Arc<Znode>, stack: &StackShared, id: HandleId) {
    let mut state = node.lock.state.lock();
    let owner = state.revoke(id);
    if stack.debug_checks() {
        state.check_invariants(node.block());
    }
    trace!(
        "{}: {} released by stack {} ({} readers)",
        node.block(),
        owner.mode,
        stack.id(),
        state.reader_count()
    );
    if !state.is_write_locked() {
        state.wake_all_requestors();
    }
}

pub(crate) fn duplicate(handle: &LockHandle) -> LockHandle {
    let stack = &handle.stack;
    let node = handle.node();
    let id = stack.next_handle_id();
    {
        let mut state = node.lock.state.lock();
        assert!(
            state.owners.contains_key(&handle.id()),
            "duplicating a released handle {:?}",
            handle.id()
        );
        state.grant(stack, id, handle.mode());
        if stack.debug_checks() {
            state.check_invariants(node.block());
        }
    }
    stack.locks.lock().insert(
        id,
        HeldLock {
            node: node.clone(),
            mode: handle.mode(),
        },
    );
    LockHandle::new(id, node.clone(), stack.clone(), handle.mode())
}

/// Turn the node lock into a tombstone. The caller must hold the only write
/// lock. Every queued request fails with `Dying`; returns once they all
/// have left the queue.
pub(crate) fn invalidate_lock(mut handle: LockHandle) {
    let stack = handle.stack.clone();
    let node = handle.node().clone();
    let id = handle.id();
    stack.locks.lock().remove(&id);
    handle.mark_released();

    let mut state = node.lock.state.lock();
    assert!(
        state.holders
            == Holders::Writer {
                stack: stack.id(),
                depth: 1
            },
        "{}: invalidated without an exclusive write lock",
        node.block()
    );
    state.revoke(id);
    state.dying = true;
    state.wake_all_requestors();
    debug!("{}: lock invalidated", node.block());

    while state.has_requestors() {
        // Leaving requestors wake everyone still queued, including us.
        stack.arm_wakeup();
        state.enqueue(stack.clone(), false);
        MutexGuard::unlocked(&mut state, || stack.go_to_sleep());
        state.remove_requestor(stack.id());
    }
}

/// Take a crab hold: refused while the node is write-locked, dying or
/// captured by a transaction.
pub(crate) fn crab_hold(node: &Znode) -> bool {
    let mut state = node.lock.state.lock();
    if state.dying || state.is_write_locked() || node.is_captured() {
        return false;
    }
    state.crab_holds += 1;
    true
}

pub(crate) fn crab_release(node: &Znode) {
    let mut state = node.lock.state.lock();
    assert!(state.crab_holds > 0, "{}: crab hold underflow", node.block());
    state.crab_holds -= 1;
    if state.crab_holds == 0 && !state.is_write_locked() {
        state.wake_all_requestors();
    }
}
