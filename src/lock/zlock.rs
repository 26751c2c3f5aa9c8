use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use super::stack::StackShared;
use super::{HandleId, LockMode, StackId};
use crate::error::{ZTreeError, ZTreeResult};
use crate::znode::BlockNr;

/// Who currently holds the node. A writer may re-enter its own lock, which
/// raises `depth` instead of adding a second writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Holders {
    Unlocked,
    Readers(u32),
    Writer { stack: StackId, depth: u32 },
}

#[derive(Debug)]
pub(crate) struct Owner {
    pub(crate) stack: Arc<StackShared>,
    pub(crate) mode: LockMode,
    pub(crate) hipri: bool,
    pub(crate) signaled: bool,
}

#[derive(Debug)]
pub(crate) struct ZLockState {
    pub(crate) holders: Holders,
    pub(crate) crab_holds: u32,
    pub(crate) hipri_owners: u32,
    pub(crate) hipri_requests: u32,
    pub(crate) owners: BTreeMap<HandleId, Owner>,
    hipri_requestors: VecDeque<Arc<StackShared>>,
    lopri_requestors: VecDeque<Arc<StackShared>>,
    pub(crate) dying: bool,
}

impl ZLockState {
    fn new() -> Self {
        Self {
            holders: Holders::Unlocked,
            crab_holds: 0,
            hipri_owners: 0,
            hipri_requests: 0,
            owners: BTreeMap::new(),
            hipri_requestors: VecDeque::new(),
            lopri_requestors: VecDeque::new(),
            dying: false,
        }
    }

    /// Positive: number of readers. Negative: write recursion depth.
    pub(crate) fn reader_count(&self) -> i32 {
        match self.holders {
            Holders::Unlocked => 0,
            Holders::Readers(n) => n as i32,
            Holders::Writer { depth, .. } => -(depth as i32),
        }
    }

    pub(crate) fn is_write_locked(&self) -> bool {
        matches!(self.holders, Holders::Writer { .. })
    }

    pub(crate) fn is_write_owner(&self, stack: StackId) -> bool {
        matches!(self.holders, Holders::Writer { stack: s, .. } if s == stack)
    }

    pub(crate) fn owned_by(&self, stack: StackId) -> bool {
        self.owners
            .range(HandleId::first_of(stack)..=HandleId::last_of(stack))
            .next()
            .is_some()
    }

    /// A high priority request is waiting and no high priority stack holds
    /// the node: low priority owners have to yield.
    pub(crate) fn deadlock_condition(&self) -> bool {
        self.hipri_requests > 0 && self.hipri_owners == 0
    }

    fn compatible(&self, mode: LockMode) -> bool {
        match (self.holders, mode) {
            (Holders::Writer { .. }, _) => false,
            (_, LockMode::Read) => true,
            (Holders::Unlocked, LockMode::Write) => self.crab_holds == 0,
            (Holders::Readers(_), LockMode::Write) => false,
        }
    }

    /// `Dying` if the lock was invalidated, `WouldBlock` if the request has
    /// to wait.
    pub(crate) fn can_lock(&self, stack: &StackShared, mode: LockMode) -> ZTreeResult<()> {
        if self.dying {
            return Err(ZTreeError::Dying);
        }
        if !stack.is_hipri() && self.deadlock_condition() {
            return Err(ZTreeError::WouldBlock);
        }
        if !self.compatible(mode) {
            return Err(ZTreeError::WouldBlock);
        }
        Ok(())
    }

    pub(crate) fn grant(&mut self, stack: &Arc<StackShared>, id: HandleId, mode: LockMode) {
        self.holders = match (self.holders, mode) {
            (Holders::Writer { stack: s, depth }, _) if s == id.stack => Holders::Writer {
                stack: s,
                depth: depth + 1,
            },
            (Holders::Unlocked, LockMode::Read) => Holders::Readers(1),
            (Holders::Readers(n), LockMode::Read) => Holders::Readers(n + 1),
            (Holders::Unlocked, LockMode::Write) => Holders::Writer {
                stack: id.stack,
                depth: 1,
            },
            (holders, mode) => panic!("granting {:?} over {:?}", mode, holders),
        };
        let hipri = stack.is_hipri();
        if hipri {
            self.hipri_owners += 1;
        }
        let previous = self.owners.insert(
            id,
            Owner {
                stack: stack.clone(),
                mode,
                hipri,
                signaled: false,
            },
        );
        assert!(previous.is_none(), "handle {:?} granted twice", id);
    }

    pub(crate) fn revoke(&mut self, id: HandleId) -> Owner {
        let Some(owner) = self.owners.remove(&id) else {
            panic!("handle {:?} does not own the lock", id);
        };
        if owner.hipri {
            assert!(self.hipri_owners > 0, "hipri owner count underflow");
            self.hipri_owners -= 1;
        }
        if owner.signaled {
            owner.stack.unsignal();
        }
        self.holders = match self.holders {
            Holders::Readers(1) => Holders::Unlocked,
            Holders::Readers(n) => Holders::Readers(n - 1),
            Holders::Writer { depth: 1, .. } => Holders::Unlocked,
            Holders::Writer { stack, depth } => Holders::Writer {
                stack,
                depth: depth - 1,
            },
            Holders::Unlocked => panic!("releasing {:?} of an unlocked node", id),
        };
        owner
    }

    /// Mark every low priority owner and wake it so it notices.
    pub(crate) fn signal_lopri_owners(&mut self, block: BlockNr) {
        for (id, owner) in self.owners.iter_mut() {
            if !owner.hipri && !owner.signaled {
                owner.signaled = true;
                owner.stack.signal();
                trace!("{}: signaled {:?}", block, id);
            }
        }
    }

    pub(crate) fn enqueue(&mut self, stack: Arc<StackShared>, hipri: bool) {
        if hipri {
            self.hipri_requestors.push_back(stack);
        } else {
            self.lopri_requestors.push_back(stack);
        }
    }

    pub(crate) fn remove_requestor(&mut self, stack: StackId) {
        for queue in [&mut self.hipri_requestors, &mut self.lopri_requestors] {
            if let Some(pos) = queue.iter().position(|s| s.id() == stack) {
                queue.remove(pos);
                return;
            }
        }
    }

    pub(crate) fn has_requestors(&self) -> bool {
        !self.hipri_requestors.is_empty() || !self.lopri_requestors.is_empty()
    }

    /// High priority band first, FIFO inside each band.
    pub(crate) fn wake_all_requestors(&self) {
        for stack in self
            .hipri_requestors
            .iter()
            .chain(self.lopri_requestors.iter())
        {
            stack.wake_up();
        }
    }

    pub(crate) fn check_invariants(&self, block: BlockNr) {
        let hipri = self.owners.values().filter(|o| o.hipri).count() as u32;
        assert_eq!(hipri, self.hipri_owners, "{}: hipri owner count", block);
        match self.holders {
            Holders::Unlocked => assert!(self.owners.is_empty(), "{}: owners of unlocked node", block),
            Holders::Readers(n) => {
                assert_eq!(self.owners.len(), n as usize, "{}: reader count", block);
                assert!(
                    self.owners.values().all(|o| o.mode == LockMode::Read),
                    "{}: writer among readers",
                    block
                );
            }
            Holders::Writer { stack, depth } => {
                assert_eq!(self.owners.len(), depth as usize, "{}: write depth", block);
                assert!(
                    self.owners.keys().all(|id| id.stack == stack),
                    "{}: second owner of a write lock",
                    block
                );
            }
        }
    }
}

/// Long-term reader/writer lock embedded in every node.
#[derive(Debug)]
pub struct ZLock {
    pub(crate) state: Mutex<ZLockState>,
}

impl ZLock {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ZLockState::new()),
        }
    }

    pub fn reader_count(&self) -> i32 {
        self.state.lock().reader_count()
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().holders != Holders::Unlocked
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.lock().is_write_locked()
    }

    pub fn is_dying(&self) -> bool {
        self.state.lock().dying
    }

    pub fn owners(&self) -> Vec<HandleId> {
        self.state.lock().owners.keys().copied().collect()
    }

    pub fn hipri_owners(&self) -> u32 {
        self.state.lock().hipri_owners
    }

    pub fn hipri_requests(&self) -> u32 {
        self.state.lock().hipri_requests
    }

    pub fn crab_holds(&self) -> u32 {
        self.state.lock().crab_holds
    }

    pub fn has_waiters(&self) -> bool {
        self.state.lock().has_requestors()
    }

    pub(crate) fn is_write_owner(&self, stack: StackId) -> bool {
        self.state.lock().is_write_owner(stack)
    }
}
