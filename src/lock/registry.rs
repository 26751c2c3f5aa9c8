use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use super::stack::StackShared;
use super::{LockMode, PendingRequest, Priority, StackId};
use crate::znode::BlockNr;

/// Live lock stacks, for diagnosing stuck operations. Stacks register on
/// creation and deregister when dropped.
#[derive(Debug, Default)]
pub struct StackRegistry {
    stacks: DashMap<StackId, Weak<StackShared>>,
    next_id: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackDebugSnapshot {
    pub id: StackId,
    pub priority: Priority,
    pub signaled: usize,
    pub held: Vec<(BlockNr, LockMode)>,
    pub pending: Option<PendingRequest>,
}

impl StackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, debug_checks: bool) -> Arc<StackShared> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let shared = Arc::new(StackShared::new(id, debug_checks));
        self.stacks.insert(id, Arc::downgrade(&shared));
        shared
    }

    pub(crate) fn deregister(&self, id: StackId) {
        self.stacks.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    pub fn snapshot(&self) -> Vec<StackDebugSnapshot> {
        let live: Vec<Arc<StackShared>> = self
            .stacks
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        let mut snapshot: Vec<StackDebugSnapshot> = live
            .into_iter()
            .map(|stack| StackDebugSnapshot {
                id: stack.id(),
                priority: if stack.is_hipri() {
                    Priority::High
                } else {
                    Priority::Low
                },
                signaled: stack.nr_signaled(),
                held: stack
                    .held_locks()
                    .into_iter()
                    .map(|(_, held)| (held.node.block(), held.mode))
                    .collect(),
                pending: stack.pending(),
            })
            .collect();
        snapshot.sort_by_key(|s| s.id);
        snapshot
    }
}
