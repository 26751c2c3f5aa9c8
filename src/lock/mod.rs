//! Long-term node locks.
//!
//! Every node embeds a [`ZLock`]. Locks are taken through a [`LockStack`],
//! which records what the calling operation holds and carries its current
//! [`Priority`]. Deadlocks are avoided rather than detected: a high
//! priority request that finds only low priority owners signals them, and a
//! signaled low priority stack gets [`crate::error::ZTreeError::Restart`] at
//! its next cancellation point, releases everything and starts over.

mod handle;
mod longterm;
mod registry;
mod stack;
mod zlock;

pub use handle::LockHandle;
pub use registry::{StackDebugSnapshot, StackRegistry};
pub use stack::{LockCounters, LockStack, StackWaker};
pub use zlock::ZLock;

pub(crate) use longterm::{crab_hold, crab_release, invalidate_lock};

use strum::Display;

use crate::znode::BlockNr;

pub type StackId = u64;

/// Owner link identity. Ordered by stack first so that the handles of one
/// stack form a contiguous range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId {
    pub stack: StackId,
    pub seq: u64,
}

impl HandleId {
    pub(crate) fn first_of(stack: StackId) -> Self {
        Self { stack, seq: 0 }
    }

    pub(crate) fn last_of(stack: StackId) -> Self {
        Self {
            stack,
            seq: u64::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum LockMode {
    Read,
    Write,
}

/// Two bands. Balancing that climbs to parents and moves right runs high;
/// top-down searches and leftward moves run low and yield to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Display)]
pub enum Priority {
    Low,
    #[default]
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRequest {
    pub priority: Priority,
    pub non_blocking: bool,
}

impl LockRequest {
    pub const LOW: LockRequest = LockRequest {
        priority: Priority::Low,
        non_blocking: false,
    };
    pub const HIGH: LockRequest = LockRequest {
        priority: Priority::High,
        non_blocking: false,
    };

    pub fn new(priority: Priority) -> Self {
        Self {
            priority,
            non_blocking: false,
        }
    }

    /// Fail with `WouldBlock` instead of waiting.
    pub fn non_blocking(mut self) -> Self {
        self.non_blocking = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub block: BlockNr,
    pub mode: LockMode,
    pub priority: Priority,
}
