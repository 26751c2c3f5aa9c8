use thiserror::Error;

pub type ZTreeResult<T, E = ZTreeError> = Result<T, E>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ZTreeError {
    /// A non-blocking lock request found the lock unavailable.
    #[error("Lock would block")]
    WouldBlock,

    /// The lock stack was signaled by a high priority request and has to
    /// release everything it holds and start over.
    #[error("Restart requested by deadlock avoidance")]
    Restart,

    /// An optimistic crab descent met contention and was abandoned.
    #[error("Crab lock contended, retry")]
    Retry,

    #[error("Seal is stale")]
    Stale,

    #[error("No neighbor")]
    NoNeighbor,

    /// The node lock was invalidated because the node left the tree.
    #[error("Node is dying")]
    Dying,

    #[error("Tap already finished")]
    TapDone,

    #[error("Node {0} is not loaded")]
    NotLoaded(u64),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
