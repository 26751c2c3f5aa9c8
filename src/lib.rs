pub mod config;
pub mod coord;
pub mod crab;
pub mod error;
pub mod key;
pub mod lock;
pub mod seal;
pub mod tap;
pub mod tree;
pub mod znode;

pub use config::{LockConfig, TreeConfig};
pub use coord::{Betweenness, Coordinate};
pub use crab::CrabLock;
pub use error::{ZTreeError, ZTreeResult};
pub use key::{Key, KeyType};
pub use lock::{LockHandle, LockMode, LockRequest, LockStack, Priority};
pub use seal::{Seal, SealedCoord};
pub use tap::{Direction, Granularity, Tap};
pub use tree::{MemStore, NodeStore, Side, Tree};
pub use znode::{BlockNr, MemNode, NodeLayout, Znode};
