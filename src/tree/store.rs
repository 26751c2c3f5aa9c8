use std::fmt::Debug;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{ZTreeError, ZTreeResult};
use crate::znode::{BlockNr, NodeLayout};

/// Source of node contents. The tree calls `load` on the first pin of an
/// unloaded node and `store` when a write-locked node gets new content.
pub trait NodeStore: Send + Sync + Debug {
    fn load(&self, block: BlockNr) -> ZTreeResult<Arc<dyn NodeLayout>>;

    fn store(&self, block: BlockNr, layout: Arc<dyn NodeLayout>) -> ZTreeResult<()>;
}

#[derive(Debug, Default)]
pub struct MemStore {
    nodes: DashMap<BlockNr, Arc<dyn NodeLayout>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, block: BlockNr, layout: impl NodeLayout + 'static) {
        self.nodes.insert(block, Arc::new(layout));
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl NodeStore for MemStore {
    fn load(&self, block: BlockNr) -> ZTreeResult<Arc<dyn NodeLayout>> {
        self.nodes
            .get(&block)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ZTreeError::Storage(format!("block {} not found", block)))
    }

    fn store(&self, block: BlockNr, layout: Arc<dyn NodeLayout>) -> ZTreeResult<()> {
        self.nodes.insert(block, layout);
        Ok(())
    }
}
