use std::fmt::Debug;

use super::BlockNr;
use crate::key::Key;

/// Read access to the items and units stored in a loaded node. Implemented
/// by whatever node format the store produces.
pub trait NodeLayout: Send + Sync + Debug {
    fn num_items(&self) -> usize;

    /// Number of units in item `item_pos`. Every item has at least one.
    fn num_units(&self, item_pos: usize) -> usize;

    fn unit_key(&self, item_pos: usize, unit_pos: usize) -> Key;

    fn item_key(&self, item_pos: usize) -> Key {
        self.unit_key(item_pos, 0)
    }

    fn is_empty(&self) -> bool {
        self.num_items() == 0
    }

    /// Position of the unit carrying exactly `key`.
    fn lookup(&self, key: &Key) -> Option<(usize, usize)> {
        for item_pos in 0..self.num_items() {
            for unit_pos in 0..self.num_units(item_pos) {
                if self.unit_key(item_pos, unit_pos) == *key {
                    return Some((item_pos, unit_pos));
                }
            }
        }
        None
    }

    /// Block the pointer item at `item_pos` refers to. Leaf formats carry
    /// no pointers.
    fn child(&self, _item_pos: usize) -> Option<BlockNr> {
        None
    }
}

#[derive(derive_new::new, Debug, Clone, PartialEq, Eq)]
pub struct MemItem {
    pub keys: Vec<Key>,
    #[new(default)]
    pub child: Option<BlockNr>,
}

/// Plain in-memory node content, one key per unit.
#[derive(derive_new::new, Debug, Clone, Default, PartialEq, Eq)]
pub struct MemNode {
    pub items: Vec<MemItem>,
}

impl MemNode {
    pub fn empty() -> Self {
        Self::default()
    }

    /// One single-unit item per key.
    pub fn from_keys(keys: impl IntoIterator<Item = Key>) -> Self {
        Self::new(keys.into_iter().map(|k| MemItem::new(vec![k])).collect())
    }

    /// Internal node content: one pointer item per child, keyed by the
    /// child's left delimiting key.
    pub fn internal(children: impl IntoIterator<Item = (Key, BlockNr)>) -> Self {
        Self::new(
            children
                .into_iter()
                .map(|(key, block)| MemItem {
                    keys: vec![key],
                    child: Some(block),
                })
                .collect(),
        )
    }
}

impl NodeLayout for MemNode {
    fn num_items(&self) -> usize {
        self.items.len()
    }

    fn num_units(&self, item_pos: usize) -> usize {
        self.items[item_pos].keys.len()
    }

    fn unit_key(&self, item_pos: usize, unit_pos: usize) -> Key {
        self.items[item_pos].keys[unit_pos]
    }

    fn lookup(&self, key: &Key) -> Option<(usize, usize)> {
        let item_pos = self
            .items
            .partition_point(|item| item.keys.first().is_some_and(|k| k <= key))
            .checked_sub(1)?;
        let unit_pos = self.items[item_pos].keys.binary_search(key).ok()?;
        Some((item_pos, unit_pos))
    }

    fn child(&self, item_pos: usize) -> Option<BlockNr> {
        self.items.get(item_pos).and_then(|item| item.child)
    }
}
