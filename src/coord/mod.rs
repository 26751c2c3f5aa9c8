//! Positions inside a node.
//!
//! A [`Coordinate`] names an item, a unit inside that item and where exactly
//! the position falls relative to that unit. Navigation never leaves the
//! node; crossing into a sibling is the business of [`crate::tap::Tap`].
//! All navigation helpers take the node's loaded [`NodeLayout`]; passing the
//! layout of a different node is a caller bug.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use strum::Display;

use crate::znode::{NodeLayout, Znode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
pub enum Betweenness {
    #[default]
    BeforeUnit,
    AtUnit,
    AfterUnit,
    BeforeItem,
    AfterItem,
    Invalid,
    EmptyNode,
}

/// Where a coordinate sits with respect to the units of its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordWrt {
    Left,
    Inside,
    Right,
}

#[derive(Clone, Default)]
pub struct Coordinate {
    pub node: Option<Arc<Znode>>,
    pub item_pos: usize,
    pub unit_pos: usize,
    pub between: Betweenness,
}

#[derive(Debug, PartialEq, Eq)]
enum Place {
    Unit(usize, usize),
    Gap(usize, usize),
    Empty,
    Invalid,
}

impl Coordinate {
    pub fn at(
        node: Option<Arc<Znode>>,
        item_pos: usize,
        unit_pos: usize,
        between: Betweenness,
    ) -> Self {
        Self {
            node,
            item_pos,
            unit_pos,
            between,
        }
    }

    pub fn invalid(node: Option<Arc<Znode>>) -> Self {
        Self::at(node, usize::MAX, 0, Betweenness::Invalid)
    }

    fn empty(node: Option<Arc<Znode>>) -> Self {
        Self::at(node, 0, 0, Betweenness::EmptyNode)
    }

    pub fn first_unit(node: Option<Arc<Znode>>, layout: &dyn NodeLayout) -> Self {
        if layout.is_empty() {
            return Self::empty(node);
        }
        Self::at(node, 0, 0, Betweenness::AtUnit)
    }

    pub fn last_unit(node: Option<Arc<Znode>>, layout: &dyn NodeLayout) -> Self {
        if layout.is_empty() {
            return Self::empty(node);
        }
        let item_pos = layout.num_items() - 1;
        let unit_pos = layout.num_units(item_pos) - 1;
        Self::at(node, item_pos, unit_pos, Betweenness::AtUnit)
    }

    pub fn before_first_item(node: Option<Arc<Znode>>, layout: &dyn NodeLayout) -> Self {
        if layout.is_empty() {
            return Self::empty(node);
        }
        Self::at(node, 0, 0, Betweenness::BeforeUnit)
    }

    pub fn after_last_item(node: Option<Arc<Znode>>, layout: &dyn NodeLayout) -> Self {
        let mut coord = Self::last_unit(node, layout);
        if !coord.is_empty() {
            coord.between = Betweenness::AfterUnit;
        }
        coord
    }

    pub fn node(&self) -> Option<&Arc<Znode>> {
        self.node.as_ref()
    }

    pub fn is_on(&self, node: &Arc<Znode>) -> bool {
        self.node.as_ref().is_some_and(|n| Arc::ptr_eq(n, node))
    }

    pub fn is_invalid(&self) -> bool {
        self.between == Betweenness::Invalid
    }

    pub fn is_empty(&self) -> bool {
        self.between == Betweenness::EmptyNode
    }

    /// Positioned at, before or after some unit of an existing item.
    pub fn is_existing_item(&self, layout: &dyn NodeLayout) -> bool {
        match self.between {
            Betweenness::BeforeUnit | Betweenness::AtUnit | Betweenness::AfterUnit => {
                self.item_pos < layout.num_items()
            }
            _ => false,
        }
    }

    pub fn is_existing_unit(&self, layout: &dyn NodeLayout) -> bool {
        self.between == Betweenness::AtUnit
            && self.item_pos < layout.num_items()
            && self.unit_pos < layout.num_units(self.item_pos)
    }

    pub fn is_leftmost_unit(&self) -> bool {
        self.between == Betweenness::AtUnit && self.item_pos == 0 && self.unit_pos == 0
    }

    pub fn is_rightmost_unit(&self, layout: &dyn NodeLayout) -> bool {
        self.is_existing_unit(layout)
            && self.item_pos + 1 == layout.num_items()
            && self.unit_pos + 1 == layout.num_units(self.item_pos)
    }

    /// True when the position falls in a gap between two items (or before
    /// the first one, or after the last one).
    pub fn is_between_items(&self, layout: &dyn NodeLayout) -> bool {
        if self.item_pos >= layout.num_items() {
            return true;
        }
        match self.between {
            Betweenness::BeforeItem | Betweenness::AfterItem => true,
            Betweenness::Invalid | Betweenness::EmptyNode => true,
            _ => {
                let last = layout.num_units(self.item_pos) - 1;
                if self.unit_pos > last {
                    return true;
                }
                (self.unit_pos == 0 && self.between == Betweenness::BeforeUnit)
                    || (self.unit_pos == last && self.between == Betweenness::AfterUnit)
            }
        }
    }

    pub fn is_before_leftmost(&self, layout: &dyn NodeLayout) -> bool {
        self.wrt(layout) == CoordWrt::Left
    }

    pub fn is_after_rightmost(&self, layout: &dyn NodeLayout) -> bool {
        self.wrt(layout) == CoordWrt::Right
    }

    fn left_item_pos(&self, layout: &dyn NodeLayout) -> Option<usize> {
        let after = matches!(
            self.between,
            Betweenness::AfterUnit | Betweenness::AfterItem
        );
        let items = layout.num_items();
        if self.item_pos == 0 && !after {
            return None;
        }
        if self.item_pos >= items {
            return items.checked_sub(1);
        }
        if after {
            Some(self.item_pos)
        } else {
            Some(self.item_pos - 1)
        }
    }

    fn right_item_pos(&self, layout: &dyn NodeLayout) -> usize {
        if self.item_pos >= layout.num_items() {
            return self.item_pos;
        }
        match self.between {
            Betweenness::BeforeItem | Betweenness::BeforeUnit => self.item_pos,
            _ => self.item_pos + 1,
        }
    }

    /// Step to the next unit, rolling over into the next item. Returns
    /// `false` without moving when already at the last unit of the node.
    pub fn next_unit(&mut self, layout: &dyn NodeLayout) -> bool {
        assert!(
            self.is_existing_unit(layout),
            "next_unit on a coordinate not set to a unit: {:?}",
            self
        );
        if self.is_rightmost_unit(layout) {
            return false;
        }
        self.unit_pos += 1;
        if self.unit_pos >= layout.num_units(self.item_pos) {
            self.item_pos += 1;
            self.unit_pos = 0;
        }
        true
    }

    /// Step to the previous unit. Returns `false` without moving at the
    /// first unit of the node.
    pub fn prev_unit(&mut self, layout: &dyn NodeLayout) -> bool {
        assert!(
            self.is_existing_unit(layout),
            "prev_unit on a coordinate not set to a unit: {:?}",
            self
        );
        if self.item_pos == 0 && self.unit_pos == 0 {
            return false;
        }
        if self.unit_pos > 0 {
            self.unit_pos -= 1;
        } else {
            self.item_pos -= 1;
            self.unit_pos = layout.num_units(self.item_pos) - 1;
        }
        true
    }

    /// Move to the first unit of the next item, if there is one.
    pub fn next_item(&mut self, layout: &dyn NodeLayout) -> bool {
        assert!(self.is_existing_unit(layout), "next_item off unit: {:?}", self);
        if self.item_pos + 1 >= layout.num_items() {
            return false;
        }
        self.item_pos += 1;
        self.unit_pos = 0;
        self.between = Betweenness::AtUnit;
        true
    }

    /// Move to the first unit of the previous item, if there is one.
    pub fn prev_item(&mut self, layout: &dyn NodeLayout) -> bool {
        assert!(self.is_existing_unit(layout), "prev_item off unit: {:?}", self);
        if self.item_pos == 0 {
            return false;
        }
        self.item_pos -= 1;
        self.unit_pos = 0;
        self.between = Betweenness::AtUnit;
        true
    }

    /// Snap to the nearest existing unit on the left. Returns `false` if
    /// there is none, leaving the coordinate untouched.
    pub fn set_to_left(&mut self, layout: &dyn NodeLayout) -> bool {
        if self.is_between_items(layout) {
            let Some(item_pos) = self.left_item_pos(layout) else {
                return false;
            };
            self.item_pos = item_pos;
            self.unit_pos = layout.num_units(item_pos) - 1;
        } else if self.between == Betweenness::BeforeUnit {
            assert!(self.unit_pos > 0);
            self.unit_pos -= 1;
        }
        self.between = Betweenness::AtUnit;
        true
    }

    /// Snap to the nearest existing unit on the right. Returns `false` if
    /// there is none, leaving the coordinate untouched.
    pub fn set_to_right(&mut self, layout: &dyn NodeLayout) -> bool {
        if layout.is_empty() {
            return false;
        }
        if self.is_between_items(layout) {
            let item_pos = self.right_item_pos(layout);
            if item_pos >= layout.num_items() {
                return false;
            }
            self.item_pos = item_pos;
            self.unit_pos = 0;
        } else if self.between == Betweenness::AfterUnit {
            self.unit_pos += 1;
        }
        self.between = Betweenness::AtUnit;
        true
    }

    pub fn wrt(&self, layout: &dyn NodeLayout) -> CoordWrt {
        if self.is_between_items(layout) {
            if layout.is_empty() {
                return CoordWrt::Right;
            }
            if self.left_item_pos(layout).is_none() {
                return CoordWrt::Left;
            }
            if self.right_item_pos(layout) >= layout.num_items() {
                return CoordWrt::Right;
            }
        }
        CoordWrt::Inside
    }

    /// Order of two unit coordinates of the same node.
    pub fn compare(&self, other: &Coordinate) -> Ordering {
        assert!(self.same_node(other), "comparing coordinates of different nodes");
        assert!(
            self.between == Betweenness::AtUnit && other.between == Betweenness::AtUnit,
            "comparing coordinates not set to units"
        );
        (self.item_pos, self.unit_pos).cmp(&(other.item_pos, other.unit_pos))
    }

    /// True if the two unit coordinates are adjacent units of one node.
    pub fn are_neighbors(&self, other: &Coordinate, layout: &dyn NodeLayout) -> bool {
        let (left, right) = match self.compare(other) {
            Ordering::Less => (self, other),
            Ordering::Greater => (other, self),
            Ordering::Equal => return false,
        };
        if left.item_pos == right.item_pos {
            left.unit_pos + 1 == right.unit_pos
        } else {
            left.item_pos + 1 == right.item_pos
                && left.unit_pos + 1 == layout.num_units(left.item_pos)
                && right.unit_pos == 0
        }
    }

    /// True when both coordinates denote the same place, treating "after
    /// unit k" and "before unit k + 1" (and the item-level gaps) as equal.
    pub fn eq_position(&self, other: &Coordinate, layout: &dyn NodeLayout) -> bool {
        if !self.same_node(other) {
            return false;
        }
        match (self.place(layout), other.place(layout)) {
            (Place::Invalid, _) | (_, Place::Invalid) => false,
            (a, b) => a == b,
        }
    }

    fn place(&self, layout: &dyn NodeLayout) -> Place {
        let gap = |item_pos: usize, unit_pos: usize| {
            if item_pos < layout.num_items() && unit_pos >= layout.num_units(item_pos) {
                Place::Gap(item_pos + 1, 0)
            } else {
                Place::Gap(item_pos, unit_pos)
            }
        };
        match self.between {
            Betweenness::Invalid => Place::Invalid,
            Betweenness::EmptyNode => Place::Empty,
            Betweenness::AtUnit => Place::Unit(self.item_pos, self.unit_pos),
            Betweenness::BeforeUnit => gap(self.item_pos, self.unit_pos),
            Betweenness::BeforeItem => gap(self.item_pos, 0),
            Betweenness::AfterUnit => gap(self.item_pos, self.unit_pos + 1),
            Betweenness::AfterItem => gap(self.item_pos + 1, 0),
        }
    }

    pub fn same_node(&self, other: &Coordinate) -> bool {
        match (&self.node, &other.node) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl PartialEq for Coordinate {
    fn eq(&self, other: &Self) -> bool {
        self.same_node(other)
            && self.item_pos == other.item_pos
            && self.unit_pos == other.unit_pos
            && self.between == other.between
    }
}

impl Eq for Coordinate {}

impl fmt::Debug for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Coordinate");
        match &self.node {
            Some(node) => s.field("node", &node.block()),
            None => s.field("node", &Option::<()>::None),
        };
        s.field("item_pos", &self.item_pos)
            .field("unit_pos", &self.unit_pos)
            .field("between", &self.between)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{Key, KeyType};
    use crate::znode::{MemItem, MemNode};

    fn layout() -> MemNode {
        let k = |o| Key::new(1, KeyType::Body, 1, o);
        MemNode::new(vec![
            MemItem::new(vec![k(0), k(1), k(2)]),
            MemItem::new(vec![k(10)]),
            MemItem::new(vec![k(20), k(21)]),
        ])
    }

    #[test]
    fn zeroed_coordinate_is_before_unit() {
        let coord = Coordinate::default();
        assert_eq!(coord.between, Betweenness::BeforeUnit);
        assert_eq!((coord.item_pos, coord.unit_pos), (0, 0));
    }

    #[test]
    fn empty_node_initializers() {
        let empty = MemNode::empty();
        for coord in [
            Coordinate::first_unit(None, &empty),
            Coordinate::last_unit(None, &empty),
            Coordinate::before_first_item(None, &empty),
            Coordinate::after_last_item(None, &empty),
        ] {
            assert!(coord.is_empty());
            assert_eq!((coord.item_pos, coord.unit_pos), (0, 0));
            assert_eq!(coord.wrt(&empty), CoordWrt::Right);
        }
    }

    #[test]
    fn unit_walk_visits_every_unit_once() {
        let l = layout();
        let mut coord = Coordinate::first_unit(None, &l);
        let mut seen = vec![(coord.item_pos, coord.unit_pos)];
        while coord.next_unit(&l) {
            seen.push((coord.item_pos, coord.unit_pos));
        }
        assert_eq!(seen, vec![(0, 0), (0, 1), (0, 2), (1, 0), (2, 0), (2, 1)]);
        assert!(coord.is_rightmost_unit(&l));
        assert_eq!(coord, Coordinate::last_unit(None, &l));

        let mut back = 0;
        while coord.prev_unit(&l) {
            back += 1;
        }
        assert_eq!(back, 5);
        assert!(coord.is_leftmost_unit());
    }

    #[test]
    fn item_steps() {
        let l = layout();
        let mut coord = Coordinate::at(None, 0, 2, Betweenness::AtUnit);
        assert!(coord.next_item(&l));
        assert_eq!((coord.item_pos, coord.unit_pos), (1, 0));
        assert!(coord.next_item(&l));
        assert!(!coord.next_item(&l));
        assert!(coord.prev_item(&l));
        assert_eq!(coord.item_pos, 1);
    }

    #[test]
    fn gaps_snap_to_neighbouring_units() {
        let l = layout();
        let mut before = Coordinate::before_first_item(None, &l);
        assert!(before.is_between_items(&l));
        assert_eq!(before.wrt(&l), CoordWrt::Left);
        assert!(!before.clone().set_to_left(&l));
        assert!(before.set_to_right(&l));
        assert!(before.is_leftmost_unit());

        let mut after = Coordinate::after_last_item(None, &l);
        assert!(after.is_after_rightmost(&l));
        assert!(!after.clone().set_to_right(&l));
        assert!(after.set_to_left(&l));
        assert!(after.is_rightmost_unit(&l));

        let mut mid = Coordinate::at(None, 0, 1, Betweenness::AfterUnit);
        assert!(!mid.is_between_items(&l));
        assert_eq!(mid.wrt(&l), CoordWrt::Inside);
        assert!(mid.set_to_right(&l));
        assert_eq!((mid.item_pos, mid.unit_pos), (0, 2));
    }

    #[test]
    fn boundary_equivalent_positions_compare_equal() {
        let l = layout();
        let after_unit = Coordinate::at(None, 0, 0, Betweenness::AfterUnit);
        let before_next = Coordinate::at(None, 0, 1, Betweenness::BeforeUnit);
        assert!(after_unit.eq_position(&before_next, &l));
        assert!(before_next.eq_position(&after_unit, &l));

        let after_item = Coordinate::at(None, 0, 2, Betweenness::AfterItem);
        let before_item = Coordinate::at(None, 1, 0, Betweenness::BeforeItem);
        let after_last_unit = Coordinate::at(None, 0, 2, Betweenness::AfterUnit);
        assert!(after_item.eq_position(&before_item, &l));
        assert!(after_last_unit.eq_position(&before_item, &l));

        let at = Coordinate::at(None, 0, 1, Betweenness::AtUnit);
        assert!(!at.eq_position(&before_next, &l));
        assert!(!Coordinate::invalid(None).eq_position(&Coordinate::invalid(None), &l));
    }

    #[test]
    fn neighbours_across_items() {
        let l = layout();
        let a = Coordinate::at(None, 0, 2, Betweenness::AtUnit);
        let b = Coordinate::at(None, 1, 0, Betweenness::AtUnit);
        let c = Coordinate::at(None, 2, 1, Betweenness::AtUnit);
        assert_eq!(a.compare(&b), Ordering::Less);
        assert!(a.are_neighbors(&b, &l));
        assert!(b.are_neighbors(&a, &l));
        assert!(!a.are_neighbors(&c, &l));
        assert!(!a.are_neighbors(&a, &l));
    }
}
