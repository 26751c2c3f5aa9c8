use std::sync::Arc;

use ztree::coord::Coordinate;
use ztree::key::{Key, KeyType};
use ztree::lock::{LockMode, LockRequest, LockStack};
use ztree::tap::{Direction, Granularity, Tap};
use ztree::znode::{BlockNr, MemItem, MemNode, NodeLayout, Znode, LEAF_LEVEL};
use ztree::{MemStore, Tree, TreeConfig, ZTreeError};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn key(off: u64) -> Key {
    Key::new(7, KeyType::Body, 42, off)
}

/// Leaves 10..=13 linked left to right holding offsets [0, 1], [2], [],
/// [3, 4].
fn leaves() -> (Tree, Vec<Arc<Znode>>) {
    let store = MemStore::new();
    store.insert(BlockNr(10), MemNode::from_keys([key(0), key(1)]));
    store.insert(BlockNr(11), MemNode::from_keys([key(2)]));
    store.insert(BlockNr(12), MemNode::empty());
    store.insert(BlockNr(13), MemNode::from_keys([key(3), key(4)]));
    let tree = Tree::new(Arc::new(store), TreeConfig::default());
    let nodes: Vec<Arc<Znode>> = (10..14)
        .map(|b| tree.zget(BlockNr(b), LEAF_LEVEL))
        .collect();
    tree.link_left_and_right(None, Some(&nodes[0]));
    for pair in nodes.windows(2) {
        tree.link_left_and_right(Some(&pair[0]), Some(&pair[1]));
    }
    tree.link_left_and_right(nodes.last(), None);
    (tree, nodes)
}

fn tap_at<'a>(
    tree: &'a Tree,
    stack: &'a LockStack,
    node: &Arc<Znode>,
    last: bool,
) -> Tap<'a> {
    let place: fn(Option<Arc<Znode>>, &dyn NodeLayout) -> Coordinate = if last {
        Coordinate::last_unit
    } else {
        Coordinate::first_unit
    };
    tap_placed(tree, stack, node, place)
}

fn tap_placed<'a>(
    tree: &'a Tree,
    stack: &'a LockStack,
    node: &Arc<Znode>,
    place: fn(Option<Arc<Znode>>, &dyn NodeLayout) -> Coordinate,
) -> Tap<'a> {
    let handle = stack
        .longterm_lock(node, LockMode::Read, LockRequest::LOW)
        .unwrap();
    let layout = tree.zload(node).unwrap();
    let coord = place(Some(node.clone()), &*layout);
    tree.zrelse(node);
    Tap::new(tree, stack, coord, handle, LockMode::Read)
}

/// Parents 20 and 21 over leaves 10, 11 and 12, 13 holding offsets [0, 1],
/// [2], [3], [4, 5]. The inner leaves are evicted, which breaks their links.
fn two_level_tree() -> (Tree, Vec<Arc<Znode>>, Vec<Arc<Znode>>) {
    let store = MemStore::new();
    store.insert(
        BlockNr(20),
        MemNode::internal([(key(0), BlockNr(10)), (key(2), BlockNr(11))]),
    );
    store.insert(
        BlockNr(21),
        MemNode::internal([(key(3), BlockNr(12)), (key(4), BlockNr(13))]),
    );
    store.insert(BlockNr(10), MemNode::from_keys([key(0), key(1)]));
    store.insert(BlockNr(11), MemNode::from_keys([key(2)]));
    store.insert(BlockNr(12), MemNode::from_keys([key(3)]));
    store.insert(BlockNr(13), MemNode::from_keys([key(4), key(5)]));
    let tree = Tree::new(Arc::new(store), TreeConfig::default());

    let parents: Vec<Arc<Znode>> = (20..22)
        .map(|b| tree.zget(BlockNr(b), LEAF_LEVEL + 1))
        .collect();
    tree.link_left_and_right(None, Some(&parents[0]));
    tree.link_left_and_right(Some(&parents[0]), Some(&parents[1]));
    tree.link_left_and_right(Some(&parents[1]), None);

    let mut leaves: Vec<Arc<Znode>> = (10..14)
        .map(|b| tree.zget(BlockNr(b), LEAF_LEVEL))
        .collect();
    tree.link_left_and_right(None, Some(&leaves[0]));
    for pair in leaves.windows(2) {
        tree.link_left_and_right(Some(&pair[0]), Some(&pair[1]));
    }
    tree.link_left_and_right(leaves.last(), None);
    for (i, leaf) in leaves.iter().enumerate() {
        tree.set_parent(leaf, &parents[i / 2], i % 2);
    }

    drop(leaves.drain(1..3));
    assert!(tree.evict(BlockNr(11)));
    assert!(tree.evict(BlockNr(12)));
    assert!(!leaves[0].is_right_connected());
    assert!(!leaves[1].is_left_connected());
    (tree, parents, leaves)
}

fn assert_bound(tap: &Tap<'_>) {
    let handle = tap.handle().unwrap();
    assert!(tap.coord().is_on(handle.node()));
}

fn offsets(tap: &mut Tap<'_>, dir: Direction) -> Vec<u64> {
    let mut seen = vec![tap.unit_key().unwrap().offset()];
    loop {
        match tap.step(dir, Granularity::Unit) {
            Ok(()) => {
                assert_bound(tap);
                seen.push(tap.unit_key().unwrap().offset());
            }
            Err(ZTreeError::NoNeighbor) => return seen,
            Err(e) => panic!("scan failed: {}", e),
        }
    }
}

#[test]
fn scan_crosses_nodes_and_skips_empty_ones() {
    init_logger();
    let (tree, nodes) = leaves();
    let stack = tree.new_lock_stack();
    let mut tap = tap_at(&tree, &stack, &nodes[0], false);
    tap.load().unwrap();

    assert_eq!(offsets(&mut tap, Direction::Next), vec![0, 1, 2, 3, 4]);
    // The failed step left the tap on the last unit of the last leaf.
    assert!(Arc::ptr_eq(tap.node().unwrap(), &nodes[3]));
    assert_eq!(tap.unit_key().unwrap(), key(4));
    assert_eq!(stack.held_count(), 1);
    assert_eq!(nodes[3].load_count(), 1);
    assert!(nodes[..3].iter().all(|n| n.load_count() == 0));

    assert_eq!(offsets(&mut tap, Direction::Prev), vec![4, 3, 2, 1, 0]);
    assert!(Arc::ptr_eq(tap.node().unwrap(), &nodes[0]));

    tap.release();
    assert_eq!(tap.load_count(), 0);
    assert!(nodes.iter().all(|n| n.load_count() == 0));
    tap.done().unwrap();
    assert!(stack.is_clean());
}

#[test]
fn rewind_moves_by_units() {
    init_logger();
    let (tree, nodes) = leaves();
    let stack = tree.new_lock_stack();
    let mut tap = tap_at(&tree, &stack, &nodes[3], true);
    tap.load().unwrap();

    tap.rewind_left(3).unwrap();
    assert_eq!(tap.unit_key().unwrap(), key(1));
    assert_bound(&tap);

    tap.rewind_right(2).unwrap();
    assert_eq!(tap.unit_key().unwrap(), key(3));

    assert_eq!(tap.rewind_left(10), Err(ZTreeError::NoNeighbor));
    assert_eq!(tap.unit_key().unwrap(), key(0));
    assert_eq!(tap.load_count(), 1);
    tap.release();
    drop(tap);
    assert!(stack.is_clean());
    assert!(nodes.iter().all(|n| n.load_count() == 0));
}

#[test]
fn deleted_neighbours_are_skipped() {
    init_logger();
    let (tree, nodes) = leaves();
    let stack = tree.new_lock_stack();
    let victim = stack
        .longterm_lock(&nodes[1], LockMode::Write, LockRequest::HIGH)
        .unwrap();
    tree.delete_node(victim);

    let mut tap = tap_at(&tree, &stack, &nodes[0], false);
    tap.load().unwrap();
    assert_eq!(offsets(&mut tap, Direction::Next), vec![0, 1, 3, 4]);
    tap.release();
}

#[test]
fn item_steps_skip_the_rest_of_an_item() {
    init_logger();
    let store = MemStore::new();
    store.insert(
        BlockNr(1),
        MemNode::new(vec![
            MemItem::new(vec![key(0), key(1), key(2)]),
            MemItem::new(vec![key(3)]),
        ]),
    );
    let tree = Tree::new(Arc::new(store), TreeConfig::default());
    let node = tree.zget(BlockNr(1), LEAF_LEVEL);
    let stack = tree.new_lock_stack();
    let mut tap = tap_at(&tree, &stack, &node, false);
    tap.load().unwrap();

    tap.step(Direction::Next, Granularity::Item).unwrap();
    assert_eq!(tap.unit_key().unwrap(), key(3));
    assert_eq!(
        tap.step(Direction::Next, Granularity::Item),
        Err(ZTreeError::NoNeighbor)
    );
    tap.prev_unit().unwrap();
    assert_eq!(tap.unit_key().unwrap(), key(2));
    assert_eq!((tap.coord().item_pos, tap.coord().unit_pos), (0, 2));
    tap.release();
}

#[test]
fn jumping_and_finishing() {
    init_logger();
    let (tree, nodes) = leaves();
    let stack = tree.new_lock_stack();
    let mut tap = tap_at(&tree, &stack, &nodes[0], false);

    tap.to_node(&nodes[3]).unwrap();
    assert_bound(&tap);
    assert_eq!(stack.held_count(), 1);
    assert_eq!(stack.holds(&nodes[3]), Some(LockMode::Read));

    let layout = tree.zload(&nodes[3]).unwrap();
    let target = Coordinate::last_unit(Some(nodes[3].clone()), &*layout);
    tree.zrelse(&nodes[3]);
    tap.load().unwrap();
    tap.to_coord(&target).unwrap();
    assert_eq!(tap.unit_key().unwrap(), key(4));

    tap.done().unwrap();
    assert!(tap.is_done());
    assert!(stack.is_clean());
    assert_eq!(nodes[3].load_count(), 0);
    assert_eq!(tap.done(), Err(ZTreeError::TapDone));
    assert_eq!(tap.next_unit(), Err(ZTreeError::TapDone));
}

#[test]
fn scan_renews_links_of_evicted_leaves() {
    init_logger();
    let (tree, parents, leaves) = two_level_tree();
    assert_eq!(tree.cached_count(), 4);
    let stack = tree.new_lock_stack();
    let mut tap = tap_at(&tree, &stack, &leaves[0], false);
    tap.load().unwrap();

    // 11 is found inside parent 20, 12 through the parent's right neighbour.
    assert_eq!(offsets(&mut tap, Direction::Next), vec![0, 1, 2, 3, 4, 5]);
    assert!(Arc::ptr_eq(tap.node().unwrap(), &leaves[1]));
    assert_eq!(tree.cached_count(), 6);
    let (parent, pos) = tree.zlook(BlockNr(12)).unwrap().parent().unwrap();
    assert!(Arc::ptr_eq(&parent, &parents[1]));
    assert_eq!(pos, 0);

    assert_eq!(offsets(&mut tap, Direction::Prev), vec![5, 4, 3, 2, 1, 0]);
    assert!(parents.iter().all(|p| p.load_count() == 0));
    assert_eq!(stack.held_count(), 1);
    tap.release();
    tap.done().unwrap();
    assert!(stack.is_clean());
}

#[test]
fn scan_back_across_evicted_leaves() {
    init_logger();
    let (tree, _parents, leaves) = two_level_tree();
    let stack = tree.new_lock_stack();
    let mut tap = tap_at(&tree, &stack, &leaves[1], true);
    tap.load().unwrap();
    assert_eq!(offsets(&mut tap, Direction::Prev), vec![5, 4, 3, 2, 1, 0]);
    assert!(Arc::ptr_eq(tap.node().unwrap(), &leaves[0]));
    tap.release();
}

#[test]
fn steps_from_between_units_land_on_the_adjacent_unit() {
    init_logger();
    let (tree, nodes) = leaves();
    let stack = tree.new_lock_stack();

    let mut tap = tap_placed(&tree, &stack, &nodes[3], Coordinate::before_first_item);
    tap.load().unwrap();
    tap.next_unit().unwrap();
    assert_eq!(tap.unit_key().unwrap(), key(3));
    tap.done().unwrap();

    let mut tap = tap_placed(&tree, &stack, &nodes[3], Coordinate::before_first_item);
    tap.load().unwrap();
    tap.prev_unit().unwrap();
    assert!(Arc::ptr_eq(tap.node().unwrap(), &nodes[1]));
    assert_eq!(tap.unit_key().unwrap(), key(2));
    tap.done().unwrap();

    let mut tap = tap_placed(&tree, &stack, &nodes[0], Coordinate::after_last_item);
    tap.load().unwrap();
    tap.prev_unit().unwrap();
    assert_eq!(tap.unit_key().unwrap(), key(1));
    tap.done().unwrap();

    let mut tap = tap_placed(&tree, &stack, &nodes[0], Coordinate::after_last_item);
    tap.load().unwrap();
    tap.step(Direction::Next, Granularity::Item).unwrap();
    assert!(Arc::ptr_eq(tap.node().unwrap(), &nodes[1]));
    assert_eq!(tap.unit_key().unwrap(), key(2));
    tap.done().unwrap();

    assert!(stack.is_clean());
    assert!(nodes.iter().all(|n| n.load_count() == 0));
}
