use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::Parser;
use comfy_table::Cell;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ztree::coord::Coordinate;
use ztree::key::{Key, KeyType};
use ztree::lock::{LockCounters, LockMode, LockRequest, LockStack};
use ztree::tap::Tap;
use ztree::znode::{BlockNr, MemNode, Znode, LEAF_LEVEL};
use ztree::{MemStore, Tree, TreeConfig, ZTreeError, ZTreeResult};

#[derive(Debug, Parser, PartialEq)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(short, long, default_value_t = 8, help = "Worker threads")]
    threads: usize,
    #[clap(short, long, default_value_t = 16, help = "Leaf nodes in the sibling chain")]
    nodes: u64,
    #[clap(short, long, default_value_t = 2000, help = "Operations per thread")]
    iterations: usize,
    #[clap(long, default_value_t = 0.3, help = "Share of high priority operations")]
    hipri_ratio: f64,
    #[clap(long, default_value_t = 0.4, help = "Share of write locks")]
    write_ratio: f64,
    #[clap(long, default_value_t = 0.1, help = "Share of operations that are tap scans")]
    scan_ratio: f64,
    #[clap(long, default_value_t = 3, help = "Most nodes one operation locks")]
    max_locks: usize,
    #[clap(long, default_value_t = 0, help = "Random seed")]
    seed: u64,
}

struct Workload<'a> {
    tree: &'a Tree,
    leaves: &'a [Arc<Znode>],
    args: &'a Args,
}

impl Workload<'_> {
    /// High priority operations lock in ascending block order, low priority
    /// ones in descending order.
    fn lock_many(&self, stack: &LockStack, rng: &mut StdRng) -> ZTreeResult<()> {
        let hipri = rng.random_bool(self.args.hipri_ratio);
        let count = rng.random_range(1..=self.args.max_locks.max(1));
        let mut picked: Vec<usize> = (0..count)
            .map(|_| rng.random_range(0..self.leaves.len()))
            .collect();
        picked.sort_unstable();
        picked.dedup();
        if !hipri {
            picked.reverse();
        }
        let plan: Vec<(usize, LockMode)> = picked
            .into_iter()
            .map(|i| {
                let mode = if rng.random_bool(self.args.write_ratio) {
                    LockMode::Write
                } else {
                    LockMode::Read
                };
                (i, mode)
            })
            .collect();
        let request = if hipri {
            LockRequest::HIGH
        } else {
            LockRequest::LOW
        };

        self.tree.run_with_restart(stack, |stack| {
            let mut held = Vec::with_capacity(plan.len());
            for &(i, mode) in &plan {
                stack.check_restart()?;
                held.push(stack.longterm_lock(&self.leaves[i], mode, request)?);
            }
            for handle in held.iter().filter(|h| h.mode() == LockMode::Write) {
                handle.node().mark_modified(handle);
            }
            thread::yield_now();
            Ok(())
        })
    }

    fn scan(&self, stack: &LockStack, rng: &mut StdRng) -> ZTreeResult<()> {
        let start = &self.leaves[rng.random_range(0..self.leaves.len())];
        let steps = rng.random_range(1..=4);
        self.tree.run_with_restart(stack, |stack| {
            let handle = stack.longterm_lock(start, LockMode::Read, LockRequest::LOW)?;
            let layout = self.tree.zload(start)?;
            let coord = Coordinate::first_unit(Some(start.clone()), &*layout);
            self.tree.zrelse(start);
            let mut tap = Tap::new(self.tree, stack, coord, handle, LockMode::Read);
            match tap.rewind_right(steps) {
                Ok(()) | Err(ZTreeError::NoNeighbor) => tap.done(),
                Err(e) => Err(e),
            }
        })
    }
}

fn build_tree(config: TreeConfig, nodes: u64) -> (Tree, Vec<Arc<Znode>>) {
    let store = MemStore::new();
    for b in 1..=nodes {
        store.insert(
            BlockNr(b),
            MemNode::from_keys([Key::new(1, KeyType::Body, 1, b)]),
        );
    }
    let tree = Tree::new(Arc::new(store), config);
    let leaves: Vec<Arc<Znode>> = (1..=nodes)
        .map(|b| tree.zget(BlockNr(b), LEAF_LEVEL))
        .collect();
    tree.link_left_and_right(None, leaves.first());
    for pair in leaves.windows(2) {
        tree.link_left_and_right(Some(&pair[0]), Some(&pair[1]));
    }
    tree.link_left_and_right(leaves.last(), None);
    (tree, leaves)
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    assert!(args.nodes > 0, "need at least one node");

    let (tree, leaves) = build_tree(TreeConfig::from_env(), args.nodes);
    let workload = Workload {
        tree: &tree,
        leaves: &leaves,
        args: &args,
    };

    let started = Instant::now();
    let results: Vec<(u64, LockCounters)> = thread::scope(|s| {
        let workers: Vec<_> = (0..args.threads)
            .map(|t| {
                let workload = &workload;
                s.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(workload.args.seed.wrapping_add(t as u64));
                    let stack = workload.tree.new_lock_stack();
                    for _ in 0..workload.args.iterations {
                        let result = if rng.random_bool(workload.args.scan_ratio) {
                            workload.scan(&stack, &mut rng)
                        } else {
                            workload.lock_many(&stack, &mut rng)
                        };
                        if let Err(e) = result {
                            panic!("stack {}: operation failed: {}", stack.id(), e);
                        }
                    }
                    (stack.id(), stack.counters())
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().expect("worker panicked"))
            .collect()
    });
    let elapsed = started.elapsed();

    let mut table = comfy_table::Table::new();
    table.load_preset("||--+-++|    ++++++");
    table.set_header(vec![
        Cell::new("stack"),
        Cell::new("acquired"),
        Cell::new("sleeps"),
        Cell::new("restarts"),
    ]);
    let mut totals = (0u64, 0u64, 0u64);
    for (id, counters) in &results {
        totals.0 += counters.acquired;
        totals.1 += counters.sleeps;
        totals.2 += counters.restarts;
        table.add_row(vec![
            Cell::new(id),
            Cell::new(counters.acquired),
            Cell::new(counters.sleeps),
            Cell::new(counters.restarts),
        ]);
    }
    table.add_row(vec![
        Cell::new("total"),
        Cell::new(totals.0),
        Cell::new(totals.1),
        Cell::new(totals.2),
    ]);
    println!("{table}");
    println!(
        "{} threads x {} operations over {} nodes in {:.2?}",
        args.threads, args.iterations, args.nodes, elapsed
    );

    let max_version = leaves.iter().map(|n| n.version()).max().unwrap_or(0);
    println!("highest node version: {}", max_version);
}
