//! Snapshot-style forward iteration.
//!
//! The iterator owns a flattened copy of one logical leaf at a time and
//! walks it by plain indices, so cloning an iterator clones its whole
//! position. Between leaves it re-enters an epoch and traverses by the
//! previous leaf's high key, never by a node id: ids go stale when nodes
//! split or merge, but the high key always names the lower bound of what has
//! not been yielded yet. After a reload, keys below the cursor are skipped,
//! which covers a leaf that was merged into its left neighbor mid-scan.

use std::hash::Hash;

use crate::logical;
use crate::tree::{BwTree, Context};
use crate::types::Key;

pub struct Iter<'t, K, V> {
    tree: &'t BwTree<K, V>,
    /// Flattened current leaf: keys in order, each with its values.
    entries: Vec<(K, Vec<V>)>,
    key_pos: usize,
    val_pos: usize,
    /// Lower bound of everything not yielded yet; `PosInf` once the last
    /// leaf has been loaded.
    next_key: Key<K>,
    primed: bool,
    done: bool,
}

impl<K, V> Clone for Iter<'_, K, V>
where
    K: Clone,
    V: Clone,
{
    fn clone(&self) -> Self {
        Self {
            tree: self.tree,
            entries: self.entries.clone(),
            key_pos: self.key_pos,
            val_pos: self.val_pos,
            next_key: self.next_key.clone(),
            primed: self.primed,
            done: self.done,
        }
    }
}

impl<'t, K, V> Iter<'t, K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(tree: &'t BwTree<K, V>, start: Key<K>) -> Self {
        Self {
            tree,
            entries: Vec::new(),
            key_pos: 0,
            val_pos: 0,
            next_key: start,
            primed: false,
            done: false,
        }
    }

    /// Loads the logical leaf owning `next_key` and positions the cursor at
    /// the first key at or above it. Keeps walking right while leaves have
    /// nothing left for us; marks the end at the rightmost leaf.
    fn load_next_leaf(&mut self) {
        loop {
            let view = {
                let _epoch = self.tree.epoch.enter();
                let mut ctx = Context::new(self.next_key.clone());
                self.tree.traverse(&mut ctx, false);
                unsafe { logical::leaf_view(ctx.top().head) }
            };

            let ubound = view.meta.ubound;
            self.entries = view
                .items
                .into_iter()
                .filter_map(|(key, values)| {
                    key.into_raw().map(|k| (k, values.into_iter().collect()))
                })
                .collect();
            self.val_pos = 0;
            self.key_pos = self
                .entries
                .partition_point(|(key, _)| self.next_key.gt_raw(key));

            if self.key_pos < self.entries.len() {
                self.next_key = ubound;
                return;
            }
            if ubound.is_pos_inf() {
                self.done = true;
                return;
            }
            self.next_key = ubound;
        }
    }
}

impl<K, V> Iterator for Iter<'_, K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Eq + Hash + Clone + Send + Sync + 'static,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        if self.done {
            return None;
        }
        if !self.primed {
            self.primed = true;
            self.load_next_leaf();
        }

        loop {
            if self.done {
                return None;
            }
            if let Some((key, values)) = self.entries.get(self.key_pos) {
                if let Some(value) = values.get(self.val_pos) {
                    let item = (key.clone(), value.clone());
                    self.val_pos += 1;
                    if self.val_pos >= values.len() {
                        self.val_pos = 0;
                        self.key_pos += 1;
                    }
                    return Some(item);
                }
                // A key with no values cannot come out of materialization,
                // but skipping it is harmless.
                self.key_pos += 1;
                self.val_pos = 0;
                continue;
            }
            if self.next_key.is_pos_inf() {
                self.done = true;
                return None;
            }
            self.load_next_leaf();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TreeOptions;
    use std::thread;
    use std::time::Duration;

    fn small_tree() -> BwTree<u64, u64> {
        BwTree::with_options(TreeOptions {
            mapping_table_capacity: 1 << 16,
            delta_chain_threshold: 2,
            inner_size_upper: 8,
            inner_size_lower: 2,
            leaf_size_upper: 4,
            leaf_size_lower: 2,
            gc_period: Duration::from_millis(5),
            allow_duplicate_values_per_key: true,
        })
        .unwrap()
    }

    #[test]
    fn empty_tree_yields_nothing() {
        let tree = small_tree();
        assert_eq!(tree.iter().next(), None);
    }

    #[test]
    fn full_scan_crosses_leaves() {
        let tree = small_tree();
        for key in 1..=50u64 {
            assert!(tree.insert(key, key * 2));
        }
        let items: Vec<(u64, u64)> = tree.iter().collect();
        assert_eq!(items, (1..=50).map(|k| (k, k * 2)).collect::<Vec<_>>());
    }

    #[test]
    fn seek_starts_at_first_key_not_below() {
        let tree = small_tree();
        for key in (2..=20u64).step_by(2) {
            assert!(tree.insert(key, key));
        }

        let from_exact: Vec<u64> = tree.iter_from(8).map(|(k, _)| k).collect();
        assert_eq!(from_exact, vec![8, 10, 12, 14, 16, 18, 20]);

        let from_gap: Vec<u64> = tree.iter_from(9).map(|(k, _)| k).collect();
        assert_eq!(from_gap, vec![10, 12, 14, 16, 18, 20]);

        assert_eq!(tree.iter_from(21).next(), None);
    }

    #[test]
    fn multiple_values_per_key_all_come_out() {
        let tree = small_tree();
        assert!(tree.insert(1, 10));
        assert!(tree.insert(1, 11));
        assert!(tree.insert(2, 20));

        let mut ones: Vec<u64> = tree
            .iter()
            .filter(|(k, _)| *k == 1)
            .map(|(_, v)| v)
            .collect();
        ones.sort_unstable();
        assert_eq!(ones, vec![10, 11]);
        assert_eq!(tree.iter().count(), 3);
    }

    #[test]
    fn cloned_iterator_is_independent() {
        let tree = small_tree();
        for key in 1..=10u64 {
            assert!(tree.insert(key, key));
        }

        let mut original = tree.iter();
        for _ in 0..3 {
            original.next();
        }
        let mut fork = original.clone();

        let rest_a: Vec<u64> = original.map(|(k, _)| k).collect();
        let rest_b: Vec<u64> = fork.by_ref().map(|(k, _)| k).collect();
        assert_eq!(rest_a, rest_b);
        assert_eq!(rest_a, (4..=10).collect::<Vec<_>>());
    }

    #[test]
    fn scan_survives_concurrent_splits() {
        let tree = small_tree();
        for key in 0..100u64 {
            assert!(tree.insert(key, key));
        }

        thread::scope(|scope| {
            let writer = {
                let tree = &tree;
                scope.spawn(move || {
                    for key in 1000..1200u64 {
                        assert!(tree.insert(key, key));
                    }
                })
            };

            // Slow scan of the low range while the writer splits leaves in
            // the high range (and possibly the root above both).
            let mut seen = Vec::new();
            for (key, _) in tree.iter() {
                if key < 1000 {
                    seen.push(key);
                }
                thread::yield_now();
            }
            writer.join().unwrap();

            assert_eq!(seen, (0..100).collect::<Vec<_>>());
        });
    }
}
