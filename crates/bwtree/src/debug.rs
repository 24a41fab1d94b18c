//! Debug-build integrity checks and a chain inspector.
//!
//! Compiled out of release builds. The checks assume a quiescent tree (no
//! concurrent writers), which is what every test has after joining its
//! threads; pending structural operations that were never helped along are
//! fine, since the walk goes by logical bounds rather than parent pointers.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::hash::Hash;

use crate::logical;
use crate::page::Page;
use crate::tree::BwTree;
use crate::types::{Key, NodeId, ValueSet, INVALID_NODE_ID};

impl<K, V> BwTree<K, V>
where
    K: Ord + Clone + Send + Sync + 'static + std::fmt::Debug,
    V: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Walks every leaf in key order, asserting that leaf ranges tile the
    /// key space with no gap or overlap and that every item respects its
    /// node's bounds. Returns the tree's full logical content.
    pub(crate) fn check_integrity(&self) -> BTreeMap<K, ValueSet<V>> {
        let _pin = self.epoch.enter();

        // Descend along leftmost children to the first leaf.
        let mut id = self.table.root();
        loop {
            let head = self.resolve_head(id);
            if unsafe { &*head }.on_leaf_chain() {
                break;
            }
            let view = unsafe { logical::inner_view(head) };
            assert!(!view.seps.is_empty(), "inner node {id} has no separators");
            assert!(
                view.meta.lbound < view.meta.ubound,
                "inner node {id} has an empty range"
            );
            id = *view
                .seps
                .values()
                .next()
                .expect("inner node with no children");
        }

        // Walk the leaf level by high keys.
        let mut content = BTreeMap::new();
        let mut expected_low = Key::NegInf;
        loop {
            let head = self.resolve_head(id);
            let view = unsafe { logical::leaf_view(head) };

            assert_eq!(
                view.meta.lbound, expected_low,
                "leaf {id} does not start where its left neighbor ended"
            );
            assert!(
                view.meta.lbound < view.meta.ubound,
                "leaf {id} has an empty range"
            );

            for (key, values) in &view.items {
                assert!(
                    *key >= view.meta.lbound && *key < view.meta.ubound,
                    "leaf {id} holds a key outside its bounds"
                );
                assert!(!values.is_empty(), "leaf {id} kept an empty value set");
                let raw = key
                    .raw()
                    .cloned()
                    .expect("leaf item key is not a raw key");
                let twice = content.insert(raw, values.clone());
                assert!(twice.is_none(), "a key is owned by two leaves");
            }

            if view.meta.ubound.is_pos_inf() {
                break;
            }
            expected_low = view.meta.ubound;
            id = view.meta.next;
            assert_ne!(id, INVALID_NODE_ID, "bounded leaf without a right link");
        }

        content
    }

    /// Head of `id`'s chain for inspection purposes: a removed node whose
    /// merge has already been posted stands in for the chain it used to own.
    fn resolve_head(&self, id: NodeId) -> *const Page<K, V> {
        let head = self.table.read(id);
        assert!(!head.is_null(), "walk reached an uninstalled node {id}");
        match unsafe { &*head } {
            Page::LeafRemove(r) | Page::InnerRemove(r) => {
                assert!(
                    !r.child.is_null(),
                    "walk reached a detached slot {id}; a right link should skip it"
                );
                r.child
            }
            _ => head,
        }
    }

    /// One line per record of `id`'s chain, top to bottom. Merge branches are
    /// summarized, not expanded.
    pub(crate) fn describe_chain(&self, id: NodeId) -> String {
        let _pin = self.epoch.enter();
        let mut out = String::new();
        let mut node = self.table.read(id);

        while !node.is_null() {
            let page = unsafe { &*node };
            let depth = page.depth();
            node = match page {
                Page::LeafBase(b) => {
                    let _ = writeln!(out, "leaf base, {} items", b.items.len());
                    std::ptr::null()
                }
                Page::InnerBase(b) => {
                    let _ = writeln!(out, "inner base, {} separators", b.seps.len());
                    std::ptr::null()
                }
                Page::LeafInsert(d) => {
                    let _ = writeln!(out, "leaf insert (depth {depth})");
                    d.child
                }
                Page::LeafDelete(d) => {
                    let _ = writeln!(out, "leaf delete (depth {depth})");
                    d.child
                }
                Page::LeafUpdate(d) => {
                    let _ = writeln!(out, "leaf update (depth {depth})");
                    d.child
                }
                Page::LeafSplit(d) | Page::InnerSplit(d) => {
                    let _ = writeln!(out, "split -> node {} (depth {depth})", d.sibling);
                    d.child
                }
                Page::LeafMerge(d) | Page::InnerMerge(d) => {
                    let _ = writeln!(out, "merge absorbing a right branch (depth {depth})");
                    d.child
                }
                Page::LeafRemove(_) | Page::InnerRemove(_) => {
                    let _ = writeln!(out, "removed");
                    std::ptr::null()
                }
                Page::LeafAbort(d) | Page::InnerAbort(d) => {
                    let _ = writeln!(out, "abort block (depth {depth})");
                    d.child
                }
                Page::InnerInsert(d) => {
                    let _ = writeln!(out, "index insert -> node {} (depth {depth})", d.new_node);
                    d.child
                }
                Page::InnerDelete(d) => {
                    let _ = writeln!(out, "index delete -> node {} (depth {depth})", d.prev_node);
                    d.child
                }
            };
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use crate::types::TreeOptions;
    use crate::BwTree;
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
    fn integrity_walk_matches_content() {
        let tree = small_tree();
        for key in 0..64u64 {
            assert!(tree.insert(key, key * 3));
        }
        for key in (0..64u64).step_by(3) {
            assert!(tree.delete(&key, &(key * 3)));
        }

        let content = tree.check_integrity();
        assert_eq!(
            content.keys().copied().collect::<Vec<_>>(),
            (0..64u64).filter(|k| k % 3 != 0).collect::<Vec<_>>()
        );
        for (key, values) in content {
            assert_eq!(values, [key * 3].into_iter().collect());
        }
    }

    #[test]
    fn chain_dump_names_every_record() {
        let tree = small_tree();
        assert!(tree.insert(1, 1));

        let root = tree.describe_chain(tree.table.root());
        assert!(root.contains("inner base"));

        // Node 1 is the first leaf; the fresh insert sits on its chain.
        let leaf = tree.describe_chain(1);
        assert!(leaf.contains("leaf insert"));
        assert!(leaf.contains("leaf base"));
    }
}
