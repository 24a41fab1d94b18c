//! Folding a delta chain into an ordered logical view.
//!
//! Traversal, consolidation, SMO decisions and the iterator all work on the
//! logical content of a node, never on raw chains. A walk goes top to bottom
//! along physical `child` pointers, remembering the first split it sees (the
//! newest one, which defines the effective upper bound and right sibling),
//! stacking data deltas, then seeding from the base page and replaying the
//! stacked deltas oldest first. Merge records fold both branches.

use std::collections::BTreeMap;
use std::hash::Hash;

use crate::page::Page;
use crate::types::{Key, NodeId, ValueSet, INVALID_NODE_ID};

/// Effective bounds and right sibling of a chain.
#[derive(Debug, Clone)]
pub(crate) struct NodeMeta<K> {
    pub lbound: Key<K>,
    pub ubound: Key<K>,
    pub next: NodeId,
}

#[derive(Debug, Clone)]
pub(crate) struct LogicalLeaf<K, V> {
    pub meta: NodeMeta<K>,
    pub items: BTreeMap<Key<K>, ValueSet<V>>,
}

#[derive(Debug, Clone)]
pub(crate) struct LogicalInner<K> {
    pub meta: NodeMeta<K>,
    pub seps: BTreeMap<Key<K>, NodeId>,
}

/// Bounds accumulator. "First writer wins" matches walking top-down: the
/// newest split narrows the node, the leftmost base supplies the low bound.
struct MetaAcc<K> {
    lbound: Option<Key<K>>,
    ubound: Option<Key<K>>,
    next: Option<NodeId>,
}

impl<K> MetaAcc<K> {
    fn new() -> Self {
        Self {
            lbound: None,
            ubound: None,
            next: None,
        }
    }

    fn set_lbound(&mut self, key: Key<K>) {
        if self.lbound.is_none() {
            self.lbound = Some(key);
        }
    }

    fn set_ubound(&mut self, key: Key<K>, next: NodeId) {
        if self.ubound.is_none() {
            self.ubound = Some(key);
            self.next = Some(next);
        }
    }

    fn finish(self) -> NodeMeta<K> {
        NodeMeta {
            lbound: self.lbound.expect("delta chain has no base page below it"),
            ubound: self.ubound.expect("delta chain has no base page below it"),
            next: self.next.unwrap_or(INVALID_NODE_ID),
        }
    }
}

/// Materializes the full leaf content of `head`'s chain.
///
/// # Safety
/// `head` must point at a live leaf chain and the caller must be inside an
/// epoch (or otherwise own the chain).
pub(crate) unsafe fn leaf_view<K, V>(head: *const Page<K, V>) -> LogicalLeaf<K, V>
where
    K: Ord + Clone,
    V: Eq + Hash + Clone,
{
    let mut items = BTreeMap::new();
    let mut meta = MetaAcc::new();
    unsafe { leaf_rec(head, &mut items, &mut meta, true, true, true) };
    items.retain(|_, set| !set.is_empty());
    LogicalLeaf {
        meta: meta.finish(),
        items,
    }
}

/// Bounds and right sibling only; skips content and replay.
pub(crate) unsafe fn leaf_meta<K, V>(head: *const Page<K, V>) -> NodeMeta<K>
where
    K: Ord + Clone,
    V: Eq + Hash + Clone,
{
    let mut items = BTreeMap::new();
    let mut meta = MetaAcc::new();
    unsafe { leaf_rec(head, &mut items, &mut meta, true, true, false) };
    meta.finish()
}

/// Materializes the separator map of an inner chain.
pub(crate) unsafe fn inner_view<K, V>(head: *const Page<K, V>) -> LogicalInner<K>
where
    K: Ord + Clone,
{
    let mut seps = BTreeMap::new();
    let mut meta = MetaAcc::new();
    unsafe { inner_rec(head, &mut seps, &mut meta, true, true, true) };
    seps.retain(|_, id| *id != INVALID_NODE_ID);
    LogicalInner {
        meta: meta.finish(),
        seps,
    }
}

pub(crate) unsafe fn inner_meta<K, V>(head: *const Page<K, V>) -> NodeMeta<K>
where
    K: Ord + Clone,
{
    let mut seps = BTreeMap::new();
    let mut meta = MetaAcc::new();
    unsafe { inner_rec(head, &mut seps, &mut meta, true, true, false) };
    meta.finish()
}

fn below<K: Ord>(key: &Key<K>, narrowed: &Option<(Key<K>, NodeId)>) -> bool {
    match narrowed {
        Some((cap, _)) => key < cap,
        None => true,
    }
}

unsafe fn leaf_rec<K, V>(
    head: *const Page<K, V>,
    items: &mut BTreeMap<Key<K>, ValueSet<V>>,
    meta: &mut MetaAcc<K>,
    collect_lbound: bool,
    collect_ubound: bool,
    collect_values: bool,
) where
    K: Ord + Clone,
    V: Eq + Hash + Clone,
{
    let mut node = head;
    let mut narrowed: Option<(Key<K>, NodeId)> = None;
    let mut deltas: Vec<*const Page<K, V>> = Vec::new();

    loop {
        match unsafe { &*node } {
            Page::LeafBase(base) => {
                if collect_values {
                    for (key, set) in &base.items {
                        if below(key, &narrowed) {
                            items.insert(key.clone(), set.clone());
                        }
                    }
                }
                if collect_lbound {
                    meta.set_lbound(base.lbound.clone());
                }
                if collect_ubound {
                    match &narrowed {
                        Some((cap, sibling)) => meta.set_ubound(cap.clone(), *sibling),
                        None => meta.set_ubound(base.ubound.clone(), base.next),
                    }
                }
                if collect_values {
                    unsafe { replay_leaf(&deltas, items) };
                }
                return;
            }
            Page::LeafInsert(d) => {
                if collect_values && below(&d.key, &narrowed) {
                    deltas.push(node);
                }
                node = d.child;
            }
            Page::LeafDelete(d) => {
                if collect_values && below(&d.key, &narrowed) {
                    deltas.push(node);
                }
                node = d.child;
            }
            Page::LeafUpdate(d) => {
                if collect_values && below(&d.key, &narrowed) {
                    deltas.push(node);
                }
                node = d.child;
            }
            Page::LeafSplit(d) => {
                if narrowed.is_none() {
                    narrowed = Some((d.split_key.clone(), d.sibling));
                }
                node = d.child;
            }
            Page::LeafMerge(d) => {
                let pass_ubound = collect_ubound && narrowed.is_none();
                if collect_ubound {
                    if let Some((cap, sibling)) = &narrowed {
                        meta.set_ubound(cap.clone(), *sibling);
                    }
                }
                unsafe {
                    leaf_rec(d.child, items, meta, collect_lbound, false, collect_values);
                    leaf_rec(d.right, items, meta, false, pass_ubound, collect_values);
                    if collect_values {
                        replay_leaf(&deltas, items);
                    }
                }
                return;
            }
            Page::LeafAbort(d) => {
                node = d.child;
            }
            Page::LeafRemove(d) => {
                debug_assert!(false, "remove record below a chain head");
                node = d.child;
            }
            _ => unreachable!("inner record on a leaf chain"),
        }
    }
}

/// Applies stacked data deltas oldest first. An update removes the old value
/// and inserts the new one as one step.
unsafe fn replay_leaf<K, V>(deltas: &[*const Page<K, V>], items: &mut BTreeMap<Key<K>, ValueSet<V>>)
where
    K: Ord + Clone,
    V: Eq + Hash + Clone,
{
    for &delta in deltas.iter().rev() {
        match unsafe { &*delta } {
            Page::LeafInsert(d) => {
                items.entry(d.key.clone()).or_default().insert(d.value.clone());
            }
            Page::LeafDelete(d) => {
                if let Some(set) = items.get_mut(&d.key) {
                    set.remove(&d.value);
                }
            }
            Page::LeafUpdate(d) => {
                let set = items.entry(d.key.clone()).or_default();
                set.remove(&d.old);
                set.insert(d.new.clone());
            }
            _ => unreachable!("non-data record in replay stack"),
        }
    }
}

unsafe fn inner_rec<K, V>(
    head: *const Page<K, V>,
    seps: &mut BTreeMap<Key<K>, NodeId>,
    meta: &mut MetaAcc<K>,
    collect_lbound: bool,
    collect_ubound: bool,
    collect_seps: bool,
) where
    K: Ord + Clone,
{
    let mut node = head;
    let mut narrowed: Option<(Key<K>, NodeId)> = None;
    let mut deltas: Vec<*const Page<K, V>> = Vec::new();

    loop {
        match unsafe { &*node } {
            Page::InnerBase(base) => {
                if collect_seps {
                    for (key, id) in &base.seps {
                        if below(key, &narrowed) {
                            seps.insert(key.clone(), *id);
                        }
                    }
                }
                if collect_lbound {
                    meta.set_lbound(base.lbound.clone());
                }
                if collect_ubound {
                    match &narrowed {
                        Some((cap, sibling)) => meta.set_ubound(cap.clone(), *sibling),
                        None => meta.set_ubound(base.ubound.clone(), base.next),
                    }
                }
                if collect_seps {
                    unsafe { replay_inner(&deltas, seps) };
                }
                return;
            }
            Page::InnerInsert(d) => {
                if collect_seps && below(&d.insert_key, &narrowed) {
                    deltas.push(node);
                }
                node = d.child;
            }
            Page::InnerDelete(d) => {
                if collect_seps && below(&d.deleted_key, &narrowed) {
                    deltas.push(node);
                }
                node = d.child;
            }
            Page::InnerSplit(d) => {
                if narrowed.is_none() {
                    narrowed = Some((d.split_key.clone(), d.sibling));
                }
                node = d.child;
            }
            Page::InnerMerge(d) => {
                let pass_ubound = collect_ubound && narrowed.is_none();
                if collect_ubound {
                    if let Some((cap, sibling)) = &narrowed {
                        meta.set_ubound(cap.clone(), *sibling);
                    }
                }
                unsafe {
                    inner_rec(d.child, seps, meta, collect_lbound, false, collect_seps);
                    inner_rec(d.right, seps, meta, false, pass_ubound, collect_seps);
                    if collect_seps {
                        replay_inner(&deltas, seps);
                    }
                }
                return;
            }
            Page::InnerAbort(d) => {
                node = d.child;
            }
            Page::InnerRemove(d) => {
                debug_assert!(false, "remove record below a chain head");
                node = d.child;
            }
            _ => unreachable!("leaf record on an inner chain"),
        }
    }
}

/// Index-term replay, oldest first. Deletions tombstone with the invalid id;
/// the wrapper strips tombstones after the walk, so a term deleted and then
/// re-posted survives.
unsafe fn replay_inner<K, V>(deltas: &[*const Page<K, V>], seps: &mut BTreeMap<Key<K>, NodeId>)
where
    K: Ord + Clone,
{
    for &delta in deltas.iter().rev() {
        match unsafe { &*delta } {
            Page::InnerInsert(d) => {
                seps.insert(d.insert_key.clone(), d.new_node);
            }
            Page::InnerDelete(d) => {
                seps.insert(d.deleted_key.clone(), INVALID_NODE_ID);
            }
            _ => unreachable!("non-index record in replay stack"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{LeafDelete, LeafInsert, LeafUpdate, SplitDelta};
    use crate::page::{free_chain, LeafBase};

    fn base_with(items: Vec<(u64, Vec<u64>)>) -> *mut Page<u64, u64> {
        Page::LeafBase(LeafBase {
            lbound: Key::NegInf,
            ubound: Key::PosInf,
            next: INVALID_NODE_ID,
            items: items
                .into_iter()
                .map(|(k, vs)| (Key::Raw(k), vs.into_iter().collect()))
                .collect(),
        })
        .into_heap()
    }

    #[test]
    fn replay_runs_oldest_first() {
        let base = base_with(vec![(1, vec![10])]);
        let insert = Page::LeafInsert(LeafInsert {
            key: Key::Raw(2),
            value: 20,
            depth: 1,
            child: base,
        })
        .into_heap();
        let delete = Page::LeafDelete(LeafDelete {
            key: Key::Raw(1),
            value: 10,
            depth: 2,
            child: insert,
        })
        .into_heap();

        let view = unsafe { leaf_view(delete.cast_const()) };
        assert_eq!(view.items.len(), 1);
        assert!(view.items[&Key::Raw(2)].contains(&20));
        assert!(!view.items.contains_key(&Key::Raw(1)));
        assert_eq!(view.meta.lbound, Key::NegInf);
        assert_eq!(view.meta.ubound, Key::PosInf);

        unsafe { free_chain(delete) };
    }

    #[test]
    fn update_is_one_step() {
        let base = base_with(vec![(1, vec![10])]);
        let update = Page::LeafUpdate(LeafUpdate {
            key: Key::Raw(1),
            old: 10,
            new: 11,
            depth: 1,
            child: base,
        })
        .into_heap();

        let view = unsafe { leaf_view(update.cast_const()) };
        let set = &view.items[&Key::Raw(1)];
        assert!(set.contains(&11));
        assert!(!set.contains(&10));

        unsafe { free_chain(update) };
    }

    #[test]
    fn split_narrows_bounds_and_filters_content() {
        let base = base_with(vec![(1, vec![1]), (2, vec![2]), (3, vec![3]), (4, vec![4])]);
        let split = Page::LeafSplit(SplitDelta {
            split_key: Key::Raw(3),
            sibling: 9,
            depth: 1,
            child: base,
        })
        .into_heap();

        let view = unsafe { leaf_view(split.cast_const()) };
        assert_eq!(view.meta.ubound, Key::Raw(3));
        assert_eq!(view.meta.next, 9);
        assert!(view.items.contains_key(&Key::Raw(1)));
        assert!(view.items.contains_key(&Key::Raw(2)));
        assert!(!view.items.contains_key(&Key::Raw(3)));
        assert!(!view.items.contains_key(&Key::Raw(4)));

        let meta = unsafe { leaf_meta(split.cast_const()) };
        assert_eq!(meta.ubound, Key::Raw(3));

        unsafe { free_chain(split) };
    }
}
