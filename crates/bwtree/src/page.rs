//! Base pages and the tagged page variant the whole structure pattern-matches
//! on. The set of node kinds is fixed and closed, so the variants live in one
//! enum and every consumer matches exhaustively.

use crate::delta::{
    AbortDelta, InnerDelete, InnerInsert, LeafDelete, LeafInsert, LeafUpdate, MergeDelta,
    RemoveDelta, SplitDelta,
};
use crate::types::{Key, NodeId, ValueSet};

/// Inner base page: ordered separators routing `[sep key, next sep key)` to a
/// child id. The first separator's key equals the page's low bound.
pub(crate) struct InnerBase<K> {
    pub lbound: Key<K>,
    pub ubound: Key<K>,
    pub next: NodeId,
    pub seps: Vec<(Key<K>, NodeId)>,
}

/// Leaf base page: ordered items, all inside `[lbound, ubound)`.
pub(crate) struct LeafBase<K, V> {
    pub lbound: Key<K>,
    pub ubound: Key<K>,
    pub next: NodeId,
    pub items: Vec<(Key<K>, ValueSet<V>)>,
}

impl<K: Ord> InnerBase<K> {
    /// Debug-only structural checks: strictly increasing separators, the
    /// first one pinned to the low bound, all below the high bound.
    pub fn check_invariants(&self) {
        if cfg!(debug_assertions) {
            debug_assert!(!self.seps.is_empty());
            debug_assert!(self.seps[0].0 == self.lbound);
            for pair in self.seps.windows(2) {
                debug_assert!(pair[0].0 < pair[1].0);
                debug_assert!(pair[0].1 != pair[1].1);
            }
            for (key, _) in &self.seps {
                debug_assert!(*key < self.ubound);
            }
        }
    }
}

impl<K: Ord, V> LeafBase<K, V> {
    pub fn check_invariants(&self) {
        if cfg!(debug_assertions) {
            for pair in self.items.windows(2) {
                debug_assert!(pair[0].0 < pair[1].0);
            }
            for (key, _) in &self.items {
                debug_assert!(*key >= self.lbound && *key < self.ubound);
            }
        }
    }
}

/// One node in a delta chain. Either a base page or a delta layered above one.
pub(crate) enum Page<K, V> {
    LeafBase(LeafBase<K, V>),
    LeafInsert(LeafInsert<K, V>),
    LeafDelete(LeafDelete<K, V>),
    LeafUpdate(LeafUpdate<K, V>),
    LeafSplit(SplitDelta<K, V>),
    LeafMerge(MergeDelta<K, V>),
    LeafRemove(RemoveDelta<K, V>),
    LeafAbort(AbortDelta<K, V>),
    InnerBase(InnerBase<K>),
    InnerInsert(InnerInsert<K, V>),
    InnerDelete(InnerDelete<K, V>),
    InnerSplit(SplitDelta<K, V>),
    InnerMerge(MergeDelta<K, V>),
    InnerRemove(RemoveDelta<K, V>),
    InnerAbort(AbortDelta<K, V>),
}

impl<K, V> Page<K, V> {
    /// Chain length below this record, plus one. Base pages are depth 0.
    pub fn depth(&self) -> u32 {
        match self {
            Page::LeafBase(_) | Page::InnerBase(_) => 0,
            Page::LeafInsert(d) => d.depth,
            Page::LeafDelete(d) => d.depth,
            Page::LeafUpdate(d) => d.depth,
            Page::LeafSplit(d) | Page::InnerSplit(d) => d.depth,
            Page::LeafMerge(d) | Page::InnerMerge(d) => d.depth,
            Page::LeafRemove(d) | Page::InnerRemove(d) => d.depth,
            Page::LeafAbort(d) | Page::InnerAbort(d) => d.depth,
            Page::InnerInsert(d) => d.depth,
            Page::InnerDelete(d) => d.depth,
        }
    }

    pub fn is_delta(&self) -> bool {
        !matches!(self, Page::LeafBase(_) | Page::InnerBase(_))
    }

    /// Whether this record sits on a leaf delta chain. Constant along a
    /// chain, so the head answers for the whole node.
    pub fn on_leaf_chain(&self) -> bool {
        matches!(
            self,
            Page::LeafBase(_)
                | Page::LeafInsert(_)
                | Page::LeafDelete(_)
                | Page::LeafUpdate(_)
                | Page::LeafSplit(_)
                | Page::LeafMerge(_)
                | Page::LeafRemove(_)
                | Page::LeafAbort(_)
        )
    }

    /// Moves the page to the heap, yielding the pointer a CAS will publish.
    pub fn into_heap(self) -> *mut Page<K, V> {
        Box::into_raw(Box::new(self))
    }
}

/// Frees one record without touching anything it points at. For records that
/// lost their installation CAS and were never published.
pub(crate) unsafe fn free_single<K, V>(page: *mut Page<K, V>) {
    unsafe { drop(Box::from_raw(page)) };
}

/// Frees an unlinked chain. Merge records own a second chain through `right`
/// and recurse into both branches; remove and abort records own nothing below
/// them (their tails are reachable elsewhere), so they terminate, as do base
/// pages. Returns the number of records freed.
pub(crate) unsafe fn free_chain<K, V>(head: *const Page<K, V>) -> u64 {
    let mut freed = 0u64;
    let mut node = head;

    while !node.is_null() {
        let boxed = unsafe { Box::from_raw(node.cast_mut()) };
        freed += 1;

        node = match *boxed {
            Page::LeafBase(_) | Page::InnerBase(_) => std::ptr::null(),
            Page::LeafRemove(_) | Page::InnerRemove(_) => std::ptr::null(),
            Page::LeafAbort(_) | Page::InnerAbort(_) => std::ptr::null(),
            Page::LeafMerge(d) | Page::InnerMerge(d) => {
                freed += unsafe { free_chain(d.child) };
                freed += unsafe { free_chain(d.right) };
                std::ptr::null()
            }
            Page::LeafInsert(d) => d.child,
            Page::LeafDelete(d) => d.child,
            Page::LeafUpdate(d) => d.child,
            Page::LeafSplit(d) | Page::InnerSplit(d) => d.child,
            Page::InnerInsert(d) => d.child,
            Page::InnerDelete(d) => d.child,
        };
    }

    freed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_leaf() -> LeafBase<u64, u64> {
        LeafBase {
            lbound: Key::NegInf,
            ubound: Key::PosInf,
            next: crate::types::INVALID_NODE_ID,
            items: Vec::new(),
        }
    }

    #[test]
    fn depth_bookkeeping() {
        let base = Page::LeafBase(empty_leaf()).into_heap();
        assert_eq!(unsafe { &*base }.depth(), 0);
        assert!(!unsafe { &*base }.is_delta());

        let insert = Page::LeafInsert(LeafInsert {
            key: Key::Raw(1),
            value: 10,
            depth: unsafe { &*base }.depth() + 1,
            child: base,
        })
        .into_heap();
        assert_eq!(unsafe { &*insert }.depth(), 1);
        assert!(unsafe { &*insert }.on_leaf_chain());

        assert_eq!(unsafe { free_chain(insert) }, 2);
    }

    #[test]
    fn merge_frees_both_branches() {
        let left = Page::LeafBase(empty_leaf()).into_heap();
        let right = Page::LeafBase(empty_leaf()).into_heap();
        let merge = Page::LeafMerge(MergeDelta {
            merge_key: Key::Raw(5),
            right,
            depth: 1,
            child: left,
        })
        .into_heap();

        assert_eq!(unsafe { free_chain(merge) }, 3);
    }

    #[test]
    fn remove_header_terminates() {
        let base = Page::LeafBase(empty_leaf()).into_heap();
        let remove = Page::<u64, u64>::LeafRemove(RemoveDelta {
            depth: 1,
            child: base,
        })
        .into_heap();

        // The chain under a remove record is owned by the absorbing merge.
        assert_eq!(unsafe { free_chain(remove) }, 1);
        assert_eq!(unsafe { free_chain(base) }, 1);
    }
}
