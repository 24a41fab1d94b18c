//! The mapping table: the sole indirection between tree edges and physical
//! pages. Tree edges store [`NodeId`]s; the table maps each id to the current
//! head of that node's delta chain through one atomic pointer per slot.
//! Swapping a slot head with CAS is the only way the tree ever mutates.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use log::trace;

use crate::page::Page;
use crate::types::{NodeId, INVALID_NODE_ID};

pub(crate) struct MappingTable<K, V> {
    slots: Box<[AtomicPtr<Page<K, V>>]>,
    next_id: AtomicU64,
    root: AtomicU64,
}

impl<K, V> MappingTable<K, V> {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            next_id: AtomicU64::new(0),
            root: AtomicU64::new(0),
        }
    }

    /// Mints a fresh id. Ids are never recycled.
    pub fn alloc_id(&self) -> NodeId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        assert!(
            (id as usize) < self.slots.len(),
            "mapping table exhausted: {} slots",
            self.slots.len()
        );
        id
    }

    /// Number of ids handed out so far.
    pub fn allocated(&self) -> NodeId {
        self.next_id.load(Ordering::Acquire).min(self.slots.len() as u64)
    }

    /// Publishes the initial content of a freshly minted id. The slot is
    /// still null, so the CAS cannot lose.
    pub fn install_fresh(&self, id: NodeId, page: *mut Page<K, V>) {
        let won = self.slots[id as usize]
            .compare_exchange(ptr::null_mut(), page, Ordering::Release, Ordering::Relaxed)
            .is_ok();
        debug_assert!(won, "fresh install raced on node {id}");
    }

    /// Undoes a fresh install whose id never became reachable (the SMO that
    /// would have published it lost its CAS). The id stays burned.
    pub fn clear_fresh(&self, id: NodeId, page: *mut Page<K, V>) {
        let won = self.slots[id as usize]
            .compare_exchange(page, ptr::null_mut(), Ordering::Release, Ordering::Relaxed)
            .is_ok();
        debug_assert!(won, "fresh clear raced on node {id}");
    }

    /// Current chain head for `id`. The load is the linearization point of
    /// every read on this node.
    pub fn read(&self, id: NodeId) -> *const Page<K, V> {
        debug_assert!(id != INVALID_NODE_ID);
        self.slots[id as usize].load(Ordering::Acquire)
    }

    /// Single-shot head swap. A failure means someone else moved the node
    /// first; callers abort and re-traverse rather than retry in place.
    pub fn cas(&self, id: NodeId, expected: *const Page<K, V>, new: *mut Page<K, V>) -> bool {
        let swapped = self.slots[id as usize]
            .compare_exchange(
                expected.cast_mut(),
                new,
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok();
        trace!(
            "[{:?}] cas node {id}: {}",
            std::thread::current().id(),
            if swapped { "installed" } else { "lost" }
        );
        swapped
    }

    pub fn root(&self) -> NodeId {
        self.root.load(Ordering::Acquire)
    }

    pub fn install_root(&self, old: NodeId, new: NodeId) -> bool {
        let swapped = self
            .root
            .compare_exchange(old, new, Ordering::Release, Ordering::Relaxed)
            .is_ok();
        trace!(
            "[{:?}] root swap {old} -> {new}: {}",
            std::thread::current().id(),
            if swapped { "installed" } else { "lost" }
        );
        swapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{free_chain, LeafBase};
    use crate::types::Key;

    fn leaf_page() -> *mut Page<u64, u64> {
        Page::LeafBase(LeafBase {
            lbound: Key::NegInf,
            ubound: Key::PosInf,
            next: INVALID_NODE_ID,
            items: Vec::new(),
        })
        .into_heap()
    }

    #[test]
    fn ids_are_monotonic() {
        let table: MappingTable<u64, u64> = MappingTable::new(16);
        assert_eq!(table.alloc_id(), 0);
        assert_eq!(table.alloc_id(), 1);
        assert_eq!(table.alloc_id(), 2);
        assert_eq!(table.allocated(), 3);
    }

    #[test]
    fn install_then_cas() {
        let table: MappingTable<u64, u64> = MappingTable::new(16);
        let id = table.alloc_id();

        let first = leaf_page();
        table.install_fresh(id, first);
        assert_eq!(table.read(id), first as *const _);

        let second = leaf_page();
        assert!(table.cas(id, first, second));
        assert_eq!(table.read(id), second as *const _);

        // A stale expected pointer must lose.
        let third = leaf_page();
        assert!(!table.cas(id, first, third));

        unsafe {
            free_chain(first);
            free_chain(second);
            free_chain(third);
        }
    }

    #[test]
    fn root_swap_is_single_shot() {
        let table: MappingTable<u64, u64> = MappingTable::new(16);
        assert_eq!(table.root(), 0);
        assert!(table.install_root(0, 7));
        assert!(!table.install_root(0, 9));
        assert_eq!(table.root(), 7);
    }
}
