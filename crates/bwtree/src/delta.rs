//! Delta records layered on top of base pages.
//!
//! Every record carries the chain depth below it (base pages sit at depth 0)
//! and a raw pointer to the record underneath. Pages are immutable once a CAS
//! has published them, so the pointers are `*const` and readers borrow them
//! for the duration of an epoch.

use crate::page::Page;
use crate::types::{Key, NodeId};

/// `(key, value)` was inserted into a leaf.
pub(crate) struct LeafInsert<K, V> {
    pub key: Key<K>,
    pub value: V,
    pub depth: u32,
    pub child: *const Page<K, V>,
}

/// `(key, value)` was removed from a leaf.
pub(crate) struct LeafDelete<K, V> {
    pub key: Key<K>,
    pub value: V,
    pub depth: u32,
    pub child: *const Page<K, V>,
}

/// `old` was replaced by `new` under `key`, as one step.
pub(crate) struct LeafUpdate<K, V> {
    pub key: Key<K>,
    pub old: V,
    pub new: V,
    pub depth: u32,
    pub child: *const Page<K, V>,
}

/// The node lost the key range `[split_key, ..)` to `sibling`. Tightens the
/// effective upper bound of everything below it.
pub(crate) struct SplitDelta<K, V> {
    pub split_key: Key<K>,
    pub sibling: NodeId,
    pub depth: u32,
    pub child: *const Page<K, V>,
}

/// The node absorbed its right neighbor: `right` holds that neighbor's whole
/// chain (reached physically, not through the mapping table) and is valid for
/// keys at or above `merge_key`.
pub(crate) struct MergeDelta<K, V> {
    pub merge_key: Key<K>,
    pub right: *const Page<K, V>,
    pub depth: u32,
    pub child: *const Page<K, V>,
}

/// The node is gone; readers must re-route through the left sibling. Once the
/// absorbing merge has been published the slot is re-pointed at a remove
/// record with a null child, which owns nothing.
pub(crate) struct RemoveDelta<K, V> {
    pub depth: u32,
    pub child: *const Page<K, V>,
}

/// Transient CAS blocker. Only the thread that posted it may take it down,
/// by swinging the slot back to `child`; everyone else's CAS on the node
/// fails while it is installed. Navigation walks straight through it.
pub(crate) struct AbortDelta<K, V> {
    pub depth: u32,
    pub child: *const Page<K, V>,
}

/// Index term for a freshly split-off child covering `[insert_key, next_key)`.
pub(crate) struct InnerInsert<K, V> {
    pub insert_key: Key<K>,
    pub next_key: Key<K>,
    pub new_node: NodeId,
    pub depth: u32,
    pub child: *const Page<K, V>,
}

/// Index term removal after a merge: `prev_node` now absorbs the whole range
/// `[prev_key, next_key)`.
pub(crate) struct InnerDelete<K, V> {
    pub deleted_key: Key<K>,
    pub prev_key: Key<K>,
    pub next_key: Key<K>,
    pub prev_node: NodeId,
    pub depth: u32,
    pub child: *const Page<K, V>,
}
