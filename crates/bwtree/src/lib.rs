//! A latch-free Bw-tree: an ordered, concurrent multimap from keys to sets
//! of values.
//!
//! Every logical node is an append-only chain of delta records rooted at a
//! mapping-table slot. Readers and writers never lock: a mutation is one CAS
//! that swings a slot to a new chain head, structural changes (split, merge,
//! remove) are published the same way and finished cooperatively by whoever
//! observes them first, and unlinked pages are reclaimed through epochs once
//! no reader can still hold them.

mod delta;
#[cfg(any(debug_assertions, test))]
mod debug;
mod gc;
mod logical;
mod mapping_table;
mod page;

mod error;
pub use error::*;

mod types;
pub use types::*;

mod tree;
pub use tree::{BwTree, ConditionalInsert};

mod iter;
pub use iter::*;
