//! Epoch-based reclamation.
//!
//! Unlinked pages cannot be freed while some reader still holds a pointer
//! into them, so every public operation pins the current epoch for its
//! duration and retired pages are parked on the epoch they were retired in.
//! A background thread periodically opens a fresh epoch and frees the
//! garbage of every older epoch that has fully drained, oldest first,
//! stopping at the first epoch still pinned.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_utils::CachePadded;
use log::trace;

use crate::page::{free_chain, Page};

struct GarbageNode<K, V> {
    page: *const Page<K, V>,
    next: *mut GarbageNode<K, V>,
}

struct EpochNode<K, V> {
    /// Readers currently pinned to this epoch. Padded so enter/leave traffic
    /// does not false-share with the garbage list head.
    active: CachePadded<AtomicU64>,
    garbage: AtomicPtr<GarbageNode<K, V>>,
    /// Written once by the reclaimer when the successor epoch opens.
    next: AtomicPtr<EpochNode<K, V>>,
}

impl<K, V> EpochNode<K, V> {
    fn boxed() -> *mut Self {
        Box::into_raw(Box::new(EpochNode {
            active: CachePadded::new(AtomicU64::new(0)),
            garbage: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

pub(crate) struct EpochManager<K, V> {
    /// Oldest epoch not yet reclaimed. Touched only by the reclaimer and the
    /// final drain.
    head: AtomicPtr<EpochNode<K, V>>,
    current: AtomicPtr<EpochNode<K, V>>,
    exit: AtomicBool,
    freed_pages: AtomicU64,
}

unsafe impl<K: Send + Sync, V: Send + Sync> Send for EpochManager<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for EpochManager<K, V> {}

/// Pin on the epoch a thread entered. Dropping it leaves the epoch.
pub(crate) struct EpochGuard<'a, K, V> {
    epoch: *const EpochNode<K, V>,
    _mgr: &'a EpochManager<K, V>,
}

impl<K, V> Drop for EpochGuard<'_, K, V> {
    fn drop(&mut self) {
        unsafe { (*self.epoch).active.fetch_sub(1, Ordering::Release) };
    }
}

impl<K, V> EpochManager<K, V> {
    pub fn new() -> Self {
        let first = EpochNode::boxed();
        Self {
            head: AtomicPtr::new(first),
            current: AtomicPtr::new(first),
            exit: AtomicBool::new(false),
            freed_pages: AtomicU64::new(0),
        }
    }

    /// Pins the current epoch. Pages retired in this epoch or later stay
    /// alive until the returned guard is dropped.
    pub fn enter(&self) -> EpochGuard<'_, K, V> {
        let epoch = self.current.load(Ordering::Acquire);
        unsafe { (*epoch).active.fetch_add(1, Ordering::Acquire) };
        EpochGuard {
            epoch,
            _mgr: self,
        }
    }

    /// Parks an unlinked chain on the current epoch's garbage list. The
    /// current epoch is always at or after the epoch of every thread inside
    /// an operation, so this never shortens anyone's borrow.
    pub fn retire(&self, page: *const Page<K, V>) {
        let epoch = self.current.load(Ordering::Acquire);
        let node = Box::into_raw(Box::new(GarbageNode {
            page,
            next: ptr::null_mut(),
        }));

        let list = unsafe { &(*epoch).garbage };
        loop {
            let head = list.load(Ordering::Acquire);
            unsafe { (*node).next = head };
            if list
                .compare_exchange(head, node, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Opens a new epoch. Reclaimer only.
    fn advance(&self) {
        let fresh = EpochNode::boxed();
        let current = self.current.load(Ordering::Acquire);
        unsafe { (*current).next.store(fresh, Ordering::Release) };
        self.current.store(fresh, Ordering::Release);
    }

    /// Frees drained epochs from the head of the list, stopping at the first
    /// epoch that is still pinned or is the current one. Reclaimer only.
    fn collect(&self) {
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head == self.current.load(Ordering::Acquire) {
                return;
            }
            if unsafe { (*head).active.load(Ordering::Acquire) } != 0 {
                return;
            }

            self.free_garbage_of(head);

            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            debug_assert!(!next.is_null());
            self.head.store(next, Ordering::Release);
            unsafe { drop(Box::from_raw(head)) };
        }
    }

    fn free_garbage_of(&self, epoch: *mut EpochNode<K, V>) {
        let mut garbage = unsafe { (*epoch).garbage.load(Ordering::Acquire) };
        let mut freed = 0u64;
        while !garbage.is_null() {
            let node = unsafe { Box::from_raw(garbage) };
            freed += unsafe { free_chain(node.page) };
            garbage = node.next;
        }
        if freed > 0 {
            self.freed_pages.fetch_add(freed, Ordering::Relaxed);
            trace!("reclaimed {freed} pages");
        }
    }

    /// Total pages destroyed by reclamation so far.
    pub fn freed_pages(&self) -> u64 {
        self.freed_pages.load(Ordering::Relaxed)
    }

    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::Release);
    }

    /// Body of the background reclaimer thread.
    pub fn run(&self, period: Duration) {
        while !self.exit.load(Ordering::Acquire) {
            self.advance();
            self.collect();
            std::thread::sleep(period);
        }
        trace!("reclaimer exiting");
    }
}

impl<K, V> Drop for EpochManager<K, V> {
    /// Final sweep after the reclaimer has been joined: every guard is gone,
    /// so all remaining garbage and every epoch node can go.
    fn drop(&mut self) {
        let mut epoch = self.head.load(Ordering::Acquire);
        while !epoch.is_null() {
            debug_assert_eq!(unsafe { (*epoch).active.load(Ordering::Acquire) }, 0);
            self.free_garbage_of(epoch);
            let next = unsafe { (*epoch).next.load(Ordering::Acquire) };
            unsafe { drop(Box::from_raw(epoch)) };
            epoch = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::LeafBase;
    use crate::types::{Key, INVALID_NODE_ID};

    fn dummy_page() -> *mut Page<u64, u64> {
        Page::LeafBase(LeafBase {
            lbound: Key::NegInf,
            ubound: Key::PosInf,
            next: INVALID_NODE_ID,
            items: Vec::new(),
        })
        .into_heap()
    }

    #[test]
    fn pinned_epoch_is_not_reclaimed() {
        let mgr: EpochManager<u64, u64> = EpochManager::new();

        let guard = mgr.enter();
        mgr.retire(dummy_page());

        mgr.advance();
        mgr.collect();
        assert_eq!(mgr.freed_pages(), 0);

        drop(guard);
        mgr.advance();
        mgr.collect();
        assert_eq!(mgr.freed_pages(), 1);
    }

    #[test]
    fn a_pinned_old_epoch_blocks_newer_ones() {
        let mgr: EpochManager<u64, u64> = EpochManager::new();

        let old_guard = mgr.enter();
        mgr.retire(dummy_page());
        mgr.advance();

        // Garbage lands in the new current epoch while an old pin persists.
        mgr.retire(dummy_page());
        mgr.advance();
        mgr.collect();
        assert_eq!(mgr.freed_pages(), 0);

        drop(old_guard);
        mgr.collect();
        assert_eq!(mgr.freed_pages(), 2);
    }

    #[test]
    fn final_drain_frees_everything() {
        let freed = {
            let mgr: EpochManager<u64, u64> = EpochManager::new();
            mgr.retire(dummy_page());
            mgr.retire(dummy_page());
            // Dropped with garbage still parked; Drop must sweep it.
            mgr
        };
        drop(freed);
    }
}
