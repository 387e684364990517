//! Ordered waiter sets for address arbiters and condition variables
//!
//! Waiters are ordered by (key, priority, arrival). The first entry for a key is therefore the
//! highest-priority, longest-waiting thread on that key, and walking forward from it yields the
//! wake order. A thread records the [`TreeKey`] it was inserted under so it can be removed or
//! re-keyed after a priority change without a search.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use log::error;
use spin::Mutex;

use crate::kern::thread::KThread;

/// Position of a waiter in a [`KThreadTree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TreeKey {
    /// Guest address (arbiter) or condition variable key
    pub key: u64,
    /// Thread priority at insertion time
    pub priority: i32,
    /// Arrival order
    pub seq: u64,
}

impl TreeKey {
    /// Smallest possible position for `key`
    const fn lower_bound(key: u64) -> Self {
        Self {
            key,
            priority: i32::MIN,
            seq: 0,
        }
    }
}

/// A set of waiting threads keyed by address
#[derive(Debug, Default)]
pub struct KThreadTree {
    entries: Mutex<BTreeMap<TreeKey, Arc<KThread>>>,
    next_seq: AtomicU64,
}

impl KThreadTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `thread` under `key` and record the position in the thread
    pub fn insert(self: &Arc<Self>, key: u64, thread: &Arc<KThread>) -> TreeKey {
        let slot = TreeKey {
            key,
            priority: thread.priority(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        self.entries.lock().insert(slot, Arc::clone(thread));
        thread.set_tree_slot(Some((Arc::clone(self), slot)));
        slot
    }

    /// Remove the waiter at `slot`
    ///
    /// The caller has already detached the slot from the thread. A missing slot means a thread
    /// and the tree disagree about membership, which is unrecoverable.
    pub fn remove(&self, slot: TreeKey) -> Arc<KThread> {
        match self.entries.lock().remove(&slot) {
            Some(thread) => thread,
            None => {
                error!("waiter tree inconsistency: no waiter at {:?}", slot);
                panic!("waiter tree inconsistency");
            }
        }
    }

    /// Move the waiter at `slot` to its new priority, keeping its arrival order
    pub fn update_priority(&self, slot: TreeKey, priority: i32) -> TreeKey {
        let thread = self.remove(slot);
        let new_slot = TreeKey { priority, ..slot };
        self.entries.lock().insert(new_slot, thread);
        new_slot
    }

    /// First waiter on `key`
    pub fn front(&self, key: u64) -> Option<Arc<KThread>> {
        self.entries
            .lock()
            .range(TreeKey::lower_bound(key)..)
            .next()
            .filter(|(slot, _)| slot.key == key)
            .map(|(_, thread)| Arc::clone(thread))
    }

    /// Detach and return the first waiter on `key`
    pub fn pop_front(&self, key: u64) -> Option<Arc<KThread>> {
        let thread = {
            let mut entries = self.entries.lock();
            let slot = entries
                .range(TreeKey::lower_bound(key)..)
                .next()
                .map(|(slot, _)| *slot)
                .filter(|slot| slot.key == key)?;
            entries.remove(&slot)?
        };
        thread.set_tree_slot(None);
        Some(thread)
    }

    /// Number of waiters on `key`, counting at most `limit`
    pub fn count_at(&self, key: u64, limit: usize) -> usize {
        self.entries
            .lock()
            .range(TreeKey::lower_bound(key)..)
            .take_while(|(slot, _)| slot.key == key)
            .take(limit)
            .count()
    }

    /// All waiters on `key` in wake order
    pub fn waiters_at(&self, key: u64) -> Vec<Arc<KThread>> {
        self.entries
            .lock()
            .range(TreeKey::lower_bound(key)..)
            .take_while(|(slot, _)| slot.key == key)
            .map(|(_, thread)| Arc::clone(thread))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::thread::KThread;
    use crate::types::ThreadId;

    fn thread(id: u64, priority: i32) -> Arc<KThread> {
        KThread::new_detached(ThreadId(id), priority, 0, 0b1)
    }

    #[test]
    fn test_priority_then_arrival_order() {
        let tree = Arc::new(KThreadTree::new());
        let low = thread(1, 30);
        let high = thread(2, 10);
        let high_late = thread(3, 10);
        tree.insert(0x100, &low);
        tree.insert(0x100, &high);
        tree.insert(0x100, &high_late);
        tree.insert(0x200, &thread(4, 0));

        let order: Vec<u64> = tree
            .waiters_at(0x100)
            .iter()
            .map(|t| t.id().0)
            .collect();
        assert_eq!(order, vec![2, 3, 1]);
        assert_eq!(tree.count_at(0x100, 2), 2);
        assert_eq!(tree.count_at(0x300, 8), 0);
    }

    #[test]
    fn test_pop_front_clears_slot() {
        let tree = Arc::new(KThreadTree::new());
        let t = thread(1, 20);
        tree.insert(0x40, &t);
        assert!(t.tree_slot().is_some());
        let popped = tree.pop_front(0x40);
        assert!(popped.is_some_and(|p| Arc::ptr_eq(&p, &t)));
        assert!(t.tree_slot().is_none());
        assert!(tree.is_empty());
        assert!(tree.pop_front(0x40).is_none());
    }

    #[test]
    fn test_update_priority_keeps_arrival() {
        let tree = Arc::new(KThreadTree::new());
        let a = thread(1, 20);
        let b = thread(2, 20);
        let slot_a = tree.insert(0x10, &a);
        tree.insert(0x10, &b);
        tree.update_priority(slot_a, 25);
        let front = tree.front(0x10);
        assert!(front.is_some_and(|f| Arc::ptr_eq(&f, &b)));
    }

    #[test]
    #[should_panic(expected = "waiter tree inconsistency")]
    fn test_remove_missing_slot_panics() {
        let tree = KThreadTree::new();
        tree.remove(TreeKey {
            key: 1,
            priority: 1,
            seq: 99,
        });
    }
}
