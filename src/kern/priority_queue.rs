//! Scheduler Priority Queue
//!
//! Every runnable thread is queued once per core in its affinity mask: in the *scheduled* queue
//! of its active core and in the *suggested* queue of every other allowed core. Suggested
//! entries are what idle cores and yielding threads migrate from.
//!
//! ## Priority Levels
//!
//! Guest priorities 0 (highest) to 63 (lowest) are queued. The idle priority (64) and the dummy
//! priority (65) are never queued.
//!
//! ## Bitmap Optimization
//!
//! A 64-bit bitmap per core tracks which levels hold threads, so the highest runnable level is
//! found with a single leading-zero count.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use crate::kern::affinity::KAffinityMask;
use crate::kern::thread::KThread;
use crate::types::{HIGHEST_THREAD_PRIORITY, LOWEST_THREAD_PRIORITY, NUM_CPU_CORES};

// ============================================================================
// Constants
// ============================================================================

/// Number of queued priority levels
pub const NUM_PRIORITY_LEVELS: usize = (LOWEST_THREAD_PRIORITY - HIGHEST_THREAD_PRIORITY + 1) as usize;

const fn is_valid_priority(priority: i32) -> bool {
    HIGHEST_THREAD_PRIORITY <= priority && priority <= LOWEST_THREAD_PRIORITY
}

const fn is_valid_core(core: i32) -> bool {
    core >= 0 && (core as usize) < NUM_CPU_CORES
}

// ============================================================================
// Per-core queue
// ============================================================================

/// One FIFO per (core, priority) plus the per-core bitmap of non-empty levels
#[derive(Debug)]
struct KPerCoreQueue {
    queues: [[VecDeque<Arc<KThread>>; NUM_PRIORITY_LEVELS]; NUM_CPU_CORES],
    /// Bit `63 - priority` is set while that level is non-empty
    available_priorities: [u64; NUM_CPU_CORES],
}

impl KPerCoreQueue {
    fn new() -> Self {
        Self {
            queues: core::array::from_fn(|_| core::array::from_fn(|_| VecDeque::new())),
            available_priorities: [0; NUM_CPU_CORES],
        }
    }

    fn level(&self, priority: i32, core: i32) -> &VecDeque<Arc<KThread>> {
        &self.queues[core as usize][priority as usize]
    }

    fn level_mut(&mut self, priority: i32, core: i32) -> &mut VecDeque<Arc<KThread>> {
        &mut self.queues[core as usize][priority as usize]
    }

    fn set_bitmap_bit(&mut self, priority: i32, core: i32) {
        self.available_priorities[core as usize] |= 1u64 << (63 - priority);
    }

    fn clear_bitmap_bit(&mut self, priority: i32, core: i32) {
        self.available_priorities[core as usize] &= !(1u64 << (63 - priority));
    }

    /// Highest non-empty level on `core`
    fn highest_priority(&self, core: i32) -> Option<i32> {
        let bitmap = self.available_priorities[core as usize];
        (bitmap != 0).then(|| bitmap.leading_zeros() as i32)
    }

    /// Highest non-empty level strictly below `priority` on `core`
    fn next_priority(&self, core: i32, priority: i32) -> Option<i32> {
        let below = (1u64 << (63 - priority)) - 1;
        let bitmap = self.available_priorities[core as usize] & below;
        (bitmap != 0).then(|| bitmap.leading_zeros() as i32)
    }

    fn push_back(&mut self, priority: i32, core: i32, thread: &Arc<KThread>) {
        if !is_valid_priority(priority) || !is_valid_core(core) {
            return;
        }
        self.level_mut(priority, core).push_back(Arc::clone(thread));
        self.set_bitmap_bit(priority, core);
    }

    fn push_front(&mut self, priority: i32, core: i32, thread: &Arc<KThread>) {
        if !is_valid_priority(priority) || !is_valid_core(core) {
            return;
        }
        self.level_mut(priority, core).push_front(Arc::clone(thread));
        self.set_bitmap_bit(priority, core);
    }

    fn remove(&mut self, priority: i32, core: i32, thread: &Arc<KThread>) -> bool {
        if !is_valid_priority(priority) || !is_valid_core(core) {
            return false;
        }
        let level = self.level_mut(priority, core);
        let Some(pos) = level.iter().position(|t| Arc::ptr_eq(t, thread)) else {
            return false;
        };
        level.remove(pos);
        if level.is_empty() {
            self.clear_bitmap_bit(priority, core);
        }
        true
    }

    fn front(&self, core: i32) -> Option<Arc<KThread>> {
        if !is_valid_core(core) {
            return None;
        }
        let priority = self.highest_priority(core)?;
        self.level(priority, core).front().cloned()
    }

    fn front_at(&self, priority: i32, core: i32) -> Option<Arc<KThread>> {
        if !is_valid_priority(priority) || !is_valid_core(core) {
            return None;
        }
        self.level(priority, core).front().cloned()
    }

    /// Thread after `thread` at the same level on `core`
    fn same_level_next(&self, core: i32, thread: &Arc<KThread>) -> Option<Arc<KThread>> {
        let priority = thread.priority();
        if !is_valid_priority(priority) || !is_valid_core(core) {
            return None;
        }
        let level = self.level(priority, core);
        let pos = level.iter().position(|t| Arc::ptr_eq(t, thread))?;
        level.get(pos + 1).cloned()
    }

    /// Thread after `thread` on `core`, continuing into lower levels
    fn next(&self, core: i32, thread: &Arc<KThread>) -> Option<Arc<KThread>> {
        if let Some(next) = self.same_level_next(core, thread) {
            return Some(next);
        }
        let priority = self.next_priority(core, thread.priority())?;
        self.level(priority, core).front().cloned()
    }

    /// Rotate `thread` to the back of its level and return the new front
    fn move_to_back(&mut self, priority: i32, core: i32, thread: &Arc<KThread>) -> Option<Arc<KThread>> {
        if !self.remove(priority, core, thread) {
            return None;
        }
        self.push_back(priority, core, thread);
        self.front_at(priority, core)
    }
}

// ============================================================================
// Priority Queue
// ============================================================================

/// The global scheduled/suggested queue pair
#[derive(Debug)]
pub struct KPriorityQueue {
    scheduled: KPerCoreQueue,
    suggested: KPerCoreQueue,
}

impl KPriorityQueue {
    pub fn new() -> Self {
        Self {
            scheduled: KPerCoreQueue::new(),
            suggested: KPerCoreQueue::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Getters
    // ------------------------------------------------------------------------

    pub fn get_scheduled_front(&self, core: i32) -> Option<Arc<KThread>> {
        self.scheduled.front(core)
    }

    pub fn get_scheduled_front_at(&self, core: i32, priority: i32) -> Option<Arc<KThread>> {
        self.scheduled.front_at(priority, core)
    }

    pub fn get_suggested_front(&self, core: i32) -> Option<Arc<KThread>> {
        self.suggested.front(core)
    }

    pub fn get_suggested_front_at(&self, core: i32, priority: i32) -> Option<Arc<KThread>> {
        self.suggested.front_at(priority, core)
    }

    pub fn get_scheduled_next(&self, core: i32, thread: &Arc<KThread>) -> Option<Arc<KThread>> {
        self.scheduled.next(core, thread)
    }

    pub fn get_suggested_next(&self, core: i32, thread: &Arc<KThread>) -> Option<Arc<KThread>> {
        self.suggested.next(core, thread)
    }

    /// Next thread at the same level in whichever queue holds `thread` for `core`
    pub fn get_same_priority_next(&self, core: i32, thread: &Arc<KThread>) -> Option<Arc<KThread>> {
        if thread.active_core() == core {
            self.scheduled.same_level_next(core, thread)
        } else {
            self.suggested.same_level_next(core, thread)
        }
    }

    // ------------------------------------------------------------------------
    // Mutators
    // ------------------------------------------------------------------------

    pub fn push_back(&mut self, thread: &Arc<KThread>) {
        self.push_back_at(thread.priority(), thread);
    }

    pub fn push_front(&mut self, thread: &Arc<KThread>) {
        self.push_front_at(thread.priority(), thread);
    }

    pub fn remove(&mut self, thread: &Arc<KThread>) {
        self.remove_at(thread.priority(), thread);
    }

    /// Rotate `thread` to the back of its scheduled level; returns the level's new front
    pub fn move_to_scheduled_back(&mut self, thread: &Arc<KThread>) -> Option<Arc<KThread>> {
        self.scheduled
            .move_to_back(thread.priority(), thread.active_core(), thread)
    }

    /// Requeue `thread` after its priority changed from `prev_priority`
    ///
    /// A running thread goes to the front of its new level so it keeps running.
    pub fn change_priority(&mut self, prev_priority: i32, is_running: bool, thread: &Arc<KThread>) {
        self.remove_at(prev_priority, thread);
        let priority = thread.priority();
        if is_running {
            self.push_front_at(priority, thread);
        } else {
            self.push_back_at(priority, thread);
        }
    }

    /// Requeue `thread` after its affinity mask (and possibly active core) changed
    pub fn change_affinity_mask(&mut self, prev_core: i32, prev_affinity: KAffinityMask, thread: &Arc<KThread>) {
        let priority = thread.priority();
        let new_affinity = thread.affinity_mask();
        let new_core = thread.active_core();

        for core in prev_affinity.cores() {
            if core == prev_core {
                self.scheduled.remove(priority, core, thread);
            } else {
                self.suggested.remove(priority, core, thread);
            }
        }

        for core in new_affinity.cores() {
            if core == new_core {
                self.scheduled.push_back(priority, core, thread);
            } else {
                self.suggested.push_back(priority, core, thread);
            }
        }
    }

    /// Move `thread` from `prev_core`'s scheduled queue to its new active core
    pub fn change_core(&mut self, prev_core: i32, thread: &Arc<KThread>, to_front: bool) {
        let new_core = thread.active_core();
        let priority = thread.priority();
        if prev_core == new_core {
            return;
        }

        if prev_core >= 0 {
            self.scheduled.remove(priority, prev_core, thread);
        }
        if new_core >= 0 {
            self.suggested.remove(priority, new_core, thread);
            if to_front {
                self.scheduled.push_front(priority, new_core, thread);
            } else {
                self.scheduled.push_back(priority, new_core, thread);
            }
        }
        if prev_core >= 0 {
            self.suggested.push_back(priority, prev_core, thread);
        }
    }

    fn push_back_at(&mut self, priority: i32, thread: &Arc<KThread>) {
        let mut affinity = thread.affinity_mask();
        let core = thread.active_core();
        if core >= 0 {
            self.scheduled.push_back(priority, core, thread);
            affinity.set_affinity(core, false);
        }
        for core in affinity.cores() {
            self.suggested.push_back(priority, core, thread);
        }
    }

    fn push_front_at(&mut self, priority: i32, thread: &Arc<KThread>) {
        let mut affinity = thread.affinity_mask();
        let core = thread.active_core();
        if core >= 0 {
            self.scheduled.push_front(priority, core, thread);
            affinity.set_affinity(core, false);
        }
        // Suggestions always go to the back.
        for core in affinity.cores() {
            self.suggested.push_back(priority, core, thread);
        }
    }

    fn remove_at(&mut self, priority: i32, thread: &Arc<KThread>) {
        let mut affinity = thread.affinity_mask();
        let core = thread.active_core();
        if core >= 0 {
            self.scheduled.remove(priority, core, thread);
            affinity.set_affinity(core, false);
        }
        for core in affinity.cores() {
            self.suggested.remove(priority, core, thread);
        }
    }
}
