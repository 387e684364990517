//! Kernel Timers - Clocks and thread timeouts
//!
//! The timeout manager keeps one pending deadline per waiting thread. The frontend drives it:
//! after advancing its clock it calls [`TimeoutManager::process_expired`] (usually through
//! [`crate::kern::KernelCore::process_timeouts`]), which cancels the wait of every thread whose
//! deadline has passed with `TimedOut`.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use log::trace;
use spin::Mutex;

use crate::kern::kernel::KernelCore;
use crate::kern::lock::KScopedSchedulerLock;
use crate::kern::thread::KThread;
use crate::types::ThreadId;

// ============================================================================
// Clocks
// ============================================================================

/// Monotonic time source in nanoseconds
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> i64;
}

/// Host monotonic clock
#[derive(Debug)]
pub struct SteadyClock {
    origin: Instant,
}

impl SteadyClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SteadyClock {
    fn now_ns(&self) -> i64 {
        i64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ns: i64) {
        self.now.fetch_add(ns, Ordering::AcqRel);
    }

    pub fn set(&self, ns: i64) {
        self.now.store(ns, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> i64 {
        self.now.load(Ordering::Acquire)
    }
}

// ============================================================================
// Timeout Manager
// ============================================================================

#[derive(Default)]
struct TimerQueue {
    /// Pending wakes ordered by (deadline, registration order)
    by_deadline: BTreeMap<(i64, u64), Arc<KThread>>,
    by_thread: BTreeMap<ThreadId, (i64, u64)>,
    next_seq: u64,
}

/// Pending thread timeouts
pub struct TimeoutManager {
    clock: Arc<dyn Clock>,
    queue: Mutex<TimerQueue>,
}

impl core::fmt::Debug for TimeoutManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TimeoutManager")
            .field("now_ns", &self.now_ns())
            .field("pending", &self.pending())
            .finish()
    }
}

impl TimeoutManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            queue: Mutex::new(TimerQueue::default()),
        }
    }

    pub fn now_ns(&self) -> i64 {
        self.clock.now_ns()
    }

    /// Wake `thread` with a timeout `timeout_ns` from now, replacing any pending one
    pub fn schedule(&self, thread: &Arc<KThread>, timeout_ns: i64) {
        let deadline = self.now_ns().saturating_add(timeout_ns);
        let mut queue = self.queue.lock();
        if let Some(old) = queue.by_thread.remove(&thread.id()) {
            queue.by_deadline.remove(&old);
        }
        let key = (deadline, queue.next_seq);
        queue.next_seq += 1;
        queue.by_deadline.insert(key, Arc::clone(thread));
        queue.by_thread.insert(thread.id(), key);
        trace!("timeout for thread {} at {}ns", thread.id().0, deadline);
    }

    /// Drop the pending timeout of `thread`, if any
    pub fn unschedule(&self, thread: ThreadId) {
        let mut queue = self.queue.lock();
        if let Some(key) = queue.by_thread.remove(&thread) {
            queue.by_deadline.remove(&key);
        }
    }

    pub fn is_scheduled(&self, thread: ThreadId) -> bool {
        self.queue.lock().by_thread.contains_key(&thread)
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<i64> {
        self.queue
            .lock()
            .by_deadline
            .keys()
            .next()
            .map(|(deadline, _)| *deadline)
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().by_deadline.len()
    }

    /// Fire every timeout whose deadline has passed; returns how many fired
    pub fn process_expired(&self, kernel: &KernelCore) -> usize {
        let _sl = KScopedSchedulerLock::new(kernel);
        let now = self.now_ns();

        let expired: alloc::vec::Vec<Arc<KThread>> = {
            let mut queue = self.queue.lock();
            let mut expired = alloc::vec::Vec::new();
            while let Some((&key, _)) = queue.by_deadline.first_key_value() {
                if key.0 > now {
                    break;
                }
                if let Some(thread) = queue.by_deadline.remove(&key) {
                    queue.by_thread.remove(&thread.id());
                    expired.push(thread);
                }
            }
            expired
        };

        for thread in &expired {
            trace!("timeout fired for thread {}", thread.id().0);
            thread.on_timer(kernel);
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new();
        assert_eq!(clock.now_ns(), 0);
        clock.advance(150);
        assert_eq!(clock.now_ns(), 150);
        clock.set(10);
        assert_eq!(clock.now_ns(), 10);
    }

    #[test]
    fn test_steady_clock_is_monotonic() {
        let clock = SteadyClock::new();
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_schedule_replaces_and_unschedules() {
        let clock = Arc::new(ManualClock::new());
        let manager = TimeoutManager::new(clock.clone());
        let t = KThread::new_detached(ThreadId(1), 20, 0, 0b1);

        manager.schedule(&t, 500);
        manager.schedule(&t, 100);
        assert_eq!(manager.pending(), 1);
        assert_eq!(manager.next_deadline(), Some(100));
        assert!(manager.is_scheduled(t.id()));

        manager.unschedule(t.id());
        assert_eq!(manager.pending(), 0);
        assert_eq!(manager.next_deadline(), None);
    }

    #[test]
    fn test_deadline_saturates() {
        let clock = Arc::new(ManualClock::new());
        clock.set(10);
        let manager = TimeoutManager::new(clock);
        let t = KThread::new_detached(ThreadId(2), 20, 0, 0b1);
        manager.schedule(&t, i64::MAX);
        assert_eq!(manager.next_deadline(), Some(i64::MAX));
    }
}
