//! Scheduler locking
//!
//! Contents:
//! - A spin lock the scheduler lock is built on
//! - The global scheduler lock: a recursive critical section whose final release recomputes the
//!   per-core scheduling decisions and triggers the context switches they require
//! - Scoped guards for both, including the "lock and sleep" guard that arms a thread's timeout
//!   just before the scheduler lock is dropped
//!
//! The scheduler lock is the single serialization point of the kernel. Its recursion is
//! implemented in the type (owner tag + count) over the spin lock rather than with a reentrant
//! host mutex.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::kern::kernel::KernelCore;
use crate::kern::scheduler::KScheduler;
use crate::kern::thread::KThread;

// ============================================================================
// Spin lock
// ============================================================================

/// Test-and-test-and-set lock underneath the recursive scheduler lock
pub struct KSpinLock {
    held: AtomicBool,
}

impl core::fmt::Debug for KSpinLock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "KSpinLock({})", if self.is_locked() { "held" } else { "free" })
    }
}

impl KSpinLock {
    /// Create an unheld lock
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// Spin until the lock is taken
    pub fn lock(&self) {
        loop {
            if self.try_lock() {
                return;
            }
            while self.held.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Release the lock
    pub fn unlock(&self) {
        self.held.store(false, Ordering::Release);
    }

    /// Take the lock if it is free
    pub fn try_lock(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Whether the lock is currently held
    pub fn is_locked(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }
}

impl Default for KSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Host thread identity
// ============================================================================

static NEXT_HOST_THREAD_TAG: AtomicU64 = AtomicU64::new(1);

std::thread_local! {
    static HOST_THREAD_TAG: u64 = NEXT_HOST_THREAD_TAG.fetch_add(1, Ordering::Relaxed);
}

/// Non-zero tag identifying the calling host thread
pub fn current_host_thread_tag() -> u64 {
    HOST_THREAD_TAG.with(|tag| *tag)
}

// ============================================================================
// Scheduler Lock
// ============================================================================

/// Recursive global scheduler lock
///
/// `lock_count` is only touched by the owning host thread.
#[derive(Debug)]
pub struct KSchedulerLock {
    spin_lock: KSpinLock,
    owner: AtomicU64,
    lock_count: AtomicU32,
}

impl KSchedulerLock {
    /// Create an unowned lock
    pub const fn new() -> Self {
        Self {
            spin_lock: KSpinLock::new(),
            owner: AtomicU64::new(0),
            lock_count: AtomicU32::new(0),
        }
    }

    /// Whether the calling host thread holds the lock
    pub fn is_locked_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Acquire) == current_host_thread_tag()
    }

    /// Whether any host thread holds the lock
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Acquire) != 0
    }

    /// Current recursion depth (only meaningful for the owner)
    pub fn lock_count(&self) -> u32 {
        self.lock_count.load(Ordering::Relaxed)
    }

    /// Take the lock, or deepen the recursion when this host thread already owns it
    pub fn lock(&self, kernel: &KernelCore) {
        if self.is_locked_by_current_thread() {
            self.lock_count.fetch_add(1, Ordering::Relaxed);
            return;
        }

        KScheduler::disable_scheduling(kernel);
        self.spin_lock.lock();
        debug_assert_eq!(self.lock_count.load(Ordering::Relaxed), 0);
        self.owner
            .store(current_host_thread_tag(), Ordering::Release);
        self.lock_count.store(1, Ordering::Relaxed);
    }

    /// Drop one recursion level; the last release updates the schedule and switches cores
    pub fn unlock(&self, kernel: &KernelCore) {
        assert!(
            self.is_locked_by_current_thread(),
            "scheduler lock released by a host thread that does not own it"
        );
        let remaining = self.lock_count.fetch_sub(1, Ordering::Relaxed) - 1;
        if remaining != 0 {
            return;
        }

        // Decide once, for every mutation made while the kernel was held.
        let cores_needing_scheduling = KScheduler::update_highest_priority_threads(kernel);

        self.owner.store(0, Ordering::Release);
        self.spin_lock.unlock();

        KScheduler::enable_scheduling(kernel, cores_needing_scheduling);
    }
}

impl Default for KSchedulerLock {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Scoped guards
// ============================================================================

/// Holds the global scheduler lock for the guard's lifetime
#[must_use]
pub struct KScopedSchedulerLock<'a> {
    kernel: &'a KernelCore,
}

impl<'a> KScopedSchedulerLock<'a> {
    /// Take the scheduler lock until the guard drops
    pub fn new(kernel: &'a KernelCore) -> Self {
        kernel.scheduler_lock().lock(kernel);
        Self { kernel }
    }
}

impl Drop for KScopedSchedulerLock<'_> {
    fn drop(&mut self) {
        self.kernel.scheduler_lock().unlock(self.kernel);
    }
}

/// Holds the scheduler lock and, on release, arms `thread`'s timeout
///
/// A positive timeout is registered with the timeout manager while the lock is still held, so
/// the timer can never observe the thread before it is fully waiting. Zero or negative
/// timeouts, or a cancelled sleep, register nothing.
#[must_use]
pub struct KScopedSchedulerLockAndSleep<'a> {
    kernel: &'a KernelCore,
    thread: Arc<KThread>,
    timeout_ns: i64,
}

impl<'a> KScopedSchedulerLockAndSleep<'a> {
    /// Take the scheduler lock; `timeout_ns` is armed for `thread` on release
    pub fn new(kernel: &'a KernelCore, thread: &Arc<KThread>, timeout_ns: i64) -> Self {
        kernel.scheduler_lock().lock(kernel);
        Self {
            kernel,
            thread: Arc::clone(thread),
            timeout_ns,
        }
    }

    /// Do not arm the timeout when the guard is dropped
    pub fn cancel_sleep(&mut self) {
        self.timeout_ns = 0;
    }
}

impl Drop for KScopedSchedulerLockAndSleep<'_> {
    fn drop(&mut self) {
        if self.timeout_ns > 0 {
            self.kernel
                .timeout_manager()
                .schedule(&self.thread, self.timeout_ns);
        }
        self.kernel.scheduler_lock().unlock(self.kernel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spin_lock() {
        let lock = KSpinLock::new();
        assert!(!lock.is_locked());
        lock.lock();
        assert!(lock.is_locked());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn test_host_thread_tags_differ() {
        let here = current_host_thread_tag();
        let there = std::thread::spawn(current_host_thread_tag)
            .join()
            .unwrap();
        assert_ne!(here, 0);
        assert_ne!(here, there);
        assert_eq!(here, current_host_thread_tag());
    }
}
