//! Adaptive kernel lock
//!
//! The tag word holds the owner's thread id shifted left by one, with bit 0 set while other
//! threads wait. Uncontended lock and unlock are a single compare-and-swap; contention falls back
//! to the scheduler lock, registering the caller as a kernel-keyed waiter of the owner so the
//! owner inherits its priority and cannot be suspended until it lets go.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use log::error;

use crate::kern::kernel::KernelCore;
use crate::kern::lock::KScopedSchedulerLock;
use crate::kern::thread::{KThread, ThreadState};
use crate::kern::thread_queue::{ThreadQueue, WaitStatus};
use crate::types::{AddressKey, ThreadId};

const WAITERS_BIT: u64 = 1;

/// Kernel mutex with owner priority inheritance
#[derive(Debug)]
pub struct KLightLock {
    tag: AtomicU64,
    key: u64,
}

impl KLightLock {
    pub fn new(kernel: &KernelCore) -> Self {
        Self {
            tag: AtomicU64::new(0),
            key: kernel.next_kernel_key(),
        }
    }

    fn tag_of(thread: &KThread) -> u64 {
        thread.id().0 << 1
    }

    /// Acquire the lock for `cur`
    ///
    /// Returns `Blocked` when `cur` now waits for the owner; it holds the lock once it runs again.
    pub fn lock(&self, kernel: &KernelCore, cur: &Arc<KThread>) -> WaitStatus<()> {
        let cur_tag = Self::tag_of(cur);
        loop {
            let mut old_tag = self.tag.load(Ordering::Relaxed);
            loop {
                let new_tag = if old_tag == 0 {
                    cur_tag
                } else {
                    old_tag | WAITERS_BIT
                };
                match self.tag.compare_exchange_weak(
                    old_tag,
                    new_tag,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => old_tag = actual,
                }
            }

            if old_tag == 0 {
                return WaitStatus::Done(());
            }
            if self.lock_slow_path(kernel, old_tag | WAITERS_BIT, cur) {
                return WaitStatus::Blocked;
            }
        }
    }

    fn lock_slow_path(&self, kernel: &KernelCore, owner_tag: u64, cur: &Arc<KThread>) -> bool {
        let _sl = KScopedSchedulerLock::new(kernel);

        if self.tag.load(Ordering::Relaxed) != owner_tag {
            return false;
        }

        let owner_id = ThreadId(owner_tag >> 1);
        let owner = match kernel.thread_by_id(owner_id) {
            Some(owner) if owner.state() != ThreadState::Terminated => owner,
            _ => {
                error!(
                    "thread {} acquiring a kernel lock held by terminated thread {}",
                    cur.id().0,
                    owner_id.0
                );
                panic!("kernel lock owned by a terminated thread");
            }
        };

        cur.set_kernel_address_key(self.key);
        owner.add_waiter(kernel, cur);
        cur.begin_wait(kernel, ThreadQueue::LockOwner);

        if owner.is_suspended() {
            owner.continue_if_has_kernel_waiters(kernel);
        }
        true
    }

    /// Release the lock held by `cur`, handing it to the best waiter
    pub fn unlock(&self, kernel: &KernelCore, cur: &Arc<KThread>) {
        let cur_tag = Self::tag_of(cur);
        if self
            .tag
            .compare_exchange(cur_tag, 0, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            self.unlock_slow_path(kernel, cur);
        }
    }

    fn unlock_slow_path(&self, kernel: &KernelCore, cur: &Arc<KThread>) {
        let _sl = KScopedSchedulerLock::new(kernel);

        let (next_owner, num_waiters) = cur.remove_waiter_by_key(kernel, AddressKey::Kernel(self.key));

        let mut next_tag = 0;
        if let Some(next_owner) = &next_owner {
            next_tag = Self::tag_of(next_owner) | u64::from(num_waiters > 1);
            next_owner.end_wait(kernel, Ok(()));
            if next_owner.is_suspended() {
                next_owner.continue_if_has_kernel_waiters(kernel);
            }
        }

        // A suspension deferred while holding kernel waiters takes effect now.
        if cur.is_suspended() {
            cur.try_suspend(kernel);
        }

        self.tag.store(next_tag, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.tag.load(Ordering::Relaxed) != 0
    }

    pub fn is_locked_by_current_thread(&self, cur: &KThread) -> bool {
        self.tag.load(Ordering::Relaxed) & !WAITERS_BIT == Self::tag_of(cur)
    }

    /// Thread id of the owner, if locked
    pub fn owner_id(&self) -> Option<ThreadId> {
        let tag = self.tag.load(Ordering::Relaxed);
        (tag != 0).then_some(ThreadId(tag >> 1))
    }
}
