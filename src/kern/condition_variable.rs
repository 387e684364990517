//! Guest mutexes and condition variables
//!
//! Guest lock words hold the owner's handle, with `HANDLE_WAIT_MASK` set while other threads
//! wait. Contended threads block as waiters of the owner thread, keyed by the lock word address.
//! Condition variable waiters sit in the process tree keyed by the condition variable address;
//! signalling moves them back onto the lock word, either taking it or queueing behind its owner.

use alloc::sync::Arc;

use log::debug;

use crate::kern::handle_table::KHandleTable;
use crate::kern::kernel::KernelCore;
use crate::kern::lock::{KScopedSchedulerLock, KScopedSchedulerLockAndSleep};
use crate::kern::thread::{KThread, ThreadWaitReasonForDebugging};
use crate::kern::thread_queue::{ThreadQueue, WaitStatus};
use crate::kern::thread_tree::KThreadTree;
use crate::result::{KResult, KernelError};
use crate::types::{AddressKey, Handle, VAddr, HANDLE_WAIT_MASK};

/// Process-wide condition variable state
#[derive(Debug, Default)]
pub struct KConditionVariable {
    tree: Arc<KThreadTree>,
}

impl KConditionVariable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tree(&self) -> &Arc<KThreadTree> {
        &self.tree
    }

    /// Release the guest lock at `addr` held by `cur`
    pub fn signal_to_address(&self, kernel: &KernelCore, cur: &Arc<KThread>, addr: VAddr) -> KResult<()> {
        let _sl = KScopedSchedulerLock::new(kernel);

        let (next_owner, num_waiters) = cur.remove_waiter_by_key(kernel, AddressKey::User(addr));

        let mut next_value = 0;
        if let Some(next_owner) = &next_owner {
            next_value = next_owner.address_key_value();
            if num_waiters > 1 {
                next_value |= HANDLE_WAIT_MASK;
            }
        }

        let result = kernel.write_to_user32(addr, next_value);
        if let Some(next_owner) = &next_owner {
            next_owner.end_wait(kernel, result);
        }
        result
    }

    /// Block `cur` until the owner named by `handle` releases the lock at `addr`
    ///
    /// Returns at once if the word no longer reads `handle | HANDLE_WAIT_MASK`.
    pub fn wait_for_address(
        &self,
        kernel: &KernelCore,
        cur: &Arc<KThread>,
        handle_table: &KHandleTable,
        handle: Handle,
        addr: VAddr,
        value: u32,
    ) -> KResult<WaitStatus<()>> {
        let _sl = KScopedSchedulerLock::new(kernel);

        if cur.is_termination_requested() {
            return Err(KernelError::TerminationRequested);
        }

        let test_tag = kernel.read_from_user32(addr)?;
        if test_tag != (handle | HANDLE_WAIT_MASK) {
            return Ok(WaitStatus::Done(()));
        }

        let owner = handle_table
            .get_object_without_pseudo_handle(handle)
            .and_then(|object| object.as_thread().cloned())
            .ok_or(KernelError::InvalidHandle)?;

        cur.set_user_address_key(addr, value);
        owner.add_waiter(kernel, cur);
        cur.begin_wait(kernel, ThreadQueue::LockOwner);
        cur.set_wait_reason_for_debugging(ThreadWaitReasonForDebugging::ConditionVar);
        debug!(
            "thread {} waits for lock {:#x} owned by thread {}",
            cur.id().0,
            addr,
            owner.id().0
        );
        Ok(WaitStatus::Blocked)
    }

    /// Hand the lock word of a signalled waiter to it, or queue it behind the owner
    fn signal_impl(kernel: &KernelCore, cur: &KThread, handle_table: &KHandleTable, thread: &Arc<KThread>) {
        let AddressKey::User(addr) = thread.address_key() else {
            thread.end_wait(kernel, Err(KernelError::InvalidState));
            return;
        };
        let own_tag = thread.address_key_value();

        let prev_tag = match Self::update_lock_atomic(kernel, cur, addr, own_tag, HANDLE_WAIT_MASK) {
            Ok(prev_tag) => prev_tag,
            Err(err) => {
                thread.end_wait(kernel, Err(err));
                return;
            }
        };

        if prev_tag == 0 {
            thread.end_wait(kernel, Ok(()));
            return;
        }

        let owner = handle_table
            .get_object_without_pseudo_handle(prev_tag & !HANDLE_WAIT_MASK)
            .and_then(|object| object.as_thread().cloned());
        match owner {
            Some(owner) => owner.add_waiter(kernel, thread),
            None => thread.end_wait(kernel, Err(KernelError::InvalidState)),
        }
    }

    /// Store `if_zero` into a free lock word, or set `orr_mask` on a held one; returns the old word
    fn update_lock_atomic(
        kernel: &KernelCore,
        cur: &KThread,
        addr: VAddr,
        if_zero: u32,
        orr_mask: u32,
    ) -> KResult<u32> {
        if !kernel.memory().is_valid_virtual_address_range(addr, 4) {
            return Err(KernelError::InvalidCurrentMemory);
        }
        let monitor = kernel.exclusive_monitor();
        let core = cur.current_core().max(0) as usize;
        loop {
            let expected = monitor.exclusive_read32(core, addr);
            let new_value = if expected == 0 {
                if_zero
            } else {
                expected | orr_mask
            };
            if monitor.exclusive_write32(core, addr, new_value) {
                return Ok(expected);
            }
        }
    }

    /// Wake up to `count` waiters on `cv_key` (all if `count <= 0`)
    pub fn signal(
        &self,
        kernel: &KernelCore,
        cur: &Arc<KThread>,
        handle_table: &KHandleTable,
        cv_key: u64,
        count: i32,
    ) {
        let _sl = KScopedSchedulerLock::new(kernel);

        let mut num_waiters = 0;
        while count <= 0 || num_waiters < count {
            let Some(thread) = self.tree.pop_front(cv_key) else {
                break;
            };
            Self::signal_impl(kernel, cur, handle_table, &thread);
            num_waiters += 1;
        }

        if self.tree.front(cv_key).is_none() {
            // Best effort: the key word is only a hint for the guest.
            let _ = kernel.write_to_user32(cv_key, 0);
        }
        debug!("condition variable {:#x} signalled {} waiters", cv_key, num_waiters);
    }

    /// Release the lock at `addr` and wait on the condition variable at `key`
    ///
    /// A zero timeout releases the lock and reports `TimedOut` without waiting.
    pub fn wait(
        &self,
        kernel: &KernelCore,
        cur: &Arc<KThread>,
        addr: VAddr,
        key: u64,
        value: u32,
        timeout_ns: i64,
    ) -> KResult<WaitStatus<()>> {
        let mut slp = KScopedSchedulerLockAndSleep::new(kernel, cur, timeout_ns);

        if cur.is_termination_requested() {
            slp.cancel_sleep();
            return Err(KernelError::TerminationRequested);
        }

        let (next_owner, num_waiters) = cur.remove_waiter_by_key(kernel, AddressKey::User(addr));
        let mut next_value = 0;
        if let Some(next_owner) = &next_owner {
            next_value = next_owner.address_key_value();
            if num_waiters > 1 {
                next_value |= HANDLE_WAIT_MASK;
            }
            next_owner.end_wait(kernel, Ok(()));
        }

        // Best effort, as in `signal`.
        let _ = kernel.write_to_user32(key, 1);

        if let Err(err) = kernel.write_to_user32(addr, next_value) {
            slp.cancel_sleep();
            return Err(err);
        }

        if timeout_ns == 0 {
            return Err(KernelError::TimedOut);
        }

        cur.set_user_address_key(addr, value);
        self.tree.insert(key, cur);
        cur.begin_wait(kernel, ThreadQueue::ConditionVariable(Arc::clone(&self.tree)));
        cur.set_wait_reason_for_debugging(ThreadWaitReasonForDebugging::ConditionVar);
        Ok(WaitStatus::Blocked)
    }
}
