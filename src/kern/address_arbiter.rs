//! Address arbiter
//!
//! Futex-style waits on guest words. Waiters sit in the process tree keyed by the word address;
//! signals wake them in priority order. The compare-and-update variants modify the word through
//! the exclusive monitor so they race correctly with guest atomics on other cores.

use alloc::sync::Arc;

use log::debug;

use crate::kern::kernel::KernelCore;
use crate::kern::lock::{KScopedSchedulerLock, KScopedSchedulerLockAndSleep};
use crate::kern::thread::{KThread, ThreadWaitReasonForDebugging};
use crate::kern::thread_queue::{ThreadQueue, WaitStatus};
use crate::kern::thread_tree::KThreadTree;
use crate::result::{KResult, KernelError};
use crate::types::VAddr;

/// Arbitration kinds a guest may wait with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ArbitrationType {
    WaitIfLessThan = 0,
    DecrementAndWaitIfLessThan = 1,
    WaitIfEqual = 2,
}

impl ArbitrationType {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(ArbitrationType::WaitIfLessThan),
            1 => Some(ArbitrationType::DecrementAndWaitIfLessThan),
            2 => Some(ArbitrationType::WaitIfEqual),
            _ => None,
        }
    }
}

/// Signal kinds a guest may signal with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SignalType {
    Signal = 0,
    SignalAndIncrementIfEqual = 1,
    SignalAndModifyByWaitingCountIfEqual = 2,
}

impl SignalType {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(SignalType::Signal),
            1 => Some(SignalType::SignalAndIncrementIfEqual),
            2 => Some(SignalType::SignalAndModifyByWaitingCountIfEqual),
            _ => None,
        }
    }
}

/// Process-wide address arbiter
#[derive(Debug, Default)]
pub struct KAddressArbiter {
    tree: Arc<KThreadTree>,
}

impl KAddressArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tree(&self) -> &Arc<KThreadTree> {
        &self.tree
    }

    pub fn signal_to_address(
        &self,
        kernel: &KernelCore,
        cur: &Arc<KThread>,
        addr: VAddr,
        signal_type: SignalType,
        value: i32,
        count: i32,
    ) -> KResult<()> {
        match signal_type {
            SignalType::Signal => self.signal(kernel, addr, count),
            SignalType::SignalAndIncrementIfEqual => {
                self.signal_and_increment_if_equal(kernel, cur, addr, value, count)
            }
            SignalType::SignalAndModifyByWaitingCountIfEqual => {
                self.signal_and_modify_by_waiting_count_if_equal(kernel, cur, addr, value, count)
            }
        }
    }

    pub fn wait_for_address(
        &self,
        kernel: &KernelCore,
        cur: &Arc<KThread>,
        addr: VAddr,
        arbitration_type: ArbitrationType,
        value: i32,
        timeout_ns: i64,
    ) -> KResult<WaitStatus<()>> {
        match arbitration_type {
            ArbitrationType::WaitIfLessThan => {
                self.wait_if_less_than(kernel, cur, addr, value, false, timeout_ns)
            }
            ArbitrationType::DecrementAndWaitIfLessThan => {
                self.wait_if_less_than(kernel, cur, addr, value, true, timeout_ns)
            }
            ArbitrationType::WaitIfEqual => self.wait_if_equal(kernel, cur, addr, value, timeout_ns),
        }
    }

    // ------------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------------

    /// Wake up to `count` waiters; the scheduler lock must be held
    fn wake_waiters(&self, kernel: &KernelCore, addr: VAddr, count: i32) -> i32 {
        let mut num_waiters = 0;
        while count <= 0 || num_waiters < count {
            let Some(thread) = self.tree.pop_front(addr) else {
                break;
            };
            thread.end_wait(kernel, Ok(()));
            num_waiters += 1;
        }
        debug!("arbiter {:#x} woke {} waiters", addr, num_waiters);
        num_waiters
    }

    /// Wake up to `count` waiters on `addr` (all if `count <= 0`)
    pub fn signal(&self, kernel: &KernelCore, addr: VAddr, count: i32) -> KResult<()> {
        let _sl = KScopedSchedulerLock::new(kernel);
        self.wake_waiters(kernel, addr, count);
        Ok(())
    }

    /// Increment the word if it holds `value`, then wake; `InvalidState` if it did not
    pub fn signal_and_increment_if_equal(
        &self,
        kernel: &KernelCore,
        cur: &Arc<KThread>,
        addr: VAddr,
        value: i32,
        count: i32,
    ) -> KResult<()> {
        let _sl = KScopedSchedulerLock::new(kernel);

        let user_value = update_if_equal(kernel, cur, addr, value, value.wrapping_add(1))?;
        if user_value != value {
            return Err(KernelError::InvalidState);
        }

        self.wake_waiters(kernel, addr, count);
        Ok(())
    }

    /// Adjust the word by how many waiters the signal leaves behind, then wake
    ///
    /// With `count <= 0` every waiter wakes and the word becomes `value - 2`, or `value + 1`
    /// when nobody waits. Otherwise at most `count + 2` waiters are walked: the word becomes
    /// `value - 1` when the signal drains the waiters, stays `value` when some remain, and becomes
    /// `value + 1` when nobody waits.
    pub fn signal_and_modify_by_waiting_count_if_equal(
        &self,
        kernel: &KernelCore,
        cur: &Arc<KThread>,
        addr: VAddr,
        value: i32,
        count: i32,
    ) -> KResult<()> {
        let _sl = KScopedSchedulerLock::new(kernel);

        let has_waiters = self.tree.front(addr).is_some();
        let new_value = if !has_waiters {
            value.wrapping_add(1)
        } else if count <= 0 {
            value.wrapping_sub(2)
        } else {
            let limit = (count as usize).saturating_add(2);
            let waiters_after_first = self.tree.count_at(addr, limit).saturating_sub(1);
            if waiters_after_first < count as usize {
                value.wrapping_sub(1)
            } else {
                value
            }
        };

        let user_value = if new_value != value {
            update_if_equal(kernel, cur, addr, value, new_value)?
        } else {
            kernel.read_from_user32(addr)? as i32
        };
        if user_value != value {
            return Err(KernelError::InvalidState);
        }

        self.wake_waiters(kernel, addr, count);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Waits
    // ------------------------------------------------------------------------

    /// Wait while the word is less than `value`, optionally decrementing it first
    pub fn wait_if_less_than(
        &self,
        kernel: &KernelCore,
        cur: &Arc<KThread>,
        addr: VAddr,
        value: i32,
        decrement: bool,
        timeout_ns: i64,
    ) -> KResult<WaitStatus<()>> {
        let mut slp = KScopedSchedulerLockAndSleep::new(kernel, cur, timeout_ns);

        if cur.is_termination_requested() {
            slp.cancel_sleep();
            return Err(KernelError::TerminationRequested);
        }

        let user_value = if decrement {
            decrement_if_less_than(kernel, cur, addr, value)
        } else {
            kernel.read_from_user32(addr).map(|v| v as i32)
        };
        let user_value = match user_value {
            Ok(user_value) => user_value,
            Err(err) => {
                slp.cancel_sleep();
                return Err(err);
            }
        };

        if user_value >= value {
            slp.cancel_sleep();
            return Err(KernelError::InvalidState);
        }

        if timeout_ns == 0 {
            slp.cancel_sleep();
            return Err(KernelError::TimedOut);
        }

        self.begin_arbitration_wait(kernel, cur, addr);
        Ok(WaitStatus::Blocked)
    }

    /// Wait while the word equals `value`
    pub fn wait_if_equal(
        &self,
        kernel: &KernelCore,
        cur: &Arc<KThread>,
        addr: VAddr,
        value: i32,
        timeout_ns: i64,
    ) -> KResult<WaitStatus<()>> {
        let mut slp = KScopedSchedulerLockAndSleep::new(kernel, cur, timeout_ns);

        if cur.is_termination_requested() {
            slp.cancel_sleep();
            return Err(KernelError::TerminationRequested);
        }

        let user_value = match kernel.read_from_user32(addr) {
            Ok(user_value) => user_value as i32,
            Err(err) => {
                slp.cancel_sleep();
                return Err(err);
            }
        };

        if user_value != value {
            slp.cancel_sleep();
            return Err(KernelError::InvalidState);
        }

        if timeout_ns == 0 {
            slp.cancel_sleep();
            return Err(KernelError::TimedOut);
        }

        self.begin_arbitration_wait(kernel, cur, addr);
        Ok(WaitStatus::Blocked)
    }

    fn begin_arbitration_wait(&self, kernel: &KernelCore, cur: &Arc<KThread>, addr: VAddr) {
        self.tree.insert(addr, cur);
        cur.begin_wait(kernel, ThreadQueue::AddressArbiter(Arc::clone(&self.tree)));
        cur.set_wait_reason_for_debugging(ThreadWaitReasonForDebugging::Arbitration);
    }
}

// ============================================================================
// Exclusive helpers
// ============================================================================

fn monitor_core(cur: &KThread) -> usize {
    cur.current_core().max(0) as usize
}

/// Store `new_value` if the word holds `value`; returns the word's previous value
fn update_if_equal(kernel: &KernelCore, cur: &KThread, addr: VAddr, value: i32, new_value: i32) -> KResult<i32> {
    if !kernel.memory().is_valid_virtual_address_range(addr, 4) {
        return Err(KernelError::InvalidCurrentMemory);
    }
    let monitor = kernel.exclusive_monitor();
    let core = monitor_core(cur);
    loop {
        let current = monitor.exclusive_read32(core, addr) as i32;
        if current != value {
            monitor.clear_exclusive(core);
            return Ok(current);
        }
        if monitor.exclusive_write32(core, addr, new_value as u32) {
            return Ok(current);
        }
    }
}

/// Decrement the word if it is less than `value`; returns the word's previous value
fn decrement_if_less_than(kernel: &KernelCore, cur: &KThread, addr: VAddr, value: i32) -> KResult<i32> {
    if !kernel.memory().is_valid_virtual_address_range(addr, 4) {
        return Err(KernelError::InvalidCurrentMemory);
    }
    let monitor = kernel.exclusive_monitor();
    let core = monitor_core(cur);
    loop {
        let current = monitor.exclusive_read32(core, addr) as i32;
        if current >= value {
            monitor.clear_exclusive(core);
            return Ok(current);
        }
        if monitor.exclusive_write32(core, addr, current.wrapping_sub(1) as u32) {
            return Ok(current);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_decoding() {
        assert_eq!(
            ArbitrationType::from_raw(1),
            Some(ArbitrationType::DecrementAndWaitIfLessThan)
        );
        assert_eq!(ArbitrationType::from_raw(3), None);
        assert_eq!(
            SignalType::from_raw(2),
            Some(SignalType::SignalAndModifyByWaitingCountIfEqual)
        );
        assert_eq!(SignalType::from_raw(7), None);
    }
}
