//! Supervisor Calls - validating entry layer
//!
//! Each function here is one guest supervisor call with its arguments already taken out of the
//! guest registers. It validates them the way the guest kernel does, resolves handles through
//! the calling process' handle table and forwards to the kernel primitive. Decoding registers
//! and writing results back stays with the frontend; [`crate::result::raw_result`] packs a
//! result for it.
//!
//! `cur` is always the guest thread that issued the call. Calls that can block return
//! [`WaitStatus`]; after a `Blocked` return the frontend reads the final result from `cur` once
//! it is scheduled again.

use alloc::sync::Arc;

use log::warn;

use crate::kern::address_arbiter::{ArbitrationType, SignalType};
use crate::kern::event::KEvent;
use crate::kern::kernel::KernelCore;
use crate::kern::object::KObject;
use crate::kern::process::KProcess;
use crate::kern::scheduler::KScheduler;
use crate::kern::sync_object;
use crate::kern::thread::{KThread, ThreadActivity, ThreadParams};
use crate::kern::thread_queue::{SyncObjectList, WaitStatus};
use crate::result::{KResult, KernelError};
use crate::types::{
    is_kernel_address, is_valid_core_id, is_valid_thread_priority, Handle, VAddr,
    ARGUMENT_HANDLE_COUNT_MAX, IDEAL_CORE_DONT_CARE, IDEAL_CORE_NO_UPDATE,
    IDEAL_CORE_USE_PROCESS_VALUE,
};

// ============================================================================
// Call Numbers
// ============================================================================

pub const SVC_CREATE_THREAD: u32 = 0x08;
pub const SVC_START_THREAD: u32 = 0x09;
pub const SVC_EXIT_THREAD: u32 = 0x0A;
pub const SVC_SLEEP_THREAD: u32 = 0x0B;
pub const SVC_GET_THREAD_PRIORITY: u32 = 0x0C;
pub const SVC_SET_THREAD_PRIORITY: u32 = 0x0D;
pub const SVC_SET_THREAD_CORE_MASK: u32 = 0x0F;
pub const SVC_SIGNAL_EVENT: u32 = 0x11;
pub const SVC_CLEAR_EVENT: u32 = 0x12;
pub const SVC_CLOSE_HANDLE: u32 = 0x16;
pub const SVC_RESET_SIGNAL: u32 = 0x17;
pub const SVC_WAIT_SYNCHRONIZATION: u32 = 0x18;
pub const SVC_CANCEL_SYNCHRONIZATION: u32 = 0x19;
pub const SVC_ARBITRATE_LOCK: u32 = 0x1A;
pub const SVC_ARBITRATE_UNLOCK: u32 = 0x1B;
pub const SVC_WAIT_PROCESS_WIDE_KEY_ATOMIC: u32 = 0x1C;
pub const SVC_SIGNAL_PROCESS_WIDE_KEY: u32 = 0x1D;
pub const SVC_SET_THREAD_ACTIVITY: u32 = 0x32;
pub const SVC_WAIT_FOR_ADDRESS: u32 = 0x34;
pub const SVC_SIGNAL_TO_ADDRESS: u32 = 0x35;
pub const SVC_CREATE_EVENT: u32 = 0x45;

// ============================================================================
// Sleep Yield Values
// ============================================================================

/// `SleepThread` value yielding to threads of the same priority on this core
pub const YIELD_WITHOUT_CORE_MIGRATION: i64 = 0;
/// `SleepThread` value yielding and letting other cores' threads migrate in
pub const YIELD_WITH_CORE_MIGRATION: i64 = -1;
/// `SleepThread` value giving up the core entirely
pub const YIELD_TO_ANY_THREAD: i64 = -2;

// ============================================================================
// Helpers
// ============================================================================

fn current_process(cur: &KThread) -> KResult<Arc<KProcess>> {
    cur.owner_process().ok_or(KernelError::InvalidHandle)
}

fn get_thread(process: &KProcess, cur: &Arc<KThread>, handle: Handle) -> KResult<Arc<KThread>> {
    process
        .handle_table()
        .get_thread(handle, cur)
        .ok_or(KernelError::InvalidHandle)
}

/// Guest lock words and arbiter words must be aligned user addresses
fn validate_user_word(addr: VAddr) -> KResult<()> {
    if is_kernel_address(addr) {
        return Err(KernelError::InvalidCurrentMemory);
    }
    if addr % 4 != 0 {
        return Err(KernelError::InvalidAddress);
    }
    Ok(())
}

const fn align_down_word(addr: u64) -> u64 {
    addr & !3
}

fn log_failure<T>(call: &str, cur: &KThread, result: KResult<T>) -> KResult<T> {
    if let Err(err) = &result {
        warn!("{} from thread {} failed: {}", call, cur.id().0, err);
    }
    result
}

// ============================================================================
// Threads
// ============================================================================

/// CreateThread: returns the new thread's handle
pub fn create_thread(
    kernel: &KernelCore,
    cur: &Arc<KThread>,
    entry_point: VAddr,
    argument: u64,
    stack_top: VAddr,
    priority: i32,
    core_id: i32,
) -> KResult<Handle> {
    let result = (|| -> KResult<Handle> {
        let process = current_process(cur)?;

        let core_id = if core_id == IDEAL_CORE_USE_PROCESS_VALUE {
            process.ideal_core()
        } else {
            core_id
        };
        if !is_valid_core_id(core_id) || process.core_mask() & (1u64 << core_id) == 0 {
            return Err(KernelError::InvalidCoreId);
        }
        if !is_valid_thread_priority(priority) || !process.check_thread_priority(priority) {
            return Err(KernelError::InvalidPriority);
        }

        let thread = kernel.create_user_thread(
            &process,
            ThreadParams {
                entry_point,
                argument,
                stack_top,
                priority,
                core: core_id,
            },
        )?;
        let handle = process.handle_table().add(KObject::Thread(Arc::clone(&thread)));
        // The handle table holds the thread from here on.
        thread.close(kernel);
        handle
    })();
    log_failure("CreateThread", cur, result)
}

/// StartThread
pub fn start_thread(kernel: &KernelCore, cur: &Arc<KThread>, handle: Handle) -> KResult<()> {
    let result = (|| -> KResult<()> {
        let process = current_process(cur)?;
        get_thread(&process, cur, handle)?.run(kernel)
    })();
    log_failure("StartThread", cur, result)
}

/// ExitThread
pub fn exit_thread(kernel: &KernelCore, cur: &Arc<KThread>) {
    cur.exit(kernel);
}

/// SleepThread: positive values sleep, 0/-1/-2 select a yield
pub fn sleep_thread(kernel: &KernelCore, cur: &Arc<KThread>, ns: i64) -> WaitStatus<()> {
    match ns {
        ns if ns > 0 => cur.sleep(kernel, ns).unwrap_or(WaitStatus::Done(())),
        YIELD_WITHOUT_CORE_MIGRATION => {
            KScheduler::yield_without_core_migration(kernel, cur);
            WaitStatus::Done(())
        }
        YIELD_WITH_CORE_MIGRATION => {
            KScheduler::yield_with_core_migration(kernel, cur);
            WaitStatus::Done(())
        }
        YIELD_TO_ANY_THREAD => {
            KScheduler::yield_to_any_thread(kernel, cur);
            WaitStatus::Done(())
        }
        other => {
            warn!("SleepThread with unknown yield type {:#x}", other);
            WaitStatus::Done(())
        }
    }
}

/// GetThreadPriority
pub fn get_thread_priority(cur: &Arc<KThread>, handle: Handle) -> KResult<i32> {
    let result = (|| -> KResult<i32> {
        let process = current_process(cur)?;
        Ok(get_thread(&process, cur, handle)?.priority())
    })();
    log_failure("GetThreadPriority", cur, result)
}

/// SetThreadPriority
pub fn set_thread_priority(kernel: &KernelCore, cur: &Arc<KThread>, handle: Handle, priority: i32) -> KResult<()> {
    let result = (|| -> KResult<()> {
        let process = current_process(cur)?;
        if !is_valid_thread_priority(priority) || !process.check_thread_priority(priority) {
            return Err(KernelError::InvalidPriority);
        }
        get_thread(&process, cur, handle)?.set_base_priority(kernel, priority);
        Ok(())
    })();
    log_failure("SetThreadPriority", cur, result)
}

/// SetThreadCoreMask
pub fn set_thread_core_mask(
    kernel: &KernelCore,
    cur: &Arc<KThread>,
    handle: Handle,
    core_id: i32,
    affinity_mask: u64,
) -> KResult<()> {
    let result = (|| -> KResult<()> {
        let process = current_process(cur)?;

        let (core_id, affinity_mask) = if core_id == IDEAL_CORE_USE_PROCESS_VALUE {
            let core_id = process.ideal_core();
            (core_id, 1u64 << core_id)
        } else {
            let process_core_mask = process.core_mask();
            if affinity_mask | process_core_mask != process_core_mask {
                return Err(KernelError::InvalidCoreId);
            }
            if affinity_mask == 0 {
                return Err(KernelError::InvalidCombination);
            }
            if is_valid_core_id(core_id) {
                if affinity_mask & (1u64 << core_id) == 0 {
                    return Err(KernelError::InvalidCombination);
                }
            } else if core_id != IDEAL_CORE_NO_UPDATE && core_id != IDEAL_CORE_DONT_CARE {
                return Err(KernelError::InvalidCoreId);
            }
            (core_id, affinity_mask)
        };

        get_thread(&process, cur, handle)?.set_core_mask(kernel, core_id, affinity_mask)
    })();
    log_failure("SetThreadCoreMask", cur, result)
}

/// SetThreadActivity: pause or resume another thread of the calling process
pub fn set_thread_activity(kernel: &KernelCore, cur: &Arc<KThread>, handle: Handle, activity: u32) -> KResult<()> {
    let result = (|| -> KResult<()> {
        let activity = ThreadActivity::from_raw(activity).ok_or(KernelError::InvalidEnumValue)?;
        let process = current_process(cur)?;
        let thread = get_thread(&process, cur, handle)?;

        let same_process = thread
            .owner_process()
            .is_some_and(|owner| Arc::ptr_eq(&owner, &process));
        if !same_process {
            return Err(KernelError::InvalidHandle);
        }
        if Arc::ptr_eq(&thread, cur) {
            return Err(KernelError::Busy);
        }

        thread.set_activity(kernel, activity)
    })();
    log_failure("SetThreadActivity", cur, result)
}

// ============================================================================
// Handles and Events
// ============================================================================

/// CloseHandle
pub fn close_handle(kernel: &KernelCore, cur: &Arc<KThread>, handle: Handle) -> KResult<()> {
    let result = current_process(cur).and_then(|process| process.handle_table().remove(kernel, handle));
    log_failure("CloseHandle", cur, result)
}

/// CreateEvent: returns (writable handle, readable handle)
pub fn create_event(kernel: &KernelCore, cur: &Arc<KThread>) -> KResult<(Handle, Handle)> {
    let result = (|| -> KResult<(Handle, Handle)> {
        let process = current_process(cur)?;
        let table = process.handle_table();

        let event = KEvent::new();
        let readable = Arc::clone(event.readable_event());
        let write_handle = table.add(KObject::Event(Arc::clone(&event)))?;
        let read_handle = match table.add(KObject::ReadableEvent(Arc::clone(&readable))) {
            Ok(handle) => handle,
            Err(err) => {
                table.remove(kernel, write_handle)?;
                return Err(err);
            }
        };

        // The table now holds both sides.
        event.close();
        readable.close();
        Ok((write_handle, read_handle))
    })();
    log_failure("CreateEvent", cur, result)
}

/// SignalEvent: `handle` must name the writable side
pub fn signal_event(kernel: &KernelCore, cur: &Arc<KThread>, handle: Handle) -> KResult<()> {
    let result = (|| -> KResult<()> {
        let process = current_process(cur)?;
        let object = process
            .handle_table()
            .get_object_without_pseudo_handle(handle)
            .ok_or(KernelError::InvalidHandle)?;
        object
            .as_event()
            .ok_or(KernelError::InvalidHandle)?
            .signal(kernel)
    })();
    log_failure("SignalEvent", cur, result)
}

/// ClearEvent: accepts either side of an event
pub fn clear_event(kernel: &KernelCore, cur: &Arc<KThread>, handle: Handle) -> KResult<()> {
    let result = (|| -> KResult<()> {
        let process = current_process(cur)?;
        let object = process
            .handle_table()
            .get_object_without_pseudo_handle(handle)
            .ok_or(KernelError::InvalidHandle)?;
        if let Some(event) = object.as_event() {
            return event.clear(kernel);
        }
        if let Some(readable) = object.as_readable_event() {
            return readable.clear(kernel);
        }
        Err(KernelError::InvalidHandle)
    })();
    log_failure("ClearEvent", cur, result)
}

/// ResetSignal: clears a signaled readable event
pub fn reset_signal(kernel: &KernelCore, cur: &Arc<KThread>, handle: Handle) -> KResult<()> {
    let result = (|| -> KResult<()> {
        let process = current_process(cur)?;
        let object = process
            .handle_table()
            .get_object_without_pseudo_handle(handle)
            .ok_or(KernelError::InvalidHandle)?;
        object
            .as_readable_event()
            .ok_or(KernelError::InvalidHandle)?
            .reset(kernel)
    })();
    log_failure("ResetSignal", cur, result)
}

// ============================================================================
// Synchronization
// ============================================================================

/// WaitSynchronization on `num_handles` handles stored at `handles_addr`
pub fn wait_synchronization(
    kernel: &KernelCore,
    cur: &Arc<KThread>,
    handles_addr: VAddr,
    num_handles: i32,
    timeout_ns: i64,
) -> KResult<WaitStatus<i32>> {
    let result = (|| -> KResult<WaitStatus<i32>> {
        if num_handles < 0 || num_handles as usize > ARGUMENT_HANDLE_COUNT_MAX {
            return Err(KernelError::OutOfRange);
        }
        let process = current_process(cur)?;
        let table = process.handle_table();

        let mut objects = SyncObjectList::new();
        for i in 0..num_handles as u64 {
            let addr = handles_addr
                .checked_add(i * 4)
                .ok_or(KernelError::InvalidPointer)?;
            let handle = kernel
                .read_from_user32(addr)
                .map_err(|_| KernelError::InvalidPointer)?;
            let object = table
                .get_object_without_pseudo_handle(handle)
                .and_then(|object| object.as_sync_object())
                .ok_or(KernelError::InvalidHandle)?;
            objects
                .push(object)
                .map_err(|_| KernelError::OutOfRange)?;
        }

        sync_object::wait(kernel, cur, objects, timeout_ns)
    })();
    // Timeouts are the expected outcome of a poll.
    if !matches!(result, Err(KernelError::TimedOut)) {
        return log_failure("WaitSynchronization", cur, result);
    }
    result
}

/// CancelSynchronization
pub fn cancel_synchronization(kernel: &KernelCore, cur: &Arc<KThread>, handle: Handle) -> KResult<()> {
    let result = (|| -> KResult<()> {
        let process = current_process(cur)?;
        get_thread(&process, cur, handle)?.wait_cancel(kernel);
        Ok(())
    })();
    log_failure("CancelSynchronization", cur, result)
}

/// ArbitrateLock: wait for the owner named by `owner_handle` to release the lock at `addr`
pub fn arbitrate_lock(
    kernel: &KernelCore,
    cur: &Arc<KThread>,
    owner_handle: Handle,
    addr: VAddr,
    tag: u32,
) -> KResult<WaitStatus<()>> {
    let result = (|| -> KResult<WaitStatus<()>> {
        validate_user_word(addr)?;
        let process = current_process(cur)?;
        process.condition_variable().wait_for_address(
            kernel,
            cur,
            process.handle_table(),
            owner_handle,
            addr,
            tag,
        )
    })();
    log_failure("ArbitrateLock", cur, result)
}

/// ArbitrateUnlock
pub fn arbitrate_unlock(kernel: &KernelCore, cur: &Arc<KThread>, addr: VAddr) -> KResult<()> {
    let result = (|| -> KResult<()> {
        validate_user_word(addr)?;
        let process = current_process(cur)?;
        process.condition_variable().signal_to_address(kernel, cur, addr)
    })();
    log_failure("ArbitrateUnlock", cur, result)
}

/// WaitProcessWideKeyAtomic: release the lock at `addr` and wait on `cv_key`
pub fn wait_process_wide_key_atomic(
    kernel: &KernelCore,
    cur: &Arc<KThread>,
    addr: VAddr,
    cv_key: u64,
    tag: u32,
    timeout_ns: i64,
) -> KResult<WaitStatus<()>> {
    let result = (|| -> KResult<WaitStatus<()>> {
        validate_user_word(addr)?;
        let process = current_process(cur)?;
        process
            .condition_variable()
            .wait(kernel, cur, addr, align_down_word(cv_key), tag, timeout_ns)
    })();
    if !matches!(result, Err(KernelError::TimedOut)) {
        return log_failure("WaitProcessWideKeyAtomic", cur, result);
    }
    result
}

/// SignalProcessWideKey
pub fn signal_process_wide_key(kernel: &KernelCore, cur: &Arc<KThread>, cv_key: u64, count: i32) -> KResult<()> {
    let process = log_failure("SignalProcessWideKey", cur, current_process(cur))?;
    process.condition_variable().signal(
        kernel,
        cur,
        process.handle_table(),
        align_down_word(cv_key),
        count,
    );
    Ok(())
}

/// WaitForAddress
pub fn wait_for_address(
    kernel: &KernelCore,
    cur: &Arc<KThread>,
    addr: VAddr,
    arbitration_type: u32,
    value: i32,
    timeout_ns: i64,
) -> KResult<WaitStatus<()>> {
    let result = (|| -> KResult<WaitStatus<()>> {
        validate_user_word(addr)?;
        let arbitration_type =
            ArbitrationType::from_raw(arbitration_type).ok_or(KernelError::InvalidEnumValue)?;
        let process = current_process(cur)?;
        process
            .address_arbiter()
            .wait_for_address(kernel, cur, addr, arbitration_type, value, timeout_ns)
    })();
    if !matches!(result, Err(KernelError::TimedOut)) {
        return log_failure("WaitForAddress", cur, result);
    }
    result
}

/// SignalToAddress
pub fn signal_to_address(
    kernel: &KernelCore,
    cur: &Arc<KThread>,
    addr: VAddr,
    signal_type: u32,
    value: i32,
    count: i32,
) -> KResult<()> {
    let result = (|| -> KResult<()> {
        validate_user_word(addr)?;
        let signal_type = SignalType::from_raw(signal_type).ok_or(KernelError::InvalidEnumValue)?;
        let process = current_process(cur)?;
        process
            .address_arbiter()
            .signal_to_address(kernel, cur, addr, signal_type, value, count)
    })();
    log_failure("SignalToAddress", cur, result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_user_word() {
        assert_eq!(validate_user_word(0x1000), Ok(()));
        assert_eq!(validate_user_word(0x1002), Err(KernelError::InvalidAddress));
        assert_eq!(
            validate_user_word(crate::types::KERNEL_ADDRESS_SPACE_BASE),
            Err(KernelError::InvalidCurrentMemory)
        );
    }

    #[test]
    fn test_align_down_word() {
        assert_eq!(align_down_word(0x1003), 0x1000);
        assert_eq!(align_down_word(0x1004), 0x1004);
    }
}
