//! Supervisor call validation and multi-object waits

mod common;

use common::TestKernel;
use guest_kern::kern::{
    ThreadState, WaitStatus, PSEUDO_HANDLE_CURRENT_PROCESS, PSEUDO_HANDLE_CURRENT_THREAD,
};
use guest_kern::result::raw_result;
use guest_kern::types::Handle;
use guest_kern::{svc, KernelConfig, KernelError};

/// Store `handles` in guest memory for a WaitSynchronization call
fn put_handles(tk: &TestKernel, offset: u64, handles: &[Handle]) -> u64 {
    let base = tk.addr(offset);
    for (i, &handle) in handles.iter().enumerate() {
        tk.write32(base + i as u64 * 4, handle);
    }
    base
}

// ════════════════════════════════════════════════════════════════════════════
// Threads
// ════════════════════════════════════════════════════════════════════════════

#[test]
fn test_create_and_start_thread() {
    let tk = TestKernel::new();
    let (cur, _) = tk.spawn(30, 0);

    let handle = svc::create_thread(&tk.kernel, &cur, 0x4000, 7, 0x5000, 44, 1).unwrap();
    let thread = tk
        .process
        .handle_table()
        .get_thread(handle, &cur)
        .unwrap();
    assert_eq!(thread.state(), ThreadState::Initialized);
    assert_eq!(thread.entry_point(), 0x4000);
    assert_eq!(thread.argument(), 7);
    assert_eq!(thread.reference_count(), 1);

    svc::start_thread(&tk.kernel, &cur, handle).unwrap();
    assert_eq!(thread.state(), ThreadState::Runnable);
    assert_eq!(
        svc::start_thread(&tk.kernel, &cur, handle),
        Err(KernelError::InvalidState)
    );
}

#[test]
fn test_create_thread_validation() {
    let tk = TestKernel::new();
    let (cur, _) = tk.spawn(30, 0);

    assert_eq!(
        svc::create_thread(&tk.kernel, &cur, 0x4000, 0, 0x5000, 64, 0),
        Err(KernelError::InvalidPriority)
    );
    assert_eq!(
        svc::create_thread(&tk.kernel, &cur, 0x4000, 0, 0x5000, 44, 4),
        Err(KernelError::InvalidCoreId)
    );

    // The process ideal core stands in for -2.
    let handle = svc::create_thread(&tk.kernel, &cur, 0x4000, 0, 0x5000, 44, -2).unwrap();
    let thread = tk.process.handle_table().get_thread(handle, &cur).unwrap();
    assert_eq!(thread.ideal_core(), 0);
}

#[test]
fn test_thread_priority_calls() {
    let tk = TestKernel::new();
    let (cur, _) = tk.spawn(30, 0);
    let (other, h_other) = tk.spawn(40, 1);

    assert_eq!(svc::get_thread_priority(&cur, PSEUDO_HANDLE_CURRENT_THREAD), Ok(30));
    assert_eq!(svc::get_thread_priority(&cur, h_other), Ok(40));

    svc::set_thread_priority(&tk.kernel, &cur, h_other, 12).unwrap();
    assert_eq!(other.priority(), 12);
    assert_eq!(other.base_priority(), 12);

    assert_eq!(
        svc::set_thread_priority(&tk.kernel, &cur, h_other, 64),
        Err(KernelError::InvalidPriority)
    );
    assert_eq!(
        svc::get_thread_priority(&cur, PSEUDO_HANDLE_CURRENT_PROCESS),
        Err(KernelError::InvalidHandle)
    );
}

#[test]
fn test_set_thread_core_mask() {
    let tk = TestKernel::new();
    let (cur, _) = tk.spawn(30, 0);
    let (other, h_other) = tk.spawn(40, 1);

    assert_eq!(
        svc::set_thread_core_mask(&tk.kernel, &cur, h_other, 0, 0),
        Err(KernelError::InvalidCombination)
    );
    assert_eq!(
        svc::set_thread_core_mask(&tk.kernel, &cur, h_other, 2, 0b0011),
        Err(KernelError::InvalidCombination)
    );
    assert_eq!(
        svc::set_thread_core_mask(&tk.kernel, &cur, h_other, 0, 0b1_0001),
        Err(KernelError::InvalidCoreId)
    );
    assert_eq!(
        svc::set_thread_core_mask(&tk.kernel, &cur, h_other, 7, 0b0001),
        Err(KernelError::InvalidCoreId)
    );

    // Leaving the active core moves the thread to its new ideal core.
    svc::set_thread_core_mask(&tk.kernel, &cur, h_other, 2, 0b0100).unwrap();
    assert_eq!(other.ideal_core(), 2);
    assert_eq!(other.active_core(), 2);
    assert_eq!(other.affinity_mask().get_affinity_mask(), 0b0100);
    assert!(std::sync::Arc::ptr_eq(&tk.kernel.current_thread(2), &other));
}

#[test]
fn test_set_thread_activity() {
    let tk = TestKernel::new();
    let (cur, h_cur) = tk.spawn(30, 0);
    let (other, h_other) = tk.spawn(30, 1);

    svc::set_thread_activity(&tk.kernel, &cur, h_other, 1).unwrap();
    assert!(other.is_suspended());
    assert_eq!(
        svc::set_thread_activity(&tk.kernel, &cur, h_other, 1),
        Err(KernelError::InvalidState)
    );

    svc::set_thread_activity(&tk.kernel, &cur, h_other, 0).unwrap();
    assert!(!other.is_suspended());
    assert_eq!(
        svc::set_thread_activity(&tk.kernel, &cur, h_other, 0),
        Err(KernelError::InvalidState)
    );

    assert_eq!(
        svc::set_thread_activity(&tk.kernel, &cur, h_cur, 1),
        Err(KernelError::Busy)
    );
    assert_eq!(
        svc::set_thread_activity(&tk.kernel, &cur, h_other, 2),
        Err(KernelError::InvalidEnumValue)
    );
}

// ════════════════════════════════════════════════════════════════════════════
// Handles and events
// ════════════════════════════════════════════════════════════════════════════

#[test]
fn test_event_signal_and_reset() {
    let tk = TestKernel::new();
    let (cur, _) = tk.spawn(30, 0);
    let (write, read) = svc::create_event(&tk.kernel, &cur).unwrap();
    assert_ne!(write, read);

    assert_eq!(
        svc::signal_event(&tk.kernel, &cur, read),
        Err(KernelError::InvalidHandle)
    );
    assert_eq!(
        svc::reset_signal(&tk.kernel, &cur, read),
        Err(KernelError::InvalidState)
    );

    svc::signal_event(&tk.kernel, &cur, write).unwrap();
    svc::reset_signal(&tk.kernel, &cur, read).unwrap();
    assert_eq!(
        svc::reset_signal(&tk.kernel, &cur, read),
        Err(KernelError::InvalidState)
    );

    svc::signal_event(&tk.kernel, &cur, write).unwrap();
    svc::clear_event(&tk.kernel, &cur, write).unwrap();
    svc::clear_event(&tk.kernel, &cur, read).unwrap();
    assert_eq!(
        svc::reset_signal(&tk.kernel, &cur, read),
        Err(KernelError::InvalidState)
    );
}

#[test]
fn test_closed_handle_goes_stale() {
    let tk = TestKernel::new();
    let (cur, _) = tk.spawn(30, 0);
    let (write, read) = svc::create_event(&tk.kernel, &cur).unwrap();

    svc::close_handle(&tk.kernel, &cur, write).unwrap();
    assert_eq!(
        svc::signal_event(&tk.kernel, &cur, write),
        Err(KernelError::InvalidHandle)
    );
    assert_eq!(
        svc::close_handle(&tk.kernel, &cur, write),
        Err(KernelError::InvalidHandle)
    );

    // The freed slot is reused under a new generation.
    let (write2, _) = svc::create_event(&tk.kernel, &cur).unwrap();
    assert_ne!(write2, write);
    assert_eq!(write2 >> 15, write >> 15);
    assert_eq!(
        svc::signal_event(&tk.kernel, &cur, write),
        Err(KernelError::InvalidHandle)
    );
    svc::signal_event(&tk.kernel, &cur, write2).unwrap();
    assert!(tk.process.handle_table().is_valid(read));
}

#[test]
fn test_handle_table_exhaustion() {
    let config = guest_kern::KernelConfig::new().with_handle_table_size(4);
    let tk = TestKernel::with_config(config);
    let (cur, _) = tk.spawn(30, 0);

    svc::create_event(&tk.kernel, &cur).unwrap();
    // One slot left; the second side does not fit and the first is rolled back.
    let result = svc::create_event(&tk.kernel, &cur);
    assert_eq!(result, Err(KernelError::OutOfHandles));
    assert_eq!(tk.process.handle_table().count(), 3);
    assert_eq!(raw_result(&result), KernelError::OutOfHandles.raw());
}

// ════════════════════════════════════════════════════════════════════════════
// WaitSynchronization
// ════════════════════════════════════════════════════════════════════════════

#[test]
fn test_wait_on_signaled_event_returns_at_once() {
    let tk = TestKernel::new();
    let (cur, _) = tk.spawn(30, 0);
    let (write, read) = svc::create_event(&tk.kernel, &cur).unwrap();
    svc::signal_event(&tk.kernel, &cur, write).unwrap();
    let handles = put_handles(&tk, 0x800, &[read]);

    for timeout in [0, -1, 1000] {
        let status = svc::wait_synchronization(&tk.kernel, &cur, handles, 1, timeout).unwrap();
        assert_eq!(status, WaitStatus::Done(0));
    }
    assert_eq!(tk.kernel.timeout_manager().pending(), 0);
}

#[test]
fn test_wait_poll_times_out() {
    let tk = TestKernel::new();
    let (cur, _) = tk.spawn(30, 0);
    let (_, read) = svc::create_event(&tk.kernel, &cur).unwrap();
    let handles = put_handles(&tk, 0x800, &[read]);

    assert_eq!(
        svc::wait_synchronization(&tk.kernel, &cur, handles, 1, 0),
        Err(KernelError::TimedOut)
    );
    assert_eq!(cur.state(), ThreadState::Runnable);
}

#[test]
fn test_wait_woken_by_signal_reports_index() {
    let tk = TestKernel::new();
    let (signaller, _) = tk.spawn(30, 0);
    let (waiter, _) = tk.spawn(30, 1);
    let (_, read_a) = svc::create_event(&tk.kernel, &signaller).unwrap();
    let (write_b, read_b) = svc::create_event(&tk.kernel, &signaller).unwrap();
    let handles = put_handles(&tk, 0x800, &[read_a, read_b]);

    let status = svc::wait_synchronization(&tk.kernel, &waiter, handles, 2, -1).unwrap();
    assert_eq!(status, WaitStatus::Blocked);
    assert_eq!(waiter.state(), ThreadState::Waiting);
    assert!(waiter.is_cancellable());

    svc::signal_event(&tk.kernel, &signaller, write_b).unwrap();
    assert_eq!(waiter.state(), ThreadState::Runnable);
    assert_eq!(waiter.wait_result(), Ok(()));
    assert_eq!(waiter.synced_index(), 1);
    assert!(!waiter.is_cancellable());
}

#[test]
fn test_wait_times_out_with_no_index() {
    let tk = TestKernel::new();
    let (cur, _) = tk.spawn(30, 0);
    let (_, read) = svc::create_event(&tk.kernel, &cur).unwrap();
    let handles = put_handles(&tk, 0x800, &[read]);

    svc::wait_synchronization(&tk.kernel, &cur, handles, 1, 250).unwrap();
    assert_eq!(tk.advance(250), 1);
    assert_eq!(cur.wait_result(), Err(KernelError::TimedOut));
    assert_eq!(cur.synced_index(), -1);
}

#[test]
fn test_wait_on_thread_handle_until_exit() {
    let tk = TestKernel::new();
    let (target, h_target) = tk.spawn(30, 0);
    let (waiter, _) = tk.spawn(30, 1);
    let handles = put_handles(&tk, 0x800, &[h_target]);

    let status = svc::wait_synchronization(&tk.kernel, &waiter, handles, 1, -1).unwrap();
    assert_eq!(status, WaitStatus::Blocked);

    svc::exit_thread(&tk.kernel, &target);
    assert_eq!(waiter.state(), ThreadState::Runnable);
    assert_eq!(waiter.synced_index(), 0);

    let status = svc::wait_synchronization(&tk.kernel, &waiter, handles, 1, 0).unwrap();
    assert_eq!(status, WaitStatus::Done(0));
}

#[test]
fn test_cancel_synchronization() {
    let tk = TestKernel::new();
    let (canceller, _) = tk.spawn(30, 0);
    let (waiter, h_waiter) = tk.spawn(30, 1);
    let (_, read) = svc::create_event(&tk.kernel, &canceller).unwrap();
    let handles = put_handles(&tk, 0x800, &[read]);

    svc::wait_synchronization(&tk.kernel, &waiter, handles, 1, -1).unwrap();
    svc::cancel_synchronization(&tk.kernel, &canceller, h_waiter).unwrap();
    assert_eq!(waiter.state(), ThreadState::Runnable);
    assert_eq!(waiter.wait_result(), Err(KernelError::Cancelled));
    assert_eq!(waiter.synced_index(), -1);
    assert!(!waiter.is_wait_cancelled());
}

#[test]
fn test_cancel_before_wait_is_latched() {
    let tk = TestKernel::new();
    let (canceller, _) = tk.spawn(30, 0);
    let (waiter, h_waiter) = tk.spawn(30, 1);
    let (_, read) = svc::create_event(&tk.kernel, &canceller).unwrap();
    let handles = put_handles(&tk, 0x800, &[read]);

    svc::cancel_synchronization(&tk.kernel, &canceller, h_waiter).unwrap();
    assert!(waiter.is_wait_cancelled());

    assert_eq!(
        svc::wait_synchronization(&tk.kernel, &waiter, handles, 1, -1),
        Err(KernelError::Cancelled)
    );
    assert!(!waiter.is_wait_cancelled());

    let status = svc::wait_synchronization(&tk.kernel, &waiter, handles, 1, -1).unwrap();
    assert_eq!(status, WaitStatus::Blocked);
}

#[test]
fn test_wait_synchronization_validation() {
    let tk = TestKernel::new();
    let (cur, h_cur) = tk.spawn(30, 0);
    let handles = put_handles(&tk, 0x800, &[h_cur, 0x7777]);

    assert_eq!(
        svc::wait_synchronization(&tk.kernel, &cur, handles, 65, 0),
        Err(KernelError::OutOfRange)
    );
    assert_eq!(
        svc::wait_synchronization(&tk.kernel, &cur, handles, -1, 0),
        Err(KernelError::OutOfRange)
    );
    assert_eq!(
        svc::wait_synchronization(&tk.kernel, &cur, handles, 2, 0),
        Err(KernelError::InvalidHandle)
    );
    assert_eq!(
        svc::wait_synchronization(&tk.kernel, &cur, 0x10, 1, 0),
        Err(KernelError::InvalidPointer)
    );
}

#[test]
fn test_wait_synchronization_handle_array_at_top_of_memory() {
    let tk = TestKernel::with_region(KernelConfig::default(), u64::MAX - 0xfff, 0x1000);
    let (cur, h_cur) = tk.spawn(30, 0);
    let handles = tk.addr(0xffc);
    tk.write32(handles, h_cur);

    // The second entry would sit past the end of the address space.
    assert_eq!(
        svc::wait_synchronization(&tk.kernel, &cur, handles, 2, 0),
        Err(KernelError::InvalidPointer)
    );
}

#[test]
fn test_monitor_broken_by_kernel_store() {
    let tk = TestKernel::new();
    let addr = tk.addr(0x900);
    let monitor = tk.kernel.exclusive_monitor();

    assert_eq!(monitor.exclusive_read32(0, addr), 0);
    tk.kernel.write_to_user32(addr, 5).unwrap();
    assert!(!monitor.has_reservation(0));
    assert!(!monitor.exclusive_write32(0, addr, 9));
    assert_eq!(tk.read32(addr), 5);

    assert_eq!(
        tk.kernel.write_to_user32(0x10, 1),
        Err(KernelError::InvalidCurrentMemory)
    );
}
