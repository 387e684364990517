//! Scheduler behaviour seen through the recording host

mod common;

use common::TestKernel;
use guest_kern::kern::{KLightLock, SuspendType, ThreadState, WaitStatus};
use guest_kern::svc;
use guest_kern::types::NUM_CPU_CORES;

#[test]
fn test_idle_threads_take_first_ids() {
    let tk = TestKernel::new();
    for core in 0..NUM_CPU_CORES {
        let idle = tk.kernel.scheduler(core).idle_thread();
        assert_eq!(idle.id().0, core as u64 + 1);
        assert!(tk.kernel.thread_by_id(idle.id()).is_none());
        assert!(std::sync::Arc::ptr_eq(&tk.kernel.current_thread(core), idle));
    }
}

#[test]
fn test_started_thread_is_switched_in() {
    let tk = TestKernel::new();
    let (t1, _) = tk.spawn(30, 0);

    assert_eq!(t1.state(), ThreadState::Runnable);
    assert!(std::sync::Arc::ptr_eq(&tk.kernel.current_thread(0), &t1));
    assert_eq!(tk.host.switches(), vec![(0, 1, t1.id().0)]);
    assert_eq!(tk.kernel.scheduler(0).switch_count(), 1);
}

#[test]
fn test_higher_priority_thread_preempts() {
    let tk = TestKernel::new();
    let (low, _) = tk.spawn(40, 0);
    let (high, _) = tk.spawn(20, 0);

    assert!(std::sync::Arc::ptr_eq(&tk.kernel.current_thread(0), &high));
    assert_eq!(
        tk.host.switches().last().copied(),
        Some((0, low.id().0, high.id().0))
    );
}

#[test]
fn test_initialized_thread_is_not_scheduled() {
    let tk = TestKernel::new();
    let (t1, _) = tk.create(30, 0);
    assert_eq!(t1.state(), ThreadState::Initialized);
    assert!(tk.host.switches().is_empty());

    t1.run(&tk.kernel).unwrap();
    assert_eq!(t1.run(&tk.kernel), Err(guest_kern::KernelError::InvalidState));
}

#[test]
fn test_yield_rotates_same_priority() {
    let tk = TestKernel::new();
    let (t1, _) = tk.spawn(30, 0);
    let (t2, _) = tk.spawn(30, 0);
    assert!(std::sync::Arc::ptr_eq(&tk.kernel.current_thread(0), &t1));

    let status = svc::sleep_thread(&tk.kernel, &t1, svc::YIELD_WITHOUT_CORE_MIGRATION);
    assert_eq!(status, WaitStatus::Done(()));
    assert!(std::sync::Arc::ptr_eq(&tk.kernel.current_thread(0), &t2));
    assert_eq!(
        tk.host.switches().last().copied(),
        Some((0, t1.id().0, t2.id().0))
    );
}

#[test]
fn test_yield_alone_keeps_running() {
    let tk = TestKernel::new();
    let (t1, _) = tk.spawn(30, 0);
    let before = tk.host.switches().len();

    svc::sleep_thread(&tk.kernel, &t1, svc::YIELD_WITHOUT_CORE_MIGRATION);
    assert!(std::sync::Arc::ptr_eq(&tk.kernel.current_thread(0), &t1));
    assert_eq!(tk.host.switches().len(), before);
}

#[test]
fn test_preemption_rotates_configured_priority() {
    let tk = TestKernel::new();
    let (t1, _) = tk.spawn(59, 0);
    let (t2, _) = tk.spawn(59, 0);
    assert!(std::sync::Arc::ptr_eq(&tk.kernel.current_thread(0), &t1));

    tk.kernel.preempt_threads();
    assert!(std::sync::Arc::ptr_eq(&tk.kernel.current_thread(0), &t2));

    tk.kernel.preempt_threads();
    assert!(std::sync::Arc::ptr_eq(&tk.kernel.current_thread(0), &t1));
}

#[test]
fn test_suspend_removes_from_core() {
    let tk = TestKernel::new();
    let (t1, _) = tk.spawn(30, 0);

    t1.request_suspend(&tk.kernel, SuspendType::Thread);
    assert!(t1.is_suspended());
    assert_eq!(t1.state(), ThreadState::Runnable);
    assert!(std::sync::Arc::ptr_eq(
        &tk.kernel.current_thread(0),
        tk.kernel.scheduler(0).idle_thread()
    ));

    t1.resume(&tk.kernel, SuspendType::Thread);
    assert!(!t1.is_suspended());
    assert!(std::sync::Arc::ptr_eq(&tk.kernel.current_thread(0), &t1));
}

#[test]
fn test_light_lock_handoff_with_inheritance() {
    let tk = TestKernel::new();
    let lock = KLightLock::new(&tk.kernel);
    let (t1, _) = tk.spawn(10, 0);
    let (t2, _) = tk.spawn(5, 1);

    assert_eq!(lock.lock(&tk.kernel, &t1), WaitStatus::Done(()));
    assert!(lock.is_locked_by_current_thread(&t1));

    assert_eq!(lock.lock(&tk.kernel, &t2), WaitStatus::Blocked);
    assert_eq!(t2.state(), ThreadState::Waiting);
    assert_eq!(t1.priority(), 5);
    assert_eq!(t1.num_kernel_waiters(), 1);

    lock.unlock(&tk.kernel, &t1);
    assert_eq!(lock.owner_id(), Some(t2.id()));
    assert_eq!(t2.state(), ThreadState::Runnable);
    assert_eq!(t2.wait_result(), Ok(()));
    assert_eq!(t1.priority(), 10);
    assert_eq!(t1.num_kernel_waiters(), 0);

    lock.unlock(&tk.kernel, &t2);
    assert!(!lock.is_locked());
}

#[test]
fn test_kernel_waiters_defer_suspension() {
    let tk = TestKernel::new();
    let lock = KLightLock::new(&tk.kernel);
    let (owner, _) = tk.spawn(30, 0);
    let (waiter, _) = tk.spawn(30, 1);

    assert_eq!(lock.lock(&tk.kernel, &owner), WaitStatus::Done(()));
    assert_eq!(lock.lock(&tk.kernel, &waiter), WaitStatus::Blocked);

    owner.request_suspend(&tk.kernel, SuspendType::Thread);
    assert!(owner.is_suspend_requested());
    assert_eq!(owner.raw_state(), ThreadState::Runnable as u32);

    lock.unlock(&tk.kernel, &owner);
    assert_ne!(owner.raw_state(), ThreadState::Runnable as u32);
    assert_eq!(lock.owner_id(), Some(waiter.id()));
}
