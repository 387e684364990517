//! Synchronization objects and multi-object waits
//!
//! A synchronization object keeps an ordered list of the threads waiting on it, each tagged with
//! the position the object had in that thread's wait list. Signalling walks the list and hands
//! every waiter its own index.

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::debug;
use spin::Mutex;

use crate::kern::kernel::KernelCore;
use crate::kern::lock::{KScopedSchedulerLock, KScopedSchedulerLockAndSleep};
use crate::kern::thread::{KThread, ThreadWaitReasonForDebugging};
use crate::kern::thread_queue::{SyncObjectList, ThreadQueue, WaitStatus};
use crate::result::{KResult, KernelError};

/// One waiting thread on one object
#[derive(Debug, Clone)]
struct SyncNode {
    thread: Arc<KThread>,
    index: i32,
}

/// Waiter list shared by every synchronization object
#[derive(Debug, Default)]
pub struct SyncObjectBase {
    waiters: Mutex<Vec<SyncNode>>,
}

impl SyncObjectBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_waiters(&self) -> usize {
        self.waiters.lock().len()
    }
}

/// An object threads can wait on
pub trait KSynchronizationObject: Send + Sync {
    fn sync_base(&self) -> &SyncObjectBase;

    /// Whether a wait on the object completes immediately
    ///
    /// Only meaningful with the scheduler lock held.
    fn is_signaled(&self) -> bool;
}

fn link_node(object: &dyn KSynchronizationObject, thread: &Arc<KThread>, index: i32) {
    object.sync_base().waiters.lock().push(SyncNode {
        thread: Arc::clone(thread),
        index,
    });
}

/// Remove every node of `thread` from `object`
pub(crate) fn unlink_thread(object: &dyn KSynchronizationObject, thread: &Arc<KThread>) {
    object
        .sync_base()
        .waiters
        .lock()
        .retain(|node| !Arc::ptr_eq(&node.thread, thread));
}

/// Wake every thread waiting on a signaled object
pub fn notify_available(kernel: &KernelCore, object: &dyn KSynchronizationObject, result: KResult<()>) {
    let _sl = KScopedSchedulerLock::new(kernel);

    if !object.is_signaled() {
        return;
    }

    // Waking unlinks the thread from this list, so walk a snapshot.
    let nodes = object.sync_base().waiters.lock().clone();
    for node in nodes {
        node.thread.notify_available(kernel, node.index, result);
    }
}

/// Wait until one of `objects` is signaled
///
/// Returns the index of an already signaled object without blocking. Otherwise the thread is
/// linked into every object and blocks; once it runs again [`KThread::synced_index`] names the
/// object that woke it (-1 on timeout or cancellation) and [`KThread::wait_result`] holds the
/// outcome.
pub fn wait(
    kernel: &KernelCore,
    thread: &Arc<KThread>,
    objects: SyncObjectList,
    timeout_ns: i64,
) -> KResult<WaitStatus<i32>> {
    let mut slp = KScopedSchedulerLockAndSleep::new(kernel, thread, timeout_ns);

    if let Some(index) = objects.iter().position(|object| object.is_signaled()) {
        slp.cancel_sleep();
        return Ok(WaitStatus::Done(index as i32));
    }

    if timeout_ns == 0 {
        slp.cancel_sleep();
        return Err(KernelError::TimedOut);
    }

    if thread.is_termination_requested() {
        slp.cancel_sleep();
        return Err(KernelError::TerminationRequested);
    }

    if thread.is_wait_cancelled() {
        slp.cancel_sleep();
        thread.clear_wait_cancelled();
        return Err(KernelError::Cancelled);
    }

    for (index, object) in objects.iter().enumerate() {
        link_node(object.as_ref(), thread, index as i32);
    }

    debug!(
        "thread {} waiting on {} objects, timeout {}ns",
        thread.id().0,
        objects.len(),
        timeout_ns
    );

    thread.set_cancellable();
    thread.set_synced_index(-1);
    thread.set_wait_result(Err(KernelError::TimedOut));
    thread.begin_wait(kernel, ThreadQueue::Synchronization(objects));
    thread.set_wait_reason_for_debugging(ThreadWaitReasonForDebugging::Synchronization);
    Ok(WaitStatus::Blocked)
}
