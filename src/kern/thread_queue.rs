//! Thread wait queues
//!
//! A waiting thread carries the [`ThreadQueue`] describing what it waits on. Whoever ends or
//! cancels the wait takes the queue out of the thread and lets it undo the bookkeeping the wait
//! created (tree membership, lock-owner links, object nodes) before the thread is made runnable
//! again. After that the thread only has to read its result.

use alloc::sync::Arc;

use log::trace;

use crate::kern::kernel::KernelCore;
use crate::kern::sync_object::{self, KSynchronizationObject};
use crate::kern::thread::{KThread, ThreadState};
use crate::kern::thread_tree::KThreadTree;
use crate::result::KResult;
use crate::types::ARGUMENT_HANDLE_COUNT_MAX;

// ============================================================================
// Wait Status
// ============================================================================

/// Outcome of a potentially blocking operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus<T> {
    /// Completed without waiting
    Done(T),
    /// The calling thread is now waiting; read the result once it runs again
    Blocked,
}

impl<T> WaitStatus<T> {
    pub fn is_blocked(&self) -> bool {
        matches!(self, WaitStatus::Blocked)
    }

    /// The value of a completed operation
    pub fn done(self) -> Option<T> {
        match self {
            WaitStatus::Done(value) => Some(value),
            WaitStatus::Blocked => None,
        }
    }
}

/// Objects of one multi-object wait
pub type SyncObjectList = heapless::Vec<Arc<dyn KSynchronizationObject>, ARGUMENT_HANDLE_COUNT_MAX>;

// ============================================================================
// Thread Queue
// ============================================================================

/// What a waiting thread is waiting on
pub enum ThreadQueue {
    /// Timed sleep
    Sleep,
    /// Any of several synchronization objects
    Synchronization(SyncObjectList),
    /// A guest address in an arbiter tree
    AddressArbiter(Arc<KThreadTree>),
    /// A condition variable key, later possibly a lock owner
    ConditionVariable(Arc<KThreadTree>),
    /// The owner of a lock
    LockOwner,
}

impl core::fmt::Debug for ThreadQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ThreadQueue::Sleep => f.write_str("Sleep"),
            ThreadQueue::Synchronization(objects) => {
                write!(f, "Synchronization({} objects)", objects.len())
            }
            ThreadQueue::AddressArbiter(_) => f.write_str("AddressArbiter"),
            ThreadQueue::ConditionVariable(_) => f.write_str("ConditionVariable"),
            ThreadQueue::LockOwner => f.write_str("LockOwner"),
        }
    }
}

impl ThreadQueue {
    /// One of the objects of a synchronization wait became available
    ///
    /// `index` is the position of the signalled object in the wait list.
    pub(crate) fn notify_available(
        self,
        kernel: &KernelCore,
        thread: &Arc<KThread>,
        index: i32,
        result: KResult<()>,
    ) {
        if let ThreadQueue::Synchronization(objects) = &self {
            unlink_all(objects, thread);
            thread.set_synced_index(index);
            thread.clear_cancellable();
        }
        finish_wait(kernel, thread, result, true);
    }

    pub(crate) fn end_wait(self, kernel: &KernelCore, thread: &Arc<KThread>, result: KResult<()>) {
        match &self {
            ThreadQueue::Synchronization(objects) => {
                unlink_all(objects, thread);
                thread.clear_cancellable();
            }
            ThreadQueue::AddressArbiter(_) | ThreadQueue::ConditionVariable(_) => {
                thread.remove_from_tree();
            }
            ThreadQueue::Sleep | ThreadQueue::LockOwner => {}
        }
        finish_wait(kernel, thread, result, true);
    }

    pub(crate) fn cancel_wait(
        self,
        kernel: &KernelCore,
        thread: &Arc<KThread>,
        result: KResult<()>,
        cancel_timer_task: bool,
    ) {
        match &self {
            ThreadQueue::Synchronization(objects) => {
                unlink_all(objects, thread);
                thread.clear_cancellable();
            }
            ThreadQueue::AddressArbiter(_) => {
                thread.remove_from_tree();
            }
            ThreadQueue::ConditionVariable(_) => {
                if let Some(owner) = thread.lock_owner() {
                    owner.remove_waiter(kernel, thread);
                }
                thread.remove_from_tree();
            }
            ThreadQueue::LockOwner => {
                if let Some(owner) = thread.lock_owner() {
                    owner.remove_waiter(kernel, thread);
                }
            }
            ThreadQueue::Sleep => {}
        }
        finish_wait(kernel, thread, result, cancel_timer_task);
    }
}

fn unlink_all(objects: &SyncObjectList, thread: &Arc<KThread>) {
    for object in objects {
        sync_object::unlink_thread(object.as_ref(), thread);
    }
}

/// Common tail of every wake: record the result and make the thread runnable
fn finish_wait(kernel: &KernelCore, thread: &Arc<KThread>, result: KResult<()>, cancel_timer_task: bool) {
    trace!("thread {} wait finished: {:?}", thread.id().0, result);
    thread.set_wait_result(result);
    thread.set_state(kernel, ThreadState::Runnable);
    if cancel_timer_task {
        kernel.timeout_manager().unschedule(thread.id());
    }
}
