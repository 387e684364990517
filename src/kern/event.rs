//! Events
//!
//! A [`KEvent`] is the writable side held by the signaller; its [`KReadableEvent`] is what
//! waiters wait on. Signalling wakes every current waiter with success and leaves the event
//! signaled until it is cleared or reset.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use log::debug;

use crate::kern::kernel::KernelCore;
use crate::kern::lock::KScopedSchedulerLock;
use crate::kern::object::RefCount;
use crate::kern::sync_object::{self, KSynchronizationObject, SyncObjectBase};
use crate::result::{KResult, KernelError};

/// Waitable side of an event
#[derive(Debug)]
pub struct KReadableEvent {
    sync: SyncObjectBase,
    signaled: AtomicBool,
    ref_count: RefCount,
}

impl KReadableEvent {
    pub fn new() -> Self {
        Self {
            sync: SyncObjectBase::new(),
            signaled: AtomicBool::new(false),
            ref_count: RefCount::new(1),
        }
    }

    pub fn open(&self) {
        self.ref_count.open();
    }

    pub fn close(&self) {
        self.ref_count.close();
    }

    pub fn signal(&self, kernel: &KernelCore) -> KResult<()> {
        let _sl = KScopedSchedulerLock::new(kernel);
        if !self.signaled.swap(true, Ordering::AcqRel) {
            sync_object::notify_available(kernel, self, Ok(()));
        }
        Ok(())
    }

    pub fn clear(&self, kernel: &KernelCore) -> KResult<()> {
        let _sl = KScopedSchedulerLock::new(kernel);
        self.signaled.store(false, Ordering::Release);
        Ok(())
    }

    /// Clear the event, failing if it was not signaled
    pub fn reset(&self, kernel: &KernelCore) -> KResult<()> {
        let _sl = KScopedSchedulerLock::new(kernel);
        if !self.signaled.swap(false, Ordering::AcqRel) {
            return Err(KernelError::InvalidState);
        }
        Ok(())
    }
}

impl KSynchronizationObject for KReadableEvent {
    fn sync_base(&self) -> &SyncObjectBase {
        &self.sync
    }

    fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }
}

/// Writable side of an event
#[derive(Debug)]
pub struct KEvent {
    readable: Arc<KReadableEvent>,
    ref_count: RefCount,
}

impl KEvent {
    pub fn new() -> Arc<Self> {
        debug!("event created");
        Arc::new(Self {
            readable: Arc::new(KReadableEvent::new()),
            ref_count: RefCount::new(1),
        })
    }

    pub fn readable_event(&self) -> &Arc<KReadableEvent> {
        &self.readable
    }

    pub fn open(&self) {
        self.ref_count.open();
    }

    pub fn close(&self) {
        self.ref_count.close();
    }

    pub fn signal(&self, kernel: &KernelCore) -> KResult<()> {
        self.readable.signal(kernel)
    }

    pub fn clear(&self, kernel: &KernelCore) -> KResult<()> {
        self.readable.clear(kernel)
    }
}
