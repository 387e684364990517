//! Kernel objects
//!
//! Objects reachable from guest handles are reference counted on two levels: `Arc` keeps the
//! memory alive, while [`RefCount`] counts the kernel-visible references (handles, running
//! threads, in-flight operations). When the kernel count reaches zero the object is finalized
//! even if host code still holds an `Arc` to it.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::kern::event::{KEvent, KReadableEvent};
use crate::kern::kernel::KernelCore;
use crate::kern::process::KProcess;
use crate::kern::sync_object::KSynchronizationObject;
use crate::kern::thread::KThread;

/// Kernel-visible reference count
#[derive(Debug)]
pub struct RefCount(AtomicU32);

impl RefCount {
    pub const fn new(initial: u32) -> Self {
        Self(AtomicU32::new(initial))
    }

    pub fn open(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference; returns true when it was the last
    pub fn close(&self) -> bool {
        let prev = self.0.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev != 0, "kernel object closed more often than opened");
        prev == 1
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

/// Any object a handle can name
#[derive(Debug, Clone)]
pub enum KObject {
    Thread(Arc<KThread>),
    Process(Arc<KProcess>),
    Event(Arc<KEvent>),
    ReadableEvent(Arc<KReadableEvent>),
}

impl KObject {
    /// Take a kernel reference
    pub fn open(&self) {
        match self {
            KObject::Thread(thread) => thread.open(),
            KObject::Process(process) => process.open(),
            KObject::Event(event) => event.open(),
            KObject::ReadableEvent(event) => event.open(),
        }
    }

    /// Drop a kernel reference, finalizing the object if it was the last
    pub fn close(&self, kernel: &KernelCore) {
        match self {
            KObject::Thread(thread) => thread.close(kernel),
            KObject::Process(process) => process.close(kernel),
            KObject::Event(event) => event.close(),
            KObject::ReadableEvent(event) => event.close(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            KObject::Thread(_) => "KThread",
            KObject::Process(_) => "KProcess",
            KObject::Event(_) => "KEvent",
            KObject::ReadableEvent(_) => "KReadableEvent",
        }
    }

    pub fn as_thread(&self) -> Option<&Arc<KThread>> {
        match self {
            KObject::Thread(thread) => Some(thread),
            _ => None,
        }
    }

    pub fn as_process(&self) -> Option<&Arc<KProcess>> {
        match self {
            KObject::Process(process) => Some(process),
            _ => None,
        }
    }

    pub fn as_event(&self) -> Option<&Arc<KEvent>> {
        match self {
            KObject::Event(event) => Some(event),
            _ => None,
        }
    }

    pub fn as_readable_event(&self) -> Option<&Arc<KReadableEvent>> {
        match self {
            KObject::ReadableEvent(event) => Some(event),
            _ => None,
        }
    }

    /// The object as something a thread can wait on
    pub fn as_sync_object(&self) -> Option<Arc<dyn KSynchronizationObject>> {
        match self {
            KObject::Thread(thread) => Some(Arc::clone(thread) as Arc<dyn KSynchronizationObject>),
            KObject::ReadableEvent(event) => Some(Arc::clone(event) as Arc<dyn KSynchronizationObject>),
            KObject::Process(_) | KObject::Event(_) => None,
        }
    }

    /// Whether both handles name the same object
    pub fn ptr_eq(&self, other: &KObject) -> bool {
        match (self, other) {
            (KObject::Thread(a), KObject::Thread(b)) => Arc::ptr_eq(a, b),
            (KObject::Process(a), KObject::Process(b)) => Arc::ptr_eq(a, b),
            (KObject::Event(a), KObject::Event(b)) => Arc::ptr_eq(a, b),
            (KObject::ReadableEvent(a), KObject::ReadableEvent(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_count() {
        let count = RefCount::new(1);
        count.open();
        assert_eq!(count.get(), 2);
        assert!(!count.close());
        assert!(count.close());
        assert_eq!(count.get(), 0);
    }
}
