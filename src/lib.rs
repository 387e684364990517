//! guest_kern - host-side scheduling and synchronization engine for an emulated guest kernel
//!
//! This crate reproduces, on the host, the threading, locking and wait/wake behaviour a guest
//! kernel exposes to the code it runs: per-core priority scheduling, guest-visible mutexes,
//! condition variables and address arbiters, multi-object waits, handle tables, an exclusive
//! monitor for guest atomics and a timeout manager.
//!
//! The crate never parks host threads itself. A blocking primitive marks the calling guest
//! thread as waiting and returns [`kern::WaitStatus::Blocked`]; releasing the global scheduler
//! lock then asks the embedding frontend (through [`kern::SchedulerHost`]) to switch the core to
//! the next runnable thread. Once the waiting thread runs again its outcome is read back with
//! [`kern::KThread::wait_result`].

// Kernel types carry explicit initialization that does not fit Default
#![allow(clippy::new_without_default)]

extern crate alloc;

// Core types
pub mod types;

pub mod config;
pub mod kern;
pub mod memory;
pub mod result;
pub mod svc;

pub use config::KernelConfig;
pub use kern::KernelCore;
pub use memory::{FlatMemory, Memory};
pub use result::{KResult, KernelError};
