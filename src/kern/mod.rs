//! Kern subsystem - Core kernel primitives
//!
//! Contains the scheduler and its lock, threads and their wait queues, the guest-visible
//! synchronization primitives, handle tables, and the services they share.

pub mod address_arbiter;
pub mod affinity;
pub mod condition_variable;
pub mod event;
pub mod exclusive_monitor;
pub mod handle_table;
pub mod kernel;
pub mod light_lock;
pub mod lock;
pub mod object;
pub mod priority_queue;
pub mod process;
pub mod scheduler;
pub mod sync_object;
pub mod thread;
pub mod thread_queue;
pub mod thread_tree;
pub mod timer;

pub use address_arbiter::{ArbitrationType, KAddressArbiter, SignalType};
pub use affinity::KAffinityMask;
pub use condition_variable::KConditionVariable;
pub use event::{KEvent, KReadableEvent};
pub use exclusive_monitor::ExclusiveMonitor;
pub use handle_table::{KHandleTable, PSEUDO_HANDLE_CURRENT_PROCESS, PSEUDO_HANDLE_CURRENT_THREAD};
pub use kernel::KernelCore;
pub use light_lock::KLightLock;
pub use lock::{KScopedSchedulerLock, KSchedulerLock};
pub use object::KObject;
pub use process::{KProcess, ProcessParams};
pub use scheduler::{KScheduler, NullHost, SchedulerHost};
pub use sync_object::KSynchronizationObject;
pub use thread::{KThread, SuspendType, ThreadActivity, ThreadParams, ThreadState, ThreadWaitReasonForDebugging};
pub use thread_queue::{SyncObjectList, WaitStatus};
pub use timer::{Clock, ManualClock, SteadyClock, TimeoutManager};
