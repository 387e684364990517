//! Process
//!
//! The guest-visible container of threads: it owns the handle table, the address arbiter and
//! condition variable trees its threads wait in, and the core and priority limits its threads
//! are created under.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI64, Ordering};

use log::debug;
use spin::Mutex;

use crate::kern::address_arbiter::KAddressArbiter;
use crate::kern::condition_variable::KConditionVariable;
use crate::kern::handle_table::KHandleTable;
use crate::kern::kernel::KernelCore;
use crate::kern::light_lock::KLightLock;
use crate::kern::object::RefCount;
use crate::kern::thread::KThread;
use crate::types::{is_valid_thread_priority, ProcessId, ThreadId, NUM_CPU_CORES};

/// Creation parameters of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessParams {
    /// Cores the process' threads may run on
    pub core_mask: u64,
    /// Bit `p` set when threads may use priority `p`
    pub priority_mask: u64,
    /// Core used for `IDEAL_CORE_USE_PROCESS_VALUE`
    pub ideal_core: i32,
}

impl Default for ProcessParams {
    fn default() -> Self {
        Self {
            core_mask: (1 << NUM_CPU_CORES) - 1,
            priority_mask: u64::MAX,
            ideal_core: 0,
        }
    }
}

/// A guest process
#[derive(Debug)]
pub struct KProcess {
    process_id: ProcessId,
    ref_count: RefCount,
    params: ProcessParams,
    handle_table: KHandleTable,
    address_arbiter: KAddressArbiter,
    condition_variable: KConditionVariable,
    state_lock: KLightLock,
    scheduled_count: AtomicI64,
    threads: Mutex<Vec<Arc<KThread>>>,
}

impl KProcess {
    pub(crate) fn new(kernel: &KernelCore, process_id: ProcessId, params: ProcessParams) -> Arc<Self> {
        Arc::new(Self {
            process_id,
            ref_count: RefCount::new(1),
            params,
            handle_table: KHandleTable::new(kernel.config().handle_table_size),
            address_arbiter: KAddressArbiter::new(),
            condition_variable: KConditionVariable::new(),
            state_lock: KLightLock::new(kernel),
            scheduled_count: AtomicI64::new(0),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> ProcessId {
        self.process_id
    }

    pub fn handle_table(&self) -> &KHandleTable {
        &self.handle_table
    }

    pub fn address_arbiter(&self) -> &KAddressArbiter {
        &self.address_arbiter
    }

    pub fn condition_variable(&self) -> &KConditionVariable {
        &self.condition_variable
    }

    /// Lock serializing process-wide state changes
    pub fn state_lock(&self) -> &KLightLock {
        &self.state_lock
    }

    pub fn core_mask(&self) -> u64 {
        self.params.core_mask
    }

    pub fn priority_mask(&self) -> u64 {
        self.params.priority_mask
    }

    pub fn ideal_core(&self) -> i32 {
        self.params.ideal_core
    }

    /// Whether threads of this process may use `priority`
    pub fn check_thread_priority(&self, priority: i32) -> bool {
        is_valid_thread_priority(priority) && self.params.priority_mask & (1u64 << priority) != 0
    }

    // ------------------------------------------------------------------------
    // Scheduling accounting
    // ------------------------------------------------------------------------

    /// Number of scheduling events involving this process' threads
    pub fn scheduled_count(&self) -> i64 {
        self.scheduled_count.load(Ordering::Acquire)
    }

    pub fn increment_scheduled_count(&self) {
        self.scheduled_count.fetch_add(1, Ordering::AcqRel);
    }

    // ------------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------------

    pub(crate) fn register_thread(&self, thread: &Arc<KThread>) {
        self.threads.lock().push(Arc::clone(thread));
    }

    pub(crate) fn unregister_thread(&self, id: ThreadId) {
        self.threads.lock().retain(|thread| thread.id() != id);
    }

    pub fn thread_list(&self) -> Vec<Arc<KThread>> {
        self.threads.lock().clone()
    }

    // ------------------------------------------------------------------------
    // Reference counting
    // ------------------------------------------------------------------------

    pub fn open(&self) {
        self.ref_count.open();
    }

    pub fn close(&self, kernel: &KernelCore) {
        if self.ref_count.close() {
            self.finalize(kernel);
        }
    }

    fn finalize(&self, kernel: &KernelCore) {
        self.handle_table.finalize(kernel);
        kernel.unregister_process(self.process_id);
        debug!("process {} finalized", self.process_id.0);
    }
}
