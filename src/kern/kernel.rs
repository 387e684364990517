//! Kernel context
//!
//! [`KernelCore`] owns every kernel-wide service: the global scheduler context, one scheduler per
//! core, the timeout manager, the exclusive monitor, and the thread and process registries. It
//! is passed by reference to every operation; nothing in the crate is a process-wide static.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info};
use spin::Mutex;

use crate::config::KernelConfig;
use crate::kern::exclusive_monitor::ExclusiveMonitor;
use crate::kern::lock::{KSchedulerLock, KScopedSchedulerLock};
use crate::kern::process::{KProcess, ProcessParams};
use crate::kern::scheduler::{GlobalSchedulerContext, KScheduler, SchedulerHost};
use crate::kern::thread::{KThread, ThreadParams};
use crate::kern::timer::{Clock, TimeoutManager};
use crate::memory::Memory;
use crate::result::{KResult, KernelError};
use crate::types::{is_valid_core_id, is_valid_thread_priority, ProcessId, ThreadId, VAddr, NUM_CPU_CORES};

/// The emulated kernel
pub struct KernelCore {
    config: KernelConfig,
    memory: Arc<dyn Memory>,
    host: Arc<dyn SchedulerHost>,
    global_scheduler_context: GlobalSchedulerContext,
    schedulers: Vec<KScheduler>,
    timeout_manager: TimeoutManager,
    exclusive_monitor: ExclusiveMonitor,
    processes: Mutex<BTreeMap<ProcessId, Arc<KProcess>>>,
    next_thread_id: AtomicU64,
    next_process_id: AtomicU64,
    next_kernel_key: AtomicU64,
}

impl core::fmt::Debug for KernelCore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KernelCore")
            .field("config", &self.config)
            .field("schedulers", &self.schedulers)
            .field("timeout_manager", &self.timeout_manager)
            .finish()
    }
}

impl KernelCore {
    /// Build a kernel over `memory`, timing waits with `clock` and switching through `host`
    pub fn new(
        config: KernelConfig,
        memory: Arc<dyn Memory>,
        clock: Arc<dyn Clock>,
        host: Arc<dyn SchedulerHost>,
    ) -> KResult<Self> {
        config.validate()?;

        let next_thread_id = AtomicU64::new(1);
        let schedulers = (0..NUM_CPU_CORES as i32)
            .map(|core| {
                let id = ThreadId(next_thread_id.fetch_add(1, Ordering::Relaxed));
                KScheduler::new(core, KThread::new_idle(id, core))
            })
            .collect();

        info!(
            "kernel initialized: {} cores, multicore {}",
            NUM_CPU_CORES, config.multicore
        );

        Ok(Self {
            exclusive_monitor: ExclusiveMonitor::new(Arc::clone(&memory)),
            timeout_manager: TimeoutManager::new(clock),
            config,
            memory,
            host,
            global_scheduler_context: GlobalSchedulerContext::new(),
            schedulers,
            processes: Mutex::new(BTreeMap::new()),
            next_thread_id,
            next_process_id: AtomicU64::new(1),
            next_kernel_key: AtomicU64::new(1),
        })
    }

    // ------------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<dyn Memory> {
        &self.memory
    }

    pub fn host(&self) -> &dyn SchedulerHost {
        self.host.as_ref()
    }

    pub fn scheduler_lock(&self) -> &KSchedulerLock {
        self.global_scheduler_context.scheduler_lock()
    }

    pub fn global_scheduler_context(&self) -> &GlobalSchedulerContext {
        &self.global_scheduler_context
    }

    /// Scheduler of `core`
    ///
    /// `core` must be below `NUM_CPU_CORES`.
    pub fn scheduler(&self, core: usize) -> &KScheduler {
        &self.schedulers[core]
    }

    pub fn timeout_manager(&self) -> &TimeoutManager {
        &self.timeout_manager
    }

    pub fn exclusive_monitor(&self) -> &ExclusiveMonitor {
        &self.exclusive_monitor
    }

    /// Thread running on `core`
    pub fn current_thread(&self, core: usize) -> Arc<KThread> {
        self.scheduler(core).current_thread()
    }

    /// Fresh key for a kernel-internal lock
    pub fn next_kernel_key(&self) -> u64 {
        self.next_kernel_key.fetch_add(1, Ordering::Relaxed)
    }

    // ------------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------------

    pub fn create_process(&self, params: ProcessParams) -> Arc<KProcess> {
        let id = ProcessId(self.next_process_id.fetch_add(1, Ordering::Relaxed));
        let process = KProcess::new(self, id, params);
        self.processes.lock().insert(id, Arc::clone(&process));
        debug!("process {} created", id.0);
        process
    }

    pub fn process_by_id(&self, id: ProcessId) -> Option<Arc<KProcess>> {
        self.processes.lock().get(&id).cloned()
    }

    pub(crate) fn unregister_process(&self, id: ProcessId) {
        self.processes.lock().remove(&id);
    }

    /// Create an Initialized guest thread in `process`
    ///
    /// The returned thread carries one reference owned by the caller.
    pub fn create_user_thread(&self, process: &Arc<KProcess>, params: ThreadParams) -> KResult<Arc<KThread>> {
        if !process.check_thread_priority(params.priority) {
            return Err(KernelError::InvalidPriority);
        }
        if !is_valid_core_id(params.core) {
            return Err(KernelError::InvalidCoreId);
        }

        let id = ThreadId(self.next_thread_id.fetch_add(1, Ordering::Relaxed));
        let thread = KThread::new_user(id, process, params);
        self.global_scheduler_context.add_thread(&thread);
        process.register_thread(&thread);
        debug!(
            "thread {} created in process {} (priority {}, core {})",
            id.0,
            process.id().0,
            params.priority,
            params.core
        );
        Ok(thread)
    }

    /// Create an Initialized kernel thread
    pub fn create_kernel_thread(&self, priority: i32, core: i32) -> KResult<Arc<KThread>> {
        if !is_valid_thread_priority(priority) {
            return Err(KernelError::InvalidPriority);
        }
        if !is_valid_core_id(core) {
            return Err(KernelError::InvalidCoreId);
        }

        let id = ThreadId(self.next_thread_id.fetch_add(1, Ordering::Relaxed));
        let thread = KThread::new_kernel(id, priority, core);
        self.global_scheduler_context.add_thread(&thread);
        Ok(thread)
    }

    pub fn thread_by_id(&self, id: ThreadId) -> Option<Arc<KThread>> {
        self.global_scheduler_context.thread_by_id(id)
    }

    // ------------------------------------------------------------------------
    // Guest memory
    // ------------------------------------------------------------------------

    pub fn read_from_user32(&self, addr: VAddr) -> KResult<u32> {
        if !self.memory.is_valid_virtual_address_range(addr, 4) {
            return Err(KernelError::InvalidCurrentMemory);
        }
        Ok(self.memory.read32(addr))
    }

    /// Plain kernel store to a guest word; breaks reservations covering it
    pub fn write_to_user32(&self, addr: VAddr, value: u32) -> KResult<()> {
        if !self.memory.is_valid_virtual_address_range(addr, 4) {
            return Err(KernelError::InvalidCurrentMemory);
        }
        self.memory.write32(addr, value);
        self.exclusive_monitor.invalidate(addr, 4);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Time
    // ------------------------------------------------------------------------

    /// One preemption round: rotate each core's configured priority level
    pub fn preempt_threads(&self) {
        let _sl = KScopedSchedulerLock::new(self);
        for (core, &priority) in self.config.preemption_priorities.iter().enumerate() {
            KScheduler::rotate_scheduled_queue(self, core as i32, priority);
        }
    }

    /// Fire expired thread timeouts; returns how many fired
    pub fn process_timeouts(&self) -> usize {
        self.timeout_manager.process_expired(self)
    }
}
