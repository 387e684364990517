//! Shared harness for integration tests
//!
//! Builds a kernel over a flat guest region with a manually stepped clock and a host that
//! records every context switch.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use guest_kern::kern::{
    KObject, KProcess, KThread, ManualClock, ProcessParams, SchedulerHost, ThreadParams,
};
use guest_kern::types::{Handle, VAddr};
use guest_kern::{FlatMemory, KernelConfig, KernelCore, Memory};

/// Start of the guest region
pub const MEM_BASE: VAddr = 0x1000_0000;

/// Size of the guest region
pub const MEM_SIZE: usize = 0x1_0000;

/// A recorded context switch: (core, previous thread id, next thread id)
pub type Switch = (i32, u64, u64);

#[derive(Debug, Default)]
pub struct RecordingHost {
    switches: Mutex<Vec<Switch>>,
    interrupts: Mutex<Vec<u64>>,
}

impl RecordingHost {
    pub fn switches(&self) -> Vec<Switch> {
        self.switches.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn interrupts(&self) -> Vec<u64> {
        self.interrupts.lock().map(|i| i.clone()).unwrap_or_default()
    }
}

impl SchedulerHost for RecordingHost {
    fn context_switch(&self, core: i32, prev: &Arc<KThread>, next: &Arc<KThread>) {
        if let Ok(mut switches) = self.switches.lock() {
            switches.push((core, prev.id().0, next.id().0));
        }
    }

    fn interrupt_cores(&self, core_mask: u64) {
        if let Ok(mut interrupts) = self.interrupts.lock() {
            interrupts.push(core_mask);
        }
    }
}

pub struct TestKernel {
    pub kernel: KernelCore,
    pub clock: Arc<ManualClock>,
    pub memory: Arc<FlatMemory>,
    pub host: Arc<RecordingHost>,
    pub process: Arc<KProcess>,
}

impl TestKernel {
    pub fn new() -> Self {
        Self::with_config(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> Self {
        Self::with_region(config, MEM_BASE, MEM_SIZE)
    }

    /// Kernel over a guest region of `size` bytes at `base`
    pub fn with_region(config: KernelConfig, base: VAddr, size: usize) -> Self {
        let clock = Arc::new(ManualClock::new());
        let memory = Arc::new(FlatMemory::new(base, size));
        let host = Arc::new(RecordingHost::default());
        let kernel = KernelCore::new(config, memory.clone(), clock.clone(), host.clone())
            .expect("default configuration is valid");
        let process = kernel.create_process(ProcessParams::default());
        Self {
            kernel,
            clock,
            memory,
            host,
            process,
        }
    }

    /// Create a thread without starting it; returns it with its handle
    pub fn create(&self, priority: i32, core: i32) -> (Arc<KThread>, Handle) {
        let thread = self
            .kernel
            .create_user_thread(
                &self.process,
                ThreadParams {
                    entry_point: 0x8000,
                    argument: 0,
                    stack_top: 0x9000,
                    priority,
                    core,
                },
            )
            .expect("thread creation");
        let handle = self
            .process
            .handle_table()
            .add(KObject::Thread(thread.clone()))
            .expect("handle");
        thread.close(&self.kernel);
        (thread, handle)
    }

    /// Create and start a thread
    pub fn spawn(&self, priority: i32, core: i32) -> (Arc<KThread>, Handle) {
        let (thread, handle) = self.create(priority, core);
        thread.run(&self.kernel).expect("thread start");
        (thread, handle)
    }

    /// Guest address `offset` bytes into the region
    pub fn addr(&self, offset: u64) -> VAddr {
        self.memory.base() + offset
    }

    pub fn read32(&self, addr: VAddr) -> u32 {
        self.memory.read32(addr)
    }

    pub fn write32(&self, addr: VAddr, value: u32) {
        self.memory.write32(addr, value)
    }

    /// Step the clock and fire expired timeouts
    pub fn advance(&self, ns: i64) -> usize {
        self.clock.advance(ns);
        self.kernel.process_timeouts()
    }
}
