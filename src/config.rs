//! Kernel configuration
//!
//! Settings the embedding frontend chooses once, before the kernel is constructed.

use crate::result::{KResult, KernelError};
use crate::types::{is_valid_thread_priority, DEFAULT_THREAD_PRIORITY, NUM_CPU_CORES};

/// Hard limit on the number of handles a process may hold
pub const MAX_HANDLE_TABLE_SIZE: usize = 1024;

/// Priority levels rotated by the preemption timer on each core
pub const DEFAULT_PREEMPTION_PRIORITIES: [i32; NUM_CPU_CORES] = [59, 59, 59, 63];

/// Kernel configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Run each emulated core on its own host thread
    pub multicore: bool,
    /// Number of handles each new process may hold
    pub handle_table_size: usize,
    /// Priority rotated by [`crate::kern::KernelCore::preempt_threads`] per core
    pub preemption_priorities: [i32; NUM_CPU_CORES],
    /// Priority used when thread creation does not name one
    pub default_thread_priority: i32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            multicore: true,
            handle_table_size: MAX_HANDLE_TABLE_SIZE,
            preemption_priorities: DEFAULT_PREEMPTION_PRIORITIES,
            default_thread_priority: DEFAULT_THREAD_PRIORITY,
        }
    }
}

impl KernelConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Select single- or multi-core host execution
    pub fn with_multicore(mut self, multicore: bool) -> Self {
        self.multicore = multicore;
        self
    }

    /// Limit the per-process handle table
    pub fn with_handle_table_size(mut self, size: usize) -> Self {
        self.handle_table_size = size;
        self
    }

    /// Override the preemption priorities
    pub fn with_preemption_priorities(mut self, priorities: [i32; NUM_CPU_CORES]) -> Self {
        self.preemption_priorities = priorities;
        self
    }

    /// Check the configuration before the kernel is built from it
    pub fn validate(&self) -> KResult<()> {
        if self.handle_table_size == 0 || self.handle_table_size > MAX_HANDLE_TABLE_SIZE {
            return Err(KernelError::OutOfRange);
        }
        if !is_valid_thread_priority(self.default_thread_priority) {
            return Err(KernelError::InvalidPriority);
        }
        if !self
            .preemption_priorities
            .iter()
            .all(|&p| is_valid_thread_priority(p))
        {
            return Err(KernelError::InvalidPriority);
        }
        Ok(())
    }
}
