//! Kernel result codes
//!
//! Every recoverable failure in this crate maps to one guest-visible result code. The packed
//! form (`module | description << 9`) is what the supervisor-call dispatcher writes back into
//! guest registers.

use thiserror::Error;

/// Error module number of the guest kernel
pub const KERNEL_ERROR_MODULE: u32 = 1;

/// Packed value of a successful result
pub const RESULT_SUCCESS_RAW: u32 = 0;

/// Result type used throughout the kernel
pub type KResult<T> = Result<T, KernelError>;

/// Errors returned by kernel operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelError {
    #[error("no synchronization object")]
    NoSynchronizationObject,

    #[error("termination requested")]
    TerminationRequested,

    #[error("invalid size")]
    InvalidSize,

    #[error("invalid address")]
    InvalidAddress,

    #[error("out of resource")]
    OutOfResource,

    #[error("out of handles")]
    OutOfHandles,

    #[error("invalid current memory")]
    InvalidCurrentMemory,

    #[error("invalid priority")]
    InvalidPriority,

    #[error("invalid core id")]
    InvalidCoreId,

    #[error("invalid handle")]
    InvalidHandle,

    #[error("invalid pointer")]
    InvalidPointer,

    #[error("invalid combination")]
    InvalidCombination,

    #[error("timed out")]
    TimedOut,

    #[error("cancelled")]
    Cancelled,

    #[error("out of range")]
    OutOfRange,

    #[error("invalid enum value")]
    InvalidEnumValue,

    #[error("not found")]
    NotFound,

    #[error("busy")]
    Busy,

    #[error("invalid state")]
    InvalidState,

    #[error("limit reached")]
    LimitReached,
}

impl KernelError {
    /// Description field of the guest result code
    pub const fn description(&self) -> u32 {
        match self {
            KernelError::NoSynchronizationObject => 57,
            KernelError::TerminationRequested => 59,
            KernelError::InvalidSize => 101,
            KernelError::InvalidAddress => 102,
            KernelError::OutOfResource => 103,
            KernelError::OutOfHandles => 105,
            KernelError::InvalidCurrentMemory => 106,
            KernelError::InvalidPriority => 112,
            KernelError::InvalidCoreId => 113,
            KernelError::InvalidHandle => 114,
            KernelError::InvalidPointer => 115,
            KernelError::InvalidCombination => 116,
            KernelError::TimedOut => 117,
            KernelError::Cancelled => 118,
            KernelError::OutOfRange => 119,
            KernelError::InvalidEnumValue => 120,
            KernelError::NotFound => 121,
            KernelError::Busy => 122,
            KernelError::InvalidState => 125,
            KernelError::LimitReached => 132,
        }
    }

    /// Packed guest result code
    pub const fn raw(&self) -> u32 {
        KERNEL_ERROR_MODULE | (self.description() << 9)
    }

    /// Decode a packed guest result code
    ///
    /// Returns `None` for success and for codes this kernel never produces.
    pub fn from_raw(raw: u32) -> Option<Self> {
        const ALL: [KernelError; 20] = [
            KernelError::NoSynchronizationObject,
            KernelError::TerminationRequested,
            KernelError::InvalidSize,
            KernelError::InvalidAddress,
            KernelError::OutOfResource,
            KernelError::OutOfHandles,
            KernelError::InvalidCurrentMemory,
            KernelError::InvalidPriority,
            KernelError::InvalidCoreId,
            KernelError::InvalidHandle,
            KernelError::InvalidPointer,
            KernelError::InvalidCombination,
            KernelError::TimedOut,
            KernelError::Cancelled,
            KernelError::OutOfRange,
            KernelError::InvalidEnumValue,
            KernelError::NotFound,
            KernelError::Busy,
            KernelError::InvalidState,
            KernelError::LimitReached,
        ];
        ALL.iter().copied().find(|e| e.raw() == raw)
    }
}

/// Packs a kernel result into the value placed in guest registers
pub fn raw_result<T>(result: &KResult<T>) -> u32 {
    match result {
        Ok(_) => RESULT_SUCCESS_RAW,
        Err(e) => e.raw(),
    }
}
