//! Common types used across the kernel
//!
//! This module defines shared types and guest-visible constants to avoid circular dependencies.

/// Guest virtual address
pub type VAddr = u64;

/// Guest handle value
pub type Handle = u32;

/// Number of emulated CPU cores
pub const NUM_CPU_CORES: usize = 4;

// ============================================================================
// Priorities
// ============================================================================

/// Highest (numerically lowest) guest thread priority
pub const HIGHEST_THREAD_PRIORITY: i32 = 0;

/// Lowest (numerically highest) guest thread priority
pub const LOWEST_THREAD_PRIORITY: i32 = 63;

/// Priority reserved for the per-core idle threads
pub const IDLE_THREAD_PRIORITY: i32 = LOWEST_THREAD_PRIORITY + 1;

/// Priority reserved for host-side dummy threads
pub const DUMMY_THREAD_PRIORITY: i32 = LOWEST_THREAD_PRIORITY + 2;

/// Priority a user thread gets when nothing else is requested
pub const DEFAULT_THREAD_PRIORITY: i32 = 44;

/// Highest priority a system thread may have
pub const SYSTEM_THREAD_PRIORITY_HIGHEST: i32 = 16;

/// Priority a thread is raised to while it is being torn down
pub const TERMINATING_THREAD_PRIORITY: i32 = 3;

/// Threads above this priority are never migrated away from their core
pub const HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY: i32 = 2;

// ============================================================================
// Supervisor call constants
// ============================================================================

/// Maximum number of handles accepted by a multi-object wait
pub const ARGUMENT_HANDLE_COUNT_MAX: usize = 64;

/// Bit set in a guest lock word when other threads wait for the lock
pub const HANDLE_WAIT_MASK: u32 = 0x4000_0000;

/// Ideal core value meaning "any core"
pub const IDEAL_CORE_DONT_CARE: i32 = -1;

/// Ideal core value meaning "use the owning process' ideal core"
pub const IDEAL_CORE_USE_PROCESS_VALUE: i32 = -2;

/// Ideal core value meaning "keep the current ideal core"
pub const IDEAL_CORE_NO_UPDATE: i32 = -3;

/// Start of the guest kernel address region
pub const KERNEL_ADDRESS_SPACE_BASE: VAddr = 0xFFFF_FF80_0000_0000;

/// End (exclusive) of the guest kernel address region
pub const KERNEL_ADDRESS_SPACE_END: VAddr = 0xFFFF_FFFF_FFE0_0000;

/// Returns true if the address lies in the guest kernel's own address space
pub const fn is_kernel_address(addr: VAddr) -> bool {
    KERNEL_ADDRESS_SPACE_BASE <= addr && addr < KERNEL_ADDRESS_SPACE_END
}

/// Returns true if the priority lies in the guest-visible range
pub const fn is_valid_thread_priority(priority: i32) -> bool {
    HIGHEST_THREAD_PRIORITY <= priority && priority <= LOWEST_THREAD_PRIORITY
}

/// Returns true if the core id names one of the emulated cores
pub const fn is_valid_core_id(core_id: i32) -> bool {
    0 <= core_id && core_id < NUM_CPU_CORES as i32
}

// ============================================================================
// Identifiers
// ============================================================================

/// Thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ThreadId(pub u64);

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ProcessId(pub u64);

/// Identity of the word a thread is blocked on while it waits for a lock owner
///
/// Guest mutexes and condition variables key their waiters by guest address. Kernel-internal
/// adaptive locks use a key taken from a private counter so they can never collide with guest
/// addresses; threads holding kernel-keyed waiters are never suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressKey {
    /// Not waiting on any lock word
    #[default]
    None,
    /// A guest lock word
    User(VAddr),
    /// A kernel adaptive lock
    Kernel(u64),
}

impl AddressKey {
    /// Whether the key belongs to a kernel-internal lock
    pub const fn is_kernel(&self) -> bool {
        matches!(self, AddressKey::Kernel(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_address_range() {
        assert!(is_kernel_address(KERNEL_ADDRESS_SPACE_BASE));
        assert!(!is_kernel_address(KERNEL_ADDRESS_SPACE_END));
        assert!(!is_kernel_address(0x1000));
    }

    #[test]
    fn test_reserved_priorities_outside_guest_range() {
        assert!(is_valid_thread_priority(DEFAULT_THREAD_PRIORITY));
        assert!(!is_valid_thread_priority(IDLE_THREAD_PRIORITY));
        assert!(!is_valid_thread_priority(DUMMY_THREAD_PRIORITY));
        assert!(!is_valid_thread_priority(-1));
    }

    #[test]
    fn test_address_key_kind() {
        assert!(AddressKey::Kernel(7).is_kernel());
        assert!(!AddressKey::User(7).is_kernel());
        assert_ne!(AddressKey::User(7), AddressKey::Kernel(7));
    }
}
