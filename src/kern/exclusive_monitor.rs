//! Exclusive monitor
//!
//! Emulates the load-exclusive / store-exclusive pair guest atomics are built from. A read
//! records a per-core reservation holding the value it saw; the matching write commits with a
//! host compare-and-swap against that value, so a store from any other agent in between makes it
//! fail. A successful write also breaks every other core's reservation overlapping it.

use alloc::sync::Arc;

use log::trace;
use spin::Mutex;

use crate::memory::Memory;
use crate::types::{VAddr, NUM_CPU_CORES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reservation {
    addr: VAddr,
    size: u64,
    value: u128,
}

impl Reservation {
    fn overlaps(&self, addr: VAddr, size: u64) -> bool {
        self.addr < addr.saturating_add(size) && addr < self.addr.saturating_add(self.size)
    }
}

/// Per-core reservations over guest memory
pub struct ExclusiveMonitor {
    memory: Arc<dyn Memory>,
    reservations: Mutex<[Option<Reservation>; NUM_CPU_CORES]>,
}

impl core::fmt::Debug for ExclusiveMonitor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExclusiveMonitor")
            .field("reservations", &*self.reservations.lock())
            .finish()
    }
}

macro_rules! exclusive_access {
    ($read:ident, $write:ident, $ty:ty, $mem_read:ident, $mem_cas:ident, $size:expr) => {
        /// Load-exclusive of this width on `core`
        pub fn $read(&self, core: usize, addr: VAddr) -> $ty {
            let value = self.memory.$mem_read(addr);
            self.reserve(core, addr, $size, value as u128);
            value
        }

        /// Store-exclusive of this width on `core`; returns true if the store happened
        pub fn $write(&self, core: usize, addr: VAddr, value: $ty) -> bool {
            let mut reservations = self.reservations.lock();
            let Some(reservation) = Self::take_reservation(&mut reservations, core, addr, $size) else {
                return false;
            };
            let committed = self
                .memory
                .$mem_cas(addr, reservation.value as $ty, value);
            if committed {
                Self::clear_overlapping(&mut reservations, core, addr, $size);
            }
            trace!(
                "exclusive write core {} addr {:#x} committed {}",
                core,
                addr,
                committed
            );
            committed
        }
    };
}

impl ExclusiveMonitor {
    pub fn new(memory: Arc<dyn Memory>) -> Self {
        Self {
            memory,
            reservations: Mutex::new([None; NUM_CPU_CORES]),
        }
    }

    fn reserve(&self, core: usize, addr: VAddr, size: u64, value: u128) {
        if let Some(slot) = self.reservations.lock().get_mut(core) {
            *slot = Some(Reservation { addr, size, value });
        }
    }

    fn take_reservation(
        reservations: &mut [Option<Reservation>; NUM_CPU_CORES],
        core: usize,
        addr: VAddr,
        size: u64,
    ) -> Option<Reservation> {
        let slot = reservations.get_mut(core)?;
        let reservation = slot.take()?;
        (reservation.addr == addr && reservation.size == size).then_some(reservation)
    }

    fn clear_overlapping(
        reservations: &mut [Option<Reservation>; NUM_CPU_CORES],
        except_core: usize,
        addr: VAddr,
        size: u64,
    ) {
        for (core, slot) in reservations.iter_mut().enumerate() {
            if core != except_core && slot.is_some_and(|r| r.overlaps(addr, size)) {
                *slot = None;
            }
        }
    }

    exclusive_access!(exclusive_read8, exclusive_write8, u8, read8, compare_exchange8, 1);
    exclusive_access!(exclusive_read16, exclusive_write16, u16, read16, compare_exchange16, 2);
    exclusive_access!(exclusive_read32, exclusive_write32, u32, read32, compare_exchange32, 4);
    exclusive_access!(exclusive_read64, exclusive_write64, u64, read64, compare_exchange64, 8);
    exclusive_access!(exclusive_read128, exclusive_write128, u128, read128, compare_exchange128, 16);

    /// Drop the reservation of `core`
    pub fn clear_exclusive(&self, core: usize) {
        if let Some(slot) = self.reservations.lock().get_mut(core) {
            *slot = None;
        }
    }

    /// Break every reservation overlapping a plain store to `[addr, addr + size)`
    pub fn invalidate(&self, addr: VAddr, size: u64) {
        let mut reservations = self.reservations.lock();
        for slot in reservations.iter_mut() {
            if slot.is_some_and(|r| r.overlaps(addr, size)) {
                *slot = None;
            }
        }
    }

    /// Whether `core` holds a reservation
    pub fn has_reservation(&self, core: usize) -> bool {
        self.reservations
            .lock()
            .get(core)
            .is_some_and(Option::is_some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FlatMemory;

    fn monitor() -> (Arc<FlatMemory>, ExclusiveMonitor) {
        let memory = Arc::new(FlatMemory::new(0x1000, 0x100));
        let monitor = ExclusiveMonitor::new(memory.clone());
        (memory, monitor)
    }

    #[test]
    fn test_read_write_pair_commits() {
        let (memory, monitor) = monitor();
        memory.write32(0x1000, 5);
        assert_eq!(monitor.exclusive_read32(0, 0x1000), 5);
        assert!(monitor.exclusive_write32(0, 0x1000, 6));
        assert_eq!(memory.read32(0x1000), 6);
        assert!(!monitor.has_reservation(0));
    }

    #[test]
    fn test_other_core_write_breaks_reservation() {
        let (memory, monitor) = monitor();
        monitor.exclusive_read32(0, 0x1000);
        monitor.exclusive_read32(1, 0x1000);
        assert!(monitor.exclusive_write32(1, 0x1000, 9));
        assert!(!monitor.exclusive_write32(0, 0x1000, 7));
        assert_eq!(memory.read32(0x1000), 9);
    }

    #[test]
    fn test_plain_store_in_between_fails_write() {
        let (memory, monitor) = monitor();
        monitor.exclusive_read64(2, 0x1008);
        memory.write64(0x1008, 0xDEAD);
        assert!(!monitor.exclusive_write64(2, 0x1008, 1));
        assert_eq!(memory.read64(0x1008), 0xDEAD);
    }

    #[test]
    fn test_write_without_reservation_fails() {
        let (_memory, monitor) = monitor();
        assert!(!monitor.exclusive_write8(0, 0x1000, 1));
        monitor.exclusive_read16(0, 0x1000);
        assert!(!monitor.exclusive_write16(0, 0x1002, 1));
    }

    #[test]
    fn test_invalidate_and_clear() {
        let (_memory, monitor) = monitor();
        monitor.exclusive_read32(0, 0x1010);
        monitor.exclusive_read32(1, 0x1040);
        monitor.invalidate(0x1012, 2);
        assert!(!monitor.has_reservation(0));
        assert!(monitor.has_reservation(1));
        monitor.clear_exclusive(1);
        assert!(!monitor.has_reservation(1));
    }
}
