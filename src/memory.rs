//! Guest memory interface
//!
//! The kernel only needs a narrow contract from guest memory: bounds checking, plain loads and
//! stores of naturally sized words, and a host compare-and-swap so the exclusive monitor can
//! commit guest store-exclusive instructions. [`FlatMemory`] is a contiguous little-endian
//! region implementing that contract.

use log::warn;
use spin::Mutex;

use crate::types::VAddr;

/// Guest memory as seen by the kernel
///
/// Loads from and stores to addresses outside the valid range must not panic; callers check
/// [`Memory::is_valid_virtual_address_range`] first and report invalid memory themselves.
pub trait Memory: Send + Sync {
    /// Whether `[addr, addr + size)` is mapped for the guest
    fn is_valid_virtual_address_range(&self, addr: VAddr, size: u64) -> bool;

    fn read8(&self, addr: VAddr) -> u8;
    fn read16(&self, addr: VAddr) -> u16;
    fn read32(&self, addr: VAddr) -> u32;
    fn read64(&self, addr: VAddr) -> u64;

    fn read128(&self, addr: VAddr) -> u128 {
        (self.read64(addr) as u128) | ((self.read64(addr + 8) as u128) << 64)
    }

    fn write8(&self, addr: VAddr, value: u8);
    fn write16(&self, addr: VAddr, value: u16);
    fn write32(&self, addr: VAddr, value: u32);
    fn write64(&self, addr: VAddr, value: u64);

    fn write128(&self, addr: VAddr, value: u128) {
        self.write64(addr, value as u64);
        self.write64(addr + 8, (value >> 64) as u64);
    }

    /// Atomically store `value` if the word still holds `expected`
    fn compare_exchange8(&self, addr: VAddr, expected: u8, value: u8) -> bool;
    fn compare_exchange16(&self, addr: VAddr, expected: u16, value: u16) -> bool;
    fn compare_exchange32(&self, addr: VAddr, expected: u32, value: u32) -> bool;
    fn compare_exchange64(&self, addr: VAddr, expected: u64, value: u64) -> bool;
    fn compare_exchange128(&self, addr: VAddr, expected: u128, value: u128) -> bool;
}

// ============================================================================
// Flat Memory
// ============================================================================

/// A contiguous guest region backed by host memory
#[derive(Debug)]
pub struct FlatMemory {
    base: VAddr,
    data: Mutex<Vec<u8>>,
}

impl FlatMemory {
    /// Create a zeroed region of `size` bytes starting at `base`
    pub fn new(base: VAddr, size: usize) -> Self {
        Self {
            base,
            data: Mutex::new(vec![0; size]),
        }
    }

    /// First guest address of the region
    pub fn base(&self) -> VAddr {
        self.base
    }

    /// Size of the region in bytes
    pub fn size(&self) -> usize {
        self.data.lock().len()
    }

    fn offset(&self, addr: VAddr, size: usize, len: usize) -> Option<usize> {
        let offset = usize::try_from(addr.checked_sub(self.base)?).ok()?;
        let end = offset.checked_add(size)?;
        (end <= len).then_some(offset)
    }

    fn load<const N: usize>(&self, addr: VAddr) -> [u8; N] {
        let data = self.data.lock();
        let mut out = [0u8; N];
        match self.offset(addr, N, data.len()) {
            Some(off) => out.copy_from_slice(&data[off..off + N]),
            None => warn!("unmapped guest read of {} bytes at {:#x}", N, addr),
        }
        out
    }

    fn store<const N: usize>(&self, addr: VAddr, bytes: [u8; N]) {
        let mut data = self.data.lock();
        let len = data.len();
        match self.offset(addr, N, len) {
            Some(off) => data[off..off + N].copy_from_slice(&bytes),
            None => warn!("unmapped guest write of {} bytes at {:#x}", N, addr),
        }
    }

    fn exchange<const N: usize>(&self, addr: VAddr, expected: [u8; N], value: [u8; N]) -> bool {
        let mut data = self.data.lock();
        let len = data.len();
        let Some(off) = self.offset(addr, N, len) else {
            return false;
        };
        if data[off..off + N] != expected {
            return false;
        }
        data[off..off + N].copy_from_slice(&value);
        true
    }
}

impl Memory for FlatMemory {
    fn is_valid_virtual_address_range(&self, addr: VAddr, size: u64) -> bool {
        let Ok(size) = usize::try_from(size) else {
            return false;
        };
        let len = self.data.lock().len();
        self.offset(addr, size, len).is_some()
    }

    fn read8(&self, addr: VAddr) -> u8 {
        u8::from_le_bytes(self.load(addr))
    }

    fn read16(&self, addr: VAddr) -> u16 {
        u16::from_le_bytes(self.load(addr))
    }

    fn read32(&self, addr: VAddr) -> u32 {
        u32::from_le_bytes(self.load(addr))
    }

    fn read64(&self, addr: VAddr) -> u64 {
        u64::from_le_bytes(self.load(addr))
    }

    fn read128(&self, addr: VAddr) -> u128 {
        u128::from_le_bytes(self.load(addr))
    }

    fn write8(&self, addr: VAddr, value: u8) {
        self.store(addr, value.to_le_bytes())
    }

    fn write16(&self, addr: VAddr, value: u16) {
        self.store(addr, value.to_le_bytes())
    }

    fn write32(&self, addr: VAddr, value: u32) {
        self.store(addr, value.to_le_bytes())
    }

    fn write64(&self, addr: VAddr, value: u64) {
        self.store(addr, value.to_le_bytes())
    }

    fn write128(&self, addr: VAddr, value: u128) {
        self.store(addr, value.to_le_bytes())
    }

    fn compare_exchange8(&self, addr: VAddr, expected: u8, value: u8) -> bool {
        self.exchange(addr, expected.to_le_bytes(), value.to_le_bytes())
    }

    fn compare_exchange16(&self, addr: VAddr, expected: u16, value: u16) -> bool {
        self.exchange(addr, expected.to_le_bytes(), value.to_le_bytes())
    }

    fn compare_exchange32(&self, addr: VAddr, expected: u32, value: u32) -> bool {
        self.exchange(addr, expected.to_le_bytes(), value.to_le_bytes())
    }

    fn compare_exchange64(&self, addr: VAddr, expected: u64, value: u64) -> bool {
        self.exchange(addr, expected.to_le_bytes(), value.to_le_bytes())
    }

    fn compare_exchange128(&self, addr: VAddr, expected: u128, value: u128) -> bool {
        self.exchange(addr, expected.to_le_bytes(), value.to_le_bytes())
    }
}
