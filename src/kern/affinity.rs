//! Per-thread core affinity mask

use crate::types::NUM_CPU_CORES;

/// Mask with one bit per emulated core
const ALLOWED_AFFINITY_MASK: u64 = (1 << NUM_CPU_CORES) - 1;

/// Set of cores a thread may run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KAffinityMask {
    mask: u64,
}

impl KAffinityMask {
    /// Empty mask
    pub const fn new() -> Self {
        Self { mask: 0 }
    }

    /// Mask containing a single core
    pub const fn from_core(core: i32) -> Self {
        Self {
            mask: Self::core_bit(core),
        }
    }

    pub const fn get_affinity_mask(&self) -> u64 {
        self.mask
    }

    /// Replace the mask; bits for nonexistent cores are dropped
    pub fn set_affinity_mask(&mut self, mask: u64) {
        self.mask = mask & ALLOWED_AFFINITY_MASK;
    }

    pub const fn get_affinity(&self, core: i32) -> bool {
        self.mask & Self::core_bit(core) != 0
    }

    pub fn set_affinity(&mut self, core: i32, set: bool) {
        if set {
            self.mask |= Self::core_bit(core);
        } else {
            self.mask &= !Self::core_bit(core);
        }
    }

    pub fn set_all(&mut self) {
        self.mask = ALLOWED_AFFINITY_MASK;
    }

    /// Highest numbered core in the mask, if any
    pub const fn highest_core(&self) -> Option<i32> {
        if self.mask == 0 {
            None
        } else {
            Some(63 - self.mask.leading_zeros() as i32)
        }
    }

    /// Iterate over the cores in the mask, lowest first
    pub fn cores(&self) -> impl Iterator<Item = i32> {
        let mask = self.mask;
        (0..NUM_CPU_CORES as i32).filter(move |&core| mask & (1 << core) != 0)
    }

    const fn core_bit(core: i32) -> u64 {
        if core >= 0 && (core as usize) < NUM_CPU_CORES {
            1 << core
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_clear() {
        let mut mask = KAffinityMask::new();
        mask.set_affinity(1, true);
        mask.set_affinity(3, true);
        assert_eq!(mask.get_affinity_mask(), 0b1010);
        assert!(mask.get_affinity(3));
        mask.set_affinity(3, false);
        assert!(!mask.get_affinity(3));
        assert_eq!(mask.highest_core(), Some(1));
    }

    #[test]
    fn test_invalid_cores_ignored() {
        let mut mask = KAffinityMask::from_core(-1);
        assert_eq!(mask.get_affinity_mask(), 0);
        mask.set_affinity_mask(0xFF);
        assert_eq!(mask.get_affinity_mask(), 0xF);
        assert!(!mask.get_affinity(NUM_CPU_CORES as i32));
        assert_eq!(mask.cores().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }
}
