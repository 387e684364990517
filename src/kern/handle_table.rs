//! Handle Table
//!
//! Maps guest handles to kernel objects. A handle packs the slot index above bit 15 and a
//! 15-bit generation below it; the generation changes every time a slot is reused, so a handle
//! kept after `remove` never names the slot's next occupant.
//!
//! Free slots are chained through their generation field. The table has its own spin lock; it is
//! never held while an object is closed, since closing can finalize the object.

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, trace};
use spin::Mutex;

use crate::kern::kernel::KernelCore;
use crate::kern::object::KObject;
use crate::kern::thread::KThread;
use crate::result::{KResult, KernelError};
use crate::types::Handle;

/// Handle naming the calling thread
pub const PSEUDO_HANDLE_CURRENT_THREAD: Handle = 0xFFFF_8000;

/// Handle naming the calling thread's process
pub const PSEUDO_HANDLE_CURRENT_PROCESS: Handle = 0xFFFF_8001;

/// The handle value no object ever has
pub const INVALID_HANDLE: Handle = 0;

const GENERATION_BITS: u32 = 15;
const GENERATION_MASK: u32 = (1 << GENERATION_BITS) - 1;
const MIN_GENERATION: u16 = 1;
const MAX_GENERATION: u16 = GENERATION_MASK as u16;

/// Free-list terminator
const FREE_LIST_END: u32 = u32::MAX;

/// Pack a slot index and generation into a handle
pub const fn encode_handle(index: u32, generation: u16) -> Handle {
    (index << GENERATION_BITS) | (generation as u32 & GENERATION_MASK)
}

/// Split a handle into (slot index, generation)
pub const fn decode_handle(handle: Handle) -> (u32, u16) {
    (handle >> GENERATION_BITS, (handle & GENERATION_MASK) as u16)
}

#[derive(Debug, Clone)]
enum Slot {
    Free { next_free: u32 },
    Used { generation: u16, object: KObject },
}

#[derive(Debug)]
struct TableInner {
    slots: Vec<Slot>,
    free_head: u32,
    next_generation: u16,
    count: usize,
    max_count: usize,
}

impl TableInner {
    fn allocate_generation(&mut self) -> u16 {
        let generation = self.next_generation;
        self.next_generation = if generation >= MAX_GENERATION {
            MIN_GENERATION
        } else {
            generation + 1
        };
        generation
    }

    fn lookup(&self, handle: Handle) -> Option<&KObject> {
        let (index, generation) = decode_handle(handle);
        if generation == 0 {
            return None;
        }
        match self.slots.get(index as usize)? {
            Slot::Used {
                generation: stored,
                object,
            } if *stored == generation => Some(object),
            _ => None,
        }
    }
}

/// Per-process handle table
#[derive(Debug)]
pub struct KHandleTable {
    inner: Mutex<TableInner>,
}

impl KHandleTable {
    /// Create a table of `size` slots
    pub fn new(size: usize) -> Self {
        let slots = (0..size)
            .map(|i| Slot::Free {
                next_free: if i + 1 < size {
                    (i + 1) as u32
                } else {
                    FREE_LIST_END
                },
            })
            .collect();
        Self {
            inner: Mutex::new(TableInner {
                slots,
                free_head: if size > 0 { 0 } else { FREE_LIST_END },
                next_generation: MIN_GENERATION,
                count: 0,
                max_count: 0,
            }),
        }
    }

    /// Store `object`, taking a kernel reference to it
    pub fn add(&self, object: KObject) -> KResult<Handle> {
        let mut inner = self.inner.lock();
        let index = inner.free_head;
        if index == FREE_LIST_END {
            return Err(KernelError::OutOfHandles);
        }
        let next_free = match inner.slots[index as usize] {
            Slot::Free { next_free } => next_free,
            Slot::Used { .. } => return Err(KernelError::OutOfHandles),
        };
        let generation = inner.allocate_generation();

        object.open();
        trace!("handle slot {} <- {}", index, object.type_name());
        inner.slots[index as usize] = Slot::Used { generation, object };
        inner.free_head = next_free;
        inner.count += 1;
        inner.max_count = inner.max_count.max(inner.count);
        Ok(encode_handle(index, generation))
    }

    /// Release `handle` and drop the table's reference to its object
    pub fn remove(&self, kernel: &KernelCore, handle: Handle) -> KResult<()> {
        let object = {
            let mut inner = self.inner.lock();
            if inner.lookup(handle).is_none() {
                return Err(KernelError::InvalidHandle);
            }
            let (index, _) = decode_handle(handle);
            let free_head = inner.free_head;
            let slot = core::mem::replace(
                &mut inner.slots[index as usize],
                Slot::Free {
                    next_free: free_head,
                },
            );
            inner.free_head = index;
            inner.count -= 1;
            match slot {
                Slot::Used { object, .. } => object,
                Slot::Free { .. } => return Err(KernelError::InvalidHandle),
            }
        };

        object.close(kernel);
        Ok(())
    }

    /// Add a second handle to the object `handle` names
    pub fn duplicate(&self, handle: Handle) -> KResult<Handle> {
        let object = self
            .get_object_without_pseudo_handle(handle)
            .ok_or(KernelError::InvalidHandle)?;
        self.add(object)
    }

    /// Whether `handle` names a live object of this table
    pub fn is_valid(&self, handle: Handle) -> bool {
        self.inner.lock().lookup(handle).is_some()
    }

    /// Resolve `handle`, including the pseudo handles of the calling thread `cur`
    pub fn get_generic(&self, handle: Handle, cur: &Arc<KThread>) -> Option<KObject> {
        match handle {
            PSEUDO_HANDLE_CURRENT_THREAD => Some(KObject::Thread(Arc::clone(cur))),
            PSEUDO_HANDLE_CURRENT_PROCESS => cur.owner_process().map(KObject::Process),
            _ => self.get_object_without_pseudo_handle(handle),
        }
    }

    /// Resolve `handle` as a table entry only
    pub fn get_object_without_pseudo_handle(&self, handle: Handle) -> Option<KObject> {
        self.inner.lock().lookup(handle).cloned()
    }

    /// Resolve `handle` to a thread
    pub fn get_thread(&self, handle: Handle, cur: &Arc<KThread>) -> Option<Arc<KThread>> {
        self.get_generic(handle, cur)
            .and_then(|object| object.as_thread().cloned())
    }

    /// Number of live handles
    pub fn count(&self) -> usize {
        self.inner.lock().count
    }

    /// Highest number of live handles seen
    pub fn max_count(&self) -> usize {
        self.inner.lock().max_count
    }

    pub fn table_size(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Close every remaining handle
    pub fn finalize(&self, kernel: &KernelCore) {
        let objects: Vec<KObject> = {
            let mut inner = self.inner.lock();
            let size = inner.slots.len();
            let objects = inner
                .slots
                .iter_mut()
                .enumerate()
                .filter_map(|(i, slot)| {
                    let next_free = if i + 1 < size {
                        (i + 1) as u32
                    } else {
                        FREE_LIST_END
                    };
                    match core::mem::replace(slot, Slot::Free { next_free }) {
                        Slot::Used { object, .. } => Some(object),
                        Slot::Free { .. } => None,
                    }
                })
                .collect();
            inner.free_head = if size > 0 { 0 } else { FREE_LIST_END };
            inner.count = 0;
            objects
        };

        debug!("handle table finalized, closing {} objects", objects.len());
        for object in objects {
            object.close(kernel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_packing() {
        let handle = encode_handle(3, 7);
        assert_eq!(handle, (3 << 15) | 7);
        assert_eq!(decode_handle(handle), (3, 7));
        assert_eq!(decode_handle(PSEUDO_HANDLE_CURRENT_THREAD).1, 0);
    }

    #[test]
    fn test_generation_wraps_to_one() {
        let table = KHandleTable::new(1);
        let mut inner = table.inner.lock();
        inner.next_generation = MAX_GENERATION;
        assert_eq!(inner.allocate_generation(), MAX_GENERATION);
        assert_eq!(inner.allocate_generation(), MIN_GENERATION);
    }

    #[test]
    fn test_empty_table_rejects_lookups() {
        let table = KHandleTable::new(4);
        assert!(!table.is_valid(INVALID_HANDLE));
        assert!(!table.is_valid(encode_handle(0, 1)));
        assert!(!table.is_valid(encode_handle(9, 1)));
        assert_eq!(table.count(), 0);
        assert_eq!(table.table_size(), 4);
    }
}
