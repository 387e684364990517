//! Property-based tests for the kernel primitives
//!
//! These tests use proptest to drive the handle table, the address arbiter, the adaptive lock
//! and the timeout manager with random workloads and check the ordering and bookkeeping
//! guarantees they make.

mod common;
mod proptest_strategies;

use std::collections::HashSet;

use common::TestKernel;
use guest_kern::kern::{KEvent, KHandleTable, KLightLock, KObject, ThreadState, WaitStatus};
use guest_kern::types::Handle;
use guest_kern::{svc, KernelError};
use proptest::prelude::*;
use proptest_strategies::*;

/// Indices of `priorities` in the order a priority-then-arrival queue releases them
fn wake_order(priorities: &[i32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..priorities.len()).collect();
    order.sort_by_key(|&i| priorities[i]);
    order
}

// ════════════════════════════════════════════════════════════
// Handle Table Property Tests
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Live handles resolve, closed handles never do, and the count tracks the live set
    #[test]
    fn handle_table_tracks_live_set(ops in handle_ops()) {
        const SIZE: usize = 16;
        let tk = TestKernel::new();
        let table = KHandleTable::new(SIZE);
        let mut live: Vec<Handle> = Vec::new();
        let mut closed: Vec<Handle> = Vec::new();

        for op in ops {
            match op {
                HandleOp::Add => {
                    let event = KEvent::new();
                    match table.add(KObject::Event(event)) {
                        Ok(handle) => {
                            prop_assert!(!live.contains(&handle));
                            live.push(handle);
                        }
                        Err(err) => {
                            prop_assert_eq!(err, KernelError::OutOfHandles);
                            prop_assert_eq!(live.len(), SIZE);
                        }
                    }
                }
                HandleOp::Remove(n) => {
                    if live.is_empty() {
                        continue;
                    }
                    let handle = live.remove(n % live.len());
                    prop_assert_eq!(table.remove(&tk.kernel, handle), Ok(()));
                    closed.push(handle);
                }
            }

            prop_assert_eq!(table.count(), live.len());
            for handle in &live {
                prop_assert!(table.is_valid(*handle));
            }
            for handle in &closed {
                prop_assert!(!table.is_valid(*handle));
            }
        }
        prop_assert!(table.max_count() <= SIZE);
    }

    /// Handles handed out by one table are pairwise distinct
    #[test]
    fn handle_values_unique(n in 1usize..64) {
        let table = KHandleTable::new(64);
        let mut seen = HashSet::new();
        for _ in 0..n {
            let handle = table.add(KObject::Event(KEvent::new())).unwrap();
            prop_assert!(handle != 0);
            prop_assert!(seen.insert(handle));
        }
    }
}

// ════════════════════════════════════════════════════════════
// Address Arbiter Property Tests
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Single-waiter signals release threads by priority, then by arrival
    #[test]
    fn arbiter_wakes_by_priority_then_arrival(priorities in waiter_priorities()) {
        let tk = TestKernel::new();
        let addr = tk.addr(0x100);
        let arbiter = tk.process.address_arbiter();

        let threads: Vec<_> = priorities
            .iter()
            .enumerate()
            .map(|(i, &p)| tk.spawn(p, (i % 4) as i32).0)
            .collect();
        for t in &threads {
            let status = arbiter.wait_if_equal(&tk.kernel, t, addr, 0, -1).unwrap();
            prop_assert_eq!(status, WaitStatus::Blocked);
        }

        let mut woken = Vec::new();
        for _ in 0..threads.len() {
            arbiter.signal(&tk.kernel, addr, 1).unwrap();
            let newly: Vec<usize> = threads
                .iter()
                .enumerate()
                .filter(|(i, t)| t.state() == ThreadState::Runnable && !woken.contains(i))
                .map(|(i, _)| i)
                .collect();
            prop_assert_eq!(newly.len(), 1);
            woken.push(newly[0]);
        }

        prop_assert_eq!(woken, wake_order(&priorities));
        prop_assert!(arbiter.tree().is_empty());
    }

    /// A zero-timeout WaitIfLessThan never blocks and only decrements on a match
    #[test]
    fn wait_if_less_than_poll_never_blocks(
        word in word_value(),
        value in word_value(),
        decrement in any::<bool>()
    ) {
        let tk = TestKernel::new();
        let addr = tk.addr(0x200);
        tk.write32(addr, word as u32);
        let (t, _) = tk.spawn(30, 0);

        let result = tk
            .process
            .address_arbiter()
            .wait_if_less_than(&tk.kernel, &t, addr, value, decrement, 0);

        if word < value {
            prop_assert_eq!(result, Err(KernelError::TimedOut));
            let expected = if decrement { word.wrapping_sub(1) } else { word };
            prop_assert_eq!(tk.read32(addr) as i32, expected);
        } else {
            prop_assert_eq!(result, Err(KernelError::InvalidState));
            prop_assert_eq!(tk.read32(addr) as i32, word);
        }
        prop_assert_eq!(t.state(), ThreadState::Runnable);
        prop_assert!(tk.process.address_arbiter().tree().is_empty());
        prop_assert_eq!(tk.kernel.timeout_manager().pending(), 0);
    }
}

// ════════════════════════════════════════════════════════════
// Lock Property Tests
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The owner inherits the best waiter priority and hands the lock to that waiter
    #[test]
    fn light_lock_inherits_and_hands_off(priorities in waiter_priorities()) {
        const OWNER_PRIORITY: i32 = 40;
        let tk = TestKernel::new();
        let lock = KLightLock::new(&tk.kernel);
        let (owner, _) = tk.spawn(OWNER_PRIORITY, 0);
        prop_assert_eq!(lock.lock(&tk.kernel, &owner), WaitStatus::Done(()));

        let waiters: Vec<_> = priorities
            .iter()
            .enumerate()
            .map(|(i, &p)| tk.spawn(p, (i % 3) as i32 + 1).0)
            .collect();
        for w in &waiters {
            prop_assert_eq!(lock.lock(&tk.kernel, w), WaitStatus::Blocked);
        }

        let best = priorities.iter().copied().min().unwrap_or(OWNER_PRIORITY);
        prop_assert_eq!(owner.priority(), OWNER_PRIORITY.min(best));

        lock.unlock(&tk.kernel, &owner);
        prop_assert_eq!(owner.priority(), OWNER_PRIORITY);

        let next = wake_order(&priorities)[0];
        let next_owner = &waiters[next];
        prop_assert_eq!(lock.owner_id(), Some(next_owner.id()));
        prop_assert_eq!(next_owner.state(), ThreadState::Runnable);
        prop_assert_eq!(next_owner.num_kernel_waiters() as usize, waiters.len() - 1);
    }
}

// ════════════════════════════════════════════════════════════
// Timeout Property Tests
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every sleep fires exactly when the clock reaches its deadline
    #[test]
    fn sleeps_fire_at_their_deadlines(durations in sleep_durations()) {
        let tk = TestKernel::new();
        let threads: Vec<_> = durations
            .iter()
            .enumerate()
            .map(|(i, _)| tk.spawn(30, (i % 4) as i32).0)
            .collect();
        for (t, &d) in threads.iter().zip(&durations) {
            prop_assert_eq!(svc::sleep_thread(&tk.kernel, t, d), WaitStatus::Blocked);
        }

        let mut deadlines = durations.clone();
        deadlines.sort_unstable();
        deadlines.dedup();
        for deadline in deadlines {
            tk.clock.set(deadline);
            let expected = durations.iter().filter(|&&d| d == deadline).count();
            prop_assert_eq!(tk.kernel.process_timeouts(), expected);
        }

        prop_assert_eq!(tk.kernel.timeout_manager().pending(), 0);
        for t in &threads {
            prop_assert_eq!(t.state(), ThreadState::Runnable);
            prop_assert_eq!(t.wait_result(), Err(KernelError::TimedOut));
        }
    }
}
