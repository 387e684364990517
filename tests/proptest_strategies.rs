//! Proptest strategies for kernel property tests
//!
//! Generates guest priorities, timeouts and handle table workloads within the ranges the
//! kernel accepts.

#![allow(dead_code)]

use proptest::prelude::*;

// ════════════════════════════════════════════════════════════
// Basic Strategies
// ════════════════════════════════════════════════════════════

/// Guest thread priority
pub fn priority() -> impl Strategy<Value = i32> {
    0i32..=63
}

/// Priority low enough that the owning core never refuses migration
pub fn ordinary_priority() -> impl Strategy<Value = i32> {
    2i32..=63
}

/// Emulated core id
pub fn core_id() -> impl Strategy<Value = i32> {
    0i32..4
}

/// Positive timeout in nanoseconds
pub fn timeout_ns() -> impl Strategy<Value = i64> {
    1i64..10_000
}

/// Any guest word value, biased towards small magnitudes
pub fn word_value() -> impl Strategy<Value = i32> {
    prop_oneof![
        3 => -8i32..8,
        1 => any::<i32>(),
    ]
}

// ════════════════════════════════════════════════════════════
// Composite Strategies
// ════════════════════════════════════════════════════════════

/// Priorities of threads that queue up on one address
pub fn waiter_priorities() -> impl Strategy<Value = Vec<i32>> {
    prop::collection::vec(ordinary_priority(), 1..12)
}

/// Sleep durations of several threads
pub fn sleep_durations() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(timeout_ns(), 1..10)
}

/// One handle table operation
#[derive(Debug, Clone, Copy)]
pub enum HandleOp {
    /// Create an event and store its writable side
    Add,
    /// Close the n-th live handle (modulo the live count)
    Remove(usize),
}

pub fn handle_op() -> impl Strategy<Value = HandleOp> {
    prop_oneof![
        3 => Just(HandleOp::Add),
        2 => any::<usize>().prop_map(HandleOp::Remove),
    ]
}

/// A sequence of handle table operations
pub fn handle_ops() -> impl Strategy<Value = Vec<HandleOp>> {
    prop::collection::vec(handle_op(), 1..64)
}
