//! Thread Management
//!
//! A `KThread` is one schedulable unit of guest execution. Its state word combines the base
//! state (Initialized, Waiting, Runnable, Terminated) with the suspend-reason bits; a thread is
//! queued for scheduling only while the whole word equals Runnable.
//!
//! Threads that block on a lock word or an adaptive lock are linked into the owner's
//! priority-sorted waiter list. The owner inherits the best priority among its waiters, and the
//! boost propagates up the lock-owner chain through [`KThread::restore_priority`].
//!
//! Every state mutation below happens with the global scheduler lock held. The per-thread
//! interior mutex only guards memory; it is never held across a call that can take another
//! thread's mutex, the priority queue or a waiter tree.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

use log::{debug, error};
use spin::Mutex;

use crate::kern::affinity::KAffinityMask;
use crate::kern::kernel::KernelCore;
use crate::kern::lock::{KScopedSchedulerLock, KScopedSchedulerLockAndSleep};
use crate::kern::object::RefCount;
use crate::kern::process::KProcess;
use crate::kern::scheduler::KScheduler;
use crate::kern::sync_object::{self, KSynchronizationObject, SyncObjectBase};
use crate::kern::thread_queue::{ThreadQueue, WaitStatus};
use crate::kern::thread_tree::{KThreadTree, TreeKey};
use crate::result::{KResult, KernelError};
use crate::types::{
    AddressKey, ThreadId, VAddr, IDEAL_CORE_NO_UPDATE, IDLE_THREAD_PRIORITY,
    SYSTEM_THREAD_PRIORITY_HIGHEST, TERMINATING_THREAD_PRIORITY,
};

// ============================================================================
// Thread State
// ============================================================================

/// Bits of the state word holding the base state
pub const THREAD_STATE_MASK: u32 = 0xF;

/// First bit of the suspend-reason field
pub const SUSPEND_SHIFT: u32 = 4;

/// All suspend-reason bits
pub const SUSPEND_FLAG_MASK: u32 = ((1 << SuspendType::COUNT) - 1) << SUSPEND_SHIFT;

/// Base state of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ThreadState {
    Initialized = 0,
    Waiting = 1,
    Runnable = 2,
    Terminated = 3,
}

impl ThreadState {
    /// Base state encoded in a state word
    pub const fn from_raw(raw: u32) -> Self {
        match raw & THREAD_STATE_MASK {
            0 => ThreadState::Initialized,
            1 => ThreadState::Waiting,
            2 => ThreadState::Runnable,
            _ => ThreadState::Terminated,
        }
    }
}

/// Reasons a thread may be suspended; each owns one bit of the state word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SuspendType {
    Process = 0,
    Thread = 1,
    Debug = 2,
    Backtrace = 3,
    Init = 4,
}

impl SuspendType {
    pub const COUNT: u32 = 5;

    /// State-word bit of this suspend reason
    pub const fn flag(self) -> u32 {
        1 << (SUSPEND_SHIFT + self as u32)
    }
}

/// Guest-requested activity of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ThreadActivity {
    Runnable = 0,
    Paused = 1,
}

impl ThreadActivity {
    /// Decode a guest activity value
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(ThreadActivity::Runnable),
            1 => Some(ThreadActivity::Paused),
            _ => None,
        }
    }
}

/// Kind of thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadType {
    /// Per-core idle thread, never queued
    Idle,
    /// Kernel-internal thread without an owning process
    Kernel,
    /// Guest thread owned by a process
    User,
}

/// What a thread is waiting for, for debuggers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadWaitReasonForDebugging {
    #[default]
    None,
    Sleep,
    Ipc,
    Synchronization,
    ConditionVar,
    Arbitration,
    Suspended,
}

// ============================================================================
// Thread
// ============================================================================

struct ThreadInner {
    base_priority: i32,
    ideal_core: i32,
    affinity: KAffinityMask,

    suspend_request_flags: u32,
    suspend_allowed_flags: u32,

    address_key: AddressKey,
    address_key_value: u32,
    lock_owner: Option<Weak<KThread>>,
    /// Threads blocked on locks this thread owns, best priority first
    waiters: Vec<(AddressKey, Arc<KThread>)>,
    num_kernel_waiters: u32,

    wait_queue: Option<ThreadQueue>,
    wait_result: KResult<()>,
    synced_index: i32,
    wait_cancelled: bool,
    cancellable: bool,
    signaled: bool,
    tree_slot: Option<(Arc<KThreadTree>, TreeKey)>,
    wait_reason: ThreadWaitReasonForDebugging,

    yield_schedule_count: i64,
    last_scheduled_tick: i64,

    entry_point: VAddr,
    argument: u64,
    stack_top: VAddr,
}

/// A guest thread
pub struct KThread {
    thread_id: ThreadId,
    thread_type: ThreadType,
    owner: Weak<KProcess>,

    priority: AtomicI32,
    state: AtomicU32,
    /// Core whose scheduled queue holds the thread
    active_core: AtomicI32,
    /// Core the thread last ran on
    current_core: AtomicI32,
    termination_requested: AtomicBool,

    ref_count: RefCount,
    sync: SyncObjectBase,
    inner: Mutex<ThreadInner>,
}

impl core::fmt::Debug for KThread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KThread")
            .field("id", &self.thread_id.0)
            .field("type", &self.thread_type)
            .field("priority", &self.priority())
            .field("state", &self.state())
            .field("active_core", &self.active_core())
            .finish()
    }
}

/// Creation parameters of a guest or kernel thread
#[derive(Debug, Clone, Copy)]
pub struct ThreadParams {
    pub entry_point: VAddr,
    pub argument: u64,
    pub stack_top: VAddr,
    pub priority: i32,
    pub core: i32,
}

impl KThread {
    // ------------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------------

    fn build(
        thread_id: ThreadId,
        thread_type: ThreadType,
        owner: Weak<KProcess>,
        params: ThreadParams,
        affinity: KAffinityMask,
        state: ThreadState,
    ) -> Arc<Self> {
        Arc::new(Self {
            thread_id,
            thread_type,
            owner,
            priority: AtomicI32::new(params.priority),
            state: AtomicU32::new(state as u32),
            active_core: AtomicI32::new(params.core),
            current_core: AtomicI32::new(params.core),
            termination_requested: AtomicBool::new(false),
            ref_count: RefCount::new(1),
            sync: SyncObjectBase::new(),
            inner: Mutex::new(ThreadInner {
                base_priority: params.priority,
                ideal_core: params.core,
                affinity,
                suspend_request_flags: 0,
                suspend_allowed_flags: SUSPEND_FLAG_MASK,
                address_key: AddressKey::None,
                address_key_value: 0,
                lock_owner: None,
                waiters: Vec::new(),
                num_kernel_waiters: 0,
                wait_queue: None,
                wait_result: Err(KernelError::NoSynchronizationObject),
                synced_index: -1,
                wait_cancelled: false,
                cancellable: false,
                signaled: false,
                tree_slot: None,
                wait_reason: ThreadWaitReasonForDebugging::None,
                yield_schedule_count: 0,
                last_scheduled_tick: 0,
                entry_point: params.entry_point,
                argument: params.argument,
                stack_top: params.stack_top,
            }),
        })
    }

    /// Guest thread in the Initialized state, bound to `core`
    pub(crate) fn new_user(thread_id: ThreadId, owner: &Arc<KProcess>, params: ThreadParams) -> Arc<Self> {
        Self::build(
            thread_id,
            ThreadType::User,
            Arc::downgrade(owner),
            params,
            KAffinityMask::from_core(params.core),
            ThreadState::Initialized,
        )
    }

    /// Kernel thread without an owning process
    pub(crate) fn new_kernel(thread_id: ThreadId, priority: i32, core: i32) -> Arc<Self> {
        let params = ThreadParams {
            entry_point: 0,
            argument: 0,
            stack_top: 0,
            priority,
            core,
        };
        Self::build(
            thread_id,
            ThreadType::Kernel,
            Weak::new(),
            params,
            KAffinityMask::from_core(core),
            ThreadState::Initialized,
        )
    }

    /// Idle thread of `core`: permanently runnable, never queued
    pub(crate) fn new_idle(thread_id: ThreadId, core: i32) -> Arc<Self> {
        let params = ThreadParams {
            entry_point: 0,
            argument: 0,
            stack_top: 0,
            priority: IDLE_THREAD_PRIORITY,
            core,
        };
        Self::build(
            thread_id,
            ThreadType::Idle,
            Weak::new(),
            params,
            KAffinityMask::from_core(core),
            ThreadState::Runnable,
        )
    }

    /// Unregistered thread for exercising data structures in isolation
    #[cfg(test)]
    pub(crate) fn new_detached(thread_id: ThreadId, priority: i32, core: i32, affinity: u64) -> Arc<Self> {
        let params = ThreadParams {
            entry_point: 0,
            argument: 0,
            stack_top: 0,
            priority,
            core,
        };
        let mut mask = KAffinityMask::new();
        mask.set_affinity_mask(affinity);
        Self::build(
            thread_id,
            ThreadType::Kernel,
            Weak::new(),
            params,
            mask,
            ThreadState::Initialized,
        )
    }

    // ------------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------------

    /// Kernel-wide thread id
    pub fn id(&self) -> ThreadId {
        self.thread_id
    }

    /// Whether this is a user, kernel or idle thread
    pub fn thread_type(&self) -> ThreadType {
        self.thread_type
    }

    /// Whether the thread belongs to a guest process
    pub fn is_user_thread(&self) -> bool {
        self.thread_type == ThreadType::User
    }

    /// Owning process, if it still exists
    pub fn owner_process(&self) -> Option<Arc<KProcess>> {
        self.owner.upgrade()
    }

    /// Guest entry point
    pub fn entry_point(&self) -> VAddr {
        self.inner.lock().entry_point
    }

    /// Argument passed to the entry point
    pub fn argument(&self) -> u64 {
        self.inner.lock().argument
    }

    /// Initial guest stack pointer
    pub fn stack_top(&self) -> VAddr {
        self.inner.lock().stack_top
    }

    // ------------------------------------------------------------------------
    // Reference counting
    // ------------------------------------------------------------------------

    /// Take an additional kernel reference
    pub fn open(&self) {
        self.ref_count.open();
    }

    /// Drop a kernel reference, finalizing the thread when it was the last
    pub fn close(self: &Arc<Self>, kernel: &KernelCore) {
        if self.ref_count.close() {
            self.finalize(kernel);
        }
    }

    /// Current kernel reference count
    pub fn reference_count(&self) -> u32 {
        self.ref_count.get()
    }

    // ------------------------------------------------------------------------
    // Scheduling attributes
    // ------------------------------------------------------------------------

    /// Effective priority, including inherited boosts
    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Acquire)
    }

    fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::Release);
    }

    /// Priority before lock-ownership boosts
    pub fn base_priority(&self) -> i32 {
        self.inner.lock().base_priority
    }

    /// Scheduling state without the suspend bits
    pub fn state(&self) -> ThreadState {
        ThreadState::from_raw(self.raw_state())
    }

    /// Full state word, suspend bits included
    pub fn raw_state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    /// Core whose queues hold the thread, or -1
    pub fn active_core(&self) -> i32 {
        self.active_core.load(Ordering::Acquire)
    }

    /// Move the thread's queue membership to `core`
    pub fn set_active_core(&self, core: i32) {
        self.active_core.store(core, Ordering::Release);
    }

    /// Core that last ran the thread
    pub fn current_core(&self) -> i32 {
        self.current_core.load(Ordering::Acquire)
    }

    pub(crate) fn set_current_core(&self, core: i32) {
        self.current_core.store(core, Ordering::Release);
    }

    /// Preferred core, or one of the ideal-core sentinels
    pub fn ideal_core(&self) -> i32 {
        self.inner.lock().ideal_core
    }

    /// Cores the thread may run on
    pub fn affinity_mask(&self) -> KAffinityMask {
        self.inner.lock().affinity
    }

    /// Scheduled count recorded at the last yield
    pub fn yield_schedule_count(&self) -> i64 {
        self.inner.lock().yield_schedule_count
    }

    pub(crate) fn set_yield_schedule_count(&self, count: i64) {
        self.inner.lock().yield_schedule_count = count;
    }

    /// Tick of the last switch onto this thread
    pub fn last_scheduled_tick(&self) -> i64 {
        self.inner.lock().last_scheduled_tick
    }

    pub(crate) fn set_last_scheduled_tick(&self, tick: i64) {
        self.inner.lock().last_scheduled_tick = tick;
    }

    // ------------------------------------------------------------------------
    // Wait bookkeeping
    // ------------------------------------------------------------------------

    /// Result of the most recent wait
    pub fn wait_result(&self) -> KResult<()> {
        self.inner.lock().wait_result
    }

    /// Record the result the wait ends with
    pub(crate) fn set_wait_result(&self, result: KResult<()>) {
        self.inner.lock().wait_result = result;
    }

    /// Index of the object that ended the most recent synchronization wait, or -1
    pub fn synced_index(&self) -> i32 {
        self.inner.lock().synced_index
    }

    pub(crate) fn set_synced_index(&self, index: i32) {
        self.inner.lock().synced_index = index;
    }

    /// Whether a cancel request may interrupt the current wait
    pub fn is_cancellable(&self) -> bool {
        self.inner.lock().cancellable
    }

    pub(crate) fn set_cancellable(&self) {
        self.inner.lock().cancellable = true;
    }

    pub(crate) fn clear_cancellable(&self) {
        self.inner.lock().cancellable = false;
    }

    /// Whether a cancel arrived while no wait was cancellable
    pub fn is_wait_cancelled(&self) -> bool {
        self.inner.lock().wait_cancelled
    }

    pub(crate) fn clear_wait_cancelled(&self) {
        self.inner.lock().wait_cancelled = false;
    }

    /// What the thread is blocked on
    pub fn wait_reason_for_debugging(&self) -> ThreadWaitReasonForDebugging {
        self.inner.lock().wait_reason
    }

    pub(crate) fn set_wait_reason_for_debugging(&self, reason: ThreadWaitReasonForDebugging) {
        self.inner.lock().wait_reason = reason;
    }

    /// Whether the thread has exited and signals its waiters
    pub fn is_signaled(&self) -> bool {
        self.inner.lock().signaled
    }

    /// Whether termination was requested
    pub fn is_termination_requested(&self) -> bool {
        self.termination_requested.load(Ordering::Acquire)
    }

    /// Whether the thread sits in an arbiter or condition variable tree
    pub fn tree_slot(&self) -> Option<TreeKey> {
        self.inner.lock().tree_slot.as_ref().map(|(_, slot)| *slot)
    }

    /// Record the tree and slot the thread waits in
    pub(crate) fn set_tree_slot(&self, slot: Option<(Arc<KThreadTree>, TreeKey)>) {
        self.inner.lock().tree_slot = slot;
    }

    /// Leave the waiter tree the thread is in, if any
    pub(crate) fn remove_from_tree(&self) {
        let slot = self.inner.lock().tree_slot.take();
        if let Some((tree, key)) = slot {
            tree.remove(key);
        }
    }

    // ------------------------------------------------------------------------
    // Lock ownership
    // ------------------------------------------------------------------------

    /// Lock word or kernel key the thread waits to acquire
    pub fn address_key(&self) -> AddressKey {
        self.inner.lock().address_key
    }

    /// Tag written to the guest lock word when this thread becomes the owner
    pub fn address_key_value(&self) -> u32 {
        self.inner.lock().address_key_value
    }

    pub(crate) fn set_user_address_key(&self, addr: VAddr, value: u32) {
        let mut inner = self.inner.lock();
        inner.address_key = AddressKey::User(addr);
        inner.address_key_value = value;
    }

    pub(crate) fn set_kernel_address_key(&self, key: u64) {
        let mut inner = self.inner.lock();
        inner.address_key = AddressKey::Kernel(key);
        inner.address_key_value = 0;
    }

    /// Thread owning the lock this thread is blocked on
    pub fn lock_owner(&self) -> Option<Arc<KThread>> {
        self.inner.lock().lock_owner.as_ref().and_then(Weak::upgrade)
    }

    fn set_lock_owner(&self, owner: Option<&Arc<KThread>>) {
        self.inner.lock().lock_owner = owner.map(Arc::downgrade);
    }

    /// Number of waiters blocked on kernel locks this thread owns
    pub fn num_kernel_waiters(&self) -> u32 {
        self.inner.lock().num_kernel_waiters
    }

    /// Whether any thread waits on a lock this thread owns
    pub fn has_waiters(&self) -> bool {
        !self.inner.lock().waiters.is_empty()
    }

    /// Waiters in wake order
    pub fn waiters(&self) -> Vec<Arc<KThread>> {
        self.inner
            .lock()
            .waiters
            .iter()
            .map(|(_, thread)| Arc::clone(thread))
            .collect()
    }

    fn add_waiter_impl(self: &Arc<Self>, kernel: &KernelCore, thread: &Arc<KThread>) {
        let key = thread.address_key();
        let priority = thread.priority();
        {
            let mut inner = self.inner.lock();
            if key.is_kernel() {
                inner.num_kernel_waiters += 1;
            }
            let pos = inner
                .waiters
                .iter()
                .position(|(_, waiter)| waiter.priority() > priority)
                .unwrap_or(inner.waiters.len());
            inner.waiters.insert(pos, (key, Arc::clone(thread)));
        }
        if key.is_kernel() {
            kernel.global_scheduler_context().set_scheduler_update_needed();
        }
        thread.set_lock_owner(Some(self));
    }

    fn remove_waiter_impl(&self, kernel: &KernelCore, thread: &Arc<KThread>) {
        let kernel_waiters_drained = {
            let mut inner = self.inner.lock();
            let Some(pos) = inner
                .waiters
                .iter()
                .position(|(_, waiter)| Arc::ptr_eq(waiter, thread))
            else {
                return;
            };
            let (key, _) = inner.waiters.remove(pos);
            if key.is_kernel() {
                inner.num_kernel_waiters -= 1;
                inner.num_kernel_waiters == 0
            } else {
                false
            }
        };
        if kernel_waiters_drained {
            kernel.global_scheduler_context().set_scheduler_update_needed();
        }
        thread.set_lock_owner(None);
    }

    /// Register `thread` as blocked on a lock this thread owns
    pub fn add_waiter(self: &Arc<Self>, kernel: &KernelCore, thread: &Arc<KThread>) {
        self.add_waiter_impl(kernel, thread);
        Self::restore_priority(kernel, self);
    }

    /// Detach `thread` from this owner and recompute the inherited priority
    pub fn remove_waiter(self: &Arc<Self>, kernel: &KernelCore, thread: &Arc<KThread>) {
        self.remove_waiter_impl(kernel, thread);
        Self::restore_priority(kernel, self);
    }

    /// Detach every waiter blocked on `key` and pick the next owner
    ///
    /// The best waiter becomes the next owner and inherits the other matching waiters. Returns
    /// the next owner and the number of waiters that matched.
    pub fn remove_waiter_by_key(
        self: &Arc<Self>,
        kernel: &KernelCore,
        key: AddressKey,
    ) -> (Option<Arc<KThread>>, usize) {
        let (matched, kernel_waiters_drained) = {
            let mut inner = self.inner.lock();
            let mut matched = Vec::new();
            let mut removed_kernel = false;
            let mut i = 0;
            while i < inner.waiters.len() {
                if inner.waiters[i].0 == key {
                    let (waiter_key, thread) = inner.waiters.remove(i);
                    if waiter_key.is_kernel() {
                        inner.num_kernel_waiters -= 1;
                        removed_kernel = true;
                    }
                    matched.push(thread);
                } else {
                    i += 1;
                }
            }
            (matched, removed_kernel && inner.num_kernel_waiters == 0)
        };
        if kernel_waiters_drained {
            kernel.global_scheduler_context().set_scheduler_update_needed();
        }

        let num_waiters = matched.len();
        let mut matched = matched.into_iter();
        let next_owner = matched.next();
        if let Some(next_owner) = &next_owner {
            next_owner.set_lock_owner(None);
            for thread in matched {
                next_owner.add_waiter_impl(kernel, &thread);
            }
            Self::restore_priority(kernel, self);
            Self::restore_priority(kernel, next_owner);
        }
        (next_owner, num_waiters)
    }

    /// Recompute effective priorities from `thread` up its lock-owner chain
    pub fn restore_priority(kernel: &KernelCore, thread: &Arc<KThread>) {
        let mut thread = Arc::clone(thread);
        loop {
            let new_priority = {
                let inner = thread.inner.lock();
                match inner.waiters.first() {
                    Some((_, waiter)) => inner.base_priority.min(waiter.priority()),
                    None => inner.base_priority,
                }
            };
            let old_priority = thread.priority();
            if new_priority == old_priority {
                return;
            }

            // Keep any waiter tree ordered by the new priority.
            let slot = thread.inner.lock().tree_slot.take();
            thread.set_priority(new_priority);
            if let Some((tree, key)) = slot {
                let key = tree.update_priority(key, new_priority);
                thread.inner.lock().tree_slot = Some((tree, key));
            }

            KScheduler::on_thread_priority_changed(kernel, &thread, old_priority);

            let Some(owner) = thread.lock_owner() else {
                return;
            };
            owner.remove_waiter_impl(kernel, &thread);
            owner.add_waiter_impl(kernel, &thread);
            thread = owner;
        }
    }

    /// Change the base priority and propagate the result
    pub fn set_base_priority(self: &Arc<Self>, kernel: &KernelCore, priority: i32) {
        let _sl = KScopedSchedulerLock::new(kernel);
        self.inner.lock().base_priority = priority;
        Self::restore_priority(kernel, self);
    }

    /// Set the ideal core and affinity mask
    ///
    /// `IDEAL_CORE_NO_UPDATE` keeps the current ideal core, which must then be in `mask`. A
    /// thread whose active core leaves the mask moves to its ideal core, or to the highest core
    /// of the new mask when it has none.
    pub fn set_core_mask(self: &Arc<Self>, kernel: &KernelCore, core_id: i32, mask: u64) -> KResult<()> {
        let _sl = KScopedSchedulerLock::new(kernel);

        let (old_affinity, ideal_core) = {
            let mut inner = self.inner.lock();
            if core_id != IDEAL_CORE_NO_UPDATE {
                inner.ideal_core = core_id;
            } else if inner.ideal_core >= 0 && mask & (1u64 << inner.ideal_core) == 0 {
                return Err(KernelError::InvalidCombination);
            }

            let old_affinity = inner.affinity;
            inner.affinity.set_affinity_mask(mask);
            if inner.affinity == old_affinity {
                return Ok(());
            }
            (old_affinity, inner.ideal_core)
        };

        let active_core = self.active_core();
        let affinity = self.affinity_mask();
        if active_core >= 0 && !affinity.get_affinity(active_core) {
            let new_core = if ideal_core >= 0 {
                ideal_core
            } else {
                affinity.highest_core().unwrap_or(-1)
            };
            self.set_active_core(new_core);
        }
        KScheduler::on_thread_affinity_mask_changed(kernel, self, old_affinity, active_core);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // State transitions
    // ------------------------------------------------------------------------

    /// Change the base state, keeping the suspend bits
    pub(crate) fn set_state(self: &Arc<Self>, kernel: &KernelCore, state: ThreadState) {
        let old_state = self.raw_state();
        let new_state = (old_state & !THREAD_STATE_MASK) | state as u32;
        self.state.store(new_state, Ordering::Release);
        if new_state != old_state {
            KScheduler::on_thread_state_changed(kernel, self, old_state);
        }
    }

    /// Effective suspend bits: requested and currently allowed
    pub fn suspend_flags(&self) -> u32 {
        let inner = self.inner.lock();
        inner.suspend_request_flags & inner.suspend_allowed_flags
    }

    /// Whether an allowed suspend request is in effect
    pub fn is_suspended(&self) -> bool {
        self.suspend_flags() != 0
    }

    /// Whether any suspend request is pending
    pub fn is_suspend_requested(&self) -> bool {
        self.inner.lock().suspend_request_flags != 0
    }

    /// Whether a request of `suspend_type` is pending
    pub fn is_suspend_type_requested(&self, suspend_type: SuspendType) -> bool {
        self.inner.lock().suspend_request_flags & suspend_type.flag() != 0
    }

    /// Fold the effective suspend bits into the state word
    pub(crate) fn update_state(self: &Arc<Self>, kernel: &KernelCore) {
        let old_state = self.raw_state();
        let new_state = self.suspend_flags() | (old_state & THREAD_STATE_MASK);
        self.state.store(new_state, Ordering::Release);
        if new_state != old_state {
            KScheduler::on_thread_state_changed(kernel, self, old_state);
        }
    }

    /// Clear the suspend bits from the state word without dropping the requests
    pub(crate) fn continue_execution(self: &Arc<Self>, kernel: &KernelCore) {
        let old_state = self.raw_state();
        self.state
            .store(old_state & THREAD_STATE_MASK, Ordering::Release);
        KScheduler::on_thread_state_changed(kernel, self, old_state);
    }

    /// Let a suspended lock holder run until it releases its kernel waiters
    pub(crate) fn continue_if_has_kernel_waiters(self: &Arc<Self>, kernel: &KernelCore) {
        if self.num_kernel_waiters() > 0 {
            self.continue_execution(kernel);
        }
    }

    /// Apply pending suspend requests unless kernel waiters depend on this thread
    pub(crate) fn try_suspend(self: &Arc<Self>, kernel: &KernelCore) {
        if !self.is_suspend_requested() || self.num_kernel_waiters() > 0 {
            return;
        }
        self.update_state(kernel);
    }

    /// Add a suspend request and apply it when possible
    pub fn request_suspend(self: &Arc<Self>, kernel: &KernelCore, suspend_type: SuspendType) {
        let _sl = KScopedSchedulerLock::new(kernel);
        self.inner.lock().suspend_request_flags |= suspend_type.flag();
        self.try_suspend(kernel);
    }

    /// Clear a suspend request and update the state word
    pub fn resume(self: &Arc<Self>, kernel: &KernelCore, suspend_type: SuspendType) {
        let _sl = KScopedSchedulerLock::new(kernel);
        self.inner.lock().suspend_request_flags &= !suspend_type.flag();
        self.update_state(kernel);
    }

    /// Pause or resume the thread on behalf of the guest
    pub fn set_activity(self: &Arc<Self>, kernel: &KernelCore, activity: ThreadActivity) -> KResult<()> {
        let _sl = KScopedSchedulerLock::new(kernel);

        let state = self.state();
        if state != ThreadState::Waiting && state != ThreadState::Runnable {
            return Err(KernelError::InvalidState);
        }

        match activity {
            ThreadActivity::Paused => {
                if self.is_suspend_type_requested(SuspendType::Thread) {
                    return Err(KernelError::InvalidState);
                }
                self.request_suspend(kernel, SuspendType::Thread);
            }
            ThreadActivity::Runnable => {
                if !self.is_suspend_type_requested(SuspendType::Thread) {
                    return Err(KernelError::InvalidState);
                }
                self.resume(kernel, SuspendType::Thread);
            }
        }
        Ok(())
    }

    /// Start an Initialized thread
    pub fn run(self: &Arc<Self>, kernel: &KernelCore) -> KResult<()> {
        let _sl = KScopedSchedulerLock::new(kernel);

        if self.is_termination_requested() {
            return Err(KernelError::TerminationRequested);
        }
        if self.state() != ThreadState::Initialized {
            return Err(KernelError::InvalidState);
        }

        if self.is_user_thread() && self.is_suspended() {
            self.update_state(kernel);
        }

        // Reference held while the thread runs, dropped on exit.
        self.open();
        self.set_state(kernel, ThreadState::Runnable);
        debug!("thread {} started on core {}", self.thread_id.0, self.active_core());
        Ok(())
    }

    /// Terminate the calling thread
    pub fn exit(self: &Arc<Self>, kernel: &KernelCore) {
        {
            let _sl = KScopedSchedulerLock::new(kernel);
            if self.state() == ThreadState::Terminated {
                return;
            }
            self.inner.lock().suspend_allowed_flags = 0;
            self.update_state(kernel);
            self.start_termination(kernel);
        }
        debug!("thread {} exited", self.thread_id.0);
        self.close(kernel);
    }

    /// Ask another thread to terminate
    ///
    /// Returns the thread's state after the request. An Initialized thread terminates at once;
    /// any other thread is unsuspended, boosted and woken so it reaches its own exit.
    pub fn request_terminate(self: &Arc<Self>, kernel: &KernelCore) -> ThreadState {
        let _sl = KScopedSchedulerLock::new(kernel);

        let first_request = self
            .termination_requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if first_request {
            debug!("termination requested for thread {}", self.thread_id.0);
            if self.state() == ThreadState::Initialized {
                self.state
                    .store(ThreadState::Terminated as u32, Ordering::Release);
                return ThreadState::Terminated;
            }

            if self.is_suspended() {
                self.inner.lock().suspend_allowed_flags = 0;
                self.update_state(kernel);
            }

            if self.base_priority() >= SYSTEM_THREAD_PRIORITY_HIGHEST {
                self.set_base_priority(kernel, TERMINATING_THREAD_PRIORITY);
            }

            if self.state() == ThreadState::Runnable {
                kernel
                    .host()
                    .interrupt_cores(self.affinity_mask().get_affinity_mask());
            }

            if self.state() == ThreadState::Waiting {
                self.cancel_wait(kernel, Err(KernelError::TerminationRequested), true);
            }
        }

        self.state()
    }

    fn start_termination(self: &Arc<Self>, kernel: &KernelCore) {
        self.set_state(kernel, ThreadState::Terminated);
        self.inner.lock().signaled = true;
        sync_object::notify_available(kernel, self.as_ref(), Ok(()));
        self.release_waiters(kernel);
    }

    /// End the wait of every thread still blocked on a lock this thread owns
    fn release_waiters(self: &Arc<Self>, kernel: &KernelCore) {
        let waiters = {
            let mut inner = self.inner.lock();
            inner.num_kernel_waiters = 0;
            core::mem::take(&mut inner.waiters)
        };
        for (key, waiter) in waiters {
            if key.is_kernel() {
                error!(
                    "thread {} terminated while thread {} waits on its kernel lock",
                    self.thread_id.0, waiter.thread_id.0
                );
                panic!("thread terminated while holding a kernel lock with waiters");
            }
            waiter.set_lock_owner(None);
            waiter.cancel_wait(kernel, Err(KernelError::InvalidState), true);
        }
    }

    /// Last reference dropped
    fn finalize(self: &Arc<Self>, kernel: &KernelCore) {
        {
            let _sl = KScopedSchedulerLock::new(kernel);
            self.release_waiters(kernel);
            kernel.timeout_manager().unschedule(self.thread_id);
        }
        if let Some(process) = self.owner_process() {
            process.unregister_thread(self.thread_id);
        }
        kernel.global_scheduler_context().remove_thread(self.thread_id);
        debug!("thread {} finalized", self.thread_id.0);
    }

    /// Sleep for `timeout_ns` nanoseconds
    pub fn sleep(self: &Arc<Self>, kernel: &KernelCore, timeout_ns: i64) -> KResult<WaitStatus<()>> {
        let mut slp = KScopedSchedulerLockAndSleep::new(kernel, self, timeout_ns);

        if self.is_termination_requested() {
            slp.cancel_sleep();
            return Err(KernelError::TerminationRequested);
        }

        self.begin_wait(kernel, ThreadQueue::Sleep);
        self.set_wait_reason_for_debugging(ThreadWaitReasonForDebugging::Sleep);
        Ok(WaitStatus::Blocked)
    }

    // ------------------------------------------------------------------------
    // Waiting
    // ------------------------------------------------------------------------

    /// Mark the thread as waiting on `queue`
    pub(crate) fn begin_wait(self: &Arc<Self>, kernel: &KernelCore, queue: ThreadQueue) {
        self.set_state(kernel, ThreadState::Waiting);
        self.inner.lock().wait_queue = Some(queue);
    }

    fn take_wait_queue(&self) -> Option<ThreadQueue> {
        if self.state() != ThreadState::Waiting {
            return None;
        }
        self.inner.lock().wait_queue.take()
    }

    /// Wake the thread with `result`
    pub fn end_wait(self: &Arc<Self>, kernel: &KernelCore, result: KResult<()>) {
        let _sl = KScopedSchedulerLock::new(kernel);
        if let Some(queue) = self.take_wait_queue() {
            queue.end_wait(kernel, self, result);
        }
    }

    /// Abort the wait with `result`
    pub fn cancel_wait(self: &Arc<Self>, kernel: &KernelCore, result: KResult<()>, cancel_timer_task: bool) {
        let _sl = KScopedSchedulerLock::new(kernel);
        if let Some(queue) = self.take_wait_queue() {
            queue.cancel_wait(kernel, self, result, cancel_timer_task);
        }
    }

    /// Object `index` of this thread's synchronization wait became available
    pub(crate) fn notify_available(self: &Arc<Self>, kernel: &KernelCore, index: i32, result: KResult<()>) {
        if self.state() != ThreadState::Waiting {
            return;
        }
        let queue = {
            let mut inner = self.inner.lock();
            match inner.wait_queue {
                Some(ThreadQueue::Synchronization(_)) => inner.wait_queue.take(),
                _ => None,
            }
        };
        if let Some(queue) = queue {
            queue.notify_available(kernel, self, index, result);
        }
    }

    /// The thread's timeout expired
    pub(crate) fn on_timer(self: &Arc<Self>, kernel: &KernelCore) {
        if self.state() == ThreadState::Waiting {
            self.cancel_wait(kernel, Err(KernelError::TimedOut), false);
        }
    }

    /// Cancel a cancellable wait, or latch the cancellation for the next one
    pub fn wait_cancel(self: &Arc<Self>, kernel: &KernelCore) {
        let _sl = KScopedSchedulerLock::new(kernel);
        if self.state() == ThreadState::Waiting && self.is_cancellable() {
            self.inner.lock().wait_cancelled = false;
            self.cancel_wait(kernel, Err(KernelError::Cancelled), true);
        } else {
            self.inner.lock().wait_cancelled = true;
        }
    }
}

impl KSynchronizationObject for KThread {
    fn sync_base(&self) -> &SyncObjectBase {
        &self.sync
    }

    /// A thread is signaled once it has terminated
    fn is_signaled(&self) -> bool {
        self.inner.lock().signaled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_word_layout() {
        assert_eq!(SUSPEND_FLAG_MASK, 0x1F0);
        assert_eq!(SuspendType::Process.flag(), 0x10);
        assert_eq!(SuspendType::Init.flag(), 0x100);
        let raw = SuspendType::Thread.flag() | ThreadState::Runnable as u32;
        assert_eq!(ThreadState::from_raw(raw), ThreadState::Runnable);
        assert_ne!(raw, ThreadState::Runnable as u32);
    }

    #[test]
    fn test_activity_from_raw() {
        assert_eq!(ThreadActivity::from_raw(1), Some(ThreadActivity::Paused));
        assert_eq!(ThreadActivity::from_raw(2), None);
    }

    #[test]
    fn test_new_thread_defaults() {
        let t = KThread::new_detached(ThreadId(9), 30, 2, 0b100);
        assert_eq!(t.state(), ThreadState::Initialized);
        assert_eq!(t.priority(), 30);
        assert_eq!(t.base_priority(), 30);
        assert_eq!(t.active_core(), 2);
        assert_eq!(t.synced_index(), -1);
        assert_eq!(t.wait_result(), Err(KernelError::NoSynchronizationObject));
        assert_eq!(t.address_key(), AddressKey::None);
        assert!(!t.is_suspended());
        assert!(t.lock_owner().is_none());
        assert_eq!(t.reference_count(), 1);
    }

    #[test]
    fn test_address_keys() {
        let t = KThread::new_detached(ThreadId(1), 30, 0, 0b1);
        t.set_user_address_key(0x1000, 0x55);
        assert_eq!(t.address_key(), AddressKey::User(0x1000));
        assert_eq!(t.address_key_value(), 0x55);
        t.set_kernel_address_key(3);
        assert!(t.address_key().is_kernel());
    }
}
