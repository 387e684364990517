//! Per-core Scheduler
//!
//! Every core owns a [`KScheduler`] recording the thread it runs and the thread it should run
//! next. The decision is made for all cores at once when the outermost scheduler lock is
//! released: [`KScheduler::update_highest_priority_threads`] picks, per core,
//!
//! 1. the front of the core's scheduled queue,
//! 2. failing that, a thread suggested for the core that is not the top of its own core
//!    (taken only if that core's top may lose it, see `HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY`),
//! 3. failing that, the top of another core that has a second thread to fall back on.
//!
//! and returns the mask of cores whose choice changed. The frontend performs the actual switch
//! through [`SchedulerHost::context_switch`].

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::trace;
use spin::Mutex;

use crate::kern::affinity::KAffinityMask;
use crate::kern::kernel::KernelCore;
use crate::kern::lock::{KSchedulerLock, KScopedSchedulerLock};
use crate::kern::priority_queue::KPriorityQueue;
use crate::kern::thread::{KThread, ThreadState};
use crate::types::{ThreadId, HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY, NUM_CPU_CORES};

// ============================================================================
// Scheduler Host
// ============================================================================

/// Hooks into the frontend that executes guest threads
///
/// All methods are called without any kernel lock held except `disable_scheduling`, which runs
/// just before the scheduler lock is taken.
pub trait SchedulerHost: Send + Sync {
    /// The calling host thread entered the scheduler critical section
    fn disable_scheduling(&self) {}

    /// The critical section ended; `cores_needing_scheduling` will be rescheduled next
    fn enable_scheduling(&self, _cores_needing_scheduling: u64) {}

    /// Core `core` switches from `prev` to `next`
    fn context_switch(&self, _core: i32, _prev: &Arc<KThread>, _next: &Arc<KThread>) {}

    /// Interrupt the cores in `core_mask` so they observe a state change
    fn interrupt_cores(&self, _core_mask: u64) {}
}

/// Host that ignores every hook
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl SchedulerHost for NullHost {}

// ============================================================================
// Global Scheduler Context
// ============================================================================

/// Kernel-wide scheduling state
#[derive(Debug)]
pub struct GlobalSchedulerContext {
    scheduler_lock: KSchedulerLock,
    priority_queue: Mutex<KPriorityQueue>,
    scheduler_update_needed: AtomicBool,
    threads: Mutex<BTreeMap<ThreadId, Arc<KThread>>>,
}

impl GlobalSchedulerContext {
    /// Empty context with an unheld lock
    pub fn new() -> Self {
        Self {
            scheduler_lock: KSchedulerLock::new(),
            priority_queue: Mutex::new(KPriorityQueue::new()),
            scheduler_update_needed: AtomicBool::new(false),
            threads: Mutex::new(BTreeMap::new()),
        }
    }

    /// The global scheduler lock
    pub fn scheduler_lock(&self) -> &KSchedulerLock {
        &self.scheduler_lock
    }

    /// Queue of every runnable thread, by core and priority
    pub fn priority_queue(&self) -> &Mutex<KPriorityQueue> {
        &self.priority_queue
    }

    /// Ask the next unlock to recompute every core's choice
    pub fn set_scheduler_update_needed(&self) {
        self.scheduler_update_needed.store(true, Ordering::Release);
    }

    /// Whether a recompute is pending
    pub fn is_scheduler_update_needed(&self) -> bool {
        self.scheduler_update_needed.load(Ordering::Acquire)
    }

    fn clear_scheduler_update_needed(&self) {
        self.scheduler_update_needed.store(false, Ordering::Release);
    }

    // ------------------------------------------------------------------------
    // Thread registry
    // ------------------------------------------------------------------------

    /// Register a thread for lookup by id
    pub(crate) fn add_thread(&self, thread: &Arc<KThread>) {
        self.threads.lock().insert(thread.id(), Arc::clone(thread));
    }

    /// Forget a finalized thread
    pub(crate) fn remove_thread(&self, id: ThreadId) {
        self.threads.lock().remove(&id);
    }

    /// Look up a live thread
    pub fn thread_by_id(&self, id: ThreadId) -> Option<Arc<KThread>> {
        self.threads.lock().get(&id).cloned()
    }

    /// Snapshot of every live thread
    pub fn thread_list(&self) -> Vec<Arc<KThread>> {
        self.threads.lock().values().cloned().collect()
    }
}

// ============================================================================
// Per-core Scheduler
// ============================================================================

#[derive(Debug)]
struct SchedulerState {
    needs_scheduling: bool,
    /// Chosen thread; `None` selects the idle thread
    highest_priority_thread: Option<Arc<KThread>>,
    current_thread: Arc<KThread>,
}

/// Scheduler of one core
#[derive(Debug)]
pub struct KScheduler {
    core_id: i32,
    idle_thread: Arc<KThread>,
    state: Mutex<SchedulerState>,
    switch_count: AtomicU64,
}

impl KScheduler {
    /// Scheduler for `core_id` that starts out running `idle_thread`
    pub fn new(core_id: i32, idle_thread: Arc<KThread>) -> Self {
        Self {
            core_id,
            state: Mutex::new(SchedulerState {
                needs_scheduling: false,
                highest_priority_thread: None,
                current_thread: Arc::clone(&idle_thread),
            }),
            idle_thread,
            switch_count: AtomicU64::new(0),
        }
    }

    /// Core this scheduler drives
    pub fn core_id(&self) -> i32 {
        self.core_id
    }

    /// Thread run when nothing else is runnable
    pub fn idle_thread(&self) -> &Arc<KThread> {
        &self.idle_thread
    }

    /// Thread the core is running
    pub fn current_thread(&self) -> Arc<KThread> {
        Arc::clone(&self.state.lock().current_thread)
    }

    /// Thread the core should run, `None` for idle
    pub fn highest_priority_thread(&self) -> Option<Arc<KThread>> {
        self.state.lock().highest_priority_thread.clone()
    }

    /// Whether the core must switch at the next reschedule
    pub fn needs_scheduling(&self) -> bool {
        self.state.lock().needs_scheduling
    }

    /// Number of context switches this core performed
    pub fn switch_count(&self) -> u64 {
        self.switch_count.load(Ordering::Relaxed)
    }

    fn is_running(&self, thread: &Arc<KThread>) -> bool {
        Arc::ptr_eq(&self.state.lock().current_thread, thread)
    }

    /// Record `highest` as this core's choice; returns this core's bit if it changed
    fn update_highest_priority_thread(&self, kernel: &KernelCore, highest: Option<&Arc<KThread>>) -> u64 {
        let prev = {
            let state = self.state.lock();
            let unchanged = match (&state.highest_priority_thread, highest) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            };
            if unchanged {
                return 0;
            }
            state.highest_priority_thread.clone()
        };

        if let Some(prev) = &prev {
            Self::increment_scheduled_count(prev);
            prev.set_last_scheduled_tick(kernel.timeout_manager().now_ns());
        }

        let mut state = self.state.lock();
        state.highest_priority_thread = highest.cloned();
        state.needs_scheduling = true;
        trace!(
            "core {} selects {:?}",
            self.core_id,
            highest.map(|t| t.id().0)
        );
        1u64 << self.core_id
    }

    /// Switch to the chosen thread if the choice changed since the last switch
    pub fn reschedule(&self, kernel: &KernelCore) {
        let (prev, next) = {
            let mut state = self.state.lock();
            if !state.needs_scheduling {
                return;
            }
            state.needs_scheduling = false;
            let next = state
                .highest_priority_thread
                .clone()
                .unwrap_or_else(|| Arc::clone(&self.idle_thread));
            if Arc::ptr_eq(&next, &state.current_thread) {
                return;
            }
            let prev = core::mem::replace(&mut state.current_thread, Arc::clone(&next));
            (prev, next)
        };

        next.set_current_core(self.core_id);
        self.switch_count.fetch_add(1, Ordering::Relaxed);
        trace!(
            "core {} switch {} -> {}",
            self.core_id,
            prev.id().0,
            next.id().0
        );
        kernel.host().context_switch(self.core_id, &prev, &next);
    }

    // ------------------------------------------------------------------------
    // Scheduler lock hooks
    // ------------------------------------------------------------------------

    /// Notify the host that the scheduler lock is being taken
    pub fn disable_scheduling(kernel: &KernelCore) {
        kernel.host().disable_scheduling();
    }

    /// Notify the host of the release and reschedule the flagged cores
    pub fn enable_scheduling(kernel: &KernelCore, cores_needing_scheduling: u64) {
        kernel.host().enable_scheduling(cores_needing_scheduling);
        for core in 0..NUM_CPU_CORES {
            if cores_needing_scheduling & (1u64 << core) != 0 {
                kernel.scheduler(core).reschedule(kernel);
            }
        }
    }

    /// Recompute every core's choice if anything changed; returns the cores to reschedule
    pub fn update_highest_priority_threads(kernel: &KernelCore) -> u64 {
        if kernel.global_scheduler_context().is_scheduler_update_needed() {
            Self::update_highest_priority_threads_impl(kernel)
        } else {
            0
        }
    }

    fn update_highest_priority_threads_impl(kernel: &KernelCore) -> u64 {
        let context = kernel.global_scheduler_context();
        context.clear_scheduler_update_needed();

        let mut pq = context.priority_queue().lock();
        let mut cores_needing_scheduling = 0u64;
        let mut idle_cores = 0u64;
        let mut top_threads: [Option<Arc<KThread>>; NUM_CPU_CORES] = Default::default();

        for core in 0..NUM_CPU_CORES {
            let top = pq.get_scheduled_front(core as i32);
            if top.is_none() {
                idle_cores |= 1u64 << core;
            }
            cores_needing_scheduling |= kernel
                .scheduler(core)
                .update_highest_priority_thread(kernel, top.as_ref());
            top_threads[core] = top;
        }

        // Try to give every idle core a thread suggested for it.
        while idle_cores != 0 {
            let core = idle_cores.trailing_zeros() as usize;
            let core_id = core as i32;

            let mut suggested = pq.get_suggested_front(core_id);
            let mut candidates: heapless::Vec<i32, NUM_CPU_CORES> = heapless::Vec::new();

            while let Some(thread) = suggested.clone() {
                let suggested_core = thread.active_core();
                let top = if suggested_core >= 0 {
                    top_threads[suggested_core as usize].clone()
                } else {
                    None
                };

                if !top.as_ref().is_some_and(|top| Arc::ptr_eq(top, &thread)) {
                    if top
                        .as_ref()
                        .is_some_and(|top| top.priority() < HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY)
                    {
                        break;
                    }

                    thread.set_active_core(core_id);
                    pq.change_core(suggested_core, &thread, false);
                    cores_needing_scheduling |= kernel
                        .scheduler(core)
                        .update_highest_priority_thread(kernel, Some(&thread));
                    top_threads[core] = Some(thread);
                    break;
                }

                // The suggestion runs its own core; remember the core as a fallback.
                let _ = candidates.push(suggested_core);
                suggested = pq.get_suggested_next(core_id, &thread);
            }

            if suggested.is_none() {
                for &candidate_core in &candidates {
                    let Some(candidate_top) = top_threads[candidate_core as usize].clone() else {
                        continue;
                    };
                    let Some(next_on_candidate) = pq.get_scheduled_next(candidate_core, &candidate_top) else {
                        continue;
                    };

                    cores_needing_scheduling |= kernel
                        .scheduler(candidate_core as usize)
                        .update_highest_priority_thread(kernel, Some(&next_on_candidate));
                    top_threads[candidate_core as usize] = Some(next_on_candidate);

                    candidate_top.set_active_core(core_id);
                    pq.change_core(candidate_core, &candidate_top, false);
                    cores_needing_scheduling |= kernel
                        .scheduler(core)
                        .update_highest_priority_thread(kernel, Some(&candidate_top));
                    top_threads[core] = Some(candidate_top);
                    break;
                }
            }

            idle_cores &= !(1u64 << core);
        }

        cores_needing_scheduling
    }

    // ------------------------------------------------------------------------
    // Thread change notifications
    // ------------------------------------------------------------------------

    /// Count a scheduling event against the owning process of `thread`
    fn increment_scheduled_count(thread: &Arc<KThread>) {
        if let Some(process) = thread.owner_process() {
            process.increment_scheduled_count();
        }
    }

    /// Requeue `thread` after its raw state changed from `old_state`
    pub fn on_thread_state_changed(kernel: &KernelCore, thread: &Arc<KThread>, old_state: u32) {
        let cur_state = thread.raw_state();
        if cur_state == old_state {
            return;
        }

        let runnable = ThreadState::Runnable as u32;
        let context = kernel.global_scheduler_context();
        if old_state == runnable {
            context.priority_queue().lock().remove(thread);
        } else if cur_state == runnable {
            context.priority_queue().lock().push_back(thread);
        } else {
            return;
        }
        Self::increment_scheduled_count(thread);
        context.set_scheduler_update_needed();
    }

    /// Requeue a runnable thread whose priority changed
    pub fn on_thread_priority_changed(kernel: &KernelCore, thread: &Arc<KThread>, old_priority: i32) {
        if thread.raw_state() != ThreadState::Runnable as u32 {
            return;
        }
        let core = thread.active_core();
        let is_running = core >= 0 && kernel.scheduler(core as usize).is_running(thread);
        let context = kernel.global_scheduler_context();
        context
            .priority_queue()
            .lock()
            .change_priority(old_priority, is_running, thread);
        Self::increment_scheduled_count(thread);
        context.set_scheduler_update_needed();
    }

    /// Requeue a runnable thread whose core mask changed
    pub fn on_thread_affinity_mask_changed(
        kernel: &KernelCore,
        thread: &Arc<KThread>,
        old_affinity: KAffinityMask,
        old_core: i32,
    ) {
        if thread.raw_state() != ThreadState::Runnable as u32 {
            return;
        }
        let context = kernel.global_scheduler_context();
        context
            .priority_queue()
            .lock()
            .change_affinity_mask(old_core, old_affinity, thread);
        Self::increment_scheduled_count(thread);
        context.set_scheduler_update_needed();
    }

    // ------------------------------------------------------------------------
    // Rotation and yields
    // ------------------------------------------------------------------------

    /// Preemption round: rotate `priority` on `core` and pull in better suggestions
    pub fn rotate_scheduled_queue(kernel: &KernelCore, core: i32, priority: i32) {
        let context = kernel.global_scheduler_context();
        let current = kernel.scheduler(core as usize).current_thread();
        let mut pq = context.priority_queue().lock();

        let top = pq.get_scheduled_front_at(core, priority);
        let mut next = None;
        if let Some(top) = &top {
            next = pq.move_to_scheduled_back(top);
            if let Some(next) = &next {
                if !Arc::ptr_eq(next, top) {
                    Self::increment_scheduled_count(top);
                    Self::increment_scheduled_count(next);
                }
            }
        }
        let rotated = match (&top, &next) {
            (Some(top), Some(next)) => !Arc::ptr_eq(top, next),
            _ => false,
        };

        // Migrate a same-priority suggestion to the front.
        let mut suggested = pq.get_suggested_front_at(core, priority);
        while let Some(thread) = suggested.clone() {
            let suggested_core = thread.active_core();
            let top_on_suggested = if suggested_core >= 0 {
                pq.get_scheduled_front(suggested_core)
            } else {
                None
            };
            if !top_on_suggested
                .as_ref()
                .is_some_and(|t| Arc::ptr_eq(t, &thread))
            {
                // A rotated-in thread that has waited longer wins over the suggestion.
                if rotated
                    && next
                        .as_ref()
                        .is_some_and(|n| n.last_scheduled_tick() < thread.last_scheduled_tick())
                {
                    break;
                }

                if top_on_suggested
                    .as_ref()
                    .map_or(true, |t| t.priority() >= HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY)
                {
                    thread.set_active_core(core);
                    pq.change_core(suggested_core, &thread, true);
                    Self::increment_scheduled_count(&thread);
                    break;
                }
            }
            suggested = pq.get_same_priority_next(core, &thread);
        }

        // Pull in a strictly better suggestion if what remains is no better than `priority`.
        let mut best = pq.get_scheduled_front(core);
        if best.as_ref().is_some_and(|b| Arc::ptr_eq(b, &current)) {
            best = pq.get_scheduled_next(core, &current);
        }
        if let Some(best) = best.filter(|b| b.priority() >= priority) {
            let mut suggested = pq.get_suggested_front(core);
            while let Some(thread) = suggested.clone() {
                if thread.priority() >= best.priority() {
                    break;
                }
                let suggested_core = thread.active_core();
                let top_on_suggested = if suggested_core >= 0 {
                    pq.get_scheduled_front(suggested_core)
                } else {
                    None
                };
                if !top_on_suggested
                    .as_ref()
                    .is_some_and(|t| Arc::ptr_eq(t, &thread))
                    && top_on_suggested
                        .as_ref()
                        .map_or(true, |t| t.priority() >= HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY)
                {
                    thread.set_active_core(core);
                    pq.change_core(suggested_core, &thread, true);
                    Self::increment_scheduled_count(&thread);
                    break;
                }
                suggested = pq.get_suggested_next(core, &thread);
            }
        }

        drop(pq);
        context.set_scheduler_update_needed();
    }

    /// The process scheduled count `cur`'s yields are measured against
    fn process_scheduled_count(cur: &Arc<KThread>) -> Option<i64> {
        cur.owner_process().map(|process| process.scheduled_count())
    }

    /// Move `cur` behind the other threads of its priority on its core
    pub fn yield_without_core_migration(kernel: &KernelCore, cur: &Arc<KThread>) {
        let scheduled_count = Self::process_scheduled_count(cur);
        if scheduled_count == Some(cur.yield_schedule_count()) {
            return;
        }

        let _sl = KScopedSchedulerLock::new(kernel);
        if cur.raw_state() != ThreadState::Runnable as u32 {
            return;
        }

        let context = kernel.global_scheduler_context();
        let next = context.priority_queue().lock().move_to_scheduled_back(cur);
        Self::increment_scheduled_count(cur);

        if next.as_ref().is_some_and(|next| !Arc::ptr_eq(next, cur)) {
            context.set_scheduler_update_needed();
        } else if let Some(count) = scheduled_count {
            cur.set_yield_schedule_count(count);
        }
    }

    /// Yield, letting a thread suggested for `cur`'s core migrate in
    pub fn yield_with_core_migration(kernel: &KernelCore, cur: &Arc<KThread>) {
        let scheduled_count = Self::process_scheduled_count(cur);
        if scheduled_count == Some(cur.yield_schedule_count()) {
            return;
        }

        let _sl = KScopedSchedulerLock::new(kernel);
        if cur.raw_state() != ThreadState::Runnable as u32 {
            return;
        }

        let context = kernel.global_scheduler_context();
        let core = cur.active_core();
        let mut pq = context.priority_queue().lock();
        let next = pq.move_to_scheduled_back(cur);
        Self::increment_scheduled_count(cur);
        let next_is_other = next.as_ref().is_some_and(|next| !Arc::ptr_eq(next, cur));

        let mut recheck = false;
        let mut suggested = pq.get_suggested_front(core);
        while let Some(thread) = suggested.clone() {
            let suggested_core = thread.active_core();
            let running_on_suggested = if suggested_core >= 0 {
                kernel.scheduler(suggested_core as usize).highest_priority_thread()
            } else {
                None
            };

            if !running_on_suggested
                .as_ref()
                .is_some_and(|t| Arc::ptr_eq(t, &thread))
            {
                // Prefer the next thread over a worse suggestion, or over an equal one that has
                // waited less.
                let prefer_next = thread.priority() > cur.priority()
                    || (thread.priority() == cur.priority()
                        && next_is_other
                        && next
                            .as_ref()
                            .is_some_and(|n| n.last_scheduled_tick() < thread.last_scheduled_tick()));
                if prefer_next {
                    suggested = None;
                    break;
                }

                if running_on_suggested
                    .as_ref()
                    .map_or(true, |t| t.priority() >= HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY)
                {
                    thread.set_active_core(core);
                    pq.change_core(suggested_core, &thread, true);
                    Self::increment_scheduled_count(&thread);
                    break;
                }
                recheck = true;
            }
            suggested = pq.get_suggested_next(core, &thread);
        }
        drop(pq);

        if suggested.is_some() || next_is_other {
            context.set_scheduler_update_needed();
        } else if !recheck {
            if let Some(count) = scheduled_count {
                cur.set_yield_schedule_count(count);
            }
        }
    }

    /// Give up `cur`'s core entirely; it runs again wherever a core is free
    pub fn yield_to_any_thread(kernel: &KernelCore, cur: &Arc<KThread>) {
        let scheduled_count = Self::process_scheduled_count(cur);
        if scheduled_count == Some(cur.yield_schedule_count()) {
            return;
        }

        let _sl = KScopedSchedulerLock::new(kernel);
        if cur.raw_state() != ThreadState::Runnable as u32 {
            return;
        }

        let context = kernel.global_scheduler_context();
        let core = cur.active_core();
        let mut pq = context.priority_queue().lock();
        cur.set_active_core(-1);
        pq.change_core(core, cur, false);
        Self::increment_scheduled_count(cur);

        if pq.get_scheduled_front(core).is_some() {
            drop(pq);
            context.set_scheduler_update_needed();
            return;
        }

        let mut suggested = pq.get_suggested_front(core);
        while let Some(thread) = suggested.clone() {
            let suggested_core = thread.active_core();
            let top_on_suggested = if suggested_core >= 0 {
                pq.get_scheduled_front(suggested_core)
            } else {
                None
            };
            if !top_on_suggested
                .as_ref()
                .is_some_and(|t| Arc::ptr_eq(t, &thread))
            {
                if top_on_suggested
                    .as_ref()
                    .map_or(true, |t| t.priority() >= HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY)
                {
                    thread.set_active_core(core);
                    pq.change_core(suggested_core, &thread, false);
                    Self::increment_scheduled_count(&thread);
                }
                break;
            }
            suggested = pq.get_suggested_next(core, &thread);
        }
        drop(pq);

        if suggested.as_ref().is_some_and(|s| Arc::ptr_eq(s, cur)) {
            if let Some(count) = scheduled_count {
                cur.set_yield_schedule_count(count);
            }
        } else {
            context.set_scheduler_update_needed();
        }
    }
}
