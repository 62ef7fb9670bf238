//! # Scheduler
//!
//! The [`Runtime`]: a FIFO ready queue, the thread table, and the switch
//! logic that moves the processor between threads.
//!
//! ## Scheduling
//!
//! Round-robin. A thread that gives up the processor goes to the tail of
//! the ready queue; the next Ready thread from the head runs. Blocked
//! threads stay in the queue and are cycled past until unblocked. Exited
//! threads are reaped by the next voluntary scan that meets them, except a
//! thread still running on its own stack. Scans driven by a tick never
//! free memory.
//!
//! ## Locking
//!
//! State sits behind a spin lock that is only taken with the tick signal
//! masked and is always released before a context switch. A switch is
//! bracketed by `disable` on the outgoing side and `enable` on whichever
//! thread resumes.

mod active;
pub mod config;
pub mod metrics;
pub mod queue;

pub use config::RuntimeConfig;
pub use metrics::{SchedulerMetrics, SchedulerStats};

use self::active::ActiveGuard;
use self::queue::Queue;
use crate::context::{self, SwitchReason};
use crate::preempt::PreemptionController;
use crate::thread::{Thread, ThreadFlags, ThreadState, ThreadTable};
use crate::{ExecError, ExecResult, ThreadId};
use core::panic::AssertUnwindSafe;
use core::sync::atomic::{AtomicU64, Ordering};
use static_assertions::assert_not_impl_any;
use std::panic;
use uthread_hal::{ContextBackend, UcontextBackend};

/// Work a thread runs
///
/// Receives the runtime so it can spawn, yield, block and unblock.
pub type ThreadEntry<B = UcontextBackend> = Box<dyn FnOnce(&Runtime<B>) + 'static>;

struct RuntimeInner<B: ContextBackend + 'static> {
    ready: Queue<ThreadId>,
    threads: ThreadTable<B>,
    current: Option<ThreadId>,
    /// Context of the OS thread inside `run`, resumed when nothing can run
    idle: Option<Box<B::Context>>,
    running: bool,
}

/// User-level thread runtime
///
/// Multiplexes many threads onto the OS thread that calls [`run`]. Not
/// `Send` or `Sync`: it lives and dies on that OS thread.
///
/// [`run`]: Runtime::run
pub struct Runtime<B: ContextBackend + 'static = UcontextBackend> {
    /// Distinguishes runtimes for the lifetime of the process
    instance: u64,
    backend: B,
    config: RuntimeConfig,
    preempt: PreemptionController,
    metrics: SchedulerMetrics,
    inner: spin::Mutex<RuntimeInner<B>>,
}

assert_not_impl_any!(Runtime: Send, Sync);

impl Runtime {
    /// Create a runtime with the default configuration
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a runtime on the ucontext backend
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_backend(UcontextBackend::new(config.stack_size), config)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: ContextBackend + 'static> Runtime<B> {
    /// Create a runtime on a custom context backend
    pub fn with_backend(backend: B, config: RuntimeConfig) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self {
            instance: COUNTER.fetch_add(1, Ordering::Relaxed),
            backend,
            config,
            preempt: PreemptionController::new(),
            metrics: SchedulerMetrics::new(),
            inner: spin::Mutex::new(RuntimeInner {
                ready: Queue::new(),
                threads: ThreadTable::new(),
                current: None,
                idle: None,
                running: false,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Get the context backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Snapshot of the scheduler counters
    pub fn metrics(&self) -> SchedulerStats {
        self.metrics.snapshot()
    }

    /// Check whether `run` is in progress
    pub fn is_running(&self) -> bool {
        let _gate = self.preempt.guard();
        self.inner.lock().running
    }

    /// The running thread, or `None` outside of any thread
    pub fn current(&self) -> Option<ThreadId> {
        let _gate = self.preempt.guard();
        self.inner.lock().current
    }

    /// State of a thread; `None` once it has been reaped
    pub fn state(&self, id: ThreadId) -> Option<ThreadState> {
        let _gate = self.preempt.guard();
        self.inner.lock().threads.get(id).map(|thread| thread.state())
    }

    /// Flags of a thread; `None` once it has been reaped
    pub fn flags(&self, id: ThreadId) -> Option<ThreadFlags> {
        let _gate = self.preempt.guard();
        self.inner.lock().threads.get(id).map(|thread| thread.flags())
    }

    /// Number of threads not yet reaped
    pub fn thread_count(&self) -> usize {
        let _gate = self.preempt.guard();
        self.inner.lock().threads.len()
    }

    /// Number of entries in the ready queue
    pub fn ready_len(&self) -> usize {
        let _gate = self.preempt.guard();
        self.inner.lock().ready.len()
    }

    pub(crate) fn instance(&self) -> u64 {
        self.instance
    }

    pub(crate) fn preemption(&self) -> &PreemptionController {
        &self.preempt
    }

    /// `current` for callers that already hold preemption off
    pub(crate) fn current_unguarded(&self) -> Option<ThreadId> {
        self.inner.lock().current
    }

    /// Run `entry` as the initial thread and schedule until no thread can
    /// make progress.
    ///
    /// With `preempt` set, a virtual timer ticks at the configured rate and
    /// forces the running thread to yield on every tick.
    ///
    /// Threads spawned before `run` are scheduled after the initial thread.
    ///
    /// # Errors
    ///
    /// - [`ExecError::InvalidArgument`] for an invalid configuration
    /// - [`ExecError::SchedulerError`] if this OS thread already drives a
    ///   runtime, or the initial thread or the tick source cannot be set up
    /// - [`ExecError::Deadlock`] if threads were still blocked when nothing
    ///   else could run; they are released regardless
    pub fn run<F>(&self, preempt: bool, entry: F) -> ExecResult<()>
    where
        F: FnOnce(&Runtime<B>) + 'static,
    {
        self.config.validate()?;
        let _active = ActiveGuard::enter(self)?;

        {
            let mut inner = self.inner.lock();
            if inner.running {
                return Err(ExecError::SchedulerError);
            }
            inner.running = true;
            inner.idle = Some(self.backend.new_context());
        }

        let initial = match self.spawn(entry) {
            Ok(id) => id,
            Err(err) => {
                log::warn!("failed to create initial thread: {}", err);
                self.abandon_run(None);
                return Err(ExecError::SchedulerError);
            }
        };

        if let Err(err) = self.preempt.start(preempt, self.config.tick_hz, active::on_tick) {
            log::warn!("failed to start preemption: {}", err);
            self.abandon_run(Some(initial));
            return Err(ExecError::SchedulerError);
        }

        let switch = {
            let mut inner = self.inner.lock();
            // Goes first, ahead of threads spawned before the run.
            let _ = inner.ready.delete(&initial);
            inner.current = Some(initial);
            let to = inner.threads.get_mut(initial).map(|thread| {
                thread.set_state(ThreadState::Running);
                thread.add_flags(ThreadFlags::INITIAL);
                thread.context_ptr()
            });
            let from = inner.idle.as_deref_mut().map(|idle| idle as *mut B::Context);
            from.zip(to)
        };
        let Some((from, to)) = switch else {
            self.preempt.stop();
            self.abandon_run(Some(initial));
            return Err(ExecError::SchedulerError);
        };

        log::info!(
            "runtime started: initial thread {}, preemption {}",
            initial,
            if preempt { "on" } else { "off" }
        );
        self.metrics.record_context_switch();
        // SAFETY: the idle context is owned by `inner` until teardown below
        // and the initial thread's context was initialized by `spawn`.
        unsafe { context::switch(&self.backend, from, to, SwitchReason::Start) };

        // Back on the idle context with ticks masked: no thread can run.
        self.preempt.stop();
        let stranded = self.teardown();
        if stranded > 0 {
            log::warn!("runtime finished with {} blocked thread(s)", stranded);
            return Err(ExecError::Deadlock);
        }
        log::info!("runtime finished");
        Ok(())
    }

    /// Create a thread that will run `entry`.
    ///
    /// The thread is appended to the ready queue; it first runs when the
    /// scheduler reaches it. May be called before `run`, or from any
    /// thread.
    ///
    /// # Errors
    ///
    /// - [`ExecError::OutOfMemory`] if the stack or the thread table cannot
    ///   be allocated
    /// - [`ExecError::SchedulerError`] if the context cannot be initialized
    ///   or the thread cannot be enqueued
    pub fn spawn<F>(&self, entry: F) -> ExecResult<ThreadId>
    where
        F: FnOnce(&Runtime<B>) + 'static,
    {
        // Ticks stay masked across the allocations: the tick path must not
        // run while the allocator lock is held.
        let _gate = self.preempt.guard();

        let mut stack = self.backend.allocate_stack().map_err(|err| {
            log::warn!("stack allocation failed: {}", err);
            ExecError::from(err)
        })?;
        let mut context = self.backend.new_context();
        if let Err(err) = self.backend.initialize(&mut context, &mut stack, thread_start::<B>) {
            log::warn!("context initialization failed: {}", err);
            self.backend.destroy_stack(stack);
            return Err(ExecError::SchedulerError);
        }

        let mut inner = self.inner.lock();
        let id = match inner.threads.reserve().and_then(|()| inner.threads.next_id()) {
            Ok(id) => id,
            Err(err) => {
                drop(inner);
                self.backend.destroy_stack(stack);
                return Err(err);
            }
        };
        inner
            .threads
            .insert(Box::new(Thread::new(id, stack, context, Box::new(entry))));

        if let Err(err) = inner.ready.enqueue(id) {
            drop(inner);
            log::warn!("failed to enqueue thread {}: {}", id, err);
            self.discard(id);
            return Err(ExecError::SchedulerError);
        }
        drop(inner);

        self.metrics.record_spawn();
        log::debug!("spawned thread {}", id);
        Ok(id)
    }

    /// Give up the processor to the next Ready thread.
    ///
    /// Returns immediately if no other thread is Ready.
    pub fn yield_now(&self) {
        self.metrics.record_yield();
        self.reschedule(SwitchReason::Yield, None);
    }

    /// Terminate the calling thread.
    ///
    /// Its stack is released by a later scheduling pass.
    ///
    /// # Panics
    ///
    /// Panics if called outside a runtime thread.
    pub fn exit(&self) -> ! {
        self.reschedule(SwitchReason::Exit, Some(ThreadState::Exited));
        panic!("Runtime::exit called outside a runtime thread");
    }

    /// Suspend the calling thread until another thread unblocks it
    pub fn block(&self) {
        self.reschedule(SwitchReason::Blocked, Some(ThreadState::Blocked));
    }

    /// Make a Blocked thread Ready.
    ///
    /// Does not switch; the thread resumes when the scheduler reaches it.
    /// Threads that are not Blocked, and ids of reaped threads, are left
    /// alone.
    pub fn unblock(&self, id: ThreadId) {
        let _gate = self.preempt.guard();
        if self.wake(id) {
            log::debug!("unblocked thread {}", id);
        }
    }

    /// `unblock` for callers that already hold preemption off.
    ///
    /// Returns whether the thread was Blocked.
    pub(crate) fn wake(&self, id: ThreadId) -> bool {
        let mut inner = self.inner.lock();
        match inner.threads.get_mut(id) {
            Some(thread) if thread.state() == ThreadState::Blocked => {
                thread.set_state(ThreadState::Ready);
                true
            }
            _ => false,
        }
    }

    /// Move the running thread to the ready queue tail, apply `transition`
    /// to it, and switch to the next Ready thread.
    fn reschedule(&self, reason: SwitchReason, transition: Option<ThreadState>) {
        self.preempt.disable();
        let mut inner = self.inner.lock();

        let Some(prev) = inner.current else {
            drop(inner);
            self.preempt.enable();
            return;
        };

        if let Some(thread) = inner.threads.get_mut(prev) {
            match transition {
                Some(state) => thread.set_state(state),
                None if thread.state() == ThreadState::Running => {
                    thread.set_state(ThreadState::Ready);
                }
                None => {}
            }
        }
        // Never allocates: the queue grew to hold every live thread when
        // the thread was spawned.
        let requeued = inner.ready.enqueue(prev).is_ok();
        debug_assert!(requeued, "ready queue rejected the running thread");

        let mut next = None;
        for _ in 0..inner.ready.len() {
            let Ok(id) = inner.ready.dequeue() else {
                break;
            };
            match inner.threads.get(id).map(|thread| thread.state()) {
                Some(state) if state.is_runnable() => {
                    next = Some(id);
                    break;
                }
                // A tick may have interrupted the allocator, so the tick
                // path leaves exited threads for the next voluntary pass.
                Some(state) if state.is_terminated() && id != prev && reason.is_voluntary() => {
                    self.reap(&mut inner, id);
                }
                // Blocked, exited during a tick, or the caller exiting on
                // its own stack.
                Some(_) => {
                    let _ = inner.ready.enqueue(id);
                }
                None => {}
            }
        }

        if next == Some(prev) {
            if let Some(thread) = inner.threads.get_mut(prev) {
                thread.set_state(ThreadState::Running);
            }
            drop(inner);
            self.preempt.enable();
            return;
        }

        let to = match next {
            Some(id) => inner.threads.get_mut(id).map(|thread| {
                thread.set_state(ThreadState::Running);
                thread.context_ptr()
            }),
            None => inner.idle.as_deref_mut().map(|idle| idle as *mut B::Context),
        };
        let from = inner.threads.get_mut(prev).map(|thread| thread.context_ptr());
        let (Some(from), Some(to)) = (from, to) else {
            unreachable!("scheduler lost the context of {} or its successor", prev);
        };
        inner.current = next;
        drop(inner);

        self.metrics.record_context_switch();
        // SAFETY: `prev` is queued and not reaped until it has switched
        // away; `to` is a Ready thread or the idle context, both alive.
        unsafe { context::switch(&self.backend, from, to, reason) };

        self.preempt.enable();
    }

    /// Release an exited thread's resources and retire its id
    fn reap(&self, inner: &mut RuntimeInner<B>, id: ThreadId) {
        let _ = inner.ready.delete(&id);
        if let Some(mut thread) = inner.threads.remove(id) {
            if let Some(stack) = thread.take_stack() {
                self.backend.destroy_stack(stack);
            }
            self.metrics.record_reap();
        }
    }

    /// Drop a thread that never reached the ready queue
    fn discard(&self, id: ThreadId) {
        let stack = self
            .inner
            .lock()
            .threads
            .remove(id)
            .and_then(|mut thread| thread.take_stack());
        if let Some(stack) = stack {
            self.backend.destroy_stack(stack);
        }
    }

    /// First code a new thread runs, on its own stack
    fn start_current(&self) -> ! {
        let (id, entry) = {
            let mut inner = self.inner.lock();
            match inner.current {
                Some(id) => {
                    let entry = inner.threads.get_mut(id).and_then(|thread| {
                        thread.add_flags(ThreadFlags::STARTED);
                        thread.take_entry()
                    });
                    (Some(id), entry)
                }
                None => (None, None),
            }
        };
        // Fresh contexts start masked.
        self.preempt.enable();

        if let (Some(id), Some(entry)) = (id, entry) {
            if panic::catch_unwind(AssertUnwindSafe(|| entry(self))).is_err() {
                let _gate = self.preempt.guard();
                if let Some(thread) = self.inner.lock().threads.get_mut(id) {
                    thread.add_flags(ThreadFlags::PANICKED);
                }
                self.metrics.record_panic();
                log::warn!("thread {} panicked", id);
            }
        }
        self.exit()
    }

    /// Deliver one tick: preempt the running thread
    fn handle_tick(&self) {
        self.metrics.record_tick();
        if !self.preempt.is_armed() {
            return;
        }
        // Every holder of the state lock has ticks masked, so the lock is
        // free whenever a tick gets through.
        let in_thread = match self.inner.try_lock() {
            Some(inner) => inner.current.is_some(),
            None => false,
        };
        if !in_thread {
            return;
        }
        self.metrics.record_preemption();
        self.reschedule(SwitchReason::Preemption, None);
    }

    /// Release every remaining thread after the last switch back to idle.
    ///
    /// Returns how many of them were still blocked.
    fn teardown(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut stranded = 0;
        for id in inner.threads.ids() {
            if inner.threads.get(id).map(|thread| thread.state()) == Some(ThreadState::Blocked) {
                log::debug!("thread {} never unblocked", id);
                stranded += 1;
            }
            self.reap(&mut inner, id);
        }
        while inner.ready.dequeue().is_ok() {}
        inner.current = None;
        inner.idle = None;
        inner.running = false;
        stranded
    }

    /// Undo `run`'s setup when it fails before the first switch
    fn abandon_run(&self, initial: Option<ThreadId>) {
        let mut inner = self.inner.lock();
        if let Some(id) = initial {
            self.reap(&mut inner, id);
        }
        inner.current = None;
        inner.idle = None;
        inner.running = false;
    }
}

impl<B: ContextBackend + 'static> Drop for Runtime<B> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for id in inner.threads.ids() {
            if let Some(mut thread) = inner.threads.remove(id) {
                if let Some(stack) = thread.take_stack() {
                    self.backend.destroy_stack(stack);
                }
            }
        }
    }
}

impl<B: ContextBackend + 'static> core::fmt::Debug for Runtime<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("preempt", &self.preempt)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

/// Entry point of every spawned context
extern "C" fn thread_start<B: ContextBackend + 'static>() {
    // SAFETY: only `Runtime<B>::spawn` initializes contexts with this
    // entry, and a context only runs while its runtime is active.
    match unsafe { active::current::<B>() } {
        Some(runtime) => runtime.start_current(),
        None => {
            log::error!("thread context started without an active runtime");
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use uthread_hal::{HalError, HalResult, Stack, Ucontext};

    /// Backend that counts live stacks
    #[derive(Debug)]
    struct CountingBackend {
        inner: UcontextBackend,
        live: Rc<Cell<usize>>,
    }

    impl CountingBackend {
        fn new(live: Rc<Cell<usize>>) -> Self {
            Self {
                inner: UcontextBackend::new(64 * 1024),
                live,
            }
        }
    }

    impl ContextBackend for CountingBackend {
        type Context = Ucontext;

        fn new_context(&self) -> Box<Ucontext> {
            self.inner.new_context()
        }

        fn allocate_stack(&self) -> HalResult<Stack> {
            let stack = self.inner.allocate_stack()?;
            self.live.set(self.live.get() + 1);
            Ok(stack)
        }

        fn initialize(
            &self,
            context: &mut Ucontext,
            stack: &mut Stack,
            entry: uthread_hal::context::ContextEntry,
        ) -> HalResult<()> {
            self.inner.initialize(context, stack, entry)
        }

        unsafe fn switch(&self, from: *mut Ucontext, to: *const Ucontext) -> HalResult<()> {
            unsafe { self.inner.switch(from, to) }
        }

        fn destroy_stack(&self, stack: Stack) {
            self.live.set(self.live.get() - 1);
            self.inner.destroy_stack(stack);
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Fault {
        Stack,
        Initialize,
    }

    /// Counting backend that fails on demand
    #[derive(Debug)]
    struct FaultyBackend {
        inner: CountingBackend,
        fault: Cell<Option<Fault>>,
    }

    impl ContextBackend for FaultyBackend {
        type Context = Ucontext;

        fn new_context(&self) -> Box<Ucontext> {
            self.inner.new_context()
        }

        fn allocate_stack(&self) -> HalResult<Stack> {
            if self.fault.get() == Some(Fault::Stack) {
                return Err(HalError::OutOfMemory);
            }
            self.inner.allocate_stack()
        }

        fn initialize(
            &self,
            context: &mut Ucontext,
            stack: &mut Stack,
            entry: uthread_hal::context::ContextEntry,
        ) -> HalResult<()> {
            if self.fault.get() == Some(Fault::Initialize) {
                return Err(HalError::ContextInitFailed);
            }
            self.inner.initialize(context, stack, entry)
        }

        unsafe fn switch(&self, from: *mut Ucontext, to: *const Ucontext) -> HalResult<()> {
            unsafe { self.inner.switch(from, to) }
        }

        fn destroy_stack(&self, stack: Stack) {
            self.inner.destroy_stack(stack);
        }
    }

    fn faulty_runtime() -> (Runtime<FaultyBackend>, Rc<Cell<usize>>) {
        let live = Rc::new(Cell::new(0));
        let backend = FaultyBackend {
            inner: CountingBackend::new(live.clone()),
            fault: Cell::new(None),
        };
        (Runtime::with_backend(backend, RuntimeConfig::small_stacks()), live)
    }

    fn counting_runtime() -> (Runtime<CountingBackend>, Rc<Cell<usize>>) {
        let live = Rc::new(Cell::new(0));
        let rt = Runtime::with_backend(
            CountingBackend::new(live.clone()),
            RuntimeConfig::small_stacks(),
        );
        (rt, live)
    }

    #[test]
    fn test_single_thread_runs() {
        let rt = Runtime::with_config(RuntimeConfig::small_stacks());
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();

        rt.run(false, move |_| flag.set(true)).unwrap();

        assert!(ran.get());
        assert!(!rt.is_running());
        assert_eq!(rt.thread_count(), 0);
        assert_eq!(rt.current(), None);
    }

    #[test]
    fn test_round_robin_fairness() {
        let rt = Runtime::with_config(RuntimeConfig::small_stacks());
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();

        rt.run(false, move |rt| {
            for name in ["a", "b", "c"] {
                let sink = sink.clone();
                rt.spawn(move |rt| {
                    sink.borrow_mut().push((name, 0));
                    for round in 1..=3 {
                        rt.yield_now();
                        sink.borrow_mut().push((name, round));
                    }
                })
                .unwrap();
            }
        })
        .unwrap();

        // Every thread runs once plus once per yield, in spawn order.
        let expected: Vec<_> = (0..=3)
            .flat_map(|round| ["a", "b", "c"].into_iter().map(move |name| (name, round)))
            .collect();
        assert_eq!(*log.borrow(), expected);

        let stats = rt.metrics();
        assert_eq!(stats.spawned, 4);
        assert_eq!(stats.reaped, 4);
        assert_eq!(stats.voluntary_yields, 9);
        assert_eq!(stats.panicked, 0);
    }

    #[test]
    fn test_yield_with_nothing_ready_returns() {
        let rt = Runtime::with_config(RuntimeConfig::small_stacks());
        let rounds = Rc::new(Cell::new(0));
        let counter = rounds.clone();

        rt.run(false, move |rt| {
            for _ in 0..5 {
                rt.yield_now();
                counter.set(counter.get() + 1);
            }
        })
        .unwrap();

        assert_eq!(rounds.get(), 5);
        // Only entering the thread and leaving it for idle switch; the
        // yields found no other Ready thread.
        assert_eq!(rt.metrics().context_switches, 2);
    }

    #[test]
    fn test_exited_thread_reaped_by_next_pass() {
        let (rt, live) = counting_runtime();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let probe = seen.clone();
        let stacks = live.clone();

        rt.run(false, move |rt| {
            let child = rt.spawn(|_| {}).unwrap();
            rt.yield_now();
            probe.borrow_mut().push((rt.state(child), stacks.get()));
            rt.yield_now();
            probe.borrow_mut().push((rt.state(child), stacks.get()));
        })
        .unwrap();

        assert_eq!(
            *seen.borrow(),
            vec![(Some(ThreadState::Exited), 2), (None, 1)]
        );
        assert_eq!(live.get(), 0);
    }

    #[test]
    fn test_block_and_unblock() {
        let rt = Runtime::with_config(RuntimeConfig::small_stacks());
        let log = Rc::new(RefCell::new(Vec::new()));
        let states = Rc::new(RefCell::new(Vec::new()));
        let (sink, probe) = (log.clone(), states.clone());

        rt.run(false, move |rt| {
            let worker_sink = sink.clone();
            let worker = rt
                .spawn(move |rt| {
                    worker_sink.borrow_mut().push("worker blocks");
                    rt.block();
                    worker_sink.borrow_mut().push("worker resumed");
                })
                .unwrap();

            rt.yield_now();
            probe.borrow_mut().push(rt.state(worker));
            // A blocked thread is skipped, so this returns straight away.
            rt.yield_now();
            probe.borrow_mut().push(rt.state(worker));

            rt.unblock(worker);
            probe.borrow_mut().push(rt.state(worker));
            sink.borrow_mut().push("main unblocked worker");
            rt.yield_now();
        })
        .unwrap();

        assert_eq!(
            *log.borrow(),
            vec!["worker blocks", "main unblocked worker", "worker resumed"]
        );
        assert_eq!(
            *states.borrow(),
            vec![
                Some(ThreadState::Blocked),
                Some(ThreadState::Blocked),
                Some(ThreadState::Ready),
            ]
        );
    }

    #[test]
    fn test_unblock_ignores_non_blocked() {
        let rt = Runtime::with_config(RuntimeConfig::small_stacks());
        let states = Rc::new(RefCell::new(Vec::new()));
        let probe = states.clone();

        rt.run(false, move |rt| {
            let me = rt.current().unwrap();
            rt.unblock(me);
            probe.borrow_mut().push(rt.state(me));

            let child = rt.spawn(|_| {}).unwrap();
            rt.unblock(child);
            probe.borrow_mut().push(rt.state(child));

            rt.yield_now();
            rt.yield_now();
            // Reaped: the id is stale now.
            rt.unblock(child);
            probe.borrow_mut().push(rt.state(child));
        })
        .unwrap();

        assert_eq!(
            *states.borrow(),
            vec![Some(ThreadState::Running), Some(ThreadState::Ready), None]
        );
    }

    #[test]
    fn test_deadlock_is_reported_and_released() {
        let (rt, live) = counting_runtime();

        let result = rt.run(false, |rt| {
            rt.spawn(|rt| rt.block()).unwrap();
        });

        assert_eq!(result, Err(ExecError::Deadlock));
        assert_eq!(live.get(), 0);
        assert_eq!(rt.thread_count(), 0);
        assert!(!rt.is_running());
    }

    #[test]
    fn test_threads_spawned_before_run() {
        let rt = Runtime::with_config(RuntimeConfig::small_stacks());
        let order = Rc::new(RefCell::new(Vec::new()));
        let (early, initial) = (order.clone(), order.clone());

        rt.spawn(move |_| early.borrow_mut().push("early")).unwrap();
        assert_eq!(rt.ready_len(), 1);
        rt.run(false, move |_| initial.borrow_mut().push("initial"))
            .unwrap();

        assert_eq!(*order.borrow(), vec!["initial", "early"]);
    }

    #[test]
    fn test_current_and_flags() {
        let rt = Runtime::with_config(RuntimeConfig::small_stacks());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let probe = seen.clone();

        assert_eq!(rt.current(), None);
        rt.run(false, move |rt| {
            let me = rt.current().unwrap();
            let child_probe = probe.clone();
            let child = rt
                .spawn(move |rt| child_probe.borrow_mut().push(rt.current()))
                .unwrap();
            rt.yield_now();
            probe.borrow_mut().push(Some(child));
            probe.borrow_mut().push(Some(me));
            let flags = rt.flags(me).unwrap();
            assert!(flags.contains(ThreadFlags::INITIAL | ThreadFlags::STARTED));
        })
        .unwrap();

        let seen = seen.borrow();
        assert_eq!(seen[0], seen[1]);
        assert_ne!(seen[1], seen[2]);
        assert_eq!(rt.metrics().panicked, 0);
    }

    #[test]
    fn test_panicking_thread_exits() {
        let rt = Runtime::with_config(RuntimeConfig::small_stacks());
        let flags = Rc::new(Cell::new(ThreadFlags::empty()));
        let probe = flags.clone();

        rt.run(false, move |rt| {
            let child = rt.spawn(|_| panic!("worker failed")).unwrap();
            rt.yield_now();
            probe.set(rt.flags(child).unwrap_or_default());
        })
        .unwrap();

        assert!(flags.get().contains(ThreadFlags::PANICKED));
        assert_eq!(rt.metrics().panicked, 1);
        assert_eq!(rt.thread_count(), 0);
    }

    #[test]
    fn test_nested_run_rejected() {
        let rt = Runtime::with_config(RuntimeConfig::small_stacks());
        let outcome = Rc::new(Cell::new(None));
        let probe = outcome.clone();

        rt.run(false, move |rt| {
            probe.set(Some((rt.is_running(), rt.run(false, |_| {}))));
        })
        .unwrap();

        assert_eq!(outcome.get(), Some((true, Err(ExecError::SchedulerError))));
    }

    #[test]
    fn test_run_is_repeatable() {
        let rt = Runtime::with_config(RuntimeConfig::small_stacks());
        let count = Rc::new(Cell::new(0));

        for _ in 0..2 {
            let counter = count.clone();
            rt.run(false, move |rt| {
                counter.set(counter.get() + 1);
                let counter = counter.clone();
                rt.spawn(move |_| counter.set(counter.get() + 1)).unwrap();
            })
            .unwrap();
        }

        assert_eq!(count.get(), 4);
        assert_eq!(rt.metrics().spawned, 4);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let rt = Runtime::with_config(RuntimeConfig::new().with_stack_size(1024));
        assert_eq!(rt.run(false, |_| {}), Err(ExecError::InvalidArgument));
        assert!(!rt.is_running());
    }

    #[test]
    fn test_drop_releases_unrun_threads() {
        let (rt, live) = counting_runtime();
        rt.spawn(|_| {}).unwrap();
        rt.spawn(|_| {}).unwrap();
        assert_eq!(live.get(), 2);

        drop(rt);
        assert_eq!(live.get(), 0);
    }

    #[test]
    fn test_spawn_stack_failure_leaves_nothing_behind() {
        let (rt, live) = faulty_runtime();
        rt.backend().fault.set(Some(Fault::Stack));

        assert_eq!(rt.spawn(|_| {}), Err(ExecError::OutOfMemory));
        assert_eq!(live.get(), 0);
        assert_eq!(rt.thread_count(), 0);
        assert_eq!(rt.ready_len(), 0);
        assert_eq!(rt.metrics().spawned, 0);
    }

    #[test]
    fn test_spawn_initialize_failure_releases_stack() {
        let (rt, live) = faulty_runtime();
        rt.backend().fault.set(Some(Fault::Initialize));

        assert_eq!(rt.spawn(|_| {}), Err(ExecError::SchedulerError));
        assert_eq!(live.get(), 0);
        assert_eq!(rt.thread_count(), 0);
        assert_eq!(rt.ready_len(), 0);
        assert_eq!(rt.metrics().spawned, 0);
    }

    #[test]
    fn test_run_fails_cleanly_without_initial_thread() {
        let (rt, live) = faulty_runtime();
        rt.backend().fault.set(Some(Fault::Stack));

        assert_eq!(rt.run(false, |_| {}), Err(ExecError::SchedulerError));
        assert!(!rt.is_running());
        assert_eq!(rt.current(), None);
        assert_eq!(live.get(), 0);
        assert_eq!(rt.thread_count(), 0);
        assert_eq!(rt.ready_len(), 0);

        rt.backend().fault.set(Some(Fault::Initialize));
        assert_eq!(rt.run(false, |_| {}), Err(ExecError::SchedulerError));
        assert!(!rt.is_running());
        assert_eq!(live.get(), 0);

        // The runtime is still usable once the backend recovers.
        rt.backend().fault.set(None);
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        rt.run(false, move |_| flag.set(true)).unwrap();
        assert!(ran.get());
        assert_eq!(live.get(), 0);
        assert_eq!(rt.metrics().spawned, 1);
        assert_eq!(rt.metrics().reaped, 1);
    }

    #[test]
    fn test_discarded_thread_is_not_counted_as_reaped() {
        let (rt, live) = counting_runtime();
        let id = rt.spawn(|_| {}).unwrap();
        rt.inner.lock().ready.delete(&id).unwrap();
        assert_eq!(live.get(), 1);

        rt.discard(id);

        assert_eq!(live.get(), 0);
        assert_eq!(rt.thread_count(), 0);
        assert_eq!(rt.ready_len(), 0);
        assert_eq!(rt.state(id), None);
        assert_eq!(rt.metrics().reaped, 0);
    }

    #[test]
    fn test_tick_pass_leaves_exited_threads_for_voluntary_pass() {
        let (rt, live) = counting_runtime();
        let counts = Rc::new(RefCell::new(Vec::new()));
        let probe = counts.clone();

        rt.run(false, move |rt| {
            rt.spawn(|_| {}).unwrap();
            // The spawned thread runs and exits, leaving itself queued.
            rt.yield_now();
            let exited = rt.inner.lock().threads.len();

            rt.reschedule(SwitchReason::Preemption, None);
            let after_tick = rt.inner.lock().threads.len();

            rt.yield_now();
            let after_yield = rt.inner.lock().threads.len();
            probe.borrow_mut().extend([exited, after_tick, after_yield]);
        })
        .unwrap();

        assert_eq!(*counts.borrow(), vec![2, 2, 1]);
        assert_eq!(live.get(), 0);
        assert_eq!(rt.metrics().reaped, 2);
    }

    #[test]
    fn test_exit_outside_thread_panics() {
        let rt = Runtime::with_config(RuntimeConfig::small_stacks());
        let result = panic::catch_unwind(AssertUnwindSafe(|| rt.exit()));
        assert!(result.is_err());
    }
}
