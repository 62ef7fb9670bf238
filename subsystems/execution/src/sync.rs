//! # Semaphores
//!
//! Counting semaphore for runtime threads. Waiters queue in FIFO order and
//! each `up` hands its unit to the oldest waiter directly, so a thread that
//! arrives later cannot overtake one already waiting.
//!
//! Waiters are thread ids, which only mean something to the runtime that
//! issued them. While threads wait, the semaphore only accepts operations
//! from that runtime.

use crate::preempt::PreemptGuard;
use crate::scheduler::queue::Queue;
use crate::scheduler::Runtime;
use crate::{ExecError, ExecResult, ThreadId};
use core::marker::PhantomData;
use static_assertions::assert_not_impl_any;
use uthread_hal::ContextBackend;

#[derive(Debug)]
struct SemaphoreState {
    count: usize,
    waiters: Queue<ThreadId>,
    /// Runtime the waiters belong to; set while any thread waits
    owner: Option<u64>,
}

impl SemaphoreState {
    fn accepts(&self, instance: u64) -> bool {
        self.owner.is_none() || self.owner == Some(instance)
    }
}

/// Counting semaphore
///
/// Shared between threads of one runtime, typically through an `Rc`.
/// Every operation runs with preemption held off.
#[derive(Debug)]
pub struct Semaphore {
    state: spin::Mutex<SemaphoreState>,
    // Runtimes are bound to one OS thread, and so are their waiters.
    _not_send: PhantomData<*const ()>,
}

assert_not_impl_any!(Semaphore: Send, Sync);

impl Semaphore {
    /// Waiter slots reserved up front
    const INITIAL_WAITERS: usize = 4;

    /// Create a semaphore holding `count` units
    pub fn new(count: usize) -> ExecResult<Self> {
        let waiters = Queue::with_capacity(Self::INITIAL_WAITERS)?;
        Ok(Self {
            state: spin::Mutex::new(SemaphoreState {
                count,
                waiters,
                owner: None,
            }),
            _not_send: PhantomData,
        })
    }

    /// Release the semaphore.
    ///
    /// Fails with [`ExecError::NotEmpty`] while threads wait on it, handing
    /// the semaphore back unchanged.
    pub fn destroy(self) -> Result<(), (Self, ExecError)> {
        let waiting = self.waiters();
        if waiting != 0 {
            return Err((self, ExecError::NotEmpty));
        }
        Ok(())
    }

    /// Take one unit, blocking the calling thread while none is available.
    ///
    /// # Errors
    ///
    /// - [`ExecError::InvalidArgument`] if called outside a runtime thread,
    ///   or while threads of another runtime wait on the semaphore
    /// - [`ExecError::OutOfMemory`] if the waiter queue cannot grow
    pub fn down<B: ContextBackend + 'static>(&self, rt: &Runtime<B>) -> ExecResult<()> {
        let preempt = rt.preemption();
        preempt.disable();

        let Some(me) = rt.current_unguarded() else {
            preempt.enable();
            return Err(ExecError::InvalidArgument);
        };

        let mut state = self.state.lock();
        if state.count > 0 {
            state.count -= 1;
            drop(state);
            preempt.enable();
            return Ok(());
        }

        if !state.accepts(rt.instance()) {
            drop(state);
            preempt.enable();
            return Err(ExecError::InvalidArgument);
        }
        if let Err(err) = state.waiters.enqueue(me) {
            drop(state);
            preempt.enable();
            return Err(err);
        }
        state.owner = Some(rt.instance());
        drop(state);

        log::trace!("thread {} waits on semaphore", me);
        // Preemption comes back on when this thread is switched back in.
        rt.block();
        Ok(())
    }

    /// Return one unit, waking the oldest waiter if there is one.
    ///
    /// The woken thread gets the unit directly and resumes when the
    /// scheduler reaches it; `up` itself never switches.
    ///
    /// # Errors
    ///
    /// - [`ExecError::InvalidArgument`] if threads of another runtime wait
    ///   on the semaphore; the count is left unchanged
    pub fn up<B: ContextBackend + 'static>(&self, rt: &Runtime<B>) -> ExecResult<()> {
        let _gate = rt.preemption().guard();
        let mut state = self.state.lock();
        if !state.accepts(rt.instance()) {
            return Err(ExecError::InvalidArgument);
        }
        state.count += 1;

        if let Ok(waiter) = state.waiters.dequeue() {
            if state.waiters.is_empty() {
                state.owner = None;
            }
            if state.count > 0 {
                state.count -= 1;
                if !rt.wake(waiter) {
                    log::warn!("semaphore waiter {} was not blocked", waiter);
                    state.count += 1;
                }
            }
        }
        Ok(())
    }

    /// Units currently available
    pub fn count(&self) -> usize {
        let _gate = PreemptGuard::new();
        self.state.lock().count
    }

    /// Number of threads waiting
    pub fn waiters(&self) -> usize {
        let _gate = PreemptGuard::new();
        self.state.lock().waiters.len()
    }
}
