//! # Active Runtime
//!
//! Which runtime, if any, the calling OS thread is driving. Fresh thread
//! contexts and the tick handler start without arguments and look their
//! runtime up here.

use super::Runtime;
use crate::{ExecError, ExecResult};
use core::cell::Cell;
use core::marker::PhantomData;
use uthread_hal::ContextBackend;

#[derive(Clone, Copy)]
struct Active {
    runtime: *const (),
    tick: unsafe fn(*const ()),
}

thread_local! {
    // Const-initialized and without a destructor, so reading it from the
    // signal handler never allocates or registers anything.
    static ACTIVE: Cell<Option<Active>> = const { Cell::new(None) };
}

/// Registration of a runtime as the one driving this OS thread
///
/// Cleared on drop.
pub(crate) struct ActiveGuard {
    _not_send: PhantomData<*const ()>,
}

impl ActiveGuard {
    /// Register `runtime`; fails if this OS thread already drives one
    pub(crate) fn enter<B: ContextBackend + 'static>(runtime: &Runtime<B>) -> ExecResult<Self> {
        ACTIVE.with(|active| {
            if active.get().is_some() {
                return Err(ExecError::SchedulerError);
            }
            active.set(Some(Active {
                runtime: (runtime as *const Runtime<B>).cast(),
                tick: deliver_tick::<B>,
            }));
            Ok(Self {
                _not_send: PhantomData,
            })
        })
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.with(|active| active.set(None));
    }
}

/// The runtime this OS thread is driving.
///
/// # Safety
///
/// The active runtime must have backend `B`, and the returned reference
/// must not outlive its `run` call.
pub(crate) unsafe fn current<'a, B: ContextBackend + 'static>() -> Option<&'a Runtime<B>> {
    let active = ACTIVE.with(Cell::get)?;
    // SAFETY: forwarded from the caller; `run` keeps the runtime borrowed
    // for as long as it is registered.
    Some(unsafe { &*active.runtime.cast::<Runtime<B>>() })
}

/// # Safety
///
/// `runtime` must be the pointer registered together with this function.
unsafe fn deliver_tick<B: ContextBackend + 'static>(runtime: *const ()) {
    // SAFETY: `ActiveGuard::enter` pairs each pointer with the
    // instantiation for its own backend.
    let runtime = unsafe { &*runtime.cast::<Runtime<B>>() };
    runtime.handle_tick();
}

/// Tick signal handler
///
/// Ticks that land on an OS thread without an active runtime are dropped.
pub(crate) extern "C" fn on_tick(_signal: libc::c_int) {
    // SAFETY: errno is thread-local; the handler may clobber it through the
    // mask syscalls of the switch path.
    let errno = unsafe { *libc::__errno_location() };

    if let Ok(Some(active)) = ACTIVE.try_with(Cell::get) {
        // SAFETY: the pair was registered by `ActiveGuard::enter`.
        unsafe { (active.tick)(active.runtime) };
    }

    // SAFETY: as above.
    unsafe { *libc::__errno_location() = errno };
}
