//! # ucontext Backend
//!
//! Context switching through glibc's `getcontext` / `makecontext` /
//! `swapcontext`.
//!
//! `swapcontext` saves and restores the signal mask together with the
//! registers. The scheduler relies on this: a thread that switched away
//! with the tick signal blocked comes back with it still blocked, and
//! unblocks it itself once it is past the switch point.

use crate::context::{ContextBackend, ContextEntry, Stack};
use crate::interrupts::TICK_SIGNAL;
use crate::{HalError, HalResult};
use alloc::boxed::Box;
use core::ptr;
use static_assertions::{assert_not_impl_any, const_assert};

// A context must also be able to take a signal frame.
const_assert!(Stack::MIN_SIZE >= libc::MINSIGSTKSZ);

/// Saved execution state
///
/// Holds a `ucontext_t`, which contains a pointer into itself once
/// captured. It must not move after `getcontext`; the backend only hands
/// it out boxed.
#[repr(transparent)]
pub struct Ucontext {
    inner: libc::ucontext_t,
}

assert_not_impl_any!(Ucontext: Send, Sync);

impl core::fmt::Debug for Ucontext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ucontext")
            .field("stack", &self.inner.uc_stack.ss_sp)
            .field("stack_size", &self.inner.uc_stack.ss_size)
            .finish()
    }
}

/// Context backend built on `swapcontext`
#[derive(Debug, Clone)]
pub struct UcontextBackend {
    stack_size: usize,
}

impl UcontextBackend {
    /// Default stack size (256 KiB)
    pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

    /// Create a backend allocating stacks of `stack_size` bytes
    pub fn new(stack_size: usize) -> Self {
        Self { stack_size }
    }

    /// Stack size used for new threads
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }
}

impl Default for UcontextBackend {
    fn default() -> Self {
        Self::new(Self::DEFAULT_STACK_SIZE)
    }
}

impl ContextBackend for UcontextBackend {
    type Context = Ucontext;

    fn new_context(&self) -> Box<Ucontext> {
        // SAFETY: ucontext_t is plain data; all-zero is a valid value.
        Box::new(Ucontext {
            inner: unsafe { core::mem::zeroed() },
        })
    }

    fn allocate_stack(&self) -> HalResult<Stack> {
        Stack::allocate(self.stack_size)
    }

    fn initialize(
        &self,
        context: &mut Ucontext,
        stack: &mut Stack,
        entry: ContextEntry,
    ) -> HalResult<()> {
        let ucp = &mut context.inner;

        // SAFETY: `ucp` is a valid, exclusively borrowed ucontext_t and the
        // stack outlives every switch into this context (the scheduler
        // destroys the stack only after the thread has been switched away
        // from for the last time).
        unsafe {
            if libc::getcontext(ucp) != 0 {
                return Err(HalError::ContextInitFailed);
            }

            ucp.uc_stack.ss_sp = stack.base().cast();
            ucp.uc_stack.ss_size = stack.size();
            ucp.uc_stack.ss_flags = 0;
            ucp.uc_link = ptr::null_mut();
            libc::sigaddset(&mut ucp.uc_sigmask, TICK_SIGNAL);

            libc::makecontext(ucp, entry, 0);
        }

        Ok(())
    }

    unsafe fn switch(&self, from: *mut Ucontext, to: *const Ucontext) -> HalResult<()> {
        // SAFETY: the caller guarantees both contexts are live; `Ucontext`
        // is repr(transparent) over ucontext_t.
        let rc = unsafe { libc::swapcontext(from.cast::<libc::ucontext_t>(), to.cast::<libc::ucontext_t>()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(HalError::ContextSwitchFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    thread_local! {
        static ORIGIN: Cell<*mut Ucontext> = const { Cell::new(ptr::null_mut()) };
        static WORKER: Cell<*mut Ucontext> = const { Cell::new(ptr::null_mut()) };
        static BOUNCES: Cell<u32> = const { Cell::new(0) };
    }

    extern "C" fn bounce() {
        let backend = UcontextBackend::default();
        loop {
            BOUNCES.with(|b| b.set(b.get() + 1));
            let origin = ORIGIN.with(Cell::get);
            let worker = WORKER.with(Cell::get);
            unsafe { backend.switch(worker, origin).unwrap() };
        }
    }

    #[test]
    fn test_switch_round_trip() {
        let backend = UcontextBackend::new(Stack::MIN_SIZE * 4);
        let mut origin = backend.new_context();
        let mut worker = backend.new_context();
        let mut stack = backend.allocate_stack().unwrap();
        assert_eq!(stack.size(), Stack::MIN_SIZE * 4);

        backend.initialize(&mut worker, &mut stack, bounce).unwrap();

        let origin_ptr: *mut Ucontext = &mut *origin;
        let worker_ptr: *mut Ucontext = &mut *worker;
        ORIGIN.with(|c| c.set(origin_ptr));
        WORKER.with(|c| c.set(worker_ptr));

        unsafe { backend.switch(origin_ptr, worker_ptr).unwrap() };
        assert_eq!(BOUNCES.with(Cell::get), 1);

        unsafe { backend.switch(origin_ptr, worker_ptr).unwrap() };
        assert_eq!(BOUNCES.with(Cell::get), 2);

        // The worker is parked inside `bounce` and is never resumed again.
        backend.destroy_stack(stack);
    }

    #[test]
    fn test_fresh_context_masks_tick_signal() {
        let backend = UcontextBackend::default();
        let mut ctx = backend.new_context();
        let mut stack = backend.allocate_stack().unwrap();
        backend.initialize(&mut ctx, &mut stack, bounce).unwrap();

        let member = unsafe { libc::sigismember(&ctx.inner.uc_sigmask, TICK_SIGNAL) };
        assert_eq!(member, 1);
        assert_eq!(ctx.inner.uc_stack.ss_size, UcontextBackend::DEFAULT_STACK_SIZE);
    }
}
