//! # Thread Structure
//!
//! The thread control block.

use super::ThreadState;
use crate::scheduler::ThreadEntry;
use crate::ThreadId;
use uthread_hal::{ContextBackend, Stack};

/// Thread flags
pub mod flags {
    use bitflags::bitflags;

    bitflags! {
        /// Thread flags
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct ThreadFlags: u32 {
            /// Thread was created by `Runtime::run`
            const INITIAL = 1 << 0;
            /// Thread has been switched to at least once
            const STARTED = 1 << 1;
            /// Thread's entry function panicked
            const PANICKED = 1 << 2;
        }
    }
}

pub use flags::ThreadFlags;

/// Thread control block
///
/// Owned by the runtime's thread table. The context is boxed and never
/// moves while the thread is alive: the backend keeps pointers into it.
pub(crate) struct Thread<B: ContextBackend + 'static> {
    id: ThreadId,
    state: ThreadState,
    flags: ThreadFlags,
    stack: Option<Stack>,
    context: Box<B::Context>,
    entry: Option<ThreadEntry<B>>,
}

impl<B: ContextBackend + 'static> Thread<B> {
    /// Create a Ready thread around an initialized context
    pub(crate) fn new(
        id: ThreadId,
        stack: Stack,
        context: Box<B::Context>,
        entry: ThreadEntry<B>,
    ) -> Self {
        Self {
            id,
            state: ThreadState::Ready,
            flags: ThreadFlags::empty(),
            stack: Some(stack),
            context,
            entry: Some(entry),
        }
    }

    /// Get thread ID
    pub(crate) fn id(&self) -> ThreadId {
        self.id
    }

    /// Get current state
    pub(crate) fn state(&self) -> ThreadState {
        self.state
    }

    /// Set thread state
    pub(crate) fn set_state(&mut self, state: ThreadState) {
        debug_assert!(
            self.state == state || self.state.can_transition_to(state),
            "illegal transition {:?} -> {:?} for {}",
            self.state,
            state,
            self.id
        );
        self.state = state;
    }

    /// Get flags
    pub(crate) fn flags(&self) -> ThreadFlags {
        self.flags
    }

    /// Add flags
    pub(crate) fn add_flags(&mut self, flags: ThreadFlags) {
        self.flags |= flags;
    }

    /// Raw pointer to the saved context, for the backend's switch
    pub(crate) fn context_ptr(&mut self) -> *mut B::Context {
        &mut *self.context
    }

    /// Take the entry function; `None` once the thread has started
    pub(crate) fn take_entry(&mut self) -> Option<ThreadEntry<B>> {
        self.entry.take()
    }

    /// Take the stack out for release through the backend
    pub(crate) fn take_stack(&mut self) -> Option<Stack> {
        self.stack.take()
    }
}

impl<B: ContextBackend + 'static> core::fmt::Debug for Thread<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("stack", &self.stack.as_ref().map(Stack::size))
            .finish_non_exhaustive()
    }
}
