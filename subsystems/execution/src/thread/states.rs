//! # Thread States
//!
//! Thread state machine definition.

/// Thread state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Thread is waiting in the ready queue
    Ready,
    /// Thread is executing; exactly one thread is Running while a runtime is
    /// inside a thread
    Running,
    /// Thread waits for an explicit unblock
    Blocked,
    /// Thread has finished and waits to be reaped
    Exited,
}

impl ThreadState {
    /// Check if thread can be scheduled
    pub fn is_runnable(&self) -> bool {
        matches!(self, ThreadState::Ready | ThreadState::Running)
    }

    /// Check if thread is blocked
    pub fn is_blocked(&self) -> bool {
        matches!(self, ThreadState::Blocked)
    }

    /// Check if thread is terminated
    pub fn is_terminated(&self) -> bool {
        matches!(self, ThreadState::Exited)
    }

    /// Valid transitions from this state
    pub fn valid_transitions(&self) -> &'static [ThreadState] {
        match self {
            ThreadState::Ready => &[ThreadState::Running],
            ThreadState::Running => &[
                ThreadState::Ready,
                ThreadState::Blocked,
                ThreadState::Exited,
            ],
            ThreadState::Blocked => &[ThreadState::Ready],
            ThreadState::Exited => &[],
        }
    }

    /// Check whether moving to `next` is a legal transition
    pub fn can_transition_to(&self, next: ThreadState) -> bool {
        self.valid_transitions().contains(&next)
    }
}
