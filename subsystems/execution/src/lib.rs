//! # uthread Execution Subsystem
//!
//! A user-level (N:1) thread runtime. Many logical threads are multiplexed
//! onto the single OS thread that calls [`Runtime::run`]:
//! - Thread creation, voluntary yielding, exit
//! - Blocking and unblocking
//! - Optional timer-driven preemption
//! - Counting semaphores
//!
//! ## Key Principle
//!
//! All scheduler state lives in one [`Runtime`] object that is passed by
//! reference to every thread. Critical sections run with the tick signal
//! masked, so the spin locks guarding that state are never contended.
//!
//! ```
//! use std::rc::Rc;
//! use uthread_execution::{Runtime, Semaphore};
//!
//! let rt = Runtime::new();
//! let sem = Rc::new(Semaphore::new(0).unwrap());
//! let shared = sem.clone();
//!
//! rt.run(false, move |rt| {
//!     let waiter = shared.clone();
//!     rt.spawn(move |rt| waiter.down(rt).unwrap()).unwrap();
//!     rt.yield_now();
//!     shared.up(rt).unwrap();
//! })
//! .unwrap();
//!
//! assert_eq!(sem.count(), 0);
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod context;
pub mod preempt;
pub mod scheduler;
pub mod sync;
pub mod thread;

pub use scheduler::{Runtime, RuntimeConfig, SchedulerStats, ThreadEntry};
pub use scheduler::queue::Queue;
pub use sync::Semaphore;
pub use thread::{ThreadFlags, ThreadState};

use static_assertions::assert_impl_all;
use uthread_hal::HalError;

/// Unique identifier for threads
///
/// An arena slot plus the generation of that slot. Once a thread is reaped
/// its slot may be reused, but the old identifier never matches the new
/// occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId {
    index: u32,
    generation: u32,
}

assert_impl_all!(ThreadId: Copy, Send, Sync);

impl ThreadId {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Arena slot of this thread
    pub fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot when this thread was created
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "T{}.{}", self.index, self.generation)
    }
}

/// Execution result type
pub type ExecResult<T> = Result<T, ExecError>;

/// Execution errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    /// A required reference is absent
    InvalidArgument,
    /// Container is empty
    Empty,
    /// Container still holds items
    NotEmpty,
    /// Item to delete is not present
    NotFound,
    /// Allocation failed
    OutOfMemory,
    /// Internal setup failure in run or spawn
    SchedulerError,
    /// The run ended with threads still blocked and nobody left to wake them
    Deadlock,
}

impl core::fmt::Display for ExecError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            ExecError::InvalidArgument => "invalid argument",
            ExecError::Empty => "empty",
            ExecError::NotEmpty => "not empty",
            ExecError::NotFound => "not found",
            ExecError::OutOfMemory => "out of memory",
            ExecError::SchedulerError => "scheduler error",
            ExecError::Deadlock => "threads left blocked at shutdown",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for ExecError {}

impl From<HalError> for ExecError {
    fn from(err: HalError) -> Self {
        match err {
            HalError::OutOfMemory => ExecError::OutOfMemory,
            HalError::InvalidParameter => ExecError::InvalidArgument,
            _ => ExecError::SchedulerError,
        }
    }
}
