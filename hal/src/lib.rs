//! # uthread HAL - Host Abstraction Layer
//!
//! This crate defines the low-level collaborators the scheduler relies on
//! but does not implement itself:
//!
//! - **Execution contexts**: stack allocation, context initialization and
//!   the switch between two saved register states ([`context`])
//! - **Tick signal**: masking, handler installation and restoration
//!   ([`interrupts`])
//! - **Interval timer**: the periodic source of preemption ticks ([`timer`])
//!
//! ## Design Philosophy
//!
//! The HAL is designed to be:
//! - **Minimal**: Only exposes what the scheduler needs
//! - **Safe**: Encapsulates the libc calls behind typed wrappers
//! - **Replaceable**: The scheduler is generic over [`ContextBackend`], so
//!   tests and other targets can provide their own backend

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod arch;
pub mod context;
pub mod interrupts;
pub mod timer;

pub use arch::current::{UcontextBackend, Ucontext};
pub use context::{ContextBackend, Stack};

/// Result type for HAL operations
pub type HalResult<T> = Result<T, HalError>;

/// Errors that can occur in HAL operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// Invalid parameter provided
    InvalidParameter,
    /// Memory allocation failed
    OutOfMemory,
    /// Installing or restoring a signal disposition failed
    SignalSetupFailed,
    /// Changing the signal mask failed
    SignalMaskFailed,
    /// Arming or disarming the interval timer failed
    TimerSetupFailed,
    /// Capturing or preparing an execution context failed
    ContextInitFailed,
    /// Switching between execution contexts failed
    ContextSwitchFailed,
}

impl core::fmt::Display for HalError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            HalError::InvalidParameter => "invalid parameter",
            HalError::OutOfMemory => "out of memory",
            HalError::SignalSetupFailed => "failed to change signal disposition",
            HalError::SignalMaskFailed => "failed to change signal mask",
            HalError::TimerSetupFailed => "failed to configure interval timer",
            HalError::ContextInitFailed => "failed to initialize execution context",
            HalError::ContextSwitchFailed => "failed to switch execution context",
        };
        f.write_str(msg)
    }
}
