//! # Runtime Configuration

use crate::{ExecError, ExecResult};
use uthread_hal::{Stack, UcontextBackend};

/// Configuration for a [`Runtime`](super::Runtime)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Stack size for every spawned thread (bytes)
    pub stack_size: usize,
    /// Preemption tick frequency (Hz of consumed CPU time)
    pub tick_hz: u32,
}

impl RuntimeConfig {
    /// Default stack size: 256 KiB
    pub const DEFAULT_STACK_SIZE: usize = UcontextBackend::DEFAULT_STACK_SIZE;
    /// Minimum stack size
    pub const MIN_STACK_SIZE: usize = Stack::MIN_SIZE;
    /// Default tick frequency: 100 Hz
    pub const DEFAULT_TICK_HZ: u32 = 100;
    /// Maximum tick frequency: 10 kHz
    pub const MAX_TICK_HZ: u32 = 10_000;

    /// Create default configuration
    pub const fn new() -> Self {
        Self {
            stack_size: Self::DEFAULT_STACK_SIZE,
            tick_hz: Self::DEFAULT_TICK_HZ,
        }
    }

    /// Many threads with shallow call chains
    pub const fn small_stacks() -> Self {
        Self {
            stack_size: 64 * 1024,
            ..Self::new()
        }
    }

    /// Shorter time slices (1 ms)
    pub const fn fine_grained() -> Self {
        Self {
            tick_hz: 1_000,
            ..Self::new()
        }
    }

    /// Override the stack size
    pub const fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Override the tick frequency
    pub const fn with_tick_hz(mut self, tick_hz: u32) -> Self {
        self.tick_hz = tick_hz;
        self
    }

    /// Reject values the runtime cannot honor
    pub fn validate(&self) -> ExecResult<()> {
        if self.stack_size < Self::MIN_STACK_SIZE {
            return Err(ExecError::InvalidArgument);
        }
        if self.tick_hz == 0 || self.tick_hz > Self::MAX_TICK_HZ {
            return Err(ExecError::InvalidArgument);
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}
