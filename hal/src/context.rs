//! # Execution Contexts
//!
//! The contract between the scheduler and whatever saves registers and
//! switches stacks.

use crate::{HalError, HalResult};
use alloc::boxed::Box;
use alloc::vec::Vec;

/// Entry point a fresh context starts executing.
///
/// Takes no arguments: the scheduler finds the thread's work through the
/// runtime it is currently driving.
pub type ContextEntry = extern "C" fn();

/// Execution-context backend
///
/// A backend owns the mechanics of saving and restoring CPU state. The
/// scheduler only ever handles contexts through `Box` so their addresses
/// stay fixed once captured.
pub trait ContextBackend {
    /// Saved register / stack-pointer state
    type Context;

    /// Allocate a context placeholder.
    ///
    /// The placeholder becomes meaningful either after [`initialize`] or
    /// after being the `from` side of a [`switch`].
    ///
    /// [`initialize`]: ContextBackend::initialize
    /// [`switch`]: ContextBackend::switch
    fn new_context(&self) -> Box<Self::Context>;

    /// Allocate a stack for a new thread
    fn allocate_stack(&self) -> HalResult<Stack>;

    /// Prepare `context` so that switching into it runs `entry` on `stack`.
    ///
    /// A freshly initialized context starts with the tick signal masked.
    fn initialize(
        &self,
        context: &mut Self::Context,
        stack: &mut Stack,
        entry: ContextEntry,
    ) -> HalResult<()>;

    /// Save the caller's state into `from` and resume `to`.
    ///
    /// Returns only when some later switch targets `from` again.
    ///
    /// # Safety
    /// Both pointers must reference live contexts. `to` must have been
    /// initialized or previously saved, and its stack must still be alive.
    unsafe fn switch(&self, from: *mut Self::Context, to: *const Self::Context) -> HalResult<()>;

    /// Release a stack.
    ///
    /// Must only be called once no context will ever run on it again.
    fn destroy_stack(&self, stack: Stack) {
        drop(stack);
    }
}

/// A thread stack
///
/// Owned heap memory. Dropping it releases the memory.
#[derive(Debug)]
pub struct Stack {
    mem: Vec<u8>,
}

impl Stack {
    /// Smallest stack the HAL will hand out (16 KiB)
    pub const MIN_SIZE: usize = 16 * 1024;

    /// Allocate a zeroed stack of `size` bytes.
    ///
    /// Reservation is fallible so exhaustion is reported instead of
    /// aborting the process.
    pub fn allocate(size: usize) -> HalResult<Self> {
        if size < Self::MIN_SIZE {
            return Err(HalError::InvalidParameter);
        }

        let mut mem = Vec::new();
        mem.try_reserve_exact(size)
            .map_err(|_| HalError::OutOfMemory)?;
        mem.resize(size, 0);

        Ok(Self { mem })
    }

    /// Lowest address of the stack
    pub fn base(&mut self) -> *mut u8 {
        self.mem.as_mut_ptr()
    }

    /// Stack size in bytes
    pub fn size(&self) -> usize {
        self.mem.len()
    }
}
