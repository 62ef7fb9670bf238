//! # Context Switching
//!
//! Switch reasons and the single place the scheduler hands control to the
//! backend.

use uthread_hal::ContextBackend;

/// Context switch reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    /// `Runtime::run` entering its initial thread
    Start,
    /// Voluntary yield
    Yield,
    /// Timer preemption
    Preemption,
    /// Thread blocked
    Blocked,
    /// Thread exited
    Exit,
}

impl SwitchReason {
    /// Whether the outgoing thread asked to give up the processor
    pub fn is_voluntary(self) -> bool {
        !matches!(self, SwitchReason::Preemption)
    }
}

/// Save the running context into `from` and resume `to`.
///
/// Returns once something switches back into `from`. A failed switch
/// leaves the scheduler with no consistent thread to run, so it aborts the
/// process.
///
/// # Safety
///
/// Both pointers must refer to live contexts that stay put until `from` is
/// resumed, and `to` must have been captured or initialized by `backend`.
pub(crate) unsafe fn switch<B: ContextBackend>(
    backend: &B,
    from: *mut B::Context,
    to: *const B::Context,
    reason: SwitchReason,
) {
    // SAFETY: forwarded from the caller.
    if let Err(err) = unsafe { backend.switch(from, to) } {
        log::error!("context switch failed ({:?}): {}", reason, err);
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voluntary() {
        assert!(SwitchReason::Yield.is_voluntary());
        assert!(SwitchReason::Exit.is_voluntary());
        assert!(!SwitchReason::Preemption.is_voluntary());
    }
}
