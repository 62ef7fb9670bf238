//! # Preemption Controller
//!
//! Timer-driven preemption and the gate that holds it off.
//!
//! When armed, a virtual interval timer raises the tick signal, and the
//! installed handler forces the running thread to yield. Runtime state is
//! only touched with the tick signal masked:
//!
//! - [`disable`](PreemptionController::disable) and
//!   [`enable`](PreemptionController::enable) are raw mask operations. The
//!   scheduler disables before a switch and the thread that is switched
//!   into enables afterwards, so one bracket spans two stacks.
//! - [`PreemptGuard`] is for short sections that never switch. It restores
//!   whatever state it found, so guards nest inside a disabled bracket.
//!
//! When the controller is not armed every operation is a no-op.

use crate::{ExecError, ExecResult};
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, Ordering};
use uthread_hal::interrupts::{SignalAction, SignalMask, TickHandler, TICK_SIGNAL};
use uthread_hal::timer::IntervalTimer;

/// Set while some runtime in the process has the tick signal installed.
/// The handler and the timer are process-wide resources.
static TICK_OWNER: AtomicBool = AtomicBool::new(false);

/// Preemption controller
#[derive(Debug)]
pub struct PreemptionController {
    armed: AtomicBool,
    /// Tick signal was already blocked when `start` ran
    was_blocked: AtomicBool,
    action: spin::Mutex<Option<SignalAction>>,
}

impl PreemptionController {
    /// Create an unarmed controller
    pub const fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            was_blocked: AtomicBool::new(false),
            action: spin::Mutex::new(None),
        }
    }

    /// Check whether ticks are being delivered
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Arm preemption at `hz` ticks per second of CPU time.
    ///
    /// With `enabled == false` nothing is installed and the gate stays a
    /// no-op. On success the tick signal is left blocked: the caller
    /// enables once it is running on a thread stack.
    pub fn start(&self, enabled: bool, hz: u32, handler: TickHandler) -> ExecResult<()> {
        if !enabled {
            log::debug!("preemption disabled for this run");
            return Ok(());
        }
        if self.is_armed() {
            return Err(ExecError::SchedulerError);
        }
        if TICK_OWNER
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::warn!("preemption already armed by another runtime in this process");
            return Err(ExecError::SchedulerError);
        }

        let was_blocked = match SignalMask::block_saving(TICK_SIGNAL) {
            Ok(was_blocked) => was_blocked,
            Err(err) => {
                TICK_OWNER.store(false, Ordering::Release);
                return Err(err.into());
            }
        };

        let action = match SignalAction::install(TICK_SIGNAL, handler) {
            Ok(action) => action,
            Err(err) => {
                Self::release_mask(was_blocked);
                TICK_OWNER.store(false, Ordering::Release);
                return Err(err.into());
            }
        };

        if let Err(err) = IntervalTimer::arm(hz) {
            if let Err(restore_err) = action.restore() {
                log::error!("failed to restore tick handler: {}", restore_err);
            }
            Self::release_mask(was_blocked);
            TICK_OWNER.store(false, Ordering::Release);
            return Err(err.into());
        }

        *self.action.lock() = Some(action);
        self.was_blocked.store(was_blocked, Ordering::Relaxed);
        self.armed.store(true, Ordering::Release);
        log::info!("preemption armed at {} Hz", hz);
        Ok(())
    }

    /// Disarm the timer, put the previous handler back, and unblock the
    /// tick signal if `start` found it unblocked.
    ///
    /// A tick still pending at this point is discarded.
    pub fn stop(&self) {
        if !self.armed.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Err(err) = IntervalTimer::disarm() {
            log::error!("failed to disarm tick timer: {}", err);
        }
        if let Some(action) = self.action.lock().take() {
            if let Err(err) = action.restore() {
                log::error!("failed to restore tick handler: {}", err);
            }
        }
        Self::release_mask(self.was_blocked.load(Ordering::Relaxed));
        TICK_OWNER.store(false, Ordering::Release);
        log::info!("preemption stopped");
    }

    /// Block the tick signal on the calling thread
    pub fn disable(&self) {
        if self.is_armed() {
            let result = SignalMask::block(TICK_SIGNAL);
            debug_assert!(result.is_ok(), "failed to block tick signal");
        }
    }

    /// Unblock the tick signal on the calling thread
    pub fn enable(&self) {
        if self.is_armed() {
            let result = SignalMask::unblock(TICK_SIGNAL);
            debug_assert!(result.is_ok(), "failed to unblock tick signal");
        }
    }

    /// Hold preemption off until the guard is dropped
    pub fn guard(&self) -> PreemptGuard {
        if self.is_armed() {
            PreemptGuard::new()
        } else {
            PreemptGuard {
                unblock_on_drop: false,
                _not_send: PhantomData,
            }
        }
    }

    fn release_mask(was_blocked: bool) {
        if !was_blocked {
            if let Err(err) = SignalMask::unblock(TICK_SIGNAL) {
                log::error!("failed to unblock tick signal: {}", err);
            }
        }
    }
}

impl Default for PreemptionController {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped preemption gate
///
/// Blocks the tick signal on creation and, on drop, unblocks it only if it
/// was unblocked before. Must not be held across a context switch.
#[derive(Debug)]
pub struct PreemptGuard {
    unblock_on_drop: bool,
    // The signal mask belongs to the OS thread that created the guard.
    _not_send: PhantomData<*const ()>,
}

impl PreemptGuard {
    /// Block the tick signal on the calling thread
    pub fn new() -> Self {
        let was_blocked = SignalMask::block_saving(TICK_SIGNAL).unwrap_or(true);
        Self {
            unblock_on_drop: !was_blocked,
            _not_send: PhantomData,
        }
    }
}

impl Default for PreemptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        if self.unblock_on_drop {
            let result = SignalMask::unblock(TICK_SIGNAL);
            debug_assert!(result.is_ok(), "failed to unblock tick signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unarmed_gate_is_noop() {
        let controller = PreemptionController::new();
        controller.disable();
        assert!(!SignalMask::is_blocked(TICK_SIGNAL));
        controller.enable();
        let _guard = controller.guard();
        assert!(!SignalMask::is_blocked(TICK_SIGNAL));
    }

    #[test]
    fn test_start_without_preemption() {
        extern "C" fn never(_: libc::c_int) {}

        let controller = PreemptionController::new();
        controller.start(false, 100, never).unwrap();
        assert!(!controller.is_armed());
        controller.stop();
    }

    #[test]
    fn test_guards_nest() {
        SignalMask::unblock(TICK_SIGNAL).unwrap();
        {
            let _outer = PreemptGuard::new();
            {
                let _inner = PreemptGuard::new();
                assert!(SignalMask::is_blocked(TICK_SIGNAL));
            }
            assert!(SignalMask::is_blocked(TICK_SIGNAL));
        }
        assert!(!SignalMask::is_blocked(TICK_SIGNAL));
    }
}
