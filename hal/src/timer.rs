//! # Interval Timer
//!
//! Periodic tick source backed by `setitimer(ITIMER_VIRTUAL)`. The virtual
//! timer only advances while the process consumes CPU, so a blocked process
//! receives no ticks.

use crate::{HalError, HalResult};
use core::ptr;

/// Microseconds per second
const USEC_PER_SEC: u64 = 1_000_000;

/// Process virtual-time interval timer
#[derive(Debug)]
pub struct IntervalTimer;

impl IntervalTimer {
    /// Arm the timer to fire `hz` times per second of CPU time
    pub fn arm(hz: u32) -> HalResult<()> {
        if hz == 0 {
            return Err(HalError::InvalidParameter);
        }
        let period = period_for(hz);
        Self::set(libc::itimerval {
            it_interval: period,
            it_value: period,
        })?;
        log::debug!(
            "interval timer armed: {} Hz ({}s {}us period)",
            hz,
            period.tv_sec,
            period.tv_usec
        );
        Ok(())
    }

    /// Stop the timer
    pub fn disarm() -> HalResult<()> {
        let zero = libc::timeval { tv_sec: 0, tv_usec: 0 };
        Self::set(libc::itimerval {
            it_interval: zero,
            it_value: zero,
        })
    }

    fn set(value: libc::itimerval) -> HalResult<()> {
        // SAFETY: `value` is a fully initialized itimerval; the previous
        // value is not requested.
        let rc = unsafe { libc::setitimer(libc::ITIMER_VIRTUAL, &value, ptr::null_mut()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(HalError::TimerSetupFailed)
        }
    }
}

/// Timer period for a tick frequency.
///
/// Never returns a zero period: that would disarm the timer instead.
pub fn period_for(hz: u32) -> libc::timeval {
    let usec = (USEC_PER_SEC / u64::from(hz.max(1))).max(1);
    libc::timeval {
        tv_sec: (usec / USEC_PER_SEC) as libc::time_t,
        tv_usec: (usec % USEC_PER_SEC) as libc::suseconds_t,
    }
}
