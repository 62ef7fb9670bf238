//! # Tick Signal
//!
//! The preemption tick is delivered as `SIGVTALRM`. This module wraps the
//! pieces of POSIX signal handling the scheduler needs: masking the signal
//! on the calling thread, and installing / restoring its handler.

use crate::{HalError, HalResult};
use core::mem::MaybeUninit;
use core::ptr;

/// Signal used for preemption ticks
pub const TICK_SIGNAL: libc::c_int = libc::SIGVTALRM;

/// Tick handler function type
pub type TickHandler = extern "C" fn(libc::c_int);

/// Build a signal set containing only `signal`.
pub fn signal_set(signal: libc::c_int) -> libc::sigset_t {
    // SAFETY: sigemptyset fully initializes the set before it is read.
    unsafe {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigemptyset(set.as_mut_ptr());
        libc::sigaddset(set.as_mut_ptr(), signal);
        set.assume_init()
    }
}

/// Per-thread signal mask operations
///
/// In a process that hosts a single runtime per OS thread, the calling
/// thread's mask is the whole story; `pthread_sigmask` keeps the operation
/// well defined when the process has other OS threads.
#[derive(Debug)]
pub struct SignalMask;

impl SignalMask {
    /// Block delivery of `signal` to the calling thread
    pub fn block(signal: libc::c_int) -> HalResult<()> {
        Self::change(libc::SIG_BLOCK, signal)
    }

    /// Unblock delivery of `signal` to the calling thread
    pub fn unblock(signal: libc::c_int) -> HalResult<()> {
        Self::change(libc::SIG_UNBLOCK, signal)
    }

    /// Block `signal` and report whether it was already blocked before
    pub fn block_saving(signal: libc::c_int) -> HalResult<bool> {
        let set = signal_set(signal);
        // SAFETY: `set` is initialized; `old` is written by the call before
        // it is read.
        unsafe {
            let mut old = MaybeUninit::<libc::sigset_t>::uninit();
            libc::sigemptyset(old.as_mut_ptr());
            if libc::pthread_sigmask(libc::SIG_BLOCK, &set, old.as_mut_ptr()) != 0 {
                return Err(HalError::SignalMaskFailed);
            }
            Ok(libc::sigismember(old.as_ptr(), signal) == 1)
        }
    }

    /// Check whether `signal` is currently blocked on the calling thread
    pub fn is_blocked(signal: libc::c_int) -> bool {
        // SAFETY: passing a null `set` only queries the current mask into `old`.
        unsafe {
            let mut old = MaybeUninit::<libc::sigset_t>::uninit();
            libc::sigemptyset(old.as_mut_ptr());
            if libc::pthread_sigmask(libc::SIG_BLOCK, ptr::null(), old.as_mut_ptr()) != 0 {
                return false;
            }
            libc::sigismember(old.as_ptr(), signal) == 1
        }
    }

    fn change(how: libc::c_int, signal: libc::c_int) -> HalResult<()> {
        let set = signal_set(signal);
        // SAFETY: `set` is initialized; the old mask is not requested.
        let rc = unsafe { libc::pthread_sigmask(how, &set, ptr::null_mut()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(HalError::SignalMaskFailed)
        }
    }
}

/// An installed signal handler
///
/// Remembers the disposition that was in place before installation so it
/// can be put back exactly once.
pub struct SignalAction {
    signal: libc::c_int,
    previous: libc::sigaction,
}

impl core::fmt::Debug for SignalAction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SignalAction")
            .field("signal", &self.signal)
            .finish_non_exhaustive()
    }
}

impl SignalAction {
    /// Install `handler` for `signal`.
    ///
    /// The signal is blocked while the handler runs, and interrupted system
    /// calls are restarted.
    pub fn install(signal: libc::c_int, handler: TickHandler) -> HalResult<Self> {
        // SAFETY: the sigaction struct is zeroed and then every field the
        // kernel reads is set before the call.
        unsafe {
            let mut action: libc::sigaction = MaybeUninit::zeroed().assume_init();
            action.sa_sigaction = handler as usize;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaddset(&mut action.sa_mask, signal);
            action.sa_flags = libc::SA_RESTART;

            let mut previous: libc::sigaction = MaybeUninit::zeroed().assume_init();
            if libc::sigaction(signal, &action, &mut previous) != 0 {
                return Err(HalError::SignalSetupFailed);
            }

            log::debug!("handler installed for signal {}", signal);
            Ok(Self { signal, previous })
        }
    }

    /// Put the previous disposition back.
    ///
    /// The signal is ignored first so a tick that is still pending is
    /// discarded instead of hitting the default disposition, which for
    /// `SIGVTALRM` terminates the process.
    pub fn restore(self) -> HalResult<()> {
        // SAFETY: both sigaction structs are fully initialized.
        unsafe {
            let mut ignore: libc::sigaction = MaybeUninit::zeroed().assume_init();
            ignore.sa_sigaction = libc::SIG_IGN;
            libc::sigemptyset(&mut ignore.sa_mask);
            if libc::sigaction(self.signal, &ignore, ptr::null_mut()) != 0 {
                return Err(HalError::SignalSetupFailed);
            }

            if libc::sigaction(self.signal, &self.previous, ptr::null_mut()) != 0 {
                return Err(HalError::SignalSetupFailed);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_set_membership() {
        let set = signal_set(TICK_SIGNAL);
        unsafe {
            assert_eq!(libc::sigismember(&set, TICK_SIGNAL), 1);
            assert_eq!(libc::sigismember(&set, libc::SIGINT), 0);
        }
    }

    #[test]
    fn test_block_unblock_is_per_thread() {
        // Each test runs on its own OS thread, so toggling the mask here
        // does not disturb other tests.
        SignalMask::block(TICK_SIGNAL).unwrap();
        assert!(SignalMask::is_blocked(TICK_SIGNAL));

        SignalMask::unblock(TICK_SIGNAL).unwrap();
        assert!(!SignalMask::is_blocked(TICK_SIGNAL));
    }

    #[test]
    fn test_block_saving_reports_previous_state() {
        SignalMask::unblock(TICK_SIGNAL).unwrap();
        assert!(!SignalMask::block_saving(TICK_SIGNAL).unwrap());
        assert!(SignalMask::block_saving(TICK_SIGNAL).unwrap());
        SignalMask::unblock(TICK_SIGNAL).unwrap();
    }
}
