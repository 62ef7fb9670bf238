//! # Target-Specific Backends
//!
//! This module re-exports the appropriate context backend
//! based on the compilation target.

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_env = "gnu"))] {
        pub mod ucontext;

        // Re-export the current target's backend
        pub use ucontext as current;
    } else {
        compile_error!("uthread-hal currently supports glibc Linux targets only");
    }
}

