//! # Thread Management
//!
//! Thread control blocks, states, and the per-runtime thread table.

pub mod registry;
pub mod states;
#[allow(clippy::module_inception)]
pub mod thread;

pub(crate) use registry::ThreadTable;
pub use states::*;
pub(crate) use thread::Thread;
pub use thread::ThreadFlags;
