//! Out-of-process statistical profiler for a running R interpreter
//! process: locates interpreter globals in a foreign address space, walks
//! its call-context chain across a process boundary, and emits sample
//! lines without ever executing code inside the tracee.

pub mod cursor;
pub mod error;
pub mod locate;
pub mod memory;
#[cfg(feature = "mixed-mode")]
pub mod native;
pub mod process;
pub mod rdefs;
pub mod sampler;
