//! Platform-abstracted attach / suspend / resume / detach of a remote
//! process. The concrete implementation is selected at compile time per
//! `cfg(target_os = ...)`; the sampler and everything above it depends
//! only on the [`Process`] trait, never on a platform type.

use crate::error::{MemoryError, ProcessError};

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use linux::LinuxProcess as PlatformProcess;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub use macos::MacProcess as PlatformProcess;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use windows::WindowsProcess as PlatformProcess;

/// Outcome of [`Process::suspend`]. The tracee exiting mid-suspend is a
/// distinguished, non-error outcome so the sampler can terminate cleanly
/// with exit code 0 rather than treating it as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendOutcome {
    Stopped,
    Exited,
}

/// A platform handle on a traced process, owned exclusively by the
/// sampler for the lifetime of one session.
pub trait Process: Sized {
    /// A platform-specific raw handle value, exposed only for diagnostics
    /// (it is never assumed to be a pid by any layer above `process`).
    fn pid(&self) -> i32;

    /// Acquire a tracing relationship with `pid` without stopping it.
    fn attach(pid: i32) -> Result<Self, ProcessError>;

    /// Stop the target and wait until it is confirmed stopped, retrying
    /// transparently on a spurious child-signal stop.
    fn suspend(&mut self) -> Result<SuspendOutcome, ProcessError>;

    /// Continue a suspended target.
    fn resume(&mut self) -> Result<(), ProcessError>;

    /// Release the tracing relationship. Best-effort: never fails fatally.
    fn detach(&mut self);

    /// Copy exactly `buf.len()` bytes from `addr` in the tracee into `buf`,
    /// returning the number of bytes actually transferred. Never writes
    /// the tracee.
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<usize, MemoryError>;

    /// Path through which the tracee's view of its own loaded module
    /// images should be opened (e.g. `/proc/<pid>/root` on Linux, to
    /// account for mount namespaces). Returns `None` on platforms with no
    /// such indirection.
    fn filesystem_root(&self) -> Option<std::path::PathBuf> {
        None
    }
}
