//! Error taxonomy. Each layer has its own error type; [`SamplerError`] is
//! the union the sampler loop matches on to decide whether a failure is
//! session-fatal or tick-local.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("process {pid} does not exist or cannot be traced")]
    NoSuchProcess { pid: i32 },
    #[error("failed to attach to process {pid}: {source}")]
    Attach { pid: i32, source: std::io::Error },
    #[error("failed to suspend process {pid}: {source}")]
    Suspend { pid: i32, source: std::io::Error },
    #[error("failed to resume process {pid}: {source}")]
    Resume { pid: i32, source: std::io::Error },
    #[error("unexpected stop signal {signal} in process {pid}")]
    UnexpectedStopSignal { pid: i32, signal: i32 },
    #[error("unexpected wait status for process {pid}")]
    UnexpectedStatus { pid: i32 },
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("attempted to read through a null remote address")]
    NullAddress,
    #[error("short read at {addr:#x}: expected {expected} bytes, got {got}")]
    ShortRead {
        addr: u64,
        expected: usize,
        got: usize,
    },
    #[error("I/O error reading remote memory: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum LocateError {
    #[error("could not enumerate loaded modules in process {pid}")]
    NoModules { pid: i32 },
    #[error("no module matching the R runtime (or main executable) found in process {pid}")]
    RuntimeModuleNotFound { pid: i32 },
    #[error("{path}: not a valid object file for this platform ({reason})")]
    InvalidObject { path: String, reason: String },
    #[error("{path}: no symbol table")]
    NoSymbolTable { path: String },
    #[error("required R global symbol `{symbol}` not found")]
    MissingSymbol { symbol: &'static str },
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("cursor is not initialized")]
    Uninitialized,
    #[error("stack walk exceeded the depth cap ({max} frames); treating as a malformed chain")]
    DepthExceeded { max: usize },
    #[error("decoded function name does not fit in a buffer of {buf_len} bytes")]
    NameTruncated { buf_len: usize },
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Failures from the per-tick native-stack unwind. Distinct from
/// [`ProcessError`] because a glitch in one tick's unwind (a torn read of a
/// mutating stack, say) should not be treated the same as failing to set up
/// the unwinder at session start.
#[derive(Debug, Error)]
pub enum NativeError {
    #[error("{what} failed (code {code})")]
    Unwind { what: &'static str, code: i32 },
}

/// Union of every lower-layer error, with the session-fatal/tick-local
/// split encoded in [`SamplerError::is_fatal`].
#[derive(Debug, Error)]
pub enum SamplerError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Locate(#[from] LocateError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Cursor(#[from] CursorError),
    #[error(transparent)]
    Native(#[from] NativeError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SamplerError {
    /// Session-fatal errors break the sampler loop; everything else is
    /// tick-local: the sampler discards the partial line and continues.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SamplerError::Process(ProcessError::NoSuchProcess { .. })
                | SamplerError::Process(ProcessError::Attach { .. })
                | SamplerError::Locate(_)
        )
    }
}
