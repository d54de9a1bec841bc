//! Sampler loop: attach, locate, and repeatedly suspend / walk / resume /
//! sleep until a termination condition fires.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cursor::{FrameName, StackCursor, StepOutcome};
use crate::error::SamplerError;
use crate::locate::{self, Globals};
use crate::process::{Process, SuspendOutcome};

const DEFAULT_FREQ: u32 = 1;
const MAX_FREQ: u32 = 1000;
const DEFAULT_DURATION: f32 = 3600.0;

/// Sampler configuration, after the frequency/duration coercion rules have
/// already been applied by [`SamplerConfig::new`].
#[derive(Debug, Clone, Copy)]
pub struct SamplerConfig {
    pub pid: i32,
    pub freq_hz: u32,
    pub duration_secs: f32,
    pub mixed_mode: bool,
}

impl SamplerConfig {
    /// Applies the coercion rules from `original_source/src/xrprof.c`:
    /// a non-positive frequency falls back to the default, one above the
    /// ceiling is clamped to it; a non-positive duration falls back to the
    /// default.
    pub fn new(pid: i32, freq_hz: i64, duration_secs: f32, mixed_mode: bool) -> Self {
        let freq_hz = if freq_hz <= 0 {
            log::warn!(
                "invalid frequency argument, falling back on the default {}",
                DEFAULT_FREQ
            );
            DEFAULT_FREQ
        } else if freq_hz > MAX_FREQ as i64 {
            log::warn!("frequency cannot exceed {}, using that instead", MAX_FREQ);
            MAX_FREQ
        } else {
            freq_hz as u32
        };

        let duration_secs = if duration_secs <= 0.0 {
            log::warn!(
                "invalid duration argument, falling back on the default {}",
                DEFAULT_DURATION
            );
            DEFAULT_DURATION
        } else {
            duration_secs
        };

        SamplerConfig {
            pid,
            freq_hz,
            duration_secs,
            mixed_mode,
        }
    }

    fn period(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.freq_hz as u64)
    }

    fn period_micros(&self) -> u64 {
        1_000_000 / self.freq_hz as u64
    }
}

/// A cooperative stop signal: set by a SIGINT handler (or any other
/// caller), checked once per tick. Deliberately not a bare global —
/// ownership is explicit and the flag is handed to whichever component
/// installs the signal handler.
#[derive(Clone)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        StopFlag(Arc::new(AtomicBool::new(false)))
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the sampler loop against an already-constructed process handle,
/// writing the Rprof-style header and sample lines to `out`.
///
/// Every exit path — clean termination, tracee exit, or error — detaches
/// the process before returning.
pub fn run<P: Process, W: Write>(
    mut process: P,
    config: SamplerConfig,
    stop: &StopFlag,
    out: &mut W,
) -> Result<(), SamplerError> {
    let globals = locate_globals(&mut process)?;

    #[cfg(feature = "mixed-mode")]
    let native = if config.mixed_mode {
        Some(crate::native::NativeCursor::new(process.pid())?)
    } else {
        None
    };

    let result = drive_ticks(&mut process, &globals, &config, stop, out, #[cfg(feature = "mixed-mode")] native.as_ref());

    process.detach();
    result
}

fn locate_globals<P: Process>(process: &mut P) -> Result<Globals, SamplerError> {
    // The locator reads module/symbol tables while the tracee is
    // suspended.
    match process.suspend()? {
        SuspendOutcome::Exited => {
            return Err(crate::error::ProcessError::NoSuchProcess { pid: process.pid() }.into())
        }
        SuspendOutcome::Stopped => {}
    }
    let globals = locate::locate(process)?;
    process.resume()?;
    Ok(globals)
}

#[allow(unused_variables)]
fn drive_ticks<P: Process, W: Write>(
    process: &mut P,
    globals: &Globals,
    config: &SamplerConfig,
    stop: &StopFlag,
    out: &mut W,
    #[cfg(feature = "mixed-mode")] native: Option<&crate::native::NativeCursor>,
) -> Result<(), SamplerError> {
    writeln!(out, "sample.interval={}", config.period_micros())?;

    let period = config.period();
    let tick_secs = 1.0 / config.freq_hz as f32;
    let mut elapsed = 0.0f32;

    while !stop.is_set() && elapsed <= config.duration_secs {
        match process.suspend()? {
            SuspendOutcome::Exited => break,
            SuspendOutcome::Stopped => {}
        }

        let tick = run_one_tick(process, globals, #[cfg(feature = "mixed-mode")] native, out);

        process.resume()?;

        match tick {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                log::warn!("dropping sample after tick-local error: {}", e);
            }
        }

        std::thread::sleep(period);
        elapsed += tick_secs;
    }

    Ok(())
}

fn run_one_tick<P: Process, W: Write>(
    process: &P,
    globals: &Globals,
    #[cfg(feature = "mixed-mode")] native: Option<&crate::native::NativeCursor>,
    out: &mut W,
) -> Result<(), SamplerError> {
    let mut line = String::new();

    #[cfg(feature = "mixed-mode")]
    let walk_interpreter = if let Some(native) = native {
        let mut tokens = Vec::new();
        let should_walk_interpreter = crate::native::walk_native_stack(native, &mut tokens)?;
        for tok in tokens {
            line.push('"');
            line.push_str(&tok);
            line.push_str("\" ");
        }
        should_walk_interpreter
    } else {
        true
    };
    #[cfg(not(feature = "mixed-mode"))]
    let walk_interpreter = true;

    if walk_interpreter {
        let mut cursor = StackCursor::new(process, globals);
        cursor.init()?;
        loop {
            let name = cursor.frame_name()?;
            match name {
                FrameName::TopLevel => line.push_str("\"<TopLevel>\" "),
                FrameName::Name(n) => {
                    line.push('"');
                    line.push_str(&n);
                    line.push_str("\" ");
                }
            }
            match cursor.step()? {
                StepOutcome::Terminal => break,
                StepOutcome::Frame(_) => continue,
            }
        }
    }

    writeln!(out, "{}", line)?;
    Ok(())
}
