//! CLI front-end. Parses arguments, wires up logging, and drives the
//! sampler loop; no sampling logic lives here.

use std::io;
use std::process::ExitCode;

use structopt::StructOpt;

use xrprof::process::{PlatformProcess, Process};
use xrprof::sampler::{self, SamplerConfig, StopFlag};

/// Out-of-process statistical profiler for a running R interpreter
/// process.
#[derive(StructOpt, Debug)]
#[structopt(name = "xrprof")]
struct Opt {
    /// Target process id.
    #[structopt(short = "p", long = "pid")]
    pid: i32,

    /// Sampling frequency in Hz (1..1000).
    #[structopt(short = "F", long = "freq", default_value = "1")]
    freq: i64,

    /// Maximum sampling duration in seconds.
    #[structopt(short = "d", long = "duration", default_value = "3600")]
    duration: f32,

    /// Interleave a native (C-level) stack unwind with the interpreter
    /// stack walk. Requires the `mixed-mode` feature.
    #[structopt(short = "m", long = "mixed-mode")]
    mixed_mode: bool,

    /// Increase log verbosity; repeatable (-v, -vv, -vvv).
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    verbose: u8,
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}

fn main() -> ExitCode {
    let opt = Opt::from_args();
    init_logging(opt.verbose);

    if opt.mixed_mode && cfg!(not(feature = "mixed-mode")) {
        log::warn!("mixed-mode was requested but this build was compiled without the `mixed-mode` feature; ignoring");
    }

    let config = SamplerConfig::new(opt.pid, opt.freq, opt.duration, opt.mixed_mode);

    let process = match PlatformProcess::attach(config.pid) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("fatal: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let stop = StopFlag::new();
    if let Err(e) = install_stop_handler(stop.clone()) {
        log::warn!("failed to install interrupt handler: {}", e);
    }

    let stdout = io::stdout();
    let mut lock = stdout.lock();

    match sampler::run(process, config, &stop, &mut lock) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fatal: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Installs a `SIGINT` handler that sets the cooperative-stop flag rather
/// than terminating the process outright, so the current tick can finish
/// and every scoped resource gets torn down.
#[cfg(unix)]
fn install_stop_handler(stop: StopFlag) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || stop.signal())
}

#[cfg(not(unix))]
fn install_stop_handler(_stop: StopFlag) -> Result<(), std::io::Error> {
    Ok(())
}
