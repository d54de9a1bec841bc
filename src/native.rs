//! Native-stack cursor (optional mixed-mode): wraps libunwind's ptrace
//! accessors to unwind the tracee's C stack and interleave it with the
//! interpreter stack walk. Linux-only, matching `original_source/src/
//! xrprof.c`'s `#ifdef __linux` / `HAVE_LIBUNWIND` guard, and gated behind
//! the `mixed-mode` Cargo feature so the rest of the crate builds without
//! libunwind installed.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};

use crate::error::{NativeError, ProcessError};

const SYM_BUF_LEN: usize = 256;

/// The profiler's own hook into the interpreter, skipped during native
/// unwinding so it never shows up as a frame.
const PROFILER_ENTRY_PREFIX: &str = "do_Rprof";
/// The interpreter's evaluator entry point: reaching it means scripted
/// code is running, so native unwinding stops and control passes to the
/// interpreter-stack cursor.
const EVAL_ENTRY_PREFIX: &str = "Rf_eval";
/// The REPL's top-level read-eval-print entry point: reaching it means
/// there is no interpreter call in progress worth walking.
const REPL_ENTRY_PREFIX: &str = "Rf_ReplIteration";

#[allow(non_camel_case_types)]
type unw_addr_space_t = *mut c_void;
#[allow(non_camel_case_types)]
type unw_word_t = u64;

#[repr(C)]
struct UnwCursor {
    opaque: [unw_word_t; 127],
}

#[repr(C)]
struct UnwProcInfo {
    start_ip: unw_word_t,
    end_ip: unw_word_t,
    lsda: unw_word_t,
    handler: unw_word_t,
    gp: unw_word_t,
    flags: unw_word_t,
    format: c_int,
    unwind_info_size: c_int,
    unwind_info: *mut c_void,
    extra: [unw_word_t; 1],
}

// UNW_REG_IP is target-dependent in real libunwind headers, but is 16 on
// every architecture this crate supports (x86-64 and aarch64's
// `unw_regnum_t` enumerations both place RIP/PC at this slot via
// `UNW_X86_64_RIP/UNW_AARCH64_PC`). Hard-coding it mirrors the single
// `UNW_REG_IP` constant the C original uses unconditionally.
const UNW_REG_IP: c_int = 16;

extern "C" {
    static _UPT_accessors: *const c_void;

    fn unw_create_addr_space(ap: *const c_void, byteorder: c_int) -> unw_addr_space_t;
    fn unw_destroy_addr_space(as_: unw_addr_space_t);
    fn unw_set_caching_policy(as_: unw_addr_space_t, policy: c_int) -> c_int;

    fn _UPT_create(pid: c_int) -> *mut c_void;
    fn _UPT_destroy(arg: *mut c_void);

    fn unw_init_remote(cursor: *mut UnwCursor, as_: unw_addr_space_t, arg: *mut c_void) -> c_int;
    fn unw_step(cursor: *mut UnwCursor) -> c_int;
    fn unw_get_reg(cursor: *mut UnwCursor, regnum: c_int, valp: *mut unw_word_t) -> c_int;
    fn unw_get_proc_info(cursor: *mut UnwCursor, info: *mut UnwProcInfo) -> c_int;
    fn unw_get_proc_name(
        cursor: *mut UnwCursor,
        buf: *mut c_char,
        len: usize,
        offp: *mut unw_word_t,
    ) -> c_int;
}

const UNW_CACHE_GLOBAL: c_int = 1;

/// One decision from [`NativeCursor::current_frame`]: either a frame to
/// print, or an instruction to stop native unwinding (optionally handing
/// off to the interpreter cursor).
pub enum NativeStep {
    /// Emit this token (already formatted as `<Native:...>`) and keep
    /// unwinding.
    Emit(String),
    /// Skip silently (the profiler's own hook frame) and keep unwinding.
    Skip,
    /// Stop unwinding; interpreter frames begin at the current state.
    StopAndHandOff,
    /// Stop unwinding; no interpreter frames are implied.
    Stop,
}

/// Owns the libunwind address space and `_UPT` context for one sampler
/// session. Created once per attach, destroyed before the process detach.
pub struct NativeCursor {
    addr_space: unw_addr_space_t,
    upt: *mut c_void,
}

impl NativeCursor {
    pub fn new(pid: i32) -> Result<Self, ProcessError> {
        let addr_space = unsafe { unw_create_addr_space(_UPT_accessors, 0) };
        if addr_space.is_null() {
            return Err(ProcessError::Attach {
                pid,
                source: std::io::Error::new(std::io::ErrorKind::Other, "unw_create_addr_space failed"),
            });
        }
        unsafe { unw_set_caching_policy(addr_space, UNW_CACHE_GLOBAL) };

        let upt = unsafe { _UPT_create(pid) };
        if upt.is_null() {
            unsafe { unw_destroy_addr_space(addr_space) };
            return Err(ProcessError::Attach {
                pid,
                source: std::io::Error::new(std::io::ErrorKind::Other, "_UPT_create failed"),
            });
        }

        Ok(NativeCursor { addr_space, upt })
    }

    /// Begins a fresh remote unwind for this tick. Must be called after
    /// each `suspend`, mirroring `xrprof_init` for the interpreter cursor.
    /// A failure here is tick-local: the next tick gets a fresh attempt.
    pub fn init_tick(&self) -> Result<UnwCursor, NativeError> {
        let mut cursor: UnwCursor = unsafe { std::mem::zeroed() };
        let ret = unsafe { unw_init_remote(&mut cursor, self.addr_space, self.upt) };
        if ret != 0 {
            return Err(NativeError::Unwind {
                what: "unw_init_remote",
                code: ret,
            });
        }
        Ok(cursor)
    }

    /// Decodes the current frame without stepping. Failures are tick-local.
    pub fn current_frame(&self, cursor: &mut UnwCursor) -> Result<NativeStep, NativeError> {
        let mut ip: unw_word_t = 0;
        let reg_ret = unsafe { unw_get_reg(cursor, UNW_REG_IP, &mut ip) };
        if reg_ret < 0 {
            return Err(NativeError::Unwind {
                what: "unw_get_reg(UNW_REG_IP)",
                code: reg_ret,
            });
        }

        let mut info: UnwProcInfo = unsafe { std::mem::zeroed() };
        let info_ret = unsafe { unw_get_proc_info(cursor, &mut info) };
        if info_ret < 0 {
            return Err(NativeError::Unwind {
                what: "unw_get_proc_info",
                code: info_ret,
            });
        }

        let mut buf = [0 as c_char; SYM_BUF_LEN];
        let mut offset: unw_word_t = 0;
        let name_ret = unsafe {
            unw_get_proc_name(cursor, buf.as_mut_ptr(), buf.len(), &mut offset)
        };

        if ip > info.end_ip {
            return Ok(NativeStep::Emit(format!("<Native:{:#x}>", ip)));
        }

        if name_ret < 0 {
            // No symbol information (or a truncated-but-usable name); the
            // original falls back to a raw address unless the failure is
            // "no info at all", in which case it also falls back here.
            return Ok(NativeStep::Emit(format!("<Native:{:#x}>", ip)));
        }

        let name = unsafe { CStr::from_ptr(buf.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        if name.starts_with(PROFILER_ENTRY_PREFIX) {
            return Ok(NativeStep::Skip);
        }
        if name.starts_with(EVAL_ENTRY_PREFIX) {
            return Ok(NativeStep::StopAndHandOff);
        }
        if name.starts_with(REPL_ENTRY_PREFIX) {
            return Ok(NativeStep::Stop);
        }

        Ok(NativeStep::Emit(format!("<Native:{}>", name)))
    }

    /// Advances to the caller's frame. Returns `false` once the bottom of
    /// the native stack has been reached.
    pub fn step(&self, cursor: &mut UnwCursor) -> Result<bool, NativeError> {
        let ret = unsafe { unw_step(cursor) };
        if ret < 0 {
            return Err(NativeError::Unwind {
                what: "unw_step",
                code: ret,
            });
        }
        Ok(ret > 0)
    }
}

impl Drop for NativeCursor {
    fn drop(&mut self) {
        unsafe {
            _UPT_destroy(self.upt);
            unw_destroy_addr_space(self.addr_space);
        }
    }
}

/// Walks the native stack for one tick, pushing formatted `<Native:...>`
/// tokens into `out`. Returns whether the interpreter-stack cursor should
/// subsequently be walked (`true` unless the REPL entry point was reached
/// with no interpreter call live).
pub fn walk_native_stack(native: &NativeCursor, out: &mut Vec<String>) -> Result<bool, NativeError> {
    let mut cursor = native.init_tick()?;
    loop {
        match native.current_frame(&mut cursor)? {
            NativeStep::Emit(tok) => out.push(tok),
            NativeStep::Skip => {}
            NativeStep::StopAndHandOff => return Ok(true),
            NativeStep::Stop => return Ok(false),
        }
        if !native.step(&mut cursor)? {
            return Ok(true);
        }
    }
}

