use std::io;
use std::path::PathBuf;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::error::{MemoryError, ProcessError};

use super::{Process, SuspendOutcome};

/// `PTRACE_SEIZE` lets us attach without sending the tracee a stop signal;
/// `PTRACE_INTERRUPT` is then used on demand in [`suspend`] (mirrors
/// `original_source/src/process.c`'s `proc_create`/`proc_suspend` split).
pub struct LinuxProcess {
    pid: Pid,
    attached: bool,
}

fn ptrace_errno(request: libc::c_uint, pid: Pid) -> io::Result<()> {
    let ret = unsafe { libc::ptrace(request as libc::c_uint, pid.as_raw(), 0, 0) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

impl Process for LinuxProcess {
    fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    fn attach(pid: i32) -> Result<Self, ProcessError> {
        let target = Pid::from_raw(pid);
        ptrace_errno(libc::PTRACE_SEIZE as libc::c_uint, target)
            .map_err(|source| ProcessError::Attach { pid, source })?;
        Ok(LinuxProcess {
            pid: target,
            attached: true,
        })
    }

    fn suspend(&mut self) -> Result<SuspendOutcome, ProcessError> {
        let pid = self.pid.as_raw();
        ptrace_errno(libc::PTRACE_INTERRUPT as libc::c_uint, self.pid)
            .map_err(|source| ProcessError::Suspend { pid, source })?;

        loop {
            let status = waitpid(self.pid, Some(WaitPidFlag::empty())).map_err(|e| {
                let errno = e.as_errno().map(|errno| errno as i32).unwrap_or(libc::EIO);
                ProcessError::Suspend {
                    pid,
                    source: io::Error::from_raw_os_error(errno),
                }
            })?;
            match status {
                WaitStatus::Exited(_, _) | WaitStatus::Signaled(_, _, _) => {
                    return Ok(SuspendOutcome::Exited);
                }
                WaitStatus::Stopped(_, sig) if sig == nix::sys::signal::Signal::SIGCHLD => {
                    // Spurious stop; let the tracee continue and retry.
                    let _ = ptrace_errno(libc::PTRACE_CONT as libc::c_uint, self.pid);
                    continue;
                }
                WaitStatus::Stopped(_, sig) if sig != nix::sys::signal::Signal::SIGTRAP => {
                    return Err(ProcessError::UnexpectedStopSignal {
                        pid,
                        signal: sig as i32,
                    });
                }
                WaitStatus::Stopped(_, _) | WaitStatus::PtraceEvent(_, _, _) => {
                    return Ok(SuspendOutcome::Stopped);
                }
                _ => {
                    return Err(ProcessError::UnexpectedStatus { pid });
                }
            }
        }
    }

    fn resume(&mut self) -> Result<(), ProcessError> {
        let pid = self.pid.as_raw();
        ptrace_errno(libc::PTRACE_CONT as libc::c_uint, self.pid)
            .map_err(|source| ProcessError::Resume { pid, source })
    }

    fn detach(&mut self) {
        if self.attached {
            // Best-effort: detaching a tracee that is about to exit can
            // itself fail, and there is nothing useful to do about it.
            let _ = ptrace_errno(libc::PTRACE_DETACH as libc::c_uint, self.pid);
            self.attached = false;
        }
    }

    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<usize, MemoryError> {
        let local_iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let remote_iov = libc::iovec {
            iov_base: addr as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let n = unsafe {
            libc::process_vm_readv(self.pid.as_raw(), &local_iov, 1, &remote_iov, 1, 0)
        };
        if n < 0 {
            return Err(MemoryError::Io(io::Error::last_os_error()));
        }
        Ok(n as usize)
    }

    fn filesystem_root(&self) -> Option<PathBuf> {
        Some(PathBuf::from(format!("/proc/{}/root", self.pid.as_raw())))
    }
}

impl Drop for LinuxProcess {
    fn drop(&mut self) {
        self.detach();
    }
}
