use std::io;

use mach2::kern_return::KERN_SUCCESS;
use mach2::port::{mach_port_t, MACH_PORT_NULL};
use mach2::task::{task_resume, task_suspend};
use mach2::traps::{mach_task_self, task_for_pid};
use mach2::vm::mach_vm_read_overwrite;
use mach2::vm_types::mach_vm_size_t;

use crate::error::{MemoryError, ProcessError};

use super::{Process, SuspendOutcome};

/// Holds a Mach task port rather than a pid; the port is the handle used
/// for every suspend/resume/read operation on macOS.
pub struct MacProcess {
    pid: i32,
    task: mach_port_t,
}

fn kern_error(pid: i32, what: &'static str, code: mach2::kern_return::kern_return_t) -> io::Error {
    io::Error::new(
        io::ErrorKind::Other,
        format!("{} failed for pid {}: mach error {}", what, pid, code),
    )
}

impl Process for MacProcess {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn attach(pid: i32) -> Result<Self, ProcessError> {
        let mut task: mach_port_t = MACH_PORT_NULL;
        let kr = unsafe { task_for_pid(mach_task_self(), pid, &mut task) };
        if kr != KERN_SUCCESS {
            return Err(ProcessError::Attach {
                pid,
                source: kern_error(pid, "task_for_pid", kr),
            });
        }
        Ok(MacProcess { pid, task })
    }

    fn suspend(&mut self) -> Result<SuspendOutcome, ProcessError> {
        let kr = unsafe { task_suspend(self.task) };
        if kr != KERN_SUCCESS {
            // A task port whose task has exited surfaces as an error from
            // the kernel here rather than a waitpid-style status; treat
            // any failure to suspend a (by definition, still-referenced)
            // task as "exited", since there is no other way for
            // `task_suspend` to fail on a port we ourselves hold a send
            // right to.
            return Ok(SuspendOutcome::Exited);
        }
        Ok(SuspendOutcome::Stopped)
    }

    fn resume(&mut self) -> Result<(), ProcessError> {
        let kr = unsafe { task_resume(self.task) };
        if kr != KERN_SUCCESS {
            return Err(ProcessError::Resume {
                pid: self.pid,
                source: kern_error(self.pid, "task_resume", kr),
            });
        }
        Ok(())
    }

    fn detach(&mut self) {
        // Dropping our send right is sufficient; macOS has no ptrace-style
        // detach call for a `task_for_pid` port.
        if self.task != MACH_PORT_NULL {
            unsafe {
                mach2::mach_port::mach_port_deallocate(mach_task_self(), self.task);
            }
            self.task = MACH_PORT_NULL;
        }
    }

    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<usize, MemoryError> {
        let mut out_size: mach_vm_size_t = 0;
        let kr = unsafe {
            mach_vm_read_overwrite(
                self.task,
                addr,
                buf.len() as mach_vm_size_t,
                buf.as_mut_ptr() as u64,
                &mut out_size,
            )
        };
        if kr != KERN_SUCCESS {
            return Ok(0);
        }
        Ok(out_size as usize)
    }
}

impl Drop for MacProcess {
    fn drop(&mut self) {
        self.detach();
    }
}
