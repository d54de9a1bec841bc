use std::io;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
use windows_sys::Win32::System::Diagnostics::Debug::ReadProcessMemory;
use windows_sys::Win32::System::Threading::{
    OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_SUSPEND_RESUME, PROCESS_VM_READ,
};

use crate::error::{MemoryError, ProcessError};

use super::{Process, SuspendOutcome};

#[link(name = "ntdll")]
extern "system" {
    fn NtSuspendProcess(process: HANDLE) -> i32;
    fn NtResumeProcess(process: HANDLE) -> i32;
}

/// Opens the target with just enough rights to read memory and
/// suspend/resume it, without taking over its debug port (so e.g. a real
/// debugger can remain attached at the same time), matching the
/// non-invasive spirit of the Linux `PTRACE_SEIZE` path.
pub struct WindowsProcess {
    pid: i32,
    handle: HANDLE,
}

impl Process for WindowsProcess {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn attach(pid: i32) -> Result<Self, ProcessError> {
        let rights = PROCESS_QUERY_INFORMATION | PROCESS_SUSPEND_RESUME | PROCESS_VM_READ;
        let handle = unsafe { OpenProcess(rights, 0, pid as u32) };
        if handle == 0 {
            return Err(ProcessError::Attach {
                pid,
                source: io::Error::last_os_error(),
            });
        }
        Ok(WindowsProcess { pid, handle })
    }

    fn suspend(&mut self) -> Result<SuspendOutcome, ProcessError> {
        let status = unsafe { NtSuspendProcess(self.handle) };
        if status < 0 {
            return Err(ProcessError::Suspend {
                pid: self.pid,
                source: io::Error::from_raw_os_error(status),
            });
        }
        Ok(SuspendOutcome::Stopped)
    }

    fn resume(&mut self) -> Result<(), ProcessError> {
        let status = unsafe { NtResumeProcess(self.handle) };
        if status < 0 {
            return Err(ProcessError::Resume {
                pid: self.pid,
                source: io::Error::from_raw_os_error(status),
            });
        }
        Ok(())
    }

    fn detach(&mut self) {
        if self.handle != 0 {
            unsafe {
                CloseHandle(self.handle);
            }
            self.handle = 0;
        }
    }

    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<usize, MemoryError> {
        let mut bytes_read: usize = 0;
        let ok = unsafe {
            ReadProcessMemory(
                self.handle,
                addr as *const std::ffi::c_void,
                buf.as_mut_ptr() as *mut std::ffi::c_void,
                buf.len(),
                &mut bytes_read,
            )
        };
        if ok == 0 {
            return Ok(bytes_read);
        }
        Ok(bytes_read)
    }
}

impl Drop for WindowsProcess {
    fn drop(&mut self) {
        self.detach();
    }
}
