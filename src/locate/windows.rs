use std::ffi::CString;
use std::path::PathBuf;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};

use crate::error::LocateError;
use crate::process::Process;

use super::{resolve_globals, select_runtime_module, Globals, LoadedModule, RawSymbols};

const MAX_SYM_NAME: usize = 2000;

#[repr(C)]
struct SymbolInfo {
    size_of_struct: u32,
    type_index: u32,
    reserved: [u64; 2],
    index: u32,
    size: u32,
    mod_base: u64,
    flags: u32,
    value: u64,
    address: u64,
    register: u32,
    scope: u32,
    tag: u32,
    name_len: u32,
    max_name_len: u32,
    name: [u8; MAX_SYM_NAME],
}

// Resolved dynamically against dbghelp.dll; this mirrors what `bindgen`
// (already a build-dependency of this crate for the mixed-mode feature)
// would generate from `<dbghelp.h>`.
#[link(name = "dbghelp")]
extern "system" {
    fn SymInitialize(process: HANDLE, user_search_path: *const i8, invade_process: i32) -> i32;
    fn SymCleanup(process: HANDLE) -> i32;
    fn SymLoadModuleExW(
        process: HANDLE,
        file: HANDLE,
        image_name: *const u16,
        module_name: *const u16,
        base_of_dll: u64,
        dll_size: u32,
        data: *const std::ffi::c_void,
        flags: u32,
    ) -> u64;
    fn SymUnloadModule64(process: HANDLE, base_of_dll: u64) -> i32;
    fn SymFromName(process: HANDLE, name: *const i8, symbol: *mut SymbolInfo) -> i32;
}

#[link(name = "psapi")]
extern "system" {
    fn EnumProcessModules(
        process: HANDLE,
        modules: *mut HANDLE,
        size: u32,
        needed: *mut u32,
    ) -> i32;
    fn GetModuleFileNameExW(
        process: HANDLE,
        module: HANDLE,
        filename: *mut u16,
        size: u32,
    ) -> u32;
}

fn enum_modules(process_handle: HANDLE) -> Result<Vec<(HANDLE, PathBuf)>, LocateError> {
    let mut handles: [HANDLE; 1024] = [0; 1024];
    let mut needed: u32 = 0;
    let ok = unsafe {
        EnumProcessModules(
            process_handle,
            handles.as_mut_ptr(),
            (handles.len() * std::mem::size_of::<HANDLE>()) as u32,
            &mut needed,
        )
    };
    if ok == 0 {
        return Err(LocateError::NoModules { pid: 0 });
    }
    let count = (needed as usize / std::mem::size_of::<HANDLE>()).min(handles.len());

    let mut out = Vec::with_capacity(count);
    for &module in &handles[..count] {
        let mut buf = [0u16; 512];
        let len = unsafe { GetModuleFileNameExW(process_handle, module, buf.as_mut_ptr(), buf.len() as u32) };
        if len == 0 {
            continue;
        }
        let path = String::from_utf16_lossy(&buf[..len as usize]);
        out.push((module, PathBuf::from(path)));
    }
    Ok(out)
}

fn lookup_symbol(process_handle: HANDLE, name: &str) -> Option<u64> {
    let cname = CString::new(name).ok()?;
    let mut info: SymbolInfo = unsafe { std::mem::zeroed() };
    info.size_of_struct = std::mem::size_of::<SymbolInfo>() as u32;
    info.max_name_len = (MAX_SYM_NAME - 1) as u32;
    let ok = unsafe { SymFromName(process_handle, cname.as_ptr(), &mut info) };
    if ok == 0 {
        return None;
    }
    Some(info.address)
}

/// Windows has no on-disk-only symbol reader analogous to parsing an ELF
/// or Mach-O symbol table ourselves, so this path uses `dbghelp`'s own
/// symbol engine (`SymLoadModuleExW` + `SymFromName`) against the target
/// process handle, per `original_source/src/locate.c`'s `#elif
/// defined(__WIN32)` branch. The tracee must remain suspended for the
/// duration, exactly as that branch does (it calls `proc_suspend` itself).
/// Closes the process handle opened for symbol resolution on every exit
/// path, including the early-return ones above.
struct HandleGuard(HANDLE);

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if self.0 != 0 {
            unsafe { CloseHandle(self.0) };
        }
    }
}

pub(crate) fn locate<P: Process>(process: &P) -> Result<Globals, LocateError> {
    let pid = process.pid();
    // `Process` does not expose a raw HANDLE, so we re-open one here; the
    // locator inspects loaded modules independently of the sampler's own
    // handle.
    let raw_handle = unsafe {
        windows_sys::Win32::System::Threading::OpenProcess(
            windows_sys::Win32::System::Threading::PROCESS_QUERY_INFORMATION
                | windows_sys::Win32::System::Threading::PROCESS_VM_READ,
            0,
            pid as u32,
        )
    };
    if raw_handle == 0 {
        return Err(LocateError::NoModules { pid });
    }
    let guard = HandleGuard(raw_handle);
    let handle = guard.0;

    if unsafe { SymInitialize(handle, std::ptr::null(), 0) } == 0 {
        return Err(LocateError::NoModules { pid });
    }

    let modules = enum_modules(handle)?;
    let runtime = modules
        .iter()
        .find(|(_, path)| {
            let name = path.to_string_lossy();
            super::RUNTIME_MODULE_HINTS.iter().any(|h| name.contains(h))
        })
        .or_else(|| modules.first());

    let (module_handle, path) = runtime
        .cloned()
        .ok_or(LocateError::RuntimeModuleNotFound { pid })?;

    let wide: Vec<u16> = path
        .to_string_lossy()
        .encode_utf16()
        .chain(std::iter::once(0))
        .collect();
    let base = unsafe {
        SymLoadModuleExW(
            handle,
            0,
            wide.as_ptr(),
            std::ptr::null(),
            module_handle as u64,
            0,
            std::ptr::null(),
            0,
        )
    };
    if base == 0 {
        unsafe { SymCleanup(handle) };
        return Err(LocateError::InvalidObject {
            path: path.display().to_string(),
            reason: "SymLoadModuleExW failed".into(),
        });
    }

    let mut raw = RawSymbols::empty();
    for name in ["R_GlobalContext", "R_DoubleColonSymbol", "R_TripleColonSymbol", "R_DollarSymbol", "R_BracketSymbol"] {
        if let Some(addr) = lookup_symbol(handle, name) {
            raw.record(name, addr.wrapping_sub(base));
        }
    }

    unsafe {
        SymUnloadModule64(handle, base);
        SymCleanup(handle);
    }
    drop(guard);

    // `lookup_symbol` returns addresses already relocated by dbghelp, so
    // each one was rebased to a `base`-relative offset just above; handing
    // `base` back in here as the load base undoes exactly that rebasing.
    let modules_for_select = vec![LoadedModule {
        path,
        load_base: base,
    }];
    let chosen = select_runtime_module(&modules_for_select, modules_for_select.first())
        .ok_or(LocateError::RuntimeModuleNotFound { pid })?;
    resolve_globals(process, raw, chosen.load_base)
}
