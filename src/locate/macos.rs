use std::fs;
use std::io::Read;
use std::mem;
use std::path::{Path, PathBuf};

use goblin::mach::Mach;
use mach2::kern_return::KERN_SUCCESS;
use mach2::message::mach_msg_type_number_t;
use mach2::task::task_info;
use mach2::task_info::{task_dyld_info_data_t, TASK_DYLD_INFO};

use crate::error::LocateError;
use crate::process::Process;

use super::{resolve_globals, select_runtime_module, Globals, LoadedModule, RawSymbols};

/// Mirrors dyld's `dyld_image_info`, which is not part of the Mach kernel
/// headers `mach2` binds, so it is reproduced here field-for-field. 64-bit
/// only, matching the rest of this crate's no-cross-pointer-width-profiling
/// stance.
#[repr(C)]
struct DyldImageInfo {
    image_load_address: u64,
    image_file_path: u64,
    image_file_mod_date: u64,
}

#[repr(C)]
struct DyldAllImageInfos {
    version: u32,
    info_array_count: u32,
    info_array: u64,
    // remaining fields unused.
}

fn read_remote<P: Process, T>(process: &P, addr: u64) -> Result<T, LocateError> {
    let len = mem::size_of::<T>();
    let mut buf = vec![0u8; len];
    let got = process.read_bytes(addr, &mut buf)?;
    if got < len {
        return Err(LocateError::Memory(crate::error::MemoryError::ShortRead {
            addr,
            expected: len,
            got,
        }));
    }
    Ok(unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const T) })
}

fn read_remote_cstring<P: Process>(process: &P, addr: u64, max_len: usize) -> Result<String, LocateError> {
    let mut buf = vec![0u8; max_len];
    let got = process.read_bytes(addr, &mut buf)?;
    let cut = buf[..got].iter().position(|&b| b == 0).unwrap_or(got);
    Ok(String::from_utf8_lossy(&buf[..cut]).into_owned())
}

/// Enumerates the tracee's loaded Mach-O images by walking its
/// `dyld_all_image_infos` structure, whose address we learn from
/// `task_info(TASK_DYLD_INFO)`. This is the same mechanism LLDB and
/// `vmmap` use to inspect another process's dyld state without running
/// any code inside it.
fn read_loaded_modules<P: Process>(process: &P, task: u32) -> Result<Vec<LoadedModule>, LocateError> {
    let mut info: task_dyld_info_data_t = unsafe { mem::zeroed() };
    let mut count: mach_msg_type_number_t =
        (mem::size_of::<task_dyld_info_data_t>() / mem::size_of::<u32>()) as mach_msg_type_number_t;
    let kr = unsafe {
        task_info(
            task,
            TASK_DYLD_INFO,
            &mut info as *mut _ as *mut i32,
            &mut count,
        )
    };
    if kr != KERN_SUCCESS {
        return Err(LocateError::NoModules { pid: process.pid() });
    }

    let all_info: DyldAllImageInfos = read_remote(process, info.all_image_info_addr)?;
    let mut modules = Vec::with_capacity(all_info.info_array_count as usize);
    for i in 0..all_info.info_array_count as u64 {
        let entry_addr = all_info.info_array + i * mem::size_of::<DyldImageInfo>() as u64;
        let entry: DyldImageInfo = read_remote(process, entry_addr)?;
        let path = read_remote_cstring(process, entry.image_file_path, 1024)?;
        modules.push(LoadedModule {
            path: PathBuf::from(path),
            load_base: entry.image_load_address,
        });
    }

    if modules.is_empty() {
        return Err(LocateError::NoModules { pid: process.pid() });
    }
    Ok(modules)
}

/// Reads a module's symbol table directly from its on-disk Mach-O image,
/// adjusting by the `__TEXT` segment's VM address to convert the symbol
/// table's file-relative values into runtime offsets.
fn parse_symtab(path: &Path) -> Result<(RawSymbols, u64), LocateError> {
    let mut file = fs::File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let macho = match Mach::parse(&buf).map_err(|e| LocateError::InvalidObject {
        path: path.display().to_string(),
        reason: e.to_string(),
    })? {
        Mach::Binary(macho) => macho,
        Mach::Fat(fat) => {
            // Pick the 64-bit slice; this profiler never spans pointer
            // widths.
            let arches = fat.arches().map_err(|e| LocateError::InvalidObject {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            let idx = arches
                .iter()
                .position(|a| a.is_64())
                .ok_or_else(|| LocateError::InvalidObject {
                    path: path.display().to_string(),
                    reason: "no 64-bit slice in fat binary".into(),
                })?;
            match fat
                .get(idx)
                .map_err(|e| LocateError::InvalidObject {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?
            {
                goblin::mach::SingleArch::MachO(m) => m,
                goblin::mach::SingleArch::Archive(_) => {
                    return Err(LocateError::InvalidObject {
                        path: path.display().to_string(),
                        reason: "fat slice is an archive, not a Mach-O image".into(),
                    })
                }
            }
        }
    };

    let text_vmaddr = macho
        .segments
        .iter()
        .find(|seg| seg.name().map(|n| n == "__TEXT").unwrap_or(false))
        .map(|seg| seg.vmaddr)
        .unwrap_or(0);

    let mut raw = RawSymbols::empty();
    if let Some(symbols) = macho.symbols {
        for entry in symbols.into_iter().flatten() {
            let (name, nlist) = entry;
            if nlist.n_value == 0 {
                continue;
            }
            raw.record(name, nlist.n_value);
        }
    }

    Ok((raw, text_vmaddr))
}

pub(crate) fn locate<P: Process>(process: &P) -> Result<Globals, LocateError> {
    // The task port itself is opaque to this module; `Process` only
    // exposes reads, so mixed-mode native unwinding aside, we re-derive a
    // raw task port the same way `attach` did. Platforms that need the
    // port for dyld enumeration pay this cost once, at locate time.
    let pid = process.pid();
    let mut task: u32 = 0;
    let kr = unsafe { mach2::traps::task_for_pid(mach2::traps::mach_task_self(), pid, &mut task) };
    if kr != KERN_SUCCESS {
        return Err(LocateError::NoModules { pid });
    }

    let modules = read_loaded_modules(process, task)?;
    let main_exe = modules.first().cloned();
    let chosen = select_runtime_module(&modules, main_exe.as_ref())
        .ok_or(LocateError::RuntimeModuleNotFound { pid })?;

    let (raw, text_vmaddr) = parse_symtab(&chosen.path)?;
    // Mach-O symbol values are already file/vmaddr-relative to __TEXT;
    // the runtime load base must be adjusted by the same segment's
    // link-time address to get a true slide.
    let slide = chosen.load_base.wrapping_sub(text_vmaddr);
    resolve_globals(process, raw, slide)
}
