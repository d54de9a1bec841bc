use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use goblin::elf::Elf;

use crate::error::LocateError;
use crate::process::Process;

use super::{resolve_globals, select_runtime_module, Globals, LoadedModule, RawSymbols};

/// Parses `/proc/<pid>/maps` for the set of distinct loaded object paths
/// and their lowest mapped address, which on Linux doubles as the ELF
/// load base for a non-PIE-relative symbol computation. Mirrors
/// `original_source/src/locate.c`'s `find_libR`, generalized to every
/// mapped object rather than just `libR.so` so that the statically-linked
/// fallback (the main executable) is discovered the same way.
fn read_loaded_modules(pid: i32, fs_root: Option<&Path>) -> Result<Vec<LoadedModule>, LocateError> {
    let maps_path = format!("/proc/{}/maps", pid);
    let contents = fs::read_to_string(&maps_path)?;

    let mut modules: Vec<LoadedModule> = Vec::new();
    for line in contents.lines() {
        // Format: "<start>-<end> perms offset dev inode path"
        let mut fields = line.split_whitespace();
        let range = match fields.next() {
            Some(r) => r,
            None => continue,
        };
        let path_field = match fields.last() {
            Some(p) if p.starts_with('/') => p,
            _ => continue,
        };
        let start = match range.split('-').next().and_then(|s| u64::from_str_radix(s, 16).ok())
        {
            Some(s) => s,
            None => continue,
        };

        if modules.iter().any(|m| m.path == Path::new(path_field)) {
            continue;
        }

        let opened_path = match fs_root {
            Some(root) => root.join(path_field.trim_start_matches('/')),
            None => PathBuf::from(path_field),
        };

        modules.push(LoadedModule {
            path: opened_path,
            load_base: start,
        });
    }

    if modules.is_empty() {
        return Err(LocateError::NoModules { pid });
    }
    Ok(modules)
}

fn parse_dynsym(path: &Path) -> Result<RawSymbols, LocateError> {
    let mut file = fs::File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let elf = Elf::parse(&buf).map_err(|e| LocateError::InvalidObject {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    if elf.dynsyms.is_empty() && elf.syms.is_empty() {
        return Err(LocateError::NoSymbolTable {
            path: path.display().to_string(),
        });
    }

    let mut raw = RawSymbols::empty();
    let strtab = &elf.dynstrtab;
    for sym in elf.dynsyms.iter() {
        if let Some(name) = strtab.get_at(sym.st_name) {
            raw.record(name, sym.st_value);
        }
    }
    // Statically-linked interpreters keep the symbols we need in the
    // regular (non-dynamic) symbol table instead.
    let strtab = &elf.strtab;
    for sym in elf.syms.iter() {
        if let Some(name) = strtab.get_at(sym.st_name) {
            raw.record(name, sym.st_value);
        }
    }

    Ok(raw)
}

pub(crate) fn locate<P: Process>(process: &P) -> Result<Globals, LocateError> {
    let pid = process.pid();
    let fs_root = process.filesystem_root();
    let modules = read_loaded_modules(pid, fs_root.as_deref())?;

    let main_exe = Some(LoadedModule {
        path: PathBuf::from(format!("/proc/{}/exe", pid)),
        load_base: modules.first().map(|m| m.load_base).unwrap_or(0),
    })
    .or_else(|| modules.first().cloned());

    let chosen = select_runtime_module(&modules, main_exe.as_ref())
        .ok_or(LocateError::RuntimeModuleNotFound { pid })?;

    let raw = parse_dynsym(&chosen.path)?;
    resolve_globals(process, raw, chosen.load_base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_anonymous_mappings_without_a_backing_path() {
        // `read_loaded_modules` only records lines whose last whitespace
        // field starts with '/'; anonymous/heap/stack mappings are
        // naturally excluded by that filter, exercised indirectly via the
        // parsing logic rather than a real /proc file in this sandbox.
        let line = "7f000000-7f001000 rw-p 00000000 00:00 0 ";
        let mut fields = line.split_whitespace();
        fields.next();
        let path_field = fields.last();
        assert!(path_field.map_or(true, |p| !p.starts_with('/')));
    }
}
