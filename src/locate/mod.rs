//! Symbol locator: resolves the interpreter's global symbols in a foreign
//! process to remote addresses, reading the tracee's on-disk module image
//! rather than anything loaded in its own address space.

use crate::error::LocateError;
use crate::memory::{MemoryReader, RemoteConst};
use crate::process::Process;
use crate::rdefs::{Context, HeapNode};
use crate::memory::RemotePtr;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "windows")]
mod windows;

/// Substrings used to pick out the interpreter runtime module from a
/// process's loaded-module list, per platform.
pub const RUNTIME_MODULE_HINTS: &[&str] = &["libR.so", "libR.dylib", "R.dll"];

const SYM_CONTEXT_ADDR: &str = "R_GlobalContext";
const SYM_DOUBLECOLON: &str = "R_DoubleColonSymbol";
const SYM_TRIPLECOLON: &str = "R_TripleColonSymbol";
const SYM_DOLLAR: &str = "R_DollarSymbol";
const SYM_BRACKET: &str = "R_BracketSymbol";

/// The five resolved globals the rest of the crate depends on. Immutable
/// after construction and freely shared by reference for the life of a
/// sampler session.
#[derive(Debug, Clone, Copy)]
pub struct Globals {
    /// Address of the `R_GlobalContext` variable itself (its *value*
    /// changes every time the interpreter enters or leaves a context, so
    /// only the address is captured at locate time).
    pub context_addr: RemotePtr<RemotePtr<Context>>,
    pub doublecolon: RemoteConst,
    pub triplecolon: RemoteConst,
    pub dollar: RemoteConst,
    pub bracket: RemoteConst,
}

/// One resolved symbol: its value as found in the on-disk symbol table,
/// not yet relocated by the module's runtime load base.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawSymbols {
    pub context_addr: Option<u64>,
    pub doublecolon: Option<u64>,
    pub triplecolon: Option<u64>,
    pub dollar: Option<u64>,
    pub bracket: Option<u64>,
}

impl RawSymbols {
    fn empty() -> Self {
        RawSymbols {
            context_addr: None,
            doublecolon: None,
            triplecolon: None,
            dollar: None,
            bracket: None,
        }
    }

    /// Records a symbol table entry if its name matches one of the five we
    /// care about. Mirrors `locate.c`'s `strncmp` cascade.
    fn record(&mut self, name: &str, value: u64) {
        match name {
            SYM_CONTEXT_ADDR => self.context_addr.get_or_insert(value),
            SYM_DOUBLECOLON => self.doublecolon.get_or_insert(value),
            SYM_TRIPLECOLON => self.triplecolon.get_or_insert(value),
            SYM_DOLLAR => self.dollar.get_or_insert(value),
            SYM_BRACKET => self.bracket.get_or_insert(value),
            _ => return,
        };
    }
}

/// A loaded module as seen in the tracee's own process listing: a path
/// (already adjusted for the tracee's filesystem view, if applicable) and
/// the remote virtual address at which it was loaded.
#[derive(Debug, Clone)]
pub(crate) struct LoadedModule {
    pub path: std::path::PathBuf,
    pub load_base: u64,
}

/// Picks the module that implements the interpreter runtime, falling back
/// to the main executable for statically-linked interpreters (the
/// `/proc/<pid>/exe` fallback in `original_source/src/locate.c`).
pub(crate) fn select_runtime_module<'a>(
    modules: &'a [LoadedModule],
    main_executable: Option<&'a LoadedModule>,
) -> Option<&'a LoadedModule> {
    modules
        .iter()
        .find(|m| {
            let name = m.path.to_string_lossy();
            RUNTIME_MODULE_HINTS.iter().any(|hint| name.contains(hint))
        })
        .or(main_executable)
}

/// Turns a fully-populated [`RawSymbols`] (relocated by `load_base` and,
/// for the four constants, read once from the tracee's memory) into
/// [`Globals`], or a single [`LocateError::MissingSymbol`] naming whichever
/// field came back empty. Partial resolution is never useful.
pub(crate) fn resolve_globals<P: Process>(
    process: &P,
    raw: RawSymbols,
    load_base: u64,
) -> Result<Globals, LocateError> {
    let context_addr = raw
        .context_addr
        .map(|v| load_base + v)
        .ok_or(LocateError::MissingSymbol {
            symbol: SYM_CONTEXT_ADDR,
        })?;

    let read_const = |offset: Option<u64>, symbol: &'static str| -> Result<RemoteConst, LocateError> {
        let addr = offset
            .map(|v| load_base + v)
            .ok_or(LocateError::MissingSymbol { symbol })?;
        let value: u64 = {
            let mut buf = [0u8; 8];
            let got = process.read_bytes(addr, &mut buf)?;
            if got < 8 {
                return Err(LocateError::Memory(crate::error::MemoryError::ShortRead {
                    addr,
                    expected: 8,
                    got,
                }));
            }
            u64::from_ne_bytes(buf)
        };
        if value == 0 {
            return Err(LocateError::MissingSymbol { symbol });
        }
        Ok(RemotePtr::new(value))
    };

    Ok(Globals {
        context_addr: RemotePtr::new(context_addr),
        doublecolon: read_const(raw.doublecolon, SYM_DOUBLECOLON)?,
        triplecolon: read_const(raw.triplecolon, SYM_TRIPLECOLON)?,
        dollar: read_const(raw.dollar, SYM_DOLLAR)?,
        bracket: read_const(raw.bracket, SYM_BRACKET)?,
    })
}

/// Locate all five globals in `process`, with the tracee suspended for the
/// duration: called once per session with the tracee suspended.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn locate<P: Process>(process: &P) -> Result<Globals, LocateError> {
    linux::locate(process)
}

#[cfg(target_os = "macos")]
pub fn locate<P: Process>(process: &P) -> Result<Globals, LocateError> {
    macos::locate(process)
}

#[cfg(target_os = "windows")]
pub fn locate<P: Process>(process: &P) -> Result<Globals, LocateError> {
    windows::locate(process)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(path: &str) -> LoadedModule {
        LoadedModule {
            path: path.into(),
            load_base: 0,
        }
    }

    #[test]
    fn prefers_runtime_module_over_main_executable() {
        let modules = vec![module("/lib/libc.so.6"), module("/usr/lib/R/lib/libR.so")];
        let exe = module("/usr/lib/R/bin/exec/R");
        let chosen = select_runtime_module(&modules, Some(&exe)).unwrap();
        assert!(chosen.path.to_string_lossy().contains("libR.so"));
    }

    #[test]
    fn falls_back_to_main_executable_for_statically_linked_interpreters() {
        let modules = vec![module("/lib/libc.so.6")];
        let exe = module("/proc/123/exe");
        let chosen = select_runtime_module(&modules, Some(&exe)).unwrap();
        assert_eq!(chosen.path, std::path::PathBuf::from("/proc/123/exe"));
    }

    #[test]
    fn no_candidate_is_a_locate_error_not_a_panic() {
        let modules = vec![module("/lib/libc.so.6")];
        assert!(select_runtime_module(&modules, None).is_none());
    }

    #[test]
    fn partial_symbol_resolution_fails_the_whole_locate() {
        let mut raw = RawSymbols::empty();
        raw.record(SYM_CONTEXT_ADDR, 0x1000);
        raw.record(SYM_DOUBLECOLON, 0x2000);
        // triplecolon/dollar/bracket left unresolved.
        assert!(raw.triplecolon.is_none());
        assert!(raw.dollar.is_none());
        assert!(raw.bracket.is_none());
    }
}
