//! Plain-data mirrors of the R interpreter's internal ABI.
//!
//! Extracted from R's `Rinternals.h` and `Defn.h`. These types describe the
//! on-the-wire layout of structures living in a *different* process's
//! address space; we never construct or drop real instances of them, only
//! read raw bytes into `#[repr(C)]` copies. All pointer fields are
//! `RemotePtr<T>`, i.e. plain integers that happen to be addresses in the
//! tracee, never dereferenced locally.
//!
//! The context chain and heap node layouts changed shape after R 3.4.4; the
//! `r344-compat` feature selects the pre-3.4.4 layout. Mixing the two within
//! one build is not supported (see DESIGN.md).

use crate::memory::RemotePtr;

/// `SEXPTYPE` tag for a symbol (`SYMSXP`).
pub const SYMSXP: u8 = 1;
/// `SEXPTYPE` tag for a language object (`LANGSXP`).
pub const LANGSXP: u8 = 6;

/// The context "type" sentinel marking the outermost, top-level context.
pub const CTXT_TOPLEVEL: i32 = 0;
pub const CTXT_FUNCTION: i32 = 4;
pub const CTXT_CCODE: i32 = 8;
pub const CTXT_BUILTIN: i32 = 64;

bitflags::bitflags! {
    /// `RCNTXT::callflag`. Only the bits the cursor inspects are named;
    /// the remaining values (`CTXT_NEXT`, `CTXT_BREAK`, ...) are part of R's
    /// ABI but never tested by the name decoder.
    pub struct CallFlag: i32 {
        const TOPLEVEL = CTXT_TOPLEVEL;
        const FUNCTION = CTXT_FUNCTION;
        const CCODE    = CTXT_CCODE;
        const BUILTIN  = CTXT_BUILTIN;
    }
}

impl CallFlag {
    pub fn is_toplevel(self) -> bool {
        self.bits() == CTXT_TOPLEVEL
    }

    /// True for the context kinds whose `call` field names an invoked
    /// function (closures, builtins, and C-level special/primitive calls).
    pub fn names_a_call(self) -> bool {
        self.intersects(CallFlag::FUNCTION | CallFlag::BUILTIN | CallFlag::CCODE)
    }
}

/// Mirror of R's `RCNTXT`. Only the three fields the core consumes are
/// given real types; the rest of the real structure (jump buffers, GC
/// bookkeeping, on.exit handlers, ...) is represented as opaque padding so
/// that `size_of::<Context>()` matches the tracee's layout and `nextcontext`
/// lands at the right offset after a read.
#[cfg(not(feature = "r344-compat"))]
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct Context {
    pub nextcontext: RemotePtr<Context>,
    pub callflag: i32,
    _pad0: u32,
    _cjmpbuf: [u8; 200],
    pub cstacktop: i32,
    pub evaldepth: i32,
    _promargs: u64,
    _callfun: u64,
    _sysparent: u64,
    pub call: RemotePtr<HeapNode>,
    _cloenv: u64,
    _conexit: u64,
    _cend: u64,
    _cenddata: u64,
    _vmax: u64,
    _intsusp: i32,
    _gcenabled: i32,
    _bcintactive: i32,
    _pad1: i32,
    _bcbody: u64,
    _bcpc: u64,
    _handlerstack: u64,
    _restartstack: u64,
    _prstack: u64,
    _nodestack: u64,
    _srcref: u64,
    _browserfinish: i32,
    _pad2: i32,
    _return_value: u64,
    _jumptarget: u64,
    _jumpmask: i32,
    _pad3: i32,
}

#[cfg(feature = "r344-compat")]
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct Context {
    pub nextcontext: RemotePtr<Context>,
    pub callflag: i32,
    _cjmpbuf: [u8; 200],
    pub cstacktop: i32,
    pub evaldepth: i32,
    _promargs: u32,
    _callfun: u32,
    _sysparent: u32,
    pub call: RemotePtr<HeapNode>,
    _cloenv: u32,
    _conexit: u32,
    _cend: u32,
    _cenddata: u32,
    _vmax: u32,
    _intsusp: i32,
    _gcenabled: i32,
    _bcintactive: i32,
    _bcbody: u32,
    _bcpc: u32,
    _handlerstack: u32,
    _restartstack: u32,
    _prstack: u32,
    _nodestack: u32,
    _srcref: u32,
    _browserfinish: i32,
    _return_value: u32,
    _jumptarget: u32,
    _jumpmask: i32,
}

/// `sxpinfo_struct`, the 5-bit type tag shared by every heap node.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
struct SxpInfo {
    /// Bitfield: `type` occupies the low 5 bits; the rest is padding we
    /// don't interpret. Stored as a full word so the read is infallible.
    #[cfg(not(feature = "r344-compat"))]
    packed: u64,
    #[cfg(feature = "r344-compat")]
    packed: u32,
}

impl SxpInfo {
    fn type_tag(self) -> u8 {
        (self.packed & 0x1f) as u8
    }
}

/// A union big enough for either `symsxp_struct` or `listsxp_struct`, the
/// only two node shapes this profiler ever reads.
#[repr(C)]
#[derive(Copy, Clone)]
union NodeUnion {
    sym: SymSxp,
    list: ListSxp,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct SymSxp {
    pname: RemotePtr<HeapNode>,
    _value: u64,
    _internal: u64,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct ListSxp {
    carval: RemotePtr<HeapNode>,
    cdrval: RemotePtr<HeapNode>,
    _tagval: u64,
}

/// Mirror of R's generic tagged heap object (`SEXPREC`). Vector payloads
/// (character data) are read separately via [`crate::memory::read_cstring`],
/// which re-derives the data pointer from the node's own address rather
/// than reading it through this struct.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct HeapNode {
    info: SxpInfo,
    _attrib: u64,
    _gengc_next: u64,
    _gengc_prev: u64,
    u: NodeUnion,
}

impl HeapNode {
    pub fn type_tag(&self) -> u8 {
        self.info.type_tag()
    }

    pub fn is_symbol(&self) -> bool {
        self.type_tag() == SYMSXP
    }

    pub fn is_lang(&self) -> bool {
        self.type_tag() == LANGSXP
    }

    /// `PRINTNAME(x)`. Only meaningful when `type_tag() == SYMSXP`.
    pub fn print_name(&self) -> RemotePtr<HeapNode> {
        unsafe { self.u.sym.pname }
    }

    /// `CAR(x)`. Only meaningful when `type_tag() == LANGSXP`.
    pub fn car(&self) -> RemotePtr<HeapNode> {
        unsafe { self.u.list.carval }
    }

    /// `CDR(x)`. Only meaningful when `type_tag() == LANGSXP`.
    pub fn cdr(&self) -> RemotePtr<HeapNode> {
        unsafe { self.u.list.cdrval }
    }
}

/// The header portion of a `VECTOR_SEXPREC` (`vecsxp_struct`), i.e.
/// everything before the raw character payload. `STDVEC_DATAPTR` in the
/// original computes the payload address as this header's own address plus
/// `size_of::<VectorHeader>()`.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct VectorHeader {
    info: SxpInfo,
    _attrib: u64,
    _gengc_next: u64,
    _gengc_prev: u64,
    #[cfg(not(feature = "r344-compat"))]
    pub length: isize,
    #[cfg(not(feature = "r344-compat"))]
    _truelength: isize,
    #[cfg(feature = "r344-compat")]
    pub length: i32,
    #[cfg(feature = "r344-compat")]
    _truelength: i32,
}

/// Byte-exact constructors for the handful of mock stack graphs the
/// cursor's unit tests need. Lives here (rather than alongside the
/// tests that use it) because it is the only place with access to the
/// private fields of these ABI mirrors; restricted to the default,
/// non-`r344-compat` layout, which is what the test suite exercises.
#[cfg(all(test, not(feature = "r344-compat")))]
pub(crate) mod test_support {
    use super::*;

    pub fn context_bytes(nextcontext: u64, callflag: i32, call: u64) -> Vec<u8> {
        let ctx = Context {
            nextcontext: RemotePtr::new(nextcontext),
            callflag,
            _pad0: 0,
            _cjmpbuf: [0; 200],
            cstacktop: 0,
            evaldepth: 0,
            _promargs: 0,
            _callfun: 0,
            _sysparent: 0,
            call: RemotePtr::new(call),
            _cloenv: 0,
            _conexit: 0,
            _cend: 0,
            _cenddata: 0,
            _vmax: 0,
            _intsusp: 0,
            _gcenabled: 0,
            _bcintactive: 0,
            _pad1: 0,
            _bcbody: 0,
            _bcpc: 0,
            _handlerstack: 0,
            _restartstack: 0,
            _prstack: 0,
            _nodestack: 0,
            _srcref: 0,
            _browserfinish: 0,
            _pad2: 0,
            _return_value: 0,
            _jumptarget: 0,
            _jumpmask: 0,
            _pad3: 0,
        };
        struct_bytes(&ctx)
    }

    pub fn symbol_node_bytes(pname: u64) -> Vec<u8> {
        let node = HeapNode {
            info: SxpInfo {
                packed: SYMSXP as u64,
            },
            _attrib: 0,
            _gengc_next: 0,
            _gengc_prev: 0,
            u: NodeUnion {
                sym: SymSxp {
                    pname: RemotePtr::new(pname),
                    _value: 0,
                    _internal: 0,
                },
            },
        };
        struct_bytes(&node)
    }

    pub fn lang_node_bytes(car: u64, cdr: u64) -> Vec<u8> {
        let node = HeapNode {
            info: SxpInfo {
                packed: LANGSXP as u64,
            },
            _attrib: 0,
            _gengc_next: 0,
            _gengc_prev: 0,
            u: NodeUnion {
                list: ListSxp {
                    carval: RemotePtr::new(car),
                    cdrval: RemotePtr::new(cdr),
                    _tagval: 0,
                },
            },
        };
        struct_bytes(&node)
    }

    /// A heap node that is neither a symbol nor a language object (used to
    /// model anonymous closures in `<Anonymous>` decoding tests).
    pub fn opaque_node_bytes(type_tag: u8) -> Vec<u8> {
        let node = HeapNode {
            info: SxpInfo {
                packed: type_tag as u64,
            },
            _attrib: 0,
            _gengc_next: 0,
            _gengc_prev: 0,
            u: NodeUnion {
                list: ListSxp {
                    carval: RemotePtr::null(),
                    cdrval: RemotePtr::null(),
                    _tagval: 0,
                },
            },
        };
        struct_bytes(&node)
    }

    pub fn vector_header_bytes(length: isize) -> Vec<u8> {
        let header = VectorHeader {
            info: SxpInfo { packed: 0 },
            _attrib: 0,
            _gengc_next: 0,
            _gengc_prev: 0,
            length,
            _truelength: 0,
        };
        struct_bytes(&header)
    }

    fn struct_bytes<T: Copy>(value: &T) -> Vec<u8> {
        let len = std::mem::size_of::<T>();
        let ptr = value as *const T as *const u8;
        unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_call_offset_matches_nextcontext_and_callflag_width() {
        assert_eq!(std::mem::size_of::<RemotePtr<Context>>(), 8);
        // `call` must come after `nextcontext`, `callflag`, and the jump
        // buffer/bookkeeping fields; we only assert it is non-zero so a
        // future layout edit trips this test rather than silently shifting
        // offsets.
        let offset = memoffset_of_call();
        assert!(offset > 16);
    }

    fn memoffset_of_call() -> usize {
        let base = std::mem::MaybeUninit::<Context>::uninit();
        let base_ptr = base.as_ptr();
        unsafe {
            let call_ptr = std::ptr::addr_of!((*base_ptr).call);
            (call_ptr as usize) - (base_ptr as usize)
        }
    }

    #[test]
    fn sxp_info_extracts_low_five_bits() {
        let info = SxpInfo { packed: 0b1_0110 };
        assert_eq!(info.type_tag(), 0b10110);
    }
}
