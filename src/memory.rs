//! Typed reads of fixed-size structs and length-prefixed character vectors
//! from a remote address space.
//!
//! [`MemoryReader::read_bytes`] is the single unsafe boundary: it copies
//! raw bytes across the process boundary and never writes to the tracee.
//! Everything layered on top (`read_context`, `read_heap_node`,
//! `read_cstring`) traffics only in typed, locally-owned values.

use std::fmt;
use std::marker::PhantomData;

use crate::error::MemoryError;
use crate::process::Process;
use crate::rdefs::{Context, HeapNode, VectorHeader};

/// An address in the tracee's address space. Never dereferenced locally;
/// carried around purely as an opaque, pointer-sized token so that
/// pointer-equality comparisons (the `doublecolon`/`triplecolon`/`dollar`
/// checks) stay honest integer comparisons.
#[repr(transparent)]
pub struct RemotePtr<T> {
    addr: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RemotePtr<T> {
    pub const fn null() -> Self {
        RemotePtr {
            addr: 0,
            _marker: PhantomData,
        }
    }

    pub const fn new(addr: u64) -> Self {
        RemotePtr {
            addr,
            _marker: PhantomData,
        }
    }

    pub fn addr(self) -> u64 {
        self.addr
    }

    pub fn is_null(self) -> bool {
        self.addr == 0
    }

    /// Reinterpret this address as pointing at a different type. Used when
    /// decoding heap nodes, where the same remote address is read first as
    /// a generic [`HeapNode`] and its data pointer is then derived
    /// relative to that same address.
    pub fn cast<U>(self) -> RemotePtr<U> {
        RemotePtr::new(self.addr)
    }
}

// Manual impls: `#[derive(Copy, Clone, ...)]` would require `T: Copy` etc,
// but `RemotePtr<T>` never stores a `T`.
impl<T> Copy for RemotePtr<T> {}
impl<T> Clone for RemotePtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> PartialEq for RemotePtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}
impl<T> Eq for RemotePtr<T> {}
impl<T> fmt::Debug for RemotePtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemotePtr({:#x})", self.addr)
    }
}

/// A captured pointer-sized value, used for the four symbol-identity
/// constants in [`crate::locate::Globals`]. Deliberately untyped: the
/// cursor compares these as opaque tokens, never as dereferenced values.
pub type RemoteConst = RemotePtr<HeapNode>;

const MAX_CSTRING_LEN: usize = 256;

/// Platform-agnostic typed reads layered on top of [`Process::read_bytes`].
pub trait MemoryReader {
    /// Copy exactly `buf.len()` bytes from `addr` in the tracee into `buf`.
    /// Returns the number of bytes actually transferred; a short read
    /// (including 0) is not itself an error here, but every typed helper
    /// below treats anything short of a full read as [`MemoryError::ShortRead`].
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<usize, MemoryError>;

    fn read_context(&self, addr: RemotePtr<Context>) -> Result<Context, MemoryError> {
        read_struct(self, addr)
    }

    fn read_heap_node(&self, addr: RemotePtr<HeapNode>) -> Result<HeapNode, MemoryError> {
        read_struct(self, addr)
    }

    /// Reads a length-prefixed R character vector (the print-name of a
    /// symbol, for instance) in two passes: first the vector header to
    /// learn the payload length, then the payload itself. Caps at
    /// `MAX_CSTRING_LEN - 1` bytes and always null-terminates the result.
    fn read_cstring(&self, addr: RemotePtr<VectorHeader>) -> Result<String, MemoryError> {
        if addr.is_null() {
            return Err(MemoryError::NullAddress);
        }
        let header = read_struct(self, addr)?;
        let len = header.length.max(0) as usize;
        let capped = len.min(MAX_CSTRING_LEN - 1);

        let data_addr = addr.addr() + std::mem::size_of::<VectorHeader>() as u64;
        let mut buf = vec![0u8; capped];
        if capped > 0 {
            let got = self.read_bytes(data_addr, &mut buf)?;
            if got < capped {
                return Err(MemoryError::ShortRead {
                    addr: data_addr,
                    expected: capped,
                    got,
                });
            }
        }
        // The payload is not itself null-terminated in the tracee; the
        // profiler supplies its own terminator locally.
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

fn read_struct<R, T, M>(reader: &R, addr: RemotePtr<T>) -> Result<M, MemoryError>
where
    R: MemoryReader + ?Sized,
{
    if addr.is_null() {
        return Err(MemoryError::NullAddress);
    }
    let len = std::mem::size_of::<M>();
    let mut buf = vec![0u8; len];
    let got = reader.read_bytes(addr.addr(), &mut buf)?;
    if got < len {
        return Err(MemoryError::ShortRead {
            addr: addr.addr(),
            expected: len,
            got,
        });
    }
    // SAFETY: `M` is one of our `#[repr(C)]` ABI mirrors, `buf` holds
    // exactly `size_of::<M>()` bytes read from the tracee, and both types
    // involved (`Context`, `HeapNode`) are plain data with no padding
    // invariants beyond what `#[repr(C)]` already guarantees.
    let value = unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const M) };
    Ok(value)
}

/// Blanket impl so any [`Process`] handle is directly usable as a
/// [`MemoryReader`] without a separate reader type; the process owns the
/// platform-specific read primitive.
impl<P: Process + ?Sized> MemoryReader for P {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<usize, MemoryError> {
        Process::read_bytes(self, addr, buf)
    }
}

/// Shared mock-tracee infrastructure for this crate's unit tests: a flat
/// in-process byte buffer standing in for a remote address space, plus
/// pre-built stack graphs for [`crate::cursor::StackCursor`]'s tests.
/// Built against the default (non-`r344-compat`) ABI layout, since that is
/// the layout the test suite exercises; see DESIGN.md.
#[cfg(all(test, not(feature = "r344-compat")))]
pub(crate) mod tests_support {
    use super::*;
    use crate::locate::Globals;
    use crate::rdefs::test_support::*;
    use std::cell::RefCell;

    /// An in-process stand-in for a tracee's address space: a flat byte
    /// buffer, with remote addresses mapping directly to buffer offsets.
    /// Used by every unit test in this crate that needs a `MemoryReader`
    /// without an actual ptraced child (which unit tests should not
    /// require, cf. SPEC_FULL.md's ambient test-tooling section).
    pub struct FakeTracee {
        bytes: RefCell<Vec<u8>>,
    }

    impl FakeTracee {
        pub fn new(size: usize) -> Self {
            FakeTracee {
                bytes: RefCell::new(vec![0u8; size]),
            }
        }

        pub fn write_at<T: Copy>(&self, addr: u64, value: &T) {
            let len = std::mem::size_of::<T>();
            let src =
                unsafe { std::slice::from_raw_parts(value as *const T as *const u8, len) };
            let mut bytes = self.bytes.borrow_mut();
            let start = addr as usize;
            bytes[start..start + len].copy_from_slice(src);
        }

        pub fn write_bytes_at(&self, addr: u64, data: &[u8]) {
            let mut bytes = self.bytes.borrow_mut();
            let start = addr as usize;
            bytes[start..start + data.len()].copy_from_slice(data);
        }
    }

    impl MemoryReader for FakeTracee {
        fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<usize, MemoryError> {
            let bytes = self.bytes.borrow();
            let start = addr as usize;
            if start >= bytes.len() {
                return Ok(0);
            }
            let avail = (bytes.len() - start).min(buf.len());
            buf[..avail].copy_from_slice(&bytes[start..start + avail]);
            Ok(avail)
        }
    }

    const ARENA_SIZE: usize = 1 << 20;
    const SLOT_SIZE: u64 = 0x200;
    const SLOT_BASE: u64 = 0x10000;
    const CONTEXT_VAR_ADDR: u64 = 0x8;

    /// Allocates fixed-size, non-overlapping slots out of a [`FakeTracee`]
    /// arena and writes the handful of heap-node / context graphs the
    /// cursor tests exercise. Every slot is far larger than any single
    /// `Context`/`HeapNode`/`VectorHeader`, so objects never collide.
    struct Builder {
        tracee: FakeTracee,
        next_slot: u64,
    }

    impl Builder {
        fn new() -> Self {
            Builder {
                tracee: FakeTracee::new(ARENA_SIZE),
                next_slot: 0,
            }
        }

        fn alloc(&mut self) -> u64 {
            let addr = SLOT_BASE + self.next_slot * SLOT_SIZE;
            self.next_slot += 1;
            addr
        }

        fn put(&mut self, bytes: &[u8]) -> u64 {
            let addr = self.alloc();
            self.tracee.write_bytes_at(addr, bytes);
            addr
        }

        /// Builds a symbol node whose print-name is `name`, returning the
        /// symbol node's address.
        fn symbol(&mut self, name: &str) -> u64 {
            let vh_addr = self.alloc();
            self.tracee
                .write_bytes_at(vh_addr, &vector_header_bytes(name.len() as isize));
            let data_addr = vh_addr + std::mem::size_of::<VectorHeader>() as u64;
            self.tracee.write_bytes_at(data_addr, name.as_bytes());
            self.put(&symbol_node_bytes(vh_addr))
        }

        /// Builds the `lhs SEP rhs` call-head graph (`fun` node) that
        /// `decode_infix` walks, rooted at an outer `call` LANGSXP node.
        /// `operator` is the opaque pointer value compared against one of
        /// `Globals`' identity constants.
        fn infix_call(&mut self, lhs: &str, rhs: &str, operator: u64) -> u64 {
            let lhs_addr = self.symbol(lhs);
            let rhs_addr = self.symbol(rhs);
            let cdr2 = self.put(&lang_node_bytes(rhs_addr, 0));
            let cdr1 = self.put(&lang_node_bytes(lhs_addr, cdr2));
            let fun = self.put(&lang_node_bytes(operator, cdr1));
            self.put(&lang_node_bytes(fun, 0))
        }

        /// Writes a context record and returns its address.
        fn context(&mut self, nextcontext: u64, callflag: i32, call: u64) -> u64 {
            self.put(&context_bytes(nextcontext, callflag, call))
        }

        fn set_top_context(&mut self, addr: u64) {
            self.tracee.write_at(CONTEXT_VAR_ADDR, &addr);
        }

        fn globals(&self) -> Globals {
            Globals {
                context_addr: RemotePtr::new(CONTEXT_VAR_ADDR),
                doublecolon: RemotePtr::new(0xd0),
                triplecolon: RemotePtr::new(0xd1),
                dollar: RemotePtr::new(0xd2),
                bracket: RemotePtr::new(0xd3),
            }
        }

        fn finish(self) -> MockTracee {
            let globals = self.globals();
            MockTracee {
                reader: self.tracee,
                globals,
            }
        }
    }

    pub struct MockTracee {
        pub reader: FakeTracee,
        pub globals: Globals,
    }

    impl MockTracee {
        /// A single top-level context: the cursor should emit one
        /// `TopLevel` frame and then terminate.
        pub fn toplevel_only() -> Self {
            let mut b = Builder::new();
            let top = b.context(0, crate::rdefs::CTXT_TOPLEVEL, 0);
            b.set_top_context(top);
            b.finish()
        }

        /// Builds a context chain from `names[0]` (innermost, current
        /// frame) down to `names[len-1]`, terminated by a top-level
        /// context. Each frame's `call` is a plain symbol call.
        pub fn nested_calls(names: &[&str]) -> Self {
            let mut b = Builder::new();
            let top = b.context(0, crate::rdefs::CTXT_TOPLEVEL, 0);
            let mut next = top;
            for name in names.iter().rev() {
                let sym = b.symbol(name);
                let call = b.put(&lang_node_bytes(sym, 0));
                next = b.context(next, crate::rdefs::CTXT_FUNCTION, call);
            }
            b.set_top_context(next);
            b.finish()
        }

        /// A single frame whose call head is an `a SEP b` infix operator
        /// call (`::`, `:::`, or `$`), resolved against the matching
        /// identity constant in `globals()`.
        pub fn infix_call(lhs: &str, rhs: &str, sep: &str) -> Self {
            let mut b = Builder::new();
            let globals = b.globals();
            let operator = match sep {
                "::" => globals.doublecolon,
                ":::" => globals.triplecolon,
                "$" => globals.dollar,
                other => panic!("unsupported infix separator: {}", other),
            };
            let call = b.infix_call(lhs, rhs, operator.addr());
            let top = b.context(0, crate::rdefs::CTXT_TOPLEVEL, 0);
            let frame = b.context(top, crate::rdefs::CTXT_FUNCTION, call);
            b.set_top_context(frame);
            b.finish()
        }

        /// A frame whose call head is neither a symbol nor a language
        /// object (an anonymous closure invoked directly).
        pub fn anonymous_call() -> Self {
            let mut b = Builder::new();
            let closure = b.put(&opaque_node_bytes(3));
            let call = b.put(&lang_node_bytes(closure, 0));
            let top = b.context(0, crate::rdefs::CTXT_TOPLEVEL, 0);
            let frame = b.context(top, crate::rdefs::CTXT_FUNCTION, call);
            b.set_top_context(frame);
            b.finish()
        }

        /// Two contexts pointing at each other, neither top-level: the
        /// walk must hit the depth cap rather than loop forever.
        pub fn cyclic_chain() -> Self {
            let mut b = Builder::new();
            let a_addr = b.alloc();
            let b_addr = b.alloc();
            b.tracee
                .write_bytes_at(a_addr, &context_bytes(b_addr, crate::rdefs::CTXT_FUNCTION, 0));
            b.tracee
                .write_bytes_at(b_addr, &context_bytes(a_addr, crate::rdefs::CTXT_FUNCTION, 0));
            b.set_top_context(a_addr);
            b.finish()
        }
    }
}

#[cfg(all(test, not(feature = "r344-compat")))]
mod tests {
    use super::*;
    use tests_support::FakeTracee;

    #[test]
    fn null_address_is_rejected_before_any_read() {
        let tracee = FakeTracee::new(64);
        let err = tracee.read_context(RemotePtr::null()).unwrap_err();
        assert!(matches!(err, MemoryError::NullAddress));
    }

    #[test]
    fn short_read_is_surfaced_as_an_error() {
        let tracee = FakeTracee::new(4);
        let err = tracee
            .read_context(RemotePtr::new(0))
            .expect_err("4-byte tracee cannot satisfy a full Context read");
        assert!(matches!(err, MemoryError::ShortRead { .. }));
    }

    #[test]
    fn cstring_read_is_two_pass_and_null_terminated_locally() {
        let tracee = FakeTracee::new(4096);
        let header_addr = 0u64;
        let payload = b"foo";
        tracee.write_bytes_at(
            header_addr,
            &crate::rdefs::test_support::vector_header_bytes(payload.len() as isize),
        );
        let data_addr = header_addr + std::mem::size_of::<VectorHeader>() as u64;
        tracee.write_bytes_at(data_addr, payload);

        let s = tracee
            .read_cstring(RemotePtr::new(header_addr))
            .expect("cstring read should succeed");
        assert_eq!(s, "foo");
    }

    #[test]
    fn cstring_read_is_capped_well_under_the_buffer_limit() {
        let tracee = FakeTracee::new(8192);
        tracee.write_bytes_at(
            0,
            &crate::rdefs::test_support::vector_header_bytes((MAX_CSTRING_LEN * 4) as isize),
        );
        let data_addr = std::mem::size_of::<VectorHeader>() as u64;
        let big = vec![b'x'; MAX_CSTRING_LEN * 4];
        tracee.write_bytes_at(data_addr, &big);

        let s = tracee.read_cstring(RemotePtr::new(0)).unwrap();
        assert!(s.len() <= MAX_CSTRING_LEN - 1);
    }
}
