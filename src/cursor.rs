//! Interpreter-stack cursor: an iterator over the interpreter's linked
//! call-context chain, with per-frame function-name decoding.

use crate::error::CursorError;
use crate::locate::Globals;
use crate::memory::{MemoryReader, RemotePtr};
use crate::rdefs::{CallFlag, Context, HeapNode, VectorHeader, SYMSXP};

/// Hard cap on walk depth: a cycle in a corrupted or mid-mutation context
/// chain must not hang the sampler.
pub const MAX_STACK_DEPTH: usize = 1024;

const MAX_SYM_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    AtFrame,
    Terminal,
}

/// Transient per-walk state: current context pointer, depth counter, and
/// the most recently read context record. Borrows the globals record and
/// a memory reader for the duration of the walk.
pub struct StackCursor<'a, R: MemoryReader> {
    reader: &'a R,
    globals: &'a Globals,
    state: State,
    current_addr: RemotePtr<Context>,
    current: Option<Context>,
    depth: usize,
}

/// Result of [`StackCursor::step`]: either the new depth, or that the walk
/// has reached top-level and terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Frame(usize),
    Terminal,
}

/// The decoded name for one frame, or the top-level sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameName {
    TopLevel,
    Name(String),
}

impl<'a, R: MemoryReader> StackCursor<'a, R> {
    /// `create`: allocates cursor state without reading the tracee stack.
    pub fn new(reader: &'a R, globals: &'a Globals) -> Self {
        StackCursor {
            reader,
            globals,
            state: State::Uninitialized,
            current_addr: RemotePtr::null(),
            current: None,
            depth: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// `init`: reads the current top-of-stack context pointer from
    /// `globals.context_addr`, then the context record it points to.
    /// Resets depth to zero.
    pub fn init(&mut self) -> Result<(), CursorError> {
        let mut buf = [0u8; 8];
        let addr = self.globals.context_addr.addr();
        let got = self.reader.read_bytes(addr, &mut buf)?;
        if got < 8 {
            return Err(crate::error::MemoryError::ShortRead {
                addr,
                expected: 8,
                got,
            }
            .into());
        }
        let top = u64::from_ne_bytes(buf);
        let top_ptr: RemotePtr<Context> = RemotePtr::new(top);
        if top_ptr.is_null() {
            return Err(crate::error::MemoryError::NullAddress.into());
        }

        let ctx = self.reader.read_context(top_ptr)?;
        self.current_addr = top_ptr;
        self.current = Some(ctx);
        self.depth = 0;
        self.state = State::AtFrame;
        Ok(())
    }

    fn current(&self) -> Result<&Context, CursorError> {
        match (&self.state, &self.current) {
            (State::AtFrame, Some(ctx)) => Ok(ctx),
            _ => Err(CursorError::Uninitialized),
        }
    }

    fn callflag(&self) -> Result<CallFlag, CursorError> {
        Ok(CallFlag::from_bits_truncate(self.current()?.callflag))
    }

    /// `step`: follows `nextcontext` unless the current frame is
    /// top-level, in which case the cursor enters [`State::Terminal`].
    pub fn step(&mut self) -> Result<StepOutcome, CursorError> {
        if self.callflag()?.is_toplevel() {
            self.state = State::Terminal;
            return Ok(StepOutcome::Terminal);
        }
        if self.depth >= MAX_STACK_DEPTH {
            return Err(CursorError::DepthExceeded {
                max: MAX_STACK_DEPTH,
            });
        }

        let next_addr = self.current()?.nextcontext;
        let ctx = self.reader.read_context(next_addr)?;
        self.current_addr = next_addr;
        self.current = Some(ctx);
        self.depth += 1;
        Ok(StepOutcome::Frame(self.depth))
    }

    /// `frame_name`: decodes the printable function name for the current
    /// frame without mutating cursor state.
    pub fn frame_name(&self) -> Result<FrameName, CursorError> {
        let ctx = self.current()?;
        let flag = CallFlag::from_bits_truncate(ctx.callflag);

        if flag.is_toplevel() {
            return Ok(FrameName::TopLevel);
        }

        let call = self.reader.read_heap_node(ctx.call)?;

        if flag.names_a_call() && call.is_lang() {
            let fun = self.reader.read_heap_node(call.car())?;
            if fun.is_symbol() {
                let name = self.print_name(fun.print_name())?;
                return Ok(FrameName::Name(name));
            } else if fun.is_lang() {
                return self.decode_infix(&fun);
            } else {
                return Ok(FrameName::Name("<Anonymous>".to_string()));
            }
        }

        Ok(FrameName::Name("<Unknown>".to_string()))
    }

    /// Decodes `a::b` / `a:::b` / `a$b`, checking `::` before `:::` before
    /// `$` to match the precedence the interpreter itself applies.
    fn decode_infix(&self, fun: &HeapNode) -> Result<FrameName, CursorError> {
        let cdr1 = self.reader.read_heap_node(fun.cdr())?;
        let lhs = self.reader.read_heap_node(cdr1.car())?;
        let cdr2 = self.reader.read_heap_node(cdr1.cdr())?;
        let rhs = self.reader.read_heap_node(cdr2.car())?;

        let both_symbols = lhs.type_tag() == SYMSXP && rhs.type_tag() == SYMSXP;
        let operator = fun.car();

        if both_symbols && operator == self.globals.doublecolon {
            return self.render_infix(&lhs, &rhs, "::");
        }
        if both_symbols && operator == self.globals.triplecolon {
            return self.render_infix(&lhs, &rhs, ":::");
        }
        if both_symbols && operator == self.globals.dollar {
            return self.render_infix(&lhs, &rhs, "$");
        }
        Ok(FrameName::Name("<Unimplemented>".to_string()))
    }

    fn render_infix(&self, lhs: &HeapNode, rhs: &HeapNode, sep: &str) -> Result<FrameName, CursorError> {
        let lname = self.print_name(lhs.print_name())?;
        let rname = self.print_name(rhs.print_name())?;
        Ok(FrameName::Name(format!("{}{}{}", lname, sep, rname)))
    }

    fn print_name(&self, addr: RemotePtr<HeapNode>) -> Result<String, CursorError> {
        let s = self.reader.read_cstring(addr.cast::<VectorHeader>())?;
        if s.len() > MAX_SYM_LEN {
            return Err(CursorError::NameTruncated { buf_len: MAX_SYM_LEN });
        }
        Ok(s)
    }
}

#[cfg(all(test, not(feature = "r344-compat")))]
mod tests {
    use super::*;
    use crate::memory::tests_support::MockTracee;

    #[test]
    fn toplevel_only_stack_emits_a_single_terminal_frame() {
        let mock = MockTracee::toplevel_only();
        let mut cursor = StackCursor::new(&mock.reader, &mock.globals);
        cursor.init().unwrap();
        assert_eq!(cursor.frame_name().unwrap(), FrameName::TopLevel);
        assert_eq!(cursor.step().unwrap(), StepOutcome::Terminal);
    }

    #[test]
    fn nested_calls_decode_in_innermost_first_order() {
        let mock = MockTracee::nested_calls(&["bar", "foo"]);
        let mut cursor = StackCursor::new(&mock.reader, &mock.globals);
        cursor.init().unwrap();

        let mut names = Vec::new();
        loop {
            match cursor.frame_name().unwrap() {
                FrameName::TopLevel => {
                    names.push("<TopLevel>".to_string());
                    break;
                }
                FrameName::Name(n) => names.push(n),
            }
            match cursor.step().unwrap() {
                StepOutcome::Terminal => break,
                StepOutcome::Frame(_) => continue,
            }
        }
        assert_eq!(names, vec!["bar", "foo", "<TopLevel>"]);
    }

    #[test]
    fn namespaced_call_decodes_doublecolon() {
        let mock = MockTracee::infix_call("pkg", "fn", "::");
        let mut cursor = StackCursor::new(&mock.reader, &mock.globals);
        cursor.init().unwrap();
        assert_eq!(
            cursor.frame_name().unwrap(),
            FrameName::Name("pkg::fn".to_string())
        );
    }

    #[test]
    fn triple_colon_call_decodes() {
        let mock = MockTracee::infix_call("pkg", "fn", ":::");
        let mut cursor = StackCursor::new(&mock.reader, &mock.globals);
        cursor.init().unwrap();
        assert_eq!(
            cursor.frame_name().unwrap(),
            FrameName::Name("pkg:::fn".to_string())
        );
    }

    #[test]
    fn dollar_call_decodes() {
        let mock = MockTracee::infix_call("x", "method", "$");
        let mut cursor = StackCursor::new(&mock.reader, &mock.globals);
        cursor.init().unwrap();
        assert_eq!(
            cursor.frame_name().unwrap(),
            FrameName::Name("x$method".to_string())
        );
    }

    #[test]
    fn anonymous_closure_call_decodes() {
        let mock = MockTracee::anonymous_call();
        let mut cursor = StackCursor::new(&mock.reader, &mock.globals);
        cursor.init().unwrap();
        assert_eq!(
            cursor.frame_name().unwrap(),
            FrameName::Name("<Anonymous>".to_string())
        );
    }

    #[test]
    fn depth_cap_is_a_tick_local_error_not_a_hang() {
        let mock = MockTracee::cyclic_chain();
        let mut cursor = StackCursor::new(&mock.reader, &mock.globals);
        cursor.init().unwrap();
        let mut steps = 0;
        loop {
            match cursor.step() {
                Ok(StepOutcome::Frame(_)) => {
                    steps += 1;
                    if steps > MAX_STACK_DEPTH + 1 {
                        panic!("cursor did not cap depth");
                    }
                }
                Ok(StepOutcome::Terminal) => panic!("cyclic chain should never reach top level"),
                Err(CursorError::DepthExceeded { max }) => {
                    assert_eq!(max, MAX_STACK_DEPTH);
                    break;
                }
                Err(e) => panic!("unexpected error: {:?}", e),
            }
        }
    }
}
