use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::rc::Rc;

use crate::gc::{Closure, GcObject, Heap};
use crate::proto::{chunk_id, ProtoRef};
use crate::value::{tostring, GcRef, Value};

/// Signature of a native (host-implemented) function.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Vec<Value>, VmError>;

/// Shared output sink; the debugger and tests capture VM output through it.
pub type OutSink = Rc<RefCell<Box<dyn Write>>>;

pub fn stdout_sink() -> OutSink {
    Rc::new(RefCell::new(Box::new(io::stdout()) as Box<dyn Write>))
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A runtime error carrying the stack trace captured where it was raised.
#[derive(Debug, Clone)]
pub struct VmError {
    pub message: String,
    pub traceback: Vec<String>,
}

impl VmError {
    pub fn new(message: impl Into<String>) -> VmError {
        VmError {
            message: message.into(),
            traceback: Vec::new(),
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for VmError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    Ok,
    /// Set by the debugger's `quit`; the interpreter unwinds when it sees it.
    ErrRun,
}

// ---------------------------------------------------------------------------
// Debug interface
// ---------------------------------------------------------------------------

/// Activation record handed to the debug hooks.
#[derive(Debug, Clone)]
pub struct DebugRecord {
    pub source: String,
    pub line: u32,
    /// Set when the hook fires while resuming past a trap that already
    /// paused; the debugger re-arms stepping instead of pausing again.
    pub resume_only: bool,
}

/// The debugger side of the VM integration surface. The VM invokes these
/// synchronously from the dispatch loop; the step hook before every
/// instruction while single-stepping, the break hook when a trap executes.
pub trait DebugCallbacks {
    /// Returns true when the hook paused into the debugger and left
    /// stepping armed. The VM forwards that as `resume_only` on a break
    /// hook for the same instruction, so a trap the user just stepped
    /// onto does not prompt twice.
    fn on_step(&mut self, vm: &mut Vm, ar: &DebugRecord) -> bool;
    fn on_break(&mut self, vm: &mut Vm, ar: &DebugRecord);
}

// ---------------------------------------------------------------------------
// Call stack
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct CallInfo {
    /// Heap ref of the executing closure.
    pub closure: GcRef,
    /// Stack slot holding the function value (results land here on return).
    pub func_slot: usize,
    /// Stack slot of register 0.
    pub base: usize,
    /// One past the last live stack slot of this frame.
    pub top: usize,
    /// Index of the next instruction to execute; the instruction currently
    /// executing (as seen by hooks) is `savedpc - 1`.
    pub savedpc: usize,
    /// Results the caller expects, -1 for all.
    pub nresults: i32,
}

/// The frame most recently popped by RETURN, kept so the stepping machine
/// can report returned values after the depth drops.
#[derive(Debug, Clone)]
pub struct ReturnedFrame {
    pub proto: ProtoRef,
    /// PC of the RETURN instruction itself.
    pub ret_pc: usize,
    pub base: usize,
    pub top: usize,
    pub values: Vec<Value>,
}

// ---------------------------------------------------------------------------
// Vm
// ---------------------------------------------------------------------------

pub struct Vm {
    pub stack: Vec<Value>,
    pub top: usize,
    pub ci: Vec<CallInfo>,
    pub globals: HashMap<String, Value>,
    pub heap: Heap,
    pub status: VmStatus,
    pub single_step: bool,
    /// Per-VM debugger slot; the hooks recover the debugger from here.
    pub debug: Option<Rc<RefCell<dyn DebugCallbacks>>>,
    pub out: OutSink,
    pub returned: Option<ReturnedFrame>,
}

impl Vm {
    pub fn new() -> Vm {
        let mut vm = Vm {
            stack: Vec::with_capacity(256),
            top: 0,
            ci: Vec::new(),
            globals: HashMap::new(),
            heap: Heap::new(),
            status: VmStatus::Ok,
            single_step: false,
            debug: None,
            out: stdout_sink(),
            returned: None,
        };
        vm.open_stdlib();
        vm
    }

    pub fn with_out(out: OutSink) -> Vm {
        let mut vm = Vm::new();
        vm.out = out;
        vm
    }

    fn open_stdlib(&mut self) {
        let print = self
            .heap
            .alloc_closure(Closure::Native { name: "print", func: native_print }, 0);
        self.globals.insert("print".to_string(), Value::Function(print));
    }

    // -- Stack helpers --

    pub fn ensure_stack(&mut self, size: usize) {
        if self.stack.len() < size {
            self.stack.resize(size, Value::Nil);
        }
    }

    pub fn stack_at(&self, idx: usize) -> Value {
        self.stack.get(idx).copied().unwrap_or(Value::Nil)
    }

    // -- Frame introspection (consumed by the debugger) --

    pub fn call_depth(&self) -> usize {
        self.ci.len()
    }

    pub fn current_ci(&self) -> Option<&CallInfo> {
        self.ci.last()
    }

    /// Closure executing in the innermost frame.
    pub fn current_closure(&self) -> Option<&Closure> {
        let ci = self.ci.last()?;
        match self.heap.get(ci.closure)? {
            GcObject::Function(cl) => Some(cl),
            _ => None,
        }
    }

    pub fn current_proto(&self) -> Option<ProtoRef> {
        self.current_closure()?.proto().cloned()
    }

    /// Prototype behind a script closure value, if it is one.
    pub fn function_proto(&self, v: Value) -> Option<ProtoRef> {
        let Value::Function(r) = v else {
            return None;
        };
        match self.heap.get(r)? {
            GcObject::Function(cl) => cl.proto().cloned(),
            _ => None,
        }
    }

    /// Source id and current line for a frame; level 0 is the innermost.
    pub fn frame_info(&self, level: usize) -> Option<(String, u32)> {
        let idx = self.ci.len().checked_sub(level + 1)?;
        let ci = &self.ci[idx];
        let cl = match self.heap.get(ci.closure)? {
            GcObject::Function(cl) => cl,
            _ => return None,
        };
        let proto = cl.proto()?;
        let pc = ci.savedpc.saturating_sub(1);
        let line = proto.line_for_pc(pc).unwrap_or(proto.linedefined);
        Some((proto.chunk_name(), line))
    }

    /// Debug record for the innermost frame.
    pub fn debug_record(&self, resume_only: bool) -> DebugRecord {
        let (source, line) = self
            .frame_info(0)
            .unwrap_or_else(|| (chunk_id("=?"), 0));
        DebugRecord {
            source,
            line,
            resume_only,
        }
    }

    /// Human-readable stack trace, innermost frame first.
    pub fn traceback(&self) -> Vec<String> {
        let mut frames = Vec::new();
        for level in 0..self.ci.len() {
            if let Some((source, line)) = self.frame_info(level) {
                let name = self
                    .ci
                    .get(self.ci.len() - level - 1)
                    .and_then(|ci| match self.heap.get(ci.closure) {
                        Some(GcObject::Function(cl)) => cl.debug_name().map(str::to_string),
                        _ => None,
                    });
                match name {
                    Some(n) => frames.push(format!("{}:{} function {}", source, line, n)),
                    None => frames.push(format!("{}:{}", source, line)),
                }
            }
        }
        frames
    }

    pub fn error(&self, message: impl Into<String>) -> VmError {
        VmError {
            message: message.into(),
            traceback: self.traceback(),
        }
    }

    // -- Garbage collection entry points --

    /// Every value reachable from the mutator: globals, the live stack and
    /// the call-stack closures.
    pub fn gc_roots(&self) -> Vec<Value> {
        let mut roots: Vec<Value> = self.globals.values().copied().collect();
        roots.extend_from_slice(&self.stack[..self.top.min(self.stack.len())]);
        roots.extend(self.ci.iter().map(|ci| Value::Function(ci.closure)));
        roots
    }

    pub fn gc_step(&mut self) {
        let roots = self.gc_roots();
        self.heap.step(&roots);
    }

    pub fn gc_full(&mut self) {
        let roots = self.gc_roots();
        self.heap.full(&roots);
    }

    // -- Output --

    pub fn write_out(&self, text: &str) {
        let _ = self.out.borrow_mut().write_all(text.as_bytes());
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

fn native_print(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, VmError> {
    let line = args
        .iter()
        .map(|&v| tostring(&vm.heap, v))
        .collect::<Vec<_>>()
        .join("\t");
    vm.write_out(&line);
    vm.write_out("\n");
    Ok(Vec::new())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn capture_sink() -> (OutSink, Rc<RefCell<Vec<u8>>>) {
        struct Buf(Rc<RefCell<Vec<u8>>>);
        impl Write for Buf {
            fn write(&mut self, data: &[u8]) -> io::Result<usize> {
                self.0.borrow_mut().extend_from_slice(data);
                Ok(data.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let buf = Rc::new(RefCell::new(Vec::new()));
        let sink: OutSink = Rc::new(RefCell::new(Box::new(Buf(buf.clone())) as Box<dyn Write>));
        (sink, buf)
    }

    #[test]
    fn stdlib_registers_print() {
        let vm = Vm::new();
        assert!(matches!(vm.globals.get("print"), Some(Value::Function(_))));
    }

    #[test]
    fn print_joins_with_tabs() {
        let (sink, buf) = capture_sink();
        let mut vm = Vm::with_out(sink);
        let s = vm.heap.alloc_str("hi", 0);
        native_print(&mut vm, &[Value::Number(1.0), Value::Str(s)]).unwrap();
        assert_eq!(String::from_utf8(buf.borrow().clone()).unwrap(), "1\thi\n");
    }

    #[test]
    fn gc_keeps_globals() {
        let mut vm = Vm::new();
        let s = vm.heap.alloc_str("pinned", 0);
        vm.globals.insert("pin".to_string(), Value::Str(s));
        vm.gc_full();
        assert_eq!(vm.heap.get_str(s), Some("pinned"));
    }

    #[test]
    fn frame_info_empty_stack() {
        let vm = Vm::new();
        assert!(vm.frame_info(0).is_none());
        assert_eq!(vm.call_depth(), 0);
    }
}
