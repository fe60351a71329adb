//! The debugger engine: breakpoint bookkeeping, the stepping state machine
//! and the REPL that drives them. One `Debugger` attaches to one `Vm`
//! through the VM's per-state debug slot; the VM calls back into
//! [`DebugCallbacks`] synchronously from its dispatch loop.

use std::cell::RefCell;
use std::io::{self, BufRead, Write};
use std::rc::Rc;

use rustyline::DefaultEditor;

use nula_rt::gc::AllocCb;
use nula_rt::value::strprimitive;
use nula_rt::vm::{stdout_sink, OutSink};
use nula_rt::{DebugCallbacks, DebugRecord, Opcode, ProtoRef, Vm};

use crate::disasm::disasm_one;

macro_rules! say {
    ($dbg:expr, $($arg:tt)*) => {{
        use std::io::Write as _;
        let mut out = $dbg.out.borrow_mut();
        let _ = writeln!(out, $($arg)*);
    }};
}

macro_rules! sayn {
    ($dbg:expr, $($arg:tt)*) => {{
        use std::io::Write as _;
        let mut out = $dbg.out.borrow_mut();
        let _ = write!(out, $($arg)*);
    }};
}

pub(crate) use say;
pub(crate) use sayn;

mod breakpoints;
mod gc_inspect;
mod loader;
mod registry;
mod repl;

pub use loader::{DLL_PROCESS_ATTACH, NULA_SIGNATURE};
pub use registry::ProtoRegistry;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What the step hook does at the next instruction boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// Pause on every instruction.
    None,
    /// Pause only at the captured call depth; skip deeper frames.
    StepOver,
    /// Run until the captured call depth is left, then pause once.
    Finish,
}

/// An installed (or disabled) trap location.
#[derive(Clone)]
pub struct Breakpoint {
    pub proto: ProtoRef,
    pub source: String,
    pub pc: usize,
    pub line: u32,
    pub enabled: bool,
}

/// Where REPL commands come from: an interactive line editor, or any
/// buffered reader (hosts and tests feed scripted sessions through this).
pub enum ReplInput {
    Editor(Box<DefaultEditor>),
    Reader(Box<dyn BufRead>),
}

impl ReplInput {
    /// Interactive editor when a terminal is available, plain stdin
    /// otherwise.
    pub fn editor() -> ReplInput {
        match DefaultEditor::new() {
            Ok(editor) => ReplInput::Editor(Box::new(editor)),
            Err(_) => ReplInput::Reader(Box::new(io::BufReader::new(io::stdin()))),
        }
    }

    pub fn script(input: impl BufRead + 'static) -> ReplInput {
        ReplInput::Reader(Box::new(input))
    }
}

// ---------------------------------------------------------------------------
// Debugger
// ---------------------------------------------------------------------------

pub struct Debugger {
    pub registry: ProtoRegistry,
    pub breakpoints: Vec<Breakpoint>,
    pub out: OutSink,
    input: ReplInput,
    mode: StepMode,
    state_level: u32,
    last_level: u32,
    step_active: bool,
    /// Threshold stashed by `gc pause`, restored by `gc resume`.
    saved_threshold: Option<usize>,
    /// Allocation callback stashed while tracing is on.
    saved_alloc: Option<AllocCb>,
}

impl Debugger {
    pub fn new(input: ReplInput, out: OutSink) -> Debugger {
        Debugger {
            registry: ProtoRegistry::new(),
            breakpoints: Vec::new(),
            out,
            input,
            mode: StepMode::None,
            state_level: 0,
            last_level: 0,
            step_active: true,
            saved_threshold: None,
            saved_alloc: None,
        }
    }

    pub fn with_defaults() -> Debugger {
        Debugger::new(ReplInput::editor(), stdout_sink())
    }

    /// Install this debugger into the VM's debug slot and enable
    /// single-stepping.
    pub fn attach(dbg: Rc<RefCell<Debugger>>, vm: &mut Vm) {
        vm.debug = Some(dbg);
        vm.single_step = true;
    }

    pub fn detach(vm: &mut Vm) {
        vm.debug = None;
        vm.single_step = false;
    }

    pub fn step_mode(&self) -> StepMode {
        self.mode
    }

    // -- Shared output helpers --

    /// `=> name() at source:line` for the innermost frame.
    pub(crate) fn dump_function_info(&self, vm: &Vm) {
        let Some(proto) = vm.current_proto() else {
            return;
        };
        let Some((source, line)) = vm.frame_info(0) else {
            return;
        };
        let name = proto.debugname.as_deref().unwrap_or("??");
        say!(self, "=> {}() at {}:{}", name, source, line);
    }

    /// Disassemble the instruction the VM is paused on.
    pub(crate) fn show_current_insn(&self, vm: &Vm) {
        let Some(proto) = vm.current_proto() else {
            return;
        };
        let Some(ci) = vm.current_ci() else {
            return;
        };
        let mut pc = ci.savedpc.saturating_sub(1);
        let mut out = self.out.borrow_mut();
        let _ = disasm_one(&mut **out, &mut pc, &proto, &vm.heap);
        let _ = writeln!(out);
    }
}

// ---------------------------------------------------------------------------
// VM hooks
// ---------------------------------------------------------------------------

impl DebugCallbacks for Debugger {
    /// Runs before every instruction while stepping is armed. Decides,
    /// from the mode and the call depth, whether to pause into the REPL.
    /// Returns whether it paused with stepping left armed, so a trap on
    /// this same instruction is treated as a resume rather than prompting
    /// again.
    fn on_step(&mut self, vm: &mut Vm, _ar: &DebugRecord) -> bool {
        if !self.step_active {
            return false;
        }
        if vm.current_proto().is_none() {
            return false;
        }

        let level = vm.call_depth() as u32;
        if level != self.last_level {
            if self.mode == StepMode::None {
                self.dump_function_info(vm);
                say!(self, "");
            }
            self.last_level = level;
        }

        match self.mode {
            StepMode::StepOver => {
                if level < self.state_level {
                    self.mode = StepMode::None;
                } else if level > self.state_level {
                    return false;
                }
            }
            StepMode::Finish => {
                if level < self.state_level {
                    self.mode = StepMode::None;
                    self.report_finished_call(vm);
                } else {
                    return false;
                }
            }
            StepMode::None => {}
        }

        self.show_current_insn(vm);
        self.repl(vm);
        self.step_active
    }

    /// Runs when a trap executes. Prints the hit banner and drops into the
    /// REPL; the VM then dispatches the shadowed original opcode.
    fn on_break(&mut self, vm: &mut Vm, ar: &DebugRecord) {
        let Some(proto) = vm.current_proto() else {
            return;
        };
        let name = proto.debugname.as_deref().unwrap_or("??");
        say!(
            self,
            "breakpoint hit in function '{}' at {}:{}",
            name,
            proto.chunk_name(),
            ar.line
        );

        if ar.resume_only {
            self.step_active = true;
            return;
        }
        self.show_current_insn(vm);
        self.repl(vm);
    }
}

impl Debugger {
    /// After `finish` leaves the frame of interest: if the frame returned
    /// through a RETURN instruction, print the values it produced.
    fn report_finished_call(&self, vm: &Vm) {
        let Some(rf) = &vm.returned else {
            return;
        };
        if rf.proto.real_op(rf.ret_pc) != Some(Opcode::Return as u8) {
            return;
        }
        let Some(insn) = rf.proto.insn_at(rf.ret_pc) else {
            return;
        };
        self.dump_function_info(vm);

        let ra = insn.a() as usize;
        let rb = insn.b() as usize;
        let count = if rb == 0 {
            rf.top.saturating_sub(rf.base + ra)
        } else {
            rb - 1
        };
        say!(self, "returned {} value(s):", count);
        for (i, &v) in rf.values.iter().take(count).enumerate() {
            say!(self, "  {} = {}", i + 1, strprimitive(&vm.heap, v));
        }
    }
}
