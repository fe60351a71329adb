//! The interactive command loop. Entered from the step and break hooks
//! while the VM is paused; returning resumes execution. Every error is
//! reported and swallowed here so a session only ever ends through `quit`.

use std::io::{BufRead, Write};

use rustyline::error::ReadlineError;

use super::{say, sayn, Debugger, ReplInput, StepMode};
use nula_rt::compile::{compile, CompileOptions};
use nula_rt::value::strprimitive;
use nula_rt::vm::VmStatus;
use nula_rt::{Vm, VmError};

const PROMPT: &str = "(ndbg) ";

/// Decimal or 0x-prefixed hex, as accepted in breakpoint locations.
fn parse_loc_number(s: &str) -> Option<usize> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        if hex.is_empty() {
            return None;
        }
        usize::from_str_radix(hex, 16).ok()
    } else if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
        s.parse().ok()
    } else {
        None
    }
}

impl Debugger {
    fn read_line(&mut self) -> Option<String> {
        match &mut self.input {
            ReplInput::Editor(editor) => match editor.readline(PROMPT) {
                Ok(line) => {
                    let _ = editor.add_history_entry(line.as_str());
                    Some(line)
                }
                Err(ReadlineError::Interrupted) => Some(String::new()),
                Err(_) => None,
            },
            // Scripted input gets no prompt; prompts are for people.
            ReplInput::Reader(reader) => {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => None,
                    Ok(_) => Some(line),
                }
            }
        }
    }

    /// The command loop. Stepping is re-armed on entry; resume commands
    /// break out and hand control back to the VM.
    pub fn repl(&mut self, vm: &mut Vm) {
        self.step_active = true;

        loop {
            let Some(raw) = self.read_line() else {
                break;
            };
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let args = &tokens[1..];

            match tokens[0] {
                "continue" | "c" => {
                    self.mode = StepMode::None;
                    self.step_active = false;
                    break;
                }
                "step" | "s" => {
                    self.mode = StepMode::None;
                    break;
                }
                "next" | "n" => {
                    self.mode = StepMode::StepOver;
                    self.state_level = vm.call_depth() as u32;
                    break;
                }
                "finish" => {
                    self.mode = StepMode::Finish;
                    self.state_level = vm.call_depth() as u32;
                    break;
                }
                "quit" | "q" => {
                    vm.status = VmStatus::ErrRun;
                    break;
                }
                "bt" | "backtrace" => self.cmd_backtrace(vm),
                "break" | "b" => self.cmd_break(vm, args.first().copied()),
                "delete" | "d" => match args.first().and_then(|s| s.parse().ok()) {
                    Some(num) => self.delete_breakpoint(num),
                    None => say!(self, "usage: delete <breakpoint number>"),
                },
                "toggle" => match args.first().and_then(|s| s.parse().ok()) {
                    Some(num) => self.toggle_breakpoint(num),
                    None => say!(self, "usage: toggle <breakpoint number>"),
                },
                "inspect" | "i" => self.cmd_inspect(vm, args.first().copied()),
                "disasm" => self.cmd_disasm(vm, args.first().copied()),
                "patch" => self.cmd_patch(vm, args.first().copied(), args.get(1).copied()),
                "load" => self.cmd_load(vm, args.first().copied()),
                "gc" => self.cmd_gc(vm, args),
                "cls" => {
                    let mut out = self.out.borrow_mut();
                    let _ = write!(out, "\x1b[2J\x1b[1;1H");
                }
                "help" => self.cmd_help(),
                _ => self.eval_line(vm, line),
            }
        }
    }

    fn cmd_backtrace(&mut self, vm: &Vm) {
        sayn!(self, "(current) ");
        let mut level = 0;
        while let Some((source, line)) = vm.frame_info(level) {
            say!(self, "{} - {}:{}", level + 1, source, line);
            level += 1;
        }
    }

    /// `break <loc>` with the location grammar:
    /// `*func:pc | *pc | source:line | source:func | line | func`.
    fn cmd_break(&mut self, vm: &mut Vm, loc: Option<&str>) {
        let Some(loc) = loc else {
            say!(self, "usage: break source:line/source:func/*func:pc/*pc/line/func");
            return;
        };

        if let Some(colon) = loc.find(':') {
            let (lhs, rhs) = (&loc[..colon], &loc[colon + 1..]);
            if let Some(func) = lhs.strip_prefix('*') {
                match parse_loc_number(rhs) {
                    Some(pc) => match self.registry.lookup_by_name(func) {
                        Some(p) => self.set_breakpoint_by_pc(&p, pc),
                        None => say!(self, "function not found"),
                    },
                    None => say!(self, "invalid *func:pc format"),
                }
            } else if let Some(line) = parse_loc_number(rhs) {
                self.set_breakpoint_by_source_line(lhs, line as u32, true);
            } else {
                self.set_breakpoint_by_func(Some(lhs), rhs);
            }
        } else if let Some(rest) = loc.strip_prefix('*') {
            match parse_loc_number(rest) {
                Some(pc) => match vm.current_proto() {
                    Some(p) => self.set_breakpoint_by_pc(&p, pc),
                    None => say!(self, "no current function"),
                },
                None => say!(self, "invalid *pc format"),
            }
        } else if let Some(line) = parse_loc_number(loc) {
            match vm.frame_info(0) {
                Some((source, _)) => {
                    self.set_breakpoint_by_source_line(&source, line as u32, true);
                }
                None => say!(self, "no current function"),
            }
        } else {
            self.set_breakpoint_by_func(None, loc);
        }
    }

    fn cmd_inspect(&mut self, vm: &Vm, subcmd: Option<&str>) {
        let Some(subcmd) = subcmd else {
            self.dump_function_info(vm);
            return;
        };
        let Some(proto) = vm.current_proto() else {
            say!(self, "no current function");
            return;
        };
        let Some(ci) = vm.current_ci().copied() else {
            say!(self, "no current function");
            return;
        };

        match subcmd {
            "locals" => {
                if proto.locvars.is_empty() {
                    say!(self, "missing local info");
                    return;
                }
                let pc = ci.savedpc.saturating_sub(1) as u32;
                for local in &proto.locvars {
                    if pc >= local.startpc && pc <= local.endpc {
                        say!(self, "  R{} = {}", local.reg, local.name);
                    } else {
                        say!(self, "  R{} = {} ; inactive", local.reg, local.name);
                    }
                }
            }
            "upvalues" => {
                if proto.upvalues.is_empty() {
                    say!(self, "missing upvalue info");
                    return;
                }
                for (i, name) in proto.upvalues.iter().enumerate() {
                    say!(self, "  U{} = {}", i, name);
                }
            }
            "stack" => {
                let end = proto.maxstacksize as usize;
                let rows = (end + 3) / 4;
                for i in 0..rows {
                    let mut row = String::new();
                    for j in 0..4 {
                        let idx = i + j * rows;
                        if idx < end {
                            let v = vm.stack_at(ci.base + idx);
                            row.push_str(&format!(
                                "  R{:<3} = {:<15}",
                                idx,
                                strprimitive(&vm.heap, v)
                            ));
                        }
                    }
                    say!(self, "{}", row);
                }
            }
            "breakpoints" => {
                if self.breakpoints.is_empty() {
                    say!(self, "no breakpoints set");
                    return;
                }
                say!(self, "{:<4} {:<8} {:<30} {}", "n", "active", "location", "func");
                say!(
                    self,
                    "---- -------- ------------------------------ ----------"
                );
                for (i, bp) in self.breakpoints.iter().enumerate() {
                    let func = bp.proto.debugname.as_deref().unwrap_or("??");
                    let location = format!("{}:{}", bp.source, bp.line);
                    say!(
                        self,
                        "{:<4} {:<8} {:<30} {}",
                        i + 1,
                        if bp.enabled { "yes" } else { "no" },
                        location,
                        func
                    );
                }
            }
            "funcs" => {
                if self.registry.is_empty() {
                    say!(self, "no functions loaded");
                    return;
                }
                say!(self, "{:<4} {:<30} {:<8} {}", "n", "func", "line", "source");
                say!(
                    self,
                    "---- ------------------------------ -------- --------------------"
                );
                let rows: Vec<(String, u32, String)> = self
                    .registry
                    .iter()
                    .map(|p| {
                        (
                            p.debugname.clone().unwrap_or_else(|| "??".to_string()),
                            p.linedefined,
                            p.chunk_name(),
                        )
                    })
                    .collect();
                for (i, (func, line, source)) in rows.iter().enumerate() {
                    say!(self, "{:<4} {:<30} {:<8} {}", i + 1, func, line, source);
                }
            }
            "insn" => self.show_current_insn(vm),
            _ if subcmd.starts_with('R') => {
                let Some(idx) = parse_loc_number(&subcmd[1..]) else {
                    say!(self, "index must be a number");
                    return;
                };
                if idx >= proto.maxstacksize as usize {
                    say!(self, "index out of range");
                } else {
                    let v = vm.stack_at(ci.base + idx);
                    say!(self, "{}", strprimitive(&vm.heap, v));
                }
            }
            _ if subcmd.starts_with('K') => {
                let Some(idx) = parse_loc_number(&subcmd[1..]) else {
                    say!(self, "index must be a number");
                    return;
                };
                match proto.k.get(idx) {
                    Some(&v) => say!(self, "{}", strprimitive(&vm.heap, v)),
                    None => say!(self, "index out of range"),
                }
            }
            _ if subcmd.starts_with('U') => {
                let Some(idx) = parse_loc_number(&subcmd[1..]) else {
                    say!(self, "index must be a number");
                    return;
                };
                let upvals = match vm.current_closure() {
                    Some(nula_rt::gc::Closure::Lua { upvals, .. }) => upvals.clone(),
                    _ => Vec::new(),
                };
                match upvals.get(idx) {
                    Some(&v) => say!(self, "{}", strprimitive(&vm.heap, v)),
                    None => say!(self, "index out of range"),
                }
            }
            _ => say!(self, "unknown subcommand"),
        }
    }

    fn cmd_disasm(&mut self, vm: &Vm, func: Option<&str>) {
        let proto = match func {
            Some(name) => match self.registry.lookup_by_name(name) {
                Some(p) => p,
                None => {
                    say!(self, "function not found");
                    return;
                }
            },
            None => match vm.current_proto() {
                Some(p) => p,
                None => {
                    say!(self, "no current function");
                    return;
                }
            },
        };

        let mut pc = 0;
        while pc < proto.sizecode() {
            let mut out = self.out.borrow_mut();
            let _ = write!(out, "  {:04X}  ", pc);
            let _ = crate::disasm::disasm_one(&mut **out, &mut pc, &proto, &vm.heap);
            let _ = writeln!(out);
            drop(out);
            pc += 1;
        }
    }

    /// Overwrite one operand field of the instruction the VM is paused on,
    /// then show the patched instruction.
    fn cmd_patch(&mut self, vm: &Vm, operand: Option<&str>, value: Option<&str>) {
        let (Some(operand), Some(value)) = (operand, value) else {
            say!(self, "usage: patch <op> <val>");
            return;
        };
        let Ok(value) = value.parse::<i64>() else {
            say!(self, "val must be an integer");
            return;
        };
        let Some(proto) = vm.current_proto() else {
            say!(self, "no current function");
            return;
        };
        let Some(ci) = vm.current_ci() else {
            say!(self, "no current function");
            return;
        };
        let pc = ci.savedpc.saturating_sub(1);

        {
            let mut code = proto.code.borrow_mut();
            let Some(insn) = code.get_mut(pc) else {
                say!(self, "pc out of range");
                return;
            };
            match operand.to_ascii_lowercase().as_str() {
                "a" | "b" | "c" => {
                    if !(0..=255).contains(&value) {
                        say!(self, "val must be 0-255 for this operand");
                        return;
                    }
                    match operand.to_ascii_lowercase().as_str() {
                        "a" => insn.set_a(value as u8),
                        "b" => insn.set_b(value as u8),
                        _ => insn.set_c(value as u8),
                    }
                }
                "d" => {
                    if !(-32768..=32767).contains(&value) {
                        say!(self, "val must be -32768-32767 for this operand");
                        return;
                    }
                    insn.set_d(value as i16);
                }
                "e" => {
                    if !(-8_388_608..=8_388_607).contains(&value) {
                        say!(self, "val must be -8388608-8388607 for this operand");
                        return;
                    }
                    insn.set_e(value as i32);
                }
                _ => {
                    say!(self, "invalid operand");
                    return;
                }
            }
        }
        self.show_current_insn(vm);
    }

    /// Anything that is not a command: compile the line and run it with
    /// stepping disabled. Errors print a message and a delimited stack
    /// trace, then the loop continues.
    fn eval_line(&mut self, vm: &mut Vm, line: &str) {
        let opts = CompileOptions {
            optimization: 2,
            ..Default::default()
        };
        let blob = match compile(line, &opts) {
            Ok(b) => b,
            Err(e) => {
                say!(self, "{}", e);
                return;
            }
        };
        let closure = match vm.load_blob(&blob, "ndbg") {
            Ok(c) => c,
            Err(e) => {
                say!(self, "{}", e);
                return;
            }
        };

        let was_stepping = vm.single_step;
        vm.single_step = false;
        let result = vm.pcall(closure, &[], 0);
        vm.single_step = was_stepping;

        if let Err(e) = result {
            self.report_script_error(&e);
        }
    }

    /// Print a script error the way the embedded-expression handler does:
    /// the message, then the frames between `Stack Begin` and `Stack End`.
    pub fn report_script_error(&self, e: &VmError) {
        say!(self, "{}", e.message);
        say!(self, "Stack Begin");
        for frame in &e.traceback {
            say!(self, "{}", frame);
        }
        say!(self, "Stack End");
    }

    fn cmd_help(&mut self) {
        sayn!(
            self,
            concat!(
                "  c, continue           - continue execution\n",
                "  s, step               - step into next instruction\n",
                "  n, next               - step over function calls\n",
                "  finish                - step out of current function\n",
                "  bt, backtrace         - dump call stack\n",
                "  b, break <loc>        - set breakpoint at location\n",
                "  d, delete <num>       - delete breakpoint by number\n",
                "  toggle <num>          - enable/disable breakpoint by number\n",
                "  i, inspect [what]     - (no what) show function info\n",
                "    locals              - list all local variables\n",
                "    upvalues            - list upvalues\n",
                "    R<num>              - show value of register\n",
                "    U<num>              - show value of upvalue\n",
                "    K<num>              - show value of constant\n",
                "    stack               - dump stack\n",
                "    breakpoints         - list all breakpoints\n",
                "    funcs               - list loaded functions\n",
                "    insn                - disassemble current instruction\n",
                "  disasm [func]         - disassemble the provided or the current function\n",
                "  cls                   - clear console\n",
                "  quit, q               - quit\n",
                "  load <filename>       - load a nula library\n",
                "  patch <op> <val>      - patch the current instruction\n",
                "  gc [subcmd]           - (no subcmd) show GC & memory usage info\n",
                "    step                - step the garbage collector\n",
                "    full                - perform a full GC cycle\n",
                "    threshold <val>     - set the GC threshold\n",
                "    pause               - pause the GC completly\n",
                "    resume              - resume the garbage collector\n",
                "    stats               - show statistics\n",
                "    trace               - toggle allocation, deallocation, and reallocation tracing\n",
                "    dump                - dump the entire heap to ./gcdump.json\n",
            )
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loc_numbers_parse_decimal_and_hex() {
        assert_eq!(parse_loc_number("42"), Some(42));
        assert_eq!(parse_loc_number("0x1A"), Some(26));
        assert_eq!(parse_loc_number("0X10"), Some(16));
        assert_eq!(parse_loc_number(""), None);
        assert_eq!(parse_loc_number("12x"), None);
        assert_eq!(parse_loc_number("0x"), None);
        assert_eq!(parse_loc_number("f"), None);
    }
}
