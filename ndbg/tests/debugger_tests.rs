//! End-to-end debugger sessions: a compiled script runs under the debugger
//! with a scripted command stream, and assertions go against the combined
//! debugger + program output.

use std::cell::RefCell;
use std::io::{Cursor, Write};
use std::rc::Rc;

use ndbg::debugger::{Debugger, ReplInput};
use nula_rt::compile::{compile, CompileOptions};
use nula_rt::vm::OutSink;
use nula_rt::{Value, Vm};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Capture(Rc<RefCell<Vec<u8>>>);

impl Write for Capture {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(data);
        Ok(data.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct Session {
    output: String,
    interrupted: bool,
}

/// Run `source` under the debugger, feeding `commands` to the REPL at every
/// pause. Debugger chatter and program output share one buffer, in order.
fn session(source: &str, commands: &str) -> Session {
    let blob = compile(source, &CompileOptions::default()).expect("compile");

    let buf = Rc::new(RefCell::new(Vec::new()));
    let out: OutSink = Rc::new(RefCell::new(
        Box::new(Capture(buf.clone())) as Box<dyn Write>
    ));

    let mut vm = Vm::with_out(out.clone());
    let dbg = Rc::new(RefCell::new(Debugger::new(
        ReplInput::script(Cursor::new(commands.as_bytes().to_vec())),
        out,
    )));
    Debugger::attach(dbg.clone(), &mut vm);

    let closure = vm.load_blob(&blob, "@test.nula").expect("load");
    let proto = vm.function_proto(closure).expect("main proto");
    dbg.borrow_mut().registry.collect(&proto);

    let result = vm.pcall(closure, &[], 0);
    let output = String::from_utf8(buf.borrow().clone()).expect("utf8 output");
    Session {
        output,
        interrupted: result.is_err() && vm.interrupted(),
    }
}

fn assert_contains(haystack: &str, needle: &str) {
    assert!(
        haystack.contains(needle),
        "expected output to contain {:?}\n--- output ---\n{}",
        needle,
        haystack
    );
}

fn assert_not_contains(haystack: &str, needle: &str) {
    assert!(
        !haystack.contains(needle),
        "expected output to NOT contain {:?}\n--- output ---\n{}",
        needle,
        haystack
    );
}

// ---------------------------------------------------------------------------
// Breakpoints
// ---------------------------------------------------------------------------

#[test]
fn break_on_function_pauses_at_entry_and_continues() {
    let s = session(
        "function f() return 1 + 2 end\nprint(f())",
        "b f\nc\nbt\nc\n",
    );
    assert_contains(&s.output, "breakpoint 1 set at test.nula:1");
    assert_contains(&s.output, "breakpoint hit in function 'f' at test.nula:1");
    // Paused on the first real instruction of f, shown as its original
    // opcode even though the word holds a trap.
    assert_contains(&s.output, "LOADN R0 1");
    // Backtrace shows f and the chunk that called it.
    assert_contains(&s.output, "(current) 1 - test.nula:1");
    assert_contains(&s.output, "2 - test.nula:2");
    // The program still computes and prints 3.
    assert_contains(&s.output, "\n3\n");
    assert!(!s.interrupted);
}

#[test]
fn break_by_source_line() {
    let s = session(
        "a = 1\nb = 2\nprint(a + b)",
        "b test.nula:2\nc\nc\n",
    );
    assert_contains(&s.output, "breakpoint 1 set at test.nula:2");
    assert_contains(&s.output, "breakpoint hit in function '??' at test.nula:2");
    assert_contains(&s.output, "\n3\n");
}

#[test]
fn break_by_bare_line_uses_current_source() {
    let s = session("a = 1\nb = 2\nprint(a)", "b 2\nc\nc\n");
    assert_contains(&s.output, "breakpoint 1 set at test.nula:2");
    assert_contains(&s.output, "breakpoint hit in function '??'");
}

#[test]
fn break_unknown_function_reports_not_found() {
    let s = session("print(1)", "b nosuch\nc\n");
    assert_contains(&s.output, "function not found");
}

#[test]
fn break_by_star_pc_on_current_function() {
    let s = session("a = 1\nb = 2\nprint(a)", "b *3\nc\nc\n");
    assert_contains(&s.output, "breakpoint 1 set at");
    assert_contains(&s.output, "breakpoint hit in function '??'");
}

#[test]
fn delete_breakpoint_stops_trapping() {
    let s = session(
        "function f() return 4 end\nprint(f())\nprint(f())",
        "b f\nc\nd 1\nc\n",
    );
    assert_contains(&s.output, "deleted breakpoint 1 at test.nula:1");
    // Exactly one hit: the banner appears once.
    let hits = s.output.matches("breakpoint hit in function 'f'").count();
    assert_eq!(hits, 1, "output:\n{}", s.output);
    // Both calls still ran and printed.
    let fours = s.output.lines().filter(|l| *l == "4").count();
    assert_eq!(fours, 2, "output:\n{}", s.output);
}

#[test]
fn toggle_disables_and_reenables() {
    let s = session(
        "function f() return 4 end\nprint(f())\nprint(f())",
        "b f\ntoggle 1\nc\n",
    );
    assert_contains(&s.output, "breakpoint 1 disabled");
    assert_not_contains(&s.output, "breakpoint hit");
}

#[test]
fn invalid_breakpoint_numbers_are_rejected() {
    let s = session("print(1)", "d 7\ntoggle 7\nc\n");
    assert_eq!(s.output.matches("invalid breakpoint number").count(), 2);
}

// ---------------------------------------------------------------------------
// Stepping
// ---------------------------------------------------------------------------

#[test]
fn step_pauses_on_next_instruction() {
    let s = session("v = 10\nprint(v)", "s\ns\nc\n");
    // First pause shows the vararg prologue, subsequent steps the loads.
    assert_contains(&s.output, "PREPVARARGS R0");
    assert_contains(&s.output, "LOADN R0 10");
    assert_contains(&s.output, "\n10\n");
}

#[test]
fn banner_printed_when_entering_function_while_stepping() {
    let s = session(
        "function noisy() return 2 end\nx = noisy()",
        "b noisy\nc\ns\nc\n",
    );
    assert_contains(&s.output, "=> noisy() at test.nula:1");
}

#[test]
fn step_over_does_not_dive_into_calls() {
    let commands = format!("{}c\n", "n\n".repeat(16));
    let s = session(
        "function noisy() marker = 1 return 2 end\nx = noisy()\ny = 3",
        &commands,
    );
    // The call itself is stepped over: noisy's body never shows up as a
    // paused instruction.
    assert_contains(&s.output, "CALL");
    assert_not_contains(&s.output, "LOADN R0 1");
}

#[test]
fn finish_reports_returned_values() {
    let s = session(
        "function g() return 7, 8 end\nprint(g())",
        "b g\nc\nfinish\nc\n",
    );
    assert_contains(&s.output, "returned 2 value(s):");
    assert_contains(&s.output, "  1 = 7");
    assert_contains(&s.output, "  2 = 8");
    assert_contains(&s.output, "7\t8");
}

#[test]
fn finish_pauses_only_once() {
    let s = session(
        "function g() return 7 end\nprint(g())\nprint(1)",
        "b g\nc\nfinish\nc\n",
    );
    assert_eq!(s.output.matches("returned 1 value(s):").count(), 1);
}

#[test]
fn stepping_onto_breakpoint_prompts_once() {
    // Trap the LOADN at pc 1, then single-step onto it. The step pause
    // already showed the instruction, so the trap only prints its banner
    // and resumes; the next prompt is at the following instruction.
    let s = session("v = 10\nprint(v)", "b *1\ns\ns\nc\n");
    assert_eq!(
        s.output
            .matches("breakpoint hit in function '??'")
            .count(),
        1,
        "output:\n{}",
        s.output
    );
    assert_eq!(
        s.output.matches("LOADN R0 10").count(),
        1,
        "a second REPL entry would disassemble the instruction again:\n{}",
        s.output
    );
    assert_contains(&s.output, "\n10\n");
}

#[test]
fn quit_interrupts_the_program() {
    let s = session("print(1)\nprint(2)", "q\n");
    assert!(s.interrupted);
    assert_not_contains(&s.output, "\n2\n");
}

// ---------------------------------------------------------------------------
// Patch
// ---------------------------------------------------------------------------

#[test]
fn patch_rewrites_operand_in_place() {
    let s = session("v = 10\nprint(v)", "s\npatch d 42\nc\n");
    // Re-disassembly shows the patched operand, and execution uses it.
    assert_contains(&s.output, "LOADN R0 42");
    assert_contains(&s.output, "\n42\n");
}

#[test]
fn patch_rejects_out_of_range_values() {
    let s = session("v = 10\nprint(v)", "s\npatch d 40000\npatch a 300\nc\n");
    assert_contains(&s.output, "val must be -32768-32767 for this operand");
    assert_contains(&s.output, "val must be 0-255 for this operand");
    assert_contains(&s.output, "\n10\n");
}

#[test]
fn patch_rejects_unknown_operand() {
    let s = session("v = 1", "s\npatch z 1\npatch d x\nc\n");
    assert_contains(&s.output, "invalid operand");
    assert_contains(&s.output, "val must be an integer");
}

// ---------------------------------------------------------------------------
// Inspect
// ---------------------------------------------------------------------------

#[test]
fn inspect_shows_function_info() {
    let s = session("print(1)", "i\nc\n");
    assert_contains(&s.output, "=> ??() at test.nula:1");
}

#[test]
fn inspect_locals_marks_inactive_slots() {
    let s = session(
        "function f(a) local b = a + 1 return b end\nprint(f(1))",
        "b f\nc\ni locals\nc\n",
    );
    // At the first instruction of f the parameter is live, b is not yet.
    assert_contains(&s.output, "R0 = a");
    assert_contains(&s.output, "R1 = b ; inactive");
}

#[test]
fn inspect_registers_and_constants() {
    let s = session(
        "function f(a) return a end\nprint(f(9))",
        "b f\nc\ni R0\ni R99\ni K0\ni Kx\nc\n",
    );
    assert_contains(&s.output, "\n9\n");
    assert_contains(&s.output, "index out of range");
    assert_contains(&s.output, "index must be a number");
}

#[test]
fn inspect_breakpoints_and_funcs_tabulate() {
    let s = session(
        "function f() return 1 end\nprint(f())",
        "b f\ni breakpoints\ni funcs\nc\nc\n",
    );
    assert_contains(&s.output, "n    active   location");
    assert_contains(&s.output, "test.nula:1");
    assert_contains(&s.output, "n    func");
    assert_contains(&s.output, "f");
}

#[test]
fn inspect_stack_lays_out_registers() {
    let s = session("local a = 5 local b = 6 print(a + b)", "s\ni stack\nc\n");
    assert_contains(&s.output, "R0");
    assert_contains(&s.output, "\n11\n");
}

#[test]
fn inspect_unknown_subcommand() {
    let s = session("print(1)", "i widgets\nc\n");
    assert_contains(&s.output, "unknown subcommand");
}

// ---------------------------------------------------------------------------
// Disassembly
// ---------------------------------------------------------------------------

#[test]
fn disasm_lists_current_function_with_pc_prefix() {
    let s = session("v = 10", "disasm\nc\n");
    assert_contains(&s.output, "  0000  PREPVARARGS R0");
    assert_contains(&s.output, "LOADN R0 10");
    assert_contains(&s.output, "RETURN R0 0");
}

#[test]
fn disasm_by_name_and_unknown_name() {
    let s = session(
        "function f() return 1 end\nprint(f())",
        "disasm f\ndisasm nope\nc\n",
    );
    assert_contains(&s.output, "LOADN R0 1");
    assert_contains(&s.output, "function not found");
}

#[test]
fn disassembly_is_stable_across_breakpoint_cycles() {
    // Round-trip property: install, toggle and delete breakpoints, then
    // compare listings against a pristine session.
    let source = "function f() return 1 + 2 end\nprint(f())";
    let clean = session(source, "disasm f\nc\n");
    let cycled = session(
        source,
        "b f\ntoggle 1\ntoggle 1\nd 1\ndisasm f\nc\n",
    );
    let listing = |out: &str| -> Vec<String> {
        out.lines()
            .filter(|l| l.contains("  00"))
            .map(str::to_string)
            .collect()
    };
    assert_eq!(listing(&clean.output), listing(&cycled.output));
}

// ---------------------------------------------------------------------------
// Embedded evaluation
// ---------------------------------------------------------------------------

#[test]
fn default_command_evaluates_source_line() {
    let s = session("print(1)", "print(21 * 2)\nc\n");
    assert_contains(&s.output, "\n42\n");
}

#[test]
fn evaluation_errors_print_delimited_traceback() {
    let s = session("print(1)", "nosuchfn()\nc\n");
    assert_contains(&s.output, "attempt to call a nil value");
    assert_contains(&s.output, "Stack Begin");
    assert_contains(&s.output, "Stack End");
}

#[test]
fn evaluation_can_mutate_globals() {
    let s = session("v = 1\nprint(v)", "s\ns\ns\nv = 5\nc\n");
    // The assignment from the REPL wins before print runs.
    assert_contains(&s.output, "\n5\n");
}

#[test]
fn compile_errors_are_reported_and_loop_continues() {
    let s = session("print(1)", "return +\nhelp\nc\n");
    assert_contains(&s.output, "unexpected");
    assert_contains(&s.output, "b, break <loc>");
    assert_contains(&s.output, "\n1\n");
}

// ---------------------------------------------------------------------------
// GC commands through the REPL
// ---------------------------------------------------------------------------

#[test]
fn gc_pause_resume_misuse_is_reported() {
    let s = session(
        "print(1)",
        "gc pause\ngc pause\ngc resume\ngc resume\nc\n",
    );
    assert_contains(&s.output, "GC is already paused");
    assert_contains(&s.output, "GC is not paused");
}

#[test]
fn gc_summary_prints_totals() {
    let s = session("print(1)", "gc\nc\n");
    assert_contains(&s.output, "total bytes allocated:");
    assert_contains(&s.output, "total GC objects allocated:");
}

#[test]
fn gc_stats_prints_color_breakdown() {
    let s = session("print(1)", "gc full\ngc stats\nc\n");
    assert_contains(&s.output, "of them are white");
    assert_contains(&s.output, "of them are fixed");
    assert_contains(&s.output, "heap goal size:");
}

#[test]
fn gc_list_filters() {
    let s = session("w = \"needle\"\nprint(w)", "s\ns\ns\ngc list type=string\nc\n");
    assert_contains(&s.output, "\"needle\"");
    assert_contains(&s.output, "total objects:");
}

// ---------------------------------------------------------------------------
// Nula libraries
// ---------------------------------------------------------------------------

#[test]
fn load_command_binds_library_globals() {
    use ndbg::debugger::NULA_SIGNATURE;

    let lib_blob = compile(
        "function lib_fn() return 123 end",
        &CompileOptions::default(),
    )
    .unwrap();
    let mut image = NULA_SIGNATURE.to_le_bytes().to_vec();
    image.extend_from_slice(&lib_blob);

    let dir = std::env::temp_dir().join(format!("ndbg-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("lib.nula");
    std::fs::write(&path, &image).unwrap();

    let commands = format!("load {}\nprint(lib_fn())\nc\n", path.display());
    let s = session("print(1)", &commands);
    assert_contains(&s.output, "\n123\n");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn load_rejects_missing_file() {
    let s = session("print(1)", "load /no/such/file.nula\nc\n");
    assert_contains(&s.output, "unable to open file");
}

// ---------------------------------------------------------------------------
// Program-level behavior
// ---------------------------------------------------------------------------

#[test]
fn program_output_is_untouched_without_pauses() {
    let s = session(
        "local t = 0\nfor i = 1, 5 do t = t + i end\nprint(t)",
        "c\n",
    );
    assert_contains(&s.output, "\n15\n");
}

#[test]
fn values_print_like_the_vm_prints_them() {
    let s = session(
        "print(0.5)\nprint(true)\nprint(nil)\nprint(\"text\")",
        "c\n",
    );
    assert_contains(&s.output, "0.5\n");
    assert_contains(&s.output, "true\n");
    assert_contains(&s.output, "nil\n");
    assert_contains(&s.output, "text\n");
}

#[test]
fn vm_results_are_observable_after_session() {
    // Sanity: the session harness leaves the VM in a clean state.
    let blob = compile("return 2 + 3", &CompileOptions::default()).unwrap();
    let mut vm = Vm::new();
    let closure = vm.load_blob(&blob, "@direct").unwrap();
    assert_eq!(vm.call(closure, &[], -1).unwrap(), vec![Value::Number(5.0)]);
}
