//! Trap installation and the breakpoint registry.
//!
//! A breakpoint rewrites the opcode byte of a live instruction to BREAK
//! while the prototype's lazily allocated shadow array keeps the original
//! byte. Operand bits are never touched, so disassembly (which reads
//! through the shadow) and restoration are exact. Traps are only ever
//! placed on the first word of an instruction, never on an auxiliary word.

use super::{say, Breakpoint, Debugger};
use nula_rt::{Opcode, Proto, ProtoRef};

/// Allocate the shadow opcode array on first use, seeded from the live
/// code stream.
pub(crate) fn ensure_debug_insn(p: &Proto) {
    let mut shadow = p.debuginsn.borrow_mut();
    if shadow.is_none() {
        *shadow = Some(p.code.borrow().iter().map(|i| i.raw_op()).collect());
    }
}

impl Debugger {
    /// Rewrite the opcode byte at `pc`: to BREAK when enabling, back to the
    /// shadowed original when disabling.
    fn apply_trap(&self, p: &Proto, pc: usize, enable: bool) {
        ensure_debug_insn(p);
        let shadow = p.debuginsn.borrow();
        let original = shadow.as_ref().expect("shadow array")[pc];
        let mut code = p.code.borrow_mut();
        code[pc] = if enable {
            code[pc].with_op(Opcode::Break as u8)
        } else {
            code[pc].with_op(original)
        };
    }

    /// Upsert a breakpoint record, returning its 1-based number. Re-enabling
    /// an existing `(proto, pc)` record never duplicates it.
    fn push_breakpoint(
        &mut self,
        p: &ProtoRef,
        source: String,
        pc: usize,
        line: u32,
    ) -> usize {
        for (i, bp) in self.breakpoints.iter_mut().enumerate() {
            if std::rc::Rc::ptr_eq(&bp.proto, p) && bp.pc == pc {
                bp.enabled = true;
                return i + 1;
            }
        }
        self.breakpoints.push(Breakpoint {
            proto: p.clone(),
            source,
            pc,
            line,
            enabled: true,
        });
        self.breakpoints.len()
    }

    fn remove_record(&mut self, p: &ProtoRef, pc: usize) -> bool {
        let before = self.breakpoints.len();
        self.breakpoints
            .retain(|bp| !(std::rc::Rc::ptr_eq(&bp.proto, p) && bp.pc == pc));
        self.breakpoints.len() != before
    }

    /// Install or clear a trap at an exact location and update the
    /// registry. Returns the breakpoint number on enable, 0 on disable.
    pub fn set_breakpoint_at(
        &mut self,
        p: &ProtoRef,
        pc: usize,
        source: String,
        line: u32,
        enable: bool,
    ) -> usize {
        self.apply_trap(p, pc, enable);
        if enable {
            self.push_breakpoint(p, source, pc, line)
        } else {
            self.remove_record(p, pc);
            0
        }
    }

    /// Set or clear a breakpoint on `source:line` in every registered
    /// prototype that carries line info for that source. Prototypes without
    /// line info are skipped; the trap goes on the first instruction of the
    /// line that is not the vararg prologue.
    pub fn set_breakpoint_by_source_line(
        &mut self,
        source: &str,
        line: u32,
        enable: bool,
    ) -> usize {
        let mut count = 0;
        let mut idx = 0;
        let protos: Vec<ProtoRef> = self.registry.iter().cloned().collect();
        for p in protos {
            if p.lineinfo.is_none() || p.chunk_name() != source {
                continue;
            }
            if let Some(pc) = first_pc_on_line(&p, line) {
                idx = self.set_breakpoint_at(&p, pc, source.to_string(), line, enable);
                count += 1;
            }
        }

        if count > 0 {
            say!(
                self,
                "breakpoint {} {} at {}:{}",
                idx,
                if enable { "set" } else { "cleared" },
                source,
                line
            );
        } else {
            say!(
                self,
                "no functions found matching source '{}' or line number out of range",
                source
            );
        }
        idx
    }

    /// Breakpoint on a prototype's entry: the first instruction that is not
    /// the vararg prologue.
    pub fn set_breakpoint_in_proto(&mut self, p: &ProtoRef, enable: bool) -> usize {
        let Some(pc) = entry_pc(p) else {
            return 0;
        };
        let line = p.line_for_pc(pc).unwrap_or(p.linedefined);
        let source = p.chunk_name();
        let idx = self.set_breakpoint_at(p, pc, source.clone(), line, enable);
        if enable {
            say!(self, "breakpoint {} set at {}:{}", idx, source, line);
        }
        idx
    }

    /// Breakpoint at an explicit PC. If the preceding word starts a
    /// two-word instruction the given PC is its auxiliary word, so back up
    /// to the instruction start.
    pub fn set_breakpoint_by_pc(&mut self, p: &ProtoRef, mut pc: usize) {
        if pc >= p.sizecode() {
            say!(self, "pc out of range");
            return;
        }
        if pc > 0 {
            let prev = p.real_op(pc - 1).and_then(Opcode::from_u8);
            if prev.map(|op| op.len_words()) == Some(2) {
                pc -= 1;
            }
        }
        self.apply_trap(p, pc, true);
        let line = p.line_for_pc(pc).unwrap_or(p.linedefined);
        let source = p.chunk_name();
        let idx = self.push_breakpoint(p, source.clone(), pc, line);
        say!(self, "breakpoint {} set at {}:{}", idx, source, line);
    }

    /// Breakpoint on a function found by debug name, optionally restricted
    /// to one source unit.
    pub fn set_breakpoint_by_func(&mut self, source: Option<&str>, func: &str) {
        let found = self
            .registry
            .iter()
            .find(|p| {
                p.debugname.as_deref() == Some(func)
                    && source.map_or(true, |s| s.is_empty() || s == p.chunk_name())
            })
            .cloned();
        match found {
            Some(p) => {
                self.set_breakpoint_in_proto(&p, true);
            }
            None => say!(self, "function not found"),
        }
    }

    /// Delete a breakpoint by 1-based number, restoring the opcode byte.
    pub fn delete_breakpoint(&mut self, num: usize) {
        if num < 1 || num > self.breakpoints.len() {
            say!(self, "invalid breakpoint number");
            return;
        }
        let bp = self.breakpoints[num - 1].clone();
        if bp.proto.debuginsn.borrow().is_some() {
            self.apply_trap(&bp.proto, bp.pc, false);
        }
        say!(
            self,
            "deleted breakpoint {} at {}:{}",
            num,
            bp.source,
            bp.line
        );
        self.breakpoints.remove(num - 1);
    }

    /// Flip a breakpoint between enabled and disabled.
    pub fn toggle_breakpoint(&mut self, num: usize) {
        if num < 1 || num > self.breakpoints.len() {
            say!(self, "invalid breakpoint number");
            return;
        }
        let (proto, pc, enabled) = {
            let bp = &self.breakpoints[num - 1];
            (bp.proto.clone(), bp.pc, bp.enabled)
        };
        self.apply_trap(&proto, pc, !enabled);
        self.breakpoints[num - 1].enabled = !enabled;
        say!(
            self,
            "breakpoint {} {}",
            num,
            if !enabled { "enabled" } else { "disabled" }
        );
    }
}

/// First PC of a prototype that is not PREPVARARGS, walking whole
/// instructions.
fn entry_pc(p: &Proto) -> Option<usize> {
    walk_pcs(p).find(|&pc| p.real_op(pc) != Some(Opcode::PrepVarargs as u8))
}

/// First PC on `line` that is not PREPVARARGS.
fn first_pc_on_line(p: &Proto, line: u32) -> Option<usize> {
    walk_pcs(p).find(|&pc| {
        p.real_op(pc) != Some(Opcode::PrepVarargs as u8) && p.line_for_pc(pc) == Some(line)
    })
}

/// Iterate instruction start PCs, stepping over auxiliary words.
fn walk_pcs(p: &Proto) -> impl Iterator<Item = usize> + '_ {
    let size = p.sizecode();
    let mut pc = 0;
    std::iter::from_fn(move || {
        if pc >= size {
            return None;
        }
        let current = pc;
        let len = p
            .real_op(pc)
            .and_then(Opcode::from_u8)
            .map(|op| op.len_words())
            .unwrap_or(1);
        pc += len;
        Some(current)
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::ReplInput;
    use nula_rt::{Insn, Value};
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::rc::Rc;

    fn test_debugger() -> Debugger {
        let out: nula_rt::vm::OutSink = Rc::new(RefCell::new(
            Box::new(Vec::new()) as Box<dyn std::io::Write>
        ));
        Debugger::new(ReplInput::script(Cursor::new(Vec::new())), out)
    }

    fn sample_proto() -> ProtoRef {
        Rc::new(Proto {
            code: RefCell::new(vec![
                Insn::abc(Opcode::PrepVarargs, 0, 0, 0),
                Insn::abc(Opcode::GetTableKS, 0, 1, 0),
                Insn::aux(0),
                Insn::ad(Opcode::LoadN, 0, 10),
                Insn::abc(Opcode::Return, 0, 1, 0),
            ]),
            k: vec![Value::Nil],
            upvalues: Vec::new(),
            protos: Vec::new(),
            source: "@bp.nula".to_string(),
            debugname: Some("sample".to_string()),
            linedefined: 1,
            lineinfo: Some(vec![1, 2, 2, 3, 4]),
            locvars: Vec::new(),
            maxstacksize: 2,
            numparams: 0,
            nups: 0,
            is_vararg: true,
            memcat: 0,
            debuginsn: RefCell::new(None),
        })
    }

    use nula_rt::Proto;

    fn op_at(p: &Proto, pc: usize) -> u8 {
        p.code.borrow()[pc].raw_op()
    }

    #[test]
    fn enable_installs_trap_and_shadow() {
        let mut dbg = test_debugger();
        let p = sample_proto();
        let n = dbg.set_breakpoint_at(&p, 3, "bp.nula".to_string(), 3, true);
        assert_eq!(n, 1);
        assert_eq!(op_at(&p, 3), Opcode::Break as u8);
        assert_eq!(
            p.debuginsn.borrow().as_ref().unwrap()[3],
            Opcode::LoadN as u8
        );
        // Operand bits survive the rewrite.
        assert_eq!(p.code.borrow()[3].d(), 10);
    }

    #[test]
    fn disable_restores_original_opcode() {
        let mut dbg = test_debugger();
        let p = sample_proto();
        dbg.set_breakpoint_at(&p, 3, "bp.nula".to_string(), 3, true);
        dbg.set_breakpoint_at(&p, 3, "bp.nula".to_string(), 3, false);
        assert_eq!(op_at(&p, 3), Opcode::LoadN as u8);
        assert!(dbg.breakpoints.is_empty());
    }

    #[test]
    fn re_enable_is_idempotent() {
        let mut dbg = test_debugger();
        let p = sample_proto();
        let first = dbg.set_breakpoint_at(&p, 3, "bp.nula".to_string(), 3, true);
        let second = dbg.set_breakpoint_at(&p, 3, "bp.nula".to_string(), 3, true);
        assert_eq!(first, 1);
        assert_eq!(second, 1);
        assert_eq!(dbg.breakpoints.len(), 1);
    }

    #[test]
    fn entry_skips_prologue() {
        let mut dbg = test_debugger();
        let p = sample_proto();
        dbg.registry.push_unique(p.clone());
        dbg.set_breakpoint_in_proto(&p, true);
        // PREPVARARGS at 0 untouched; trap on the next instruction start.
        assert_eq!(op_at(&p, 0), Opcode::PrepVarargs as u8);
        assert_eq!(op_at(&p, 1), Opcode::Break as u8);
    }

    #[test]
    fn by_pc_backs_off_aux_words() {
        let mut dbg = test_debugger();
        let p = sample_proto();
        // pc 2 is the aux word of the GETTABLEKS at pc 1.
        dbg.set_breakpoint_by_pc(&p, 2);
        assert_eq!(op_at(&p, 1), Opcode::Break as u8);
        assert_eq!(op_at(&p, 2), 0);
        assert_eq!(dbg.breakpoints[0].pc, 1);
    }

    #[test]
    fn by_pc_rejects_out_of_range() {
        let mut dbg = test_debugger();
        let p = sample_proto();
        dbg.set_breakpoint_by_pc(&p, 99);
        assert!(dbg.breakpoints.is_empty());
    }

    #[test]
    fn source_line_lookup_skips_protos_without_lineinfo() {
        let mut dbg = test_debugger();
        let p = sample_proto();
        let mut bare = sample_proto();
        Rc::get_mut(&mut bare).unwrap().lineinfo = None;
        dbg.registry.push_unique(bare.clone());
        dbg.registry.push_unique(p.clone());

        let n = dbg.set_breakpoint_by_source_line("bp.nula", 3, true);
        assert_eq!(n, 1);
        assert_eq!(dbg.breakpoints.len(), 1);
        assert!(Rc::ptr_eq(&dbg.breakpoints[0].proto, &p));
        assert_eq!(op_at(&bare, 3), Opcode::LoadN as u8);
    }

    #[test]
    fn source_line_mismatch_reports_not_found() {
        let mut dbg = test_debugger();
        let p = sample_proto();
        dbg.registry.push_unique(p.clone());
        let n = dbg.set_breakpoint_by_source_line("other.nula", 3, true);
        assert_eq!(n, 0);
        assert!(dbg.breakpoints.is_empty());
    }

    #[test]
    fn toggle_flips_trap() {
        let mut dbg = test_debugger();
        let p = sample_proto();
        dbg.set_breakpoint_at(&p, 3, "bp.nula".to_string(), 3, true);
        dbg.toggle_breakpoint(1);
        assert!(!dbg.breakpoints[0].enabled);
        assert_eq!(op_at(&p, 3), Opcode::LoadN as u8);
        dbg.toggle_breakpoint(1);
        assert!(dbg.breakpoints[0].enabled);
        assert_eq!(op_at(&p, 3), Opcode::Break as u8);
    }

    #[test]
    fn delete_restores_and_renumbers() {
        let mut dbg = test_debugger();
        let p = sample_proto();
        dbg.set_breakpoint_at(&p, 1, "bp.nula".to_string(), 2, true);
        dbg.set_breakpoint_at(&p, 3, "bp.nula".to_string(), 3, true);
        dbg.delete_breakpoint(1);
        assert_eq!(op_at(&p, 1), Opcode::GetTableKS as u8);
        assert_eq!(dbg.breakpoints.len(), 1);
        assert_eq!(dbg.breakpoints[0].pc, 3);
    }

    #[test]
    fn delete_rejects_bad_number() {
        let mut dbg = test_debugger();
        dbg.delete_breakpoint(0);
        dbg.delete_breakpoint(5);
        assert!(dbg.breakpoints.is_empty());
    }

    #[test]
    fn round_trip_preserves_disassembly() {
        use crate::disasm::disasm_proto;
        let mut dbg = test_debugger();
        let p = sample_proto();
        let vm = nula_rt::Vm::new();

        let listing = |p: &Proto| {
            let mut buf = Vec::new();
            disasm_proto(&mut buf, p, &vm.heap).unwrap();
            String::from_utf8(buf).unwrap()
        };
        let before = listing(&p);

        dbg.set_breakpoint_at(&p, 1, "bp.nula".to_string(), 2, true);
        dbg.set_breakpoint_at(&p, 3, "bp.nula".to_string(), 3, true);
        assert_eq!(listing(&p), before, "traps are invisible in listings");

        dbg.toggle_breakpoint(1);
        dbg.toggle_breakpoint(1);
        dbg.delete_breakpoint(2);
        dbg.delete_breakpoint(1);
        assert_eq!(listing(&p), before, "restore is byte-exact");
        // With everything deleted the code bytes equal the shadow bytes.
        let code = p.code.borrow();
        let shadow = p.debuginsn.borrow();
        for (i, insn) in code.iter().enumerate() {
            assert_eq!(insn.raw_op(), shadow.as_ref().unwrap()[i]);
        }
    }
}
