//! Register-machine dispatch loop.
//!
//! Split from `vm.rs` the way the dispatch helpers are split in the rest of
//! the runtime: `vm.rs` owns the state, this module owns execution. The
//! debugger integrates here at exactly two points: the step hook runs before
//! every instruction while hooks are attached, and executing a BREAK word
//! runs the break hook and then dispatches the original opcode recovered
//! from the prototype's shadow array.

use crate::bytecode::{Insn, Opcode};
use crate::gc::{Closure, GcObject};
use crate::proto::ProtoRef;
use crate::value::{tostring, Value};
use crate::vm::{CallInfo, ReturnedFrame, Vm, VmError, VmStatus};

pub const CAPTURE_VAL: u8 = 0;
pub const CAPTURE_REF: u8 = 1;
pub const CAPTURE_UPVAL: u8 = 2;

enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    IDiv,
}

impl Vm {
    /// Call a function value with `args`, running the interpreter until the
    /// call returns. `nresults < 0` means "all results".
    pub fn call(
        &mut self,
        func: Value,
        args: &[Value],
        nresults: i32,
    ) -> Result<Vec<Value>, VmError> {
        let func_slot = self.top;
        self.ensure_stack(func_slot + 1 + args.len());
        self.stack[func_slot] = func;
        for (i, &a) in args.iter().enumerate() {
            self.stack[func_slot + 1 + i] = a;
        }
        self.top = func_slot + 1 + args.len();

        let entry_depth = self.ci.len();
        let pushed = self.enter_call(func_slot, args.len(), nresults)?;
        if pushed {
            self.run(entry_depth)?;
        }

        let count = self.top.saturating_sub(func_slot);
        let results = self.stack[func_slot..func_slot + count].to_vec();
        self.top = func_slot;
        Ok(results)
    }

    /// Protected call: on error the call stack and stack top are unwound to
    /// their state at entry.
    pub fn pcall(
        &mut self,
        func: Value,
        args: &[Value],
        nresults: i32,
    ) -> Result<Vec<Value>, VmError> {
        let depth = self.ci.len();
        let top = self.top;
        let result = self.call(func, args, nresults);
        if result.is_err() {
            self.ci.truncate(depth);
            self.top = top;
        }
        result
    }

    pub fn interrupted(&self) -> bool {
        self.status == VmStatus::ErrRun
    }

    /// Begin a call at `func_slot`. Native functions run inline and leave
    /// their results in place; returns whether a script frame was pushed.
    fn enter_call(
        &mut self,
        func_slot: usize,
        nargs: usize,
        nresults: i32,
    ) -> Result<bool, VmError> {
        let callee = self.stack_at(func_slot);
        let Value::Function(r) = callee else {
            return Err(self.error(format!(
                "attempt to call a {} value",
                callee.type_name()
            )));
        };

        enum Kind {
            Native(crate::vm::NativeFn),
            Script(ProtoRef),
        }
        let kind = match self.heap.get(r) {
            Some(GcObject::Function(Closure::Native { func, .. })) => Kind::Native(*func),
            Some(GcObject::Function(Closure::Lua { proto, .. })) => Kind::Script(proto.clone()),
            _ => return Err(self.error("attempt to call a non-function object")),
        };

        self.ensure_stack(func_slot + 1 + nargs);
        match kind {
            Kind::Native(func) => {
                let args = self.stack[func_slot + 1..func_slot + 1 + nargs].to_vec();
                let results = func(self, &args)?;
                let count = results.len();
                self.ensure_stack(func_slot + count.max(nresults.max(0) as usize));
                for (i, v) in results.into_iter().enumerate() {
                    self.stack[func_slot + i] = v;
                }
                if nresults < 0 {
                    self.top = func_slot + count;
                } else {
                    for i in count..nresults as usize {
                        self.stack[func_slot + i] = Value::Nil;
                    }
                    self.top = func_slot + nresults as usize;
                }
                Ok(false)
            }
            Kind::Script(proto) => {
                let base = func_slot + 1;
                let frame_top = base + proto.maxstacksize as usize;
                self.ensure_stack(frame_top);
                for i in base + nargs..frame_top {
                    self.stack[i] = Value::Nil;
                }
                self.top = frame_top;
                self.ci.push(CallInfo {
                    closure: r,
                    func_slot,
                    base,
                    top: frame_top,
                    savedpc: 0,
                    nresults,
                });
                Ok(true)
            }
        }
    }

    /// Run frames until the call stack shrinks back to `entry_depth`.
    fn run(&mut self, entry_depth: usize) -> Result<(), VmError> {
        while self.ci.len() > entry_depth {
            let ci_idx = self.ci.len() - 1;
            let pc = self.ci[ci_idx].savedpc;
            let proto = self
                .current_proto()
                .ok_or_else(|| self.error("frame without prototype"))?;

            let Some(word) = proto.insn_at(pc) else {
                return Err(self.error("program counter ran past end of code"));
            };
            let was_trap = word.raw_op() == Opcode::Break as u8;
            self.ci[ci_idx].savedpc = pc + 1;

            let mut step_paused = false;
            if self.single_step {
                if let Some(dbg) = self.debug.clone() {
                    // A busy debugger means we are evaluating on its behalf;
                    // run without pausing.
                    if let Ok(mut d) = dbg.try_borrow_mut() {
                        let ar = self.debug_record(false);
                        step_paused = d.on_step(self, &ar);
                    }
                }
                if self.status != VmStatus::Ok {
                    return Err(self.error("interrupted"));
                }
            }

            // Re-read the word: the hook may have patched operands or
            // installed a trap at this very pc. A trap installed while
            // paused here only fires on the next arrival.
            let mut insn = proto
                .insn_at(pc)
                .ok_or_else(|| self.error("program counter ran past end of code"))?;
            if insn.raw_op() == Opcode::Break as u8 {
                if was_trap {
                    if let Some(dbg) = self.debug.clone() {
                        if let Ok(mut d) = dbg.try_borrow_mut() {
                            // A step pause already happened here; the break
                            // hook is only resuming past the trap.
                            let ar = self.debug_record(step_paused);
                            d.on_break(self, &ar);
                        }
                    }
                    if self.status != VmStatus::Ok {
                        return Err(self.error("interrupted"));
                    }
                    insn = proto
                        .insn_at(pc)
                        .ok_or_else(|| self.error("program counter ran past end of code"))?;
                }
                let real = proto
                    .debuginsn
                    .borrow()
                    .as_ref()
                    .map(|di| di[pc])
                    .ok_or_else(|| self.error("trap without shadow opcode"))?;
                insn = insn.with_op(real);
            }

            self.exec_insn(ci_idx, &proto, pc, insn)?;
        }
        Ok(())
    }

    fn exec_insn(
        &mut self,
        ci_idx: usize,
        proto: &ProtoRef,
        pc: usize,
        insn: Insn,
    ) -> Result<(), VmError> {
        let base = self.ci[ci_idx].base;
        let op = insn
            .op()
            .ok_or_else(|| self.error(format!("invalid opcode {}", insn.raw_op())))?;

        macro_rules! reg {
            ($i:expr) => {
                self.stack_at(base + $i as usize)
            };
        }
        macro_rules! set_reg {
            ($i:expr, $v:expr) => {{
                let idx = base + $i as usize;
                self.ensure_stack(idx + 1);
                self.stack[idx] = $v;
            }};
        }
        macro_rules! kst {
            ($i:expr) => {
                proto
                    .k
                    .get($i as usize)
                    .copied()
                    .ok_or_else(|| self.error("constant index out of range"))?
            };
        }
        macro_rules! aux {
            () => {{
                self.ci[ci_idx].savedpc = pc + 2;
                proto
                    .insn_at(pc + 1)
                    .ok_or_else(|| self.error("missing auxiliary word"))?
                    .0
            }};
        }
        macro_rules! jump {
            ($offset:expr) => {
                self.ci[ci_idx].savedpc = (pc as i64 + 1 + $offset as i64) as usize
            };
        }

        match op {
            Opcode::Nop | Opcode::Coverage | Opcode::PrepVarargs | Opcode::CloseUpvals => {}
            Opcode::NativeCall
            | Opcode::FastCall
            | Opcode::FastCall1 => {
                // Builtin fast paths are hints; falling through to the slow
                // CALL that follows is always valid.
            }
            Opcode::FastCall2 | Opcode::FastCall2K | Opcode::FastCall3 => {
                let _ = aux!();
            }

            Opcode::Break => {
                return Err(self.error("trap executed without debugger"));
            }

            Opcode::LoadNil => set_reg!(insn.a(), Value::Nil),
            Opcode::LoadB => {
                set_reg!(insn.a(), Value::Boolean(insn.b() != 0));
                self.ci[ci_idx].savedpc = pc + 1 + insn.c() as usize;
            }
            Opcode::LoadN => set_reg!(insn.a(), Value::Number(insn.d() as f64)),
            Opcode::LoadK => set_reg!(insn.a(), kst!(insn.d() as u16)),
            Opcode::LoadKX => {
                let k = aux!();
                set_reg!(insn.a(), kst!(k));
            }
            Opcode::Move => set_reg!(insn.a(), reg!(insn.b())),

            Opcode::GetGlobal => {
                let name = self.const_str(proto, insn.b() as usize)?;
                let v = self.globals.get(&name).copied().unwrap_or(Value::Nil);
                set_reg!(insn.a(), v);
            }
            Opcode::SetGlobal => {
                let name = self.const_str(proto, insn.b() as usize)?;
                let v = reg!(insn.a());
                self.globals.insert(name, v);
            }
            Opcode::GetImport => {
                let path = aux!();
                let v = self.resolve_import(proto, path)?;
                set_reg!(insn.a(), v);
            }

            Opcode::GetUpval => {
                let v = self.upvalue(ci_idx, insn.b() as usize)?;
                set_reg!(insn.a(), v);
            }
            Opcode::SetUpval => {
                let v = reg!(insn.a());
                self.set_upvalue(ci_idx, insn.b() as usize, v)?;
            }

            Opcode::GetTable => {
                let t = reg!(insn.b());
                let key = reg!(insn.c());
                set_reg!(insn.a(), self.table_get(t, key)?);
            }
            Opcode::SetTable => {
                let t = reg!(insn.b());
                let key = reg!(insn.c());
                let v = reg!(insn.a());
                self.table_put(t, key, v)?;
            }
            Opcode::GetTableKS => {
                let k = aux!();
                let t = reg!(insn.b());
                let key = kst!(k);
                set_reg!(insn.a(), self.table_get(t, key)?);
            }
            Opcode::SetTableKS => {
                let k = aux!();
                let t = reg!(insn.b());
                let key = kst!(k);
                let v = reg!(insn.a());
                self.table_put(t, key, v)?;
            }
            Opcode::GetTableN => {
                let t = reg!(insn.b());
                let key = Value::Number(insn.c() as f64 + 1.0);
                set_reg!(insn.a(), self.table_get(t, key)?);
            }
            Opcode::SetTableN => {
                let t = reg!(insn.b());
                let key = Value::Number(insn.c() as f64 + 1.0);
                let v = reg!(insn.a());
                self.table_put(t, key, v)?;
            }
            Opcode::NewTable => {
                let _size_hint = aux!();
                let t = self.heap.alloc_table(0);
                set_reg!(insn.a(), Value::Table(t));
            }
            Opcode::DupTable => {
                // Template tables cannot appear in this constant pool
                // format; an empty table has the same observable shape.
                let t = self.heap.alloc_table(0);
                set_reg!(insn.a(), Value::Table(t));
            }
            Opcode::SetList => {
                let start = aux!() as usize;
                let t = reg!(insn.a());
                let b = base + insn.b() as usize;
                let count = if insn.c() == 0 {
                    self.top.saturating_sub(b)
                } else {
                    insn.c() as usize - 1
                };
                for i in 0..count {
                    let v = self.stack_at(b + i);
                    let key = Value::Number((start + i) as f64);
                    self.table_put(t, key, v)?;
                }
            }

            Opcode::NameCall => {
                let k = aux!();
                let obj = reg!(insn.b());
                let key = kst!(k);
                let method = self.table_get(obj, key)?;
                set_reg!(insn.a().wrapping_add(1), obj);
                set_reg!(insn.a(), method);
            }

            Opcode::NewClosure => {
                let child = proto
                    .protos
                    .get(insn.d() as usize)
                    .cloned()
                    .ok_or_else(|| self.error("child prototype index out of range"))?;
                let nups = child.nups as usize;
                let mut upvals = Vec::with_capacity(nups);
                for i in 0..nups {
                    let cap = proto
                        .insn_at(pc + 1 + i)
                        .filter(|c| c.op() == Some(Opcode::Capture))
                        .ok_or_else(|| self.error("missing CAPTURE after NEWCLOSURE"))?;
                    let v = match cap.a() {
                        CAPTURE_VAL | CAPTURE_REF => reg!(cap.b()),
                        CAPTURE_UPVAL => self.upvalue(ci_idx, cap.b() as usize)?,
                        other => {
                            return Err(self.error(format!("invalid capture kind {}", other)))
                        }
                    };
                    upvals.push(v);
                }
                self.ci[ci_idx].savedpc = pc + 1 + nups;
                let r = self
                    .heap
                    .alloc_closure(Closure::Lua { proto: child, upvals }, proto.memcat);
                set_reg!(insn.a(), Value::Function(r));
            }
            Opcode::Capture => {
                return Err(self.error("orphan CAPTURE instruction"));
            }
            Opcode::DupClosure => {
                set_reg!(insn.a(), kst!(insn.d() as u16));
            }

            Opcode::Call => {
                let func_slot = base + insn.a() as usize;
                let nargs = if insn.b() == 0 {
                    self.top.saturating_sub(func_slot + 1)
                } else {
                    let n = insn.b() as usize - 1;
                    self.top = func_slot + 1 + n;
                    n
                };
                let nresults = insn.c() as i32 - 1;
                self.enter_call(func_slot, nargs, nresults)?;
            }

            Opcode::Return => {
                let ra = base + insn.a() as usize;
                let count = if insn.b() == 0 {
                    self.top.saturating_sub(ra)
                } else {
                    insn.b() as usize - 1
                };
                self.ensure_stack(ra + count);
                let values = self.stack[ra..ra + count].to_vec();
                let frame = self.ci.pop().expect("returning frame");
                self.returned = Some(ReturnedFrame {
                    proto: proto.clone(),
                    ret_pc: pc,
                    base,
                    top: ra + count,
                    values: values.clone(),
                });
                let dst = frame.func_slot;
                self.ensure_stack(dst + count.max(frame.nresults.max(0) as usize));
                for (i, v) in values.into_iter().enumerate() {
                    self.stack[dst + i] = v;
                }
                if frame.nresults < 0 {
                    self.top = dst + count;
                } else {
                    for i in count..frame.nresults as usize {
                        self.stack[dst + i] = Value::Nil;
                    }
                    self.top = dst + frame.nresults as usize;
                }
            }

            Opcode::GetVarargs => {
                // Varargs are not forwarded by this runtime; the slots read
                // as nil.
                let a = base + insn.a() as usize;
                if insn.b() == 0 {
                    self.top = a;
                } else {
                    for i in 0..insn.b() as usize - 1 {
                        self.ensure_stack(a + i + 1);
                        self.stack[a + i] = Value::Nil;
                    }
                }
            }

            Opcode::Jump | Opcode::JumpBack => jump!(insn.d()),
            Opcode::JumpX => jump!(insn.e_field()),
            Opcode::JumpIf => {
                if reg!(insn.a()).is_truthy() {
                    jump!(insn.d());
                }
            }
            Opcode::JumpIfNot => {
                if !reg!(insn.a()).is_truthy() {
                    jump!(insn.d());
                }
            }

            Opcode::JumpIfEq
            | Opcode::JumpIfLe
            | Opcode::JumpIfLt
            | Opcode::JumpIfNotEq
            | Opcode::JumpIfNotLe
            | Opcode::JumpIfNotLt => {
                let rhs_reg = aux!();
                let lhs = reg!(insn.a());
                let rhs = self.stack_at(base + rhs_reg as usize);
                let cond = match op {
                    Opcode::JumpIfEq => lhs == rhs,
                    Opcode::JumpIfNotEq => lhs != rhs,
                    Opcode::JumpIfLe => self.values_le(lhs, rhs)?,
                    Opcode::JumpIfNotLe => !self.values_le(lhs, rhs)?,
                    Opcode::JumpIfLt => self.values_lt(lhs, rhs)?,
                    Opcode::JumpIfNotLt => !self.values_lt(lhs, rhs)?,
                    _ => unreachable!(),
                };
                if cond {
                    jump!(insn.d());
                }
            }

            Opcode::JumpXEqKNil | Opcode::JumpXEqKB | Opcode::JumpXEqKN | Opcode::JumpXEqKS => {
                let aux = aux!();
                let negate = aux & 0x8000_0000 != 0;
                let lhs = reg!(insn.a());
                let eq = match op {
                    Opcode::JumpXEqKNil => lhs == Value::Nil,
                    Opcode::JumpXEqKB => lhs == Value::Boolean(aux & 1 != 0),
                    _ => lhs == kst!(aux & 0x00ff_ffff),
                };
                if eq != negate {
                    jump!(insn.d());
                }
            }

            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod
            | Opcode::Pow | Opcode::IDiv => {
                let lhs = reg!(insn.b());
                let rhs = reg!(insn.c());
                let v = self.arith(arith_kind(op), lhs, rhs)?;
                set_reg!(insn.a(), v);
            }
            Opcode::AddK | Opcode::SubK | Opcode::MulK | Opcode::DivK | Opcode::ModK
            | Opcode::PowK | Opcode::IDivK => {
                let lhs = reg!(insn.b());
                let rhs = kst!(insn.c());
                let v = self.arith(arith_kind(op), lhs, rhs)?;
                set_reg!(insn.a(), v);
            }
            Opcode::SubRK => {
                let lhs = kst!(insn.b());
                let rhs = reg!(insn.c());
                let v = self.arith(ArithOp::Sub, lhs, rhs)?;
                set_reg!(insn.a(), v);
            }
            Opcode::DivRK => {
                let lhs = kst!(insn.b());
                let rhs = reg!(insn.c());
                let v = self.arith(ArithOp::Div, lhs, rhs)?;
                set_reg!(insn.a(), v);
            }

            Opcode::And => {
                let b = reg!(insn.b());
                set_reg!(insn.a(), if b.is_truthy() { reg!(insn.c()) } else { b });
            }
            Opcode::Or => {
                let b = reg!(insn.b());
                set_reg!(insn.a(), if b.is_truthy() { b } else { reg!(insn.c()) });
            }
            Opcode::AndK => {
                let b = reg!(insn.b());
                set_reg!(insn.a(), if b.is_truthy() { kst!(insn.c()) } else { b });
            }
            Opcode::OrK => {
                let b = reg!(insn.b());
                set_reg!(insn.a(), if b.is_truthy() { b } else { kst!(insn.c()) });
            }

            Opcode::Not => {
                set_reg!(insn.a(), Value::Boolean(!reg!(insn.b()).is_truthy()));
            }
            Opcode::Minus => {
                let v = reg!(insn.b());
                match v {
                    Value::Number(n) => set_reg!(insn.a(), Value::Number(-n)),
                    other => {
                        return Err(self.error(format!(
                            "attempt to perform arithmetic on a {} value",
                            other.type_name()
                        )))
                    }
                }
            }
            Opcode::Length => {
                let v = reg!(insn.b());
                let len = match v {
                    Value::Str(r) => self
                        .heap
                        .get_str(r)
                        .map(|s| s.len())
                        .unwrap_or(0),
                    Value::Table(r) => match self.heap.get(r) {
                        Some(GcObject::Table(t)) => t.length(),
                        _ => 0,
                    },
                    other => {
                        return Err(self.error(format!(
                            "attempt to get length of a {} value",
                            other.type_name()
                        )))
                    }
                };
                set_reg!(insn.a(), Value::Number(len as f64));
            }

            Opcode::Concat => {
                let mut out = String::new();
                for i in insn.b()..=insn.c() {
                    let v = self.stack_at(base + i as usize);
                    match v {
                        Value::Str(_) | Value::Number(_) => {
                            out.push_str(&tostring(&self.heap, v))
                        }
                        other => {
                            return Err(self.error(format!(
                                "attempt to concatenate a {} value",
                                other.type_name()
                            )))
                        }
                    }
                }
                let r = self.heap.alloc_str(&out, 0);
                set_reg!(insn.a(), Value::Str(r));
            }

            Opcode::ForNPrep => {
                let a = insn.a() as usize;
                let limit = self.number_at(base + a, "'for' limit")?;
                let step = self.number_at(base + a + 1, "'for' step")?;
                let index = self.number_at(base + a + 2, "'for' initial value")?;
                let done = if step > 0.0 { index > limit } else { index < limit };
                if done {
                    jump!(insn.d());
                }
            }
            Opcode::ForNLoop => {
                let a = insn.a() as usize;
                let limit = self.number_at(base + a, "'for' limit")?;
                let step = self.number_at(base + a + 1, "'for' step")?;
                let index = self.number_at(base + a + 2, "'for' index")? + step;
                self.stack[base + a + 2] = Value::Number(index);
                let cont = if step > 0.0 { index <= limit } else { index >= limit };
                if cont {
                    jump!(insn.d());
                }
            }

            Opcode::ForGLoop
            | Opcode::ForGPrep
            | Opcode::ForGPrepNext
            | Opcode::ForGPrepINext => {
                return Err(self.error(format!(
                    "unsupported opcode {} in this runtime",
                    op.name()
                )));
            }
        }
        Ok(())
    }

    // -- Dispatch helpers --

    fn const_str(&self, proto: &ProtoRef, idx: usize) -> Result<String, VmError> {
        let k = proto
            .k
            .get(idx)
            .ok_or_else(|| self.error("constant index out of range"))?;
        match k {
            Value::Str(r) => self
                .heap
                .get_str(*r)
                .map(str::to_string)
                .ok_or_else(|| self.error("dangling string constant")),
            _ => Err(self.error("constant is not a string")),
        }
    }

    fn resolve_import(&self, proto: &ProtoRef, aux: u32) -> Result<Value, VmError> {
        let count = (aux >> 30) as usize;
        if count == 0 {
            return Ok(Value::Nil);
        }
        let ids = [
            (aux >> 20) & 0x3ff,
            (aux >> 10) & 0x3ff,
            aux & 0x3ff,
        ];
        let first = self.const_str(proto, ids[0] as usize)?;
        let mut v = self.globals.get(&first).copied().unwrap_or(Value::Nil);
        for &id in ids.iter().take(count).skip(1) {
            let key = proto
                .k
                .get(id as usize)
                .copied()
                .ok_or_else(|| self.error("constant index out of range"))?;
            v = self.table_get(v, key)?;
        }
        Ok(v)
    }

    fn upvalue(&self, ci_idx: usize, idx: usize) -> Result<Value, VmError> {
        let r = self.ci[ci_idx].closure;
        match self.heap.get(r) {
            Some(GcObject::Function(Closure::Lua { upvals, .. })) => Ok(upvals
                .get(idx)
                .copied()
                .unwrap_or(Value::Nil)),
            _ => Err(self.error("frame closure has no upvalues")),
        }
    }

    fn set_upvalue(&mut self, ci_idx: usize, idx: usize, v: Value) -> Result<(), VmError> {
        let r = self.ci[ci_idx].closure;
        match self.heap.get_mut(r) {
            Some(GcObject::Function(Closure::Lua { upvals, .. })) => {
                if idx < upvals.len() {
                    upvals[idx] = v;
                    Ok(())
                } else {
                    Err(VmError::new("upvalue index out of range"))
                }
            }
            _ => Err(VmError::new("frame closure has no upvalues")),
        }
    }

    fn table_get(&self, t: Value, key: Value) -> Result<Value, VmError> {
        match t {
            Value::Table(r) => match self.heap.get(r) {
                Some(GcObject::Table(table)) => Ok(table.get(key)),
                _ => Ok(Value::Nil),
            },
            other => Err(self.error(format!(
                "attempt to index a {} value",
                other.type_name()
            ))),
        }
    }

    fn table_put(&mut self, t: Value, key: Value, v: Value) -> Result<(), VmError> {
        match t {
            Value::Table(r) => {
                self.heap.table_set(r, key, v);
                Ok(())
            }
            other => Err(self.error(format!(
                "attempt to index a {} value",
                other.type_name()
            ))),
        }
    }

    fn number_at(&self, idx: usize, what: &str) -> Result<f64, VmError> {
        match self.stack_at(idx) {
            Value::Number(n) => Ok(n),
            other => Err(self.error(format!(
                "{} must be a number, got {}",
                what,
                other.type_name()
            ))),
        }
    }

    fn arith(&self, op: ArithOp, lhs: Value, rhs: Value) -> Result<Value, VmError> {
        let (Value::Number(a), Value::Number(b)) = (lhs, rhs) else {
            let bad = if matches!(lhs, Value::Number(_)) { rhs } else { lhs };
            return Err(self.error(format!(
                "attempt to perform arithmetic on a {} value",
                bad.type_name()
            )));
        };
        let n = match op {
            ArithOp::Add => a + b,
            ArithOp::Sub => a - b,
            ArithOp::Mul => a * b,
            ArithOp::Div => a / b,
            ArithOp::Mod => a - (a / b).floor() * b,
            ArithOp::Pow => a.powf(b),
            ArithOp::IDiv => (a / b).floor(),
        };
        Ok(Value::Number(n))
    }

    fn values_lt(&self, lhs: Value, rhs: Value) -> Result<bool, VmError> {
        match (lhs, rhs) {
            (Value::Number(a), Value::Number(b)) => Ok(a < b),
            (Value::Str(a), Value::Str(b)) => {
                Ok(self.heap.get_str(a).unwrap_or("") < self.heap.get_str(b).unwrap_or(""))
            }
            _ => Err(self.error(format!(
                "attempt to compare {} with {}",
                lhs.type_name(),
                rhs.type_name()
            ))),
        }
    }

    fn values_le(&self, lhs: Value, rhs: Value) -> Result<bool, VmError> {
        match (lhs, rhs) {
            (Value::Number(a), Value::Number(b)) => Ok(a <= b),
            (Value::Str(a), Value::Str(b)) => {
                Ok(self.heap.get_str(a).unwrap_or("") <= self.heap.get_str(b).unwrap_or(""))
            }
            _ => Err(self.error(format!(
                "attempt to compare {} with {}",
                lhs.type_name(),
                rhs.type_name()
            ))),
        }
    }
}

fn arith_kind(op: Opcode) -> ArithOp {
    match op {
        Opcode::Add | Opcode::AddK => ArithOp::Add,
        Opcode::Sub | Opcode::SubK => ArithOp::Sub,
        Opcode::Mul | Opcode::MulK => ArithOp::Mul,
        Opcode::Div | Opcode::DivK => ArithOp::Div,
        Opcode::Mod | Opcode::ModK => ArithOp::Mod,
        Opcode::Pow | Opcode::PowK => ArithOp::Pow,
        Opcode::IDiv | Opcode::IDivK => ArithOp::IDiv,
        _ => unreachable!("not an arithmetic opcode"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Proto;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Hand-assemble a proto, the way chunks are hand-emitted in the
    /// runtime's other test suites.
    pub fn make_proto(
        vm: &mut Vm,
        code: Vec<Insn>,
        k: Vec<Value>,
        maxstack: u8,
        numparams: u8,
    ) -> ProtoRef {
        let p = Rc::new(Proto {
            code: RefCell::new(code),
            k,
            upvalues: Vec::new(),
            protos: Vec::new(),
            source: "@test".to_string(),
            debugname: None,
            linedefined: 0,
            lineinfo: None,
            locvars: Vec::new(),
            maxstacksize: maxstack,
            numparams,
            nups: 0,
            is_vararg: false,
            memcat: 0,
            debuginsn: RefCell::new(None),
        });
        vm.heap.register_proto(p.clone(), 0);
        p
    }

    fn closure_of(vm: &mut Vm, p: ProtoRef) -> Value {
        let r = vm
            .heap
            .alloc_closure(Closure::Lua { proto: p, upvals: Vec::new() }, 0);
        Value::Function(r)
    }

    #[test]
    fn loadn_return() {
        let mut vm = Vm::new();
        let p = make_proto(
            &mut vm,
            vec![
                Insn::ad(Opcode::LoadN, 0, 10),
                Insn::abc(Opcode::Return, 0, 2, 0),
            ],
            vec![],
            1,
            0,
        );
        let f = closure_of(&mut vm, p);
        let results = vm.call(f, &[], -1).unwrap();
        assert_eq!(results, vec![Value::Number(10.0)]);
    }

    #[test]
    fn arith_add() {
        let mut vm = Vm::new();
        let p = make_proto(
            &mut vm,
            vec![
                Insn::ad(Opcode::LoadN, 0, 1),
                Insn::ad(Opcode::LoadN, 1, 2),
                Insn::abc(Opcode::Add, 2, 0, 1),
                Insn::abc(Opcode::Return, 2, 2, 0),
            ],
            vec![],
            3,
            0,
        );
        let f = closure_of(&mut vm, p);
        let results = vm.call(f, &[], -1).unwrap();
        assert_eq!(results, vec![Value::Number(3.0)]);
    }

    #[test]
    fn multiple_returns() {
        let mut vm = Vm::new();
        let p = make_proto(
            &mut vm,
            vec![
                Insn::ad(Opcode::LoadN, 0, 7),
                Insn::ad(Opcode::LoadN, 1, 8),
                Insn::abc(Opcode::Return, 0, 3, 0),
            ],
            vec![],
            2,
            0,
        );
        let f = closure_of(&mut vm, p);
        let results = vm.call(f, &[], -1).unwrap();
        assert_eq!(results, vec![Value::Number(7.0), Value::Number(8.0)]);
    }

    #[test]
    fn call_through_global() {
        let mut vm = Vm::new();
        let callee = make_proto(
            &mut vm,
            vec![
                Insn::ad(Opcode::LoadN, 0, 42),
                Insn::abc(Opcode::Return, 0, 2, 0),
            ],
            vec![],
            1,
            0,
        );
        let f = closure_of(&mut vm, callee);
        vm.globals.insert("f".to_string(), f);

        let name = vm.heap.alloc_str_fixed("f", 0);
        let caller = make_proto(
            &mut vm,
            vec![
                Insn::abc(Opcode::GetGlobal, 0, 0, 0),
                Insn::abc(Opcode::Call, 0, 1, 2),
                Insn::abc(Opcode::Return, 0, 2, 0),
            ],
            vec![Value::Str(name)],
            2,
            0,
        );
        let main = closure_of(&mut vm, caller);
        let results = vm.call(main, &[], -1).unwrap();
        assert_eq!(results, vec![Value::Number(42.0)]);
    }

    #[test]
    fn arguments_are_passed_and_padded() {
        let mut vm = Vm::new();
        // return first param + second param (missing second reads as nil ->
        // error), so pass both.
        let p = make_proto(
            &mut vm,
            vec![
                Insn::abc(Opcode::Add, 2, 0, 1),
                Insn::abc(Opcode::Return, 2, 2, 0),
            ],
            vec![],
            3,
            2,
        );
        let f = closure_of(&mut vm, p);
        let results = vm
            .call(f, &[Value::Number(2.0), Value::Number(5.0)], -1)
            .unwrap();
        assert_eq!(results, vec![Value::Number(7.0)]);
    }

    #[test]
    fn loadb_skips() {
        let mut vm = Vm::new();
        // LOADB with c=1 skips the next instruction.
        let p = make_proto(
            &mut vm,
            vec![
                Insn::abc(Opcode::LoadB, 0, 1, 1),
                Insn::ad(Opcode::LoadN, 0, 99),
                Insn::abc(Opcode::Return, 0, 2, 0),
            ],
            vec![],
            1,
            0,
        );
        let f = closure_of(&mut vm, p);
        let results = vm.call(f, &[], -1).unwrap();
        assert_eq!(results, vec![Value::Boolean(true)]);
    }

    #[test]
    fn jumps_and_conditions() {
        let mut vm = Vm::new();
        // if R0 then return 1 else return 2, with R0 = false
        let p = make_proto(
            &mut vm,
            vec![
                Insn::abc(Opcode::LoadB, 0, 0, 0),
                Insn::ad(Opcode::JumpIfNot, 0, 2),
                Insn::ad(Opcode::LoadN, 1, 1),
                Insn::abc(Opcode::Return, 1, 2, 0),
                Insn::ad(Opcode::LoadN, 1, 2),
                Insn::abc(Opcode::Return, 1, 2, 0),
            ],
            vec![],
            2,
            0,
        );
        let f = closure_of(&mut vm, p);
        let results = vm.call(f, &[], -1).unwrap();
        assert_eq!(results, vec![Value::Number(2.0)]);
    }

    #[test]
    fn numeric_for_loop() {
        let mut vm = Vm::new();
        // sum = 0; for i = 1, 4 do sum = sum + i end; return sum
        // R0 sum, R1 limit, R2 step, R3 index
        let p = make_proto(
            &mut vm,
            vec![
                Insn::ad(Opcode::LoadN, 0, 0),
                Insn::ad(Opcode::LoadN, 1, 4),
                Insn::ad(Opcode::LoadN, 2, 1),
                Insn::ad(Opcode::LoadN, 3, 1),
                Insn::ad(Opcode::ForNPrep, 1, 2),
                Insn::abc(Opcode::Add, 0, 0, 3),
                Insn::ad(Opcode::ForNLoop, 1, -2),
                Insn::abc(Opcode::Return, 0, 2, 0),
            ],
            vec![],
            4,
            0,
        );
        let f = closure_of(&mut vm, p);
        let results = vm.call(f, &[], -1).unwrap();
        assert_eq!(results, vec![Value::Number(10.0)]);
    }

    #[test]
    fn call_error_reports_type() {
        let mut vm = Vm::new();
        let err = vm.call(Value::Nil, &[], -1).unwrap_err();
        assert!(err.message.contains("attempt to call a nil value"));
    }

    #[test]
    fn pcall_restores_state() {
        let mut vm = Vm::new();
        let p = make_proto(
            &mut vm,
            vec![
                Insn::ad(Opcode::LoadNil, 0, 0),
                Insn::abc(Opcode::Add, 1, 0, 0),
                Insn::abc(Opcode::Return, 1, 2, 0),
            ],
            vec![],
            2,
            0,
        );
        let f = closure_of(&mut vm, p);
        let err = vm.pcall(f, &[], -1).unwrap_err();
        assert!(err.message.contains("arithmetic"));
        assert_eq!(vm.call_depth(), 0);
        assert_eq!(vm.top, 0);
    }
}
