//! Bytecode disassembler.
//!
//! `disasm_one` renders the instruction at `*pc` and advances `*pc` past any
//! auxiliary word it consumes; the caller advances one more word to reach
//! the next instruction. A word holding a trap is rendered as the original
//! instruction it shadows, so installed breakpoints are invisible in
//! listings.

use std::io::{self, Write};

use nula_rt::gc::Heap;
use nula_rt::interp::{CAPTURE_REF, CAPTURE_UPVAL, CAPTURE_VAL};
use nula_rt::value::strprimitive;
use nula_rt::{Insn, Opcode, Proto, Value};

/// Disassemble the instruction at `*pc`, advancing `*pc` past its auxiliary
/// word if it has one.
pub fn disasm_one(
    out: &mut dyn Write,
    pc: &mut usize,
    p: &Proto,
    heap: &Heap,
) -> io::Result<()> {
    let Some(insn) = p.insn_at(*pc) else {
        return write!(out, "INVALID <eof>");
    };
    disasm_word(out, pc, p, heap, insn)
}

/// Disassemble every instruction of a prototype, one per line.
pub fn disasm_proto(out: &mut dyn Write, p: &Proto, heap: &Heap) -> io::Result<()> {
    let mut pc = 0;
    while pc < p.sizecode() {
        disasm_one(out, &mut pc, p, heap)?;
        writeln!(out)?;
        pc += 1;
    }
    Ok(())
}

fn disasm_word(
    out: &mut dyn Write,
    pc: &mut usize,
    p: &Proto,
    heap: &Heap,
    insn: Insn,
) -> io::Result<()> {
    let opbyte = insn.raw_op();
    let Some(op) = Opcode::from_u8(opbyte) else {
        return write!(out, "INVALID {}", opbyte);
    };

    // The instruction index, used as the label base for jump targets.
    let line = *pc as i64;

    if op == Opcode::Break {
        // Render the instruction the trap shadows; its auxiliary word (if
        // any) still sits untouched in the real stream.
        let shadow = p.debuginsn.borrow().as_ref().map(|di| di[*pc]);
        return match shadow {
            Some(real) => disasm_word(out, pc, p, heap, insn.with_op(real)),
            None => write!(out, "BREAK"),
        };
    }

    write!(out, "{}", op.name())?;

    let kdisp = |idx: usize| -> String {
        p.k
            .get(idx)
            .map(|&v| strprimitive(heap, v))
            .unwrap_or_default()
    };
    let upname = |idx: usize| -> Option<&str> {
        p.upvalues.get(idx).map(String::as_str)
    };
    macro_rules! aux {
        () => {{
            *pc += 1;
            p.insn_at(*pc).map(|i| i.0).unwrap_or(0)
        }};
    }

    match op {
        Opcode::LoadNil | Opcode::PrepVarargs | Opcode::ForGPrepINext | Opcode::CloseUpvals => {
            write!(out, " R{}", insn.a())?;
        }
        Opcode::LoadB => {
            let b = if insn.b() != 0 { "true" } else { "false" };
            write!(out, " R{} {}", insn.a(), b)?;
        }
        Opcode::LoadN => {
            write!(out, " R{} {}", insn.a(), insn.d())?;
        }
        Opcode::Move | Opcode::Not | Opcode::Minus | Opcode::Length => {
            write!(out, " R{} R{}", insn.a(), insn.d())?;
        }
        Opcode::LoadK | Opcode::DupTable | Opcode::NewClosure | Opcode::DupClosure => {
            let d = insn.d() as u16 as usize;
            write!(out, " R{} K{} ; {}", insn.a(), d, kdisp(d))?;
        }
        Opcode::LoadKX => {
            let k = aux!() as usize;
            write!(out, " R{} K{} ; {}", insn.a(), k, kdisp(k))?;
        }
        Opcode::GetGlobal | Opcode::SetGlobal => {
            write!(out, " R{} K{}", insn.a(), insn.b())?;
        }
        Opcode::GetUpval | Opcode::SetUpval => {
            write!(out, " R{} U{}", insn.a(), insn.b())?;
            if let Some(name) = upname(insn.b() as usize) {
                write!(out, " ; {}", name)?;
            }
        }
        Opcode::GetImport => {
            write!(out, " R{} K{} ; ", insn.a(), insn.d())?;
            let aux = aux!();
            let count = (aux >> 30) as usize;
            if count >= 1 {
                write!(out, "{}", kpath(p, heap, (aux >> 20) & 0x3ff))?;
                if count >= 2 {
                    write!(out, ".{}", kpath(p, heap, (aux >> 10) & 0x3ff))?;
                    if count == 3 {
                        write!(out, ".{}", kpath(p, heap, aux & 0x3ff))?;
                    }
                }
            }
        }
        Opcode::Add
        | Opcode::Sub
        | Opcode::Mul
        | Opcode::Div
        | Opcode::Mod
        | Opcode::Pow
        | Opcode::And
        | Opcode::Or
        | Opcode::IDiv
        | Opcode::Concat
        | Opcode::GetTable
        | Opcode::SetTable
        | Opcode::IDivK
        | Opcode::AddK
        | Opcode::SubK
        | Opcode::MulK
        | Opcode::DivK
        | Opcode::ModK
        | Opcode::PowK
        | Opcode::AndK
        | Opcode::OrK
        | Opcode::SubRK
        | Opcode::DivRK => {
            write!(out, " R{} R{} R{}", insn.a(), insn.b(), insn.c())?;
        }
        Opcode::GetTableKS | Opcode::SetTableKS | Opcode::NameCall => {
            let k = aux!() as usize;
            write!(
                out,
                " R{} R{} K{} ; {}",
                insn.a(),
                insn.b(),
                k,
                kdisp(k)
            )?;
        }
        Opcode::GetTableN | Opcode::SetTableN => {
            write!(out, " R{} R{} {}", insn.a(), insn.b(), insn.c() as u32 + 1)?;
        }
        Opcode::Call => {
            write!(
                out,
                " R{} {} {}",
                insn.a(),
                insn.b() as i32 - 1,
                insn.c() as i32 - 1
            )?;
        }
        Opcode::Return | Opcode::GetVarargs => {
            write!(out, " R{} {}", insn.a(), insn.b() as i32 - 1)?;
        }
        Opcode::ForGLoop | Opcode::ForNPrep | Opcode::JumpIf | Opcode::JumpIfNot => {
            write!(out, " R{} L{}", insn.a(), line + insn.d() as i64)?;
        }
        Opcode::JumpBack | Opcode::Jump => {
            write!(out, " L{}", line + insn.d() as i64)?;
        }
        Opcode::JumpIfEq
        | Opcode::JumpIfLe
        | Opcode::JumpIfLt
        | Opcode::JumpIfNotEq
        | Opcode::JumpIfNotLe
        | Opcode::JumpIfNotLt => {
            let aux = aux!();
            write!(out, " R{} R{} L{}", insn.a(), aux, line + insn.d() as i64 - 1)?;
        }
        Opcode::NewTable => {
            let aux = aux!();
            write!(out, " R{} {} {}", insn.a(), insn.b(), aux)?;
        }
        Opcode::SetList => {
            let aux = aux!();
            write!(
                out,
                " R{} R{} {} {}",
                insn.a(),
                insn.b(),
                insn.c() as i32 - 1,
                aux
            )?;
        }
        Opcode::ForNLoop => {
            write!(out, " R{} L{}", insn.a(), line + insn.d() as i64 + 2)?;
        }
        Opcode::FastCall => {
            write!(out, " {} L{}", insn.a(), line + insn.c() as i64 + 1)?;
        }
        Opcode::FastCall1 => {
            write!(
                out,
                " {} R{} L{}",
                insn.a(),
                insn.b(),
                line + insn.c() as i64 + 1
            )?;
        }
        Opcode::FastCall2 => {
            let aux = aux!();
            write!(
                out,
                " {} R{} R{} L{}",
                insn.a(),
                insn.b(),
                aux & 0xff,
                line + insn.c() as i64
            )?;
        }
        Opcode::FastCall2K => {
            let aux = aux!() as usize;
            write!(
                out,
                " {} R{} K{} L{} ; {}",
                insn.a(),
                insn.b(),
                aux,
                line + insn.c() as i64,
                kdisp(aux)
            )?;
        }
        Opcode::FastCall3 => {
            let aux = aux!();
            write!(
                out,
                " {} R{} R{} R{} L{}",
                insn.a(),
                insn.b(),
                aux & 0xff,
                (aux >> 8) & 0xff,
                line + insn.c() as i64
            )?;
        }
        Opcode::JumpX => {
            write!(out, " L{}", line + insn.e_field() as i64)?;
        }
        Opcode::Coverage => {
            write!(out, " {}", insn.e_field())?;
        }
        Opcode::Capture => match insn.a() {
            CAPTURE_VAL => write!(out, " VAL R{}", insn.b())?,
            CAPTURE_REF => write!(out, " REF R{}", insn.b())?,
            CAPTURE_UPVAL => {
                write!(out, " UPVAL U{}", insn.b())?;
                if let Some(name) = upname(insn.b() as usize) {
                    write!(out, " ; {}", name)?;
                }
            }
            _ => {}
        },
        Opcode::JumpXEqKNil | Opcode::JumpXEqKB => {
            let aux = aux!();
            write!(out, " R{} L{} {}", insn.a(), line + insn.d() as i64 - 1, aux)?;
        }
        Opcode::JumpXEqKN | Opcode::JumpXEqKS => {
            let aux = aux!() as usize & 0x00ff_ffff;
            write!(
                out,
                " R{} K{} L{} ; {}",
                insn.a(),
                aux,
                line + insn.d() as i64 - 1,
                kdisp(aux)
            )?;
        }
        // No printed operands.
        Opcode::Nop
        | Opcode::Break
        | Opcode::ForGPrep
        | Opcode::ForGPrepNext
        | Opcode::NativeCall => {}
    }
    Ok(())
}

/// Dotted-import path component: the raw string behind a constant index.
fn kpath(p: &Proto, heap: &Heap, idx: u32) -> String {
    match p.k.get(idx as usize) {
        Some(&Value::Str(r)) => heap.get_str(r).unwrap_or_default().to_string(),
        _ => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use nula_rt::{ProtoRef, Vm};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn proto_with(code: Vec<Insn>, k: Vec<Value>) -> ProtoRef {
        Rc::new(Proto {
            code: RefCell::new(code),
            k,
            upvalues: vec!["captured".to_string()],
            protos: Vec::new(),
            source: "@disasm.nula".to_string(),
            debugname: None,
            linedefined: 0,
            lineinfo: None,
            locvars: Vec::new(),
            maxstacksize: 4,
            numparams: 0,
            nups: 1,
            is_vararg: false,
            memcat: 0,
            debuginsn: RefCell::new(None),
        })
    }


    fn lines(p: &Proto, heap: &Heap) -> Vec<String> {
        let mut buf = Vec::new();
        disasm_proto(&mut buf, p, heap).unwrap();
        String::from_utf8(buf)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn loadn_return_listing() {
        let vm = Vm::new();
        let p = proto_with(
            vec![
                Insn::ad(Opcode::LoadN, 0, 10),
                Insn::abc(Opcode::Return, 0, 1, 0),
            ],
            vec![],
        );
        assert_eq!(lines(&p, &vm.heap), vec!["LOADN R0 10", "RETURN R0 0"]);
    }

    #[test]
    fn constants_are_pretty_printed() {
        let mut vm = Vm::new();
        let s = vm.heap.alloc_str_fixed("hello", 0);
        let p = proto_with(
            vec![
                Insn::ad(Opcode::LoadK, 3, 1),
                Insn::abc(Opcode::Return, 0, 1, 0),
            ],
            vec![Value::Number(1.5), Value::Str(s)],
        );
        assert_eq!(
            lines(&p, &vm.heap)[0],
            "LOADK R3 K1 ; \"hello\""
        );
    }

    #[test]
    fn jumps_use_labels() {
        let vm = Vm::new();
        let p = proto_with(
            vec![
                Insn::ad(Opcode::JumpIf, 0, 42),
                Insn::ad(Opcode::Jump, 0, -1),
                Insn::abc(Opcode::Return, 0, 1, 0),
            ],
            vec![],
        );
        let out = lines(&p, &vm.heap);
        assert_eq!(out[0], "JUMPIF R0 L42");
        assert_eq!(out[1], "JUMP L0");
    }

    #[test]
    fn call_fields_are_biased() {
        let vm = Vm::new();
        let p = proto_with(
            vec![
                Insn::abc(Opcode::Call, 1, 2, 1),
                Insn::abc(Opcode::GetVarargs, 0, 3, 0),
            ],
            vec![],
        );
        let out = lines(&p, &vm.heap);
        assert_eq!(out[0], "CALL R1 1 0");
        assert_eq!(out[1], "GETVARARGS R0 2");
    }

    #[test]
    fn aux_instructions_advance_pc() {
        let mut vm = Vm::new();
        let s = vm.heap.alloc_str_fixed("field", 0);
        let p = proto_with(
            vec![
                Insn::abc(Opcode::GetTableKS, 0, 1, 0),
                Insn::aux(0),
                Insn::abc(Opcode::Return, 0, 1, 0),
            ],
            vec![Value::Str(s)],
        );
        let out = lines(&p, &vm.heap);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], "GETTABLEKS R0 R1 K0 ; \"field\"");
        assert_eq!(out[1], "RETURN R0 0");
    }

    #[test]
    fn advance_matches_len_words() {
        let vm = Vm::new();
        let cases = vec![
            (Insn::abc(Opcode::Move, 0, 1, 0), vec![]),
            (Insn::abc(Opcode::NewTable, 0, 0, 0), vec![Insn::aux(4)]),
            (Insn::ad(Opcode::JumpIfEq, 0, 3), vec![Insn::aux(1)]),
            (Insn::abc(Opcode::NameCall, 0, 1, 0), vec![Insn::aux(0)]),
            (Insn::ad(Opcode::LoadKX, 0, 0), vec![Insn::aux(0)]),
        ];
        for (insn, auxes) in cases {
            let op = insn.op().unwrap();
            let mut code = vec![insn];
            code.extend(auxes);
            let p = proto_with(code, vec![Value::Number(0.0)]);
            let mut pc = 0;
            let mut sink = Vec::new();
            disasm_one(&mut sink, &mut pc, &p, &vm.heap).unwrap();
            assert_eq!(pc, op.len_words() - 1, "{}", op.name());
        }
    }

    #[test]
    fn invalid_opcode() {
        let vm = Vm::new();
        let p = proto_with(vec![Insn(0xff)], vec![]);
        assert_eq!(lines(&p, &vm.heap), vec!["INVALID 255"]);
    }

    #[test]
    fn capture_kinds() {
        let vm = Vm::new();
        let p = proto_with(
            vec![
                Insn::abc(Opcode::Capture, 0, 2, 0),
                Insn::abc(Opcode::Capture, 2, 0, 0),
            ],
            vec![],
        );
        let out = lines(&p, &vm.heap);
        assert_eq!(out[0], "CAPTURE VAL R2");
        assert_eq!(out[1], "CAPTURE UPVAL U0 ; captured");
    }

    #[test]
    fn trapped_instruction_renders_original() {
        let vm = Vm::new();
        let p = proto_with(
            vec![
                Insn::ad(Opcode::LoadN, 0, 10),
                Insn::abc(Opcode::Return, 0, 1, 0),
            ],
            vec![],
        );
        let before = lines(&p, &vm.heap);

        *p.debuginsn.borrow_mut() =
            Some(p.code.borrow().iter().map(|i| i.raw_op()).collect());
        {
            let mut code = p.code.borrow_mut();
            code[0] = code[0].with_op(Opcode::Break as u8);
        }
        assert_eq!(lines(&p, &vm.heap), before);
    }

    #[test]
    fn trapped_aux_instruction_renders_original() {
        let mut vm = Vm::new();
        let s = vm.heap.alloc_str_fixed("key", 0);
        let p = proto_with(
            vec![
                Insn::abc(Opcode::GetTableKS, 0, 1, 0),
                Insn::aux(0),
                Insn::abc(Opcode::Return, 0, 1, 0),
            ],
            vec![Value::Str(s)],
        );
        let before = lines(&p, &vm.heap);

        *p.debuginsn.borrow_mut() =
            Some(p.code.borrow().iter().map(|i| i.raw_op()).collect());
        {
            let mut code = p.code.borrow_mut();
            code[0] = code[0].with_op(Opcode::Break as u8);
        }
        assert_eq!(lines(&p, &vm.heap), before);
    }
}
