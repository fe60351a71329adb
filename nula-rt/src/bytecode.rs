//! Instruction encoding for the Nula VM.
//!
//! An instruction is one 32-bit word: opcode in the low 8 bits, then the
//! operand fields A (bits 8-15), B (16-23), C (24-31). Two overlapping wide
//! fields exist: D is a signed 16-bit field in bits 16-31, E a signed 24-bit
//! field in bits 8-31. Some opcodes are followed by one auxiliary word
//! carrying extended operands; a trap may only ever replace the first word
//! of such a pair.

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

macro_rules! opcodes {
    ($($name:ident => $text:literal,)*) => {
        /// The complete opcode table. Discriminants are table positions and
        /// are part of the serialized bytecode format.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($name,)*
        }

        impl Opcode {
            pub const COUNT: u8 = {
                let mut n = 0u8;
                $(let _ = Opcode::$name; n += 1;)*
                n
            };

            const ALL: &'static [Opcode] = &[$(Opcode::$name,)*];

            pub fn from_u8(op: u8) -> Option<Opcode> {
                Self::ALL.get(op as usize).copied()
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$name => $text,)*
                }
            }
        }
    };
}

opcodes! {
    Nop => "NOP",
    Break => "BREAK",
    LoadNil => "LOADNIL",
    LoadB => "LOADB",
    LoadN => "LOADN",
    LoadK => "LOADK",
    Move => "MOVE",
    GetGlobal => "GETGLOBAL",
    SetGlobal => "SETGLOBAL",
    GetUpval => "GETUPVAL",
    SetUpval => "SETUPVAL",
    CloseUpvals => "CLOSEUPVALS",
    GetImport => "GETIMPORT",
    GetTable => "GETTABLE",
    SetTable => "SETTABLE",
    GetTableKS => "GETTABLEKS",
    SetTableKS => "SETTABLEKS",
    GetTableN => "GETTABLEN",
    SetTableN => "SETTABLEN",
    NewClosure => "NEWCLOSURE",
    NameCall => "NAMECALL",
    Call => "CALL",
    Return => "RETURN",
    Jump => "JUMP",
    JumpBack => "JUMPBACK",
    JumpIf => "JUMPIF",
    JumpIfNot => "JUMPIFNOT",
    JumpIfEq => "JUMPIFEQ",
    JumpIfLe => "JUMPIFLE",
    JumpIfLt => "JUMPIFLT",
    JumpIfNotEq => "JUMPIFNOTEQ",
    JumpIfNotLe => "JUMPIFNOTLE",
    JumpIfNotLt => "JUMPIFNOTLT",
    Add => "ADD",
    Sub => "SUB",
    Mul => "MUL",
    Div => "DIV",
    Mod => "MOD",
    Pow => "POW",
    AddK => "ADDK",
    SubK => "SUBK",
    MulK => "MULK",
    DivK => "DIVK",
    ModK => "MODK",
    PowK => "POWK",
    And => "AND",
    Or => "OR",
    AndK => "ANDK",
    OrK => "ORK",
    Concat => "CONCAT",
    Not => "NOT",
    Minus => "MINUS",
    Length => "LENGTH",
    NewTable => "NEWTABLE",
    DupTable => "DUPTABLE",
    SetList => "SETLIST",
    ForNPrep => "FORNPREP",
    ForNLoop => "FORNLOOP",
    ForGLoop => "FORGLOOP",
    ForGPrepINext => "FORGPREP_INEXT",
    FastCall3 => "FASTCALL3",
    ForGPrepNext => "FORGPREP_NEXT",
    NativeCall => "NATIVECALL",
    GetVarargs => "GETVARARGS",
    DupClosure => "DUPCLOSURE",
    PrepVarargs => "PREPVARARGS",
    LoadKX => "LOADKX",
    JumpX => "JUMPX",
    FastCall => "FASTCALL",
    Coverage => "COVERAGE",
    Capture => "CAPTURE",
    SubRK => "SUBRK",
    DivRK => "DIVRK",
    FastCall1 => "FASTCALL1",
    FastCall2 => "FASTCALL2",
    FastCall2K => "FASTCALL2K",
    ForGPrep => "FORGPREP",
    JumpXEqKNil => "JUMPXEQKNIL",
    JumpXEqKB => "JUMPXEQKB",
    JumpXEqKN => "JUMPXEQKN",
    JumpXEqKS => "JUMPXEQKS",
    IDiv => "IDIV",
    IDivK => "IDIVK",
}

impl Opcode {
    /// Length of the instruction in 32-bit words (1 or 2). The extra word,
    /// when present, is the auxiliary operand word.
    pub fn len_words(self) -> usize {
        match self {
            Opcode::GetImport
            | Opcode::GetTableKS
            | Opcode::SetTableKS
            | Opcode::NameCall
            | Opcode::JumpIfEq
            | Opcode::JumpIfLe
            | Opcode::JumpIfLt
            | Opcode::JumpIfNotEq
            | Opcode::JumpIfNotLe
            | Opcode::JumpIfNotLt
            | Opcode::NewTable
            | Opcode::SetList
            | Opcode::LoadKX
            | Opcode::FastCall2
            | Opcode::FastCall2K
            | Opcode::FastCall3
            | Opcode::JumpXEqKNil
            | Opcode::JumpXEqKB
            | Opcode::JumpXEqKN
            | Opcode::JumpXEqKS => 2,
            _ => 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Instruction word
// ---------------------------------------------------------------------------

/// One 32-bit instruction (or auxiliary) word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Insn(pub u32);

impl Insn {
    pub fn abc(op: Opcode, a: u8, b: u8, c: u8) -> Insn {
        Insn((op as u32) | (a as u32) << 8 | (b as u32) << 16 | (c as u32) << 24)
    }

    pub fn ad(op: Opcode, a: u8, d: i16) -> Insn {
        Insn((op as u32) | (a as u32) << 8 | ((d as u16) as u32) << 16)
    }

    pub fn e(op: Opcode, e: i32) -> Insn {
        Insn((op as u32) | ((e as u32) & 0x00ff_ffff) << 8)
    }

    pub fn aux(word: u32) -> Insn {
        Insn(word)
    }

    /// The raw opcode byte (meaningful even for unknown opcodes).
    pub fn raw_op(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    pub fn op(self) -> Option<Opcode> {
        Opcode::from_u8(self.raw_op())
    }

    pub fn a(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn b(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub fn c(self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Signed 16-bit field spanning B and C.
    pub fn d(self) -> i16 {
        (self.0 >> 16) as i16
    }

    /// Signed 24-bit field spanning A, B and C.
    pub fn e_field(self) -> i32 {
        (self.0 as i32) >> 8
    }

    /// Replace the opcode byte, keeping every operand bit.
    pub fn with_op(self, op: u8) -> Insn {
        Insn((self.0 & !0xff) | op as u32)
    }

    pub fn set_a(&mut self, v: u8) {
        self.0 = (self.0 & !0x0000_ff00) | (v as u32) << 8;
    }

    pub fn set_b(&mut self, v: u8) {
        self.0 = (self.0 & !0x00ff_0000) | (v as u32) << 16;
    }

    pub fn set_c(&mut self, v: u8) {
        self.0 = (self.0 & !0xff00_0000) | (v as u32) << 24;
    }

    pub fn set_d(&mut self, v: i16) {
        self.0 = (self.0 & 0x0000_ffff) | ((v as u16) as u32) << 16;
    }

    pub fn set_e(&mut self, v: i32) {
        self.0 = (self.0 & 0x0000_00ff) | ((v as u32) & 0x00ff_ffff) << 8;
    }
}

impl std::fmt::Debug for Insn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.op() {
            Some(op) => write!(f, "Insn({} {:#010x})", op.name(), self.0),
            None => write!(f, "Insn({:#010x})", self.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_table_shape() {
        assert_eq!(Opcode::COUNT, 83);
        assert_eq!(Opcode::from_u8(0), Some(Opcode::Nop));
        assert_eq!(Opcode::from_u8(1), Some(Opcode::Break));
        assert_eq!(Opcode::from_u8(82), Some(Opcode::IDivK));
        assert_eq!(Opcode::from_u8(83), None);
        assert_eq!(Opcode::Return.name(), "RETURN");
        assert_eq!(Opcode::ForGPrepINext.name(), "FORGPREP_INEXT");
    }

    #[test]
    fn abc_round_trip() {
        let i = Insn::abc(Opcode::Add, 1, 2, 3);
        assert_eq!(i.op(), Some(Opcode::Add));
        assert_eq!((i.a(), i.b(), i.c()), (1, 2, 3));
    }

    #[test]
    fn d_field_signed() {
        let i = Insn::ad(Opcode::LoadN, 0, -5);
        assert_eq!(i.d(), -5);
        assert_eq!(i.a(), 0);
        let j = Insn::ad(Opcode::Jump, 0, 300);
        assert_eq!(j.d(), 300);
    }

    #[test]
    fn e_field_signed() {
        let i = Insn::e(Opcode::JumpX, -100_000);
        assert_eq!(i.e_field(), -100_000);
        assert_eq!(i.op(), Some(Opcode::JumpX));
        let j = Insn::e(Opcode::Coverage, 7);
        assert_eq!(j.e_field(), 7);
    }

    #[test]
    fn with_op_preserves_operands() {
        let i = Insn::abc(Opcode::Call, 2, 1, 1);
        let trapped = i.with_op(Opcode::Break as u8);
        assert_eq!(trapped.op(), Some(Opcode::Break));
        assert_eq!((trapped.a(), trapped.b(), trapped.c()), (2, 1, 1));
        let restored = trapped.with_op(Opcode::Call as u8);
        assert_eq!(restored, i);
    }

    #[test]
    fn field_setters() {
        let mut i = Insn::abc(Opcode::LoadN, 0, 0, 0);
        i.set_d(42);
        assert_eq!(i.d(), 42);
        assert_eq!(i.a(), 0);
        i.set_a(9);
        assert_eq!(i.a(), 9);
        assert_eq!(i.d(), 42);
        i.set_b(0xff);
        i.set_c(0x01);
        assert_eq!(i.b(), 0xff);
        assert_eq!(i.c(), 0x01);
    }

    #[test]
    fn aux_ops_are_two_words() {
        for op in [
            Opcode::GetImport,
            Opcode::GetTableKS,
            Opcode::NameCall,
            Opcode::JumpIfEq,
            Opcode::NewTable,
            Opcode::SetList,
            Opcode::LoadKX,
            Opcode::FastCall2K,
            Opcode::JumpXEqKS,
        ] {
            assert_eq!(op.len_words(), 2, "{}", op.name());
        }
        for op in [Opcode::LoadK, Opcode::Call, Opcode::Return, Opcode::Jump] {
            assert_eq!(op.len_words(), 1, "{}", op.name());
        }
    }
}
