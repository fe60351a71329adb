//! Single-pass compiler for the script subset the debugger needs: the
//! embedded-expression path of the REPL and plain script files. Lowers
//! straight to bytecode, emitting line info and local-variable ranges so
//! the debugger has something to inspect.

use std::collections::HashMap;

use crate::blob::{write_blob, ConstTemplate, Module, ProtoTemplate};
use crate::bytecode::{Insn, Opcode};

/// Mirror of the host compile knobs: optimization level, debug info level,
/// type info level, coverage level. Only `debug_level` changes what this
/// compiler emits (1 = line info, 2 = line info + local variable info).
#[derive(Debug, Clone, Copy)]
pub struct CompileOptions {
    pub optimization: u8,
    pub debug_level: u8,
    pub type_info: u8,
    pub coverage: u8,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            optimization: 1,
            debug_level: 2,
            type_info: 1,
            coverage: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub line: u32,
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.line, self.message)
    }
}

impl std::error::Error for CompileError {}

/// Compile script source to a bytecode blob.
pub fn compile(source: &str, opts: &CompileOptions) -> Result<Vec<u8>, CompileError> {
    let mut parser = Parser::new(source, *opts)?;
    let module = parser.parse_chunk()?;
    Ok(write_blob(&module))
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Name(String),
    Number(f64),
    Str(String),
    And,
    Do,
    Else,
    Elseif,
    End,
    False,
    For,
    Function,
    If,
    Local,
    Nil,
    Not,
    Or,
    Return,
    Then,
    True,
    While,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Hash,
    EqEq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Assign,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Semi,
    Dot,
    Concat,
    Eof,
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Name(n) => format!("'{}'", n),
            Tok::Number(_) => "number".to_string(),
            Tok::Str(_) => "string".to_string(),
            Tok::Eof => "<eof>".to_string(),
            other => format!("{:?}", other).to_lowercase(),
        }
    }
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
}

impl Lexer {
    fn new(source: &str) -> Lexer {
        Lexer {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError {
            message: message.into(),
            line: self.line,
        }
    }

    fn next_token(&mut self) -> Result<(Tok, u32), CompileError> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('-') if self.chars.get(self.pos + 1) == Some(&'-') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }

        let line = self.line;
        let Some(c) = self.bump() else {
            return Ok((Tok::Eof, line));
        };

        let tok = match c {
            '+' => Tok::Plus,
            '-' => Tok::Minus,
            '*' => Tok::Star,
            '/' => Tok::Slash,
            '%' => Tok::Percent,
            '^' => Tok::Caret,
            '#' => Tok::Hash,
            '(' => Tok::LParen,
            ')' => Tok::RParen,
            '[' => Tok::LBracket,
            ']' => Tok::RBracket,
            ',' => Tok::Comma,
            ';' => Tok::Semi,
            '=' => {
                if self.peek() == Some('=') {
                    self.bump();
                    Tok::EqEq
                } else {
                    Tok::Assign
                }
            }
            '~' => {
                if self.peek() == Some('=') {
                    self.bump();
                    Tok::Ne
                } else {
                    return Err(self.error("unexpected symbol near '~'"));
                }
            }
            '<' => {
                if self.peek() == Some('=') {
                    self.bump();
                    Tok::Le
                } else {
                    Tok::Lt
                }
            }
            '>' => {
                if self.peek() == Some('=') {
                    self.bump();
                    Tok::Ge
                } else {
                    Tok::Gt
                }
            }
            '.' => {
                if self.peek() == Some('.') {
                    self.bump();
                    Tok::Concat
                } else {
                    Tok::Dot
                }
            }
            '"' | '\'' => self.string_literal(c)?,
            c if c.is_ascii_digit() => self.number_literal(c)?,
            c if c.is_alphabetic() || c == '_' => {
                let mut name = String::new();
                name.push(c);
                while let Some(n) = self.peek() {
                    if n.is_alphanumeric() || n == '_' {
                        name.push(n);
                        self.bump();
                    } else {
                        break;
                    }
                }
                keyword(&name).unwrap_or(Tok::Name(name))
            }
            other => return Err(self.error(format!("unexpected symbol near '{}'", other))),
        };
        Ok((tok, line))
    }

    fn string_literal(&mut self, quote: char) -> Result<Tok, CompileError> {
        let mut s = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unfinished string")),
                Some(c) if c == quote => break,
                Some('\n') => return Err(self.error("unfinished string")),
                Some('\\') => match self.bump() {
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some('r') => s.push('\r'),
                    Some('0') => s.push('\0'),
                    Some(c @ ('\\' | '"' | '\'')) => s.push(c),
                    _ => return Err(self.error("invalid escape sequence")),
                },
                Some(c) => s.push(c),
            }
        }
        Ok(Tok::Str(s))
    }

    fn number_literal(&mut self, first: char) -> Result<Tok, CompileError> {
        let mut text = String::new();
        text.push(first);
        if first == '0' && matches!(self.peek(), Some('x') | Some('X')) {
            self.bump();
            let mut hex = String::new();
            while let Some(c) = self.peek() {
                if c.is_ascii_hexdigit() {
                    hex.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
            let v = u64::from_str_radix(&hex, 16)
                .map_err(|_| self.error("malformed number"))?;
            return Ok(Tok::Number(v as f64));
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' {
                text.push(c);
                self.bump();
                if (text.ends_with('e') || text.ends_with('E'))
                    && matches!(self.peek(), Some('+') | Some('-'))
                {
                    text.push(self.bump().expect("sign"));
                }
            } else {
                break;
            }
        }
        text.parse::<f64>()
            .map(Tok::Number)
            .map_err(|_| self.error("malformed number"))
    }
}

fn keyword(name: &str) -> Option<Tok> {
    Some(match name {
        "and" => Tok::And,
        "do" => Tok::Do,
        "else" => Tok::Else,
        "elseif" => Tok::Elseif,
        "end" => Tok::End,
        "false" => Tok::False,
        "for" => Tok::For,
        "function" => Tok::Function,
        "if" => Tok::If,
        "local" => Tok::Local,
        "nil" => Tok::Nil,
        "not" => Tok::Not,
        "or" => Tok::Or,
        "return" => Tok::Return,
        "then" => Tok::Then,
        "true" => Tok::True,
        "while" => Tok::While,
        _ => return None,
    })
}

// ---------------------------------------------------------------------------
// Function state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Number(u64),
    Str(String),
    Bool(bool),
    Nil,
}

struct LocalSlot {
    name: String,
    reg: u8,
    startpc: u32,
    endpc: u32,
}

struct FuncState {
    code: Vec<Insn>,
    lines: Vec<u32>,
    consts: Vec<ConstTemplate>,
    const_map: HashMap<ConstKey, u16>,
    /// All locals ever declared; `active` indexes the live ones.
    locals: Vec<LocalSlot>,
    active: Vec<usize>,
    children: Vec<usize>,
    freereg: u8,
    maxstack: u8,
    numparams: u8,
    is_vararg: bool,
    debugname: Option<String>,
    linedefined: u32,
}

const MAX_REGS: u8 = 200;

impl FuncState {
    fn new() -> FuncState {
        FuncState {
            code: Vec::new(),
            lines: Vec::new(),
            consts: Vec::new(),
            const_map: HashMap::new(),
            locals: Vec::new(),
            active: Vec::new(),
            children: Vec::new(),
            freereg: 0,
            maxstack: 2,
            numparams: 0,
            is_vararg: false,
            debugname: None,
            linedefined: 0,
        }
    }

    fn pc(&self) -> usize {
        self.code.len()
    }

    fn emit(&mut self, insn: Insn, line: u32) -> usize {
        let idx = self.code.len();
        self.code.push(insn);
        self.lines.push(line);
        idx
    }

    /// Patch a jump at `idx` to land on `target`.
    fn patch_jump(&mut self, idx: usize, target: usize) {
        let d = target as i64 - idx as i64 - 1;
        self.code[idx].set_d(d as i16);
    }

    fn add_const(&mut self, key: ConstKey, value: ConstTemplate) -> u16 {
        if let Some(&idx) = self.const_map.get(&key) {
            return idx;
        }
        let idx = self.consts.len() as u16;
        self.const_map.insert(key, idx);
        self.consts.push(value);
        idx
    }

    fn number_const(&mut self, n: f64) -> u16 {
        self.add_const(ConstKey::Number(n.to_bits()), ConstTemplate::Number(n))
    }

    fn string_const(&mut self, s: &str) -> u16 {
        self.add_const(ConstKey::Str(s.to_string()), ConstTemplate::Str(s.to_string()))
    }

    /// Constant index for a name that must fit an 8-bit operand field
    /// (global accesses encode the constant in B).
    fn name_const(&mut self, s: &str, line: u32) -> Result<u8, CompileError> {
        let k = self.string_const(s);
        u8::try_from(k).map_err(|_| CompileError {
            message: "too many constants in function".to_string(),
            line,
        })
    }

    fn reserve(&mut self, line: u32) -> Result<u8, CompileError> {
        if self.freereg >= MAX_REGS {
            return Err(CompileError {
                message: "function or expression too complex".to_string(),
                line,
            });
        }
        let r = self.freereg;
        self.freereg += 1;
        if self.freereg > self.maxstack {
            self.maxstack = self.freereg;
        }
        Ok(r)
    }

    fn resolve_local(&self, name: &str) -> Option<u8> {
        self.active
            .iter()
            .rev()
            .map(|&i| &self.locals[i])
            .find(|l| l.name == name)
            .map(|l| l.reg)
    }

    fn declare_local(&mut self, name: String, reg: u8) {
        let startpc = self.pc() as u32;
        self.locals.push(LocalSlot {
            name,
            reg,
            startpc,
            endpc: 0,
        });
        self.active.push(self.locals.len() - 1);
    }

    fn into_template(mut self, debug_level: u8) -> ProtoTemplate {
        let endpc = self.code.len() as u32;
        for &i in &self.active {
            self.locals[i].endpc = endpc;
        }
        ProtoTemplate {
            maxstacksize: self.maxstack,
            numparams: self.numparams,
            nups: 0,
            is_vararg: self.is_vararg,
            code: self.code.iter().map(|i| i.0).collect(),
            k: self.consts,
            children: self.children,
            linedefined: self.linedefined,
            debugname: self.debugname,
            lineinfo: (debug_level >= 1).then_some(self.lines),
            locvars: (debug_level >= 2)
                .then(|| {
                    self.locals
                        .into_iter()
                        .map(|l| (l.name, l.reg, l.startpc, l.endpc))
                        .collect()
                })
                .unwrap_or_default(),
            upvalue_names: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Parser / code generator
// ---------------------------------------------------------------------------

struct Parser {
    lex: Lexer,
    tok: Tok,
    tok_line: u32,
    opts: CompileOptions,
    module: Module,
    fs: Vec<FuncState>,
}

impl Parser {
    fn new(source: &str, opts: CompileOptions) -> Result<Parser, CompileError> {
        let mut lex = Lexer::new(source);
        let (tok, tok_line) = lex.next_token()?;
        Ok(Parser {
            lex,
            tok,
            tok_line,
            opts,
            module: Module::default(),
            fs: Vec::new(),
        })
    }

    fn fs(&mut self) -> &mut FuncState {
        self.fs.last_mut().expect("function state")
    }

    fn advance(&mut self) -> Result<(), CompileError> {
        let (tok, line) = self.lex.next_token()?;
        self.tok = tok;
        self.tok_line = line;
        Ok(())
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError {
            message: message.into(),
            line: self.tok_line,
        }
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<(), CompileError> {
        if self.tok == tok {
            self.advance()
        } else {
            Err(self.error(format!("'{}' expected near {}", what, self.tok.describe())))
        }
    }

    fn accept(&mut self, tok: Tok) -> Result<bool, CompileError> {
        if self.tok == tok {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn name(&mut self) -> Result<String, CompileError> {
        match std::mem::replace(&mut self.tok, Tok::Eof) {
            Tok::Name(n) => {
                let (tok, line) = self.lex.next_token()?;
                self.tok = tok;
                self.tok_line = line;
                Ok(n)
            }
            other => {
                self.tok = other;
                Err(self.error(format!("name expected near {}", self.tok.describe())))
            }
        }
    }

    // -- Toplevel --

    fn parse_chunk(&mut self) -> Result<Module, CompileError> {
        let mut main = FuncState::new();
        main.is_vararg = true;
        self.fs.push(main);
        let line = self.tok_line;
        self.fs()
            .emit(Insn::abc(Opcode::PrepVarargs, 0, 0, 0), line);

        self.block()?;
        if self.tok != Tok::Eof {
            return Err(self.error(format!("unexpected {}", self.tok.describe())));
        }

        let line = self.tok_line;
        self.fs().emit(Insn::abc(Opcode::Return, 0, 1, 0), line);
        let fs = self.fs.pop().expect("main state");
        self.module.protos.push(fs.into_template(self.opts.debug_level));
        self.module.main = self.module.protos.len() - 1;
        Ok(std::mem::take(&mut self.module))
    }

    fn block_follows(&self) -> bool {
        matches!(
            self.tok,
            Tok::Eof | Tok::End | Tok::Else | Tok::Elseif
        )
    }

    fn block(&mut self) -> Result<(), CompileError> {
        let saved_active = self.fs().active.len();
        let saved_free = self.fs().freereg;
        while !self.block_follows() {
            let was_return = self.tok == Tok::Return;
            self.statement()?;
            let _ = self.accept(Tok::Semi)?;
            if was_return {
                break;
            }
        }
        let fs = self.fs();
        let endpc = fs.pc() as u32;
        while fs.active.len() > saved_active {
            let idx = fs.active.pop().expect("active local");
            fs.locals[idx].endpc = endpc;
        }
        fs.freereg = saved_free;
        Ok(())
    }

    // -- Statements --

    fn statement(&mut self) -> Result<(), CompileError> {
        match self.tok.clone() {
            Tok::Local => self.local_stat(),
            Tok::If => self.if_stat(),
            Tok::While => self.while_stat(),
            Tok::For => self.for_stat(),
            Tok::Function => self.function_stat(),
            Tok::Return => self.return_stat(),
            Tok::Do => {
                self.advance()?;
                self.block()?;
                self.expect(Tok::End, "end")
            }
            _ => self.expr_stat(),
        }
    }

    fn local_stat(&mut self) -> Result<(), CompileError> {
        let line = self.tok_line;
        self.advance()?;
        let name = self.name()?;
        let reg = if self.accept(Tok::Assign)? {
            self.expr_to_next(line)?
        } else {
            let r = self.fs().reserve(line)?;
            self.fs().emit(Insn::abc(Opcode::LoadNil, r, 0, 0), line);
            r
        };
        self.fs().declare_local(name, reg);
        Ok(())
    }

    fn function_stat(&mut self) -> Result<(), CompileError> {
        let line = self.tok_line;
        self.advance()?;
        let name = self.name()?;

        let child_idx = self.function_body(Some(name.clone()), line)?;

        let fs = self.fs();
        let local_child = fs.children.len();
        fs.children.push(child_idx);
        let r = fs.reserve(line)?;
        fs.emit(Insn::ad(Opcode::NewClosure, r, local_child as i16), line);
        let kname = fs.name_const(&name, line)?;
        fs.emit(Insn::abc(Opcode::SetGlobal, r, kname, 0), line);
        fs.freereg = r;
        Ok(())
    }

    /// Parse `(params) block end`, compile into a new proto, return its
    /// module index.
    fn function_body(
        &mut self,
        debugname: Option<String>,
        line: u32,
    ) -> Result<usize, CompileError> {
        let mut fs = FuncState::new();
        fs.debugname = debugname;
        fs.linedefined = line;
        self.fs.push(fs);

        self.expect(Tok::LParen, "(")?;
        if self.tok != Tok::RParen {
            loop {
                let pline = self.tok_line;
                let pname = self.name()?;
                let reg = self.fs().reserve(pline)?;
                self.fs().declare_local(pname, reg);
                self.fs().numparams += 1;
                if !self.accept(Tok::Comma)? {
                    break;
                }
            }
        }
        self.expect(Tok::RParen, ")")?;

        self.block()?;
        let end_line = self.tok_line;
        self.expect(Tok::End, "end")?;
        self.fs()
            .emit(Insn::abc(Opcode::Return, 0, 1, 0), end_line);

        let fs = self.fs.pop().expect("function state");
        self.module
            .protos
            .push(fs.into_template(self.opts.debug_level));
        Ok(self.module.protos.len() - 1)
    }

    fn return_stat(&mut self) -> Result<(), CompileError> {
        let line = self.tok_line;
        self.advance()?;
        if self.block_follows() || self.tok == Tok::Semi {
            self.fs().emit(Insn::abc(Opcode::Return, 0, 1, 0), line);
            return Ok(());
        }
        let base = self.fs().freereg;
        let mut count = 0u8;
        loop {
            self.expr_to_next(line)?;
            count += 1;
            if !self.accept(Tok::Comma)? {
                break;
            }
        }
        // A trailing call forwards all of its results.
        if self.extend_last_call() {
            self.fs().emit(Insn::abc(Opcode::Return, base, 0, 0), line);
        } else {
            self.fs()
                .emit(Insn::abc(Opcode::Return, base, count + 1, 0), line);
        }
        self.fs().freereg = base;
        Ok(())
    }

    fn if_stat(&mut self) -> Result<(), CompileError> {
        self.advance()?;
        let mut end_jumps = Vec::new();
        loop {
            let line = self.tok_line;
            let cond = self.expr_to_next(line)?;
            self.fs().freereg = cond;
            let skip = self.fs().emit(Insn::ad(Opcode::JumpIfNot, cond, 0), line);
            self.expect(Tok::Then, "then")?;
            self.block()?;

            match self.tok.clone() {
                Tok::Elseif => {
                    let line = self.tok_line;
                    let j = self.fs().emit(Insn::ad(Opcode::Jump, 0, 0), line);
                    end_jumps.push(j);
                    let target = self.fs().pc();
                    self.fs().patch_jump(skip, target);
                    self.advance()?;
                }
                Tok::Else => {
                    let line = self.tok_line;
                    let j = self.fs().emit(Insn::ad(Opcode::Jump, 0, 0), line);
                    end_jumps.push(j);
                    let target = self.fs().pc();
                    self.fs().patch_jump(skip, target);
                    self.advance()?;
                    self.block()?;
                    self.expect(Tok::End, "end")?;
                    break;
                }
                Tok::End => {
                    let target = self.fs().pc();
                    self.fs().patch_jump(skip, target);
                    self.advance()?;
                    break;
                }
                other => {
                    return Err(self.error(format!(
                        "'end' expected near {}",
                        other.describe()
                    )))
                }
            }
        }
        let target = self.fs().pc();
        for j in end_jumps {
            self.fs().patch_jump(j, target);
        }
        Ok(())
    }

    fn while_stat(&mut self) -> Result<(), CompileError> {
        self.advance()?;
        let top = self.fs().pc();
        let line = self.tok_line;
        let cond = self.expr_to_next(line)?;
        self.fs().freereg = cond;
        let exit = self.fs().emit(Insn::ad(Opcode::JumpIfNot, cond, 0), line);
        self.expect(Tok::Do, "do")?;
        self.block()?;
        let end_line = self.tok_line;
        self.expect(Tok::End, "end")?;
        let back = self.fs().pc();
        let d = top as i64 - back as i64 - 1;
        self.fs()
            .emit(Insn::ad(Opcode::JumpBack, 0, d as i16), end_line);
        let target = self.fs().pc();
        self.fs().patch_jump(exit, target);
        Ok(())
    }

    fn for_stat(&mut self) -> Result<(), CompileError> {
        let line = self.tok_line;
        self.advance()?;
        let var = self.name()?;
        self.expect(Tok::Assign, "=")?;

        // Loop control registers: base+0 limit, base+1 step, base+2 index.
        let base = self.fs().freereg;
        let start = self.expr_to_next(line)?;
        self.expect(Tok::Comma, ",")?;
        let _limit = self.expr_to_next(line)?;
        if self.accept(Tok::Comma)? {
            self.expr_to_next(line)?;
        } else {
            let r = self.fs().reserve(line)?;
            self.fs().emit(Insn::ad(Opcode::LoadN, r, 1), line);
        }
        // Shuffle (start, limit, step) into (limit, step, index).
        let tmp = self.fs().reserve(line)?;
        let fs = self.fs();
        fs.emit(Insn::abc(Opcode::Move, tmp, start, 0), line);
        fs.emit(Insn::abc(Opcode::Move, base, base + 1, 0), line);
        fs.emit(Insn::abc(Opcode::Move, base + 1, base + 2, 0), line);
        fs.emit(Insn::abc(Opcode::Move, base + 2, tmp, 0), line);
        fs.freereg = base + 3;

        let prep = self.fs().emit(Insn::ad(Opcode::ForNPrep, base, 0), line);

        let saved_active = self.fs().active.len();
        self.fs().declare_local(var, base + 2);

        self.expect(Tok::Do, "do")?;
        let body = self.fs().pc();
        self.block()?;
        let end_line = self.tok_line;
        self.expect(Tok::End, "end")?;

        let looppc = self.fs().pc();
        let d = body as i64 - looppc as i64 - 1;
        self.fs()
            .emit(Insn::ad(Opcode::ForNLoop, base, d as i16), end_line);
        let target = self.fs().pc();
        self.fs().patch_jump(prep, target);

        let fs = self.fs();
        let endpc = fs.pc() as u32;
        while fs.active.len() > saved_active {
            let idx = fs.active.pop().expect("loop local");
            fs.locals[idx].endpc = endpc;
        }
        fs.freereg = base;
        Ok(())
    }

    /// Assignment or call statement.
    fn expr_stat(&mut self) -> Result<(), CompileError> {
        let line = self.tok_line;
        if let Tok::Name(name) = self.tok.clone() {
            // Peek past the name to spot a plain assignment.
            let save_pos = self.lex.pos;
            let save_line = self.lex.line;
            self.advance()?;
            if self.tok == Tok::Assign {
                self.advance()?;
                return self.assign_to(name, line);
            }
            // Not an assignment: rewind and parse as an expression.
            self.lex.pos = save_pos;
            self.lex.line = save_line;
            self.tok = Tok::Name(name);
            self.tok_line = line;
        }

        let base = self.fs().freereg;
        let before = self.fs().pc();
        self.expr_to_next(line)?;
        let fs = self.fs();
        let is_call = fs
            .code
            .last()
            .map(|i| i.op() == Some(Opcode::Call))
            .unwrap_or(false)
            && fs.pc() > before;
        if !is_call {
            return Err(self.error("syntax error: expression is not a statement"));
        }
        // Discard call results.
        let last = fs.code.len() - 1;
        fs.code[last].set_c(1);
        fs.freereg = base;
        Ok(())
    }

    fn assign_to(&mut self, name: String, line: u32) -> Result<(), CompileError> {
        let value = self.expr_to_next(line)?;
        match self.fs().resolve_local(&name) {
            Some(reg) => {
                self.fs()
                    .emit(Insn::abc(Opcode::Move, reg, value, 0), line);
            }
            None => {
                let kname = self.fs().name_const(&name, line)?;
                self.fs()
                    .emit(Insn::abc(Opcode::SetGlobal, value, kname, 0), line);
            }
        }
        self.fs().freereg = value;
        Ok(())
    }

    // -- Expressions --

    /// Compile an expression into the next free register and return it.
    fn expr_to_next(&mut self, line: u32) -> Result<u8, CompileError> {
        let reg = self.fs().reserve(line)?;
        self.expr_into(reg, 0)?;
        self.fs().freereg = reg + 1;
        Ok(reg)
    }

    /// Precedence-climbing expression compiler; the result lands in `reg`.
    fn expr_into(&mut self, reg: u8, min_prec: u8) -> Result<(), CompileError> {
        self.unary_expr(reg)?;

        loop {
            let (prec, right_assoc) = match binary_prec(&self.tok) {
                Some(p) => p,
                None => break,
            };
            if prec < min_prec {
                break;
            }
            let op = self.tok.clone();
            let line = self.tok_line;
            self.advance()?;

            let rhs = self.fs().reserve(line)?;
            let next_min = if right_assoc { prec } else { prec + 1 };
            self.expr_into(rhs, next_min)?;
            self.emit_binary(&op, reg, rhs, line)?;
            self.fs().freereg = reg + 1;
        }
        Ok(())
    }

    fn emit_binary(
        &mut self,
        op: &Tok,
        lhs: u8,
        rhs: u8,
        line: u32,
    ) -> Result<(), CompileError> {
        let fs = self.fs();
        match op {
            Tok::Plus => {
                fs.emit(Insn::abc(Opcode::Add, lhs, lhs, rhs), line);
            }
            Tok::Minus => {
                fs.emit(Insn::abc(Opcode::Sub, lhs, lhs, rhs), line);
            }
            Tok::Star => {
                fs.emit(Insn::abc(Opcode::Mul, lhs, lhs, rhs), line);
            }
            Tok::Slash => {
                fs.emit(Insn::abc(Opcode::Div, lhs, lhs, rhs), line);
            }
            Tok::Percent => {
                fs.emit(Insn::abc(Opcode::Mod, lhs, lhs, rhs), line);
            }
            Tok::Caret => {
                fs.emit(Insn::abc(Opcode::Pow, lhs, lhs, rhs), line);
            }
            Tok::Concat => {
                fs.emit(Insn::abc(Opcode::Concat, lhs, lhs, rhs), line);
            }
            Tok::And => {
                fs.emit(Insn::abc(Opcode::And, lhs, lhs, rhs), line);
            }
            Tok::Or => {
                fs.emit(Insn::abc(Opcode::Or, lhs, lhs, rhs), line);
            }
            Tok::EqEq | Tok::Ne | Tok::Lt | Tok::Le | Tok::Gt | Tok::Ge => {
                let (opcode, a, b) = match op {
                    Tok::EqEq => (Opcode::JumpIfEq, lhs, rhs),
                    Tok::Ne => (Opcode::JumpIfNotEq, lhs, rhs),
                    Tok::Lt => (Opcode::JumpIfLt, lhs, rhs),
                    Tok::Le => (Opcode::JumpIfLe, lhs, rhs),
                    Tok::Gt => (Opcode::JumpIfLt, rhs, lhs),
                    Tok::Ge => (Opcode::JumpIfLe, rhs, lhs),
                    _ => unreachable!(),
                };
                // cmp; aux; LOADB lhs false skip 1; LOADB lhs true
                fs.emit(Insn::ad(opcode, a, 2), line);
                fs.emit(Insn::aux(b as u32), line);
                fs.emit(Insn::abc(Opcode::LoadB, lhs, 0, 1), line);
                fs.emit(Insn::abc(Opcode::LoadB, lhs, 1, 0), line);
            }
            other => return Err(self.error(format!("unexpected {}", other.describe()))),
        }
        Ok(())
    }

    fn unary_expr(&mut self, reg: u8) -> Result<(), CompileError> {
        let line = self.tok_line;
        match self.tok.clone() {
            Tok::Not => {
                self.advance()?;
                self.unary_expr(reg)?;
                self.fs().emit(Insn::abc(Opcode::Not, reg, reg, 0), line);
            }
            Tok::Minus => {
                self.advance()?;
                // Unary minus binds tighter than binary operators but
                // looser than '^'.
                self.expr_into(reg, 9)?;
                self.fs()
                    .emit(Insn::abc(Opcode::Minus, reg, reg, 0), line);
            }
            Tok::Hash => {
                self.advance()?;
                self.unary_expr(reg)?;
                self.fs()
                    .emit(Insn::abc(Opcode::Length, reg, reg, 0), line);
            }
            _ => self.suffixed_expr(reg)?,
        }
        Ok(())
    }

    fn suffixed_expr(&mut self, reg: u8) -> Result<(), CompileError> {
        self.primary_expr(reg)?;
        loop {
            let line = self.tok_line;
            match self.tok.clone() {
                Tok::Dot => {
                    self.advance()?;
                    let field = self.name()?;
                    let k = self.fs().string_const(&field);
                    let fs = self.fs();
                    fs.emit(Insn::abc(Opcode::GetTableKS, reg, reg, 0), line);
                    fs.emit(Insn::aux(k as u32), line);
                }
                Tok::LBracket => {
                    self.advance()?;
                    let key = self.fs().reserve(line)?;
                    self.expr_into(key, 0)?;
                    self.expect(Tok::RBracket, "]")?;
                    let fs = self.fs();
                    fs.emit(Insn::abc(Opcode::GetTable, reg, reg, key), line);
                    fs.freereg = reg + 1;
                }
                Tok::LParen => {
                    self.advance()?;
                    self.call_args(reg, line)?;
                }
                _ => break,
            }
        }
        Ok(())
    }

    /// Compile `(...)` arguments and the CALL; the callee sits in `reg` and
    /// the single result replaces it.
    fn call_args(&mut self, reg: u8, line: u32) -> Result<(), CompileError> {
        let mut nargs = 0u8;
        self.fs().freereg = reg + 1;
        if self.tok != Tok::RParen {
            loop {
                let aline = self.tok_line;
                self.expr_to_next(aline)?;
                nargs += 1;
                if !self.accept(Tok::Comma)? {
                    break;
                }
            }
        }
        self.expect(Tok::RParen, ")")?;

        // A trailing call argument forwards all of its results.
        let multret = self.extend_last_call();
        let b = if multret { 0 } else { nargs + 1 };
        self.fs().emit(Insn::abc(Opcode::Call, reg, b, 2), line);
        self.fs().freereg = reg + 1;
        Ok(())
    }

    /// If the most recent instruction is a single-result CALL, widen it to
    /// return all results. Used for trailing call arguments and returns.
    fn extend_last_call(&mut self) -> bool {
        let fs = self.fs();
        if let Some(last) = fs.code.last_mut() {
            if last.op() == Some(Opcode::Call) && last.c() == 2 {
                last.set_c(0);
                return true;
            }
        }
        false
    }

    fn primary_expr(&mut self, reg: u8) -> Result<(), CompileError> {
        let line = self.tok_line;
        match self.tok.clone() {
            Tok::Nil => {
                self.advance()?;
                self.fs().emit(Insn::abc(Opcode::LoadNil, reg, 0, 0), line);
            }
            Tok::True => {
                self.advance()?;
                self.fs().emit(Insn::abc(Opcode::LoadB, reg, 1, 0), line);
            }
            Tok::False => {
                self.advance()?;
                self.fs().emit(Insn::abc(Opcode::LoadB, reg, 0, 0), line);
            }
            Tok::Number(n) => {
                self.advance()?;
                let fits_d = n == (n as i16) as f64;
                if fits_d {
                    self.fs()
                        .emit(Insn::ad(Opcode::LoadN, reg, n as i16), line);
                } else {
                    let k = self.fs().number_const(n);
                    self.fs()
                        .emit(Insn::ad(Opcode::LoadK, reg, k as i16), line);
                }
            }
            Tok::Str(s) => {
                self.advance()?;
                let k = self.fs().string_const(&s);
                self.fs().emit(Insn::ad(Opcode::LoadK, reg, k as i16), line);
            }
            Tok::Name(name) => {
                self.advance()?;
                match self.fs().resolve_local(&name) {
                    Some(local) => {
                        self.fs()
                            .emit(Insn::abc(Opcode::Move, reg, local, 0), line);
                    }
                    None => {
                        let k = self.fs().name_const(&name, line)?;
                        self.fs()
                            .emit(Insn::abc(Opcode::GetGlobal, reg, k, 0), line);
                    }
                }
            }
            Tok::LParen => {
                self.advance()?;
                self.expr_into(reg, 0)?;
                self.expect(Tok::RParen, ")")?;
            }
            Tok::Function => {
                self.advance()?;
                let child_idx = self.function_body(None, line)?;
                let fs = self.fs();
                let local_child = fs.children.len();
                fs.children.push(child_idx);
                fs.emit(Insn::ad(Opcode::NewClosure, reg, local_child as i16), line);
            }
            other => {
                return Err(self.error(format!("unexpected {}", other.describe())))
            }
        }
        Ok(())
    }
}

/// Binary operator precedence; higher binds tighter.
fn binary_prec(tok: &Tok) -> Option<(u8, bool)> {
    Some(match tok {
        Tok::Or => (1, false),
        Tok::And => (2, false),
        Tok::EqEq | Tok::Ne | Tok::Lt | Tok::Le | Tok::Gt | Tok::Ge => (3, false),
        Tok::Concat => (4, true),
        Tok::Plus | Tok::Minus => (5, false),
        Tok::Star | Tok::Slash | Tok::Percent => (6, false),
        Tok::Caret => (10, true),
        _ => return None,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
