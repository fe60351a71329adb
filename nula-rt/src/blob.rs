//! Serialized bytecode: the interchange format between the compiler and the
//! VM's load primitive, and the payload of nula library files.
//!
//! Layout (all integers little-endian, varints LEB128):
//!
//! ```text
//! u8 version
//! varint nstrings, then per string: varint len + bytes
//! varint nprotos, then per proto:
//!   u8 maxstacksize, u8 numparams, u8 nups, u8 flags (bit0 = vararg)
//!   varint sizecode, then sizecode u32 words
//!   varint sizek, then tagged constants
//!   varint sizep, then child proto indices (children precede parents)
//!   varint linedefined
//!   varint debugname string id (0 = none)
//!   u8 has_lineinfo, then sizecode varint lines
//!   varint nlocvars, then per var: varint name id, u8 reg, varint startpc, varint endpc
//!   varint nupvalues, then per upvalue: varint name id
//! varint main proto index
//! ```

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::bytecode::Insn;
use crate::gc::Closure;
use crate::proto::{LocVar, Proto, ProtoRef};
use crate::value::Value;
use crate::vm::Vm;

pub const BLOB_VERSION: u8 = 1;

// ---------------------------------------------------------------------------
// Templates (writer-side proto representation)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum ConstTemplate {
    Nil,
    Bool(bool),
    Number(f64),
    Str(String),
    /// Closure constant for DUPCLOSURE; the index of a previously emitted
    /// proto.
    Closure(usize),
}

#[derive(Debug, Clone, Default)]
pub struct ProtoTemplate {
    pub maxstacksize: u8,
    pub numparams: u8,
    pub nups: u8,
    pub is_vararg: bool,
    pub code: Vec<u32>,
    pub k: Vec<ConstTemplate>,
    pub children: Vec<usize>,
    pub linedefined: u32,
    pub debugname: Option<String>,
    pub lineinfo: Option<Vec<u32>>,
    pub locvars: Vec<(String, u8, u32, u32)>,
    pub upvalue_names: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Module {
    pub protos: Vec<ProtoTemplate>,
    pub main: usize,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobError {
    Truncated,
    BadVersion(u8),
    BadIndex(&'static str),
    BadUtf8,
}

impl fmt::Display for BlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobError::Truncated => write!(f, "bytecode ends unexpectedly"),
            BlobError::BadVersion(v) => write!(f, "unsupported bytecode version {}", v),
            BlobError::BadIndex(what) => write!(f, "{} index out of range", what),
            BlobError::BadUtf8 => write!(f, "malformed string data"),
        }
    }
}

impl std::error::Error for BlobError {}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

struct Writer {
    out: Vec<u8>,
    strings: Vec<String>,
}

impl Writer {
    fn byte(&mut self, b: u8) {
        self.out.push(b);
    }

    fn varint(&mut self, mut v: u32) {
        loop {
            let b = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                self.byte(b);
                break;
            }
            self.byte(b | 0x80);
        }
    }

    fn word(&mut self, w: u32) {
        self.out.extend_from_slice(&w.to_le_bytes());
    }

    /// Intern a string into the blob's string table, returning id + 1
    /// (0 is reserved for "absent").
    fn string_id(&mut self, s: &str) -> u32 {
        if let Some(pos) = self.strings.iter().position(|x| x == s) {
            return pos as u32 + 1;
        }
        self.strings.push(s.to_string());
        self.strings.len() as u32
    }
}

pub fn write_blob(module: &Module) -> Vec<u8> {
    let mut w = Writer {
        out: Vec::new(),
        strings: Vec::new(),
    };

    // Collect the string table up front so it can be written first.
    for p in &module.protos {
        for k in &p.k {
            if let ConstTemplate::Str(s) = k {
                w.string_id(s);
            }
        }
        if let Some(name) = &p.debugname {
            w.string_id(name);
        }
        for (name, _, _, _) in &p.locvars {
            w.string_id(name);
        }
        for name in &p.upvalue_names {
            w.string_id(name);
        }
    }

    let mut out = vec![BLOB_VERSION];
    let strings = w.strings.clone();
    let mut body = Writer {
        out: Vec::new(),
        strings,
    };

    body.varint(body.strings.len() as u32);
    for s in body.strings.clone() {
        body.varint(s.len() as u32);
        body.out.extend_from_slice(s.as_bytes());
    }

    body.varint(module.protos.len() as u32);
    for p in &module.protos {
        body.byte(p.maxstacksize);
        body.byte(p.numparams);
        body.byte(p.nups);
        body.byte(p.is_vararg as u8);

        body.varint(p.code.len() as u32);
        for &word in &p.code {
            body.word(word);
        }

        body.varint(p.k.len() as u32);
        for k in &p.k {
            match k {
                ConstTemplate::Nil => body.byte(0),
                ConstTemplate::Bool(b) => {
                    body.byte(1);
                    body.byte(*b as u8);
                }
                ConstTemplate::Number(n) => {
                    body.byte(2);
                    body.out.extend_from_slice(&n.to_le_bytes());
                }
                ConstTemplate::Str(s) => {
                    body.byte(3);
                    let id = body.string_id(s);
                    body.varint(id);
                }
                ConstTemplate::Closure(idx) => {
                    body.byte(4);
                    body.varint(*idx as u32);
                }
            }
        }

        body.varint(p.children.len() as u32);
        for &child in &p.children {
            body.varint(child as u32);
        }

        body.varint(p.linedefined);
        let name_id = p.debugname.as_deref().map(|n| body.string_id(n)).unwrap_or(0);
        body.varint(name_id);

        match &p.lineinfo {
            Some(lines) => {
                body.byte(1);
                for &line in lines {
                    body.varint(line);
                }
            }
            None => body.byte(0),
        }

        body.varint(p.locvars.len() as u32);
        for (name, reg, startpc, endpc) in &p.locvars {
            let id = body.string_id(name);
            body.varint(id);
            body.byte(*reg);
            body.varint(*startpc);
            body.varint(*endpc);
        }

        body.varint(p.upvalue_names.len() as u32);
        for name in &p.upvalue_names {
            let id = body.string_id(name);
            body.varint(id);
        }
    }

    body.varint(module.main as u32);
    out.extend_from_slice(&body.out);
    out
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn byte(&mut self) -> Result<u8, BlobError> {
        let b = *self.data.get(self.pos).ok_or(BlobError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn varint(&mut self) -> Result<u32, BlobError> {
        let mut v = 0u32;
        let mut shift = 0;
        loop {
            let b = self.byte()?;
            v |= ((b & 0x7f) as u32) << shift;
            if b & 0x80 == 0 {
                return Ok(v);
            }
            shift += 7;
            if shift >= 35 {
                return Err(BlobError::Truncated);
            }
        }
    }

    fn word(&mut self) -> Result<u32, BlobError> {
        let end = self.pos + 4;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or(BlobError::Truncated)?;
        self.pos = end;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4 bytes")))
    }

    fn f64(&mut self) -> Result<f64, BlobError> {
        let end = self.pos + 8;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or(BlobError::Truncated)?;
        self.pos = end;
        Ok(f64::from_le_bytes(bytes.try_into().expect("8 bytes")))
    }

    fn string(&mut self) -> Result<String, BlobError> {
        let len = self.varint()? as usize;
        let end = self.pos + len;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or(BlobError::Truncated)?;
        self.pos = end;
        String::from_utf8(bytes.to_vec()).map_err(|_| BlobError::BadUtf8)
    }
}

impl Vm {
    /// Deserialize a bytecode blob into live prototypes and return the
    /// closure of its main prototype. `source` names the chunk (usually
    /// `@path` or a plain tag).
    pub fn load_blob(&mut self, bytes: &[u8], source: &str) -> Result<Value, BlobError> {
        let mut r = Reader { data: bytes, pos: 0 };

        let version = r.byte()?;
        if version != BLOB_VERSION {
            return Err(BlobError::BadVersion(version));
        }

        let nstrings = r.varint()? as usize;
        let mut strings = Vec::with_capacity(nstrings);
        for _ in 0..nstrings {
            strings.push(r.string()?);
        }
        let lookup = |id: u32| -> Result<&String, BlobError> {
            let idx = (id as usize)
                .checked_sub(1)
                .ok_or(BlobError::BadIndex("string"))?;
            strings.get(idx).ok_or(BlobError::BadIndex("string"))
        };

        let nprotos = r.varint()? as usize;
        let mut protos: Vec<ProtoRef> = Vec::with_capacity(nprotos);
        for i in 0..nprotos {
            let maxstacksize = r.byte()?;
            let numparams = r.byte()?;
            let nups = r.byte()?;
            let is_vararg = r.byte()? != 0;

            let sizecode = r.varint()? as usize;
            let mut code = Vec::with_capacity(sizecode);
            for _ in 0..sizecode {
                code.push(Insn::aux(r.word()?));
            }

            let sizek = r.varint()? as usize;
            let mut k = Vec::with_capacity(sizek);
            for _ in 0..sizek {
                let v = match r.byte()? {
                    0 => Value::Nil,
                    1 => Value::Boolean(r.byte()? != 0),
                    2 => Value::Number(r.f64()?),
                    3 => {
                        let s = lookup(r.varint()?)?;
                        Value::Str(self.heap.alloc_str_fixed(s, 0))
                    }
                    4 => {
                        let idx = r.varint()? as usize;
                        let proto: &ProtoRef =
                            protos.get(idx).ok_or(BlobError::BadIndex("proto"))?;
                        let cl = self.heap.alloc_closure(
                            Closure::Lua {
                                proto: proto.clone(),
                                upvals: Vec::new(),
                            },
                            0,
                        );
                        Value::Function(cl)
                    }
                    _ => return Err(BlobError::BadIndex("constant tag")),
                };
                k.push(v);
            }

            let sizep = r.varint()? as usize;
            let mut children = Vec::with_capacity(sizep);
            for _ in 0..sizep {
                let idx = r.varint()? as usize;
                if idx >= i {
                    return Err(BlobError::BadIndex("child proto"));
                }
                children.push(protos[idx].clone());
            }

            let linedefined = r.varint()?;
            let name_id = r.varint()?;
            let debugname = if name_id == 0 {
                None
            } else {
                Some(lookup(name_id)?.clone())
            };

            let lineinfo = if r.byte()? != 0 {
                let mut lines = Vec::with_capacity(sizecode);
                for _ in 0..sizecode {
                    lines.push(r.varint()?);
                }
                Some(lines)
            } else {
                None
            };

            let nlocvars = r.varint()? as usize;
            let mut locvars = Vec::with_capacity(nlocvars);
            for _ in 0..nlocvars {
                let name = lookup(r.varint()?)?.clone();
                let reg = r.byte()?;
                let startpc = r.varint()?;
                let endpc = r.varint()?;
                locvars.push(LocVar {
                    name,
                    reg,
                    startpc,
                    endpc,
                });
            }

            let nupvals = r.varint()? as usize;
            let mut upvalues = Vec::with_capacity(nupvals);
            for _ in 0..nupvals {
                upvalues.push(lookup(r.varint()?)?.clone());
            }

            let proto = Rc::new(Proto {
                code: RefCell::new(code),
                k,
                upvalues,
                protos: children,
                source: source.to_string(),
                debugname,
                linedefined,
                lineinfo,
                locvars,
                maxstacksize,
                numparams,
                nups,
                is_vararg,
                memcat: 0,
                debuginsn: RefCell::new(None),
            });
            self.heap.register_proto(proto.clone(), 0);
            protos.push(proto);
        }

        let main = r.varint()? as usize;
        let main_proto = protos.get(main).ok_or(BlobError::BadIndex("main proto"))?;
        let cl = self.heap.alloc_closure(
            Closure::Lua {
                proto: main_proto.clone(),
                upvals: Vec::new(),
            },
            0,
        );
        Ok(Value::Function(cl))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
