use std::cell::RefCell;
use std::rc::Rc;

use crate::bytecode::{Insn, Opcode};
use crate::value::Value;

/// Maximum length of a chunk id, matching the VM's debug-string budget.
pub const ID_SIZE: usize = 64;

// ---------------------------------------------------------------------------
// Prototype
// ---------------------------------------------------------------------------

/// Debug descriptor for one local variable slot.
#[derive(Debug, Clone)]
pub struct LocVar {
    pub name: String,
    pub reg: u8,
    pub startpc: u32,
    pub endpc: u32,
}

/// One function body: bytecode, constants and debug metadata.
///
/// Prototypes are shared via `Rc`; identity is pointer identity. The code
/// stream and the shadow opcode array sit behind `RefCell` because the
/// debugger patches live instructions. Such patches happen only while the
/// VM is paused inside a hook, never during dispatch.
pub struct Proto {
    pub code: RefCell<Vec<Insn>>,
    pub k: Vec<Value>,
    pub upvalues: Vec<String>,
    pub protos: Vec<ProtoRef>,
    pub source: String,
    pub debugname: Option<String>,
    pub linedefined: u32,
    pub lineinfo: Option<Vec<u32>>,
    pub locvars: Vec<LocVar>,
    pub maxstacksize: u8,
    pub numparams: u8,
    pub nups: u8,
    pub is_vararg: bool,
    pub memcat: u8,
    /// Shadow array of original opcode bytes, allocated lazily when the
    /// first trap is installed. Where `code[pc]` holds a trap, this holds
    /// the opcode that belongs there.
    pub debuginsn: RefCell<Option<Vec<u8>>>,
}

pub type ProtoRef = Rc<Proto>;

impl Proto {
    pub fn sizecode(&self) -> usize {
        self.code.borrow().len()
    }

    pub fn insn_at(&self, pc: usize) -> Option<Insn> {
        self.code.borrow().get(pc).copied()
    }

    /// Source line for a program counter, when line info was emitted.
    pub fn line_for_pc(&self, pc: usize) -> Option<u32> {
        self.lineinfo.as_ref().and_then(|li| li.get(pc).copied())
    }

    /// The short printable identifier of this prototype's source unit.
    pub fn chunk_name(&self) -> String {
        chunk_id(&self.source)
    }

    /// The opcode that executes at `pc` once any installed trap is looked
    /// through: the shadow byte if the word holds a trap, the word's own
    /// opcode otherwise.
    pub fn real_op(&self, pc: usize) -> Option<u8> {
        let raw = self.insn_at(pc)?.raw_op();
        if raw == Opcode::Break as u8 {
            self.debuginsn.borrow().as_ref().map(|di| di[pc])
        } else {
            Some(raw)
        }
    }
}

impl std::fmt::Debug for Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proto")
            .field("source", &self.source)
            .field("debugname", &self.debugname)
            .field("sizecode", &self.sizecode())
            .field("sizek", &self.k.len())
            .field("sizep", &self.protos.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Chunk ids
// ---------------------------------------------------------------------------

/// Shorten a source string to a printable chunk id.
///
/// `@path` names a file (kept, tail-truncated with a `...` prefix when too
/// long), `=tag` is used verbatim, and anything else is script text shown
/// as `[string "first line..."]`.
pub fn chunk_id(source: &str) -> String {
    if let Some(path) = source.strip_prefix('@') {
        if path.len() <= ID_SIZE {
            path.to_string()
        } else {
            let tail = &path[path.len() - (ID_SIZE - 3)..];
            format!("...{}", tail)
        }
    } else if let Some(tag) = source.strip_prefix('=') {
        tag.chars().take(ID_SIZE).collect()
    } else {
        let first_line = source.lines().next().unwrap_or("");
        let budget = ID_SIZE - "[string \"...\"]".len();
        if first_line.len() <= budget && first_line.len() == source.len() {
            format!("[string \"{}\"]", first_line)
        } else {
            format!("[string \"{}...\"]", &first_line[..first_line.len().min(budget)])
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
