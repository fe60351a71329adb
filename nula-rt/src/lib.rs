pub mod blob;
pub mod bytecode;
pub mod compile;
pub mod gc;
pub mod interp;
pub mod proto;
pub mod value;
pub mod vm;

pub use bytecode::{Insn, Opcode};
pub use proto::{chunk_id, LocVar, Proto, ProtoRef};
pub use value::{GcRef, Value};
pub use vm::{DebugCallbacks, DebugRecord, Vm, VmError, VmStatus};
