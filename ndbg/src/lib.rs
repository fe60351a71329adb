pub mod debugger;
pub mod disasm;

pub use debugger::{Breakpoint, Debugger, ProtoRegistry, ReplInput, StepMode};
pub use nula_rt::{chunk_id, Insn, Opcode, Proto, ProtoRef, Value, Vm};
