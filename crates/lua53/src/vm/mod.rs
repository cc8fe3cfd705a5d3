//! Register-machine VM: opcodes, instruction encoding, per-thread call
//! stacks, shared interpreter state, and the dispatch loop (spec §4.4).

pub mod execute;
pub mod instruction;
pub mod opcode;
pub mod state;
pub mod thread;

pub use state::LuaState;
pub use thread::{LuaThread, ThreadStatus};
