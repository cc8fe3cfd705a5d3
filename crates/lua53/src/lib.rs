//! Lua 5.3 execution core: lexer, single-pass compiler, and register-based
//! VM, plus the minimal standard library needed to drive real scripts (spec
//! §1's scope, as expanded for a complete embeddable crate).

pub mod bytecode;
pub mod compiler;
pub mod error;
pub mod lexer;
pub mod stdlib;
pub mod value;
pub mod vm;

#[cfg(test)]
mod test;

use error::LuaResult;
use std::rc::Rc;
use value::closure::{LuaClosure, LuaFunction, Upvalue};
use value::lua_value::LuaValue;
use vm::execute;
use vm::state::LuaState;

/// Compile and run `source` in a fresh [`LuaState`] with the standard
/// library installed, returning the chunk's results.
pub fn run(source: &str, chunk_name: &str) -> LuaResult<Vec<LuaValue>> {
    let state = LuaState::new();
    stdlib::install(&state);
    run_in(&state, source, chunk_name)
}

/// Compile and run `source` against an existing state, so callers can seed
/// extra globals (or reuse interned strings) across multiple chunks.
pub fn run_in(state: &Rc<LuaState>, source: &str, chunk_name: &str) -> LuaResult<Vec<LuaValue>> {
    let proto = compiler::compile(source, chunk_name)?;
    let env_upvalue = Upvalue::closed(LuaValue::Table(state.globals.clone()));
    let closure = LuaFunction::Lua(Rc::new(LuaClosure { proto, upvalues: vec![env_upvalue] }));
    execute::call_value(state, LuaValue::Function(closure), Vec::new())
}
