//! Compilation entry point: lexing and parsing are both driven from here,
//! straight into a `Proto` with no separate AST pass (spec §4.2).

mod expdesc;
mod func_state;
mod parser;

use crate::error::LuaResult;
use crate::value::closure::Proto;
use std::rc::Rc;

pub fn compile(source: &str, chunk_name: &str) -> LuaResult<Rc<Proto>> {
    parser::parse(source, chunk_name)
}
