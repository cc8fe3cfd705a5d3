//! Host-function standard library (spec §4.5's calling convention, plus the
//! minimal function surface SPEC_FULL.md calls out: `basic` and
//! `coroutine`). Everything here is a plain [`HostFn`] registered into a
//! table, exactly the shape a Lua `CALL` already knows how to invoke.

pub mod basic;
pub mod coroutine;

use crate::value::closure::{HostClosure, HostFn, LuaFunction};
use crate::value::lua_value::LuaValue;
use crate::vm::state::LuaState;
use std::rc::Rc;

/// Wrap a bare `HostFn` into a callable [`LuaValue`], named for error
/// messages and `debug`-style introspection.
pub fn host_fn(name: &str, f: HostFn) -> LuaValue {
    host_closure(name, f, Vec::new())
}

/// Like [`host_fn`] but captures `upvalues`, handed back to `f` on every
/// call — the mechanism `coroutine.wrap` uses to bind its function to a
/// specific thread without a closure environment.
pub fn host_closure(name: &str, f: HostFn, upvalues: Vec<LuaValue>) -> LuaValue {
    LuaValue::Function(LuaFunction::Host(Rc::new(HostClosure {
        name: Rc::new(crate::value::lua_string::LuaString::new(name)),
        func: f,
        upvalues,
    })))
}

/// Populate `state.globals` with the basic library and `coroutine` table.
pub fn install(state: &Rc<LuaState>) {
    basic::install(state);
    coroutine::install(state);
}
