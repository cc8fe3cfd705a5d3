//! The `coroutine` library, backed directly by [`LuaThread`] (spec §4.5,
//! supplemented per SPEC_FULL.md): each Lua coroutine is a full secondary
//! call stack, so `create`/`resume`/`yield` are thin wrappers around
//! [`crate::vm::execute::resume`]/`do_yield` rather than a separate
//! green-thread runtime.
//!
//! Yielding is modeled as an error (`ErrorKind::Yield`) that unwinds through
//! every Rust stack frame between the `yield` call and whichever `resume`
//! started the innermost un-finished invocation; `resume` is the only place
//! that catches it. `pcall`/`xpcall` deliberately don't (see `basic.rs`), so
//! yielding across a protected call inside a coroutine is not supported.

use super::{host_closure, host_fn};
use crate::error::{LuaError, LuaResult};
use crate::value::lua_value::{LuaValue, ThreadRef};
use crate::vm::execute;
use crate::vm::state::LuaState;
use crate::vm::thread::{LuaThread, ThreadStatus};
use std::rc::Rc;

pub fn install(state: &Rc<LuaState>) {
    let t = LuaValue::new_table();
    if let Some(table) = t.as_table() {
        let mut g = table.borrow_mut();
        g.set(LuaValue::string("create"), host_fn("create", lua_create)).unwrap();
        g.set(LuaValue::string("resume"), host_fn("resume", lua_resume)).unwrap();
        g.set(LuaValue::string("yield"), host_fn("yield", lua_yield)).unwrap();
        g.set(LuaValue::string("status"), host_fn("status", lua_status)).unwrap();
        g.set(LuaValue::string("wrap"), host_fn("wrap", lua_wrap)).unwrap();
        g.set(LuaValue::string("isyieldable"), host_fn("isyieldable", lua_isyieldable)).unwrap();
        g.set(LuaValue::string("running"), host_fn("running", lua_running)).unwrap();
    }
    state.globals.borrow_mut().set(LuaValue::string("coroutine"), t).unwrap();
}

fn args(thread: &ThreadRef, base: usize) -> Vec<LuaValue> {
    let t = thread.borrow();
    (0..crate::vm::state::arg_count(&t, base))
        .map(|i| crate::vm::state::arg(&t, base, i))
        .collect()
}

fn put_results(thread: &ThreadRef, base: usize, results: &[LuaValue]) -> usize {
    let mut t = thread.borrow_mut();
    for (i, v) in results.iter().enumerate() {
        t.ensure_and_set(base + i, v.clone());
    }
    results.len()
}

fn lua_create(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let a = args(&thread, base);
    let f = a.first().cloned().unwrap_or(LuaValue::Nil);
    if !matches!(f, LuaValue::Function(_)) {
        return Err(LuaError::runtime(format!(
            "bad argument #1 to 'create' (function expected, got {})",
            f.type_name()
        )));
    }
    let co = new_coroutine(state, f);
    Ok(put_results(&thread, base, &[LuaValue::Thread(co)]))
}

fn new_coroutine(state: &Rc<LuaState>, f: LuaValue) -> ThreadRef {
    let co = state.new_thread();
    co.borrow_mut().pending_call = Some(f);
    co
}

/// Runs `co` with `args`, swapping `state.current_thread` to `co` for the
/// duration so host functions called from inside it (e.g. `print`) read
/// their arguments off the right stack.
fn drive(state: &Rc<LuaState>, co: &ThreadRef, args: Vec<LuaValue>) -> LuaResult<Vec<LuaValue>> {
    if matches!(co.borrow().status, ThreadStatus::Dead) && co.borrow().pending_call.is_none() {
        return Err(LuaError::runtime("cannot resume dead coroutine"));
    }
    if matches!(co.borrow().status, ThreadStatus::Running) {
        return Err(LuaError::runtime("cannot resume non-suspended coroutine"));
    }
    let previous = state.current_thread();
    *state.current_thread.borrow_mut() = co.clone();
    co.borrow_mut().status = ThreadStatus::Running;
    let result = execute::resume(state, co, args);
    *state.current_thread.borrow_mut() = previous;
    match &result {
        Ok(_) => co.borrow_mut().status = ThreadStatus::Dead,
        Err(e) if execute::is_yield(e) => co.borrow_mut().status = ThreadStatus::Suspended,
        Err(_) => co.borrow_mut().status = ThreadStatus::Dead,
    }
    result
}

fn lua_resume(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let a = args(&thread, base);
    let mut it = a.into_iter();
    let co = match it.next() {
        Some(LuaValue::Thread(t)) => t,
        other => {
            return Err(LuaError::runtime(format!(
                "bad argument #1 to 'resume' (coroutine expected, got {})",
                other.map(|v| v.type_name()).unwrap_or("no value")
            )))
        }
    };
    let rest: Vec<LuaValue> = it.collect();
    match drive(state, &co, rest) {
        Ok(results) => {
            let mut out = vec![LuaValue::Bool(true)];
            out.extend(results);
            Ok(put_results(&thread, base, &out))
        }
        Err(e) if execute::is_yield(&e) => {
            let mut out = vec![LuaValue::Bool(true)];
            out.extend(e.yielded.clone().unwrap_or_default());
            Ok(put_results(&thread, base, &out))
        }
        Err(e) => Ok(put_results(&thread, base, &[LuaValue::Bool(false), e.as_value()])),
    }
}

fn lua_yield(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let a = args(&thread, base);
    Err(execute::do_yield(a))
}

fn lua_status(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let a = args(&thread, base);
    let co = a.first().and_then(|v| match v {
        LuaValue::Thread(t) => Some(t.clone()),
        _ => None,
    });
    let status = match co {
        None => {
            return Err(LuaError::runtime("bad argument #1 to 'status' (coroutine expected)"));
        }
        Some(co) if Rc::ptr_eq(&co, &thread) => "running",
        Some(co) => match co.borrow().status {
            ThreadStatus::Suspended => "suspended",
            ThreadStatus::Running => "normal",
            ThreadStatus::Normal => "normal",
            ThreadStatus::Dead => "dead",
        },
    };
    Ok(put_results(&thread, base, &[LuaValue::string(status)]))
}

/// `coroutine.wrap(f)`: same as `create` but returns a callable that resumes
/// the thread directly and re-raises errors instead of returning `(ok, ...)`.
/// The target thread is carried as the returned host closure's only upvalue
/// (spec §4.5's host-closure convention).
fn lua_wrap(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let a = args(&thread, base);
    let f = a.first().cloned().unwrap_or(LuaValue::Nil);
    if !matches!(f, LuaValue::Function(_)) {
        return Err(LuaError::runtime(format!(
            "bad argument #1 to 'wrap' (function expected, got {})",
            f.type_name()
        )));
    }
    let co = new_coroutine(state, f);
    let wrapped = host_closure("wrapped coroutine", wrapped_resume, vec![LuaValue::Thread(co)]);
    Ok(put_results(&thread, base, &[wrapped]))
}

fn wrapped_resume(state: &Rc<LuaState>, base: usize, upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let a = args(&thread, base);
    let co = match upvalues.first() {
        Some(LuaValue::Thread(t)) => t.clone(),
        _ => return Err(LuaError::runtime("corrupt coroutine wrapper")),
    };
    let results = drive(state, &co, a)?;
    Ok(put_results(&thread, base, &results))
}

fn lua_isyieldable(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let yieldable = !Rc::ptr_eq(&thread, &state.main_thread);
    Ok(put_results(&thread, base, &[LuaValue::Bool(yieldable)]))
}

fn lua_running(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let is_main = Rc::ptr_eq(&thread, &state.main_thread);
    Ok(put_results(&thread, base, &[LuaValue::Thread(thread.clone()), LuaValue::Bool(is_main)]))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn create_starts_suspended() {
        let state = LuaState::new();
        super::install(&state);
        let body = host_fn("body", |_state, _base, _up| Ok(0));
        let co = new_coroutine(&state, body);
        assert!(matches!(co.borrow().status, ThreadStatus::Suspended));
    }

    #[test]
    fn status_reports_dead_after_normal_return() {
        let state = LuaState::new();
        let body = host_fn("body", |_state, _base, _up| Ok(0));
        let co = new_coroutine(&state, body);
        let result = drive(&state, &co, vec![]);
        assert!(result.is_ok());
        assert!(matches!(co.borrow().status, ThreadStatus::Dead));
    }
}
