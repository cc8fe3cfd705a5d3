//! The basic library (spec SPEC_FULL.md's "Supplemented features"): the
//! handful of globals every embedding needs to drive the §8 end-to-end
//! scenarios and exercise §4.5's calling convention — `print`, `type`,
//! `pairs`/`ipairs`, metatable access, the `raw*` family, `pcall`/`xpcall`,
//! `error`/`assert`, `select`, and `tostring`/`tonumber`.
//!
//! `pairs`/`ipairs` walk a table's own array/hash parts directly rather than
//! going through `__index` (real 5.3 routes `ipairs` through ordinary
//! indexing); a full metamethod-aware iteration protocol is outside what
//! this calling-convention-only library covers, noted in DESIGN.md.

use super::host_fn;
use crate::error::{LuaError, LuaResult};
use crate::value::lua_value::LuaValue;
use crate::vm::execute::call_value;
use crate::vm::state::{self, LuaState};
use crate::vm::thread::LuaThread;
use std::cell::RefCell;
use std::rc::Rc;

const FUNCTIONS: &[(&str, crate::value::closure::HostFn)] = &[
    ("print", lua_print),
    ("type", lua_type),
    ("tostring", lua_tostring),
    ("tonumber", lua_tonumber),
    ("pairs", lua_pairs),
    ("ipairs", lua_ipairs),
    ("next", lua_next),
    ("setmetatable", lua_setmetatable),
    ("getmetatable", lua_getmetatable),
    ("rawget", lua_rawget),
    ("rawset", lua_rawset),
    ("rawequal", lua_rawequal),
    ("rawlen", lua_rawlen),
    ("pcall", lua_pcall),
    ("xpcall", lua_xpcall),
    ("error", lua_error),
    ("assert", lua_assert),
    ("select", lua_select),
];

pub fn install(state: &Rc<LuaState>) {
    let mut g = state.globals.borrow_mut();
    for (name, f) in FUNCTIONS {
        g.set(LuaValue::string(*name), host_fn(name, *f)).unwrap();
    }
    g.set(LuaValue::string("_VERSION"), LuaValue::string("Lua 5.3")).unwrap();
    drop(g);
    state
        .globals
        .borrow_mut()
        .set(LuaValue::string("_G"), LuaValue::Table(state.globals.clone()))
        .unwrap();
}

fn args(thread: &Rc<RefCell<LuaThread>>, base: usize) -> Vec<LuaValue> {
    let t = thread.borrow();
    (0..state::arg_count(&t, base)).map(|i| state::arg(&t, base, i)).collect()
}

fn put_results(thread: &Rc<RefCell<LuaThread>>, base: usize, results: &[LuaValue]) -> usize {
    let mut t = thread.borrow_mut();
    for (i, v) in results.iter().enumerate() {
        t.ensure_and_set(base + i, v.clone());
    }
    results.len()
}

/// `tostring`, honoring a `__tostring` metamethod when present.
pub fn tostring_value(state: &Rc<LuaState>, v: &LuaValue) -> LuaResult<LuaValue> {
    if let Some(mm) = state.get_metamethod(v, "__tostring") {
        let results = call_value(state, mm, vec![v.clone()])?;
        return Ok(results.into_iter().next().unwrap_or(LuaValue::Nil));
    }
    // A string already is its own tostring result, bytes and all — route
    // everything else through the formatter.
    if let LuaValue::Str(_) = v {
        return Ok(v.clone());
    }
    Ok(LuaValue::string(crate::value::tostring::display(v)))
}

fn lua_print(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let a = args(&thread, base);
    let mut parts = Vec::with_capacity(a.len());
    for v in &a {
        parts.push(tostring_value(state, v)?.to_string());
    }
    println!("{}", parts.join("\t"));
    Ok(0)
}

fn lua_type(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let v = args(&thread, base).into_iter().next().unwrap_or(LuaValue::Nil);
    Ok(put_results(&thread, base, &[LuaValue::string(v.type_name())]))
}

fn lua_tostring(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let v = args(&thread, base).into_iter().next().unwrap_or(LuaValue::Nil);
    let s = tostring_value(state, &v)?;
    Ok(put_results(&thread, base, &[s]))
}

fn lua_tonumber(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let a = args(&thread, base);
    let v = a.first().cloned().unwrap_or(LuaValue::Nil);
    let result = match a.get(1) {
        None => v.to_number().unwrap_or(LuaValue::Nil),
        Some(base_v) => {
            let radix = base_v.to_integer().unwrap_or(10);
            let s = v.as_str().map(str::trim).unwrap_or("");
            match i64::from_str_radix(s, radix as u32) {
                Ok(i) => LuaValue::Int(i),
                Err(_) => LuaValue::Nil,
            }
        }
    };
    Ok(put_results(&thread, base, &[result]))
}

fn lua_next(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let a = args(&thread, base);
    let t = a.first().and_then(LuaValue::as_table).cloned().ok_or_else(|| {
        LuaError::runtime(format!("bad argument #1 to 'next' (table expected, got {})", type_of(&a, 0)))
    })?;
    let key = a.get(1).cloned().unwrap_or(LuaValue::Nil);
    let next = t.borrow().next(&key)?;
    match next {
        Some((k, v)) => Ok(put_results(&thread, base, &[k, v])),
        None => Ok(put_results(&thread, base, &[LuaValue::Nil])),
    }
}

fn type_of(args: &[LuaValue], i: usize) -> &'static str {
    args.get(i).map(LuaValue::type_name).unwrap_or("no value")
}

fn lua_pairs(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let a = args(&thread, base);
    let t = a.first().cloned().unwrap_or(LuaValue::Nil);
    Ok(put_results(&thread, base, &[host_fn("next", lua_next), t, LuaValue::Nil]))
}

fn ipairs_aux(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let a = args(&thread, base);
    let t = a.first().and_then(LuaValue::as_table).cloned().ok_or_else(|| {
        LuaError::runtime(format!("bad argument #1 to 'ipairs' iterator (table expected, got {})", type_of(&a, 0)))
    })?;
    let i = a.get(1).and_then(LuaValue::to_integer).unwrap_or(0) + 1;
    let v = t.borrow().get(&LuaValue::Int(i));
    if v.is_nil() {
        Ok(put_results(&thread, base, &[LuaValue::Nil]))
    } else {
        Ok(put_results(&thread, base, &[LuaValue::Int(i), v]))
    }
}

fn lua_ipairs(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let a = args(&thread, base);
    let t = a.first().cloned().unwrap_or(LuaValue::Nil);
    Ok(put_results(&thread, base, &[host_fn("ipairs_aux", ipairs_aux), t, LuaValue::Int(0)]))
}

fn lua_setmetatable(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let a = args(&thread, base);
    let t = a.first().and_then(LuaValue::as_table).cloned().ok_or_else(|| {
        LuaError::runtime(format!("bad argument #1 to 'setmetatable' (table expected, got {})", type_of(&a, 0)))
    })?;
    if let Some(old) = t.borrow().metatable.clone() {
        if !old.borrow().get(&LuaValue::string("__metatable")).is_nil() {
            return Err(LuaError::runtime("cannot change a protected metatable"));
        }
    }
    let mt = match a.get(1) {
        None | Some(LuaValue::Nil) => None,
        Some(LuaValue::Table(mt)) => Some(mt.clone()),
        Some(other) => {
            return Err(LuaError::runtime(format!(
                "bad argument #2 to 'setmetatable' (nil or table expected, got {})",
                other.type_name()
            )))
        }
    };
    t.borrow_mut().metatable = mt;
    Ok(put_results(&thread, base, &[a[0].clone()]))
}

fn lua_getmetatable(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let v = args(&thread, base).into_iter().next().unwrap_or(LuaValue::Nil);
    let mt = match state.metatable_of(&v) {
        Some(mt) => mt,
        None => return Ok(put_results(&thread, base, &[LuaValue::Nil])),
    };
    let protected = mt.borrow().get(&LuaValue::string("__metatable"));
    let result = if protected.is_nil() { LuaValue::Table(mt) } else { protected };
    Ok(put_results(&thread, base, &[result]))
}

fn lua_rawget(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let a = args(&thread, base);
    let t = a.first().and_then(LuaValue::as_table).cloned().ok_or_else(|| {
        LuaError::runtime(format!("bad argument #1 to 'rawget' (table expected, got {})", type_of(&a, 0)))
    })?;
    let key = a.get(1).cloned().unwrap_or(LuaValue::Nil);
    let v = t.borrow().get(&key);
    Ok(put_results(&thread, base, &[v]))
}

fn lua_rawset(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let a = args(&thread, base);
    let t = a.first().and_then(LuaValue::as_table).cloned().ok_or_else(|| {
        LuaError::runtime(format!("bad argument #1 to 'rawset' (table expected, got {})", type_of(&a, 0)))
    })?;
    let key = a.get(1).cloned().unwrap_or(LuaValue::Nil);
    let val = a.get(2).cloned().unwrap_or(LuaValue::Nil);
    t.borrow_mut().set(key, val)?;
    Ok(put_results(&thread, base, &[a[0].clone()]))
}

fn lua_rawequal(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let a = args(&thread, base);
    let x = a.first().cloned().unwrap_or(LuaValue::Nil);
    let y = a.get(1).cloned().unwrap_or(LuaValue::Nil);
    Ok(put_results(&thread, base, &[LuaValue::Bool(x.raw_eq(&y))]))
}

fn lua_rawlen(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let a = args(&thread, base);
    let n = match a.first() {
        Some(LuaValue::Table(t)) => t.borrow().length(),
        Some(LuaValue::Str(s)) => s.len() as i64,
        _ => return Err(LuaError::runtime("table or string expected")),
    };
    Ok(put_results(&thread, base, &[LuaValue::Int(n)]))
}

fn lua_pcall(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let a = args(&thread, base);
    let mut it = a.into_iter();
    let f = it.next().unwrap_or(LuaValue::Nil);
    let rest: Vec<LuaValue> = it.collect();
    match call_value(state, f, rest) {
        Ok(results) => {
            let mut out = vec![LuaValue::Bool(true)];
            out.extend(results);
            Ok(put_results(&thread, base, &out))
        }
        Err(e) if crate::vm::execute::is_yield(&e) => Err(e),
        Err(e) => Ok(put_results(&thread, base, &[LuaValue::Bool(false), e.as_value()])),
    }
}

fn lua_xpcall(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let a = args(&thread, base);
    let mut it = a.into_iter();
    let f = it.next().unwrap_or(LuaValue::Nil);
    let handler = it.next().unwrap_or(LuaValue::Nil);
    let rest: Vec<LuaValue> = it.collect();
    match call_value(state, f, rest) {
        Ok(results) => {
            let mut out = vec![LuaValue::Bool(true)];
            out.extend(results);
            Ok(put_results(&thread, base, &out))
        }
        Err(e) if crate::vm::execute::is_yield(&e) => Err(e),
        Err(e) => {
            let handled = call_value(state, handler, vec![e.as_value()])?;
            let mut out = vec![LuaValue::Bool(false)];
            out.extend(handled);
            Ok(put_results(&thread, base, &out))
        }
    }
}

/// `error(message [, level])`: strings get the calling line's
/// `source:line:` prefix unless `level == 0`; any other value passes
/// through untouched (spec §4.5, §7).
fn lua_error(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let a = args(&thread, base);
    let msg = a.first().cloned().unwrap_or(LuaValue::Nil);
    let level = a.get(1).and_then(LuaValue::to_integer).unwrap_or(1);
    let value = match (&msg, level) {
        (LuaValue::Str(s), lvl) if lvl > 0 => {
            match caller_location(&thread) {
                Some((source, line)) => {
                    let mut prefixed = format!("{source}:{line}: ").into_bytes();
                    prefixed.extend_from_slice(s.as_bytes());
                    LuaValue::string_bytes(prefixed)
                }
                None => msg,
            }
        }
        _ => msg,
    };
    Err(LuaError::from_raised(value))
}

fn caller_location(thread: &Rc<RefCell<LuaThread>>) -> Option<(String, u32)> {
    let t = thread.borrow();
    let ci = t.frames.last()?;
    if let crate::value::closure::LuaFunction::Lua(c) = &ci.func {
        let pc = ci.pc.saturating_sub(1);
        let line = c.proto.lines.get(pc).copied().unwrap_or(c.proto.line_defined);
        Some((c.proto.source.clone(), line))
    } else {
        None
    }
}

fn lua_assert(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let a = args(&thread, base);
    let v = a.first().cloned().unwrap_or(LuaValue::Nil);
    if v.is_truthy() {
        Ok(put_results(&thread, base, &a))
    } else {
        match a.get(1) {
            Some(msg) => Err(LuaError::from_raised(msg.clone())),
            None => Err(LuaError::runtime("assertion failed!")),
        }
    }
}

fn lua_select(state: &Rc<LuaState>, base: usize, _upvalues: &[LuaValue]) -> LuaResult<usize> {
    let thread = state.current_thread();
    let a = args(&thread, base);
    let sel = a.first().cloned().unwrap_or(LuaValue::Nil);
    let rest = &a[1.min(a.len())..];
    if matches!(&sel, LuaValue::Str(s) if s.as_bytes() == b"#") {
        return Ok(put_results(&thread, base, &[LuaValue::Int(rest.len() as i64)]));
    }
    let n = sel
        .to_integer()
        .ok_or_else(|| LuaError::runtime("bad argument #1 to 'select' (number expected)"))?;
    let idx = if n < 0 {
        if rest.len() as i64 + n < 0 {
            return Err(LuaError::runtime("bad argument #1 to 'select' (index out of range)"));
        }
        (rest.len() as i64 + n) as usize
    } else if n == 0 {
        return Err(LuaError::runtime("bad argument #1 to 'select' (index out of range)"));
    } else {
        (n - 1) as usize
    };
    let out = rest.get(idx..).unwrap_or(&[]);
    Ok(put_results(&thread, base, out))
}
