//! The fetch-decode-execute loop (spec §4.4), plus the call/return
//! machinery that also backs `pcall` and coroutine `resume`/`yield`.
//!
//! The Lua call stack lives as data in `LuaThread::frames`, not as Rust
//! stack frames: a plain `CALL` of a Lua function recurses into
//! [`run_frame`] exactly once per level, and `TAILCALL` mutates the current
//! frame in place and loops, costing no extra Rust stack. That
//! data-not-control-flow split is what lets `coroutine.yield` suspend a
//! thread deep inside nested calls and `resume` continue it later:
//! yielding propagates `Err(ErrorKind::Yield)` up through the (bounded)
//! Rust recursion without popping any `CallInfo`, and `resume` re-enters
//! `run_frame` at the same index, notices a deeper frame already exists
//! (the `has_deeper` branch below), and delegates straight to it instead of
//! pushing a new one.

use crate::error::{ErrorKind, LuaError, LuaResult};
use crate::value::closure::{LuaClosure, LuaFunction, Proto, UpvalState};
use crate::value::lua_table::normalize_key;
use crate::value::lua_value::{LuaValue, ThreadRef};
use crate::vm::instruction::Instruction as I;
use crate::vm::opcode::OpCode;
use crate::vm::state::LuaState;
use crate::vm::thread::CallInfo;
use std::rc::Rc;

const MAX_METAMETHOD_DEPTH: u32 = 100;

/// Call `func` with `args` on the state's current thread and collect every
/// result. The entry point used by `lib.rs::execute()`, `pcall`, and
/// metamethod dispatch.
pub fn call_value(state: &Rc<LuaState>, func: LuaValue, args: Vec<LuaValue>) -> LuaResult<Vec<LuaValue>> {
    let thread = state.current_thread();
    let base = thread.borrow().stack.len();
    {
        let mut t = thread.borrow_mut();
        t.stack.push(func);
        t.stack.extend(args);
    }
    call_prepared(state, &thread, base)
}

/// `func` and its arguments already sit on the stack at `stack[base]..`;
/// dispatch to a host function directly or push a `CallInfo` and run it.
fn call_prepared(state: &Rc<LuaState>, thread: &ThreadRef, base: usize) -> LuaResult<Vec<LuaValue>> {
    let func = thread.borrow().stack[base].clone();
    let arg_base = base + 1;
    match resolve_callable(state, func, thread, base)? {
        LuaFunction::Host(h) => {
            let n = (h.func)(state, arg_base, &h.upvalues)?;
            let mut t = thread.borrow_mut();
            let results = t.stack[arg_base..arg_base + n].to_vec();
            t.stack.truncate(base);
            Ok(results)
        }
        f @ LuaFunction::Lua(_) => {
            let idx = thread.borrow().frames.len();
            thread.borrow_mut().frames.push(CallInfo {
                func: f,
                base: arg_base,
                pc: 0,
                func_index: base,
                want_results: None,
                is_tailcall: false,
            });
            let results = run_frame(state, thread, idx)?;
            thread.borrow_mut().stack.truncate(base);
            Ok(results)
        }
    }
}

/// Resolve `__call` chains: a table/userdata with a `__call` metamethod is
/// itself callable, with the original value prepended as the first
/// argument (spec §4.3).
fn resolve_callable(
    state: &Rc<LuaState>,
    func: LuaValue,
    thread: &ThreadRef,
    base: usize,
) -> LuaResult<LuaFunction> {
    if let LuaValue::Function(f) = func {
        return Ok(f);
    }
    if let Some(LuaValue::Function(f)) = state.get_metamethod(&func, "__call") {
        thread.borrow_mut().stack.insert(base, LuaValue::Function(f.clone()));
        return Ok(f);
    }
    Err(LuaError::runtime(format!("attempt to call a {} value", func.type_name())))
}

/// Drive frame `idx` (and anything it calls) to completion, returning its
/// final results. If a deeper frame already exists when this is entered,
/// we're resuming after a yield: delegate straight to it instead of
/// re-dispatching from `idx`'s own instruction pointer.
pub fn run_frame(state: &Rc<LuaState>, thread: &ThreadRef, idx: usize) -> LuaResult<Vec<LuaValue>> {
    loop {
        let has_deeper = thread.borrow().frames.len() > idx + 1;
        if has_deeper {
            let results = run_frame(state, thread, idx + 1)?;
            place_call_results(thread, idx, results);
            continue;
        }
        match step_frame(state, thread, idx)? {
            Step::Continue => continue,
            Step::Return(results) => return Ok(results),
        }
    }
}

enum Step {
    Continue,
    Return(Vec<LuaValue>),
}

/// After a called frame (which sat at `thread.frames[idx + 1]` before being
/// popped by its own `RETURN`) produces `results`, copy them into the
/// calling frame's registers starting at the call's function register.
fn place_call_results(thread: &ThreadRef, idx: usize, results: Vec<LuaValue>) {
    let mut t = thread.borrow_mut();
    let ci = &t.frames[idx];
    let dest = ci.base;
    let want = ci.want_results;
    drop(ci);
    let _ = idx;
    let n = want.unwrap_or(results.len());
    t.ensure_stack(dest + n.max(results.len()));
    for i in 0..n {
        t.stack[dest + i] = results.get(i).cloned().unwrap_or(LuaValue::Nil);
    }
    if want.is_none() {
        t.stack.truncate(dest + results.len());
    }
}

/// Execute instructions of frame `idx` until it either returns (popping
/// itself and reporting `Step::Return`) or issues a call that needs a
/// nested `run_frame`, in which case this function itself recurses and
/// keeps going — so in the common (non-yielding-resume) case, an entire
/// call tree unwinds inside one top-level `step_frame`/`run_frame` pair of
/// mutually-recursive calls.
fn step_frame(state: &Rc<LuaState>, thread: &ThreadRef, idx: usize) -> LuaResult<Step> {
    loop {
        let (proto, base) = {
            let t = thread.borrow();
            let ci = &t.frames[idx];
            match &ci.func {
                LuaFunction::Lua(c) => (c.proto.clone(), ci.base),
                LuaFunction::Host(_) => unreachable!("host calls never get a CallInfo frame"),
            }
        };
        thread.borrow_mut().ensure_stack(base + proto.max_stack_size as usize);
        let pc = thread.borrow().frames[idx].pc;
        let instr = proto.code[pc];
        thread.borrow_mut().frames[idx].pc = pc + 1;
        let op = I::get_opcode(instr);
        let a = I::get_a(instr) as usize;
        match op {
            OpCode::Move => {
                let b = I::get_b(instr) as usize;
                let v = reg(thread, base, b);
                set_reg(thread, base, a, v);
            }
            OpCode::LoadK => {
                let v = proto.constants[I::get_bx(instr) as usize].clone();
                set_reg(thread, base, a, v);
            }
            OpCode::LoadKx => {
                let next = proto.code[thread.borrow().frames[idx].pc];
                thread.borrow_mut().frames[idx].pc += 1;
                let kidx = I::get_ax(next) as usize;
                set_reg(thread, base, a, proto.constants[kidx].clone());
            }
            OpCode::LoadBool => {
                set_reg(thread, base, a, LuaValue::Bool(I::get_b(instr) != 0));
                if I::get_c(instr) != 0 {
                    thread.borrow_mut().frames[idx].pc += 1;
                }
            }
            OpCode::LoadNil => {
                let b = I::get_b(instr) as usize;
                for i in 0..=b {
                    set_reg(thread, base, a + i, LuaValue::Nil);
                }
            }
            OpCode::GetUpval => {
                let b = I::get_b(instr) as usize;
                let closure = current_closure(thread, idx);
                let v = read_upvalue(thread, &closure.upvalues[b]);
                set_reg(thread, base, a, v);
            }
            OpCode::SetUpval => {
                let b = I::get_b(instr) as usize;
                let closure = current_closure(thread, idx);
                let v = reg(thread, base, a);
                write_upvalue(thread, &closure.upvalues[b], v);
            }
            OpCode::GetTabUp => {
                let b = I::get_b(instr) as usize;
                let closure = current_closure(thread, idx);
                let table = read_upvalue(thread, &closure.upvalues[b]);
                let key = rk(thread, base, &proto, I::get_c(instr));
                let v = index_get(state, &table, &key)?;
                set_reg(thread, base, a, v);
            }
            OpCode::SetTabUp => {
                let closure = current_closure(thread, idx);
                let table = read_upvalue(thread, &closure.upvalues[a]);
                let key = rk(thread, base, &proto, I::get_b(instr));
                let val = rk(thread, base, &proto, I::get_c(instr));
                index_set(state, &table, key, val)?;
            }
            OpCode::GetTable => {
                let b = I::get_b(instr) as usize;
                let table = reg(thread, base, b);
                let key = rk(thread, base, &proto, I::get_c(instr));
                let v = index_get(state, &table, &key)?;
                set_reg(thread, base, a, v);
            }
            OpCode::SetTable => {
                let table = reg(thread, base, a);
                let key = rk(thread, base, &proto, I::get_b(instr));
                let val = rk(thread, base, &proto, I::get_c(instr));
                index_set(state, &table, key, val)?;
            }
            OpCode::NewTable => {
                set_reg(thread, base, a, LuaValue::new_table());
            }
            OpCode::SelfOp => {
                let b = I::get_b(instr) as usize;
                let table = reg(thread, base, b);
                let key = rk(thread, base, &proto, I::get_c(instr));
                let method = index_get(state, &table, &key)?;
                set_reg(thread, base, a + 1, table);
                set_reg(thread, base, a, method);
            }
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Mod | OpCode::Pow
            | OpCode::Div | OpCode::IDiv | OpCode::BAnd | OpCode::BOr | OpCode::BXor
            | OpCode::Shl | OpCode::Shr => {
                let l = rk(thread, base, &proto, I::get_b(instr));
                let r = rk(thread, base, &proto, I::get_c(instr));
                let v = arith_binop(state, op, l, r)?;
                set_reg(thread, base, a, v);
            }
            OpCode::Unm => {
                let b = I::get_b(instr) as usize;
                let v = reg(thread, base, b);
                let r = arith_unm(state, v)?;
                set_reg(thread, base, a, r);
            }
            OpCode::BNot => {
                let b = I::get_b(instr) as usize;
                let v = reg(thread, base, b);
                let r = arith_bnot(state, v)?;
                set_reg(thread, base, a, r);
            }
            OpCode::Not => {
                let b = I::get_b(instr) as usize;
                let v = reg(thread, base, b);
                set_reg(thread, base, a, LuaValue::Bool(!v.is_truthy()));
            }
            OpCode::Len => {
                let b = I::get_b(instr) as usize;
                let v = reg(thread, base, b);
                let r = length_of(state, &v)?;
                set_reg(thread, base, a, r);
            }
            OpCode::Concat => {
                let b = I::get_b(instr) as usize;
                let c = I::get_c(instr) as usize;
                let mut acc = reg(thread, base, c);
                let mut i = c;
                while i > b {
                    i -= 1;
                    let left = reg(thread, base, i);
                    acc = concat_values(state, left, acc)?;
                }
                set_reg(thread, base, a, acc);
            }
            OpCode::Jmp => {
                do_jump(thread, idx, a, I::get_sbx(instr));
            }
            OpCode::Eq | OpCode::Lt | OpCode::Le => {
                let l = rk(thread, base, &proto, I::get_b(instr));
                let r = rk(thread, base, &proto, I::get_c(instr));
                let result = compare(state, op, &l, &r)?;
                let expect = a != 0;
                if result != expect {
                    thread.borrow_mut().frames[idx].pc += 1;
                }
            }
            OpCode::Test => {
                let v = reg(thread, base, a);
                let c = I::get_c(instr) != 0;
                if v.is_truthy() != c {
                    thread.borrow_mut().frames[idx].pc += 1;
                }
            }
            OpCode::TestSet => {
                let b = I::get_b(instr) as usize;
                let v = reg(thread, base, b);
                let c = I::get_c(instr) != 0;
                if v.is_truthy() != c {
                    thread.borrow_mut().frames[idx].pc += 1;
                } else {
                    set_reg(thread, base, a, v);
                }
            }
            OpCode::Call => {
                let b = I::get_b(instr) as usize;
                let c = I::get_c(instr) as usize;
                let call_base = base + a;
                if b != 0 {
                    thread.borrow_mut().stack.truncate(call_base + b);
                }
                let want = if c == 0 { None } else { Some(c - 1) };
                dispatch_call(state, thread, idx, call_base, want)?;
            }
            OpCode::TailCall => {
                let b = I::get_b(instr) as usize;
                let call_base = base + a;
                if b != 0 {
                    thread.borrow_mut().stack.truncate(call_base + b);
                }
                return tail_call(state, thread, idx, call_base);
            }
            OpCode::Return => {
                let b = I::get_b(instr) as usize;
                let nret = if b == 0 {
                    thread.borrow().stack.len() - (base + a)
                } else {
                    b - 1
                };
                let results = {
                    let t = thread.borrow();
                    t.stack[base + a..base + a + nret].to_vec()
                };
                thread.borrow_mut().close_upvalues(base);
                thread.borrow_mut().frames.truncate(idx);
                return Ok(Step::Return(results));
            }
            OpCode::ForPrep => {
                for_prep(thread, base, a)?;
                do_jump(thread, idx, 0, I::get_sbx(instr));
            }
            OpCode::ForLoop => {
                if for_loop(thread, base, a)? {
                    do_jump(thread, idx, 0, I::get_sbx(instr));
                }
            }
            OpCode::TForCall => {
                let func = reg(thread, base, a);
                let state_v = reg(thread, base, a + 1);
                let ctrl = reg(thread, base, a + 2);
                let c = I::get_c(instr) as usize;
                let results = call_value(state, func, vec![state_v, ctrl])?;
                for i in 0..c {
                    set_reg(thread, base, a + 3 + i, results.get(i).cloned().unwrap_or(LuaValue::Nil));
                }
            }
            OpCode::TForLoop => {
                let ctrl = reg(thread, base, a + 1);
                if !ctrl.is_nil() {
                    set_reg(thread, base, a, ctrl);
                    do_jump(thread, idx, 0, I::get_sbx(instr));
                }
            }
            OpCode::SetList => {
                let b = I::get_b(instr) as usize;
                let mut c = I::get_c(instr) as usize;
                if c == 0 {
                    let next = proto.code[thread.borrow().frames[idx].pc];
                    thread.borrow_mut().frames[idx].pc += 1;
                    c = I::get_ax(next) as usize;
                }
                let n = if b == 0 { thread.borrow().stack.len() - (base + a + 1) } else { b };
                let table = reg(thread, base, a);
                let t = table.as_table().cloned().ok_or_else(|| LuaError::runtime("SETLIST on non-table"))?;
                for i in 1..=n {
                    let v = reg(thread, base, a + i);
                    let key = LuaValue::Int(((c - 1) * 50 + i) as i64);
                    t.borrow_mut().set(key, v).map_err(|e| e)?;
                }
            }
            OpCode::Closure => {
                let proto_idx = I::get_bx(instr) as usize;
                let child = proto.protos[proto_idx].clone();
                let closure = build_closure(thread, idx, base, child);
                set_reg(thread, base, a, LuaValue::Function(LuaFunction::Lua(Rc::new(closure))));
            }
            OpCode::Vararg => {
                let b = I::get_b(instr) as usize;
                let varargs = {
                    let t = thread.borrow();
                    t.varargs.last().cloned().unwrap_or_default()
                };
                let n = if b == 0 { varargs.len() } else { b - 1 };
                if b == 0 {
                    thread.borrow_mut().ensure_stack(base + a + n);
                }
                for i in 0..n {
                    set_reg(thread, base, a + i, varargs.get(i).cloned().unwrap_or(LuaValue::Nil));
                }
                if b == 0 {
                    thread.borrow_mut().stack.truncate(base + a + n);
                }
            }
            OpCode::ExtraArg => unreachable!("consumed inline by LOADKX/SETLIST"),
        }
    }
}

/// Non-tail `CALL`: resolve the callee, drive it to completion (a host
/// function runs synchronously; a Lua function gets a `CallInfo` and a
/// nested [`run_frame`]), and land its results back at `call_base`. Always
/// returns control to the current frame's loop — only `tail_call` can end
/// it.
fn dispatch_call(
    state: &Rc<LuaState>,
    thread: &ThreadRef,
    _idx: usize,
    call_base: usize,
    want: Option<usize>,
) -> LuaResult<()> {
    let func = thread.borrow().stack[call_base].clone();
    let callee = resolve_callable(state, func, thread, call_base)?;
    let arg_base = call_base + 1;
    let results = match callee {
        LuaFunction::Host(h) => {
            thread.borrow_mut().pending_yield_site = Some((call_base, want));
            let n = (h.func)(state, arg_base, &h.upvalues)?;
            thread.borrow().stack[arg_base..arg_base + n].to_vec()
        }
        f @ LuaFunction::Lua(_) => {
            let child_idx = thread.borrow().frames.len();
            thread.borrow_mut().frames.push(CallInfo {
                func: f,
                base: arg_base,
                pc: 0,
                func_index: call_base,
                want_results: want,
                is_tailcall: false,
            });
            run_frame(state, thread, child_idx)?
        }
    };
    let dest = call_base;
    let mut t = thread.borrow_mut();
    let keep = want.unwrap_or(results.len());
    t.ensure_stack(dest + keep.max(results.len()));
    for i in 0..keep {
        t.stack[dest + i] = results.get(i).cloned().unwrap_or(LuaValue::Nil);
    }
    if want.is_none() {
        t.stack.truncate(dest + results.len());
    }
    Ok(())
}

/// `TAILCALL`: replace this frame's function/base in place instead of
/// pushing a new `CallInfo`, so Lua tail recursion costs no Rust stack
/// (spec §4.4's "proper tail calls").
fn tail_call(state: &Rc<LuaState>, thread: &ThreadRef, idx: usize, call_base: usize) -> LuaResult<Step> {
    let func = thread.borrow().stack[call_base].clone();
    let callee = resolve_callable(state, func, thread, call_base)?;
    let arg_base = call_base + 1;
    let old_base = thread.borrow().frames[idx].base;
    thread.borrow_mut().close_upvalues(old_base);
    match callee {
        LuaFunction::Host(h) => {
            let n = (h.func)(state, arg_base, &h.upvalues)?;
            let results = thread.borrow().stack[arg_base..arg_base + n].to_vec();
            thread.borrow_mut().frames.truncate(idx);
            Ok(Step::Return(results))
        }
        f @ LuaFunction::Lua(_) => {
            let want = thread.borrow().frames[idx].want_results;
            thread.borrow_mut().frames[idx] = CallInfo {
                func: f,
                base: arg_base,
                pc: 0,
                func_index: call_base,
                want_results: want,
                is_tailcall: true,
            };
            Ok(Step::Continue)
        }
    }
}

fn do_jump(thread: &ThreadRef, idx: usize, a: usize, sbx: i32) {
    if a > 0 {
        let base = thread.borrow().frames[idx].base;
        thread.borrow_mut().close_upvalues(base + a - 1);
    }
    let mut t = thread.borrow_mut();
    let pc = &mut t.frames[idx].pc;
    *pc = (*pc as i64 + sbx as i64) as usize;
}

fn current_closure(thread: &ThreadRef, idx: usize) -> Rc<LuaClosure> {
    match &thread.borrow().frames[idx].func {
        LuaFunction::Lua(c) => c.clone(),
        LuaFunction::Host(_) => unreachable!(),
    }
}

fn build_closure(thread: &ThreadRef, idx: usize, base: usize, proto: Rc<Proto>) -> LuaClosure {
    let enclosing = current_closure(thread, idx);
    let mut upvalues = Vec::with_capacity(proto.upvalues.len());
    for desc in &proto.upvalues {
        if desc.in_stack {
            let uv = thread.borrow_mut().find_or_create_upvalue(base + desc.index as usize);
            upvalues.push(uv);
        } else {
            upvalues.push(enclosing.upvalues[desc.index as usize].clone());
        }
    }
    LuaClosure { proto, upvalues }
}

fn read_upvalue(thread: &ThreadRef, uv: &Rc<crate::value::closure::Upvalue>) -> LuaValue {
    match &*uv.0.borrow() {
        UpvalState::Open(i) => thread.borrow().stack.get(*i).cloned().unwrap_or(LuaValue::Nil),
        UpvalState::Closed(v) => v.clone(),
    }
}

fn write_upvalue(thread: &ThreadRef, uv: &Rc<crate::value::closure::Upvalue>, v: LuaValue) {
    let idx = match &*uv.0.borrow() {
        UpvalState::Open(i) => Some(*i),
        UpvalState::Closed(_) => None,
    };
    match idx {
        Some(i) => thread.borrow_mut().ensure_and_set(i, v),
        None => *uv.0.borrow_mut() = UpvalState::Closed(v),
    }
}

fn reg(thread: &ThreadRef, base: usize, i: usize) -> LuaValue {
    thread.borrow().stack.get(base + i).cloned().unwrap_or(LuaValue::Nil)
}

fn set_reg(thread: &ThreadRef, base: usize, i: usize, v: LuaValue) {
    let mut t = thread.borrow_mut();
    t.ensure_stack(base + i + 1);
    t.stack[base + i] = v;
}

fn rk(thread: &ThreadRef, base: usize, proto: &Proto, x: u32) -> LuaValue {
    if I::is_k(x) {
        proto.constants[I::rk_index(x) as usize].clone()
    } else {
        reg(thread, base, x as usize)
    }
}

fn for_prep(thread: &ThreadRef, base: usize, a: usize) -> LuaResult<()> {
    let init = reg(thread, base, a);
    let limit = reg(thread, base, a + 1);
    let step = reg(thread, base, a + 2);
    let (init, limit, step) = coerce_for_loop(init, limit, step)?;
    set_reg(thread, base, a, sub_for(init, step.clone())?);
    set_reg(thread, base, a + 1, limit);
    set_reg(thread, base, a + 2, step);
    Ok(())
}

/// Returns `true` when the loop should continue (and the control variable
/// in register `a + 3` has been updated), per spec §4.4's numeric `for`.
fn for_loop(thread: &ThreadRef, base: usize, a: usize) -> LuaResult<bool> {
    let idx = reg(thread, base, a);
    let limit = reg(thread, base, a + 1);
    let step = reg(thread, base, a + 2);
    match (idx, limit, step) {
        (LuaValue::Int(i), LuaValue::Int(l), LuaValue::Int(s)) => {
            let next = i.wrapping_add(s);
            let cont = if s >= 0 { next <= l } else { next >= l };
            if cont {
                set_reg(thread, base, a, LuaValue::Int(next));
                set_reg(thread, base, a + 3, LuaValue::Int(next));
            }
            Ok(cont)
        }
        (LuaValue::Float(i), LuaValue::Float(l), LuaValue::Float(s)) => {
            let next = i + s;
            let cont = if s >= 0.0 { next <= l } else { next >= l };
            if cont {
                set_reg(thread, base, a, LuaValue::Float(next));
                set_reg(thread, base, a + 3, LuaValue::Float(next));
            }
            Ok(cont)
        }
        _ => Err(LuaError::runtime("'for' step/limit must agree in type with initial value")),
    }
}

fn sub_for(init: LuaValue, step: LuaValue) -> LuaResult<LuaValue> {
    match (init, step) {
        (LuaValue::Int(i), LuaValue::Int(s)) => Ok(LuaValue::Int(i.wrapping_sub(s))),
        (LuaValue::Float(i), LuaValue::Float(s)) => Ok(LuaValue::Float(i - s)),
        _ => unreachable!(),
    }
}

fn coerce_for_loop(init: LuaValue, limit: LuaValue, step: LuaValue) -> LuaResult<(LuaValue, LuaValue, LuaValue)> {
    let bad = || LuaError::runtime("'for' initial value must be a number");
    let all_int = matches!(init, LuaValue::Int(_)) && matches!(limit, LuaValue::Int(_)) && matches!(step, LuaValue::Int(_));
    if all_int {
        if let LuaValue::Int(0) = step {
            return Err(LuaError::runtime("'for' step is zero"));
        }
        return Ok((init, limit, step));
    }
    let fi = init.as_float().or_else(|| init.to_number().and_then(|v| v.as_float())).ok_or_else(bad)?;
    let fl = limit.as_float().or_else(|| limit.to_number().and_then(|v| v.as_float())).ok_or_else(bad)?;
    let fs = step.as_float().or_else(|| step.to_number().and_then(|v| v.as_float())).ok_or_else(bad)?;
    if fs == 0.0 {
        return Err(LuaError::runtime("'for' step is zero"));
    }
    Ok((LuaValue::Float(fi), LuaValue::Float(fl), LuaValue::Float(fs)))
}

// --- table indexing with metamethods (spec §4.3) --------------------------

fn index_get(state: &Rc<LuaState>, table: &LuaValue, key: &LuaValue) -> LuaResult<LuaValue> {
    index_get_depth(state, table, key, 0)
}

fn index_get_depth(state: &Rc<LuaState>, table: &LuaValue, key: &LuaValue, depth: u32) -> LuaResult<LuaValue> {
    if depth > MAX_METAMETHOD_DEPTH {
        return Err(LuaError::runtime("'__index' chain too long; possible loop"));
    }
    if let LuaValue::Table(t) = table {
        let raw = t.borrow().get(&normalize_key(key.clone()));
        if !raw.is_nil() {
            return Ok(raw);
        }
        match state.get_metamethod(table, "__index") {
            Some(LuaValue::Function(f)) => {
                let mut r = call_value(state, LuaValue::Function(f), vec![table.clone(), key.clone()])?;
                let v = r.drain(..).next().unwrap_or(LuaValue::Nil);
                Ok(v)
            }
            Some(next @ LuaValue::Table(_)) => index_get_depth(state, &next, key, depth + 1),
            Some(other) => index_get_depth(state, &other, key, depth + 1),
            None => Ok(LuaValue::Nil),
        }
    } else {
        match state.get_metamethod(table, "__index") {
            Some(LuaValue::Function(f)) => {
                let mut r = call_value(state, LuaValue::Function(f), vec![table.clone(), key.clone()])?;
                let v = r.drain(..).next().unwrap_or(LuaValue::Nil);
                Ok(v)
            }
            Some(next) => index_get_depth(state, &next, key, depth + 1),
            None => Err(LuaError::runtime(format!("attempt to index a {} value", table.type_name()))),
        }
    }
}

fn index_set(state: &Rc<LuaState>, table: &LuaValue, key: LuaValue, val: LuaValue) -> LuaResult<()> {
    index_set_depth(state, table, key, val, 0)
}

fn index_set_depth(state: &Rc<LuaState>, table: &LuaValue, key: LuaValue, val: LuaValue, depth: u32) -> LuaResult<()> {
    if depth > MAX_METAMETHOD_DEPTH {
        return Err(LuaError::runtime("'__newindex' chain too long; possible loop"));
    }
    if let LuaValue::Table(t) = table {
        let exists = !t.borrow().get(&normalize_key(key.clone())).is_nil();
        if exists {
            return t.borrow_mut().set(key, val).map_err(|e| e);
        }
        match state.get_metamethod(table, "__newindex") {
            Some(LuaValue::Function(f)) => {
                call_value(state, LuaValue::Function(f), vec![table.clone(), key, val])?;
                Ok(())
            }
            Some(next @ LuaValue::Table(_)) => index_set_depth(state, &next, key, val, depth + 1),
            Some(other) => index_set_depth(state, &other, key, val, depth + 1),
            None => t.borrow_mut().set(key, val).map_err(|e| e),
        }
    } else {
        match state.get_metamethod(table, "__newindex") {
            Some(LuaValue::Function(f)) => {
                call_value(state, LuaValue::Function(f), vec![table.clone(), key, val])?;
                Ok(())
            }
            Some(next) => index_set_depth(state, &next, key, val, depth + 1),
            None => Err(LuaError::runtime(format!("attempt to index a {} value", table.type_name()))),
        }
    }
}

fn length_of(state: &Rc<LuaState>, v: &LuaValue) -> LuaResult<LuaValue> {
    match v {
        LuaValue::Str(s) => Ok(LuaValue::Int(s.len() as i64)),
        LuaValue::Table(t) => {
            if let Some(LuaValue::Function(f)) = state.get_metamethod(v, "__len") {
                let mut r = call_value(state, LuaValue::Function(f), vec![v.clone()])?;
                return Ok(r.drain(..).next().unwrap_or(LuaValue::Nil));
            }
            Ok(LuaValue::Int(t.borrow().length()))
        }
        _ => Err(LuaError::runtime(format!("attempt to get length of a {} value", v.type_name()))),
    }
}

fn concat_values(state: &Rc<LuaState>, a: LuaValue, b: LuaValue) -> LuaResult<LuaValue> {
    let concatable = |v: &LuaValue| matches!(v, LuaValue::Str(_) | LuaValue::Int(_) | LuaValue::Float(_));
    if concatable(&a) && concatable(&b) {
        let mut bytes = crate::value::tostring::display_bytes(&a);
        bytes.extend_from_slice(&crate::value::tostring::display_bytes(&b));
        return Ok(LuaValue::string_bytes(bytes));
    }
    if let Some(LuaValue::Function(f)) = state.get_metamethod(&a, "__concat").or_else(|| state.get_metamethod(&b, "__concat")) {
        let mut r = call_value(state, LuaValue::Function(f), vec![a, b])?;
        return Ok(r.drain(..).next().unwrap_or(LuaValue::Nil));
    }
    let offender = if concatable(&a) { &b } else { &a };
    Err(LuaError::runtime(format!("attempt to concatenate a {} value", offender.type_name())))
}

fn compare(state: &Rc<LuaState>, op: OpCode, l: &LuaValue, r: &LuaValue) -> LuaResult<bool> {
    match op {
        OpCode::Eq => equals(state, l, r),
        OpCode::Lt => order(
            state,
            l,
            r,
            "__lt",
            |a, b| a < b,
            |a, b| a < b,
            |a, b| a < b,
            crate::value::lua_value::int_lt_float,
            crate::value::lua_value::float_lt_int,
        ),
        OpCode::Le => order(
            state,
            l,
            r,
            "__le",
            |a, b| a <= b,
            |a, b| a <= b,
            |a, b| a <= b,
            crate::value::lua_value::int_le_float,
            crate::value::lua_value::float_le_int,
        ),
        _ => unreachable!(),
    }
}

fn equals(state: &Rc<LuaState>, l: &LuaValue, r: &LuaValue) -> LuaResult<bool> {
    if l.raw_eq(r) {
        return Ok(true);
    }
    let both_tables_or_userdata = matches!(
        (l, r),
        (LuaValue::Table(_), LuaValue::Table(_)) | (LuaValue::UserData(_), LuaValue::UserData(_))
    );
    if !both_tables_or_userdata {
        return Ok(false);
    }
    if let Some(LuaValue::Function(f)) = state.get_metamethod(l, "__eq").or_else(|| state.get_metamethod(r, "__eq")) {
        let res = call_value(state, LuaValue::Function(f), vec![l.clone(), r.clone()])?;
        return Ok(res.first().map(|v| v.is_truthy()).unwrap_or(false));
    }
    Ok(false)
}

fn order(
    state: &Rc<LuaState>,
    l: &LuaValue,
    r: &LuaValue,
    mm: &str,
    cmp_f: impl Fn(f64, f64) -> bool,
    cmp_i: impl Fn(i64, i64) -> bool,
    cmp_s: impl Fn(&[u8], &[u8]) -> bool,
    cmp_if: impl Fn(i64, f64) -> bool,
    cmp_fi: impl Fn(f64, i64) -> bool,
) -> LuaResult<bool> {
    match (l, r) {
        (LuaValue::Int(a), LuaValue::Int(b)) => return Ok(cmp_i(*a, *b)),
        (LuaValue::Float(a), LuaValue::Float(b)) => return Ok(cmp_f(*a, *b)),
        // Mixed int/float compares stay in integer space rather than
        // widening the integer to f64, which loses precision near 2^53+
        // (spec §4.3's exact-equality rule extends to ordering too).
        (LuaValue::Int(a), LuaValue::Float(b)) => return Ok(cmp_if(*a, *b)),
        (LuaValue::Float(a), LuaValue::Int(b)) => return Ok(cmp_fi(*a, *b)),
        (LuaValue::Str(a), LuaValue::Str(b)) => return Ok(cmp_s(a.as_bytes(), b.as_bytes())),
        _ => {}
    }
    if let Some(LuaValue::Function(f)) = state.get_metamethod(l, mm).or_else(|| state.get_metamethod(r, mm)) {
        let res = call_value(state, LuaValue::Function(f), vec![l.clone(), r.clone()])?;
        return Ok(res.first().map(|v| v.is_truthy()).unwrap_or(false));
    }
    Err(LuaError::runtime(format!(
        "attempt to compare {} with {}",
        l.type_name(),
        r.type_name()
    )))
}

mod arith {
    use super::*;

    pub fn binop(state: &Rc<LuaState>, op: OpCode, l: LuaValue, r: LuaValue) -> LuaResult<LuaValue> {
        if let (Some(res), _) = try_numeric(op, &l, &r) {
            return res;
        }
        let mm_name = metamethod_name(op);
        if let Some(LuaValue::Function(f)) = state.get_metamethod(&l, mm_name).or_else(|| state.get_metamethod(&r, mm_name)) {
            let mut res = call_value(state, LuaValue::Function(f), vec![l, r])?;
            return Ok(res.drain(..).next().unwrap_or(LuaValue::Nil));
        }
        let offender = if l.to_number().is_none() { &l } else { &r };
        Err(LuaError::runtime(format!("attempt to perform arithmetic on a {} value", offender.type_name())))
    }

    fn metamethod_name(op: OpCode) -> &'static str {
        match op {
            OpCode::Add => "__add",
            OpCode::Sub => "__sub",
            OpCode::Mul => "__mul",
            OpCode::Mod => "__mod",
            OpCode::Pow => "__pow",
            OpCode::Div => "__div",
            OpCode::IDiv => "__idiv",
            OpCode::BAnd => "__band",
            OpCode::BOr => "__bor",
            OpCode::BXor => "__bxor",
            OpCode::Shl => "__shl",
            OpCode::Shr => "__shr",
            _ => unreachable!(),
        }
    }

    /// Bitwise ops require an exact integer representation (spec §4.3); the
    /// other arithmetic ops promote to float when either operand is a float.
    fn try_numeric(op: OpCode, l: &LuaValue, r: &LuaValue) -> (Option<LuaResult<LuaValue>>, ()) {
        let is_bitwise = matches!(op, OpCode::BAnd | OpCode::BOr | OpCode::BXor | OpCode::Shl | OpCode::Shr);
        if is_bitwise {
            let (li, ri) = match (l.to_integer(), r.to_integer()) {
                (Some(a), Some(b)) => (a, b),
                _ => return (None, ()),
            };
            let v = match op {
                OpCode::BAnd => li & ri,
                OpCode::BOr => li | ri,
                OpCode::BXor => li ^ ri,
                OpCode::Shl => shift_left(li, ri),
                OpCode::Shr => shift_left(li, -ri),
                _ => unreachable!(),
            };
            return (Some(Ok(LuaValue::Int(v))), ());
        }
        let (ln, rn) = match (l.to_number(), r.to_number()) {
            (Some(a), Some(b)) => (a, b),
            _ => return (None, ()),
        };
        if let (LuaValue::Int(a), LuaValue::Int(b)) = (&ln, &rn) {
            let a = *a;
            let b = *b;
            match op {
                OpCode::Add => return (Some(Ok(LuaValue::Int(a.wrapping_add(b)))), ()),
                OpCode::Sub => return (Some(Ok(LuaValue::Int(a.wrapping_sub(b)))), ()),
                OpCode::Mul => return (Some(Ok(LuaValue::Int(a.wrapping_mul(b)))), ()),
                OpCode::Mod => {
                    if b == 0 {
                        return (Some(Err(LuaError::runtime("attempt to perform 'n%%0'"))), ());
                    }
                    let m = a.wrapping_rem(b);
                    let m = if m != 0 && (m ^ b) < 0 { m + b } else { m };
                    return (Some(Ok(LuaValue::Int(m))), ());
                }
                OpCode::IDiv => {
                    if b == 0 {
                        return (Some(Err(LuaError::runtime("attempt to perform 'n//0'"))), ());
                    }
                    let q = a.wrapping_div(b);
                    let q = if (a % b != 0) && ((a ^ b) < 0) { q - 1 } else { q };
                    return (Some(Ok(LuaValue::Int(q))), ());
                }
                OpCode::Pow | OpCode::Div => {
                    let af = a as f64;
                    let bf = b as f64;
                    let v = if op == OpCode::Pow { af.powf(bf) } else { af / bf };
                    return (Some(Ok(LuaValue::Float(v))), ());
                }
                _ => unreachable!(),
            }
        }
        let a = ln.as_float().unwrap();
        let b = rn.as_float().unwrap();
        let v = match op {
            OpCode::Add => a + b,
            OpCode::Sub => a - b,
            OpCode::Mul => a * b,
            OpCode::Div => a / b,
            OpCode::Pow => a.powf(b),
            OpCode::Mod => {
                let m = a - (a / b).floor() * b;
                m
            }
            OpCode::IDiv => (a / b).floor(),
            _ => unreachable!(),
        };
        (Some(Ok(LuaValue::Float(v))), ())
    }

    fn shift_left(v: i64, by: i64) -> i64 {
        if by <= -64 || by >= 64 {
            0
        } else if by >= 0 {
            ((v as u64) << by) as i64
        } else {
            ((v as u64) >> (-by)) as i64
        }
    }
}

fn arith_binop(state: &Rc<LuaState>, op: OpCode, l: LuaValue, r: LuaValue) -> LuaResult<LuaValue> {
    arith::binop(state, op, l, r)
}

fn arith_unm(state: &Rc<LuaState>, v: LuaValue) -> LuaResult<LuaValue> {
    match v.to_number() {
        Some(LuaValue::Int(i)) => Ok(LuaValue::Int(i.wrapping_neg())),
        Some(LuaValue::Float(f)) => Ok(LuaValue::Float(-f)),
        _ => {
            if let Some(LuaValue::Function(f)) = state.get_metamethod(&v, "__unm") {
                let mut res = call_value(state, LuaValue::Function(f), vec![v.clone(), v])?;
                return Ok(res.drain(..).next().unwrap_or(LuaValue::Nil));
            }
            Err(LuaError::runtime(format!("attempt to perform arithmetic on a {} value", v.type_name())))
        }
    }
}

fn arith_bnot(state: &Rc<LuaState>, v: LuaValue) -> LuaResult<LuaValue> {
    if let Some(i) = v.to_integer() {
        return Ok(LuaValue::Int(!i));
    }
    if let Some(LuaValue::Function(f)) = state.get_metamethod(&v, "__bnot") {
        let mut res = call_value(state, LuaValue::Function(f), vec![v.clone(), v])?;
        return Ok(res.drain(..).next().unwrap_or(LuaValue::Nil));
    }
    Err(LuaError::runtime(format!("attempt to perform bitwise operation on a {} value", v.type_name())))
}

// --- coroutines (spec §5) --------------------------------------------------

/// Resume `thread`, either starting its body (first call) or feeding `args`
/// back as the result of the `coroutine.yield` it's currently suspended in.
pub fn resume(state: &Rc<LuaState>, thread: &ThreadRef, args: Vec<LuaValue>) -> LuaResult<Vec<LuaValue>> {
    let already_started = !thread.borrow().frames.is_empty();
    if !already_started {
        let func = thread
            .borrow_mut()
            .pending_call
            .take()
            .ok_or_else(|| LuaError::runtime("cannot resume dead coroutine"))?;
        let base = thread.borrow().stack.len();
        {
            let mut t = thread.borrow_mut();
            t.stack.push(func.clone());
            t.stack.extend(args);
        }
        let callee = resolve_callable(state, func, thread, base)?;
        match callee {
            LuaFunction::Host(h) => {
                let n = (h.func)(state, base + 1, &h.upvalues)?;
                let results = thread.borrow().stack[base + 1..base + 1 + n].to_vec();
                return Ok(results);
            }
            f @ LuaFunction::Lua(_) => {
                thread.borrow_mut().frames.push(CallInfo {
                    func: f,
                    base: base + 1,
                    pc: 0,
                    func_index: base,
                    want_results: None,
                    is_tailcall: false,
                });
            }
        }
    } else if let Some((call_base, want)) = thread.borrow_mut().pending_yield_site.take() {
        let mut t = thread.borrow_mut();
        let keep = want.unwrap_or(args.len());
        t.ensure_stack(call_base + keep.max(args.len()));
        for i in 0..keep {
            t.stack[call_base + i] = args.get(i).cloned().unwrap_or(LuaValue::Nil);
        }
        if want.is_none() {
            t.stack.truncate(call_base + args.len());
        }
    }
    run_frame(state, thread, 0)
}

/// Body of `coroutine.yield`: always returns `Err`, caught only by
/// [`resume`] as it unwinds the (bounded) Rust recursion of nested
/// `run_frame` calls without popping any `CallInfo`.
pub fn do_yield(values: Vec<LuaValue>) -> LuaError {
    LuaError::yield_with(values)
}

pub fn is_yield(e: &LuaError) -> bool {
    e.kind == ErrorKind::Yield
}
