//! End-to-end scenarios run through the full lex → parse → compile →
//! execute pipeline, each checked against its reference-Lua output.

use crate::value::lua_value::LuaValue;

fn run_capture(source: &str) -> Vec<LuaValue> {
    crate::run(source, "scenario").expect("scenario should run without error")
}

#[test]
fn arithmetic_precedence() {
    assert_eq!(run_capture("return 1+2*3"), vec![LuaValue::Int(7)]);
}

#[test]
fn recursive_local_function() {
    let src = "local function f(n) if n<=1 then return 1 end return n*f(n-1) end return f(5)";
    assert_eq!(run_capture(src), vec![LuaValue::Int(120)]);
}

#[test]
fn closures_share_upvalue_state() {
    let src = "local function c() local n=0 return function() n=n+1 return n end end \
               local k=c() return k(),k(),k()";
    assert_eq!(run_capture(src), vec![LuaValue::Int(1), LuaValue::Int(2), LuaValue::Int(3)]);
}

#[test]
fn table_constructor_and_length() {
    let src = "local t={10,20,30} return t[1],t[3],#t";
    assert_eq!(run_capture(src), vec![LuaValue::Int(10), LuaValue::Int(30), LuaValue::Int(3)]);
}

#[test]
fn integer_division_and_modulo_and_power() {
    let src = "return pcall(function() return 1//0 end), -1%3, 2^10";
    let results = run_capture(src);
    assert_eq!(results[0], LuaValue::Bool(false));
    assert_eq!(results[1], LuaValue::Int(2));
    assert_eq!(results[2], LuaValue::Float(1024.0));
}

#[test]
fn float_division_by_zero_is_infinity() {
    let results = run_capture("return 1.0//0");
    match results[0] {
        LuaValue::Float(f) => assert!(f.is_infinite() && f.is_sign_positive()),
        ref other => panic!("expected +inf float, got {other:?}"),
    }
}

#[test]
fn string_concatenation_in_a_loop() {
    let src = "local s=\"ab\" for i=1,3 do s=s..i end return s";
    assert_eq!(run_capture(src), vec![LuaValue::string("ab123")]);
}

#[test]
fn index_metamethod_fills_in_missing_keys() {
    let src = "local t={} t.x=1 setmetatable(t,{__index=function(_,k) return \"m_\"..k end}) \
               return t.x, t.y";
    assert_eq!(run_capture(src), vec![LuaValue::Int(1), LuaValue::string("m_y")]);
}

#[test]
fn print_accepts_mixed_argument_types_without_error() {
    let results = run_capture("print('hello', 1, true) return 1");
    assert_eq!(results, vec![LuaValue::Int(1)]);
}

#[test]
fn pcall_catches_runtime_errors() {
    let results = run_capture("return pcall(function() error('boom') end)");
    assert_eq!(results[0], LuaValue::Bool(false));
}

#[test]
fn coroutines_resume_and_yield() {
    let src = r#"
        local co = coroutine.create(function(a)
            local b = coroutine.yield(a + 1)
            return b + 1
        end)
        local ok1, v1 = coroutine.resume(co, 1)
        local ok2, v2 = coroutine.resume(co, 10)
        return ok1, v1, ok2, v2
    "#;
    let results = run_capture(src);
    assert_eq!(results[0], LuaValue::Bool(true));
    assert_eq!(results[1], LuaValue::Int(2));
    assert_eq!(results[2], LuaValue::Bool(true));
    assert_eq!(results[3], LuaValue::Int(11));
}

#[test]
fn coroutine_wrap_propagates_errors_directly() {
    let src = r#"
        local f = coroutine.wrap(function() error('boom') end)
        return pcall(f)
    "#;
    let results = run_capture(src);
    assert_eq!(results[0], LuaValue::Bool(false));
}
