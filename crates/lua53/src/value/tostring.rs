//! `tostring` formatting rules from spec §4.3: integers print as plain
//! decimal, floats print with `%.14g` and get a forced `.0` suffix when
//! the result would otherwise look like an integer.

use super::lua_value::LuaValue;

pub fn float_to_lua_string(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f < 0.0 { "-inf".to_string() } else { "inf".to_string() };
    }
    let s = format_g14(f);
    if s.bytes().all(|b| b.is_ascii_digit() || b == b'-') {
        format!("{s}.0")
    } else {
        s
    }
}

/// Minimal `%.14g`: 14 significant digits, trailing zeros trimmed, falling
/// back to scientific notation the way `printf` does for very large/small
/// magnitudes.
fn format_g14(f: f64) -> String {
    if f == 0.0 {
        return if f.is_sign_negative() { "-0".to_string() } else { "0".to_string() };
    }
    let exp = f.abs().log10().floor() as i32;
    if exp < -4 || exp >= 14 {
        let mut s = format!("{:.*e}", 13, f);
        // Rust emits `1.2300000000000e5`; trim trailing zeros in the
        // mantissa and normalize the exponent to C's `e+05` style.
        if let Some(epos) = s.find('e') {
            let (mantissa, exp_part) = s.split_at(epos);
            let mantissa = trim_trailing_zeros(mantissa);
            let exp_num: i32 = exp_part[1..].parse().unwrap_or(0);
            s = format!("{mantissa}e{}{:02}", if exp_num < 0 { "-" } else { "+" }, exp_num.abs());
        }
        s
    } else {
        let decimals = (13 - exp).max(0) as usize;
        let s = format!("{:.*}", decimals, f);
        trim_trailing_zeros(&s).to_string()
    }
}

fn trim_trailing_zeros(s: &str) -> &str {
    if !s.contains('.') {
        return s;
    }
    let s = s.trim_end_matches('0');
    s.trim_end_matches('.')
}

pub fn display(v: &LuaValue) -> String {
    match v {
        LuaValue::Nil => "nil".to_string(),
        LuaValue::Bool(b) => b.to_string(),
        LuaValue::Int(i) => {
            let mut buf = itoa::Buffer::new();
            buf.format(*i).to_string()
        }
        LuaValue::Float(f) => float_to_lua_string(*f),
        LuaValue::Str(s) => s.to_string_lossy().into_owned(),
        LuaValue::Table(t) => format!("table: {:p}", std::rc::Rc::as_ptr(t)),
        LuaValue::Function(f) => format!("function: {:p}", f.raw_ptr() as *const ()),
        LuaValue::UserData(u) => format!("userdata: {:p}", std::rc::Rc::as_ptr(u)),
        LuaValue::Thread(t) => format!("thread: {:p}", std::rc::Rc::as_ptr(t)),
    }
}

/// Like [`display`] but byte-faithful for strings: a string value's own
/// bytes pass through untouched instead of going through lossy UTF-8
/// conversion, so concatenating a non-UTF-8 string doesn't mangle it.
pub fn display_bytes(v: &LuaValue) -> Vec<u8> {
    match v {
        LuaValue::Str(s) => s.as_bytes().to_vec(),
        other => display(other).into_bytes(),
    }
}
