//! The tagged `Value` union from spec §3, expressed as the sealed sum type
//! the Design Notes call for rather than the teacher's `repr(C)` union over
//! a GC-arena id — upvalues/closures hold `Rc` handles directly, and the
//! object graph is kept alive by ordinary reference counting (the spec's
//! "Out of scope: garbage-collection incrementality" explicitly allows
//! this).

use super::closure::LuaFunction;
use super::lua_string::LuaString;
use super::lua_table::LuaTable;
use crate::vm::thread::LuaThread;
use std::cell::RefCell;
use std::rc::Rc;

pub type TableRef = Rc<RefCell<LuaTable>>;
pub type ThreadRef = Rc<RefCell<LuaThread>>;

pub struct UserData {
    pub data: Box<dyn std::any::Any>,
    pub metatable: Option<TableRef>,
    pub type_name: &'static str,
}

#[derive(Clone)]
pub enum LuaValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<LuaString>),
    Table(TableRef),
    Function(LuaFunction),
    UserData(Rc<RefCell<UserData>>),
    Thread(ThreadRef),
}

impl LuaValue {
    pub fn boolean(b: bool) -> Self {
        LuaValue::Bool(b)
    }

    pub fn new_table() -> Self {
        LuaValue::Table(Rc::new(RefCell::new(LuaTable::new())))
    }

    pub fn string(s: impl AsRef<str>) -> Self {
        LuaValue::Str(Rc::new(LuaString::new(s)))
    }

    /// Builds a string value directly from raw bytes, for paths (the
    /// lexer's escape-sequence scanner, the bytecode reader) that must
    /// preserve non-UTF-8 byte sequences rather than validating them away.
    pub fn string_bytes(bytes: Vec<u8>) -> Self {
        LuaValue::Str(Rc::new(LuaString::from_bytes(bytes)))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, LuaValue::Nil)
    }

    /// Lua truthiness: everything but `nil` and `false` is true.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, LuaValue::Nil | LuaValue::Bool(false))
    }

    pub fn is_number(&self) -> bool {
        matches!(self, LuaValue::Int(_) | LuaValue::Float(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            LuaValue::Nil => "nil",
            LuaValue::Bool(_) => "boolean",
            LuaValue::Int(_) | LuaValue::Float(_) => "number",
            LuaValue::Str(_) => "string",
            LuaValue::Table(_) => "table",
            LuaValue::Function(_) => "function",
            LuaValue::UserData(_) => "userdata",
            LuaValue::Thread(_) => "thread",
        }
    }

    pub fn as_table(&self) -> Option<&TableRef> {
        match self {
            LuaValue::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            LuaValue::Str(s) => s.as_str(),
            _ => None,
        }
    }

    /// `tointeger`-style coercion: integers pass through, floats convert
    /// only when they represent an exact integer (spec §4.3/§4.4's
    /// bitwise-operand rule), strings go through the numeral scanner.
    pub fn to_integer(&self) -> Option<i64> {
        match self {
            LuaValue::Int(i) => Some(*i),
            LuaValue::Float(f) => {
                if f.fract() == 0.0 && *f >= -(2f64.powi(63)) && *f < 2f64.powi(63) {
                    Some(*f as i64)
                } else {
                    None
                }
            }
            LuaValue::Str(s) => {
                match crate::lexer::number::str_to_number(s.as_str()?)? {
                    crate::lexer::number::LuaNumber::Int(i) => Some(i),
                    crate::lexer::number::LuaNumber::Float(f) => {
                        if f.fract() == 0.0 {
                            Some(f as i64)
                        } else {
                            None
                        }
                    }
                }
            }
            _ => None,
        }
    }

    /// `tonumber`-style coercion, preserving the int/float subtype.
    pub fn to_number(&self) -> Option<LuaValue> {
        match self {
            LuaValue::Int(_) | LuaValue::Float(_) => Some(self.clone()),
            LuaValue::Str(s) => match crate::lexer::number::str_to_number(s.as_str()?)? {
                crate::lexer::number::LuaNumber::Int(i) => Some(LuaValue::Int(i)),
                crate::lexer::number::LuaNumber::Float(f) => Some(LuaValue::Float(f)),
            },
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            LuaValue::Int(i) => Some(*i as f64),
            LuaValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Raw hash used by the table's hash part. Integers and floats that
    /// represent the same mathematical number must hash identically so a
    /// normalized key always lands on the same slot (spec §3: "their raw
    /// hash differs" refers to *unnormalized* float/int comparison, not to
    /// hash-table placement after `normalize_key`).
    pub fn raw_hash(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut h = ahash::AHasher::default();
        match self {
            LuaValue::Nil => 0u8.hash(&mut h),
            LuaValue::Bool(b) => {
                1u8.hash(&mut h);
                b.hash(&mut h);
            }
            LuaValue::Int(i) => {
                2u8.hash(&mut h);
                i.hash(&mut h);
            }
            LuaValue::Float(f) => {
                2u8.hash(&mut h);
                // Integral floats were normalized away before reaching
                // here in practice, but stay defensive.
                if f.fract() == 0.0 {
                    (*f as i64).hash(&mut h);
                } else {
                    f.to_bits().hash(&mut h);
                }
            }
            LuaValue::Str(s) => {
                3u8.hash(&mut h);
                h.write_u64(s.hash_value());
            }
            LuaValue::Table(t) => {
                4u8.hash(&mut h);
                (Rc::as_ptr(t) as usize).hash(&mut h);
            }
            LuaValue::Function(f) => {
                5u8.hash(&mut h);
                f.raw_ptr().hash(&mut h);
            }
            LuaValue::UserData(u) => {
                6u8.hash(&mut h);
                (Rc::as_ptr(u) as usize).hash(&mut h);
            }
            LuaValue::Thread(t) => {
                7u8.hash(&mut h);
                (Rc::as_ptr(t) as usize).hash(&mut h);
            }
        }
        h.finish()
    }

    /// Raw equality (no metamethods): numbers compare by mathematical
    /// value across int/float, everything else by identity/content per
    /// spec §3.
    pub fn raw_eq(&self, other: &LuaValue) -> bool {
        match (self, other) {
            (LuaValue::Nil, LuaValue::Nil) => true,
            (LuaValue::Bool(a), LuaValue::Bool(b)) => a == b,
            (LuaValue::Int(a), LuaValue::Int(b)) => a == b,
            (LuaValue::Float(a), LuaValue::Float(b)) => a == b,
            (LuaValue::Int(a), LuaValue::Float(b)) | (LuaValue::Float(b), LuaValue::Int(a)) => {
                int_eq_float(*a, *b)
            }
            (LuaValue::Str(a), LuaValue::Str(b)) => a == b,
            (LuaValue::Table(a), LuaValue::Table(b)) => Rc::ptr_eq(a, b),
            (LuaValue::Function(a), LuaValue::Function(b)) => a.raw_ptr() == b.raw_ptr(),
            (LuaValue::UserData(a), LuaValue::UserData(b)) => Rc::ptr_eq(a, b),
            (LuaValue::Thread(a), LuaValue::Thread(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn metatable(&self) -> Option<TableRef> {
        match self {
            LuaValue::Table(t) => t.borrow().metatable.clone(),
            LuaValue::UserData(u) => u.borrow().metatable.clone(),
            _ => None,
        }
    }
}

/// Exact integer/float equality (spec §4.3: "integer `k` equals float `f`
/// iff `f` is finite and equals `k` exactly"). Converting `k` to `f64`
/// first would lose precision for magnitudes near 2^63; instead check that
/// `f` is integral and in range, then compare in integer space.
pub fn int_eq_float(i: i64, f: f64) -> bool {
    if !f.is_finite() || f.fract() != 0.0 {
        return false;
    }
    const MIN: f64 = -9223372036854775808.0; // -2^63, exact in f64
    const MAX: f64 = 9223372036854775808.0; // 2^63, exclusive upper bound
    if f < MIN || f >= MAX {
        return false;
    }
    (f as i64) == i
}

/// `ceil`/`floor` an in-range float into `i64`, reporting which way it
/// overflows when it doesn't fit (`Err(true)` = too large, `Err(false)` =
/// too small). Assumes `f` is not NaN.
fn ceil_to_i64(f: f64) -> Result<i64, bool> {
    let c = f.ceil();
    if c >= 9223372036854775808.0 {
        Err(true) // 2^63
    } else if c < -9223372036854775808.0 {
        Err(false) // -2^63
    } else {
        Ok(c as i64)
    }
}

fn floor_to_i64(f: f64) -> Result<i64, bool> {
    let c = f.floor();
    if c >= 9223372036854775808.0 {
        Err(true)
    } else if c < -9223372036854775808.0 {
        Err(false)
    } else {
        Ok(c as i64)
    }
}

/// Exact `int < float` (spec §4.3's ordering counterpart to
/// [`int_eq_float`]). `i < f` iff `i < ceil(f)` for any integer `i`, so
/// this compares in integer space instead of widening `i` to `f64`, which
/// would lose precision for magnitudes near 2^63.
pub fn int_lt_float(i: i64, f: f64) -> bool {
    if f.is_nan() {
        return false;
    }
    match ceil_to_i64(f) {
        Ok(fi) => i < fi,
        Err(too_large) => too_large,
    }
}

/// Exact `int <= float`: `i <= f` iff `i <= floor(f)`.
pub fn int_le_float(i: i64, f: f64) -> bool {
    if f.is_nan() {
        return false;
    }
    match floor_to_i64(f) {
        Ok(fi) => i <= fi,
        Err(too_large) => too_large,
    }
}

/// Exact `float < int`: `f < i` iff `floor(f) < i`.
pub fn float_lt_int(f: f64, i: i64) -> bool {
    if f.is_nan() {
        return false;
    }
    match floor_to_i64(f) {
        Ok(fi) => fi < i,
        Err(too_large) => !too_large,
    }
}

/// Exact `float <= int`: `f <= i` iff `ceil(f) <= i`.
pub fn float_le_int(f: f64, i: i64) -> bool {
    if f.is_nan() {
        return false;
    }
    match ceil_to_i64(f) {
        Ok(fi) => fi <= i,
        Err(too_large) => !too_large,
    }
}

impl PartialEq for LuaValue {
    fn eq(&self, other: &Self) -> bool {
        self.raw_eq(other)
    }
}

impl From<&str> for LuaValue {
    fn from(s: &str) -> Self {
        LuaValue::string(s)
    }
}

impl From<i64> for LuaValue {
    fn from(i: i64) -> Self {
        LuaValue::Int(i)
    }
}

impl From<f64> for LuaValue {
    fn from(f: f64) -> Self {
        LuaValue::Float(f)
    }
}

impl From<bool> for LuaValue {
    fn from(b: bool) -> Self {
        LuaValue::Bool(b)
    }
}

impl std::fmt::Display for LuaValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", crate::value::tostring::display(self))
    }
}

impl std::fmt::Debug for LuaValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}
