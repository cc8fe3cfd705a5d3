//! Error kinds and the message-carrying wrapper used across the crate.
//!
//! Mirrors the teacher's split: a tiny `Copy` kind enum for fast `Result`
//! plumbing through the VM's hot call paths, plus a `LuaError` that glues a
//! kind to the human-readable message and (when available) a Lua error
//! value, since `error()` can raise any value, not just a string.

use crate::value::LuaValue;
use std::fmt;

/// Coarse classification of what went wrong, per spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Lexer or parser failure: `source:line: message`.
    Syntax,
    /// Arithmetic/index/call/compare failure, or an uncaught `error()`.
    Runtime,
    /// Allocation failure (never raised in practice by this implementation,
    /// kept for interface completeness with the host API contract).
    Memory,
    /// `tointeger`/`tonumber`-style conversion failure.
    TypeConversion,
    /// Not really an error: `coroutine.yield` unwinding back to the nearest
    /// `resume`, carrying the yielded values in `LuaError::yielded`.
    Yield,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Syntax => "syntax error",
            ErrorKind::Runtime => "runtime error",
            ErrorKind::Memory => "out of memory",
            ErrorKind::TypeConversion => "type conversion error",
            ErrorKind::Yield => "yield",
        };
        write!(f, "{s}")
    }
}

/// An error propagating out of compilation or execution.
///
/// `value` holds the actual Lua value passed to `error()` when one exists;
/// for internally-raised errors it's a string built from `message`. Keeping
/// both lets `pcall` return the original raised value (which need not be a
/// string) while still giving `Display` something sensible to print.
#[derive(Debug, Clone)]
pub struct LuaError {
    pub kind: ErrorKind,
    pub message: String,
    pub value: Option<LuaValue>,
    /// Populated only for `ErrorKind::Yield`: the values passed to
    /// `coroutine.yield(...)`.
    pub yielded: Option<Vec<LuaValue>>,
}

impl LuaError {
    pub fn syntax(source: &str, line: u32, message: impl Into<String>) -> Self {
        LuaError {
            kind: ErrorKind::Syntax,
            message: format!("{source}:{line}: {}", message.into()),
            value: None,
            yielded: None,
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        let message = message.into();
        LuaError {
            kind: ErrorKind::Runtime,
            message,
            value: None,
            yielded: None,
        }
    }

    pub fn runtime_at(source: &str, line: u32, message: impl Into<String>) -> Self {
        let message = format!("{source}:{line}: {}", message.into());
        LuaError {
            kind: ErrorKind::Runtime,
            message,
            value: None,
            yielded: None,
        }
    }

    pub fn type_conversion(message: impl Into<String>) -> Self {
        LuaError {
            kind: ErrorKind::TypeConversion,
            message: message.into(),
            value: None,
            yielded: None,
        }
    }

    pub fn yield_with(values: Vec<LuaValue>) -> Self {
        LuaError {
            kind: ErrorKind::Yield,
            message: "attempt to yield".to_string(),
            value: None,
            yielded: Some(values),
        }
    }

    /// Build from an arbitrary value raised via `error(v)`: strings get the
    /// usual `message`, non-strings keep `value` as the canonical payload.
    pub fn from_raised(value: LuaValue) -> Self {
        let message = match &value {
            LuaValue::Str(s) => s.to_string_lossy().into_owned(),
            other => format!("{other}"),
        };
        LuaError {
            kind: ErrorKind::Runtime,
            message,
            value: Some(value),
            yielded: None,
        }
    }

    /// The value `pcall` should hand back: the original raised value if
    /// there was one, otherwise a fresh string built from `message`.
    pub fn as_value(&self) -> LuaValue {
        self.value
            .clone()
            .unwrap_or_else(|| LuaValue::from(self.message.as_str()))
    }
}

impl fmt::Display for LuaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for LuaError {}

pub type LuaResult<T> = Result<T, LuaError>;
