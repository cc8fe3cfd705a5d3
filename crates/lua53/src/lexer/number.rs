//! Numeric literal scanning, shared between the lexer and `tonumber`.
//!
//! Grounded on the teacher's `compiler/parse_lua_number.rs`: decimal and
//! hex integers/floats, with hex integers wrapping to signed 64-bit rather
//! than erroring on overflow (spec §4.1).

use super::{Lexer, Token};
use crate::error::LuaError;

/// The result of parsing a Lua numeral, used both by the lexer (which
/// additionally needs the exact byte span it consumed) and by
/// `tonumber`/string-to-number coercion (which just wants the value).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LuaNumber {
    Int(i64),
    Float(f64),
}

impl<'a> Lexer<'a> {
    pub(super) fn scan_number(&mut self, line: u32) -> Result<Token, LuaError> {
        let start = self.pos;
        let is_hex = self.peek_byte() == Some(b'0')
            && matches!(self.peek_byte_at(1), Some(b'x') | Some(b'X'));
        if is_hex {
            self.pos += 2;
            self.consume_hex_digits();
            let mut is_float = false;
            if self.peek_byte() == Some(b'.') {
                is_float = true;
                self.pos += 1;
                self.consume_hex_digits();
            }
            if matches!(self.peek_byte(), Some(b'p') | Some(b'P')) {
                is_float = true;
                self.pos += 1;
                if matches!(self.peek_byte(), Some(b'+') | Some(b'-')) {
                    self.pos += 1;
                }
                let exp_start = self.pos;
                while self.peek_byte().map(|b| b.is_ascii_digit()).unwrap_or(false) {
                    self.pos += 1;
                }
                if self.pos == exp_start {
                    return Err(self.err(line, "malformed number"));
                }
            }
            let text = std::str::from_utf8(&self.src_slice(start, self.pos)).unwrap().to_string();
            return match parse_hex(&text, is_float) {
                Some(LuaNumber::Int(i)) => Ok(Token::int(i, line)),
                Some(LuaNumber::Float(f)) => Ok(Token::float(f, line)),
                None => Err(self.err(line, "malformed number")),
            };
        }

        let mut is_float = false;
        while self.peek_byte().map(|b| b.is_ascii_digit()).unwrap_or(false) {
            self.pos += 1;
        }
        if self.peek_byte() == Some(b'.') {
            is_float = true;
            self.pos += 1;
            while self.peek_byte().map(|b| b.is_ascii_digit()).unwrap_or(false) {
                self.pos += 1;
            }
        }
        if matches!(self.peek_byte(), Some(b'e') | Some(b'E')) {
            is_float = true;
            self.pos += 1;
            if matches!(self.peek_byte(), Some(b'+') | Some(b'-')) {
                self.pos += 1;
            }
            let exp_start = self.pos;
            while self.peek_byte().map(|b| b.is_ascii_digit()).unwrap_or(false) {
                self.pos += 1;
            }
            if self.pos == exp_start {
                return Err(self.err(line, "malformed number"));
            }
        }
        if self
            .peek_byte()
            .map(|b| b.is_ascii_alphabetic() || b == b'_')
            .unwrap_or(false)
        {
            return Err(self.err(line, "malformed number"));
        }
        let text = std::str::from_utf8(&self.src_slice(start, self.pos)).unwrap();
        if is_float {
            let v: f64 = text.parse().map_err(|_| self.err(line, "malformed number"))?;
            Ok(Token::float(v, line))
        } else {
            match text.parse::<i64>() {
                Ok(v) => Ok(Token::int(v, line)),
                // Decimal integer literal overflows i64: Lua 5.3 promotes it
                // to a float rather than erroring.
                Err(_) => {
                    let v: f64 = text.parse().map_err(|_| self.err(line, "malformed number"))?;
                    Ok(Token::float(v, line))
                }
            }
        }
    }

    fn consume_hex_digits(&mut self) {
        while self
            .peek_byte()
            .map(|b| b.is_ascii_hexdigit())
            .unwrap_or(false)
        {
            self.pos += 1;
        }
    }

    fn src_slice(&self, a: usize, b: usize) -> &[u8] {
        &self.src[a..b]
    }
}

/// Parse `0x...` hex integer/float text (including the `0x` prefix).
fn parse_hex(text: &str, is_float: bool) -> Option<LuaNumber> {
    let body = &text[2..];
    if !is_float {
        // Wrap to signed 64-bit per spec §4.1, matching strtoull + cast.
        let mut v: u64 = 0;
        if body.is_empty() {
            return None;
        }
        for c in body.chars() {
            let d = c.to_digit(16)?;
            v = v.wrapping_mul(16).wrapping_add(d as u64);
        }
        return Some(LuaNumber::Int(v as i64));
    }
    // Hex float: mantissa in hex, optional binary exponent after p/P.
    let (mantissa, exp) = match body.find(['p', 'P']) {
        Some(i) => (&body[..i], &body[i + 1..]),
        None => (body, "0"),
    };
    let (int_part, frac_part) = match mantissa.find('.') {
        Some(i) => (&mantissa[..i], &mantissa[i + 1..]),
        None => (mantissa, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    let mut value = 0f64;
    for c in int_part.chars() {
        value = value * 16.0 + c.to_digit(16)? as f64;
    }
    let mut scale = 1.0 / 16.0;
    for c in frac_part.chars() {
        value += c.to_digit(16)? as f64 * scale;
        scale /= 16.0;
    }
    let exp_val: i32 = exp.parse().ok()?;
    Some(LuaNumber::Float(value * 2f64.powi(exp_val)))
}

/// Parse a full Lua numeral from a standalone string, as used by
/// `tonumber(s)` and arithmetic-on-string coercion (spec §4.3). Unlike the
/// lexer this must consume the *entire* trimmed string and allows a
/// leading sign, since it's not scanning out of a larger token stream.
pub fn str_to_number(s: &str) -> Option<LuaNumber> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (neg, rest) = match trimmed.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    if rest.is_empty() {
        return None;
    }
    let lower = rest.to_ascii_lowercase();
    let n = if let Some(hex) = lower.strip_prefix("0x") {
        let is_float = hex.contains('.') || hex.contains('p');
        parse_hex(&format!("0x{hex}"), is_float)?
    } else {
        if rest.chars().any(|c| !(c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || c == '+' || c == '-')) {
            return None;
        }
        let is_float = rest.contains('.') || lower.contains('e');
        if is_float {
            LuaNumber::Float(rest.parse().ok()?)
        } else {
            match rest.parse::<i64>() {
                Ok(v) => LuaNumber::Int(v),
                Err(_) => LuaNumber::Float(rest.parse().ok()?),
            }
        }
    };
    Some(match (n, neg) {
        (LuaNumber::Int(i), true) => LuaNumber::Int(i.wrapping_neg()),
        (LuaNumber::Int(i), false) => LuaNumber::Int(i),
        (LuaNumber::Float(f), true) => LuaNumber::Float(-f),
        (LuaNumber::Float(f), false) => LuaNumber::Float(f),
    })
}
