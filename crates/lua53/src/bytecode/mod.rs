//! `string.dump`/`load`-style binary chunk format, byte-compatible with
//! reference Lua 5.3's header (`lundump.c`'s `luaU_header`) so a dumped
//! chunk is at least header-recognizable by the real interpreter, even
//! though the body encoding here is this crate's own (spec §4.2's Proto
//! shape, not the reference `OP_*` layout). Round-trip tested only; the CLI
//! never loads a chunk this way, it always compiles source directly.

use crate::error::{LuaError, LuaResult};
use crate::value::closure::{LocVar, Proto, UpvalDesc};
use crate::value::lua_value::LuaValue;
use std::rc::Rc;

/// `\x1bLua`, the same four bytes every Lua bytecode file starts with.
const LUA_SIGNATURE: &[u8; 4] = b"\x1bLua";
const LUAC_VERSION: u8 = 0x53;
const LUAC_FORMAT: u8 = 0;
/// Tail of the reference header used to detect transmission corruption
/// (CR/LF/EOF mangling), copied verbatim from `lundump.c`.
const LUAC_DATA: &[u8; 6] = &[0x19, 0x93, b'\r', b'\n', 0x1a, b'\n'];
const LUAC_INT: i64 = 0x5678;
const LUAC_NUM: f64 = 370.5;

fn write_header(buf: &mut Vec<u8>) {
    buf.extend_from_slice(LUA_SIGNATURE);
    buf.push(LUAC_VERSION);
    buf.push(LUAC_FORMAT);
    buf.extend_from_slice(LUAC_DATA);
    buf.push(std::mem::size_of::<i32>() as u8);
    buf.push(std::mem::size_of::<usize>() as u8);
    buf.push(std::mem::size_of::<u32>() as u8);
    buf.push(std::mem::size_of::<i64>() as u8);
    buf.push(std::mem::size_of::<f64>() as u8);
    buf.extend_from_slice(&LUAC_INT.to_le_bytes());
    buf.extend_from_slice(&LUAC_NUM.to_le_bytes());
}

fn check_header(cur: &mut Cursor) -> LuaResult<()> {
    if cur.take(4)? != LUA_SIGNATURE.as_slice() {
        return Err(LuaError::runtime("not a precompiled chunk"));
    }
    if cur.u8()? != LUAC_VERSION {
        return Err(LuaError::runtime("version mismatch in precompiled chunk"));
    }
    if cur.u8()? != LUAC_FORMAT {
        return Err(LuaError::runtime("format mismatch in precompiled chunk"));
    }
    if cur.take(6)? != LUAC_DATA.as_slice() {
        return Err(LuaError::runtime("corrupted precompiled chunk"));
    }
    let sizes = [
        std::mem::size_of::<i32>() as u8,
        std::mem::size_of::<usize>() as u8,
        std::mem::size_of::<u32>() as u8,
        std::mem::size_of::<i64>() as u8,
        std::mem::size_of::<f64>() as u8,
    ];
    for expect in sizes {
        if cur.u8()? != expect {
            return Err(LuaError::runtime("incompatible precompiled chunk (size mismatch)"));
        }
    }
    if cur.i64()? != LUAC_INT {
        return Err(LuaError::runtime("incompatible precompiled chunk (endianness)"));
    }
    if cur.f64()? != LUAC_NUM {
        return Err(LuaError::runtime("incompatible precompiled chunk (float format)"));
    }
    Ok(())
}

/// Serialize `proto` (and everything it recursively references) to bytes.
pub fn dump(proto: &Proto) -> Vec<u8> {
    let mut buf = Vec::new();
    write_header(&mut buf);
    write_proto(&mut buf, proto);
    buf
}

/// Parse bytes produced by [`dump`] back into a `Proto` tree.
pub fn undump(data: &[u8]) -> LuaResult<Rc<Proto>> {
    let mut cur = Cursor { data, pos: 0 };
    check_header(&mut cur)?;
    read_proto(&mut cur)
}

fn write_proto(buf: &mut Vec<u8>, proto: &Proto) {
    write_string(buf, proto.source.as_bytes());
    write_u32(buf, proto.line_defined);
    write_u32(buf, proto.last_line_defined);
    buf.push(proto.num_params);
    buf.push(proto.is_vararg as u8);
    buf.push(proto.max_stack_size);

    write_u32(buf, proto.code.len() as u32);
    for &instr in &proto.code {
        write_u32(buf, instr);
    }

    write_u32(buf, proto.constants.len() as u32);
    for k in &proto.constants {
        write_constant(buf, k);
    }

    write_u32(buf, proto.upvalues.len() as u32);
    for u in &proto.upvalues {
        write_string(buf, u.name.as_bytes());
        buf.push(u.in_stack as u8);
        write_u32(buf, u.index);
    }

    write_u32(buf, proto.protos.len() as u32);
    for child in &proto.protos {
        write_proto(buf, child);
    }

    write_u32(buf, proto.lines.len() as u32);
    for &line in &proto.lines {
        write_u32(buf, line);
    }

    write_u32(buf, proto.locals.len() as u32);
    for l in &proto.locals {
        write_string(buf, l.name.as_bytes());
        write_u32(buf, l.start_pc);
        write_u32(buf, l.end_pc);
    }
}

fn read_proto(cur: &mut Cursor) -> LuaResult<Rc<Proto>> {
    let source = read_string(cur)?;
    let mut proto = Proto::new(source);
    proto.line_defined = cur.u32()?;
    proto.last_line_defined = cur.u32()?;
    proto.num_params = cur.u8()?;
    proto.is_vararg = cur.u8()? != 0;
    proto.max_stack_size = cur.u8()?;

    let code_len = cur.u32()? as usize;
    proto.code = (0..code_len).map(|_| cur.u32()).collect::<LuaResult<_>>()?;

    let const_len = cur.u32()? as usize;
    proto.constants = (0..const_len).map(|_| read_constant(cur)).collect::<LuaResult<_>>()?;

    let upval_len = cur.u32()? as usize;
    for _ in 0..upval_len {
        let name = read_string(cur)?;
        let in_stack = cur.u8()? != 0;
        let index = cur.u32()?;
        proto.upvalues.push(UpvalDesc { name, in_stack, index });
    }

    let proto_len = cur.u32()? as usize;
    for _ in 0..proto_len {
        proto.protos.push(read_proto(cur)?);
    }

    let line_len = cur.u32()? as usize;
    proto.lines = (0..line_len).map(|_| cur.u32()).collect::<LuaResult<_>>()?;

    let local_len = cur.u32()? as usize;
    for _ in 0..local_len {
        let name = read_string(cur)?;
        let start_pc = cur.u32()?;
        let end_pc = cur.u32()?;
        proto.locals.push(LocVar { name, start_pc, end_pc });
    }

    Ok(Rc::new(proto))
}

const TAG_NIL: u8 = 0;
const TAG_FALSE: u8 = 1;
const TAG_TRUE: u8 = 2;
const TAG_INT: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_STRING: u8 = 5;

fn write_constant(buf: &mut Vec<u8>, v: &LuaValue) {
    match v {
        LuaValue::Nil => buf.push(TAG_NIL),
        LuaValue::Bool(false) => buf.push(TAG_FALSE),
        LuaValue::Bool(true) => buf.push(TAG_TRUE),
        LuaValue::Int(i) => {
            buf.push(TAG_INT);
            buf.extend_from_slice(&i.to_le_bytes());
        }
        LuaValue::Float(f) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&f.to_le_bytes());
        }
        LuaValue::Str(s) => {
            buf.push(TAG_STRING);
            write_string(buf, s.as_bytes());
        }
        other => unreachable!("non-constant value in proto constant pool: {other}"),
    }
}

fn read_constant(cur: &mut Cursor) -> LuaResult<LuaValue> {
    match cur.u8()? {
        TAG_NIL => Ok(LuaValue::Nil),
        TAG_FALSE => Ok(LuaValue::Bool(false)),
        TAG_TRUE => Ok(LuaValue::Bool(true)),
        TAG_INT => Ok(LuaValue::Int(cur.i64()?)),
        TAG_FLOAT => Ok(LuaValue::Float(cur.f64()?)),
        TAG_STRING => Ok(LuaValue::string_bytes(read_string_bytes(cur)?)),
        tag => Err(LuaError::runtime(format!("corrupted precompiled chunk (bad constant tag {tag})"))),
    }
}

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_string(buf: &mut Vec<u8>, s: &[u8]) {
    write_u32(buf, s.len() as u32);
    buf.extend_from_slice(s);
}

/// Raw bytes of a length-prefixed string, byte-faithful for round-tripping
/// `Proto` constants that may not be valid UTF-8.
fn read_string_bytes(cur: &mut Cursor) -> LuaResult<Vec<u8>> {
    let len = cur.u32()? as usize;
    Ok(cur.take(len)?.to_vec())
}

/// Like [`read_string_bytes`] but for fields that are always plain Rust
/// `String`s (source name, upvalue/local names) rather than Lua string
/// values.
fn read_string(cur: &mut Cursor) -> LuaResult<String> {
    Ok(String::from_utf8_lossy(&read_string_bytes(cur)?).into_owned())
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> LuaResult<&'a [u8]> {
        let slice = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or_else(|| LuaError::runtime("truncated precompiled chunk"))?;
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> LuaResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> LuaResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> LuaResult<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> LuaResult<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compiler::compile;

    #[test]
    fn round_trips_a_simple_chunk() {
        let proto = compile("local x = 1 + 2 return x", "test").unwrap();
        let bytes = dump(&proto);
        assert_eq!(&bytes[0..4], LUA_SIGNATURE.as_slice());
        let restored = undump(&bytes).unwrap();
        assert_eq!(restored.code, proto.code);
        assert_eq!(restored.constants.len(), proto.constants.len());
        assert_eq!(restored.max_stack_size, proto.max_stack_size);
    }

    #[test]
    fn rejects_garbage_input() {
        assert!(undump(b"not lua bytecode").is_err());
    }
}
