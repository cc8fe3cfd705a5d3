//! Function prototypes, closures and upvalues (spec §3).

use super::lua_string::LuaString;
use super::lua_value::LuaValue;
use crate::error::LuaResult;
use crate::vm::state::LuaState;
use std::cell::RefCell;
use std::rc::Rc;

/// Where an upvalue descriptor gets its value from when a closure is built
/// (spec §3's `{name, in_enclosing_stack, index}`).
#[derive(Debug, Clone)]
pub struct UpvalDesc {
    pub name: String,
    /// `true`: capture register `index` of the *enclosing* function's
    /// active frame. `false`: reuse upvalue `index` of the enclosing
    /// closure.
    pub in_stack: bool,
    pub index: u32,
}

#[derive(Debug, Clone)]
pub struct LocVar {
    pub name: String,
    pub start_pc: u32,
    pub end_pc: u32,
}

/// Immutable post-compilation function prototype.
pub struct Proto {
    pub code: Vec<u32>,
    pub lines: Vec<u32>,
    pub constants: Vec<LuaValue>,
    pub protos: Vec<Rc<Proto>>,
    pub upvalues: Vec<UpvalDesc>,
    pub locals: Vec<LocVar>,
    pub source: String,
    pub line_defined: u32,
    pub last_line_defined: u32,
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,
}

impl Proto {
    pub fn new(source: String) -> Self {
        Proto {
            code: Vec::new(),
            lines: Vec::new(),
            constants: Vec::new(),
            protos: Vec::new(),
            upvalues: Vec::new(),
            locals: Vec::new(),
            source,
            line_defined: 0,
            last_line_defined: 0,
            num_params: 0,
            is_vararg: false,
            max_stack_size: 2,
        }
    }
}

/// An upvalue cell. Starts `Open`, referencing a live stack slot by
/// absolute index; `close_upvalues` copies the value out and flips it to
/// `Closed` when the defining scope exits (spec §3/§4.4).
#[derive(Debug)]
pub enum UpvalState {
    Open(usize),
    Closed(LuaValue),
}

pub struct Upvalue(pub RefCell<UpvalState>);

impl Upvalue {
    pub fn open(stack_index: usize) -> Rc<Upvalue> {
        Rc::new(Upvalue(RefCell::new(UpvalState::Open(stack_index))))
    }

    pub fn closed(value: LuaValue) -> Rc<Upvalue> {
        Rc::new(Upvalue(RefCell::new(UpvalState::Closed(value))))
    }

    pub fn stack_index(&self) -> Option<usize> {
        match *self.0.borrow() {
            UpvalState::Open(i) => Some(i),
            UpvalState::Closed(_) => None,
        }
    }
}

pub struct LuaClosure {
    pub proto: Rc<Proto>,
    pub upvalues: Vec<Rc<Upvalue>>,
}

/// Signature for host (Rust-implemented) library functions: read arguments
/// from `base..` on the current thread's stack, overwrite `base..` with the
/// results, and return how many were produced (spec §4.5). State is shared
/// via `Rc`/`RefCell`, so no `&mut` is needed even though the call can
/// mutate globals, the string table, or recursively call back into Lua.
/// `upvalues` carries the enclosing [`HostClosure`]'s captured values (e.g.
/// the target thread of a `coroutine.wrap`ped function) — a plain fn pointer
/// has no captures of its own, so this is how a host closure gets state.
pub type HostFn = fn(&Rc<LuaState>, base: usize, upvalues: &[LuaValue]) -> LuaResult<usize>;

pub struct HostClosure {
    pub name: Rc<LuaString>,
    pub func: HostFn,
    pub upvalues: Vec<LuaValue>,
}

#[derive(Clone)]
pub enum LuaFunction {
    Lua(Rc<LuaClosure>),
    Host(Rc<HostClosure>),
}

impl LuaFunction {
    pub fn name_hint(&self) -> &str {
        match self {
            LuaFunction::Lua(c) => &c.proto.source,
            LuaFunction::Host(h) => h.name.as_str().unwrap_or("?"),
        }
    }

    /// Identity for raw equality / hashing: the `Rc`'s backing address.
    pub fn raw_ptr(&self) -> usize {
        match self {
            LuaFunction::Lua(c) => Rc::as_ptr(c) as usize,
            LuaFunction::Host(h) => Rc::as_ptr(h) as usize,
        }
    }
}
