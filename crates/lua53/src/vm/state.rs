//! `LuaState`: the state shared by every thread of one Lua universe (spec
//! §3 / §5) — globals, the string intern table, and per-type metatables.
//! Mirrors the teacher's split between a shared runtime and per-coroutine
//! stacks, without the teacher's GC-arena indirection (spec §9 sanctions a
//! plain `Rc`/`RefCell` object graph instead).

use crate::error::LuaResult;
use crate::value::lua_string::{hash_bytes, LuaString};
use crate::value::lua_table::LuaTable;
use crate::value::lua_value::{LuaValue, TableRef, ThreadRef};
use crate::vm::thread::LuaThread;
use ahash::AHashMap;
use std::cell::RefCell;
use std::rc::Rc;

/// Index into `LuaState::metatables`, one slot per primitive type that can
/// carry a shared (non-table) metatable (spec §4.3's "type metatables").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Nil = 0,
    Bool = 1,
    Number = 2,
    Str = 3,
    Function = 4,
    UserData = 5,
    Thread = 6,
}
const NUM_TYPE_TAGS: usize = 7;

pub struct LuaState {
    pub globals: TableRef,
    /// Short-string interning table, keyed by content hash (spec §3's
    /// "equal short strings share one allocation").
    strings: RefCell<AHashMap<u64, Vec<Rc<LuaString>>>>,
    type_metatables: RefCell<[Option<TableRef>; NUM_TYPE_TAGS]>,
    pub main_thread: ThreadRef,
    pub current_thread: RefCell<ThreadRef>,
}

impl LuaState {
    pub fn new() -> Rc<LuaState> {
        let main = Rc::new(RefCell::new(LuaThread::new()));
        Rc::new(LuaState {
            globals: Rc::new(RefCell::new(LuaTable::new())),
            strings: RefCell::new(AHashMap::default()),
            type_metatables: RefCell::new(Default::default()),
            main_thread: main.clone(),
            current_thread: RefCell::new(main),
        })
    }

    pub fn current_thread(&self) -> ThreadRef {
        self.current_thread.borrow().clone()
    }

    /// Intern `s` if it is short enough to be worth sharing (spec §3);
    /// long strings allocate fresh every time, matching Lua's own rule.
    pub fn intern(&self, s: &[u8]) -> Rc<LuaString> {
        if s.len() > crate::value::lua_string::SHORT_STRING_LIMIT {
            return Rc::new(LuaString::from_bytes(s.to_vec()));
        }
        let h = hash_bytes(s);
        let mut table = self.strings.borrow_mut();
        let bucket = table.entry(h).or_default();
        for existing in bucket.iter() {
            if existing.as_bytes() == s {
                return existing.clone();
            }
        }
        let fresh = Rc::new(LuaString::from_bytes(s.to_vec()));
        bucket.push(fresh.clone());
        fresh
    }

    pub fn type_metatable(&self, tag: TypeTag) -> Option<TableRef> {
        self.type_metatables.borrow()[tag as usize].clone()
    }

    pub fn set_type_metatable(&self, tag: TypeTag, mt: Option<TableRef>) {
        self.type_metatables.borrow_mut()[tag as usize] = mt;
    }

    /// The metatable that governs `v`, whether it's a table's own
    /// metatable or a shared per-type one (spec §4.3).
    pub fn metatable_of(&self, v: &LuaValue) -> Option<TableRef> {
        match v {
            LuaValue::Table(t) => t.borrow().metatable.clone(),
            LuaValue::UserData(u) => u.borrow().metatable.clone(),
            LuaValue::Nil => self.type_metatable(TypeTag::Nil),
            LuaValue::Bool(_) => self.type_metatable(TypeTag::Bool),
            LuaValue::Int(_) | LuaValue::Float(_) => self.type_metatable(TypeTag::Number),
            LuaValue::Str(_) => self.type_metatable(TypeTag::Str),
            LuaValue::Function(_) => self.type_metatable(TypeTag::Function),
            LuaValue::Thread(_) => self.type_metatable(TypeTag::Thread),
        }
    }

    pub fn get_metamethod(&self, v: &LuaValue, name: &str) -> Option<LuaValue> {
        let mt = self.metatable_of(v)?;
        let key = LuaValue::string(name);
        let mm = mt.borrow().get(&key);
        if mm.is_nil() {
            None
        } else {
            Some(mm)
        }
    }

    /// Create a fresh coroutine sharing this state's globals/metatables.
    pub fn new_thread(&self) -> ThreadRef {
        Rc::new(RefCell::new(LuaThread::new()))
    }
}

pub fn type_name(v: &LuaValue) -> &'static str {
    v.type_name()
}

pub type StateRef = Rc<LuaState>;

/// Convenience used by host functions: fetch argument `i` (0-based,
/// relative to the call's `base`) from the currently running thread.
pub fn arg(thread: &LuaThread, base: usize, i: usize) -> LuaValue {
    thread.stack.get(base + i).cloned().unwrap_or(LuaValue::Nil)
}

pub fn arg_count(thread: &LuaThread, base: usize) -> usize {
    thread.stack.len().saturating_sub(base)
}

pub fn check_arg(thread: &LuaThread, base: usize, i: usize, fname: &str) -> LuaResult<LuaValue> {
    let v = arg(thread, base, i);
    if i >= arg_count(thread, base) {
        return Err(crate::error::LuaError::runtime(format!(
            "bad argument #{} to '{}' (value expected)",
            i + 1,
            fname
        )));
    }
    Ok(v)
}
