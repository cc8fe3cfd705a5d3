//! Per-thread call stack and register array (spec §3's CallInfo, §5's
//! coroutines). A `LuaThread` is a full `LuaState`-sized execution context
//! in miniature: its own `stack`/`frames`/open-upvalue list, sharing only
//! the owning `LuaState`'s globals/metatables/string pool (spec §5: "share
//! the global state").

use crate::value::closure::{LuaFunction, Upvalue};
use crate::value::lua_value::LuaValue;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Suspended,
    Running,
    Normal,
    Dead,
}

/// One activation record. `base` is the absolute index into the thread's
/// `stack` where register 0 of this call lives; `pc` indexes the callee
/// Proto's code vector (for Lua calls) and is meaningless for host calls.
pub struct CallInfo {
    pub func: LuaFunction,
    pub base: usize,
    pub pc: usize,
    /// Absolute stack index of `func` itself (one below `base - 1`... in
    /// this layout `func` sits at `base - 1`; kept explicit for clarity at
    /// call/return boundaries).
    pub func_index: usize,
    /// Number of results the caller asked for; `None` means "all of them"
    /// (spec §4.4's `C=0`/`B=0` conventions).
    pub want_results: Option<usize>,
    pub is_tailcall: bool,
}

pub struct LuaThread {
    pub stack: Vec<LuaValue>,
    pub frames: Vec<CallInfo>,
    /// Sorted by referenced stack index, per spec §3's upvalue-lifetime
    /// invariant (also invariant 4 in spec §8).
    pub open_upvalues: Vec<Rc<Upvalue>>,
    pub status: ThreadStatus,
    pub varargs: Vec<Vec<LuaValue>>,
    /// The coroutine body, set by `coroutine.create` and consumed by the
    /// first `resume`.
    pub pending_call: Option<LuaValue>,
    /// `(call_base, want_results)` of the host call currently in flight,
    /// recorded before every host-function invocation so that if it turns
    /// out to be `coroutine.yield`, `resume` knows where to land the
    /// resumed values (spec §5).
    pub pending_yield_site: Option<(usize, Option<usize>)>,
}

impl LuaThread {
    pub fn new() -> Self {
        LuaThread {
            stack: Vec::with_capacity(64),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            status: ThreadStatus::Suspended,
            varargs: Vec::new(),
            pending_call: None,
            pending_yield_site: None,
        }
    }

    pub fn ensure_stack(&mut self, top: usize) {
        if self.stack.len() < top {
            self.stack.resize(top, LuaValue::Nil);
        }
    }

    pub fn ensure_and_set(&mut self, index: usize, value: LuaValue) {
        self.ensure_stack(index + 1);
        self.stack[index] = value;
    }

    /// Find (or create) the open upvalue referencing `index`, inserting it
    /// into the sorted list so sibling closures over the same local share
    /// one cell (spec §3's "open-upvalue coalescing").
    pub fn find_or_create_upvalue(&mut self, index: usize) -> Rc<Upvalue> {
        match self
            .open_upvalues
            .binary_search_by_key(&index, |u| u.stack_index().unwrap_or(usize::MAX))
        {
            Ok(pos) => self.open_upvalues[pos].clone(),
            Err(pos) => {
                let uv = Upvalue::open(index);
                self.open_upvalues.insert(pos, uv.clone());
                uv
            }
        }
    }

    /// Close every open upvalue referencing a stack slot `>= threshold`,
    /// copying the live value into the cell and detaching it from the
    /// open list (spec §4.4's `JMP`-with-close / return-time closing).
    pub fn close_upvalues(&mut self, threshold: usize) {
        let stack = &self.stack;
        self.open_upvalues.retain(|uv| {
            let idx = match uv.stack_index() {
                Some(i) => i,
                None => return false,
            };
            if idx >= threshold {
                let v = stack.get(idx).cloned().unwrap_or(LuaValue::Nil);
                *uv.0.borrow_mut() = crate::value::closure::UpvalState::Closed(v);
                false
            } else {
                true
            }
        });
    }
}

impl Default for LuaThread {
    fn default() -> Self {
        Self::new()
    }
}
