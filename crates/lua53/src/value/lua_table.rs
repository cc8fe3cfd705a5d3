//! Table: the array-part + hash-part hybrid container described in spec
//! §3/§4.3, with the main-position/chain insertion protocol from Lua's
//! `ltable.c` (no teacher file implements this faithfully — `CppCXY-lua-rs`'s
//! `LuaTable` migrates wholesale between a pure array and a pure hash
//! representation instead of keeping both at once — so this module follows
//! the reference algorithm directly, in the crate's general style:
//! `Rc<RefCell<_>>` cells, `LuaError` for key-validity failures).

use super::lua_value::LuaValue;
use crate::error::LuaError;
use std::rc::Rc;
use std::cell::RefCell;

/// One hash-part slot: a key/value pair plus the index of the next node in
/// its collision chain (`None` = chain ends here). A `Nil` key marks a free
/// slot.
#[derive(Clone)]
struct Node {
    key: LuaValue,
    value: LuaValue,
    next: Option<usize>,
}

impl Node {
    fn free() -> Self {
        Node { key: LuaValue::Nil, value: LuaValue::Nil, next: None }
    }
    fn is_free(&self) -> bool {
        matches!(self.key, LuaValue::Nil)
    }
}

pub struct LuaTable {
    array: Vec<LuaValue>,
    nodes: Vec<Node>,
    /// Scans backward from `nodes.len()` looking for a free slot, mirroring
    /// `lastfree` in `ltable.c` so repeated inserts don't re-scan from the
    /// top every time.
    last_free: usize,
    pub metatable: Option<Rc<RefCell<LuaTable>>>,
}

fn next_pow2(mut n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    let mut p = 1;
    while p < n {
        p <<= 1;
    }
    n = p;
    n
}

/// Normalize a key for table access per spec §3/§4.3: integral floats
/// become integers so `t[1]` and `t[1.0]` hit the same slot.
pub fn normalize_key(key: LuaValue) -> LuaValue {
    if let LuaValue::Float(f) = key {
        if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
            return LuaValue::Int(f as i64);
        }
    }
    key
}

impl LuaTable {
    pub fn new() -> Self {
        LuaTable { array: Vec::new(), nodes: Vec::new(), last_free: 0, metatable: None }
    }

    pub fn with_capacity(narray: usize, nhash: usize) -> Self {
        let mut t = LuaTable::new();
        if narray > 0 {
            t.array.reserve(narray);
        }
        if nhash > 0 {
            t.resize_hash(next_pow2(nhash));
        }
        t
    }

    fn resize_hash(&mut self, size: usize) {
        self.nodes = (0..size).map(|_| Node::free()).collect();
        self.last_free = size;
    }

    fn main_position(&self, key: &LuaValue) -> Option<usize> {
        if self.nodes.is_empty() {
            return None;
        }
        let h = key.raw_hash();
        Some((h as usize) & (self.nodes.len() - 1))
    }

    fn get_free_pos(&mut self) -> Option<usize> {
        while self.last_free > 0 {
            self.last_free -= 1;
            if self.nodes[self.last_free].is_free() {
                return Some(self.last_free);
            }
        }
        None
    }

    /// Raw get: array lookup for in-range positive integer keys, hash
    /// lookup (following the main-position chain) otherwise.
    pub fn get(&self, key: &LuaValue) -> LuaValue {
        let key = normalize_key(key.clone());
        if let LuaValue::Int(i) = key {
            if i >= 1 && (i as usize) <= self.array.len() {
                return self.array[i as usize - 1].clone();
            }
        }
        self.hash_get(&key)
    }

    fn hash_get(&self, key: &LuaValue) -> LuaValue {
        let Some(mut idx) = self.main_position(key) else {
            return LuaValue::Nil;
        };
        loop {
            let node = &self.nodes[idx];
            if !node.is_free() && &node.key == key {
                return node.value.clone();
            }
            match node.next {
                Some(n) => idx = n,
                None => return LuaValue::Nil,
            }
        }
    }

    /// Raw set. Rejects `nil`/`NaN` keys per spec §3's table invariant.
    pub fn set(&mut self, key: LuaValue, value: LuaValue) -> Result<(), LuaError> {
        let key = normalize_key(key);
        match &key {
            LuaValue::Nil => return Err(LuaError::runtime("table index is nil")),
            LuaValue::Float(f) if f.is_nan() => {
                return Err(LuaError::runtime("table index is NaN"))
            }
            _ => {}
        }
        if let LuaValue::Int(i) = key {
            if i >= 1 && (i as usize) <= self.array.len() {
                self.array[i as usize - 1] = value;
                return Ok(());
            }
            // Extend the array part by exactly one when appending right
            // past the end, mirroring Lua's incremental array growth.
            if i as usize == self.array.len() + 1 && !matches!(value, LuaValue::Nil) {
                self.array.push(value);
                self.migrate_from_hash_tail();
                return Ok(());
            }
        }
        if matches!(value, LuaValue::Nil) {
            self.hash_remove(&key);
            return Ok(());
        }
        self.hash_set(key, value);
        Ok(())
    }

    /// After an array append, pull any now-contiguous integer keys that
    /// were sitting in the hash part back into the array part.
    fn migrate_from_hash_tail(&mut self) {
        loop {
            let next_idx = (self.array.len() + 1) as i64;
            let k = LuaValue::Int(next_idx);
            let v = self.hash_get(&k);
            if matches!(v, LuaValue::Nil) {
                break;
            }
            self.hash_remove(&k);
            self.array.push(v);
        }
    }

    fn hash_set(&mut self, key: LuaValue, value: LuaValue) {
        if self.nodes.is_empty() {
            self.resize_hash(1);
        }
        loop {
            let mp = self.main_position(&key).unwrap();
            if self.nodes[mp].is_free() {
                self.nodes[mp] = Node { key, value, next: None };
                return;
            }
            if self.nodes[mp].key == key {
                self.nodes[mp].value = value;
                return;
            }
            let collider_main = self.main_position(&self.nodes[mp].key.clone()).unwrap();
            if collider_main != mp {
                // The occupant of `mp` is a chain node that actually
                // belongs elsewhere; evict it to a free slot and take `mp`
                // for the new key, which *is* at its main position.
                let Some(free) = self.get_free_pos() else {
                    self.rehash_grow();
                    continue;
                };
                // Find the node in collider_main's chain pointing at mp and
                // redirect it at `free`.
                let mut p = collider_main;
                while self.nodes[p].next != Some(mp) {
                    p = self.nodes[p].next.expect("corrupt chain");
                }
                self.nodes[p].next = Some(free);
                self.nodes[free] = self.nodes[mp].clone();
                self.nodes[mp] = Node { key, value, next: None };
                return;
            } else {
                // `mp` is genuinely the chain head for its own key; append
                // the new key at a free slot and link it in.
                let Some(free) = self.get_free_pos() else {
                    self.rehash_grow();
                    continue;
                };
                self.nodes[free] = Node { key, value, next: self.nodes[mp].next };
                self.nodes[mp].next = Some(free);
                return;
            }
        }
    }

    fn hash_remove(&mut self, key: &LuaValue) {
        let Some(mut idx) = self.main_position(key) else { return };
        loop {
            if !self.nodes[idx].is_free() && &self.nodes[idx].key == key {
                self.nodes[idx].value = LuaValue::Nil;
                // Leave the key so the chain stays intact (dead key, per
                // spec's `LUA_TDEADKEY` concept); slot is reclaimed at the
                // next rehash.
                return;
            }
            match self.nodes[idx].next {
                Some(n) => idx = n,
                None => return,
            }
        }
    }

    fn rehash_grow(&mut self) {
        let mut pairs: Vec<(LuaValue, LuaValue)> = Vec::new();
        for (i, v) in self.array.iter().enumerate() {
            if !matches!(v, LuaValue::Nil) {
                pairs.push((LuaValue::Int((i + 1) as i64), v.clone()));
            }
        }
        for node in &self.nodes {
            if !node.is_free() && !matches!(node.value, LuaValue::Nil) {
                pairs.push((node.key.clone(), node.value.clone()));
            }
        }
        let new_hash_size = next_pow2((pairs.len() + 1).max(1) * 2);
        self.array.clear();
        self.resize_hash(new_hash_size);
        for (k, v) in pairs {
            match &k {
                LuaValue::Int(i) if *i >= 1 && (*i as usize) <= self.array.len() + 1 => {
                    // Re-append sequentially; gaps fall through to hash_set.
                    if *i as usize == self.array.len() + 1 {
                        self.array.push(v);
                        continue;
                    }
                }
                _ => {}
            }
            self.hash_set_no_rehash(k, v);
        }
    }

    fn hash_set_no_rehash(&mut self, key: LuaValue, value: LuaValue) {
        // Same as hash_set but assumes capacity was already sized by the
        // caller and simply grows again (rare) rather than recursing into
        // rehash_grow, avoiding infinite recursion during rehash itself.
        loop {
            let mp = match self.main_position(&key) {
                Some(m) => m,
                None => {
                    self.resize_hash(1);
                    continue;
                }
            };
            if self.nodes[mp].is_free() {
                self.nodes[mp] = Node { key, value, next: None };
                return;
            }
            if self.nodes[mp].key == key {
                self.nodes[mp].value = value;
                return;
            }
            let collider_main = self.main_position(&self.nodes[mp].key.clone()).unwrap();
            let free = match self.get_free_pos() {
                Some(f) => f,
                None => {
                    let old_size = self.nodes.len().max(1);
                    let mut pairs: Vec<(LuaValue, LuaValue)> = self
                        .nodes
                        .iter()
                        .filter(|n| !n.is_free())
                        .map(|n| (n.key.clone(), n.value.clone()))
                        .collect();
                    pairs.push((key.clone(), value.clone()));
                    self.resize_hash(old_size * 2);
                    for (k, v) in pairs {
                        self.hash_set_no_rehash(k, v);
                    }
                    return;
                }
            };
            if collider_main != mp {
                let mut p = collider_main;
                while self.nodes[p].next != Some(mp) {
                    p = self.nodes[p].next.expect("corrupt chain");
                }
                self.nodes[p].next = Some(free);
                self.nodes[free] = self.nodes[mp].clone();
                self.nodes[mp] = Node { key, value, next: None };
            } else {
                self.nodes[free] = Node { key, value, next: self.nodes[mp].next };
                self.nodes[mp].next = Some(free);
            }
            return;
        }
    }

    /// `#t`: any border — an `n` with `t[n] ~= nil` and `t[n+1] == nil`.
    /// Binary-searches the array part first, falling back to the hash part
    /// when the whole array is occupied (spec §3/§4.3).
    pub fn length(&self) -> i64 {
        let n = self.array.len();
        if n > 0 && matches!(self.array[n - 1], LuaValue::Nil) {
            // Border lies inside the array: binary search for it.
            let mut lo = 0usize;
            let mut hi = n;
            while hi - lo > 1 {
                let mid = (lo + hi) / 2;
                if matches!(self.array[mid - 1], LuaValue::Nil) {
                    hi = mid;
                } else {
                    lo = mid;
                }
            }
            return lo as i64;
        }
        if n > 0 || self.nodes.is_empty() {
            // Array is fully populated (or empty); check whether the hash
            // part continues the sequence.
            if matches!(self.hash_get(&LuaValue::Int((n + 1) as i64)), LuaValue::Nil) {
                return n as i64;
            }
        }
        // Unbounded search in the hash part: find i with t[i] ~= nil and
        // t[2i] == nil, then binary search between them.
        let mut i = n as i64;
        let mut j = (n + 1) as i64;
        while !matches!(self.hash_get(&LuaValue::Int(j)), LuaValue::Nil) {
            i = j;
            if j > i64::MAX / 2 {
                // Degenerate: walk linearly to avoid overflow.
                let mut k = i;
                while !matches!(self.hash_get(&LuaValue::Int(k + 1)), LuaValue::Nil) {
                    k += 1;
                }
                return k;
            }
            j *= 2;
        }
        while j - i > 1 {
            let m = (i + j) / 2;
            if matches!(self.hash_get(&LuaValue::Int(m)), LuaValue::Nil) {
                j = m;
            } else {
                i = m;
            }
        }
        i
    }

    /// Stateless `next` iteration: array part first (in order), then the
    /// hash part in slot order. Order is implementation-defined but stable
    /// for an unchanged table, per spec §4.3/§8.
    pub fn next(&self, key: &LuaValue) -> Result<Option<(LuaValue, LuaValue)>, LuaError> {
        let start_hash_from = match key {
            LuaValue::Nil => {
                for (i, v) in self.array.iter().enumerate() {
                    if !matches!(v, LuaValue::Nil) {
                        return Ok(Some((LuaValue::Int((i + 1) as i64), v.clone())));
                    }
                }
                0
            }
            _ => {
                let key = normalize_key(key.clone());
                if let LuaValue::Int(i) = key {
                    if i >= 1 && (i as usize) <= self.array.len() {
                        for j in (i as usize)..self.array.len() {
                            if !matches!(self.array[j], LuaValue::Nil) {
                                return Ok(Some((LuaValue::Int((j + 1) as i64), self.array[j].clone())));
                            }
                        }
                        0
                    } else {
                        self.hash_index_of(&key)
                            .ok_or_else(|| LuaError::runtime("invalid key to 'next'"))?
                            + 1
                    }
                } else {
                    self.hash_index_of(&key)
                        .ok_or_else(|| LuaError::runtime("invalid key to 'next'"))?
                        + 1
                }
            }
        };
        for idx in start_hash_from..self.nodes.len() {
            let node = &self.nodes[idx];
            if !node.is_free() && !matches!(node.value, LuaValue::Nil) {
                return Ok(Some((node.key.clone(), node.value.clone())));
            }
        }
        Ok(None)
    }

    fn hash_index_of(&self, key: &LuaValue) -> Option<usize> {
        self.nodes.iter().position(|n| !n.is_free() && &n.key == key)
    }

    pub fn array_part(&self) -> &[LuaValue] {
        &self.array
    }
}

impl Default for LuaTable {
    fn default() -> Self {
        Self::new()
    }
}
