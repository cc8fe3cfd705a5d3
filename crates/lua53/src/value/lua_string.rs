//! String value: an immutable byte sequence with a precomputed hash.
//!
//! Lua strings are raw byte sequences, not necessarily valid UTF-8 (a
//! literal like `"\xFF"` is one byte). This type stores bytes directly —
//! never via `String`/`str`, which would force every non-UTF-8 byte string
//! through an invalid state or lossy mangling.
//!
//! Short strings (< [`SHORT_STRING_LIMIT`] bytes) are interned by
//! [`crate::vm::LuaState`]'s string table so that two equal-bytes short
//! strings are the same `Rc` and therefore pointer-comparable, per spec
//! §3. Longer strings skip interning; equality still falls back to byte
//! comparison either way (see [`LuaString::eq`]).

use ahash::AHasher;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Strings shorter than this are interned (spec §3's "~40 bytes").
pub const SHORT_STRING_LIMIT: usize = 40;

/// Bytes up to this length live inline in the `LuaString` itself, avoiding
/// a heap allocation for the identifiers/keys that dominate real scripts.
const INLINE_CAP: usize = 22;

#[derive(Clone)]
enum Repr {
    Inline { len: u8, buf: [u8; INLINE_CAP] },
    Heap(Rc<[u8]>),
}

#[derive(Clone)]
pub struct LuaString {
    repr: Repr,
    hash: u64,
}

impl LuaString {
    pub fn new(s: impl AsRef<str>) -> Self {
        Self::from_bytes(s.as_ref().as_bytes().to_vec())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let hash = hash_bytes(&bytes);
        let repr = if bytes.len() <= INLINE_CAP {
            let mut buf = [0u8; INLINE_CAP];
            buf[..bytes.len()].copy_from_slice(&bytes);
            Repr::Inline { len: bytes.len() as u8, buf }
        } else {
            Repr::Heap(Rc::from(bytes.into_boxed_slice()))
        };
        LuaString { repr, hash }
    }

    pub fn is_short(&self) -> bool {
        self.as_bytes().len() < SHORT_STRING_LIMIT
    }

    /// `None` when the bytes aren't valid UTF-8 — callers that need text
    /// (keyword/identifier comparisons, numeral parsing) go through this;
    /// callers that need Lua's own byte semantics use [`as_bytes`].
    ///
    /// [`as_bytes`]: LuaString::as_bytes
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(self.as_bytes()).ok()
    }

    /// Display-only conversion, replacing invalid bytes with U+FFFD. Never
    /// use this for anything that feeds back into a Lua value.
    pub fn to_string_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.repr {
            Repr::Inline { len, buf } => &buf[..*len as usize],
            Repr::Heap(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    pub fn hash_value(&self) -> u64 {
        self.hash
    }
}

pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = AHasher::default();
    bytes.hash(&mut hasher);
    hasher.finish()
}

impl PartialEq for LuaString {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.as_bytes() == other.as_bytes()
    }
}
impl Eq for LuaString {}

impl Hash for LuaString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl std::fmt::Debug for LuaString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

impl std::fmt::Display for LuaString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_lossy())
    }
}
