/// Interned byte strings shared between the lexer and the emitted bytecode.
///
/// Every string is deduplicated, regardless of length, so two equal literals
/// anywhere in a chunk map to the same `StringId`. Constant-pool
/// deduplication relies on this: comparing ids is comparing contents.
use std::collections::HashMap;

/// An opaque handle to a string in the interner.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StringId(pub u32);

/// PUC Lua compatible string hash (the luaS_hash algorithm).
pub fn lua_hash(bytes: &[u8]) -> u32 {
    let len = bytes.len();
    let mut h = len as u32;
    // Sample at most 32 bytes, stepping from the end.
    let step = (len >> 5) + 1;
    let mut i = len;
    while i >= step {
        h ^= (h << 5)
            .wrapping_add(h >> 2)
            .wrapping_add(bytes[i - 1] as u32);
        i -= step;
    }
    h
}

/// Owns every string created during a compile session.
#[derive(Debug, Default)]
pub struct StringInterner {
    /// All strings, indexed by StringId.
    strings: Vec<Box<[u8]>>,
    /// hash → candidate ids with that hash.
    lookup: HashMap<u32, Vec<u32>>,
}

impl StringInterner {
    pub fn new() -> Self {
        StringInterner::default()
    }

    /// Intern a byte string, returning the existing id when the contents
    /// were seen before.
    pub fn intern(&mut self, bytes: &[u8]) -> StringId {
        let hash = lua_hash(bytes);
        if let Some(ids) = self.lookup.get(&hash) {
            for &id in ids {
                if &*self.strings[id as usize] == bytes {
                    return StringId(id);
                }
            }
        }
        let id = self.strings.len() as u32;
        self.strings.push(bytes.into());
        self.lookup.entry(hash).or_default().push(id);
        StringId(id)
    }

    /// Raw bytes of an interned string.
    pub fn get_bytes(&self, id: StringId) -> &[u8] {
        &self.strings[id.0 as usize]
    }

    /// Lossy UTF-8 view of an interned string, for diagnostics.
    pub fn display(&self, id: StringId) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.get_bytes(id))
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}
