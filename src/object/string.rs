//! `ObjString` — immutable, interned, FNV-1a-hashed byte string.

/// FNV-1a over raw bytes.
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// An immutable run of bytes, treated as UTF-8 but indexed by byte so
/// indexing and slicing never need to re-derive codepoint boundaries from
/// scratch. Interned at allocation time by the heap (`Heap::new_string`),
/// so two `ObjString`s with equal bytes are the
/// same object for the lifetime of a VM — this is how `Num`/`String`
/// equality and map-key hashing stay cheap.
pub struct ObjString {
    pub bytes: Vec<u8>,
    pub hash: u32,
}

impl ObjString {
    pub fn new(bytes: Vec<u8>) -> Self {
        let hash = fnv1a_hash(&bytes);
        ObjString { bytes, hash }
    }

    pub fn as_str(&self) -> &str {
        // Scripts only ever construct strings from valid UTF-8 (literals,
        // concatenation of valid strings, or explicit byte/codepoint
        // constructors that validate); a slice may still land mid-sequence,
        // which is why `codePointAt`/`[]` do their own byte-aware walk
        // rather than relying on `str` methods that would panic.
        std::str::from_utf8(&self.bytes).unwrap_or("")
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes.len()
    }
}
