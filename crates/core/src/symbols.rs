//! Symbol hashing
//!
//! A symbol is the CRC32 hash of an identifier's UTF-8 bytes. The runtime
//! keeps a global symbol table mapping hashes back to their source strings;
//! everything else (shape keys, global variables, member lookup) works on
//! the 32-bit hash alone.

/// CRC32 hash of an interned identifier.
pub type Symbol = u32;

/// Hash an identifier string into its symbol.
#[inline]
pub fn hash_symbol(data: &str) -> Symbol {
    crc32fast::hash(data.as_bytes())
}

/// Hash a raw byte block.
#[inline]
pub fn hash_bytes(data: &[u8]) -> Symbol {
    crc32fast::hash(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash_symbol("foo"), hash_symbol("foo"));
        assert_eq!(hash_symbol("foo"), hash_bytes(b"foo"));
    }

    #[test]
    fn test_distinct_identifiers_hash_differently() {
        assert_ne!(hash_symbol("foo"), hash_symbol("bar"));
        assert_ne!(hash_symbol("length"), hash_symbol("klass"));
    }

    #[test]
    fn test_empty_string() {
        assert_eq!(hash_symbol(""), 0);
    }
}
