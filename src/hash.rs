use std::fmt;

use serde::{Serialize, Serializer};

/// A 32-byte BLAKE3 hash used to fingerprint file contents.
///
/// The sync layer compares fingerprints to skip writes that would not change a
/// file, and reports them so that snapshot tooling can tell runs apart.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn to_hex(self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Hash32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_matches_blake3() {
        let hash = Hash32::hash("hello");
        assert_eq!(hash.to_hex(), blake3::hash(b"hello").to_hex().as_str());
        assert_eq!(hash.to_hex().len(), 64);
    }

    #[test]
    fn equal_contents_equal_hashes() {
        assert_eq!(Hash32::hash("a\n"), Hash32::hash(String::from("a\n")));
        assert_ne!(Hash32::hash("a\n"), Hash32::hash("a"));
    }
}
