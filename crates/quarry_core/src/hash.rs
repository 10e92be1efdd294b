use std::hash::Hash;
use std::hash::Hasher;

use xxhash_rust::xxh3::xxh3_64;
use xxhash_rust::xxh3::Xxh3;

/// Hasher behind request identity.
///
/// A request's id is the xxh3 of its concrete type and input fields, and
/// that id doubles as the graph content key and as part of cache entry
/// names, so the hash must be stable across runs, machines and platforms.
/// A std hasher is not an option here: `DefaultHasher` may change between
/// releases, which would silently orphan every persisted request graph.
pub type IdentifierHasher = Xxh3;

/// Hashes any `Hash` value into the 16-hex-digit form used for content
/// keys and cache entry names.
pub fn hash_identifier<T: Hash + ?Sized>(value: &T) -> String {
  let mut hasher = IdentifierHasher::default();
  value.hash(&mut hasher);
  to_hex(hasher.finish())
}

/// Raw-bytes variant for callers that already serialized their input,
/// e.g. deriving a file name from an opaque cache key.
pub fn hash_bytes(bytes: &[u8]) -> String {
  to_hex(xxh3_64(bytes))
}

fn to_hex(hash: u64) -> String {
  format!("{:016x}", hash)
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn identifier_hashes_are_stable_and_distinct() {
    assert_eq!(hash_identifier("request"), hash_identifier("request"));
    assert_ne!(hash_identifier("request"), hash_identifier("tseuqer"));
    assert_eq!(hash_bytes(b"request").len(), 16);
  }
}
