use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use quarry_core::hash::hash_bytes;
use tokio::sync::RwLock;

use crate::Cache;

/// In-memory cache for tests and cache-less builds.
#[derive(Default)]
pub struct InMemoryCache {
  store: RwLock<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl Cache for InMemoryCache {
  async fn get_blob(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
    Ok(self.store.read().await.get(key).cloned())
  }

  async fn set_blob(&self, key: &str, blob: &[u8]) -> anyhow::Result<()> {
    self
      .store
      .write()
      .await
      .insert(key.to_string(), blob.to_vec());
    Ok(())
  }

  fn cache_path(&self, key: &str, ext: &str) -> PathBuf {
    // There is no backing directory; the path only needs to be stable.
    PathBuf::from("/.quarry-cache").join(format!("{}{}", hash_bytes(key.as_bytes()), ext))
  }
}

#[cfg(test)]
mod test {
  use pretty_assertions::assert_eq;

  use super::*;
  use crate::CacheExt;
  use crate::CacheRef;
  use std::sync::Arc;

  #[tokio::test]
  async fn should_set_and_get_blobs() {
    let cache = InMemoryCache::default();

    cache.set_blob("hello", b"world").await.expect("Should set blob");

    let value = cache.get_blob("hello").await.expect("Should get blob");
    assert_eq!(value, Some(b"world".to_vec()));

    let missing = cache.get_blob("absent").await.expect("Should get blob");
    assert_eq!(missing, None);
  }

  #[tokio::test]
  async fn should_roundtrip_typed_values() {
    let cache: CacheRef = Arc::new(InMemoryCache::default());

    cache
      .set("greeting", &"world".to_string())
      .await
      .expect("Should set value");

    let value: Option<String> = cache.get("greeting").await.expect("Should get value");
    assert_eq!(value, Some("world".to_string()));
  }
}
