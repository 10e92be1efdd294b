use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub type CacheRef = Arc<dyn Cache + Send + Sync>;

/// Blob store shared by the build core. Keys are opaque strings; callers
/// layer their own serialization on top (see [`CacheExt`]).
#[async_trait]
pub trait Cache {
  async fn get_blob(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

  async fn set_blob(&self, key: &str, blob: &[u8]) -> anyhow::Result<()>;

  /// A stable on-disk path derived from `key`, for collaborators that need
  /// a real file next to the cache (e.g. watcher snapshots).
  fn cache_path(&self, key: &str, ext: &str) -> PathBuf;
}

/// Typed convenience layer over the blob API.
#[async_trait]
pub trait CacheExt {
  async fn get<D: DeserializeOwned + Send>(&self, key: &str) -> anyhow::Result<Option<D>>;

  async fn set<S: Serialize + Send + Sync>(&self, key: &str, value: &S) -> anyhow::Result<()>;
}

#[async_trait]
impl CacheExt for dyn Cache + Send + Sync {
  async fn get<D: DeserializeOwned + Send>(&self, key: &str) -> anyhow::Result<Option<D>> {
    Ok(match self.get_blob(key).await? {
      Some(bytes) => Some(bincode::deserialize(&bytes)?),
      None => None,
    })
  }

  async fn set<S: Serialize + Send + Sync>(&self, key: &str, value: &S) -> anyhow::Result<()> {
    let bytes = bincode::serialize(value)?;
    self.set_blob(key, &bytes).await
  }
}
