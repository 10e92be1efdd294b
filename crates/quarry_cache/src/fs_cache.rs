use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use quarry_core::hash::hash_bytes;

use crate::Cache;

/// Durable cache storing one file per key under a cache directory.
pub struct FsCache {
  dir: PathBuf,
}

impl FsCache {
  pub fn new(dir: PathBuf) -> Self {
    Self { dir }
  }

  fn entry_path(&self, key: &str) -> PathBuf {
    // Keys may contain separators; the file name is the key's hash.
    self.dir.join(hash_bytes(key.as_bytes()))
  }
}

#[async_trait]
impl Cache for FsCache {
  #[tracing::instrument(level = "debug", skip_all)]
  async fn get_blob(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
    match std::fs::read(self.entry_path(key)) {
      Ok(blob) => Ok(Some(blob)),
      Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
      Err(error) => Err(error.into()),
    }
  }

  #[tracing::instrument(level = "debug", skip_all)]
  async fn set_blob(&self, key: &str, blob: &[u8]) -> anyhow::Result<()> {
    std::fs::create_dir_all(&self.dir)?;
    std::fs::write(self.entry_path(key), blob)?;
    Ok(())
  }

  fn cache_path(&self, key: &str, ext: &str) -> PathBuf {
    self.dir.join(format!("{}{}", hash_bytes(key.as_bytes()), ext))
  }
}
