use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// One file system change reported by the watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "path", rename_all = "camelCase")]
pub enum WatchEvent {
  Create(PathBuf),
  Update(PathBuf),
  Delete(PathBuf),
}

impl WatchEvent {
  pub fn path(&self) -> &Path {
    match self {
      WatchEvent::Create(path) => path,
      WatchEvent::Update(path) => path,
      WatchEvent::Delete(path) => path,
    }
  }
}

pub type WatchEvents = Vec<WatchEvent>;

/// Options forwarded to the watcher when writing or reading a snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherOptions {
  /// Paths whose events are of no interest, e.g. the cache directory and
  /// VCS metadata directories.
  pub ignore: Vec<PathBuf>,
}
