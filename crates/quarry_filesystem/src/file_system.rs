//! Abstraction of the file system
//!
//! This module contains the trait the build core reads and watches the
//! project through. Implementations provide the subset they support.

use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use crate::watcher::WatchEvents;
use crate::watcher::WatcherOptions;

pub type FileSystemRef = Arc<dyn FileSystem + Send + Sync>;

pub trait FileSystem {
  fn cwd(&self) -> io::Result<PathBuf> {
    unimplemented!()
  }

  fn exists(&self, _path: &Path) -> io::Result<bool> {
    unimplemented!()
  }

  fn canonicalize(&self, _path: &Path) -> io::Result<PathBuf> {
    unimplemented!()
  }

  fn create_dir_all(&self, _path: &Path) -> io::Result<()> {
    unimplemented!()
  }

  fn read(&self, _path: &Path) -> io::Result<Vec<u8>> {
    unimplemented!()
  }

  fn read_to_string(&self, _path: &Path) -> io::Result<String> {
    unimplemented!()
  }

  fn remove_file(&self, _path: &Path) -> io::Result<()> {
    unimplemented!()
  }

  fn write(&self, _path: &Path, _contents: &[u8]) -> io::Result<()> {
    unimplemented!()
  }

  fn is_file(&self, _path: &Path) -> bool {
    unimplemented!()
  }

  fn is_dir(&self, _path: &Path) -> bool {
    unimplemented!()
  }

  /// Writes a watcher snapshot for `root`. A later call to
  /// [`FileSystem::events_since`] with the same snapshot path enumerates
  /// the events that happened after this point.
  fn write_snapshot(
    &self,
    _root: &Path,
    _snapshot_path: &Path,
    _opts: &WatcherOptions,
  ) -> io::Result<()> {
    unimplemented!()
  }

  /// Returns the events that occurred under `root` since the snapshot was
  /// written, excluding everything below the ignored paths.
  fn events_since(
    &self,
    _root: &Path,
    _snapshot_path: &Path,
    _opts: &WatcherOptions,
  ) -> io::Result<WatchEvents> {
    unimplemented!()
  }
}
