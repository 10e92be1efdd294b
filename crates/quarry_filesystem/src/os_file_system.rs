use std::path::Path;
use std::path::PathBuf;

use crate::FileSystem;

/// The real file system. Watcher snapshots are provided by the embedding
/// host's native watcher, not by this type.
#[derive(Default, Debug)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
  fn cwd(&self) -> std::io::Result<PathBuf> {
    std::env::current_dir()
  }

  fn exists(&self, path: &Path) -> std::io::Result<bool> {
    Ok(path.exists())
  }

  fn canonicalize(&self, path: &Path) -> std::io::Result<PathBuf> {
    std::fs::canonicalize(path)
  }

  fn create_dir_all(&self, path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
  }

  fn read(&self, path: &Path) -> std::io::Result<Vec<u8>> {
    std::fs::read(path)
  }

  fn read_to_string(&self, path: &Path) -> std::io::Result<String> {
    std::fs::read_to_string(path)
  }

  fn remove_file(&self, path: &Path) -> std::io::Result<()> {
    std::fs::remove_file(path)
  }

  fn write(&self, path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
  }

  fn is_file(&self, path: &Path) -> bool {
    path.is_file()
  }

  fn is_dir(&self, path: &Path) -> bool {
    path.is_dir()
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn reads_back_what_it_wrote() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("greeting.txt");

    let fs = OsFileSystem;
    fs.write(&path, b"hello").unwrap();

    assert!(fs.is_file(&path));
    assert_eq!(fs.read_to_string(&path).unwrap(), "hello");

    fs.remove_file(&path).unwrap();
    assert!(!fs.exists(&path).unwrap());
  }
}
