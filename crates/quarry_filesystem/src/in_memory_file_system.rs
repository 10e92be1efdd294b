use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use parking_lot::RwLock;

use crate::FileSystem;
use crate::WatchEvent;
use crate::WatchEvents;
use crate::WatcherOptions;

/// In-memory file system used in tests and tooling.
///
/// Every mutation is appended to an event journal. Snapshots record the
/// journal position, so [`FileSystem::events_since`] replays exactly the
/// changes that happened after the snapshot was taken, matching the
/// contract the native watcher provides for the real file system.
#[derive(Default)]
pub struct InMemoryFileSystem {
  files: RwLock<HashMap<PathBuf, Vec<u8>>>,
  events: RwLock<WatchEvents>,
}

impl InMemoryFileSystem {
  /// Writes a file and journals the change.
  pub fn write_file(&self, path: &Path, contents: impl Into<Vec<u8>>) {
    let existed = {
      let mut files = self.files.write();
      files.insert(path.to_path_buf(), contents.into()).is_some()
    };
    let event = if existed {
      WatchEvent::Update(path.to_path_buf())
    } else {
      WatchEvent::Create(path.to_path_buf())
    };
    self.events.write().push(event);
  }

  /// Deletes a file and journals the change.
  pub fn delete_file(&self, path: &Path) {
    let existed = self.files.write().remove(path).is_some();
    if existed {
      self.events.write().push(WatchEvent::Delete(path.to_path_buf()));
    }
  }
}

fn is_ignored(path: &Path, opts: &WatcherOptions) -> bool {
  opts
    .ignore
    .iter()
    .filter(|prefix| !prefix.as_os_str().is_empty())
    .any(|prefix| path.starts_with(prefix))
}

impl FileSystem for InMemoryFileSystem {
  fn cwd(&self) -> io::Result<PathBuf> {
    Ok(PathBuf::from("/"))
  }

  fn exists(&self, path: &Path) -> io::Result<bool> {
    Ok(self.files.read().contains_key(path))
  }

  fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
    Ok(path.to_path_buf())
  }

  fn create_dir_all(&self, _path: &Path) -> io::Result<()> {
    Ok(())
  }

  fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
    self
      .files
      .read()
      .get(path)
      .cloned()
      .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{}", path.display())))
  }

  fn read_to_string(&self, path: &Path) -> io::Result<String> {
    let bytes = self.read(path)?;
    String::from_utf8(bytes).map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))
  }

  fn remove_file(&self, path: &Path) -> io::Result<()> {
    self.delete_file(path);
    Ok(())
  }

  fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
    self.write_file(path, contents.to_vec());
    Ok(())
  }

  fn is_file(&self, path: &Path) -> bool {
    self.files.read().contains_key(path)
  }

  fn is_dir(&self, path: &Path) -> bool {
    let files = self.files.read();
    files.keys().any(|file| file.starts_with(path) && file != path)
  }

  fn write_snapshot(
    &self,
    _root: &Path,
    snapshot_path: &Path,
    _opts: &WatcherOptions,
  ) -> io::Result<()> {
    let position = self.events.read().len();
    // Written directly so the snapshot itself never shows up in the journal.
    self
      .files
      .write()
      .insert(snapshot_path.to_path_buf(), position.to_string().into_bytes());
    Ok(())
  }

  fn events_since(
    &self,
    _root: &Path,
    snapshot_path: &Path,
    opts: &WatcherOptions,
  ) -> io::Result<WatchEvents> {
    let position: usize = {
      let contents = self.read_to_string(snapshot_path)?;
      contents
        .parse()
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, format!("{}", error)))?
    };

    let events = self.events.read();
    Ok(
      events
        .iter()
        .skip(position)
        .filter(|event| !is_ignored(event.path(), opts))
        .cloned()
        .collect(),
    )
  }
}
