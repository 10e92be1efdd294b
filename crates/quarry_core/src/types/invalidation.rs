use std::path::PathBuf;

use bitflags::bitflags;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

bitflags! {
  /// Why a request's cached result is no longer trusted.
  ///
  /// Reasons accumulate across invalidations until the request completes
  /// successfully, at which point the set resets to [`InvalidateReason::VALID`].
  /// The bit values are written into the persisted request graph and must
  /// stay stable.
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
  pub struct InvalidateReason: u32 {
    const INITIAL_BUILD = 1 << 0;
    const FILE_CREATE = 1 << 1;
    const FILE_UPDATE = 1 << 2;
    const FILE_DELETE = 1 << 3;
    const ENV_CHANGE = 1 << 4;
    const OPTION_CHANGE = 1 << 5;
    const STARTUP = 1 << 6;
    const ERROR = 1 << 7;
  }
}

impl InvalidateReason {
  /// The empty set: the request's last run is trusted.
  pub const VALID: InvalidateReason = InvalidateReason::empty();
}

impl Serialize for InvalidateReason {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u32(self.bits())
  }
}

impl<'de> Deserialize<'de> for InvalidateReason {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let bits = u32::deserialize(deserializer)?;
    Ok(InvalidateReason::from_bits_retain(bits))
  }
}

/// A request's interest in the future creation of a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FileCreateInvalidation {
  /// Creation of any path matching the glob.
  Glob { glob: String },
  /// Creation of this exact path.
  FilePath { file_path: PathBuf },
  /// Creation of a file named `file_name` in any directory on the path
  /// from `above_file_path` up to the file system root. `file_name` may
  /// contain multiple `/`-separated segments, e.g. `node_modules/lodash`.
  FileNameAbove {
    file_name: String,
    above_file_path: PathBuf,
  },
}

/// One recorded dependency of a request, as reported back to request
/// implementations that ask what their previous run depended on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RequestInvalidation {
  File { file_path: PathBuf },
  Env { key: String },
  Option { key: String },
}
