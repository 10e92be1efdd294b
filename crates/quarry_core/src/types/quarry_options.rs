use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// The options passed into quarry either through the CLI or the
/// programmatic API.
///
/// The tracker compares these between runs: any option a request declared
/// interest in is re-hashed on startup against the value stored in the
/// request graph.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QuarryOptions {
  pub entries: Vec<String>,

  /// The resolved environment requests read from. Kept separate from the
  /// process environment so hosts can scope what builds may observe.
  pub env: BTreeMap<String, String>,

  pub mode: BuildMode,

  pub log_level: LogLevel,

  pub project_root: PathBuf,

  pub cache_dir: PathBuf,

  pub threads: Option<usize>,

  pub should_disable_cache: bool,
}

impl QuarryOptions {
  /// Looks up a possibly dotted option path in the serialized form of the
  /// options, e.g. `"mode"` or `"logLevel"`.
  pub fn value_at(&self, path: &str) -> Option<serde_json::Value> {
    let root = serde_json::to_value(self).ok()?;
    let mut value = &root;
    for segment in path.split('.') {
      value = value.get(segment)?;
    }
    Some(value.clone())
  }
}

#[derive(Clone, Debug, Default, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
  #[default]
  Development,
  Production,
}

impl Display for BuildMode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      BuildMode::Development => write!(f, "development"),
      BuildMode::Production => write!(f, "production"),
    }
  }
}

#[derive(Clone, Debug, Default, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
  Error,
  Warn,
  #[default]
  Info,
  Verbose,
}

#[cfg(test)]
mod test {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn value_at_resolves_scalar_options() {
    let options = QuarryOptions {
      mode: BuildMode::Production,
      ..Default::default()
    };

    assert_eq!(
      options.value_at("mode"),
      Some(serde_json::Value::String("production".into()))
    );
    assert_eq!(options.value_at("noSuchOption"), None);
  }

  #[test]
  fn value_at_resolves_nested_paths() {
    let options = QuarryOptions {
      env: BTreeMap::from([("NODE_ENV".to_string(), "test".to_string())]),
      ..Default::default()
    };

    assert_eq!(
      options.value_at("env.NODE_ENV"),
      Some(serde_json::Value::String("test".into()))
    );
  }
}
