use std::sync::Arc;

use quarry_cache::CacheRef;
use quarry_cache::InMemoryCache;
use quarry_core::types::QuarryOptions;
use quarry_filesystem::FileSystemRef;
use quarry_filesystem::InMemoryFileSystem;

use crate::request_tracker::AbortSignal;
use crate::request_tracker::RequestResult;
use crate::request_tracker::RequestTracker;
use crate::worker_farm::WorkerFarmRef;

pub struct RequestTrackerTestOptions {
  pub cache: CacheRef,
  pub fs: FileSystemRef,
  pub farm: Option<WorkerFarmRef>,
  pub options: QuarryOptions,
  pub signal: Option<AbortSignal>,
}

impl Default for RequestTrackerTestOptions {
  fn default() -> Self {
    Self {
      cache: Arc::new(InMemoryCache::default()),
      fs: Arc::new(InMemoryFileSystem::default()),
      farm: None,
      options: QuarryOptions {
        project_root: "/".into(),
        cache_dir: "/.quarry-cache".into(),
        ..Default::default()
      },
      signal: None,
    }
  }
}

pub fn request_tracker<R: RequestResult>(
  test_options: RequestTrackerTestOptions,
) -> RequestTracker<R> {
  let RequestTrackerTestOptions {
    cache,
    fs,
    farm,
    options,
    signal,
  } = test_options;

  RequestTracker::new(cache, fs, Arc::new(options), farm, signal)
}
