use std::any::Any;
use std::fmt::Debug;
use std::hash::Hash;
use std::hash::Hasher;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use dyn_hash::DynHash;
use parking_lot::Mutex;
use petgraph::graph::NodeIndex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use quarry_core::types::FileCreateInvalidation;
use quarry_core::types::InvalidateReason;
use quarry_core::types::QuarryOptions;
use quarry_core::types::RequestInvalidation;
use quarry_filesystem::FileSystemRef;

use crate::worker_farm::WorkerFarmRef;

use super::request_graph::option_value_hash;
use super::request_tracker::RequestTrackerState;
use super::request_tracker::RunRequestOpts;

pub type RunRequestError = anyhow::Error;
pub type RequestId = u64;

/// Typed failures the tracker itself produces. Everything else that comes
/// out of [`RequestTracker::run_request`](super::RequestTracker::run_request)
/// is a request body error propagated unchanged.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
  /// A file-create interest was declared with degenerate input.
  #[error("invalid file invalidation")]
  InvalidInvalidation,
  /// The abort signal fired while a request was running. The request is
  /// left invalid so a later build retries it.
  #[error("build cancelled")]
  Cancelled,
  /// A request result was spilled to the cache but the entry is gone.
  #[error("missing cached result under key {key}")]
  MissingCachedResult { key: String },
}

/// Error fanned out to every waiter of an in-flight request. The original
/// error goes to the caller that ran the request; waiters get its message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct BroadcastRequestError {
  pub message: String,
}

/// Bound for values a request may produce: they move between concurrently
/// running requests and are persisted between builds.
pub trait RequestResult:
  Clone + Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> RequestResult for T where
  T: Clone + Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// A re-runnable unit of work. The struct's fields are its input; the id
/// is derived by hashing them together with the concrete type, so equal
/// requests deduplicate and changed inputs produce a new identity.
#[async_trait]
pub trait Request<R: RequestResult>: DynHash + Send + Sync + Debug + 'static {
  fn id(&self) -> RequestId {
    let mut hasher = quarry_core::hash::IdentifierHasher::default();
    self.type_id().hash(&mut hasher);
    self.dyn_hash(&mut hasher);
    hasher.finish()
  }

  /// Stable name for the request kind, stored on the graph node.
  fn request_type(&self) -> &'static str;

  async fn run(&self, context: RunRequestContext<R>) -> Result<R, RunRequestError>;
}

/// This is the API for requests to call back onto the tracker.
///
/// Internals stay hidden from request implementations so they can change;
/// everything a body declares while running flows through here into the
/// request graph, attributed to the request the context was built for.
pub struct RunRequestContext<R: RequestResult> {
  request_id: RequestId,
  node_id: NodeIndex,
  invalidate_reason: InvalidateReason,
  previous_invalidations: Vec<RequestInvalidation>,
  state: Arc<RequestTrackerState<R>>,
  sub_request_ids: Arc<Mutex<Vec<RequestId>>>,
  stored_result: Arc<AtomicBool>,
}

impl<R: RequestResult> RunRequestContext<R> {
  pub(crate) fn new(
    request_id: RequestId,
    node_id: NodeIndex,
    invalidate_reason: InvalidateReason,
    previous_invalidations: Vec<RequestInvalidation>,
    state: Arc<RequestTrackerState<R>>,
    sub_request_ids: Arc<Mutex<Vec<RequestId>>>,
    stored_result: Arc<AtomicBool>,
  ) -> Self {
    Self {
      request_id,
      node_id,
      invalidate_reason,
      previous_invalidations,
      state,
      sub_request_ids,
      stored_result,
    }
  }

  /// Why this run was triggered. `INITIAL_BUILD` for a request the graph
  /// has never completed.
  pub fn invalidate_reason(&self) -> InvalidateReason {
    self.invalidate_reason
  }

  pub fn options(&self) -> &Arc<QuarryOptions> {
    &self.state.options
  }

  pub fn file_system(&self) -> &FileSystemRef {
    &self.state.file_system
  }

  pub fn farm(&self) -> Option<&WorkerFarmRef> {
    self.state.farm.as_ref()
  }

  /// Re-run this request when `file_path` changes.
  pub fn invalidate_on_file_update(&self, file_path: impl AsRef<Path>) {
    self
      .state
      .graph
      .write()
      .invalidate_on_file_update(self.node_id, file_path.as_ref());
  }

  /// Re-run this request when `file_path` is deleted.
  pub fn invalidate_on_file_delete(&self, file_path: impl AsRef<Path>) {
    self
      .state
      .graph
      .write()
      .invalidate_on_file_delete(self.node_id, file_path.as_ref());
  }

  /// Re-run this request when a path matching `input` is created.
  pub fn invalidate_on_file_create(&self, input: &FileCreateInvalidation) -> anyhow::Result<()> {
    self
      .state
      .graph
      .write()
      .invalidate_on_file_create(self.node_id, input)
  }

  /// Re-run this request on every startup.
  pub fn invalidate_on_startup(&self) -> anyhow::Result<()> {
    self.state.graph.write().invalidate_on_startup(self.node_id)
  }

  /// Re-run this request when the named environment variable changes. The
  /// current value is read from the tracker's options.
  pub fn invalidate_on_env_change(&self, key: &str) {
    let value = self.state.options.env.get(key).cloned();
    self
      .state
      .graph
      .write()
      .invalidate_on_env_change(self.node_id, key, value);
  }

  /// Re-run this request when the named option changes.
  pub fn invalidate_on_option_change(&self, key: &str) {
    let hash = option_value_hash(&self.state.options, key);
    self
      .state
      .graph
      .write()
      .invalidate_on_option_change(self.node_id, key, hash);
  }

  /// The update-kind dependencies the previous run declared, captured
  /// before this run cleared them. Later declarations do not appear.
  pub fn get_invalidations(&self) -> Vec<RequestInvalidation> {
    self.previous_invalidations.clone()
  }

  /// Stores the result explicitly. With a `cache_key` the result is
  /// spilled to the object cache when the graph is persisted, keeping the
  /// graph blob small.
  pub fn store_result(&self, result: R, cache_key: Option<String>) -> anyhow::Result<()> {
    self.stored_result.store(true, Ordering::Relaxed);
    self
      .state
      .graph
      .write()
      .store_result(self.node_id, result, cache_key)
  }

  /// The sub-requests this request depended on after its last completed
  /// run.
  pub fn get_sub_requests(&self) -> Vec<RequestId> {
    self.state.graph.read().sub_requests(self.node_id)
  }

  /// This request's own result from its previous completed run, if any.
  pub async fn previous_result(&self) -> anyhow::Result<Option<R>> {
    self.state.result_of(self.request_id).await
  }

  /// Another request's stored result, fetching from the object cache when
  /// it was spilled there.
  pub async fn get_request_result(&self, id: RequestId) -> anyhow::Result<Option<R>> {
    self.state.result_of(id).await
  }

  /// Whether the sub-request's cached result is still valid. When it is,
  /// the dependency edge is recorded anyway so the relationship survives
  /// even though the sub-request never runs.
  pub fn can_skip_subrequest(&self, id: RequestId) -> bool {
    if self.state.graph.read().has_valid_result(id) {
      self.record_sub_request(id);
      true
    } else {
      false
    }
  }

  /// Runs a sub-request, creating a dependency edge from this request to
  /// it. Returns the cached result when the sub-request is still valid.
  pub async fn run_request(
    &self,
    request: impl Request<R>,
    opts: RunRequestOpts,
  ) -> anyhow::Result<R> {
    let request_id = request.id();
    self.record_sub_request(request_id);
    self.state.clone().run(Box::new(request), opts).await
  }

  fn record_sub_request(&self, id: RequestId) {
    let mut sub_request_ids = self.sub_request_ids.lock();
    if !sub_request_ids.contains(&id) {
      sub_request_ids.push(id);
    }
  }
}
