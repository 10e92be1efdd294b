use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use quarry_cache::CacheRef;
use quarry_core::hash::hash_identifier;
use quarry_core::types::InvalidateReason;
use quarry_core::types::QuarryOptions;
use quarry_filesystem::FileSystemRef;
use quarry_filesystem::WatchEvents;
use quarry_filesystem::WatcherOptions;

use crate::worker_farm::WorkerFarmRef;

use super::request::BroadcastRequestError;
use super::request::Request;
use super::request::RequestId;
use super::request::RequestResult;
use super::request::RunRequestContext;
use super::request::TrackerError;
use super::request_graph::RequestGraph;

/// Cooperative cancellation flag shared between the build driver and the
/// tracker. Request bodies are expected to observe it too; the tracker
/// checks it once a body resolves.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal {
  aborted: Arc<AtomicBool>,
}

impl AbortSignal {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn abort(&self) {
    self.aborted.store(true, Ordering::Relaxed);
  }

  pub fn aborted(&self) -> bool {
    self.aborted.load(Ordering::Relaxed)
  }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RunRequestOpts {
  /// Run the body even when a valid cached result exists.
  pub force: bool,
}

/// [`RequestTracker`] runs build work items and memoizes their results in
/// a persistent graph of their dependencies.
///
/// A top-level request either returns its cached result or runs with a
/// fresh [`RunRequestContext`]. While running, the body declares the
/// files, globs, environment variables and options it depends on, and may
/// run sub-requests; each declaration becomes an edge in the graph. On
/// the next build only the requests whose recorded inputs changed are
/// re-run.
#[derive(Clone)]
pub struct RequestTracker<R: RequestResult> {
  state: Arc<RequestTrackerState<R>>,
}

pub(crate) struct RequestTrackerState<R: RequestResult> {
  pub(crate) graph: RwLock<RequestGraph<R>>,
  pub(crate) pending: Mutex<HashMap<RequestId, broadcast::Sender<Result<R, BroadcastRequestError>>>>,
  pub(crate) cache: CacheRef,
  pub(crate) file_system: FileSystemRef,
  pub(crate) farm: Option<WorkerFarmRef>,
  pub(crate) options: Arc<QuarryOptions>,
  pub(crate) signal: Option<AbortSignal>,
}

pub(crate) fn graph_cache_key(options: &QuarryOptions) -> String {
  let entries = serde_json::to_string(&options.entries).unwrap_or_default();
  hash_identifier(&(env!("CARGO_PKG_VERSION"), entries))
}

impl<R: RequestResult> RequestTracker<R> {
  /// A tracker over an empty graph.
  pub fn new(
    cache: CacheRef,
    file_system: FileSystemRef,
    options: Arc<QuarryOptions>,
    farm: Option<WorkerFarmRef>,
    signal: Option<AbortSignal>,
  ) -> Self {
    Self {
      state: Arc::new(RequestTrackerState {
        graph: RwLock::new(RequestGraph::new()),
        pending: Mutex::new(HashMap::new()),
        cache,
        file_system,
        farm,
        options,
        signal,
      }),
    }
  }

  /// Restores the tracker from the cache and reconciles everything that
  /// changed while the process was not running: unpredictable requests,
  /// environment variables, options, and file system events accumulated
  /// since the snapshot. Starts from an empty graph when caching is
  /// disabled or nothing was persisted.
  #[tracing::instrument(level = "info", skip_all)]
  pub async fn init(
    cache: CacheRef,
    file_system: FileSystemRef,
    options: Arc<QuarryOptions>,
    farm: Option<WorkerFarmRef>,
    signal: Option<AbortSignal>,
  ) -> anyhow::Result<Self> {
    let tracker = Self::new(cache, file_system, options, farm, signal);
    tracker.load_request_graph().await?;
    Ok(tracker)
  }

  async fn load_request_graph(&self) -> anyhow::Result<()> {
    if self.state.options.should_disable_cache {
      return Ok(());
    }

    let graph_key = format!("{}:request_graph", graph_cache_key(&self.state.options));
    let Some(blob) = self.state.cache.get_blob(&graph_key).await? else {
      tracing::debug!(%graph_key, "No persisted request graph");
      return Ok(());
    };
    let mut graph: RequestGraph<R> = bincode::deserialize(&blob)?;

    let events = self.state.file_system.events_since(
      &self.state.options.project_root,
      &self.snapshot_path(),
      &self.watcher_options(),
    )?;
    tracing::debug!("Reconciling {} events since the snapshot", events.len());

    graph.invalidate_unpredictable_nodes()?;
    graph.invalidate_env_nodes(&self.state.options.env)?;
    graph.invalidate_option_nodes(&self.state.options)?;
    graph.respond_to_fs_events(&events)?;

    *self.state.graph.write() = graph;
    Ok(())
  }

  /// Persists the graph and a watcher snapshot so the next process can
  /// pick up where this one left off.
  #[tracing::instrument(level = "info", skip_all)]
  pub async fn write_to_cache(&self) -> anyhow::Result<()> {
    if self.state.options.should_disable_cache {
      return Ok(());
    }

    let spilled = self.state.graph.write().take_spilled_results()?;
    for (cache_key, blob) in spilled {
      self.state.cache.set_blob(&cache_key, &blob).await?;
    }

    let blob = {
      let graph = self.state.graph.read();
      bincode::serialize(&*graph)?
    };
    let graph_key = format!("{}:request_graph", graph_cache_key(&self.state.options));
    self.state.cache.set_blob(&graph_key, &blob).await?;

    self.state.file_system.write_snapshot(
      &self.state.options.project_root,
      &self.snapshot_path(),
      &self.watcher_options(),
    )?;
    Ok(())
  }

  fn snapshot_path(&self) -> PathBuf {
    let key = format!("{}:snapshot", graph_cache_key(&self.state.options));
    self.state.cache.cache_path(&key, ".txt")
  }

  fn watcher_options(&self) -> WatcherOptions {
    let root = &self.state.options.project_root;
    WatcherOptions {
      ignore: vec![
        self.state.options.cache_dir.clone(),
        root.join(".git"),
        root.join(".hg"),
      ],
    }
  }

  /// Runs a top-level request, returning its cached result when nothing
  /// it depends on changed.
  pub async fn run_request(&self, request: impl Request<R>) -> anyhow::Result<R> {
    self
      .state
      .clone()
      .run(Box::new(request), RunRequestOpts::default())
      .await
  }

  pub async fn run_request_with(
    &self,
    request: impl Request<R>,
    opts: RunRequestOpts,
  ) -> anyhow::Result<R> {
    self.state.clone().run(Box::new(request), opts).await
  }

  /// Applies a batch of watcher events to the graph. Returns whether a
  /// rebuild is needed.
  #[tracing::instrument(level = "info", skip_all)]
  pub fn respond_to_fs_events(&self, events: &WatchEvents) -> anyhow::Result<bool> {
    tracing::info!("Responding to {} watch events", events.len());
    self.state.graph.write().respond_to_fs_events(events)
  }

  pub fn has_invalid_requests(&self) -> bool {
    self.state.graph.read().has_invalid_requests()
  }

  pub fn has_valid_result(&self, id: RequestId) -> bool {
    self.state.graph.read().has_valid_result(id)
  }

  /// The reasons the request accumulated since its last successful
  /// completion; empty while its result is trusted.
  pub fn invalidate_reason(&self, id: RequestId) -> Option<InvalidateReason> {
    self.state.graph.read().invalidate_reason(id)
  }

  /// The sub-requests recorded for the request's last run.
  pub fn sub_request_ids(&self, id: RequestId) -> Vec<RequestId> {
    let graph = self.state.graph.read();
    match graph.request_node_id(id) {
      Some(node_id) => graph.sub_requests(node_id),
      None => Vec::new(),
    }
  }

  /// A request's stored result, fetched from the object cache when it was
  /// spilled there.
  pub async fn get_request_result(&self, id: RequestId) -> anyhow::Result<Option<R>> {
    self.state.result_of(id).await
  }
}

impl<R: RequestResult> RequestTrackerState<R> {
  pub(crate) async fn run(
    self: Arc<Self>,
    request: Box<dyn Request<R>>,
    opts: RunRequestOpts,
  ) -> anyhow::Result<R> {
    let request_id = request.id();
    tracing::trace!(request_id, "Run request {:?}", request);

    if !opts.force && self.graph.read().has_valid_result(request_id) {
      return self.cached_result(request_id).await;
    }

    // Coalesce with an already running instance of the same request. The
    // valid-result check repeats under the pending lock: the in-flight run
    // may have finished between the check above and here.
    enum Claim<R> {
      Run,
      Wait(broadcast::Receiver<Result<R, BroadcastRequestError>>),
      Cached,
    }

    let claim = {
      let mut pending = self.pending.lock();
      if let Some(sender) = pending.get(&request_id) {
        Claim::Wait(sender.subscribe())
      } else if !opts.force && self.graph.read().has_valid_result(request_id) {
        Claim::Cached
      } else {
        let (sender, _) = broadcast::channel(1);
        pending.insert(request_id, sender);
        Claim::Run
      }
    };
    match claim {
      Claim::Cached => return self.cached_result(request_id).await,
      Claim::Wait(mut receiver) => {
        tracing::trace!(request_id, "Waiting on in-flight request");
        return match receiver.recv().await {
          Ok(Ok(result)) => Ok(result),
          Ok(Err(error)) => Err(error.into()),
          Err(_) => Err(anyhow!("In-flight request dropped without a result")),
        };
      }
      Claim::Run => {}
    }

    let outcome = self.clone().run_and_store(request, request_id).await;

    // The result is stored before the entry is removed, so later callers
    // that miss the channel find it on the graph.
    let sender = self.pending.lock().remove(&request_id);
    if let Some(sender) = sender {
      let shared = match &outcome {
        Ok(result) => Ok(result.clone()),
        Err(error) => Err(BroadcastRequestError {
          message: error.to_string(),
        }),
      };
      let _ = sender.send(shared);
    }

    outcome
  }

  async fn run_and_store(
    self: Arc<Self>,
    request: Box<dyn Request<R>>,
    request_id: RequestId,
  ) -> anyhow::Result<R> {
    let (node_id, invalidate_reason, previous_invalidations) = {
      let mut graph = self.graph.write();
      let previous_invalidations = graph
        .request_node_id(request_id)
        .map(|node_id| graph.invalidations(node_id))
        .unwrap_or_default();
      let node_id = graph.start_request(request_id, request.request_type())?;
      let invalidate_reason = graph.request_node(node_id)?.invalidate_reason;
      (node_id, invalidate_reason, previous_invalidations)
    };

    let sub_request_ids = Arc::new(Mutex::new(Vec::new()));
    let stored_result = Arc::new(AtomicBool::new(false));
    let context = RunRequestContext::new(
      request_id,
      node_id,
      invalidate_reason,
      previous_invalidations,
      self.clone(),
      sub_request_ids.clone(),
      stored_result.clone(),
    );

    let run_result = request.run(context).await;

    let run_result = match run_result {
      Ok(result) => {
        if self.signal.as_ref().is_some_and(|signal| signal.aborted()) {
          Err(TrackerError::Cancelled.into())
        } else {
          Ok(result)
        }
      }
      Err(error) => Err(error),
    };

    let outcome = match run_result {
      Ok(result) => {
        let mut graph = self.graph.write();
        let stored = if stored_result.load(Ordering::Relaxed) {
          Ok(())
        } else {
          graph.store_result(node_id, result.clone(), None)
        };
        stored
          .and_then(|_| graph.complete_request(node_id))
          .map(|_| result)
      }
      Err(error) => {
        tracing::debug!(request_id, "Request failed: {error}");
        if let Err(reject_error) = self.graph.write().reject_request(node_id) {
          tracing::error!(request_id, "Failed to mark request rejected: {reject_error}");
        }
        Err(error)
      }
    };

    // Sub-request edges always reflect what the run observed, whether it
    // succeeded, failed or was cancelled.
    let recorded = sub_request_ids.lock().clone();
    let replaced = self.graph.write().replace_subrequests(node_id, &recorded);

    match (outcome, replaced) {
      (Ok(result), Ok(())) => Ok(result),
      (Ok(_), Err(error)) => Err(error),
      (Err(error), _) => Err(error),
    }
  }

  /// A request's stored result. Results spilled to the object cache are
  /// fetched, cached back onto the node, and returned.
  pub(crate) async fn result_of(&self, request_id: RequestId) -> anyhow::Result<Option<R>> {
    let (inline, cache_key) = {
      let graph = self.graph.read();
      let Some(node_id) = graph.request_node_id(request_id) else {
        return Ok(None);
      };
      let node = graph.request_node(node_id)?;
      (node.result.clone(), node.result_cache_key.clone())
    };

    if inline.is_some() {
      return Ok(inline);
    }
    let Some(cache_key) = cache_key else {
      return Ok(None);
    };

    let Some(blob) = self.cache.get_blob(&cache_key).await? else {
      return Err(TrackerError::MissingCachedResult { key: cache_key }.into());
    };
    let result: R = bincode::deserialize(&blob)?;

    let mut graph = self.graph.write();
    if let Some(node_id) = graph.request_node_id(request_id) {
      graph.store_result(node_id, result.clone(), Some(cache_key))?;
    }
    Ok(Some(result))
  }

  async fn cached_result(&self, request_id: RequestId) -> anyhow::Result<R> {
    match self.result_of(request_id).await? {
      Some(result) => Ok(result),
      None => Err(anyhow!(
        "Request {} is valid but has no stored result",
        request_id
      )),
    }
  }
}
