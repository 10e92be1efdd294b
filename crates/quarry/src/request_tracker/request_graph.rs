use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use anyhow::anyhow;
use glob_match::glob_match;
use petgraph::graph::NodeIndex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use quarry_core::hash::hash_identifier;
use quarry_core::types::FileCreateInvalidation;
use quarry_core::types::InvalidateReason;
use quarry_core::types::QuarryOptions;
use quarry_core::types::RequestInvalidation;
use quarry_filesystem::WatchEvent;
use quarry_filesystem::WatchEvents;

use super::content_graph::ContentGraph;
use super::request::RequestId;
use super::request::TrackerError;

/// Edges of the request graph. Each kind encodes its own invalidation
/// semantics, applied by [`RequestGraph::respond_to_fs_events`] and the
/// startup rechecks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestEdgeType {
  /// Parent request depends on child request.
  SubRequest,
  /// Request -> file/env/option: an update to the target invalidates.
  InvalidatedByUpdate,
  /// Request -> file: deleting the target invalidates.
  InvalidatedByDelete,
  /// Request -> file/glob: creating a matching path invalidates.
  InvalidatedByCreate,
  /// Marks the two ends of a file-name chain: anchor file -> basename
  /// segment, and outermost segment -> anchor file.
  InvalidatedByCreateAbove,
  /// File-name segment -> parent segment.
  Dirname,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvNode {
  pub key: String,
  pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionNode {
  pub key: String,
  pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestNode<R> {
  pub id: RequestId,
  pub request_type: String,
  pub result: Option<R>,
  pub result_cache_key: Option<String>,
  pub invalidate_reason: InvalidateReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestGraphNode<R> {
  File(PathBuf),
  Glob(String),
  FileName(String),
  Env(EnvNode),
  Option(OptionNode),
  Request(RequestNode<R>),
}

pub fn request_content_key(id: RequestId) -> String {
  format!("{:016x}", id)
}

fn file_content_key(path: &Path) -> String {
  path.to_string_lossy().into_owned()
}

fn file_name_content_key(name: &str) -> String {
  format!("file_name:{}", name)
}

fn env_content_key(key: &str) -> String {
  format!("env:{}", key)
}

fn option_content_key(key: &str) -> String {
  format!("option:{}", key)
}

pub(crate) fn option_value_hash(options: &QuarryOptions, key: &str) -> String {
  let value = options.value_at(key).unwrap_or(serde_json::Value::Null);
  hash_identifier(&value.to_string())
}

/// The typed dependency graph: request nodes plus the file, glob,
/// file-name, environment and option nodes they registered interest in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "R: Serialize", deserialize = "R: DeserializeOwned"))]
pub struct RequestGraph<R> {
  graph: ContentGraph<RequestGraphNode<R>, RequestEdgeType>,
  invalid_node_ids: HashSet<NodeIndex>,
  incomplete_node_ids: HashSet<NodeIndex>,
  glob_node_ids: HashSet<NodeIndex>,
  env_node_ids: HashSet<NodeIndex>,
  option_node_ids: HashSet<NodeIndex>,
  unpredictable_node_ids: HashSet<NodeIndex>,
}

impl<R> Default for RequestGraph<R> {
  fn default() -> Self {
    Self::new()
  }
}

impl<R> RequestGraph<R> {
  pub fn new() -> Self {
    Self {
      graph: ContentGraph::new(),
      invalid_node_ids: HashSet::new(),
      incomplete_node_ids: HashSet::new(),
      glob_node_ids: HashSet::new(),
      env_node_ids: HashSet::new(),
      option_node_ids: HashSet::new(),
      unpredictable_node_ids: HashSet::new(),
    }
  }

  /// Adds a node, keeping the kind-partitioned id sets in sync. Re-adding
  /// an existing env or option node refreshes its stored value so a
  /// changed value stops invalidating dependents once they re-ran.
  fn add_node(&mut self, content_key: &str, node: RequestGraphNode<R>) -> NodeIndex {
    if let Some(node_id) = self.graph.node_id_from_content_key(content_key) {
      match (node, self.graph.node_mut(node_id)) {
        (RequestGraphNode::Env(next), Some(RequestGraphNode::Env(current))) => {
          current.value = next.value;
        }
        (RequestGraphNode::Option(next), Some(RequestGraphNode::Option(current))) => {
          current.hash = next.hash;
        }
        _ => {}
      }
      return node_id;
    }

    let node_id = self.graph.add_node_by_content_key(content_key, node);
    match self.graph.node(node_id) {
      Some(RequestGraphNode::Glob(_)) => {
        self.glob_node_ids.insert(node_id);
      }
      Some(RequestGraphNode::Env(_)) => {
        self.env_node_ids.insert(node_id);
      }
      Some(RequestGraphNode::Option(_)) => {
        self.option_node_ids.insert(node_id);
      }
      _ => {}
    }
    node_id
  }

  /// Removes a node and purges it from every side index.
  pub fn remove_node(&mut self, node_id: NodeIndex) {
    self.invalid_node_ids.remove(&node_id);
    self.incomplete_node_ids.remove(&node_id);
    self.glob_node_ids.remove(&node_id);
    self.env_node_ids.remove(&node_id);
    self.option_node_ids.remove(&node_id);
    self.unpredictable_node_ids.remove(&node_id);
    self.graph.remove_node(node_id);
  }

  pub fn request_node_id(&self, id: RequestId) -> Option<NodeIndex> {
    self.graph.node_id_from_content_key(&request_content_key(id))
  }

  pub fn request_node(&self, node_id: NodeIndex) -> anyhow::Result<&RequestNode<R>> {
    match self.graph.node(node_id) {
      Some(RequestGraphNode::Request(request)) => Ok(request),
      Some(_) => Err(anyhow!("Node {} is not a request node", node_id.index())),
      None => Err(anyhow!("Missing node {}", node_id.index())),
    }
  }

  fn request_node_mut(&mut self, node_id: NodeIndex) -> anyhow::Result<&mut RequestNode<R>> {
    match self.graph.node_mut(node_id) {
      Some(RequestGraphNode::Request(request)) => Ok(request),
      Some(_) => Err(anyhow!("Node {} is not a request node", node_id.index())),
      None => Err(anyhow!("Missing node {}", node_id.index())),
    }
  }

  /// Marks a request's last run untrusted, recording `reason`, and walks
  /// up `SubRequest` edges: a parent whose child is invalid is invalid.
  pub fn invalidate_node(
    &mut self,
    node_id: NodeIndex,
    reason: InvalidateReason,
  ) -> anyhow::Result<()> {
    let already_invalid = self.invalid_node_ids.contains(&node_id);
    let node = self.request_node_mut(node_id)?;
    if already_invalid && node.invalidate_reason.contains(reason) {
      // Also breaks cycles of mutually dependent requests.
      return Ok(());
    }
    node.invalidate_reason |= reason;
    self.invalid_node_ids.insert(node_id);

    for parent_node_id in self
      .graph
      .node_ids_connected_to(node_id, &RequestEdgeType::SubRequest)
    {
      self.invalidate_node(parent_node_id, reason)?;
    }
    Ok(())
  }

  /// Invalidates every request that asked to re-run on startup.
  pub fn invalidate_unpredictable_nodes(&mut self) -> anyhow::Result<()> {
    for node_id in self.unpredictable_node_ids.clone() {
      self.invalidate_node(node_id, InvalidateReason::STARTUP)?;
    }
    Ok(())
  }

  /// Compares every env node against `env` and invalidates dependents of
  /// the ones whose value changed.
  pub fn invalidate_env_nodes(&mut self, env: &BTreeMap<String, String>) -> anyhow::Result<()> {
    for node_id in self.env_node_ids.clone() {
      let (key, value) = match self.graph.node(node_id) {
        Some(RequestGraphNode::Env(env_node)) => (env_node.key.clone(), env_node.value.clone()),
        _ => return Err(anyhow!("Expected an env node at {}", node_id.index())),
      };
      if env.get(&key) != value.as_ref() {
        tracing::debug!(%key, "Environment variable changed since the last run");
        for parent_node_id in self
          .graph
          .node_ids_connected_to(node_id, &RequestEdgeType::InvalidatedByUpdate)
        {
          self.invalidate_node(parent_node_id, InvalidateReason::ENV_CHANGE)?;
        }
      }
    }
    Ok(())
  }

  /// Compares every option node's stored hash against the current options
  /// and invalidates dependents of the ones that differ.
  pub fn invalidate_option_nodes(&mut self, options: &QuarryOptions) -> anyhow::Result<()> {
    for node_id in self.option_node_ids.clone() {
      let (key, hash) = match self.graph.node(node_id) {
        Some(RequestGraphNode::Option(option_node)) => {
          (option_node.key.clone(), option_node.hash.clone())
        }
        _ => return Err(anyhow!("Expected an option node at {}", node_id.index())),
      };
      if option_value_hash(options, &key) != hash {
        tracing::debug!(%key, "Option changed since the last run");
        for parent_node_id in self
          .graph
          .node_ids_connected_to(node_id, &RequestEdgeType::InvalidatedByUpdate)
        {
          self.invalidate_node(parent_node_id, InvalidateReason::OPTION_CHANGE)?;
        }
      }
    }
    Ok(())
  }

  /// Drops the request's declared invalidations so the next run can
  /// rebuild them from scratch.
  pub fn clear_invalidations(&mut self, node_id: NodeIndex) -> anyhow::Result<()> {
    self.request_node(node_id)?;
    self.unpredictable_node_ids.remove(&node_id);
    self
      .graph
      .replace_node_ids_connected_to(node_id, &[], RequestEdgeType::InvalidatedByUpdate);
    self
      .graph
      .replace_node_ids_connected_to(node_id, &[], RequestEdgeType::InvalidatedByDelete);
    self
      .graph
      .replace_node_ids_connected_to(node_id, &[], RequestEdgeType::InvalidatedByCreate);
    Ok(())
  }

  pub fn invalidate_on_file_update(&mut self, request_node_id: NodeIndex, file_path: &Path) {
    let file_node_id = self.add_node(
      &file_content_key(file_path),
      RequestGraphNode::File(file_path.to_path_buf()),
    );
    self
      .graph
      .add_edge(request_node_id, file_node_id, RequestEdgeType::InvalidatedByUpdate);
  }

  pub fn invalidate_on_file_delete(&mut self, request_node_id: NodeIndex, file_path: &Path) {
    let file_node_id = self.add_node(
      &file_content_key(file_path),
      RequestGraphNode::File(file_path.to_path_buf()),
    );
    self
      .graph
      .add_edge(request_node_id, file_node_id, RequestEdgeType::InvalidatedByDelete);
  }

  pub fn invalidate_on_file_create(
    &mut self,
    request_node_id: NodeIndex,
    input: &FileCreateInvalidation,
  ) -> anyhow::Result<()> {
    let node_id = match input {
      FileCreateInvalidation::Glob { glob } => {
        if glob.is_empty() {
          return Err(TrackerError::InvalidInvalidation.into());
        }
        self.add_node(glob, RequestGraphNode::Glob(glob.clone()))
      }
      FileCreateInvalidation::FilePath { file_path } => self.add_node(
        &file_content_key(file_path),
        RequestGraphNode::File(file_path.clone()),
      ),
      FileCreateInvalidation::FileNameAbove {
        file_name,
        above_file_path,
      } => {
        if file_name.is_empty() {
          return Err(TrackerError::InvalidInvalidation.into());
        }
        // Chain the reversed segments with dirname edges. Requests
        // watching the same name share these segment nodes.
        let mut first_node_id = None;
        let mut last_node_id: Option<NodeIndex> = None;
        for part in file_name.split('/').rev() {
          let file_name_node_id = self.add_node(
            &file_name_content_key(part),
            RequestGraphNode::FileName(part.to_string()),
          );
          if let Some(last) = last_node_id {
            self
              .graph
              .add_edge(last, file_name_node_id, RequestEdgeType::Dirname);
          }
          if first_node_id.is_none() {
            first_node_id = Some(file_name_node_id);
          }
          last_node_id = Some(file_name_node_id);
        }
        let (Some(first), Some(last)) = (first_node_id, last_node_id) else {
          return Err(TrackerError::InvalidInvalidation.into());
        };

        let file_node_id = self.add_node(
          &file_content_key(above_file_path),
          RequestGraphNode::File(above_file_path.clone()),
        );
        // Anchor -> basename segment marks the start of the chain,
        // outermost segment -> anchor marks its end.
        self
          .graph
          .add_edge(file_node_id, first, RequestEdgeType::InvalidatedByCreateAbove);
        self
          .graph
          .add_edge(last, file_node_id, RequestEdgeType::InvalidatedByCreateAbove);
        file_node_id
      }
    };

    self
      .graph
      .add_edge(request_node_id, node_id, RequestEdgeType::InvalidatedByCreate);
    Ok(())
  }

  /// Marks the request as unpredictable: it re-runs on every startup.
  pub fn invalidate_on_startup(&mut self, request_node_id: NodeIndex) -> anyhow::Result<()> {
    self.request_node(request_node_id)?;
    self.unpredictable_node_ids.insert(request_node_id);
    Ok(())
  }

  pub fn invalidate_on_env_change(
    &mut self,
    request_node_id: NodeIndex,
    key: &str,
    value: Option<String>,
  ) {
    let env_node_id = self.add_node(
      &env_content_key(key),
      RequestGraphNode::Env(EnvNode {
        key: key.to_string(),
        value,
      }),
    );
    self
      .graph
      .add_edge(request_node_id, env_node_id, RequestEdgeType::InvalidatedByUpdate);
  }

  pub fn invalidate_on_option_change(
    &mut self,
    request_node_id: NodeIndex,
    key: &str,
    hash: String,
  ) {
    let option_node_id = self.add_node(
      &option_content_key(key),
      RequestGraphNode::Option(OptionNode {
        key: key.to_string(),
        hash,
      }),
    );
    self
      .graph
      .add_edge(request_node_id, option_node_id, RequestEdgeType::InvalidatedByUpdate);
  }

  /// The update-kind dependencies currently declared by the request.
  pub fn invalidations(&self, request_node_id: NodeIndex) -> Vec<RequestInvalidation> {
    let mut invalidations = Vec::new();
    for node_id in self
      .graph
      .node_ids_connected_from(request_node_id, &RequestEdgeType::InvalidatedByUpdate)
    {
      match self.graph.node(node_id) {
        Some(RequestGraphNode::File(file_path)) => {
          invalidations.push(RequestInvalidation::File {
            file_path: file_path.clone(),
          });
        }
        Some(RequestGraphNode::Env(env_node)) => {
          invalidations.push(RequestInvalidation::Env {
            key: env_node.key.clone(),
          });
        }
        Some(RequestGraphNode::Option(option_node)) => {
          invalidations.push(RequestInvalidation::Option {
            key: option_node.key.clone(),
          });
        }
        _ => {}
      }
    }
    invalidations
  }

  /// Creates the request node, or resets an existing one for a fresh run:
  /// previously declared invalidations are dropped, the node is marked
  /// incomplete and no longer invalid.
  pub fn start_request(&mut self, id: RequestId, request_type: &str) -> anyhow::Result<NodeIndex> {
    let content_key = request_content_key(id);
    let node_id = if let Some(node_id) = self.graph.node_id_from_content_key(&content_key) {
      self.clear_invalidations(node_id)?;
      node_id
    } else {
      self.add_node(
        &content_key,
        RequestGraphNode::Request(RequestNode {
          id,
          request_type: request_type.to_string(),
          result: None,
          result_cache_key: None,
          invalidate_reason: InvalidateReason::INITIAL_BUILD,
        }),
      )
    };
    self.incomplete_node_ids.insert(node_id);
    self.invalid_node_ids.remove(&node_id);
    Ok(node_id)
  }

  pub fn store_result(
    &mut self,
    node_id: NodeIndex,
    result: R,
    cache_key: Option<String>,
  ) -> anyhow::Result<()> {
    let node = self.request_node_mut(node_id)?;
    node.result = Some(result);
    node.result_cache_key = cache_key;
    Ok(())
  }

  pub fn complete_request(&mut self, node_id: NodeIndex) -> anyhow::Result<()> {
    self.invalid_node_ids.remove(&node_id);
    self.incomplete_node_ids.remove(&node_id);
    let node = self.request_node_mut(node_id)?;
    node.invalidate_reason = InvalidateReason::VALID;
    Ok(())
  }

  /// A failed run leaves the request invalid so a later build retries it.
  pub fn reject_request(&mut self, node_id: NodeIndex) -> anyhow::Result<()> {
    self.incomplete_node_ids.remove(&node_id);
    self.invalidate_node(node_id, InvalidateReason::ERROR)
  }

  /// The request exists, finished its last run, and was not invalidated
  /// since.
  pub fn has_valid_result(&self, id: RequestId) -> bool {
    match self.request_node_id(id) {
      Some(node_id) => {
        !self.invalid_node_ids.contains(&node_id) && !self.incomplete_node_ids.contains(&node_id)
      }
      None => false,
    }
  }

  /// Replaces the request's outgoing `SubRequest` edges with the given
  /// set. Ids without a node are skipped: a sub-request that never started
  /// has nothing to depend on.
  pub fn replace_subrequests(
    &mut self,
    request_node_id: NodeIndex,
    subrequest_ids: &[RequestId],
  ) -> anyhow::Result<()> {
    self.request_node(request_node_id)?;
    let mut subrequest_node_ids = Vec::new();
    for id in subrequest_ids {
      if let Some(node_id) = self.request_node_id(*id) {
        subrequest_node_ids.push(node_id);
      }
    }
    self.graph.replace_node_ids_connected_to(
      request_node_id,
      &subrequest_node_ids,
      RequestEdgeType::SubRequest,
    );
    Ok(())
  }

  pub fn sub_requests(&self, request_node_id: NodeIndex) -> Vec<RequestId> {
    self
      .graph
      .node_ids_connected_from(request_node_id, &RequestEdgeType::SubRequest)
      .into_iter()
      .filter_map(|node_id| match self.graph.node(node_id) {
        Some(RequestGraphNode::Request(request)) => Some(request.id),
        _ => None,
      })
      .collect()
  }

  pub fn invalidate_reason(&self, id: RequestId) -> Option<InvalidateReason> {
    let node_id = self.request_node_id(id)?;
    self.request_node(node_id).ok().map(|node| node.invalidate_reason)
  }

  pub fn has_invalid_requests(&self) -> bool {
    !self.invalid_node_ids.is_empty()
  }

  /// Spills inline results that asked for cache storage, returning the
  /// `(cache key, serialized result)` pairs and leaving the nodes slim.
  pub fn take_spilled_results(&mut self) -> anyhow::Result<Vec<(String, Vec<u8>)>>
  where
    R: Serialize,
  {
    let mut spilled = Vec::new();
    let node_ids: Vec<NodeIndex> = self.graph.node_ids().collect();
    for node_id in node_ids {
      if let Some(RequestGraphNode::Request(request)) = self.graph.node_mut(node_id) {
        if request.result_cache_key.is_some() {
          if let Some(result) = request.result.take() {
            let cache_key = request.result_cache_key.clone().unwrap_or_default();
            spilled.push((cache_key, bincode::serialize(&result)?));
          }
        }
      }
    }
    Ok(spilled)
  }

  /// Applies a batch of watcher events. Returns whether any request was
  /// invalidated and the graph now holds invalid requests.
  #[tracing::instrument(level = "debug", skip_all)]
  pub fn respond_to_fs_events(&mut self, events: &WatchEvents) -> anyhow::Result<bool> {
    let mut did_invalidate = false;

    for event in events {
      match event {
        WatchEvent::Update(file_path) => {
          did_invalidate |= self.invalidate_file_updated(file_path)?;
        }
        WatchEvent::Create(file_path) => {
          // Some platforms report updates to watched files as creations.
          did_invalidate |= self.invalidate_file_updated(file_path)?;
          did_invalidate |= self.invalidate_file_created(file_path)?;
        }
        WatchEvent::Delete(file_path) => {
          if let Some(node_id) = self.graph.node_id_from_content_key(&file_content_key(file_path))
          {
            for parent_node_id in self
              .graph
              .node_ids_connected_to(node_id, &RequestEdgeType::InvalidatedByDelete)
            {
              self.invalidate_node(parent_node_id, InvalidateReason::FILE_DELETE)?;
              did_invalidate = true;
            }
          }
        }
      }
    }

    Ok(did_invalidate && self.has_invalid_requests())
  }

  fn invalidate_file_updated(&mut self, file_path: &Path) -> anyhow::Result<bool> {
    let Some(node_id) = self.graph.node_id_from_content_key(&file_content_key(file_path)) else {
      return Ok(false);
    };
    let mut did_invalidate = false;
    for parent_node_id in self
      .graph
      .node_ids_connected_to(node_id, &RequestEdgeType::InvalidatedByUpdate)
    {
      self.invalidate_node(parent_node_id, InvalidateReason::FILE_UPDATE)?;
      did_invalidate = true;
    }
    Ok(did_invalidate)
  }

  fn invalidate_file_created(&mut self, file_path: &Path) -> anyhow::Result<bool> {
    let mut did_invalidate = false;

    // Requests watching this exact path.
    if let Some(node_id) = self.graph.node_id_from_content_key(&file_content_key(file_path)) {
      for parent_node_id in self
        .graph
        .node_ids_connected_to(node_id, &RequestEdgeType::InvalidatedByCreate)
      {
        self.invalidate_node(parent_node_id, InvalidateReason::FILE_CREATE)?;
        did_invalidate = true;
      }
    }

    // Requests watching this file name somewhere above an anchor path.
    if let Some(file_name) = file_path.file_name().and_then(|name| name.to_str()) {
      if let Some(file_name_node_id) = self
        .graph
        .node_id_from_content_key(&file_name_content_key(file_name))
      {
        let match_node_ids = self
          .graph
          .node_ids_connected_to(file_name_node_id, &RequestEdgeType::InvalidatedByCreateAbove);
        if !match_node_ids.is_empty() {
          did_invalidate |=
            self.invalidate_file_name_node(file_name_node_id, file_path, &match_node_ids)?;
        }
      }
    }

    // Requests watching a matching glob.
    for glob_node_id in self.glob_node_ids.clone() {
      let glob = match self.graph.node(glob_node_id) {
        Some(RequestGraphNode::Glob(glob)) => glob.clone(),
        _ => return Err(anyhow!("Expected a glob node at {}", glob_node_id.index())),
      };
      if glob_match(&glob, &file_path.to_string_lossy()) {
        for parent_node_id in self
          .graph
          .node_ids_connected_to(glob_node_id, &RequestEdgeType::InvalidatedByCreate)
        {
          self.invalidate_node(parent_node_id, InvalidateReason::FILE_CREATE)?;
          did_invalidate = true;
        }
      }
    }

    Ok(did_invalidate)
  }

  /// Walks the dirname chain upward from a created file's basename. At
  /// each level, anchors reachable over a create-above edge whose
  /// directory sits at or below the directory the chain has consumed so
  /// far mean the created path matches "name above anchor".
  fn invalidate_file_name_node(
    &mut self,
    file_name_node_id: NodeIndex,
    file_path: &Path,
    match_node_ids: &[NodeIndex],
  ) -> anyhow::Result<bool> {
    let mut did_invalidate = false;
    let Some(dir_path) = file_path.parent() else {
      return Ok(did_invalidate);
    };

    for match_node_id in match_node_ids {
      let anchor_path = match self.graph.node(*match_node_id) {
        Some(RequestGraphNode::File(path)) => path.clone(),
        _ => {
          return Err(anyhow!(
            "Expected a file node on a create-above edge at {}",
            match_node_id.index()
          ))
        }
      };
      let anchor_is_below = anchor_path
        .parent()
        .is_some_and(|anchor_dir| anchor_dir.starts_with(dir_path));
      if anchor_is_below
        && self.graph.has_edge(
          file_name_node_id,
          *match_node_id,
          &RequestEdgeType::InvalidatedByCreateAbove,
        )
      {
        for parent_node_id in self
          .graph
          .node_ids_connected_to(*match_node_id, &RequestEdgeType::InvalidatedByCreate)
        {
          self.invalidate_node(parent_node_id, InvalidateReason::FILE_CREATE)?;
          did_invalidate = true;
        }
      }
    }

    // Keep walking while the parent directory's name continues the chain.
    if let Some(parent_name) = dir_path.file_name().and_then(|name| name.to_str()) {
      if let Some(parent_node_id) = self
        .graph
        .node_id_from_content_key(&file_name_content_key(parent_name))
      {
        if self
          .graph
          .has_edge(file_name_node_id, parent_node_id, &RequestEdgeType::Dirname)
        {
          did_invalidate |=
            self.invalidate_file_name_node(parent_node_id, dir_path, match_node_ids)?;
        }
      }
    }

    Ok(did_invalidate)
  }
}

#[cfg(test)]
mod test {
  use pretty_assertions::assert_eq;

  use super::*;

  type Graph = RequestGraph<String>;

  fn start(graph: &mut Graph, id: RequestId) -> NodeIndex {
    graph.start_request(id, "test").unwrap()
  }

  fn complete(graph: &mut Graph, node_id: NodeIndex) {
    graph
      .store_result(node_id, "done".to_string(), None)
      .unwrap();
    graph.complete_request(node_id).unwrap();
  }

  #[test]
  fn invalidating_a_subrequest_invalidates_all_ancestors() {
    let mut graph = Graph::new();
    let a = start(&mut graph, 1);
    let b = start(&mut graph, 2);
    let c = start(&mut graph, 3);
    complete(&mut graph, c);
    complete(&mut graph, b);
    complete(&mut graph, a);
    graph.replace_subrequests(a, &[2]).unwrap();
    graph.replace_subrequests(b, &[3]).unwrap();

    graph.invalidate_node(c, InvalidateReason::FILE_UPDATE).unwrap();

    for id in [1, 2, 3] {
      assert!(!graph.has_valid_result(id));
      assert!(graph
        .invalidate_reason(id)
        .unwrap()
        .contains(InvalidateReason::FILE_UPDATE));
    }
  }

  #[test]
  fn update_events_invalidate_watchers_of_the_path() {
    let mut graph = Graph::new();
    let r = start(&mut graph, 1);
    graph.invalidate_on_file_update(r, Path::new("/x.txt"));
    complete(&mut graph, r);

    let unrelated = vec![WatchEvent::Update(PathBuf::from("/y.txt"))];
    assert!(!graph.respond_to_fs_events(&unrelated).unwrap());
    assert!(graph.has_valid_result(1));

    let events = vec![WatchEvent::Update(PathBuf::from("/x.txt"))];
    assert!(graph.respond_to_fs_events(&events).unwrap());
    assert!(!graph.has_valid_result(1));
    assert!(graph
      .invalidate_reason(1)
      .unwrap()
      .contains(InvalidateReason::FILE_UPDATE));
  }

  #[test]
  fn create_events_on_known_paths_count_as_updates() {
    let mut graph = Graph::new();
    let r = start(&mut graph, 1);
    graph.invalidate_on_file_update(r, Path::new("/x.txt"));
    complete(&mut graph, r);

    let events = vec![WatchEvent::Create(PathBuf::from("/x.txt"))];
    assert!(graph.respond_to_fs_events(&events).unwrap());
    assert!(graph
      .invalidate_reason(1)
      .unwrap()
      .contains(InvalidateReason::FILE_UPDATE));
  }

  #[test]
  fn delete_events_invalidate_delete_watchers_only() {
    let mut graph = Graph::new();
    let r = start(&mut graph, 1);
    let other = start(&mut graph, 2);
    graph.invalidate_on_file_delete(r, Path::new("/x.txt"));
    graph.invalidate_on_file_update(other, Path::new("/x.txt"));
    complete(&mut graph, r);
    complete(&mut graph, other);

    let events = vec![WatchEvent::Delete(PathBuf::from("/x.txt"))];
    assert!(graph.respond_to_fs_events(&events).unwrap());
    assert!(!graph.has_valid_result(1));
    assert!(graph.has_valid_result(2));
    assert!(graph
      .invalidate_reason(1)
      .unwrap()
      .contains(InvalidateReason::FILE_DELETE));
  }

  #[test]
  fn glob_create_invalidation_matches_new_paths() {
    let mut graph = Graph::new();
    let r = start(&mut graph, 1);
    graph
      .invalidate_on_file_create(
        r,
        &FileCreateInvalidation::Glob {
          glob: "/proj/src/**/*.js".to_string(),
        },
      )
      .unwrap();
    complete(&mut graph, r);

    let miss = vec![WatchEvent::Create(PathBuf::from("/proj/readme.md"))];
    assert!(!graph.respond_to_fs_events(&miss).unwrap());

    let hit = vec![WatchEvent::Create(PathBuf::from("/proj/src/app/index.js"))];
    assert!(graph.respond_to_fs_events(&hit).unwrap());
    assert!(graph
      .invalidate_reason(1)
      .unwrap()
      .contains(InvalidateReason::FILE_CREATE));
  }

  #[test]
  fn plain_path_create_invalidation() {
    let mut graph = Graph::new();
    let r = start(&mut graph, 1);
    graph
      .invalidate_on_file_create(
        r,
        &FileCreateInvalidation::FilePath {
          file_path: PathBuf::from("/proj/.env"),
        },
      )
      .unwrap();
    complete(&mut graph, r);

    let events = vec![WatchEvent::Create(PathBuf::from("/proj/.env"))];
    assert!(graph.respond_to_fs_events(&events).unwrap());
    assert!(!graph.has_valid_result(1));
  }

  #[test]
  fn file_name_above_matches_creations_above_the_anchor() {
    let mut graph = Graph::new();
    let r = start(&mut graph, 1);
    graph
      .invalidate_on_file_create(
        r,
        &FileCreateInvalidation::FileNameAbove {
          file_name: "node_modules/foo".to_string(),
          above_file_path: PathBuf::from("/proj/src/index.js"),
        },
      )
      .unwrap();
    complete(&mut graph, r);

    // A creation under an unrelated root does not match.
    let miss = vec![WatchEvent::Create(PathBuf::from("/other/node_modules/foo"))];
    assert!(!graph.respond_to_fs_events(&miss).unwrap());
    assert!(graph.has_valid_result(1));

    let hit = vec![WatchEvent::Create(PathBuf::from("/proj/node_modules/foo"))];
    assert!(graph.respond_to_fs_events(&hit).unwrap());
    assert!(!graph.has_valid_result(1));
    assert!(graph
      .invalidate_reason(1)
      .unwrap()
      .contains(InvalidateReason::FILE_CREATE));
  }

  #[test]
  fn file_name_above_does_not_match_creations_below_the_anchor() {
    let mut graph = Graph::new();
    let r = start(&mut graph, 1);
    graph
      .invalidate_on_file_create(
        r,
        &FileCreateInvalidation::FileNameAbove {
          file_name: "package.json".to_string(),
          above_file_path: PathBuf::from("/proj/src/index.js"),
        },
      )
      .unwrap();
    complete(&mut graph, r);

    let below = vec![WatchEvent::Create(PathBuf::from(
      "/proj/src/deep/package.json",
    ))];
    assert!(!graph.respond_to_fs_events(&below).unwrap());

    let beside = vec![WatchEvent::Create(PathBuf::from("/proj/src/package.json"))];
    assert!(graph.respond_to_fs_events(&beside).unwrap());
  }

  #[test]
  fn degenerate_create_interests_are_rejected() {
    let mut graph = Graph::new();
    let r = start(&mut graph, 1);

    let error = graph
      .invalidate_on_file_create(
        r,
        &FileCreateInvalidation::Glob {
          glob: String::new(),
        },
      )
      .unwrap_err();
    assert!(matches!(
      error.downcast_ref::<TrackerError>(),
      Some(TrackerError::InvalidInvalidation)
    ));
  }

  #[test]
  fn matching_env_does_not_invalidate() {
    let mut graph = Graph::new();
    let r = start(&mut graph, 1);
    graph.invalidate_on_env_change(r, "FOO", Some("1".to_string()));
    complete(&mut graph, r);

    let same = BTreeMap::from([("FOO".to_string(), "1".to_string())]);
    graph.invalidate_env_nodes(&same).unwrap();
    assert!(!graph.has_invalid_requests());

    let changed = BTreeMap::from([("FOO".to_string(), "2".to_string())]);
    graph.invalidate_env_nodes(&changed).unwrap();
    assert!(!graph.has_valid_result(1));
    assert!(graph
      .invalidate_reason(1)
      .unwrap()
      .contains(InvalidateReason::ENV_CHANGE));
  }

  #[test]
  fn redeclaring_an_env_dependency_refreshes_the_stored_value() {
    let mut graph = Graph::new();
    let r = start(&mut graph, 1);
    graph.invalidate_on_env_change(r, "FOO", Some("1".to_string()));
    complete(&mut graph, r);

    // The request re-runs and records the new value.
    let r = start(&mut graph, 1);
    graph.invalidate_on_env_change(r, "FOO", Some("2".to_string()));
    complete(&mut graph, r);

    let current = BTreeMap::from([("FOO".to_string(), "2".to_string())]);
    graph.invalidate_env_nodes(&current).unwrap();
    assert!(graph.has_valid_result(1));
  }

  #[test]
  fn changed_options_invalidate_their_watchers() {
    let options = QuarryOptions::default();

    let mut graph = Graph::new();
    let r = start(&mut graph, 1);
    let hash = option_value_hash(&options, "mode");
    graph.invalidate_on_option_change(r, "mode", hash);
    complete(&mut graph, r);

    graph.invalidate_option_nodes(&options).unwrap();
    assert!(graph.has_valid_result(1));

    let changed = QuarryOptions {
      mode: quarry_core::types::BuildMode::Production,
      ..Default::default()
    };
    graph.invalidate_option_nodes(&changed).unwrap();
    assert!(!graph.has_valid_result(1));
    assert!(graph
      .invalidate_reason(1)
      .unwrap()
      .contains(InvalidateReason::OPTION_CHANGE));
  }

  #[test]
  fn starting_a_request_clears_previous_invalidations() {
    let mut graph = Graph::new();
    let r = start(&mut graph, 1);
    graph.invalidate_on_file_update(r, Path::new("/old.txt"));
    complete(&mut graph, r);

    let r = start(&mut graph, 1);
    assert_eq!(graph.invalidations(r), vec![]);

    graph.invalidate_on_file_update(r, Path::new("/new.txt"));
    assert_eq!(
      graph.invalidations(r),
      vec![RequestInvalidation::File {
        file_path: PathBuf::from("/new.txt")
      }]
    );
  }

  #[test]
  fn unpredictable_requests_invalidate_on_startup() {
    let mut graph = Graph::new();
    let r = start(&mut graph, 1);
    graph.invalidate_on_startup(r).unwrap();
    complete(&mut graph, r);

    graph.invalidate_unpredictable_nodes().unwrap();
    assert!(!graph.has_valid_result(1));
    assert!(graph
      .invalidate_reason(1)
      .unwrap()
      .contains(InvalidateReason::STARTUP));
  }

  #[test]
  fn rejecting_marks_invalid_with_error_reason() {
    let mut graph = Graph::new();
    let r = start(&mut graph, 1);
    graph.reject_request(r).unwrap();

    assert!(!graph.has_valid_result(1));
    assert!(graph
      .invalidate_reason(1)
      .unwrap()
      .contains(InvalidateReason::ERROR));
  }

  #[test]
  fn serialization_preserves_nodes_edges_and_side_indices() {
    let mut graph = Graph::new();
    let a = start(&mut graph, 1);
    let b = start(&mut graph, 2);
    graph.invalidate_on_file_update(a, Path::new("/x.txt"));
    graph.invalidate_on_startup(b).unwrap();
    complete(&mut graph, a);
    complete(&mut graph, b);
    graph.replace_subrequests(a, &[2]).unwrap();
    graph.invalidate_node(b, InvalidateReason::FILE_DELETE).unwrap();

    let bytes = bincode::serialize(&graph).unwrap();
    let mut restored: Graph = bincode::deserialize(&bytes).unwrap();

    // Invalid state and ancestry survived: b was invalid, so its parent a
    // must be too.
    assert!(!restored.has_valid_result(1));
    assert!(!restored.has_valid_result(2));
    assert_eq!(restored.invalidate_reason(2), graph.invalidate_reason(2));

    // Declared file dependencies still respond to events.
    let restored_a = restored.request_node_id(1).unwrap();
    restored.complete_request(restored_a).unwrap();
    let events = vec![WatchEvent::Update(PathBuf::from("/x.txt"))];
    assert!(restored.respond_to_fs_events(&events).unwrap());

    // The startup set survived too.
    let restored_b = restored.request_node_id(2).unwrap();
    restored.complete_request(restored_b).unwrap();
    restored.invalidate_unpredictable_nodes().unwrap();
    assert!(!restored.has_valid_result(2));
  }

  #[test]
  fn removing_a_node_purges_every_side_index() {
    let mut graph = Graph::new();
    let r = start(&mut graph, 1);
    graph.invalidate_on_startup(r).unwrap();
    graph.invalidate_node(r, InvalidateReason::ERROR).unwrap();

    graph.remove_node(r);

    assert!(!graph.has_invalid_requests());
    assert_eq!(graph.request_node_id(1), None);
    graph.invalidate_unpredictable_nodes().unwrap();
    assert!(!graph.has_invalid_requests());
  }
}
