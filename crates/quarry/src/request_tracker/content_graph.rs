use std::collections::HashMap;

use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

/// Directed multigraph whose nodes are addressable by a stable content key.
///
/// Node ids are `petgraph` stable indices: removing a node tombstones its
/// slot instead of shifting later ids, so ids recorded elsewhere (and in
/// serialized blobs) stay valid. Edges are typed by their weight, with at
/// most one edge per `(from, to, weight)` triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
  serialize = "N: Serialize, E: Serialize",
  deserialize = "N: DeserializeOwned, E: DeserializeOwned"
))]
pub struct ContentGraph<N, E> {
  graph: StableDiGraph<N, E>,
  content_key_to_node_id: HashMap<String, NodeIndex>,
  node_id_to_content_key: HashMap<NodeIndex, String>,
}

impl<N, E: PartialEq> Default for ContentGraph<N, E> {
  fn default() -> Self {
    Self::new()
  }
}

impl<N, E: PartialEq> ContentGraph<N, E> {
  pub fn new() -> Self {
    Self {
      graph: StableDiGraph::new(),
      content_key_to_node_id: HashMap::new(),
      node_id_to_content_key: HashMap::new(),
    }
  }

  /// Adds a node under `content_key`, or returns the already assigned id
  /// if the key is taken. The existing node is left untouched.
  pub fn add_node_by_content_key(&mut self, content_key: &str, node: N) -> NodeIndex {
    if let Some(node_id) = self.content_key_to_node_id.get(content_key) {
      return *node_id;
    }
    let node_id = self.graph.add_node(node);
    self
      .content_key_to_node_id
      .insert(content_key.to_string(), node_id);
    self
      .node_id_to_content_key
      .insert(node_id, content_key.to_string());
    node_id
  }

  pub fn has_content_key(&self, content_key: &str) -> bool {
    self.content_key_to_node_id.contains_key(content_key)
  }

  pub fn node_id_from_content_key(&self, content_key: &str) -> Option<NodeIndex> {
    self.content_key_to_node_id.get(content_key).copied()
  }

  pub fn content_key_from_node_id(&self, node_id: NodeIndex) -> Option<&str> {
    self.node_id_to_content_key.get(&node_id).map(String::as_str)
  }

  pub fn node(&self, node_id: NodeIndex) -> Option<&N> {
    self.graph.node_weight(node_id)
  }

  pub fn node_mut(&mut self, node_id: NodeIndex) -> Option<&mut N> {
    self.graph.node_weight_mut(node_id)
  }

  pub fn node_by_content_key(&self, content_key: &str) -> Option<&N> {
    let node_id = self.node_id_from_content_key(content_key)?;
    self.node(node_id)
  }

  pub fn has_node(&self, node_id: NodeIndex) -> bool {
    self.graph.contains_node(node_id)
  }

  pub fn node_count(&self) -> usize {
    self.graph.node_count()
  }

  pub fn node_ids(&self) -> impl Iterator<Item = NodeIndex> + '_ {
    self.graph.node_indices()
  }

  /// Adds an edge unless an identical one already exists.
  pub fn add_edge(&mut self, from: NodeIndex, to: NodeIndex, weight: E) {
    if !self.has_edge(from, to, &weight) {
      self.graph.add_edge(from, to, weight);
    }
  }

  pub fn has_edge(&self, from: NodeIndex, to: NodeIndex, weight: &E) -> bool {
    self
      .graph
      .edges_connecting(from, to)
      .any(|edge| edge.weight() == weight)
  }

  pub fn remove_edge(&mut self, from: NodeIndex, to: NodeIndex, weight: &E) {
    let edge_id = self
      .graph
      .edges_connecting(from, to)
      .find(|edge| edge.weight() == weight)
      .map(|edge| edge.id());
    if let Some(edge_id) = edge_id {
      self.graph.remove_edge(edge_id);
    }
  }

  /// Outgoing neighbors along edges carrying `weight`.
  pub fn node_ids_connected_from(&self, node_id: NodeIndex, weight: &E) -> Vec<NodeIndex> {
    self
      .graph
      .edges_directed(node_id, Direction::Outgoing)
      .filter(|edge| edge.weight() == weight)
      .map(|edge| edge.target())
      .collect()
  }

  /// Incoming neighbors along edges carrying `weight`.
  pub fn node_ids_connected_to(&self, node_id: NodeIndex, weight: &E) -> Vec<NodeIndex> {
    self
      .graph
      .edges_directed(node_id, Direction::Incoming)
      .filter(|edge| edge.weight() == weight)
      .map(|edge| edge.source())
      .collect()
  }

  /// Replaces the set of outgoing edges of `from` carrying `weight` so
  /// they point at exactly `to_node_ids`, adding and removing only the
  /// difference.
  pub fn replace_node_ids_connected_to(
    &mut self,
    from: NodeIndex,
    to_node_ids: &[NodeIndex],
    weight: E,
  ) where
    E: Clone,
  {
    let current = self.node_ids_connected_from(from, &weight);
    for to in to_node_ids {
      if !self.has_edge(from, *to, &weight) {
        self.graph.add_edge(from, *to, weight.clone());
      }
    }
    for to in current {
      if !to_node_ids.contains(&to) {
        self.remove_edge(from, to, &weight);
      }
    }
  }

  /// Removes the node together with every incident edge and frees its
  /// content key.
  pub fn remove_node(&mut self, node_id: NodeIndex) -> Option<N> {
    if let Some(content_key) = self.node_id_to_content_key.remove(&node_id) {
      self.content_key_to_node_id.remove(&content_key);
    }
    self.graph.remove_node(node_id)
  }
}

#[cfg(test)]
mod test {
  use pretty_assertions::assert_eq;

  use super::*;

  #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
  enum Edge {
    Solid,
    Dashed,
  }

  fn graph_with_pair() -> (ContentGraph<String, Edge>, NodeIndex, NodeIndex) {
    let mut graph = ContentGraph::new();
    let a = graph.add_node_by_content_key("a", "a".to_string());
    let b = graph.add_node_by_content_key("b", "b".to_string());
    (graph, a, b)
  }

  #[test]
  fn adding_the_same_content_key_twice_is_idempotent() {
    let mut graph: ContentGraph<String, Edge> = ContentGraph::new();

    let first = graph.add_node_by_content_key("a", "a".to_string());
    let second = graph.add_node_by_content_key("a", "ignored".to_string());

    assert_eq!(first, second);
    assert_eq!(graph.node_count(), 1);
    assert_eq!(graph.node(first), Some(&"a".to_string()));
  }

  #[test]
  fn add_edge_is_idempotent_per_weight() {
    let (mut graph, a, b) = graph_with_pair();

    graph.add_edge(a, b, Edge::Solid);
    graph.add_edge(a, b, Edge::Solid);
    graph.add_edge(a, b, Edge::Dashed);

    assert_eq!(graph.node_ids_connected_from(a, &Edge::Solid), vec![b]);
    assert_eq!(graph.node_ids_connected_from(a, &Edge::Dashed), vec![b]);
    assert_eq!(graph.node_ids_connected_to(b, &Edge::Solid), vec![a]);
  }

  #[test]
  fn neighbor_queries_are_filtered_by_weight() {
    let (mut graph, a, b) = graph_with_pair();
    let c = graph.add_node_by_content_key("c", "c".to_string());

    graph.add_edge(a, b, Edge::Solid);
    graph.add_edge(a, c, Edge::Dashed);

    assert_eq!(graph.node_ids_connected_from(a, &Edge::Solid), vec![b]);
    assert_eq!(graph.node_ids_connected_from(a, &Edge::Dashed), vec![c]);
    assert!(graph.node_ids_connected_to(a, &Edge::Solid).is_empty());
  }

  #[test]
  fn replace_node_ids_connected_to_applies_a_diff() {
    let (mut graph, a, b) = graph_with_pair();
    let c = graph.add_node_by_content_key("c", "c".to_string());
    let d = graph.add_node_by_content_key("d", "d".to_string());

    graph.add_edge(a, b, Edge::Solid);
    graph.add_edge(a, c, Edge::Solid);
    // Edges on other weights are untouched by the replacement.
    graph.add_edge(a, b, Edge::Dashed);

    graph.replace_node_ids_connected_to(a, &[c, d], Edge::Solid);

    let mut connected = graph.node_ids_connected_from(a, &Edge::Solid);
    connected.sort();
    assert_eq!(connected, vec![c, d]);
    assert_eq!(graph.node_ids_connected_from(a, &Edge::Dashed), vec![b]);
  }

  #[test]
  fn removing_a_node_detaches_edges_and_frees_the_key() {
    let (mut graph, a, b) = graph_with_pair();
    graph.add_edge(a, b, Edge::Solid);

    graph.remove_node(b);

    assert!(!graph.has_content_key("b"));
    assert!(!graph.has_node(b));
    assert!(graph.node_ids_connected_from(a, &Edge::Solid).is_empty());

    // The key can be claimed again by a fresh node.
    let b2 = graph.add_node_by_content_key("b", "b2".to_string());
    assert!(graph.has_node(b2));
  }

  #[test]
  fn serialization_preserves_node_ids_and_edges() {
    let (mut graph, a, b) = graph_with_pair();
    let c = graph.add_node_by_content_key("c", "c".to_string());
    graph.remove_node(b);
    graph.add_edge(a, c, Edge::Dashed);

    let bytes = bincode::serialize(&graph).unwrap();
    let restored: ContentGraph<String, Edge> = bincode::deserialize(&bytes).unwrap();

    assert_eq!(restored.node_id_from_content_key("a"), Some(a));
    assert_eq!(restored.node_id_from_content_key("c"), Some(c));
    assert_eq!(restored.node_id_from_content_key("b"), None);
    assert!(restored.has_edge(a, c, &Edge::Dashed));
    assert_eq!(restored.node_count(), 2);
  }
}
