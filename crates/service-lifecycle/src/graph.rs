//! Dependency graph for lifecycle ordering
//!
//! Vertices are service ids carrying a payload (the service descriptor).
//! An edge `X -> Y` records that X requires Y. The graph is kept acyclic at
//! all times: an edge that would close a cycle is rolled back before
//! [`DependencyGraph::add_edge`] returns.

use crate::{Error, Result};
use indexmap::{IndexMap, IndexSet};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tracing::debug;

/// Directed acyclic graph of "requires" relationships
#[derive(Debug, Clone)]
pub struct DependencyGraph<T> {
    /// Vertex payloads, in insertion order
    vertices: IndexMap<String, T>,
    /// dependent -> dependencies
    edges: IndexMap<String, IndexSet<String>>,
    /// dependency -> dependents
    reverse_edges: IndexMap<String, IndexSet<String>>,
}

impl<T> Default for DependencyGraph<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DependencyGraph<T> {
    /// Create an empty graph
    pub fn new() -> Self {
        Self {
            vertices: IndexMap::new(),
            edges: IndexMap::new(),
            reverse_edges: IndexMap::new(),
        }
    }

    /// Insert a vertex if it is not already present
    ///
    /// Returns `true` when the vertex was added. An existing vertex keeps its
    /// original payload.
    pub fn add_vertex(&mut self, id: impl Into<String>, payload: T) -> bool {
        let id = id.into();
        if self.vertices.contains_key(&id) {
            return false;
        }
        debug!("Adding vertex '{}'", id);
        self.edges.insert(id.clone(), IndexSet::new());
        self.reverse_edges.insert(id.clone(), IndexSet::new());
        self.vertices.insert(id, payload);
        true
    }

    /// Record that `source` requires `target`
    ///
    /// Fails with [`Error::VertexNotFound`] if either endpoint is missing,
    /// [`Error::EdgeAlreadyExists`] if the edge is present, and
    /// [`Error::CycleDetected`] if the edge would close a cycle. A rejected
    /// edge leaves the graph exactly as it was.
    pub fn add_edge(&mut self, source: &str, target: &str) -> Result<()> {
        for id in [source, target] {
            if !self.vertices.contains_key(id) {
                return Err(Error::VertexNotFound(id.to_string()));
            }
        }
        if self.has_edge(source, target) {
            return Err(Error::EdgeAlreadyExists {
                from: source.to_string(),
                to: target.to_string(),
            });
        }

        self.link(source, target);
        if self.has_cycle() {
            self.unlink(source, target);
            return Err(Error::CycleDetected {
                from: source.to_string(),
                to: target.to_string(),
            });
        }

        debug!("Adding edge '{}' -> '{}'", source, target);
        Ok(())
    }

    fn link(&mut self, source: &str, target: &str) {
        if let Some(deps) = self.edges.get_mut(source) {
            deps.insert(target.to_string());
        }
        if let Some(dependents) = self.reverse_edges.get_mut(target) {
            dependents.insert(source.to_string());
        }
    }

    fn unlink(&mut self, source: &str, target: &str) {
        // Both entries were appended by `link`, so removing them with
        // `shift_remove` restores the previous iteration order.
        if let Some(deps) = self.edges.get_mut(source) {
            deps.shift_remove(target);
        }
        if let Some(dependents) = self.reverse_edges.get_mut(target) {
            dependents.shift_remove(source);
        }
    }

    /// Depth-first search with an explicit recursion stack
    fn has_cycle(&self) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.vertices.len()];
        for start in 0..self.vertices.len() {
            if marks[start] != Mark::Unvisited {
                continue;
            }
            // (vertex index, next neighbour position)
            let mut stack = vec![(start, 0usize)];
            marks[start] = Mark::OnStack;
            while let Some(frame) = stack.last_mut() {
                let (vertex, next) = *frame;
                let neighbours = &self.edges[vertex];
                if let Some(neighbour) = neighbours.get_index(next) {
                    frame.1 += 1;
                    let Some(index) = self.vertices.get_index_of(neighbour) else {
                        continue;
                    };
                    match marks[index] {
                        Mark::OnStack => return true,
                        Mark::Unvisited => {
                            marks[index] = Mark::OnStack;
                            stack.push((index, 0));
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks[vertex] = Mark::Done;
                    stack.pop();
                }
            }
        }
        false
    }

    /// Whether a vertex with this id exists
    pub fn contains(&self, id: &str) -> bool {
        self.vertices.contains_key(id)
    }

    /// Payload stored for a vertex
    pub fn get(&self, id: &str) -> Option<&T> {
        self.vertices.get(id)
    }

    /// Whether `source` is recorded as requiring `target`
    pub fn has_edge(&self, source: &str, target: &str) -> bool {
        self.edges
            .get(source)
            .is_some_and(|deps| deps.contains(target))
    }

    /// Number of vertices
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    /// Whether the graph has no vertices
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Number of edges
    pub fn edge_count(&self) -> usize {
        self.edges.values().map(IndexSet::len).sum()
    }

    /// Vertex ids in insertion order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.vertices.keys().map(String::as_str)
    }

    /// Vertices and payloads in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.vertices.iter().map(|(id, payload)| (id.as_str(), payload))
    }

    /// Services that `id` requires
    pub fn dependencies_of(&self, id: &str) -> impl Iterator<Item = &str> {
        self.edges
            .get(id)
            .into_iter()
            .flat_map(|deps| deps.iter().map(String::as_str))
    }

    /// Services that require `id`
    pub fn dependents_of(&self, id: &str) -> impl Iterator<Item = &str> {
        self.reverse_edges
            .get(id)
            .into_iter()
            .flat_map(|deps| deps.iter().map(String::as_str))
    }

    /// Dependencies-first linearization (Kahn's algorithm)
    ///
    /// For every edge `u -> v` ("u requires v"), `v` is yielded before `u`.
    /// Among vertices that become eligible at the same time the one inserted
    /// first wins. The order is computed lazily and afresh on every call.
    pub fn topological_order(&self) -> TopologicalOrder<'_, T> {
        let pending: Vec<usize> = self.edges.values().map(IndexSet::len).collect();
        let ready = pending
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(index, _)| Reverse(index))
            .collect();
        TopologicalOrder {
            graph: self,
            pending,
            ready,
        }
    }

    /// Dependents-first linearization, the exact reverse of
    /// [`DependencyGraph::topological_order`]
    pub fn reverse_topological_order(&self) -> impl Iterator<Item = &str> {
        self.topological_order().collect::<Vec<_>>().into_iter().rev()
    }
}

/// Lazy iterator over a dependencies-first order
pub struct TopologicalOrder<'a, T> {
    graph: &'a DependencyGraph<T>,
    /// Unprocessed dependency count per vertex index
    pending: Vec<usize>,
    /// Eligible vertex indices, smallest first
    ready: BinaryHeap<Reverse<usize>>,
}

impl<'a, T> Iterator for TopologicalOrder<'a, T> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse(index) = self.ready.pop()?;
        let (id, dependents) = self.graph.reverse_edges.get_index(index)?;
        for dependent in dependents {
            if let Some(slot) = self.graph.vertices.get_index_of(dependent) {
                self.pending[slot] -= 1;
                if self.pending[slot] == 0 {
                    self.ready.push(Reverse(slot));
                }
            }
        }
        Some(id.as_str())
    }
}
