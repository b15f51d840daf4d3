//! In-memory edge-labeled graph and its reverse index
//!
//! The graph is an ordered vector of vertices, each owning its outgoing edges
//! in file order. Duplicate edges are preserved on load; the refiner's
//! set-valued signatures make them harmless, and dropping them here would cost
//! a pass for no semantic gain. The reverse index *is* deduplicated: dirty
//! propagation walks it heavily, and duplicate sources would only repeat work.
//!
//! Both structures are built once and immutable afterwards.

use std::io::Read;

use crate::wire::{self, WireError};
use crate::{EdgeLabel, NodeIndex};

/// A single outgoing edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// Predicate id.
    pub label: EdgeLabel,
    /// Target vertex id; always a valid index into the graph.
    pub target: NodeIndex,
}

/// Errors surfaced while loading or indexing a graph.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Truncated or otherwise unreadable triples file.
    #[error("unexpected EOF in triples file")]
    TruncatedTriples,
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The reverse index was requested twice.
    #[error("reverse index has already been computed")]
    ReverseIndexExists,
}

impl From<WireError> for GraphError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Io(io) => GraphError::Io(io),
            _ => GraphError::TruncatedTriples,
        }
    }
}

/// Edge-labeled graph over dense vertex ids, with an optional reverse index.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Vec<Edge>>,
    reverse: Vec<Vec<NodeIndex>>,
}

impl Graph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of vertices.
    pub fn size(&self) -> NodeIndex {
        self.nodes.len() as NodeIndex
    }

    /// Outgoing edges of `v`, in load order.
    pub fn outgoing(&self, v: NodeIndex) -> &[Edge] {
        &self.nodes[v as usize]
    }

    /// Vertices with at least one edge into `v` (deduplicated).
    pub fn reverse_neighbors(&self, v: NodeIndex) -> &[NodeIndex] {
        &self.reverse[v as usize]
    }

    /// Grow the vertex table to `vertex_count` entries.
    pub fn resize(&mut self, vertex_count: NodeIndex) {
        if vertex_count as usize > self.nodes.len() {
            self.nodes.resize_with(vertex_count as usize, Vec::new);
        }
    }

    /// Append an edge, growing the vertex table to cover both endpoints.
    pub fn add_edge(&mut self, subject: NodeIndex, label: EdgeLabel, object: NodeIndex) {
        let largest = subject.max(object) as usize;
        if largest >= self.nodes.len() {
            self.nodes.resize_with(largest + 1, Vec::new);
        }
        self.nodes[subject as usize].push(Edge { label, target: object });
    }

    /// Load a graph from a binary triple stream
    /// (`ENTITY subject | PREDICATE predicate | ENTITY object` records).
    ///
    /// Returns the graph together with the number of edges read. A stream that
    /// ends inside a record is a [`GraphError::TruncatedTriples`] error.
    pub fn read_from<R: Read>(r: &mut R) -> Result<(Self, u64), GraphError> {
        let mut g = Graph::new();
        let mut edge_count: u64 = 0;
        tracing::info!("reading triples");
        loop {
            let subject = match wire::read_entity_opt(r)? {
                Some(s) => s,
                None => break,
            };
            let label = wire::read_predicate(r)?;
            let object = wire::read_entity(r)?;
            g.add_edge(subject, label, object);
            edge_count += 1;
            if edge_count % 1_000_000 == 0 {
                tracing::info!(triples = edge_count, "still reading");
            }
        }
        tracing::info!(vertices = g.size(), edges = edge_count, "graph loaded");
        Ok((g, edge_count))
    }

    /// Build the reverse index.
    ///
    /// Incoming sources are accumulated per target as a set first, so parallel
    /// edges collapse, then materialized as shrunk vectors.
    pub fn compute_reverse_index(&mut self) -> Result<(), GraphError> {
        if !self.reverse.is_empty() {
            return Err(GraphError::ReverseIndexExists);
        }
        let n = self.nodes.len();
        let mut unique: Vec<std::collections::HashSet<NodeIndex>> = vec![Default::default(); n];
        for (source, edges) in self.nodes.iter().enumerate() {
            for edge in edges {
                unique[edge.target as usize].insert(source as NodeIndex);
            }
        }
        self.reverse = unique
            .into_iter()
            .map(|set| {
                let mut sources: Vec<NodeIndex> = set.into_iter().collect();
                sources.sort_unstable();
                sources.shrink_to_fit();
                sources
            })
            .collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn triples(records: &[(u64, u32, u64)]) -> Vec<u8> {
        let mut buf = Vec::new();
        for &(s, p, o) in records {
            wire::write_entity(&mut buf, s).unwrap();
            wire::write_predicate(&mut buf, p).unwrap();
            wire::write_entity(&mut buf, o).unwrap();
        }
        buf
    }

    #[test]
    fn loads_and_sizes_from_max_vertex() {
        let buf = triples(&[(0, 1, 2), (1, 1, 2), (2, 3, 5)]);
        let (g, edges) = Graph::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(edges, 3);
        assert_eq!(g.size(), 6); // vertex 5 grows the table to 6 entries
        assert_eq!(g.outgoing(0), &[Edge { label: 1, target: 2 }]);
        assert!(g.outgoing(4).is_empty());
    }

    #[test]
    fn duplicate_edges_survive_loading() {
        let buf = triples(&[(0, 1, 1), (0, 1, 1)]);
        let (g, edges) = Graph::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(edges, 2);
        assert_eq!(g.outgoing(0).len(), 2);
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let mut buf = triples(&[(0, 1, 2)]);
        buf.truncate(buf.len() - 2); // cut into the object field
        assert!(matches!(
            Graph::read_from(&mut Cursor::new(buf)),
            Err(GraphError::TruncatedTriples)
        ));
    }

    #[test]
    fn reverse_index_deduplicates() {
        let buf = triples(&[(0, 1, 2), (0, 7, 2), (1, 1, 2)]);
        let (mut g, _) = Graph::read_from(&mut Cursor::new(buf)).unwrap();
        g.compute_reverse_index().unwrap();
        assert_eq!(g.reverse_neighbors(2), &[0, 1]);
        assert!(g.reverse_neighbors(0).is_empty());
        assert!(matches!(
            g.compute_reverse_index(),
            Err(GraphError::ReverseIndexExists)
        ));
    }
}
