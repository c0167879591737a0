//! Correlation graph builder
//!
//! Reduces a record batch into a weighted directed graph with one edge per
//! ordered `(from, to)` pair, plus a per-address correlation ranking.
//!
//! Accumulation is an explicit fold over record slices ([`EdgeAccumulator`])
//! whose partial results merge in order, so a batch can be processed in
//! bounded chunks without changing the result.

use chrono::{DateTime, Utc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::analysis::patterns::SuspicionIndex;
use crate::error::{Error, Result};
use crate::ledger::types::{Address, TransactionRecord};

/// Configuration for graph construction and edge classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Neighbors kept per address in the presentation ranking
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Pair volume above which an edge is `high_volume` (native units)
    #[serde(default = "default_high_volume_threshold")]
    pub high_volume_threshold: f64,

    /// Pair frequency above which an edge is `frequent`
    #[serde(default = "default_frequent_threshold")]
    pub frequent_threshold: u64,
}

fn default_top_k() -> usize {
    3
}
fn default_high_volume_threshold() -> f64 {
    10.0
}
fn default_frequent_threshold() -> u64 {
    3
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            high_volume_threshold: default_high_volume_threshold(),
            frequent_threshold: default_frequent_threshold(),
        }
    }
}

/// Aggregated statistics for one ordered pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeStats {
    /// Number of records with this ordered pair
    pub frequency: u64,
    /// Sum of record amounts
    pub volume: f64,
}

/// Edge between two addresses, keyed by the ordered pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationEdge {
    pub source: Address,
    pub target: Address,
    pub frequency: u64,
    pub volume: f64,
}

/// Presentation flags for an edge, computed on demand
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeClass {
    pub high_volume: bool,
    pub frequent: bool,
    pub suspicious: bool,
}

/// One ranked neighbor of an address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationEntry {
    pub address: Address,
    /// Share of the address' interactions that involve this neighbor
    pub strength: f64,
    /// Raw interaction count with this neighbor (both directions)
    pub frequency: u64,
}

/// Ranked neighbor list of one address
///
/// `ranked` holds every neighbor (strengths sum to 1); the presentation view
/// is the top-K prefix returned by [`AddressCorrelation::top`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressCorrelation {
    pub address: Address,
    pub total_interactions: u64,
    pub ranked: Vec<CorrelationEntry>,
}

impl AddressCorrelation {
    /// First `k` entries of the ranking
    pub fn top(&self, k: usize) -> &[CorrelationEntry] {
        &self.ranked[..k.min(self.ranked.len())]
    }

    /// Copy truncated to the first `k` entries
    pub fn truncated(&self, k: usize) -> Self {
        Self {
            address: self.address.clone(),
            total_interactions: self.total_interactions,
            ranked: self.top(k).to_vec(),
        }
    }
}

/// Partial reduction of a record slice
///
/// Nodes and pairs remember first-appearance order so merged results are
/// identical to a single sequential fold.
#[derive(Debug, Clone, Default)]
pub struct EdgeAccumulator {
    nodes: Vec<Address>,
    node_index: HashMap<Address, usize>,
    pairs: Vec<((Address, Address), EdgeStats)>,
    pair_index: HashMap<(Address, Address), usize>,
    adjacency: HashMap<Address, HashMap<Address, u64>>,
    records: usize,
}

impl EdgeAccumulator {
    /// Fold a slice of records into this accumulator
    pub fn fold(mut self, records: &[TransactionRecord]) -> Self {
        for record in records {
            self.touch_node(&record.from);
            self.touch_node(&record.to);
            self.add_pair(
                (record.from.clone(), record.to.clone()),
                EdgeStats {
                    frequency: 1,
                    volume: record.amount,
                },
            );
            self.add_adjacency(&record.from, &record.to, 1);
            if record.from != record.to {
                self.add_adjacency(&record.to, &record.from, 1);
            }
            self.records += 1;
        }
        self
    }

    /// Merge a later partial result into this one
    pub fn merge(mut self, other: EdgeAccumulator) -> Self {
        for node in &other.nodes {
            self.touch_node(node);
        }
        for (pair, stats) in other.pairs {
            self.add_pair(pair, stats);
        }
        for (address, neighbors) in other.adjacency {
            for (neighbor, count) in neighbors {
                self.add_adjacency(&address, &neighbor, count);
            }
        }
        self.records += other.records;
        self
    }

    /// Number of records folded so far
    pub fn record_count(&self) -> usize {
        self.records
    }

    fn touch_node(&mut self, address: &str) {
        if !self.node_index.contains_key(address) {
            self.node_index.insert(address.to_string(), self.nodes.len());
            self.nodes.push(address.to_string());
        }
    }

    fn add_pair(&mut self, pair: (Address, Address), stats: EdgeStats) {
        match self.pair_index.get(&pair) {
            Some(&idx) => {
                let entry = &mut self.pairs[idx].1;
                entry.frequency += stats.frequency;
                entry.volume += stats.volume;
            }
            None => {
                self.pair_index.insert(pair.clone(), self.pairs.len());
                self.pairs.push((pair, stats));
            }
        }
    }

    fn add_adjacency(&mut self, address: &str, neighbor: &str, count: u64) {
        *self
            .adjacency
            .entry(address.to_string())
            .or_default()
            .entry(neighbor.to_string())
            .or_insert(0) += count;
    }

    /// Freeze into an immutable graph centered on `focal`
    pub fn finish(self, focal: &str) -> CorrelationGraph {
        let mut graph: DiGraph<Address, EdgeStats> =
            DiGraph::with_capacity(self.nodes.len() + 1, self.pairs.len());
        let mut index: HashMap<Address, NodeIndex> = HashMap::with_capacity(self.nodes.len() + 1);

        let focal_idx = graph.add_node(focal.to_string());
        index.insert(focal.to_string(), focal_idx);
        for node in self.nodes {
            if !index.contains_key(&node) {
                let idx = graph.add_node(node.clone());
                index.insert(node, idx);
            }
        }

        for ((source, target), stats) in self.pairs {
            let (s, t) = (index[&source], index[&target]);
            graph.add_edge(s, t, stats);
        }

        let correlations = self
            .adjacency
            .into_iter()
            .map(|(address, neighbors)| {
                let correlation = rank_neighbors(&address, neighbors);
                (address, correlation)
            })
            .collect();

        CorrelationGraph {
            focal: focal.to_string(),
            graph,
            index,
            correlations,
            record_count: self.records,
        }
    }
}

/// Rank neighbors by count (desc) then address (asc) and normalize
fn rank_neighbors(address: &str, neighbors: HashMap<Address, u64>) -> AddressCorrelation {
    let total: u64 = neighbors.values().sum();
    let mut ranked: Vec<(Address, u64)> = neighbors.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    AddressCorrelation {
        address: address.to_string(),
        total_interactions: total,
        ranked: ranked
            .into_iter()
            .map(|(neighbor, count)| CorrelationEntry {
                address: neighbor,
                strength: if total > 0 {
                    count as f64 / total as f64
                } else {
                    0.0
                },
                frequency: count,
            })
            .collect(),
    }
}

/// Immutable correlation graph for one analysis run
#[derive(Debug, Clone)]
pub struct CorrelationGraph {
    focal: Address,
    graph: DiGraph<Address, EdgeStats>,
    index: HashMap<Address, NodeIndex>,
    correlations: HashMap<Address, AddressCorrelation>,
    record_count: usize,
}

impl CorrelationGraph {
    /// Build the graph in a single pass
    pub fn build(focal: &str, records: &[TransactionRecord]) -> Self {
        let graph = EdgeAccumulator::default().fold(records).finish(focal);
        debug!(
            focal = %focal,
            nodes = %graph.node_count(),
            edges = %graph.edge_count(),
            "Correlation graph built"
        );
        graph
    }

    /// Build the graph in bounded slices, yielding between slices
    ///
    /// Returns [`Error::Superseded`] if `cancel` fires before completion.
    pub async fn build_chunked(
        focal: &str,
        records: &[TransactionRecord],
        chunk_size: usize,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let mut acc = EdgeAccumulator::default();
        for chunk in records.chunks(chunk_size.max(1)) {
            if cancel.is_cancelled() {
                return Err(Error::Superseded {
                    address: focal.to_string(),
                });
            }
            acc = acc.merge(EdgeAccumulator::default().fold(chunk));
            tokio::task::yield_now().await;
        }
        if cancel.is_cancelled() {
            return Err(Error::Superseded {
                address: focal.to_string(),
            });
        }
        Ok(acc.finish(focal))
    }

    pub fn focal(&self) -> &str {
        &self.focal
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Number of records reduced into this graph
    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn contains(&self, address: &str) -> bool {
        self.index.contains_key(address)
    }

    /// Node addresses, focal first, then first-appearance order
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.graph.node_weights().map(|a| a.as_str())
    }

    pub(crate) fn inner(&self) -> &DiGraph<Address, EdgeStats> {
        &self.graph
    }

    pub(crate) fn node_index(&self, address: &str) -> Option<NodeIndex> {
        self.index.get(address).copied()
    }

    /// All edges in first-appearance order
    pub fn edges(&self) -> Vec<CorrelationEdge> {
        self.graph
            .edge_references()
            .map(|e| CorrelationEdge {
                source: self.graph[e.source()].clone(),
                target: self.graph[e.target()].clone(),
                frequency: e.weight().frequency,
                volume: e.weight().volume,
            })
            .collect()
    }

    /// Edge for an ordered pair
    pub fn edge(&self, source: &str, target: &str) -> Option<CorrelationEdge> {
        let (s, t) = (self.node_index(source)?, self.node_index(target)?);
        let idx = self.graph.find_edge(s, t)?;
        let stats = self.graph[idx];
        Some(CorrelationEdge {
            source: source.to_string(),
            target: target.to_string(),
            frequency: stats.frequency,
            volume: stats.volume,
        })
    }

    /// Undirected neighbors of an address in node order
    pub fn neighbors(&self, address: &str) -> Vec<&str> {
        let Some(idx) = self.node_index(address) else {
            return Vec::new();
        };
        let mut neighbors: Vec<NodeIndex> = self.graph.neighbors_undirected(idx).collect();
        neighbors.sort();
        neighbors.dedup();
        neighbors.into_iter().map(|n| self.graph[n].as_str()).collect()
    }

    /// Full correlation ranking for an address
    pub fn correlation(&self, address: &str) -> Option<&AddressCorrelation> {
        self.correlations.get(address)
    }

    /// Top-K correlation view for every node, in node order
    ///
    /// Nodes without neighbors (the focal address of an empty batch) get an
    /// empty list.
    pub fn correlations(&self, top_k: usize) -> Vec<AddressCorrelation> {
        self.nodes()
            .map(|address| match self.correlations.get(address) {
                Some(c) => c.truncated(top_k),
                None => AddressCorrelation {
                    address: address.to_string(),
                    total_interactions: 0,
                    ranked: Vec::new(),
                },
            })
            .collect()
    }

    /// Classify one edge for presentation
    pub fn classify(
        &self,
        edge: &CorrelationEdge,
        config: &GraphConfig,
        suspicion: &SuspicionIndex,
    ) -> EdgeClass {
        EdgeClass {
            high_volume: edge.volume > config.high_volume_threshold,
            frequent: edge.frequency > config.frequent_threshold,
            suspicious: suspicion.is_suspicious_pair(&edge.source, &edge.target),
        }
    }

    /// Every edge with its presentation class
    pub fn classified_edges(
        &self,
        config: &GraphConfig,
        suspicion: &SuspicionIndex,
    ) -> Vec<(CorrelationEdge, EdgeClass)> {
        self.edges()
            .into_iter()
            .map(|edge| {
                let class = self.classify(&edge, config, suspicion);
                (edge, class)
            })
            .collect()
    }
}

/// Activity summary for the focal address
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddressSummary {
    pub address: Address,
    pub transactions: usize,
    pub incoming_volume: f64,
    pub outgoing_volume: f64,
    pub unique_counterparties: usize,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    /// Volume moved per token, both directions
    pub volume_by_token: BTreeMap<String, f64>,
}

impl AddressSummary {
    /// Summarize the records that touch `address`
    pub fn from_records(address: &str, records: &[TransactionRecord]) -> Self {
        let mut summary = AddressSummary {
            address: address.to_string(),
            ..Default::default()
        };
        let mut counterparties: Vec<&str> = Vec::new();
        let mut first: Option<i64> = None;
        let mut last: Option<i64> = None;

        for record in records.iter().filter(|r| r.involves(address)) {
            summary.transactions += 1;
            if record.to == address {
                summary.incoming_volume += record.amount;
            }
            if record.from == address {
                summary.outgoing_volume += record.amount;
            }
            if let Some(other) = record.counterparty(address) {
                counterparties.push(other);
            }
            *summary
                .volume_by_token
                .entry(record.token.clone())
                .or_insert(0.0) += record.amount;
            first = Some(first.map_or(record.timestamp_ms, |f| f.min(record.timestamp_ms)));
            last = Some(last.map_or(record.timestamp_ms, |l| l.max(record.timestamp_ms)));
        }

        counterparties.sort_unstable();
        counterparties.dedup();
        summary.unique_counterparties = counterparties.len();
        summary.first_seen = first.and_then(DateTime::from_timestamp_millis);
        summary.last_seen = last.and_then(DateTime::from_timestamp_millis);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(from: &str, to: &str, amount: f64, ts: i64, sig: &str) -> TransactionRecord {
        TransactionRecord::new(from, to, amount, "SOL", ts, sig)
    }

    fn sample() -> Vec<TransactionRecord> {
        vec![
            rec("A", "B", 5.0, 1, "s1"),
            rec("A", "B", 7.0, 2, "s2"),
            rec("B", "A", 1.0, 3, "s3"),
            rec("A", "C", 0.5, 4, "s4"),
            rec("D", "A", 2.0, 5, "s5"),
            rec("C", "D", 3.0, 6, "s6"),
        ]
    }

    #[test]
    fn test_edges_aggregate_pairs() {
        let graph = CorrelationGraph::build("A", &sample());
        assert_eq!(graph.node_count(), 4);
        assert_eq!(graph.edge_count(), 5);

        let ab = graph.edge("A", "B").unwrap();
        assert_eq!(ab.frequency, 2);
        assert_eq!(ab.volume, 12.0);

        let ba = graph.edge("B", "A").unwrap();
        assert_eq!(ba.frequency, 1);
        assert!(graph.edge("B", "C").is_none());
    }

    #[test]
    fn test_edge_frequencies_sum_to_record_count() {
        let records = sample();
        let graph = CorrelationGraph::build("A", &records);
        let total: u64 = graph.edges().iter().map(|e| e.frequency).sum();
        assert_eq!(total as usize, records.len());
        assert_eq!(graph.record_count(), records.len());
    }

    #[test]
    fn test_strengths_sum_to_one() {
        let graph = CorrelationGraph::build("A", &sample());
        for address in graph.nodes() {
            let correlation = graph.correlation(address).unwrap();
            let sum: f64 = correlation.ranked.iter().map(|e| e.strength).sum();
            assert!((sum - 1.0).abs() < 1e-9, "strengths for {} sum to {}", address, sum);
        }
    }

    #[test]
    fn test_ranking_tie_break() {
        // A: B x3, C x1, D x1, E x1 -> ties among C/D/E broken lexicographically
        let records = vec![
            rec("A", "B", 1.0, 1, "s1"),
            rec("B", "A", 1.0, 2, "s2"),
            rec("A", "B", 1.0, 3, "s3"),
            rec("A", "E", 1.0, 4, "s4"),
            rec("D", "A", 1.0, 5, "s5"),
            rec("A", "C", 1.0, 6, "s6"),
        ];
        let graph = CorrelationGraph::build("A", &records);
        let correlation = graph.correlation("A").unwrap();
        assert_eq!(correlation.total_interactions, 6);
        let order: Vec<&str> = correlation.ranked.iter().map(|e| e.address.as_str()).collect();
        assert_eq!(order, vec!["B", "C", "D", "E"]);
        assert_eq!(correlation.ranked[0].strength, 0.5);

        let top: Vec<&str> = correlation.top(3).iter().map(|e| e.address.as_str()).collect();
        assert_eq!(top, vec!["B", "C", "D"]);
    }

    #[test]
    fn test_empty_batch_has_only_focal() {
        let graph = CorrelationGraph::build("X", &[]);
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.correlation("X").is_none());
        let view = graph.correlations(3);
        assert_eq!(view.len(), 1);
        assert!(view[0].ranked.is_empty());
    }

    #[test]
    fn test_merge_matches_single_fold() {
        let records = sample();
        let single = EdgeAccumulator::default().fold(&records).finish("A");
        let merged = EdgeAccumulator::default()
            .fold(&records[..2])
            .merge(EdgeAccumulator::default().fold(&records[2..5]))
            .merge(EdgeAccumulator::default().fold(&records[5..]))
            .finish("A");

        let nodes_single: Vec<&str> = single.nodes().collect();
        let nodes_merged: Vec<&str> = merged.nodes().collect();
        assert_eq!(nodes_single, nodes_merged);

        for (a, b) in single.edges().iter().zip(merged.edges().iter()) {
            assert_eq!(a.source, b.source);
            assert_eq!(a.target, b.target);
            assert_eq!(a.frequency, b.frequency);
            assert!((a.volume - b.volume).abs() < 1e-9);
        }
        assert_eq!(single.correlations(3), merged.correlations(3));
    }

    #[tokio::test]
    async fn test_chunked_build_independent_of_chunk_size() {
        let records = sample();
        let reference = CorrelationGraph::build("A", &records);
        let token = CancellationToken::new();
        for chunk_size in [1, 2, 4, 100] {
            let chunked = CorrelationGraph::build_chunked("A", &records, chunk_size, &token)
                .await
                .unwrap();
            assert_eq!(chunked.edge_count(), reference.edge_count());
            assert_eq!(chunked.correlations(3), reference.correlations(3));
        }
    }

    #[tokio::test]
    async fn test_chunked_build_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let result = CorrelationGraph::build_chunked("A", &sample(), 2, &token).await;
        assert!(matches!(result, Err(Error::Superseded { .. })));
    }

    #[test]
    fn test_edge_classification() {
        let mut records = vec![rec("A", "B", 20.0, 0, "big")];
        for i in 0..4 {
            records.push(rec("C", "D", 1.0, i * 10, &format!("f{}", i)));
        }
        let graph = CorrelationGraph::build("A", &records);
        let suspicion = SuspicionIndex::build(&records, &Default::default());
        let config = GraphConfig::default();

        let ab = graph.edge("A", "B").unwrap();
        let class = graph.classify(&ab, &config, &suspicion);
        assert!(class.high_volume);
        assert!(!class.frequent);
        assert!(!class.suspicious);

        let cd = graph.edge("C", "D").unwrap();
        let class = graph.classify(&cd, &config, &suspicion);
        assert!(!class.high_volume);
        assert!(class.frequent);
        assert!(class.suspicious);
    }

    #[test]
    fn test_address_summary() {
        let summary = AddressSummary::from_records("A", &sample());
        assert_eq!(summary.transactions, 5);
        assert_eq!(summary.outgoing_volume, 12.5);
        assert_eq!(summary.incoming_volume, 3.0);
        assert_eq!(summary.unique_counterparties, 3);
        assert_eq!(summary.first_seen.unwrap().timestamp_millis(), 1);
        assert_eq!(summary.last_seen.unwrap().timestamp_millis(), 5);
        assert_eq!(summary.volume_by_token["SOL"], 15.5);
    }
}
