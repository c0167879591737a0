//! Connectivity-based cluster resolution
//!
//! Expands outward from the focal address up to a fixed number of hops, then
//! groups the reached addresses by weakly-connected component. Each cluster
//! carries aggregate statistics, a heuristic suspicion score and the other
//! clusters it trades with.

use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::debug;

use crate::analysis::graph::CorrelationGraph;
use crate::error::{Error, Result};
use crate::ledger::types::{Address, TransactionRecord};

/// Configuration for cluster resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Hops from the focal address to include (1 to 3)
    #[serde(default = "default_depth")]
    pub depth: usize,

    /// Drop clusters with fewer transactions (applied after scoring)
    #[serde(default)]
    pub min_transactions: usize,

    /// Drop clusters with less volume (applied after scoring)
    #[serde(default)]
    pub min_volume: f64,

    /// Volume at which the volume signal saturates
    #[serde(default = "default_volume_norm")]
    pub volume_norm: f64,

    /// Transaction count at which the activity signal saturates
    #[serde(default = "default_transaction_norm")]
    pub transaction_norm: f64,

    /// Related-cluster count at which the fan-out signal saturates
    #[serde(default = "default_fan_out_norm")]
    pub fan_out_norm: f64,

    #[serde(default = "default_volume_weight")]
    pub volume_weight: f64,

    #[serde(default = "default_transaction_weight")]
    pub transaction_weight: f64,

    #[serde(default = "default_fan_out_weight")]
    pub fan_out_weight: f64,

    /// Related-cluster links at or below this strength are dropped
    #[serde(default = "default_related_min_strength")]
    pub related_min_strength: f64,

    /// Keep the focal address in its own cluster and never merge through it
    #[serde(default = "default_isolate_focal")]
    pub isolate_focal: bool,
}

fn default_depth() -> usize {
    2
}
fn default_volume_norm() -> f64 {
    100.0
}
fn default_transaction_norm() -> f64 {
    50.0
}
fn default_fan_out_norm() -> f64 {
    5.0
}
fn default_volume_weight() -> f64 {
    0.4
}
fn default_transaction_weight() -> f64 {
    0.4
}
fn default_fan_out_weight() -> f64 {
    0.2
}
fn default_related_min_strength() -> f64 {
    0.1
}
fn default_isolate_focal() -> bool {
    false
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            depth: default_depth(),
            min_transactions: 0,
            min_volume: 0.0,
            volume_norm: default_volume_norm(),
            transaction_norm: default_transaction_norm(),
            fan_out_norm: default_fan_out_norm(),
            volume_weight: default_volume_weight(),
            transaction_weight: default_transaction_weight(),
            fan_out_weight: default_fan_out_weight(),
            related_min_strength: default_related_min_strength(),
            isolate_focal: default_isolate_focal(),
        }
    }
}

/// Link to another cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedCluster {
    pub id: String,
    /// Shared edge frequency over frequency leaving either cluster (0.0 to 1.0)
    pub strength: f64,
}

/// A group of addresses treated as one analytical unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub id: String,
    pub label: String,
    pub addresses: BTreeSet<Address>,
    /// Records whose sender or receiver is in the cluster
    pub transactions: usize,
    pub volume: f64,
    pub suspicious_score: f64,
    pub related_clusters: Vec<RelatedCluster>,
    pub contains_focal: bool,
}

impl Cluster {
    pub fn contains(&self, address: &str) -> bool {
        self.addresses.contains(address)
    }

    pub fn size(&self) -> usize {
        self.addresses.len()
    }
}

/// Cluster resolver
pub struct ClusterResolver {
    config: ClusterConfig,
}

impl ClusterResolver {
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Resolve clusters around the graph's focal address
    ///
    /// An empty batch, or a focal address without transactions, yields no
    /// clusters. Depth outside 1..=3 is rejected.
    pub fn resolve(
        &self,
        graph: &CorrelationGraph,
        records: &[TransactionRecord],
    ) -> Result<Vec<Cluster>> {
        let cfg = &self.config;
        if !(1..=3).contains(&cfg.depth) {
            return Err(Error::InvalidInput(format!(
                "cluster depth must be 1, 2 or 3, got {}",
                cfg.depth
            )));
        }

        let focal = graph.focal();
        if records.is_empty() || graph.neighbors(focal).is_empty() {
            return Ok(Vec::new());
        }

        let reached = self.expand(graph);
        let groups = self.components(graph, &reached);

        // Address -> cluster position
        let mut membership: HashMap<&str, usize> = HashMap::new();
        for (i, group) in groups.iter().enumerate() {
            for &address in group {
                membership.insert(address, i);
            }
        }

        let mut stats = vec![(0usize, 0.0f64); groups.len()];
        for record in records {
            let from = membership.get(record.from.as_str()).copied();
            let to = membership.get(record.to.as_str()).copied();
            for i in [from, to].into_iter().flatten().collect::<BTreeSet<_>>() {
                stats[i].0 += 1;
                stats[i].1 += record.amount;
            }
        }

        let flows = ClusterFlows::measure(graph, &groups);
        let all: Vec<usize> = (0..groups.len()).collect();
        let fan_out = flows.related(&all, cfg.related_min_strength);

        let mut clusters: Vec<(usize, Cluster)> = groups
            .iter()
            .enumerate()
            .map(|(i, group)| {
                let (transactions, volume) = stats[i];
                let score = self.score(volume, transactions, fan_out[i].len());
                let contains_focal = group.contains(&focal);
                let addresses: BTreeSet<Address> =
                    group.iter().map(|a| a.to_string()).collect();
                let label = if contains_focal && addresses.len() == 1 {
                    "Focal address".to_string()
                } else {
                    format!("Cluster {} ({} addresses)", i + 1, addresses.len())
                };
                (
                    i,
                    Cluster {
                        id: cluster_id(i),
                        label,
                        addresses,
                        transactions,
                        volume,
                        suspicious_score: score,
                        related_clusters: Vec::new(),
                        contains_focal,
                    },
                )
            })
            .collect();

        let before = clusters.len();
        clusters.retain(|(_, c)| {
            c.transactions >= cfg.min_transactions && c.volume >= cfg.min_volume
        });

        let survivors: Vec<usize> = clusters.iter().map(|(i, _)| *i).collect();
        let related = flows.related(&survivors, cfg.related_min_strength);
        for (i, cluster) in clusters.iter_mut() {
            cluster.related_clusters = related[*i]
                .iter()
                .map(|&(j, strength)| RelatedCluster {
                    id: cluster_id(j),
                    strength,
                })
                .collect();
        }

        debug!(
            focal = %focal,
            depth = %cfg.depth,
            reached = %reached.len(),
            clusters = %before,
            kept = %clusters.len(),
            "Clusters resolved"
        );

        Ok(clusters.into_iter().map(|(_, c)| c).collect())
    }

    /// Breadth-first expansion from the focal address, in discovery order
    fn expand<'g>(&self, graph: &'g CorrelationGraph) -> Vec<&'g str> {
        let focal = graph.focal();
        let mut seen: HashSet<&str> = HashSet::from([focal]);
        let mut order = vec![focal];
        let mut queue = VecDeque::from([(focal, 0usize)]);

        while let Some((address, hops)) = queue.pop_front() {
            if hops == self.config.depth {
                continue;
            }
            for neighbor in graph.neighbors(address) {
                if seen.insert(neighbor) {
                    order.push(neighbor);
                    queue.push_back((neighbor, hops + 1));
                }
            }
        }
        order
    }

    /// Weakly-connected components among the reached addresses
    fn components<'g>(&self, graph: &'g CorrelationGraph, reached: &[&'g str]) -> Vec<Vec<&'g str>> {
        let focal = graph.focal();
        let included: HashSet<&str> = reached.iter().copied().collect();
        let mut assigned: HashSet<&str> = HashSet::new();
        let mut groups = Vec::new();

        for &start in reached {
            if assigned.contains(start) {
                continue;
            }
            let isolated = self.config.isolate_focal && start == focal;

            let mut group = Vec::new();
            let mut stack = vec![start];
            while let Some(address) = stack.pop() {
                if !assigned.insert(address) {
                    continue;
                }
                group.push(address);
                if isolated {
                    break;
                }
                for neighbor in graph.neighbors(address) {
                    if self.config.isolate_focal && neighbor == focal {
                        continue;
                    }
                    if included.contains(neighbor) && !assigned.contains(neighbor) {
                        stack.push(neighbor);
                    }
                }
            }
            groups.push(group);
        }
        groups
    }

    fn score(&self, volume: f64, transactions: usize, related: usize) -> f64 {
        let cfg = &self.config;
        let volume_signal = ratio(volume, cfg.volume_norm);
        let activity_signal = ratio(transactions as f64, cfg.transaction_norm);
        let fan_out_signal = ratio(related as f64, cfg.fan_out_norm);

        let score = cfg.volume_weight * volume_signal
            + cfg.transaction_weight * activity_signal
            + cfg.fan_out_weight * fan_out_signal;
        if score.is_nan() {
            0.0
        } else {
            score.clamp(0.0, 1.0)
        }
    }
}

impl Default for ClusterResolver {
    fn default() -> Self {
        Self::new(ClusterConfig::default())
    }
}

fn cluster_id(index: usize) -> String {
    format!("cluster-{}", index + 1)
}

/// `value / norm` saturating at 1
fn ratio(value: f64, norm: f64) -> f64 {
    if norm <= 0.0 {
        return 0.0;
    }
    (value / norm).min(1.0)
}

/// Edge frequency flowing between and out of clusters
struct ClusterFlows {
    /// Frequency of edges leaving each cluster
    leaving: Vec<u64>,
    /// Frequency of edges between two clusters, keyed `(low, high)`
    shared: HashMap<(usize, usize), u64>,
}

impl ClusterFlows {
    fn measure(graph: &CorrelationGraph, groups: &[Vec<&str>]) -> Self {
        let mut by_node: HashMap<NodeIndex, usize> = HashMap::new();
        for (i, group) in groups.iter().enumerate() {
            for address in group {
                if let Some(idx) = graph.node_index(address) {
                    by_node.insert(idx, i);
                }
            }
        }

        let mut leaving = vec![0u64; groups.len()];
        let mut shared: HashMap<(usize, usize), u64> = HashMap::new();
        for edge in graph.inner().edge_references() {
            let Some(&from) = by_node.get(&edge.source()) else {
                continue;
            };
            let to = by_node.get(&edge.target()).copied();
            if to == Some(from) {
                continue;
            }
            let frequency = edge.weight().frequency;
            leaving[from] += frequency;
            if let Some(to) = to {
                *shared.entry((from.min(to), from.max(to))).or_insert(0) += frequency;
            }
        }
        Self { leaving, shared }
    }

    /// Links above `min_strength` among `members`, per cluster, in member order
    fn related(&self, members: &[usize], min_strength: f64) -> Vec<Vec<(usize, f64)>> {
        let mut links = vec![Vec::new(); self.leaving.len()];
        for (n, &i) in members.iter().enumerate() {
            for &j in &members[n + 1..] {
                let Some(&shared) = self.shared.get(&(i.min(j), i.max(j))) else {
                    continue;
                };
                let total = self.leaving[i] + self.leaving[j];
                if total == 0 {
                    continue;
                }
                let strength = (shared as f64 / total as f64).min(1.0);
                if strength > min_strength {
                    links[i].push((j, strength));
                    links[j].push((i, strength));
                }
            }
        }
        for list in &mut links {
            list.sort_by_key(|&(j, _)| j);
        }
        links
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(from: &str, to: &str, amount: f64, ts: i64, sig: &str) -> TransactionRecord {
        TransactionRecord::new(from, to, amount, "SOL", ts, sig)
    }

    /// X trades with two separate groups: {A, B} and {C, D}
    fn sample() -> Vec<TransactionRecord> {
        vec![
            rec("X", "A", 10.0, 1, "s1"),
            rec("A", "B", 20.0, 2, "s2"),
            rec("B", "A", 5.0, 3, "s3"),
            rec("X", "C", 1.0, 4, "s4"),
            rec("C", "D", 2.0, 5, "s5"),
        ]
    }

    fn resolve(config: ClusterConfig, focal: &str, records: &[TransactionRecord]) -> Vec<Cluster> {
        let graph = CorrelationGraph::build(focal, records);
        ClusterResolver::new(config).resolve(&graph, records).unwrap()
    }

    fn isolated() -> ClusterConfig {
        ClusterConfig {
            isolate_focal: true,
            ..Default::default()
        }
    }

    fn members(cluster: &Cluster) -> Vec<&str> {
        cluster.addresses.iter().map(|a| a.as_str()).collect()
    }

    #[test]
    fn test_empty_records_yield_no_clusters() {
        assert!(resolve(ClusterConfig::default(), "X", &[]).is_empty());
    }

    #[test]
    fn test_focal_without_transactions_yields_no_clusters() {
        let records = vec![rec("A", "B", 1.0, 1, "s1")];
        assert!(resolve(ClusterConfig::default(), "X", &records).is_empty());
    }

    #[test]
    fn test_invalid_depth_rejected() {
        let records = sample();
        let graph = CorrelationGraph::build("X", &records);
        let config = ClusterConfig {
            depth: 4,
            ..Default::default()
        };
        let err = ClusterResolver::new(config).resolve(&graph, &records).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_focal_isolated_clusters() {
        let clusters = resolve(isolated(), "X", &sample());
        assert_eq!(clusters.len(), 3);

        assert_eq!(members(&clusters[0]), vec!["X"]);
        assert!(clusters[0].contains_focal);
        assert_eq!(members(&clusters[1]), vec!["A", "B"]);
        assert_eq!(members(&clusters[2]), vec!["C", "D"]);

        assert_eq!(clusters[0].id, "cluster-1");
        assert_eq!(clusters[0].transactions, 2);
        assert!((clusters[0].volume - 11.0).abs() < 1e-9);
        assert_eq!(clusters[1].transactions, 3);
        assert!((clusters[1].volume - 35.0).abs() < 1e-9);
    }

    #[test]
    fn test_default_clusters_are_weak_components() {
        let clusters = resolve(ClusterConfig::default(), "X", &sample());
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].size(), 5);
        assert_eq!(clusters[0].transactions, 5);
        assert!(clusters[0].contains_focal);
        assert!(clusters[0].related_clusters.is_empty());
    }

    #[test]
    fn test_depth_limits_expansion() {
        let config = ClusterConfig {
            depth: 1,
            ..Default::default()
        };
        let clusters = resolve(config, "X", &sample());
        let all: BTreeSet<&str> = clusters.iter().flat_map(members).collect();
        assert_eq!(all, BTreeSet::from(["A", "C", "X"]));
    }

    #[test]
    fn test_clusters_partition_reached_addresses() {
        for depth in 1..=3 {
            for isolate_focal in [true, false] {
                let config = ClusterConfig {
                    depth,
                    isolate_focal,
                    ..Default::default()
                };
                let clusters = resolve(config, "X", &sample());
                let mut seen = HashSet::new();
                for cluster in &clusters {
                    for address in &cluster.addresses {
                        assert!(seen.insert(address.clone()), "{} in two clusters", address);
                    }
                }
            }
        }
    }

    #[test]
    fn test_related_clusters_and_score() {
        let clusters = resolve(isolated(), "X", &sample());

        // X has one edge into each group and two edges leaving in total
        let focal = &clusters[0];
        assert_eq!(
            focal.related_clusters,
            vec![
                RelatedCluster { id: "cluster-2".into(), strength: 0.5 },
                RelatedCluster { id: "cluster-3".into(), strength: 0.5 },
            ]
        );

        // 0.4 * 35/100 + 0.4 * 3/50 + 0.2 * 1/5
        assert!((clusters[1].suspicious_score - 0.204).abs() < 1e-9);
        for cluster in &clusters {
            assert!((0.0..=1.0).contains(&cluster.suspicious_score));
            for link in &cluster.related_clusters {
                assert!(link.strength > 0.1 && link.strength <= 1.0);
            }
        }
    }

    #[test]
    fn test_filter_applies_after_scoring() {
        let config = ClusterConfig {
            min_transactions: 3,
            ..isolated()
        };
        let clusters = resolve(config, "X", &sample());
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].id, "cluster-2");
        // Fan-out still reflects the link to the dropped focal cluster
        assert!((clusters[0].suspicious_score - 0.204).abs() < 1e-9);
        assert!(clusters[0].related_clusters.is_empty());
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let records = sample();
        let first = resolve(ClusterConfig::default(), "X", &records);
        let second = resolve(ClusterConfig::default(), "X", &records);
        assert_eq!(first, second);
    }
}
