//! Analysis pipeline orchestration
//!
//! [`AnalysisEngine`] runs graph → clusters ∥ patterns → risk over one record
//! batch, either synchronously or on the tokio runtime with chunked graph
//! building and cancellation between stages. [`AnalysisSession`] enforces
//! last-request-wins when investigators search again before a run finishes.

use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analysis::cluster::{Cluster, ClusterResolver};
use crate::analysis::graph::{
    AddressCorrelation, AddressSummary, CorrelationEdge, CorrelationGraph, EdgeClass,
};
use crate::analysis::palette;
use crate::analysis::patterns::{Pattern, PatternDetector, SuspicionIndex};
use crate::analysis::risk::{RiskAggregator, RiskReport};
use crate::config::AnalysisConfig;
use crate::error::{Error, Result};
use crate::ledger::normalizer::{normalize, SkipReport};
use crate::ledger::source::{EntityLabelSource, LedgerSource};
use crate::ledger::types::{EntityLabel, FetchOptions, RawTransfer, TransactionRecord};

/// Edge with its presentation class
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedEdge {
    #[serde(flatten)]
    pub edge: CorrelationEdge,
    #[serde(flatten)]
    pub class: EdgeClass,
}

/// Everything the presentation layer needs for one focal address
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub address: String,
    pub summary: AddressSummary,
    pub edges: Vec<ClassifiedEdge>,
    pub correlations: Vec<AddressCorrelation>,
    pub clusters: Vec<Cluster>,
    pub patterns: Vec<Pattern>,
    pub risk: RiskReport,
    /// Token symbol -> series color
    pub token_colors: BTreeMap<String, String>,
    /// Display labels for addresses in the graph
    pub labels: Vec<EntityLabel>,
    pub skipped: SkipReport,
}

/// Stateless pipeline over one record batch
#[derive(Debug, Clone)]
pub struct AnalysisEngine {
    config: AnalysisConfig,
    address_pattern: Option<Regex>,
}

impl AnalysisEngine {
    pub fn new(config: AnalysisConfig) -> Result<Self> {
        let address_pattern = config
            .address_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| Error::Config(format!("Invalid address_pattern: {}", e)))?;

        Ok(Self {
            config,
            address_pattern,
        })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Reject malformed focal addresses before any work is done
    pub fn validate_address(&self, address: &str) -> Result<()> {
        if address.is_empty()
            || address
                .chars()
                .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(Error::InvalidAddress(address.to_string()));
        }
        if let Some(pattern) = &self.address_pattern {
            if !pattern.is_match(address) {
                return Err(Error::InvalidAddress(address.to_string()));
            }
        }
        Ok(())
    }

    /// Run the full pipeline synchronously
    pub fn analyze(&self, focal: &str, records: &[TransactionRecord]) -> Result<AnalysisReport> {
        self.validate_address(focal)?;

        let graph = CorrelationGraph::build(focal, records);
        let clusters = ClusterResolver::new(self.config.cluster.clone()).resolve(&graph, records)?;
        let patterns = PatternDetector::new(self.config.patterns.clone()).detect(records);
        let risk = self.risk(focal, &patterns, &clusters);

        Ok(self.assemble(&graph, records, clusters, patterns, risk))
    }

    /// Run the pipeline on the runtime
    ///
    /// The graph is folded in bounded chunks; clusters and patterns run in
    /// parallel on blocking threads; risk waits for patterns. Returns
    /// [`Error::Superseded`] as soon as `cancel` fires.
    pub async fn analyze_async(
        &self,
        focal: &str,
        records: Arc<Vec<TransactionRecord>>,
        cancel: &CancellationToken,
    ) -> Result<AnalysisReport> {
        self.validate_address(focal)?;

        let graph = CorrelationGraph::build_chunked(
            focal,
            &records,
            self.config.chunk_size,
            cancel,
        )
        .await?;
        let graph = Arc::new(graph);
        ensure_current(focal, cancel)?;

        let cluster_task = {
            let graph = Arc::clone(&graph);
            let records = Arc::clone(&records);
            let resolver = ClusterResolver::new(self.config.cluster.clone());
            tokio::task::spawn_blocking(move || resolver.resolve(&graph, &records))
        };
        let pattern_task = {
            let records = Arc::clone(&records);
            let detector = PatternDetector::new(self.config.patterns.clone());
            tokio::task::spawn_blocking(move || detector.detect(&records))
        };

        let (clusters, patterns) = tokio::join!(cluster_task, pattern_task);
        let clusters = clusters
            .map_err(|e| Error::Internal(format!("Cluster task failed: {}", e)))??;
        let patterns =
            patterns.map_err(|e| Error::Internal(format!("Pattern task failed: {}", e)))?;
        ensure_current(focal, cancel)?;

        let risk = self.risk(focal, &patterns, &clusters);
        Ok(self.assemble(&graph, &records, clusters, patterns, risk))
    }

    fn risk(&self, focal: &str, patterns: &[Pattern], clusters: &[Cluster]) -> RiskReport {
        RiskAggregator::new(self.config.risk.clone()).aggregate_with_clusters(
            focal, patterns, clusters,
        )
    }

    fn assemble(
        &self,
        graph: &CorrelationGraph,
        records: &[TransactionRecord],
        clusters: Vec<Cluster>,
        patterns: Vec<Pattern>,
        risk: RiskReport,
    ) -> AnalysisReport {
        let suspicion = SuspicionIndex::build(records, &self.config.patterns);
        let edges = graph
            .classified_edges(&self.config.graph, &suspicion)
            .into_iter()
            .map(|(edge, class)| ClassifiedEdge { edge, class })
            .collect();

        let token_colors = records
            .iter()
            .map(|r| r.token.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|t| (t.to_string(), palette::token_color(t)))
            .collect();

        AnalysisReport {
            address: graph.focal().to_string(),
            summary: AddressSummary::from_records(graph.focal(), records),
            edges,
            correlations: graph.correlations(self.config.graph.top_k),
            clusters,
            patterns,
            risk,
            token_colors,
            labels: Vec::new(),
            skipped: SkipReport::default(),
        }
    }
}

fn ensure_current(focal: &str, cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Superseded {
            address: focal.to_string(),
        });
    }
    Ok(())
}

/// Handle for one analysis request
#[derive(Debug, Clone)]
pub struct AnalysisTicket {
    pub generation: u64,
    pub address: String,
    cancel: CancellationToken,
}

impl AnalysisTicket {
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Last-request-wins coordinator for an investigator session
///
/// Each [`begin`](Self::begin) supersedes the previous request; only the
/// newest generation may publish its report.
pub struct AnalysisSession {
    engine: AnalysisEngine,
    generation: AtomicU64,
    current: RwLock<CancellationToken>,
    latest: RwLock<Option<AnalysisReport>>,
}

impl AnalysisSession {
    pub fn new(engine: AnalysisEngine) -> Self {
        Self {
            engine,
            generation: AtomicU64::new(0),
            current: RwLock::new(CancellationToken::new()),
            latest: RwLock::new(None),
        }
    }

    pub fn engine(&self) -> &AnalysisEngine {
        &self.engine
    }

    /// Start a request, cancelling any in-flight one
    pub async fn begin(&self, address: &str) -> AnalysisTicket {
        let cancel = CancellationToken::new();
        let (previous, generation) = {
            let mut current = self.current.write().await;
            let previous = std::mem::replace(&mut *current, cancel.clone());
            // Token and generation advance together under the guard
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            (previous, generation)
        };
        previous.cancel();

        debug!(address = %address, generation = %generation, "Analysis request started");

        AnalysisTicket {
            generation,
            address: address.to_string(),
            cancel,
        }
    }

    pub fn is_current(&self, ticket: &AnalysisTicket) -> bool {
        ticket.generation == self.generation.load(Ordering::SeqCst) && !ticket.is_cancelled()
    }

    /// Store a report if its request is still the newest
    pub async fn publish(&self, ticket: &AnalysisTicket, report: AnalysisReport) -> Result<()> {
        let mut latest = self.latest.write().await;
        if !self.is_current(ticket) {
            debug!(
                address = %ticket.address,
                generation = %ticket.generation,
                "Discarding stale analysis"
            );
            return Err(Error::Superseded {
                address: ticket.address.clone(),
            });
        }
        *latest = Some(report);
        Ok(())
    }

    /// Most recently published report
    pub async fn latest(&self) -> Option<AnalysisReport> {
        self.latest.read().await.clone()
    }

    /// Fetch transfers breadth-first around `address`
    ///
    /// Hop 0 fetches the focal address; each further hop fetches the
    /// counterparties first seen in the previous one, up to the cluster depth.
    /// Entries returned by an earlier fetch are dropped, so only duplicates
    /// inside one fetch reach the normalizer's skip report.
    async fn fetch_neighborhood(
        &self,
        ticket: &AnalysisTicket,
        ledger: &dyn LedgerSource,
        options: &FetchOptions,
    ) -> Result<Vec<RawTransfer>> {
        let depth = self.engine.config().cluster.depth;
        if !(1..=3).contains(&depth) {
            return Err(Error::InvalidInput(format!(
                "cluster depth must be 1, 2 or 3, got {}",
                depth
            )));
        }
        let mut visited: HashSet<String> = HashSet::from([ticket.address.clone()]);
        let mut frontier = vec![ticket.address.clone()];
        let mut entries = Vec::new();
        let mut collected: HashSet<String> = HashSet::new();

        for hop in 0..depth {
            if frontier.is_empty() {
                break;
            }
            let mut next = BTreeSet::new();
            for address in &frontier {
                let fetched = tokio::select! {
                    _ = ticket.token().cancelled() => {
                        return Err(Error::Superseded { address: ticket.address.clone() });
                    }
                    fetched = ledger.fetch_transfers(address, options) => fetched?,
                };
                let fresh: Vec<RawTransfer> = fetched
                    .into_iter()
                    .filter(|e| !collected.contains(e.signature()))
                    .collect();
                for entry in &fresh {
                    let (from, to) = entry.parties();
                    for party in [from, to].into_iter().flatten() {
                        if !visited.contains(party) {
                            next.insert(party.to_string());
                        }
                    }
                }
                collected.extend(fresh.iter().map(|e| e.signature().to_string()));
                entries.extend(fresh);
            }
            debug!(
                address = %ticket.address,
                hop = %hop,
                fetched = %frontier.len(),
                entries = %entries.len(),
                "Ledger hop complete"
            );
            visited.extend(next.iter().cloned());
            frontier = next.into_iter().collect();
        }

        Ok(entries)
    }

    /// Fetch, normalize, analyze and publish one address
    ///
    /// Fetch errors propagate unchanged. Label lookup failures only cost the
    /// labels.
    pub async fn run(
        &self,
        address: &str,
        ledger: &dyn LedgerSource,
        labels: Option<&dyn EntityLabelSource>,
        options: &FetchOptions,
    ) -> Result<AnalysisReport> {
        self.engine.validate_address(address)?;
        let ticket = self.begin(address).await;

        let entries = self.fetch_neighborhood(&ticket, ledger, options).await?;

        let batch = normalize(&entries);
        info!(
            address = %address,
            source = %ledger.name(),
            entries = %entries.len(),
            records = %batch.records.len(),
            "Ledger batch loaded"
        );

        let records = Arc::new(batch.records);
        let mut report = self
            .engine
            .analyze_async(address, records, ticket.token())
            .await?;
        report.skipped = batch.skipped;

        if let Some(source) = labels {
            let addresses: Vec<String> = report
                .edges
                .iter()
                .flat_map(|e| [e.edge.source.clone(), e.edge.target.clone()])
                .chain(std::iter::once(address.to_string()))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            match source.labels(&addresses).await {
                Ok(found) => report.labels = found,
                Err(e) => warn!(address = %address, error = %e, "Entity label lookup failed"),
            }
        }

        self.publish(&ticket, report.clone()).await?;

        info!(
            address = %address,
            clusters = %report.clusters.len(),
            patterns = %report.patterns.len(),
            risk = %format!("{:.3}", report.risk.overall_risk_score),
            "Analysis complete"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::patterns::PatternKind;
    use crate::ledger::source::{InMemoryLedger, StaticLabelSource};
    use crate::ledger::types::{EntityKind, NativeTransfer};

    const MIN: i64 = 60_000;

    fn rec(from: &str, to: &str, amount: f64, ts: i64, sig: &str) -> TransactionRecord {
        TransactionRecord::new(from, to, amount, "SOL", ts, sig)
    }

    fn engine() -> AnalysisEngine {
        AnalysisEngine::new(AnalysisConfig::default()).unwrap()
    }

    fn mixed_batch() -> Vec<TransactionRecord> {
        let mut records = vec![
            rec("A", "B", 50.0, 0, "c1"),
            rec("B", "A", 50.0, 5 * MIN, "c2"),
            rec("A", "C", 100.0, 10 * MIN, "l1"),
            rec("C", "D", 95.0, 20 * MIN, "l2"),
            rec("D", "E", 92.0, 30 * MIN, "l3"),
        ];
        for i in 0..5 {
            records.push(rec("A", "F", 0.01, 40 * MIN + i * 1000, &format!("r{}", i)));
        }
        records
    }

    #[test]
    fn test_empty_batch_scenario() {
        let report = engine().analyze("X", &[]).unwrap();
        assert!(report.clusters.is_empty());
        assert!(report.patterns.is_empty());
        assert_eq!(report.risk.overall_risk_score, 0.0);
        assert!(report.edges.is_empty());
    }

    #[test]
    fn test_invalid_address_rejected() {
        let engine = engine();
        assert!(matches!(
            engine.analyze("", &[]),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(
            engine.analyze("has space", &[]),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_address_pattern_enforced() {
        let config = AnalysisConfig {
            address_pattern: Some("^[1-9A-HJ-NP-Za-km-z]{32,44}$".to_string()),
            ..Default::default()
        };
        let engine = AnalysisEngine::new(config).unwrap();
        assert!(engine.validate_address("short").is_err());
        assert!(engine
            .validate_address("9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM")
            .is_ok());
    }

    #[test]
    fn test_pipeline_detects_all_signatures() {
        let report = engine().analyze("A", &mixed_batch()).unwrap();
        let kinds: Vec<PatternKind> = report.patterns.iter().map(|p| p.kind).collect();
        assert!(kinds.contains(&PatternKind::CircularTrading));
        assert!(kinds.contains(&PatternKind::RapidSuccession));
        assert!(kinds.contains(&PatternKind::Layering));
        assert!(report.risk.overall_risk_score > 0.0);
        assert_eq!(report.edges.iter().map(|e| e.edge.frequency).sum::<u64>(), 10);
        assert!(report.token_colors.contains_key("SOL"));
    }

    #[test]
    fn test_pipeline_is_deterministic() {
        let records = mixed_batch();
        let engine = engine();
        let first = engine.analyze("A", &records).unwrap();
        let second = engine.analyze("A", &records).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_async_matches_sync() {
        let records = mixed_batch();
        let engine = engine();
        let sync = engine.analyze("A", &records).unwrap();
        let token = CancellationToken::new();
        let async_report = engine
            .analyze_async("A", Arc::new(records), &token)
            .await
            .unwrap();
        assert_eq!(sync.clusters, async_report.clusters);
        assert_eq!(sync.patterns, async_report.patterns);
        assert_eq!(sync.risk, async_report.risk);
    }

    #[tokio::test]
    async fn test_cancelled_analysis_is_superseded() {
        let token = CancellationToken::new();
        token.cancel();
        let result = engine()
            .analyze_async("A", Arc::new(mixed_batch()), &token)
            .await;
        assert!(matches!(result, Err(Error::Superseded { .. })));
    }

    #[test]
    fn test_stale_ticket_cannot_publish() {
        tokio_test::block_on(async {
            let session = AnalysisSession::new(engine());
            let first = session.begin("A").await;
            let second = session.begin("B").await;

            assert!(first.is_cancelled());
            assert!(!session.is_current(&first));
            assert!(session.is_current(&second));

            let stale = session.engine().analyze("A", &[]).unwrap();
            assert!(session.publish(&first, stale).await.is_err());

            let fresh = session.engine().analyze("B", &[]).unwrap();
            session.publish(&second, fresh).await.unwrap();
            assert_eq!(session.latest().await.unwrap().address, "B");
        });
    }

    fn native(sig: &str, from: &str, to: &str, lamports: u64, ts: i64) -> RawTransfer {
        RawTransfer::Native(NativeTransfer {
            signature: sig.into(),
            from: Some(from.into()),
            to: Some(to.into()),
            lamports: Some(lamports),
            timestamp_ms: Some(ts),
        })
    }

    fn chain_ledger() -> InMemoryLedger {
        InMemoryLedger::new(vec![
            native("h1", "A", "B", 100_000_000_000, 0),
            native("h2", "B", "C", 95_000_000_000, 10 * MIN),
            native("h3", "C", "D", 92_000_000_000, 20 * MIN),
        ])
    }

    fn session_with_depth(depth: usize) -> AnalysisSession {
        let mut config = AnalysisConfig::default();
        config.cluster.depth = depth;
        AnalysisSession::new(AnalysisEngine::new(config).unwrap())
    }

    #[tokio::test]
    async fn test_session_run_expands_to_cluster_depth() {
        let session = session_with_depth(3);
        let report = session
            .run("A", &chain_ledger(), None, &FetchOptions::default())
            .await
            .unwrap();

        assert_eq!(report.edges.len(), 3);
        assert_eq!(report.clusters.len(), 1);
        let addresses: Vec<&str> = report.clusters[0]
            .addresses
            .iter()
            .map(|a| a.as_str())
            .collect();
        assert_eq!(addresses, vec!["A", "B", "C", "D"]);
        assert!(report
            .patterns
            .iter()
            .any(|p| p.kind == PatternKind::Layering));
        // Transfers seen again from the counterparty side are not duplicates
        assert_eq!(report.skipped.total(), 0);
        assert_eq!(report.summary.transactions, 1);
    }

    #[tokio::test]
    async fn test_session_run_depth_one_fetches_focal_only() {
        let session = session_with_depth(1);
        let report = session
            .run("A", &chain_ledger(), None, &FetchOptions::default())
            .await
            .unwrap();

        assert_eq!(report.edges.len(), 1);
        assert_eq!(report.clusters.len(), 1);
        assert_eq!(report.clusters[0].size(), 2);
        assert!(!report
            .patterns
            .iter()
            .any(|p| p.kind == PatternKind::Layering));
    }

    #[test]
    fn test_concurrent_begin_leaves_one_current_ticket() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .build()
            .unwrap();
        runtime.block_on(async {
            let session = Arc::new(AnalysisSession::new(engine()));
            for _ in 0..200 {
                let handles: Vec<_> = (0..4)
                    .map(|i| {
                        let session = Arc::clone(&session);
                        tokio::spawn(async move { session.begin(&format!("A{}", i)).await })
                    })
                    .collect();
                let mut tickets = Vec::new();
                for handle in handles {
                    tickets.push(handle.await.unwrap());
                }
                let current = tickets.iter().filter(|t| session.is_current(t)).count();
                assert_eq!(current, 1);
            }
        });
    }

    #[tokio::test]
    async fn test_session_run_from_ledger() {
        let entries = vec![
            RawTransfer::Native(NativeTransfer {
                signature: "s1".into(),
                from: Some("A".into()),
                to: Some("B".into()),
                lamports: Some(2_000_000_000),
                timestamp_ms: Some(1_000),
            }),
            RawTransfer::Native(NativeTransfer {
                signature: "s2".into(),
                from: Some("A".into()),
                to: None,
                lamports: Some(1),
                timestamp_ms: Some(2_000),
            }),
        ];
        let ledger = InMemoryLedger::new(entries);
        let labels = StaticLabelSource::new(vec![EntityLabel {
            address: "B".into(),
            label: "Exchange hot wallet".into(),
            kind: EntityKind::Exchange,
            confidence: 0.9,
        }]);

        let session = AnalysisSession::new(engine());
        let report = session
            .run("A", &ledger, Some(&labels), &FetchOptions::default())
            .await
            .unwrap();

        assert_eq!(report.edges.len(), 1);
        assert_eq!(report.skipped.total(), 1);
        assert_eq!(report.labels.len(), 1);
        assert!((report.summary.outgoing_volume - 2.0).abs() < 1e-9);
        assert_eq!(session.latest().await, Some(report));
    }
}
