//! Analytical core
//!
//! Pure batch computation over normalized records: correlation graph,
//! clusters, behavioral patterns and risk, plus the engine that sequences
//! them.

pub mod cluster;
pub mod engine;
pub mod graph;
pub mod palette;
pub mod patterns;
pub mod risk;

pub use cluster::{Cluster, ClusterConfig, ClusterResolver, RelatedCluster};
pub use engine::{AnalysisEngine, AnalysisReport, AnalysisSession, AnalysisTicket, ClassifiedEdge};
pub use graph::{
    AddressCorrelation, AddressSummary, CorrelationEdge, CorrelationEntry, CorrelationGraph,
    EdgeAccumulator, EdgeClass, GraphConfig,
};
pub use patterns::{MetadataValue, Pattern, PatternConfig, PatternDetector, PatternKind, Severity, SuspicionIndex};
pub use risk::{RiskAggregator, RiskConfig, RiskFactor, RiskLevel, RiskReport};
