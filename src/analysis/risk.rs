//! Risk aggregation
//!
//! Turns detected patterns into a single report: one weighted factor per
//! pattern, an overall score (confidence-weighted average where severity
//! raises the weight) and fixed-rule recommendations.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use tracing::debug;

use crate::analysis::cluster::Cluster;
use crate::analysis::patterns::{Pattern, PatternKind, Severity};

/// Configuration for risk aggregation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_low_multiplier")]
    pub low_multiplier: f64,
    #[serde(default = "default_medium_multiplier")]
    pub medium_multiplier: f64,
    #[serde(default = "default_high_multiplier")]
    pub high_multiplier: f64,

    /// Overall score at which escalation is recommended
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: f64,

    /// Focal cluster suspicion at which it becomes a risk factor
    #[serde(default = "default_cluster_exposure_threshold")]
    pub cluster_exposure_threshold: f64,
}

fn default_low_multiplier() -> f64 {
    0.5
}
fn default_medium_multiplier() -> f64 {
    0.75
}
fn default_high_multiplier() -> f64 {
    1.0
}
fn default_escalation_threshold() -> f64 {
    0.7
}
fn default_cluster_exposure_threshold() -> f64 {
    0.5
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            low_multiplier: default_low_multiplier(),
            medium_multiplier: default_medium_multiplier(),
            high_multiplier: default_high_multiplier(),
            escalation_threshold: default_escalation_threshold(),
            cluster_exposure_threshold: default_cluster_exposure_threshold(),
        }
    }
}

impl RiskConfig {
    pub fn multiplier(&self, severity: Severity) -> f64 {
        match severity {
            Severity::Low => self.low_multiplier,
            Severity::Medium => self.medium_multiplier,
            Severity::High => self.high_multiplier,
        }
    }
}

/// Display band for the overall score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Minimal,
    Low,
    Elevated,
    High,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.75 {
            RiskLevel::High
        } else if score >= 0.5 {
            RiskLevel::Elevated
        } else if score >= 0.25 {
            RiskLevel::Low
        } else {
            RiskLevel::Minimal
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Minimal => write!(f, "minimal"),
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Elevated => write!(f, "elevated"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

/// One weighted contribution to the overall score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub name: String,
    /// Severity-weighted confidence (0.0 to 1.0)
    pub score: f64,
    pub description: String,
}

/// Aggregate risk for one focal address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskReport {
    pub address: String,
    pub overall_risk_score: f64,
    pub risk_level: RiskLevel,
    pub risk_factors: Vec<RiskFactor>,
    pub recommendations: Vec<String>,
}

impl RiskReport {
    /// Report for an address with nothing to flag
    pub fn clean(address: &str) -> Self {
        Self {
            address: address.to_string(),
            overall_risk_score: 0.0,
            risk_level: RiskLevel::Minimal,
            risk_factors: Vec::new(),
            recommendations: vec![RECOMMEND_ROUTINE.to_string()],
        }
    }
}

const RECOMMEND_ROUTINE: &str = "No suspicious patterns detected; continue routine monitoring";
const RECOMMEND_ESCALATE: &str =
    "Escalate the address for enhanced due diligence before further interaction";
const RECOMMEND_CLUSTER: &str =
    "Review the counterparties sharing a cluster with this address";

/// Fixed recommendation per pattern kind
pub fn recommendation_for(kind: PatternKind) -> &'static str {
    match kind {
        PatternKind::RapidSuccession => {
            "Investigate automated or scripted transfer activity between repeated counterparties"
        }
        PatternKind::CircularTrading => "Review transaction pairs for wash-trading intent",
        PatternKind::WashTrading => {
            "Compare reported volume against independent counterparties to discount artificial volume"
        }
        PatternKind::Layering => {
            "Trace downstream hops to identify the final beneficiary of layered funds"
        }
    }
}

/// Factor plus its weight in the overall average
struct Contribution {
    factor: RiskFactor,
    weight: f64,
}

/// Risk aggregator
pub struct RiskAggregator {
    config: RiskConfig,
}

impl RiskAggregator {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Aggregate detected patterns into a report
    ///
    /// Pure and deterministic: the same pattern set always yields an
    /// identical report.
    pub fn aggregate(&self, address: &str, patterns: &[Pattern]) -> RiskReport {
        let contributions: Vec<Contribution> =
            patterns.iter().map(|p| self.contribution(p)).collect();
        self.report(address, patterns, contributions, false)
    }

    /// Aggregate patterns plus exposure from the focal address' cluster
    pub fn aggregate_with_clusters(
        &self,
        address: &str,
        patterns: &[Pattern],
        clusters: &[Cluster],
    ) -> RiskReport {
        let mut contributions: Vec<Contribution> =
            patterns.iter().map(|p| self.contribution(p)).collect();

        let exposure = clusters
            .iter()
            .filter(|c| c.contains(address))
            .map(|c| c.suspicious_score)
            .fold(None, |best: Option<f64>, s| Some(best.map_or(s, |b| b.max(s))));

        let mut exposed = false;
        if let Some(score) = exposure {
            if score >= self.config.cluster_exposure_threshold {
                exposed = true;
                contributions.push(Contribution {
                    factor: RiskFactor {
                        name: "Cluster Exposure".to_string(),
                        score: clamp_unit(score),
                        description: format!(
                            "Address belongs to a cluster with suspicion score {:.2}",
                            score
                        ),
                    },
                    weight: clamp_unit(score),
                });
            }
        }

        self.report(address, patterns, contributions, exposed)
    }

    fn contribution(&self, pattern: &Pattern) -> Contribution {
        let multiplier = self.config.multiplier(pattern.severity);
        let score = clamp_unit(pattern.confidence * multiplier);
        Contribution {
            factor: RiskFactor {
                name: pattern.kind.humanized().to_string(),
                score,
                description: pattern.description.clone(),
            },
            weight: multiplier * pattern.confidence,
        }
    }

    fn report(
        &self,
        address: &str,
        patterns: &[Pattern],
        contributions: Vec<Contribution>,
        cluster_exposed: bool,
    ) -> RiskReport {
        if contributions.is_empty() {
            return RiskReport::clean(address);
        }

        let mut weighted_sum = 0.0;
        let mut weight_sum = 0.0;
        for c in &contributions {
            weighted_sum += c.factor.score * c.weight;
            weight_sum += c.weight;
        }
        let overall = if weight_sum > 0.0 {
            clamp_unit(weighted_sum / weight_sum)
        } else {
            0.0
        };

        let mut risk_factors: Vec<RiskFactor> =
            contributions.into_iter().map(|c| c.factor).collect();
        risk_factors.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.description.cmp(&b.description))
        });

        let mut recommendations: Vec<String> = PatternKind::ALL
            .iter()
            .filter(|kind| patterns.iter().any(|p| p.kind == **kind))
            .map(|kind| recommendation_for(*kind).to_string())
            .collect();
        if cluster_exposed {
            recommendations.push(RECOMMEND_CLUSTER.to_string());
        }
        if recommendations.is_empty() {
            recommendations.push(RECOMMEND_ROUTINE.to_string());
        }
        if overall >= self.config.escalation_threshold {
            recommendations.push(RECOMMEND_ESCALATE.to_string());
        }

        debug!(
            address = %address,
            factors = %risk_factors.len(),
            score = %format!("{:.3}", overall),
            "Risk aggregated"
        );

        RiskReport {
            address: address.to_string(),
            overall_risk_score: overall,
            risk_level: RiskLevel::from_score(overall),
            risk_factors,
            recommendations,
        }
    }
}

impl Default for RiskAggregator {
    fn default() -> Self {
        Self::new(RiskConfig::default())
    }
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}
