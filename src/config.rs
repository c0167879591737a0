//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::ledger::types::EntityLabel;

// Re-export stage configs
pub use crate::analysis::cluster::ClusterConfig;
pub use crate::analysis::graph::GraphConfig;
pub use crate::analysis::patterns::PatternConfig;
pub use crate::analysis::risk::RiskConfig;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    /// Static entity labels for display
    #[serde(default)]
    pub labels: Vec<EntityLabel>,
}

/// Indexer / ledger query service settings
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Transactions requested per fetch when no limit is given
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_ledger_endpoint(),
            api_key: String::new(),
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            page_limit: default_page_limit(),
        }
    }
}

/// Analysis engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub patterns: PatternConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    /// Records folded per slice before yielding to the runtime
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Optional regex the focal address must match
    #[serde(default)]
    pub address_pattern: Option<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            graph: GraphConfig::default(),
            cluster: ClusterConfig::default(),
            patterns: PatternConfig::default(),
            risk: RiskConfig::default(),
            chunk_size: default_chunk_size(),
            address_pattern: None,
        }
    }
}

fn default_ledger_endpoint() -> String {
    "https://api.helius.xyz".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    250
}

fn default_page_limit() -> u32 {
    100
}

fn default_chunk_size() -> usize {
    2_048
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Start with defaults
            .set_default("ledger.endpoint", default_ledger_endpoint())?
            .set_default("ledger.timeout_ms", default_timeout_ms() as i64)?
            .set_default("ledger.max_retries", default_max_retries() as i64)?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix FORENSICS_)
            .add_source(
                config::Environment::with_prefix("FORENSICS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.ledger.endpoint.is_empty() {
            anyhow::bail!("ledger.endpoint cannot be empty");
        }

        if self.ledger.timeout_ms == 0 {
            anyhow::bail!("ledger.timeout_ms must be positive");
        }

        let analysis = &self.analysis;

        if !(1..=3).contains(&analysis.cluster.depth) {
            anyhow::bail!(
                "analysis.cluster.depth must be 1, 2 or 3, got {}",
                analysis.cluster.depth
            );
        }

        if analysis.chunk_size == 0 {
            anyhow::bail!("analysis.chunk_size must be positive");
        }

        if analysis.graph.top_k == 0 {
            anyhow::bail!("analysis.graph.top_k must be positive");
        }

        if analysis.patterns.window_ms <= 0 {
            anyhow::bail!("analysis.patterns.window_ms must be positive");
        }

        let ratio = analysis.patterns.layering_forward_ratio;
        if ratio <= 0.0 || ratio > 1.0 {
            anyhow::bail!("analysis.patterns.layering_forward_ratio must be in (0, 1]");
        }

        let weights = [
            analysis.cluster.volume_weight,
            analysis.cluster.transaction_weight,
            analysis.cluster.fan_out_weight,
        ];
        if weights.iter().any(|w| *w < 0.0) {
            anyhow::bail!("analysis.cluster weights cannot be negative");
        }

        let risk = &analysis.risk;
        for (name, value) in [
            ("low_multiplier", risk.low_multiplier),
            ("medium_multiplier", risk.medium_multiplier),
            ("high_multiplier", risk.high_multiplier),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("analysis.risk.{} must be in [0, 1], got {}", name, value);
            }
        }

        // Validate address pattern (compile regex to check)
        if let Some(pattern) = &analysis.address_pattern {
            regex::Regex::new(pattern)
                .with_context(|| format!("Invalid address_pattern regex: {}", pattern))?;
        }

        for label in &self.labels {
            if label.address.is_empty() {
                anyhow::bail!("Label entry with empty address: {}", label.label);
            }
            if !(0.0..=1.0).contains(&label.confidence) {
                anyhow::bail!("Label confidence for {} must be in [0, 1]", label.address);
            }
        }

        if analysis.cluster.min_volume < 0.0 {
            anyhow::bail!("analysis.cluster.min_volume cannot be negative");
        }

        Ok(())
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  Ledger:
    endpoint: {}
    api_key: {}
    timeout: {}ms
    max_retries: {}
    page_limit: {}
  Graph:
    top_k: {}
    high_volume_threshold: {}
    frequent_threshold: {}
  Clusters:
    depth: {}
    min_transactions: {}
    min_volume: {}
    isolate_focal: {}
  Patterns:
    window: {}ms
    rapid_min_count: {}
    wash_min_volume: {}
    layering_forward_ratio: {}
  Risk:
    multipliers: low={} medium={} high={}
  Labels: {}
"#,
            mask_url(&self.ledger.endpoint),
            if self.ledger.api_key.is_empty() {
                "(not set)"
            } else {
                "***"
            },
            self.ledger.timeout_ms,
            self.ledger.max_retries,
            self.ledger.page_limit,
            self.analysis.graph.top_k,
            self.analysis.graph.high_volume_threshold,
            self.analysis.graph.frequent_threshold,
            self.analysis.cluster.depth,
            self.analysis.cluster.min_transactions,
            self.analysis.cluster.min_volume,
            self.analysis.cluster.isolate_focal,
            self.analysis.patterns.window_ms,
            self.analysis.patterns.rapid_min_count,
            self.analysis.patterns.wash_min_volume,
            self.analysis.patterns.layering_forward_ratio,
            self.analysis.risk.low_multiplier,
            self.analysis.risk.medium_multiplier,
            self.analysis.risk.high_multiplier,
            self.labels.len(),
        )
    }
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            analysis: AnalysisConfig::default(),
            labels: Vec::new(),
        }
    }
}
