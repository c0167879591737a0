//! CLI command implementations

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::analysis::palette;
use crate::analysis::{AnalysisEngine, AnalysisReport, AnalysisSession};
use crate::config::Config;
use crate::ledger::{
    EntityLabelSource, FetchOptions, HttpLedgerClient, InMemoryLedger, LedgerSource, RawTransfer,
    StaticLabelSource,
};

/// Options for the `analyze` command
#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    /// Read raw transfers from a JSON file instead of the indexer
    pub input: Option<PathBuf>,
    pub depth: Option<usize>,
    pub min_transactions: Option<usize>,
    pub min_volume: Option<f64>,
    pub limit: Option<u32>,
    pub json: bool,
}

/// Analyze one address and print the report
pub async fn analyze(config: &Config, address: &str, options: AnalyzeOptions) -> Result<()> {
    let mut analysis = config.analysis.clone();
    if let Some(depth) = options.depth {
        analysis.cluster.depth = depth;
    }
    if let Some(min_transactions) = options.min_transactions {
        analysis.cluster.min_transactions = min_transactions;
    }
    if let Some(min_volume) = options.min_volume {
        analysis.cluster.min_volume = min_volume;
    }

    let engine = AnalysisEngine::new(analysis)?;
    let session = AnalysisSession::new(engine);
    let labels = StaticLabelSource::new(config.labels.clone());
    let fetch = FetchOptions {
        limit: options.limit,
        ..Default::default()
    };

    let ledger: Box<dyn LedgerSource> = match &options.input {
        Some(path) => Box::new(InMemoryLedger::new(load_transfers(path)?)),
        None => Box::new(HttpLedgerClient::new(&config.ledger)?),
    };
    info!(address = %address, source = %ledger.name(), "Analyzing address");

    let label_source: Option<&dyn EntityLabelSource> =
        if labels.is_empty() { None } else { Some(&labels) };
    let report = match session
        .run(address, ledger.as_ref(), label_source, &fetch)
        .await
    {
        Ok(report) => report,
        Err(e) if e.is_superseded() => {
            info!(address = %address, "Analysis superseded, result discarded");
            return Ok(());
        }
        Err(e) => return Err(e).with_context(|| format!("Analysis of {} failed", address)),
    };

    if options.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
        println!("{}", json);
    } else {
        print_report(&report);
    }

    Ok(())
}

/// Load a JSON array of raw transfers
fn load_transfers(path: &Path) -> Result<Vec<RawTransfer>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let entries: Vec<RawTransfer> = serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse transfers from {}", path.display()))?;
    debug!(path = %path.display(), entries = %entries.len(), "Loaded transfer file");
    Ok(entries)
}

/// Render a report as text
pub fn render_report(report: &AnalysisReport) -> String {
    let mut out = String::new();
    let summary = &report.summary;
    let label_for = |address: &str| {
        report
            .labels
            .iter()
            .find(|l| l.address == address)
            .map(|l| format!(" ({})", l.label))
            .unwrap_or_default()
    };

    out.push_str(&format!("\n=== ADDRESS {}{} ===\n\n", report.address, label_for(&report.address)));
    out.push_str(&format!("Transactions: {}\n", summary.transactions));
    out.push_str(&format!("Incoming:     {:.4}\n", summary.incoming_volume));
    out.push_str(&format!("Outgoing:     {:.4}\n", summary.outgoing_volume));
    out.push_str(&format!("Counterparties: {}\n", summary.unique_counterparties));
    if let (Some(first), Some(last)) = (summary.first_seen, summary.last_seen) {
        out.push_str(&format!("Active: {} .. {}\n", first.to_rfc3339(), last.to_rfc3339()));
    }
    for (token, volume) in &summary.volume_by_token {
        let color = report
            .token_colors
            .get(token)
            .map(String::as_str)
            .unwrap_or("-");
        out.push_str(&format!("  {} {:.4} [{}]\n", token, volume, color));
    }
    if report.skipped.total() > 0 {
        out.push_str(&format!("Skipped entries: {}\n", report.skipped.total()));
    }

    let risk = &report.risk;
    out.push_str(&format!(
        "\n=== RISK: {:.2} ({}) ===\n\n",
        risk.overall_risk_score, risk.risk_level
    ));
    for factor in &risk.risk_factors {
        out.push_str(&format!("  [{:.2}] {}: {}\n", factor.score, factor.name, factor.description));
    }
    out.push_str("\nRecommendations:\n");
    for recommendation in &risk.recommendations {
        out.push_str(&format!("  - {}\n", recommendation));
    }

    out.push_str("\n=== PATTERNS ===\n\n");
    if report.patterns.is_empty() {
        out.push_str("No patterns detected.\n");
    }
    for pattern in &report.patterns {
        out.push_str(&format!(
            "  [{}] {} {} {} conf={:.2} {}\n",
            pattern.kind.icon(),
            pattern.kind.humanized(),
            palette::pattern_color(pattern.kind),
            pattern.severity,
            pattern.confidence,
            pattern.description
        ));
    }

    out.push_str("\n=== CLUSTERS ===\n\n");
    if report.clusters.is_empty() {
        out.push_str("No clusters.\n");
    }
    for cluster in &report.clusters {
        out.push_str(&format!(
            "  {} {} [{}] tx={} volume={:.4} suspicion={:.2}\n",
            cluster.id,
            cluster.label,
            palette::cluster_color(cluster),
            cluster.transactions,
            cluster.volume,
            cluster.suspicious_score
        ));
        for link in &cluster.related_clusters {
            out.push_str(&format!("      -> {} ({:.2})\n", link.id, link.strength));
        }
    }

    if let Some(focal) = report
        .correlations
        .iter()
        .find(|c| c.address == report.address)
    {
        out.push_str("\n=== TOP COUNTERPARTIES ===\n\n");
        for entry in &focal.ranked {
            out.push_str(&format!(
                "  {}{} strength={:.2} ({} transfers)\n",
                entry.address,
                label_for(&entry.address),
                entry.strength,
                entry.frequency
            ));
        }
    }

    out
}

fn print_report(report: &AnalysisReport) {
    println!("{}", render_report(report));
}

/// Show current configuration (secrets masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::types::TransactionRecord;
    use std::io::Write;

    #[test]
    fn test_load_transfers_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"[{{"kind": "native", "signature": "s1", "from": "A", "to": "B", "lamports": 1000000000, "timestampMs": 1}}]"#
        )
        .unwrap();
        let entries = load_transfers(file.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(load_transfers(Path::new("/nonexistent/transfers.json")).is_err());
    }

    #[test]
    fn test_render_report_sections() {
        let records = vec![
            TransactionRecord::new("A", "B", 50.0, "SOL", 0, "s1"),
            TransactionRecord::new("B", "A", 50.0, "SOL", 300_000, "s2"),
        ];
        let engine = AnalysisEngine::new(Default::default()).unwrap();
        let report = engine.analyze("A", &records).unwrap();
        let text = render_report(&report);
        assert!(text.contains("=== ADDRESS A ==="));
        assert!(text.contains("Circular Trading"));
        assert!(text.contains("TOP COUNTERPARTIES"));
    }

    #[tokio::test]
    async fn test_analyze_from_input_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"[{{"kind": "token", "signature": "t1", "from": "A", "to": "C", "mint": "USDC", "amount": 3.0, "timestampMs": 10}}]"#
        )
        .unwrap();
        let options = AnalyzeOptions {
            input: Some(file.path().to_path_buf()),
            json: true,
            ..Default::default()
        };
        analyze(&Config::default(), "A", options).await.unwrap();
    }
}
