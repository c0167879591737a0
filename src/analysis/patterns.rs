//! Behavioral pattern detection
//!
//! Scans a transaction batch for known signatures:
//! - Rapid succession: many transfers on one pair inside a short window
//! - Circular trading: A→B answered by B→A shortly after
//! - Wash trading: high bidirectional volume and frequency on one pair
//! - Layering: funds forwarded hop by hop with almost no value retained
//!
//! Detectors are independent and may all fire on the same batch. A separate,
//! cheaper per-record heuristic ([`SuspicionIndex`]) flags individual records
//! for edge styling.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use tracing::debug;

use crate::ledger::types::{Address, TransactionRecord};

/// Configuration for pattern detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Rolling window shared by the temporal detectors (ms)
    #[serde(default = "default_window_ms")]
    pub window_ms: i64,

    /// Minimum transfers on one pair inside the window for rapid succession
    #[serde(default = "default_rapid_min_count")]
    pub rapid_min_count: usize,

    /// Pair volume that must be exceeded for wash trading
    #[serde(default = "default_wash_min_volume")]
    pub wash_min_volume: f64,

    /// Pair transfer count that must be exceeded for wash trading
    #[serde(default = "default_wash_min_count")]
    pub wash_min_count: usize,

    /// Volume at which the wash volume signal saturates
    #[serde(default = "default_wash_volume_norm")]
    pub wash_volume_norm: f64,

    /// Transfer count at which the wash frequency signal saturates
    #[serde(default = "default_wash_count_norm")]
    pub wash_count_norm: f64,

    #[serde(default = "default_signal_weight")]
    pub wash_volume_weight: f64,

    #[serde(default = "default_signal_weight")]
    pub wash_count_weight: f64,

    /// Minimum share of the received amount forwarded to the next hop
    #[serde(default = "default_layering_forward_ratio")]
    pub layering_forward_ratio: f64,

    /// Minimum addresses in a layering chain
    #[serde(default = "default_layering_min_addresses")]
    pub layering_min_addresses: usize,

    /// Confidence multiplier per hop beyond three
    #[serde(default = "default_layering_hop_decay")]
    pub layering_hop_decay: f64,

    /// Records below this amount are flagged for edge styling
    #[serde(default = "default_small_amount")]
    pub small_amount: f64,

    /// Pair frequency above which records are flagged for edge styling
    #[serde(default = "default_high_frequency_pair")]
    pub high_frequency_pair: u64,
}

fn default_window_ms() -> i64 {
    3_600_000
}
fn default_rapid_min_count() -> usize {
    4
}
fn default_wash_min_volume() -> f64 {
    100.0
}
fn default_wash_min_count() -> usize {
    3
}
fn default_wash_volume_norm() -> f64 {
    100.0
}
fn default_wash_count_norm() -> f64 {
    50.0
}
fn default_signal_weight() -> f64 {
    0.4
}
fn default_layering_forward_ratio() -> f64 {
    0.9
}
fn default_layering_min_addresses() -> usize {
    3
}
fn default_layering_hop_decay() -> f64 {
    0.85
}
fn default_small_amount() -> f64 {
    0.1
}
fn default_high_frequency_pair() -> u64 {
    3
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            rapid_min_count: default_rapid_min_count(),
            wash_min_volume: default_wash_min_volume(),
            wash_min_count: default_wash_min_count(),
            wash_volume_norm: default_wash_volume_norm(),
            wash_count_norm: default_wash_count_norm(),
            wash_volume_weight: default_signal_weight(),
            wash_count_weight: default_signal_weight(),
            layering_forward_ratio: default_layering_forward_ratio(),
            layering_min_addresses: default_layering_min_addresses(),
            layering_hop_decay: default_layering_hop_decay(),
            small_amount: default_small_amount(),
            high_frequency_pair: default_high_frequency_pair(),
        }
    }
}

/// Known behavioral signatures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatternKind {
    RapidSuccession,
    CircularTrading,
    WashTrading,
    Layering,
}

impl PatternKind {
    pub const ALL: [PatternKind; 4] = [
        PatternKind::RapidSuccession,
        PatternKind::CircularTrading,
        PatternKind::WashTrading,
        PatternKind::Layering,
    ];

    /// Human-readable name
    pub fn humanized(&self) -> &'static str {
        match self {
            PatternKind::RapidSuccession => "Rapid Succession",
            PatternKind::CircularTrading => "Circular Trading",
            PatternKind::WashTrading => "Wash Trading",
            PatternKind::Layering => "Layering",
        }
    }

    /// Wire identifier
    pub fn code(&self) -> &'static str {
        match self {
            PatternKind::RapidSuccession => "RAPID_SUCCESSION",
            PatternKind::CircularTrading => "CIRCULAR_TRADING",
            PatternKind::WashTrading => "WASH_TRADING",
            PatternKind::Layering => "LAYERING",
        }
    }

    /// Icon name for the risk panel
    pub fn icon(&self) -> &'static str {
        match self {
            PatternKind::RapidSuccession => "zap",
            PatternKind::CircularTrading => "refresh-cw",
            PatternKind::WashTrading => "repeat",
            PatternKind::Layering => "layers",
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Finding severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Band a confidence value
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.8 {
            Severity::High
        } else if confidence >= 0.5 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata value attached to a finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Number(f64),
    Text(String),
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        MetadataValue::Number(v)
    }
}

impl From<usize> for MetadataValue {
    fn from(v: usize) -> Self {
        MetadataValue::Number(v as f64)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        MetadataValue::Number(v as f64)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        MetadataValue::Text(v.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        MetadataValue::Text(v)
    }
}

/// A detected behavioral signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    #[serde(rename = "type")]
    pub kind: PatternKind,
    pub severity: Severity,
    /// Detection confidence (0.0 to 1.0)
    pub confidence: f64,
    pub description: String,
    pub metadata: BTreeMap<String, MetadataValue>,
}

impl Pattern {
    fn new(kind: PatternKind, confidence: f64, description: String) -> Self {
        let confidence = clamp_unit(confidence);
        Self {
            kind,
            severity: Severity::from_confidence(confidence),
            confidence,
            description,
            metadata: BTreeMap::new(),
        }
    }

    fn with(mut self, key: &str, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Numeric metadata lookup
    pub fn number(&self, key: &str) -> Option<f64> {
        match self.metadata.get(key) {
            Some(MetadataValue::Number(n)) => Some(*n),
            _ => None,
        }
    }

    /// Text metadata lookup
    pub fn text(&self, key: &str) -> Option<&str> {
        match self.metadata.get(key) {
            Some(MetadataValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// Records on one unordered pair, split by direction
#[derive(Default)]
struct PairActivity {
    /// Timestamps for `low -> high` (sorted)
    forward: Vec<i64>,
    /// Timestamps for `high -> low` (sorted)
    reverse: Vec<i64>,
    volume: f64,
}

impl PairActivity {
    fn count(&self) -> usize {
        self.forward.len() + self.reverse.len()
    }
}

/// Group non-self records by unordered pair, deterministically ordered
fn group_unordered(records: &[TransactionRecord]) -> BTreeMap<(&str, &str), PairActivity> {
    let mut groups: BTreeMap<(&str, &str), PairActivity> = BTreeMap::new();
    for record in records.iter().filter(|r| r.from != r.to) {
        let key = record.unordered_pair();
        let activity = groups.entry(key).or_default();
        if record.from.as_str() == key.0 {
            activity.forward.push(record.timestamp_ms);
        } else {
            activity.reverse.push(record.timestamp_ms);
        }
        activity.volume += record.amount;
    }
    for activity in groups.values_mut() {
        activity.forward.sort_unstable();
        activity.reverse.sort_unstable();
    }
    groups
}

/// Smallest absolute gap between two sorted timestamp lists
fn min_gap(a: &[i64], b: &[i64]) -> Option<i64> {
    let (mut i, mut j) = (0, 0);
    let mut best: Option<i64> = None;
    while i < a.len() && j < b.len() {
        let gap = (a[i] - b[j]).abs();
        best = Some(best.map_or(gap, |g| g.min(gap)));
        if a[i] < b[j] {
            i += 1;
        } else {
            j += 1;
        }
    }
    best
}

/// Pattern detector over one record batch
pub struct PatternDetector {
    config: PatternConfig,
}

impl PatternDetector {
    pub fn new(config: PatternConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PatternConfig {
        &self.config
    }

    /// Run every detector; an empty result is a normal outcome
    pub fn detect(&self, records: &[TransactionRecord]) -> Vec<Pattern> {
        if records.is_empty() {
            return Vec::new();
        }

        let pairs = group_unordered(records);

        let mut patterns = self.detect_rapid_succession(records);
        patterns.extend(self.detect_circular_trading(&pairs));
        patterns.extend(self.detect_wash_trading(&pairs));
        patterns.extend(self.detect_layering(records));

        debug!(
            records = %records.len(),
            patterns = %patterns.len(),
            "Pattern detection complete"
        );

        patterns
    }

    /// Many transfers on one ordered pair within a rolling window
    pub fn detect_rapid_succession(&self, records: &[TransactionRecord]) -> Vec<Pattern> {
        let min_count = self.config.rapid_min_count.max(1);
        let mut by_pair: BTreeMap<(&str, &str), Vec<i64>> = BTreeMap::new();
        for record in records {
            by_pair.entry(record.pair()).or_default().push(record.timestamp_ms);
        }

        let mut patterns = Vec::new();
        for ((from, to), mut times) in by_pair {
            if times.len() < min_count {
                continue;
            }
            times.sort_unstable();

            // Densest window: two pointers over sorted timestamps
            let (mut best_count, mut best_start, mut best_end) = (0usize, 0i64, 0i64);
            let mut lo = 0;
            for hi in 0..times.len() {
                while times[hi] - times[lo] > self.config.window_ms {
                    lo += 1;
                }
                let count = hi - lo + 1;
                if count > best_count {
                    best_count = count;
                    best_start = times[lo];
                    best_end = times[hi];
                }
            }

            if best_count < min_count {
                continue;
            }

            let confidence = best_count as f64 / (2 * min_count) as f64;
            let span_secs = (best_end - best_start) / 1000;
            patterns.push(
                Pattern::new(
                    PatternKind::RapidSuccession,
                    confidence,
                    format!(
                        "{} transfers from {} to {} within {}s",
                        best_count, from, to, span_secs
                    ),
                )
                .with("from", from)
                .with("to", to)
                .with("count", best_count)
                .with("windowStartMs", best_start)
                .with("windowEndMs", best_end),
            );
        }
        patterns
    }

    /// Opposite-direction transfers on one pair close in time
    fn detect_circular_trading(&self, pairs: &BTreeMap<(&str, &str), PairActivity>) -> Vec<Pattern> {
        let window = self.config.window_ms as f64;
        let mut patterns = Vec::new();

        for ((a, b), activity) in pairs {
            let Some(gap) = min_gap(&activity.forward, &activity.reverse) else {
                continue;
            };
            if gap > self.config.window_ms {
                continue;
            }

            let confidence = (1.0 - gap as f64 / window).max(0.0);
            patterns.push(
                Pattern::new(
                    PatternKind::CircularTrading,
                    confidence,
                    format!(
                        "Funds moved {} -> {} and back within {}s",
                        a,
                        b,
                        gap / 1000
                    ),
                )
                .with("addressA", *a)
                .with("addressB", *b)
                .with("minDeltaMs", gap)
                .with("forwardCount", activity.forward.len())
                .with("reverseCount", activity.reverse.len()),
            );
        }
        patterns
    }

    /// Heavy back-and-forth volume on one pair
    fn detect_wash_trading(&self, pairs: &BTreeMap<(&str, &str), PairActivity>) -> Vec<Pattern> {
        let cfg = &self.config;
        let mut patterns = Vec::new();

        for ((a, b), activity) in pairs {
            if activity.forward.is_empty() || activity.reverse.is_empty() {
                continue;
            }
            let count = activity.count();
            if activity.volume <= cfg.wash_min_volume || count <= cfg.wash_min_count {
                continue;
            }

            let volume_signal = (activity.volume / cfg.wash_volume_norm).min(1.0);
            let count_signal = (count as f64 / cfg.wash_count_norm).min(1.0);
            let weight_sum = cfg.wash_volume_weight + cfg.wash_count_weight;
            let confidence = if weight_sum > 0.0 {
                (cfg.wash_volume_weight * volume_signal + cfg.wash_count_weight * count_signal)
                    / weight_sum
            } else {
                0.0
            };

            patterns.push(
                Pattern::new(
                    PatternKind::WashTrading,
                    confidence,
                    format!(
                        "{} transfers worth {:.4} exchanged back and forth between {} and {}",
                        count, activity.volume, a, b
                    ),
                )
                .with("addressA", *a)
                .with("addressB", *b)
                .with("volume", activity.volume)
                .with("count", count),
            );
        }
        patterns
    }

    /// Chains of near-complete forwarding
    fn detect_layering(&self, records: &[TransactionRecord]) -> Vec<Pattern> {
        let cfg = &self.config;
        let min_addresses = cfg.layering_min_addresses.max(3);

        // Records in time order, and each sender's outgoing records in time order
        let mut order: Vec<usize> = (0..records.len()).collect();
        order.sort_by(|&a, &b| {
            records[a]
                .timestamp_ms
                .cmp(&records[b].timestamp_ms)
                .then_with(|| records[a].signature.cmp(&records[b].signature))
        });
        let mut outgoing: HashMap<&str, Vec<usize>> = HashMap::new();
        for &i in &order {
            outgoing.entry(records[i].from.as_str()).or_default().push(i);
        }

        // Best forwarding hop for every record
        let next: Vec<Option<usize>> = (0..records.len())
            .map(|i| self.forwarding_hop(records, &outgoing, i))
            .collect();
        let mut has_predecessor = vec![false; records.len()];
        for j in next.iter().flatten() {
            has_predecessor[*j] = true;
        }

        let mut used = vec![false; records.len()];
        let mut patterns = Vec::new();

        for &start in &order {
            if used[start] || has_predecessor[start] {
                continue;
            }

            let mut chain = vec![start];
            let mut addresses = vec![records[start].from.as_str(), records[start].to.as_str()];
            let mut current = start;
            while let Some(hop) = next[current] {
                if used[hop] || addresses.contains(&records[hop].to.as_str()) {
                    break;
                }
                chain.push(hop);
                addresses.push(records[hop].to.as_str());
                current = hop;
            }

            if addresses.len() < min_addresses {
                continue;
            }
            for &i in &chain {
                used[i] = true;
            }
            patterns.push(self.layering_pattern(records, &chain, &addresses));
        }
        patterns
    }

    /// Earliest unconsumed-eligible record forwarding record `i` onwards
    fn forwarding_hop(
        &self,
        records: &[TransactionRecord],
        outgoing: &HashMap<&str, Vec<usize>>,
        i: usize,
    ) -> Option<usize> {
        let incoming = &records[i];
        if incoming.amount <= 0.0 || incoming.from == incoming.to {
            return None;
        }
        let candidates = outgoing.get(incoming.to.as_str())?;
        let start = candidates.partition_point(|&c| records[c].timestamp_ms < incoming.timestamp_ms);
        let deadline = incoming.timestamp_ms + self.config.window_ms;

        candidates[start..]
            .iter()
            .copied()
            .take_while(|&c| records[c].timestamp_ms <= deadline)
            .find(|&c| {
                let out = &records[c];
                let ratio = out.amount / incoming.amount;
                c != i
                    && out.to != incoming.from
                    && out.to != out.from
                    && out.token == incoming.token
                    && ratio >= self.config.layering_forward_ratio
                    && ratio <= 1.0
            })
    }

    fn layering_pattern(
        &self,
        records: &[TransactionRecord],
        chain: &[usize],
        addresses: &[&str],
    ) -> Pattern {
        let hops = chain.len();
        let ratios: Vec<f64> = chain
            .windows(2)
            .map(|w| records[w[1]].amount / records[w[0]].amount)
            .collect();
        let mean_ratio = ratios.iter().sum::<f64>() / ratios.len().max(1) as f64;
        let extra_hops = hops.saturating_sub(3) as i32;
        let confidence = mean_ratio * self.config.layering_hop_decay.powi(extra_hops);

        let first = &records[chain[0]];
        let last = &records[chain[hops - 1]];
        let path = addresses.join(" -> ");

        Pattern::new(
            PatternKind::Layering,
            confidence,
            format!("Funds layered through {} hops: {}", hops, path),
        )
        .with("hops", hops)
        .with("path", path)
        .with("token", first.token.as_str())
        .with("initialAmount", first.amount)
        .with("finalAmount", last.amount)
        .with("durationMs", last.timestamp_ms - first.timestamp_ms)
    }
}

impl Default for PatternDetector {
    fn default() -> Self {
        Self::new(PatternConfig::default())
    }
}

/// Per-record suspicion flags used for edge styling
///
/// A record is suspicious if it is small, has an opposite-direction
/// counterpart inside the window, or sits on a high-frequency pair.
#[derive(Debug, Clone, Default)]
pub struct SuspicionIndex {
    flagged: HashSet<String>,
    pairs: HashSet<(Address, Address)>,
}

impl SuspicionIndex {
    pub fn build(records: &[TransactionRecord], config: &PatternConfig) -> Self {
        let mut times: HashMap<(&str, &str), Vec<i64>> = HashMap::new();
        for record in records {
            times.entry(record.pair()).or_default().push(record.timestamp_ms);
        }
        for list in times.values_mut() {
            list.sort_unstable();
        }

        let mut index = SuspicionIndex::default();
        for record in records {
            let (from, to) = record.pair();
            let frequency = times.get(&(from, to)).map_or(0, |t| t.len()) as u64;
            let circular = from != to
                && times
                    .get(&(to, from))
                    .map_or(false, |rev| has_within(rev, record.timestamp_ms, config.window_ms));

            if record.amount < config.small_amount || circular || frequency > config.high_frequency_pair {
                index.flagged.insert(record.signature.clone());
                index.pairs.insert((record.from.clone(), record.to.clone()));
            }
        }
        index
    }

    pub fn is_suspicious(&self, record: &TransactionRecord) -> bool {
        self.flagged.contains(&record.signature)
    }

    /// Check if any record on the ordered pair was flagged
    pub fn is_suspicious_pair(&self, from: &str, to: &str) -> bool {
        self.pairs.contains(&(from.to_string(), to.to_string()))
    }

    pub fn flagged_count(&self) -> usize {
        self.flagged.len()
    }
}

/// Check if a sorted list has a value within `window` of `ts`
fn has_within(sorted: &[i64], ts: i64, window: i64) -> bool {
    let idx = sorted.partition_point(|&t| t < ts - window);
    sorted.get(idx).map_or(false, |&t| t <= ts + window)
}
