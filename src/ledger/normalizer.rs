//! Record normalizer
//!
//! Converts heterogeneous provider transfers (native and token) into the
//! canonical [`TransactionRecord`] shape. Entries that cannot be normalized
//! are skipped and counted; a bad entry never fails the batch.

use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::error::Error;
use crate::ledger::types::{
    NativeTransfer, RawTransfer, TokenTransfer, TransactionRecord, LAMPORTS_PER_NATIVE,
    NATIVE_TOKEN,
};

/// Why an entry was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingFrom,
    MissingTo,
    MissingTimestamp,
    MissingAmount,
    InvalidAmount,
    DuplicateSignature,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MissingFrom => "missing from",
            SkipReason::MissingTo => "missing to",
            SkipReason::MissingTimestamp => "missing timestamp",
            SkipReason::MissingAmount => "missing amount",
            SkipReason::InvalidAmount => "negative or non-finite amount",
            SkipReason::DuplicateSignature => "duplicate signature",
        }
    }
}

/// Per-reason skip counters for one batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SkipReport {
    pub missing_from: usize,
    pub missing_to: usize,
    pub missing_timestamp: usize,
    pub missing_amount: usize,
    pub invalid_amount: usize,
    pub duplicate_signature: usize,
}

impl SkipReport {
    fn record(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::MissingFrom => self.missing_from += 1,
            SkipReason::MissingTo => self.missing_to += 1,
            SkipReason::MissingTimestamp => self.missing_timestamp += 1,
            SkipReason::MissingAmount => self.missing_amount += 1,
            SkipReason::InvalidAmount => self.invalid_amount += 1,
            SkipReason::DuplicateSignature => self.duplicate_signature += 1,
        }
    }

    /// Total number of skipped entries
    pub fn total(&self) -> usize {
        self.missing_from
            + self.missing_to
            + self.missing_timestamp
            + self.missing_amount
            + self.invalid_amount
            + self.duplicate_signature
    }
}

/// Output of one normalization pass
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    /// Records sorted by `(timestamp_ms, signature)`
    pub records: Vec<TransactionRecord>,
    pub skipped: SkipReport,
}

/// Normalize provider entries into canonical records
pub fn normalize(entries: &[RawTransfer]) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    let mut seen: HashSet<String> = HashSet::with_capacity(entries.len());

    for (index, entry) in entries.iter().enumerate() {
        let result = match entry {
            RawTransfer::Native(native) => normalize_native(native, index),
            RawTransfer::Token(token) => normalize_token(token, index),
        };

        match result {
            Ok(record) => {
                if !seen.insert(record.signature.clone()) {
                    skip(&mut batch.skipped, index, SkipReason::DuplicateSignature);
                    continue;
                }
                batch.records.push(record);
            }
            Err(reason) => skip(&mut batch.skipped, index, reason),
        }
    }

    batch.records.sort_by(|a, b| {
        a.timestamp_ms
            .cmp(&b.timestamp_ms)
            .then_with(|| a.signature.cmp(&b.signature))
    });

    if batch.skipped.total() > 0 {
        warn!(
            kept = %batch.records.len(),
            skipped = %batch.skipped.total(),
            "Some transfer entries could not be normalized"
        );
    }

    batch
}

fn skip(report: &mut SkipReport, index: usize, reason: SkipReason) {
    let error = Error::PartialData(format!("entry {}: {}", index, reason.as_str()));
    debug!(error = %error, "Skipping transfer entry");
    report.record(reason);
}

fn signature_or_placeholder(signature: &str, index: usize) -> String {
    if signature.is_empty() {
        format!("unsigned/{}", index)
    } else {
        signature.to_string()
    }
}

fn required_endpoints(
    from: &Option<String>,
    to: &Option<String>,
    timestamp_ms: Option<i64>,
) -> Result<(String, String, i64), SkipReason> {
    let from = from
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or(SkipReason::MissingFrom)?;
    let to = to
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or(SkipReason::MissingTo)?;
    let timestamp_ms = timestamp_ms.ok_or(SkipReason::MissingTimestamp)?;
    Ok((from.to_string(), to.to_string(), timestamp_ms))
}

fn normalize_native(
    entry: &NativeTransfer,
    index: usize,
) -> Result<TransactionRecord, SkipReason> {
    let (from, to, timestamp_ms) = required_endpoints(&entry.from, &entry.to, entry.timestamp_ms)?;
    let lamports = entry.lamports.ok_or(SkipReason::MissingAmount)?;

    Ok(TransactionRecord {
        from,
        to,
        amount: lamports as f64 / LAMPORTS_PER_NATIVE,
        token: NATIVE_TOKEN.to_string(),
        timestamp_ms,
        signature: signature_or_placeholder(&entry.signature, index),
    })
}

fn normalize_token(entry: &TokenTransfer, index: usize) -> Result<TransactionRecord, SkipReason> {
    let (from, to, timestamp_ms) = required_endpoints(&entry.from, &entry.to, entry.timestamp_ms)?;
    let amount = entry.amount.ok_or(SkipReason::MissingAmount)?;
    if !amount.is_finite() || amount < 0.0 {
        return Err(SkipReason::InvalidAmount);
    }

    Ok(TransactionRecord {
        from,
        to,
        amount,
        token: entry
            .mint
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "UNKNOWN".to_string()),
        timestamp_ms,
        signature: signature_or_placeholder(&entry.signature, index),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native(sig: &str, from: Option<&str>, to: Option<&str>, lamports: u64, ts: Option<i64>) -> RawTransfer {
        RawTransfer::Native(NativeTransfer {
            signature: sig.to_string(),
            from: from.map(String::from),
            to: to.map(String::from),
            lamports: Some(lamports),
            timestamp_ms: ts,
        })
    }

    #[test]
    fn test_native_amount_conversion() {
        let batch = normalize(&[native("s1", Some("A"), Some("B"), 2_500_000_000, Some(10))]);
        assert_eq!(batch.records.len(), 1);
        let record = &batch.records[0];
        assert_eq!(record.amount, 2.5);
        assert_eq!(record.token, NATIVE_TOKEN);
        assert_eq!(record.timestamp_ms, 10);
    }

    #[test]
    fn test_token_transfer_keeps_mint() {
        let entry = RawTransfer::Token(TokenTransfer {
            signature: "s1".to_string(),
            from: Some("A".to_string()),
            to: Some("B".to_string()),
            mint: Some("MintX".to_string()),
            amount: Some(42.0),
            timestamp_ms: Some(1),
        });
        let batch = normalize(&[entry]);
        assert_eq!(batch.records[0].token, "MintX");
        assert_eq!(batch.records[0].amount, 42.0);
    }

    #[test]
    fn test_missing_fields_are_skipped_not_fatal() {
        let entries = vec![
            native("s1", None, Some("B"), 1, Some(1)),
            native("s2", Some("A"), None, 1, Some(1)),
            native("s3", Some("A"), Some("B"), 1, None),
            native("s4", Some("A"), Some("B"), 1, Some(4)),
        ];
        let batch = normalize(&entries);
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].signature, "s4");
        assert_eq!(batch.skipped.missing_from, 1);
        assert_eq!(batch.skipped.missing_to, 1);
        assert_eq!(batch.skipped.missing_timestamp, 1);
        assert_eq!(batch.skipped.total(), 3);
    }

    #[test]
    fn test_invalid_token_amount_skipped() {
        let entry = RawTransfer::Token(TokenTransfer {
            signature: "s1".to_string(),
            from: Some("A".to_string()),
            to: Some("B".to_string()),
            mint: None,
            amount: Some(-1.0),
            timestamp_ms: Some(1),
        });
        let batch = normalize(&[entry]);
        assert!(batch.records.is_empty());
        assert_eq!(batch.skipped.invalid_amount, 1);
    }

    #[test]
    fn test_duplicates_dropped_and_sorted() {
        let entries = vec![
            native("s2", Some("A"), Some("B"), 1, Some(20)),
            native("s1", Some("B"), Some("A"), 1, Some(10)),
            native("s2", Some("A"), Some("B"), 1, Some(20)),
        ];
        let batch = normalize(&entries);
        let sigs: Vec<&str> = batch.records.iter().map(|r| r.signature.as_str()).collect();
        assert_eq!(sigs, vec!["s1", "s2"]);
        assert_eq!(batch.skipped.duplicate_signature, 1);
    }

    #[test]
    fn test_empty_signature_gets_placeholder() {
        let batch = normalize(&[native("", Some("A"), Some("B"), 1, Some(1))]);
        assert_eq!(batch.records[0].signature, "unsigned/0");
    }
}
