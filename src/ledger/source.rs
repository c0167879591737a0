//! Collaborator contracts for ledger data and entity labels

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::ledger::types::{EntityKind, EntityLabel, FetchOptions, RawTransfer};

/// External ledger / indexing service
///
/// Implementations own their retry policy; callers receive fetch errors
/// unchanged.
#[async_trait]
pub trait LedgerSource: Send + Sync {
    /// Fetch raw transfer entries touching `address`
    async fn fetch_transfers(&self, address: &str, options: &FetchOptions) -> Result<Vec<RawTransfer>>;

    /// Source name for logging
    fn name(&self) -> &'static str;
}

/// External entity-label service (display only)
#[async_trait]
pub trait EntityLabelSource: Send + Sync {
    /// Labels for the given addresses; unknown addresses are omitted
    async fn labels(&self, addresses: &[String]) -> Result<Vec<EntityLabel>>;
}

/// Ledger source over a fixed set of entries (file input, tests)
pub struct InMemoryLedger {
    entries: Vec<RawTransfer>,
}

impl InMemoryLedger {
    pub fn new(entries: Vec<RawTransfer>) -> Self {
        Self { entries }
    }

    fn touches(entry: &RawTransfer, address: &str) -> bool {
        let (from, to) = entry.parties();
        from == Some(address) || to == Some(address)
    }

    fn timestamp(entry: &RawTransfer) -> Option<i64> {
        match entry {
            RawTransfer::Native(t) => t.timestamp_ms,
            RawTransfer::Token(t) => t.timestamp_ms,
        }
    }
}

#[async_trait]
impl LedgerSource for InMemoryLedger {
    async fn fetch_transfers(&self, address: &str, options: &FetchOptions) -> Result<Vec<RawTransfer>> {
        let limit = options.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(self
            .entries
            .iter()
            .filter(|e| Self::touches(e, address))
            // Entries without a timestamp pass through; the normalizer drops them
            .filter(|e| Self::timestamp(e).map_or(true, |ts| options.contains(ts)))
            .take(limit)
            .cloned()
            .collect())
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

/// Label source backed by a fixed table
pub struct StaticLabelSource {
    labels: DashMap<String, EntityLabel>,
}

impl StaticLabelSource {
    pub fn new(labels: Vec<EntityLabel>) -> Self {
        let map = DashMap::new();
        for label in labels {
            map.insert(label.address.clone(), label);
        }
        Self { labels: map }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Kind of an address, `Unknown` if unlabeled
    pub fn kind_of(&self, address: &str) -> EntityKind {
        self.labels
            .get(address)
            .map(|l| l.kind)
            .unwrap_or(EntityKind::Unknown)
    }
}

#[async_trait]
impl EntityLabelSource for StaticLabelSource {
    async fn labels(&self, addresses: &[String]) -> Result<Vec<EntityLabel>> {
        Ok(addresses
            .iter()
            .filter_map(|a| self.labels.get(a).map(|l| l.clone()))
            .collect())
    }
}
