//! Transfer shapes exchanged with the ledger collaborators

use serde::{Deserialize, Serialize};

/// Opaque, case-sensitive account identifier
pub type Address = String;

/// Symbol used for native-unit transfers
pub const NATIVE_TOKEN: &str = "SOL";

/// Base units per native unit (lamports per SOL)
pub const LAMPORTS_PER_NATIVE: f64 = 1e9;

/// Canonical transfer record consumed by every analysis stage
///
/// Immutable once produced by the normalizer; lives for one analysis batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub from: Address,
    pub to: Address,
    /// Amount in display units (native units or token units), never negative
    pub amount: f64,
    pub token: String,
    pub timestamp_ms: i64,
    pub signature: String,
}

impl TransactionRecord {
    /// Build a record (mostly used by tests and adapters)
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        amount: f64,
        token: impl Into<String>,
        timestamp_ms: i64,
        signature: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            amount,
            token: token.into(),
            timestamp_ms,
            signature: signature.into(),
        }
    }

    /// Check if the record touches an address on either side
    pub fn involves(&self, address: &str) -> bool {
        self.from == address || self.to == address
    }

    /// Ordered `(from, to)` pair
    pub fn pair(&self) -> (&str, &str) {
        (self.from.as_str(), self.to.as_str())
    }

    /// Unordered pair key, lexicographically sorted
    pub fn unordered_pair(&self) -> (&str, &str) {
        if self.from <= self.to {
            (self.from.as_str(), self.to.as_str())
        } else {
            (self.to.as_str(), self.from.as_str())
        }
    }

    /// The other side of the transfer relative to `address`
    pub fn counterparty(&self, address: &str) -> Option<&str> {
        if self.from == address {
            Some(self.to.as_str())
        } else if self.to == address {
            Some(self.from.as_str())
        } else {
            None
        }
    }
}

/// Provider transfer entry before normalization
///
/// Native and token transfers arrive as separate shapes; any field may be
/// missing in provider data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawTransfer {
    Native(NativeTransfer),
    Token(TokenTransfer),
}

impl RawTransfer {
    pub fn signature(&self) -> &str {
        match self {
            RawTransfer::Native(t) => &t.signature,
            RawTransfer::Token(t) => &t.signature,
        }
    }

    /// Sender and receiver, when present
    pub fn parties(&self) -> (Option<&str>, Option<&str>) {
        match self {
            RawTransfer::Native(t) => (t.from.as_deref(), t.to.as_deref()),
            RawTransfer::Token(t) => (t.from.as_deref(), t.to.as_deref()),
        }
    }
}

/// Native-unit transfer, amount in base units
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeTransfer {
    #[serde(default)]
    pub signature: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub lamports: Option<u64>,
    pub timestamp_ms: Option<i64>,
}

/// Token-denominated transfer, amount already in token units
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTransfer {
    #[serde(default)]
    pub signature: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub mint: Option<String>,
    pub amount: Option<f64>,
    pub timestamp_ms: Option<i64>,
}

/// Bounds for a ledger query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchOptions {
    /// Maximum number of transactions to request
    pub limit: Option<u32>,
    /// Only transfers at or after this time
    pub after_ms: Option<i64>,
    /// Only transfers strictly before this time
    pub before_ms: Option<i64>,
}

impl FetchOptions {
    pub fn with_limit(limit: u32) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }

    /// Check if a timestamp falls inside the requested bounds
    pub fn contains(&self, timestamp_ms: i64) -> bool {
        self.after_ms.map_or(true, |after| timestamp_ms >= after)
            && self.before_ms.map_or(true, |before| timestamp_ms < before)
    }
}

/// Classification returned by the entity-label service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Exchange,
    Protocol,
    Mixer,
    Sanctioned,
    Individual,
    Unknown,
}

/// Display label for an address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityLabel {
    pub address: Address,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub confidence: f64,
}
