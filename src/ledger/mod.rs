//! Ledger data ingestion
//!
//! Everything between the external indexing service and the analysis core:
//! transfer shapes, the HTTP indexer client, collaborator traits and the
//! record normalizer.

pub mod client;
pub mod normalizer;
pub mod source;
pub mod types;

pub use client::HttpLedgerClient;
pub use normalizer::{normalize, NormalizedBatch, SkipReport};
pub use source::{EntityLabelSource, InMemoryLedger, LedgerSource, StaticLabelSource};
pub use types::{
    Address, EntityKind, EntityLabel, FetchOptions, NativeTransfer, RawTransfer, TokenTransfer,
    TransactionRecord, NATIVE_TOKEN,
};
