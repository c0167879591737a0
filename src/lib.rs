//! Address Forensics Library
//!
//! Correlation, clustering, behavioral pattern detection and risk scoring
//! for ledger addresses.

pub mod analysis;
pub mod cli;
pub mod config;
pub mod error;
pub mod ledger;

// Re-export commonly used types
pub use analysis::{AnalysisEngine, AnalysisReport, AnalysisSession};
pub use config::Config;
pub use error::{Error, Result};
