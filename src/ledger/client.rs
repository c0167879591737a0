//! HTTP client for an enhanced-transactions indexing API
//!
//! Fetches parsed transaction history for an address and flattens each
//! transaction's native and token transfers into [`RawTransfer`] entries.
//! Retries transient failures with exponential backoff; the analysis core
//! never retries on its own.

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::LedgerConfig;
use crate::error::{Error, Result};
use crate::ledger::source::LedgerSource;
use crate::ledger::types::{FetchOptions, NativeTransfer, RawTransfer, TokenTransfer};

/// Indexer API client
pub struct HttpLedgerClient {
    /// HTTP client
    client: Client,
    /// API key (may be empty for keyless endpoints)
    api_key: String,
    /// Base URL for the REST API
    base_url: String,
    /// Per-request timeout
    timeout: Duration,
    /// Default page size when the caller does not set a limit
    page_limit: u32,
    max_retries: u32,
    retry_base_delay_ms: u64,
}

impl HttpLedgerClient {
    /// Create a new client from configuration
    pub fn new(config: &LedgerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.saturating_mul(3)))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            timeout: Duration::from_millis(config.timeout_ms),
            page_limit: config.page_limit,
            max_retries: config.max_retries,
            retry_base_delay_ms: config.retry_base_delay_ms,
        })
    }

    fn transactions_url(&self, address: &str, limit: u32) -> String {
        if self.api_key.is_empty() {
            format!("{}/v0/addresses/{}/transactions?limit={}", self.base_url, address, limit)
        } else {
            format!(
                "{}/v0/addresses/{}/transactions?api-key={}&limit={}",
                self.base_url, address, self.api_key, limit
            )
        }
    }

    /// Single fetch attempt
    async fn fetch_once(&self, address: &str, limit: u32) -> Result<Vec<EnhancedTransaction>> {
        let url = self.transactions_url(address, limit);

        debug!(address = %address, limit = %limit, "Fetching transaction history");

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::UpstreamTimeout(self.timeout.as_millis() as u64)
                } else {
                    // The URL carries the API key
                    Error::UpstreamFetch(format!("Indexer request failed: {}", e.without_url()))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamRejected { status, body });
        }

        response
            .json()
            .await
            .map_err(|e| {
                Error::Deserialization(format!(
                    "Failed to parse indexer response: {}",
                    e.without_url()
                ))
            })
    }
}

#[async_trait]
impl LedgerSource for HttpLedgerClient {
    async fn fetch_transfers(&self, address: &str, options: &FetchOptions) -> Result<Vec<RawTransfer>> {
        let limit = options.limit.unwrap_or(self.page_limit);

        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(self.retry_base_delay_ms),
            max_interval: Duration::from_millis(self.retry_base_delay_ms * 8),
            max_elapsed_time: Some(
                self.timeout * (self.max_retries + 1) + Duration::from_millis(self.retry_base_delay_ms * 8),
            ),
            ..Default::default()
        };

        let mut attempts = 0u32;
        let transactions = retry(backoff, || {
            attempts += 1;
            let attempt = attempts;
            async move {
                match self.fetch_once(address, limit).await {
                    Ok(txs) => Ok(txs),
                    Err(e) if e.is_retryable() && attempt <= self.max_retries => {
                        warn!(address = %address, attempt = %attempt, error = %e, "Retryable indexer error");
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => {
                        error!(address = %address, error = %e, "Indexer fetch failed");
                        Err(backoff::Error::permanent(e))
                    }
                }
            }
        })
        .await?;

        let transfers: Vec<RawTransfer> = transactions
            .iter()
            .filter(|tx| tx.timestamp.map_or(true, |ts| options.contains(ts * 1000)))
            .flat_map(flatten_transaction)
            .collect();

        debug!(
            address = %address,
            transactions = %transactions.len(),
            transfers = %transfers.len(),
            "Indexer fetch complete"
        );

        Ok(transfers)
    }

    fn name(&self) -> &'static str {
        "http-indexer"
    }
}

/// Flatten one indexed transaction into raw transfer entries
///
/// Transactions carrying more than one transfer get per-transfer signatures
/// `"<sig>/<n>"` so every record stays uniquely keyed.
fn flatten_transaction(tx: &EnhancedTransaction) -> Vec<RawTransfer> {
    let timestamp_ms = tx.timestamp.map(|ts| ts * 1000);
    let native = tx.native_transfers.as_deref().unwrap_or_default();
    let token = tx.token_transfers.as_deref().unwrap_or_default();
    let multiple = native.len() + token.len() > 1;

    let signature_for = |n: usize| {
        if multiple {
            format!("{}/{}", tx.signature, n)
        } else {
            tx.signature.clone()
        }
    };

    let mut out = Vec::with_capacity(native.len() + token.len());
    for (n, transfer) in native.iter().enumerate() {
        out.push(RawTransfer::Native(NativeTransfer {
            signature: signature_for(n),
            from: transfer.from_user_account.clone(),
            to: transfer.to_user_account.clone(),
            lamports: Some(transfer.amount),
            timestamp_ms,
        }));
    }
    for (n, transfer) in token.iter().enumerate() {
        out.push(RawTransfer::Token(TokenTransfer {
            signature: signature_for(native.len() + n),
            from: transfer.from_user_account.clone(),
            to: transfer.to_user_account.clone(),
            mint: Some(transfer.mint.clone()),
            amount: Some(transfer.token_amount),
            timestamp_ms,
        }));
    }
    out
}

// ============ Indexer API Response Types ============
// Only the fields the flattener reads are declared

#[derive(Debug, Deserialize)]
struct EnhancedTransaction {
    signature: String,
    timestamp: Option<i64>,
    #[serde(rename = "nativeTransfers")]
    native_transfers: Option<Vec<IndexedNativeTransfer>>,
    #[serde(rename = "tokenTransfers")]
    token_transfers: Option<Vec<IndexedTokenTransfer>>,
}

#[derive(Debug, Deserialize)]
struct IndexedNativeTransfer {
    #[serde(rename = "fromUserAccount")]
    from_user_account: Option<String>,
    #[serde(rename = "toUserAccount")]
    to_user_account: Option<String>,
    amount: u64,
}

#[derive(Debug, Deserialize)]
struct IndexedTokenTransfer {
    #[serde(rename = "fromUserAccount")]
    from_user_account: Option<String>,
    #[serde(rename = "toUserAccount")]
    to_user_account: Option<String>,
    mint: String,
    #[serde(rename = "tokenAmount")]
    token_amount: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> EnhancedTransaction {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_flatten_single_transfer_keeps_signature() {
        let tx = parse(
            r#"{"signature": "abc", "timestamp": 1700000000,
                "nativeTransfers": [{"fromUserAccount": "A", "toUserAccount": "B", "amount": 5}]}"#,
        );
        let transfers = flatten_transaction(&tx);
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].signature(), "abc");
        match &transfers[0] {
            RawTransfer::Native(t) => assert_eq!(t.timestamp_ms, Some(1_700_000_000_000)),
            _ => panic!("Expected native transfer"),
        }
    }

    #[test]
    fn test_flatten_multiple_transfers_suffixes_signature() {
        let tx = parse(
            r#"{"signature": "abc", "timestamp": 1,
                "nativeTransfers": [{"fromUserAccount": "A", "toUserAccount": "B", "amount": 5}],
                "tokenTransfers": [{"fromUserAccount": "B", "toUserAccount": "C", "mint": "M", "tokenAmount": 1.5}]}"#,
        );
        let transfers = flatten_transaction(&tx);
        let sigs: Vec<&str> = transfers.iter().map(|t| t.signature()).collect();
        assert_eq!(sigs, vec!["abc/0", "abc/1"]);
    }

    #[tokio::test]
    async fn test_fetch_error_does_not_leak_api_key() {
        let mut config = LedgerConfig::default();
        // Nothing listens on port 9 locally
        config.endpoint = "http://127.0.0.1:9".to_string();
        config.api_key = "secret-key".to_string();
        config.timeout_ms = 500;
        let client = HttpLedgerClient::new(&config).unwrap();

        let err = client.fetch_once("ADDR", 10).await.unwrap_err();
        assert!(matches!(
            err,
            Error::UpstreamFetch(_) | Error::UpstreamTimeout(_)
        ));
        assert!(!err.to_string().contains("secret-key"));
    }

    #[test]
    fn test_transactions_url() {
        let mut config = LedgerConfig::default();
        config.endpoint = "https://indexer.example.com/".to_string();
        config.api_key = "k".to_string();
        let client = HttpLedgerClient::new(&config).unwrap();
        assert_eq!(
            client.transactions_url("ADDR", 50),
            "https://indexer.example.com/v0/addresses/ADDR/transactions?api-key=k&limit=50"
        );
    }
}
