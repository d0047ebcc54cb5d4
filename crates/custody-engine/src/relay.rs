//! Relay targets for pushing signed transactions to the network.
//!
//! Each public endpoint sits behind the same `submit` contract and the
//! `RelayChain` walks them in order until one accepts.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::Transaction;
use esplora_client::r#async::AsyncClient as EsploraClient;
use reqwest::Client;
use serde_json::json;
use tracing::{info, warn};

/// How an endpoint expects the raw transaction in the request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayFormat {
    /// Body is the bare hex string.
    RawHex,
    /// Body is `{"tx": "<hex>"}`.
    JsonHex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub url: String,
    pub format: RelayFormat,
}

impl RelayEndpoint {
    pub fn new(url: impl Into<String>, format: RelayFormat) -> Self {
        Self {
            url: url.into(),
            format,
        }
    }
}

impl FromStr for RelayEndpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(url) = s.strip_prefix("json:") {
            Ok(Self::new(url, RelayFormat::JsonHex))
        } else if let Some(url) = s.strip_prefix("raw:") {
            Ok(Self::new(url, RelayFormat::RawHex))
        } else if s.is_empty() {
            Err("empty relay endpoint".to_string())
        } else {
            Ok(Self::new(s, RelayFormat::RawHex))
        }
    }
}

impl fmt::Display for RelayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format {
            RelayFormat::RawHex => write!(f, "raw:{}", self.url),
            RelayFormat::JsonHex => write!(f, "json:{}", self.url),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelayTarget: Send + Sync {
    fn name(&self) -> String;

    async fn submit(&self, tx: &Transaction) -> eyre::Result<()>;
}

/// Plain HTTP POST relay.
pub struct HttpRelay {
    endpoint: RelayEndpoint,
    http: Client,
}

impl HttpRelay {
    pub fn new(endpoint: RelayEndpoint, timeout: Duration) -> eyre::Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { endpoint, http })
    }
}

#[async_trait]
impl RelayTarget for HttpRelay {
    fn name(&self) -> String {
        self.endpoint.url.clone()
    }

    async fn submit(&self, tx: &Transaction) -> eyre::Result<()> {
        let raw_hex = serialize_hex(tx);
        let request = self.http.post(&self.endpoint.url);
        let request = match self.endpoint.format {
            RelayFormat::RawHex => request.body(raw_hex),
            RelayFormat::JsonHex => request.json(&json!({ "tx": raw_hex })),
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(eyre::eyre!("{} rejected transaction: {} {}", self.endpoint.url, status, body));
        }
        Ok(())
    }
}

/// Relay through an esplora instance's `POST /tx`.
pub struct EsploraRelay {
    name: String,
    client: Arc<EsploraClient>,
}

impl EsploraRelay {
    pub fn new(base_url: &str, timeout: Duration) -> eyre::Result<Self> {
        let client = esplora_client::Builder::new(base_url)
            .timeout(timeout.as_secs())
            .build_async()?;
        Ok(Self {
            name: base_url.to_string(),
            client: Arc::new(client),
        })
    }
}

#[async_trait]
impl RelayTarget for EsploraRelay {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn submit(&self, tx: &Transaction) -> eyre::Result<()> {
        self.client.broadcast(tx).await?;
        Ok(())
    }
}

/// A failed relay attempt, kept so the caller can report the last cause.
#[derive(Debug, Clone)]
pub struct RelayFailure {
    pub target: String,
    pub error: String,
}

/// Ordered chain of relay targets, tried one after another.
#[derive(Clone, Default)]
pub struct RelayChain {
    targets: Vec<Arc<dyn RelayTarget>>,
}

impl RelayChain {
    pub fn new(targets: Vec<Arc<dyn RelayTarget>>) -> Self {
        Self { targets }
    }

    pub fn from_endpoints(endpoints: &[RelayEndpoint], timeout: Duration) -> eyre::Result<Self> {
        let targets = endpoints
            .iter()
            .map(|endpoint| {
                HttpRelay::new(endpoint.clone(), timeout)
                    .map(|relay| Arc::new(relay) as Arc<dyn RelayTarget>)
            })
            .collect::<eyre::Result<Vec<_>>>()?;
        Ok(Self { targets })
    }

    pub fn push(&mut self, target: Arc<dyn RelayTarget>) {
        self.targets.push(target);
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Returns the name of the first target that accepted the transaction,
    /// or every failure in the order the targets were tried.
    pub async fn submit(&self, tx: &Transaction) -> Result<String, Vec<RelayFailure>> {
        let txid = tx.compute_txid();
        let mut failures = Vec::with_capacity(self.targets.len());

        for target in &self.targets {
            let name = target.name();
            match target.submit(tx).await {
                Ok(()) => {
                    info!(%txid, relay = %name, "Relay accepted transaction");
                    return Ok(name);
                }
                Err(e) => {
                    warn!(%txid, relay = %name, error = %e, "Relay failed, trying next");
                    failures.push(RelayFailure {
                        target: name,
                        error: e.to_string(),
                    });
                }
            }
        }

        Err(failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{absolute::LockTime, transaction};

    fn empty_tx() -> Transaction {
        Transaction {
            version: transaction::Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![],
        }
    }

    fn relay(name: &'static str, accept: bool) -> Arc<dyn RelayTarget> {
        let mut mock = MockRelayTarget::new();
        mock.expect_name().return_const(name.to_string());
        mock.expect_submit().times(1).returning(move |_| {
            if accept {
                Ok(())
            } else {
                Err(eyre::eyre!("503 from {}", name))
            }
        });
        Arc::new(mock)
    }

    #[test]
    fn test_parse_relay_endpoint() {
        let json: RelayEndpoint = "json:https://api.example/push".parse().unwrap();
        assert_eq!(json.format, RelayFormat::JsonHex);
        assert_eq!(json.url, "https://api.example/push");

        let bare: RelayEndpoint = "https://example/api/tx".parse().unwrap();
        assert_eq!(bare.format, RelayFormat::RawHex);
        assert_eq!(bare.to_string(), "raw:https://example/api/tx");

        assert!("".parse::<RelayEndpoint>().is_err());
    }

    #[tokio::test]
    async fn test_chain_stops_at_first_success() {
        let mut skipped = MockRelayTarget::new();
        skipped.expect_name().return_const("third".to_string());
        skipped.expect_submit().never();

        let chain = RelayChain::new(vec![
            relay("first", false),
            relay("second", true),
            Arc::new(skipped),
        ]);

        let accepted = chain.submit(&empty_tx()).await.unwrap();
        assert_eq!(accepted, "second");
    }

    #[tokio::test]
    async fn test_chain_collects_every_failure() {
        let chain = RelayChain::new(vec![
            relay("first", false),
            relay("second", false),
            relay("third", false),
        ]);

        let failures = chain.submit(&empty_tx()).await.unwrap_err();
        let targets: Vec<_> = failures.iter().map(|f| f.target.as_str()).collect();
        assert_eq!(targets, ["first", "second", "third"]);
        assert!(failures[2].error.contains("503"));
    }
}
