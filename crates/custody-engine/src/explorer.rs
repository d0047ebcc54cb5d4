use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::{OutPoint, Txid};
use esplora_client::r#async::AsyncClient;

/// Read-only explorer queries used to guard against stale wallet state and to
/// confirm that a submitted transaction reached the mempool.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlockExplorer: Send + Sync {
    /// Whether any transaction (confirmed or in the mempool) spends `outpoint`.
    async fn is_output_spent(&self, outpoint: OutPoint) -> eyre::Result<bool>;

    /// Whether the explorer knows `txid`, confirmed or not.
    async fn is_transaction_visible(&self, txid: Txid) -> eyre::Result<bool>;
}

#[derive(Debug, Clone)]
pub struct EsploraExplorer {
    client: Arc<AsyncClient>,
}

impl EsploraExplorer {
    pub fn new(base_url: &str, timeout: Duration) -> eyre::Result<Self> {
        let client = esplora_client::Builder::new(base_url)
            .timeout(timeout.as_secs())
            .build_async()?;
        Ok(Self {
            client: Arc::new(client),
        })
    }
}

#[async_trait]
impl BlockExplorer for EsploraExplorer {
    async fn is_output_spent(&self, outpoint: OutPoint) -> eyre::Result<bool> {
        let status = self
            .client
            .get_output_status(&outpoint.txid, outpoint.vout as u64)
            .await?;
        Ok(status.map(|s| s.spent).unwrap_or(false))
    }

    async fn is_transaction_visible(&self, txid: Txid) -> eyre::Result<bool> {
        Ok(self.client.get_tx(&txid).await?.is_some())
    }
}
