use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::Txid;
use electrum_client::{Client, ConfigBuilder, ElectrumApi};

/// Fetches raw transactions that are missing from the local store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RawTransactionSource: Send + Sync {
    async fn raw_transaction(&self, txid: Txid) -> eyre::Result<Vec<u8>>;
}

/// Electrum-backed source. The client is blocking, so calls run on the
/// blocking pool.
pub struct ElectrumTxSource {
    client: Arc<Client>,
}

impl ElectrumTxSource {
    pub fn new(url: &str, timeout: Duration) -> eyre::Result<Self> {
        let timeout_secs = timeout.as_secs().clamp(1, u8::MAX as u64) as u8;
        let config = ConfigBuilder::new().timeout(Some(timeout_secs)).build();
        let client = Client::from_config(url, config)
            .map_err(|e| eyre::eyre!("electrum connect to {} failed: {:?}", url, e))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }
}

#[async_trait]
impl RawTransactionSource for ElectrumTxSource {
    async fn raw_transaction(&self, txid: Txid) -> eyre::Result<Vec<u8>> {
        let client = self.client.clone();
        let raw = tokio::task::spawn_blocking(move || client.transaction_get_raw(&txid))
            .await?
            .map_err(|e| eyre::eyre!("electrum lookup of {} failed: {:?}", txid, e))?;
        Ok(raw)
    }
}

/// Used when no Electrum server is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRawTransactionSource;

#[async_trait]
impl RawTransactionSource for NoRawTransactionSource {
    async fn raw_transaction(&self, txid: Txid) -> eyre::Result<Vec<u8>> {
        Err(eyre::eyre!("no electrum server configured to fetch {}", txid))
    }
}
