use async_trait::async_trait;
use bitcoin::Transaction;

/// The SPV chain service the wallet syncs through. Used here as the last
/// resort submission path and as the source of the best block height.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainService: Send + Sync {
    async fn submit_transaction(&self, tx: &Transaction) -> eyre::Result<()>;

    async fn best_block_height(&self) -> eyre::Result<u32>;
}
