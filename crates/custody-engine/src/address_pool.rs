//! Keeps a pool of pre-derived addresses per kind and hands them out oldest first.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use bitcoin::{Address, Network};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result, Stage};
use crate::store::{AddressRecord, AddressStatus, Store};
use crate::wallet::{AddressKind, WalletBackend};

#[derive(Debug, Clone)]
pub struct AddressPoolConfig {
    pub min_available: u64,
    /// Upper bound on retries for a single derivation.
    pub derivation_retry: Duration,
    pub check_interval: Duration,
}

impl Default for AddressPoolConfig {
    fn default() -> Self {
        Self {
            min_available: 10,
            derivation_retry: Duration::from_secs(5),
            check_interval: Duration::from_secs(60),
        }
    }
}

impl From<&EngineConfig> for AddressPoolConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            min_available: config.min_available_addresses,
            derivation_retry: Duration::from_secs(config.derivation_retry_secs),
            check_interval: Duration::from_secs(config.address_check_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    pub available: u64,
    pub allocated: u64,
    pub used: u64,
}

pub struct AddressPool {
    store: Store,
    wallet: Arc<dyn WalletBackend>,
    network: Network,
    config: AddressPoolConfig,
}

impl AddressPool {
    pub fn new(
        store: Store,
        wallet: Arc<dyn WalletBackend>,
        network: Network,
        config: AddressPoolConfig,
    ) -> Self {
        Self {
            store,
            wallet,
            network,
            config,
        }
    }

    fn checked(&self, record: &AddressRecord) -> Result<Address> {
        Address::from_str(&record.address)
            .and_then(|a| a.require_network(self.network))
            .map_err(|e| EngineError::store(Stage::AddressPool, e))
    }

    /// Hands out the oldest available address of `kind`, deriving more first if
    /// the pool ran dry.
    pub async fn allocate(&self, kind: AddressKind) -> Result<Address> {
        let mut record = self
            .store
            .allocate_oldest(kind)
            .await
            .map_err(|e| EngineError::store(Stage::AddressPool, e))?;

        if record.is_none() {
            warn!(%kind, "Address pool empty, replenishing inline");
            self.ensure_minimum(kind)
                .await
                .map_err(|e| EngineError::wallet(Stage::AddressPool, e))?;
            record = self
                .store
                .allocate_oldest(kind)
                .await
                .map_err(|e| EngineError::store(Stage::AddressPool, e))?;
        }

        let record = record.ok_or_else(|| {
            EngineError::wallet(Stage::AddressPool, format!("no {kind} address could be derived"))
        })?;
        let address = self.checked(&record)?;
        info!(%kind, index = record.index, %address, "Allocated address");

        if let Err(e) = self.ensure_minimum(kind).await {
            warn!(%kind, error = %e, "Replenishment after allocation failed");
        }
        Ok(address)
    }

    /// Marks an address as having received funds. Unknown addresses are ignored.
    pub async fn mark_used(&self, address: &Address, block_height: Option<u32>) -> Result<bool> {
        let updated = self
            .store
            .mark_address_used(&address.to_string(), block_height)
            .await
            .map_err(|e| EngineError::store(Stage::AddressPool, e))?;
        if updated {
            info!(%address, ?block_height, "Address marked used");
        }
        Ok(updated)
    }

    pub async fn counts(&self, kind: AddressKind) -> eyre::Result<PoolCounts> {
        Ok(PoolCounts {
            available: self.store.count_addresses(kind, AddressStatus::Available).await?,
            allocated: self.store.count_addresses(kind, AddressStatus::Allocated).await?,
            used: self.store.count_addresses(kind, AddressStatus::Used).await?,
        })
    }

    async fn derive_with_retry(&self, kind: AddressKind) -> eyre::Result<Address> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_secs(1))
            .with_max_elapsed_time(Some(self.config.derivation_retry))
            .build();

        backoff::future::retry(policy, || async {
            self.wallet.derive_address(kind).await.map_err(|e| {
                warn!(%kind, error = %e, "Address derivation failed, retrying");
                backoff::Error::transient(e)
            })
        })
        .await
    }

    /// Derives addresses until at least `min_available` of `kind` are
    /// available. Returns how many were added.
    pub async fn ensure_minimum(&self, kind: AddressKind) -> eyre::Result<u64> {
        let mut available = self.store.count_addresses(kind, AddressStatus::Available).await?;
        let mut added = 0;
        let mut duplicates = 0;

        while available < self.config.min_available {
            let address = self.derive_with_retry(kind).await?;
            if !address.as_unchecked().is_valid_for_network(self.network) {
                return Err(eyre::eyre!("derived {} is not a {} address", address, self.network));
            }
            match self.store.append_address(kind, &address).await? {
                Some(_) => {
                    available += 1;
                    added += 1;
                }
                None => {
                    duplicates += 1;
                    if duplicates > self.config.min_available {
                        return Err(eyre::eyre!(
                            "wallet keeps deriving known {} addresses",
                            kind
                        ));
                    }
                }
            }
        }

        if added > 0 {
            info!(%kind, added, available, "Replenished address pool");
        }
        Ok(added)
    }

    pub async fn replenish_all(&self) -> eyre::Result<()> {
        for kind in AddressKind::ALL {
            self.ensure_minimum(kind).await?;
        }
        Ok(())
    }

    pub fn spawn_replenisher_in_set(self: Arc<Self>, join_set: &mut JoinSet<eyre::Result<()>>) {
        info!("Spawning address pool replenisher task in JoinSet.");
        join_set.spawn(async move { self.replenisher_loop().await });
    }

    async fn replenisher_loop(&self) -> eyre::Result<()> {
        loop {
            if let Err(e) = self.replenish_all().await {
                error!(
                    "Periodic address pool check failed: {:?}. This error will not stop the loop.",
                    e
                );
            }
            tokio::time::sleep(self.config.check_interval).await;
        }
    }

    pub async fn unsent_addresses(&self) -> eyre::Result<Vec<AddressRecord>> {
        self.store.unsent_addresses().await
    }

    pub async fn mark_addresses_sent(&self, addresses: &[String]) -> eyre::Result<()> {
        self.store.mark_addresses_sent(addresses).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::MockWalletBackend;
    use crate::DatabaseLocation;
    use bitcoin::hashes::Hash;
    use bitcoin::{ScriptBuf, WPubkeyHash};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU8, Ordering};

    fn address(n: u8) -> Address {
        let hash = WPubkeyHash::from_byte_array([n; 20]);
        Address::from_script(&ScriptBuf::new_p2wpkh(&hash), Network::Regtest).unwrap()
    }

    fn deriving_wallet() -> MockWalletBackend {
        let counter = Arc::new(AtomicU8::new(1));
        let mut wallet = MockWalletBackend::new();
        wallet.expect_derive_address().returning(move |_| {
            Ok(address(counter.fetch_add(1, Ordering::SeqCst)))
        });
        wallet
    }

    async fn pool(wallet: MockWalletBackend, min_available: u64) -> AddressPool {
        let store = Store::open(&DatabaseLocation::InMemory, "pool").await.unwrap();
        AddressPool::new(
            store,
            Arc::new(wallet),
            Network::Regtest,
            AddressPoolConfig {
                min_available,
                derivation_retry: Duration::from_millis(300),
                check_interval: Duration::from_millis(50),
            },
        )
    }

    #[tokio::test]
    async fn test_ensure_minimum_fills_both_kinds() {
        let pool = pool(deriving_wallet(), 10).await;
        pool.replenish_all().await.unwrap();

        for kind in AddressKind::ALL {
            let counts = pool.counts(kind).await.unwrap();
            assert_eq!(counts.available, 10);
            assert_eq!(pool.store.last_address_index(kind).await.unwrap(), Some(9));
        }
        // Nothing to do on a full pool.
        assert_eq!(pool.ensure_minimum(AddressKind::Receive).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_allocation_restores_minimum_and_never_repeats() {
        let pool = pool(deriving_wallet(), 3).await;

        let mut seen = HashSet::new();
        for _ in 0..5 {
            let address = pool.allocate(AddressKind::Change).await.unwrap();
            assert!(seen.insert(address));
            let counts = pool.counts(AddressKind::Change).await.unwrap();
            assert_eq!(counts.available, 3);
        }
        assert_eq!(pool.counts(AddressKind::Change).await.unwrap().allocated, 5);
    }

    #[tokio::test]
    async fn test_mark_used() {
        let pool = pool(deriving_wallet(), 2).await;
        let address = pool.allocate(AddressKind::Receive).await.unwrap();

        assert!(pool.mark_used(&address, Some(700_000)).await.unwrap());
        assert!(!pool.mark_used(&address, Some(700_001)).await.unwrap());
        assert!(!pool.mark_used(&self::address(200), None).await.unwrap());
        assert_eq!(pool.counts(AddressKind::Receive).await.unwrap().used, 1);
    }

    #[tokio::test]
    async fn test_transient_derivation_failure_is_retried() {
        let attempts = Arc::new(AtomicU8::new(0));
        let mut wallet = MockWalletBackend::new();
        wallet.expect_derive_address().returning(move |_| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            if attempt == 0 {
                Err(eyre::eyre!("keystore busy"))
            } else {
                Ok(address(attempt))
            }
        });

        let pool = pool(wallet, 1).await;
        assert_eq!(pool.ensure_minimum(AddressKind::Receive).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_persistent_derivation_failure_surfaces() {
        let mut wallet = MockWalletBackend::new();
        wallet
            .expect_derive_address()
            .returning(|_| Err(eyre::eyre!("keystore locked")));

        let pool = pool(wallet, 1).await;
        let err = pool.allocate(AddressKind::Receive).await.unwrap_err();
        assert_eq!(err.stage(), Stage::AddressPool);
    }

    #[tokio::test]
    async fn test_unsent_addresses_round_trip() {
        let pool = pool(deriving_wallet(), 2).await;
        pool.ensure_minimum(AddressKind::Receive).await.unwrap();

        let unsent = pool.unsent_addresses().await.unwrap();
        assert_eq!(unsent.len(), 2);
        pool.mark_addresses_sent(&[unsent[0].address.clone()]).await.unwrap();
        assert_eq!(pool.unsent_addresses().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replenisher_runs_in_join_set() {
        let pool = Arc::new(pool(deriving_wallet(), 4).await);
        let mut join_set = JoinSet::new();
        pool.clone().spawn_replenisher_in_set(&mut join_set);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.counts(AddressKind::Change).await.unwrap().available, 4);
        join_set.abort_all();
    }
}
