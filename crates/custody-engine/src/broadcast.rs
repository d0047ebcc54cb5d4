//! Submission and mempool verification.
//!
//! A signed transaction goes through the relay chain first and through the
//! chain service only when every relay refused it. Acceptance by a submission
//! path is not trusted on its own: the explorer must report the transaction
//! before the broadcast counts as verified.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::{OutPoint, Transaction, Txid};
use tracing::{debug, error, info, warn};

use crate::chain::ChainService;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::explorer::BlockExplorer;
use crate::relay::RelayChain;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastStatus {
    /// Submitted and seen by the explorer.
    Success,
    /// Accepted by a relay but not seen by the explorer yet.
    Pending,
}

impl fmt::Display for BroadcastStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BroadcastStatus::Success => f.write_str("success"),
            BroadcastStatus::Pending => f.write_str("pending"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionPath {
    Relay(String),
    ChainService,
}

impl fmt::Display for SubmissionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmissionPath::Relay(name) => write!(f, "relay {name}"),
            SubmissionPath::ChainService => f.write_str("chain service"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub txid: Txid,
    pub path: SubmissionPath,
    pub status: BroadcastStatus,
}

impl BroadcastReport {
    pub fn verified(&self) -> bool {
        self.status == BroadcastStatus::Success
    }
}

/// Bounded polling of the explorer after a submission.
#[derive(Debug, Clone)]
pub struct VerificationPolicy {
    pub initial_delay: Duration,
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(3),
            attempts: 5,
            interval: Duration::from_secs(2),
        }
    }
}

impl From<&EngineConfig> for VerificationPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            initial_delay: Duration::from_secs(config.verify_initial_delay_secs),
            attempts: config.verify_attempts,
            interval: Duration::from_secs(config.verify_interval_secs),
        }
    }
}

pub struct BroadcastPipeline {
    relays: RelayChain,
    chain: Arc<dyn ChainService>,
    explorer: Arc<dyn BlockExplorer>,
    store: Store,
    policy: VerificationPolicy,
}

impl BroadcastPipeline {
    pub fn new(
        relays: RelayChain,
        chain: Arc<dyn ChainService>,
        explorer: Arc<dyn BlockExplorer>,
        store: Store,
        policy: VerificationPolicy,
    ) -> Self {
        Self {
            relays,
            chain,
            explorer,
            store,
            policy,
        }
    }

    /// Submits `tx` and waits for the explorer to see it.
    ///
    /// `locked` are outpoints reserved for `tx` that no other transaction
    /// depends on. They are released when no path accepted the transaction,
    /// and when the chain service accepted it but the explorer never saw it.
    pub async fn broadcast(&self, tx: &Transaction, locked: &[OutPoint]) -> Result<BroadcastReport> {
        let txid = tx.compute_txid();

        let path = match self.relays.submit(tx).await {
            Ok(name) => SubmissionPath::Relay(name),
            Err(failures) => {
                warn!(%txid, failed = failures.len(), "Every relay refused, falling back to chain service");
                match self.chain.submit_transaction(tx).await {
                    Ok(()) => {
                        info!(%txid, "Chain service accepted transaction");
                        SubmissionPath::ChainService
                    }
                    Err(e) => {
                        error!(%txid, error = %e, "Chain service submission failed");
                        self.release(txid, locked).await;
                        return Err(EngineError::BroadcastExhausted {
                            txid,
                            attempts: failures.len() + 1,
                            last_error: e.to_string(),
                        });
                    }
                }
            }
        };

        if self.wait_until_visible(txid).await {
            info!(%txid, %path, "Transaction verified in mempool");
            return Ok(BroadcastReport {
                txid,
                path,
                status: BroadcastStatus::Success,
            });
        }

        match path {
            SubmissionPath::ChainService => {
                warn!(%txid, "Chain service accepted transaction but explorer never saw it");
                self.release(txid, locked).await;
                Err(EngineError::UnconfirmedAfterBroadcast { txid })
            }
            SubmissionPath::Relay(_) => {
                warn!(%txid, %path, "Transaction not visible yet, reporting as pending");
                Ok(BroadcastReport {
                    txid,
                    path,
                    status: BroadcastStatus::Pending,
                })
            }
        }
    }

    /// Polls the explorer at most `attempts` times. Lookup errors count as
    /// "not seen".
    pub async fn wait_until_visible(&self, txid: Txid) -> bool {
        tokio::time::sleep(self.policy.initial_delay).await;

        for attempt in 1..=self.policy.attempts {
            match self.explorer.is_transaction_visible(txid).await {
                Ok(true) => return true,
                Ok(false) => debug!(%txid, attempt, "Transaction not visible yet"),
                Err(e) => warn!(%txid, attempt, error = %e, "Mempool lookup failed"),
            }
            if attempt < self.policy.attempts {
                tokio::time::sleep(self.policy.interval).await;
            }
        }
        false
    }

    async fn release(&self, txid: Txid, locked: &[OutPoint]) {
        if locked.is_empty() {
            return;
        }
        match self.store.unlock_outpoints(locked).await {
            Ok(()) => info!(%txid, outputs = locked.len(), "Released output locks"),
            Err(e) => error!(%txid, error = %e, "Failed to release output locks"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainService;
    use crate::explorer::MockBlockExplorer;
    use crate::relay::{MockRelayTarget, RelayTarget};
    use crate::signer::ScriptKind;
    use crate::test_utils::{funding_tx, pay, regtest_address};
    use crate::DatabaseLocation;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn relay(name: &'static str, accept: bool) -> Arc<dyn RelayTarget> {
        let mut mock = MockRelayTarget::new();
        mock.expect_name().return_const(name.to_string());
        mock.expect_submit().returning(move |_| {
            if accept {
                Ok(())
            } else {
                Err(eyre::eyre!("{} answered 503", name))
            }
        });
        Arc::new(mock)
    }

    fn chain(accept: bool) -> MockChainService {
        let mut chain = MockChainService::new();
        chain.expect_submit_transaction().times(1).returning(move |_| {
            if accept {
                Ok(())
            } else {
                Err(eyre::eyre!("peer disconnected"))
            }
        });
        chain
    }

    fn unused_chain() -> MockChainService {
        let mut chain = MockChainService::new();
        chain.expect_submit_transaction().never();
        chain
    }

    /// Visible from the `visible_from`-th lookup on; never when `None`.
    fn explorer(visible_from: Option<u32>) -> (MockBlockExplorer, Arc<AtomicU32>) {
        let lookups = Arc::new(AtomicU32::new(0));
        let counter = lookups.clone();
        let mut explorer = MockBlockExplorer::new();
        explorer.expect_is_transaction_visible().returning(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(visible_from.is_some_and(|from| n >= from))
        });
        (explorer, lookups)
    }

    fn policy() -> VerificationPolicy {
        VerificationPolicy {
            initial_delay: Duration::ZERO,
            attempts: 3,
            interval: Duration::from_millis(1),
        }
    }

    async fn locked_store(tx: &Transaction) -> (Store, Vec<OutPoint>) {
        let store = Store::open(&DatabaseLocation::InMemory, "broadcast").await.unwrap();
        let outpoints: Vec<OutPoint> = tx.input.iter().map(|i| i.previous_output).collect();
        store.lock_outpoints(&outpoints, tx.compute_txid()).await.unwrap();
        (store, outpoints)
    }

    fn signed_looking_tx() -> Transaction {
        funding_tx(4, vec![pay(&regtest_address(ScriptKind::P2wpkh, 200), 10_000)])
    }

    #[tokio::test]
    async fn test_first_relay_and_explorer_confirm() {
        let tx = signed_looking_tx();
        let (store, locked) = locked_store(&tx).await;
        let (explorer, lookups) = explorer(Some(2));
        let pipeline = BroadcastPipeline::new(
            RelayChain::new(vec![relay("mempool", true), relay("blockstream", true)]),
            Arc::new(unused_chain()),
            Arc::new(explorer),
            store.clone(),
            policy(),
        );

        let report = pipeline.broadcast(&tx, &locked).await.unwrap();
        assert_eq!(report.status, BroadcastStatus::Success);
        assert!(report.verified());
        assert_eq!(report.path, SubmissionPath::Relay("mempool".to_string()));
        assert_eq!(lookups.load(Ordering::SeqCst), 2);
        assert_eq!(store.locked_outpoints().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_relay_accepted_but_unseen_is_pending() {
        let tx = signed_looking_tx();
        let (store, locked) = locked_store(&tx).await;
        let (explorer, lookups) = explorer(None);
        let pipeline = BroadcastPipeline::new(
            RelayChain::new(vec![relay("mempool", false), relay("blockstream", true)]),
            Arc::new(unused_chain()),
            Arc::new(explorer),
            store.clone(),
            policy(),
        );

        let report = pipeline.broadcast(&tx, &locked).await.unwrap();
        assert_eq!(report.status, BroadcastStatus::Pending);
        assert!(!report.verified());
        assert_eq!(report.path, SubmissionPath::Relay("blockstream".to_string()));
        assert_eq!(lookups.load(Ordering::SeqCst), 3);
        // A relay holds the transaction, so its inputs stay reserved.
        assert_eq!(store.locked_outpoints().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_chain_service_fallback_unseen_releases_locks() {
        let tx = signed_looking_tx();
        let (store, locked) = locked_store(&tx).await;
        let (explorer, _) = explorer(None);
        let pipeline = BroadcastPipeline::new(
            RelayChain::new(vec![
                relay("mempool", false),
                relay("blockstream", false),
                relay("blockcypher", false),
            ]),
            Arc::new(chain(true)),
            Arc::new(explorer),
            store.clone(),
            policy(),
        );

        let err = pipeline.broadcast(&tx, &locked).await.unwrap_err();
        assert!(matches!(err, EngineError::UnconfirmedAfterBroadcast { txid } if txid == tx.compute_txid()));
        assert!(err.happened_on_chain());
        assert_eq!(err.to_string(), format!("broadcast succeeded, not yet visible: {}", tx.compute_txid()));
        assert!(store.locked_outpoints().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_chain_service_fallback_seen_is_success() {
        let tx = signed_looking_tx();
        let (store, locked) = locked_store(&tx).await;
        let (explorer, _) = explorer(Some(1));
        let pipeline = BroadcastPipeline::new(
            RelayChain::new(vec![relay("mempool", false)]),
            Arc::new(chain(true)),
            Arc::new(explorer),
            store.clone(),
            policy(),
        );

        let report = pipeline.broadcast(&tx, &locked).await.unwrap();
        assert_eq!(report.path, SubmissionPath::ChainService);
        assert_eq!(report.status, BroadcastStatus::Success);
        assert_eq!(store.locked_outpoints().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_every_path_failing_is_exhausted() {
        let tx = signed_looking_tx();
        let (store, locked) = locked_store(&tx).await;
        let mut explorer = MockBlockExplorer::new();
        explorer.expect_is_transaction_visible().never();
        let pipeline = BroadcastPipeline::new(
            RelayChain::new(vec![relay("mempool", false), relay("blockstream", false)]),
            Arc::new(chain(false)),
            Arc::new(explorer),
            store.clone(),
            policy(),
        );

        let err = pipeline.broadcast(&tx, &locked).await.unwrap_err();
        match &err {
            EngineError::BroadcastExhausted {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(*attempts, 3);
                assert!(last_error.contains("peer disconnected"));
            }
            other => panic!("unexpected {other}"),
        }
        assert!(!err.happened_on_chain());
        assert!(store.locked_outpoints().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_explorer_errors_are_absorbed() {
        let tx = signed_looking_tx();
        let (store, locked) = locked_store(&tx).await;
        let mut explorer = MockBlockExplorer::new();
        explorer
            .expect_is_transaction_visible()
            .times(3)
            .returning(|_| Err(eyre::eyre!("timeout")));
        let pipeline = BroadcastPipeline::new(
            RelayChain::new(vec![relay("mempool", true)]),
            Arc::new(unused_chain()),
            Arc::new(explorer),
            store,
            policy(),
        );

        let report = pipeline.broadcast(&tx, &locked).await.unwrap();
        assert_eq!(report.status, BroadcastStatus::Pending);
    }
}
