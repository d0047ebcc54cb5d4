use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::{Amount, FeeRate, OutPoint, TxOut};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result, Stage};
use crate::explorer::BlockExplorer;
use crate::signer::{estimate_weight, fee_for_vsize, vsize, ScriptKind};
use crate::store::Store;
use crate::txn_builder::DUST_THRESHOLD;
use crate::wallet::{Utxo, WalletBackend};

/// Picks wallet outputs to fund a spend. Outputs that are locked by an
/// in-flight transaction, already spent according to the explorer, or locked
/// behind a script this engine cannot sign are never returned.
pub struct UtxoSelector {
    wallet: Arc<dyn WalletBackend>,
    explorer: Arc<dyn BlockExplorer>,
    store: Store,
    lock_expiry: Duration,
}

fn fee_for(kinds: &[ScriptKind], outputs: &[TxOut], rate: FeeRate) -> Amount {
    fee_for_vsize(rate, vsize(estimate_weight(kinds, outputs)))
}

/// `spend` plus every extra amount. A sum that does not fit in an amount can
/// never be funded from `available`.
fn required_amount(available: Amount, spend: Amount, extras: &[Amount]) -> Result<Amount> {
    extras
        .iter()
        .try_fold(spend, |acc, extra| acc.checked_add(*extra))
        .ok_or(EngineError::InsufficientBalance {
            available,
            required: Amount::MAX,
        })
}

impl UtxoSelector {
    pub fn new(
        wallet: Arc<dyn WalletBackend>,
        explorer: Arc<dyn BlockExplorer>,
        store: Store,
        lock_expiry: Duration,
    ) -> Self {
        Self {
            wallet,
            explorer,
            store,
            lock_expiry,
        }
    }

    async fn check_balance(&self, spend: Amount, min_confirmations: u32) -> Result<Amount> {
        let available = self
            .wallet
            .balance(min_confirmations)
            .await
            .map_err(|e| EngineError::wallet(Stage::Select, e))?;
        if available < spend {
            return Err(EngineError::InsufficientBalance {
                available,
                required: spend,
            });
        }
        Ok(available)
    }

    /// Unspent outputs in wallet listing order, minus locked and unsignable
    /// ones. The explorer is not consulted here.
    async fn unlocked_candidates(&self, min_confirmations: u32) -> Result<Vec<(Utxo, ScriptKind)>> {
        self.store
            .release_stale_locks(self.lock_expiry.as_secs())
            .await
            .map_err(|e| EngineError::store(Stage::Select, e))?;

        let utxos = self
            .wallet
            .list_unspent(min_confirmations)
            .await
            .map_err(|e| EngineError::wallet(Stage::Select, e))?;
        let locked = self
            .store
            .locked_outpoints()
            .await
            .map_err(|e| EngineError::store(Stage::Select, e))?;

        Ok(utxos
            .into_iter()
            .filter(|utxo| {
                if locked.contains(&utxo.outpoint) {
                    debug!(outpoint = %utxo.outpoint, "Skipping locked output");
                    return false;
                }
                true
            })
            .filter_map(|utxo| match ScriptKind::classify(&utxo.script_pubkey) {
                Some(kind) => Some((utxo, kind)),
                None => {
                    debug!(outpoint = %utxo.outpoint, "Skipping output with unsupported script");
                    None
                }
            })
            .collect())
    }

    /// The wallet's view can lag the network, so every candidate is checked
    /// against the explorer. An unreachable explorer keeps the candidate.
    async fn is_spent(&self, outpoint: OutPoint) -> bool {
        match self.explorer.is_output_spent(outpoint).await {
            Ok(spent) => {
                if spent {
                    info!(%outpoint, "Skipping output already spent on chain");
                }
                spent
            }
            Err(e) => {
                warn!(%outpoint, error = %e, "Outspend lookup failed, keeping candidate");
                false
            }
        }
    }

    /// Every spendable output, explorer-checked, in wallet listing order.
    pub async fn spendable_candidates(&self, min_confirmations: u32) -> Result<Vec<Utxo>> {
        let mut spendable = Vec::new();
        for (utxo, _) in self.unlocked_candidates(min_confirmations).await? {
            if !self.is_spent(utxo.outpoint).await {
                spendable.push(utxo);
            }
        }
        Ok(spendable)
    }

    /// First-fit single input selection: the first candidate worth at least
    /// `spend` plus the fee of a transaction paying `outputs` from it.
    pub async fn select(
        &self,
        spend: Amount,
        rate: FeeRate,
        min_confirmations: u32,
        outputs: &[TxOut],
    ) -> Result<Utxo> {
        let available = self.check_balance(spend, min_confirmations).await?;

        for (utxo, kind) in self.unlocked_candidates(min_confirmations).await? {
            let required = required_amount(available, spend, &[fee_for(&[kind], outputs, rate)])?;
            if utxo.value < required {
                continue;
            }
            if self.is_spent(utxo.outpoint).await {
                continue;
            }
            info!(
                outpoint = %utxo.outpoint,
                value = utxo.value.to_sat(),
                required = required.to_sat(),
                "Selected output"
            );
            return Ok(utxo);
        }

        Err(EngineError::NoSuitableUtxo {
            required: required_amount(available, spend, &[fee_for(&[ScriptKind::P2wpkh], outputs, rate)])?,
        })
    }

    /// Accumulates candidates in listing order until the leftover after
    /// `spend` and fee exceeds the dust threshold, so a change output can
    /// always be created.
    pub async fn select_accumulating(
        &self,
        spend: Amount,
        rate: FeeRate,
        min_confirmations: u32,
        outputs: &[TxOut],
    ) -> Result<Vec<Utxo>> {
        let available = self.check_balance(spend, min_confirmations).await?;

        let mut chosen = Vec::new();
        let mut kinds = Vec::new();
        let mut total = Amount::ZERO;
        let mut required = required_amount(available, spend, &[DUST_THRESHOLD])?;

        for (utxo, kind) in self.unlocked_candidates(min_confirmations).await? {
            if self.is_spent(utxo.outpoint).await {
                continue;
            }
            total = required_amount(available, total, &[utxo.value])?;
            kinds.push(kind);
            chosen.push(utxo);

            required = required_amount(available, spend, &[fee_for(&kinds, outputs, rate), DUST_THRESHOLD])?;
            if total > required {
                info!(inputs = chosen.len(), total = total.to_sat(), "Selected outputs");
                return Ok(chosen);
            }
        }

        Err(EngineError::NoSuitableUtxo { required })
    }

    /// Spendable outputs not in `exclude`, largest first. Used for fee bump
    /// top-ups.
    pub async fn candidates_largest_first(
        &self,
        min_confirmations: u32,
        exclude: &HashSet<OutPoint>,
    ) -> Result<Vec<(Utxo, ScriptKind)>> {
        let mut candidates = Vec::new();
        for (utxo, kind) in self.unlocked_candidates(min_confirmations).await? {
            if exclude.contains(&utxo.outpoint) || self.is_spent(utxo.outpoint).await {
                continue;
            }
            candidates.push((utxo, kind));
        }
        candidates.sort_by(|a, b| b.0.value.cmp(&a.0.value));
        Ok(candidates)
    }
}
