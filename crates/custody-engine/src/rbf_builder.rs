//! Replace-by-fee rebuilder.
//!
//! Rebuilds an earlier transaction at a higher fee rate. The extra fee is
//! taken from the trailing change output when it can absorb it, otherwise
//! more wallet outputs are pulled in largest first and change is rebuilt on a
//! fresh change address.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bitcoin::consensus::encode::deserialize;
use bitcoin::locktime::absolute::LockTime;
use bitcoin::{
    transaction, Address, Amount, FeeRate, Network, OutPoint, Transaction, TxOut, Txid,
};
use tracing::{info, warn};

use crate::address_pool::AddressPool;
use crate::electrum::RawTransactionSource;
use crate::error::{EngineError, Result, Stage};
use crate::signer::{
    collect_signing_inputs, describe_script, estimate_weight, sign_transaction,
    verify_transaction, ScriptKind,
};
use crate::store::Store;
use crate::txn_builder::{
    change_placeholder, estimated_fee, plan_change, unsigned_input, DUST_THRESHOLD, RBF_SEQUENCE,
};
use crate::utxo_selector::UtxoSelector;
use crate::wallet::{AddressKind, Utxo, WalletBackend};

/// Relays refuse transactions heavier than this.
pub const MAX_STANDARD_TX_WEIGHT: u64 = 400_000;

#[derive(Debug, Clone)]
pub struct RbfOutcome {
    pub original_txid: Txid,
    pub tx: Transaction,
    pub old_fee: Amount,
    pub new_fee: Amount,
    /// Previous outputs of every input of `tx`, in input order.
    pub prevouts: Vec<TxOut>,
    /// Wallet outputs added to cover the bump.
    pub added_inputs: Vec<Utxo>,
    pub change: Option<(u32, Address)>,
}

impl RbfOutcome {
    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.tx.input.iter().map(|i| i.previous_output).collect()
    }
}

pub struct RbfBuilder {
    wallet: Arc<dyn WalletBackend>,
    selector: Arc<UtxoSelector>,
    address_pool: Arc<AddressPool>,
    store: Store,
    raw_source: Arc<dyn RawTransactionSource>,
    network: Network,
}

impl RbfBuilder {
    pub fn new(
        wallet: Arc<dyn WalletBackend>,
        selector: Arc<UtxoSelector>,
        address_pool: Arc<AddressPool>,
        store: Store,
        raw_source: Arc<dyn RawTransactionSource>,
        network: Network,
    ) -> Self {
        Self {
            wallet,
            selector,
            address_pool,
            store,
            raw_source,
            network,
        }
    }

    /// Local store first, Electrum second.
    pub async fn fetch_transaction(&self, txid: Txid) -> Result<Transaction> {
        if let Some(record) = self
            .store
            .raw_transaction(txid)
            .await
            .map_err(|e| EngineError::store(Stage::Lookup, e))?
        {
            return Ok(record.tx);
        }

        let raw = match self.raw_source.raw_transaction(txid).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(%txid, error = %e, "Remote transaction lookup failed");
                return Err(EngineError::TransactionNotFound { txid });
            }
        };
        let tx: Transaction = deserialize(&raw).map_err(|e| EngineError::MalformedTransaction {
            txid,
            reason: e.to_string(),
        })?;
        if tx.compute_txid() != txid {
            return Err(EngineError::MalformedTransaction {
                txid,
                reason: format!("remote returned {}", tx.compute_txid()),
            });
        }
        Ok(tx)
    }

    async fn prevout(&self, outpoint: OutPoint, unspent: &HashMap<OutPoint, TxOut>) -> Result<TxOut> {
        if let Some(prevout) = unspent.get(&outpoint) {
            return Ok(prevout.clone());
        }
        let parent = self.fetch_transaction(outpoint.txid).await?;
        parent
            .output
            .get(outpoint.vout as usize)
            .cloned()
            .ok_or_else(|| EngineError::MalformedTransaction {
                txid: outpoint.txid,
                reason: format!(
                    "output {} out of range ({} outputs)",
                    outpoint.vout,
                    parent.output.len()
                ),
            })
    }

    async fn is_change_output(&self, outputs: &[TxOut]) -> Result<bool> {
        if outputs.len() < 2 {
            return Ok(false);
        }
        let Some(last) = outputs.last() else {
            return Ok(false);
        };
        let Ok(address) = Address::from_script(&last.script_pubkey, self.network) else {
            return Ok(false);
        };
        self.store
            .is_wallet_address(&address.to_string())
            .await
            .map_err(|e| EngineError::store(Stage::Build, e))
    }

    pub async fn build_replacement(
        &self,
        original_txid: Txid,
        rate: FeeRate,
        min_confirmations: u32,
    ) -> Result<RbfOutcome> {
        let original = self.fetch_transaction(original_txid).await?;

        // The wallet usually still lists the outputs an unconfirmed spend uses.
        let unspent: HashMap<OutPoint, TxOut> = match self.wallet.list_unspent(0).await {
            Ok(utxos) => utxos.iter().map(|u| (u.outpoint, u.to_txout())).collect(),
            Err(e) => {
                warn!(error = %e, "Wallet listing failed, resolving inputs from parents");
                HashMap::new()
            }
        };
        let mut prevouts = Vec::with_capacity(original.input.len());
        for input in &original.input {
            prevouts.push(self.prevout(input.previous_output, &unspent).await?);
        }
        let mut kinds = prevouts
            .iter()
            .enumerate()
            .map(|(i, prevout)| {
                ScriptKind::classify(&prevout.script_pubkey).ok_or_else(|| {
                    EngineError::UnsupportedScript {
                        input: i,
                        script: describe_script(&prevout.script_pubkey),
                    }
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let total_in: Amount = prevouts.iter().map(|p| p.value).sum();
        let total_out: Amount = original.output.iter().map(|o| o.value).sum();
        let old_fee = total_in
            .checked_sub(total_out)
            .ok_or_else(|| EngineError::MalformedTransaction {
                txid: original_txid,
                reason: "outputs exceed inputs".to_string(),
            })?;

        let mut outputs = original.output.clone();
        let has_change = self.is_change_output(&outputs).await?;

        let new_fee = estimated_fee(&kinds, &outputs, rate);
        if new_fee <= old_fee {
            return Err(EngineError::FeeNotIncreased { old_fee, new_fee });
        }
        let extra = new_fee - old_fee;

        let mut added_inputs = Vec::new();
        let mut change = None;

        let change_vout = outputs.len().saturating_sub(1);
        let absorbed = has_change && outputs[change_vout].value > extra + DUST_THRESHOLD;
        if absorbed {
            outputs[change_vout].value -= extra;
            let change_address = Address::from_script(&outputs[change_vout].script_pubkey, self.network)
                .map_err(|e| EngineError::wallet(Stage::Build, e))?;
            change = Some((change_vout as u32, change_address));
            info!(%original_txid, extra = extra.to_sat(), "Change output absorbs the fee bump");
        } else {
            if has_change {
                outputs.pop();
            }
            let pay_total: Amount = outputs.iter().map(|o| o.value).sum();
            let mut have = total_in;

            let exclude: HashSet<OutPoint> =
                original.input.iter().map(|i| i.previous_output).collect();
            let mut candidates = self
                .selector
                .candidates_largest_first(min_confirmations, &exclude)
                .await?
                .into_iter();

            loop {
                let required = pay_total + estimated_fee(&kinds, &outputs, rate);
                if have >= required {
                    break;
                }
                let Some((utxo, kind)) = candidates.next() else {
                    return Err(EngineError::InsufficientFundsForBump {
                        shortfall: required - have,
                    });
                };
                have += utxo.value;
                kinds.push(kind);
                prevouts.push(utxo.to_txout());
                added_inputs.push(utxo);
            }

            let with_change = [outputs.as_slice(), &[change_placeholder()]].concat();
            if plan_change(have, pay_total, estimated_fee(&kinds, &with_change, rate)).is_some() {
                let change_address = self.address_pool.allocate(AddressKind::Change).await?;
                let mut change_output = TxOut {
                    value: Amount::ZERO,
                    script_pubkey: change_address.script_pubkey(),
                };
                let real = [outputs.as_slice(), std::slice::from_ref(&change_output)].concat();
                if let Some(value) = plan_change(have, pay_total, estimated_fee(&kinds, &real, rate)) {
                    change_output.value = value;
                    outputs.push(change_output);
                    change = Some(((outputs.len() - 1) as u32, change_address));
                }
            }

            info!(
                %original_txid,
                added = added_inputs.len(),
                change = change.is_some(),
                "Fee bump funded with additional inputs"
            );
        }

        let estimated_weight = estimate_weight(&kinds, &outputs);
        if estimated_weight > MAX_STANDARD_TX_WEIGHT {
            return Err(EngineError::TxTooLarge {
                weight: estimated_weight,
                max: MAX_STANDARD_TX_WEIGHT,
            });
        }

        let mut inputs: Vec<_> = original
            .input
            .iter()
            .map(|i| unsigned_input(i.previous_output, RBF_SEQUENCE))
            .collect();
        inputs.extend(
            added_inputs
                .iter()
                .map(|u| unsigned_input(u.outpoint, RBF_SEQUENCE)),
        );

        let mut tx = Transaction {
            version: transaction::Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs,
            output: outputs,
        };

        let signing_inputs = collect_signing_inputs(self.wallet.as_ref(), &prevouts, self.network).await?;
        sign_transaction(&mut tx, &signing_inputs)?;
        verify_transaction(&tx, &prevouts)?;

        let weight = tx.weight().to_wu();
        if weight > MAX_STANDARD_TX_WEIGHT {
            return Err(EngineError::TxTooLarge {
                weight,
                max: MAX_STANDARD_TX_WEIGHT,
            });
        }

        let total_in: Amount = prevouts.iter().map(|p| p.value).sum();
        let total_out: Amount = tx.output.iter().map(|o| o.value).sum();
        let new_fee = total_in
            .checked_sub(total_out)
            .ok_or_else(|| EngineError::MalformedTransaction {
                txid: original_txid,
                reason: "replacement outputs exceed inputs".to_string(),
            })?;
        if new_fee <= old_fee {
            return Err(EngineError::FeeNotIncreased { old_fee, new_fee });
        }

        info!(
            %original_txid,
            replacement = %tx.compute_txid(),
            old_fee = old_fee.to_sat(),
            new_fee = new_fee.to_sat(),
            weight,
            "Built replacement transaction"
        );

        Ok(RbfOutcome {
            original_txid,
            tx,
            old_fee,
            new_fee,
            prevouts,
            added_inputs,
            change,
        })
    }
}
