//! Payment transaction construction.
//!
//! A payment spends a single first-fit output. The annotated variant spends as
//! many outputs as needed, tags the transaction with a content hash in an
//! OP_RETURN output and always pays change.

use std::str::FromStr;
use std::sync::Arc;

use bitcoin::blockdata::script::{Builder, PushBytesBuf};
use bitcoin::locktime::absolute::LockTime;
use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::{
    transaction, Address, Amount, FeeRate, Network, OutPoint, ScriptBuf, Sequence, Transaction,
    TxIn, TxOut, Witness,
};
use tracing::info;

use crate::address_pool::AddressPool;
use crate::error::{EngineError, Result};
use crate::signer::{
    collect_signing_inputs, estimate_weight, fee_for_vsize, sign_transaction, verify_transaction,
    vsize, ScriptKind,
};
use crate::utxo_selector::UtxoSelector;
use crate::wallet::{AddressKind, Utxo, WalletBackend};

pub const DUST_THRESHOLD: Amount = Amount::from_sat(546);

/// Signals opt-in replacement.
pub const RBF_SEQUENCE: Sequence = Sequence(0xFFFFFFFD);

/// Largest data payload relays accept in an OP_RETURN output.
pub const MAX_CONTENT_HASH_LEN: usize = 80;

/// Longest change script the wallet may hand out (P2TR/P2WSH). Fees are
/// estimated with it before the real change address is known.
const CHANGE_SCRIPT_PLACEHOLDER_LEN: usize = 34;

/// Change left after paying `spend` and `fee` from `input`, if it is worth an output.
pub fn plan_change(input: Amount, spend: Amount, fee: Amount) -> Option<Amount> {
    let change = input.checked_sub(spend)?.checked_sub(fee)?;
    (change > DUST_THRESHOLD).then_some(change)
}

pub fn content_hash_script(content_hash: &[u8]) -> Result<ScriptBuf> {
    if content_hash.is_empty() || content_hash.len() > MAX_CONTENT_HASH_LEN {
        return Err(EngineError::InvalidContentHash(format!(
            "expected 1 to {} bytes, got {}",
            MAX_CONTENT_HASH_LEN,
            content_hash.len()
        )));
    }
    let payload = PushBytesBuf::try_from(content_hash.to_vec())
        .map_err(|e| EngineError::InvalidContentHash(e.to_string()))?;
    Ok(Builder::new()
        .push_opcode(OP_RETURN)
        .push_slice(payload)
        .into_script())
}

pub fn parse_recipient(address: &str, network: Network) -> Result<Address> {
    Address::from_str(address)
        .and_then(|a| a.require_network(network))
        .map_err(|e| EngineError::InvalidRecipientAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

pub(crate) fn change_placeholder() -> TxOut {
    TxOut {
        value: Amount::ZERO,
        script_pubkey: ScriptBuf::from_bytes(vec![0; CHANGE_SCRIPT_PLACEHOLDER_LEN]),
    }
}

pub(crate) fn estimated_fee(kinds: &[ScriptKind], outputs: &[TxOut], rate: FeeRate) -> Amount {
    fee_for_vsize(rate, vsize(estimate_weight(kinds, outputs)))
}

pub(crate) fn unsigned_input(outpoint: OutPoint, sequence: Sequence) -> TxIn {
    TxIn {
        previous_output: outpoint,
        script_sig: ScriptBuf::new(),
        sequence,
        witness: Witness::new(),
    }
}

/// A signed and verified transaction that has not been persisted yet.
#[derive(Debug, Clone)]
pub struct BuiltTransaction {
    pub tx: Transaction,
    pub fee: Amount,
    pub vsize: u64,
    /// Outputs spent, in input order.
    pub inputs: Vec<Utxo>,
    pub recipient_vout: u32,
    pub change: Option<(u32, Address)>,
}

impl BuiltTransaction {
    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.inputs.iter().map(|u| u.outpoint).collect()
    }
}

/// Everything a build needs to know about the payment itself.
#[derive(Debug, Clone)]
pub struct PaymentPlan {
    pub recipient: Address,
    pub amount: Amount,
    pub rate: FeeRate,
    pub min_confirmations: u32,
    pub rbf: bool,
}

pub struct TxnBuilder {
    wallet: Arc<dyn WalletBackend>,
    selector: Arc<UtxoSelector>,
    address_pool: Arc<AddressPool>,
    network: Network,
}

impl TxnBuilder {
    pub fn new(
        wallet: Arc<dyn WalletBackend>,
        selector: Arc<UtxoSelector>,
        address_pool: Arc<AddressPool>,
        network: Network,
    ) -> Self {
        Self {
            wallet,
            selector,
            address_pool,
            network,
        }
    }

    /// Single input payment with change only when it clears the dust threshold.
    pub async fn build_payment(&self, plan: &PaymentPlan) -> Result<BuiltTransaction> {
        let recipient = TxOut {
            value: plan.amount,
            script_pubkey: plan.recipient.script_pubkey(),
        };

        // Change is optional, so the input only has to cover the no-change fee.
        let utxo = self
            .selector
            .select(
                plan.amount,
                plan.rate,
                plan.min_confirmations,
                std::slice::from_ref(&recipient),
            )
            .await?;
        let kinds = [kind_of(&utxo, 0)?];

        let mut outputs = vec![recipient.clone()];
        let mut change = None;
        let mut fee = utxo.value - plan.amount;

        let fee_with_change = estimated_fee(&kinds, &[recipient.clone(), change_placeholder()], plan.rate);
        if plan_change(utxo.value, plan.amount, fee_with_change).is_some() {
            let change_address = self.address_pool.allocate(AddressKind::Change).await?;
            let change_output = TxOut {
                value: Amount::ZERO,
                script_pubkey: change_address.script_pubkey(),
            };
            let real_fee = estimated_fee(&kinds, &[recipient, change_output.clone()], plan.rate);
            // The real change script is never longer than the placeholder.
            if let Some(change_value) = plan_change(utxo.value, plan.amount, real_fee) {
                outputs.push(TxOut {
                    value: change_value,
                    ..change_output
                });
                change = Some((1, change_address));
                fee = real_fee;
            }
        }

        let sequence = if plan.rbf { RBF_SEQUENCE } else { Sequence::MAX };
        let tx = Transaction {
            version: transaction::Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![unsigned_input(utxo.outpoint, sequence)],
            output: outputs,
        };

        self.finalize(tx, vec![utxo], fee, 0, change).await
    }

    /// Multi input payment carrying `content_hash` in a zero-value OP_RETURN output.
    pub async fn build_annotated(
        &self,
        plan: &PaymentPlan,
        content_hash: &[u8],
    ) -> Result<BuiltTransaction> {
        let recipient = TxOut {
            value: plan.amount,
            script_pubkey: plan.recipient.script_pubkey(),
        };
        let data = TxOut {
            value: Amount::ZERO,
            script_pubkey: content_hash_script(content_hash)?,
        };

        let utxos = self
            .selector
            .select_accumulating(
                plan.amount,
                plan.rate,
                plan.min_confirmations,
                &[recipient.clone(), data.clone(), change_placeholder()],
            )
            .await?;
        let kinds = utxos
            .iter()
            .enumerate()
            .map(|(i, u)| kind_of(u, i))
            .collect::<Result<Vec<_>>>()?;
        let total: Amount = utxos.iter().map(|u| u.value).sum();

        let change_address = self.address_pool.allocate(AddressKind::Change).await?;
        let change_output = TxOut {
            value: Amount::ZERO,
            script_pubkey: change_address.script_pubkey(),
        };
        let fee = estimated_fee(
            &kinds,
            &[recipient.clone(), data.clone(), change_output.clone()],
            plan.rate,
        );
        let change_value = plan_change(total, plan.amount, fee).ok_or(EngineError::NoSuitableUtxo {
            required: plan.amount + fee + DUST_THRESHOLD,
        })?;

        let sequence = if plan.rbf { RBF_SEQUENCE } else { Sequence::MAX };
        let tx = Transaction {
            version: transaction::Version::TWO,
            lock_time: LockTime::ZERO,
            input: utxos
                .iter()
                .map(|u| unsigned_input(u.outpoint, sequence))
                .collect(),
            output: vec![
                recipient,
                data,
                TxOut {
                    value: change_value,
                    ..change_output
                },
            ],
        };

        self.finalize(tx, utxos, fee, 0, Some((2, change_address))).await
    }

    /// Signs every input and verifies the result before handing it back.
    async fn finalize(
        &self,
        mut tx: Transaction,
        inputs: Vec<Utxo>,
        fee: Amount,
        recipient_vout: u32,
        change: Option<(u32, Address)>,
    ) -> Result<BuiltTransaction> {
        let prevouts: Vec<TxOut> = inputs.iter().map(Utxo::to_txout).collect();
        let signing_inputs = collect_signing_inputs(self.wallet.as_ref(), &prevouts, self.network).await?;
        sign_transaction(&mut tx, &signing_inputs)?;
        verify_transaction(&tx, &prevouts)?;

        let vsize = tx.vsize() as u64;
        info!(
            txid = %tx.compute_txid(),
            inputs = tx.input.len(),
            outputs = tx.output.len(),
            fee = fee.to_sat(),
            vsize,
            "Built and verified transaction"
        );

        Ok(BuiltTransaction {
            tx,
            fee,
            vsize,
            inputs,
            recipient_vout,
            change,
        })
    }
}

fn kind_of(utxo: &Utxo, input: usize) -> Result<ScriptKind> {
    ScriptKind::classify(&utxo.script_pubkey).ok_or_else(|| EngineError::UnsupportedScript {
        input,
        script: crate::signer::describe_script(&utxo.script_pubkey),
    })
}
