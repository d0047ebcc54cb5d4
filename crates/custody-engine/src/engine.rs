//! Request entry point tying selection, building, persistence and broadcast
//! together.
//!
//! One request runs at a time. A request arriving while another is in flight
//! is rejected with [`EngineError::Busy`] instead of waiting.

use std::fmt;
use std::sync::{Arc, Mutex};

use bitcoin::consensus::encode::serialize_hex;
use bitcoin::{Address, Amount, FeeRate, Network, OutPoint, Transaction, Txid};
use tracing::{error, info, warn};

use crate::address_pool::{AddressPool, AddressPoolConfig};
use crate::broadcast::{BroadcastPipeline, BroadcastReport, BroadcastStatus, SubmissionPath, VerificationPolicy};
use crate::chain::ChainService;
use crate::config::EngineConfig;
use crate::electrum::{ElectrumTxSource, NoRawTransactionSource, RawTransactionSource};
use crate::error::{EngineError, Result, Stage};
use crate::explorer::{BlockExplorer, EsploraExplorer};
use crate::fee_advisor::{FeeAdvisor, FeeChoice, FeeTiers, HttpFeeAdvisor, FALLBACK_FEE_TIERS};
use crate::rbf_builder::RbfBuilder;
use crate::relay::RelayChain;
use crate::store::{NewTransactionRecord, Store, TransactionRecord};
use crate::txn_builder::{parse_recipient, PaymentPlan, TxnBuilder};
use crate::utxo_selector::UtxoSelector;
use crate::wallet::WalletBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Building,
    Broadcasting,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::Building => "building",
            EngineState::Broadcasting => "broadcasting",
        };
        f.write_str(name)
    }
}

/// Holds the engine out of `Idle` for the lifetime of one request.
struct RequestGuard<'a> {
    state: &'a Mutex<EngineState>,
}

impl RequestGuard<'_> {
    fn advance(&self, next: EngineState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = EngineState::Idle;
    }
}

#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub recipient: String,
    pub amount: Amount,
    pub fee: FeeChoice,
    /// Signal opt-in replacement on every input.
    pub rbf: bool,
    pub min_confirmations: Option<u32>,
    /// Hex encoded provenance hash, carried in an OP_RETURN output.
    pub content_hash: Option<String>,
}

impl PaymentRequest {
    pub fn new(recipient: impl Into<String>, amount: Amount, fee: FeeChoice) -> Self {
        Self {
            recipient: recipient.into(),
            amount,
            fee,
            rbf: false,
            min_confirmations: None,
            content_hash: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    pub txid: Txid,
    pub verified: bool,
    pub status: BroadcastStatus,
    pub path: SubmissionPath,
    pub fee: Amount,
    pub vsize: u64,
    /// Set when this transaction replaced an earlier one.
    pub replaces: Option<Txid>,
}

impl TransactionResult {
    fn new(report: BroadcastReport, tx: &Transaction, fee: Amount, replaces: Option<Txid>) -> Self {
        Self {
            txid: report.txid,
            verified: report.verified(),
            status: report.status,
            path: report.path,
            fee,
            vsize: tx.vsize() as u64,
            replaces,
        }
    }
}

/// Network-facing collaborators, swappable for tests and alternative hosts.
pub struct EngineComponents {
    pub wallet: Arc<dyn WalletBackend>,
    pub chain: Arc<dyn ChainService>,
    pub explorer: Arc<dyn BlockExplorer>,
    pub fee_advisor: Arc<dyn FeeAdvisor>,
    pub relays: RelayChain,
    pub raw_source: Arc<dyn RawTransactionSource>,
    pub store: Store,
}

impl EngineComponents {
    /// Builds the HTTP, Esplora and Electrum clients named by `config`.
    pub async fn from_config(
        config: &EngineConfig,
        wallet: Arc<dyn WalletBackend>,
        chain: Arc<dyn ChainService>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| EngineError::Config(e.to_string()))?;
        let timeout = config.http_timeout();

        let store = Store::open(&config.database_location, config.wallet_name.clone())
            .await
            .map_err(|e| EngineError::store(Stage::Persist, e))?;
        let explorer = EsploraExplorer::new(&config.explorer_url, timeout)
            .map_err(|e| EngineError::Config(e.to_string()))?;
        let fee_advisor = HttpFeeAdvisor::new(config.fee_endpoint.clone(), timeout)
            .map_err(|e| EngineError::Config(e.to_string()))?;
        let relays = RelayChain::from_endpoints(&config.relay_endpoints, timeout)
            .map_err(|e| EngineError::Config(e.to_string()))?;
        let raw_source: Arc<dyn RawTransactionSource> = match &config.electrum_url {
            Some(url) => Arc::new(
                ElectrumTxSource::new(url, timeout).map_err(|e| EngineError::network(Stage::Lookup, e))?,
            ),
            None => {
                warn!("No electrum server configured, fee bumps need the original in the local store");
                Arc::new(NoRawTransactionSource)
            }
        };

        Ok(Self {
            wallet,
            chain,
            explorer: Arc::new(explorer),
            fee_advisor: Arc::new(fee_advisor),
            relays,
            raw_source,
            store,
        })
    }
}

pub struct TransactionEngine {
    state: Mutex<EngineState>,
    network: Network,
    min_confirmations: u32,
    store: Store,
    chain: Arc<dyn ChainService>,
    fee_advisor: Arc<dyn FeeAdvisor>,
    address_pool: Arc<AddressPool>,
    builder: TxnBuilder,
    rbf: RbfBuilder,
    pipeline: BroadcastPipeline,
}

impl TransactionEngine {
    pub async fn connect(
        config: EngineConfig,
        wallet: Arc<dyn WalletBackend>,
        chain: Arc<dyn ChainService>,
    ) -> Result<Self> {
        let components = EngineComponents::from_config(&config, wallet, chain).await?;
        Ok(Self::with_components(&config, components))
    }

    pub fn with_components(config: &EngineConfig, components: EngineComponents) -> Self {
        let EngineComponents {
            wallet,
            chain,
            explorer,
            fee_advisor,
            relays,
            raw_source,
            store,
        } = components;

        let selector = Arc::new(UtxoSelector::new(
            wallet.clone(),
            explorer.clone(),
            store.clone(),
            std::time::Duration::from_secs(config.lock_expiry_secs),
        ));
        let address_pool = Arc::new(AddressPool::new(
            store.clone(),
            wallet.clone(),
            config.network,
            AddressPoolConfig::from(config),
        ));
        let builder = TxnBuilder::new(
            wallet.clone(),
            selector.clone(),
            address_pool.clone(),
            config.network,
        );
        let rbf = RbfBuilder::new(
            wallet,
            selector,
            address_pool.clone(),
            store.clone(),
            raw_source,
            config.network,
        );
        let pipeline = BroadcastPipeline::new(
            relays,
            chain.clone(),
            explorer,
            store.clone(),
            VerificationPolicy::from(config),
        );

        Self {
            state: Mutex::new(EngineState::Idle),
            network: config.network,
            min_confirmations: config.min_confirmations,
            store,
            chain,
            fee_advisor,
            address_pool,
            builder,
            rbf,
            pipeline,
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin(&self) -> Result<RequestGuard<'_>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != EngineState::Idle {
            return Err(EngineError::Busy(*state));
        }
        *state = EngineState::Building;
        Ok(RequestGuard { state: &self.state })
    }

    /// For hosts that run the background replenisher.
    pub fn address_pool(&self) -> Arc<AddressPool> {
        self.address_pool.clone()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn fee_tiers(&self) -> FeeTiers {
        self.fee_advisor.fee_tiers().await
    }

    async fn resolve_rate(&self, choice: FeeChoice) -> Result<FeeRate> {
        if choice.needs_tiers() {
            choice.resolve(&self.fee_advisor.fee_tiers().await)
        } else {
            choice.resolve(&FALLBACK_FEE_TIERS)
        }
    }

    /// Builds, signs, persists and broadcasts a payment.
    pub async fn send_payment(&self, request: PaymentRequest) -> Result<TransactionResult> {
        let guard = self.begin()?;

        let recipient = parse_recipient(&request.recipient, self.network)?;
        let content_hash = request
            .content_hash
            .as_deref()
            .map(|h| hex::decode(h).map_err(|e| EngineError::InvalidContentHash(e.to_string())))
            .transpose()?;
        let rate = self.resolve_rate(request.fee).await?;
        let plan = PaymentPlan {
            recipient,
            amount: request.amount,
            rate,
            min_confirmations: request.min_confirmations.unwrap_or(self.min_confirmations),
            rbf: request.rbf,
        };
        info!(
            recipient = %plan.recipient,
            amount = plan.amount.to_sat(),
            rate = rate.to_sat_per_vb_ceil(),
            annotated = content_hash.is_some(),
            "Payment requested"
        );

        let built = match &content_hash {
            Some(hash) => self.builder.build_annotated(&plan, hash).await?,
            None => self.builder.build_payment(&plan).await?,
        };
        let txid = built.tx.compute_txid();
        let source = built
            .inputs
            .first()
            .map(|u| u.address.to_string())
            .unwrap_or_default();

        self.persist(&built.tx, built.fee, None, &source).await?;
        let outpoints = built.outpoints();
        self.lock(&outpoints, txid).await?;

        guard.advance(EngineState::Broadcasting);
        let report = self.pipeline.broadcast(&built.tx, &outpoints).await?;
        Ok(TransactionResult::new(report, &built.tx, built.fee, None))
    }

    /// Replaces `txid` with a copy paying `fee`. The original stays in the
    /// store and is linked to its replacement once a submission path accepts
    /// it. If none does, the original keeps its inputs and only the inputs
    /// added for the bump are released.
    pub async fn bump_fee(
        &self,
        txid: Txid,
        fee: FeeChoice,
        min_confirmations: Option<u32>,
    ) -> Result<TransactionResult> {
        let guard = self.begin()?;

        let rate = self.resolve_rate(fee).await?;
        let outcome = self
            .rbf
            .build_replacement(txid, rate, min_confirmations.unwrap_or(self.min_confirmations))
            .await?;
        let replacement = outcome.tx.compute_txid();
        let source = outcome
            .prevouts
            .first()
            .and_then(|p| Address::from_script(&p.script_pubkey, self.network).ok())
            .map(|a| a.to_string())
            .unwrap_or_default();

        self.persist(&outcome.tx, outcome.new_fee, Some(txid), &source)
            .await?;
        let outpoints = outcome.outpoints();
        self.lock(&outpoints, replacement).await?;

        guard.advance(EngineState::Broadcasting);
        let added: Vec<OutPoint> = outcome.added_inputs.iter().map(|u| u.outpoint).collect();
        let report = match self.pipeline.broadcast(&outcome.tx, &added).await {
            Ok(report) => report,
            Err(e) => {
                let shared: Vec<OutPoint> = outpoints
                    .iter()
                    .filter(|op| !added.contains(op))
                    .copied()
                    .collect();
                if let Err(lock_err) = self.lock(&shared, txid).await {
                    error!(%txid, error = %lock_err, "Failed to hand inputs back to the original");
                }
                warn!(%txid, %replacement, "Replacement not accepted, original keeps its inputs");
                return Err(e);
            }
        };
        self.store
            .mark_tx_replaced(txid, replacement)
            .await
            .map_err(|e| EngineError::store(Stage::Persist, e))?;
        Ok(TransactionResult::new(
            report,
            &outcome.tx,
            outcome.new_fee,
            Some(txid),
        ))
    }

    /// Pushes a stored transaction through the pipeline again. Its inputs stay
    /// locked to it whatever the outcome.
    pub async fn rebroadcast(&self, txid: Txid) -> Result<TransactionResult> {
        let guard = self.begin()?;

        let record = self
            .store
            .raw_transaction(txid)
            .await
            .map_err(|e| EngineError::store(Stage::Lookup, e))?
            .ok_or(EngineError::TransactionNotFound { txid })?;
        if let Some(replaced_by) = record.replaced_by {
            warn!(%txid, %replaced_by, "Rebroadcasting a replaced transaction");
        } else {
            let outpoints: Vec<OutPoint> = record.tx.input.iter().map(|i| i.previous_output).collect();
            self.lock(&outpoints, txid).await?;
        }

        guard.advance(EngineState::Broadcasting);
        let report = self.pipeline.broadcast(&record.tx, &[]).await?;
        Ok(TransactionResult::new(
            report,
            &record.tx,
            record.fee,
            record.replaces,
        ))
    }

    async fn persist(
        &self,
        tx: &Transaction,
        fee: Amount,
        replaces: Option<Txid>,
        source: &str,
    ) -> Result<()> {
        self.store
            .save_raw_transaction(tx, fee, replaces)
            .await
            .map_err(|e| EngineError::store(Stage::Persist, e))?;
        self.record_outputs(tx, source, None).await?;
        Ok(())
    }

    async fn lock(&self, outpoints: &[OutPoint], txid: Txid) -> Result<()> {
        self.store
            .lock_outpoints(outpoints, txid)
            .await
            .map_err(|e| EngineError::store(Stage::Persist, e))
    }

    /// One record per addressable output. Data outputs are skipped.
    async fn record_outputs(
        &self,
        tx: &Transaction,
        source: &str,
        block_height: Option<u32>,
    ) -> Result<usize> {
        let txid = tx.compute_txid();
        let raw_hex = serialize_hex(tx);
        let mut inserted = 0;

        for (vout, output) in tx.output.iter().enumerate() {
            let Ok(destination) = Address::from_script(&output.script_pubkey, self.network) else {
                continue;
            };
            let record = NewTransactionRecord {
                txid,
                vout: vout as u32,
                source: source.to_string(),
                destination: destination.to_string(),
                value: output.value,
                block_height,
                raw_hex: raw_hex.clone(),
            };
            if self
                .store
                .insert_transaction_record(record)
                .await
                .map_err(|e| EngineError::store(Stage::Persist, e))?
            {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Feeds a transaction seen on chain to the used-address detector: every
    /// output paying a wallet address marks it used and is recorded. Returns
    /// how many addresses changed state.
    pub async fn observe_transaction(&self, tx: &Transaction, block_height: Option<u32>) -> Result<usize> {
        let mut marked = 0;
        let mut ours = false;
        for output in &tx.output {
            let Ok(address) = Address::from_script(&output.script_pubkey, self.network) else {
                continue;
            };
            let known = self
                .store
                .is_wallet_address(&address.to_string())
                .await
                .map_err(|e| EngineError::store(Stage::AddressPool, e))?;
            if !known {
                continue;
            }
            ours = true;
            if self.address_pool.mark_used(&address, block_height).await? {
                marked += 1;
            }
        }
        if ours {
            self.record_outputs(tx, "", block_height).await?;
        }
        Ok(marked)
    }

    /// Payment records not yet relayed to the companion backend.
    pub async fn pending_backend_relay(&self) -> Result<Vec<TransactionRecord>> {
        self.store
            .unsent_transactions()
            .await
            .map_err(|e| EngineError::store(Stage::Lookup, e))
    }

    pub async fn mark_relayed(&self, txid: Txid, vout: u32) -> Result<()> {
        self.store
            .clear_unsent(txid, vout)
            .await
            .map_err(|e| EngineError::store(Stage::Persist, e))
    }

    /// Stores the chain service's best height as the rescan cursor.
    pub async fn sync_chain_height(&self) -> Result<u32> {
        let height = self
            .chain
            .best_block_height()
            .await
            .map_err(|e| EngineError::network(Stage::Lookup, e))?;
        self.store
            .set_last_scanned_height(height)
            .await
            .map_err(|e| EngineError::store(Stage::Persist, e))?;
        Ok(height)
    }

    /// Removes every row of this wallet, addresses included.
    pub async fn delete_wallet(&self) -> Result<()> {
        let _guard = self.begin()?;
        self.store
            .delete_wallet()
            .await
            .map_err(|e| EngineError::store(Stage::Persist, e))
    }
}
