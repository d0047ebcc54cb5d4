use std::fmt;

use bitcoin::{Amount, Txid};

use crate::engine::EngineState;

/// The step of a build/broadcast flow an error surfaced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Select,
    Build,
    Sign,
    Persist,
    Relay,
    Verify,
    Lookup,
    AddressPool,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Select => "utxo selection",
            Stage::Build => "transaction build",
            Stage::Sign => "signing",
            Stage::Persist => "persistence",
            Stage::Relay => "relay",
            Stage::Verify => "mempool verification",
            Stage::Lookup => "transaction lookup",
            Stage::AddressPool => "address pool",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("insufficient balance: {available} available, {required} required")]
    InsufficientBalance { available: Amount, required: Amount },

    #[error("no spendable output covers {required} (spend plus fee)")]
    NoSuitableUtxo { required: Amount },

    #[error("invalid recipient address {address}: {reason}")]
    InvalidRecipientAddress { address: String, reason: String },

    #[error("signature verification failed for input {input}: {reason}")]
    SignatureInvalid { input: usize, reason: String },

    #[error("input {input} spends an unsupported script {script}")]
    UnsupportedScript { input: usize, script: String },

    #[error("fee rate of {sat_per_vb} sat/vB is out of range")]
    InvalidFeeRate { sat_per_vb: u64 },

    #[error("replacement fee {new_fee} does not exceed original fee {old_fee}")]
    FeeNotIncreased { old_fee: Amount, new_fee: Amount },

    #[error("wallet cannot cover the fee bump, short by {shortfall}")]
    InsufficientFundsForBump { shortfall: Amount },

    #[error("transaction weight {weight} WU exceeds the relay limit of {max} WU")]
    TxTooLarge { weight: u64, max: u64 },

    #[error("all {attempts} broadcast paths failed for {txid}: {last_error}")]
    BroadcastExhausted {
        txid: Txid,
        attempts: usize,
        last_error: String,
    },

    #[error("broadcast succeeded, not yet visible: {txid}")]
    UnconfirmedAfterBroadcast { txid: Txid },

    #[error("transaction {txid} not found in the local store or remotely")]
    TransactionNotFound { txid: Txid },

    #[error("malformed transaction {txid}: {reason}")]
    MalformedTransaction { txid: Txid, reason: String },

    #[error("invalid content hash: {0}")]
    InvalidContentHash(String),

    #[error("engine busy: a request is already {0}")]
    Busy(EngineState),

    #[error("{stage} failed in the store: {message}")]
    Store { stage: Stage, message: String },

    #[error("{stage} failed in the wallet library: {message}")]
    Wallet { stage: Stage, message: String },

    #[error("{stage} failed on the network: {message}")]
    Network { stage: Stage, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    pub(crate) fn store(stage: Stage, err: impl fmt::Display) -> Self {
        EngineError::Store {
            stage,
            message: err.to_string(),
        }
    }

    pub(crate) fn wallet(stage: Stage, err: impl fmt::Display) -> Self {
        EngineError::Wallet {
            stage,
            message: err.to_string(),
        }
    }

    pub(crate) fn network(stage: Stage, err: impl fmt::Display) -> Self {
        EngineError::Network {
            stage,
            message: err.to_string(),
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            EngineError::InsufficientBalance { .. } | EngineError::NoSuitableUtxo { .. } => {
                Stage::Select
            }
            EngineError::InvalidRecipientAddress { .. }
            | EngineError::UnsupportedScript { .. }
            | EngineError::InvalidContentHash(_)
            | EngineError::InvalidFeeRate { .. }
            | EngineError::FeeNotIncreased { .. }
            | EngineError::InsufficientFundsForBump { .. }
            | EngineError::TxTooLarge { .. }
            | EngineError::Busy(_)
            | EngineError::Config(_) => Stage::Build,
            EngineError::SignatureInvalid { .. } => Stage::Sign,
            EngineError::BroadcastExhausted { .. } => Stage::Relay,
            EngineError::UnconfirmedAfterBroadcast { .. } => Stage::Verify,
            EngineError::TransactionNotFound { .. } | EngineError::MalformedTransaction { .. } => {
                Stage::Lookup
            }
            EngineError::Store { stage, .. }
            | EngineError::Wallet { stage, .. }
            | EngineError::Network { stage, .. } => *stage,
        }
    }

    /// True when the transaction reached at least one submission path, so the
    /// caller must not assume the spend never happened.
    pub fn happened_on_chain(&self) -> bool {
        matches!(self, EngineError::UnconfirmedAfterBroadcast { .. })
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
