//! Boundary to the underlying wallet library.
//!
//! Key derivation and keystore management live outside this crate. The engine
//! only needs the handful of calls below and never persists key material.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use bitcoin::{Address, Amount, OutPoint, PrivateKey, ScriptBuf};

/// Which branch of the wallet an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    Receive,
    Change,
}

impl AddressKind {
    pub const ALL: [AddressKind; 2] = [AddressKind::Receive, AddressKind::Change];

    pub fn as_str(&self) -> &'static str {
        match self {
            AddressKind::Receive => "receive",
            AddressKind::Change => "change",
        }
    }
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AddressKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "receive" => Ok(AddressKind::Receive),
            "change" => Ok(AddressKind::Change),
            other => Err(format!("unknown address kind: {other}")),
        }
    }
}

/// An unspent output as reported live by the wallet library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub address: Address,
    pub script_pubkey: ScriptBuf,
    pub confirmations: u32,
}

impl Utxo {
    pub fn to_txout(&self) -> bitcoin::TxOut {
        bitcoin::TxOut {
            value: self.value,
            script_pubkey: self.script_pubkey.clone(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WalletBackend: Send + Sync {
    /// Unspent outputs with at least `min_confirmations` confirmations.
    async fn list_unspent(&self, min_confirmations: u32) -> eyre::Result<Vec<Utxo>>;

    async fn balance(&self, min_confirmations: u32) -> eyre::Result<Amount>;

    /// Derive the next unused address on the given branch.
    async fn derive_address(&self, kind: AddressKind) -> eyre::Result<Address>;

    async fn private_key(&self, address: &Address) -> eyre::Result<PrivateKey>;
}
