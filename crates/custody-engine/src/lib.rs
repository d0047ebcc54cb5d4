pub mod address_pool;
pub mod broadcast;
pub mod chain;
pub mod config;
pub mod electrum;
pub mod engine;
pub mod error;
pub mod explorer;
pub mod fee_advisor;
pub mod rbf_builder;
pub mod relay;
pub mod signer;
pub mod store;
pub mod txn_builder;
pub mod utxo_selector;
pub mod wallet;

#[cfg(test)]
pub(crate) mod test_utils;

use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

pub use engine::{EngineComponents, EngineState, PaymentRequest, TransactionEngine, TransactionResult};
pub use error::{EngineError, Result, Stage};

#[derive(Debug, Clone, PartialEq, Eq)]
/// Where to store the database (in-memory or on disk).
pub enum DatabaseLocation {
    InMemory,
    Directory(String),
}

impl FromStr for DatabaseLocation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "memory" => Ok(DatabaseLocation::InMemory),
            s => Ok(DatabaseLocation::Directory(s.to_string())),
        }
    }
}

impl std::fmt::Display for DatabaseLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseLocation::InMemory => write!(f, "memory"),
            DatabaseLocation::Directory(path) => write!(f, "{path}"),
        }
    }
}

/// Seconds since the unix epoch, saturating to zero on a clock set before 1970.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
