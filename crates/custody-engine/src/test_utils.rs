//! Fixtures shared by the unit tests.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::{transaction, Address, Amount, Network, OutPoint, ScriptBuf, Transaction, TxIn, TxOut, Txid};

use crate::address_pool::{AddressPool, AddressPoolConfig};
use crate::explorer::MockBlockExplorer;
use crate::signer::tests::{script_for, test_key};
use crate::signer::ScriptKind;
use crate::store::Store;
use crate::utxo_selector::UtxoSelector;
use crate::wallet::{MockWalletBackend, Utxo, WalletBackend};
use crate::DatabaseLocation;

/// Seeds at or above this are handed out as change addresses.
pub(crate) const CHANGE_SEED_START: u8 = 100;

pub(crate) fn regtest_address(kind: ScriptKind, seed: u8) -> Address {
    Address::from_script(&script_for(kind, &test_key(seed)), Network::Regtest).unwrap()
}

/// Wallet owning every script kind for seeds 1..=40 and P2WPKH change from
/// seed 100 upwards.
pub(crate) fn mock_wallet(utxos: Vec<Utxo>) -> MockWalletBackend {
    let balance: Amount = utxos.iter().map(|u| u.value).sum();
    let keys: Vec<(ScriptBuf, u8)> = (1..=40u8)
        .flat_map(|seed| {
            [ScriptKind::P2pkh, ScriptKind::P2wpkh, ScriptKind::P2shP2wpkh]
                .into_iter()
                .map(move |kind| (script_for(kind, &test_key(seed)), seed))
        })
        .chain((CHANGE_SEED_START..=160u8).map(|seed| (script_for(ScriptKind::P2wpkh, &test_key(seed)), seed)))
        .collect();

    let mut wallet = MockWalletBackend::new();
    wallet.expect_balance().returning(move |_| Ok(balance));
    wallet
        .expect_list_unspent()
        .returning(move |_| Ok(utxos.clone()));
    let change_seed = Arc::new(AtomicU8::new(CHANGE_SEED_START));
    wallet.expect_derive_address().returning(move |_| {
        Ok(regtest_address(
            ScriptKind::P2wpkh,
            change_seed.fetch_add(1, Ordering::SeqCst),
        ))
    });
    wallet.expect_private_key().returning(move |address| {
        keys.iter()
            .find(|(script, _)| *script == address.script_pubkey())
            .map(|(_, seed)| test_key(*seed))
            .ok_or_else(|| eyre::eyre!("unknown address {}", address))
    });
    wallet
}

pub(crate) fn unspent_explorer() -> MockBlockExplorer {
    let mut explorer = MockBlockExplorer::new();
    explorer.expect_is_output_spent().returning(|_| Ok(false));
    explorer
}

/// Store, selector and pool wired to the same wallet and an in-memory database.
pub(crate) struct Fixture {
    pub wallet: Arc<dyn WalletBackend>,
    pub store: Store,
    pub selector: Arc<UtxoSelector>,
    pub pool: Arc<AddressPool>,
}

pub(crate) async fn fixture(utxos: Vec<Utxo>) -> Fixture {
    let wallet: Arc<dyn WalletBackend> = Arc::new(mock_wallet(utxos));
    let store = Store::open(&DatabaseLocation::InMemory, "fixture").await.unwrap();
    let selector = Arc::new(UtxoSelector::new(
        wallet.clone(),
        Arc::new(unspent_explorer()),
        store.clone(),
        Duration::from_secs(600),
    ));
    let pool = Arc::new(AddressPool::new(
        store.clone(),
        wallet.clone(),
        Network::Regtest,
        AddressPoolConfig {
            min_available: 2,
            ..Default::default()
        },
    ));
    Fixture {
        wallet,
        store,
        selector,
        pool,
    }
}

/// An unsigned transaction paying `outputs`, usable as a parent whose outputs
/// later transactions spend.
pub(crate) fn funding_tx(tag: u8, outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(Txid::from_byte_array([tag; 32]), 0),
            ..Default::default()
        }],
        output: outputs,
    }
}

pub(crate) fn pay(address: &Address, sats: u64) -> TxOut {
    TxOut {
        value: Amount::from_sat(sats),
        script_pubkey: address.script_pubkey(),
    }
}
