use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{
    Address, Amount, CompressedPublicKey, Network, OutPoint, PrivateKey, ScriptBuf, Txid,
};
use custody_engine::wallet::{AddressKind, Utxo, WalletBackend};

/// In-memory P2WPKH (or P2PKH) wallet with deterministic keys.
pub struct TestWallet {
    network: Network,
    next_seed: AtomicU32,
    keys: Mutex<Vec<(ScriptBuf, PrivateKey)>>,
    utxos: Mutex<Vec<Utxo>>,
}

impl Default for TestWallet {
    fn default() -> Self {
        Self::new(Network::Regtest)
    }
}

impl TestWallet {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            next_seed: AtomicU32::new(1),
            keys: Mutex::new(Vec::new()),
            utxos: Mutex::new(Vec::new()),
        }
    }

    fn new_key(&self) -> PrivateKey {
        let seed = self.next_seed.fetch_add(1, Ordering::SeqCst);
        let digest = sha256::Hash::hash(&seed.to_be_bytes());
        let secret = SecretKey::from_slice(digest.as_byte_array()).unwrap();
        PrivateKey::new(secret, self.network)
    }

    fn new_address(&self, legacy: bool) -> Address {
        let secp = Secp256k1::new();
        let key = self.new_key();
        let pubkey = CompressedPublicKey::from_private_key(&secp, &key).unwrap();
        let address = if legacy {
            Address::p2pkh(pubkey.pubkey_hash(), self.network)
        } else {
            Address::p2wpkh(&pubkey, self.network)
        };
        self.keys
            .lock()
            .unwrap()
            .push((address.script_pubkey(), key));
        address
    }

    fn add_utxo(&self, value: Amount, confirmations: u32, legacy: bool) -> Utxo {
        let address = self.new_address(legacy);
        let tag = self.next_seed.load(Ordering::SeqCst);
        let txid = Txid::from_byte_array(
            sha256::Hash::hash(format!("funding-{tag}").as_bytes()).to_byte_array(),
        );
        let utxo = Utxo {
            outpoint: OutPoint::new(txid, 0),
            value,
            script_pubkey: address.script_pubkey(),
            address,
            confirmations,
        };
        self.utxos.lock().unwrap().push(utxo.clone());
        utxo
    }

    /// Credits a confirmed P2WPKH output to a fresh key.
    pub fn fund(&self, value: Amount, confirmations: u32) -> Utxo {
        self.add_utxo(value, confirmations, false)
    }

    pub fn fund_legacy(&self, value: Amount, confirmations: u32) -> Utxo {
        self.add_utxo(value, confirmations, true)
    }

    /// An address whose key the wallet does not hold.
    pub fn foreign_address(network: Network) -> Address {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[0xAB; 32]).unwrap();
        let pubkey = CompressedPublicKey::from_private_key(&secp, &PrivateKey::new(secret, network))
            .unwrap();
        Address::p2wpkh(&pubkey, network)
    }
}

#[async_trait]
impl WalletBackend for TestWallet {
    async fn list_unspent(&self, min_confirmations: u32) -> eyre::Result<Vec<Utxo>> {
        Ok(self
            .utxos
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.confirmations >= min_confirmations)
            .cloned()
            .collect())
    }

    async fn balance(&self, min_confirmations: u32) -> eyre::Result<Amount> {
        Ok(self
            .list_unspent(min_confirmations)
            .await?
            .iter()
            .map(|u| u.value)
            .sum())
    }

    async fn derive_address(&self, _kind: AddressKind) -> eyre::Result<Address> {
        Ok(self.new_address(false))
    }

    async fn private_key(&self, address: &Address) -> eyre::Result<PrivateKey> {
        let script = address.script_pubkey();
        self.keys
            .lock()
            .unwrap()
            .iter()
            .find(|(s, _)| *s == script)
            .map(|(_, key)| *key)
            .ok_or_else(|| eyre::eyre!("no key for {}", address))
    }
}
