//! Script classification, weight estimation, signing and in-process
//! verification shared by the payment builder and the replacement builder.

use bitcoin::blockdata::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{self, Message, Secp256k1, Signing, Verification};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
    Address, Amount, CompressedPublicKey, FeeRate, Network, PrivateKey, PublicKey, Script,
    ScriptBuf, Transaction, TxOut, Witness,
};

use crate::error::{EngineError, Stage};
use crate::wallet::WalletBackend;

/// Input weights assume a 72 byte DER signature and a compressed key.
const P2PKH_INPUT_WEIGHT: u64 = 592;
const P2WPKH_INPUT_WEIGHT: u64 = 272;
const P2SH_P2WPKH_INPUT_WEIGHT: u64 = 364;

/// The output types this engine can spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    P2pkh,
    P2wpkh,
    P2shP2wpkh,
}

impl ScriptKind {
    /// P2SH outputs are assumed to wrap a P2WPKH program; signing checks the
    /// redeem script actually matches before producing a signature.
    pub fn classify(script_pubkey: &Script) -> Option<ScriptKind> {
        if script_pubkey.is_p2wpkh() {
            Some(ScriptKind::P2wpkh)
        } else if script_pubkey.is_p2pkh() {
            Some(ScriptKind::P2pkh)
        } else if script_pubkey.is_p2sh() {
            Some(ScriptKind::P2shP2wpkh)
        } else {
            None
        }
    }

    pub fn has_witness(&self) -> bool {
        !matches!(self, ScriptKind::P2pkh)
    }

    pub fn input_weight(&self) -> u64 {
        match self {
            ScriptKind::P2pkh => P2PKH_INPUT_WEIGHT,
            ScriptKind::P2wpkh => P2WPKH_INPUT_WEIGHT,
            ScriptKind::P2shP2wpkh => P2SH_P2WPKH_INPUT_WEIGHT,
        }
    }
}

/// Short label for a script this engine refuses to spend.
pub fn describe_script(script_pubkey: &Script) -> String {
    if script_pubkey.is_p2tr() {
        "p2tr".to_string()
    } else if script_pubkey.is_p2wsh() {
        "p2wsh".to_string()
    } else {
        script_pubkey.to_asm_string()
    }
}

fn varint_len(n: usize) -> u64 {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x10000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Upper bound on the weight of a signed transaction with these inputs and outputs.
pub fn estimate_weight(inputs: &[ScriptKind], outputs: &[TxOut]) -> u64 {
    let segwit = inputs.iter().any(ScriptKind::has_witness);

    let mut weight = 4 * (4 + 4 + varint_len(inputs.len()) + varint_len(outputs.len()));
    if segwit {
        // marker + flag
        weight += 2;
    }
    for kind in inputs {
        weight += kind.input_weight();
        if segwit && !kind.has_witness() {
            // empty witness stack count
            weight += 1;
        }
    }
    for output in outputs {
        let len = output.script_pubkey.len();
        weight += 4 * (8 + varint_len(len) + len as u64);
    }
    weight
}

pub fn vsize(weight: u64) -> u64 {
    weight.div_ceil(4)
}

/// Capped at the total supply; no fee above it can be funded anyway.
pub fn fee_for_vsize(rate: FeeRate, vsize: u64) -> Amount {
    Amount::from_sat(rate.to_sat_per_vb_ceil().saturating_mul(vsize)).min(Amount::MAX_MONEY)
}

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("expected {expected} signing inputs, got {got}")]
    InputCount { expected: usize, got: usize },

    #[error("input {input} spends an unsupported script {script}")]
    Unsupported { input: usize, script: String },

    #[error("input {input}: key does not control the previous output")]
    KeyMismatch { input: usize },

    #[error("input {input}: {reason}")]
    Sighash { input: usize, reason: String },

    #[error("input {input}: {reason}")]
    Invalid { input: usize, reason: String },
}

impl From<SignError> for EngineError {
    fn from(err: SignError) -> Self {
        match err {
            SignError::Unsupported { input, script } => {
                EngineError::UnsupportedScript { input, script }
            }
            SignError::Invalid { input, reason } | SignError::Sighash { input, reason } => {
                EngineError::SignatureInvalid { input, reason }
            }
            SignError::KeyMismatch { input } => EngineError::SignatureInvalid {
                input,
                reason: "key does not control the previous output".to_string(),
            },
            SignError::InputCount { .. } => EngineError::wallet(Stage::Sign, err),
        }
    }
}

/// Everything needed to sign one input.
#[derive(Debug, Clone)]
pub struct SigningInput {
    pub prevout: TxOut,
    pub kind: ScriptKind,
    pub key: PrivateKey,
}

/// Looks up the private key for each previous output through the wallet library.
pub async fn collect_signing_inputs(
    wallet: &dyn WalletBackend,
    prevouts: &[TxOut],
    network: Network,
) -> Result<Vec<SigningInput>, EngineError> {
    let mut inputs = Vec::with_capacity(prevouts.len());
    for (index, prevout) in prevouts.iter().enumerate() {
        let kind = ScriptKind::classify(&prevout.script_pubkey).ok_or_else(|| {
            EngineError::UnsupportedScript {
                input: index,
                script: describe_script(&prevout.script_pubkey),
            }
        })?;
        let address = Address::from_script(&prevout.script_pubkey, network)
            .map_err(|e| EngineError::wallet(Stage::Sign, e))?;
        let key = wallet
            .private_key(&address)
            .await
            .map_err(|e| EngineError::wallet(Stage::Sign, e))?;
        inputs.push(SigningInput {
            prevout: prevout.clone(),
            kind,
            key,
        });
    }
    Ok(inputs)
}

fn push_bytes(input: usize, bytes: Vec<u8>) -> Result<PushBytesBuf, SignError> {
    PushBytesBuf::try_from(bytes).map_err(|e| SignError::Invalid {
        input,
        reason: e.to_string(),
    })
}

fn sign_digest<C: Signing>(secp: &Secp256k1<C>, digest: [u8; 32], key: &PrivateKey) -> ecdsa::Signature {
    let msg = Message::from_digest(digest);
    ecdsa::Signature::sighash_all(secp.sign_ecdsa(&msg, &key.inner))
}

fn satisfy<C: Signing>(
    secp: &Secp256k1<C>,
    cache: &mut SighashCache<&Transaction>,
    index: usize,
    input: &SigningInput,
) -> Result<(ScriptBuf, Witness), SignError> {
    let spk = &input.prevout.script_pubkey;
    let sighash_err = |e: &dyn std::fmt::Display| SignError::Sighash {
        input: index,
        reason: e.to_string(),
    };

    match input.kind {
        ScriptKind::P2pkh => {
            let pubkey = input.key.public_key(secp);
            if ScriptBuf::new_p2pkh(&pubkey.pubkey_hash()) != *spk {
                return Err(SignError::KeyMismatch { input: index });
            }
            let sighash = cache
                .legacy_signature_hash(index, spk, EcdsaSighashType::All.to_u32())
                .map_err(|e| sighash_err(&e))?;
            let sig = sign_digest(secp, sighash.to_byte_array(), &input.key);
            let script_sig = Builder::new()
                .push_slice(push_bytes(index, sig.to_vec())?)
                .push_key(&pubkey)
                .into_script();
            Ok((script_sig, Witness::new()))
        }
        ScriptKind::P2wpkh | ScriptKind::P2shP2wpkh => {
            let pubkey = CompressedPublicKey::from_private_key(secp, &input.key)
                .map_err(|_| SignError::KeyMismatch { input: index })?;
            let program = ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash());

            let script_sig = if input.kind == ScriptKind::P2shP2wpkh {
                if program.to_p2sh() != *spk {
                    return Err(SignError::Unsupported {
                        input: index,
                        script: "p2sh with a non p2wpkh redeem script".to_string(),
                    });
                }
                Builder::new()
                    .push_slice(push_bytes(index, program.to_bytes())?)
                    .into_script()
            } else {
                if program != *spk {
                    return Err(SignError::KeyMismatch { input: index });
                }
                ScriptBuf::new()
            };

            let sighash = cache
                .p2wpkh_signature_hash(index, &program, input.prevout.value, EcdsaSighashType::All)
                .map_err(|e| sighash_err(&e))?;
            let sig = sign_digest(secp, sighash.to_byte_array(), &input.key);
            Ok((script_sig, Witness::p2wpkh(&sig, &pubkey.0)))
        }
    }
}

/// Signs every input of `tx` in place, `inputs[i]` describing `tx.input[i]`.
pub fn sign_transaction(tx: &mut Transaction, inputs: &[SigningInput]) -> Result<(), SignError> {
    if inputs.len() != tx.input.len() {
        return Err(SignError::InputCount {
            expected: tx.input.len(),
            got: inputs.len(),
        });
    }

    let secp = Secp256k1::signing_only();
    let satisfactions = {
        let unsigned: &Transaction = tx;
        let mut cache = SighashCache::new(unsigned);
        inputs
            .iter()
            .enumerate()
            .map(|(index, input)| satisfy(&secp, &mut cache, index, input))
            .collect::<Result<Vec<_>, _>>()?
    };

    for (txin, (script_sig, witness)) in tx.input.iter_mut().zip(satisfactions) {
        txin.script_sig = script_sig;
        txin.witness = witness;
    }
    Ok(())
}

fn script_pushes(script: &Script, input: usize) -> Result<Vec<&[u8]>, SignError> {
    script
        .instructions()
        .map(|instruction| match instruction {
            Ok(Instruction::PushBytes(bytes)) => Ok(bytes.as_bytes()),
            Ok(Instruction::Op(op)) => Err(SignError::Invalid {
                input,
                reason: format!("unexpected opcode {op} in script_sig"),
            }),
            Err(e) => Err(SignError::Invalid {
                input,
                reason: e.to_string(),
            }),
        })
        .collect()
}

fn invalid(input: usize, reason: impl Into<String>) -> SignError {
    SignError::Invalid {
        input,
        reason: reason.into(),
    }
}

fn check_signature<C: Verification>(
    secp: &Secp256k1<C>,
    input: usize,
    digest: [u8; 32],
    sig: &ecdsa::Signature,
    pubkey: &secp256k1::PublicKey,
) -> Result<(), SignError> {
    secp.verify_ecdsa(&Message::from_digest(digest), &sig.signature, pubkey)
        .map_err(|e| invalid(input, e.to_string()))
}

/// Verifies every input of a signed transaction against its previous output's
/// script and value.
pub fn verify_transaction(tx: &Transaction, prevouts: &[TxOut]) -> Result<(), SignError> {
    if prevouts.len() != tx.input.len() {
        return Err(SignError::InputCount {
            expected: tx.input.len(),
            got: prevouts.len(),
        });
    }

    let secp = Secp256k1::verification_only();
    let mut cache = SighashCache::new(tx);

    for (index, (txin, prevout)) in tx.input.iter().zip(prevouts).enumerate() {
        let spk = &prevout.script_pubkey;
        let kind = ScriptKind::classify(spk).ok_or_else(|| SignError::Unsupported {
            input: index,
            script: describe_script(spk),
        })?;

        match kind {
            ScriptKind::P2pkh => {
                let pushes = script_pushes(&txin.script_sig, index)?;
                let [sig, key] = pushes.as_slice() else {
                    return Err(invalid(index, "script_sig must push a signature and a key"));
                };
                let sig = ecdsa::Signature::from_slice(sig).map_err(|e| invalid(index, e.to_string()))?;
                let pubkey = PublicKey::from_slice(key).map_err(|e| invalid(index, e.to_string()))?;
                if ScriptBuf::new_p2pkh(&pubkey.pubkey_hash()) != *spk {
                    return Err(invalid(index, "public key does not hash to the previous output"));
                }
                let sighash = cache
                    .legacy_signature_hash(index, spk, sig.sighash_type.to_u32())
                    .map_err(|e| invalid(index, e.to_string()))?;
                check_signature(&secp, index, sighash.to_byte_array(), &sig, &pubkey.inner)?;
            }
            ScriptKind::P2wpkh | ScriptKind::P2shP2wpkh => {
                let expected_program = if kind == ScriptKind::P2shP2wpkh {
                    let pushes = script_pushes(&txin.script_sig, index)?;
                    let [redeem] = pushes.as_slice() else {
                        return Err(invalid(index, "script_sig must push only the redeem script"));
                    };
                    let redeem = ScriptBuf::from_bytes(redeem.to_vec());
                    if !redeem.is_p2wpkh() || redeem.to_p2sh() != *spk {
                        return Err(invalid(index, "redeem script does not match the previous output"));
                    }
                    redeem
                } else {
                    if !txin.script_sig.is_empty() {
                        return Err(invalid(index, "native witness input carries a script_sig"));
                    }
                    spk.clone()
                };

                let (Some(sig), Some(key), 2) =
                    (txin.witness.nth(0), txin.witness.nth(1), txin.witness.len())
                else {
                    return Err(invalid(index, "witness must hold a signature and a key"));
                };
                let sig = ecdsa::Signature::from_slice(sig).map_err(|e| invalid(index, e.to_string()))?;
                let pubkey =
                    CompressedPublicKey::from_slice(key).map_err(|e| invalid(index, e.to_string()))?;
                let program = ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash());
                if program != expected_program {
                    return Err(invalid(index, "public key does not hash to the witness program"));
                }
                let sighash = cache
                    .p2wpkh_signature_hash(index, &program, prevout.value, sig.sighash_type)
                    .map_err(|e| invalid(index, e.to_string()))?;
                check_signature(&secp, index, sighash.to_byte_array(), &sig, &pubkey.0)?;
            }
        }
    }
    Ok(())
}
