//! PSBT handling for the fixed-script wallets: decoding the union of legacy
//! transactions and PSBTs, converting legacy prebuilds into PSBT form, and
//! per-input signature verification.

pub mod input;
pub mod musig2_input;
pub mod output;
pub mod propkv;

use std::collections::BTreeMap;

use crate::bitcoin::bip32::Xpub;
use crate::bitcoin::consensus::{Decodable, Encodable};
use crate::bitcoin::psbt::Psbt;
use crate::bitcoin::{secp256k1, CompressedPublicKey, Transaction, Txid};
use crate::error::UtxoSignerError;
use crate::networks::{self, Network};
use crate::wallet::{
    derivation_path, parse_outpoint, to_pub_triple, Chain, ReplayProtection, RootWalletKeys,
    WalletScripts, WalletUnspent,
};

pub use input::{
    is_key_path_spend_input, InputScriptType, ParseInputError, ParsedInput, ScriptId,
};
pub use output::{ParseOutputError, ParsedOutput};

/// Magic prefix of a serialized PSBT ("psbt" + 0xff).
const PSBT_MAGIC: [u8; 5] = [0x70, 0x73, 0x62, 0x74, 0xff];

#[derive(Debug)]
pub enum DecodeError {
    /// Input is not valid hex
    Hex(String),
    /// Standard bitcoin consensus decoding error
    Consensus(String),
    /// PSBT-specific error
    Psbt(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Hex(e) => write!(f, "{}", e),
            DecodeError::Consensus(e) => write!(f, "{}", e),
            DecodeError::Psbt(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for DecodeError {}

/// A raw transaction artifact: either a legacy network-serialized
/// transaction or a PSBT. The variant is decided once, here, and dispatched
/// exhaustively through the rest of the pipeline.
#[derive(Debug, Clone)]
pub enum WalletTransaction {
    Legacy(Transaction),
    Psbt(Psbt),
}

impl WalletTransaction {
    pub fn is_psbt_bytes(bytes: &[u8]) -> bool {
        bytes.len() >= PSBT_MAGIC.len() && bytes[..PSBT_MAGIC.len()] == PSBT_MAGIC
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if Self::is_psbt_bytes(bytes) {
            let psbt = Psbt::deserialize(bytes).map_err(|e| DecodeError::Psbt(e.to_string()))?;
            Ok(WalletTransaction::Psbt(psbt))
        } else {
            let tx = Transaction::consensus_decode(&mut &bytes[..])
                .map_err(|e| DecodeError::Consensus(e.to_string()))?;
            Ok(WalletTransaction::Legacy(tx))
        }
    }

    /// Decode from hex, falling back to base64 for PSBTs.
    pub fn from_hex(tx_hex: &str) -> Result<Self, DecodeError> {
        match hex::decode(tx_hex) {
            Ok(bytes) => Self::from_bytes(&bytes),
            Err(e) => {
                use base64::engine::{general_purpose::STANDARD as BASE64_STANDARD, Engine};
                let bytes = BASE64_STANDARD
                    .decode(tx_hex)
                    .map_err(|_| DecodeError::Hex(format!("invalid transaction hex: {}", e)))?;
                Self::from_bytes(&bytes)
            }
        }
    }

    pub fn to_hex(&self) -> String {
        match self {
            WalletTransaction::Legacy(tx) => {
                let mut bytes = Vec::new();
                tx.consensus_encode(&mut bytes).expect("vec write");
                hex::encode(bytes)
            }
            WalletTransaction::Psbt(psbt) => hex::encode(psbt.serialize()),
        }
    }

    pub fn is_psbt(&self) -> bool {
        matches!(self, WalletTransaction::Psbt(_))
    }
}

/// The transaction id of the unsigned transaction, before any signature or
/// nonce is applied. Keys the signing session cache.
pub fn unsigned_txid(psbt: &Psbt) -> Txid {
    psbt.unsigned_tx.compute_txid()
}

/// Convert a legacy prebuild (network-serialized unsigned transaction plus
/// its wallet unspents) into PSBT form so the signing and verification
/// machinery only has one representation to deal with.
///
/// `prev_txs` maps txid to the full previous transaction; legacy (non-segwit)
/// inputs signed without one need the caller to opt in at signing time.
pub fn from_legacy_transaction(
    tx: Transaction,
    unspents: &[WalletUnspent],
    wallet_keys: &RootWalletKeys,
    replay_protection: &ReplayProtection,
    prev_txs: &BTreeMap<Txid, Transaction>,
    network: Network,
) -> Result<Psbt, UtxoSignerError> {
    use crate::bitcoin::bip32::KeySource;
    use crate::bitcoin::{Amount, TxOut};

    if tx.input.len() != unspents.len() {
        return Err(UtxoSignerError::new(
            "length of unspents array should equal to the number of transaction inputs",
        ));
    }

    let input_count = tx.input.len();
    let tx_inputs: Vec<_> = tx.input.clone();
    let mut psbt = Psbt::from_unsigned_tx(tx)
        .map_err(|e| UtxoSignerError::new(&format!("could not convert to psbt: {}", e)))?;

    for i in 0..input_count {
        let unspent = &unspents[i];
        let outpoint = parse_outpoint(&unspent.id)?;
        if outpoint != tx_inputs[i].previous_output {
            return Err(UtxoSignerError::new(&format!(
                "unspent {} does not match transaction input {}",
                unspent.id, i
            )));
        }

        if replay_protection.is_replay_protection_unspent(&unspent.as_unspent(), network) {
            let script = networks::to_output_script(&unspent.address, network)?;
            psbt.inputs[i].witness_utxo = Some(TxOut {
                value: Amount::from_sat(unspent.value),
                script_pubkey: script,
            });
            if let Some(prev_tx) = prev_txs.get(&outpoint.txid) {
                psbt.inputs[i].non_witness_utxo = Some(prev_tx.clone());
            }
            continue;
        }

        let chain = Chain::try_from(unspent.chain)?;
        let derived = wallet_keys.derive_for_chain_and_index(unspent.chain, unspent.index)?;
        let pub_triple = to_pub_triple(&derived);
        let scripts = WalletScripts::new(&pub_triple, chain)?;
        let output_script = scripts.output_script();

        psbt.inputs[i].witness_utxo = Some(TxOut {
            value: Amount::from_sat(unspent.value),
            script_pubkey: output_script,
        });
        if let Some(prev_tx) = prev_txs.get(&outpoint.txid) {
            psbt.inputs[i].non_witness_utxo = Some(prev_tx.clone());
        }

        let bip32_derivation: BTreeMap<secp256k1::PublicKey, KeySource> = pub_triple
            .iter()
            .zip(wallet_keys.xpubs.iter())
            .zip(wallet_keys.derivation_prefixes.iter())
            .map(|((pubkey, xpub), prefix)| {
                let path = derivation_path(prefix, unspent.chain, unspent.index);
                (pubkey.0, (xpub.fingerprint(), path))
            })
            .collect();

        match &scripts {
            WalletScripts::P2sh(s) => {
                psbt.inputs[i].redeem_script = Some(s.redeem_script.clone());
                psbt.inputs[i].bip32_derivation = bip32_derivation;
            }
            WalletScripts::P2shP2wsh(s) => {
                psbt.inputs[i].redeem_script = Some(s.redeem_script.clone());
                psbt.inputs[i].witness_script = Some(s.witness_script.clone());
                psbt.inputs[i].bip32_derivation = bip32_derivation;
            }
            WalletScripts::P2wsh(s) => {
                psbt.inputs[i].witness_script = Some(s.witness_script.clone());
                psbt.inputs[i].bip32_derivation = bip32_derivation;
            }
            WalletScripts::P2trLegacy(s) | WalletScripts::P2trMusig2(s) => {
                let is_musig2 = matches!(&scripts, WalletScripts::P2trMusig2(_));
                psbt.inputs[i].tap_internal_key = Some(s.internal_key());
                psbt.inputs[i].tap_merkle_root = s.spend_info.merkle_root();
                psbt.inputs[i].tap_key_origins = crate::wallet::create_tap_key_origins(
                    wallet_keys,
                    unspent.chain,
                    unspent.index,
                    &pub_triple,
                    is_musig2,
                )?;
                // legacy-format prebuilds only ever spend taproot via the
                // script path, so attach the leaf scripts
                for (script_ver, _) in s.spend_info.script_map() {
                    if let Some(control_block) = s.spend_info.control_block(script_ver) {
                        psbt.inputs[i]
                            .tap_scripts
                            .insert(control_block, script_ver.clone());
                    }
                }
            }
        }
    }

    Ok(psbt)
}

/// Verify whether a valid signature by (a derivation of) the given xpub
/// exists at the input. Handles ECDSA partial signatures, taproot script
/// path signatures, and MuSig2 partial signature presence.
pub fn verify_signature_with_xpub<C: secp256k1::Verification>(
    secp: &secp256k1::Secp256k1<C>,
    psbt: &Psbt,
    input_index: usize,
    xpub: &Xpub,
) -> Result<bool, String> {
    use musig2_input::Musig2Input;

    if input_index >= psbt.inputs.len() {
        return Err(format!("Input index {} out of bounds", input_index));
    }

    let psbt_input = &psbt.inputs[input_index];

    // MuSig2 inputs keep partial signatures in proprietary fields
    if Musig2Input::is_musig2_input(psbt_input) {
        let musig2_input = Musig2Input::from_input(psbt_input)
            .map_err(|e| format!("Failed to parse MuSig2 input: {}", e))?;

        let derived = match input::derive_pubkey_from_input(secp, xpub, psbt_input) {
            Ok(Some(pubkey)) => pubkey,
            // this xpub does not participate (e.g. backup key)
            Ok(None) | Err(_) => return Ok(false),
        };
        let derived = CompressedPublicKey(derived);

        let has_partial_sig = musig2_input
            .partial_sigs
            .iter()
            .any(|sig| sig.participant_pub_key == derived);
        return Ok(has_partial_sig);
    }

    let derived = match input::derive_pubkey_from_input(secp, xpub, psbt_input)? {
        Some(pubkey) => pubkey,
        None => return Ok(false),
    };
    let public_key = CompressedPublicKey::from_slice(&derived.serialize())
        .map_err(|e| format!("Failed to convert derived key: {}", e))?;

    if !psbt_input.tap_script_sigs.is_empty() {
        return input::verify_taproot_script_signature(secp, psbt, input_index, public_key);
    }
    input::verify_ecdsa_signature(secp, psbt, input_index, public_key)
}

/// Count the wallet-key signatures present and valid on an input.
pub fn signature_count<C: secp256k1::Verification>(
    secp: &secp256k1::Secp256k1<C>,
    psbt: &Psbt,
    input_index: usize,
    wallet_keys: &RootWalletKeys,
) -> Result<usize, String> {
    let mut count = 0;
    for xpub in &wallet_keys.xpubs {
        if verify_signature_with_xpub(secp, psbt, input_index, xpub)? {
            count += 1;
        }
    }
    Ok(count)
}

fn extract_pubkey_from_p2pk_redeem_script(
    redeem_script: &crate::bitcoin::ScriptBuf,
) -> Result<crate::bitcoin::PublicKey, String> {
    use crate::bitcoin::{opcodes::all::OP_CHECKSIG, script::Instruction, PublicKey};

    let mut instructions = redeem_script.instructions();
    let public_key_bytes = match instructions.next() {
        Some(Ok(Instruction::PushBytes(bytes))) => bytes.as_bytes(),
        _ => return Err("Invalid redeem script format: missing public key".to_string()),
    };

    match instructions.next() {
        Some(Ok(Instruction::Op(op))) if op == OP_CHECKSIG => {}
        _ => return Err("Redeem script does not end with OP_CHECKSIG".to_string()),
    }

    PublicKey::from_slice(public_key_bytes).map_err(|e| format!("Invalid public key: {}", e))
}

fn parse_signature_from_script_sig(
    final_script_sig: &crate::bitcoin::ScriptBuf,
) -> Result<crate::bitcoin::ecdsa::Signature, String> {
    use crate::bitcoin::{ecdsa::Signature, script::Instruction};

    let mut instructions = final_script_sig.instructions();
    let signature_bytes = match instructions.next() {
        Some(Ok(Instruction::PushBytes(bytes))) => bytes.as_bytes(),
        _ => return Err("Invalid final_script_sig format".to_string()),
    };

    if signature_bytes.is_empty() {
        return Err("Empty signature in final_script_sig".to_string());
    }

    Signature::from_slice(signature_bytes)
        .map_err(|e| format!("Invalid signature in final_script_sig: {}", e))
}

/// Verify the platform's signature on a replay protection input.
///
/// These inputs are single-key `sh(pk(..))` scripts with no wallet derivation
/// data, so the public key comes from the redeem script and the sighash is
/// the legacy P2SH form.
pub fn verify_replay_protection_signature<C: secp256k1::Verification>(
    secp: &secp256k1::Secp256k1<C>,
    psbt: &Psbt,
    input_index: usize,
    replay_protection: &ReplayProtection,
) -> Result<bool, String> {
    use crate::bitcoin::hashes::Hash;
    use crate::bitcoin::sighash::SighashCache;

    if input_index >= psbt.inputs.len() {
        return Err(format!("Input index {} out of bounds", input_index));
    }

    let psbt_input = &psbt.inputs[input_index];
    let prevout = psbt.unsigned_tx.input[input_index].previous_output;

    let (output_script, _value) = input::get_output_script_and_value(psbt_input, prevout)
        .map_err(|e| format!("Failed to get output script: {}", e))?;

    if !replay_protection.is_replay_protection_input(output_script) {
        return Err(format!(
            "Input {} is not a replay protection input",
            input_index
        ));
    }

    let redeem_script = psbt_input
        .redeem_script
        .as_ref()
        .ok_or_else(|| "Missing redeem_script for replay protection input".to_string())?;
    let public_key = extract_pubkey_from_p2pk_redeem_script(redeem_script)?;

    let ecdsa_sig = if let Some(&partial_sig) = psbt_input.partial_sigs.get(&public_key) {
        partial_sig
    } else if let Some(final_script_sig) = &psbt_input.final_script_sig {
        parse_signature_from_script_sig(final_script_sig)?
    } else {
        return Ok(false);
    };

    let cache = SighashCache::new(&psbt.unsigned_tx);
    let sighash = cache
        .legacy_signature_hash(input_index, redeem_script, ecdsa_sig.sighash_type.to_u32())
        .map_err(|e| format!("Failed to compute sighash: {}", e))?;

    let message = secp256k1::Message::from_digest(sighash.to_byte_array());
    match secp.verify_ecdsa(&message, &ecdsa_sig.signature, &public_key.inner) {
        Ok(()) => Ok(true),
        Err(_) => Ok(false),
    }
}
