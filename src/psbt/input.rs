use std::collections::BTreeMap;
use std::convert::TryFrom;

use crate::bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, KeySource, Xpub};
use crate::bitcoin::psbt::Input;
use crate::bitcoin::secp256k1::{self, PublicKey};
use crate::bitcoin::{
    Amount, CompressedPublicKey, OutPoint, Psbt, ScriptBuf, TapLeafHash, XOnlyPublicKey,
};
use crate::networks::{self, Network};
use crate::psbt::musig2_input::Musig2Input;
use crate::wallet::{Chain, OutputScriptType, ReplayProtection, RootWalletKeys, WalletScripts};

pub type Bip32DerivationMap = BTreeMap<PublicKey, KeySource>;

pub type TapKeyOrigins = BTreeMap<XOnlyPublicKey, (Vec<TapLeafHash>, KeySource)>;

fn has_fingerprint(wallet_keys: &RootWalletKeys, fingerprint: Fingerprint) -> bool {
    wallet_keys
        .xpubs
        .iter()
        .any(|xpub| xpub.fingerprint() == fingerprint)
}

fn find_xpub_by_fingerprint(
    wallet_keys: &RootWalletKeys,
    fingerprint: Fingerprint,
) -> Option<&Xpub> {
    wallet_keys
        .xpubs
        .iter()
        .find(|xpub| xpub.fingerprint() == fingerprint)
}

/// Check if BIP32 derivation info belongs to the wallet keys (non-failing).
/// Returns false if any fingerprint references another wallet.
pub fn is_bip32_derivation_for_wallet(
    wallet_keys: &RootWalletKeys,
    derivation_map: &Bip32DerivationMap,
) -> bool {
    derivation_map
        .iter()
        .all(|(_, (fingerprint, _))| has_fingerprint(wallet_keys, *fingerprint))
}

/// Check if tap key origins belong to the wallet keys (non-failing).
pub fn is_tap_key_origins_for_wallet(
    wallet_keys: &RootWalletKeys,
    tap_key_origins: &TapKeyOrigins,
) -> bool {
    tap_key_origins
        .iter()
        .all(|(_, (_, (fingerprint, _)))| has_fingerprint(wallet_keys, *fingerprint))
}

fn derive_pubkey<C: secp256k1::Verification>(
    secp: &secp256k1::Secp256k1<C>,
    xpub: &Xpub,
    derivation_path: &DerivationPath,
) -> Result<PublicKey, String> {
    xpub.derive_pub(secp, derivation_path)
        .map(|derived| derived.public_key)
        .map_err(|e| format!("Failed to derive public key: {}", e))
}

fn find_bip32_derivation_path(
    bip32_derivation: &Bip32DerivationMap,
    fingerprint: Fingerprint,
) -> Option<&DerivationPath> {
    bip32_derivation
        .values()
        .find(|(fp, _)| *fp == fingerprint)
        .map(|(_, path)| path)
}

fn find_tap_key_origins_path(
    tap_key_origins: &TapKeyOrigins,
    fingerprint: Fingerprint,
) -> Option<&DerivationPath> {
    tap_key_origins
        .values()
        .find(|(_, (fp, _))| *fp == fingerprint)
        .map(|(_, (_, path))| path)
}

/// Derive the public key an xpub contributes to a PSBT input, following the
/// derivation path recorded for the xpub's fingerprint. Works for both
/// legacy/SegWit inputs (bip32_derivation) and taproot inputs
/// (tap_key_origins).
///
/// Returns `Ok(None)` when the input carries no derivation entry for this
/// xpub; that is how an unrelated key (e.g. another wallet's) is detected.
pub fn derive_pubkey_from_input<C: secp256k1::Verification>(
    secp: &secp256k1::Secp256k1<C>,
    xpub: &Xpub,
    input: &Input,
) -> Result<Option<PublicKey>, String> {
    let xpub_fingerprint = xpub.fingerprint();

    if !input.bip32_derivation.is_empty() {
        return match find_bip32_derivation_path(&input.bip32_derivation, xpub_fingerprint) {
            Some(path) => derive_pubkey(secp, xpub, path).map(Some),
            None => Ok(None),
        };
    }

    if !input.tap_key_origins.is_empty() {
        return match find_tap_key_origins_path(&input.tap_key_origins, xpub_fingerprint) {
            Some(path) => derive_pubkey(secp, xpub, path).map(Some),
            None => Ok(None),
        };
    }

    Ok(None)
}

/// Verify a taproot script path signature for a public key on a PSBT input.
pub fn verify_taproot_script_signature<C: secp256k1::Verification>(
    secp: &secp256k1::Secp256k1<C>,
    psbt: &Psbt,
    input_index: usize,
    public_key: CompressedPublicKey,
) -> Result<bool, String> {
    use crate::bitcoin::hashes::Hash;
    use crate::bitcoin::sighash::{Prevouts, SighashCache};
    use crate::bitcoin::taproot::TapLeafHash;

    let input = &psbt.inputs[input_index];

    if input.tap_script_sigs.is_empty() {
        return Ok(false);
    }

    let x_only_key = XOnlyPublicKey::from_slice(&public_key.to_bytes()[1..])
        .map_err(|e| format!("Failed to convert to x-only public key: {}", e))?;

    let mut cache = SighashCache::new(&psbt.unsigned_tx);

    for ((sig_pubkey, leaf_hash), signature) in &input.tap_script_sigs {
        if sig_pubkey != &x_only_key {
            continue;
        }

        let prevouts = crate::psbt::musig2_input::collect_prevouts(psbt)
            .map_err(|e| format!("Failed to collect prevouts: {}", e))?;

        // the leaf hash must correspond to one of the input's tap scripts
        let found_script = input.tap_scripts.values().any(|(script, leaf_version)| {
            TapLeafHash::from_script(script, *leaf_version) == *leaf_hash
        });
        if !found_script {
            return Err("Tap script not found for leaf hash".to_string());
        }

        let sighash = cache
            .taproot_script_spend_signature_hash(
                input_index,
                &Prevouts::All(&prevouts),
                *leaf_hash,
                signature.sighash_type,
            )
            .map_err(|e| format!("Failed to compute taproot sighash: {}", e))?;

        let message = secp256k1::Message::from_digest(sighash.to_byte_array());
        match secp.verify_schnorr(&signature.signature, &message, sig_pubkey) {
            Ok(()) => return Ok(true),
            Err(_) => continue,
        }
    }

    Ok(false)
}

/// Verify an ECDSA partial signature for a public key on a PSBT input
/// (legacy and SegWit v0 script types).
pub fn verify_ecdsa_signature<C: secp256k1::Verification>(
    secp: &secp256k1::Secp256k1<C>,
    psbt: &Psbt,
    input_index: usize,
    public_key: CompressedPublicKey,
) -> Result<bool, String> {
    use crate::bitcoin::sighash::SighashCache;
    use crate::bitcoin::PublicKey;

    let input = &psbt.inputs[input_index];

    let public_key_inner = PublicKey::from_slice(&public_key.to_bytes())
        .map_err(|e| format!("Failed to convert public key: {}", e))?;

    if let Some(signature) = input.partial_sigs.get(&public_key_inner) {
        let mut cache = SighashCache::new(&psbt.unsigned_tx);
        let sighash_msg = compute_ecdsa_sighash(psbt, input_index, &mut cache)?;

        match secp.verify_ecdsa(&sighash_msg, &signature.signature, &public_key_inner.inner) {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    } else {
        Ok(false)
    }
}

/// Compute the ECDSA sighash for an input, matching the sighash the signer
/// produces: legacy sighash over the redeem script when no witness script is
/// present, segwit v0 sighash otherwise.
pub fn compute_ecdsa_sighash<T: std::borrow::Borrow<crate::bitcoin::Transaction>>(
    psbt: &Psbt,
    input_index: usize,
    cache: &mut crate::bitcoin::sighash::SighashCache<T>,
) -> Result<secp256k1::Message, String> {
    use crate::bitcoin::hashes::Hash;
    use crate::bitcoin::EcdsaSighashType;

    let input = &psbt.inputs[input_index];
    let prevout = psbt.unsigned_tx.input[input_index].previous_output;
    let (script, value) = get_output_script_and_value(input, prevout)
        .map_err(|e| format!("Failed to get output script: {}", e))?;

    let sighash_type = input
        .sighash_type
        .and_then(|t| t.ecdsa_hash_ty().ok())
        .unwrap_or(EcdsaSighashType::All);

    if let Some(witness_script) = &input.witness_script {
        let sighash = cache
            .p2wsh_signature_hash(input_index, witness_script, value, sighash_type)
            .map_err(|e| format!("Failed to compute segwit sighash: {}", e))?;
        Ok(secp256k1::Message::from_digest(sighash.to_byte_array()))
    } else {
        let script_code = input.redeem_script.as_ref().unwrap_or(script);
        let sighash = cache
            .legacy_signature_hash(input_index, script_code, sighash_type.to_u32())
            .map_err(|e| format!("Failed to compute legacy sighash: {}", e))?;
        Ok(secp256k1::Message::from_digest(sighash.to_byte_array()))
    }
}

struct WalletDerivationPath {
    chain: u32,
    index: u32,
}

fn parse_derivation_path(path: &DerivationPath) -> Result<WalletDerivationPath, String> {
    let length = path.len();
    if length < 2 {
        return Err("Invalid path".to_string());
    }
    let chain = path[length - 2];
    let index = path[length - 1];

    let chain = match chain {
        ChildNumber::Normal { index } => index,
        _ => return Err("Invalid chain number".to_string()),
    };
    let index = match index {
        ChildNumber::Normal { index } => index,
        _ => return Err("Invalid index".to_string()),
    };

    Ok(WalletDerivationPath { chain, index })
}

/// Extract derivation paths from either BIP32 derivation or tap key origins.
pub fn get_derivation_paths(input: &Input) -> Vec<&DerivationPath> {
    if !input.bip32_derivation.is_empty() {
        input
            .bip32_derivation
            .values()
            .map(|(_, path)| path)
            .collect()
    } else {
        input
            .tap_key_origins
            .values()
            .map(|(_, (_, path))| path)
            .collect()
    }
}

/// Extract derivation paths from PSBT output metadata.
pub fn get_output_derivation_paths(output: &crate::bitcoin::psbt::Output) -> Vec<&DerivationPath> {
    if !output.bip32_derivation.is_empty() {
        output
            .bip32_derivation
            .values()
            .map(|(_, path)| path)
            .collect()
    } else {
        output
            .tap_key_origins
            .values()
            .map(|(_, (_, path))| path)
            .collect()
    }
}

/// All paths must agree on their trailing chain/index pair.
pub fn parse_shared_derivation_path(key_origins: &[&DerivationPath]) -> Result<(u32, u32), String> {
    let paths = key_origins
        .iter()
        .map(|path| parse_derivation_path(path))
        .collect::<Result<Vec<_>, String>>()?;
    let first = paths.first().ok_or_else(|| "Invalid input".to_string())?;
    let (chain, index) = (first.chain, first.index);
    for path in &paths {
        if path.chain != chain || path.index != index {
            return Err("Derivation paths disagree on chain/index".to_string());
        }
    }
    Ok((chain, index))
}

pub fn parse_shared_chain_and_index(input: &Input) -> Result<(u32, u32), String> {
    if input.bip32_derivation.is_empty() && input.tap_key_origins.is_empty() {
        return Err(
            "Invalid input: both bip32_derivation and tap_key_origins are empty".to_string(),
        );
    }
    parse_shared_derivation_path(&get_derivation_paths(input))
}

fn assert_bip32_derivation_map(
    wallet_keys: &RootWalletKeys,
    derivation_map: &Bip32DerivationMap,
) -> Result<(), String> {
    for (key, (fingerprint, path)) in derivation_map {
        let xpub = find_xpub_by_fingerprint(wallet_keys, *fingerprint)
            .ok_or_else(|| format!("No xpub found with fingerprint {}", fingerprint))?;
        let derived = xpub
            .derive_pub(&secp256k1::Secp256k1::new(), path)
            .map_err(|e| format!("Failed to derive pubkey: {}", e))?;
        if derived.public_key != *key {
            return Err(format!(
                "Derived pubkey {} does not match derivation map {}",
                derived.public_key, key
            ));
        }
    }
    Ok(())
}

fn assert_tap_key_origins(
    wallet_keys: &RootWalletKeys,
    tap_key_origins: &TapKeyOrigins,
) -> Result<(), String> {
    for (key, (_, (fingerprint, path))) in tap_key_origins {
        let xpub = find_xpub_by_fingerprint(wallet_keys, *fingerprint)
            .ok_or_else(|| format!("No xpub found with fingerprint {}", fingerprint))?;
        let derived = xpub
            .derive_pub(&secp256k1::Secp256k1::new(), path)
            .map_err(|e| format!("Failed to derive pubkey: {}", e))?
            .to_x_only_pub();
        if derived != *key {
            return Err(format!(
                "Derived pubkey {} does not match derivation map {}",
                derived, key
            ));
        }
    }
    Ok(())
}

fn assert_wallet_output_script(
    wallet_keys: &RootWalletKeys,
    chain: Chain,
    index: u32,
    script_pub_key: &ScriptBuf,
) -> Result<(), String> {
    let derived_scripts =
        WalletScripts::from_wallet_keys(wallet_keys, chain, index).map_err(|e| e.to_string())?;
    if derived_scripts.output_script() != *script_pub_key {
        return Err(format!(
            "Script mismatch: derived {:?} != actual {:?}",
            derived_scripts.output_script(),
            script_pub_key
        ));
    }
    Ok(())
}

/// Assert that an input's derivation data and spent script belong to the
/// wallet.
pub fn assert_wallet_input(
    wallet_keys: &RootWalletKeys,
    input: &Input,
    output_script: &ScriptBuf,
) -> Result<(), String> {
    if input.bip32_derivation.is_empty() {
        assert_tap_key_origins(wallet_keys, &input.tap_key_origins)?;
    } else {
        assert_bip32_derivation_map(wallet_keys, &input.bip32_derivation)?;
    }
    let (chain, index) = parse_shared_chain_and_index(input)?;
    let chain = Chain::try_from(chain).map_err(|e| e.to_string())?;
    assert_wallet_output_script(wallet_keys, chain, index, output_script)?;
    Ok(())
}

#[derive(Debug)]
pub enum OutputScriptError {
    OutputIndexOutOfBounds { vout: u32 },
    NoUtxoFields,
}

impl std::fmt::Display for OutputScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputScriptError::OutputIndexOutOfBounds { vout } => {
                write!(f, "Output index {} out of bounds", vout)
            }
            OutputScriptError::NoUtxoFields => {
                write!(f, "Neither witness_utxo nor non_witness_utxo is set")
            }
        }
    }
}

impl std::error::Error for OutputScriptError {}

/// The script and value of the output an input spends, taken from its
/// witness_utxo or non_witness_utxo.
pub fn get_output_script_and_value(
    input: &Input,
    prevout: OutPoint,
) -> Result<(&ScriptBuf, Amount), OutputScriptError> {
    if let Some(witness_utxo) = &input.witness_utxo {
        return Ok((&witness_utxo.script_pubkey, witness_utxo.value));
    }
    if let Some(non_witness_utxo) = &input.non_witness_utxo {
        let output = non_witness_utxo
            .output
            .get(prevout.vout as usize)
            .ok_or(OutputScriptError::OutputIndexOutOfBounds { vout: prevout.vout })?;
        return Ok((&output.script_pubkey, output.value));
    }
    Err(OutputScriptError::NoUtxoFields)
}

/// Identifies a script by its chain and index in the wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptId {
    pub chain: u32,
    pub index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputScriptType {
    P2shP2pk,
    P2sh,
    P2shP2wsh,
    P2wsh,
    P2trLegacy,
    P2trMusig2ScriptPath,
    P2trMusig2KeyPath,
}

impl std::fmt::Display for InputScriptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InputScriptType::P2shP2pk => "p2shP2pk",
            InputScriptType::P2sh => "p2sh",
            InputScriptType::P2shP2wsh => "p2shP2wsh",
            InputScriptType::P2wsh => "p2wsh",
            InputScriptType::P2trLegacy => "p2tr",
            InputScriptType::P2trMusig2ScriptPath => "p2trMusig2ScriptPath",
            InputScriptType::P2trMusig2KeyPath => "p2trMusig2KeyPath",
        };
        write!(f, "{}", name)
    }
}

impl InputScriptType {
    pub fn from_script_id(script_id: ScriptId, psbt_input: &Input) -> Result<Self, String> {
        let chain = Chain::try_from(script_id.chain).map_err(|e| e.to_string())?;
        match chain.script_type {
            OutputScriptType::P2sh => Ok(InputScriptType::P2sh),
            OutputScriptType::P2shP2wsh => Ok(InputScriptType::P2shP2wsh),
            OutputScriptType::P2wsh => Ok(InputScriptType::P2wsh),
            OutputScriptType::P2trLegacy => Ok(InputScriptType::P2trLegacy),
            OutputScriptType::P2trMusig2 => {
                if !psbt_input.tap_script_sigs.is_empty() || !psbt_input.tap_scripts.is_empty() {
                    Ok(InputScriptType::P2trMusig2ScriptPath)
                } else {
                    Ok(InputScriptType::P2trMusig2KeyPath)
                }
            }
        }
    }

    /// Detect the script type of an input; inputs with no script id must be
    /// replay protection inputs.
    pub fn detect(
        script_id: Option<ScriptId>,
        psbt_input: &Input,
        output_script: &ScriptBuf,
        replay_protection: &ReplayProtection,
    ) -> Result<Self, String> {
        match script_id {
            Some(id) => Self::from_script_id(id, psbt_input),
            None => {
                if replay_protection.is_replay_protection_input(output_script) {
                    Ok(InputScriptType::P2shP2pk)
                } else {
                    Err("Input without script_id is not a replay protection input".to_string())
                }
            }
        }
    }
}

/// Whether an input spends a MuSig2 taproot output via the key path.
pub fn is_key_path_spend_input(input: &Input) -> bool {
    if Musig2Input::is_musig2_input(input) {
        return true;
    }
    // a taproot input with derivation info and no leaf scripts can only be
    // spent via the key path
    input.tap_internal_key.is_some()
        && !input.tap_key_origins.is_empty()
        && input.tap_scripts.is_empty()
        && input.tap_script_sigs.is_empty()
        && matches!(
            parse_shared_chain_and_index(input)
                .ok()
                .and_then(|(chain, _)| Chain::try_from(chain).ok()),
            Some(Chain {
                script_type: OutputScriptType::P2trMusig2,
                ..
            })
        )
}

/// Parsed input of a PSBT transaction.
#[derive(Debug, Clone)]
pub struct ParsedInput {
    pub previous_output: OutPoint,
    pub address: Option<String>,
    pub script: Vec<u8>,
    pub value: u64,
    pub script_id: Option<ScriptId>,
    pub script_type: InputScriptType,
    pub sequence: u32,
}

impl ParsedInput {
    /// Parse and validate a PSBT input against the wallet keys. Inputs that
    /// are not replay protection must carry wallet derivation data and spend
    /// a script derivable from the wallet keys.
    pub fn parse(
        psbt_input: &Input,
        tx_input: &crate::bitcoin::TxIn,
        wallet_keys: &RootWalletKeys,
        replay_protection: &ReplayProtection,
        network: Network,
    ) -> Result<Self, ParseInputError> {
        let (output_script, value) =
            get_output_script_and_value(psbt_input, tx_input.previous_output)
                .map_err(ParseInputError::Utxo)?;

        let is_replay_protection = replay_protection.is_replay_protection_input(output_script);

        let script_id = if is_replay_protection {
            None
        } else {
            let (chain, index) =
                parse_shared_chain_and_index(psbt_input).map_err(ParseInputError::Derivation)?;

            assert_wallet_input(wallet_keys, psbt_input, output_script)
                .map_err(ParseInputError::WalletValidation)?;

            Some(ScriptId { chain, index })
        };

        let address = networks::from_output_script(output_script, network).ok();

        let script_type =
            InputScriptType::detect(script_id, psbt_input, output_script, replay_protection)
                .map_err(ParseInputError::ScriptTypeDetection)?;

        Ok(Self {
            previous_output: tx_input.previous_output,
            address,
            script: output_script.to_bytes(),
            value: value.to_sat(),
            script_id,
            script_type,
            sequence: tx_input.sequence.0,
        })
    }

    pub fn unspent_id(&self) -> String {
        crate::wallet::format_outpoint(&self.previous_output)
    }
}

#[derive(Debug)]
pub enum ParseInputError {
    /// Failed to extract output script or value from input
    Utxo(OutputScriptError),
    /// Input missing or has invalid derivation info (and is not replay protection)
    Derivation(String),
    /// Input failed wallet validation
    WalletValidation(String),
    /// Failed to detect script type for input
    ScriptTypeDetection(String),
}

impl std::fmt::Display for ParseInputError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseInputError::Utxo(error) => write!(f, "{}", error),
            ParseInputError::Derivation(error) => {
                write!(
                    f,
                    "missing or invalid derivation info (not replay protection): {}",
                    error
                )
            }
            ParseInputError::WalletValidation(error) => {
                write!(f, "wallet validation failed: {}", error)
            }
            ParseInputError::ScriptTypeDetection(error) => write!(f, "{}", error),
        }
    }
}

impl std::error::Error for ParseInputError {}
