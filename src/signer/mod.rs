//! The signing state machine: direct HD signing for ECDSA and taproot
//! script path inputs, and the 3-step cooperative protocol for MuSig2 key
//! path inputs, backed by the in-process session store.

mod keypath;
mod session;

pub use session::{SessionStore, SigningSession};

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::bitcoin::bip32::{Xpriv, Xpub};
use crate::bitcoin::hashes::Hash;
use crate::bitcoin::psbt::Psbt;
use crate::bitcoin::secp256k1::{self, Secp256k1};
use crate::bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use crate::bitcoin::{EcdsaSighashType, Transaction, Txid};
use crate::error::UtxoSignerError;
use crate::networks::Network;
use crate::prebuild::TransactionPrebuild;
use crate::psbt::musig2_input::{collect_prevouts, Musig2Input};
use crate::psbt::{
    self, input as psbt_input, is_key_path_spend_input, DecodeError, InputScriptType,
    WalletTransaction,
};
use crate::wallet::{format_outpoint, ReplayProtection, RootWalletKeys};

/// Remote co-signer service: attaches the platform's MuSig2 nonce (and,
/// later in its own flow, its signature) to a PSBT.
pub trait CosignerClient {
    fn sign_psbt(&self, psbt_hex: &str, wallet_id: &str) -> Result<String, UtxoSignerError>;
}

/// The step of the cooperative MuSig2 signing protocol being executed.
///
/// The protocol for a transaction with key path spend inputs is:
/// 1. `SignerNonce` — external signer generates its secret nonce,
/// 2. `CosignerNonce` — the platform attaches its public nonce,
/// 3. `SignerSignature` — external signer produces its partial signature,
/// 4. the platform co-signs and finalizes (outside this signer's scope).
///
/// Without a step, all of 1-3 run in a single call. The external signer and
/// its caller must use sticky sessions: the PSBT cached at step 1 holds the
/// secret nonce required by step 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningStep {
    SignerNonce,
    CosignerNonce,
    SignerSignature,
}

/// Parameters for one `sign_transaction` call.
#[derive(Default)]
pub struct SignTransactionParams<'a> {
    /// The signer's base58 xprv. Not required for `CosignerNonce`.
    pub prv: Option<&'a str>,
    pub signing_step: Option<SigningStep>,
    /// When true, finalizes into a fully valid network transaction.
    pub is_last_signature: bool,
    /// Allow signing a non-segwit input from its witness_utxo when the
    /// previous transaction is unavailable.
    pub allow_non_segwit_signing_without_prev_tx: bool,
    /// Wallet xpub triple (user, backup, bitgo); required for legacy-format
    /// prebuilds, which carry no derivation metadata in-band.
    pub pubs: Option<&'a [String; 3]>,
}

/// A signed or partially-signed artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignedTransaction {
    /// Partially signed; `tx_hex` is PSBT hex.
    HalfSigned { tx_hex: String },
    /// Fully signed and finalized; `tx_hex` is network transaction hex.
    FullSigned { tx_hex: String },
}

impl SignedTransaction {
    pub fn tx_hex(&self) -> &str {
        match self {
            SignedTransaction::HalfSigned { tx_hex } => tx_hex,
            SignedTransaction::FullSigned { tx_hex } => tx_hex,
        }
    }
}

/// One failed sign or verify attempt on a single input.
#[derive(Debug, Clone)]
pub struct InputSigningError {
    pub input_index: usize,
    pub script_type: Option<InputScriptType>,
    pub unspent_id: String,
    pub cause: String,
}

impl std::fmt::Display for InputSigningError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let script_type = self
            .script_type
            .map(|t| t.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        write!(
            f,
            "input {} ({}, {}): {}",
            self.input_index, script_type, self.unspent_id, self.cause
        )
    }
}

/// Aggregate of all per-input sign and verify failures of one call. Raised
/// once, after every input has been attempted.
#[derive(Debug, Clone, Default)]
pub struct TransactionSigningError {
    pub sign_errors: Vec<InputSigningError>,
    pub verify_errors: Vec<InputSigningError>,
}

impl TransactionSigningError {
    fn is_empty(&self) -> bool {
        self.sign_errors.is_empty() && self.verify_errors.is_empty()
    }
}

impl std::fmt::Display for TransactionSigningError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "transaction signing failed: {} sign error(s), {} verification error(s)",
            self.sign_errors.len(),
            self.verify_errors.len()
        )?;
        for e in &self.sign_errors {
            write!(f, "; sign: {}", e)?;
        }
        for e in &self.verify_errors {
            write!(f, "; verify: {}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for TransactionSigningError {}

#[derive(Debug)]
pub enum SignTransactionError {
    /// No prv supplied where one is required
    MissingPrv,
    /// The supplied key is public-only
    NeuteredSignerKey,
    /// prv did not parse as an extended key at all
    InvalidPrv(String),
    /// `is_last_signature` on a transaction with key path spend inputs
    LastSignatureWithKeyPathInput,
    /// walletId missing where the cosigner must be reached
    MissingWalletId,
    /// No cosigner client configured for a step that needs one
    MissingCosigner,
    /// `SignerSignature` for a txid never submitted via `SignerNonce` on
    /// this instance
    SessionCacheMiss { txid: Txid, cache_size: usize },
    Decode(DecodeError),
    InvalidPrebuild(String),
    Cosigner(UtxoSignerError),
    Signing(TransactionSigningError),
    Finalize(Vec<String>),
}

impl std::fmt::Display for SignTransactionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignTransactionError::MissingPrv => {
                write!(f, "missing prv parameter to sign transaction")
            }
            SignTransactionError::NeuteredSignerKey => {
                write!(f, "expected user private key but received public key")
            }
            SignTransactionError::InvalidPrv(e) => write!(f, "invalid prv: {}", e),
            SignTransactionError::LastSignatureWithKeyPathInput => {
                write!(
                    f,
                    "Cannot be last signature on a transaction with key path spend inputs"
                )
            }
            SignTransactionError::MissingWalletId => {
                write!(f, "walletId is required for MuSig2 cosigner nonce")
            }
            SignTransactionError::MissingCosigner => {
                write!(f, "no cosigner client configured")
            }
            SignTransactionError::SessionCacheMiss { txid, cache_size } => {
                write!(
                    f,
                    "Psbt for txid {} is missing from the signing session cache (cache size {}). \
                     This may be due to the request being routed to a different signer instance \
                     than the one that ran the signerNonce step.",
                    txid, cache_size
                )
            }
            SignTransactionError::Decode(e) => write!(f, "{}", e),
            SignTransactionError::InvalidPrebuild(e) => write!(f, "{}", e),
            SignTransactionError::Cosigner(e) => write!(f, "cosigner request failed: {}", e),
            SignTransactionError::Signing(e) => write!(f, "{}", e),
            SignTransactionError::Finalize(errors) => {
                write!(
                    f,
                    "Failed to finalize {} input(s): {}",
                    errors.len(),
                    errors.join("; ")
                )
            }
        }
    }
}

impl std::error::Error for SignTransactionError {}

impl From<DecodeError> for SignTransactionError {
    fn from(e: DecodeError) -> Self {
        SignTransactionError::Decode(e)
    }
}

/// The signing engine for one coin. Holds the injected collaborators; all
/// call state lives in the per-call parameters.
pub struct TransactionSigner<'a> {
    pub network: Network,
    pub replay_protection: &'a ReplayProtection,
    pub session_store: &'a SessionStore,
    pub cosigner: Option<&'a dyn CosignerClient>,
}

impl<'a> TransactionSigner<'a> {
    pub fn new(
        network: Network,
        replay_protection: &'a ReplayProtection,
        session_store: &'a SessionStore,
        cosigner: Option<&'a dyn CosignerClient>,
    ) -> Self {
        Self {
            network,
            replay_protection,
            session_store,
            cosigner,
        }
    }

    fn signer_keychain(
        params: &SignTransactionParams<'_>,
    ) -> Result<Xpriv, SignTransactionError> {
        let prv = params.prv.ok_or(SignTransactionError::MissingPrv)?;
        match Xpriv::from_str(prv) {
            Ok(xpriv) => Ok(xpriv),
            Err(e) => {
                if Xpub::from_str(prv).is_ok() {
                    Err(SignTransactionError::NeuteredSignerKey)
                } else {
                    Err(SignTransactionError::InvalidPrv(e.to_string()))
                }
            }
        }
    }

    fn wallet_id<'p>(
        prebuild: &'p TransactionPrebuild,
    ) -> Result<&'p str, SignTransactionError> {
        prebuild
            .wallet_id
            .as_deref()
            .ok_or(SignTransactionError::MissingWalletId)
    }

    fn cosigner_client(&self) -> Result<&'a dyn CosignerClient, SignTransactionError> {
        self.cosigner.ok_or(SignTransactionError::MissingCosigner)
    }

    fn decode_psbt(tx_hex: &str) -> Result<Psbt, SignTransactionError> {
        match WalletTransaction::from_hex(tx_hex)? {
            WalletTransaction::Psbt(psbt) => Ok(psbt),
            WalletTransaction::Legacy(_) => Err(SignTransactionError::InvalidPrebuild(
                "expected a psbt".to_string(),
            )),
        }
    }

    fn legacy_to_psbt(
        &self,
        tx: Transaction,
        prebuild: &TransactionPrebuild,
        params: &SignTransactionParams<'_>,
    ) -> Result<Psbt, SignTransactionError> {
        let tx_info = prebuild.tx_info.as_ref().ok_or_else(|| {
            SignTransactionError::InvalidPrebuild(
                "missing txInfo for legacy transaction".to_string(),
            )
        })?;
        let unspents = tx_info.unspents.as_deref().ok_or_else(|| {
            SignTransactionError::InvalidPrebuild(
                "missing unspents for legacy transaction".to_string(),
            )
        })?;
        let pubs = params.pubs.ok_or_else(|| {
            SignTransactionError::InvalidPrebuild("must provide xpub array".to_string())
        })?;
        let wallet_keys = RootWalletKeys::from_base58(pubs)
            .map_err(|e| SignTransactionError::InvalidPrebuild(e.to_string()))?;

        let mut prev_txs = BTreeMap::new();
        if let Some(tx_hexes) = &tx_info.tx_hexes {
            for (txid, tx_hex) in tx_hexes {
                let txid = Txid::from_str(txid).map_err(|e| {
                    SignTransactionError::InvalidPrebuild(format!("invalid txid in txHexes: {}", e))
                })?;
                match WalletTransaction::from_hex(tx_hex)? {
                    WalletTransaction::Legacy(prev_tx) => {
                        prev_txs.insert(txid, prev_tx);
                    }
                    WalletTransaction::Psbt(_) => {
                        return Err(SignTransactionError::InvalidPrebuild(
                            "txHexes must contain network transactions".to_string(),
                        ))
                    }
                }
            }
        }

        psbt::from_legacy_transaction(
            tx,
            unspents,
            &wallet_keys,
            self.replay_protection,
            &prev_txs,
            self.network,
        )
        .map_err(|e| SignTransactionError::InvalidPrebuild(e.to_string()))
    }

    /// Sign a prebuilt transaction.
    ///
    /// Legacy-format prebuilds are converted to PSBT form at this boundary;
    /// half-signed results are returned as PSBT hex, finalized results as
    /// network transaction hex.
    pub fn sign_transaction(
        &self,
        prebuild: &TransactionPrebuild,
        params: &SignTransactionParams<'_>,
    ) -> Result<SignedTransaction, SignTransactionError> {
        let tx = WalletTransaction::from_hex(&prebuild.tx_hex)?;

        let has_key_path_input = match &tx {
            WalletTransaction::Psbt(psbt) => psbt.inputs.iter().any(is_key_path_spend_input),
            WalletTransaction::Legacy(_) => false,
        };

        if params.is_last_signature && has_key_path_input {
            // the secret nonce only exists in the first signer's cache, so
            // this role can never hold the last signature on a key path input
            return Err(SignTransactionError::LastSignatureWithKeyPathInput);
        }

        let secp = Secp256k1::new();

        let (mut psbt, mut key_path_rounds) = if has_key_path_input {
            let psbt = match tx {
                WalletTransaction::Psbt(psbt) => psbt,
                WalletTransaction::Legacy(_) => unreachable!("checked above"),
            };
            match params.signing_step {
                Some(SigningStep::SignerNonce) => {
                    return self.run_signer_nonce_step(psbt, params, &secp);
                }
                Some(SigningStep::CosignerNonce) => {
                    let wallet_id = Self::wallet_id(prebuild)?;
                    let response = self
                        .cosigner_client()?
                        .sign_psbt(&hex::encode(psbt.serialize()), wallet_id)
                        .map_err(SignTransactionError::Cosigner)?;
                    return Ok(SignedTransaction::HalfSigned { tx_hex: response });
                }
                Some(SigningStep::SignerSignature) => self.resume_cached_session(psbt)?,
                None => {
                    // not an external signer: run the whole nonce exchange
                    // in-process before signing
                    let wallet_id = Self::wallet_id(prebuild)?;
                    let signer = Self::signer_keychain(params)?;
                    let mut psbt = psbt;
                    let rounds = self.generate_nonces(&mut psbt, &signer, &secp)?;

                    let response = self
                        .cosigner_client()?
                        .sign_psbt(&hex::encode(psbt.serialize()), wallet_id)
                        .map_err(SignTransactionError::Cosigner)?;
                    let cosigner_psbt = Self::decode_psbt(&response)?;
                    psbt.combine(cosigner_psbt).map_err(|e| {
                        SignTransactionError::InvalidPrebuild(format!(
                            "could not combine cosigner psbt: {}",
                            e
                        ))
                    })?;
                    (psbt, rounds)
                }
            }
        } else {
            match params.signing_step {
                Some(SigningStep::SignerNonce) | Some(SigningStep::CosignerNonce) => {
                    // the caller may not know the input script types in
                    // advance; nonce steps on a transaction without key path
                    // inputs are no-ops
                    return Ok(SignedTransaction::HalfSigned {
                        tx_hex: tx.to_hex(),
                    });
                }
                _ => {}
            }
            let psbt = match tx {
                WalletTransaction::Psbt(psbt) => psbt,
                WalletTransaction::Legacy(legacy) => {
                    self.legacy_to_psbt(legacy, prebuild, params)?
                }
            };
            (psbt, BTreeMap::new())
        };

        let signer = Self::signer_keychain(params)?;
        self.sign_and_verify(&mut psbt, &signer, &mut key_path_rounds, params, &secp)?;

        if params.is_last_signature {
            let final_tx = finalize_psbt(&mut psbt, &secp)?;
            let mut bytes = Vec::new();
            use crate::bitcoin::consensus::Encodable;
            final_tx.consensus_encode(&mut bytes).expect("vec write");
            Ok(SignedTransaction::FullSigned {
                tx_hex: hex::encode(bytes),
            })
        } else {
            Ok(SignedTransaction::HalfSigned {
                tx_hex: hex::encode(psbt.serialize()),
            })
        }
    }

    fn run_signer_nonce_step<C: secp256k1::Signing>(
        &self,
        mut psbt: Psbt,
        params: &SignTransactionParams<'_>,
        secp: &Secp256k1<C>,
    ) -> Result<SignedTransaction, SignTransactionError> {
        let signer = Self::signer_keychain(params)?;
        let rounds = self.generate_nonces(&mut psbt, &signer, secp)?;

        let tx_hex = hex::encode(psbt.serialize());
        self.session_store.insert(
            psbt::unsigned_txid(&psbt),
            SigningSession {
                psbt,
                first_rounds: rounds,
            },
        );
        Ok(SignedTransaction::HalfSigned { tx_hex })
    }

    fn resume_cached_session(
        &self,
        incoming: Psbt,
    ) -> Result<(Psbt, BTreeMap<usize, musig2::FirstRound>), SignTransactionError> {
        let txid = psbt::unsigned_txid(&incoming);
        let session = self.session_store.take(&txid).ok_or_else(|| {
            SignTransactionError::SessionCacheMiss {
                txid,
                cache_size: self.session_store.len(),
            }
        })?;

        let mut psbt = session.psbt;
        psbt.combine(incoming).map_err(|e| {
            SignTransactionError::InvalidPrebuild(format!(
                "could not combine cached psbt with request: {}",
                e
            ))
        })?;
        Ok((psbt, session.first_rounds))
    }

    fn generate_nonces<C: secp256k1::Signing>(
        &self,
        psbt: &mut Psbt,
        signer: &Xpriv,
        secp: &Secp256k1<C>,
    ) -> Result<BTreeMap<usize, musig2::FirstRound>, SignTransactionError> {
        let mut rounds = BTreeMap::new();
        let mut errors = Vec::new();
        for input_index in 0..psbt.inputs.len() {
            if !is_key_path_spend_input(&psbt.inputs[input_index]) {
                continue;
            }
            match keypath::generate_signer_nonce(secp, psbt, input_index, signer) {
                Ok(round) => {
                    rounds.insert(input_index, round);
                }
                Err(cause) => errors.push(input_signing_error(psbt, input_index, cause)),
            }
        }
        if errors.is_empty() {
            Ok(rounds)
        } else {
            Err(SignTransactionError::Signing(TransactionSigningError {
                sign_errors: errors,
                verify_errors: vec![],
            }))
        }
    }

    /// Sign every eligible input, then re-verify every signed input,
    /// collecting errors along the way (fail-slow). Raises one aggregate
    /// error when anything failed; the artifact is not returned on failure.
    fn sign_and_verify(
        &self,
        psbt: &mut Psbt,
        signer: &Xpriv,
        key_path_rounds: &mut BTreeMap<usize, musig2::FirstRound>,
        params: &SignTransactionParams<'_>,
        secp: &Secp256k1<secp256k1::All>,
    ) -> Result<(), SignTransactionError> {
        let mut result = TransactionSigningError::default();
        let mut signed_indices = Vec::new();

        for input_index in 0..psbt.inputs.len() {
            match self.sign_input(
                psbt,
                input_index,
                signer,
                key_path_rounds,
                params.allow_non_segwit_signing_without_prev_tx,
                secp,
            ) {
                Ok(true) => signed_indices.push(input_index),
                Ok(false) => {} // replay protection input, skipped
                Err(cause) => result
                    .sign_errors
                    .push(input_signing_error(psbt, input_index, cause)),
            }
        }

        let signer_xpub = Xpub::from_priv(secp, signer);
        for &input_index in &signed_indices {
            match psbt::verify_signature_with_xpub(secp, psbt, input_index, &signer_xpub) {
                Ok(true) => {}
                Ok(false) => result.verify_errors.push(input_signing_error(
                    psbt,
                    input_index,
                    "produced signature did not verify".to_string(),
                )),
                Err(cause) => result
                    .verify_errors
                    .push(input_signing_error(psbt, input_index, cause)),
            }
        }

        if result.is_empty() {
            Ok(())
        } else {
            Err(SignTransactionError::Signing(result))
        }
    }

    /// Sign one input. `Ok(false)` means the input was skipped (replay
    /// protection, platform-signed out of band).
    fn sign_input(
        &self,
        psbt: &mut Psbt,
        input_index: usize,
        signer: &Xpriv,
        key_path_rounds: &mut BTreeMap<usize, musig2::FirstRound>,
        allow_non_segwit_without_prev_tx: bool,
        secp: &Secp256k1<secp256k1::All>,
    ) -> Result<bool, String> {
        let prevout = psbt.unsigned_tx.input[input_index].previous_output;
        let (output_script, _value) = {
            let input = &psbt.inputs[input_index];
            let (script, value) = psbt_input::get_output_script_and_value(input, prevout)
                .map_err(|e| e.to_string())?;
            (script.clone(), value)
        };

        if self
            .replay_protection
            .is_replay_protection_input(&output_script)
        {
            return Ok(false);
        }

        let (chain, index) = psbt_input::parse_shared_chain_and_index(&psbt.inputs[input_index])?;
        let script_type = InputScriptType::from_script_id(
            psbt::ScriptId { chain, index },
            &psbt.inputs[input_index],
        )?;

        match script_type {
            InputScriptType::P2shP2pk => Ok(false),
            InputScriptType::P2sh => {
                if psbt.inputs[input_index].non_witness_utxo.is_none()
                    && !allow_non_segwit_without_prev_tx
                {
                    return Err(
                        "missing previous transaction for non-segwit input; pass \
                         allowNonSegwitSigningWithoutPrevTx to sign anyway"
                            .to_string(),
                    );
                }
                self.sign_ecdsa_input(psbt, input_index, signer, secp)?;
                Ok(true)
            }
            InputScriptType::P2shP2wsh | InputScriptType::P2wsh => {
                self.sign_ecdsa_input(psbt, input_index, signer, secp)?;
                Ok(true)
            }
            InputScriptType::P2trLegacy | InputScriptType::P2trMusig2ScriptPath => {
                self.sign_taproot_script_path_input(psbt, input_index, signer, secp)?;
                Ok(true)
            }
            InputScriptType::P2trMusig2KeyPath => {
                let round = key_path_rounds
                    .remove(&input_index)
                    .ok_or_else(|| "missing MuSig2 nonce for key path input".to_string())?;
                keypath::sign_key_path_input(secp, psbt, input_index, round, signer)?;
                Ok(true)
            }
        }
    }

    fn sign_ecdsa_input(
        &self,
        psbt: &mut Psbt,
        input_index: usize,
        signer: &Xpriv,
        secp: &Secp256k1<secp256k1::All>,
    ) -> Result<(), String> {
        let derived = keypath::derive_xpriv_for_input(secp, signer, &psbt.inputs[input_index])?
            .ok_or_else(|| "no derivation path for signer key".to_string())?;
        let derived_pub = Xpub::from_priv(secp, &derived);

        let mut cache = SighashCache::new(&psbt.unsigned_tx);
        let msg = psbt_input::compute_ecdsa_sighash(psbt, input_index, &mut cache)?;

        let signature = secp.sign_ecdsa(&msg, &derived.private_key);
        let sighash_type = psbt.inputs[input_index]
            .sighash_type
            .and_then(|t| t.ecdsa_hash_ty().ok())
            .unwrap_or(EcdsaSighashType::All);

        psbt.inputs[input_index].partial_sigs.insert(
            crate::bitcoin::PublicKey::new(derived_pub.public_key),
            crate::bitcoin::ecdsa::Signature {
                signature,
                sighash_type,
            },
        );
        Ok(())
    }

    fn sign_taproot_script_path_input(
        &self,
        psbt: &mut Psbt,
        input_index: usize,
        signer: &Xpriv,
        secp: &Secp256k1<secp256k1::All>,
    ) -> Result<(), String> {
        use crate::bitcoin::key::Keypair;
        use crate::bitcoin::taproot;

        let derived = keypath::derive_xpriv_for_input(secp, signer, &psbt.inputs[input_index])?
            .ok_or_else(|| "no derivation path for signer key".to_string())?;
        let keypair = Keypair::from_secret_key(secp, &derived.private_key);
        let (x_only, _parity) = keypair.x_only_public_key();

        let leaf_hashes = psbt.inputs[input_index]
            .tap_key_origins
            .get(&x_only)
            .map(|(hashes, _)| hashes.clone())
            .ok_or_else(|| "signer key not in tap key origins".to_string())?;
        if leaf_hashes.is_empty() {
            return Err("signer key participates in no tap leaves".to_string());
        }

        let prevouts = collect_prevouts(psbt).map_err(|e| e.to_string())?;
        let mut cache = SighashCache::new(&psbt.unsigned_tx);

        for leaf_hash in leaf_hashes {
            let sighash = cache
                .taproot_script_spend_signature_hash(
                    input_index,
                    &Prevouts::All(&prevouts),
                    leaf_hash,
                    TapSighashType::Default,
                )
                .map_err(|e| format!("failed to compute taproot sighash: {}", e))?;
            let msg = secp256k1::Message::from_digest(sighash.to_byte_array());
            let signature = secp.sign_schnorr(&msg, &keypair);

            psbt.inputs[input_index].tap_script_sigs.insert(
                (x_only, leaf_hash),
                taproot::Signature {
                    signature,
                    sighash_type: TapSighashType::Default,
                },
            );
        }
        Ok(())
    }
}

fn input_signing_error(psbt: &Psbt, input_index: usize, cause: String) -> InputSigningError {
    let input = &psbt.inputs[input_index];
    let prevout = psbt.unsigned_tx.input[input_index].previous_output;
    let script_type = psbt_input::parse_shared_chain_and_index(input)
        .ok()
        .and_then(|(chain, index)| {
            InputScriptType::from_script_id(psbt::ScriptId { chain, index }, input).ok()
        });
    InputSigningError {
        input_index,
        script_type,
        unspent_id: format_outpoint(&prevout),
        cause,
    }
}

/// Finalize every input, attempting each one even when some fail, then
/// extract the network transaction.
pub fn finalize_psbt(
    psbt: &mut Psbt,
    secp: &Secp256k1<secp256k1::All>,
) -> Result<Transaction, SignTransactionError> {
    use miniscript::psbt::PsbtExt;

    let mut errors = Vec::new();
    for input_index in 0..psbt.inputs.len() {
        let result = if Musig2Input::is_musig2_input(&psbt.inputs[input_index]) {
            Musig2Input::finalize_input(psbt, secp, input_index).map_err(|e| e.to_string())
        } else {
            psbt.finalize_inp_mut(secp, input_index)
                .map_err(|e| e.to_string())
        };
        if let Err(e) = result {
            errors.push(format!("Input {}: {}", input_index, e));
        }
    }
    if !errors.is_empty() {
        return Err(SignTransactionError::Finalize(errors));
    }

    psbt.clone()
        .extract_tx()
        .map_err(|e| SignTransactionError::Finalize(vec![format!("extract failed: {}", e)]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use crate::prebuild::TransactionInfo;
    use crate::test_utils::{external_script, tx_out, TestWallet};
    use crate::wallet::ScriptP2shP2pk;

    fn prebuild(tx_hex: String, wallet_id: Option<&str>) -> TransactionPrebuild {
        TransactionPrebuild {
            tx_hex,
            tx_info: None,
            wallet_id: wallet_id.map(str::to_string),
        }
    }

    fn signer_params(prv: &str) -> SignTransactionParams<'_> {
        SignTransactionParams {
            prv: Some(prv),
            ..Default::default()
        }
    }

    struct TestSigner<'a> {
        replay_protection: ReplayProtection,
        session_store: SessionStore,
        cosigner: Option<&'a dyn CosignerClient>,
    }

    impl<'a> TestSigner<'a> {
        fn new() -> Self {
            Self {
                replay_protection: ReplayProtection::none(),
                session_store: SessionStore::default(),
                cosigner: None,
            }
        }

        fn with_cosigner(cosigner: &'a dyn CosignerClient) -> Self {
            Self {
                cosigner: Some(cosigner),
                ..Self::new()
            }
        }

        fn signer(&self) -> TransactionSigner<'_> {
            TransactionSigner::new(
                Network::Bitcoin,
                &self.replay_protection,
                &self.session_store,
                self.cosigner,
            )
        }
    }

    /// Cosigner double: adds the platform nonce for every key path input and
    /// keeps the secret round so tests can complete the ceremony.
    struct MockCosigner {
        wallet: TestWallet,
        rounds: RefCell<BTreeMap<usize, musig2::FirstRound>>,
        calls: RefCell<Vec<String>>,
    }

    impl MockCosigner {
        fn new(seed: &str) -> Self {
            Self {
                wallet: TestWallet::new(seed),
                rounds: RefCell::new(BTreeMap::new()),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl CosignerClient for MockCosigner {
        fn sign_psbt(&self, psbt_hex: &str, wallet_id: &str) -> Result<String, UtxoSignerError> {
            self.calls.borrow_mut().push(wallet_id.to_string());
            let mut psbt = match WalletTransaction::from_hex(psbt_hex).unwrap() {
                WalletTransaction::Psbt(psbt) => psbt,
                WalletTransaction::Legacy(_) => {
                    return Err(UtxoSignerError::new("expected psbt"))
                }
            };
            let secp = Secp256k1::new();
            let bitgo_xpriv = self.wallet.xprvs[2];
            for input_index in 0..psbt.inputs.len() {
                if !is_key_path_spend_input(&psbt.inputs[input_index]) {
                    continue;
                }
                let round =
                    super::keypath::generate_signer_nonce(&secp, &mut psbt, input_index, &bitgo_xpriv)
                        .map_err(|e| UtxoSignerError::new(&e))?;
                self.rounds.borrow_mut().insert(input_index, round);
            }
            Ok(hex::encode(psbt.serialize()))
        }
    }

    fn p2wsh_spend(wallet: &TestWallet, input_count: usize) -> Psbt {
        let inputs: Vec<(u32, u32, u64)> =
            (0..input_count).map(|i| (20, i as u32, 100_000)).collect();
        wallet.psbt(&inputs, vec![tx_out(external_script(), 90_000 * input_count as u64)])
    }

    fn key_path_spend(wallet: &TestWallet) -> Psbt {
        let mut psbt = wallet.psbt(&[(40, 0, 100_000)], vec![tx_out(external_script(), 90_000)]);
        wallet.make_key_path_input(&mut psbt, 0, 40, 0);
        psbt
    }

    fn count_musig2_partial_sigs(psbt: &Psbt, input_index: usize) -> usize {
        crate::psbt::musig2_input::parse_musig2_partial_sigs(&psbt.inputs[input_index])
            .unwrap()
            .len()
    }

    #[test]
    fn missing_prv_is_rejected() {
        let wallet = TestWallet::new("sign-noprv");
        let harness = TestSigner::new();
        let psbt = p2wsh_spend(&wallet, 1);
        let result = harness.signer().sign_transaction(
            &prebuild(hex::encode(psbt.serialize()), None),
            &SignTransactionParams::default(),
        );
        assert!(matches!(result, Err(SignTransactionError::MissingPrv)));
    }

    #[test]
    fn public_key_as_prv_is_rejected() {
        let wallet = TestWallet::new("sign-neutered");
        let harness = TestSigner::new();
        let psbt = p2wsh_spend(&wallet, 1);
        let pubs = wallet.pubs();
        let result = harness.signer().sign_transaction(
            &prebuild(hex::encode(psbt.serialize()), None),
            &signer_params(&pubs[0]),
        );
        assert!(matches!(
            result,
            Err(SignTransactionError::NeuteredSignerKey)
        ));
    }

    #[test]
    fn half_then_full_signing_p2wsh() {
        let wallet = TestWallet::new("sign-p2wsh");
        let harness = TestSigner::new();
        let psbt = p2wsh_spend(&wallet, 1);

        let half = harness
            .signer()
            .sign_transaction(
                &prebuild(hex::encode(psbt.serialize()), None),
                &signer_params(&wallet.user_prv()),
            )
            .expect("user signing");
        let half_psbt = match WalletTransaction::from_hex(half.tx_hex()).unwrap() {
            WalletTransaction::Psbt(p) => p,
            _ => panic!("expected psbt"),
        };
        assert_eq!(half_psbt.inputs[0].partial_sigs.len(), 1);

        let secp = Secp256k1::new();
        assert_eq!(
            crate::psbt::signature_count(&secp, &half_psbt, 0, &wallet.keys).unwrap(),
            1
        );

        let full = harness
            .signer()
            .sign_transaction(
                &prebuild(half.tx_hex().to_string(), None),
                &SignTransactionParams {
                    prv: Some(&wallet.bitgo_prv()),
                    is_last_signature: true,
                    ..Default::default()
                },
            )
            .expect("bitgo signing");

        let tx = match WalletTransaction::from_hex(full.tx_hex()).unwrap() {
            WalletTransaction::Legacy(tx) => tx,
            _ => panic!("expected finalized network transaction"),
        };
        assert!(!tx.input[0].witness.is_empty());
    }

    #[test]
    fn legacy_prebuild_is_signed_through_psbt_conversion() {
        let wallet = TestWallet::new("sign-legacy");
        let harness = TestSigner::new();

        let unspents = vec![wallet.unspent(20, 0, 100_000, 0)];
        let tx = crate::test_utils::unsigned_tx(1, vec![tx_out(external_script(), 90_000)]);
        let tx_hex = WalletTransaction::Legacy(tx).to_hex();

        let pubs = wallet.pubs();
        let result = harness
            .signer()
            .sign_transaction(
                &TransactionPrebuild {
                    tx_hex,
                    tx_info: Some(TransactionInfo {
                        unspents: Some(unspents),
                        ..Default::default()
                    }),
                    wallet_id: None,
                },
                &SignTransactionParams {
                    prv: Some(&wallet.user_prv()),
                    pubs: Some(&pubs),
                    ..Default::default()
                },
            )
            .expect("legacy signing");

        let psbt = match WalletTransaction::from_hex(result.tx_hex()).unwrap() {
            WalletTransaction::Psbt(p) => p,
            _ => panic!("expected psbt"),
        };
        assert_eq!(psbt.inputs[0].partial_sigs.len(), 1);
    }

    #[test]
    fn non_segwit_input_requires_prev_tx_or_override() {
        let wallet = TestWallet::new("sign-p2sh");
        let harness = TestSigner::new();
        let psbt = wallet.psbt(&[(0, 0, 100_000)], vec![tx_out(external_script(), 90_000)]);

        let err = harness
            .signer()
            .sign_transaction(
                &prebuild(hex::encode(psbt.serialize()), None),
                &signer_params(&wallet.user_prv()),
            )
            .unwrap_err();
        match err {
            SignTransactionError::Signing(e) => {
                assert_eq!(e.sign_errors.len(), 1);
                assert!(e.sign_errors[0].cause.contains("missing previous transaction"));
            }
            other => panic!("expected signing error, got {:?}", other),
        }

        let result = harness
            .signer()
            .sign_transaction(
                &prebuild(hex::encode(psbt.serialize()), None),
                &SignTransactionParams {
                    prv: Some(&wallet.user_prv()),
                    allow_non_segwit_signing_without_prev_tx: true,
                    ..Default::default()
                },
            )
            .expect("override signing");
        let signed = match WalletTransaction::from_hex(result.tx_hex()).unwrap() {
            WalletTransaction::Psbt(p) => p,
            _ => panic!("expected psbt"),
        };
        assert_eq!(signed.inputs[0].partial_sigs.len(), 1);
    }

    #[test]
    fn aggregate_error_lists_every_failing_input() {
        let wallet = TestWallet::new("sign-aggregate");
        let harness = TestSigner::new();
        let mut psbt = p2wsh_spend(&wallet, 3);
        // break inputs 0 and 2
        psbt.inputs[0].witness_utxo = None;
        psbt.inputs[2].witness_utxo = None;

        let err = harness
            .signer()
            .sign_transaction(
                &prebuild(hex::encode(psbt.serialize()), None),
                &signer_params(&wallet.user_prv()),
            )
            .unwrap_err();

        match err {
            SignTransactionError::Signing(e) => {
                let indices: Vec<usize> = e.sign_errors.iter().map(|x| x.input_index).collect();
                assert_eq!(indices, vec![0, 2]);
                // input 1 was still attempted and signed, so it is absent
                // from both error lists
                assert!(e.verify_errors.is_empty());
            }
            other => panic!("expected signing error, got {:?}", other),
        }
    }

    #[test]
    fn replay_protection_inputs_are_excluded_from_signing() {
        let wallet = TestWallet::new("sign-replay");
        let replay_key = crate::wallet::to_pub_triple(
            &wallet.keys.derive_for_chain_and_index(0, 999).unwrap(),
        )[0];
        let replay_script = ScriptP2shP2pk::new(replay_key);

        let mut harness = TestSigner::new();
        harness.replay_protection =
            ReplayProtection::new(vec![replay_script.output_script()]);

        let mut psbt = p2wsh_spend(&wallet, 2);
        // rewrite input 0 as a replay protection input: platform-owned
        // script, no wallet derivation data
        psbt.inputs[0].bip32_derivation.clear();
        psbt.inputs[0].witness_script = None;
        psbt.inputs[0].redeem_script = Some(replay_script.redeem_script.clone());
        psbt.inputs[0].witness_utxo = Some(tx_out(replay_script.output_script(), 1_000));

        let result = harness
            .signer()
            .sign_transaction(
                &prebuild(hex::encode(psbt.serialize()), None),
                &signer_params(&wallet.user_prv()),
            )
            .expect("signing must skip the replay input");

        let signed = match WalletTransaction::from_hex(result.tx_hex()).unwrap() {
            WalletTransaction::Psbt(p) => p,
            _ => panic!("expected psbt"),
        };
        assert!(signed.inputs[0].partial_sigs.is_empty());
        assert_eq!(signed.inputs[1].partial_sigs.len(), 1);
    }

    #[test]
    fn last_signature_with_key_path_input_is_rejected_up_front() {
        let wallet = TestWallet::new("sign-kp-last");
        let harness = TestSigner::new();
        let psbt = key_path_spend(&wallet);

        let result = harness.signer().sign_transaction(
            &prebuild(hex::encode(psbt.serialize()), Some("wallet-1")),
            &SignTransactionParams {
                prv: Some(&wallet.user_prv()),
                is_last_signature: true,
                ..Default::default()
            },
        );
        assert!(matches!(
            result,
            Err(SignTransactionError::LastSignatureWithKeyPathInput)
        ));
        assert!(harness.session_store.is_empty());
    }

    #[test]
    fn signer_signature_without_cached_session_is_a_cache_miss() {
        let wallet = TestWallet::new("sign-kp-miss");
        let harness = TestSigner::new();
        let psbt = key_path_spend(&wallet);

        let err = harness
            .signer()
            .sign_transaction(
                &prebuild(hex::encode(psbt.serialize()), Some("wallet-1")),
                &SignTransactionParams {
                    prv: Some(&wallet.user_prv()),
                    signing_step: Some(SigningStep::SignerSignature),
                    ..Default::default()
                },
            )
            .unwrap_err();
        match err {
            SignTransactionError::SessionCacheMiss { cache_size, .. } => {
                assert_eq!(cache_size, 0);
            }
            other => panic!("expected cache miss, got {:?}", other),
        }
        assert!(err.to_string().contains("cache size 0"));
    }

    #[test]
    fn cosigner_nonce_requires_wallet_id() {
        let wallet = TestWallet::new("sign-kp-walletid");
        let harness = TestSigner::new();
        let psbt = key_path_spend(&wallet);

        let result = harness.signer().sign_transaction(
            &prebuild(hex::encode(psbt.serialize()), None),
            &SignTransactionParams {
                signing_step: Some(SigningStep::CosignerNonce),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(SignTransactionError::MissingWalletId)));
    }

    #[test]
    fn nonce_steps_are_noops_without_key_path_inputs() {
        let wallet = TestWallet::new("sign-noop");
        let harness = TestSigner::new();
        let psbt = p2wsh_spend(&wallet, 1);
        let tx_hex = hex::encode(psbt.serialize());

        for step in [SigningStep::SignerNonce, SigningStep::CosignerNonce] {
            let result = harness
                .signer()
                .sign_transaction(
                    &prebuild(tx_hex.clone(), None),
                    &SignTransactionParams {
                        signing_step: Some(step),
                        ..Default::default()
                    },
                )
                .expect("nonce steps must be no-ops");
            assert_eq!(result.tx_hex(), tx_hex);
        }
        assert!(harness.session_store.is_empty());
    }

    #[test]
    fn signer_nonce_caches_the_session() {
        let wallet = TestWallet::new("sign-kp-cache");
        let harness = TestSigner::new();
        let psbt = key_path_spend(&wallet);
        let tx_hex = hex::encode(psbt.serialize());

        let result = harness
            .signer()
            .sign_transaction(
                &prebuild(tx_hex.clone(), Some("wallet-1")),
                &SignTransactionParams {
                    prv: Some(&wallet.user_prv()),
                    signing_step: Some(SigningStep::SignerNonce),
                    ..Default::default()
                },
            )
            .expect("signer nonce");
        assert_eq!(harness.session_store.len(), 1);

        // the returned psbt carries the public nonce only, no signature
        let nonce_psbt = match WalletTransaction::from_hex(result.tx_hex()).unwrap() {
            WalletTransaction::Psbt(p) => p,
            _ => panic!("expected psbt"),
        };
        assert_eq!(
            crate::psbt::musig2_input::parse_musig2_nonces(&nonce_psbt.inputs[0])
                .unwrap()
                .len(),
            1
        );
        assert_eq!(count_musig2_partial_sigs(&nonce_psbt, 0), 0);

        // re-running the nonce step replaces the cached session
        harness
            .signer()
            .sign_transaction(
                &prebuild(tx_hex, Some("wallet-1")),
                &SignTransactionParams {
                    prv: Some(&wallet.user_prv()),
                    signing_step: Some(SigningStep::SignerNonce),
                    ..Default::default()
                },
            )
            .expect("second signer nonce");
        assert_eq!(harness.session_store.len(), 1);
    }

    #[test]
    fn external_signer_three_step_protocol() {
        let seed = "sign-kp-protocol";
        let wallet = TestWallet::new(seed);
        let cosigner = MockCosigner::new(seed);
        let harness = TestSigner::with_cosigner(&cosigner);
        let psbt = key_path_spend(&wallet);

        // step 1: signer nonce
        let nonce_tx = harness
            .signer()
            .sign_transaction(
                &prebuild(hex::encode(psbt.serialize()), Some("wallet-1")),
                &SignTransactionParams {
                    prv: Some(&wallet.user_prv()),
                    signing_step: Some(SigningStep::SignerNonce),
                    ..Default::default()
                },
            )
            .expect("signer nonce");

        // step 2: cosigner nonce via the remote service
        let cosigner_tx = harness
            .signer()
            .sign_transaction(
                &prebuild(nonce_tx.tx_hex().to_string(), Some("wallet-1")),
                &SignTransactionParams {
                    signing_step: Some(SigningStep::CosignerNonce),
                    ..Default::default()
                },
            )
            .expect("cosigner nonce");
        assert_eq!(cosigner.calls.borrow().as_slice(), ["wallet-1"]);

        // step 3: signer signature, consuming the cached session
        let signed_tx = harness
            .signer()
            .sign_transaction(
                &prebuild(cosigner_tx.tx_hex().to_string(), Some("wallet-1")),
                &SignTransactionParams {
                    prv: Some(&wallet.user_prv()),
                    signing_step: Some(SigningStep::SignerSignature),
                    ..Default::default()
                },
            )
            .expect("signer signature");
        assert!(harness.session_store.is_empty());

        let mut signed_psbt = match WalletTransaction::from_hex(signed_tx.tx_hex()).unwrap() {
            WalletTransaction::Psbt(p) => p,
            _ => panic!("expected psbt"),
        };
        assert_eq!(count_musig2_partial_sigs(&signed_psbt, 0), 1);

        // the platform side completes the ceremony: second partial
        // signature, aggregation, finalization
        let secp = Secp256k1::new();
        let bitgo_round = cosigner.rounds.borrow_mut().remove(&0).expect("bitgo round");
        super::keypath::sign_key_path_input(
            &secp,
            &mut signed_psbt,
            0,
            bitgo_round,
            &cosigner.wallet.xprvs[2],
        )
        .expect("bitgo partial signature");
        assert_eq!(count_musig2_partial_sigs(&signed_psbt, 0), 2);

        let tx = finalize_psbt(&mut signed_psbt, &secp).expect("finalize");
        assert_eq!(tx.input[0].witness.len(), 1);
        assert_eq!(tx.input[0].witness.iter().next().unwrap().len(), 64);
    }

    #[test]
    fn combined_local_flow_signs_in_one_call() {
        let seed = "sign-kp-local";
        let wallet = TestWallet::new(seed);
        let cosigner = MockCosigner::new(seed);
        let harness = TestSigner::with_cosigner(&cosigner);
        let psbt = key_path_spend(&wallet);

        let result = harness
            .signer()
            .sign_transaction(
                &prebuild(hex::encode(psbt.serialize()), Some("wallet-1")),
                &signer_params(&wallet.user_prv()),
            )
            .expect("combined signing");

        let signed_psbt = match WalletTransaction::from_hex(result.tx_hex()).unwrap() {
            WalletTransaction::Psbt(p) => p,
            _ => panic!("expected psbt"),
        };
        assert_eq!(count_musig2_partial_sigs(&signed_psbt, 0), 1);
        // nothing cached for the one-call flow
        assert!(harness.session_store.is_empty());
    }

    #[test]
    fn combined_local_flow_requires_wallet_id() {
        let seed = "sign-kp-local-nowallet";
        let wallet = TestWallet::new(seed);
        let cosigner = MockCosigner::new(seed);
        let harness = TestSigner::with_cosigner(&cosigner);
        let psbt = key_path_spend(&wallet);

        let result = harness.signer().sign_transaction(
            &prebuild(hex::encode(psbt.serialize()), None),
            &signer_params(&wallet.user_prv()),
        );
        assert!(matches!(result, Err(SignTransactionError::MissingWalletId)));
    }
}
