//! MuSig2 key path rounds for the signer role: first-round nonce generation
//! and second-round partial signing. The secret nonce never leaves the
//! `FirstRound` object, which lives in the session store between the two
//! protocol steps.

use musig2::{FirstRound, KeyAggContext, PartialSignature, SecNonceSpices};

use crate::bitcoin::bip32::{Xpriv, Xpub};
use crate::bitcoin::hashes::Hash;
use crate::bitcoin::psbt::Input;
use crate::bitcoin::secp256k1::{self, Secp256k1};
use crate::bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use crate::bitcoin::Psbt;
use crate::psbt::musig2_input::{
    collect_prevouts, set_musig2_nonce, set_musig2_partial_sig, Musig2Input, Musig2PartialSig,
    Musig2PubNonce,
};

/// Derive the signer's child key for an input, following the derivation path
/// recorded for the signer's fingerprint. `None` when the input carries no
/// entry for this key.
pub(crate) fn derive_xpriv_for_input<C: secp256k1::Signing>(
    secp: &Secp256k1<C>,
    signer: &Xpriv,
    input: &Input,
) -> Result<Option<Xpriv>, String> {
    let fingerprint = Xpub::from_priv(secp, signer).fingerprint();

    let path = if !input.bip32_derivation.is_empty() {
        input
            .bip32_derivation
            .values()
            .find(|(fp, _)| *fp == fingerprint)
            .map(|(_, path)| path)
    } else {
        input
            .tap_key_origins
            .values()
            .find(|(_, (fp, _))| *fp == fingerprint)
            .map(|(_, (_, path))| path)
    };

    match path {
        Some(path) => signer
            .derive_priv(secp, path)
            .map(Some)
            .map_err(|e| format!("failed to derive signer key: {}", e)),
        None => Ok(None),
    }
}

/// The taproot key spend sighash for an input.
pub(crate) fn key_path_sighash(psbt: &Psbt, input_index: usize) -> Result<[u8; 32], String> {
    let prevouts = collect_prevouts(psbt).map_err(|e| e.to_string())?;
    let mut cache = SighashCache::new(&psbt.unsigned_tx);
    let sighash = cache
        .taproot_key_spend_signature_hash(
            input_index,
            &Prevouts::All(&prevouts),
            TapSighashType::Default,
        )
        .map_err(|e| format!("failed to compute key path sighash: {}", e))?;
    Ok(sighash.to_byte_array())
}

fn seckey_scalar(xpriv: &Xpriv) -> Result<musig2::secp::Scalar, String> {
    musig2::secp::Scalar::try_from(&xpriv.private_key.secret_bytes()[..])
        .map_err(|_| "signer key is not a valid scalar".to_string())
}

fn tweaked_key_agg_context(
    musig2_input: &Musig2Input,
    input: &Input,
) -> Result<KeyAggContext, String> {
    let points = musig2_input
        .get_participant_points()
        .map_err(|e| e.to_string())?;
    let ctx = KeyAggContext::new(points)
        .map_err(|e| format!("failed to create key agg context: {}", e))?;
    let merkle_root = input
        .tap_merkle_root
        .ok_or_else(|| "missing tap merkle root for key path input".to_string())?;
    ctx.with_taproot_tweak(&merkle_root.to_byte_array())
        .map_err(|e| format!("failed to apply taproot tweak: {}", e))
}

/// Generate the signer's secret nonce for a key path input, attach the
/// public nonce to the PSBT, and return the first-round state holding the
/// secret half.
pub(crate) fn generate_signer_nonce<C: secp256k1::Signing>(
    secp: &Secp256k1<C>,
    psbt: &mut Psbt,
    input_index: usize,
    signer: &Xpriv,
) -> Result<FirstRound, String> {
    let sighash = key_path_sighash(psbt, input_index)?;

    let input = &psbt.inputs[input_index];
    let musig2_input = Musig2Input::from_input(input).map_err(|e| e.to_string())?;

    let derived = derive_xpriv_for_input(secp, signer, input)?
        .ok_or_else(|| "no derivation path for signer key".to_string())?;
    let our_pub = Xpub::from_priv(secp, &derived).to_pub();

    let signer_index = musig2_input
        .participants
        .participant_index(&our_pub)
        .ok_or_else(|| "signer key is not a MuSig2 participant".to_string())?;

    let key_agg_ctx = tweaked_key_agg_context(&musig2_input, input)?;
    let seckey = seckey_scalar(&derived)?;
    let nonce_seed: [u8; 32] = rand::random();

    let first_round = FirstRound::new(
        key_agg_ctx,
        nonce_seed,
        signer_index,
        SecNonceSpices::new()
            .with_seckey(seckey)
            .with_message(&sighash),
    )
    .map_err(|e| format!("failed to create first round: {}", e))?;

    let pub_nonce = Musig2PubNonce {
        participant_pub_key: our_pub,
        tap_output_key: musig2_input.participants.tap_output_key,
        pub_nonce: first_round.our_public_nonce(),
    };
    set_musig2_nonce(&mut psbt.inputs[input_index], &pub_nonce);

    Ok(first_round)
}

/// Feed the cosigner's public nonce into the first round and produce the
/// signer's partial signature for a key path input. Consumes the round; a
/// session is single use by construction.
pub(crate) fn sign_key_path_input<C: secp256k1::Signing>(
    secp: &Secp256k1<C>,
    psbt: &mut Psbt,
    input_index: usize,
    mut first_round: FirstRound,
    signer: &Xpriv,
) -> Result<(), String> {
    let sighash = key_path_sighash(psbt, input_index)?;

    let input = &psbt.inputs[input_index];
    let musig2_input = Musig2Input::from_input(input).map_err(|e| e.to_string())?;

    let derived = derive_xpriv_for_input(secp, signer, input)?
        .ok_or_else(|| "no derivation path for signer key".to_string())?;
    let our_pub = Xpub::from_priv(secp, &derived).to_pub();

    for nonce in &musig2_input.nonces {
        if nonce.participant_pub_key == our_pub {
            continue;
        }
        let participant_index = musig2_input
            .participants
            .participant_index(&nonce.participant_pub_key)
            .ok_or_else(|| "nonce from unknown participant".to_string())?;
        first_round
            .receive_nonce(participant_index, nonce.pub_nonce.clone())
            .map_err(|e| format!("failed to add cosigner nonce: {}", e))?;
    }

    if !first_round.is_complete() {
        return Err("missing cosigner nonce for key path input".to_string());
    }

    let seckey = seckey_scalar(&derived)?;
    let second_round = first_round
        .finalize(seckey, sighash)
        .map_err(|e| format!("failed to finalize first round: {}", e))?;

    let partial_sig: PartialSignature = second_round.our_signature();
    let partial = Musig2PartialSig {
        participant_pub_key: our_pub,
        tap_output_key: musig2_input.participants.tap_output_key,
        partial_sig: partial_sig.serialize().to_vec(),
    };
    set_musig2_partial_sig(&mut psbt.inputs[input_index], &partial);

    Ok(())
}
