//! Bitcoin message signing and verification (BIP-137)
//!
//! Key signatures binding the wallet keys together are ordinary Bitcoin
//! message signatures made with the user key. The signing address is always
//! derived with the Bitcoin mainnet P2PKH prefix, independent of the wallet's
//! network; it is only a representation of the public key, not an on-chain
//! destination.

use crate::bitcoin::hashes::{hash160, sha256d, Hash};
use crate::bitcoin::secp256k1::{self, PublicKey, Secp256k1, SecretKey};
use crate::bitcoin::{base58, consensus::Encodable, VarInt};
use crate::error::UtxoSignerError;

const BITCOIN_SIGNED_MESSAGE_PREFIX: &[u8] = b"\x18Bitcoin Signed Message:\n";

/// Version byte of the fixed mainnet-style signing address.
const SIGNING_ADDRESS_VERSION: u8 = 0x00;

/// Compute the Bitcoin message hash (double SHA256 with magic prefix).
fn bitcoin_message_hash(message: &str) -> sha256d::Hash {
    let message_bytes = message.as_bytes();

    let mut data = Vec::new();
    data.extend_from_slice(BITCOIN_SIGNED_MESSAGE_PREFIX);

    let varint = VarInt::from(message_bytes.len());
    let mut varint_bytes = Vec::new();
    // consensus_encode on VarInt to Vec<u8> is infallible
    varint.consensus_encode(&mut varint_bytes).unwrap();
    data.extend_from_slice(&varint_bytes);

    data.extend_from_slice(message_bytes);

    sha256d::Hash::hash(&data)
}

/// The base58check address representing a public key for message signing.
/// Always uses the mainnet prefix, regardless of the wallet's network.
pub fn signing_address(public_key: &PublicKey) -> String {
    let hash = hash160::Hash::hash(&public_key.serialize());
    let mut payload = vec![SIGNING_ADDRESS_VERSION];
    payload.extend_from_slice(hash.as_byte_array());
    base58::encode_check(&payload)
}

/// Sign a message, returning the 65-byte recoverable signature
/// (1-byte header + 64-byte compact signature).
/// Header = 31 + recovery_id (keys are always compressed here).
pub fn sign_message(secret_key: &SecretKey, message: &str) -> Vec<u8> {
    let message_hash = bitcoin_message_hash(message);
    let msg = secp256k1::Message::from_digest(*message_hash.as_ref());

    let secp = Secp256k1::signing_only();
    let recoverable_sig = secp.sign_ecdsa_recoverable(&msg, secret_key);
    let (recovery_id, compact_sig) = recoverable_sig.serialize_compact();

    let header = 31 + recovery_id.to_i32() as u8;

    let mut sig_bytes = Vec::with_capacity(65);
    sig_bytes.push(header);
    sig_bytes.extend_from_slice(&compact_sig);
    sig_bytes
}

/// Recover the signing public key from a 65-byte message signature.
/// The boolean is the compressed flag encoded in the signature header.
fn recover_public_key(
    message: &str,
    signature: &[u8],
) -> Result<(PublicKey, bool), UtxoSignerError> {
    if signature.len() != 65 {
        return Err(UtxoSignerError::new(&format!(
            "signature must be 65 bytes, got {}",
            signature.len()
        )));
    }

    let recovery_flags = signature[0];
    let compact_sig = &signature[1..65];

    // Compressed keys: header 31-34 (recid 0-3), uncompressed: 27-30
    let (recovery_id, compressed) = if (31..=34).contains(&recovery_flags) {
        (
            secp256k1::ecdsa::RecoveryId::from_i32((recovery_flags - 31) as i32)
                .map_err(|e| UtxoSignerError::new(&format!("invalid recovery id: {}", e)))?,
            true,
        )
    } else if (27..=30).contains(&recovery_flags) {
        (
            secp256k1::ecdsa::RecoveryId::from_i32((recovery_flags - 27) as i32)
                .map_err(|e| UtxoSignerError::new(&format!("invalid recovery id: {}", e)))?,
            false,
        )
    } else {
        return Err(UtxoSignerError::new(&format!(
            "invalid signature header: {}",
            recovery_flags
        )));
    };

    let recoverable_sig =
        secp256k1::ecdsa::RecoverableSignature::from_compact(compact_sig, recovery_id)
            .map_err(|e| UtxoSignerError::new(&format!("invalid signature format: {}", e)))?;

    let message_hash = bitcoin_message_hash(message);
    let msg = secp256k1::Message::from_digest(*message_hash.as_ref());

    let secp = Secp256k1::verification_only();
    let recovered = secp
        .recover_ecdsa(&msg, &recoverable_sig)
        .map_err(|e| UtxoSignerError::new(&format!("failed to recover public key: {}", e)))?;

    Ok((recovered, compressed))
}

/// Verify a message signature against a public key.
pub fn verify_message(
    public_key: &PublicKey,
    message: &str,
    signature: &[u8],
) -> Result<bool, UtxoSignerError> {
    let (recovered, _) = recover_public_key(message, signature)?;
    Ok(&recovered == public_key)
}

/// Verify a message signature against a base58check signing address.
///
/// The recovered key is hashed with the compressed flag carried in the
/// signature header, so signatures made over uncompressed keys still verify
/// against their own address form.
pub fn verify_message_with_address(
    address: &str,
    message: &str,
    signature: &[u8],
) -> Result<bool, UtxoSignerError> {
    let (recovered, compressed) = recover_public_key(message, signature)?;

    let payload = base58::decode_check(address)
        .map_err(|e| UtxoSignerError::new(&format!("invalid signing address: {}", e)))?;
    if payload.len() != 21 {
        return Err(UtxoSignerError::new("invalid signing address payload"));
    }

    let key_bytes = if compressed {
        recovered.serialize().to_vec()
    } else {
        recovered.serialize_uncompressed().to_vec()
    };
    let hash = hash160::Hash::hash(&key_bytes);

    Ok(payload[1..21] == hash.to_byte_array())
}
