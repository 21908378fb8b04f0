//! Verification of the message signatures binding the wallet keys together:
//! the user key signs the backup and platform public keys at wallet creation
//! (and the custom change triple, when one is configured), which prevents
//! key substitution after the fact.

use log::debug;

use crate::error::UtxoSignerError;
use crate::message;
use crate::prebuild::TransactionParams;
use crate::wallet::{Keychain, KeychainDecrypter, KeyRole};

/// Key signatures supplied with the wallet data.
#[derive(Debug, Clone, Default)]
pub struct KeySignatures {
    pub backup_pub: Option<String>,
    pub bitgo_pub: Option<String>,
}

impl KeySignatures {
    pub fn is_empty(&self) -> bool {
        self.backup_pub.is_none() && self.bitgo_pub.is_none()
    }
}

/// Verify a signature produced by the user key over another keychain's
/// public key.
///
/// The signing address is derived from the user public key with the fixed
/// mainnet prefix regardless of the wallet's network (a convention, not a
/// consensus rule). Malformed signatures return `Ok(false)`; absent required
/// fields are an error.
pub fn verify_key_signature(
    user_keychain: &Keychain,
    keychain_to_verify: &Keychain,
    key_signature: &str,
) -> Result<bool, UtxoSignerError> {
    let user_xpub = user_keychain
        .pub_key
        .as_deref()
        .ok_or_else(|| UtxoSignerError::new("user keychain is required"))
        .and_then(|_| user_keychain.xpub())?;

    let pub_to_verify = keychain_to_verify
        .pub_key
        .as_deref()
        .ok_or_else(|| UtxoSignerError::new("keychain to verify is required"))?;

    if key_signature.is_empty() {
        return Err(UtxoSignerError::new("key signature is required"));
    }

    let signing_address = message::signing_address(&user_xpub.public_key);

    let signature = match hex::decode(key_signature) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("key signature is not valid hex: {}", e);
            return Ok(false);
        }
    };

    match message::verify_message_with_address(&signing_address, pub_to_verify, &signature) {
        Ok(valid) => Ok(valid),
        Err(e) => {
            debug!("error verifying key signature: {}", e);
            Ok(false)
        }
    }
}

/// Verify that the claimed user public key is backed by an available private
/// key.
///
/// The private key is taken directly from the keychain, or decrypted through
/// the injected decrypter with the caller's wallet passphrase. When it
/// cannot be obtained, the result is `false` if networking is disabled and
/// an error otherwise. An obtained key must be private and must match the
/// claimed public key; mismatches are errors.
pub fn verify_user_public_key(
    user_keychain: &Keychain,
    tx_params: &TransactionParams,
    disable_networking: bool,
    decrypter: Option<&dyn KeychainDecrypter>,
) -> Result<bool, UtxoSignerError> {
    let user_pub = user_keychain
        .pub_key
        .as_deref()
        .ok_or_else(|| UtxoSignerError::new("user keychain is required"))?;

    let mut user_prv = user_keychain.prv.clone();
    if user_prv.is_none() {
        if let (Some(encrypted), Some(passphrase), Some(decrypter)) = (
            user_keychain.encrypted_prv.as_deref(),
            tx_params.wallet_passphrase.as_deref(),
            decrypter,
        ) {
            user_prv = Some(decrypter.decrypt(encrypted, passphrase)?);
        }
    }

    let user_prv = match user_prv {
        Some(prv) => prv,
        None => {
            let message = "user private key unavailable for verification";
            if disable_networking {
                debug!("{}", message);
                return Ok(false);
            }
            return Err(UtxoSignerError::new(message));
        }
    };

    use crate::bitcoin::bip32::{Xpriv, Xpub};
    use std::str::FromStr;

    let user_private_key = match Xpriv::from_str(&user_prv) {
        Ok(xpriv) => xpriv,
        Err(_) => {
            if Xpub::from_str(&user_prv).is_ok() {
                return Err(UtxoSignerError::new("user private key is only public"));
            }
            return Err(UtxoSignerError::new("user private key is invalid"));
        }
    };

    let secp = crate::bitcoin::secp256k1::Secp256k1::new();
    let derived_pub = Xpub::from_priv(&secp, &user_private_key);
    if derived_pub.to_string() != user_pub {
        return Err(UtxoSignerError::new(
            "user private key does not match public key",
        ));
    }

    Ok(true)
}

/// Verify the user-key signatures over a custom change key triple. All three
/// roles must have both a key and a signature (else an error); each
/// signature must verify (else `false`).
pub fn verify_custom_change_key_signatures(
    custom_change: &crate::wallet::CustomChangeOptions,
    user_keychain: &Keychain,
) -> Result<bool, UtxoSignerError> {
    for role in KeyRole::ALL {
        let keychain_to_verify = &custom_change.keys[role.index()];
        let key_signature = &custom_change.signatures[role.index()];

        if keychain_to_verify.pub_key.is_none() {
            return Err(UtxoSignerError::new(&format!(
                "missing required custom change {} keychain public key",
                role.name()
            )));
        }
        if key_signature.is_empty() {
            return Err(UtxoSignerError::new(&format!(
                "missing required custom change {} keychain signature",
                role.name()
            )));
        }

        if !verify_key_signature(user_keychain, keychain_to_verify, key_signature)? {
            debug!("failed to verify custom change {} key signature", role.name());
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::keys::tests::{get_test_wallet_keys, get_test_wallet_xprvs};
    use crate::wallet::CustomChangeOptions;

    fn sign_pub_with_user_key(seed: &str, pub_to_sign: &str) -> String {
        let user_xprv = get_test_wallet_xprvs(seed)[0];
        hex::encode(message::sign_message(&user_xprv.private_key, pub_to_sign))
    }

    fn keychain_triple(seed: &str) -> [Keychain; 3] {
        let keys = get_test_wallet_keys(seed);
        [
            Keychain::from_pub(&keys.user_key().to_string()),
            Keychain::from_pub(&keys.backup_key().to_string()),
            Keychain::from_pub(&keys.bitgo_key().to_string()),
        ]
    }

    #[test]
    fn key_signature_round_trip() {
        let [user, backup, _] = keychain_triple("keysig");
        let signature = sign_pub_with_user_key("keysig", backup.pub_key.as_deref().unwrap());

        assert!(verify_key_signature(&user, &backup, &signature).unwrap());
    }

    #[test]
    fn flipped_byte_invalidates_signature() {
        let [user, backup, _] = keychain_triple("keysig-flip");
        let signature = sign_pub_with_user_key("keysig-flip", backup.pub_key.as_deref().unwrap());

        let mut bytes = hex::decode(&signature).unwrap();
        bytes[20] ^= 0x01;
        let tampered = hex::encode(bytes);

        assert!(!verify_key_signature(&user, &backup, &tampered).unwrap());
    }

    #[test]
    fn different_user_key_invalidates_signature() {
        let [_, backup, _] = keychain_triple("keysig-a");
        let [other_user, _, _] = keychain_triple("keysig-b");
        let signature = sign_pub_with_user_key("keysig-a", backup.pub_key.as_deref().unwrap());

        assert!(!verify_key_signature(&other_user, &backup, &signature).unwrap());
    }

    #[test]
    fn garbage_signature_is_false_not_error() {
        let [user, backup, _] = keychain_triple("keysig-garbage");
        assert!(!verify_key_signature(&user, &backup, "not-hex").unwrap());
        assert!(!verify_key_signature(&user, &backup, "00ff00ff").unwrap());
    }

    #[test]
    fn missing_fields_are_errors() {
        let [user, backup, _] = keychain_triple("keysig-missing");
        assert!(verify_key_signature(&Keychain::default(), &backup, "00").is_err());
        assert!(verify_key_signature(&user, &Keychain::default(), "00").is_err());
        assert!(verify_key_signature(&user, &backup, "").is_err());
    }

    #[test]
    fn user_public_key_matches_private_key() {
        let keys = get_test_wallet_keys("userpub");
        let user_xprv = get_test_wallet_xprvs("userpub")[0];
        let user = Keychain {
            pub_key: Some(keys.user_key().to_string()),
            prv: Some(user_xprv.to_string()),
            encrypted_prv: None,
        };
        assert!(
            verify_user_public_key(&user, &TransactionParams::default(), false, None).unwrap()
        );
    }

    #[test]
    fn user_public_key_mismatch_is_an_error() {
        let keys = get_test_wallet_keys("userpub-a");
        let other_xprv = get_test_wallet_xprvs("userpub-b")[0];
        let user = Keychain {
            pub_key: Some(keys.user_key().to_string()),
            prv: Some(other_xprv.to_string()),
            encrypted_prv: None,
        };
        let err =
            verify_user_public_key(&user, &TransactionParams::default(), false, None).unwrap_err();
        assert!(err.message().contains("does not match"));
    }

    #[test]
    fn unavailable_private_key_depends_on_networking() {
        let keys = get_test_wallet_keys("userpub-unavailable");
        let user = Keychain::from_pub(&keys.user_key().to_string());

        // networking disabled: degrade to false
        assert!(
            !verify_user_public_key(&user, &TransactionParams::default(), true, None).unwrap()
        );
        // networking enabled: error
        assert!(verify_user_public_key(&user, &TransactionParams::default(), false, None).is_err());
    }

    #[test]
    fn public_only_prv_is_an_error() {
        let keys = get_test_wallet_keys("userpub-neutered");
        let user = Keychain {
            pub_key: Some(keys.user_key().to_string()),
            prv: Some(keys.user_key().to_string()),
            encrypted_prv: None,
        };
        let err =
            verify_user_public_key(&user, &TransactionParams::default(), false, None).unwrap_err();
        assert!(err.message().contains("only public"));
    }

    #[test]
    fn custom_change_signatures_verify() {
        let [user, _, _] = keychain_triple("cc-wallet");
        let change_keys = keychain_triple("cc-change");
        let signatures: [String; 3] = std::array::from_fn(|i| {
            sign_pub_with_user_key("cc-wallet", change_keys[i].pub_key.as_deref().unwrap())
        });
        let custom_change = CustomChangeOptions {
            keys: change_keys,
            signatures,
        };
        assert!(verify_custom_change_key_signatures(&custom_change, &user).unwrap());
    }

    #[test]
    fn custom_change_missing_signature_is_an_error() {
        let [user, _, _] = keychain_triple("cc-wallet2");
        let change_keys = keychain_triple("cc-change2");
        let custom_change = CustomChangeOptions {
            keys: change_keys,
            signatures: [String::new(), String::new(), String::new()],
        };
        assert!(verify_custom_change_key_signatures(&custom_change, &user).is_err());
    }

    #[test]
    fn custom_change_wrong_signature_is_false() {
        let [user, _, _] = keychain_triple("cc-wallet3");
        let change_keys = keychain_triple("cc-change3");
        // signatures made by the wrong user key
        let signatures: [String; 3] = std::array::from_fn(|i| {
            sign_pub_with_user_key("cc-other", change_keys[i].pub_key.as_deref().unwrap())
        });
        let custom_change = CustomChangeOptions {
            keys: change_keys,
            signatures,
        };
        assert!(!verify_custom_change_key_signatures(&custom_change, &user).unwrap());
    }
}
