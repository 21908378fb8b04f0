use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bitcoin::bip32::Xpub;
use crate::error::UtxoSignerError;
use crate::wallet::keys::{KeyRole, RootWalletKeys};

/// A wallet key as supplied by the wallet/keychain storage layer.
///
/// `pub_key` is the base58 xpub. The private key may be present in the clear
/// (`prv`) or encrypted (`encrypted_prv`); decryption is the storage layer's
/// concern, reached through [`KeychainDecrypter`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Keychain {
    #[serde(rename = "pub")]
    pub pub_key: Option<String>,
    pub prv: Option<String>,
    #[serde(rename = "encryptedPrv")]
    pub encrypted_prv: Option<String>,
}

impl Keychain {
    pub fn from_pub(pub_key: &str) -> Self {
        Self {
            pub_key: Some(pub_key.to_string()),
            prv: None,
            encrypted_prv: None,
        }
    }

    pub fn xpub(&self) -> Result<Xpub, UtxoSignerError> {
        let pub_key = self
            .pub_key
            .as_deref()
            .ok_or_else(|| UtxoSignerError::new("keychain has no public key"))?;
        Xpub::from_str(pub_key)
            .map_err(|e| UtxoSignerError::new(&format!("invalid keychain xpub: {}", e)))
    }
}

/// The wallet's key triple in role order (user, backup, bitgo).
pub type KeychainTriple = [Keychain; 3];

/// Build root wallet keys from a keychain triple.
pub fn root_wallet_keys(keychains: &KeychainTriple) -> Result<RootWalletKeys, UtxoSignerError> {
    let pubs: Vec<String> = keychains
        .iter()
        .enumerate()
        .map(|(i, k)| {
            k.pub_key.clone().ok_or_else(|| {
                UtxoSignerError::new(&format!(
                    "missing public key for {} keychain",
                    KeyRole::ALL[i].name()
                ))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let pubs: [String; 3] = pubs.try_into().expect("triple length");
    RootWalletKeys::from_base58(&pubs)
}

/// An alternate key triple authorized, via user-key signatures, to own change
/// outputs instead of the primary wallet triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomChangeOptions {
    pub keys: KeychainTriple,
    pub signatures: [String; 3],
}

/// Storage-layer decryption of an encrypted private key. The ciphertext
/// format is owned by the wallet layer; the signer only needs the resulting
/// base58 xprv.
pub trait KeychainDecrypter {
    fn decrypt(&self, encrypted_prv: &str, passphrase: &str) -> Result<String, UtxoSignerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::keys::tests::get_test_wallet_keys;

    #[test]
    fn root_wallet_keys_from_triple() {
        let keys = get_test_wallet_keys("keychain");
        let triple: KeychainTriple = [
            Keychain::from_pub(&keys.user_key().to_string()),
            Keychain::from_pub(&keys.backup_key().to_string()),
            Keychain::from_pub(&keys.bitgo_key().to_string()),
        ];
        let root = root_wallet_keys(&triple).expect("parse triple");
        assert_eq!(root.xpubs, keys.xpubs);
    }

    #[test]
    fn missing_pub_is_an_error() {
        let triple: KeychainTriple = [Keychain::default(), Keychain::default(), Keychain::default()];
        let err = root_wallet_keys(&triple).unwrap_err();
        assert!(err.message().contains("user"));
    }
}
