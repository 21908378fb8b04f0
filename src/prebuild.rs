//! Request types shared by the signing and verification entry points: the
//! transaction prebuild handed back by the platform, and the caller's
//! original transaction parameters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::wallet::WalletUnspent;

/// Side data accompanying a prebuild. PSBT prebuilds carry everything
/// in-band and need none of this; legacy prebuilds need the unspents (and,
/// for non-segwit inputs, the previous transactions) for signing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionInfo {
    /// Wallet unspents, one per transaction input, in input order.
    pub unspents: Option<Vec<WalletUnspent>>,
    /// Maps txid to raw transaction hex. Required for offline signing of
    /// non-segwit inputs.
    #[serde(rename = "txHexes")]
    pub tx_hexes: Option<BTreeMap<String, String>>,
    /// Change addresses of the wallet, used to classify legacy-format
    /// outputs without PSBT derivation metadata.
    #[serde(rename = "changeAddresses")]
    pub change_addresses: Option<Vec<String>>,
}

/// A transaction prebuild returned by the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionPrebuild {
    #[serde(rename = "txHex")]
    pub tx_hex: String,
    #[serde(rename = "txInfo")]
    pub tx_info: Option<TransactionInfo>,
    /// Required when an external signer is used or a cosigner MuSig2 nonce
    /// is requested.
    #[serde(rename = "walletId")]
    pub wallet_id: Option<String>,
}

/// A recipient amount: an exact satoshi value, or `max` for sweep-style
/// sends whose final amount depends on the fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecipientAmount {
    Value(u64),
    Max(MaxAmount),
}

/// The literal string `"max"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaxAmount {
    #[serde(rename = "max")]
    Max,
}

impl RecipientAmount {
    pub const MAX: RecipientAmount = RecipientAmount::Max(MaxAmount::Max);
}

/// One intended recipient of the transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecipient {
    pub address: String,
    pub amount: RecipientAmount,
    /// Absence of this output is tolerated during reconciliation.
    #[serde(default)]
    pub optional: bool,
}

/// The parameters the caller originally passed to send.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionParams {
    #[serde(default)]
    pub recipients: Vec<TransactionRecipient>,
    #[serde(rename = "walletPassphrase")]
    pub wallet_passphrase: Option<String>,
    #[serde(rename = "changeAddress")]
    pub change_address: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_amount_parses_value_and_max() {
        let r: TransactionRecipient =
            serde_json::from_str(r#"{"address": "1abc", "amount": 1000}"#).unwrap();
        assert_eq!(r.amount, RecipientAmount::Value(1000));
        assert!(!r.optional);

        let r: TransactionRecipient =
            serde_json::from_str(r#"{"address": "1abc", "amount": "max", "optional": true}"#)
                .unwrap();
        assert_eq!(r.amount, RecipientAmount::MAX);
        assert!(r.optional);
    }
}
