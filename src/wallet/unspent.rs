use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bitcoin::{OutPoint, Txid};
use crate::error::UtxoSignerError;

/// An unspent output as supplied by the wallet or a recovery scan.
/// The id is the `"<txid>:<vout>"` form used throughout the platform APIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unspent {
    pub id: String,
    pub address: String,
    pub value: u64,
}

/// An unspent that belongs to the wallet, carrying its derivation identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletUnspent {
    pub id: String,
    pub address: String,
    pub value: u64,
    pub chain: u32,
    pub index: u32,
}

impl WalletUnspent {
    pub fn as_unspent(&self) -> Unspent {
        Unspent {
            id: self.id.clone(),
            address: self.address.clone(),
            value: self.value,
        }
    }
}

/// Parse a `"<txid>:<vout>"` unspent id into an outpoint.
pub fn parse_outpoint(id: &str) -> Result<OutPoint, UtxoSignerError> {
    let (txid, vout) = id
        .split_once(':')
        .ok_or_else(|| UtxoSignerError::new(&format!("invalid unspent id: {}", id)))?;
    let txid = Txid::from_str(txid)
        .map_err(|e| UtxoSignerError::new(&format!("invalid txid in unspent id: {}", e)))?;
    let vout = u32::from_str(vout)
        .map_err(|e| UtxoSignerError::new(&format!("invalid vout in unspent id: {}", e)))?;
    Ok(OutPoint { txid, vout })
}

/// Format an outpoint as a `"<txid>:<vout>"` unspent id.
pub fn format_outpoint(outpoint: &OutPoint) -> String {
    format!("{}:{}", outpoint.txid, outpoint.vout)
}
