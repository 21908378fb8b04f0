use std::convert::TryFrom;

use crate::bitcoin::psbt::Output;
use crate::bitcoin::{ScriptBuf, TxOut};
use crate::networks::{self, Network};
use crate::psbt::input::{
    get_output_derivation_paths, is_bip32_derivation_for_wallet, is_tap_key_origins_for_wallet,
    parse_shared_derivation_path, ScriptId,
};
use crate::wallet::{Chain, RootWalletKeys, WalletScripts};

/// Parsed output of a PSBT transaction, classified against the wallet keys.
#[derive(Debug, Clone)]
pub struct ParsedOutput {
    pub address: Option<String>,
    pub script: ScriptBuf,
    pub value: u64,
    /// Set when the output belongs to the primary wallet.
    pub script_id: Option<ScriptId>,
    /// Set when the output belongs to the custom change wallet instead.
    pub custom_change_script_id: Option<ScriptId>,
}

impl ParsedOutput {
    /// Parse a PSBT output, classifying it against the wallet keys and, when
    /// configured, the custom change wallet keys.
    pub fn parse(
        psbt_output: &Output,
        tx_output: &TxOut,
        wallet_keys: &RootWalletKeys,
        custom_change_keys: Option<&RootWalletKeys>,
        network: Network,
    ) -> Result<Self, ParseOutputError> {
        let script = &tx_output.script_pubkey;

        let script_id = match_output_to_wallet(wallet_keys, psbt_output, script)
            .map_err(ParseOutputError::WalletMatch)?;

        let custom_change_script_id = match (script_id, custom_change_keys) {
            (None, Some(keys)) => match_output_to_wallet(keys, psbt_output, script)
                .map_err(ParseOutputError::WalletMatch)?,
            _ => None,
        };

        let address = networks::from_output_script(script, network).ok();

        Ok(Self {
            address,
            script: script.clone(),
            value: tx_output.value.to_sat(),
            script_id,
            custom_change_script_id,
        })
    }

    /// True if the output belongs to neither the wallet nor the custom change
    /// wallet.
    pub fn is_external(&self) -> bool {
        self.script_id.is_none() && self.custom_change_script_id.is_none()
    }
}

#[derive(Debug)]
pub enum ParseOutputError {
    /// Failed to match output to wallet (corruption or validation error)
    WalletMatch(String),
}

impl std::fmt::Display for ParseOutputError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseOutputError::WalletMatch(error) => write!(f, "{}", error),
        }
    }
}

impl std::error::Error for ParseOutputError {}

/// Try to match an output script to wallet keys using PSBT output metadata.
/// Returns `Some(ScriptId)` when the script belongs to the wallet.
///
/// - no derivation info: external output (None)
/// - derivation fingerprints of another wallet: external output (None)
/// - derivation matches the wallet but the script does not: corruption, error
fn match_output_to_wallet(
    wallet_keys: &RootWalletKeys,
    psbt_output: &Output,
    script: &ScriptBuf,
) -> Result<Option<ScriptId>, String> {
    if psbt_output.bip32_derivation.is_empty() && psbt_output.tap_key_origins.is_empty() {
        return Ok(None);
    }

    let belongs_to_wallet = if !psbt_output.bip32_derivation.is_empty() {
        is_bip32_derivation_for_wallet(wallet_keys, &psbt_output.bip32_derivation)
    } else {
        is_tap_key_origins_for_wallet(wallet_keys, &psbt_output.tap_key_origins)
    };

    if !belongs_to_wallet {
        return Ok(None);
    }

    let derivation_paths = get_output_derivation_paths(psbt_output);
    let (chain, index) = parse_shared_derivation_path(&derivation_paths)
        .map_err(|e| format!("Failed to parse output derivation path: {}", e))?;

    let chain_enum =
        Chain::try_from(chain).map_err(|e| format!("Invalid chain value {}: {}", chain, e))?;

    let derived_scripts = WalletScripts::from_wallet_keys(wallet_keys, chain_enum, index)
        .map_err(|e| format!("Failed to derive wallet scripts: {}", e))?;

    if derived_scripts.output_script().as_script() == script.as_script() {
        Ok(Some(ScriptId { chain, index }))
    } else {
        Err(format!(
            "Output script mismatch: wallet keys match at chain={}, index={} but script differs. Expected: {}, Got: {}",
            chain, index,
            derived_scripts.output_script(),
            script
        ))
    }
}
