//! Decomposing a prebuild into a [`ParsedTransaction`]: classify every
//! output as change or external, reconcile against the intended recipients,
//! and compute the spend sums the policy checks run on.

use log::debug;

use crate::networks::{self, Network};
use crate::prebuild::{RecipientAmount, TransactionParams, TransactionPrebuild};
use crate::psbt::{ParsedInput, ParsedOutput, WalletTransaction};
use crate::reconcile::{
    self, external_spend_amount, ComparableOutput, OutputValue, ReconciliationResult,
};
use crate::verify::keysig::KeySignatures;
use crate::verify::VerificationOptions;
use crate::wallet::{root_wallet_keys, CustomChangeOptions, KeychainTriple, ReplayProtection};

/// Everything the verification pipeline needs to know about a prebuild,
/// extracted in one pass. Created fresh per verification call.
pub struct ParsedTransaction {
    pub keychains: KeychainTriple,
    pub key_signatures: KeySignatures,
    /// Every transaction output, classified.
    pub outputs: Vec<ComparableOutput>,
    pub change_outputs: Vec<ComparableOutput>,
    pub missing_outputs: Vec<ComparableOutput>,
    pub explicit_external_outputs: Vec<ComparableOutput>,
    pub implicit_external_outputs: Vec<ComparableOutput>,
    pub explicit_external_spend_amount: u64,
    pub implicit_external_spend_amount: u64,
    pub needs_custom_change_key_signature_verification: bool,
    pub custom_change: Option<CustomChangeOptions>,
    pub total_input_value: u64,
    pub total_output_value: u64,
    pub is_psbt: bool,
}

#[derive(Debug)]
pub enum ParseTransactionError {
    Decode(crate::psbt::DecodeError),
    MissingKeychains(String),
    Keys(String),
    Input { index: usize, error: String },
    Output { index: usize, error: String },
    Recipient { address: String, error: String },
    MissingUnspents,
    ValueOverflow,
}

impl std::fmt::Display for ParseTransactionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseTransactionError::Decode(e) => write!(f, "{}", e),
            ParseTransactionError::MissingKeychains(msg) => write!(f, "{}", msg),
            ParseTransactionError::Keys(msg) => write!(f, "{}", msg),
            ParseTransactionError::Input { index, error } => {
                write!(f, "Input {}: {}", index, error)
            }
            ParseTransactionError::Output { index, error } => {
                write!(f, "Output {}: {}", index, error)
            }
            ParseTransactionError::Recipient { address, error } => {
                write!(f, "Recipient {}: {}", address, error)
            }
            ParseTransactionError::MissingUnspents => {
                write!(f, "missing unspents, cannot compute transaction input value")
            }
            ParseTransactionError::ValueOverflow => write!(f, "value overflow"),
        }
    }
}

impl std::error::Error for ParseTransactionError {}

impl From<crate::psbt::DecodeError> for ParseTransactionError {
    fn from(e: crate::psbt::DecodeError) -> Self {
        ParseTransactionError::Decode(e)
    }
}

fn checked_sum<I: Iterator<Item = u64>>(values: I) -> Result<u64, ParseTransactionError> {
    values.into_iter().try_fold(0u64, |total, v| {
        total
            .checked_add(v)
            .ok_or(ParseTransactionError::ValueOverflow)
    })
}

/// Turn the caller's recipient list into expected comparable outputs.
fn expected_outputs(
    tx_params: &TransactionParams,
    network: Network,
) -> Result<Vec<ComparableOutput>, ParseTransactionError> {
    tx_params
        .recipients
        .iter()
        .map(|recipient| {
            let script = networks::to_output_script(&recipient.address, network).map_err(|e| {
                ParseTransactionError::Recipient {
                    address: recipient.address.clone(),
                    error: e.to_string(),
                }
            })?;
            let value = match recipient.amount {
                RecipientAmount::Value(v) => OutputValue::Exact(v),
                RecipientAmount::Max(_) => OutputValue::Max,
            };
            Ok(ComparableOutput {
                script,
                value,
                external: None,
                optional: recipient.optional,
            })
        })
        .collect()
}

/// Extract and classify all the information the verification checks need.
pub fn parse_transaction(
    prebuild: &TransactionPrebuild,
    tx_params: &TransactionParams,
    options: &VerificationOptions,
    network: Network,
    replay_protection: &ReplayProtection,
) -> Result<ParsedTransaction, ParseTransactionError> {
    let keychains = match &options.keychains {
        Some(keychains) => keychains.clone(),
        None => {
            let message = if options.disable_networking {
                "cannot fetch keychains without networking"
            } else {
                "keychains are required, but could not be fetched"
            };
            return Err(ParseTransactionError::MissingKeychains(message.to_string()));
        }
    };

    let wallet_keys =
        root_wallet_keys(&keychains).map_err(|e| ParseTransactionError::Keys(e.to_string()))?;

    let custom_change = options.custom_change.clone();
    let custom_change_keys = custom_change
        .as_ref()
        .map(|cc| root_wallet_keys(&cc.keys))
        .transpose()
        .map_err(|e| ParseTransactionError::Keys(e.to_string()))?;

    let tx = WalletTransaction::from_hex(&prebuild.tx_hex)?;
    let is_psbt = tx.is_psbt();

    let expected = expected_outputs(tx_params, network)?;

    let mut actual: Vec<ComparableOutput> = Vec::new();
    let mut needs_custom_change_key_signature_verification = false;
    let total_input_value;

    match &tx {
        WalletTransaction::Psbt(psbt) => {
            for (index, (tx_output, psbt_output)) in psbt
                .unsigned_tx
                .output
                .iter()
                .zip(psbt.outputs.iter())
                .enumerate()
            {
                let parsed = ParsedOutput::parse(
                    psbt_output,
                    tx_output,
                    &wallet_keys,
                    custom_change_keys.as_ref(),
                    network,
                )
                .map_err(|error| ParseTransactionError::Output {
                    index,
                    error: error.to_string(),
                })?;

                if parsed.custom_change_script_id.is_some() {
                    debug!(
                        "output {} classified as custom change wallet output",
                        index
                    );
                    needs_custom_change_key_signature_verification = true;
                }

                actual.push(ComparableOutput {
                    script: parsed.script.clone(),
                    value: OutputValue::Exact(parsed.value),
                    external: Some(parsed.is_external()),
                    optional: false,
                });
            }

            // validate the inputs against the wallet keys and sum their
            // values from the utxo data carried in the psbt
            let parsed_inputs: Vec<ParsedInput> = psbt
                .unsigned_tx
                .input
                .iter()
                .zip(psbt.inputs.iter())
                .enumerate()
                .map(|(index, (tx_input, psbt_input))| {
                    ParsedInput::parse(
                        psbt_input,
                        tx_input,
                        &wallet_keys,
                        replay_protection,
                        network,
                    )
                    .map_err(|error| ParseTransactionError::Input {
                        index,
                        error: error.to_string(),
                    })
                })
                .collect::<Result<_, _>>()?;

            total_input_value = checked_sum(parsed_inputs.iter().map(|i| i.value))?;
        }
        WalletTransaction::Legacy(legacy_tx) => {
            let tx_info = prebuild.tx_info.as_ref();
            let change_addresses: Vec<&str> = tx_info
                .and_then(|info| info.change_addresses.as_ref())
                .map(|addresses| addresses.iter().map(String::as_str).collect())
                .unwrap_or_default();

            for tx_output in &legacy_tx.output {
                let address =
                    networks::from_output_script(&tx_output.script_pubkey, network).ok();
                let is_change = address.as_deref().is_some_and(|a| {
                    change_addresses.contains(&a) || tx_params.change_address.as_deref() == Some(a)
                });
                actual.push(ComparableOutput {
                    script: tx_output.script_pubkey.clone(),
                    value: OutputValue::Exact(tx_output.value.to_sat()),
                    external: Some(!is_change),
                    optional: false,
                });
            }

            // without psbt derivation metadata, ownership by the custom
            // change wallet cannot be established locally; require the
            // signatures whenever change exists and a custom change wallet
            // is configured
            if custom_change.is_some() && actual.iter().any(|o| o.external == Some(false)) {
                needs_custom_change_key_signature_verification = true;
            }

            let unspents = tx_info
                .and_then(|info| info.unspents.as_ref())
                .ok_or(ParseTransactionError::MissingUnspents)?;
            total_input_value = checked_sum(unspents.iter().map(|u| u.value))?;
        }
    }

    let total_output_value = checked_sum(actual.iter().filter_map(|o| match o.value {
        OutputValue::Exact(v) => Some(v),
        OutputValue::Max => None,
    }))?;

    let ReconciliationResult {
        explicit_outputs,
        implicit_outputs,
        missing_outputs,
    } = reconcile::reconcile(&actual, &expected);

    let change_outputs: Vec<ComparableOutput> = actual
        .iter()
        .filter(|o| o.external == Some(false))
        .cloned()
        .collect();

    let explicit_external_outputs: Vec<ComparableOutput> = explicit_outputs
        .iter()
        .filter(|o| o.is_external())
        .cloned()
        .collect();
    let implicit_external_outputs: Vec<ComparableOutput> = implicit_outputs
        .iter()
        .filter(|o| o.is_external())
        .cloned()
        .collect();

    let explicit_external_spend_amount = external_spend_amount(&explicit_external_outputs)
        .map_err(|_| ParseTransactionError::ValueOverflow)?;
    let implicit_external_spend_amount = external_spend_amount(&implicit_external_outputs)
        .map_err(|_| ParseTransactionError::ValueOverflow)?;

    Ok(ParsedTransaction {
        keychains,
        key_signatures: options.key_signatures.clone(),
        outputs: actual,
        change_outputs,
        missing_outputs,
        explicit_external_outputs,
        implicit_external_outputs,
        explicit_external_spend_amount,
        implicit_external_spend_amount,
        needs_custom_change_key_signature_verification,
        custom_change,
        total_input_value,
        total_output_value,
        is_psbt,
    })
}
