//! The transaction verification pipeline: parse, key verification, output
//! reconciliation policy, PAYGO limit, and fee sanity. Single pass, no
//! retries; the first violated policy aborts the call.

pub mod keysig;
mod parse;

pub use keysig::{
    verify_custom_change_key_signatures, verify_key_signature, verify_user_public_key,
    KeySignatures,
};
pub use parse::{parse_transaction, ParseTransactionError, ParsedTransaction};

use log::{debug, warn};

use crate::error::UtxoSignerError;
use crate::networks::Network;
use crate::prebuild::{TransactionParams, TransactionPrebuild};
use crate::wallet::{CustomChangeOptions, KeychainDecrypter, KeychainTriple, ReplayProtection};

/// The maximum share of implicit external spend relative to explicit
/// external spend, in basis points, when PAYGO outputs are allowed.
pub const MAX_PAYGO_BASIS_POINTS: u64 = 150;

const BASIS_POINTS_DENOMINATOR: u64 = 10_000;

/// Caller-supplied verification parameters.
#[derive(Debug, Clone, Default)]
pub struct VerificationOptions {
    /// Disallow any behavior that would require fetching data remotely.
    pub disable_networking: bool,
    /// The wallet keychain triple. Fetching by id is the caller's concern;
    /// verification fails without them.
    pub keychains: Option<KeychainTriple>,
    /// User-key signatures over the backup and platform public keys.
    pub key_signatures: KeySignatures,
    /// Allowing PAYGO outputs is the default; only an explicit `false`
    /// drops the limit to zero.
    pub allow_paygo_output: Option<bool>,
    /// Custom change wallet configuration, when the wallet has one.
    pub custom_change: Option<CustomChangeOptions>,
}

#[derive(Debug)]
pub enum VerifyError {
    Parse(ParseTransactionError),
    InvalidPrebuild(String),
    /// Backup or platform key signature did not validate
    SecondaryKeySignaturesInvalid,
    /// Custom change verification requires a verified user public key
    UserPublicKeyUnverified,
    /// Custom change key signatures did not validate
    CustomChangeSignaturesInvalid,
    /// Custom change verification data missing or malformed
    CustomChange(UtxoSignerError),
    /// Recipients absent from the prebuild
    MissingOutputs { count: usize },
    /// Implicit external spend exceeds the PAYGO limit
    UnintendedExternalRecipients {
        implicit_external_spend_amount: u64,
        pay_as_you_go_limit_basis_points: u64,
        explicit_external_spend_amount: u64,
    },
    /// Outputs spend more than the inputs provide
    SpendExceedsInputs {
        input_amount: u64,
        output_amount: u64,
    },
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyError::Parse(e) => write!(f, "{}", e),
            VerifyError::InvalidPrebuild(msg) => write!(f, "{}", msg),
            VerifyError::SecondaryKeySignaturesInvalid => {
                write!(f, "secondary public key signatures invalid")
            }
            VerifyError::UserPublicKeyUnverified => {
                write!(
                    f,
                    "transaction requires verification of user public key, but it was unable \
                     to be verified"
                )
            }
            VerifyError::CustomChangeSignaturesInvalid => {
                write!(
                    f,
                    "transaction requires verification of custom change key signatures, but \
                     they were unable to be verified"
                )
            }
            VerifyError::CustomChange(e) => write!(f, "{}", e),
            VerifyError::MissingOutputs { count } => {
                write!(
                    f,
                    "expected outputs missing in transaction prebuild ({} missing)",
                    count
                )
            }
            VerifyError::UnintendedExternalRecipients {
                implicit_external_spend_amount,
                pay_as_you_go_limit_basis_points,
                explicit_external_spend_amount,
            } => {
                write!(
                    f,
                    "prebuild attempts to spend to unintended external recipients \
                     (implicit external spend {} exceeds {} bps of explicit external spend {})",
                    implicit_external_spend_amount,
                    pay_as_you_go_limit_basis_points,
                    explicit_external_spend_amount
                )
            }
            VerifyError::SpendExceedsInputs {
                input_amount,
                output_amount,
            } => {
                write!(
                    f,
                    "attempting to spend {} satoshis, which exceeds the input amount \
                     ({} satoshis) by {}",
                    output_amount,
                    input_amount,
                    output_amount - input_amount
                )
            }
        }
    }
}

impl std::error::Error for VerifyError {}

impl From<ParseTransactionError> for VerifyError {
    fn from(e: ParseTransactionError) -> Self {
        VerifyError::Parse(e)
    }
}

/// The PAYGO ceiling in basis points. Permissive by default; zero only when
/// the caller explicitly disallows PAYGO outputs.
fn pay_as_you_go_limit_basis_points(allow_paygo_output: Option<bool>) -> u64 {
    match allow_paygo_output {
        Some(false) => 0,
        _ => MAX_PAYGO_BASIS_POINTS,
    }
}

/// Verify that a transaction prebuild complies with the original intention.
///
/// Returns `Ok(true)` on success; every failure is a typed error naming the
/// violated policy.
pub fn verify_transaction(
    prebuild: &TransactionPrebuild,
    tx_params: &TransactionParams,
    options: &VerificationOptions,
    network: Network,
    replay_protection: &ReplayProtection,
    decrypter: Option<&dyn KeychainDecrypter>,
) -> Result<bool, VerifyError> {
    let parsed = parse_transaction(prebuild, tx_params, options, network, replay_protection)?;

    if parsed.is_psbt
        && prebuild
            .tx_info
            .as_ref()
            .is_some_and(|info| info.unspents.is_some())
    {
        return Err(VerifyError::InvalidPrebuild(
            "should not have unspents in txInfo for psbt".to_string(),
        ));
    }

    let user_keychain = &parsed.keychains[0];

    // verify that the claimed user public key corresponds to the wallet's
    // user private key
    let user_public_key_verified = match keysig::verify_user_public_key(
        user_keychain,
        tx_params,
        options.disable_networking,
        decrypter,
    ) {
        Ok(verified) => verified,
        Err(e) => {
            debug!("failed to verify user public key: {}", e);
            false
        }
    };

    if !parsed.key_signatures.is_empty() {
        let verify = |keychain: &crate::wallet::Keychain, signature: &Option<String>| -> bool {
            let signature = match signature.as_deref() {
                Some(s) => s,
                None => return false,
            };
            keysig::verify_key_signature(user_keychain, keychain, signature).unwrap_or(false)
        };
        let backup_valid = verify(&parsed.keychains[1], &parsed.key_signatures.backup_pub);
        let bitgo_valid = verify(&parsed.keychains[2], &parsed.key_signatures.bitgo_pub);
        if !backup_valid || !bitgo_valid {
            return Err(VerifyError::SecondaryKeySignaturesInvalid);
        }
        debug!("successfully verified backup and bitgo key signatures");
    } else if !options.disable_networking {
        // these keys were obtained online and their signatures were not
        // verified; flag the reduced trust
        warn!("unsigned keys obtained online are being used for address verification");
    }

    if parsed.needs_custom_change_key_signature_verification {
        if !user_public_key_verified {
            return Err(VerifyError::UserPublicKeyUnverified);
        }
        let custom_change = parsed.custom_change.as_ref().ok_or_else(|| {
            VerifyError::CustomChange(UtxoSignerError::new(
                "parsed transaction is missing required custom change verification data",
            ))
        })?;
        match keysig::verify_custom_change_key_signatures(custom_change, user_keychain) {
            Ok(true) => {
                debug!("successfully verified user public key and custom change key signatures")
            }
            Ok(false) => return Err(VerifyError::CustomChangeSignaturesInvalid),
            Err(e) => return Err(VerifyError::CustomChange(e)),
        }
    }

    if !parsed.missing_outputs.is_empty() {
        // some outputs in the recipients list have not made it into the
        // actual transaction
        return Err(VerifyError::MissingOutputs {
            count: parsed.missing_outputs.len(),
        });
    }

    // the implicit external spend can only be the platform's
    // pay-as-you-go fee; bound it relative to the explicit external spend
    let limit_bps = pay_as_you_go_limit_basis_points(options.allow_paygo_output);
    debug!(
        "intended spend is {}, non-change amount is {}, paygo limit is {} bps",
        parsed.explicit_external_spend_amount, parsed.implicit_external_spend_amount, limit_bps
    );
    let over_limit = (parsed.implicit_external_spend_amount as u128)
        * (BASIS_POINTS_DENOMINATOR as u128)
        > (parsed.explicit_external_spend_amount as u128) * (limit_bps as u128);
    if over_limit {
        let unverifiable_custom_change = parsed.custom_change.is_some()
            && parsed.is_psbt
            && !parsed.needs_custom_change_key_signature_verification;
        if unverifiable_custom_change {
            // the other wallet's addresses cannot be re-derived locally, so
            // its change appears external here; accepted trust gap
            warn!(
                "implicit external spend {} exceeds the PAYGO limit, but the prebuild \
                 belongs to a custom change wallet whose addresses cannot be verified \
                 locally; proceeding",
                parsed.implicit_external_spend_amount
            );
        } else {
            return Err(VerifyError::UnintendedExternalRecipients {
                implicit_external_spend_amount: parsed.implicit_external_spend_amount,
                pay_as_you_go_limit_basis_points: limit_bps,
                explicit_external_spend_amount: parsed.explicit_external_spend_amount,
            });
        }
    }

    // recompute the fee from the input data rather than trusting the
    // prebuild
    if parsed.total_output_value > parsed.total_input_value {
        return Err(VerifyError::SpendExceedsInputs {
            input_amount: parsed.total_input_value,
            output_amount: parsed.total_output_value,
        });
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcoin::ScriptBuf;
    use crate::message;
    use crate::prebuild::{
        RecipientAmount, TransactionInfo, TransactionPrebuild, TransactionRecipient,
    };
    use crate::psbt::WalletTransaction;
    use crate::test_utils::{external_script, tx_out, TestWallet, EXTERNAL_ADDRESS};
    use crate::wallet::{Keychain, KeychainTriple};

    fn keychain_triple(wallet: &TestWallet) -> KeychainTriple {
        let pubs = wallet.pubs();
        [
            Keychain::from_pub(&pubs[0]),
            Keychain::from_pub(&pubs[1]),
            Keychain::from_pub(&pubs[2]),
        ]
    }

    fn offline_options(wallet: &TestWallet) -> VerificationOptions {
        VerificationOptions {
            disable_networking: true,
            keychains: Some(keychain_triple(wallet)),
            ..Default::default()
        }
    }

    fn psbt_prebuild(psbt: &crate::bitcoin::Psbt) -> TransactionPrebuild {
        TransactionPrebuild {
            tx_hex: hex::encode(psbt.serialize()),
            tx_info: None,
            wallet_id: None,
        }
    }

    fn recipients(list: &[(&str, RecipientAmount)]) -> TransactionParams {
        TransactionParams {
            recipients: list
                .iter()
                .map(|(address, amount)| TransactionRecipient {
                    address: address.to_string(),
                    amount: *amount,
                    optional: false,
                })
                .collect(),
            ..Default::default()
        }
    }

    fn verify(
        prebuild: &TransactionPrebuild,
        tx_params: &TransactionParams,
        options: &VerificationOptions,
    ) -> Result<bool, VerifyError> {
        verify_transaction(
            prebuild,
            tx_params,
            options,
            Network::Bitcoin,
            &ReplayProtection::none(),
            None,
        )
    }

    /// One wallet input, an explicit external recipient, an optional
    /// implicit external output (the platform fee), and a change output
    /// with full derivation metadata.
    fn spend_fixture(
        wallet: &TestWallet,
        explicit_amount: u64,
        implicit_amount: Option<u64>,
        paygo_script: ScriptBuf,
    ) -> crate::bitcoin::Psbt {
        let mut outputs = vec![tx_out(external_script(), explicit_amount)];
        if let Some(amount) = implicit_amount {
            outputs.push(tx_out(paygo_script, amount));
        }
        let change_script = wallet.output_script(21, 0);
        outputs.push(tx_out(change_script, 50_000));

        let mut psbt = wallet.psbt(&[(20, 0, 100_000)], outputs);
        let change_index = psbt.unsigned_tx.output.len() - 1;
        wallet.add_change_metadata(&mut psbt, change_index, 21, 0);
        psbt
    }

    fn paygo_script() -> ScriptBuf {
        // any script that is neither the recipient's nor the wallet's
        TestWallet::new("paygo-destination").output_script(20, 7)
    }

    #[test]
    fn accepts_exact_spend_with_change() {
        let wallet = TestWallet::new("verify-ok");
        let psbt = spend_fixture(&wallet, 10_000, None, paygo_script());
        let params = recipients(&[(EXTERNAL_ADDRESS, RecipientAmount::Value(10_000))]);
        assert!(verify(&psbt_prebuild(&psbt), &params, &offline_options(&wallet)).unwrap());
    }

    #[test]
    fn paygo_boundary_at_150_basis_points() {
        let wallet = TestWallet::new("verify-paygo");
        let params = recipients(&[(EXTERNAL_ADDRESS, RecipientAmount::Value(10_000))]);

        // exactly at the limit: 150 bps of 10000 = 150
        let psbt = spend_fixture(&wallet, 10_000, Some(150), paygo_script());
        assert!(verify(&psbt_prebuild(&psbt), &params, &offline_options(&wallet)).unwrap());

        // one satoshi over
        let psbt = spend_fixture(&wallet, 10_000, Some(151), paygo_script());
        let err =
            verify(&psbt_prebuild(&psbt), &params, &offline_options(&wallet)).unwrap_err();
        assert!(matches!(
            err,
            VerifyError::UnintendedExternalRecipients { .. }
        ));
        assert!(err
            .to_string()
            .contains("prebuild attempts to spend to unintended external recipients"));
    }

    #[test]
    fn disallowing_paygo_outputs_drops_the_limit_to_zero() {
        let wallet = TestWallet::new("verify-paygo-off");
        let params = recipients(&[(EXTERNAL_ADDRESS, RecipientAmount::Value(10_000))]);
        let psbt = spend_fixture(&wallet, 10_000, Some(1), paygo_script());

        let mut options = offline_options(&wallet);
        options.allow_paygo_output = Some(false);
        assert!(matches!(
            verify(&psbt_prebuild(&psbt), &params, &options),
            Err(VerifyError::UnintendedExternalRecipients { .. })
        ));
    }

    #[test]
    fn missing_recipient_output_fails() {
        let wallet = TestWallet::new("verify-missing");
        // the prebuild pays only change, not the recipient
        let change_script = wallet.output_script(21, 1);
        let mut psbt = wallet.psbt(&[(20, 0, 100_000)], vec![tx_out(change_script, 99_000)]);
        wallet.add_change_metadata(&mut psbt, 0, 21, 1);

        let params = recipients(&[(EXTERNAL_ADDRESS, RecipientAmount::Value(10_000))]);
        let err =
            verify(&psbt_prebuild(&psbt), &params, &offline_options(&wallet)).unwrap_err();
        assert!(matches!(err, VerifyError::MissingOutputs { count: 1 }));
    }

    #[test]
    fn max_recipient_matches_any_amount() {
        let wallet = TestWallet::new("verify-max");
        let psbt = spend_fixture(&wallet, 42_123, None, paygo_script());
        let params = recipients(&[(EXTERNAL_ADDRESS, RecipientAmount::MAX)]);
        assert!(verify(&psbt_prebuild(&psbt), &params, &offline_options(&wallet)).unwrap());
    }

    #[test]
    fn absent_max_recipient_is_still_missing_unless_optional() {
        let wallet = TestWallet::new("verify-max-missing");
        let change_script = wallet.output_script(21, 0);
        let mut psbt = wallet.psbt(&[(20, 0, 100_000)], vec![tx_out(change_script, 99_000)]);
        wallet.add_change_metadata(&mut psbt, 0, 21, 0);

        let params = recipients(&[(EXTERNAL_ADDRESS, RecipientAmount::MAX)]);
        assert!(matches!(
            verify(&psbt_prebuild(&psbt), &params, &offline_options(&wallet)),
            Err(VerifyError::MissingOutputs { count: 1 })
        ));

        let mut params = params;
        params.recipients[0].optional = true;
        assert!(verify(&psbt_prebuild(&psbt), &params, &offline_options(&wallet)).unwrap());
    }

    #[test]
    fn spend_exceeding_inputs_fails_fee_check() {
        let wallet = TestWallet::new("verify-fee");
        let psbt = wallet.psbt(&[(20, 0, 1_000)], vec![tx_out(external_script(), 1_001)]);
        let params = recipients(&[(EXTERNAL_ADDRESS, RecipientAmount::Value(1_001))]);
        let err =
            verify(&psbt_prebuild(&psbt), &params, &offline_options(&wallet)).unwrap_err();
        match err {
            VerifyError::SpendExceedsInputs {
                input_amount,
                output_amount,
            } => {
                assert_eq!(input_amount, 1_000);
                assert_eq!(output_amount, 1_001);
            }
            other => panic!("expected fee failure, got {:?}", other),
        }

        // zero fee is acceptable
        let psbt = wallet.psbt(&[(20, 0, 1_000)], vec![tx_out(external_script(), 1_000)]);
        let params = recipients(&[(EXTERNAL_ADDRESS, RecipientAmount::Value(1_000))]);
        assert!(verify(&psbt_prebuild(&psbt), &params, &offline_options(&wallet)).unwrap());
    }

    #[test]
    fn valid_key_signatures_pass_and_tampered_ones_fail() {
        let wallet = TestWallet::new("verify-keysig");
        let psbt = spend_fixture(&wallet, 10_000, None, paygo_script());
        let params = recipients(&[(EXTERNAL_ADDRESS, RecipientAmount::Value(10_000))]);

        let pubs = wallet.pubs();
        let sign = |message: &str| {
            hex::encode(crate::message::sign_message(
                &wallet.xprvs[0].private_key,
                message,
            ))
        };

        let mut options = offline_options(&wallet);
        options.key_signatures = KeySignatures {
            backup_pub: Some(sign(&pubs[1])),
            bitgo_pub: Some(sign(&pubs[2])),
        };
        assert!(verify(&psbt_prebuild(&psbt), &params, &options).unwrap());

        // tamper with the backup signature
        let mut bytes = hex::decode(options.key_signatures.backup_pub.as_ref().unwrap()).unwrap();
        bytes[30] ^= 0x01;
        options.key_signatures.backup_pub = Some(hex::encode(bytes));
        assert!(matches!(
            verify(&psbt_prebuild(&psbt), &params, &options),
            Err(VerifyError::SecondaryKeySignaturesInvalid)
        ));

        // a missing signature is just as fatal once any are present
        options.key_signatures.backup_pub = None;
        assert!(matches!(
            verify(&psbt_prebuild(&psbt), &params, &options),
            Err(VerifyError::SecondaryKeySignaturesInvalid)
        ));
    }

    fn custom_change_fixture(
        wallet: &TestWallet,
        change_wallet: &TestWallet,
    ) -> (crate::bitcoin::Psbt, crate::wallet::CustomChangeOptions) {
        let mut psbt = wallet.psbt(
            &[(20, 0, 100_000)],
            vec![
                tx_out(external_script(), 10_000),
                tx_out(change_wallet.output_script(21, 0), 80_000),
            ],
        );
        change_wallet.add_change_metadata(&mut psbt, 1, 21, 0);

        let cc_pubs = change_wallet.pubs();
        let signatures: [String; 3] = std::array::from_fn(|i| {
            hex::encode(message::sign_message(
                &wallet.xprvs[0].private_key,
                &cc_pubs[i],
            ))
        });
        let custom_change = crate::wallet::CustomChangeOptions {
            keys: [
                Keychain::from_pub(&cc_pubs[0]),
                Keychain::from_pub(&cc_pubs[1]),
                Keychain::from_pub(&cc_pubs[2]),
            ],
            signatures,
        };
        (psbt, custom_change)
    }

    #[test]
    fn custom_change_outputs_verify_with_signed_key_triple() {
        let wallet = TestWallet::new("verify-cc");
        let change_wallet = TestWallet::new("verify-cc-change");
        let (psbt, custom_change) = custom_change_fixture(&wallet, &change_wallet);

        let mut options = offline_options(&wallet);
        options.custom_change = Some(custom_change);
        // user public key verification is required for custom change
        options.keychains.as_mut().unwrap()[0] = Keychain {
            pub_key: Some(wallet.pubs()[0].clone()),
            prv: Some(wallet.user_prv()),
            encrypted_prv: None,
        };

        let params = recipients(&[(EXTERNAL_ADDRESS, RecipientAmount::Value(10_000))]);
        assert!(verify(&psbt_prebuild(&psbt), &params, &options).unwrap());
    }

    #[test]
    fn custom_change_requires_verified_user_public_key() {
        let wallet = TestWallet::new("verify-cc-nouser");
        let change_wallet = TestWallet::new("verify-cc-nouser-change");
        let (psbt, custom_change) = custom_change_fixture(&wallet, &change_wallet);

        let mut options = offline_options(&wallet);
        options.custom_change = Some(custom_change);
        // no private key available, so the user public key stays unverified

        let params = recipients(&[(EXTERNAL_ADDRESS, RecipientAmount::Value(10_000))]);
        assert!(matches!(
            verify(&psbt_prebuild(&psbt), &params, &options),
            Err(VerifyError::UserPublicKeyUnverified)
        ));
    }

    #[test]
    fn custom_change_with_wrong_signatures_fails() {
        let wallet = TestWallet::new("verify-cc-bad");
        let change_wallet = TestWallet::new("verify-cc-bad-change");
        let (psbt, mut custom_change) = custom_change_fixture(&wallet, &change_wallet);

        // signatures from an unrelated key
        let rogue = TestWallet::new("verify-cc-rogue");
        let cc_pubs = change_wallet.pubs();
        custom_change.signatures = std::array::from_fn(|i| {
            hex::encode(message::sign_message(&rogue.xprvs[0].private_key, &cc_pubs[i]))
        });

        let mut options = offline_options(&wallet);
        options.custom_change = Some(custom_change);
        options.keychains.as_mut().unwrap()[0] = Keychain {
            pub_key: Some(wallet.pubs()[0].clone()),
            prv: Some(wallet.user_prv()),
            encrypted_prv: None,
        };

        let params = recipients(&[(EXTERNAL_ADDRESS, RecipientAmount::Value(10_000))]);
        assert!(matches!(
            verify(&psbt_prebuild(&psbt), &params, &options),
            Err(VerifyError::CustomChangeSignaturesInvalid)
        ));
    }

    #[test]
    fn unverifiable_custom_change_paygo_overage_is_tolerated() {
        let wallet = TestWallet::new("verify-cc-gap");
        let change_wallet = TestWallet::new("verify-cc-gap-change");

        // the psbt carries no derivation info for the change wallet's
        // output, so it classifies as implicit external spend
        let psbt = wallet.psbt(
            &[(20, 0, 100_000)],
            vec![
                tx_out(external_script(), 10_000),
                tx_out(change_wallet.output_script(21, 0), 80_000),
            ],
        );

        let params = recipients(&[(EXTERNAL_ADDRESS, RecipientAmount::Value(10_000))]);

        // without custom change configured this is a hard failure
        assert!(matches!(
            verify(&psbt_prebuild(&psbt), &params, &offline_options(&wallet)),
            Err(VerifyError::UnintendedExternalRecipients { .. })
        ));

        // with it, the documented trust gap applies: log and proceed
        let (_, custom_change) = custom_change_fixture(&wallet, &change_wallet);
        let mut options = offline_options(&wallet);
        options.custom_change = Some(custom_change);
        assert!(verify(&psbt_prebuild(&psbt), &params, &options).unwrap());
    }

    #[test]
    fn psbt_prebuild_must_not_carry_unspents() {
        let wallet = TestWallet::new("verify-psbt-unspents");
        let psbt = spend_fixture(&wallet, 10_000, None, paygo_script());
        let mut prebuild = psbt_prebuild(&psbt);
        prebuild.tx_info = Some(TransactionInfo {
            unspents: Some(vec![wallet.unspent(20, 0, 100_000, 0)]),
            ..Default::default()
        });

        let params = recipients(&[(EXTERNAL_ADDRESS, RecipientAmount::Value(10_000))]);
        assert!(matches!(
            verify(&prebuild, &params, &offline_options(&wallet)),
            Err(VerifyError::InvalidPrebuild(_))
        ));
    }

    #[test]
    fn missing_keychains_is_an_error() {
        let wallet = TestWallet::new("verify-nokeys");
        let psbt = spend_fixture(&wallet, 10_000, None, paygo_script());
        let options = VerificationOptions {
            disable_networking: true,
            ..Default::default()
        };
        let params = recipients(&[(EXTERNAL_ADDRESS, RecipientAmount::Value(10_000))]);
        let err = verify(&psbt_prebuild(&psbt), &params, &options).unwrap_err();
        assert!(err.to_string().contains("cannot fetch keychains"));
    }

    #[test]
    fn legacy_prebuild_classifies_change_by_address_list() {
        let wallet = TestWallet::new("verify-legacy");
        let change_address = wallet.address(1, 0);
        let change_script = wallet.output_script(1, 0);

        let tx = crate::test_utils::unsigned_tx(
            1,
            vec![
                tx_out(external_script(), 10_000),
                tx_out(change_script, 85_000),
            ],
        );
        let prebuild = TransactionPrebuild {
            tx_hex: WalletTransaction::Legacy(tx).to_hex(),
            tx_info: Some(TransactionInfo {
                unspents: Some(vec![wallet.unspent(1, 0, 100_000, 0)]),
                change_addresses: Some(vec![change_address]),
                ..Default::default()
            }),
            wallet_id: None,
        };

        let params = recipients(&[(EXTERNAL_ADDRESS, RecipientAmount::Value(10_000))]);
        assert!(verify(&prebuild, &params, &offline_options(&wallet)).unwrap());

        // without the change address list the change output counts as
        // implicit external spend and blows the paygo limit
        let mut prebuild_no_change = prebuild.clone();
        prebuild_no_change.tx_info.as_mut().unwrap().change_addresses = None;
        assert!(matches!(
            verify(&prebuild_no_change, &params, &offline_options(&wallet)),
            Err(VerifyError::UnintendedExternalRecipients { .. })
        ));
    }
}
