//! Validation policy for externally supplied wallet descriptors.
//!
//! A descriptor map drives change/external classification for descriptor
//! wallets, so a corrupted or malicious map could reclassify an attacker
//! output as change. Before a descriptor is trusted it must either match a
//! known-safe structural template instantiated with the wallet's key triple,
//! or carry a valid user-key signature over its canonical string.

use std::str::FromStr;

use miniscript::descriptor::{Descriptor, DescriptorPublicKey};
use serde::{Deserialize, Serialize};

use crate::message;
use crate::wallet::RootWalletKeys;

/// A named descriptor as supplied by the wallet data, with optional user-key
/// signatures over the descriptor string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedDescriptor {
    pub name: String,
    pub value: String,
    pub signatures: Option<Vec<String>>,
}

/// Known-safe descriptor shapes, keyed to the wallet's key triple in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorTemplate {
    /// `wsh(multi(2, user/*, backup/*, bitgo/*))`
    Wsh2Of3,
}

impl DescriptorTemplate {
    pub fn name(&self) -> &'static str {
        match self {
            DescriptorTemplate::Wsh2Of3 => "Wsh2Of3",
        }
    }

    fn render(&self, wallet_keys: &RootWalletKeys) -> String {
        match self {
            DescriptorTemplate::Wsh2Of3 => format!(
                "wsh(multi(2,{}/*,{}/*,{}/*))",
                wallet_keys.user_key(),
                wallet_keys.backup_key(),
                wallet_keys.bitgo_key()
            ),
        }
    }

    /// Structural comparison through the parsed descriptor form, so
    /// formatting and checksum differences do not matter.
    fn matches(&self, descriptor: &str, wallet_keys: &RootWalletKeys) -> bool {
        let expected = match Descriptor::<DescriptorPublicKey>::from_str(&self.render(wallet_keys))
        {
            Ok(d) => d,
            Err(_) => return false,
        };
        match Descriptor::<DescriptorPublicKey>::from_str(descriptor) {
            Ok(parsed) => parsed == expected,
            Err(_) => false,
        }
    }
}

/// Composable validation policy for descriptors.
#[derive(Debug, Clone)]
pub enum DescriptorValidationPolicy {
    /// Trust everything (non-production default).
    AllowAll,
    /// Descriptor must equal a known-safe template for this wallet.
    MatchTemplate(DescriptorTemplate),
    /// Descriptor must carry a valid user-key signature.
    SignedByUserKey,
    /// All child policies must accept.
    Every(Vec<DescriptorValidationPolicy>),
    /// At least one child policy must accept.
    AnyOf(Vec<DescriptorValidationPolicy>),
}

impl DescriptorValidationPolicy {
    /// The production policy: a known-safe template, or a user-key
    /// signature. Everything else is rejected.
    pub fn production() -> Self {
        DescriptorValidationPolicy::AnyOf(vec![
            DescriptorValidationPolicy::MatchTemplate(DescriptorTemplate::Wsh2Of3),
            DescriptorValidationPolicy::SignedByUserKey,
        ])
    }

    pub fn for_environment(production: bool) -> Self {
        if production {
            Self::production()
        } else {
            DescriptorValidationPolicy::AllowAll
        }
    }

    pub fn name(&self) -> String {
        match self {
            DescriptorValidationPolicy::AllowAll => "allowAll".to_string(),
            DescriptorValidationPolicy::MatchTemplate(t) => {
                format!("matchTemplate({})", t.name())
            }
            DescriptorValidationPolicy::SignedByUserKey => "signedByUserKey".to_string(),
            DescriptorValidationPolicy::Every(policies) => format!(
                "every({})",
                policies
                    .iter()
                    .map(|p| p.name())
                    .collect::<Vec<_>>()
                    .join(",")
            ),
            DescriptorValidationPolicy::AnyOf(policies) => format!(
                "anyOf({})",
                policies
                    .iter()
                    .map(|p| p.name())
                    .collect::<Vec<_>>()
                    .join(",")
            ),
        }
    }

    fn is_satisfied(&self, descriptor: &NamedDescriptor, wallet_keys: &RootWalletKeys) -> bool {
        match self {
            DescriptorValidationPolicy::AllowAll => true,
            DescriptorValidationPolicy::MatchTemplate(template) => {
                template.matches(&descriptor.value, wallet_keys)
            }
            DescriptorValidationPolicy::SignedByUserKey => {
                let signatures = match &descriptor.signatures {
                    Some(signatures) if !signatures.is_empty() => signatures,
                    _ => return false,
                };
                let signing_address =
                    message::signing_address(&wallet_keys.user_key().public_key);
                signatures.iter().any(|signature| {
                    hex::decode(signature)
                        .ok()
                        .and_then(|bytes| {
                            message::verify_message_with_address(
                                &signing_address,
                                &descriptor.value,
                                &bytes,
                            )
                            .ok()
                        })
                        .unwrap_or(false)
                })
            }
            DescriptorValidationPolicy::Every(policies) => policies
                .iter()
                .all(|p| p.is_satisfied(descriptor, wallet_keys)),
            DescriptorValidationPolicy::AnyOf(policies) => policies
                .iter()
                .any(|p| p.is_satisfied(descriptor, wallet_keys)),
        }
    }

    /// Validate a descriptor set, naming every offending descriptor in the
    /// error.
    pub fn validate(
        &self,
        descriptors: &[NamedDescriptor],
        wallet_keys: &RootWalletKeys,
    ) -> Result<(), DescriptorPolicyError> {
        let offending: Vec<String> = descriptors
            .iter()
            .filter(|d| !self.is_satisfied(d, wallet_keys))
            .map(|d| d.name.clone())
            .collect();
        if offending.is_empty() {
            Ok(())
        } else {
            Err(DescriptorPolicyError {
                policy_name: self.name(),
                descriptor_names: offending,
            })
        }
    }
}

/// Aggregate rejection naming all offending descriptors and the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorPolicyError {
    pub policy_name: String,
    pub descriptor_names: Vec<String>,
}

impl std::fmt::Display for DescriptorPolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "descriptor policy {} rejected descriptors: {}",
            self.policy_name,
            self.descriptor_names.join(", ")
        )
    }
}

impl std::error::Error for DescriptorPolicyError {}
