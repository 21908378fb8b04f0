use std::convert::TryInto;
use std::str::FromStr;

use crate::bitcoin::bip32::{ChildNumber, DerivationPath, Xpub};
use crate::bitcoin::secp256k1::Secp256k1;
use crate::bitcoin::CompressedPublicKey;
use crate::error::UtxoSignerError;

pub type XpubTriple = [Xpub; 3];

pub type PubTriple = [CompressedPublicKey; 3];

/// The three roles of the wallet key triple, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    User,
    Backup,
    Bitgo,
}

impl KeyRole {
    pub const ALL: [KeyRole; 3] = [KeyRole::User, KeyRole::Backup, KeyRole::Bitgo];

    pub fn index(&self) -> usize {
        match self {
            KeyRole::User => 0,
            KeyRole::Backup => 1,
            KeyRole::Bitgo => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            KeyRole::User => "user",
            KeyRole::Backup => "backup",
            KeyRole::Bitgo => "bitgo",
        }
    }
}

pub fn to_pub_triple(xpubs: &XpubTriple) -> PubTriple {
    xpubs
        .iter()
        .map(|x| x.to_pub())
        .collect::<Vec<_>>()
        .try_into()
        .expect("could not convert vec to array")
}

pub fn derivation_path(prefix: &DerivationPath, chain: u32, index: u32) -> DerivationPath {
    prefix
        .child(ChildNumber::Normal { index: chain })
        .child(ChildNumber::Normal { index })
}

/// The root extended public keys of a wallet, one per role, with their
/// derivation prefixes. Address-level keys are derived at
/// `{prefix}/{chain}/{index}`.
#[derive(Debug, Clone)]
pub struct RootWalletKeys {
    pub xpubs: XpubTriple,
    pub derivation_prefixes: [DerivationPath; 3],
}

impl RootWalletKeys {
    pub fn new_with_derivation_prefixes(
        xpubs: XpubTriple,
        derivation_prefixes: [DerivationPath; 3],
    ) -> Self {
        Self {
            xpubs,
            derivation_prefixes,
        }
    }

    pub fn new(xpubs: XpubTriple) -> Self {
        let prefix = DerivationPath::from_str("m/0/0").unwrap();
        Self::new_with_derivation_prefixes(xpubs, [prefix.clone(), prefix.clone(), prefix])
    }

    /// Parse a triple of base58 xpub strings in role order.
    pub fn from_base58(pubs: &[String; 3]) -> Result<Self, UtxoSignerError> {
        let xpubs = pubs
            .iter()
            .map(|p| {
                Xpub::from_str(p)
                    .map_err(|e| UtxoSignerError::new(&format!("invalid xpub {}: {}", p, e)))
            })
            .collect::<Result<Vec<_>, _>>()?
            .try_into()
            .map_err(|_| UtxoSignerError::new("expected exactly 3 xpubs"))?;
        Ok(Self::new(xpubs))
    }

    pub fn key_for_role(&self, role: KeyRole) -> &Xpub {
        &self.xpubs[role.index()]
    }

    pub fn user_key(&self) -> &Xpub {
        self.key_for_role(KeyRole::User)
    }

    pub fn backup_key(&self) -> &Xpub {
        self.key_for_role(KeyRole::Backup)
    }

    pub fn bitgo_key(&self) -> &Xpub {
        self.key_for_role(KeyRole::Bitgo)
    }

    pub fn derive_for_chain_and_index(
        &self,
        chain: u32,
        index: u32,
    ) -> Result<XpubTriple, UtxoSignerError> {
        let paths: Vec<DerivationPath> = self
            .derivation_prefixes
            .iter()
            .map(|p| derivation_path(p, chain, index))
            .collect();

        let ctx = Secp256k1::new();

        self.xpubs
            .iter()
            .zip(paths.iter())
            .map(|(x, p)| {
                x.derive_pub(&ctx, p)
                    .map_err(|e| UtxoSignerError::new(&format!("error deriving xpub: {}", e)))
            })
            .collect::<Result<Vec<_>, _>>()?
            .try_into()
            .map_err(|_| UtxoSignerError::new("expected exactly 3 derived xpubs"))
    }
}
