use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::str::FromStr;

use crate::bitcoin::bip32::{DerivationPath, Fingerprint};
use crate::bitcoin::blockdata::opcodes::all::{OP_CHECKSIG, OP_CHECKSIGVERIFY};
use crate::bitcoin::blockdata::script::Builder;
use crate::bitcoin::secp256k1::Secp256k1;
use crate::bitcoin::taproot::{LeafVersion, TapLeafHash, TaprootBuilder, TaprootSpendInfo};
use crate::bitcoin::{CompressedPublicKey, ScriptBuf, XOnlyPublicKey};
use crate::error::UtxoSignerError;
use crate::wallet::keys::{derivation_path, to_pub_triple, PubTriple, RootWalletKeys};

/// Whether a chain is for receiving (external) or change (internal) addresses.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Scope {
    /// External chains are for receiving addresses (even chain values).
    External,
    /// Internal chains are for change addresses (odd chain values).
    Internal,
}

/// Output script types of the fixed-script 2-of-3 wallets.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum OutputScriptType {
    /// Legacy Pay-To-Script-Hash (chains 0, 1)
    P2sh,
    /// Wrapped-Segwit Pay-To-Script-Hash (chains 10, 11)
    P2shP2wsh,
    /// Native Segwit Pay-To-Witness-Script-Hash (chains 20, 21)
    P2wsh,
    /// Legacy Taproot, script-path only (chains 30, 31)
    P2trLegacy,
    /// Taproot with MuSig2 key-path support (chains 40, 41)
    P2trMusig2,
}

/// Mapping between derivation path component and script type.
///
/// A Chain combines an `OutputScriptType` with a `Scope`; the chain value is
/// used in derivation paths `{prefix}/{chain}/{index}`. External = base,
/// internal = base + 1.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Chain {
    pub script_type: OutputScriptType,
    pub scope: Scope,
}

impl Chain {
    pub const fn new(script_type: OutputScriptType, scope: Scope) -> Self {
        Self { script_type, scope }
    }

    pub const fn value(&self) -> u32 {
        (match self.script_type {
            OutputScriptType::P2sh => 0,
            OutputScriptType::P2shP2wsh => 10,
            OutputScriptType::P2wsh => 20,
            OutputScriptType::P2trLegacy => 30,
            OutputScriptType::P2trMusig2 => 40,
        }) + match self.scope {
            Scope::External => 0,
            Scope::Internal => 1,
        }
    }

    pub fn is_internal(&self) -> bool {
        self.scope == Scope::Internal
    }
}

impl TryFrom<u32> for Chain {
    type Error = UtxoSignerError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        let (script_type, scope) = match value {
            0 => (OutputScriptType::P2sh, Scope::External),
            1 => (OutputScriptType::P2sh, Scope::Internal),
            10 => (OutputScriptType::P2shP2wsh, Scope::External),
            11 => (OutputScriptType::P2shP2wsh, Scope::Internal),
            20 => (OutputScriptType::P2wsh, Scope::External),
            21 => (OutputScriptType::P2wsh, Scope::Internal),
            30 => (OutputScriptType::P2trLegacy, Scope::External),
            31 => (OutputScriptType::P2trLegacy, Scope::Internal),
            40 => (OutputScriptType::P2trMusig2, Scope::External),
            41 => (OutputScriptType::P2trMusig2, Scope::Internal),
            _ => return Err(UtxoSignerError::new(&format!("no chain for {}", value))),
        };
        Ok(Chain::new(script_type, scope))
    }
}

impl FromStr for Chain {
    type Err = UtxoSignerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let chain: u32 =
            u32::from_str(s).map_err(|e| UtxoSignerError::new(&format!("invalid chain: {}", e)))?;
        Chain::try_from(chain)
    }
}

/// Build the 2-of-3 CHECKMULTISIG script for the derived key triple.
pub fn build_multisig_script_2_of_3(keys: &PubTriple) -> ScriptBuf {
    use crate::bitcoin::blockdata::opcodes::all::OP_CHECKMULTISIG;
    let mut builder = Builder::new().push_int(2);
    for key in keys {
        builder = builder.push_slice(key.to_bytes());
    }
    builder.push_int(3).push_opcode(OP_CHECKMULTISIG).into_script()
}

/// Build a single-key `<pubkey> OP_CHECKSIG` script (used wrapped in P2SH for
/// replay protection inputs).
pub fn build_p2pk_script(key: &CompressedPublicKey) -> ScriptBuf {
    Builder::new()
        .push_slice(key.to_bytes())
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

fn to_xonly_pubkey(key: CompressedPublicKey) -> [u8; 32] {
    let bytes = key.to_bytes();
    let mut xonly = [0u8; 32];
    xonly.copy_from_slice(&bytes[1..]);
    xonly
}

/// Build an n-of-n checksig chain script for a taproot leaf.
pub fn build_tap_ns_script(keys: &[CompressedPublicKey]) -> ScriptBuf {
    let mut builder = Builder::default();
    for (i, key) in keys.iter().enumerate() {
        builder = builder.push_slice(to_xonly_pubkey(*key));
        if i == keys.len() - 1 {
            builder = builder.push_opcode(OP_CHECKSIG);
        } else {
            builder = builder.push_opcode(OP_CHECKSIGVERIFY);
        }
    }
    builder.into_script()
}

struct TapLeaf {
    depth: u8,
    keys: [CompressedPublicKey; 2],
}

/// Tap leaf configuration for the 2-of-3 wallets.
///
/// For the MuSig2 variant: 2 leaves at depth 1 (user+backup, backup+bitgo);
/// the user+bitgo pair spends via the aggregated key path instead.
///
/// For the script-path-only variant: user+bitgo at depth 1, user+backup and
/// backup+bitgo at depth 2.
fn get_tap_leaves(keys: &PubTriple, is_musig2: bool) -> Vec<TapLeaf> {
    let [user, backup, bitgo] = *keys;

    if is_musig2 {
        vec![
            TapLeaf {
                depth: 1,
                keys: [user, backup],
            },
            TapLeaf {
                depth: 1,
                keys: [backup, bitgo],
            },
        ]
    } else {
        vec![
            TapLeaf {
                depth: 1,
                keys: [user, bitgo],
            },
            TapLeaf {
                depth: 2,
                keys: [user, backup],
            },
            TapLeaf {
                depth: 2,
                keys: [backup, bitgo],
            },
        ]
    }
}

/// Aggregate the user and bitgo keys into the taproot internal key (BIP-327).
pub fn aggregate_internal_key(keys: [CompressedPublicKey; 2]) -> Result<[u8; 32], UtxoSignerError> {
    let points = keys
        .iter()
        .map(|k| {
            musig2::secp::Point::try_from(&k.to_bytes()[..])
                .map_err(|_| UtxoSignerError::new("invalid participant public key"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let ctx = musig2::KeyAggContext::new(points)
        .map_err(|e| UtxoSignerError::new(&format!("key aggregation failed: {}", e)))?;
    let aggregated: musig2::secp::Point = ctx.aggregated_pubkey();
    Ok(aggregated.serialize_xonly())
}

fn build_taproot_builder(keys: &PubTriple, is_musig2: bool) -> TaprootBuilder {
    let mut builder = TaprootBuilder::new();
    for leaf in get_tap_leaves(keys, is_musig2) {
        let script = build_tap_ns_script(&leaf.keys);
        builder = builder.add_leaf(leaf.depth, script).expect("valid leaf");
    }
    builder
}

fn build_p2tr_spend_info(keys: &PubTriple, is_musig2: bool) -> Result<TaprootSpendInfo, UtxoSignerError> {
    let secp = Secp256k1::new();
    let [user, _backup, bitgo] = *keys;

    let agg_key_bytes = aggregate_internal_key([user, bitgo])?;
    let internal_key = XOnlyPublicKey::from_slice(&agg_key_bytes)
        .map_err(|e| UtxoSignerError::new(&format!("invalid aggregated key: {}", e)))?;

    build_taproot_builder(keys, is_musig2)
        .finalize(&secp, internal_key)
        .map_err(|_| UtxoSignerError::new("could not finalize tap tree"))
}

#[derive(Debug)]
pub struct ScriptP2sh {
    pub redeem_script: ScriptBuf,
}

#[derive(Debug)]
pub struct ScriptP2shP2wsh {
    pub redeem_script: ScriptBuf,
    pub witness_script: ScriptBuf,
}

#[derive(Debug)]
pub struct ScriptP2wsh {
    pub witness_script: ScriptBuf,
}

#[derive(Debug)]
pub struct ScriptP2tr {
    pub spend_info: TaprootSpendInfo,
}

impl ScriptP2tr {
    pub fn new(keys: &PubTriple, is_musig2: bool) -> Result<ScriptP2tr, UtxoSignerError> {
        Ok(ScriptP2tr {
            spend_info: build_p2tr_spend_info(keys, is_musig2)?,
        })
    }

    pub fn output_script(&self) -> ScriptBuf {
        let output_key = self.spend_info.output_key().to_x_only_public_key();
        Builder::new()
            .push_int(1)
            .push_slice(output_key.serialize())
            .into_script()
    }

    pub fn internal_key(&self) -> XOnlyPublicKey {
        self.spend_info.internal_key()
    }
}

/// Single-key P2SH(P2PK) script, the shape of replay protection outputs.
#[derive(Debug, Clone)]
pub struct ScriptP2shP2pk {
    pub redeem_script: ScriptBuf,
}

impl ScriptP2shP2pk {
    pub fn new(key: CompressedPublicKey) -> Self {
        Self {
            redeem_script: build_p2pk_script(&key),
        }
    }

    pub fn output_script(&self) -> ScriptBuf {
        self.redeem_script.to_p2sh()
    }
}

/// Spending scripts of a fixed-script wallet address.
#[derive(Debug)]
pub enum WalletScripts {
    P2sh(ScriptP2sh),
    P2shP2wsh(ScriptP2shP2wsh),
    P2wsh(ScriptP2wsh),
    P2trLegacy(ScriptP2tr),
    P2trMusig2(ScriptP2tr),
}

impl std::fmt::Display for WalletScripts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WalletScripts::P2sh(_) => "P2sh",
            WalletScripts::P2shP2wsh(_) => "P2shP2wsh",
            WalletScripts::P2wsh(_) => "P2wsh",
            WalletScripts::P2trLegacy(_) => "P2trLegacy",
            WalletScripts::P2trMusig2(_) => "P2trMusig2",
        };
        write!(f, "{}", name)
    }
}

impl WalletScripts {
    pub fn new(keys: &PubTriple, chain: Chain) -> Result<WalletScripts, UtxoSignerError> {
        match chain.script_type {
            OutputScriptType::P2sh => {
                let script = build_multisig_script_2_of_3(keys);
                Ok(WalletScripts::P2sh(ScriptP2sh {
                    redeem_script: script,
                }))
            }
            OutputScriptType::P2shP2wsh => {
                let script = build_multisig_script_2_of_3(keys);
                Ok(WalletScripts::P2shP2wsh(ScriptP2shP2wsh {
                    redeem_script: script.clone().to_p2wsh(),
                    witness_script: script,
                }))
            }
            OutputScriptType::P2wsh => {
                let script = build_multisig_script_2_of_3(keys);
                Ok(WalletScripts::P2wsh(ScriptP2wsh {
                    witness_script: script,
                }))
            }
            OutputScriptType::P2trLegacy => {
                Ok(WalletScripts::P2trLegacy(ScriptP2tr::new(keys, false)?))
            }
            OutputScriptType::P2trMusig2 => {
                Ok(WalletScripts::P2trMusig2(ScriptP2tr::new(keys, true)?))
            }
        }
    }

    pub fn from_wallet_keys(
        wallet_keys: &RootWalletKeys,
        chain: Chain,
        index: u32,
    ) -> Result<WalletScripts, UtxoSignerError> {
        let derived_keys = wallet_keys.derive_for_chain_and_index(chain.value(), index)?;
        WalletScripts::new(&to_pub_triple(&derived_keys), chain)
    }

    pub fn output_script(&self) -> ScriptBuf {
        match self {
            WalletScripts::P2sh(script) => script.redeem_script.to_p2sh(),
            WalletScripts::P2shP2wsh(script) => script.redeem_script.to_p2sh(),
            WalletScripts::P2wsh(script) => script.witness_script.to_p2wsh(),
            WalletScripts::P2trLegacy(script) => script.output_script(),
            WalletScripts::P2trMusig2(script) => script.output_script(),
        }
    }
}

pub type TapKeyOriginMap =
    BTreeMap<XOnlyPublicKey, (Vec<TapLeafHash>, (Fingerprint, DerivationPath))>;

/// Tap key origins for a taproot wallet address: each key maps to the leaf
/// hashes of the leaves it participates in, plus its derivation source.
pub fn create_tap_key_origins(
    wallet_keys: &RootWalletKeys,
    chain: u32,
    index: u32,
    pub_triple: &PubTriple,
    is_musig2: bool,
) -> Result<TapKeyOriginMap, UtxoSignerError> {
    let leaf_data: Vec<([CompressedPublicKey; 2], TapLeafHash)> =
        get_tap_leaves(pub_triple, is_musig2)
            .into_iter()
            .map(|leaf| {
                let script = build_tap_ns_script(&leaf.keys);
                let hash = TapLeafHash::from_script(&script, LeafVersion::TapScript);
                (leaf.keys, hash)
            })
            .collect();

    let mut map = BTreeMap::new();
    for (i, key) in pub_triple.iter().enumerate() {
        let xpub = &wallet_keys.xpubs[i];
        let path = derivation_path(&wallet_keys.derivation_prefixes[i], chain, index);
        let (x_only, _parity) = key.0.x_only_public_key();

        let key_leaf_hashes: Vec<TapLeafHash> = leaf_data
            .iter()
            .filter(|(leaf_keys, _)| leaf_keys.contains(key))
            .map(|(_, hash)| *hash)
            .collect();

        map.insert(x_only, (key_leaf_hashes, (xpub.fingerprint(), path)));
    }
    Ok(map)
}
