//! Network table for the bitcoin-like chains the signer supports.
//!
//! Only the parameters the signing and verification engine actually needs are
//! carried here: base58 version bytes and bech32 prefixes for turning
//! recipient addresses into output scripts, plus the per-family flags that
//! gate taproot support and replay protection.

use crate::bitcoin::blockdata::script::Builder;
use crate::bitcoin::hashes::Hash;
use crate::bitcoin::opcodes::all::{OP_CHECKSIG, OP_DUP, OP_EQUAL, OP_EQUALVERIFY, OP_HASH160};
use crate::bitcoin::{base58, PubkeyHash, ScriptBuf, ScriptHash};
use crate::error::UtxoSignerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Bitcoin,
    BitcoinTestnet,
    BitcoinCash,
    BitcoinCashTestnet,
    BitcoinGold,
    BitcoinGoldTestnet,
    BitcoinSV,
    BitcoinSVTestnet,
    Ecash,
    EcashTestnet,
    Dash,
    DashTestnet,
    Dogecoin,
    DogecoinTestnet,
    Litecoin,
    LitecoinTestnet,
}

/// Address-format parameters for a network.
struct AddressParams {
    pubkey_hash: u8,
    script_hash: u8,
    bech32_hrp: Option<&'static str>,
}

impl Network {
    pub fn mainnet(&self) -> Network {
        match self {
            Network::Bitcoin | Network::BitcoinTestnet => Network::Bitcoin,
            Network::BitcoinCash | Network::BitcoinCashTestnet => Network::BitcoinCash,
            Network::BitcoinGold | Network::BitcoinGoldTestnet => Network::BitcoinGold,
            Network::BitcoinSV | Network::BitcoinSVTestnet => Network::BitcoinSV,
            Network::Ecash | Network::EcashTestnet => Network::Ecash,
            Network::Dash | Network::DashTestnet => Network::Dash,
            Network::Dogecoin | Network::DogecoinTestnet => Network::Dogecoin,
            Network::Litecoin | Network::LitecoinTestnet => Network::Litecoin,
        }
    }

    pub fn is_testnet(&self) -> bool {
        *self != self.mainnet()
    }

    /// Taproot outputs (and therefore MuSig2 key path spends) only exist on
    /// the Bitcoin network itself.
    pub fn supports_taproot(&self) -> bool {
        self.mainnet() == Network::Bitcoin
    }

    /// Forked coin families that carry platform-controlled replay protection
    /// inputs in their transactions.
    pub fn uses_replay_protection(&self) -> bool {
        matches!(
            self.mainnet(),
            Network::BitcoinCash | Network::BitcoinGold | Network::BitcoinSV | Network::Ecash
        )
    }

    fn address_params(&self) -> AddressParams {
        match self {
            Network::Bitcoin
            | Network::BitcoinCash
            | Network::BitcoinSV
            | Network::Ecash => AddressParams {
                pubkey_hash: 0x00,
                script_hash: 0x05,
                bech32_hrp: if *self == Network::Bitcoin {
                    Some("bc")
                } else {
                    None
                },
            },
            Network::BitcoinTestnet
            | Network::BitcoinCashTestnet
            | Network::BitcoinSVTestnet
            | Network::EcashTestnet => AddressParams {
                pubkey_hash: 0x6f,
                script_hash: 0xc4,
                bech32_hrp: if *self == Network::BitcoinTestnet {
                    Some("tb")
                } else {
                    None
                },
            },
            Network::BitcoinGold => AddressParams {
                pubkey_hash: 0x26,
                script_hash: 0x17,
                bech32_hrp: Some("btg"),
            },
            Network::BitcoinGoldTestnet => AddressParams {
                pubkey_hash: 0x6f,
                script_hash: 0xc4,
                bech32_hrp: Some("tbtg"),
            },
            Network::Dash => AddressParams {
                pubkey_hash: 0x4c,
                script_hash: 0x10,
                bech32_hrp: None,
            },
            Network::DashTestnet => AddressParams {
                pubkey_hash: 0x8c,
                script_hash: 0x13,
                bech32_hrp: None,
            },
            Network::Dogecoin => AddressParams {
                pubkey_hash: 0x1e,
                script_hash: 0x16,
                bech32_hrp: None,
            },
            Network::DogecoinTestnet => AddressParams {
                pubkey_hash: 0x71,
                script_hash: 0xc4,
                bech32_hrp: None,
            },
            Network::Litecoin => AddressParams {
                pubkey_hash: 0x30,
                script_hash: 0x32,
                bech32_hrp: Some("ltc"),
            },
            Network::LitecoinTestnet => AddressParams {
                pubkey_hash: 0x6f,
                script_hash: 0x3a,
                bech32_hrp: Some("tltc"),
            },
        }
    }
}

/// Convert an address string into an output script for the given network.
///
/// Supports base58check P2PKH/P2SH and, where the network defines a bech32
/// prefix, native segwit v0/v1 programs.
pub fn to_output_script(address: &str, network: Network) -> Result<ScriptBuf, UtxoSignerError> {
    let params = network.address_params();

    if let Ok(payload) = base58::decode_check(address) {
        if payload.len() != 21 {
            return Err(UtxoSignerError::new(&format!(
                "invalid base58 payload length {} for address {}",
                payload.len(),
                address
            )));
        }
        let version = payload[0];
        let hash: [u8; 20] = payload[1..21]
            .try_into()
            .expect("payload length checked above");
        if version == params.pubkey_hash {
            let pkh = PubkeyHash::from_byte_array(hash);
            return Ok(Builder::new()
                .push_opcode(OP_DUP)
                .push_opcode(OP_HASH160)
                .push_slice(pkh)
                .push_opcode(OP_EQUALVERIFY)
                .push_opcode(OP_CHECKSIG)
                .into_script());
        }
        if version == params.script_hash {
            let sh = ScriptHash::from_byte_array(hash);
            return Ok(Builder::new()
                .push_opcode(OP_HASH160)
                .push_slice(sh)
                .push_opcode(OP_EQUAL)
                .into_script());
        }
        return Err(UtxoSignerError::new(&format!(
            "address version byte {:#04x} does not match network {:?}",
            version, network
        )));
    }

    if let Some(hrp) = params.bech32_hrp {
        let (decoded_hrp, witness_version, program) = bech32::segwit::decode(address)
            .map_err(|e| UtxoSignerError::new(&format!("invalid address {}: {}", address, e)))?;
        if decoded_hrp.as_str() != hrp {
            return Err(UtxoSignerError::new(&format!(
                "address prefix {} does not match network {:?}",
                decoded_hrp, network
            )));
        }
        let builder = Builder::new().push_int(witness_version.to_u8() as i64);
        let program: &[u8] = &program;
        let script = match program.len() {
            20 => {
                let bytes: [u8; 20] = program.try_into().expect("length checked");
                builder.push_slice(bytes).into_script()
            }
            32 => {
                let bytes: [u8; 32] = program.try_into().expect("length checked");
                builder.push_slice(bytes).into_script()
            }
            n => {
                return Err(UtxoSignerError::new(&format!(
                    "unsupported witness program length {}",
                    n
                )))
            }
        };
        return Ok(script);
    }

    Err(UtxoSignerError::new(&format!(
        "could not decode address {} for network {:?}",
        address, network
    )))
}

/// Convert an output script into an address string for the given network.
pub fn from_output_script(script: &ScriptBuf, network: Network) -> Result<String, UtxoSignerError> {
    let params = network.address_params();

    if script.is_p2pkh() {
        let hash = &script.as_bytes()[3..23];
        let mut payload = vec![params.pubkey_hash];
        payload.extend_from_slice(hash);
        return Ok(base58::encode_check(&payload));
    }
    if script.is_p2sh() {
        let hash = &script.as_bytes()[2..22];
        let mut payload = vec![params.script_hash];
        payload.extend_from_slice(hash);
        return Ok(base58::encode_check(&payload));
    }
    if script.is_witness_program() {
        let hrp = params.bech32_hrp.ok_or_else(|| {
            UtxoSignerError::new(&format!("network {:?} has no segwit address format", network))
        })?;
        let hrp = bech32::Hrp::parse(hrp)
            .map_err(|e| UtxoSignerError::new(&format!("invalid hrp: {}", e)))?;
        let bytes = script.as_bytes();
        let witness_version = if bytes[0] == 0 { 0u8 } else { bytes[0] - 0x50 };
        let program = &bytes[2..];
        let version = bech32::Fe32::try_from(witness_version)
            .map_err(|e| UtxoSignerError::new(&format!("invalid witness version: {}", e)))?;
        return bech32::segwit::encode(hrp, version, program)
            .map_err(|e| UtxoSignerError::new(&format!("bech32 encoding failed: {}", e)));
    }

    Err(UtxoSignerError::new(
        "output script has no address representation",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Network::Bitcoin, "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH")]
    #[case(Network::Bitcoin, "3P14159f73E4gFr7JterCCQh9QjiTjiZrG")]
    #[case(Network::Litecoin, "LaMT348PWRnrqeeWArpwQPbuanpXDZGEUz")]
    #[case(Network::Dogecoin, "DH5yaieqoZN36fDVciNyRueRGvGLR3mr7L")]
    fn base58_round_trip(#[case] network: Network, #[case] address: &str) {
        let script = to_output_script(address, network).expect("decode");
        let encoded = from_output_script(&script, network).expect("encode");
        assert_eq!(encoded, address);
    }

    #[rstest]
    #[case(Network::Bitcoin, "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4")]
    #[case(
        Network::Bitcoin,
        "bc1qrp33g0q5c5txsp9arysrx4k6zdkfs4nce4xj0gdcccefvpysxf3qccfmv3"
    )]
    fn bech32_round_trip(#[case] network: Network, #[case] address: &str) {
        let script = to_output_script(address, network).expect("decode");
        let encoded = from_output_script(&script, network).expect("encode");
        assert_eq!(encoded, address);
    }

    #[test]
    fn rejects_wrong_network_prefix() {
        // litecoin address on the bitcoin network
        assert!(to_output_script("LaMT348PWRnrqeeWArpwQPbuanpXDZGEUz", Network::Bitcoin).is_err());
    }

    #[test]
    fn mainnet_mapping() {
        assert_eq!(Network::BitcoinTestnet.mainnet(), Network::Bitcoin);
        assert_eq!(Network::BitcoinCashTestnet.mainnet(), Network::BitcoinCash);
        assert!(Network::BitcoinCash.uses_replay_protection());
        assert!(!Network::Bitcoin.uses_replay_protection());
        assert!(Network::Bitcoin.supports_taproot());
        assert!(!Network::Litecoin.supports_taproot());
    }
}
