//! Shared fixture builders for the signing and verification tests.

use std::collections::BTreeMap;

use crate::bitcoin::absolute::LockTime;
use crate::bitcoin::bip32::KeySource;
use crate::bitcoin::psbt::Psbt;
use crate::bitcoin::transaction::Version;
use crate::bitcoin::{
    Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use crate::networks::{self, Network};
use crate::psbt::musig2_input::Musig2Participants;
use crate::psbt::propkv::insert_kv;
use crate::wallet::keys::tests::{get_test_wallet_keys, get_test_wallet_xprvs, XprivTriple};
use crate::wallet::{
    create_tap_key_origins, derivation_path, to_pub_triple, Chain, ReplayProtection,
    RootWalletKeys, WalletScripts, WalletUnspent,
};

pub const FUNDING_TXID: &str = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

/// A fixed external recipient address (mainnet P2PKH).
pub const EXTERNAL_ADDRESS: &str = "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH";

pub fn external_script() -> ScriptBuf {
    networks::to_output_script(EXTERNAL_ADDRESS, Network::Bitcoin).unwrap()
}

pub fn funding_outpoint(vout: u32) -> OutPoint {
    OutPoint {
        txid: FUNDING_TXID.parse::<Txid>().unwrap(),
        vout,
    }
}

pub fn unsigned_tx(num_inputs: usize, outputs: Vec<TxOut>) -> Transaction {
    let input = (0..num_inputs)
        .map(|i| TxIn {
            previous_output: funding_outpoint(i as u32),
            script_sig: Default::default(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        })
        .collect();
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input,
        output: outputs,
    }
}

pub struct TestWallet {
    pub keys: RootWalletKeys,
    pub xprvs: XprivTriple,
}

impl TestWallet {
    pub fn new(seed: &str) -> Self {
        Self {
            keys: get_test_wallet_keys(seed),
            xprvs: get_test_wallet_xprvs(seed),
        }
    }

    pub fn user_prv(&self) -> String {
        self.xprvs[0].to_string()
    }

    pub fn bitgo_prv(&self) -> String {
        self.xprvs[2].to_string()
    }

    pub fn pubs(&self) -> [String; 3] {
        [
            self.keys.user_key().to_string(),
            self.keys.backup_key().to_string(),
            self.keys.bitgo_key().to_string(),
        ]
    }

    pub fn output_script(&self, chain: u32, index: u32) -> ScriptBuf {
        WalletScripts::from_wallet_keys(&self.keys, Chain::try_from(chain).unwrap(), index)
            .unwrap()
            .output_script()
    }

    pub fn address(&self, chain: u32, index: u32) -> String {
        networks::from_output_script(&self.output_script(chain, index), Network::Bitcoin).unwrap()
    }

    pub fn unspent(&self, chain: u32, index: u32, value: u64, vout: u32) -> WalletUnspent {
        WalletUnspent {
            id: format!("{}:{}", FUNDING_TXID, vout),
            address: self.address(chain, index),
            value,
            chain,
            index,
        }
    }

    /// A PSBT spending the given wallet unspents to the given outputs, with
    /// all per-input wallet metadata filled in.
    pub fn psbt(&self, inputs: &[(u32, u32, u64)], outputs: Vec<TxOut>) -> Psbt {
        let unspents: Vec<WalletUnspent> = inputs
            .iter()
            .enumerate()
            .map(|(vout, &(chain, index, value))| self.unspent(chain, index, value, vout as u32))
            .collect();
        let tx = unsigned_tx(inputs.len(), outputs);
        crate::psbt::from_legacy_transaction(
            tx,
            &unspents,
            &self.keys,
            &ReplayProtection::none(),
            &BTreeMap::new(),
            Network::Bitcoin,
        )
        .unwrap()
    }

    /// Turn a taproot MuSig2 input produced by [`Self::psbt`] into key path
    /// form: drop the leaf scripts and attach the participants key-value.
    pub fn make_key_path_input(&self, psbt: &mut Psbt, input_index: usize, chain: u32, index: u32) {
        let derived = self.keys.derive_for_chain_and_index(chain, index).unwrap();
        let pub_triple = to_pub_triple(&derived);

        let scripts =
            WalletScripts::from_wallet_keys(&self.keys, Chain::try_from(chain).unwrap(), index)
                .unwrap();
        let spend_info = match &scripts {
            WalletScripts::P2trMusig2(s) => &s.spend_info,
            _ => panic!("expected a p2trMusig2 chain"),
        };

        let input = &mut psbt.inputs[input_index];
        input.tap_scripts.clear();

        let participants = Musig2Participants {
            tap_output_key: spend_info.output_key().to_x_only_public_key(),
            tap_internal_key: spend_info.internal_key(),
            participant_pub_keys: [pub_triple[0], pub_triple[2]],
        };
        insert_kv(&mut input.proprietary, &participants.to_key_value());
    }

    /// Attach wallet derivation metadata to a PSBT output so that it
    /// classifies as change.
    pub fn add_change_metadata(&self, psbt: &mut Psbt, output_index: usize, chain: u32, index: u32) {
        let derived = self.keys.derive_for_chain_and_index(chain, index).unwrap();
        let pub_triple = to_pub_triple(&derived);
        let chain_enum = Chain::try_from(chain).unwrap();

        match chain_enum.script_type {
            crate::wallet::OutputScriptType::P2trLegacy
            | crate::wallet::OutputScriptType::P2trMusig2 => {
                let is_musig2 = matches!(
                    chain_enum.script_type,
                    crate::wallet::OutputScriptType::P2trMusig2
                );
                psbt.outputs[output_index].tap_key_origins =
                    create_tap_key_origins(&self.keys, chain, index, &pub_triple, is_musig2)
                        .unwrap();
            }
            _ => {
                let map: BTreeMap<crate::bitcoin::secp256k1::PublicKey, KeySource> = pub_triple
                    .iter()
                    .zip(self.keys.xpubs.iter())
                    .zip(self.keys.derivation_prefixes.iter())
                    .map(|((pubkey, xpub), prefix)| {
                        (
                            pubkey.0,
                            (xpub.fingerprint(), derivation_path(prefix, chain, index)),
                        )
                    })
                    .collect();
                psbt.outputs[output_index].bip32_derivation = map;
            }
        }
    }
}

pub fn tx_out(script: ScriptBuf, value: u64) -> TxOut {
    TxOut {
        value: Amount::from_sat(value),
        script_pubkey: script,
    }
}
