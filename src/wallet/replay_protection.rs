use crate::bitcoin::{CompressedPublicKey, ScriptBuf};
use crate::networks::{self, Network};
use crate::wallet::scripts::ScriptP2shP2pk;
use crate::wallet::unspent::Unspent;

/// The fixed, platform-only output scripts that forked coin families use to
/// prevent cross-chain replay. These are single-key `sh(pk(..))` scripts that
/// are never part of the wallet's multisig; the platform signs them out of
/// band, so the signer and the verifier must skip them everywhere.
#[derive(Debug, Clone, Default)]
pub struct ReplayProtection {
    pub permitted_output_scripts: Vec<ScriptBuf>,
}

impl ReplayProtection {
    pub fn new(permitted_output_scripts: Vec<ScriptBuf>) -> Self {
        Self {
            permitted_output_scripts,
        }
    }

    /// No replay protection; the configuration for networks whose coin family
    /// defines no fixed scripts.
    pub fn none() -> Self {
        Self::default()
    }

    /// Create from public keys by deriving the P2SH-P2PK output scripts.
    pub fn from_public_keys(public_keys: Vec<CompressedPublicKey>) -> Self {
        let output_scripts = public_keys
            .into_iter()
            .map(|key| ScriptP2shP2pk::new(key).output_script())
            .collect();
        Self {
            permitted_output_scripts: output_scripts,
        }
    }

    /// Build from the per-network key table supplied by the coin adapter.
    /// Networks outside the replay-protection coin families always get the
    /// empty configuration, whatever the caller passes.
    pub fn for_network(network: Network, public_keys: Vec<CompressedPublicKey>) -> Self {
        if network.uses_replay_protection() {
            Self::from_public_keys(public_keys)
        } else {
            Self::none()
        }
    }

    pub fn is_replay_protection_input(&self, output_script: &ScriptBuf) -> bool {
        self.permitted_output_scripts.contains(output_script)
    }

    /// Whether an unspent sits at one of the fixed replay protection scripts,
    /// matched by its address on the given network.
    pub fn is_replay_protection_unspent(&self, unspent: &Unspent, network: Network) -> bool {
        self.permitted_output_scripts.iter().any(|script| {
            networks::from_output_script(script, network)
                .map(|address| address == unspent.address)
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::keys::tests::get_test_wallet_keys;
    use crate::wallet::keys::to_pub_triple;

    fn test_key() -> CompressedPublicKey {
        let keys = get_test_wallet_keys("replay");
        let derived = keys.derive_for_chain_and_index(0, 0).unwrap();
        to_pub_triple(&derived)[0]
    }

    #[test]
    fn matches_own_script() {
        let key = test_key();
        let replay = ReplayProtection::from_public_keys(vec![key]);
        let script = ScriptP2shP2pk::new(key).output_script();
        assert!(replay.is_replay_protection_input(&script));
    }

    #[test]
    fn does_not_match_other_scripts() {
        let replay = ReplayProtection::from_public_keys(vec![test_key()]);
        let other = ScriptBuf::new();
        assert!(!replay.is_replay_protection_input(&other));
        assert!(!ReplayProtection::none().is_replay_protection_input(&other));
    }

    #[test]
    fn unspent_matched_by_address() {
        let key = test_key();
        let replay = ReplayProtection::from_public_keys(vec![key]);
        let script = ScriptP2shP2pk::new(key).output_script();
        let address = networks::from_output_script(&script, Network::BitcoinCash).unwrap();

        let unspent = Unspent {
            id: "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b:0".to_string(),
            address,
            value: 1000,
        };
        assert!(replay.is_replay_protection_unspent(&unspent, Network::BitcoinCash));

        let other = Unspent {
            address: "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH".to_string(),
            ..unspent
        };
        assert!(!replay.is_replay_protection_unspent(&other, Network::BitcoinCash));
    }

    #[test]
    fn for_network_is_empty_outside_fork_families() {
        let replay = ReplayProtection::for_network(Network::Bitcoin, vec![test_key()]);
        assert!(replay.permitted_output_scripts.is_empty());

        let replay = ReplayProtection::for_network(Network::BitcoinSV, vec![test_key()]);
        assert_eq!(replay.permitted_output_scripts.len(), 1);
    }
}
