//! Proprietary key-value utilities for the PSBT MuSig2 extensions.
//!
//! The platform stores MuSig2 participant keys, public nonces and partial
//! signatures under the `BITGO` proprietary identifier.

use std::collections::BTreeMap;

pub use crate::bitcoin::psbt::raw::ProprietaryKey;

/// Proprietary key identifier used for all MuSig2 key-values.
pub const BITGO: &[u8] = b"BITGO";

/// Subtypes of the proprietary keys carried in MuSig2 key path inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProprietaryKeySubtype {
    Musig2ParticipantPubKeys = 0x01,
    Musig2PubNonce = 0x02,
    Musig2PartialSig = 0x03,
}

impl ProprietaryKeySubtype {
    pub fn from(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ProprietaryKeySubtype::Musig2ParticipantPubKeys),
            0x02 => Some(ProprietaryKeySubtype::Musig2PubNonce),
            0x03 => Some(ProprietaryKeySubtype::Musig2PartialSig),
            _ => None,
        }
    }
}

/// A decoded proprietary key-value.
pub struct PlatformKeyValue {
    pub subtype: ProprietaryKeySubtype,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl PlatformKeyValue {
    pub fn new(subtype: ProprietaryKeySubtype, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            subtype,
            key,
            value,
        }
    }

    pub fn to_key_value(&self) -> (ProprietaryKey, Vec<u8>) {
        let key = ProprietaryKey {
            prefix: BITGO.to_vec(),
            subtype: self.subtype as u8,
            key: self.key.clone(),
        };
        (key, self.value.clone())
    }
}

/// Find the proprietary key-values matching a subtype.
pub fn find_kv<'a>(
    subtype: ProprietaryKeySubtype,
    map: &'a BTreeMap<ProprietaryKey, Vec<u8>>,
) -> impl Iterator<Item = PlatformKeyValue> + 'a {
    map.iter().filter_map(move |(k, v)| {
        if k.prefix.as_slice() != BITGO {
            return None;
        }
        match ProprietaryKeySubtype::from(k.subtype) {
            Some(st) if st == subtype => Some(PlatformKeyValue::new(st, k.key.clone(), v.clone())),
            _ => None,
        }
    })
}

/// Insert a key-value, replacing any entry with the same proprietary key.
pub fn insert_kv(map: &mut BTreeMap<ProprietaryKey, Vec<u8>>, kv: &PlatformKeyValue) {
    let (key, value) = kv.to_key_value();
    map.insert(key, value);
}

/// Check if a proprietary key belongs to the MuSig2 extension set.
pub fn is_musig2_key(key: &ProprietaryKey) -> bool {
    key.prefix.as_slice() == BITGO && ProprietaryKeySubtype::from(key.subtype).is_some()
}
