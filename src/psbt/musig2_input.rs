//! MuSig2 PSBT proprietary key-value parsing and signature aggregation.
//!
//! Wire layout of the proprietary fields on a key path input:
//! - participants: `<tapOutputKey><tapInternalKey>` => `<key1><key2>`
//! - public nonce: `<participantPubKey><tapOutputKey>` => `<pubNonce>`
//! - partial sig:  `<participantPubKey><tapOutputKey>` => `<partialSig>`

use musig2::{BinaryEncoding, PubNonce};

use crate::bitcoin::hashes::Hash;
use crate::bitcoin::key::UntweakedPublicKey;
use crate::bitcoin::psbt::Input;
use crate::bitcoin::{secp256k1, CompressedPublicKey, Psbt, TxOut};
use crate::psbt::propkv::{find_kv, insert_kv, is_musig2_key, PlatformKeyValue, ProprietaryKeySubtype};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Musig2Error {
    MissingParticipants,
    InvalidKeydataLength { expected: usize, got: usize },
    InvalidValueLength { expected: String, got: usize },
    DuplicateParticipantKeys,
    TooManyKeyValues { expected: usize, got: usize },
    Parse(String),
    SignatureAggregation(String),
    MissingNonces,
    TapOutputKeyMismatch { expected: String, got: String },
}

impl std::fmt::Display for Musig2Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Musig2Error::MissingParticipants => write!(f, "Missing participants"),
            Musig2Error::InvalidKeydataLength { expected, got } => {
                write!(
                    f,
                    "Invalid keydata length: expected {}, got {}",
                    expected, got
                )
            }
            Musig2Error::InvalidValueLength { expected, got } => {
                write!(
                    f,
                    "Invalid value length: expected {}, got {}",
                    expected, got
                )
            }
            Musig2Error::DuplicateParticipantKeys => {
                write!(f, "Duplicate participant public keys found")
            }
            Musig2Error::TooManyKeyValues { expected, got } => {
                write!(
                    f,
                    "Too many key-values: expected up to {}, got {}",
                    expected, got
                )
            }
            Musig2Error::Parse(msg) => write!(f, "{}", msg),
            Musig2Error::SignatureAggregation(msg) => {
                write!(f, "Signature aggregation error: {}", msg)
            }
            Musig2Error::MissingNonces => write!(f, "Missing nonces for aggregation"),
            Musig2Error::TapOutputKeyMismatch { expected, got } => {
                write!(
                    f,
                    "Tap output key mismatch: expected {}, got {}",
                    expected, got
                )
            }
        }
    }
}

impl std::error::Error for Musig2Error {}

/// MuSig2 participant data for a key path input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Musig2Participants {
    pub tap_output_key: UntweakedPublicKey,
    pub tap_internal_key: UntweakedPublicKey,
    pub participant_pub_keys: [CompressedPublicKey; 2],
}

impl Musig2Participants {
    pub fn to_key_value(&self) -> PlatformKeyValue {
        let mut key_field = Vec::with_capacity(64);
        key_field.extend_from_slice(&self.tap_output_key.serialize());
        key_field.extend_from_slice(&self.tap_internal_key.serialize());

        let mut value = Vec::with_capacity(66);
        value.extend_from_slice(&self.participant_pub_keys[0].to_bytes());
        value.extend_from_slice(&self.participant_pub_keys[1].to_bytes());

        PlatformKeyValue::new(
            ProprietaryKeySubtype::Musig2ParticipantPubKeys,
            key_field,
            value,
        )
    }

    pub fn from_key_value(kv: &PlatformKeyValue) -> Result<Self, Musig2Error> {
        if kv.key.len() != 64 {
            return Err(Musig2Error::InvalidKeydataLength {
                expected: 64,
                got: kv.key.len(),
            });
        }
        if kv.value.len() != 66 {
            return Err(Musig2Error::InvalidValueLength {
                expected: "66".to_string(),
                got: kv.value.len(),
            });
        }

        let tap_output_key = UntweakedPublicKey::from_slice(&kv.key[0..32])
            .map_err(|e| Musig2Error::Parse(format!("invalid tap output key: {}", e)))?;
        let tap_internal_key = UntweakedPublicKey::from_slice(&kv.key[32..64])
            .map_err(|e| Musig2Error::Parse(format!("invalid tap internal key: {}", e)))?;

        let participant_key1 = CompressedPublicKey::from_slice(&kv.value[0..33])
            .map_err(|e| Musig2Error::Parse(format!("invalid participant key: {}", e)))?;
        let participant_key2 = CompressedPublicKey::from_slice(&kv.value[33..66])
            .map_err(|e| Musig2Error::Parse(format!("invalid participant key: {}", e)))?;

        if participant_key1 == participant_key2 {
            return Err(Musig2Error::DuplicateParticipantKeys);
        }

        Ok(Self {
            tap_output_key,
            tap_internal_key,
            participant_pub_keys: [participant_key1, participant_key2],
        })
    }

    /// The index of a participant key, if it is one of the two.
    pub fn participant_index(&self, key: &CompressedPublicKey) -> Option<usize> {
        self.participant_pub_keys.iter().position(|k| k == key)
    }
}

/// MuSig2 public nonce attached by one participant.
#[derive(Debug, Clone)]
pub struct Musig2PubNonce {
    pub participant_pub_key: CompressedPublicKey,
    pub tap_output_key: UntweakedPublicKey,
    pub pub_nonce: PubNonce,
}

impl PartialEq for Musig2PubNonce {
    fn eq(&self, other: &Self) -> bool {
        self.participant_pub_key == other.participant_pub_key
            && self.tap_output_key == other.tap_output_key
            && self.pub_nonce.serialize() == other.pub_nonce.serialize()
    }
}

impl Eq for Musig2PubNonce {}

impl Musig2PubNonce {
    pub fn to_key_value(&self) -> PlatformKeyValue {
        let mut key_field = Vec::with_capacity(65);
        key_field.extend_from_slice(&self.participant_pub_key.to_bytes());
        key_field.extend_from_slice(&self.tap_output_key.serialize());

        PlatformKeyValue::new(
            ProprietaryKeySubtype::Musig2PubNonce,
            key_field,
            self.pub_nonce.serialize().to_vec(),
        )
    }

    pub fn from_key_value(kv: &PlatformKeyValue) -> Result<Self, Musig2Error> {
        if kv.key.len() != 65 {
            return Err(Musig2Error::InvalidKeydataLength {
                expected: 65,
                got: kv.key.len(),
            });
        }
        if kv.value.len() != 66 {
            return Err(Musig2Error::InvalidValueLength {
                expected: "66".to_string(),
                got: kv.value.len(),
            });
        }

        let participant_pub_key = CompressedPublicKey::from_slice(&kv.key[0..33])
            .map_err(|e| Musig2Error::Parse(format!("invalid participant key: {}", e)))?;
        let tap_output_key = UntweakedPublicKey::from_slice(&kv.key[33..65])
            .map_err(|e| Musig2Error::Parse(format!("invalid tap output key: {}", e)))?;
        let pub_nonce = PubNonce::try_from(&kv.value[..])
            .map_err(|e| Musig2Error::Parse(format!("invalid public nonce: {}", e)))?;

        Ok(Self {
            participant_pub_key,
            tap_output_key,
            pub_nonce,
        })
    }
}

/// MuSig2 partial signature produced by one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Musig2PartialSig {
    pub participant_pub_key: CompressedPublicKey,
    pub tap_output_key: UntweakedPublicKey,
    /// 32 bytes, or 33 with a trailing sighash byte.
    pub partial_sig: Vec<u8>,
}

impl Musig2PartialSig {
    pub fn to_key_value(&self) -> PlatformKeyValue {
        let mut key_field = Vec::with_capacity(65);
        key_field.extend_from_slice(&self.participant_pub_key.to_bytes());
        key_field.extend_from_slice(&self.tap_output_key.serialize());

        PlatformKeyValue::new(
            ProprietaryKeySubtype::Musig2PartialSig,
            key_field,
            self.partial_sig.clone(),
        )
    }

    pub fn from_key_value(kv: &PlatformKeyValue) -> Result<Self, Musig2Error> {
        if kv.key.len() != 65 {
            return Err(Musig2Error::InvalidKeydataLength {
                expected: 65,
                got: kv.key.len(),
            });
        }
        if kv.value.len() != 32 && kv.value.len() != 33 {
            return Err(Musig2Error::InvalidValueLength {
                expected: "32 or 33".to_string(),
                got: kv.value.len(),
            });
        }

        let participant_pub_key = CompressedPublicKey::from_slice(&kv.key[0..33])
            .map_err(|e| Musig2Error::Parse(format!("invalid participant key: {}", e)))?;
        let tap_output_key = UntweakedPublicKey::from_slice(&kv.key[33..65])
            .map_err(|e| Musig2Error::Parse(format!("invalid tap output key: {}", e)))?;

        Ok(Self {
            participant_pub_key,
            tap_output_key,
            partial_sig: kv.value.clone(),
        })
    }

    /// The normalized 32-byte partial signature, with any sighash byte removed.
    pub fn normalized_signature(&self) -> Result<musig2::PartialSignature, Musig2Error> {
        let sig_bytes = match self.partial_sig.len() {
            32 => &self.partial_sig[..],
            33 => &self.partial_sig[..32],
            len => {
                return Err(Musig2Error::InvalidValueLength {
                    expected: "32 or 33".to_string(),
                    got: len,
                })
            }
        };
        musig2::PartialSignature::try_from(sig_bytes)
            .map_err(|e| Musig2Error::Parse(format!("invalid partial signature: {}", e)))
    }
}

/// Parse MuSig2 participants from a PSBT input. `None` if absent.
pub fn parse_musig2_participants(input: &Input) -> Result<Option<Musig2Participants>, Musig2Error> {
    let kvs: Vec<_> = find_kv(
        ProprietaryKeySubtype::Musig2ParticipantPubKeys,
        &input.proprietary,
    )
    .collect();

    match kvs.len() {
        0 => Ok(None),
        1 => Musig2Participants::from_key_value(&kvs[0]).map(Some),
        got => Err(Musig2Error::TooManyKeyValues { expected: 1, got }),
    }
}

/// Parse MuSig2 public nonces from a PSBT input (at most one per participant).
pub fn parse_musig2_nonces(input: &Input) -> Result<Vec<Musig2PubNonce>, Musig2Error> {
    let kvs: Vec<_> = find_kv(ProprietaryKeySubtype::Musig2PubNonce, &input.proprietary).collect();
    if kvs.len() > 2 {
        return Err(Musig2Error::TooManyKeyValues {
            expected: 2,
            got: kvs.len(),
        });
    }
    kvs.iter().map(Musig2PubNonce::from_key_value).collect()
}

/// Parse MuSig2 partial signatures from a PSBT input.
pub fn parse_musig2_partial_sigs(input: &Input) -> Result<Vec<Musig2PartialSig>, Musig2Error> {
    let kvs: Vec<_> =
        find_kv(ProprietaryKeySubtype::Musig2PartialSig, &input.proprietary).collect();
    if kvs.len() > 2 {
        return Err(Musig2Error::TooManyKeyValues {
            expected: 2,
            got: kvs.len(),
        });
    }
    kvs.iter().map(Musig2PartialSig::from_key_value).collect()
}

/// Write (or replace) a participant's public nonce on a PSBT input.
pub fn set_musig2_nonce(input: &mut Input, nonce: &Musig2PubNonce) {
    insert_kv(&mut input.proprietary, &nonce.to_key_value());
}

/// Write (or replace) a participant's partial signature on a PSBT input.
pub fn set_musig2_partial_sig(input: &mut Input, sig: &Musig2PartialSig) {
    insert_kv(&mut input.proprietary, &sig.to_key_value());
}

/// Collect the funding outputs of all PSBT inputs, from witness_utxo or
/// non_witness_utxo. Required for taproot sighash computation.
pub fn collect_prevouts(psbt: &Psbt) -> Result<Vec<TxOut>, Musig2Error> {
    let tx = &psbt.unsigned_tx;
    psbt.inputs
        .iter()
        .enumerate()
        .map(|(i, input)| {
            if let Some(witness_utxo) = &input.witness_utxo {
                Ok(witness_utxo.clone())
            } else if let Some(non_witness_utxo) = &input.non_witness_utxo {
                let output_index = tx.input[i].previous_output.vout as usize;
                non_witness_utxo
                    .output
                    .get(output_index)
                    .cloned()
                    .ok_or_else(|| {
                        Musig2Error::SignatureAggregation(format!(
                            "Previous output index out of bounds for input {}",
                            i
                        ))
                    })
            } else {
                Err(Musig2Error::SignatureAggregation(format!(
                    "Missing UTXO data for input {}",
                    i
                )))
            }
        })
        .collect()
}

/// The full MuSig2 state parsed from one key path input.
pub struct Musig2Input {
    pub participants: Musig2Participants,
    pub nonces: Vec<Musig2PubNonce>,
    pub partial_sigs: Vec<Musig2PartialSig>,
}

impl Musig2Input {
    /// Whether an input carries any MuSig2 key-value pairs.
    pub fn is_musig2_input(input: &Input) -> bool {
        input.proprietary.keys().any(is_musig2_key)
    }

    pub fn from_input(input: &Input) -> Result<Self, Musig2Error> {
        let participants =
            parse_musig2_participants(input)?.ok_or(Musig2Error::MissingParticipants)?;
        let nonces = parse_musig2_nonces(input)?;
        let partial_sigs = parse_musig2_partial_sigs(input)?;
        Ok(Self {
            participants,
            nonces,
            partial_sigs,
        })
    }

    pub fn get_pub_nonces(&self) -> Vec<PubNonce> {
        self.nonces.iter().map(|n| n.pub_nonce.clone()).collect()
    }

    pub fn get_participant_points(&self) -> Result<Vec<musig2::secp::Point>, Musig2Error> {
        self.participants
            .participant_pub_keys
            .iter()
            .enumerate()
            .map(|(i, pk)| {
                musig2::secp::Point::try_from(&pk.to_bytes()[..]).map_err(|e| {
                    Musig2Error::SignatureAggregation(format!(
                        "Invalid public key at index {}: {}",
                        i, e
                    ))
                })
            })
            .collect()
    }

    /// Aggregate the partial signatures into the final Schnorr signature
    /// (BIP-327), validating the stored tap output key on the way.
    pub fn aggregate_signature<T: std::borrow::Borrow<crate::bitcoin::Transaction>>(
        &self,
        sighash_cache: &mut crate::bitcoin::sighash::SighashCache<T>,
        prevouts: &[TxOut],
        input_index: usize,
        tap_merkle_root: &crate::bitcoin::taproot::TapNodeHash,
    ) -> Result<crate::bitcoin::taproot::Signature, Musig2Error> {
        use crate::bitcoin::sighash::{Prevouts, TapSighashType};
        use musig2::{AggNonce, KeyAggContext};

        if self.nonces.len() < 2 {
            return Err(Musig2Error::SignatureAggregation(format!(
                "At least 2 public nonces are required, got {}",
                self.nonces.len()
            )));
        }
        if self.partial_sigs.len() < 2 {
            return Err(Musig2Error::SignatureAggregation(format!(
                "At least 2 partial signatures are required, got {}",
                self.partial_sigs.len()
            )));
        }

        let pub_nonces = self.get_pub_nonces();
        let parsed_keys = self.get_participant_points()?;
        let parsed_sigs = self
            .partial_sigs
            .iter()
            .map(|sig| sig.normalized_signature())
            .collect::<Result<Vec<_>, _>>()?;

        let sighash = sighash_cache
            .taproot_key_spend_signature_hash(
                input_index,
                &Prevouts::All(prevouts),
                TapSighashType::Default,
            )
            .map_err(|e| {
                Musig2Error::SignatureAggregation(format!("Failed to compute sighash: {}", e))
            })?;

        let agg_nonce = AggNonce::sum(&pub_nonces);

        let key_agg_ctx = KeyAggContext::new(parsed_keys).map_err(|e| {
            Musig2Error::SignatureAggregation(format!("Failed to create key agg context: {}", e))
        })?;
        let key_agg_ctx = key_agg_ctx
            .with_taproot_tweak(&tap_merkle_root.to_byte_array())
            .map_err(|e| {
                Musig2Error::SignatureAggregation(format!("Failed to apply taproot tweak: {}", e))
            })?;

        // the tweaked aggregate must equal the stored tap output key
        let computed: musig2::secp::Point = key_agg_ctx.aggregated_pubkey();
        let computed_bytes = computed.serialize_xonly();
        let stored_bytes = self.participants.tap_output_key.serialize();
        if computed_bytes != stored_bytes {
            return Err(Musig2Error::TapOutputKeyMismatch {
                expected: hex::encode(stored_bytes),
                got: hex::encode(computed_bytes),
            });
        }

        let final_sig: musig2::LiftedSignature = musig2::aggregate_partial_signatures(
            &key_agg_ctx,
            &agg_nonce,
            parsed_sigs,
            sighash.to_byte_array(),
        )
        .map_err(|e| {
            Musig2Error::SignatureAggregation(format!("Signature aggregation failed: {}", e))
        })?;

        let sig_bytes: [u8; 64] = final_sig.to_bytes();
        crate::bitcoin::taproot::Signature::from_slice(&sig_bytes)
            .map_err(|e| Musig2Error::SignatureAggregation(format!("Invalid signature: {}", e)))
    }

    /// Finalize a MuSig2 key path input: aggregate the partial signatures
    /// into `tap_key_sig`, clear the proprietary fields, then let the
    /// standard finalizer build the witness. After aggregation the signature
    /// is indistinguishable from a single-key taproot signature.
    pub fn finalize_input<C: secp256k1::Verification>(
        psbt: &mut Psbt,
        secp: &secp256k1::Secp256k1<C>,
        input_index: usize,
    ) -> Result<(), Musig2Error> {
        use crate::bitcoin::sighash::SighashCache;
        use crate::bitcoin::taproot::TapNodeHash;
        use miniscript::psbt::PsbtExt;

        let musig2_input = Self::from_input(&psbt.inputs[input_index])?;
        let prevouts = collect_prevouts(psbt)?;

        let tap_merkle_root = psbt.inputs[input_index]
            .tap_merkle_root
            .unwrap_or_else(|| TapNodeHash::from_byte_array([0u8; 32]));

        let mut sighash_cache = SighashCache::new(&psbt.unsigned_tx);
        let taproot_sig = musig2_input.aggregate_signature(
            &mut sighash_cache,
            &prevouts,
            input_index,
            &tap_merkle_root,
        )?;

        psbt.inputs[input_index].tap_key_sig = Some(taproot_sig);
        psbt.inputs[input_index]
            .proprietary
            .retain(|key, _| !is_musig2_key(key));

        psbt.finalize_inp_mut(secp, input_index).map_err(|e| {
            Musig2Error::SignatureAggregation(format!("Finalization failed: {}", e))
        })?;

        Ok(())
    }
}
