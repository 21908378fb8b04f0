//! In-process cache of MuSig2 signing sessions, keyed by unsigned txid.
//!
//! The external-signer protocol runs `SignerNonce` and `SignerSignature` as
//! two separate calls; the secret nonce generated in the first call lives
//! only in this store, which is why both calls must land on the same process
//! (the sticky-session contract). Entries are single use: created at
//! `SignerNonce`, taken and deleted at `SignerSignature`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use crate::bitcoin::{Psbt, Txid};

/// One in-progress external-signer ceremony: the nonce-bearing PSBT plus the
/// per-input first-round state whose secret nonces never leave the process.
pub struct SigningSession {
    pub psbt: Psbt,
    pub first_rounds: BTreeMap<usize, musig2::FirstRound>,
}

struct StoreInner {
    map: HashMap<Txid, SigningSession>,
    insertion_order: VecDeque<Txid>,
}

/// Process-wide session table. Bounded: when full, the oldest session is
/// evicted, which simply forces that ceremony to restart from `SignerNonce`.
pub struct SessionStore {
    inner: Mutex<StoreInner>,
    capacity: usize,
}

impl SessionStore {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "session store capacity must be positive");
        Self {
            inner: Mutex::new(StoreInner {
                map: HashMap::new(),
                insertion_order: VecDeque::new(),
            }),
            capacity,
        }
    }

    /// Insert a session, replacing any existing session for the same txid.
    /// Replacement invalidates outstanding cosigner nonces computed against
    /// the prior secret nonce, which is the documented overwrite behavior.
    pub fn insert(&self, txid: Txid, session: SigningSession) {
        let mut inner = self.inner.lock().expect("session store poisoned");
        if inner.map.insert(txid, session).is_some() {
            inner.insertion_order.retain(|t| *t != txid);
        }
        inner.insertion_order.push_back(txid);
        while inner.map.len() > self.capacity {
            match inner.insertion_order.pop_front() {
                Some(oldest) => {
                    inner.map.remove(&oldest);
                }
                None => break,
            }
        }
    }

    /// Remove and return the session for a txid.
    pub fn take(&self, txid: &Txid) -> Option<SigningSession> {
        let mut inner = self.inner.lock().expect("session store poisoned");
        let session = inner.map.remove(txid);
        if session.is_some() {
            inner.insertion_order.retain(|t| t != txid);
        }
        session
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("session store poisoned").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
