//! Transaction signing, verification and output-reconciliation engine for
//! multisig UTXO wallets.
//!
//! The crate sits between a wallet-storage/network layer (which supplies
//! keys, unspents and raw transaction bytes) and coin-specific adapters:
//! given a candidate spend, it classifies every output as change or
//! external, enforces spend-limit policy, drives the cooperative MuSig2
//! signing protocol, and verifies key material before funds move.

pub mod descriptor;
mod error;
pub mod message;
pub mod networks;
pub mod prebuild;
pub mod psbt;
pub mod reconcile;
pub mod signer;
#[cfg(test)]
pub mod test_utils;
pub mod verify;
pub mod wallet;

// re-export bitcoin from the miniscript crate so callers and internal code
// agree on one version
pub use ::miniscript::bitcoin;

pub use error::UtxoSignerError;
pub use networks::Network;
pub use reconcile::{output_difference, reconcile, ComparableOutput, OutputValue};
pub use signer::{
    CosignerClient, InputSigningError, SessionStore, SignTransactionError, SignTransactionParams,
    SignedTransaction, SigningStep, TransactionSigner, TransactionSigningError,
};
pub use verify::{verify_transaction, VerificationOptions, VerifyError};
pub use wallet::{ReplayProtection, RootWalletKeys};
