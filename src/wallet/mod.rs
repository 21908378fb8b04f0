//! Key material and script derivation for the platform's fixed-script
//! 2-of-3 multisig wallets.
mod keychain;
pub mod keys;
mod replay_protection;
mod scripts;
mod unspent;

pub use keychain::*;
pub use keys::*;
pub use replay_protection::*;
pub use scripts::*;
pub use unspent::*;
