/// General-purpose error for key handling and other operations that do not
/// warrant a dedicated error enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoSignerError {
    message: String,
}

impl UtxoSignerError {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for UtxoSignerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for UtxoSignerError {}

impl From<crate::bitcoin::bip32::Error> for UtxoSignerError {
    fn from(e: crate::bitcoin::bip32::Error) -> Self {
        UtxoSignerError::new(&format!("bip32 error: {}", e))
    }
}

impl From<crate::bitcoin::secp256k1::Error> for UtxoSignerError {
    fn from(e: crate::bitcoin::secp256k1::Error) -> Self {
        UtxoSignerError::new(&format!("secp256k1 error: {}", e))
    }
}

impl From<hex::FromHexError> for UtxoSignerError {
    fn from(e: hex::FromHexError) -> Self {
        UtxoSignerError::new(&format!("invalid hex: {}", e))
    }
}
