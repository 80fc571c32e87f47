//! Wallet error types.

use thiserror::Error;

/// Errors that can occur in wallet operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    /// Password does not match the stored password hash.
    #[error("invalid password")]
    BadPassword,

    /// Password was empty.
    #[error("password must not be empty")]
    EmptyPassword,

    /// Encrypted blob failed authentication or is malformed.
    #[error("keystore integrity check failed: {0}")]
    IntegrityError(String),

    /// No keystore record matches the lookup key.
    #[error("wallet not found: {0}")]
    WalletNotFound(String),

    /// Address or key belongs to the other network.
    #[error("wrong network: {0}")]
    WrongNetwork(String),

    /// Address string could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Address supplied by the caller differs from the derived one.
    #[error("address mismatch: expected {expected}, got {actual}")]
    AddressMismatch {
        /// Address derived from the unlocked key.
        expected: String,
        /// Address the caller supplied.
        actual: String,
    },

    /// Invalid BIP-39 mnemonic phrase.
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    /// Invalid monetary amount.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Payment is below the dust threshold.
    #[error("amount {amount} is below the dust threshold of {threshold} sats")]
    BelowDustThreshold {
        /// Requested amount in sats.
        amount: u64,
        /// Dust threshold in sats.
        threshold: u64,
    },

    /// Lock time is not a future UNIX timestamp.
    #[error("invalid lock time: {0}")]
    InvalidLockTime(String),

    /// Insufficient funds to cover the payment plus fees.
    #[error("insufficient funds: have {have}, need {need}")]
    InsufficientFunds {
        /// Available balance in sats.
        have: u64,
        /// Required amount in sats.
        need: u64,
    },

    /// No UTXOs available for spending.
    #[error("no UTXOs available")]
    NoUtxos,

    /// Malformed WIF, transaction bytes or hex.
    #[error("decode error: {0}")]
    DecodeError(String),

    /// The blockchain data provider failed or returned bad data.
    #[error("provider error: {0}")]
    ProviderError(String),

    /// An input could not be signed.
    #[error("signing failure: {0}")]
    SigningFailure(String),

    /// Key derivation failure.
    #[error("key derivation: {0}")]
    KeyDerivation(String),

    /// Encryption failure.
    #[error("encryption: {0}")]
    Encryption(String),

    /// Keystore storage failure.
    #[error("storage: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization: {0}")]
    Serialization(String),
}

impl WalletError {
    /// Whether the error was caused by caller input rather than a server-side fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            WalletError::BadPassword
                | WalletError::EmptyPassword
                | WalletError::WalletNotFound(_)
                | WalletError::WrongNetwork(_)
                | WalletError::InvalidAddress(_)
                | WalletError::AddressMismatch { .. }
                | WalletError::InvalidMnemonic(_)
                | WalletError::InvalidAmount(_)
                | WalletError::BelowDustThreshold { .. }
                | WalletError::InvalidLockTime(_)
                | WalletError::InsufficientFunds { .. }
                | WalletError::NoUtxos
                | WalletError::DecodeError(_)
        )
    }
}
