//! # strongbox-wallet — custodial Bitcoin wallet core.
//!
//! Generates and imports keys, keeps them encrypted at rest, selects coins,
//! prices fees and produces signed transactions for a single configured
//! network. Chain data comes from a [`ChainProvider`].
//!
//! # Modules
//!
//! - [`error`] — `WalletError` enum
//! - [`network`] — network selection and address parsing
//! - [`keys`] — single-key and BIP-84 HD key derivation
//! - [`mnemonic`] — BIP-39 generation and validation
//! - [`encryption`] — Argon2id + AES-256-GCM secret sealing
//! - [`keystore`] — append-only encrypted wallet records
//! - [`fees`] — fee policy and feerate oracle
//! - [`coin_selection`] — greedy UTXO selection
//! - [`builder`] — transaction builder with signing
//! - [`provider`] — chain data provider trait
//! - [`config`] — wallet policy configuration
//! - [`custodian`] — high-level custodial operations

pub mod builder;
pub mod coin_selection;
pub mod config;
pub mod custodian;
pub mod encryption;
pub mod error;
pub mod fees;
pub mod keys;
pub mod keystore;
pub mod mnemonic;
pub mod network;
pub mod provider;

// Re-exports for convenient access
pub use builder::{SignedTransaction, TransactionBuilder, UnsignedTransaction};
pub use coin_selection::{BuildPlan, CoinSelector, PlannedOutput};
pub use config::WalletConfig;
pub use custodian::{
    AddressCheck, Balance, Custodian, MultisigAddress, PaymentRequest, SendReceipt,
    TimeLockedTransaction, TxState, TxVerification, WalletRef,
};
pub use encryption::KdfParams;
pub use error::WalletError;
pub use fees::{FeePolicy, FeerateOracle};
pub use keys::SigningMaterial;
pub use keystore::{
    CreatedWallet, DecryptedSecret, JsonFileStorage, Keystore, KeystoreRecord, KeystoreStorage,
    MemoryStorage, WalletKind,
};
pub use network::Network;
pub use provider::{AddressStats, AddressTx, ChainProvider, TxStatus, Utxo};
