//! BIP-39 mnemonic generation and validation.

use bip39::{Language, Mnemonic};
use zeroize::Zeroizing;

use crate::error::WalletError;

/// Entropy length for generated mnemonics (24 words).
pub const MNEMONIC_ENTROPY_LEN: usize = 32;

/// Generate a fresh 24-word English mnemonic from OS entropy.
pub fn generate_mnemonic() -> Result<Zeroizing<String>, WalletError> {
    use rand::RngCore;
    let mut entropy = Zeroizing::new([0u8; MNEMONIC_ENTROPY_LEN]);
    rand::rngs::OsRng.fill_bytes(entropy.as_mut());
    let m = Mnemonic::from_entropy_in(Language::English, entropy.as_ref())
        .map_err(|e| WalletError::KeyDerivation(e.to_string()))?;
    Ok(Zeroizing::new(m.to_string()))
}

/// Collapse whitespace and lowercase a phrase.
pub fn normalize(phrase: &str) -> Zeroizing<String> {
    Zeroizing::new(
        phrase
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase(),
    )
}

/// Parse a phrase against the English wordlist, checking its checksum.
pub fn parse_mnemonic(phrase: &str) -> Result<Mnemonic, WalletError> {
    let normalized = normalize(phrase);
    Mnemonic::parse_in(Language::English, normalized.as_str())
        .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))
}

/// Derive the 64-byte BIP-39 seed (empty passphrase).
pub fn mnemonic_to_seed(phrase: &str) -> Result<Zeroizing<[u8; 64]>, WalletError> {
    let m = parse_mnemonic(phrase)?;
    Ok(Zeroizing::new(m.to_seed("")))
}
