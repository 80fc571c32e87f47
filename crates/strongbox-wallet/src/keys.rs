//! Signing key derivation.
//!
//! Two key sources are supported: a single random secp256k1 key exported as
//! WIF, and a BIP-39 mnemonic expanded through BIP-32 along the fixed BIP-84
//! receive path `m/84'/{coin}'/0'/0/0`. Both yield a [`SigningMaterial`] whose
//! canonical address is native segwit (P2WPKH).

use std::fmt;
use std::str::FromStr;

use bitcoin::bip32::{DerivationPath, Xpriv, Xpub};
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{Address, CompressedPublicKey, NetworkKind, PrivateKey, ScriptBuf};
use zeroize::Zeroizing;

use crate::error::WalletError;
use crate::mnemonic;
use crate::network::Network;

/// The single HD path used for both wallet creation and spending.
pub fn hd_receive_path(network: Network) -> String {
    format!("m/84'/{}'/0'/0/0", network.coin_type())
}

/// A private key together with its public key and canonical address.
///
/// The secret key is erased when the material is dropped.
pub struct SigningMaterial {
    private_key: PrivateKey,
    public_key: CompressedPublicKey,
    address: Address,
    network: Network,
}

impl SigningMaterial {
    /// Build signing material from a compressed private key.
    pub fn from_private_key(private_key: PrivateKey, network: Network) -> Result<Self, WalletError> {
        let secp = Secp256k1::signing_only();
        let public_key = CompressedPublicKey::from_private_key(&secp, &private_key)
            .map_err(|_| WalletError::DecodeError("uncompressed keys cannot own P2WPKH outputs".into()))?;
        let address = Address::p2wpkh(&public_key, network.to_bitcoin());
        Ok(Self {
            private_key,
            public_key,
            address,
            network,
        })
    }

    /// The secp256k1 secret key.
    pub fn secret_key(&self) -> &SecretKey {
        &self.private_key.inner
    }

    /// The compressed public key.
    pub fn public_key(&self) -> &CompressedPublicKey {
        &self.public_key
    }

    /// Canonical P2WPKH address for this key.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Network the key was derived for.
    pub fn network(&self) -> Network {
        self.network
    }

    /// P2WPKH script owned by this key.
    pub fn p2wpkh_script(&self) -> ScriptBuf {
        ScriptBuf::new_p2wpkh(&self.public_key.wpubkey_hash())
    }

    /// Legacy P2PKH script owned by this key.
    pub fn p2pkh_script(&self) -> ScriptBuf {
        ScriptBuf::new_p2pkh(&self.public_key.pubkey_hash())
    }

    /// Export the key as WIF. The returned string is wiped on drop.
    pub fn to_wif(&self) -> Zeroizing<String> {
        Zeroizing::new(self.private_key.to_wif())
    }
}

impl Drop for SigningMaterial {
    fn drop(&mut self) {
        self.private_key.inner.non_secure_erase();
    }
}

impl fmt::Debug for SigningMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningMaterial")
            .field("private_key", &"[REDACTED]")
            .field("address", &self.address.to_string())
            .finish()
    }
}

/// Generate a fresh random key.
///
/// Candidates are drawn from the OS RNG and rejected until they fall inside
/// the curve order, so the result is uniform over the key space.
pub fn derive_single(network: Network) -> Result<SigningMaterial, WalletError> {
    use rand::RngCore;
    let mut bytes = Zeroizing::new([0u8; 32]);
    let secret = loop {
        rand::rngs::OsRng.fill_bytes(bytes.as_mut());
        if let Ok(sk) = SecretKey::from_slice(bytes.as_ref()) {
            break sk;
        }
    };
    let private_key = PrivateKey::new(secret, network.to_bitcoin());
    SigningMaterial::from_private_key(private_key, network)
}

/// Decode a WIF private key for `network`.
pub fn derive_from_wif(wif: &str, network: Network) -> Result<SigningMaterial, WalletError> {
    let private_key =
        PrivateKey::from_wif(wif.trim()).map_err(|e| WalletError::DecodeError(format!("WIF: {e}")))?;
    if private_key.network != NetworkKind::from(network.to_bitcoin()) {
        return Err(WalletError::WrongNetwork(format!(
            "WIF key is not for {network}"
        )));
    }
    if !private_key.compressed {
        return Err(WalletError::DecodeError(
            "uncompressed WIF keys are not supported".into(),
        ));
    }
    SigningMaterial::from_private_key(private_key, network)
}

/// Expand a mnemonic along the HD receive path.
///
/// Returns the receive key and the root extended public key.
pub fn derive_from_mnemonic(
    phrase: &str,
    network: Network,
) -> Result<(SigningMaterial, Xpub), WalletError> {
    let seed = mnemonic::mnemonic_to_seed(phrase)?;
    let secp = Secp256k1::new();

    let master = Xpriv::new_master(network.to_bitcoin(), seed.as_ref())
        .map_err(|e| WalletError::KeyDerivation(e.to_string()))?;
    let path = DerivationPath::from_str(&hd_receive_path(network))
        .map_err(|e| WalletError::KeyDerivation(e.to_string()))?;
    let child = master
        .derive_priv(&secp, &path)
        .map_err(|e| WalletError::KeyDerivation(e.to_string()))?;

    let xpub = Xpub::from_priv(&secp, &master);
    let material = SigningMaterial::from_private_key(child.to_priv(), network)?;
    Ok((material, xpub))
}
