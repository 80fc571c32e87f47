//! Wallet policy configuration.

use crate::encryption::KdfParams;
use crate::fees::{DEFAULT_DUST_THRESHOLD, DEFAULT_FALLBACK_FEERATE, FeePolicy};
use crate::network::Network;

/// Maximum number of keys in a P2SH multisig redeem script.
pub const MAX_MULTISIG_KEYS: usize = 15;

/// Policy knobs for a [`Custodian`](crate::custodian::Custodian).
#[derive(Debug, Clone, PartialEq)]
pub struct WalletConfig {
    /// Chain addresses and keys must belong to.
    pub network: Network,
    /// Minimum payment and change value in sats.
    pub dust_threshold: u64,
    /// Size model used to price transactions before signing.
    pub fee_policy: FeePolicy,
    /// Feerate substituted for missing estimate targets (sat/vB).
    pub fallback_feerate: f64,
    /// Argon2id cost for newly created keystore records.
    pub kdf: KdfParams,
}

impl WalletConfig {
    /// Default policy for `network`.
    pub fn for_network(network: Network) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
            dust_threshold: DEFAULT_DUST_THRESHOLD,
            fee_policy: FeePolicy::legacy(),
            fallback_feerate: DEFAULT_FALLBACK_FEERATE,
            kdf: KdfParams::default(),
        }
    }
}
