//! Network selection and network-tagged address parsing.

use std::fmt;
use std::str::FromStr;

use bitcoin::address::NetworkUnchecked;
use bitcoin::Address;
use serde::{Deserialize, Serialize};

use crate::error::WalletError;

/// Chain the wallet operates on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Bitcoin mainnet (addresses start with `bc1`, `1` or `3`).
    Mainnet,
    /// Bitcoin testnet (addresses start with `tb1`, `m`, `n` or `2`).
    #[default]
    Testnet,
}

impl Network {
    /// The matching `bitcoin` crate network.
    pub fn to_bitcoin(self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
        }
    }

    /// BIP-44 coin type used in the HD receive path.
    pub fn coin_type(self) -> u32 {
        match self {
            Network::Mainnet => 0,
            Network::Testnet => 1,
        }
    }

    /// The other network.
    pub fn other(self) -> Network {
        match self {
            Network::Mainnet => Network::Testnet,
            Network::Testnet => Network::Mainnet,
        }
    }

    /// Default Esplora REST base URL.
    pub fn default_esplora_url(self) -> &'static str {
        match self {
            Network::Mainnet => "https://mempool.space/api",
            Network::Testnet => "https://mempool.space/testnet4/api",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => f.write_str("mainnet"),
            Network::Testnet => f.write_str("testnet"),
        }
    }
}

impl FromStr for Network {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" | "bitcoin" => Ok(Network::Mainnet),
            "testnet" | "test" | "testnet4" => Ok(Network::Testnet),
            other => Err(WalletError::WrongNetwork(format!("unknown network {other:?}"))),
        }
    }
}

/// Parse an address and require it to belong to `network`.
///
/// Returns [`WalletError::WrongNetwork`] when the address is well formed but
/// only valid on the other network, [`WalletError::InvalidAddress`] when it
/// cannot be parsed at all.
pub fn parse_address(s: &str, network: Network) -> Result<Address, WalletError> {
    let unchecked = parse_unchecked(s)?;
    if unchecked.is_valid_for_network(network.to_bitcoin()) {
        return Ok(unchecked.assume_checked());
    }
    if unchecked.is_valid_for_network(network.other().to_bitcoin()) {
        return Err(WalletError::WrongNetwork(format!(
            "{s} is a {} address, wallet is on {network}",
            network.other()
        )));
    }
    Err(WalletError::InvalidAddress(s.to_string()))
}

/// Detect which of the supported networks an address belongs to.
pub fn detect_network(s: &str) -> Option<Network> {
    let unchecked = parse_unchecked(s).ok()?;
    [Network::Mainnet, Network::Testnet]
        .into_iter()
        .find(|n| unchecked.is_valid_for_network(n.to_bitcoin()))
}

fn parse_unchecked(s: &str) -> Result<Address<NetworkUnchecked>, WalletError> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(WalletError::InvalidAddress("empty address".into()));
    }
    Address::<NetworkUnchecked>::from_str(trimmed)
        .map_err(|e| WalletError::InvalidAddress(format!("{trimmed}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAINNET_P2WPKH: &str = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";
    const TESTNET_P2WPKH: &str = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";

    #[test]
    fn parse_matching_network() {
        let addr = parse_address(TESTNET_P2WPKH, Network::Testnet).unwrap();
        assert_eq!(addr.to_string(), TESTNET_P2WPKH);
    }

    #[test]
    fn parse_other_network_is_wrong_network() {
        let err = parse_address(MAINNET_P2WPKH, Network::Testnet).unwrap_err();
        assert!(matches!(err, WalletError::WrongNetwork(_)), "{err}");
    }

    #[test]
    fn parse_garbage_is_invalid_address() {
        let err = parse_address("not-an-address", Network::Mainnet).unwrap_err();
        assert!(matches!(err, WalletError::InvalidAddress(_)));
        let err = parse_address("   ", Network::Mainnet).unwrap_err();
        assert!(matches!(err, WalletError::InvalidAddress(_)));
    }

    #[test]
    fn detect() {
        assert_eq!(detect_network(MAINNET_P2WPKH), Some(Network::Mainnet));
        assert_eq!(detect_network(TESTNET_P2WPKH), Some(Network::Testnet));
        assert_eq!(detect_network("xyz"), None);
    }

    #[test]
    fn network_from_str() {
        assert_eq!("testnet".parse::<Network>().unwrap(), Network::Testnet);
        assert_eq!("MAINNET".parse::<Network>().unwrap(), Network::Mainnet);
        assert!("regtest".parse::<Network>().is_err());
    }

    #[test]
    fn coin_types() {
        assert_eq!(Network::Mainnet.coin_type(), 0);
        assert_eq!(Network::Testnet.coin_type(), 1);
        assert_eq!(Network::default(), Network::Testnet);
    }
}
