//! CLI configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use strongbox_wallet::{Network, WalletConfig};

/// Default HTTP timeout for Esplora requests.
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Debug)]
pub struct Config {
    /// Network addresses and keys must belong to.
    pub network: Network,
    /// Esplora REST base URL.
    pub esplora_url: String,
    /// Path to the JSON keystore file.
    pub keystore_path: PathBuf,
    /// Feerate used for missing estimate targets (sat/vB).
    pub fallback_feerate: f64,
    /// Per-request HTTP timeout.
    pub http_timeout: Duration,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let network: Network = match lookup("STRONGBOX_NETWORK").or_else(|| lookup("NETWORK")) {
            Some(s) => s
                .parse()
                .with_context(|| format!("invalid network {s:?} (must be 'mainnet' or 'testnet')"))?,
            None => Network::default(),
        };

        let esplora_url = lookup("STRONGBOX_ESPLORA_URL")
            .unwrap_or_else(|| network.default_esplora_url().to_string());

        let keystore_path = match lookup("STRONGBOX_KEYSTORE") {
            Some(p) => PathBuf::from(p),
            None => default_keystore_path()?,
        };

        let fallback_feerate: f64 = match lookup("STRONGBOX_FALLBACK_FEERATE") {
            Some(s) => s
                .parse()
                .context("STRONGBOX_FALLBACK_FEERATE must be a number")?,
            None => WalletConfig::default().fallback_feerate,
        };
        if !fallback_feerate.is_finite() || fallback_feerate <= 0.0 {
            anyhow::bail!("STRONGBOX_FALLBACK_FEERATE must be positive");
        }

        let timeout_secs: u64 = match lookup("STRONGBOX_HTTP_TIMEOUT_SECS") {
            Some(s) => s
                .parse()
                .context("STRONGBOX_HTTP_TIMEOUT_SECS must be a positive integer")?,
            None => DEFAULT_HTTP_TIMEOUT_SECS,
        };
        if timeout_secs == 0 {
            anyhow::bail!("STRONGBOX_HTTP_TIMEOUT_SECS must be a positive integer");
        }

        Ok(Config {
            network,
            esplora_url,
            keystore_path,
            fallback_feerate,
            http_timeout: Duration::from_secs(timeout_secs),
        })
    }

    /// Wallet policy for this configuration.
    pub fn wallet_config(&self) -> WalletConfig {
        WalletConfig {
            fallback_feerate: self.fallback_feerate,
            ..WalletConfig::for_network(self.network)
        }
    }
}

fn default_keystore_path() -> Result<PathBuf> {
    let data = dirs::data_dir().context("Could not determine data directory")?;
    Ok(data.join("strongbox").join("keystore.json"))
}
