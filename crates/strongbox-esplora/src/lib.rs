//! # strongbox-esplora — Esplora REST chain provider.
//!
//! Implements [`ChainProvider`] over the Esplora HTTP API served by
//! mempool.space and blockstream.info:
//!
//! | Operation | Request |
//! |---|---|
//! | UTXOs | `GET /address/{address}/utxo` |
//! | Raw transaction | `GET /tx/{txid}/hex` |
//! | Fee estimates | `GET /fee-estimates` |
//! | Broadcast | `POST /tx` (hex body) |
//! | Status | `GET /tx/{txid}` |
//! | Tip height | `GET /blocks/tip/height` |
//! | Address stats | `GET /address/{address}` |
//! | Address history | `GET /address/{address}/txs` |
//!
//! Failures are reported as [`WalletError::ProviderError`]; nothing is retried.

use std::collections::HashMap;
use std::time::Duration;

use bitcoin::{Address, Txid};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use strongbox_wallet::{
    AddressStats, AddressTx, ChainProvider, Network, TxStatus, Utxo, WalletError,
};

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct EsploraUtxo {
    txid: String,
    vout: u32,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct EsploraTx {
    status: EsploraStatus,
}

#[derive(Debug, Deserialize)]
struct EsploraStatus {
    confirmed: bool,
    #[serde(default)]
    block_height: Option<u64>,
}

impl From<EsploraStatus> for TxStatus {
    fn from(status: EsploraStatus) -> Self {
        TxStatus {
            confirmed: status.confirmed,
            block_height: status.block_height,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EsploraAddress {
    #[serde(default)]
    chain_stats: EsploraTxoStats,
    #[serde(default)]
    mempool_stats: EsploraTxoStats,
}

#[derive(Debug, Default, Deserialize)]
struct EsploraTxoStats {
    #[serde(default)]
    funded_txo_sum: u64,
    #[serde(default)]
    spent_txo_sum: u64,
}

#[derive(Debug, Deserialize)]
struct EsploraAddressTx {
    txid: String,
    status: EsploraStatus,
    #[serde(default)]
    fee: Option<u64>,
    #[serde(default)]
    vin: Vec<EsploraVin>,
    #[serde(default)]
    vout: Vec<EsploraVout>,
}

#[derive(Debug, Deserialize)]
struct EsploraVin {
    /// Absent for coinbase inputs.
    #[serde(default)]
    prevout: Option<EsploraVout>,
}

#[derive(Debug, Deserialize)]
struct EsploraVout {
    #[serde(default)]
    scriptpubkey_address: Option<String>,
    value: u64,
}

impl EsploraVout {
    fn pays(&self, address: &str) -> bool {
        self.scriptpubkey_address.as_deref() == Some(address)
    }
}

/// HTTP client for one Esplora instance.
#[derive(Debug, Clone)]
pub struct EsploraClient {
    client: Client,
    base_url: String,
}

impl EsploraClient {
    /// Client for `base_url` (e.g. `https://mempool.space/testnet4/api`).
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, WalletError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WalletError::ProviderError(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    /// Client for the default mempool.space endpoint of `network`.
    pub fn for_network(network: Network) -> Result<Self, WalletError> {
        Self::new(network.default_esplora_url(), DEFAULT_TIMEOUT)
    }

    /// Base URL requests are made against.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get(&self, path: &str) -> Result<Response, WalletError> {
        debug!(path, "esplora request");
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| WalletError::ProviderError(format!("GET {path}: {e}")))?;
        check_status(resp, path).await
    }

    async fn get_text(&self, path: &str) -> Result<String, WalletError> {
        self.get(path)
            .await?
            .text()
            .await
            .map_err(|e| WalletError::ProviderError(format!("GET {path}: {e}")))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, WalletError> {
        self.get(path)
            .await?
            .json()
            .await
            .map_err(|e| WalletError::ProviderError(format!("GET {path}: {e}")))
    }
}

async fn check_status(resp: Response, path: &str) -> Result<Response, WalletError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(WalletError::ProviderError(format!(
        "{path}: HTTP {status}: {}",
        body.trim()
    )))
}

fn parse_txid(raw: &str) -> Result<Txid, WalletError> {
    raw.trim()
        .parse()
        .map_err(|e| WalletError::ProviderError(format!("malformed txid {raw:?}: {e}")))
}

/// Reduce full transactions to what they did for `address`.
fn address_history(address: &str, raw: Vec<EsploraAddressTx>) -> Result<Vec<AddressTx>, WalletError> {
    raw.into_iter()
        .map(|tx| {
            let received = tx.vout.iter().filter(|o| o.pays(address)).map(|o| o.value).sum();
            let sent = tx
                .vin
                .iter()
                .filter_map(|i| i.prevout.as_ref())
                .filter(|o| o.pays(address))
                .map(|o| o.value)
                .sum();
            Ok(AddressTx {
                txid: parse_txid(&tx.txid)?,
                status: tx.status.into(),
                fee: tx.fee,
                received,
                sent,
            })
        })
        .collect()
}

/// Convert the `/fee-estimates` map, dropping non-numeric targets.
fn parse_fee_estimates(raw: HashMap<String, f64>) -> HashMap<u16, f64> {
    raw.into_iter()
        .filter_map(|(target, rate)| target.parse::<u16>().ok().map(|t| (t, rate)))
        .collect()
}

#[async_trait::async_trait]
impl ChainProvider for EsploraClient {
    async fn utxos_for(&self, address: &Address) -> Result<Vec<Utxo>, WalletError> {
        let raw: Vec<EsploraUtxo> = self.get_json(&format!("/address/{address}/utxo")).await?;
        raw.into_iter()
            .map(|u| {
                Ok(Utxo {
                    txid: parse_txid(&u.txid)?,
                    vout: u.vout,
                    value: u.value,
                })
            })
            .collect()
    }

    async fn raw_tx_hex(&self, txid: &Txid) -> Result<String, WalletError> {
        Ok(self.get_text(&format!("/tx/{txid}/hex")).await?.trim().to_owned())
    }

    async fn fee_estimates(&self) -> Result<HashMap<u16, f64>, WalletError> {
        let raw: HashMap<String, f64> = self.get_json("/fee-estimates").await?;
        Ok(parse_fee_estimates(raw))
    }

    async fn broadcast(&self, tx_hex: &str) -> Result<Txid, WalletError> {
        debug!(bytes = tx_hex.len() / 2, "esplora broadcast");
        let resp = self
            .client
            .post(self.url("/tx"))
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(tx_hex.to_owned())
            .send()
            .await
            .map_err(|e| WalletError::ProviderError(format!("POST /tx: {e}")))?;
        let body = check_status(resp, "/tx")
            .await?
            .text()
            .await
            .map_err(|e| WalletError::ProviderError(format!("POST /tx: {e}")))?;
        parse_txid(&body)
    }

    async fn tx_status(&self, txid: &Txid) -> Result<TxStatus, WalletError> {
        let tx: EsploraTx = self.get_json(&format!("/tx/{txid}")).await?;
        Ok(tx.status.into())
    }

    async fn chain_tip_height(&self) -> Result<u64, WalletError> {
        let body = self.get_text("/blocks/tip/height").await?;
        body.trim()
            .parse()
            .map_err(|e| WalletError::ProviderError(format!("tip height {body:?}: {e}")))
    }

    async fn address_stats(&self, address: &Address) -> Result<AddressStats, WalletError> {
        let raw: EsploraAddress = self.get_json(&format!("/address/{address}")).await?;
        Ok(AddressStats {
            chain_funded: raw.chain_stats.funded_txo_sum,
            chain_spent: raw.chain_stats.spent_txo_sum,
            mempool_funded: raw.mempool_stats.funded_txo_sum,
            mempool_spent: raw.mempool_stats.spent_txo_sum,
        })
    }

    async fn address_txs(&self, address: &Address) -> Result<Vec<AddressTx>, WalletError> {
        let raw: Vec<EsploraAddressTx> = self.get_json(&format!("/address/{address}/txs")).await?;
        address_history(&address.to_string(), raw)
    }
}
