//! Blockchain data provider interface.
//!
//! The wallet never talks to the network directly. Everything it needs from
//! the chain goes through [`ChainProvider`], implemented over HTTP by
//! `strongbox-esplora` and by in-memory mocks in tests.

use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::{Address, OutPoint, Txid};

use crate::error::WalletError;

/// An unspent output owned by a wallet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Utxo {
    /// Funding transaction id.
    pub txid: Txid,
    /// Output index within the funding transaction.
    pub vout: u32,
    /// Value in sats.
    pub value: u64,
}

impl Utxo {
    /// The outpoint this UTXO occupies.
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }
}

/// Mempool/chain status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxStatus {
    /// Whether the transaction is in a block.
    pub confirmed: bool,
    /// Height of the containing block, when confirmed.
    pub block_height: Option<u64>,
}

/// Funded and spent output totals for one address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressStats {
    /// Sats received in confirmed transactions.
    pub chain_funded: u64,
    /// Sats spent by confirmed transactions.
    pub chain_spent: u64,
    /// Sats received in mempool transactions.
    pub mempool_funded: u64,
    /// Sats spent by mempool transactions.
    pub mempool_spent: u64,
}

impl AddressStats {
    /// Confirmed balance.
    pub fn confirmed(&self) -> u64 {
        self.chain_funded.saturating_sub(self.chain_spent)
    }

    /// Net mempool change; negative while an outgoing spend is unconfirmed.
    pub fn pending(&self) -> i64 {
        let funded = i64::try_from(self.mempool_funded).unwrap_or(i64::MAX);
        let spent = i64::try_from(self.mempool_spent).unwrap_or(i64::MAX);
        funded.saturating_sub(spent)
    }
}

/// A transaction touching an address, as seen from that address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressTx {
    pub txid: Txid,
    pub status: TxStatus,
    /// Miner fee, when the provider knows it.
    pub fee: Option<u64>,
    /// Sats paid to the address.
    pub received: u64,
    /// Sats the address contributed as inputs.
    pub sent: u64,
}

impl AddressTx {
    /// Net effect on the address balance.
    pub fn net(&self) -> i64 {
        let received = i64::try_from(self.received).unwrap_or(i64::MAX);
        let sent = i64::try_from(self.sent).unwrap_or(i64::MAX);
        received.saturating_sub(sent)
    }
}

/// Read/broadcast access to a Bitcoin-like chain.
#[async_trait::async_trait]
pub trait ChainProvider: Send + Sync {
    /// Unspent outputs paying to `address`, in provider order.
    async fn utxos_for(&self, address: &Address) -> Result<Vec<Utxo>, WalletError>;

    /// Full serialized transaction as hex.
    async fn raw_tx_hex(&self, txid: &Txid) -> Result<String, WalletError>;

    /// Feerate estimates in sat/vB keyed by confirmation target (blocks).
    async fn fee_estimates(&self) -> Result<HashMap<u16, f64>, WalletError>;

    /// Submit a raw transaction and return the txid the provider reports.
    async fn broadcast(&self, tx_hex: &str) -> Result<Txid, WalletError>;

    /// Confirmation status of a transaction.
    async fn tx_status(&self, txid: &Txid) -> Result<TxStatus, WalletError>;

    /// Height of the current best block.
    async fn chain_tip_height(&self) -> Result<u64, WalletError>;

    /// Confirmed and mempool output totals for `address`.
    async fn address_stats(&self, address: &Address) -> Result<AddressStats, WalletError>;

    /// Transactions touching `address`, newest first.
    async fn address_txs(&self, address: &Address) -> Result<Vec<AddressTx>, WalletError>;
}

#[async_trait::async_trait]
impl<P: ChainProvider + ?Sized> ChainProvider for Arc<P> {
    async fn utxos_for(&self, address: &Address) -> Result<Vec<Utxo>, WalletError> {
        (**self).utxos_for(address).await
    }

    async fn raw_tx_hex(&self, txid: &Txid) -> Result<String, WalletError> {
        (**self).raw_tx_hex(txid).await
    }

    async fn fee_estimates(&self) -> Result<HashMap<u16, f64>, WalletError> {
        (**self).fee_estimates().await
    }

    async fn broadcast(&self, tx_hex: &str) -> Result<Txid, WalletError> {
        (**self).broadcast(tx_hex).await
    }

    async fn tx_status(&self, txid: &Txid) -> Result<TxStatus, WalletError> {
        (**self).tx_status(txid).await
    }

    async fn chain_tip_height(&self) -> Result<u64, WalletError> {
        (**self).chain_tip_height().await
    }

    async fn address_stats(&self, address: &Address) -> Result<AddressStats, WalletError> {
        (**self).address_stats(address).await
    }

    async fn address_txs(&self, address: &Address) -> Result<Vec<AddressTx>, WalletError> {
        (**self).address_txs(address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_split_confirmed_and_pending() {
        let stats = AddressStats {
            chain_funded: 100_000,
            chain_spent: 40_000,
            mempool_funded: 5_000,
            mempool_spent: 60_000,
        };
        assert_eq!(stats.confirmed(), 60_000);
        assert_eq!(stats.pending(), -55_000);
        assert_eq!(AddressStats::default().pending(), 0);
    }
}
