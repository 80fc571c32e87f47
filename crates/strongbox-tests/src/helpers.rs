//! Shared helpers for end-to-end and property tests.

use std::collections::HashMap;

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use parking_lot::Mutex;
use strongbox_wallet::builder::decode_transaction_hex;
use strongbox_wallet::{
    AddressStats, AddressTx, ChainProvider, KdfParams, TxStatus, Utxo, WalletConfig, WalletError,
};

/// Testnet P2WPKH address (BIP-173 test vector) used as a payee.
pub const PAYEE: &str = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";

/// BIP-39 test vector mnemonic.
pub const MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

/// Create a funding transaction paying `value` to `script`.
///
/// `salt` goes into the dummy input's vout so each call yields a distinct txid.
pub fn funding_tx(script: ScriptBuf, value: u64, salt: u32) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(Txid::all_zeros(), salt),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: script,
        }],
    }
}

/// Synthetic UTXO with a txid derived from `index`.
pub fn utxo(index: u32, value: u64) -> Utxo {
    let mut bytes = [0u8; 32];
    bytes[..4].copy_from_slice(&index.to_le_bytes());
    Utxo {
        txid: Txid::from_byte_array(bytes),
        vout: 0,
        value,
    }
}

/// Testnet wallet policy with cheap Argon2id parameters.
pub fn test_config() -> WalletConfig {
    WalletConfig {
        kdf: KdfParams::light(),
        ..WalletConfig::default()
    }
}

/// Flat estimates for confirmation targets 1..=6.
pub fn flat_estimates(rate: f64) -> HashMap<u16, f64> {
    (1..=6).map(|target| (target, rate)).collect()
}

#[derive(Default)]
struct ChainState {
    utxos: HashMap<ScriptBuf, Vec<Utxo>>,
    txs: HashMap<Txid, Transaction>,
    /// Txids in the order they reached the chain.
    order: Vec<Txid>,
    estimates: HashMap<u16, f64>,
    statuses: HashMap<Txid, TxStatus>,
    tip: u64,
    broadcasts: Vec<Transaction>,
    calls: usize,
    reject_broadcasts: bool,
    raw_tx_override: Option<String>,
    next_salt: u32,
}

impl ChainState {
    fn status(&self, txid: &Txid) -> TxStatus {
        self.statuses.get(txid).copied().unwrap_or(TxStatus {
            confirmed: false,
            block_height: None,
        })
    }

    fn prevout(&self, outpoint: &OutPoint) -> Option<&TxOut> {
        self.txs
            .get(&outpoint.txid)
            .and_then(|tx| tx.output.get(outpoint.vout as usize))
    }

    /// What each known transaction did for `script`, newest first.
    fn history(&self, script: &ScriptBuf) -> Vec<AddressTx> {
        self.order
            .iter()
            .rev()
            .filter_map(|txid| {
                let tx = self.txs.get(txid)?;
                let received: u64 = tx
                    .output
                    .iter()
                    .filter(|o| &o.script_pubkey == script)
                    .map(|o| o.value.to_sat())
                    .sum();
                let prevouts: Vec<Option<&TxOut>> =
                    tx.input.iter().map(|i| self.prevout(&i.previous_output)).collect();
                let sent: u64 = prevouts
                    .iter()
                    .flatten()
                    .filter(|o| &o.script_pubkey == script)
                    .map(|o| o.value.to_sat())
                    .sum();
                if received == 0 && sent == 0 {
                    return None;
                }
                let fee = prevouts
                    .iter()
                    .map(|o| o.map(|o| o.value.to_sat()))
                    .sum::<Option<u64>>()
                    .map(|input| input.saturating_sub(tx.output.iter().map(|o| o.value.to_sat()).sum::<u64>()));
                Some(AddressTx {
                    txid: *txid,
                    status: self.status(txid),
                    fee,
                    received,
                    sent,
                })
            })
            .collect()
    }
}

/// In-memory chain that applies broadcast transactions to its UTXO set.
///
/// Broadcasting a transaction spends its inputs and credits its outputs, so
/// consecutive payments from one wallet see their own change.
#[derive(Default)]
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain whose estimates report `rate` for every target.
    pub fn with_feerate(rate: f64) -> Self {
        let chain = Self::new();
        chain.set_estimates(flat_estimates(rate));
        chain
    }

    pub fn set_estimates(&self, estimates: HashMap<u16, f64>) {
        self.state.lock().estimates = estimates;
    }

    pub fn set_tip(&self, height: u64) {
        self.state.lock().tip = height;
    }

    /// Mark `txid` as mined at `height`.
    pub fn confirm(&self, txid: Txid, height: u64) {
        self.state.lock().statuses.insert(
            txid,
            TxStatus {
                confirmed: true,
                block_height: Some(height),
            },
        );
    }

    /// Make every later broadcast fail.
    pub fn reject_broadcasts(&self) {
        self.state.lock().reject_broadcasts = true;
    }

    /// Serve `body` for every raw transaction request.
    pub fn serve_raw_txs_as(&self, body: &str) {
        self.state.lock().raw_tx_override = Some(body.to_string());
    }

    /// Pay `value` to `address` in a new funding transaction.
    pub fn fund(&self, address: &Address, value: u64) -> Txid {
        let mut state = self.state.lock();
        let salt = state.next_salt;
        state.next_salt += 1;
        let tx = funding_tx(address.script_pubkey(), value, salt);
        let txid = tx.compute_txid();
        state
            .utxos
            .entry(address.script_pubkey())
            .or_default()
            .push(Utxo { txid, vout: 0, value });
        state.statuses.insert(
            txid,
            TxStatus {
                confirmed: false,
                block_height: None,
            },
        );
        state.txs.insert(txid, tx);
        state.order.push(txid);
        txid
    }

    /// Total unspent value held by `address`.
    pub fn balance(&self, address: &Address) -> u64 {
        self.state
            .lock()
            .utxos
            .get(&address.script_pubkey())
            .map_or(0, |utxos| utxos.iter().map(|u| u.value).sum())
    }

    /// Transactions accepted by [`ChainProvider::broadcast`], in order.
    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.state.lock().broadcasts.clone()
    }

    /// Number of provider calls made so far.
    pub fn calls(&self) -> usize {
        self.state.lock().calls
    }

    fn apply(state: &mut ChainState, tx: &Transaction) {
        for input in &tx.input {
            for utxos in state.utxos.values_mut() {
                utxos.retain(|u| u.outpoint() != input.previous_output);
            }
        }
        let txid = tx.compute_txid();
        for (vout, output) in tx.output.iter().enumerate() {
            state
                .utxos
                .entry(output.script_pubkey.clone())
                .or_default()
                .push(Utxo {
                    txid,
                    vout: vout as u32,
                    value: output.value.to_sat(),
                });
        }
        state.statuses.insert(
            txid,
            TxStatus {
                confirmed: false,
                block_height: None,
            },
        );
        state.txs.insert(txid, tx.clone());
        state.order.push(txid);
        state.broadcasts.push(tx.clone());
    }
}

#[async_trait]
impl ChainProvider for MockChain {
    async fn utxos_for(&self, address: &Address) -> Result<Vec<Utxo>, WalletError> {
        let mut state = self.state.lock();
        state.calls += 1;
        Ok(state
            .utxos
            .get(&address.script_pubkey())
            .cloned()
            .unwrap_or_default())
    }

    async fn raw_tx_hex(&self, txid: &Txid) -> Result<String, WalletError> {
        let mut state = self.state.lock();
        state.calls += 1;
        if let Some(body) = &state.raw_tx_override {
            return Ok(body.clone());
        }
        state
            .txs
            .get(txid)
            .map(serialize_hex)
            .ok_or_else(|| WalletError::ProviderError(format!("unknown transaction {txid}")))
    }

    async fn fee_estimates(&self) -> Result<HashMap<u16, f64>, WalletError> {
        let mut state = self.state.lock();
        state.calls += 1;
        Ok(state.estimates.clone())
    }

    async fn broadcast(&self, tx_hex: &str) -> Result<Txid, WalletError> {
        let mut state = self.state.lock();
        state.calls += 1;
        if state.reject_broadcasts {
            return Err(WalletError::ProviderError("broadcast rejected".into()));
        }
        let tx = decode_transaction_hex(tx_hex)?;
        Self::apply(&mut state, &tx);
        Ok(tx.compute_txid())
    }

    async fn tx_status(&self, txid: &Txid) -> Result<TxStatus, WalletError> {
        let mut state = self.state.lock();
        state.calls += 1;
        state
            .statuses
            .get(txid)
            .copied()
            .ok_or_else(|| WalletError::ProviderError(format!("unknown transaction {txid}")))
    }

    async fn chain_tip_height(&self) -> Result<u64, WalletError> {
        let mut state = self.state.lock();
        state.calls += 1;
        Ok(state.tip)
    }

    async fn address_stats(&self, address: &Address) -> Result<AddressStats, WalletError> {
        let mut state = self.state.lock();
        state.calls += 1;
        let mut stats = AddressStats::default();
        for entry in state.history(&address.script_pubkey()) {
            if entry.status.confirmed {
                stats.chain_funded += entry.received;
                stats.chain_spent += entry.sent;
            } else {
                stats.mempool_funded += entry.received;
                stats.mempool_spent += entry.sent;
            }
        }
        Ok(stats)
    }

    async fn address_txs(&self, address: &Address) -> Result<Vec<AddressTx>, WalletError> {
        let mut state = self.state.lock();
        state.calls += 1;
        Ok(state.history(&address.script_pubkey()))
    }
}
