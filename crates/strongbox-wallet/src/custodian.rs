//! Custodial wallet operations.
//!
//! [`Custodian`] ties the keystore, coin selection, transaction building and
//! a [`ChainProvider`] together. Each spend runs as one pipeline:
//!
//! ```text
//! validate -> resolve record -> unlock -> derive key -> fetch UTXOs
//!          -> feerate -> select -> fetch previous txs -> build/sign
//!          -> broadcast (send) | return hex (time-locked)
//! ```
//!
//! Caller input is validated before any provider call. The decrypted secret
//! and signing key live only for the duration of one call.

use std::collections::HashMap;

use bitcoin::blockdata::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::Builder;
use bitcoin::{Address, PublicKey, Transaction, Txid};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::builder::{self, SignedTransaction, TransactionBuilder};
use crate::coin_selection::{BuildPlan, CoinSelector};
use crate::config::{MAX_MULTISIG_KEYS, WalletConfig};
use crate::error::WalletError;
use crate::fees::FeerateOracle;
use crate::keys::SigningMaterial;
use crate::keystore::{CreatedWallet, DecryptedSecret, Keystore, KeystoreRecord, WalletKind};
use crate::mnemonic;
use crate::network::{self, Network};
use crate::provider::{AddressTx, ChainProvider};

/// How a request names the wallet to spend from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletRef {
    /// Keystore record id.
    Id(String),
    /// Canonical wallet address.
    Address(String),
}

/// A payment out of a custodial wallet.
#[derive(Clone)]
pub struct PaymentRequest {
    /// Wallet to spend from.
    pub wallet: WalletRef,
    /// Keystore password for the wallet.
    pub password: Zeroizing<String>,
    /// Recipient address.
    pub to: String,
    /// Payment amount in sats.
    pub amount_sats: u64,
    /// Optional address the caller expects the wallet to have.
    pub from_address: Option<String>,
}

impl std::fmt::Debug for PaymentRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentRequest")
            .field("wallet", &self.wallet)
            .field("password", &"[REDACTED]")
            .field("to", &self.to)
            .field("amount_sats", &self.amount_sats)
            .field("from_address", &self.from_address)
            .finish()
    }
}

/// Result of a broadcast payment.
#[derive(Debug, Clone, PartialEq)]
pub struct SendReceipt {
    /// Transaction id reported by the provider.
    pub txid: Txid,
    /// Fee priced from the estimated size and feerate.
    pub fee_sats: u64,
    /// Sub-dust leftover that went to the miner on top of `fee_sats`.
    pub absorbed_sats: u64,
    /// Feerate the transaction was priced at (sat/vB).
    pub feerate: f64,
}

/// A signed, not yet broadcast, time-locked transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeLockedTransaction {
    /// Consensus serialization as hex.
    pub tx_hex: String,
    /// Transaction id.
    pub txid: Txid,
    /// Absolute lock time (UNIX seconds).
    pub lock_time: u32,
    /// Fee priced from the estimated size and feerate.
    pub fee_sats: u64,
    /// Sub-dust leftover that went to the miner on top of `fee_sats`.
    pub absorbed_sats: u64,
    /// Feerate the transaction was priced at (sat/vB).
    pub feerate: f64,
}

/// Confirmation state of a queried transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxState {
    /// Included in a block.
    Confirmed {
        /// `tip - block_height + 1`.
        confirmations: u64,
        /// Height of the containing block.
        block_height: u64,
    },
    /// Known but not yet in a block.
    Unconfirmed,
    /// Status could not be determined.
    Unavailable(String),
}

/// Status entry for one queried txid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxVerification {
    /// The txid as the caller supplied it.
    pub txid: String,
    /// What the provider reported.
    pub state: TxState,
}

/// Balance of one address in sats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Balance {
    pub address: String,
    /// Confirmed funded minus confirmed spent.
    pub confirmed_sats: u64,
    /// Net mempool change, negative while a spend is unconfirmed.
    pub pending_sats: i64,
}

/// Outcome of validating an address string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressCheck {
    /// The address as supplied.
    pub address: String,
    /// Whether it parses as an address on any supported network.
    pub is_valid: bool,
    /// The network it belongs to, when valid.
    pub network: Option<Network>,
    /// Whether that network is the configured one.
    pub matches_configured_network: bool,
}

/// A P2SH multisig address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigAddress {
    /// The P2SH address.
    pub address: String,
    /// Signatures required.
    pub m: usize,
    /// Keys in the script.
    pub n: usize,
    /// Redeem script as hex.
    pub redeem_script: String,
}

/// Custodial wallet service over a chain provider.
pub struct Custodian<P: ChainProvider> {
    keystore: Keystore,
    provider: P,
    config: WalletConfig,
    selector: CoinSelector,
    oracle: FeerateOracle,
}

impl<P: ChainProvider> Custodian<P> {
    /// Create a service. The keystore must be on the configured network.
    pub fn new(keystore: Keystore, provider: P, config: WalletConfig) -> Result<Self, WalletError> {
        if keystore.network() != config.network {
            return Err(WalletError::WrongNetwork(format!(
                "keystore is on {}, service configured for {}",
                keystore.network(),
                config.network
            )));
        }
        let selector = CoinSelector::new(config.fee_policy, config.dust_threshold);
        let oracle = FeerateOracle::new(config.fallback_feerate);
        Ok(Self {
            keystore,
            provider,
            config,
            selector,
            oracle,
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    /// The underlying keystore.
    pub fn keystore(&self) -> &Keystore {
        &self.keystore
    }

    /// The chain provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Create a wallet holding one random key.
    pub fn create_single_wallet(&self, password: &str) -> Result<CreatedWallet, WalletError> {
        let created = self.keystore.create_single(password)?;
        info!(id = %created.id, address = %created.address, "single-key wallet created");
        Ok(created)
    }

    /// Create an HD wallet from a fresh 24-word mnemonic.
    ///
    /// The mnemonic is not returned; use [`retrieve_mnemonic`](Self::retrieve_mnemonic).
    pub fn create_hd_wallet(&self, password: &str) -> Result<CreatedWallet, WalletError> {
        let phrase = mnemonic::generate_mnemonic()?;
        let created = self.keystore.create_hd(&phrase, password)?;
        info!(id = %created.id, address = %created.address, "HD wallet created");
        Ok(created)
    }

    /// Import an HD wallet from an existing mnemonic.
    pub fn import_hd_wallet(&self, phrase: &str, password: &str) -> Result<CreatedWallet, WalletError> {
        mnemonic::parse_mnemonic(phrase)?;
        let created = self.keystore.create_hd(phrase, password)?;
        info!(id = %created.id, address = %created.address, "HD wallet imported");
        Ok(created)
    }

    /// Decrypt and return the mnemonic of an HD wallet.
    pub fn retrieve_mnemonic(&self, wallet_id: &str, password: &str) -> Result<Zeroizing<String>, WalletError> {
        let record = self.keystore.find_by_id(wallet_id)?;
        if record.kind() != WalletKind::Hd {
            return Err(WalletError::WalletNotFound(format!("no HD wallet with id {wallet_id}")));
        }
        match self.keystore.unlock(&record, password)? {
            DecryptedSecret::Mnemonic(phrase) => Ok(phrase),
            DecryptedSecret::Wif(_) => Err(WalletError::IntegrityError(
                "HD record decrypted to a WIF".into(),
            )),
        }
    }

    /// Average near-term feerate in sat/vB.
    pub async fn estimate_feerate(&self) -> Result<f64, WalletError> {
        self.oracle.average_feerate(&self.provider).await
    }

    /// Build, sign and broadcast a payment.
    pub async fn send(&self, request: &PaymentRequest) -> Result<SendReceipt, WalletError> {
        let (signed, plan) = self.sign_payment(request, None).await?;
        let broadcast_txid = self.provider.broadcast(&signed.to_hex()).await?;
        if broadcast_txid != signed.txid() {
            warn!(local = %signed.txid(), reported = %broadcast_txid, "provider reported a different txid");
        }
        info!(
            txid = %broadcast_txid,
            amount = request.amount_sats,
            fee = plan.fee,
            absorbed = plan.absorbed_dust(),
            feerate = plan.feerate,
            "payment broadcast"
        );
        Ok(SendReceipt {
            txid: broadcast_txid,
            fee_sats: plan.fee,
            absorbed_sats: plan.absorbed_dust(),
            feerate: plan.feerate,
        })
    }

    /// Build and sign a payment that cannot be mined before `unlock_time`.
    ///
    /// The transaction is returned, not broadcast.
    pub async fn create_time_locked_transaction(
        &self,
        request: &PaymentRequest,
        unlock_time: u64,
    ) -> Result<TimeLockedTransaction, WalletError> {
        let (signed, plan) = self.sign_payment(request, Some(unlock_time)).await?;
        let lock_time = signed.tx().lock_time.to_consensus_u32();
        info!(txid = %signed.txid(), lock_time, "time-locked transaction signed");
        Ok(TimeLockedTransaction {
            tx_hex: signed.to_hex(),
            txid: signed.txid(),
            lock_time,
            fee_sats: plan.fee,
            absorbed_sats: plan.absorbed_dust(),
            feerate: plan.feerate,
        })
    }

    async fn sign_payment(
        &self,
        request: &PaymentRequest,
        unlock_time: Option<u64>,
    ) -> Result<(SignedTransaction, BuildPlan), WalletError> {
        if request.password.is_empty() {
            return Err(WalletError::EmptyPassword);
        }
        let payee = network::parse_address(&request.to, self.config.network)?;
        self.selector.check_amount(request.amount_sats)?;
        let now = unix_now();
        let lock_time = unlock_time
            .map(|t| {
                let t = u32::try_from(t)
                    .map_err(|_| WalletError::InvalidLockTime(format!("{t} does not fit a lock time")))?;
                builder::lock_time_after(t, now).map(|_| t)
            })
            .transpose()?;

        let record = self.resolve(&request.wallet)?;
        let material = self.signing_material(&record, &request.password)?;
        if let Some(hint) = &request.from_address {
            let expected = material.address().to_string();
            if hint.trim() != expected {
                return Err(WalletError::AddressMismatch {
                    expected,
                    actual: hint.trim().to_string(),
                });
            }
        }

        let utxos = self.provider.utxos_for(material.address()).await?;
        if utxos.is_empty() {
            return Err(WalletError::NoUtxos);
        }
        let feerate = self.oracle.average_feerate(&self.provider).await?;
        let mut plan = self.selector.select(
            &utxos,
            &payee,
            request.amount_sats,
            material.address(),
            feerate,
        )?;
        if let Some(t) = lock_time {
            plan = plan.with_lock_time(t);
        }

        let unsigned = TransactionBuilder::new().build(&plan, now)?;
        let prev_txs = self.previous_transactions(&plan).await?;
        let signed = TransactionBuilder::sign(unsigned, &prev_txs, &material)?;
        Ok((signed, plan))
    }

    fn resolve(&self, wallet: &WalletRef) -> Result<KeystoreRecord, WalletError> {
        match wallet {
            WalletRef::Id(id) => self.keystore.find_by_id(id),
            WalletRef::Address(address) => self.keystore.find_by_address(address),
        }
    }

    fn signing_material(&self, record: &KeystoreRecord, password: &str) -> Result<SigningMaterial, WalletError> {
        let secret = self.keystore.unlock(record, password)?;
        let material = secret.signing_material(self.config.network)?;
        drop(secret);
        if material.address().to_string() != record.address {
            return Err(WalletError::IntegrityError(format!(
                "record {} address does not match its key",
                record.id
            )));
        }
        Ok(material)
    }

    async fn previous_transactions(&self, plan: &BuildPlan) -> Result<Vec<Transaction>, WalletError> {
        let mut fetched: HashMap<Txid, Transaction> = HashMap::new();
        let mut prev_txs = Vec::with_capacity(plan.selected.len());
        for utxo in &plan.selected {
            let tx = match fetched.get(&utxo.txid) {
                Some(tx) => tx.clone(),
                None => {
                    let raw = self.provider.raw_tx_hex(&utxo.txid).await?;
                    let tx = builder::decode_transaction_hex(&raw).map_err(|e| {
                        WalletError::ProviderError(format!("previous transaction {}: {e}", utxo.txid))
                    })?;
                    fetched.insert(utxo.txid, tx.clone());
                    tx
                }
            };
            prev_txs.push(tx);
        }
        Ok(prev_txs)
    }

    /// Look up confirmation counts for a batch of txids.
    ///
    /// Failures for individual txids are reported in their entry.
    pub async fn verify_transactions(&self, txids: &[String]) -> Result<Vec<TxVerification>, WalletError> {
        let tip = self.provider.chain_tip_height().await?;
        let mut results = Vec::with_capacity(txids.len());
        for raw in txids {
            let state = match raw.trim().parse::<Txid>() {
                Err(e) => TxState::Unavailable(format!("invalid txid: {e}")),
                Ok(txid) => match self.provider.tx_status(&txid).await {
                    Ok(status) => match (status.confirmed, status.block_height) {
                        (true, Some(height)) => TxState::Confirmed {
                            confirmations: tip.saturating_sub(height).saturating_add(1),
                            block_height: height,
                        },
                        _ => TxState::Unconfirmed,
                    },
                    Err(e) => TxState::Unavailable(e.to_string()),
                },
            };
            results.push(TxVerification {
                txid: raw.clone(),
                state,
            });
        }
        Ok(results)
    }

    /// Confirmed and pending balance of `address` on the configured network.
    pub async fn balance(&self, address: &str) -> Result<Balance, WalletError> {
        let parsed = network::parse_address(address, self.config.network)?;
        let stats = self.provider.address_stats(&parsed).await?;
        Ok(Balance {
            address: parsed.to_string(),
            confirmed_sats: stats.confirmed(),
            pending_sats: stats.pending(),
        })
    }

    /// Transaction history of `address`, newest first.
    pub async fn transactions(&self, address: &str) -> Result<Vec<AddressTx>, WalletError> {
        let parsed = network::parse_address(address, self.config.network)?;
        self.provider.address_txs(&parsed).await
    }

    /// Classify an address against the supported networks.
    pub fn validate_address(&self, address: &str) -> AddressCheck {
        let detected = network::detect_network(address);
        AddressCheck {
            address: address.to_string(),
            is_valid: detected.is_some(),
            network: detected,
            matches_configured_network: detected == Some(self.config.network),
        }
    }

    /// Derive an `m`-of-`n` P2SH multisig address from hex public keys.
    ///
    /// Keys are used in the order given.
    pub fn create_multisig_address(&self, pubkeys: &[String], m: usize) -> Result<MultisigAddress, WalletError> {
        create_multisig_address(pubkeys, m, self.config.network)
    }

    /// Addresses of all keystore records.
    pub fn addresses(&self) -> Result<Vec<String>, WalletError> {
        self.keystore.addresses()
    }
}

/// Derive an `m`-of-`n` P2SH multisig address for `network`.
pub fn create_multisig_address(
    pubkeys: &[String],
    m: usize,
    network: Network,
) -> Result<MultisigAddress, WalletError> {
    let n = pubkeys.len();
    if n == 0 || n > MAX_MULTISIG_KEYS {
        return Err(WalletError::InvalidAmount(format!(
            "multisig needs 1 to {MAX_MULTISIG_KEYS} keys, got {n}"
        )));
    }
    if m == 0 || m > n {
        return Err(WalletError::InvalidAmount(format!(
            "required signatures must be between 1 and {n}, got {m}"
        )));
    }

    let mut script = Builder::new().push_int(m as i64);
    for hex_key in pubkeys {
        let key = hex_key
            .trim()
            .parse::<PublicKey>()
            .map_err(|e| WalletError::DecodeError(format!("public key {hex_key}: {e}")))?;
        script = script.push_key(&key);
    }
    let redeem_script = script
        .push_int(n as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script();
    let address = Address::p2sh(&redeem_script, network.to_bitcoin())
        .map_err(|e| WalletError::KeyDerivation(format!("redeem script: {e}")))?;

    Ok(MultisigAddress {
        address: address.to_string(),
        m,
        n,
        redeem_script: redeem_script.to_hex_string(),
    })
}

fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}
