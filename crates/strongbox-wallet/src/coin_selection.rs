//! Greedy coin selection with worst-case fee estimation.
//!
//! UTXOs are accumulated in the order the provider returned them. After each
//! addition the fee is re-estimated for a two-output transaction; if the
//! projected change would be dust the single-output fee is used instead.
//! Selection stops at the first prefix that covers payment plus fee.

use bitcoin::Address;
use tracing::debug;

use crate::error::WalletError;
use crate::fees::{self, DEFAULT_DUST_THRESHOLD, FeePolicy};
use crate::provider::Utxo;

/// An output of the planned transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedOutput {
    /// Destination address.
    pub address: Address,
    /// Value in sats.
    pub value: u64,
}

/// Everything needed to build the transaction, decided before signing.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildPlan {
    /// UTXOs to spend, in selection order.
    pub selected: Vec<Utxo>,
    /// Sum of selected values in sats.
    pub total_input: u64,
    /// Estimated fee in sats.
    pub fee: u64,
    /// Feerate the fee was priced at (sat/vB).
    pub feerate: f64,
    /// Payment to the recipient.
    pub payment: PlannedOutput,
    /// Change back to the wallet, when it clears the dust threshold.
    pub change: Option<PlannedOutput>,
    /// Absolute lock time as a UNIX timestamp.
    pub lock_time: Option<u32>,
}

impl BuildPlan {
    /// Outputs in transaction order: payment first, then change.
    pub fn outputs(&self) -> impl Iterator<Item = &PlannedOutput> {
        std::iter::once(&self.payment).chain(self.change.as_ref())
    }

    /// Value not assigned to any output (goes to miners).
    pub fn implied_fee(&self) -> u64 {
        let assigned: u64 = self.outputs().map(|o| o.value).sum();
        self.total_input.saturating_sub(assigned)
    }

    /// Part of [`Self::implied_fee`] beyond the priced fee.
    pub fn absorbed_dust(&self) -> u64 {
        self.implied_fee().saturating_sub(self.fee)
    }

    /// Attach an absolute lock time.
    pub fn with_lock_time(mut self, unix_time: u32) -> Self {
        self.lock_time = Some(unix_time);
        self
    }
}

/// Greedy selector over provider-ordered UTXOs.
#[derive(Debug, Clone, Copy)]
pub struct CoinSelector {
    policy: FeePolicy,
    dust_threshold: u64,
}

impl CoinSelector {
    /// Selector with a custom size model and dust threshold.
    pub fn new(policy: FeePolicy, dust_threshold: u64) -> Self {
        Self {
            policy,
            dust_threshold,
        }
    }

    /// The size model in use.
    pub fn policy(&self) -> &FeePolicy {
        &self.policy
    }

    /// The dust threshold in sats.
    pub fn dust_threshold(&self) -> u64 {
        self.dust_threshold
    }

    /// Reject payment amounts that can never be sent.
    pub fn check_amount(&self, amount: u64) -> Result<(), WalletError> {
        if amount == 0 {
            return Err(WalletError::InvalidAmount("amount must be non-zero".into()));
        }
        if amount < self.dust_threshold {
            return Err(WalletError::BelowDustThreshold {
                amount,
                threshold: self.dust_threshold,
            });
        }
        Ok(())
    }

    /// Select a minimal prefix of `utxos` paying `amount` to `payee`.
    ///
    /// # Arguments
    /// - `utxos` — spendable outputs, in provider order
    /// - `payee` — recipient address
    /// - `amount` — payment in sats (excluding fee)
    /// - `change_address` — the wallet's own address for change
    /// - `feerate` — sat/vB
    pub fn select(
        &self,
        utxos: &[Utxo],
        payee: &Address,
        amount: u64,
        change_address: &Address,
        feerate: f64,
    ) -> Result<BuildPlan, WalletError> {
        self.check_amount(amount)?;
        fees::check_feerate(feerate)?;
        if utxos.is_empty() {
            return Err(WalletError::NoUtxos);
        }

        let mut total: u64 = 0;
        for (i, utxo) in utxos.iter().enumerate() {
            total = total.saturating_add(utxo.value);
            let inputs = i + 1;

            let fee_with_change = self.policy.fee(inputs, 2, feerate);
            let projected_change = total
                .checked_sub(amount)
                .and_then(|rest| rest.checked_sub(fee_with_change));
            let outputs = match projected_change {
                Some(change) if change >= self.dust_threshold => 2,
                _ => 1,
            };
            let fee = self.policy.fee(inputs, outputs, feerate);

            if total >= amount.saturating_add(fee) {
                let leftover = total - amount - fee;
                let change = (leftover >= self.dust_threshold).then(|| PlannedOutput {
                    address: change_address.clone(),
                    value: leftover,
                });
                debug!(
                    inputs,
                    total,
                    fee,
                    change = change.as_ref().map_or(0, |c| c.value),
                    "coin selection complete"
                );
                return Ok(BuildPlan {
                    selected: utxos[..inputs].to_vec(),
                    total_input: total,
                    fee,
                    feerate,
                    payment: PlannedOutput {
                        address: payee.clone(),
                        value: amount,
                    },
                    change,
                    lock_time: None,
                });
            }
        }

        Err(WalletError::InsufficientFunds {
            have: total,
            need: amount.saturating_add(self.policy.fee(utxos.len(), 1, feerate)),
        })
    }
}

impl Default for CoinSelector {
    fn default() -> Self {
        Self::new(FeePolicy::default(), DEFAULT_DUST_THRESHOLD)
    }
}
