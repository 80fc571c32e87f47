//! Fee policy and feerate oracle.
//!
//! Fees are `ceil(vbytes * feerate)` with the size taken from a worst-case
//! model ([`FeePolicy`]) before signing, or from the serialized length of a
//! signed transaction afterwards.

use std::collections::HashMap;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::WalletError;
use crate::provider::ChainProvider;

/// Outputs below this value are not relayed.
pub const DEFAULT_DUST_THRESHOLD: u64 = 546;

/// Feerate used for confirmation targets the provider does not report.
pub const DEFAULT_FALLBACK_FEERATE: f64 = 5.0;

/// Confirmation targets averaged by the oracle.
pub const FEE_TARGETS: RangeInclusive<u16> = 1..=6;

/// Linear transaction size model in vbytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeePolicy {
    /// Fixed overhead per transaction.
    pub base_vbytes: u64,
    /// Size charged per input.
    pub input_vbytes: u64,
    /// Size charged per output.
    pub output_vbytes: u64,
}

impl FeePolicy {
    /// Legacy P2PKH sizes. Overestimates segwit spends, never underpays.
    pub const fn legacy() -> Self {
        Self {
            base_vbytes: 10,
            input_vbytes: 148,
            output_vbytes: 34,
        }
    }

    /// Native segwit P2WPKH sizes (base rounded up).
    pub const fn p2wpkh() -> Self {
        Self {
            base_vbytes: 11,
            input_vbytes: 68,
            output_vbytes: 31,
        }
    }

    /// Estimated size for a transaction shape.
    pub fn vbytes(&self, inputs: usize, outputs: usize) -> u64 {
        self.base_vbytes
            .saturating_add(self.input_vbytes.saturating_mul(inputs as u64))
            .saturating_add(self.output_vbytes.saturating_mul(outputs as u64))
    }

    /// Estimated fee for a transaction shape at `feerate` sat/vB.
    pub fn fee(&self, inputs: usize, outputs: usize, feerate: f64) -> u64 {
        fee_for_vbytes(self.vbytes(inputs, outputs), feerate)
    }
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self::legacy()
    }
}

/// `ceil(vbytes * feerate)`.
pub fn fee_for_vbytes(vbytes: u64, feerate: f64) -> u64 {
    (vbytes as f64 * feerate).ceil() as u64
}

/// Fee measured from a signed transaction's full serialized length.
///
/// The length includes witness bytes at full weight, so for segwit inputs
/// this overstates the virtual size and the resulting fee.
pub fn fee_for_signed_tx(serialized_len: usize, feerate: f64) -> u64 {
    fee_for_vbytes(serialized_len as u64, feerate)
}

/// Reject feerates that cannot price a transaction.
pub fn check_feerate(feerate: f64) -> Result<(), WalletError> {
    if feerate.is_finite() && feerate > 0.0 {
        Ok(())
    } else {
        Err(WalletError::InvalidAmount(format!("feerate {feerate} sat/vB")))
    }
}

/// Arithmetic mean of the estimates for [`FEE_TARGETS`].
///
/// Missing, non-positive or non-finite targets count as `fallback`.
pub fn average_of_targets(estimates: &HashMap<u16, f64>, fallback: f64) -> f64 {
    let count = FEE_TARGETS.len() as f64;
    let sum: f64 = FEE_TARGETS
        .map(|target| match estimates.get(&target) {
            Some(&rate) if rate.is_finite() && rate > 0.0 => rate,
            _ => fallback,
        })
        .sum();
    sum / count
}

/// Averages provider estimates over the near-term confirmation targets.
#[derive(Debug, Clone, Copy)]
pub struct FeerateOracle {
    fallback: f64,
}

impl FeerateOracle {
    /// Oracle with a custom fallback feerate.
    pub fn new(fallback: f64) -> Self {
        Self { fallback }
    }

    /// Fallback applied to missing targets.
    pub fn fallback(&self) -> f64 {
        self.fallback
    }

    /// Fetch estimates and average them.
    pub async fn average_feerate(&self, provider: &dyn ChainProvider) -> Result<f64, WalletError> {
        let estimates = provider.fee_estimates().await?;
        let feerate = average_of_targets(&estimates, self.fallback);
        debug!(feerate, reported = estimates.len(), "averaged feerate");
        Ok(feerate)
    }
}

impl Default for FeerateOracle {
    fn default() -> Self {
        Self::new(DEFAULT_FALLBACK_FEERATE)
    }
}
