//! Transaction building and signing.
//!
//! 1. [`TransactionBuilder::build`] turns a [`BuildPlan`] into an unsigned
//!    transaction (RBF sequence, optional absolute lock time).
//! 2. [`TransactionBuilder::sign`] checks each input against its previous
//!    transaction and signs it with the wallet key.
//!
//! A transaction is only returned once every input is signed.

use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode;
use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Amount, PublicKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use tracing::debug;

use crate::coin_selection::BuildPlan;
use crate::error::WalletError;
use crate::fees;
use crate::keys::SigningMaterial;
use crate::provider::Utxo;

/// Input sequence signalling replace-by-fee with absolute lock time enabled.
pub const RBF_SEQUENCE: Sequence = Sequence::ENABLE_RBF_NO_LOCKTIME;

/// Transaction version used for all spends.
pub const TX_VERSION: Version = Version::TWO;

/// A transaction awaiting signatures.
#[derive(Debug, Clone)]
pub struct UnsignedTransaction {
    /// The transaction with empty script sigs and witnesses.
    pub tx: Transaction,
    /// The UTXO each input spends, index-aligned with `tx.input`.
    pub spends: Vec<Utxo>,
}

/// A fully signed transaction and its serialization.
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    tx: Transaction,
    bytes: Vec<u8>,
    txid: Txid,
}

impl SignedTransaction {
    fn new(tx: Transaction) -> Self {
        let bytes = encode::serialize(&tx);
        let txid = tx.compute_txid();
        Self { tx, bytes, txid }
    }

    /// The signed transaction.
    pub fn tx(&self) -> &Transaction {
        &self.tx
    }

    /// Consensus serialization.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consensus serialization as lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// Transaction id.
    pub fn txid(&self) -> Txid {
        self.txid
    }

    /// Virtual size in vbytes.
    pub fn vsize(&self) -> usize {
        self.tx.vsize()
    }

    /// Fee priced on the full serialized length. See [`fees::fee_for_signed_tx`].
    pub fn fee_from_length(&self, feerate: f64) -> u64 {
        fees::fee_for_signed_tx(self.bytes.len(), feerate)
    }
}

/// Decode a hex-encoded consensus transaction.
pub fn decode_transaction_hex(raw: &str) -> Result<Transaction, WalletError> {
    let bytes = hex::decode(raw.trim()).map_err(|e| WalletError::DecodeError(format!("tx hex: {e}")))?;
    encode::deserialize(&bytes).map_err(|e| WalletError::DecodeError(format!("tx bytes: {e}")))
}

/// Builder for unsigned and signed transactions.
///
/// # Example
/// ```ignore
/// let unsigned = TransactionBuilder::new().build(&plan, now)?;
/// let signed = TransactionBuilder::sign(unsigned, &prev_txs, &material)?;
/// ```
pub struct TransactionBuilder {
    version: Version,
    sequence: Sequence,
}

impl TransactionBuilder {
    /// Builder with version 2 and the RBF sequence.
    pub fn new() -> Self {
        Self {
            version: TX_VERSION,
            sequence: RBF_SEQUENCE,
        }
    }

    /// Override the input sequence (default: [`RBF_SEQUENCE`]).
    pub fn set_sequence(&mut self, sequence: Sequence) -> &mut Self {
        self.sequence = sequence;
        self
    }

    /// Build an unsigned transaction from a plan.
    ///
    /// `now` is the current UNIX time in seconds; a planned lock time must be
    /// strictly later.
    pub fn build(&self, plan: &BuildPlan, now: u64) -> Result<UnsignedTransaction, WalletError> {
        if plan.selected.is_empty() {
            return Err(WalletError::NoUtxos);
        }
        let lock_time = match plan.lock_time {
            Some(unix_time) => lock_time_after(unix_time, now)?,
            None => LockTime::ZERO,
        };

        let input = plan
            .selected
            .iter()
            .map(|utxo| TxIn {
                previous_output: utxo.outpoint(),
                script_sig: ScriptBuf::new(),
                sequence: self.sequence,
                witness: Witness::new(),
            })
            .collect();
        let output = plan
            .outputs()
            .map(|o| TxOut {
                value: Amount::from_sat(o.value),
                script_pubkey: o.address.script_pubkey(),
            })
            .collect();

        Ok(UnsignedTransaction {
            tx: Transaction {
                version: self.version,
                lock_time,
                input,
                output,
            },
            spends: plan.selected.clone(),
        })
    }

    /// Sign every input of `unsigned`.
    ///
    /// `prev_txs` holds the full previous transaction for each input, in
    /// input order. Each is checked against the input's outpoint and value
    /// before its output is used as the signing context; a mismatch is a
    /// [`WalletError::ProviderError`].
    pub fn sign(
        unsigned: UnsignedTransaction,
        prev_txs: &[Transaction],
        material: &SigningMaterial,
    ) -> Result<SignedTransaction, WalletError> {
        let UnsignedTransaction { mut tx, spends } = unsigned;
        if prev_txs.len() != spends.len() {
            return Err(WalletError::SigningFailure(format!(
                "{} inputs but {} previous transactions",
                spends.len(),
                prev_txs.len()
            )));
        }

        let prevouts = spends
            .iter()
            .zip(prev_txs)
            .map(|(utxo, prev)| spent_output(utxo, prev))
            .collect::<Result<Vec<_>, _>>()?;

        let secp = Secp256k1::signing_only();
        let p2wpkh = material.p2wpkh_script();
        let p2pkh = material.p2pkh_script();
        let mut unlocks = Vec::with_capacity(prevouts.len());
        {
            let mut cache = SighashCache::new(&tx);
            for (i, prevout) in prevouts.iter().enumerate() {
                let script = &prevout.script_pubkey;
                if *script == p2wpkh {
                    let sighash = cache
                        .p2wpkh_signature_hash(i, script, prevout.value, EcdsaSighashType::All)
                        .map_err(|e| WalletError::SigningFailure(format!("input {i}: {e}")))?;
                    let signature = ecdsa::Signature {
                        signature: secp.sign_ecdsa(
                            &Message::from_digest(sighash.to_byte_array()),
                            material.secret_key(),
                        ),
                        sighash_type: EcdsaSighashType::All,
                    };
                    unlocks.push((
                        ScriptBuf::new(),
                        Witness::p2wpkh(&signature, &material.public_key().0),
                    ));
                } else if *script == p2pkh {
                    let sighash = cache
                        .legacy_signature_hash(i, script, EcdsaSighashType::All.to_u32())
                        .map_err(|e| WalletError::SigningFailure(format!("input {i}: {e}")))?;
                    let signature = ecdsa::Signature {
                        signature: secp.sign_ecdsa(
                            &Message::from_digest(sighash.to_byte_array()),
                            material.secret_key(),
                        ),
                        sighash_type: EcdsaSighashType::All,
                    };
                    let sig_push = PushBytesBuf::try_from(signature.to_vec())
                        .map_err(|e| WalletError::SigningFailure(format!("input {i}: {e}")))?;
                    let script_sig = Builder::new()
                        .push_slice(sig_push)
                        .push_key(&PublicKey::from(*material.public_key()))
                        .into_script();
                    unlocks.push((script_sig, Witness::new()));
                } else {
                    return Err(WalletError::SigningFailure(format!(
                        "input {i} script is not owned by {}",
                        material.address()
                    )));
                }
            }
        }

        for (txin, (script_sig, witness)) in tx.input.iter_mut().zip(unlocks) {
            txin.script_sig = script_sig;
            txin.witness = witness;
        }

        let signed = SignedTransaction::new(tx);
        debug!(txid = %signed.txid(), inputs = spends.len(), bytes = signed.bytes.len(), "transaction signed");
        Ok(signed)
    }
}

impl Default for TransactionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Time-based lock time strictly after `now`.
pub fn lock_time_after(unix_time: u32, now: u64) -> Result<LockTime, WalletError> {
    if u64::from(unix_time) <= now {
        return Err(WalletError::InvalidLockTime(format!(
            "{unix_time} is not after the current time {now}"
        )));
    }
    LockTime::from_time(unix_time)
        .map_err(|e| WalletError::InvalidLockTime(format!("{unix_time}: {e}")))
}

fn spent_output(utxo: &Utxo, prev: &Transaction) -> Result<TxOut, WalletError> {
    let prev_txid = prev.compute_txid();
    if prev_txid != utxo.txid {
        return Err(WalletError::ProviderError(format!(
            "previous transaction {prev_txid} does not match input {}",
            utxo.txid
        )));
    }
    let out = prev.output.get(utxo.vout as usize).ok_or_else(|| {
        WalletError::ProviderError(format!("{} has no output {}", utxo.txid, utxo.vout))
    })?;
    if out.value.to_sat() != utxo.value {
        return Err(WalletError::ProviderError(format!(
            "{}:{} is worth {} sats, provider reported {}",
            utxo.txid,
            utxo.vout,
            out.value.to_sat(),
            utxo.value
        )));
    }
    Ok(out.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coin_selection::CoinSelector;
    use crate::keys;
    use crate::network::Network;
    use bitcoin::secp256k1::ecdsa::Signature as RawSignature;
    use bitcoin::{Address, OutPoint};
    use std::str::FromStr;

    const NOW: u64 = 1_750_000_000;

    fn payee() -> Address {
        Address::from_str("tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx")
            .unwrap()
            .assume_checked()
    }

    fn funding_tx(script: ScriptBuf, value: u64, salt: u32) -> Transaction {
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

    fn utxo_of(tx: &Transaction) -> Utxo {
        Utxo {
            txid: tx.compute_txid(),
            vout: 0,
            value: tx.output[0].value.to_sat(),
        }
    }

    fn plan_for(material: &SigningMaterial, prevs: &[Transaction], amount: u64) -> BuildPlan {
        let utxos: Vec<Utxo> = prevs.iter().map(utxo_of).collect();
        CoinSelector::default()
            .select(&utxos, &payee(), amount, material.address(), 5.0)
            .unwrap()
    }

    #[test]
    fn signs_p2wpkh_inputs() {
        let material = keys::derive_single(Network::Testnet).unwrap();
        let prev = funding_tx(material.p2wpkh_script(), 100_000, 1);
        let plan = plan_for(&material, std::slice::from_ref(&prev), 50_000);

        let unsigned = TransactionBuilder::new().build(&plan, NOW).unwrap();
        let signed = TransactionBuilder::sign(unsigned, &[prev.clone()], &material).unwrap();
        let tx = signed.tx();

        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.input[0].sequence.to_consensus_u32(), 0xFFFF_FFFD);
        assert_eq!(tx.input[0].witness.len(), 2);
        assert!(tx.input[0].script_sig.is_empty());
        assert_eq!(tx.output[0].value.to_sat(), 50_000);
        assert_eq!(tx.output[0].script_pubkey, payee().script_pubkey());
        assert_eq!(tx.output[1].value.to_sat(), 48_870);
        assert_eq!(tx.output[1].script_pubkey, material.p2wpkh_script());
        assert_eq!(tx.lock_time, LockTime::ZERO);
        assert_eq!(signed.txid(), tx.compute_txid());

        // signature verifies against the BIP-143 sighash
        let mut cache = SighashCache::new(tx);
        let sighash = cache
            .p2wpkh_signature_hash(0, &material.p2wpkh_script(), Amount::from_sat(100_000), EcdsaSighashType::All)
            .unwrap();
        let witness_sig = tx.input[0].witness.nth(0).unwrap();
        let sig = RawSignature::from_der(&witness_sig[..witness_sig.len() - 1]).unwrap();
        Secp256k1::verification_only()
            .verify_ecdsa(&Message::from_digest(sighash.to_byte_array()), &sig, &material.public_key().0)
            .unwrap();
    }

    #[test]
    fn signs_legacy_p2pkh_inputs() {
        let material = keys::derive_single(Network::Testnet).unwrap();
        let prev = funding_tx(material.p2pkh_script(), 80_000, 2);
        let plan = plan_for(&material, std::slice::from_ref(&prev), 10_000);

        let unsigned = TransactionBuilder::new().build(&plan, NOW).unwrap();
        let signed = TransactionBuilder::sign(unsigned, &[prev], &material).unwrap();
        let input = &signed.tx().input[0];
        assert!(input.witness.is_empty());
        assert!(!input.script_sig.is_empty());
    }

    #[test]
    fn hex_roundtrips_through_decoder() {
        let material = keys::derive_single(Network::Testnet).unwrap();
        let prev = funding_tx(material.p2wpkh_script(), 100_000, 3);
        let plan = plan_for(&material, std::slice::from_ref(&prev), 20_000);
        let unsigned = TransactionBuilder::new().build(&plan, NOW).unwrap();
        let signed = TransactionBuilder::sign(unsigned, &[prev], &material).unwrap();

        let decoded = decode_transaction_hex(&signed.to_hex()).unwrap();
        assert_eq!(decoded.compute_txid(), signed.txid());
        assert!(signed.fee_from_length(1.0) >= signed.vsize() as u64);
    }

    #[test]
    fn sets_future_lock_time() {
        let material = keys::derive_single(Network::Testnet).unwrap();
        let prev = funding_tx(material.p2wpkh_script(), 100_000, 4);
        let plan = plan_for(&material, std::slice::from_ref(&prev), 50_000)
            .with_lock_time(1_800_000_000);
        let unsigned = TransactionBuilder::new().build(&plan, NOW).unwrap();
        assert_eq!(unsigned.tx.lock_time.to_consensus_u32(), 1_800_000_000);
    }

    #[test]
    fn rejects_past_or_present_lock_time() {
        let material = keys::derive_single(Network::Testnet).unwrap();
        let prev = funding_tx(material.p2wpkh_script(), 100_000, 5);
        let base = plan_for(&material, std::slice::from_ref(&prev), 50_000);

        for t in [NOW as u32, NOW as u32 - 1] {
            let err = TransactionBuilder::new()
                .build(&base.clone().with_lock_time(t), NOW)
                .unwrap_err();
            assert!(matches!(err, WalletError::InvalidLockTime(_)), "{err}");
        }
    }

    #[test]
    fn rejects_block_height_lock_time() {
        let err = lock_time_after(400_000, 0).unwrap_err();
        assert!(matches!(err, WalletError::InvalidLockTime(_)));
    }

    #[test]
    fn foreign_script_is_signing_failure() {
        let material = keys::derive_single(Network::Testnet).unwrap();
        let stranger = keys::derive_single(Network::Testnet).unwrap();
        let prev = funding_tx(stranger.p2wpkh_script(), 100_000, 6);
        let plan = plan_for(&material, std::slice::from_ref(&prev), 50_000);

        let unsigned = TransactionBuilder::new().build(&plan, NOW).unwrap();
        let err = TransactionBuilder::sign(unsigned, &[prev], &material).unwrap_err();
        assert!(matches!(err, WalletError::SigningFailure(_)), "{err}");
    }

    #[test]
    fn mismatched_previous_transaction_rejected() {
        let material = keys::derive_single(Network::Testnet).unwrap();
        let prev = funding_tx(material.p2wpkh_script(), 100_000, 7);
        let other = funding_tx(material.p2wpkh_script(), 100_000, 8);
        let plan = plan_for(&material, std::slice::from_ref(&prev), 50_000);

        let unsigned = TransactionBuilder::new().build(&plan, NOW).unwrap();
        let err = TransactionBuilder::sign(unsigned, &[other], &material).unwrap_err();
        assert!(matches!(err, WalletError::ProviderError(_)), "{err}");
        assert!(!err.is_client_error());
    }

    #[test]
    fn misreported_value_rejected() {
        let material = keys::derive_single(Network::Testnet).unwrap();
        let prev = funding_tx(material.p2wpkh_script(), 100_000, 9);
        let mut plan = plan_for(&material, std::slice::from_ref(&prev), 50_000);
        plan.selected[0].value = 200_000;

        let unsigned = TransactionBuilder::new().build(&plan, NOW).unwrap();
        let err = TransactionBuilder::sign(unsigned, &[prev], &material).unwrap_err();
        assert!(matches!(err, WalletError::ProviderError(_)), "{err}");
    }

    #[test]
    fn missing_previous_transaction_rejected() {
        let material = keys::derive_single(Network::Testnet).unwrap();
        let prev = funding_tx(material.p2wpkh_script(), 100_000, 10);
        let plan = plan_for(&material, std::slice::from_ref(&prev), 50_000);
        let unsigned = TransactionBuilder::new().build(&plan, NOW).unwrap();
        let err = TransactionBuilder::sign(unsigned, &[], &material).unwrap_err();
        assert!(matches!(err, WalletError::SigningFailure(_)));
    }

    #[test]
    fn custom_sequence() {
        let material = keys::derive_single(Network::Testnet).unwrap();
        let prev = funding_tx(material.p2wpkh_script(), 100_000, 11);
        let plan = plan_for(&material, std::slice::from_ref(&prev), 50_000);
        let unsigned = TransactionBuilder::new()
            .set_sequence(Sequence::MAX)
            .build(&plan, NOW)
            .unwrap();
        assert_eq!(unsigned.tx.input[0].sequence, Sequence::MAX);
    }

    #[test]
    fn malformed_hex_rejected() {
        assert!(matches!(
            decode_transaction_hex("zz"),
            Err(WalletError::DecodeError(_))
        ));
        assert!(matches!(
            decode_transaction_hex("00"),
            Err(WalletError::DecodeError(_))
        ));
    }
}
