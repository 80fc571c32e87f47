//! Property tests for coin selection, fee estimation and the keystore.
//!
//! Selection must never create dust change or overspend the selected
//! inputs, and must succeed whenever the full UTXO set covers the payment
//! plus the single-output fee. Sealed secrets must come back unchanged
//! under their own password and never under another.

use std::collections::HashMap;
use std::str::FromStr;

use bitcoin::Address;
use proptest::prelude::*;
use strongbox_tests::helpers::{utxo, PAYEE};
use strongbox_wallet::encryption;
use strongbox_wallet::fees::{self, DEFAULT_DUST_THRESHOLD};
use strongbox_wallet::keys;
use strongbox_wallet::{
    CoinSelector, DecryptedSecret, FeePolicy, KdfParams, Keystore, Network, Utxo, WalletError,
};

fn payee() -> Address {
    Address::from_str(PAYEE).unwrap().assume_checked()
}

fn utxo_set() -> impl Strategy<Value = Vec<Utxo>> {
    prop::collection::vec(1u64..=500_000, 1..20).prop_map(|values| {
        values
            .into_iter()
            .enumerate()
            .map(|(i, value)| utxo(i as u32, value))
            .collect()
    })
}

fn feerate() -> impl Strategy<Value = f64> {
    (1u32..=500).prop_map(|tenths| f64::from(tenths) / 10.0)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn selection_respects_funds_and_dust(
        utxos in utxo_set(),
        amount in DEFAULT_DUST_THRESHOLD..=1_000_000u64,
        rate in feerate(),
    ) {
        let selector = CoinSelector::default();
        let policy = FeePolicy::legacy();
        let total: u64 = utxos.iter().map(|u| u.value).sum();
        let affordable = total >= amount + policy.fee(utxos.len(), 1, rate);

        match selector.select(&utxos, &payee(), amount, &payee(), rate) {
            Ok(plan) => {
                prop_assert!(plan.total_input >= amount + plan.fee);
                prop_assert_eq!(plan.selected.as_slice(), &utxos[..plan.selected.len()]);
                prop_assert_eq!(
                    plan.total_input,
                    plan.selected.iter().map(|u| u.value).sum::<u64>()
                );

                let leftover = plan.total_input - amount - plan.fee;
                match &plan.change {
                    Some(change) => {
                        prop_assert!(change.value >= DEFAULT_DUST_THRESHOLD);
                        prop_assert_eq!(change.value, leftover);
                    }
                    None => prop_assert!(leftover < DEFAULT_DUST_THRESHOLD),
                }
                prop_assert_eq!(
                    plan.implied_fee(),
                    plan.total_input - amount - plan.change.as_ref().map_or(0, |c| c.value)
                );
                prop_assert!(plan.fee >= policy.fee(plan.selected.len(), 1, rate));
            }
            Err(WalletError::InsufficientFunds { have, .. }) => {
                prop_assert!(!affordable);
                prop_assert_eq!(have, total);
            }
            Err(other) => prop_assert!(false, "unexpected error: {other}"),
        }
    }

    #[test]
    fn selection_takes_the_shortest_prefix(
        utxos in utxo_set(),
        amount in DEFAULT_DUST_THRESHOLD..=1_000_000u64,
        rate in feerate(),
    ) {
        let selector = CoinSelector::default();
        let policy = FeePolicy::legacy();
        if let Ok(plan) = selector.select(&utxos, &payee(), amount, &payee(), rate) {
            let n = plan.selected.len();
            if n > 1 {
                let shorter: u64 = utxos[..n - 1].iter().map(|u| u.value).sum();
                prop_assert!(shorter < amount + policy.fee(n - 1, 1, rate));
            }
        }
    }

    #[test]
    fn below_dust_amounts_are_rejected(
        utxos in utxo_set(),
        amount in 0u64..DEFAULT_DUST_THRESHOLD,
    ) {
        let err = CoinSelector::default()
            .select(&utxos, &payee(), amount, &payee(), 1.0)
            .unwrap_err();
        let is_amount_error = matches!(
            err,
            WalletError::InvalidAmount(_) | WalletError::BelowDustThreshold { .. }
        );
        prop_assert!(is_amount_error);
    }

    #[test]
    fn fee_is_monotonic_in_size_and_rate(
        inputs in 1usize..50,
        outputs in 1usize..4,
        rate in feerate(),
    ) {
        let policy = FeePolicy::legacy();
        let fee = policy.fee(inputs, outputs, rate);
        prop_assert!(policy.fee(inputs + 1, outputs, rate) > fee);
        prop_assert!(policy.fee(inputs, outputs + 1, rate) > fee);
        prop_assert!(policy.fee(inputs, outputs, rate + 1.0) > fee);
        prop_assert!(fee as f64 >= policy.vbytes(inputs, outputs) as f64 * rate);
    }

    #[test]
    fn average_stays_within_observed_rates(
        rates in prop::collection::vec(prop::option::of(1u32..=1000), 6),
    ) {
        let fallback = 5.0;
        let estimates: HashMap<u16, f64> = rates
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.map(|r| (i as u16 + 1, f64::from(r))))
            .collect();
        let avg = fees::average_of_targets(&estimates, fallback);

        let effective: Vec<f64> = rates
            .iter()
            .map(|r| r.map_or(fallback, f64::from))
            .collect();
        let min = effective.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = effective.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        prop_assert!(avg >= min - 1e-9 && avg <= max + 1e-9);
    }
}

proptest! {
    // Argon2id runs on every case, even with light parameters.
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn keystore_round_trips_under_its_own_password_only(
        entropy in any::<[u8; 16]>(),
        password in "\\PC{1,24}",
    ) {
        let phrase = bip39::Mnemonic::from_entropy(&entropy).unwrap().to_string();
        let wrong = format!("{password}!");
        let keystore = Keystore::in_memory(Network::Testnet, KdfParams::light());

        let hd = keystore.create_hd(&phrase, &password).unwrap();
        let record = keystore.find_by_id(&hd.id).unwrap();
        match keystore.unlock(&record, &password).unwrap() {
            DecryptedSecret::Mnemonic(back) => prop_assert_eq!(back.as_str(), phrase.as_str()),
            DecryptedSecret::Wif(_) => prop_assert!(false, "HD record unlocked as WIF"),
        }
        prop_assert_eq!(keystore.unlock(&record, &wrong).unwrap_err(), WalletError::BadPassword);

        let single = keystore.create_single(&password).unwrap();
        let record = keystore.find_by_id(&single.id).unwrap();
        let DecryptedSecret::Wif(wif) = keystore.unlock(&record, &password).unwrap() else {
            panic!("single record unlocked as mnemonic");
        };
        let material = keys::derive_from_wif(&wif, Network::Testnet).unwrap();
        prop_assert_eq!(material.address().to_string(), single.address);
        prop_assert_eq!(keystore.unlock(&record, &wrong).unwrap_err(), WalletError::BadPassword);
    }

    #[test]
    fn sealed_bytes_open_only_with_their_password(
        secret in prop::collection::vec(any::<u8>(), 0..128),
        password in "\\PC{1,24}",
    ) {
        let params = KdfParams::light();
        let sealed = encryption::encrypt(&secret, password.as_bytes(), &params).unwrap();
        let opened = encryption::decrypt(&sealed, password.as_bytes(), &params).unwrap();
        prop_assert_eq!(opened.as_slice(), secret.as_slice());

        let wrong = format!("{password}!");
        prop_assert!(matches!(
            encryption::decrypt(&sealed, wrong.as_bytes(), &params),
            Err(WalletError::IntegrityError(_))
        ));
    }
}
