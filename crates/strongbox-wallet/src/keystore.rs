//! Encrypted keystore of custodial wallets.
//!
//! Records are append-only. Each carries the wallet's address (derived once
//! at creation), an Argon2id password hash and the hex-encoded sealed secret.
//! Lookups scan in insertion order and return the first match.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::encryption::{self, KdfParams};
use crate::error::WalletError;
use crate::keys::{self, SigningMaterial};
use crate::network::Network;

/// Kind of key a record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletKind {
    /// A single random key stored as WIF.
    Single,
    /// A BIP-39 mnemonic expanded along the HD receive path.
    Hd,
}

impl fmt::Display for WalletKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalletKind::Single => f.write_str("single"),
            WalletKind::Hd => f.write_str("hd"),
        }
    }
}

/// The sealed secret of a record, tagged by wallet kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SecretBlob {
    /// Encrypted WIF.
    Single {
        #[serde(rename = "encWif")]
        enc_wif: String,
    },
    /// Encrypted mnemonic plus the root extended public key.
    Hd {
        #[serde(rename = "encMnemonic")]
        enc_mnemonic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        xpub: Option<String>,
    },
}

impl SecretBlob {
    /// The wallet kind this blob belongs to.
    pub fn kind(&self) -> WalletKind {
        match self {
            SecretBlob::Single { .. } => WalletKind::Single,
            SecretBlob::Hd { .. } => WalletKind::Hd,
        }
    }

    fn ciphertext_hex(&self) -> &str {
        match self {
            SecretBlob::Single { enc_wif } => enc_wif,
            SecretBlob::Hd { enc_mnemonic, .. } => enc_mnemonic,
        }
    }
}

/// One persisted wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeystoreRecord {
    /// Opaque unique identifier.
    pub id: String,
    /// Canonical receive address, fixed at creation.
    pub address: String,
    /// Argon2id PHC string.
    pub password_hash: String,
    /// Creation time in milliseconds since the UNIX epoch.
    pub created_at: i64,
    /// Cost parameters the secret was sealed with.
    #[serde(default)]
    pub kdf: KdfParams,
    /// Kind-tagged sealed secret.
    #[serde(flatten)]
    pub secret: SecretBlob,
}

impl KeystoreRecord {
    /// The wallet kind.
    pub fn kind(&self) -> WalletKind {
        self.secret.kind()
    }

    /// Root extended public key, for HD records.
    pub fn xpub(&self) -> Option<&str> {
        match &self.secret {
            SecretBlob::Hd { xpub, .. } => xpub.as_deref(),
            SecretBlob::Single { .. } => None,
        }
    }
}

/// Plaintext secret recovered from a record. Wiped on drop.
pub enum DecryptedSecret {
    /// WIF private key.
    Wif(Zeroizing<String>),
    /// BIP-39 mnemonic phrase.
    Mnemonic(Zeroizing<String>),
}

impl DecryptedSecret {
    /// Derive the signing key this secret encodes.
    pub fn signing_material(&self, network: Network) -> Result<SigningMaterial, WalletError> {
        match self {
            DecryptedSecret::Wif(wif) => keys::derive_from_wif(wif, network),
            DecryptedSecret::Mnemonic(phrase) => {
                keys::derive_from_mnemonic(phrase, network).map(|(material, _)| material)
            }
        }
    }
}

impl fmt::Debug for DecryptedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecryptedSecret::Wif(_) => f.write_str("DecryptedSecret::Wif([REDACTED])"),
            DecryptedSecret::Mnemonic(_) => f.write_str("DecryptedSecret::Mnemonic([REDACTED])"),
        }
    }
}

/// Where records live.
pub trait KeystoreStorage: Send + Sync {
    /// Load all records in insertion order.
    fn load(&self) -> Result<Vec<KeystoreRecord>, WalletError>;

    /// Replace the stored snapshot with `records`.
    fn store(&self, records: &[KeystoreRecord]) -> Result<(), WalletError>;

    /// Add `record` after the current snapshot and return the new count.
    ///
    /// Backends shared between handles override this to hold their own lock
    /// across the load and the store.
    fn append(&self, record: KeystoreRecord) -> Result<usize, WalletError> {
        let mut records = self.load()?;
        records.push(record);
        self.store(&records)?;
        Ok(records.len())
    }
}

/// Records held in memory only.
#[derive(Default)]
pub struct MemoryStorage {
    records: RwLock<Vec<KeystoreRecord>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeystoreStorage for MemoryStorage {
    fn load(&self) -> Result<Vec<KeystoreRecord>, WalletError> {
        Ok(self.records.read().clone())
    }

    fn store(&self, records: &[KeystoreRecord]) -> Result<(), WalletError> {
        *self.records.write() = records.to_vec();
        Ok(())
    }

    fn append(&self, record: KeystoreRecord) -> Result<usize, WalletError> {
        let mut records = self.records.write();
        records.push(record);
        Ok(records.len())
    }
}

/// Records persisted as a JSON array in a single file.
///
/// Writes go to a uniquely named sibling temp file which is then renamed
/// over the target, so readers never observe a partial snapshot. Appends
/// hold an exclusive advisory lock on `<path>.lock` from load to rename,
/// which serializes writers across handles and processes.
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    /// Use `path` as the keystore file. It is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the keystore file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    fn create_parent(&self) -> Result<(), WalletError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| WalletError::Storage(format!("{}: {e}", parent.display())))?;
            }
        }
        Ok(())
    }

    /// Open and exclusively lock the writer lock file, blocking until free.
    fn lock_writers(&self) -> Result<File, WalletError> {
        self.create_parent()?;
        let lock_path = self.sibling(".lock");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| WalletError::Storage(format!("{}: {e}", lock_path.display())))?;
        file.lock_exclusive()
            .map_err(|e| WalletError::Storage(format!("lock {}: {e}", lock_path.display())))?;
        Ok(file)
    }
}

impl KeystoreStorage for JsonFileStorage {
    fn load(&self) -> Result<Vec<KeystoreRecord>, WalletError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(WalletError::Storage(format!("{}: {e}", self.path.display()))),
        };
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&data)
            .map_err(|e| WalletError::Serialization(format!("{}: {e}", self.path.display())))
    }

    fn store(&self, records: &[KeystoreRecord]) -> Result<(), WalletError> {
        self.create_parent()?;
        let json = serde_json::to_vec_pretty(records)
            .map_err(|e| WalletError::Serialization(e.to_string()))?;
        let suffix = format!(".{}.{:016x}.tmp", std::process::id(), rand::random::<u64>());
        let tmp = self.sibling(&suffix);
        fs::write(&tmp, json).map_err(|e| WalletError::Storage(format!("{}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            WalletError::Storage(format!("{}: {e}", self.path.display()))
        })
    }

    fn append(&self, record: KeystoreRecord) -> Result<usize, WalletError> {
        let lock = self.lock_writers()?;
        let mut records = self.load()?;
        records.push(record);
        let stored = self.store(&records);
        if let Err(e) = FileExt::unlock(&lock) {
            warn!(path = %self.path.display(), error = %e, "failed to release keystore lock");
        }
        stored.map(|()| records.len())
    }
}

/// Identity of a newly created wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedWallet {
    /// Record identifier.
    pub id: String,
    /// Canonical receive address.
    pub address: String,
    /// Root extended public key (HD only).
    pub xpub: Option<String>,
}

/// Encrypted keystore over a [`KeystoreStorage`].
pub struct Keystore {
    storage: Box<dyn KeystoreStorage>,
    kdf: KdfParams,
    network: Network,
    /// Serializes read-modify-write appends.
    append_lock: Mutex<()>,
}

impl Keystore {
    /// Wrap a storage backend.
    pub fn new(storage: Box<dyn KeystoreStorage>, network: Network, kdf: KdfParams) -> Self {
        Self {
            storage,
            kdf,
            network,
            append_lock: Mutex::new(()),
        }
    }

    /// In-memory keystore.
    pub fn in_memory(network: Network, kdf: KdfParams) -> Self {
        Self::new(Box::new(MemoryStorage::new()), network, kdf)
    }

    /// Network the keystore derives addresses for.
    pub fn network(&self) -> Network {
        self.network
    }

    /// Generate and store a single-key wallet.
    pub fn create_single(&self, password: &str) -> Result<CreatedWallet, WalletError> {
        let material = keys::derive_single(self.network)?;
        let wif = material.to_wif();
        let address = material.address().to_string();
        drop(material);
        let enc_wif = self.seal(wif.as_bytes(), password)?;
        self.append(address, password, SecretBlob::Single { enc_wif })
    }

    /// Store an HD wallet for an existing, already validated mnemonic.
    pub fn create_hd(&self, mnemonic: &str, password: &str) -> Result<CreatedWallet, WalletError> {
        let normalized = crate::mnemonic::normalize(mnemonic);
        let (material, xpub) = keys::derive_from_mnemonic(&normalized, self.network)?;
        let address = material.address().to_string();
        drop(material);
        let enc_mnemonic = self.seal(normalized.as_bytes(), password)?;
        self.append(
            address,
            password,
            SecretBlob::Hd {
                enc_mnemonic,
                xpub: Some(xpub.to_string()),
            },
        )
    }

    fn seal(&self, secret: &[u8], password: &str) -> Result<String, WalletError> {
        if password.is_empty() {
            return Err(WalletError::EmptyPassword);
        }
        let sealed = encryption::encrypt(secret, password.as_bytes(), &self.kdf)?;
        Ok(hex::encode(sealed))
    }

    fn append(
        &self,
        address: String,
        password: &str,
        secret: SecretBlob,
    ) -> Result<CreatedWallet, WalletError> {
        let record = KeystoreRecord {
            id: new_record_id(),
            address,
            password_hash: encryption::hash_password(password.as_bytes(), &self.kdf)?,
            created_at: chrono::Utc::now().timestamp_millis(),
            kdf: self.kdf,
            secret,
        };
        let created = CreatedWallet {
            id: record.id.clone(),
            address: record.address.clone(),
            xpub: record.xpub().map(str::to_string),
        };

        let _guard = self.append_lock.lock();
        let count = self.storage.append(record)?;
        info!(id = %created.id, address = %created.address, count, "keystore record appended");
        Ok(created)
    }

    /// All records in insertion order.
    pub fn records(&self) -> Result<Vec<KeystoreRecord>, WalletError> {
        self.storage.load()
    }

    /// Addresses of all records, in insertion order.
    pub fn addresses(&self) -> Result<Vec<String>, WalletError> {
        Ok(self.storage.load()?.into_iter().map(|r| r.address).collect())
    }

    /// First record with the given id.
    pub fn find_by_id(&self, id: &str) -> Result<KeystoreRecord, WalletError> {
        self.storage
            .load()?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| WalletError::WalletNotFound(format!("id {id}")))
    }

    /// First record with the given address.
    pub fn find_by_address(&self, address: &str) -> Result<KeystoreRecord, WalletError> {
        let address = address.trim();
        self.storage
            .load()?
            .into_iter()
            .find(|r| r.address == address)
            .ok_or_else(|| WalletError::WalletNotFound(format!("address {address}")))
    }

    /// Verify the password and decrypt the record's secret.
    pub fn unlock(
        &self,
        record: &KeystoreRecord,
        password: &str,
    ) -> Result<DecryptedSecret, WalletError> {
        if password.is_empty() {
            return Err(WalletError::EmptyPassword);
        }
        if let Err(e) = encryption::verify_password(password.as_bytes(), &record.password_hash) {
            if e == WalletError::BadPassword {
                warn!(id = %record.id, "password rejected");
            }
            return Err(e);
        }

        let sealed = hex::decode(record.secret.ciphertext_hex())
            .map_err(|e| WalletError::IntegrityError(format!("secret blob: {e}")))?;
        let plaintext = encryption::decrypt(&sealed, password.as_bytes(), &record.kdf)?;
        let text = Zeroizing::new(
            String::from_utf8(plaintext.to_vec())
                .map_err(|_| WalletError::IntegrityError("secret is not UTF-8".into()))?,
        );
        debug!(id = %record.id, kind = %record.kind(), "keystore record unlocked");

        Ok(match record.kind() {
            WalletKind::Single => DecryptedSecret::Wif(text),
            WalletKind::Hd => DecryptedSecret::Mnemonic(text),
        })
    }
}

fn new_record_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn keystore() -> Keystore {
        Keystore::in_memory(Network::Testnet, KdfParams::light())
    }

    #[test]
    fn single_roundtrip_unlock() {
        let ks = keystore();
        let created = ks.create_single("pw1").unwrap();
        let record = ks.find_by_id(&created.id).unwrap();
        assert_eq!(record.kind(), WalletKind::Single);

        let secret = ks.unlock(&record, "pw1").unwrap();
        let material = secret.signing_material(Network::Testnet).unwrap();
        assert_eq!(material.address().to_string(), created.address);
    }

    #[test]
    fn wrong_password_is_bad_password() {
        let ks = keystore();
        let created = ks.create_single("pw1").unwrap();
        let record = ks.find_by_id(&created.id).unwrap();
        assert_eq!(ks.unlock(&record, "pw2").unwrap_err(), WalletError::BadPassword);
    }

    #[test]
    fn empty_password_rejected() {
        let ks = keystore();
        assert_eq!(ks.create_single("").unwrap_err(), WalletError::EmptyPassword);
    }

    #[test]
    fn hd_record_keeps_xpub_and_mnemonic() {
        let ks = keystore();
        let created = ks.create_hd(TEST_MNEMONIC, "pw").unwrap();
        assert!(created.xpub.as_deref().unwrap_or_default().starts_with("tpub"));

        let record = ks.find_by_address(&created.address).unwrap();
        assert_eq!(record.kind(), WalletKind::Hd);
        match ks.unlock(&record, "pw").unwrap() {
            DecryptedSecret::Mnemonic(phrase) => assert_eq!(phrase.as_str(), TEST_MNEMONIC),
            DecryptedSecret::Wif(_) => panic!("expected mnemonic"),
        }
    }

    #[test]
    fn tampered_blob_is_integrity_error() {
        let ks = keystore();
        let created = ks.create_single("pw").unwrap();
        let mut record = ks.find_by_id(&created.id).unwrap();
        if let SecretBlob::Single { enc_wif } = &mut record.secret {
            let last = enc_wif.pop().unwrap();
            enc_wif.push(if last == '0' { '1' } else { '0' });
        }
        let err = ks.unlock(&record, "pw").unwrap_err();
        assert!(matches!(err, WalletError::IntegrityError(_)), "{err}");
    }

    #[test]
    fn missing_record() {
        let ks = keystore();
        assert!(matches!(
            ks.find_by_id("nope").unwrap_err(),
            WalletError::WalletNotFound(_)
        ));
        assert!(matches!(
            ks.find_by_address("tb1qxyz").unwrap_err(),
            WalletError::WalletNotFound(_)
        ));
    }

    #[test]
    fn duplicate_address_returns_first_inserted() {
        let ks = keystore();
        let first = ks.create_hd(TEST_MNEMONIC, "first").unwrap();
        let second = ks.create_hd(TEST_MNEMONIC, "second").unwrap();
        assert_eq!(first.address, second.address);

        let found = ks.find_by_address(&first.address).unwrap();
        assert_eq!(found.id, first.id);
        ks.unlock(&found, "first").unwrap();
    }

    #[test]
    fn addresses_view_follows_records() {
        let ks = keystore();
        let a = ks.create_single("pw").unwrap();
        let b = ks.create_hd(TEST_MNEMONIC, "pw").unwrap();
        assert_eq!(ks.addresses().unwrap(), vec![a.address, b.address]);
    }

    #[test]
    fn record_json_shape() {
        let ks = keystore();
        let created = ks.create_single("pw").unwrap();
        let record = ks.find_by_id(&created.id).unwrap();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "single");
        assert!(json["encWif"].is_string());
        assert!(json["passwordHash"].is_string());
        assert!(json["createdAt"].is_i64());

        let back: KeystoreRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn file_storage_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("keystore.json");

        let created = {
            let ks = Keystore::new(
                Box::new(JsonFileStorage::new(&path)),
                Network::Testnet,
                KdfParams::light(),
            );
            ks.create_single("pw").unwrap()
        };

        let ks = Keystore::new(
            Box::new(JsonFileStorage::new(&path)),
            Network::Testnet,
            KdfParams::light(),
        );
        let record = ks.find_by_id(&created.id).unwrap();
        ks.unlock(&record, "pw").unwrap();

        let mut names: Vec<String> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, ["keystore.json", "keystore.json.lock"]);
    }

    #[test]
    fn file_storage_appends_from_separate_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystore.json");
        let ks = keystore();
        let template = ks.find_by_id(&ks.create_single("pw").unwrap().id).unwrap();

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let storage = JsonFileStorage::new(&path);
                let template = template.clone();
                scope.spawn(move || {
                    for i in 0..10 {
                        let mut record = template.clone();
                        record.id = format!("{worker}-{i}");
                        storage.append(record).unwrap();
                    }
                });
            }
        });

        let records = JsonFileStorage::new(&path).load().unwrap();
        assert_eq!(records.len(), 40);
        for worker in 0..4 {
            for i in 0..10 {
                let id = format!("{worker}-{i}");
                assert!(records.iter().any(|r| r.id == id), "missing {id}");
            }
        }
    }

    #[test]
    fn file_storage_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonFileStorage::new(dir.path().join("absent.json"));
        assert!(storage.load().unwrap().is_empty());
    }

    #[test]
    fn file_storage_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystore.json");
        fs::write(&path, b"{not json").unwrap();
        let storage = JsonFileStorage::new(&path);
        assert!(matches!(
            storage.load().unwrap_err(),
            WalletError::Serialization(_)
        ));
    }

    #[test]
    fn concurrent_appends_are_not_lost() {
        let ks = std::sync::Arc::new(keystore());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ks = ks.clone();
                std::thread::spawn(move || ks.create_single("pw").unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ks.records().unwrap().len(), 4);
    }

    #[test]
    fn decrypted_secret_debug_is_redacted() {
        let secret = DecryptedSecret::Mnemonic(Zeroizing::new(TEST_MNEMONIC.to_string()));
        let dbg = format!("{secret:?}");
        assert!(!dbg.contains("abandon"));
    }
}
