//! Encrypted keystore: create, load, sign, rotate, backup, restore.
//!
//! One canonical format, one code path. PBKDF2-HMAC-SHA256 (100k iterations,
//! fresh 16-byte salt) derives the key; XChaCha20Poly1305 encrypts the
//! private key with a fresh 24-byte nonce and the Poly1305 tag stored in
//! `mac`. The plaintext key only ever lives in zeroed-on-drop buffers, and
//! signing requires both a cached session passphrase and a non-emergency
//! system state.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::{CoreError, CoreResult};
use crate::ids::ChainId;
use crate::ledger::exporters::atomic_write;
use crate::system::state::SystemStateController;

const KDF_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;
const MAC_LEN: usize = 16;
const KEYSTORE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub iterations: u32,
    pub salt: String,
    pub keylen: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeystoreCrypto {
    pub kdf: String,
    pub kdfparams: KdfParams,
    pub cipher: String,
    pub nonce: String,
    pub ciphertext: String,
    pub mac: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeystoreRecord {
    pub version: u32,
    pub chain: ChainId,
    pub address: String,
    pub label: Option<String>,
    pub crypto: KeystoreCrypto,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub rotation_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub filename: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
    pub address: Option<String>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub deleted: usize,
    pub kept: usize,
    pub freed_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyResult {
    pub keystore_valid: bool,
    pub passphrase_valid: bool,
    pub address: String,
    pub chain: ChainId,
    pub rotation_count: u32,
}

/// Encrypt a private key under a passphrase with a fresh salt and nonce.
fn encrypt_key(private_key: &[u8], passphrase: &str) -> CoreResult<KeystoreCrypto> {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), &salt, KDF_ITERATIONS, key.as_mut());

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
    let sealed = cipher
        .encrypt(XNonce::from_slice(&nonce), private_key)
        .map_err(|_| CoreError::Internal("keystore encryption failed".to_string()))?;

    // AEAD output is ciphertext || tag; the tag is stored separately as mac.
    let split = sealed.len() - MAC_LEN;
    Ok(KeystoreCrypto {
        kdf: "pbkdf2".to_string(),
        kdfparams: KdfParams {
            iterations: KDF_ITERATIONS,
            salt: hex::encode(salt),
            keylen: KEY_LEN,
        },
        cipher: "xchacha20poly1305".to_string(),
        nonce: hex::encode(nonce),
        ciphertext: hex::encode(&sealed[..split]),
        mac: hex::encode(&sealed[split..]),
    })
}

/// Decrypt; any tag or parameter mismatch surfaces as a bad passphrase.
fn decrypt_key(crypto: &KeystoreCrypto, passphrase: &str) -> CoreResult<Zeroizing<Vec<u8>>> {
    let bad = || CoreError::Unauthorized("bad passphrase".to_string());
    let salt = hex::decode(&crypto.kdfparams.salt).map_err(|_| bad())?;
    let nonce = hex::decode(&crypto.nonce).map_err(|_| bad())?;
    let mut sealed = hex::decode(&crypto.ciphertext).map_err(|_| bad())?;
    sealed.extend(hex::decode(&crypto.mac).map_err(|_| bad())?);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(
        passphrase.as_bytes(),
        &salt,
        crypto.kdfparams.iterations,
        key.as_mut(),
    );

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
    let plaintext = cipher
        .decrypt(XNonce::from_slice(&nonce), sealed.as_slice())
        .map_err(|_| bad())?;
    Ok(Zeroizing::new(plaintext))
}

/// Address derivation for locally generated keys: a truncated SHA-256 of the
/// key material, chain-tagged by the caller.
fn derive_address(private_key: &[u8]) -> String {
    use sha2::Digest;
    let digest = Sha256::digest(private_key);
    format!("0x{}", hex::encode(&digest[..20]))
}

#[derive(Clone)]
pub struct KeystoreManager {
    keystores_dir: PathBuf,
    backup_dir: PathBuf,
    system: SystemStateController,
    /// Session passphrases, zeroed on drop; never written to disk or logged.
    passphrases: Arc<RwLock<HashMap<String, Zeroizing<String>>>>,
}

impl KeystoreManager {
    pub fn new(keystores_dir: PathBuf, system: SystemStateController) -> CoreResult<Self> {
        let backup_dir = keystores_dir.join("backups");
        std::fs::create_dir_all(&keystores_dir)?;
        std::fs::create_dir_all(&backup_dir)?;
        Ok(KeystoreManager {
            keystores_dir,
            backup_dir,
            system,
            passphrases: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn keystore_path(&self, chain: ChainId, address: &str) -> PathBuf {
        self.keystores_dir.join(format!("{chain}_{address}.json"))
    }

    /// Generate a key, encrypt it, write the keystore. Returns the record.
    pub async fn create_keystore(
        &self,
        chain: ChainId,
        passphrase: &str,
        label: Option<&str>,
    ) -> CoreResult<KeystoreRecord> {
        if passphrase.len() < 8 {
            return Err(CoreError::InputInvalid(
                "passphrase must be at least 8 characters".to_string(),
            ));
        }
        let mut key_bytes = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng.fill_bytes(key_bytes.as_mut());
        let address = derive_address(key_bytes.as_ref());

        let now = Utc::now();
        let record = KeystoreRecord {
            version: KEYSTORE_VERSION,
            chain,
            address: address.clone(),
            label: label.map(str::to_string),
            crypto: encrypt_key(key_bytes.as_ref(), passphrase)?,
            created_at: now,
            updated_at: now,
            rotation_count: 0,
        };

        let path = self.keystore_path(chain, &address);
        if path.exists() {
            return Err(CoreError::Conflict(format!(
                "keystore already exists: {}",
                path.display()
            )));
        }
        write_record(&path, &record)?;
        info!(address = %address, chain = %chain, "keystore created");
        Ok(record)
    }

    pub fn load(&self, path: &Path) -> CoreResult<KeystoreRecord> {
        let raw = std::fs::read_to_string(path)
            .map_err(|_| CoreError::NotFound(format!("keystore {}", path.display())))?;
        let record: KeystoreRecord = serde_json::from_str(&raw)
            .map_err(|e| CoreError::InputInvalid(format!("invalid keystore: {e}")))?;
        if record.crypto.kdf != "pbkdf2" || record.crypto.kdfparams.iterations < KDF_ITERATIONS {
            return Err(CoreError::InputInvalid(
                "keystore uses an unsupported key derivation".to_string(),
            ));
        }
        Ok(record)
    }

    /// Cache the session passphrase after verifying it decrypts the key.
    pub async fn unlock(&self, chain: ChainId, address: &str, passphrase: &str) -> CoreResult<()> {
        let record = self.load(&self.keystore_path(chain, address))?;
        decrypt_key(&record.crypto, passphrase)?;
        self.passphrases
            .write()
            .insert(address.to_string(), Zeroizing::new(passphrase.to_string()));
        Ok(())
    }

    /// Drop the cached passphrase for an address (or all).
    pub fn lock(&self, address: Option<&str>) {
        let mut cache = self.passphrases.write();
        match address {
            Some(address) => {
                cache.remove(address);
            }
            None => cache.clear(),
        }
    }

    /// Deterministic HMAC-SHA256 signature over `payload` with the wallet
    /// key. Requires an unlocked session and no emergency stop.
    pub async fn sign(
        &self,
        chain: ChainId,
        address: &str,
        payload: &[u8],
    ) -> CoreResult<Vec<u8>> {
        if self.system.any_emergency_stopped().await? {
            return Err(CoreError::EmergencyActive(
                "signing is suspended".to_string(),
            ));
        }
        let passphrase = self
            .passphrases
            .read()
            .get(address)
            .cloned()
            .ok_or_else(|| {
                CoreError::Unauthorized(format!("no session passphrase for {address}"))
            })?;

        let record = self.load(&self.keystore_path(chain, address))?;
        let key = decrypt_key(&record.crypto, &passphrase)?;

        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&key)
            .map_err(|_| CoreError::Internal("hmac init".to_string()))?;
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Re-encrypt under a new passphrase: timestamped backup first, then
    /// temp-write + fsync + atomic rename.
    pub async fn rotate_passphrase(
        &self,
        chain: ChainId,
        address: &str,
        old_passphrase: &str,
        new_passphrase: &str,
    ) -> CoreResult<KeystoreRecord> {
        let path = self.keystore_path(chain, address);
        let mut record = self.load(&path)?;
        let key = decrypt_key(&record.crypto, old_passphrase)?;

        let backup = self.create_backup(&path, None).await?;

        record.crypto = encrypt_key(&key, new_passphrase)?;
        record.updated_at = Utc::now();
        record.rotation_count += 1;
        write_record(&path, &record)?;

        // A cached session under the old passphrase is now stale.
        self.passphrases
            .write()
            .insert(address.to_string(), Zeroizing::new(new_passphrase.to_string()));

        info!(
            address = %address,
            rotation_count = record.rotation_count,
            backup = %backup.display(),
            "keystore passphrase rotated"
        );
        Ok(record)
    }

    /// Copy the keystore into the backup directory with a timestamp suffix.
    pub async fn create_backup(&self, path: &Path, label: Option<&str>) -> CoreResult<PathBuf> {
        let record = self.load(path)?;
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| CoreError::InputInvalid(format!("bad path {}", path.display())))?;
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S_%f");
        let backup_name = match label {
            Some(label) => format!("{stem}.{timestamp}.{label}.backup.json"),
            None => format!("{stem}.{timestamp}.backup.json"),
        };
        let backup_path = self.backup_dir.join(backup_name);
        let payload = serde_json::to_vec_pretty(&record)?;
        atomic_write(&backup_path, &payload)?;
        Ok(backup_path)
    }

    pub fn list_backups(&self, address: Option<&str>) -> CoreResult<Vec<BackupInfo>> {
        let mut backups = Vec::new();
        for entry in std::fs::read_dir(&self.backup_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".backup.json") {
                continue;
            }
            if let Some(address) = address {
                if !name.contains(address) {
                    continue;
                }
            }
            let metadata = entry.metadata()?;
            let modified: DateTime<Utc> = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            let record_address = std::fs::read_to_string(entry.path())
                .ok()
                .and_then(|raw| serde_json::from_str::<KeystoreRecord>(&raw).ok())
                .map(|r| r.address);
            backups.push(BackupInfo {
                path: entry.path(),
                filename: name,
                size_bytes: metadata.len(),
                modified_at: modified,
                address: record_address,
            });
        }
        backups.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
        Ok(backups)
    }

    /// Copy a backup into place; with a passphrase, verify by decryption and
    /// remove the restored file if verification fails.
    pub async fn restore_from_backup(
        &self,
        backup_path: &Path,
        restore_path: &Path,
        verify_passphrase: Option<&str>,
    ) -> CoreResult<KeystoreRecord> {
        if !backup_path.exists() {
            return Err(CoreError::NotFound(format!(
                "backup {}",
                backup_path.display()
            )));
        }
        if restore_path.exists() {
            return Err(CoreError::Conflict(format!(
                "restore target already exists: {}",
                restore_path.display()
            )));
        }
        let payload = std::fs::read(backup_path)?;
        atomic_write(restore_path, &payload)?;

        let record = self.load(restore_path)?;
        if let Some(passphrase) = verify_passphrase {
            if decrypt_key(&record.crypto, passphrase).is_err() {
                std::fs::remove_file(restore_path)?;
                return Err(CoreError::Unauthorized(
                    "restored keystore failed passphrase verification".to_string(),
                ));
            }
        }
        info!(restore = %restore_path.display(), "keystore restored from backup");
        Ok(record)
    }

    pub fn verify_keystore(&self, path: &Path, passphrase: &str) -> CoreResult<VerifyResult> {
        let record = self.load(path)?;
        let passphrase_valid = decrypt_key(&record.crypto, passphrase).is_ok();
        Ok(VerifyResult {
            keystore_valid: true,
            passphrase_valid,
            address: record.address,
            chain: record.chain,
            rotation_count: record.rotation_count,
        })
    }

    /// Delete backups older than `max_age_days`, keeping at least
    /// `keep_minimum` most recent per keystore stem.
    pub async fn cleanup_old_backups(
        &self,
        max_age_days: i64,
        keep_minimum: usize,
    ) -> CoreResult<CleanupStats> {
        let cutoff = Utc::now() - chrono::Duration::days(max_age_days);
        let mut groups: HashMap<String, Vec<BackupInfo>> = HashMap::new();
        for backup in self.list_backups(None)? {
            let stem = backup
                .filename
                .split('.')
                .next()
                .unwrap_or(&backup.filename)
                .to_string();
            groups.entry(stem).or_default().push(backup);
        }

        let mut stats = CleanupStats::default();
        for (_, mut backups) in groups {
            backups.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
            for (idx, backup) in backups.into_iter().enumerate() {
                if idx < keep_minimum || backup.modified_at >= cutoff {
                    stats.kept += 1;
                    continue;
                }
                match std::fs::remove_file(&backup.path) {
                    Ok(()) => {
                        stats.deleted += 1;
                        stats.freed_bytes += backup.size_bytes;
                    }
                    Err(err) => {
                        warn!(path = %backup.path.display(), error = %err, "backup delete failed");
                        stats.kept += 1;
                    }
                }
            }
        }
        Ok(stats)
    }
}

fn write_record(path: &Path, record: &KeystoreRecord) -> CoreResult<()> {
    let payload = serde_json::to_vec_pretty(record)?;
    atomic_write(path, &payload)
}
