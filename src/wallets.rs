//! Wallet registry.
//!
//! One row per `(address, chain)`. Hot wallets weakly reference their
//! keystore file by path; watch-only wallets carry none.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::ids::ChainId;
use crate::security::keystore::KeystoreManager;
use crate::store::{ts_from_sql, ts_to_sql, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletKind {
    Hot,
    Watch,
}

impl WalletKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletKind::Hot => "hot",
            WalletKind::Watch => "watch",
        }
    }
}

impl fmt::Display for WalletKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WalletKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hot" => Ok(WalletKind::Hot),
            "watch" => Ok(WalletKind::Watch),
            other => Err(CoreError::InputInvalid(format!("unknown wallet kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WalletRecord {
    pub id: i64,
    pub user_id: i64,
    pub address: String,
    pub chain: ChainId,
    pub label: Option<String>,
    pub kind: WalletKind,
    pub keystore_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct WalletRegistry {
    store: Store,
    keystore: KeystoreManager,
}

fn conversion_err(err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

fn row_to_wallet(row: &rusqlite::Row<'_>) -> rusqlite::Result<WalletRecord> {
    let chain: String = row.get(3)?;
    let kind: String = row.get(5)?;
    let created_at: String = row.get(7)?;
    Ok(WalletRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        address: row.get(2)?,
        chain: chain.parse().map_err(conversion_err)?,
        label: row.get(4)?,
        kind: kind.parse().map_err(conversion_err)?,
        keystore_path: row.get(6)?,
        created_at: ts_from_sql(&created_at).map_err(conversion_err)?,
    })
}

const WALLET_COLUMNS: &str =
    "id, user_id, address, chain, label, wallet_kind, keystore_path, created_at";

impl WalletRegistry {
    pub fn new(store: Store, keystore: KeystoreManager) -> Self {
        WalletRegistry { store, keystore }
    }

    /// Generate a key, write its keystore, and register the hot wallet.
    pub async fn create_wallet(
        &self,
        user_id: i64,
        chain: ChainId,
        passphrase: &str,
        label: Option<&str>,
    ) -> CoreResult<WalletRecord> {
        let record = self.keystore.create_keystore(chain, passphrase, label).await?;
        let path = self.keystore.keystore_path(chain, &record.address);

        let address = record.address.clone();
        let label = label.map(str::to_string);
        let path_string = path.display().to_string();
        self.store
            .with_tx(move |tx| {
                tx.execute(
                    "INSERT INTO wallets (user_id, address, chain, label, wallet_kind, \
                     keystore_path, created_at) VALUES (?1, ?2, ?3, ?4, 'hot', ?5, ?6)",
                    params![
                        user_id,
                        address,
                        chain.as_str(),
                        label.as_deref(),
                        path_string,
                        ts_to_sql(Utc::now()),
                    ],
                )?;
                Ok(())
            })
            .await?;

        let wallet = self.get(&record.address, chain).await?;
        info!(address = %wallet.address, chain = %chain, "hot wallet created");
        Ok(wallet)
    }

    /// Track an externally held address with no signing material.
    pub async fn register_watch_wallet(
        &self,
        user_id: i64,
        chain: ChainId,
        address: &str,
        label: Option<&str>,
    ) -> CoreResult<WalletRecord> {
        if address.trim().is_empty() {
            return Err(CoreError::InputInvalid("wallet address is empty".to_string()));
        }
        let address = address.to_string();
        let label = label.map(str::to_string);
        let insert_address = address.clone();
        self.store
            .with_tx(move |tx| {
                tx.execute(
                    "INSERT INTO wallets (user_id, address, chain, label, wallet_kind, \
                     created_at) VALUES (?1, ?2, ?3, ?4, 'watch', ?5)",
                    params![
                        user_id,
                        insert_address,
                        chain.as_str(),
                        label.as_deref(),
                        ts_to_sql(Utc::now()),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| match e {
                CoreError::Conflict(_) => {
                    CoreError::Conflict(format!("wallet {address}@{chain} already registered"))
                }
                other => other,
            })?;
        self.get(&address, chain).await
    }

    pub async fn get(&self, address: &str, chain: ChainId) -> CoreResult<WalletRecord> {
        let address = address.to_string();
        self.store
            .with_conn(move |conn| {
                let sql = format!(
                    "SELECT {WALLET_COLUMNS} FROM wallets WHERE address = ?1 AND chain = ?2"
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                stmt.query_row(params![address, chain.as_str()], row_to_wallet)
                    .map_err(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => {
                            CoreError::NotFound(format!("wallet {address}@{chain}"))
                        }
                        other => other.into(),
                    })
            })
            .await
    }

    pub async fn list_for_user(&self, user_id: i64) -> CoreResult<Vec<WalletRecord>> {
        self.store
            .with_conn(move |conn| {
                let sql = format!(
                    "SELECT {WALLET_COLUMNS} FROM wallets WHERE user_id = ?1 ORDER BY id ASC"
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt.query_map(params![user_id], row_to_wallet)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_store, test_system};
    use tempfile::TempDir;

    async fn registry() -> (WalletRegistry, TempDir) {
        let store = test_store().await;
        let system = test_system(store.clone()).await;
        let dir = TempDir::new().unwrap();
        let keystore = KeystoreManager::new(dir.path().join("keys"), system).unwrap();
        (WalletRegistry::new(store, keystore), dir)
    }

    #[tokio::test]
    async fn hot_wallet_creation_writes_keystore() {
        let (registry, _dir) = registry().await;
        let wallet = registry
            .create_wallet(1, ChainId::Ethereum, "long-passphrase", Some("main"))
            .await
            .unwrap();
        assert_eq!(wallet.kind, WalletKind::Hot);
        let path = wallet.keystore_path.clone().unwrap();
        assert!(std::path::Path::new(&path).exists());

        let listed = registry.list_for_user(1).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].address, wallet.address);
    }

    #[tokio::test]
    async fn watch_wallet_has_no_keystore_and_is_unique() {
        let (registry, _dir) = registry().await;
        let wallet = registry
            .register_watch_wallet(1, ChainId::Bsc, "0xabc", None)
            .await
            .unwrap();
        assert_eq!(wallet.kind, WalletKind::Watch);
        assert!(wallet.keystore_path.is_none());

        // Same (address, chain) conflicts; same address elsewhere is fine.
        let err = registry
            .register_watch_wallet(2, ChainId::Bsc, "0xabc", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
        assert!(registry
            .register_watch_wallet(1, ChainId::Polygon, "0xabc", None)
            .await
            .is_ok());
    }
}
