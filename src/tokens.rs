//! Token metadata cache and blacklist.
//!
//! Metadata rows are created on first observation and refreshed on request,
//! never deleted. Reads go through an in-memory TTL cache; invalidation is
//! coarse by chain with an optional exact key.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rusqlite::params;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::ids::{ChainId, TokenRef};
use crate::store::{ts_from_sql, ts_to_sql, Store};

/// Metadata cache TTL.
const METADATA_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Serialize)]
pub struct TokenMetadata {
    pub token: TokenRef,
    pub symbol: String,
    pub name: Option<String>,
    pub decimals: u32,
    pub verified: bool,
    pub risk_score: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub refreshed_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TokenRegistry {
    store: Store,
    cache: Arc<RwLock<HashMap<String, (TokenMetadata, Instant)>>>,
    blacklist_cache: Arc<RwLock<HashMap<String, (bool, Instant)>>>,
}

fn cache_key(token: &TokenRef) -> String {
    token.to_string()
}

impl TokenRegistry {
    pub fn new(store: Store) -> Self {
        TokenRegistry {
            store,
            cache: Arc::new(RwLock::new(HashMap::new())),
            blacklist_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Record a token on first observation; no-op if already known.
    pub async fn observe(
        &self,
        token: &TokenRef,
        symbol: &str,
        name: Option<&str>,
        decimals: u32,
    ) -> CoreResult<TokenMetadata> {
        let token_clone = token.clone();
        let symbol = symbol.to_string();
        let name = name.map(str::to_string);
        self.store
            .with_tx(move |tx| {
                tx.execute(
                    "INSERT INTO token_metadata (address, chain, symbol, name, decimals, \
                     created_at, refreshed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6) \
                     ON CONFLICT(address, chain) DO NOTHING",
                    params![
                        token_clone.address,
                        token_clone.chain.as_str(),
                        symbol,
                        name.as_deref(),
                        decimals,
                        ts_to_sql(Utc::now()),
                    ],
                )?;
                Ok(())
            })
            .await?;
        self.invalidate(token.chain, Some(token));
        self.get(token)
            .await?
            .ok_or_else(|| CoreError::Internal("observed token missing".to_string()))
    }

    /// Read-through cached lookup.
    pub async fn get(&self, token: &TokenRef) -> CoreResult<Option<TokenMetadata>> {
        let key = cache_key(token);
        if let Some((metadata, at)) = self.cache.read().get(&key) {
            if at.elapsed() < METADATA_TTL {
                return Ok(Some(metadata.clone()));
            }
        }

        let token_clone = token.clone();
        let metadata = self
            .store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT symbol, name, decimals, verified, risk_score, created_at, \
                     refreshed_at FROM token_metadata WHERE address = ?1 AND chain = ?2",
                )?;
                let row = stmt
                    .query_row(
                        params![token_clone.address, token_clone.chain.as_str()],
                        |row| {
                            let created: String = row.get(5)?;
                            let refreshed: String = row.get(6)?;
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, Option<String>>(1)?,
                                row.get::<_, u32>(2)?,
                                row.get::<_, i64>(3)? != 0,
                                row.get::<_, Option<f64>>(4)?,
                                created,
                                refreshed,
                            ))
                        },
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                match row {
                    Some((symbol, name, decimals, verified, risk_score, created, refreshed)) => {
                        Ok(Some(TokenMetadata {
                            token: token_clone.clone(),
                            symbol,
                            name,
                            decimals,
                            verified,
                            risk_score,
                            created_at: ts_from_sql(&created)?,
                            refreshed_at: ts_from_sql(&refreshed)?,
                        }))
                    }
                    None => Ok(None),
                }
            })
            .await?;

        if let Some(metadata) = &metadata {
            self.cache
                .write()
                .insert(key, (metadata.clone(), Instant::now()));
        }
        Ok(metadata)
    }

    /// Explicit refresh: update mutable fields and stamp `refreshed_at`.
    pub async fn refresh(
        &self,
        token: &TokenRef,
        verified: bool,
        risk_score: Option<f64>,
    ) -> CoreResult<()> {
        let token_clone = token.clone();
        self.store
            .with_tx(move |tx| {
                let changed = tx.execute(
                    "UPDATE token_metadata SET verified = ?1, risk_score = ?2, refreshed_at = ?3 \
                     WHERE address = ?4 AND chain = ?5",
                    params![
                        i64::from(verified),
                        risk_score,
                        ts_to_sql(Utc::now()),
                        token_clone.address,
                        token_clone.chain.as_str(),
                    ],
                )?;
                if changed == 0 {
                    return Err(CoreError::NotFound(format!("token {token_clone}")));
                }
                Ok(())
            })
            .await?;
        self.invalidate(token.chain, Some(token));
        Ok(())
    }

    /// Coarse invalidation by chain, plus an optional exact key.
    pub fn invalidate(&self, chain: ChainId, token: Option<&TokenRef>) {
        if let Some(token) = token {
            let key = cache_key(token);
            self.cache.write().remove(&key);
            self.blacklist_cache.write().remove(&key);
            return;
        }
        let suffix = format!("@{chain}");
        self.cache.write().retain(|k, _| !k.ends_with(&suffix));
        self.blacklist_cache.write().retain(|k, _| !k.ends_with(&suffix));
    }

    /// Consulted before any write that targets the token.
    pub async fn is_blacklisted(&self, token: &TokenRef) -> CoreResult<bool> {
        let key = cache_key(token);
        if let Some((flag, at)) = self.blacklist_cache.read().get(&key) {
            if at.elapsed() < METADATA_TTL {
                return Ok(*flag);
            }
        }
        let token_clone = token.clone();
        let flag = self
            .store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT 1 FROM blacklisted_tokens WHERE address = ?1 AND chain = ?2",
                )?;
                Ok(stmt.exists(params![token_clone.address, token_clone.chain.as_str()])?)
            })
            .await?;
        self.blacklist_cache
            .write()
            .insert(key, (flag, Instant::now()));
        Ok(flag)
    }

    pub async fn blacklist(&self, token: &TokenRef, reason: &str) -> CoreResult<()> {
        let token_clone = token.clone();
        let reason = reason.to_string();
        self.store
            .with_tx(move |tx| {
                tx.execute(
                    "INSERT INTO blacklisted_tokens (address, chain, reason, added_at) \
                     VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT(address, chain) DO UPDATE SET reason = excluded.reason",
                    params![
                        token_clone.address,
                        token_clone.chain.as_str(),
                        reason,
                        ts_to_sql(Utc::now()),
                    ],
                )?;
                crate::system::state::record_event_tx(
                    tx,
                    "token_blacklisted",
                    crate::system::state::EventSeverity::Warning,
                    None,
                    &format!("token blacklisted: {token_clone}"),
                    &reason,
                    None,
                    None,
                )?;
                Ok(())
            })
            .await?;
        self.invalidate(token.chain, Some(token));
        info!(token = %token, "token blacklisted");
        Ok(())
    }

    pub async fn unblacklist(&self, token: &TokenRef) -> CoreResult<bool> {
        let token_clone = token.clone();
        let removed = self
            .store
            .with_tx(move |tx| {
                let changed = tx.execute(
                    "DELETE FROM blacklisted_tokens WHERE address = ?1 AND chain = ?2",
                    params![token_clone.address, token_clone.chain.as_str()],
                )?;
                if changed > 0 {
                    crate::system::state::record_event_tx(
                        tx,
                        "token_unblacklisted",
                        crate::system::state::EventSeverity::Info,
                        None,
                        &format!("token removed from blacklist: {token_clone}"),
                        "",
                        None,
                        None,
                    )?;
                }
                Ok(changed > 0)
            })
            .await?;
        self.invalidate(token.chain, Some(token));
        Ok(removed)
    }

    pub async fn list_blacklisted(&self) -> CoreResult<Vec<(TokenRef, String)>> {
        self.store
            .with_conn(|conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT address, chain, reason FROM blacklisted_tokens ORDER BY added_at ASC",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (address, chain, reason) = row?;
                    let chain: ChainId = chain
                        .parse()
                        .map_err(|_| CoreError::Internal(format!("bad chain in row: {address}")))?;
                    out.push((TokenRef::new(address, chain), reason));
                }
                Ok(out)
            })
            .await
    }
}
