//! On-chain allowance tracking and scheduled revocation.
//!
//! Approvals are granted at twice the required amount (capped), tracked per
//! `(chain, wallet, token, spender)` with a bounded lifetime, and journaled
//! through the ledger writer. A sweeper drops expired records and, when
//! auto-revoke is enabled, submits the zero-amount revocation first.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::params;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::ids::{ChainId, TokenRef};
use crate::ledger::writer::{ApprovalParams, LedgerWriter};
use crate::money::Money;
use crate::store::{ts_from_sql, ts_to_sql, Store};
use crate::system::state::SystemStateController;
use crate::trading::interfaces::{retry_with_backoff, RpcClient, ALLOWANCE_TIMEOUT};

/// Default approval lifetime.
pub const DEFAULT_APPROVAL_DURATION_SECS: i64 = 3600;

/// Upper bound on any granted allowance, in token units.
fn approval_cap() -> Money {
    "1000000000000000".parse().expect("constant")
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRecord {
    pub id: i64,
    pub user_id: i64,
    pub chain: ChainId,
    pub wallet_address: String,
    pub token_address: String,
    pub token_symbol: String,
    pub spender: String,
    pub amount: Money,
    pub granted_at: DateTime<Utc>,
    pub duration_seconds: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub tx_hash: Option<String>,
}

impl ApprovalRecord {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.granted_at + ChronoDuration::seconds(self.duration_seconds)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum EnsureOutcome {
    /// Existing on-chain allowance already covers the requirement.
    Sufficient { allowance: Money },
    /// A new approval was submitted and journaled.
    Granted { amount: Money, tx_hash: String },
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub expired: usize,
    pub revoked: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct ApprovalManager {
    store: Store,
    rpc: Arc<dyn RpcClient>,
    writer: LedgerWriter,
    system: SystemStateController,
    config: Arc<CoreConfig>,
}

fn conversion_err(err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

const APPROVAL_COLUMNS: &str = "id, user_id, chain, wallet_address, token_address, token_symbol, \
     spender, amount, granted_at, duration_seconds, last_used_at, tx_hash";

fn row_to_approval(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApprovalRecord> {
    let chain: String = row.get(2)?;
    let amount: String = row.get(7)?;
    let granted: String = row.get(8)?;
    let last_used: Option<String> = row.get(10)?;
    Ok(ApprovalRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        chain: chain.parse().map_err(conversion_err)?,
        wallet_address: row.get(3)?,
        token_address: row.get(4)?,
        token_symbol: row.get(5)?,
        spender: row.get(6)?,
        amount: amount.parse().map_err(conversion_err)?,
        granted_at: ts_from_sql(&granted).map_err(conversion_err)?,
        duration_seconds: row.get(9)?,
        last_used_at: last_used
            .map(|s| ts_from_sql(&s).map_err(conversion_err))
            .transpose()?,
        tx_hash: row.get(11)?,
    })
}

impl ApprovalManager {
    pub fn new(
        store: Store,
        rpc: Arc<dyn RpcClient>,
        writer: LedgerWriter,
        system: SystemStateController,
        config: Arc<CoreConfig>,
    ) -> Self {
        ApprovalManager {
            store,
            rpc,
            writer,
            system,
            config,
        }
    }

    /// Twice the requirement, never above the cap.
    fn grant_amount(required: Money) -> CoreResult<Money> {
        let doubled = required
            .checked_mul_int(2)
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        Ok(doubled.min(approval_cap()))
    }

    /// Make sure `spender` can move at least `required_amount` of the token.
    #[allow(clippy::too_many_arguments)]
    pub async fn ensure_approval(
        &self,
        user_id: i64,
        wallet_address: &str,
        token: &TokenRef,
        token_symbol: &str,
        spender: &str,
        required_amount: Money,
    ) -> CoreResult<EnsureOutcome> {
        if self.system.any_emergency_stopped().await? {
            return Err(CoreError::EmergencyActive(
                "approvals are suspended".to_string(),
            ));
        }
        if !required_amount.is_positive() {
            return Err(CoreError::InputInvalid(format!(
                "required amount must be positive, got {required_amount}"
            )));
        }

        // Allowance reads are idempotent: retry with backoff and a timeout.
        let allowance = retry_with_backoff(3, Duration::from_millis(100), || {
            let rpc = Arc::clone(&self.rpc);
            let token = token.clone();
            let wallet = wallet_address.to_string();
            let spender = spender.to_string();
            async move {
                tokio::time::timeout(
                    ALLOWANCE_TIMEOUT,
                    rpc.get_allowance(token.chain, &wallet, &token.address, &spender),
                )
                .await
                .map_err(|_| CoreError::ExternalUnavailable("allowance read timed out".to_string()))?
            }
        })
        .await?;

        if allowance >= required_amount {
            self.touch_observation(wallet_address, token, spender).await?;
            return Ok(EnsureOutcome::Sufficient { allowance });
        }

        // Submission is not idempotent: exactly one attempt.
        let grant = Self::grant_amount(required_amount)?;
        let tx_hash = tokio::time::timeout(
            ALLOWANCE_TIMEOUT,
            self.rpc
                .submit_approval(token.chain, wallet_address, &token.address, spender, grant),
        )
        .await
        .map_err(|_| CoreError::ExternalUnavailable("approval submission timed out".to_string()))??;

        let now = Utc::now();
        let record_token = token.clone();
        let wallet = wallet_address.to_string();
        let spender_string = spender.to_string();
        let symbol = token_symbol.to_string();
        let hash = tx_hash.clone();
        self.store
            .with_tx(move |tx| {
                tx.execute(
                    "INSERT INTO approvals (user_id, chain, wallet_address, token_address, \
                     token_symbol, spender, amount, granted_at, duration_seconds, tx_hash) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                     ON CONFLICT(chain, wallet_address, token_address, spender) DO UPDATE SET \
                        amount = excluded.amount, granted_at = excluded.granted_at, \
                        duration_seconds = excluded.duration_seconds, tx_hash = excluded.tx_hash",
                    params![
                        user_id,
                        record_token.chain.as_str(),
                        wallet,
                        record_token.address,
                        symbol,
                        spender_string,
                        grant.to_string(),
                        ts_to_sql(now),
                        DEFAULT_APPROVAL_DURATION_SECS,
                        hash,
                    ],
                )?;
                Ok(())
            })
            .await?;

        self.writer
            .write_approval(ApprovalParams {
                user_id,
                trace_id: None,
                chain: token.chain,
                wallet_address: wallet_address.to_string(),
                token_symbol: token_symbol.to_string(),
                token_address: token.address.clone(),
                spender: spender.to_string(),
                gas_fee_native: Money::ZERO,
                gas_fee_base: Money::ZERO,
                fx_rate_base: Money::ONE,
                tx_hash: Some(tx_hash.clone()),
            })
            .await?;

        info!(
            token = %token,
            spender = %spender,
            amount = %grant,
            tx_hash = %tx_hash,
            "approval granted"
        );
        Ok(EnsureOutcome::Granted {
            amount: grant,
            tx_hash,
        })
    }

    /// Submit a zero-amount approval and drop the tracking row.
    pub async fn revoke_approval(
        &self,
        wallet_address: &str,
        token: &TokenRef,
        spender: &str,
    ) -> CoreResult<String> {
        if self.system.any_emergency_stopped().await? {
            return Err(CoreError::EmergencyActive(
                "approvals are suspended".to_string(),
            ));
        }
        let record = self
            .get_approval(wallet_address, token, spender)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!("approval {token} -> {spender}"))
            })?;

        let tx_hash = self
            .rpc
            .submit_approval(token.chain, wallet_address, &token.address, spender, Money::ZERO)
            .await?;
        self.remove_tracking(record.id).await?;

        self.writer
            .write_approval(ApprovalParams {
                user_id: record.user_id,
                trace_id: None,
                chain: token.chain,
                wallet_address: wallet_address.to_string(),
                token_symbol: record.token_symbol.clone(),
                token_address: token.address.clone(),
                spender: spender.to_string(),
                gas_fee_native: Money::ZERO,
                gas_fee_base: Money::ZERO,
                fx_rate_base: Money::ONE,
                tx_hash: Some(tx_hash.clone()),
            })
            .await?;

        info!(token = %token, spender = %spender, "approval revoked");
        Ok(tx_hash)
    }

    pub async fn list_active(&self) -> CoreResult<Vec<ApprovalRecord>> {
        let now = Utc::now();
        let all = self.list_all().await?;
        Ok(all.into_iter().filter(|a| !a.is_expired(now)).collect())
    }

    /// Drop expired approvals; optionally revoke them on-chain first.
    pub async fn sweep_expired(&self) -> CoreResult<SweepStats> {
        let now = Utc::now();
        let mut stats = SweepStats::default();

        for record in self.list_all().await? {
            if !record.is_expired(now) {
                continue;
            }
            stats.expired += 1;
            if self.config.auto_revoke_expired_approvals {
                let token = TokenRef::new(record.token_address.clone(), record.chain);
                match self
                    .revoke_approval(&record.wallet_address, &token, &record.spender)
                    .await
                {
                    Ok(_) => {
                        stats.revoked += 1;
                        continue; // revoke already removed tracking
                    }
                    Err(err) => {
                        warn!(approval = record.id, error = %err, "auto-revoke failed");
                        stats.errors += 1;
                    }
                }
            }
            // Expired records leave tracking regardless of revocation.
            self.remove_tracking(record.id).await?;
        }

        if stats.expired > 0 {
            info!(
                expired = stats.expired,
                revoked = stats.revoked,
                "approval sweep completed"
            );
        }
        Ok(stats)
    }

    async fn list_all(&self) -> CoreResult<Vec<ApprovalRecord>> {
        self.store
            .with_conn(|conn| {
                let sql =
                    format!("SELECT {APPROVAL_COLUMNS} FROM approvals ORDER BY granted_at ASC");
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt.query_map([], row_to_approval)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }

    async fn get_approval(
        &self,
        wallet_address: &str,
        token: &TokenRef,
        spender: &str,
    ) -> CoreResult<Option<ApprovalRecord>> {
        let wallet = wallet_address.to_string();
        let token = token.clone();
        let spender = spender.to_string();
        self.store
            .with_conn(move |conn| {
                let sql = format!(
                    "SELECT {APPROVAL_COLUMNS} FROM approvals WHERE chain = ?1 AND \
                     wallet_address = ?2 AND token_address = ?3 AND spender = ?4"
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                stmt.query_row(
                    params![token.chain.as_str(), wallet, token.address, spender],
                    row_to_approval,
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other.into()),
                })
            })
            .await
    }

    async fn touch_observation(
        &self,
        wallet_address: &str,
        token: &TokenRef,
        spender: &str,
    ) -> CoreResult<()> {
        let wallet = wallet_address.to_string();
        let token = token.clone();
        let spender = spender.to_string();
        self.store
            .with_tx(move |tx| {
                tx.execute(
                    "UPDATE approvals SET last_used_at = ?1 WHERE chain = ?2 AND \
                     wallet_address = ?3 AND token_address = ?4 AND spender = ?5",
                    params![
                        ts_to_sql(Utc::now()),
                        token.chain.as_str(),
                        wallet,
                        token.address,
                        spender
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn remove_tracking(&self, id: i64) -> CoreResult<()> {
        self.store
            .with_tx(move |tx| {
                tx.execute("DELETE FROM approvals WHERE id = ?1", params![id])?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{query_entries, EntryType, LedgerFilter};
    use crate::testutil::{test_store, test_system, test_tokens, FakeRpc};

    async fn manager_with(config: CoreConfig) -> (ApprovalManager, Arc<FakeRpc>, Store) {
        let store = test_store().await;
        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO users (user_id, username, created_at) \
                     VALUES (1, 'u', '2024-01-01T00:00:00.000Z')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        let system = test_system(store.clone()).await;
        let tokens = test_tokens(store.clone()).await;
        let config = Arc::new(config);
        let writer = LedgerWriter::new(store.clone(), system.clone(), tokens, config.clone());
        let rpc = FakeRpc::new();
        let manager = ApprovalManager::new(store.clone(), rpc.clone(), writer, system, config);
        (manager, rpc, store)
    }

    fn cake() -> TokenRef {
        TokenRef::new("0xcake", ChainId::Bsc)
    }

    #[tokio::test]
    async fn sufficient_allowance_short_circuits() {
        let (manager, rpc, store) = manager_with(CoreConfig::default()).await;
        rpc.set_allowance(ChainId::Bsc, "0xwallet", "0xcake", "0xrouter", "100");

        let outcome = manager
            .ensure_approval(1, "0xwallet", &cake(), "CAKE", "0xrouter", "50".parse().unwrap())
            .await
            .unwrap();
        assert!(matches!(outcome, EnsureOutcome::Sufficient { .. }));
        assert!(rpc.submitted.lock().is_empty());
        // No ledger row for a mere observation.
        let entries = query_entries(&store, Some(1), &LedgerFilter::default())
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn insufficient_allowance_grants_double_and_journals() {
        let (manager, rpc, store) = manager_with(CoreConfig::default()).await;

        let outcome = manager
            .ensure_approval(1, "0xwallet", &cake(), "CAKE", "0xrouter", "50".parse().unwrap())
            .await
            .unwrap();
        match outcome {
            EnsureOutcome::Granted { amount, .. } => {
                assert_eq!(amount, "100".parse().unwrap());
            }
            other => panic!("expected grant, got {other:?}"),
        }
        assert_eq!(rpc.submitted.lock().len(), 1);

        let active = manager.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].amount, "100".parse().unwrap());
        assert_eq!(active[0].duration_seconds, DEFAULT_APPROVAL_DURATION_SECS);

        let entries = query_entries(&store, Some(1), &LedgerFilter::default())
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, EntryType::Approve);
    }

    #[tokio::test]
    async fn grant_amount_is_capped() {
        let huge: Money = "900000000000000000".parse().unwrap();
        let grant = ApprovalManager::grant_amount(huge).unwrap();
        assert_eq!(grant, approval_cap());
    }

    #[tokio::test]
    async fn sweep_drops_expired_without_revoke_by_default() {
        let (manager, rpc, store) = manager_with(CoreConfig::default()).await;
        manager
            .ensure_approval(1, "0xwallet", &cake(), "CAKE", "0xrouter", "50".parse().unwrap())
            .await
            .unwrap();

        // Age the grant past its lifetime.
        store
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE approvals SET granted_at = ?1",
                    params![ts_to_sql(Utc::now() - ChronoDuration::hours(2))],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let submissions_before = rpc.submitted.lock().len();
        let stats = manager.sweep_expired().await.unwrap();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.revoked, 0);
        assert_eq!(rpc.submitted.lock().len(), submissions_before);
        assert!(manager.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_revokes_when_configured() {
        let mut config = CoreConfig::default();
        config.auto_revoke_expired_approvals = true;
        let (manager, rpc, store) = manager_with(config).await;
        manager
            .ensure_approval(1, "0xwallet", &cake(), "CAKE", "0xrouter", "50".parse().unwrap())
            .await
            .unwrap();
        store
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE approvals SET granted_at = ?1",
                    params![ts_to_sql(Utc::now() - ChronoDuration::hours(2))],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let stats = manager.sweep_expired().await.unwrap();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.revoked, 1);
        // Last submission is the zero-amount revocation.
        let submitted = rpc.submitted.lock();
        assert_eq!(submitted.last().unwrap().1, Money::ZERO);
    }

    #[tokio::test]
    async fn emergency_stop_refuses_approvals() {
        let (manager, _rpc, store) = manager_with(CoreConfig::default()).await;
        let system = test_system(store).await;
        system.trip_emergency(None, "incident", "op").await.unwrap();

        let err = manager
            .ensure_approval(1, "0xwallet", &cake(), "CAKE", "0xrouter", "50".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::EmergencyActive(_)));
    }
}
