//! Transactional ledger: the single source of truth.
//!
//! Every trade, fee, approval and income receipt lands here as an
//! append-only row. Positions, PnL, portfolio views, tax reports and
//! archives are all derived from these rows.

pub mod archival;
pub mod exporters;
pub mod integrity;
pub mod writer;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Transaction};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, CoreResult};
use crate::ids::{ChainId, TokenRef, TraceId};
use crate::money::Money;
use crate::store::{ts_from_sql, ts_to_sql, Store};

/// How far a row's `created_at` may sit in the future before it is rejected.
pub const CLOCK_SKEW_TOLERANCE_SECS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Buy,
    Sell,
    Fee,
    Approve,
    Income,
    GasFee,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Buy => "buy",
            EntryType::Sell => "sell",
            EntryType::Fee => "fee",
            EntryType::Approve => "approve",
            EntryType::Income => "income",
            EntryType::GasFee => "gas_fee",
        }
    }

    /// Trade rows participate in lot accounting; fees and approvals do not.
    pub fn is_trade(&self) -> bool {
        matches!(self, EntryType::Buy | EntryType::Sell)
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(EntryType::Buy),
            "sell" => Ok(EntryType::Sell),
            "fee" => Ok(EntryType::Fee),
            "approve" => Ok(EntryType::Approve),
            "income" => Ok(EntryType::Income),
            "gas_fee" => Ok(EntryType::GasFee),
            other => Err(CoreError::InputInvalid(format!("unknown entry type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Confirmed,
    Failed,
    Reverted,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Confirmed => "confirmed",
            EntryStatus::Failed => "failed",
            EntryStatus::Reverted => "reverted",
        }
    }
}

impl FromStr for EntryStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EntryStatus::Pending),
            "confirmed" => Ok(EntryStatus::Confirmed),
            "failed" => Ok(EntryStatus::Failed),
            "reverted" => Ok(EntryStatus::Reverted),
            other => Err(CoreError::InputInvalid(format!("unknown entry status: {other}"))),
        }
    }
}

/// Typed per-entry metadata, serialized to a single JSON column.
///
/// One variant per entry family keeps the payload forward-compatible while
/// making illegal field combinations unrepresentable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryMetadata {
    Trade {
        token_symbol: String,
        token_address: String,
        amount_tokens: Money,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        dex: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        pair_address: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        slippage_percent: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        gas_fee_base: Option<Money>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        gas_fee_native: Option<Money>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        order_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        notes: Option<String>,
    },
    GasFee {
        token_symbol: String,
        token_address: String,
    },
    Approval {
        token_symbol: String,
        token_address: String,
        spender: String,
    },
    Income {
        token_symbol: String,
        token_address: String,
        amount_tokens: Money,
        /// Tax classification hint: staking, mining, airdrop, fork, ...
        activity_type: String,
    },
    Empty,
}

impl EntryMetadata {
    pub fn token_address(&self) -> Option<&str> {
        match self {
            EntryMetadata::Trade { token_address, .. }
            | EntryMetadata::GasFee { token_address, .. }
            | EntryMetadata::Approval { token_address, .. }
            | EntryMetadata::Income { token_address, .. } => Some(token_address),
            EntryMetadata::Empty => None,
        }
    }

    pub fn token_symbol(&self) -> Option<&str> {
        match self {
            EntryMetadata::Trade { token_symbol, .. }
            | EntryMetadata::GasFee { token_symbol, .. }
            | EntryMetadata::Approval { token_symbol, .. }
            | EntryMetadata::Income { token_symbol, .. } => Some(token_symbol),
            EntryMetadata::Empty => None,
        }
    }

    pub fn amount_tokens(&self) -> Option<Money> {
        match self {
            EntryMetadata::Trade { amount_tokens, .. }
            | EntryMetadata::Income { amount_tokens, .. } => Some(*amount_tokens),
            _ => None,
        }
    }

    pub fn activity_type(&self) -> Option<&str> {
        match self {
            EntryMetadata::Income { activity_type, .. } => Some(activity_type),
            _ => None,
        }
    }
}

/// One immutable ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub trace_id: TraceId,
    pub user_id: i64,
    pub wallet_address: String,
    pub chain: ChainId,
    pub dex: Option<String>,
    pub entry_type: EntryType,
    pub description: String,
    pub amount_base: Money,
    pub amount_native: Money,
    pub currency: String,
    pub fx_rate_base: Money,
    pub realized_pnl_base: Option<Money>,
    pub realized_pnl_native: Option<Money>,
    pub tx_hash: Option<String>,
    pub block_number: Option<i64>,
    pub status: EntryStatus,
    pub metadata: EntryMetadata,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn token_ref(&self) -> Option<TokenRef> {
        self.metadata
            .token_address()
            .map(|addr| TokenRef::new(addr, self.chain))
    }
}

/// Row payload for an insert; the store assigns the row id.
#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub trace_id: TraceId,
    pub user_id: i64,
    pub wallet_address: String,
    pub chain: ChainId,
    pub dex: Option<String>,
    pub entry_type: EntryType,
    pub description: String,
    pub amount_base: Money,
    pub amount_native: Money,
    pub currency: String,
    pub fx_rate_base: Money,
    pub realized_pnl_base: Option<Money>,
    pub realized_pnl_native: Option<Money>,
    pub tx_hash: Option<String>,
    pub block_number: Option<i64>,
    pub status: EntryStatus,
    pub metadata: EntryMetadata,
    pub created_at: DateTime<Utc>,
}

/// Filter for ledger listings.
#[derive(Debug, Clone, Default)]
pub struct LedgerFilter {
    pub entry_types: Option<Vec<EntryType>>,
    pub chain: Option<ChainId>,
    pub wallet_address: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl LedgerFilter {
    pub fn trades_only() -> Self {
        LedgerFilter {
            entry_types: Some(vec![EntryType::Buy, EntryType::Sell]),
            ..Default::default()
        }
    }
}

const ENTRY_COLUMNS: &str = "id, trace_id, user_id, wallet_address, chain, dex, entry_type, \
     description, amount_base, amount_native, currency, fx_rate_base, realized_pnl_base, \
     realized_pnl_native, tx_hash, block_number, status, metadata, created_at";

fn conversion_err(err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

pub(crate) fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let trace: String = row.get(1)?;
    let chain: String = row.get(4)?;
    let entry_type: String = row.get(6)?;
    let amount_base: String = row.get(8)?;
    let amount_native: String = row.get(9)?;
    let fx_rate: String = row.get(11)?;
    let pnl_base: Option<String> = row.get(12)?;
    let pnl_native: Option<String> = row.get(13)?;
    let status: String = row.get(16)?;
    let metadata: String = row.get(17)?;
    let created_at: String = row.get(18)?;

    Ok(LedgerEntry {
        id: row.get(0)?,
        trace_id: trace.parse().map_err(conversion_err)?,
        user_id: row.get(2)?,
        wallet_address: row.get(3)?,
        chain: chain.parse().map_err(conversion_err)?,
        dex: row.get(5)?,
        entry_type: entry_type.parse().map_err(conversion_err)?,
        description: row.get(7)?,
        amount_base: amount_base.parse().map_err(conversion_err)?,
        amount_native: amount_native.parse().map_err(conversion_err)?,
        currency: row.get(10)?,
        fx_rate_base: fx_rate.parse().map_err(conversion_err)?,
        realized_pnl_base: pnl_base
            .map(|s| s.parse().map_err(conversion_err))
            .transpose()?,
        realized_pnl_native: pnl_native
            .map(|s| s.parse().map_err(conversion_err))
            .transpose()?,
        tx_hash: row.get(14)?,
        block_number: row.get(15)?,
        status: status.parse().map_err(conversion_err)?,
        metadata: serde_json::from_str(&metadata).map_err(conversion_err)?,
        created_at: ts_from_sql(&created_at).map_err(conversion_err)?,
    })
}

/// Insert one entry inside an open transaction. Returns the new row id.
pub(crate) fn insert_entry_tx(tx: &Transaction, entry: &NewLedgerEntry) -> CoreResult<i64> {
    tx.execute(
        "INSERT INTO ledger_entries (trace_id, user_id, wallet_address, chain, dex, entry_type, \
         description, amount_base, amount_native, currency, fx_rate_base, realized_pnl_base, \
         realized_pnl_native, tx_hash, block_number, status, metadata, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            entry.trace_id.to_string(),
            entry.user_id,
            entry.wallet_address,
            entry.chain.as_str(),
            entry.dex.as_deref(),
            entry.entry_type.as_str(),
            entry.description,
            entry.amount_base.to_string(),
            entry.amount_native.to_string(),
            entry.currency,
            entry.fx_rate_base.to_string(),
            entry.realized_pnl_base.map(|m| m.to_string()),
            entry.realized_pnl_native.map(|m| m.to_string()),
            entry.tx_hash.as_deref(),
            entry.block_number,
            entry.status.as_str(),
            serde_json::to_string(&entry.metadata)?,
            ts_to_sql(entry.created_at),
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

/// Upsert the on-chain transaction row referenced by ledger entries.
pub(crate) fn upsert_transaction_tx(
    tx: &Transaction,
    tx_hash: &str,
    chain: ChainId,
    trace_id: TraceId,
    status: EntryStatus,
    block_number: Option<i64>,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    tx.execute(
        "INSERT INTO transactions (tx_hash, chain, trace_id, status, block_number, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT(tx_hash) DO UPDATE SET \
            status = excluded.status, \
            block_number = COALESCE(excluded.block_number, transactions.block_number)",
        params![
            tx_hash,
            chain.as_str(),
            trace_id.to_string(),
            status.as_str(),
            block_number,
            ts_to_sql(now),
        ],
    )?;
    Ok(())
}

fn build_filter_sql(user_id: Option<i64>, filter: &LedgerFilter) -> (String, Vec<String>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut args: Vec<String> = Vec::new();

    if let Some(user) = user_id {
        clauses.push(format!("user_id = {user}"));
    }
    if let Some(types) = &filter.entry_types {
        let list = types
            .iter()
            .map(|t| format!("'{}'", t.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        clauses.push(format!("entry_type IN ({list})"));
    }
    if let Some(chain) = filter.chain {
        clauses.push(format!("chain = '{}'", chain.as_str()));
    }
    if let Some(wallet) = &filter.wallet_address {
        clauses.push(format!("wallet_address = ?{}", args.len() + 1));
        args.push(wallet.clone());
    }
    if let Some(start) = filter.start {
        clauses.push(format!("created_at >= ?{}", args.len() + 1));
        args.push(ts_to_sql(start));
    }
    if let Some(end) = filter.end {
        clauses.push(format!("created_at <= ?{}", args.len() + 1));
        args.push(ts_to_sql(end));
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    (where_clause, args)
}

fn query_entries_conn(
    conn: &Connection,
    user_id: Option<i64>,
    filter: &LedgerFilter,
) -> CoreResult<Vec<LedgerEntry>> {
    let (where_clause, args) = build_filter_sql(user_id, filter);
    let limit = filter.limit.unwrap_or(10_000);
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM ledger_entries {where_clause} \
         ORDER BY created_at ASC, id ASC LIMIT {limit} OFFSET {}",
        filter.offset
    );

    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), row_to_entry)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// List entries in deterministic ledger order (time, then row id).
pub async fn query_entries(
    store: &Store,
    user_id: Option<i64>,
    filter: &LedgerFilter,
) -> CoreResult<Vec<LedgerEntry>> {
    let filter = filter.clone();
    store
        .with_conn(move |conn| query_entries_conn(conn, user_id, &filter))
        .await
}

/// Fetch one entry by row id.
pub async fn get_entry(store: &Store, entry_id: i64) -> CoreResult<LedgerEntry> {
    store
        .with_conn(move |conn| {
            let sql = format!("SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE id = ?1");
            let mut stmt = conn.prepare_cached(&sql)?;
            let entry = stmt
                .query_row(params![entry_id], row_to_entry)
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        CoreError::NotFound(format!("ledger entry {entry_id}"))
                    }
                    other => other.into(),
                })?;
            Ok(entry)
        })
        .await
}

/// Users that have at least one entry in `[start, end)`.
pub async fn users_with_entries(
    store: &Store,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> CoreResult<Vec<i64>> {
    store
        .with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT DISTINCT user_id FROM ledger_entries \
                 WHERE created_at >= ?1 AND created_at < ?2 ORDER BY user_id",
            )?;
            let rows = stmt.query_map(params![ts_to_sql(start), ts_to_sql(end)], |row| {
                row.get::<_, i64>(0)
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
}
