//! Persisted position cache.
//!
//! One row per `(user, token, chain)` open lot set. The ledger remains the
//! source of truth; these rows are a cache that fills update in the same
//! transaction as their ledger entry, and that can always be rebuilt from a
//! PnL replay.

use chrono::{DateTime, Utc};
use rusqlite::{params, Transaction};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::config::AccountingMethod;
use crate::error::{CoreError, CoreResult};
use crate::ids::{ChainId, TokenRef};
use crate::ledger::{query_entries, EntryType, LedgerFilter};
use crate::money::{Money, RoundingMode};
use crate::reporting::pnl::replay;
use crate::store::{ts_from_sql, ts_to_sql, Store};

fn quantity_dust() -> Money {
    "0.000001".parse().expect("constant")
}

fn mny(result: Result<Money, crate::money::MoneyError>) -> CoreResult<Money> {
    result.map_err(|e| CoreError::Internal(format!("position arithmetic: {e}")))
}

#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub position_id: String,
    pub user_id: i64,
    pub token: TokenRef,
    pub quantity: Money,
    pub average_entry_price: Money,
    pub total_cost_base: Money,
    pub realized_pnl_base: Money,
    pub unrealized_pnl_base: Option<Money>,
    pub mark_price_missing: bool,
    pub is_open: bool,
    pub position_type: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

fn conversion_err(err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

const POSITION_COLUMNS: &str = "position_id, user_id, token_address, chain, quantity, \
     average_entry_price, total_cost_base, realized_pnl_base, unrealized_pnl_base, \
     mark_price_missing, is_open, position_type, opened_at, closed_at, updated_at";

fn row_to_position(row: &rusqlite::Row<'_>) -> rusqlite::Result<Position> {
    let chain: String = row.get(3)?;
    let quantity: String = row.get(4)?;
    let avg: String = row.get(5)?;
    let cost: String = row.get(6)?;
    let realized: String = row.get(7)?;
    let unrealized: Option<String> = row.get(8)?;
    let opened_at: String = row.get(12)?;
    let closed_at: Option<String> = row.get(13)?;
    let updated_at: String = row.get(14)?;

    Ok(Position {
        position_id: row.get(0)?,
        user_id: row.get(1)?,
        token: TokenRef {
            address: row.get(2)?,
            chain: chain.parse().map_err(conversion_err)?,
        },
        quantity: quantity.parse().map_err(conversion_err)?,
        average_entry_price: avg.parse().map_err(conversion_err)?,
        total_cost_base: cost.parse().map_err(conversion_err)?,
        realized_pnl_base: realized.parse().map_err(conversion_err)?,
        unrealized_pnl_base: unrealized
            .map(|s| s.parse().map_err(conversion_err))
            .transpose()?,
        mark_price_missing: row.get::<_, i64>(9)? != 0,
        is_open: row.get::<_, i64>(10)? != 0,
        position_type: row.get(11)?,
        opened_at: ts_from_sql(&opened_at).map_err(conversion_err)?,
        closed_at: closed_at
            .map(|s| ts_from_sql(&s).map_err(conversion_err))
            .transpose()?,
        updated_at: ts_from_sql(&updated_at).map_err(conversion_err)?,
    })
}

pub(crate) fn get_position_tx(
    tx: &Transaction,
    user_id: i64,
    token: &TokenRef,
) -> CoreResult<Option<Position>> {
    let sql = format!(
        "SELECT {POSITION_COLUMNS} FROM positions \
         WHERE user_id = ?1 AND token_address = ?2 AND chain = ?3"
    );
    let mut stmt = tx.prepare_cached(&sql)?;
    stmt.query_row(
        params![user_id, token.address, token.chain.as_str()],
        row_to_position,
    )
    .map(Some)
    .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other.into()),
    })
}

/// Average-cost recalculation for a buy, inside an open transaction.
pub(crate) fn apply_buy_tx(
    tx: &Transaction,
    user_id: i64,
    token: &TokenRef,
    quantity: Money,
    cost_base: Money,
    now: DateTime<Utc>,
) -> CoreResult<Position> {
    let existing = get_position_tx(tx, user_id, token)?;
    match existing {
        Some(position) if position.is_open => {
            let new_quantity = mny(position.quantity.checked_add(quantity))?;
            let new_cost = mny(position.total_cost_base.checked_add(cost_base))?;
            let new_avg = mny(new_cost.checked_div(new_quantity, RoundingMode::HalfEven))?;
            tx.execute(
                "UPDATE positions SET quantity = ?1, total_cost_base = ?2, \
                 average_entry_price = ?3, updated_at = ?4 WHERE position_id = ?5",
                params![
                    new_quantity.to_string(),
                    new_cost.to_string(),
                    new_avg.to_string(),
                    ts_to_sql(now),
                    position.position_id,
                ],
            )?;
        }
        Some(position) => {
            // Reopen a closed row with a fresh lot set.
            let avg = mny(cost_base.checked_div(quantity, RoundingMode::HalfEven))?;
            tx.execute(
                "UPDATE positions SET quantity = ?1, total_cost_base = ?2, \
                 average_entry_price = ?3, is_open = 1, opened_at = ?4, closed_at = NULL, \
                 updated_at = ?4 WHERE position_id = ?5",
                params![
                    quantity.to_string(),
                    cost_base.to_string(),
                    avg.to_string(),
                    ts_to_sql(now),
                    position.position_id,
                ],
            )?;
        }
        None => {
            let avg = mny(cost_base.checked_div(quantity, RoundingMode::HalfEven))?;
            tx.execute(
                "INSERT INTO positions (position_id, user_id, token_address, chain, quantity, \
                 average_entry_price, total_cost_base, realized_pnl_base, is_open, position_type, \
                 opened_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '0', 1, 'long', ?8, ?8)",
                params![
                    Uuid::new_v4().to_string(),
                    user_id,
                    token.address,
                    token.chain.as_str(),
                    quantity.to_string(),
                    avg.to_string(),
                    cost_base.to_string(),
                    ts_to_sql(now),
                ],
            )?;
        }
    }
    get_position_tx(tx, user_id, token)?
        .ok_or_else(|| CoreError::Internal("position vanished mid-transaction".to_string()))
}

/// Quantity reduction for a sell; closes the row when it reaches zero.
pub(crate) fn apply_sell_tx(
    tx: &Transaction,
    user_id: i64,
    token: &TokenRef,
    quantity: Money,
    realized_pnl: Money,
    now: DateTime<Utc>,
) -> CoreResult<Position> {
    let position = get_position_tx(tx, user_id, token)?.ok_or_else(|| {
        CoreError::IntegrityViolation(format!("sell against missing position {token}"))
    })?;
    if position.quantity < quantity {
        return Err(CoreError::IntegrityViolation(format!(
            "sell of {quantity} exceeds position quantity {}",
            position.quantity
        )));
    }

    let new_quantity = mny(position.quantity.checked_sub(quantity))?;
    let consumed_cost = mny(quantity.checked_mul(position.average_entry_price))?;
    let new_cost = mny(position.total_cost_base.checked_sub(consumed_cost))?.max(Money::ZERO);
    let new_realized = mny(position.realized_pnl_base.checked_add(realized_pnl))?;
    let closing = new_quantity <= quantity_dust();

    tx.execute(
        "UPDATE positions SET quantity = ?1, total_cost_base = ?2, realized_pnl_base = ?3, \
         is_open = ?4, closed_at = CASE WHEN ?4 = 0 THEN ?5 ELSE closed_at END, updated_at = ?5 \
         WHERE position_id = ?6",
        params![
            if closing { Money::ZERO } else { new_quantity }.to_string(),
            if closing { Money::ZERO } else { new_cost }.to_string(),
            new_realized.to_string(),
            if closing { 0 } else { 1 },
            ts_to_sql(now),
            position.position_id,
        ],
    )?;
    get_position_tx(tx, user_id, token)?
        .ok_or_else(|| CoreError::Internal("position vanished mid-transaction".to_string()))
}

#[derive(Clone)]
pub struct PositionStore {
    store: Store,
}

impl PositionStore {
    pub fn new(store: Store) -> Self {
        PositionStore { store }
    }

    pub async fn get(&self, user_id: i64, token: &TokenRef) -> CoreResult<Option<Position>> {
        let token = token.clone();
        self.store
            .with_tx(move |tx| get_position_tx(tx, user_id, &token))
            .await
    }

    pub async fn list_open(&self, user_id: i64) -> CoreResult<Vec<Position>> {
        self.store
            .with_conn(move |conn| {
                let sql = format!(
                    "SELECT {POSITION_COLUMNS} FROM positions \
                     WHERE user_id = ?1 AND is_open = 1 ORDER BY opened_at ASC"
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt.query_map(params![user_id], row_to_position)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }

    pub async fn apply_buy(
        &self,
        user_id: i64,
        token: &TokenRef,
        quantity: Money,
        cost_base: Money,
    ) -> CoreResult<Position> {
        let token = token.clone();
        self.store
            .with_tx(move |tx| apply_buy_tx(tx, user_id, &token, quantity, cost_base, Utc::now()))
            .await
    }

    pub async fn apply_sell(
        &self,
        user_id: i64,
        token: &TokenRef,
        quantity: Money,
        realized_pnl: Money,
    ) -> CoreResult<Position> {
        let token = token.clone();
        self.store
            .with_tx(move |tx| {
                apply_sell_tx(tx, user_id, &token, quantity, realized_pnl, Utc::now())
            })
            .await
    }

    /// Drop and rebuild every position row for a user from the ledger.
    pub async fn rebuild_from_ledger(
        &self,
        user_id: i64,
        method: AccountingMethod,
    ) -> CoreResult<usize> {
        let filter = LedgerFilter {
            entry_types: Some(vec![EntryType::Buy, EntryType::Sell]),
            ..Default::default()
        };
        let trades = query_entries(&self.store, Some(user_id), &filter).await?;
        let outcome = replay(&trades, method)?;

        let rebuilt = self
            .store
            .with_tx(move |tx| {
                tx.execute("DELETE FROM positions WHERE user_id = ?1", params![user_id])?;
                let now = Utc::now();
                let mut count = 0usize;
                for position in outcome.open_lots.values() {
                    let quantity = position.total_quantity()?;
                    if !quantity.is_positive() {
                        continue;
                    }
                    let cost = position.total_cost_base()?;
                    let avg = mny(cost.checked_div(quantity, RoundingMode::HalfEven))?;
                    let opened_at = position
                        .lots
                        .iter()
                        .map(|l| l.purchase_date)
                        .min()
                        .unwrap_or(now);
                    tx.execute(
                        "INSERT INTO positions (position_id, user_id, token_address, chain, \
                         quantity, average_entry_price, total_cost_base, realized_pnl_base, \
                         is_open, position_type, opened_at, updated_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '0', 1, 'long', ?8, ?9)",
                        params![
                            Uuid::new_v4().to_string(),
                            user_id,
                            position.token.address,
                            position.token.chain.as_str(),
                            quantity.to_string(),
                            avg.to_string(),
                            cost.to_string(),
                            ts_to_sql(opened_at),
                            ts_to_sql(now),
                        ],
                    )?;
                    count += 1;
                }
                Ok(count)
            })
            .await?;

        info!(user_id, rebuilt, "positions rebuilt from ledger");
        Ok(rebuilt)
    }
}
