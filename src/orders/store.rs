//! Persistence for advanced orders and their executions.
//!
//! Row-level updates validate the state machine before writing. Recording an
//! execution is atomic with the parent order's quantity decrement and status
//! transition.

use chrono::{DateTime, Utc};
use rusqlite::{params, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::ids::{ChainId, TraceId};
use crate::money::Money;
use crate::orders::types::{AdvancedOrder, OrderExecution, OrderParams, OrderStatus};
use crate::store::{ts_from_sql, ts_to_sql, Store};
use crate::trading::interfaces::TradeSide;

/// Remaining quantities at or below this are treated as fully consumed.
fn quantity_dust() -> Money {
    "0.000001".parse().expect("constant")
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub user_id: i64,
    pub wallet_address: String,
    pub side: TradeSide,
    pub token_address: String,
    pub token_symbol: Option<String>,
    pub pair_address: Option<String>,
    pub chain: ChainId,
    pub dex: Option<String>,
    pub quantity: Money,
    pub params: OrderParams,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct OrderQuery {
    pub user_id: Option<i64>,
    pub status: Option<OrderStatus>,
    pub token_address: Option<String>,
    pub chain: Option<ChainId>,
    pub limit: Option<usize>,
}

/// Outcome of recording an execution against an order.
#[derive(Debug, Clone)]
pub struct ExecutionRecorded {
    pub order: AdvancedOrder,
    pub execution: OrderExecution,
}

#[derive(Clone)]
pub struct OrderStore {
    store: Store,
}

const ORDER_COLUMNS: &str = "order_id, user_id, order_type, side, token_address, token_symbol, \
     pair_address, chain, dex, quantity, remaining_quantity, trigger_price, parameters, status, \
     execution_count, last_execution_at, triggered_at, fill_price, trace_id, error_message, \
     created_at, updated_at, expires_at, wallet_address";

fn conversion_err(err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

fn row_to_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<AdvancedOrder> {
    let order_type: String = row.get(2)?;
    let side: String = row.get(3)?;
    let chain: String = row.get(7)?;
    let quantity: String = row.get(9)?;
    let remaining: String = row.get(10)?;
    let trigger_price: Option<String> = row.get(11)?;
    let params: String = row.get(12)?;
    let status: String = row.get(13)?;
    let last_execution_at: Option<String> = row.get(15)?;
    let triggered_at: Option<String> = row.get(16)?;
    let fill_price: Option<String> = row.get(17)?;
    let trace_id: Option<String> = row.get(18)?;
    let created_at: String = row.get(20)?;
    let updated_at: String = row.get(21)?;
    let expires_at: Option<String> = row.get(22)?;

    let parse_ts = |s: Option<String>| -> rusqlite::Result<Option<DateTime<Utc>>> {
        s.map(|raw| ts_from_sql(&raw).map_err(conversion_err)).transpose()
    };

    Ok(AdvancedOrder {
        order_id: row.get(0)?,
        user_id: row.get(1)?,
        wallet_address: row.get(23)?,
        order_type: order_type.parse().map_err(conversion_err)?,
        side: side.parse().map_err(conversion_err)?,
        token_address: row.get(4)?,
        token_symbol: row.get(5)?,
        pair_address: row.get(6)?,
        chain: chain.parse().map_err(conversion_err)?,
        dex: row.get(8)?,
        quantity: quantity.parse().map_err(conversion_err)?,
        remaining_quantity: remaining.parse().map_err(conversion_err)?,
        trigger_price: trigger_price
            .map(|s| s.parse().map_err(conversion_err))
            .transpose()?,
        params: serde_json::from_str(&params).map_err(conversion_err)?,
        status: status.parse().map_err(conversion_err)?,
        execution_count: row.get(14)?,
        last_execution_at: parse_ts(last_execution_at)?,
        triggered_at: parse_ts(triggered_at)?,
        fill_price: fill_price.map(|s| s.parse().map_err(conversion_err)).transpose()?,
        trace_id: trace_id.map(|s| s.parse().map_err(conversion_err)).transpose()?,
        error_message: row.get(19)?,
        created_at: ts_from_sql(&created_at).map_err(conversion_err)?,
        updated_at: ts_from_sql(&updated_at).map_err(conversion_err)?,
        expires_at: parse_ts(expires_at)?,
    })
}

pub(crate) fn get_order_tx(tx: &Transaction, order_id: &str) -> CoreResult<AdvancedOrder> {
    let sql = format!("SELECT {ORDER_COLUMNS} FROM advanced_orders WHERE order_id = ?1");
    let mut stmt = tx.prepare_cached(&sql)?;
    stmt.query_row(params![order_id], row_to_order)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                CoreError::NotFound(format!("order {order_id}"))
            }
            other => other.into(),
        })
}

/// Validate and apply a status transition inside an open transaction.
pub(crate) fn transition_tx(
    tx: &Transaction,
    order_id: &str,
    next: OrderStatus,
    error_message: Option<&str>,
    trigger_price: Option<Money>,
) -> CoreResult<AdvancedOrder> {
    let order = get_order_tx(tx, order_id)?;
    if !order.status.can_transition_to(next) {
        return Err(CoreError::Conflict(format!(
            "order {order_id} cannot move {} -> {next}",
            order.status
        )));
    }
    let now = Utc::now();
    tx.execute(
        "UPDATE advanced_orders SET status = ?1, updated_at = ?2, \
         error_message = COALESCE(?3, error_message), \
         trigger_price = COALESCE(?4, trigger_price), \
         triggered_at = CASE WHEN ?1 = 'triggered' THEN ?2 ELSE triggered_at END \
         WHERE order_id = ?5",
        params![
            next.as_str(),
            ts_to_sql(now),
            error_message,
            trigger_price.map(|m| m.to_string()),
            order_id,
        ],
    )?;
    get_order_tx(tx, order_id)
}

/// Insert the execution row and settle the parent order's quantity and
/// status. Returns the updated order and the execution record.
pub(crate) fn record_execution_tx(
    tx: &Transaction,
    order_id: &str,
    quantity: Money,
    price: Money,
    tx_hash: Option<&str>,
    trace_id: TraceId,
) -> CoreResult<ExecutionRecorded> {
    let order = get_order_tx(tx, order_id)?;
    if order.status != OrderStatus::Triggered {
        return Err(CoreError::Conflict(format!(
            "order {order_id} is {}, executions require triggered",
            order.status
        )));
    }
    if quantity > order.remaining_quantity {
        return Err(CoreError::IntegrityViolation(format!(
            "execution quantity {quantity} exceeds remaining {}",
            order.remaining_quantity
        )));
    }

    let now = Utc::now();
    let execution = OrderExecution {
        execution_id: Uuid::new_v4().to_string(),
        order_id: order_id.to_string(),
        quantity,
        price,
        tx_hash: tx_hash.map(str::to_string),
        status: "confirmed".to_string(),
        trace_id: Some(trace_id),
        executed_at: now,
    };
    tx.execute(
        "INSERT INTO order_executions (execution_id, order_id, quantity, price, tx_hash, status, \
         trace_id, executed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            execution.execution_id,
            execution.order_id,
            execution.quantity.to_string(),
            execution.price.to_string(),
            execution.tx_hash.as_deref(),
            execution.status,
            trace_id.to_string(),
            ts_to_sql(now),
        ],
    )?;

    let remaining = order
        .remaining_quantity
        .checked_sub(quantity)
        .map_err(|e| CoreError::Internal(e.to_string()))?;
    let fully_consumed = remaining <= quantity_dust();

    let next_status = if fully_consumed {
        OrderStatus::Filled
    } else if order.order_type.supports_partial_fills() {
        // DCA re-arms for the next slice.
        OrderStatus::Active
    } else {
        OrderStatus::PartiallyFilled
    };

    tx.execute(
        "UPDATE advanced_orders SET remaining_quantity = ?1, status = ?2, execution_count = \
         execution_count + 1, last_execution_at = ?3, updated_at = ?3, \
         fill_price = CASE WHEN ?2 = 'filled' THEN ?4 ELSE fill_price END \
         WHERE order_id = ?5",
        params![
            if fully_consumed { Money::ZERO } else { remaining }.to_string(),
            next_status.as_str(),
            ts_to_sql(now),
            price.to_string(),
            order_id,
        ],
    )?;

    let updated = get_order_tx(tx, order_id)?;
    updated.check_quantity_invariant()?;
    Ok(ExecutionRecorded {
        order: updated,
        execution,
    })
}

pub(crate) fn update_params_tx(
    tx: &Transaction,
    order_id: &str,
    params: &OrderParams,
) -> CoreResult<()> {
    tx.execute(
        "UPDATE advanced_orders SET parameters = ?1, updated_at = ?2 WHERE order_id = ?3",
        params![
            serde_json::to_string(params)?,
            ts_to_sql(Utc::now()),
            order_id
        ],
    )?;
    Ok(())
}

impl OrderStore {
    pub fn new(store: Store) -> Self {
        OrderStore { store }
    }

    pub async fn create_order(&self, new_order: NewOrder) -> CoreResult<AdvancedOrder> {
        new_order.params.validate()?;
        if !new_order.quantity.is_positive() {
            return Err(CoreError::InputInvalid(format!(
                "order quantity must be positive, got {}",
                new_order.quantity
            )));
        }
        let order_type = new_order.params.order_type();
        let order_id = Uuid::new_v4().to_string();
        let trace_id = TraceId::new();
        let now = Utc::now();

        let id = order_id.clone();
        self.store
            .with_tx(move |tx| {
                tx.execute(
                    "INSERT INTO advanced_orders (order_id, user_id, wallet_address, order_type, \
                     side, token_address, token_symbol, pair_address, chain, dex, quantity, \
                     remaining_quantity, parameters, status, trace_id, created_at, updated_at, \
                     expires_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16, ?17)",
                    params![
                        id,
                        new_order.user_id,
                        new_order.wallet_address,
                        order_type.as_str(),
                        new_order.side.as_str(),
                        new_order.token_address,
                        new_order.token_symbol.as_deref(),
                        new_order.pair_address.as_deref(),
                        new_order.chain.as_str(),
                        new_order.dex.as_deref(),
                        new_order.quantity.to_string(),
                        new_order.quantity.to_string(),
                        serde_json::to_string(&new_order.params)?,
                        OrderStatus::Pending.as_str(),
                        trace_id.to_string(),
                        ts_to_sql(now),
                        new_order.expires_at.map(ts_to_sql),
                    ],
                )?;
                Ok(())
            })
            .await?;

        let order = self.get_order(&order_id).await?;
        info!(order_id = %order.order_id, order_type = %order.order_type, "order created");
        Ok(order)
    }

    pub async fn get_order(&self, order_id: &str) -> CoreResult<AdvancedOrder> {
        let id = order_id.to_string();
        self.store
            .with_conn(move |conn| {
                let sql = format!("SELECT {ORDER_COLUMNS} FROM advanced_orders WHERE order_id = ?1");
                let mut stmt = conn.prepare_cached(&sql)?;
                stmt.query_row(params![id], row_to_order).map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => CoreError::NotFound(format!("order {id}")),
                    other => other.into(),
                })
            })
            .await
    }

    pub async fn list_orders(&self, query: &OrderQuery) -> CoreResult<Vec<AdvancedOrder>> {
        let query = query.clone();
        self.store
            .with_conn(move |conn| {
                let mut clauses = Vec::new();
                if let Some(user) = query.user_id {
                    clauses.push(format!("user_id = {user}"));
                }
                if let Some(status) = query.status {
                    clauses.push(format!("status = '{}'", status.as_str()));
                }
                if let Some(chain) = query.chain {
                    clauses.push(format!("chain = '{}'", chain.as_str()));
                }
                let mut args: Vec<String> = Vec::new();
                if let Some(token) = &query.token_address {
                    clauses.push(format!("token_address = ?{}", args.len() + 1));
                    args.push(token.clone());
                }
                let where_clause = if clauses.is_empty() {
                    String::new()
                } else {
                    format!("WHERE {}", clauses.join(" AND "))
                };
                let limit = query.limit.unwrap_or(1000);
                let sql = format!(
                    "SELECT {ORDER_COLUMNS} FROM advanced_orders {where_clause} \
                     ORDER BY created_at ASC, order_id ASC LIMIT {limit}"
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), row_to_order)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }

    /// Orders the monitor must evaluate this tick.
    pub async fn active_orders(&self) -> CoreResult<Vec<AdvancedOrder>> {
        self.list_orders(&OrderQuery {
            status: Some(OrderStatus::Active),
            ..Default::default()
        })
        .await
    }

    /// Move a pending order into monitoring.
    pub async fn activate_order(&self, order_id: &str) -> CoreResult<AdvancedOrder> {
        let id = order_id.to_string();
        self.store
            .with_tx(move |tx| transition_tx(tx, &id, OrderStatus::Active, None, None))
            .await
    }

    /// User-initiated cancellation. In-flight (`triggered`) orders cannot be
    /// cancelled; cross-user cancels are unauthorized.
    pub async fn cancel_order(&self, order_id: &str, user_id: i64) -> CoreResult<AdvancedOrder> {
        let id = order_id.to_string();
        self.store
            .with_tx(move |tx| {
                let order = get_order_tx(tx, &id)?;
                if order.user_id != user_id {
                    return Err(CoreError::Unauthorized(format!(
                        "order {id} belongs to another user"
                    )));
                }
                if order.status == OrderStatus::Triggered {
                    return Err(CoreError::Conflict(format!(
                        "order {id} is executing; cancel too late"
                    )));
                }
                transition_tx(tx, &id, OrderStatus::Cancelled, None, None)
            })
            .await
    }

    pub async fn transition(
        &self,
        order_id: &str,
        next: OrderStatus,
        error_message: Option<String>,
        trigger_price: Option<Money>,
    ) -> CoreResult<AdvancedOrder> {
        let id = order_id.to_string();
        self.store
            .with_tx(move |tx| {
                transition_tx(tx, &id, next, error_message.as_deref(), trigger_price)
            })
            .await
    }

    /// Persist updated type-specific parameters (trailing watermarks).
    pub async fn update_params(&self, order_id: &str, params: OrderParams) -> CoreResult<()> {
        let id = order_id.to_string();
        self.store
            .with_tx(move |tx| update_params_tx(tx, &id, &params))
            .await
    }

    /// Expire everything whose deadline has passed. Returns expired ids.
    pub async fn expire_due_orders(&self, now: DateTime<Utc>) -> CoreResult<Vec<String>> {
        self.store
            .with_tx(move |tx| {
                let mut stmt = tx.prepare_cached(
                    "SELECT order_id FROM advanced_orders \
                     WHERE expires_at IS NOT NULL AND expires_at < ?1 \
                     AND status IN ('pending', 'active', 'partially_filled')",
                )?;
                let ids: Vec<String> = stmt
                    .query_map(params![ts_to_sql(now)], |row| row.get(0))?
                    .collect::<Result<_, _>>()?;
                drop(stmt);
                for id in &ids {
                    transition_tx(tx, id, OrderStatus::Expired, Some("expired"), None)?;
                }
                Ok(ids)
            })
            .await
    }

    pub async fn record_execution(
        &self,
        order_id: &str,
        quantity: Money,
        price: Money,
        tx_hash: Option<String>,
        trace_id: TraceId,
    ) -> CoreResult<ExecutionRecorded> {
        let id = order_id.to_string();
        self.store
            .with_tx(move |tx| {
                record_execution_tx(tx, &id, quantity, price, tx_hash.as_deref(), trace_id)
            })
            .await
    }

    pub async fn executions_for(&self, order_id: &str) -> CoreResult<Vec<OrderExecution>> {
        let id = order_id.to_string();
        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT execution_id, order_id, quantity, price, tx_hash, status, trace_id, \
                     executed_at FROM order_executions WHERE order_id = ?1 ORDER BY executed_at ASC",
                )?;
                let rows = stmt.query_map(params![id], |row| {
                    let quantity: String = row.get(2)?;
                    let price: String = row.get(3)?;
                    let trace: Option<String> = row.get(6)?;
                    let executed_at: String = row.get(7)?;
                    Ok(OrderExecution {
                        execution_id: row.get(0)?,
                        order_id: row.get(1)?,
                        quantity: quantity.parse().map_err(conversion_err)?,
                        price: price.parse().map_err(conversion_err)?,
                        tx_hash: row.get(4)?,
                        status: row.get(5)?,
                        trace_id: trace.map(|s| s.parse().map_err(conversion_err)).transpose()?,
                        executed_at: ts_from_sql(&executed_at).map_err(conversion_err)?,
                    })
                })?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }
}
