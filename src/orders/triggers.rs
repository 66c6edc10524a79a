//! Trigger monitor: one cooperative loop that evaluates every active order
//! against the latest price and drives the execution state machine.
//!
//! Per tick: refresh the active-order snapshot, fetch each distinct price
//! key once, evaluate predicates against the per-tick cache, then execute
//! the triggered set with bounded concurrency. A per-order lock means two
//! ticks can never execute the same order; an overrunning tick simply delays
//! the next one instead of stacking.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex as SyncMutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::ids::{TokenRef, TraceId};
use crate::ledger::writer::token_balance;
use crate::ledger::{EntryMetadata, EntryStatus, EntryType, NewLedgerEntry};
use crate::money::Money;
use crate::orders::store::{record_execution_tx, OrderStore};
use crate::orders::types::{AdvancedOrder, OrderParams, OrderStatus};
use crate::positions::{apply_buy_tx, apply_sell_tx, get_position_tx};
use crate::store::Store;
use crate::system::state::{
    EventSeverity, SystemStateController, COMPONENT_TRIGGER_MONITOR,
};
use crate::tokens::TokenRegistry;
use crate::trading::interfaces::{
    retry_with_backoff, OrderExecutor, OrderSlice, PriceFeed, TradeSide, PRICE_TIMEOUT,
};

/// Consecutive price failures for one key before a warning event.
const PRICE_FAILURE_WARN_THRESHOLD: u32 = 3;

#[derive(Debug, Clone)]
pub struct TriggerConfig {
    pub tick: Duration,
    pub max_concurrent_executions: usize,
    pub executor_timeout: Duration,
    pub price_timeout: Duration,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        TriggerConfig {
            tick: Duration::from_millis(1000),
            max_concurrent_executions: 4,
            executor_timeout: Duration::from_secs(30),
            price_timeout: PRICE_TIMEOUT,
        }
    }
}

/// What one tick did; returned for observability and tests.
#[derive(Debug, Default, Clone)]
pub struct TickSummary {
    pub active_orders: usize,
    pub evaluated: usize,
    pub triggered: usize,
    pub filled: usize,
    pub failed: usize,
    pub returned_to_active: usize,
    pub price_failures: usize,
    pub expired: usize,
    pub emergency_idle: bool,
}

/// Outcome of predicate evaluation for one order on one tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerDecision {
    Hold,
    Fire { reason: &'static str },
    /// DCA schedule exhausted with quantity left over.
    PlanComplete,
}

/// Pure predicate evaluation. Also returns updated parameters (trailing
/// watermarks) that the caller must persist even when the order holds.
pub fn evaluate(
    order: &AdvancedOrder,
    price: Option<Money>,
    now: DateTime<Utc>,
) -> CoreResult<(TriggerDecision, Option<OrderParams>)> {
    use TriggerDecision::*;

    let need_price = || {
        price.ok_or_else(|| {
            CoreError::ExternalUnavailable(format!("no price for order {}", order.order_id))
        })
    };

    match &order.params {
        OrderParams::StopLoss { stop_price } => {
            let price = need_price()?;
            let fired = match order.side {
                TradeSide::Sell => price <= *stop_price,
                TradeSide::Buy => price >= *stop_price,
            };
            Ok((if fired { Fire { reason: "stop" } } else { Hold }, None))
        }
        OrderParams::TakeProfit { target_price } => {
            let price = need_price()?;
            let fired = match order.side {
                TradeSide::Sell => price >= *target_price,
                TradeSide::Buy => price <= *target_price,
            };
            Ok((if fired { Fire { reason: "target" } } else { Hold }, None))
        }
        OrderParams::TrailingStop {
            trail_fraction,
            activation_price,
            high_water_mark,
            armed,
        } => {
            let price = need_price()?;
            let mut armed = *armed;
            let mut watermark = *high_water_mark;

            if !armed {
                let reached = match (order.side, activation_price) {
                    (_, None) => true,
                    (TradeSide::Sell, Some(activation)) => price >= *activation,
                    (TradeSide::Buy, Some(activation)) => price <= *activation,
                };
                if !reached {
                    return Ok((Hold, None));
                }
                armed = true;
            }

            // Ratchet the watermark toward the favourable extreme.
            watermark = Some(match (order.side, watermark) {
                (TradeSide::Sell, Some(mark)) => mark.max(price),
                (TradeSide::Buy, Some(mark)) => mark.min(price),
                (_, None) => price,
            });
            let mark = watermark.expect("set above");

            let give_back = mark
                .checked_mul(*trail_fraction)
                .map_err(|e| CoreError::Internal(e.to_string()))?;
            let fired = match order.side {
                TradeSide::Sell => {
                    let stop = mark
                        .checked_sub(give_back)
                        .map_err(|e| CoreError::Internal(e.to_string()))?;
                    price <= stop
                }
                TradeSide::Buy => {
                    let stop = mark
                        .checked_add(give_back)
                        .map_err(|e| CoreError::Internal(e.to_string()))?;
                    price >= stop
                }
            };

            let updated = OrderParams::TrailingStop {
                trail_fraction: *trail_fraction,
                activation_price: *activation_price,
                high_water_mark: watermark,
                armed,
            };
            let changed = updated != order.params;
            Ok((
                if fired { Fire { reason: "trail" } } else { Hold },
                changed.then_some(updated),
            ))
        }
        OrderParams::Dca {
            interval_minutes,
            num_orders,
            max_price,
            ..
        } => {
            if order.execution_count >= *num_orders {
                return Ok((PlanComplete, None));
            }
            if let Some(cap) = max_price {
                // Above the cap (or with no price at all) the slice is
                // skipped; the schedule resumes on a later tick.
                match price {
                    Some(price) if price <= *cap => {}
                    _ => return Ok((Hold, None)),
                }
            }
            let last = order.last_execution_at.unwrap_or(order.created_at);
            let due = last + ChronoDuration::minutes(*interval_minutes);
            Ok((
                if now >= due { Fire { reason: "interval" } } else { Hold },
                None,
            ))
        }
        OrderParams::Bracket {
            stop_price,
            target_price,
        } => {
            let price = need_price()?;
            if price <= *stop_price {
                Ok((Fire { reason: "stop" }, None))
            } else if price >= *target_price {
                Ok((Fire { reason: "target" }, None))
            } else {
                Ok((Hold, None))
            }
        }
        OrderParams::Limit { limit_price } => {
            let price = need_price()?;
            let fired = match order.side {
                TradeSide::Sell => price >= *limit_price,
                TradeSide::Buy => price <= *limit_price,
            };
            Ok((if fired { Fire { reason: "limit" } } else { Hold }, None))
        }
        OrderParams::Market => Ok((Fire { reason: "market" }, None)),
    }
}

#[derive(Clone)]
pub struct TriggerMonitor {
    store: Store,
    orders: OrderStore,
    tokens: TokenRegistry,
    system: SystemStateController,
    price_feed: Arc<dyn PriceFeed>,
    executor: Arc<dyn OrderExecutor>,
    config: TriggerConfig,
    order_locks: Arc<SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
    price_failures: Arc<SyncMutex<HashMap<String, u32>>>,
    exec_semaphore: Arc<Semaphore>,
    shutdown: Arc<AtomicBool>,
}

impl TriggerMonitor {
    pub fn new(
        store: Store,
        orders: OrderStore,
        tokens: TokenRegistry,
        system: SystemStateController,
        price_feed: Arc<dyn PriceFeed>,
        executor: Arc<dyn OrderExecutor>,
        config: TriggerConfig,
    ) -> Self {
        let permits = config.max_concurrent_executions.max(1);
        TriggerMonitor {
            store,
            orders,
            tokens,
            system,
            price_feed,
            executor,
            config,
            order_locks: Arc::new(SyncMutex::new(HashMap::new())),
            price_failures: Arc::new(SyncMutex::new(HashMap::new())),
            exec_semaphore: Arc::new(Semaphore::new(permits)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cooperative shutdown: the loop exits after the in-flight tick.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Run the monitoring loop until shutdown.
    pub async fn run(&self) -> CoreResult<()> {
        info!(tick_ms = self.config.tick.as_millis() as u64, "trigger monitor started");
        let mut interval = tokio::time::interval(self.config.tick);
        // An overrunning tick delays the next one; ticks never stack.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !self.shutdown.load(Ordering::SeqCst) {
            interval.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if let Err(err) = self.tick().await {
                warn!(error = %err, "trigger tick failed");
                self.system
                    .record_error(COMPONENT_TRIGGER_MONITOR, &err.to_string())
                    .await
                    .ok();
            }
        }
        info!("trigger monitor stopped");
        Ok(())
    }

    /// One evaluation pass. Public so callers and tests can drive ticks
    /// deterministically.
    pub async fn tick(&self) -> CoreResult<TickSummary> {
        let mut summary = TickSummary::default();
        let now = Utc::now();

        self.system
            .heartbeat(COMPONENT_TRIGGER_MONITOR, None)
            .await?;
        summary.expired = self.orders.expire_due_orders(now).await?.len();

        // Emergency stop: no order may reach `triggered` until cleared.
        if self.system.any_emergency_stopped().await? {
            summary.emergency_idle = true;
            debug!("emergency stop active; trigger monitor idling");
            return Ok(summary);
        }

        let snapshot = self.orders.active_orders().await?;
        summary.active_orders = snapshot.len();
        if snapshot.is_empty() {
            return Ok(summary);
        }

        // One price fetch per distinct (token, chain) this tick.
        let keys: HashSet<TokenRef> = snapshot.iter().map(|o| o.token_ref()).collect();
        let (prices, fetch_failures) = self.fetch_prices(keys).await;
        summary.price_failures = fetch_failures;

        let mut to_execute: Vec<(AdvancedOrder, Money, &'static str)> = Vec::new();
        for order in snapshot {
            let price = prices.get(&order.token_ref()).copied();
            if price.is_none() && order_needs_price(&order) {
                // Feed failure for this key: stay active, no state change.
                continue;
            }
            summary.evaluated += 1;
            let (decision, updated_params) = match evaluate(&order, price, now) {
                Ok(result) => result,
                Err(err) => {
                    debug!(order_id = %order.order_id, error = %err, "predicate evaluation skipped");
                    continue;
                }
            };
            if let Some(params) = updated_params {
                self.orders.update_params(&order.order_id, params).await?;
            }
            match decision {
                TriggerDecision::Hold => {}
                TriggerDecision::PlanComplete => {
                    self.orders
                        .transition(
                            &order.order_id,
                            OrderStatus::Expired,
                            Some("dca plan complete".to_string()),
                            None,
                        )
                        .await?;
                }
                TriggerDecision::Fire { reason } => {
                    let exec_price = price.unwrap_or(order.trigger_price.unwrap_or(Money::ONE));
                    to_execute.push((order, exec_price, reason));
                }
            }
        }

        // Execute with bounded concurrency; the tick waits for completion so
        // in-flight executions always finish before the next pass.
        let mut join_set: JoinSet<(TriggerOutcome, String)> = JoinSet::new();
        for (order, price, reason) in to_execute {
            summary.triggered += 1;
            let monitor = self.clone();
            join_set.spawn(async move {
                let order_id = order.order_id.clone();
                let outcome = monitor.execute_triggered(order, price, reason).await;
                (outcome, order_id)
            });
        }
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok((outcome, order_id)) => match outcome {
                    TriggerOutcome::Filled => summary.filled += 1,
                    TriggerOutcome::Failed => summary.failed += 1,
                    TriggerOutcome::ReturnedToActive => summary.returned_to_active += 1,
                    TriggerOutcome::Skipped => {}
                    TriggerOutcome::Error(err) => {
                        warn!(order_id = %order_id, error = %err, "execution error");
                        summary.failed += 1;
                    }
                },
                Err(join_err) => warn!(error = %join_err, "execution task panicked"),
            }
        }

        Ok(summary)
    }

    async fn fetch_prices(
        &self,
        keys: HashSet<TokenRef>,
    ) -> (HashMap<TokenRef, Money>, usize) {
        let mut join_set: JoinSet<(TokenRef, CoreResult<Money>)> = JoinSet::new();
        for token in keys {
            let feed = Arc::clone(&self.price_feed);
            let timeout = self.config.price_timeout;
            join_set.spawn(async move {
                let result = retry_with_backoff(3, Duration::from_millis(100), || {
                    let feed = Arc::clone(&feed);
                    let token = token.clone();
                    async move {
                        match tokio::time::timeout(timeout, feed.get_price(&token)).await {
                            Ok(result) => result.map(|quote| quote.price_base),
                            Err(_) => Err(CoreError::ExternalUnavailable(format!(
                                "price fetch timed out for {token}"
                            ))),
                        }
                    }
                })
                .await;
                (token, result)
            });
        }

        let mut prices = HashMap::new();
        let mut failures = 0usize;
        while let Some(result) = join_set.join_next().await {
            let Ok((token, outcome)) = result else {
                failures += 1;
                continue;
            };
            match outcome {
                Ok(price) => {
                    self.price_failures.lock().remove(&token.to_string());
                    prices.insert(token, price);
                }
                Err(err) => {
                    failures += 1;
                    let count = {
                        let mut map = self.price_failures.lock();
                        let slot = map.entry(token.to_string()).or_insert(0);
                        *slot += 1;
                        *slot
                    };
                    debug!(token = %token, consecutive = count, error = %err, "price fetch failed");
                    if count == PRICE_FAILURE_WARN_THRESHOLD {
                        self.system
                            .record_event(
                                "price_feed_degraded",
                                EventSeverity::Warning,
                                Some(COMPONENT_TRIGGER_MONITOR),
                                &format!("price feed failing for {token}"),
                                &format!(
                                    "{count} consecutive failures fetching {token}; keyed orders remain active"
                                ),
                                None,
                                None,
                            )
                            .await
                            .ok();
                    }
                }
            }
        }
        (prices, failures)
    }

    async fn execute_triggered(
        &self,
        order: AdvancedOrder,
        price: Money,
        reason: &'static str,
    ) -> TriggerOutcome {
        // Per-order lock: held from before the `triggered` transition until
        // the executor settles.
        let lock = {
            let mut locks = self.order_locks.lock();
            Arc::clone(
                locks
                    .entry(order.order_id.clone())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        let _guard = lock.lock().await;

        match self.execute_locked(&order, price, reason).await {
            Ok(outcome) => outcome,
            Err(err) => TriggerOutcome::Error(err),
        }
    }

    async fn execute_locked(
        &self,
        order: &AdvancedOrder,
        price: Money,
        reason: &'static str,
    ) -> CoreResult<TriggerOutcome> {
        // Re-read under the lock: another tick may have settled this order.
        let current = self.orders.get_order(&order.order_id).await?;
        if current.status != OrderStatus::Active {
            return Ok(TriggerOutcome::Skipped);
        }
        if self.system.any_emergency_stopped().await? {
            return Ok(TriggerOutcome::Skipped);
        }
        if self.tokens.is_blacklisted(&current.token_ref()).await? {
            self.orders
                .transition(
                    &current.order_id,
                    OrderStatus::Triggered,
                    None,
                    Some(price),
                )
                .await?;
            self.orders
                .transition(
                    &current.order_id,
                    OrderStatus::Failed,
                    Some("token blacklisted".to_string()),
                    None,
                )
                .await?;
            return Ok(TriggerOutcome::Failed);
        }

        info!(
            order_id = %current.order_id,
            order_type = %current.order_type,
            reason,
            price = %price,
            "order triggered"
        );
        self.orders
            .transition(&current.order_id, OrderStatus::Triggered, None, Some(price))
            .await?;

        let slice_quantity = current.next_slice_quantity();
        let slice = OrderSlice {
            order_id: current.order_id.clone(),
            user_id: current.user_id,
            side: current.side,
            token: current.token_ref(),
            token_symbol: current.token_symbol.clone().unwrap_or_default(),
            wallet_address: current.wallet_address.clone(),
            quantity: slice_quantity,
            limit_price: Some(price),
            dex: current.dex.clone(),
        };

        let _permit = self
            .exec_semaphore
            .acquire()
            .await
            .map_err(|_| CoreError::Internal("executor semaphore closed".to_string()))?;

        let result = tokio::time::timeout(
            self.config.executor_timeout,
            self.executor.execute(&slice),
        )
        .await;

        match result {
            // Timeout: the submitted transaction, if any, is not counted as
            // a fill.
            Err(_) => {
                self.orders
                    .transition(
                        &current.order_id,
                        OrderStatus::Failed,
                        Some(format!(
                            "executor timed out after {:?}; tx not counted as fill",
                            self.config.executor_timeout
                        )),
                        None,
                    )
                    .await?;
                Ok(TriggerOutcome::Failed)
            }
            // Transport failure: retryable, back to active.
            Ok(Err(err)) if err.is_retryable() => {
                warn!(order_id = %current.order_id, error = %err, "retryable executor failure");
                self.orders
                    .transition(&current.order_id, OrderStatus::Active, None, None)
                    .await?;
                Ok(TriggerOutcome::ReturnedToActive)
            }
            Ok(Err(err)) => {
                self.orders
                    .transition(
                        &current.order_id,
                        OrderStatus::Failed,
                        Some(err.to_string()),
                        None,
                    )
                    .await?;
                Ok(TriggerOutcome::Failed)
            }
            Ok(Ok(result)) if !result.success => {
                let fail = result
                    .fail_reason
                    .unwrap_or_else(|| crate::trading::interfaces::ExecFailReason::terminal(
                        "executor reported failure without reason",
                    ));
                if fail.retryable {
                    self.orders
                        .transition(&current.order_id, OrderStatus::Active, None, None)
                        .await?;
                    Ok(TriggerOutcome::ReturnedToActive)
                } else {
                    self.orders
                        .transition(
                            &current.order_id,
                            OrderStatus::Failed,
                            Some(fail.reason),
                            None,
                        )
                        .await?;
                    Ok(TriggerOutcome::Failed)
                }
            }
            Ok(Ok(result)) => {
                let executed_price = if result.executed_price.is_positive() {
                    result.executed_price
                } else {
                    price
                };
                let settled = self
                    .settle_fill(&current, slice_quantity, executed_price, &result)
                    .await?;
                Ok(settled)
            }
        }
    }

    /// Record the execution, write the ledger rows and reconcile the
    /// position — all in one store transaction.
    async fn settle_fill(
        &self,
        order: &AdvancedOrder,
        quantity: Money,
        price: Money,
        result: &crate::trading::interfaces::ExecutionResult,
    ) -> CoreResult<TriggerOutcome> {
        let order = order.clone();
        let trace_id = TraceId::new();
        let tx_hash = result.tx_hash.clone();
        let gas_fee_base = result.gas_fee_base;
        let gas_fee_native = result.gas_fee_native;
        let now = Utc::now();

        let updated = self
            .store
            .with_tx(move |tx| {
                let recorded = record_execution_tx(
                    tx,
                    &order.order_id,
                    quantity,
                    price,
                    tx_hash.as_deref(),
                    trace_id,
                )?;

                let token = order.token_ref();
                let symbol = order.token_symbol.clone().unwrap_or_else(|| "UNKNOWN".to_string());
                let amount_base = quantity
                    .checked_mul(price)
                    .map_err(|e| CoreError::Internal(e.to_string()))?;

                let (entry_type, signed_base, realized) = match order.side {
                    TradeSide::Buy => (EntryType::Buy, amount_base, None),
                    TradeSide::Sell => {
                        // Inventory guard, then realize against average cost.
                        let held = token_balance(tx, &order.wallet_address, token.chain, &token.address)?;
                        if held < quantity {
                            return Err(CoreError::IntegrityViolation(format!(
                                "fill of {quantity} exceeds ledger balance {held} for {token}"
                            )));
                        }
                        let position = get_position_tx(tx, order.user_id, &token)?.ok_or_else(|| {
                            CoreError::IntegrityViolation(format!(
                                "sell fill against missing position {token}"
                            ))
                        })?;
                        let cost_basis = quantity
                            .checked_mul(position.average_entry_price)
                            .map_err(|e| CoreError::Internal(e.to_string()))?;
                        let realized = amount_base
                            .checked_sub(cost_basis)
                            .map_err(|e| CoreError::Internal(e.to_string()))?;
                        (EntryType::Sell, amount_base.neg(), Some(realized))
                    }
                };

                let description = format!(
                    "{} {} via {} order",
                    match order.side {
                        TradeSide::Buy => "BUY",
                        TradeSide::Sell => "SELL",
                    },
                    symbol,
                    order.order_type,
                );
                crate::ledger::insert_entry_tx(
                    tx,
                    &NewLedgerEntry {
                        trace_id,
                        user_id: order.user_id,
                        wallet_address: order.wallet_address.clone(),
                        chain: order.chain,
                        dex: order.dex.clone(),
                        entry_type,
                        description,
                        amount_base: signed_base,
                        amount_native: signed_base,
                        currency: order.chain.native_currency().to_string(),
                        fx_rate_base: Money::ONE,
                        realized_pnl_base: realized,
                        realized_pnl_native: realized,
                        tx_hash: tx_hash.clone(),
                        block_number: None,
                        status: EntryStatus::Confirmed,
                        metadata: EntryMetadata::Trade {
                            token_symbol: symbol,
                            token_address: token.address.clone(),
                            amount_tokens: quantity,
                            dex: order.dex.clone(),
                            pair_address: order.pair_address.clone(),
                            slippage_percent: None,
                            gas_fee_base,
                            gas_fee_native,
                            order_id: Some(order.order_id.clone()),
                            notes: None,
                        },
                        created_at: now,
                    },
                )?;

                match order.side {
                    TradeSide::Buy => {
                        apply_buy_tx(tx, order.user_id, &token, quantity, amount_base, now)?;
                    }
                    TradeSide::Sell => {
                        apply_sell_tx(
                            tx,
                            order.user_id,
                            &token,
                            quantity,
                            realized.unwrap_or(Money::ZERO),
                            now,
                        )?;
                    }
                }
                Ok(recorded.order)
            })
            .await?;

        match updated.status {
            OrderStatus::Filled => {
                info!(order_id = %updated.order_id, price = %price, "order filled");
                Ok(TriggerOutcome::Filled)
            }
            OrderStatus::Active => {
                // DCA slice settled; the schedule continues.
                Ok(TriggerOutcome::ReturnedToActive)
            }
            OrderStatus::PartiallyFilled => {
                // One-shot orders do not re-arm after a partial fill.
                debug_assert!(!updated.order_type.supports_partial_fills());
                self.orders
                    .transition(
                        &updated.order_id,
                        OrderStatus::Failed,
                        Some(format!(
                            "partial fill not supported for type {}",
                            updated.order_type
                        )),
                        None,
                    )
                    .await?;
                Ok(TriggerOutcome::Failed)
            }
            other => Err(CoreError::Internal(format!(
                "unexpected post-fill status {other}"
            ))),
        }
    }
}

fn order_needs_price(order: &AdvancedOrder) -> bool {
    match &order.params {
        OrderParams::Dca { max_price, .. } => max_price.is_some(),
        OrderParams::Market => false,
        _ => true,
    }
}

#[derive(Debug)]
enum TriggerOutcome {
    Filled,
    Failed,
    ReturnedToActive,
    Skipped,
    Error(CoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ChainId;
    use crate::orders::store::NewOrder;
    use crate::positions::PositionStore;
    use crate::testutil::{raw_entry, test_store, FakeExecutor, FakePriceFeed, RawEntry};
    use crate::trading::interfaces::{ExecFailReason, ExecutionResult};

    struct Harness {
        store: Store,
        orders: OrderStore,
        positions: PositionStore,
        system: SystemStateController,
        feed: Arc<FakePriceFeed>,
        executor: Arc<FakeExecutor>,
        monitor: TriggerMonitor,
    }

    async fn harness() -> Harness {
        harness_with(TriggerConfig {
            tick: Duration::from_millis(50),
            ..Default::default()
        })
        .await
    }

    async fn harness_with(config: TriggerConfig) -> Harness {
        let store = test_store().await;
        let orders = OrderStore::new(store.clone());
        let positions = PositionStore::new(store.clone());
        let system = SystemStateController::new(store.clone());
        let tokens = TokenRegistry::new(store.clone());
        let feed = FakePriceFeed::new();
        let executor = FakeExecutor::new();
        let monitor = TriggerMonitor::new(
            store.clone(),
            orders.clone(),
            tokens,
            system.clone(),
            feed.clone(),
            executor.clone(),
            config,
        );
        Harness {
            store,
            orders,
            positions,
            system,
            feed,
            executor,
            monitor,
        }
    }

    fn pepe() -> TokenRef {
        TokenRef::new("0xpepe", ChainId::Ethereum)
    }

    /// Seed a 100-unit holding so sell fills pass the inventory guard.
    async fn seed_holding(h: &Harness) {
        raw_entry(&h.store, RawEntry::buy(1, "aa", "100", "10000")).await;
        h.positions
            .apply_buy(1, &pepe(), "100".parse().unwrap(), "10000".parse().unwrap())
            .await
            .unwrap();
    }

    fn sell_order(params: OrderParams, qty: &str) -> NewOrder {
        NewOrder {
            user_id: 1,
            wallet_address: "0xwallet".to_string(),
            side: TradeSide::Sell,
            token_address: "0xpepe".to_string(),
            token_symbol: Some("PEPE".to_string()),
            pair_address: None,
            chain: ChainId::Ethereum,
            dex: None,
            quantity: qty.parse().unwrap(),
            params,
            expires_at: None,
        }
    }

    async fn active_sell(h: &Harness, params: OrderParams, qty: &str) -> AdvancedOrder {
        let order = h.orders.create_order(sell_order(params, qty)).await.unwrap();
        h.orders.activate_order(&order.order_id).await.unwrap()
    }

    #[tokio::test]
    async fn stop_loss_fires_and_fills_with_ledger_and_position() {
        let h = harness().await;
        seed_holding(&h).await;
        let order = active_sell(
            &h,
            OrderParams::StopLoss {
                stop_price: "90".parse().unwrap(),
            },
            "10",
        )
        .await;

        // Above the stop: held.
        h.feed.set_price(&pepe(), "95");
        let summary = h.monitor.tick().await.unwrap();
        assert_eq!(summary.triggered, 0);

        // At the stop: fires and fills.
        h.feed.set_price(&pepe(), "88");
        let summary = h.monitor.tick().await.unwrap();
        assert_eq!(summary.triggered, 1);
        assert_eq!(summary.filled, 1);

        let order = h.orders.get_order(&order.order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.trigger_price, Some("88".parse().unwrap()));
        assert!(order.remaining_quantity.is_zero());

        // Ledger entry linked by order_id metadata; position reduced.
        let entries = crate::ledger::query_entries(
            &h.store,
            Some(1),
            &crate::ledger::LedgerFilter {
                entry_types: Some(vec![EntryType::Sell]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(entries.len(), 1);
        match &entries[0].metadata {
            EntryMetadata::Trade { order_id, .. } => {
                assert_eq!(order_id.as_deref(), Some(order.order_id.as_str()))
            }
            other => panic!("unexpected metadata {other:?}"),
        }
        // Sold 10 @ 88 against avg cost 100: realized -120.
        assert_eq!(entries[0].realized_pnl_base, Some("-120".parse().unwrap()));

        let position = h.positions.get(1, &pepe()).await.unwrap().unwrap();
        assert_eq!(position.quantity, "90".parse().unwrap());
    }

    #[tokio::test]
    async fn trailing_stop_arms_ratchets_and_fires() {
        let h = harness().await;
        seed_holding(&h).await;
        let order = active_sell(
            &h,
            OrderParams::TrailingStop {
                trail_fraction: "0.1".parse().unwrap(),
                activation_price: Some("120".parse().unwrap()),
                high_water_mark: None,
                armed: false,
            },
            "10",
        )
        .await;

        // 110: below activation, unarmed, no state.
        h.feed.set_price(&pepe(), "110");
        assert_eq!(h.monitor.tick().await.unwrap().triggered, 0);
        let current = h.orders.get_order(&order.order_id).await.unwrap();
        assert!(matches!(
            current.params,
            OrderParams::TrailingStop { armed: false, .. }
        ));

        // 125: arms, watermark 125.
        h.feed.set_price(&pepe(), "125");
        assert_eq!(h.monitor.tick().await.unwrap().triggered, 0);
        let current = h.orders.get_order(&order.order_id).await.unwrap();
        match &current.params {
            OrderParams::TrailingStop {
                armed,
                high_water_mark,
                ..
            } => {
                assert!(*armed);
                assert_eq!(*high_water_mark, Some("125".parse().unwrap()));
            }
            other => panic!("unexpected params {other:?}"),
        }

        // 140: watermark ratchets; stop now 126.
        h.feed.set_price(&pepe(), "140");
        assert_eq!(h.monitor.tick().await.unwrap().triggered, 0);
        let current = h.orders.get_order(&order.order_id).await.unwrap();
        match &current.params {
            OrderParams::TrailingStop { high_water_mark, .. } => {
                assert_eq!(*high_water_mark, Some("140".parse().unwrap()));
            }
            other => panic!("unexpected params {other:?}"),
        }

        // 125 <= 126: fires, executor succeeds, order fills.
        h.feed.set_price(&pepe(), "125");
        let summary = h.monitor.tick().await.unwrap();
        assert_eq!(summary.triggered, 1);
        assert_eq!(summary.filled, 1);
        let current = h.orders.get_order(&order.order_id).await.unwrap();
        assert_eq!(current.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn bracket_target_leg_completes_order() {
        let h = harness().await;
        seed_holding(&h).await;
        let order = active_sell(
            &h,
            OrderParams::Bracket {
                stop_price: "90".parse().unwrap(),
                target_price: "110".parse().unwrap(),
            },
            "10",
        )
        .await;

        h.feed.set_price(&pepe(), "100");
        assert_eq!(h.monitor.tick().await.unwrap().triggered, 0);

        h.feed.set_price(&pepe(), "111");
        let summary = h.monitor.tick().await.unwrap();
        assert_eq!(summary.filled, 1);
        let current = h.orders.get_order(&order.order_id).await.unwrap();
        assert_eq!(current.status, OrderStatus::Filled);

        // Completion prevents any further trigger, even at the stop price.
        h.feed.set_price(&pepe(), "80");
        let summary = h.monitor.tick().await.unwrap();
        assert_eq!(summary.active_orders, 0);
        assert_eq!(summary.triggered, 0);
    }

    #[tokio::test]
    async fn emergency_stop_gates_triggering_until_cleared() {
        let h = harness().await;
        seed_holding(&h).await;
        let order = active_sell(
            &h,
            OrderParams::StopLoss {
                stop_price: "90".parse().unwrap(),
            },
            "10",
        )
        .await;
        h.feed.set_price(&pepe(), "80");

        h.system
            .trip_emergency(None, "Incident", "operator")
            .await
            .unwrap();
        let summary = h.monitor.tick().await.unwrap();
        assert!(summary.emergency_idle);
        assert_eq!(summary.triggered, 0);
        let current = h.orders.get_order(&order.order_id).await.unwrap();
        assert_eq!(current.status, OrderStatus::Active);

        h.system.clear_emergency(None, "operator").await.unwrap();
        let summary = h.monitor.tick().await.unwrap();
        assert_eq!(summary.triggered, 1);
        let current = h.orders.get_order(&order.order_id).await.unwrap();
        assert_eq!(current.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn price_feed_failure_leaves_orders_active_and_warns_after_three() {
        let h = harness().await;
        seed_holding(&h).await;
        let order = active_sell(
            &h,
            OrderParams::StopLoss {
                stop_price: "90".parse().unwrap(),
            },
            "10",
        )
        .await;
        h.feed.fail_key(&pepe());

        for _ in 0..3 {
            let summary = h.monitor.tick().await.unwrap();
            assert_eq!(summary.triggered, 0);
            assert_eq!(summary.price_failures, 1);
        }
        let current = h.orders.get_order(&order.order_id).await.unwrap();
        assert_eq!(current.status, OrderStatus::Active);

        let events = h
            .system
            .events_of_type("price_feed_degraded", 10)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn retryable_executor_failure_returns_to_active() {
        let h = harness().await;
        seed_holding(&h).await;
        let order = active_sell(
            &h,
            OrderParams::StopLoss {
                stop_price: "90".parse().unwrap(),
            },
            "10",
        )
        .await;
        h.feed.set_price(&pepe(), "80");
        h.executor
            .push_result(ExecutionResult::failed(ExecFailReason::retryable("nonce race")));
        h.executor
            .push_result(ExecutionResult::failed(ExecFailReason::retryable("nonce race")));

        let summary = h.monitor.tick().await.unwrap();
        assert_eq!(summary.returned_to_active, 1);
        let current = h.orders.get_order(&order.order_id).await.unwrap();
        assert_eq!(current.status, OrderStatus::Active);
    }

    #[tokio::test]
    async fn terminal_executor_failure_fails_order() {
        let h = harness().await;
        seed_holding(&h).await;
        let order = active_sell(
            &h,
            OrderParams::StopLoss {
                stop_price: "90".parse().unwrap(),
            },
            "10",
        )
        .await;
        h.feed.set_price(&pepe(), "80");
        h.executor.push_result(ExecutionResult::failed(ExecFailReason::terminal(
            "insufficient funds",
        )));
        h.executor.push_result(ExecutionResult::failed(ExecFailReason::terminal(
            "insufficient funds",
        )));

        let summary = h.monitor.tick().await.unwrap();
        assert_eq!(summary.failed, 1);
        let current = h.orders.get_order(&order.order_id).await.unwrap();
        assert_eq!(current.status, OrderStatus::Failed);
        assert_eq!(current.error_message.as_deref(), Some("insufficient funds"));
    }

    #[tokio::test]
    async fn executor_timeout_fails_order_without_counting_fill() {
        let h = harness_with(TriggerConfig {
            tick: Duration::from_millis(50),
            executor_timeout: Duration::from_millis(50),
            ..Default::default()
        })
        .await;
        seed_holding(&h).await;
        let order = active_sell(
            &h,
            OrderParams::StopLoss {
                stop_price: "90".parse().unwrap(),
            },
            "10",
        )
        .await;
        h.feed.set_price(&pepe(), "80");
        h.executor.set_delay(Duration::from_millis(300));

        let summary = h.monitor.tick().await.unwrap();
        assert_eq!(summary.failed, 1);
        let current = h.orders.get_order(&order.order_id).await.unwrap();
        assert_eq!(current.status, OrderStatus::Failed);
        assert!(current.remaining_quantity == current.quantity, "no fill recorded");
        assert!(h
            .orders
            .executions_for(&order.order_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn dca_fires_on_interval_and_respects_max_price() {
        let h = harness().await;
        let order = h
            .orders
            .create_order(NewOrder {
                side: TradeSide::Buy,
                params: OrderParams::Dca {
                    interval_minutes: 1,
                    num_orders: 2,
                    per_order_quantity: "5".parse().unwrap(),
                    max_price: Some("100".parse().unwrap()),
                },
                ..sell_order(
                    OrderParams::Market, // placeholder replaced above
                    "10",
                )
            })
            .await
            .unwrap();
        h.orders.activate_order(&order.order_id).await.unwrap();

        // Backdate creation so the first interval is already due.
        h.store
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE advanced_orders SET created_at = ?1",
                    rusqlite::params![crate::store::ts_to_sql(
                        Utc::now() - ChronoDuration::minutes(5)
                    )],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        // Price above the cap: slice skipped.
        h.feed.set_price(&pepe(), "150");
        assert_eq!(h.monitor.tick().await.unwrap().triggered, 0);

        // Price under the cap: first slice buys 5.
        h.feed.set_price(&pepe(), "90");
        let summary = h.monitor.tick().await.unwrap();
        assert_eq!(summary.triggered, 1);
        let current = h.orders.get_order(&order.order_id).await.unwrap();
        assert_eq!(current.status, OrderStatus::Active);
        assert_eq!(current.remaining_quantity, "5".parse().unwrap());
        assert_eq!(current.execution_count, 1);

        // Next slice only after the interval elapses.
        assert_eq!(h.monitor.tick().await.unwrap().triggered, 0);
    }

    #[tokio::test]
    async fn predicate_monotonicity_for_stop_loss_sell() {
        let h = harness().await;
        seed_holding(&h).await;
        let order = active_sell(
            &h,
            OrderParams::StopLoss {
                stop_price: "90".parse().unwrap(),
            },
            "10",
        )
        .await;

        let firing_price: Money = "90".parse().unwrap();
        let (decision, _) = evaluate(&order, Some(firing_price), Utc::now()).unwrap();
        assert!(matches!(decision, TriggerDecision::Fire { .. }));

        // Any lower price also fires.
        for lower in ["89.999999", "50", "0.000001"] {
            let (decision, _) =
                evaluate(&order, Some(lower.parse().unwrap()), Utc::now()).unwrap();
            assert!(
                matches!(decision, TriggerDecision::Fire { .. }),
                "price {lower} must fire"
            );
        }
        // And a higher one holds.
        let (decision, _) =
            evaluate(&order, Some("90.000001".parse().unwrap()), Utc::now()).unwrap();
        assert_eq!(decision, TriggerDecision::Hold);
    }

    #[tokio::test]
    async fn run_loop_shuts_down_within_a_tick() {
        let h = harness_with(TriggerConfig {
            tick: Duration::from_millis(20),
            ..Default::default()
        })
        .await;
        let monitor = h.monitor.clone();
        let handle = tokio::spawn(async move { monitor.run().await });

        tokio::time::sleep(Duration::from_millis(60)).await;
        h.monitor.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok(), "run loop must exit after shutdown");
    }
}
