//! Shared test fixtures: in-memory stores, raw row seeding, and fake
//! collaborators for the price feed, executor and RPC client.

#![cfg(test)]

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::ids::{ChainId, TokenRef};
use crate::ledger::writer::LedgerWriter;
use crate::money::Money;
use crate::store::Store;
use crate::system::state::SystemStateController;
use crate::tokens::TokenRegistry;
use crate::trading::interfaces::{
    ExecutionResult, OrderExecutor, OrderSlice, PriceFeed, PriceQuote, RpcClient,
};

pub async fn test_store() -> Store {
    Store::open_in_memory().await.expect("in-memory store")
}

pub async fn test_system(store: Store) -> SystemStateController {
    SystemStateController::new(store)
}

pub async fn test_tokens(store: Store) -> TokenRegistry {
    TokenRegistry::new(store)
}

/// Writer over a fresh in-memory store with one seeded user.
pub async fn test_writer() -> (LedgerWriter, Store) {
    let store = test_store().await;
    store
        .with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (user_id, username, created_at) \
                 VALUES (1, 'tester', '2024-01-01T00:00:00.000Z')",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();
    let system = test_system(store.clone()).await;
    let tokens = test_tokens(store.clone()).await;
    let writer = LedgerWriter::new(
        store.clone(),
        system,
        tokens,
        Arc::new(CoreConfig::default()),
    );
    (writer, store)
}

/// Raw ledger row for seeding anomalies the writer would refuse.
pub struct RawEntry {
    pub user_id: i64,
    pub trace: String,
    pub entry_type: String,
    pub wallet: String,
    pub chain: String,
    pub qty: String,
    pub amount_base: String,
    pub fx_rate: String,
    pub realized_pnl_base: Option<String>,
    pub realized_pnl_native: Option<String>,
    pub tx_hash: Option<String>,
    pub created_at: String,
}

impl RawEntry {
    pub fn buy(user_id: i64, trace: &str, qty: &str, amount_base: &str) -> Self {
        RawEntry {
            user_id,
            trace: trace.to_string(),
            entry_type: "buy".to_string(),
            wallet: "0xwallet".to_string(),
            chain: "ethereum".to_string(),
            qty: qty.to_string(),
            amount_base: amount_base.to_string(),
            fx_rate: "2000".to_string(),
            realized_pnl_base: None,
            realized_pnl_native: None,
            tx_hash: None,
            created_at: "2024-01-01T00:00:00.000Z".to_string(),
        }
    }

    pub fn sell(user_id: i64, trace: &str, qty: &str, amount_base: &str, at: &str) -> Self {
        RawEntry {
            user_id,
            trace: trace.to_string(),
            entry_type: "sell".to_string(),
            wallet: "0xwallet".to_string(),
            chain: "ethereum".to_string(),
            qty: qty.to_string(),
            amount_base: format!("-{amount_base}"),
            fx_rate: "2000".to_string(),
            realized_pnl_base: None,
            realized_pnl_native: None,
            tx_hash: None,
            created_at: at.to_string(),
        }
    }
}

pub async fn raw_entry(store: &Store, entry: RawEntry) {
    let metadata = serde_json::json!({
        "kind": "trade",
        "token_symbol": "PEPE",
        "token_address": "0xpepe",
        "amount_tokens": entry.qty,
    })
    .to_string();
    store
        .with_conn(move |conn| {
            conn.execute(
                "INSERT INTO ledger_entries (trace_id, user_id, wallet_address, chain, entry_type, \
                 description, amount_base, amount_native, currency, fx_rate_base, realized_pnl_base, \
                 realized_pnl_native, tx_hash, status, metadata, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'ETH', ?9, ?10, ?11, ?12, 'confirmed', ?13, ?14)",
                rusqlite::params![
                    // Widen the short label into a valid 32-char hex trace id.
                    format!("{:0>32}", hex::encode(entry.trace.as_bytes())),
                    entry.user_id,
                    entry.wallet,
                    entry.chain,
                    entry.entry_type,
                    format!("{} PEPE", entry.entry_type.to_uppercase()),
                    entry.amount_base,
                    entry.amount_base,
                    entry.fx_rate,
                    entry.realized_pnl_base,
                    entry.realized_pnl_native,
                    entry.tx_hash,
                    metadata,
                    entry.created_at,
                ],
            )?;
            Ok(())
        })
        .await
        .unwrap();
}

/// Price feed backed by a mutable map; keys missing from the map return
/// `ExternalUnavailable` like a real oracle outage.
#[derive(Default)]
pub struct FakePriceFeed {
    prices: Mutex<HashMap<String, Money>>,
    failing: Mutex<HashSet<String>>,
}

impl FakePriceFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_price(&self, token: &TokenRef, price: &str) {
        self.prices
            .lock()
            .insert(token.to_string(), price.parse().unwrap());
    }

    pub fn fail_key(&self, token: &TokenRef) {
        self.failing.lock().insert(token.to_string());
    }

    pub fn clear_failure(&self, token: &TokenRef) {
        self.failing.lock().remove(&token.to_string());
    }
}

#[async_trait]
impl PriceFeed for FakePriceFeed {
    async fn get_price(&self, token: &TokenRef) -> CoreResult<PriceQuote> {
        let key = token.to_string();
        if self.failing.lock().contains(&key) {
            return Err(CoreError::ExternalUnavailable(format!(
                "price unavailable for {key}"
            )));
        }
        let price = self
            .prices
            .lock()
            .get(&key)
            .copied()
            .ok_or_else(|| CoreError::ExternalUnavailable(format!("no price for {key}")))?;
        Ok(PriceQuote {
            price_base: price,
            at: Utc::now(),
        })
    }
}

/// Executor returning scripted results in order; repeats the last result
/// when the script runs dry.
pub struct FakeExecutor {
    script: Mutex<VecDeque<ExecutionResult>>,
    pub executed: Mutex<Vec<OrderSlice>>,
    delay: Mutex<Option<std::time::Duration>>,
}

impl FakeExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeExecutor {
            script: Mutex::new(VecDeque::new()),
            executed: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
        })
    }

    pub fn push_result(&self, result: ExecutionResult) {
        self.script.lock().push_back(result);
    }

    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn executed_count(&self) -> usize {
        self.executed.lock().len()
    }
}

#[async_trait]
impl OrderExecutor for FakeExecutor {
    async fn execute(&self, slice: &OrderSlice) -> CoreResult<ExecutionResult> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.executed.lock().push(slice.clone());
        let mut script = self.script.lock();
        let result = if script.len() > 1 {
            script.pop_front().unwrap()
        } else if let Some(last) = script.front() {
            last.clone()
        } else {
            ExecutionResult::filled(slice.quantity, slice.limit_price.unwrap_or(Money::ONE), "0xfaketx")
        };
        Ok(result)
    }
}

/// RPC client with canned allowances and a submission log.
#[derive(Default)]
pub struct FakeRpc {
    allowances: Mutex<HashMap<String, Money>>,
    pub submitted: Mutex<Vec<(String, Money)>>,
}

impl FakeRpc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn key(chain: ChainId, owner: &str, token: &str, spender: &str) -> String {
        format!("{chain}:{owner}:{token}:{spender}")
    }

    pub fn set_allowance(&self, chain: ChainId, owner: &str, token: &str, spender: &str, amount: &str) {
        self.allowances
            .lock()
            .insert(Self::key(chain, owner, token, spender), amount.parse().unwrap());
    }
}

#[async_trait]
impl RpcClient for FakeRpc {
    async fn get_allowance(
        &self,
        chain: ChainId,
        owner: &str,
        token: &str,
        spender: &str,
    ) -> CoreResult<Money> {
        Ok(self
            .allowances
            .lock()
            .get(&Self::key(chain, owner, token, spender))
            .copied()
            .unwrap_or(Money::ZERO))
    }

    async fn submit_approval(
        &self,
        chain: ChainId,
        owner: &str,
        token: &str,
        spender: &str,
        amount: Money,
    ) -> CoreResult<String> {
        let key = Self::key(chain, owner, token, spender);
        self.allowances.lock().insert(key.clone(), amount);
        self.submitted.lock().push((key, amount));
        Ok(format!("0xapproval{}", self.submitted.lock().len()))
    }

    async fn wait_receipt(&self, _chain: ChainId, _tx_hash: &str) -> CoreResult<bool> {
        Ok(true)
    }
}
