//! Contracts for the external collaborators the core consumes.
//!
//! Chain RPC clients, DEX routers and price oracles live outside this crate;
//! the core only sees these traits. Components take them as injected
//! `Arc<dyn ...>` handles so tests can substitute fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::{CoreError, CoreResult};
use crate::ids::{ChainId, TokenRef};
use crate::money::Money;

/// Default per-call timeouts for every suspension point.
pub const PRICE_TIMEOUT: Duration = Duration::from_secs(5);
pub const ALLOWANCE_TIMEOUT: Duration = Duration::from_secs(5);
pub const SWAP_SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);
pub const RECEIPT_TIMEOUT: Duration = Duration::from_secs(120);
pub const FILE_IO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceQuote {
    pub price_base: Money,
    pub at: DateTime<Utc>,
}

/// Price oracle. `Err(ExternalUnavailable)` models `PriceUnavailable`.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn get_price(&self, token: &TokenRef) -> CoreResult<PriceQuote>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }
}

impl std::str::FromStr for TradeSide {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(TradeSide::Buy),
            "sell" => Ok(TradeSide::Sell),
            other => Err(CoreError::InputInvalid(format!("unknown side: {other}"))),
        }
    }
}

/// One executable unit handed to the DEX router adapter.
#[derive(Debug, Clone)]
pub struct OrderSlice {
    pub order_id: String,
    pub user_id: i64,
    pub side: TradeSide,
    pub token: TokenRef,
    pub token_symbol: String,
    pub wallet_address: String,
    pub quantity: Money,
    pub limit_price: Option<Money>,
    pub dex: Option<String>,
}

/// Failure classification drives the order state machine: retryable leaves
/// the order active, terminal drives it to `failed`.
#[derive(Debug, Clone)]
pub struct ExecFailReason {
    pub retryable: bool,
    pub reason: String,
}

impl ExecFailReason {
    pub fn retryable(reason: impl Into<String>) -> Self {
        ExecFailReason {
            retryable: true,
            reason: reason.into(),
        }
    }

    pub fn terminal(reason: impl Into<String>) -> Self {
        ExecFailReason {
            retryable: false,
            reason: reason.into(),
        }
    }
}

/// Bounded execution result: success or a classified failure, never partial
/// hidden state.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub amount_out: Money,
    pub executed_price: Money,
    pub tx_hash: Option<String>,
    pub gas_used: Option<i64>,
    pub gas_fee_native: Option<Money>,
    pub gas_fee_base: Option<Money>,
    pub fail_reason: Option<ExecFailReason>,
}

impl ExecutionResult {
    pub fn filled(amount_out: Money, price: Money, tx_hash: impl Into<String>) -> Self {
        ExecutionResult {
            success: true,
            amount_out,
            executed_price: price,
            tx_hash: Some(tx_hash.into()),
            gas_used: None,
            gas_fee_native: None,
            gas_fee_base: None,
            fail_reason: None,
        }
    }

    pub fn failed(reason: ExecFailReason) -> Self {
        ExecutionResult {
            success: false,
            amount_out: Money::ZERO,
            executed_price: Money::ZERO,
            tx_hash: None,
            gas_used: None,
            gas_fee_native: None,
            gas_fee_base: None,
            fail_reason: Some(reason),
        }
    }
}

/// DEX router adapter. Transport errors surface as `ExternalUnavailable`
/// (retryable); everything else comes back as an [`ExecutionResult`].
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    async fn execute(&self, slice: &OrderSlice) -> CoreResult<ExecutionResult>;
}

/// Chain RPC surface needed by the approval manager.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn get_allowance(
        &self,
        chain: ChainId,
        owner: &str,
        token: &str,
        spender: &str,
    ) -> CoreResult<Money>;

    /// Submit an approval (amount zero revokes). Returns the tx hash.
    async fn submit_approval(
        &self,
        chain: ChainId,
        owner: &str,
        token: &str,
        spender: &str,
        amount: Money,
    ) -> CoreResult<String>;

    async fn wait_receipt(&self, chain: ChainId, tx_hash: &str) -> CoreResult<bool>;
}

/// Retry an idempotent external call with exponential backoff.
///
/// Only retryable error kinds are retried; everything else bubbles up on
/// the first attempt. `attempts` counts total tries, not retries.
pub async fn retry_with_backoff<T, F, Fut>(
    attempts: usize,
    base_delay: Duration,
    mut call: F,
) -> CoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = CoreResult<T>>,
{
    let mut delay = base_delay;
    let mut last_err = None;
    for attempt in 1..=attempts.max(1) {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < attempts => {
                tracing::debug!(attempt, error = %err, "retryable failure, backing off");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| CoreError::Internal("retry loop exhausted".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retry_stops_after_success() {
        let calls = AtomicUsize::new(0);
        let result = retry_with_backoff(3, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 1 {
                    Err(CoreError::ExternalUnavailable("flaky".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_does_not_touch_terminal_errors() {
        let calls = AtomicUsize::new(0);
        let result: CoreResult<()> = retry_with_backoff(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(CoreError::InputInvalid("bad".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(CoreError::InputInvalid(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_exhausts_attempts() {
        let calls = AtomicUsize::new(0);
        let result: CoreResult<()> = retry_with_backoff(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(CoreError::ExternalUnavailable("down".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(CoreError::ExternalUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
