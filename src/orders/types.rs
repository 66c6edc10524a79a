//! Advanced-order records and the execution state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, CoreResult};
use crate::ids::{ChainId, TokenRef, TraceId};
use crate::money::Money;
use crate::trading::interfaces::TradeSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    StopLoss,
    TakeProfit,
    TrailingStop,
    Dca,
    Bracket,
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::StopLoss => "stop_loss",
            OrderType::TakeProfit => "take_profit",
            OrderType::TrailingStop => "trailing_stop",
            OrderType::Dca => "dca",
            OrderType::Bracket => "bracket",
            OrderType::Limit => "limit",
            OrderType::Market => "market",
        }
    }

    /// Whether a partial fill may re-arm the order for further executions.
    /// Only DCA supports repeated fills; one-shot orders must fill whole.
    pub fn supports_partial_fills(&self) -> bool {
        matches!(self, OrderType::Dca)
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop_loss" => Ok(OrderType::StopLoss),
            "take_profit" => Ok(OrderType::TakeProfit),
            "trailing_stop" => Ok(OrderType::TrailingStop),
            "dca" => Ok(OrderType::Dca),
            "bracket" => Ok(OrderType::Bracket),
            "limit" => Ok(OrderType::Limit),
            "market" => Ok(OrderType::Market),
            other => Err(CoreError::InputInvalid(format!("unknown order type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Active,
    Triggered,
    Filled,
    PartiallyFilled,
    Cancelled,
    Failed,
    Expired,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Active => "active",
            OrderStatus::Triggered => "triggered",
            OrderStatus::Filled => "filled",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Failed => "failed",
            OrderStatus::Expired => "expired",
        }
    }

    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Failed | OrderStatus::Expired
        )
    }

    /// Legal transitions of the execution state machine.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match self {
            Pending => matches!(next, Active | Cancelled | Expired | Failed),
            Active => matches!(next, Triggered | Cancelled | Expired | Failed),
            // Triggered returns to Active only on a retryable executor
            // failure; cancellation of in-flight execution is not allowed.
            Triggered => matches!(next, Filled | PartiallyFilled | Failed | Expired | Active),
            PartiallyFilled => matches!(next, Active | Filled | Cancelled | Failed | Expired),
            Filled | Cancelled | Failed | Expired => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "active" => Ok(OrderStatus::Active),
            "triggered" => Ok(OrderStatus::Triggered),
            "filled" => Ok(OrderStatus::Filled),
            "partially_filled" => Ok(OrderStatus::PartiallyFilled),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "failed" => Ok(OrderStatus::Failed),
            "expired" => Ok(OrderStatus::Expired),
            other => Err(CoreError::InputInvalid(format!("unknown order status: {other}"))),
        }
    }
}

/// Type-specific parameters, one variant per order type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderParams {
    StopLoss {
        stop_price: Money,
    },
    TakeProfit {
        target_price: Money,
    },
    TrailingStop {
        /// Fraction of the watermark given back before firing (0.1 = 10%).
        trail_fraction: Money,
        /// Not armed until price first reaches this level, when set.
        #[serde(skip_serializing_if = "Option::is_none", default)]
        activation_price: Option<Money>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        high_water_mark: Option<Money>,
        #[serde(default)]
        armed: bool,
    },
    Dca {
        interval_minutes: i64,
        num_orders: u32,
        per_order_quantity: Money,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        max_price: Option<Money>,
    },
    Bracket {
        stop_price: Money,
        target_price: Money,
    },
    Limit {
        limit_price: Money,
    },
    Market,
}

impl OrderParams {
    pub fn order_type(&self) -> OrderType {
        match self {
            OrderParams::StopLoss { .. } => OrderType::StopLoss,
            OrderParams::TakeProfit { .. } => OrderType::TakeProfit,
            OrderParams::TrailingStop { .. } => OrderType::TrailingStop,
            OrderParams::Dca { .. } => OrderType::Dca,
            OrderParams::Bracket { .. } => OrderType::Bracket,
            OrderParams::Limit { .. } => OrderType::Limit,
            OrderParams::Market => OrderType::Market,
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        let positive = |name: &str, value: Money| -> CoreResult<()> {
            if !value.is_positive() {
                return Err(CoreError::InputInvalid(format!(
                    "{name} must be positive, got {value}"
                )));
            }
            Ok(())
        };
        match self {
            OrderParams::StopLoss { stop_price } => positive("stop_price", *stop_price),
            OrderParams::TakeProfit { target_price } => positive("target_price", *target_price),
            OrderParams::TrailingStop {
                trail_fraction,
                activation_price,
                ..
            } => {
                if !trail_fraction.is_positive() || *trail_fraction >= Money::ONE {
                    return Err(CoreError::InputInvalid(format!(
                        "trail_fraction must be in (0, 1), got {trail_fraction}"
                    )));
                }
                if let Some(activation) = activation_price {
                    positive("activation_price", *activation)?;
                }
                Ok(())
            }
            OrderParams::Dca {
                interval_minutes,
                num_orders,
                per_order_quantity,
                max_price,
            } => {
                if *interval_minutes <= 0 {
                    return Err(CoreError::InputInvalid(
                        "interval_minutes must be positive".to_string(),
                    ));
                }
                if *num_orders == 0 {
                    return Err(CoreError::InputInvalid(
                        "num_orders must be at least 1".to_string(),
                    ));
                }
                positive("per_order_quantity", *per_order_quantity)?;
                if let Some(cap) = max_price {
                    positive("max_price", *cap)?;
                }
                Ok(())
            }
            OrderParams::Bracket {
                stop_price,
                target_price,
            } => {
                positive("stop_price", *stop_price)?;
                positive("target_price", *target_price)?;
                if stop_price >= target_price {
                    return Err(CoreError::InputInvalid(format!(
                        "bracket stop {stop_price} must sit below target {target_price}"
                    )));
                }
                Ok(())
            }
            OrderParams::Limit { limit_price } => positive("limit_price", *limit_price),
            OrderParams::Market => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdvancedOrder {
    pub order_id: String,
    pub user_id: i64,
    pub wallet_address: String,
    pub order_type: OrderType,
    pub side: TradeSide,
    pub token_address: String,
    pub token_symbol: Option<String>,
    pub pair_address: Option<String>,
    pub chain: ChainId,
    pub dex: Option<String>,
    pub quantity: Money,
    pub remaining_quantity: Money,
    pub trigger_price: Option<Money>,
    pub params: OrderParams,
    pub status: OrderStatus,
    pub execution_count: u32,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub fill_price: Option<Money>,
    pub trace_id: Option<TraceId>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AdvancedOrder {
    pub fn token_ref(&self) -> TokenRef {
        TokenRef::new(self.token_address.clone(), self.chain)
    }

    /// I6: remaining quantity stays within [0, quantity].
    pub fn check_quantity_invariant(&self) -> CoreResult<()> {
        if self.remaining_quantity.is_negative() || self.remaining_quantity > self.quantity {
            return Err(CoreError::IntegrityViolation(format!(
                "order {} remaining {} outside [0, {}]",
                self.order_id, self.remaining_quantity, self.quantity
            )));
        }
        Ok(())
    }

    /// Quantity for the next execution slice.
    pub fn next_slice_quantity(&self) -> Money {
        match &self.params {
            OrderParams::Dca {
                per_order_quantity, ..
            } => self.remaining_quantity.min(*per_order_quantity),
            _ => self.remaining_quantity,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderExecution {
    pub execution_id: String,
    pub order_id: String,
    pub quantity: Money,
    pub price: Money,
    pub tx_hash: Option<String>,
    pub status: String,
    pub trace_id: Option<TraceId>,
    pub executed_at: DateTime<Utc>,
}
