//! Portfolio aggregation: positions, allocation, concentration, risk.
//!
//! Monetary aggregates stay in the fixed-point `Money` type end to end;
//! ratios (shares, HHI, Sharpe) convert to float only as the final
//! presentation step.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::{CoreError, CoreResult};
use crate::ids::TokenRef;
use crate::money::{Money, RoundingMode};
use crate::reporting::pnl::{Granularity, PnlEngine};
use crate::trading::interfaces::PriceFeed;

/// Window for the daily-PnL risk statistics.
const RISK_WINDOW_DAYS: i64 = 90;

fn mny(result: Result<Money, crate::money::MoneyError>) -> CoreResult<Money> {
    result.map_err(|e| CoreError::Internal(format!("portfolio arithmetic: {e}")))
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionRow {
    pub token: TokenRef,
    pub token_symbol: String,
    pub quantity: Money,
    pub average_cost_base: Money,
    pub invested_base: Money,
    pub value_base: Money,
    pub realized_pnl_base: Money,
    pub unrealized_pnl_base: Money,
    pub share_percent: f64,
    pub mark_price_missing: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioTotals {
    pub value_base: Money,
    pub invested_base: Money,
    pub realized_pnl_base: Money,
    pub unrealized_pnl_base: Money,
}

/// Value-tier membership: `>10%`, `1–10%`, `<1%` of portfolio value.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AllocationTiers {
    pub over_10_percent: Vec<String>,
    pub from_1_to_10_percent: Vec<String>,
    pub under_1_percent: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Concentration {
    /// Herfindahl-Hirschman index over position shares, in [1/n, 1].
    pub hhi: f64,
    pub top3_share: f64,
    pub largest_share: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskMetrics {
    pub daily_pnl_stdev_base: f64,
    pub max_drawdown_percent: f64,
    pub sharpe_ratio: f64,
    pub window_days: i64,
}

#[derive(Debug, Serialize)]
pub struct PortfolioOverview {
    pub user_id: i64,
    pub as_of: DateTime<Utc>,
    pub totals: PortfolioTotals,
    pub positions: Vec<PositionRow>,
    pub allocation_by_chain: BTreeMap<String, Money>,
    pub allocation_tiers: AllocationTiers,
    pub concentration: Concentration,
    pub risk: RiskMetrics,
}

#[derive(Clone)]
pub struct PortfolioView {
    engine: PnlEngine,
}

impl PortfolioView {
    pub fn new(engine: PnlEngine) -> Self {
        PortfolioView { engine }
    }

    /// Aggregate the portfolio as of `as_of` (default now).
    pub async fn overview(
        &self,
        user_id: i64,
        as_of: Option<DateTime<Utc>>,
        price_feed: Option<&dyn PriceFeed>,
    ) -> CoreResult<PortfolioOverview> {
        let as_of = as_of.unwrap_or_else(Utc::now);
        let report = self
            .engine
            .calculate_user_pnl(user_id, None, Some(as_of), price_feed)
            .await?;

        let mut positions: Vec<PositionRow> = Vec::new();
        let mut total_value = Money::ZERO;
        let mut total_invested = Money::ZERO;
        let mut allocation_by_chain: BTreeMap<String, Money> = BTreeMap::new();

        for token in report.by_token.values() {
            if !token.remaining_quantity.is_positive() {
                continue;
            }
            // Value = cost + unrealized (identical to quantity × mark when a
            // price was available; cost when the feed fell back).
            let value = mny(token.remaining_cost_base.checked_add(token.unrealized_base))?;
            total_value = mny(total_value.checked_add(value))?;
            total_invested = mny(total_invested.checked_add(token.remaining_cost_base))?;
            let chain_slot = allocation_by_chain
                .entry(token.token.chain.as_str().to_string())
                .or_insert(Money::ZERO);
            *chain_slot = mny(chain_slot.checked_add(value))?;

            positions.push(PositionRow {
                token: token.token.clone(),
                token_symbol: token.token_symbol.clone(),
                quantity: token.remaining_quantity,
                average_cost_base: token.average_cost_base,
                invested_base: token.remaining_cost_base,
                value_base: value,
                realized_pnl_base: token.realized_base,
                unrealized_pnl_base: token.unrealized_base,
                share_percent: 0.0,
                mark_price_missing: token.mark_price_missing,
            });
        }

        positions.sort_by(|a, b| b.value_base.cmp(&a.value_base));

        // Shares, tiers and concentration off the sorted rows.
        let mut tiers = AllocationTiers::default();
        let mut hhi = 0.0;
        let mut top3 = 0.0;
        let mut largest = 0.0;
        for (idx, row) in positions.iter_mut().enumerate() {
            let share = if total_value.is_positive() {
                mny(row.value_base.checked_div(total_value, RoundingMode::HalfEven))?.to_f64()
            } else {
                0.0
            };
            row.share_percent = share * 100.0;
            hhi += share * share;
            if idx < 3 {
                top3 += share;
            }
            if idx == 0 {
                largest = share;
            }
            let label = format!("{}@{}", row.token_symbol, row.token.chain);
            if share > 0.10 {
                tiers.over_10_percent.push(label);
            } else if share >= 0.01 {
                tiers.from_1_to_10_percent.push(label);
            } else {
                tiers.under_1_percent.push(label);
            }
        }

        let risk = self.risk_metrics(user_id, as_of).await?;

        Ok(PortfolioOverview {
            user_id,
            as_of,
            totals: PortfolioTotals {
                value_base: total_value,
                invested_base: total_invested,
                realized_pnl_base: report.realized_total_base,
                unrealized_pnl_base: report.unrealized_total_base,
            },
            positions,
            allocation_by_chain,
            allocation_tiers: tiers,
            concentration: Concentration {
                hhi,
                top3_share: top3,
                largest_share: largest,
            },
            risk,
        })
    }

    /// Daily-PnL stdev, max drawdown, Sharpe (zero risk-free rate) over the
    /// trailing 90-day window.
    async fn risk_metrics(&self, user_id: i64, as_of: DateTime<Utc>) -> CoreResult<RiskMetrics> {
        let start = as_of - Duration::days(RISK_WINDOW_DAYS);
        let points = self
            .engine
            .timeline(user_id, start, as_of, Granularity::Daily)
            .await?;

        if points.is_empty() {
            return Ok(RiskMetrics {
                daily_pnl_stdev_base: 0.0,
                max_drawdown_percent: 0.0,
                sharpe_ratio: 0.0,
                window_days: RISK_WINDOW_DAYS,
            });
        }

        // Mean and squared deviations accumulate exactly in Money; the
        // square root is the presentation step.
        let n = points.len() as i64;
        let mut sum = Money::ZERO;
        for point in &points {
            sum = mny(sum.checked_add(point.period_realized_base))?;
        }
        let count_money = Money::from_int(n);
        let mean = mny(sum.checked_div(count_money, RoundingMode::HalfEven))?;

        let mut sq_sum = Money::ZERO;
        for point in &points {
            let dev = mny(point.period_realized_base.checked_sub(mean))?;
            sq_sum = mny(sq_sum.checked_add(mny(dev.checked_mul(dev))?))?;
        }
        let variance = mny(sq_sum.checked_div(count_money, RoundingMode::HalfEven))?;
        let stdev = variance.to_f64().max(0.0).sqrt();
        let sharpe = if stdev > 0.0 {
            mean.to_f64() / stdev
        } else {
            0.0
        };

        // Max drawdown over the cumulative realized curve.
        let mut peak = Money::ZERO;
        let mut max_drawdown = 0.0f64;
        for point in &points {
            let value = point.cumulative_realized_base;
            if value > peak {
                peak = value;
            } else if peak.is_positive() {
                let drop = mny(peak.checked_sub(value))?;
                let pct = mny(drop.checked_div(peak, RoundingMode::HalfEven))?.to_f64() * 100.0;
                max_drawdown = max_drawdown.max(pct);
            }
        }

        Ok(RiskMetrics {
            daily_pnl_stdev_base: stdev,
            max_drawdown_percent: max_drawdown,
            sharpe_ratio: sharpe,
            window_days: RISK_WINDOW_DAYS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccountingMethod;
    use crate::ids::ChainId;
    use crate::ledger::writer::{TradeKind, TradeParams};
    use crate::testutil::{test_writer, FakePriceFeed};

    fn trade(token: &str, kind: TradeKind, qty: &str, base: &str) -> TradeParams {
        TradeParams {
            user_id: 1,
            trace_id: None,
            kind,
            chain: ChainId::Ethereum,
            wallet_address: "0xwallet".to_string(),
            token_symbol: token.to_uppercase(),
            token_address: format!("0x{token}"),
            amount_tokens: qty.parse().unwrap(),
            amount_native: base.parse().unwrap(),
            amount_base: base.parse().unwrap(),
            fx_rate_base: "1".parse().unwrap(),
            gas_fee_native: None,
            gas_fee_base: None,
            dex: None,
            pair_address: None,
            slippage_percent: None,
            notes: None,
            tx_hash: None,
            block_number: None,
            realized_pnl_base: None,
            realized_pnl_native: None,
            cost_basis_base: None,
            order_id: None,
        }
    }

    #[tokio::test]
    async fn overview_sorts_by_value_and_totals_add_up() {
        let (writer, store) = test_writer().await;
        writer.write_trade(trade("big", TradeKind::Buy, "10", "900")).await.unwrap();
        writer.write_trade(trade("small", TradeKind::Buy, "10", "100")).await.unwrap();

        let view = PortfolioView::new(PnlEngine::new(store, AccountingMethod::Fifo));
        let overview = view.overview(1, None, None).await.unwrap();

        assert_eq!(overview.positions.len(), 2);
        assert_eq!(overview.positions[0].token_symbol, "BIG");
        assert_eq!(overview.totals.invested_base, "1000".parse().unwrap());
        assert_eq!(overview.totals.value_base, "1000".parse().unwrap());
        assert!((overview.positions[0].share_percent - 90.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn concentration_metrics() {
        let (writer, store) = test_writer().await;
        writer.write_trade(trade("aaa", TradeKind::Buy, "1", "500")).await.unwrap();
        writer.write_trade(trade("bbb", TradeKind::Buy, "1", "500")).await.unwrap();

        let view = PortfolioView::new(PnlEngine::new(store, AccountingMethod::Fifo));
        let overview = view.overview(1, None, None).await.unwrap();
        // Two equal positions: HHI = 0.5, largest = 0.5, top3 = 1.0.
        assert!((overview.concentration.hhi - 0.5).abs() < 1e-9);
        assert!((overview.concentration.largest_share - 0.5).abs() < 1e-9);
        assert!((overview.concentration.top3_share - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn tiers_bucket_by_share() {
        let (writer, store) = test_writer().await;
        writer.write_trade(trade("huge", TradeKind::Buy, "1", "989")).await.unwrap();
        writer.write_trade(trade("mid", TradeKind::Buy, "1", "10.5")).await.unwrap();
        writer.write_trade(trade("tiny", TradeKind::Buy, "1", "0.5")).await.unwrap();

        let view = PortfolioView::new(PnlEngine::new(store, AccountingMethod::Fifo));
        let overview = view.overview(1, None, None).await.unwrap();
        assert_eq!(overview.allocation_tiers.over_10_percent, vec!["HUGE@ethereum"]);
        assert_eq!(overview.allocation_tiers.from_1_to_10_percent, vec!["MID@ethereum"]);
        assert_eq!(overview.allocation_tiers.under_1_percent, vec!["TINY@ethereum"]);
    }

    #[tokio::test]
    async fn marked_value_uses_price_feed() {
        let (writer, store) = test_writer().await;
        writer.write_trade(trade("pepe", TradeKind::Buy, "10", "1000")).await.unwrap();
        let feed = FakePriceFeed::new();
        feed.set_price(&TokenRef::new("0xpepe", ChainId::Ethereum), "150");

        let view = PortfolioView::new(PnlEngine::new(store, AccountingMethod::Fifo));
        let overview = view.overview(1, None, Some(feed.as_ref())).await.unwrap();
        // 10 units marked at 150 = 1500 value on 1000 invested.
        assert_eq!(overview.totals.value_base, "1500".parse().unwrap());
        assert_eq!(overview.totals.unrealized_pnl_base, "500".parse().unwrap());
    }

    #[tokio::test]
    async fn empty_portfolio_is_well_formed() {
        let (_, store) = test_writer().await;
        let view = PortfolioView::new(PnlEngine::new(store, AccountingMethod::Fifo));
        let overview = view.overview(1, None, None).await.unwrap();
        assert!(overview.positions.is_empty());
        assert_eq!(overview.totals.value_base, Money::ZERO);
        assert_eq!(overview.risk.sharpe_ratio, 0.0);
    }
}
