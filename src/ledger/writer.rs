//! Atomic ledger writer.
//!
//! One logical action (a trade and its gas-fee row, an approval, an income
//! receipt) is one store transaction under one trace ID. The writer rejects
//! the whole call if any invariant would be violated, if the token is
//! blacklisted, or while an emergency stop is active.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use std::sync::Arc;
use tracing::info;

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::ids::{ChainId, TokenRef, TraceId};
use crate::ledger::{
    insert_entry_tx, query_entries, upsert_transaction_tx, EntryMetadata, EntryStatus, EntryType,
    LedgerEntry, LedgerFilter, NewLedgerEntry, CLOCK_SKEW_TOLERANCE_SECS,
};
use crate::money::Money;
use crate::store::Store;
use crate::system::state::SystemStateController;
use crate::tokens::TokenRegistry;

/// Tolerance for the I2 reconciliation check: one minor unit of base currency.
fn one_minor_unit() -> Money {
    "0.01".parse().expect("constant")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeKind {
    Buy,
    Sell,
}

impl TradeKind {
    fn entry_type(self) -> EntryType {
        match self {
            TradeKind::Buy => EntryType::Buy,
            TradeKind::Sell => EntryType::Sell,
        }
    }

    fn verb(self) -> &'static str {
        match self {
            TradeKind::Buy => "BUY",
            TradeKind::Sell => "SELL",
        }
    }
}

/// Inputs for one trade write. All amounts are positive magnitudes; the
/// writer applies the sign convention (buys positive, sells negative,
/// gas fees always negative).
#[derive(Debug, Clone)]
pub struct TradeParams {
    pub user_id: i64,
    pub trace_id: Option<TraceId>,
    pub kind: TradeKind,
    pub chain: ChainId,
    pub wallet_address: String,
    pub token_symbol: String,
    pub token_address: String,
    pub amount_tokens: Money,
    pub amount_native: Money,
    pub amount_base: Money,
    pub fx_rate_base: Money,
    pub gas_fee_native: Option<Money>,
    pub gas_fee_base: Option<Money>,
    pub dex: Option<String>,
    pub pair_address: Option<String>,
    pub slippage_percent: Option<f64>,
    pub notes: Option<String>,
    pub tx_hash: Option<String>,
    pub block_number: Option<i64>,
    /// For sells computed by the PnL layer; verified against proceeds.
    pub realized_pnl_base: Option<Money>,
    pub realized_pnl_native: Option<Money>,
    pub cost_basis_base: Option<Money>,
    /// Set when the trade was placed by a conditional order.
    pub order_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ApprovalParams {
    pub user_id: i64,
    pub trace_id: Option<TraceId>,
    pub chain: ChainId,
    pub wallet_address: String,
    pub token_symbol: String,
    pub token_address: String,
    pub spender: String,
    pub gas_fee_native: Money,
    pub gas_fee_base: Money,
    pub fx_rate_base: Money,
    pub tx_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IncomeParams {
    pub user_id: i64,
    pub trace_id: Option<TraceId>,
    pub chain: ChainId,
    pub wallet_address: String,
    pub token_symbol: String,
    pub token_address: String,
    pub amount_tokens: Money,
    pub amount_native: Money,
    pub amount_base: Money,
    pub fx_rate_base: Money,
    /// staking, mining, airdrop, fork, income, ...
    pub activity_type: String,
    pub tx_hash: Option<String>,
}

#[derive(Clone)]
pub struct LedgerWriter {
    store: Store,
    system: SystemStateController,
    tokens: TokenRegistry,
    config: Arc<CoreConfig>,
}

impl LedgerWriter {
    pub fn new(
        store: Store,
        system: SystemStateController,
        tokens: TokenRegistry,
        config: Arc<CoreConfig>,
    ) -> Self {
        LedgerWriter {
            store,
            system,
            tokens,
            config,
        }
    }

    /// Write a trade (and its gas-fee sibling, if any) atomically.
    pub async fn write_trade(&self, params: TradeParams) -> CoreResult<LedgerEntry> {
        self.ensure_writable().await?;
        validate_positive("amount_tokens", params.amount_tokens)?;
        validate_positive("amount_native", params.amount_native)?;
        validate_positive("amount_base", params.amount_base)?;
        validate_positive("fx_rate_base", params.fx_rate_base)?;
        if params.wallet_address.trim().is_empty() {
            return Err(CoreError::InputInvalid("wallet address is empty".to_string()));
        }
        if let Some(gas) = params.gas_fee_base {
            validate_positive("gas_fee_base", gas)?;
        }
        if let Some(gas) = params.gas_fee_native {
            validate_positive("gas_fee_native", gas)?;
        }

        let token = TokenRef::new(params.token_address.clone(), params.chain);
        if self.tokens.is_blacklisted(&token).await? {
            return Err(CoreError::IntegrityViolation(format!(
                "token {token} is blacklisted"
            )));
        }

        // Sell quantity may never exceed what the wallet has bought.
        if params.kind == TradeKind::Sell {
            let held = self
                .store
                .with_conn({
                    let wallet = params.wallet_address.clone();
                    let address = params.token_address.clone();
                    let chain = params.chain;
                    move |conn| token_balance(conn, &wallet, chain, &address)
                })
                .await?;
            if held < params.amount_tokens {
                return Err(CoreError::IntegrityViolation(format!(
                    "sell of {} exceeds held quantity {} for {}",
                    params.amount_tokens, held, token
                )));
            }
        }

        // I2: when the caller supplies both sides, they must reconcile.
        if let (Some(cost), Some(pnl)) = (params.cost_basis_base, params.realized_pnl_base) {
            let reconstructed = cost
                .checked_add(pnl)
                .map_err(|e| CoreError::Internal(e.to_string()))?;
            let drift = reconstructed
                .checked_sub(params.amount_base)
                .map_err(|e| CoreError::Internal(e.to_string()))?
                .abs();
            if drift > one_minor_unit() {
                return Err(CoreError::IntegrityViolation(format!(
                    "cost basis {} + realized pnl {} does not reconcile with proceeds {}",
                    cost, pnl, params.amount_base
                )));
            }
        }

        let trace_id = params.trace_id.unwrap_or_default();
        let now = Utc::now();
        check_timestamp(now)?;
        self.check_trace_siblings(trace_id, &params.wallet_address, params.chain)
            .await?;

        let description = trade_description(&params);
        let currency = params.chain.native_currency().to_string();
        let sign = |amount: Money| match params.kind {
            TradeKind::Buy => amount,
            TradeKind::Sell => amount.neg(),
        };

        let trade_row = NewLedgerEntry {
            trace_id,
            user_id: params.user_id,
            wallet_address: params.wallet_address.clone(),
            chain: params.chain,
            dex: params.dex.clone(),
            entry_type: params.kind.entry_type(),
            description: description.clone(),
            amount_base: sign(params.amount_base),
            amount_native: sign(params.amount_native),
            currency: currency.clone(),
            fx_rate_base: params.fx_rate_base,
            realized_pnl_base: params.realized_pnl_base,
            realized_pnl_native: params.realized_pnl_native,
            tx_hash: params.tx_hash.clone(),
            block_number: params.block_number,
            status: EntryStatus::Confirmed,
            metadata: EntryMetadata::Trade {
                token_symbol: params.token_symbol.clone(),
                token_address: params.token_address.clone(),
                amount_tokens: params.amount_tokens,
                dex: params.dex.clone(),
                pair_address: params.pair_address.clone(),
                slippage_percent: params.slippage_percent,
                gas_fee_base: params.gas_fee_base,
                gas_fee_native: params.gas_fee_native,
                order_id: params.order_id.clone(),
                notes: params.notes.clone(),
            },
            created_at: now,
        };

        let gas_row = match (params.gas_fee_native, params.gas_fee_base) {
            (Some(gas_native), Some(gas_base)) => Some(NewLedgerEntry {
                trace_id,
                user_id: params.user_id,
                wallet_address: params.wallet_address.clone(),
                chain: params.chain,
                dex: params.dex.clone(),
                entry_type: EntryType::GasFee,
                description: format!(
                    "Gas fee for {} {}",
                    params.kind.verb().to_lowercase(),
                    params.token_symbol
                ),
                amount_base: gas_base.neg(),
                amount_native: gas_native.neg(),
                currency,
                fx_rate_base: params.fx_rate_base,
                realized_pnl_base: None,
                realized_pnl_native: None,
                tx_hash: params.tx_hash.clone(),
                block_number: params.block_number,
                status: EntryStatus::Confirmed,
                metadata: EntryMetadata::GasFee {
                    token_symbol: params.token_symbol.clone(),
                    token_address: params.token_address.clone(),
                },
                created_at: now,
            }),
            _ => None,
        };

        let tx_ref = params.tx_hash.clone();
        let chain = params.chain;
        let entry = self
            .store
            .with_tx(move |tx| {
                let id = insert_entry_tx(tx, &trade_row).map_err(wrap_write_err)?;
                if let Some(gas) = &gas_row {
                    insert_entry_tx(tx, gas).map_err(wrap_write_err)?;
                }
                if let Some(hash) = &tx_ref {
                    upsert_transaction_tx(
                        tx,
                        hash,
                        chain,
                        trace_id,
                        EntryStatus::Confirmed,
                        trade_row.block_number,
                        now,
                    )
                    .map_err(wrap_write_err)?;
                }
                Ok(materialize(id, trade_row))
            })
            .await?;

        info!(
            trace_id = %trace_id,
            user_id = params.user_id,
            kind = params.kind.verb(),
            token = %params.token_symbol,
            amount_base = %entry.amount_base,
            chain = %params.chain,
            "ledger entry created"
        );
        Ok(entry)
    }

    /// Write an approval gas-cost entry.
    pub async fn write_approval(&self, params: ApprovalParams) -> CoreResult<LedgerEntry> {
        self.ensure_writable().await?;
        validate_positive("fx_rate_base", params.fx_rate_base)?;
        // Zero-value approvals (revocations) are the one allowed zero amount.
        if params.gas_fee_base.is_negative() || params.gas_fee_native.is_negative() {
            return Err(CoreError::InputInvalid(
                "gas fees must be non-negative magnitudes".to_string(),
            ));
        }

        let trace_id = params.trace_id.unwrap_or_default();
        let now = Utc::now();
        self.check_trace_siblings(trace_id, &params.wallet_address, params.chain)
            .await?;

        let spender_short: String = params.spender.chars().take(10).collect();
        let row = NewLedgerEntry {
            trace_id,
            user_id: params.user_id,
            wallet_address: params.wallet_address.clone(),
            chain: params.chain,
            dex: None,
            entry_type: EntryType::Approve,
            description: format!("APPROVE {} for {}...", params.token_symbol, spender_short),
            amount_base: params.gas_fee_base.neg(),
            amount_native: params.gas_fee_native.neg(),
            currency: params.chain.native_currency().to_string(),
            fx_rate_base: params.fx_rate_base,
            realized_pnl_base: None,
            realized_pnl_native: None,
            tx_hash: params.tx_hash.clone(),
            block_number: None,
            status: EntryStatus::Confirmed,
            metadata: EntryMetadata::Approval {
                token_symbol: params.token_symbol.clone(),
                token_address: params.token_address.clone(),
                spender: params.spender.clone(),
            },
            created_at: now,
        };

        let tx_ref = params.tx_hash.clone();
        let chain = params.chain;
        let entry = self
            .store
            .with_tx(move |tx| {
                let id = insert_entry_tx(tx, &row).map_err(wrap_write_err)?;
                if let Some(hash) = &tx_ref {
                    upsert_transaction_tx(tx, hash, chain, trace_id, EntryStatus::Confirmed, None, now)
                        .map_err(wrap_write_err)?;
                }
                Ok(materialize(id, row))
            })
            .await?;

        info!(trace_id = %trace_id, token = %params.token_symbol, "approval ledger entry created");
        Ok(entry)
    }

    /// Write an income receipt (staking reward, airdrop, ...).
    pub async fn write_income(&self, params: IncomeParams) -> CoreResult<LedgerEntry> {
        self.ensure_writable().await?;
        validate_positive("amount_tokens", params.amount_tokens)?;
        validate_positive("amount_base", params.amount_base)?;
        validate_positive("fx_rate_base", params.fx_rate_base)?;

        let token = TokenRef::new(params.token_address.clone(), params.chain);
        if self.tokens.is_blacklisted(&token).await? {
            return Err(CoreError::IntegrityViolation(format!(
                "token {token} is blacklisted"
            )));
        }

        let trace_id = params.trace_id.unwrap_or_default();
        let now = Utc::now();
        let row = NewLedgerEntry {
            trace_id,
            user_id: params.user_id,
            wallet_address: params.wallet_address.clone(),
            chain: params.chain,
            dex: None,
            entry_type: EntryType::Income,
            description: format!(
                "{} income: {} {}",
                params.activity_type.to_uppercase(),
                params.amount_tokens,
                params.token_symbol
            ),
            amount_base: params.amount_base,
            amount_native: params.amount_native,
            currency: params.chain.native_currency().to_string(),
            fx_rate_base: params.fx_rate_base,
            realized_pnl_base: None,
            realized_pnl_native: None,
            tx_hash: params.tx_hash.clone(),
            block_number: None,
            status: EntryStatus::Confirmed,
            metadata: EntryMetadata::Income {
                token_symbol: params.token_symbol.clone(),
                token_address: params.token_address.clone(),
                amount_tokens: params.amount_tokens,
                activity_type: params.activity_type.clone(),
            },
            created_at: now,
        };

        let entry = self
            .store
            .with_tx(move |tx| {
                let id = insert_entry_tx(tx, &row).map_err(wrap_write_err)?;
                Ok(materialize(id, row))
            })
            .await?;
        Ok(entry)
    }

    /// Ordered listing of a user's entries.
    pub async fn list_entries(
        &self,
        user_id: i64,
        filter: &LedgerFilter,
    ) -> CoreResult<Vec<LedgerEntry>> {
        query_entries(&self.store, Some(user_id), filter).await
    }

    pub fn base_currency(&self) -> &str {
        &self.config.base_currency
    }

    async fn ensure_writable(&self) -> CoreResult<()> {
        if self.system.any_emergency_stopped().await? {
            return Err(CoreError::EmergencyActive(
                "ledger writes are suspended".to_string(),
            ));
        }
        Ok(())
    }

    /// I1: rows sharing a trace ID must belong to one logical action, which
    /// means one wallet and one chain.
    async fn check_trace_siblings(
        &self,
        trace_id: TraceId,
        wallet: &str,
        chain: ChainId,
    ) -> CoreResult<()> {
        let trace = trace_id.to_string();
        let wallet = wallet.to_string();
        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT wallet_address, chain FROM ledger_entries WHERE trace_id = ?1 LIMIT 1",
                )?;
                let existing: Option<(String, String)> = stmt
                    .query_row([&trace], |row| Ok((row.get(0)?, row.get(1)?)))
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                if let Some((w, c)) = existing {
                    if w != wallet || c != chain.as_str() {
                        return Err(CoreError::Conflict(format!(
                            "trace id {trace} already used by a different action"
                        )));
                    }
                }
                Ok(())
            })
            .await
    }
}

/// Net token quantity held by a wallet: buys plus income, minus sells.
pub(crate) fn token_balance(
    conn: &Connection,
    wallet: &str,
    chain: ChainId,
    token_address: &str,
) -> CoreResult<Money> {
    let mut stmt = conn.prepare_cached(
        "SELECT entry_type, metadata FROM ledger_entries \
         WHERE wallet_address = ?1 AND chain = ?2 AND entry_type IN ('buy', 'sell', 'income') \
         ORDER BY created_at ASC, id ASC",
    )?;
    let rows = stmt.query_map(rusqlite::params![wallet, chain.as_str()], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut balance = Money::ZERO;
    for row in rows {
        let (entry_type, metadata) = row?;
        let meta: EntryMetadata = serde_json::from_str(&metadata)?;
        if meta.token_address() != Some(token_address) {
            continue;
        }
        let Some(qty) = meta.amount_tokens() else {
            continue;
        };
        balance = match entry_type.as_str() {
            "sell" => balance.checked_sub(qty),
            _ => balance.checked_add(qty),
        }
        .map_err(|e| CoreError::Internal(e.to_string()))?;
    }
    Ok(balance)
}

fn validate_positive(name: &str, amount: Money) -> CoreResult<()> {
    if !amount.is_positive() {
        return Err(CoreError::InputInvalid(format!(
            "{name} must be positive, got {amount}"
        )));
    }
    Ok(())
}

fn check_timestamp(ts: DateTime<Utc>) -> CoreResult<()> {
    if ts > Utc::now() + Duration::seconds(CLOCK_SKEW_TOLERANCE_SECS) {
        return Err(CoreError::IntegrityViolation(format!(
            "timestamp {ts} is in the future"
        )));
    }
    Ok(())
}

fn wrap_write_err(err: CoreError) -> CoreError {
    match err {
        CoreError::Conflict(msg) => CoreError::Conflict(format!("ledger write failed: {msg}")),
        CoreError::StoreUnavailable(msg) => {
            CoreError::StoreUnavailable(format!("ledger write failed: {msg}"))
        }
        other => other,
    }
}

fn materialize(id: i64, row: NewLedgerEntry) -> LedgerEntry {
    LedgerEntry {
        id,
        trace_id: row.trace_id,
        user_id: row.user_id,
        wallet_address: row.wallet_address,
        chain: row.chain,
        dex: row.dex,
        entry_type: row.entry_type,
        description: row.description,
        amount_base: row.amount_base,
        amount_native: row.amount_native,
        currency: row.currency,
        fx_rate_base: row.fx_rate_base,
        realized_pnl_base: row.realized_pnl_base,
        realized_pnl_native: row.realized_pnl_native,
        tx_hash: row.tx_hash,
        block_number: row.block_number,
        status: row.status,
        metadata: row.metadata,
        created_at: row.created_at,
    }
}

fn trade_description(params: &TradeParams) -> String {
    let mut parts = vec![format!("{} {}", params.kind.verb(), params.token_symbol)];
    if let Some(dex) = &params.dex {
        parts.push(format!("on {dex}"));
    }
    if let Some(slippage) = params.slippage_percent {
        parts.push(format!("(slippage: {slippage:.2}%)"));
    }
    if let Some(notes) = &params.notes {
        parts.push(format!("- {notes}"));
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_writer;

    fn buy(user: i64, qty: &str, total_base: &str) -> TradeParams {
        TradeParams {
            user_id: user,
            trace_id: None,
            kind: TradeKind::Buy,
            chain: ChainId::Ethereum,
            wallet_address: "0xwallet".to_string(),
            token_symbol: "PEPE".to_string(),
            token_address: "0xpepe".to_string(),
            amount_tokens: qty.parse().unwrap(),
            amount_native: "1".parse().unwrap(),
            amount_base: total_base.parse().unwrap(),
            fx_rate_base: "2000".parse().unwrap(),
            gas_fee_native: None,
            gas_fee_base: None,
            dex: Some("uniswap".to_string()),
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
    async fn buy_is_recorded_positive() {
        let (writer, _store) = test_writer().await;
        let entry = writer.write_trade(buy(1, "100", "50")).await.unwrap();
        assert_eq!(entry.entry_type, EntryType::Buy);
        assert_eq!(entry.amount_base, "50".parse().unwrap());
        assert!(entry.description.starts_with("BUY PEPE on uniswap"));
    }

    #[tokio::test]
    async fn sell_is_signed_negative_and_capped_by_holdings() {
        let (writer, _store) = test_writer().await;
        writer.write_trade(buy(1, "100", "50")).await.unwrap();

        let mut sell = buy(1, "40", "30");
        sell.kind = TradeKind::Sell;
        let entry = writer.write_trade(sell).await.unwrap();
        assert_eq!(entry.amount_base, "-30".parse().unwrap());

        let mut oversell = buy(1, "100", "70");
        oversell.kind = TradeKind::Sell;
        let err = writer.write_trade(oversell).await.unwrap_err();
        assert!(matches!(err, CoreError::IntegrityViolation(_)));
    }

    #[tokio::test]
    async fn gas_fee_row_shares_trace_id() {
        let (writer, store) = test_writer().await;
        let mut params = buy(1, "10", "20");
        params.gas_fee_base = Some("0.5".parse().unwrap());
        params.gas_fee_native = Some("0.001".parse().unwrap());
        let entry = writer.write_trade(params).await.unwrap();

        let rows = query_entries(&store, Some(1), &LedgerFilter::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.trace_id == entry.trace_id));
        let gas = rows
            .iter()
            .find(|r| r.entry_type == EntryType::GasFee)
            .unwrap();
        assert_eq!(gas.amount_base, "-0.5".parse().unwrap());
    }

    #[tokio::test]
    async fn rejects_invalid_amounts() {
        let (writer, _store) = test_writer().await;
        let mut params = buy(1, "10", "20");
        params.fx_rate_base = Money::ZERO;
        assert!(matches!(
            writer.write_trade(params).await.unwrap_err(),
            CoreError::InputInvalid(_)
        ));
    }

    #[tokio::test]
    async fn rejects_mismatched_pnl_reconciliation() {
        let (writer, _store) = test_writer().await;
        writer.write_trade(buy(1, "100", "50")).await.unwrap();

        let mut sell = buy(1, "50", "100");
        sell.kind = TradeKind::Sell;
        sell.cost_basis_base = Some("25".parse().unwrap());
        sell.realized_pnl_base = Some("10".parse().unwrap()); // 25 + 10 != 100
        let err = writer.write_trade(sell).await.unwrap_err();
        assert!(matches!(err, CoreError::IntegrityViolation(_)));
    }

    #[tokio::test]
    async fn trace_reuse_across_wallets_is_conflict() {
        let (writer, _store) = test_writer().await;
        let trace = TraceId::new();
        let mut first = buy(1, "10", "20");
        first.trace_id = Some(trace);
        writer.write_trade(first).await.unwrap();

        let mut second = buy(1, "10", "20");
        second.trace_id = Some(trace);
        second.wallet_address = "0xother".to_string();
        let err = writer.write_trade(second).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn approval_row_is_negative_and_zero_gas_allowed() {
        let (writer, _store) = test_writer().await;
        let entry = writer
            .write_approval(ApprovalParams {
                user_id: 1,
                trace_id: None,
                chain: ChainId::Bsc,
                wallet_address: "0xwallet".to_string(),
                token_symbol: "CAKE".to_string(),
                token_address: "0xcake".to_string(),
                spender: "0xrouterrouterrouter".to_string(),
                gas_fee_native: "0.002".parse().unwrap(),
                gas_fee_base: "0.40".parse().unwrap(),
                fx_rate_base: "200".parse().unwrap(),
                tx_hash: None,
            })
            .await
            .unwrap();
        assert_eq!(entry.entry_type, EntryType::Approve);
        assert_eq!(entry.amount_base, "-0.4".parse().unwrap());
        assert!(entry.description.starts_with("APPROVE CAKE for 0xrouterro"));

        // Revocations cost nothing but are still journaled.
        let revoke = writer
            .write_approval(ApprovalParams {
                user_id: 1,
                trace_id: None,
                chain: ChainId::Bsc,
                wallet_address: "0xwallet".to_string(),
                token_symbol: "CAKE".to_string(),
                token_address: "0xcake".to_string(),
                spender: "0xrouter2".to_string(),
                gas_fee_native: Money::ZERO,
                gas_fee_base: Money::ZERO,
                fx_rate_base: "200".parse().unwrap(),
                tx_hash: None,
            })
            .await
            .unwrap();
        assert!(revoke.amount_base.is_zero());
    }
}
