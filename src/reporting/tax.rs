//! Jurisdiction-aware tax reporting.
//!
//! Ledger entries are classified into a fixed category set, disposals are
//! joined against the PnL replay for cost basis and holding period, and the
//! result is exported as standard CSV/XLSX or an HMRC-style disposal
//! schedule. Tax years follow the jurisdiction: UK runs April 6 to April 5,
//! everyone else uses the calendar year.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::TaxJurisdiction;
use crate::error::{CoreError, CoreResult};
use crate::ledger::exporters::atomic_write;
use crate::ledger::{query_entries, EntryMetadata, EntryType, LedgerEntry, LedgerFilter};
use crate::money::{Money, RoundingMode};
use crate::reporting::pnl::{PnlCalculation, PnlEngine};
use crate::store::Store;

/// UK capital-gains allowance for the 2024/25 tax year.
fn uk_cgt_allowance() -> Money {
    Money::from_int(3000)
}

/// Holding-period threshold separating short- from long-term gains (US).
const LONG_TERM_DAYS: i64 = 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxCategory {
    Purchase,
    Sale,
    Trade,
    TransferIn,
    TransferOut,
    Mining,
    Staking,
    Airdrop,
    Fork,
    Fee,
    Gift,
    Lost,
    Income,
}

impl TaxCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaxCategory::Purchase => "purchase",
            TaxCategory::Sale => "sale",
            TaxCategory::Trade => "trade",
            TaxCategory::TransferIn => "transfer_in",
            TaxCategory::TransferOut => "transfer_out",
            TaxCategory::Mining => "mining",
            TaxCategory::Staking => "staking",
            TaxCategory::Airdrop => "airdrop",
            TaxCategory::Fork => "fork",
            TaxCategory::Fee => "fee",
            TaxCategory::Gift => "gift",
            TaxCategory::Lost => "lost",
            TaxCategory::Income => "income",
        }
    }

    pub fn is_disposal(&self) -> bool {
        matches!(
            self,
            TaxCategory::Sale
                | TaxCategory::Trade
                | TaxCategory::TransferOut
                | TaxCategory::Gift
                | TaxCategory::Lost
        )
    }

    pub fn is_income(&self) -> bool {
        matches!(
            self,
            TaxCategory::Mining
                | TaxCategory::Staking
                | TaxCategory::Airdrop
                | TaxCategory::Fork
                | TaxCategory::Income
        )
    }
}

/// Explicit `activity_type` metadata wins; the entry type is the fallback.
pub fn classify(entry: &LedgerEntry) -> TaxCategory {
    if let Some(activity) = entry.metadata.activity_type() {
        match activity.to_ascii_lowercase().as_str() {
            "mining" | "mine" => return TaxCategory::Mining,
            "staking" | "stake" | "reward" => return TaxCategory::Staking,
            "airdrop" | "distribution" => return TaxCategory::Airdrop,
            "fork" | "hardfork" => return TaxCategory::Fork,
            "transfer_in" | "deposit" => return TaxCategory::TransferIn,
            "transfer_out" | "withdrawal" => return TaxCategory::TransferOut,
            "gift" => return TaxCategory::Gift,
            "lost" => return TaxCategory::Lost,
            "fee" => return TaxCategory::Fee,
            _ => {}
        }
    }
    match entry.entry_type {
        EntryType::Buy => TaxCategory::Purchase,
        EntryType::Sell => TaxCategory::Sale,
        EntryType::Fee | EntryType::GasFee | EntryType::Approve => TaxCategory::Fee,
        EntryType::Income => TaxCategory::Income,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaxEvent {
    pub date: DateTime<Utc>,
    pub category: TaxCategory,
    pub asset_symbol: String,
    pub asset_address: String,
    pub chain: String,
    pub quantity: Money,
    pub value_base: Money,
    pub cost_basis_base: Option<Money>,
    pub realized_gain_base: Option<Money>,
    pub fee_base: Option<Money>,
    pub description: String,
    pub tx_hash: Option<String>,
    pub trace_id: String,
    pub holding_period_days: Option<i64>,
    pub oldest_lot_age_days: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct TaxSummary {
    pub total_events: usize,
    pub disposals: usize,
    pub income_events: usize,
    pub total_capital_gains_base: Money,
    pub total_capital_losses_base: Money,
    pub net_capital_gains_base: Money,
    pub total_income_base: Money,
    pub total_fees_base: Money,
    // Jurisdiction-specific figures; unset fields do not apply.
    pub cgt_allowance_base: Option<Money>,
    pub taxable_capital_gains_base: Option<Money>,
    pub short_term_gains_base: Option<Money>,
    pub long_term_gains_base: Option<Money>,
    pub notes: String,
}

#[derive(Debug, Serialize)]
pub struct TaxReport {
    pub user_id: i64,
    pub tax_year: i32,
    pub jurisdiction: TaxJurisdiction,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub summary: TaxSummary,
    pub events: Vec<TaxEvent>,
    pub export_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaxExportFormat {
    Csv,
    Xlsx,
    HmrcCsv,
}

impl std::str::FromStr for TaxExportFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(TaxExportFormat::Csv),
            "xlsx" => Ok(TaxExportFormat::Xlsx),
            "hmrc_csv" | "hmrc" => Ok(TaxExportFormat::HmrcCsv),
            other => Err(CoreError::InputInvalid(format!("unknown tax format: {other}"))),
        }
    }
}

/// Tax-year bounds for a jurisdiction. `tax_year` names the starting year
/// (UK 2024 = 6 Apr 2024 .. 5 Apr 2025).
pub fn tax_year_bounds(
    jurisdiction: TaxJurisdiction,
    tax_year: i32,
) -> (DateTime<Utc>, DateTime<Utc>) {
    match jurisdiction {
        TaxJurisdiction::Gb => (
            Utc.with_ymd_and_hms(tax_year, 4, 6, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(tax_year + 1, 4, 5, 23, 59, 59).unwrap(),
        ),
        _ => (
            Utc.with_ymd_and_hms(tax_year, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(tax_year, 12, 31, 23, 59, 59).unwrap(),
        ),
    }
}

#[derive(Debug, Default, Serialize)]
pub struct CapitalGainsReport {
    pub total_gains_base: Money,
    pub total_losses_base: Money,
    pub net_gains_base: Money,
    pub short_term: Vec<TaxEvent>,
    pub long_term: Vec<TaxEvent>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct IncomeBucket {
    pub total_base: Money,
    pub quantity: Money,
    pub count: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct IncomeReport {
    pub total_income_base: Money,
    pub by_category: std::collections::BTreeMap<String, IncomeBucket>,
    pub by_asset: std::collections::BTreeMap<String, IncomeBucket>,
}

#[derive(Clone)]
pub struct TaxReportGenerator {
    store: Store,
    engine: PnlEngine,
    jurisdiction: TaxJurisdiction,
}

impl TaxReportGenerator {
    pub fn new(store: Store, engine: PnlEngine, jurisdiction: TaxJurisdiction) -> Self {
        TaxReportGenerator {
            store,
            engine,
            jurisdiction,
        }
    }

    /// Build the annual report and write the requested export file(s) into
    /// `export_dir`. UK reports always get the HMRC schedule as well.
    pub async fn generate_annual_report(
        &self,
        user_id: i64,
        tax_year: i32,
        format: TaxExportFormat,
        export_dir: &Path,
    ) -> CoreResult<TaxReport> {
        let (start, end) = tax_year_bounds(self.jurisdiction, tax_year);
        let events = self.extract_events(user_id, start, end).await?;
        let summary = self.summarize(&events)?;

        let mut files = Vec::new();
        match format {
            TaxExportFormat::Csv => {
                files.push(self.write_standard_csv(user_id, tax_year, &events, export_dir).await?)
            }
            TaxExportFormat::Xlsx => {
                files.push(self.write_xlsx(user_id, tax_year, &events, &summary, export_dir).await?)
            }
            TaxExportFormat::HmrcCsv => {}
        }
        if format == TaxExportFormat::HmrcCsv || self.jurisdiction == TaxJurisdiction::Gb {
            files.push(self.write_hmrc_csv(user_id, tax_year, &events, export_dir).await?);
        }

        info!(
            user_id,
            tax_year,
            events = events.len(),
            net_gains = %summary.net_capital_gains_base,
            files = files.len(),
            "tax report generated"
        );

        Ok(TaxReport {
            user_id,
            tax_year,
            jurisdiction: self.jurisdiction,
            period_start: start,
            period_end: end,
            summary,
            events,
            export_files: files,
        })
    }

    /// Classify ledger entries within the window and join disposals onto the
    /// PnL replay for cost basis and holding periods.
    async fn extract_events(
        &self,
        user_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CoreResult<Vec<TaxEvent>> {
        // Replay the entire prefix so lots opened before the tax year still
        // carry their true cost into disposals within it.
        let full_report = self.engine.calculate_user_pnl(user_id, None, Some(end), None).await?;
        let calc_by_entry: HashMap<i64, &PnlCalculation> = full_report
            .calculations
            .iter()
            .map(|c| (c.entry_id, c))
            .collect();

        let filter = LedgerFilter {
            start: Some(start),
            end: Some(end),
            ..Default::default()
        };
        let entries = query_entries(&self.store, Some(user_id), &filter).await?;

        let mut events = Vec::with_capacity(entries.len());
        for entry in &entries {
            let category = classify(entry);
            let calc = calc_by_entry.get(&entry.id);
            let fee_base = match &entry.metadata {
                EntryMetadata::Trade { gas_fee_base, .. } => *gas_fee_base,
                _ if entry.entry_type == EntryType::GasFee => Some(entry.amount_base.abs()),
                _ => None,
            };

            events.push(TaxEvent {
                date: entry.created_at,
                category,
                asset_symbol: entry
                    .metadata
                    .token_symbol()
                    .unwrap_or(&entry.currency)
                    .to_string(),
                asset_address: entry.metadata.token_address().unwrap_or("").to_string(),
                chain: entry.chain.as_str().to_string(),
                quantity: entry.metadata.amount_tokens().unwrap_or(Money::ZERO),
                value_base: entry.amount_base.abs(),
                cost_basis_base: calc.map(|c| c.cost_basis_base),
                realized_gain_base: calc.map(|c| c.realized_pnl_base),
                fee_base,
                description: entry.description.clone(),
                tx_hash: entry.tx_hash.clone(),
                trace_id: entry.trace_id.to_string(),
                holding_period_days: calc.map(|c| c.holding_period_days),
                oldest_lot_age_days: calc.map(|c| c.oldest_lot_age_days),
            });
        }
        Ok(events)
    }

    fn summarize(&self, events: &[TaxEvent]) -> CoreResult<TaxSummary> {
        let mny = |r: Result<Money, crate::money::MoneyError>| {
            r.map_err(|e| CoreError::Internal(format!("tax arithmetic: {e}")))
        };

        let mut summary = TaxSummary::default();
        summary.total_events = events.len();

        let mut short_term = Money::ZERO;
        let mut long_term = Money::ZERO;

        for event in events {
            if event.category.is_disposal() {
                summary.disposals += 1;
                if let Some(gain) = event.realized_gain_base {
                    if gain.is_positive() {
                        summary.total_capital_gains_base =
                            mny(summary.total_capital_gains_base.checked_add(gain))?;
                        // The oldest consumed lot decides the US bucket.
                        if event.oldest_lot_age_days.unwrap_or(0) > LONG_TERM_DAYS {
                            long_term = mny(long_term.checked_add(gain))?;
                        } else {
                            short_term = mny(short_term.checked_add(gain))?;
                        }
                    } else {
                        summary.total_capital_losses_base =
                            mny(summary.total_capital_losses_base.checked_add(gain.abs()))?;
                    }
                }
            }
            if event.category.is_income() {
                summary.income_events += 1;
                summary.total_income_base =
                    mny(summary.total_income_base.checked_add(event.value_base))?;
            }
            if let Some(fee) = event.fee_base {
                summary.total_fees_base = mny(summary.total_fees_base.checked_add(fee))?;
            }
        }
        summary.net_capital_gains_base = mny(summary
            .total_capital_gains_base
            .checked_sub(summary.total_capital_losses_base))?;

        match self.jurisdiction {
            TaxJurisdiction::Gb => {
                let allowance = uk_cgt_allowance();
                let taxable = mny(summary.net_capital_gains_base.checked_sub(allowance))?
                    .max(Money::ZERO);
                summary.cgt_allowance_base = Some(allowance);
                summary.taxable_capital_gains_base = Some(taxable);
                summary.notes =
                    "UK tax year runs April 6 to April 5; annual CGT allowance applied to net gains"
                        .to_string();
            }
            TaxJurisdiction::Us => {
                summary.short_term_gains_base = Some(short_term);
                summary.long_term_gains_base = Some(long_term);
                summary.notes =
                    "US calendar tax year; gains split at 365 days on the oldest consumed lot"
                        .to_string();
            }
            _ => {
                summary.notes = "calendar tax year; no jurisdictional adjustments".to_string();
            }
        }
        Ok(summary)
    }

    /// Disposal-focused view with the short/long-term split listed out.
    pub async fn capital_gains_report(
        &self,
        user_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CoreResult<CapitalGainsReport> {
        let events = self.extract_events(user_id, start, end).await?;
        let mut report = CapitalGainsReport::default();
        let mny = |r: Result<Money, crate::money::MoneyError>| {
            r.map_err(|e| CoreError::Internal(format!("tax arithmetic: {e}")))
        };

        for event in events {
            if !event.category.is_disposal() {
                continue;
            }
            let Some(gain) = event.realized_gain_base else {
                continue;
            };
            if gain.is_positive() {
                report.total_gains_base = mny(report.total_gains_base.checked_add(gain))?;
            } else {
                report.total_losses_base = mny(report.total_losses_base.checked_add(gain.abs()))?;
            }
            if event.oldest_lot_age_days.unwrap_or(0) > LONG_TERM_DAYS {
                report.long_term.push(event);
            } else {
                report.short_term.push(event);
            }
        }
        report.net_gains_base =
            mny(report.total_gains_base.checked_sub(report.total_losses_base))?;
        Ok(report)
    }

    /// Income receipts grouped by category and asset.
    pub async fn income_report(
        &self,
        user_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CoreResult<IncomeReport> {
        let events = self.extract_events(user_id, start, end).await?;
        let mut report = IncomeReport::default();
        let mny = |r: Result<Money, crate::money::MoneyError>| {
            r.map_err(|e| CoreError::Internal(format!("tax arithmetic: {e}")))
        };

        for event in events {
            if !event.category.is_income() {
                continue;
            }
            report.total_income_base = mny(report.total_income_base.checked_add(event.value_base))?;
            let by_category = report
                .by_category
                .entry(event.category.as_str().to_string())
                .or_default();
            by_category.total_base = mny(by_category.total_base.checked_add(event.value_base))?;
            by_category.count += 1;

            let asset_key = format!("{}@{}", event.asset_symbol, event.chain);
            let by_asset = report.by_asset.entry(asset_key).or_default();
            by_asset.total_base = mny(by_asset.total_base.checked_add(event.value_base))?;
            by_asset.quantity = mny(by_asset.quantity.checked_add(event.quantity))?;
            by_asset.count += 1;
        }
        Ok(report)
    }

    async fn write_standard_csv(
        &self,
        user_id: i64,
        tax_year: i32,
        events: &[TaxEvent],
        export_dir: &Path,
    ) -> CoreResult<PathBuf> {
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        writer
            .write_record([
                "date",
                "category",
                "asset",
                "chain",
                "quantity",
                "value_base",
                "cost_basis_base",
                "realized_gain_base",
                "fee_base",
                "description",
                "tx_hash",
                "trace_id",
            ])
            .map_err(|e| CoreError::Internal(format!("csv: {e}")))?;
        for event in events {
            writer
                .write_record([
                    event.date.format("%Y-%m-%d").to_string(),
                    event.category.as_str().to_string(),
                    event.asset_symbol.clone(),
                    event.chain.clone(),
                    event.quantity.to_string(),
                    event.value_base.to_string(),
                    event.cost_basis_base.map(|m| m.to_string()).unwrap_or_default(),
                    event.realized_gain_base.map(|m| m.to_string()).unwrap_or_default(),
                    event.fee_base.map(|m| m.to_string()).unwrap_or_default(),
                    event.description.clone(),
                    event.tx_hash.clone().unwrap_or_default(),
                    event.trace_id.clone(),
                ])
                .map_err(|e| CoreError::Internal(format!("csv: {e}")))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| CoreError::Internal(format!("csv: {e}")))?;

        let path = export_dir.join(format!("tax_report_user_{user_id}_{tax_year}.csv"));
        let target = path.clone();
        tokio::task::spawn_blocking(move || atomic_write(&target, &bytes))
            .await
            .map_err(|e| CoreError::Internal(format!("export task: {e}")))??;
        Ok(path)
    }

    async fn write_xlsx(
        &self,
        user_id: i64,
        tax_year: i32,
        events: &[TaxEvent],
        summary: &TaxSummary,
        export_dir: &Path,
    ) -> CoreResult<PathBuf> {
        use rust_xlsxwriter::{Format, Workbook};

        let mut workbook = Workbook::new();
        let bold = Format::new().set_bold();

        {
            let sheet = workbook
                .add_worksheet()
                .set_name("Tax Events")
                .map_err(|e| CoreError::Internal(format!("xlsx: {e}")))?;
            let headers = [
                "Date", "Category", "Asset", "Chain", "Quantity", "Value", "Cost Basis",
                "Gain/Loss", "Fee", "Description",
            ];
            for (col, header) in headers.iter().enumerate() {
                sheet
                    .write_string_with_format(0, col as u16, *header, &bold)
                    .map_err(|e| CoreError::Internal(format!("xlsx: {e}")))?;
            }
            for (row, event) in events.iter().enumerate() {
                let row = (row + 1) as u32;
                let cells = [
                    event.date.format("%Y-%m-%d").to_string(),
                    event.category.as_str().to_string(),
                    event.asset_symbol.clone(),
                    event.chain.clone(),
                    event.quantity.to_string(),
                    event.value_base.to_string(),
                    event.cost_basis_base.map(|m| m.to_string()).unwrap_or_default(),
                    event.realized_gain_base.map(|m| m.to_string()).unwrap_or_default(),
                    event.fee_base.map(|m| m.to_string()).unwrap_or_default(),
                    event.description.clone(),
                ];
                for (col, value) in cells.iter().enumerate() {
                    sheet
                        .write_string(row, col as u16, value)
                        .map_err(|e| CoreError::Internal(format!("xlsx: {e}")))?;
                }
            }
        }
        {
            let sheet = workbook
                .add_worksheet()
                .set_name("Summary")
                .map_err(|e| CoreError::Internal(format!("xlsx: {e}")))?;
            let rows: Vec<(&str, String)> = vec![
                ("Total events", summary.total_events.to_string()),
                ("Disposals", summary.disposals.to_string()),
                ("Net capital gains", summary.net_capital_gains_base.to_string()),
                ("Total income", summary.total_income_base.to_string()),
                ("Total fees", summary.total_fees_base.to_string()),
                ("Notes", summary.notes.clone()),
            ];
            for (idx, (label, value)) in rows.iter().enumerate() {
                sheet
                    .write_string_with_format(idx as u32, 0, *label, &bold)
                    .map_err(|e| CoreError::Internal(format!("xlsx: {e}")))?;
                sheet
                    .write_string(idx as u32, 1, value)
                    .map_err(|e| CoreError::Internal(format!("xlsx: {e}")))?;
            }
        }

        let bytes = workbook
            .save_to_buffer()
            .map_err(|e| CoreError::Internal(format!("xlsx save: {e}")))?;
        let path = export_dir.join(format!("tax_report_user_{user_id}_{tax_year}.xlsx"));
        let target = path.clone();
        tokio::task::spawn_blocking(move || atomic_write(&target, &bytes))
            .await
            .map_err(|e| CoreError::Internal(format!("export task: {e}")))??;
        Ok(path)
    }

    /// HMRC-style disposal schedule: one row per disposal with a gain/loss.
    async fn write_hmrc_csv(
        &self,
        user_id: i64,
        tax_year: i32,
        events: &[TaxEvent],
        export_dir: &Path,
    ) -> CoreResult<PathBuf> {
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        writer
            .write_record([
                "Asset name",
                "Date of disposal",
                "Disposal proceeds",
                "Allowable costs",
                "Gain or loss",
                "Description",
            ])
            .map_err(|e| CoreError::Internal(format!("csv: {e}")))?;

        for event in events {
            if !event.category.is_disposal() {
                continue;
            }
            let Some(gain) = event.realized_gain_base else {
                continue;
            };
            writer
                .write_record([
                    event.asset_symbol.clone(),
                    event.date.format("%d/%m/%Y").to_string(),
                    format!("£{}", to_2dp(event.value_base)),
                    format!("£{}", to_2dp(event.cost_basis_base.unwrap_or(Money::ZERO))),
                    format!("£{}", to_2dp(gain)),
                    event.description.clone(),
                ])
                .map_err(|e| CoreError::Internal(format!("csv: {e}")))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| CoreError::Internal(format!("csv: {e}")))?;

        let path = export_dir.join(format!("hmrc_capital_gains_user_{user_id}_{tax_year}.csv"));
        let target = path.clone();
        tokio::task::spawn_blocking(move || atomic_write(&target, &bytes))
            .await
            .map_err(|e| CoreError::Internal(format!("export task: {e}")))??;
        Ok(path)
    }
}

/// Fixed two-decimal rendering for regulator-facing columns.
fn to_2dp(amount: Money) -> String {
    let rounded = amount.round_dp(2, RoundingMode::HalfEven);
    let plain = rounded.to_plain_string();
    match plain.split_once('.') {
        Some((units, frac)) => format!("{units}.{}", &frac[..2]),
        None => format!("{plain}.00"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccountingMethod;
    use crate::ids::ChainId;
    use crate::ledger::writer::{IncomeParams, TradeKind, TradeParams};
    use crate::testutil::{raw_entry, test_writer, RawEntry};
    use chrono::Datelike;

    fn trade(kind: TradeKind, qty: &str, base: &str) -> TradeParams {
        TradeParams {
            user_id: 1,
            trace_id: None,
            kind,
            chain: ChainId::Ethereum,
            wallet_address: "0xwallet".to_string(),
            token_symbol: "PEPE".to_string(),
            token_address: "0xpepe".to_string(),
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

    #[test]
    fn category_classification_prefers_activity_type() {
        // Classification is pure; build an entry by hand.
        let entry = LedgerEntry {
            id: 1,
            trace_id: crate::ids::TraceId::new(),
            user_id: 1,
            wallet_address: "0xw".to_string(),
            chain: ChainId::Ethereum,
            dex: None,
            entry_type: EntryType::Income,
            description: "reward".to_string(),
            amount_base: "5".parse().unwrap(),
            amount_native: "5".parse().unwrap(),
            currency: "ETH".to_string(),
            fx_rate_base: "1".parse().unwrap(),
            realized_pnl_base: None,
            realized_pnl_native: None,
            tx_hash: None,
            block_number: None,
            status: crate::ledger::EntryStatus::Confirmed,
            metadata: EntryMetadata::Income {
                token_symbol: "ETH".to_string(),
                token_address: "0xe".to_string(),
                amount_tokens: "1".parse().unwrap(),
                activity_type: "staking".to_string(),
            },
            created_at: Utc::now(),
        };
        assert_eq!(classify(&entry), TaxCategory::Staking);
    }

    #[test]
    fn uk_tax_year_bounds() {
        let (start, end) = tax_year_bounds(TaxJurisdiction::Gb, 2024);
        assert_eq!(start.format("%Y-%m-%d").to_string(), "2024-04-06");
        assert_eq!(end.format("%Y-%m-%d").to_string(), "2025-04-05");

        let (start, end) = tax_year_bounds(TaxJurisdiction::Us, 2024);
        assert_eq!(start.format("%Y-%m-%d").to_string(), "2024-01-01");
        assert_eq!(end.format("%Y-%m-%d").to_string(), "2024-12-31");
    }

    #[tokio::test]
    async fn uk_allowance_applied_to_net_gains() {
        let (_writer, store) = test_writer().await;
        // Seed directly so the dates land inside the 2024/25 UK year.
        raw_entry(&store, {
            let mut e = RawEntry::buy(1, "a1", "100", "1000");
            e.created_at = "2024-05-01T00:00:00.000Z".to_string();
            e
        })
        .await;
        // Three sells realizing 5000 total: 30 units costing 300, sold for
        // proceeds summing 5300.
        for (i, (qty, proceeds, at)) in [
            ("10", "2100", "2024-06-01T00:00:00.000Z"),
            ("10", "1800", "2024-07-01T00:00:00.000Z"),
            ("10", "1400", "2024-08-01T00:00:00.000Z"),
        ]
        .iter()
        .enumerate()
        {
            raw_entry(&store, RawEntry::sell(1, &format!("s{i}"), qty, proceeds, at)).await;
        }

        let dir = tempfile::tempdir().unwrap();
        let engine = PnlEngine::new(store.clone(), AccountingMethod::Fifo);
        let generator = TaxReportGenerator::new(store, engine, TaxJurisdiction::Gb);
        let report = generator
            .generate_annual_report(1, 2024, TaxExportFormat::Csv, dir.path())
            .await
            .unwrap();

        // Cost per unit 10: gains 2000 + 1700 + 1300 = 5000 net.
        assert_eq!(report.summary.net_capital_gains_base, "5000".parse().unwrap());
        assert_eq!(
            report.summary.taxable_capital_gains_base,
            Some("2000".parse().unwrap())
        );
        assert_eq!(report.summary.cgt_allowance_base, Some("3000".parse().unwrap()));

        // HMRC schedule written alongside the standard CSV.
        let hmrc = report
            .export_files
            .iter()
            .find(|p| p.file_name().unwrap().to_string_lossy().starts_with("hmrc_"))
            .unwrap();
        let text = std::fs::read_to_string(hmrc).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "Asset name,Date of disposal,Disposal proceeds,Allowable costs,Gain or loss,Description"
        );
        assert_eq!(lines.len(), 4); // header + 3 disposals
        assert!(lines[1].contains("01/06/2024"));
        assert!(lines[1].contains("£2100.00"));
    }

    #[tokio::test]
    async fn us_report_splits_short_and_long_term() {
        let (_writer, store) = test_writer().await;
        raw_entry(&store, {
            let mut e = RawEntry::buy(1, "a1", "10", "100");
            e.created_at = "2022-01-01T00:00:00.000Z".to_string();
            e
        })
        .await;
        raw_entry(&store, {
            let mut e = RawEntry::buy(1, "a2", "10", "100");
            e.created_at = "2024-06-01T00:00:00.000Z".to_string();
            e
        })
        .await;
        // Long-held lot sold at a gain (FIFO takes the 2022 lot).
        raw_entry(&store, RawEntry::sell(1, "s1", "10", "300", "2024-07-01T00:00:00.000Z")).await;
        // Recently bought lot sold at a gain.
        raw_entry(&store, RawEntry::sell(1, "s2", "10", "150", "2024-08-01T00:00:00.000Z")).await;

        let dir = tempfile::tempdir().unwrap();
        let engine = PnlEngine::new(store.clone(), AccountingMethod::Fifo);
        let generator = TaxReportGenerator::new(store, engine, TaxJurisdiction::Us);
        let report = generator
            .generate_annual_report(1, 2024, TaxExportFormat::Csv, dir.path())
            .await
            .unwrap();

        assert_eq!(report.summary.long_term_gains_base, Some("200".parse().unwrap()));
        assert_eq!(report.summary.short_term_gains_base, Some("50".parse().unwrap()));

        let (start, end) = tax_year_bounds(TaxJurisdiction::Us, 2024);
        let gains = generator.capital_gains_report(1, start, end).await.unwrap();
        assert_eq!(gains.long_term.len(), 1);
        assert_eq!(gains.short_term.len(), 1);
        assert_eq!(gains.net_gains_base, "250".parse().unwrap());
    }

    #[tokio::test]
    async fn income_events_are_totalled() {
        let (writer, store) = test_writer().await;
        writer.write_trade(trade(TradeKind::Buy, "10", "100")).await.unwrap();
        writer
            .write_income(IncomeParams {
                user_id: 1,
                trace_id: None,
                chain: ChainId::Ethereum,
                wallet_address: "0xwallet".to_string(),
                token_symbol: "ETH".to_string(),
                token_address: "0xeth".to_string(),
                amount_tokens: "1".parse().unwrap(),
                amount_native: "1".parse().unwrap(),
                amount_base: "250".parse().unwrap(),
                fx_rate_base: "250".parse().unwrap(),
                activity_type: "staking".to_string(),
                tx_hash: None,
            })
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let year = Utc::now().year();
        let engine = PnlEngine::new(store.clone(), AccountingMethod::Fifo);
        let generator = TaxReportGenerator::new(store, engine, TaxJurisdiction::Other);
        let report = generator
            .generate_annual_report(1, year, TaxExportFormat::Csv, dir.path())
            .await
            .unwrap();
        assert_eq!(report.summary.income_events, 1);
        assert_eq!(report.summary.total_income_base, "250".parse().unwrap());

        let (start, end) = tax_year_bounds(TaxJurisdiction::Other, year);
        let income = generator.income_report(1, start, end).await.unwrap();
        assert_eq!(income.total_income_base, "250".parse().unwrap());
        assert_eq!(income.by_category.get("staking").unwrap().count, 1);
        assert_eq!(
            income.by_asset.get("ETH@ethereum").unwrap().quantity,
            "1".parse().unwrap()
        );
    }

    #[test]
    fn two_dp_formatting() {
        assert_eq!(to_2dp("2100".parse().unwrap()), "2100.00");
        assert_eq!(to_2dp("0.5".parse().unwrap()), "0.50");
        assert_eq!(to_2dp("-3.456".parse().unwrap()), "-3.46");
    }
}
