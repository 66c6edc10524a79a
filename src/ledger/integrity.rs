//! Ledger integrity verification and repair.
//!
//! Detection is read-only. Repair mode is the only path that mutates the
//! ledger after the fact: it is restricted to a fixed subset of issue types,
//! never deletes entries, never touches trace IDs, and records every change
//! as a system event with the old and new values.

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{info, warn};

use crate::error::CoreResult;
use crate::ledger::{query_entries, EntryType, LedgerEntry, LedgerFilter, CLOCK_SKEW_TOLERANCE_SECS};
use crate::money::{Money, RoundingMode};
use crate::store::{ts_to_sql, Store};
use crate::system::state::{EventSeverity, SystemStateController};

/// Rolling window width for the FX median.
const FX_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    DuplicateTraceId,
    MissingTransactionRef,
    PnlCalculationError,
    FxRateAnomaly,
    NegativeBalance,
    OrphanedEntry,
    FutureTimestamp,
    InvalidAmounts,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::DuplicateTraceId => "duplicate_trace_id",
            IssueType::MissingTransactionRef => "missing_transaction_ref",
            IssueType::PnlCalculationError => "pnl_calculation_error",
            IssueType::FxRateAnomaly => "fx_rate_anomaly",
            IssueType::NegativeBalance => "negative_balance",
            IssueType::OrphanedEntry => "orphaned_entry",
            IssueType::FutureTimestamp => "future_timestamp",
            IssueType::InvalidAmounts => "invalid_amounts",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            IssueType::DuplicateTraceId | IssueType::OrphanedEntry | IssueType::InvalidAmounts => {
                Severity::Critical
            }
            _ => Severity::Warning,
        }
    }

    /// The closed subset eligible for automatic repair.
    pub fn is_repairable(&self) -> bool {
        matches!(
            self,
            IssueType::MissingTransactionRef
                | IssueType::FutureTimestamp
                | IssueType::PnlCalculationError
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityIssue {
    pub issue_type: IssueType,
    pub severity: Severity,
    pub description: String,
    pub affected_entries: Vec<i64>,
    pub suggested_fix: Option<String>,
    pub detected_at: DateTime<Utc>,
}

impl IntegrityIssue {
    fn new(
        issue_type: IssueType,
        description: String,
        affected_entries: Vec<i64>,
        suggested_fix: Option<&str>,
    ) -> Self {
        IntegrityIssue {
            issue_type,
            severity: issue_type.severity(),
            description,
            affected_entries,
            suggested_fix: suggested_fix.map(str::to_string),
            detected_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairRecord {
    pub entry_id: i64,
    pub issue_type: IssueType,
    pub action: String,
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct IntegrityReport {
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub user_id: Option<i64>,
    pub total_issues: usize,
    pub issues_by_severity: BTreeMap<String, usize>,
    pub issues_by_type: BTreeMap<String, usize>,
    pub issues: Vec<IntegrityIssue>,
    pub repairs: Vec<RepairRecord>,
}

impl IntegrityReport {
    pub fn has_critical(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Critical)
    }
}

#[derive(Clone)]
pub struct IntegrityChecker {
    store: Store,
    system: SystemStateController,
}

impl IntegrityChecker {
    pub fn new(store: Store, system: SystemStateController) -> Self {
        IntegrityChecker { store, system }
    }

    /// Full scan; with `fix` set, applies automatic repairs to the
    /// repairable subset afterwards.
    pub async fn run_check(&self, user_id: Option<i64>, fix: bool) -> CoreResult<IntegrityReport> {
        let started = Utc::now();
        let entries = query_entries(&self.store, user_id, &LedgerFilter::default()).await?;

        let mut issues = Vec::new();
        issues.extend(check_duplicate_trace_ids(&entries));
        issues.extend(self.check_missing_transaction_refs(&entries).await?);
        issues.extend(check_pnl_calculations(&entries));
        issues.extend(check_fx_rate_anomalies(&entries));
        issues.extend(check_balance_continuity(&entries));
        issues.extend(self.check_orphaned_entries(&entries).await?);
        issues.extend(check_timestamp_anomalies(&entries));
        issues.extend(check_amount_validations(&entries));

        let mut repairs = Vec::new();
        if fix {
            for issue in issues.iter().filter(|i| i.issue_type.is_repairable()) {
                for &entry_id in &issue.affected_entries {
                    let record = self.repair_entry(entry_id, issue.issue_type).await;
                    repairs.push(record);
                }
            }
        }

        let mut by_severity: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
        for issue in &issues {
            *by_severity
                .entry(format!("{:?}", issue.severity).to_lowercase())
                .or_default() += 1;
            *by_type.entry(issue.issue_type.as_str().to_string()).or_default() += 1;
        }

        let report = IntegrityReport {
            completed_at: Utc::now(),
            duration_ms: (Utc::now() - started).num_milliseconds(),
            user_id,
            total_issues: issues.len(),
            issues_by_severity: by_severity,
            issues_by_type: by_type,
            issues,
            repairs,
        };

        info!(
            total_issues = report.total_issues,
            critical = report.has_critical(),
            repairs = report.repairs.len(),
            "integrity check completed"
        );
        Ok(report)
    }

    /// Deep check of one entry.
    pub async fn verify_entry(&self, entry_id: i64) -> CoreResult<Vec<String>> {
        let entry = crate::ledger::get_entry(&self.store, entry_id).await?;
        let mut problems = Vec::new();

        if entry.fx_rate_base <= Money::ZERO {
            problems.push(format!("invalid fx rate: {}", entry.fx_rate_base));
        }
        if entry.amount_base.is_zero() && entry.entry_type != EntryType::Approve {
            problems.push("zero amount on non-approval entry".to_string());
        }
        if entry.created_at > Utc::now() + Duration::seconds(CLOCK_SKEW_TOLERANCE_SECS) {
            problems.push(format!("future timestamp: {}", entry.created_at));
        }
        if let (Some(pnl_base), Some(pnl_native)) =
            (entry.realized_pnl_base, entry.realized_pnl_native)
        {
            if pnl_conversion_drift(pnl_base, pnl_native, entry.fx_rate_base) {
                problems.push("realized pnl does not reconcile with fx rate".to_string());
            }
        }
        Ok(problems)
    }

    async fn check_missing_transaction_refs(
        &self,
        entries: &[LedgerEntry],
    ) -> CoreResult<Vec<IntegrityIssue>> {
        let hashes: Vec<(i64, String)> = entries
            .iter()
            .filter_map(|e| e.tx_hash.clone().map(|h| (e.id, h)))
            .collect();
        if hashes.is_empty() {
            return Ok(Vec::new());
        }

        self.store
            .with_conn(move |conn| {
                let mut stmt =
                    conn.prepare_cached("SELECT 1 FROM transactions WHERE tx_hash = ?1")?;
                let mut issues = Vec::new();
                for (entry_id, hash) in &hashes {
                    let exists = stmt.exists(params![hash])?;
                    if !exists {
                        issues.push(IntegrityIssue::new(
                            IssueType::MissingTransactionRef,
                            format!("entry {entry_id} references unknown transaction {hash}"),
                            vec![*entry_id],
                            Some("clear the dangling transaction reference"),
                        ));
                    }
                }
                Ok(issues)
            })
            .await
    }

    async fn check_orphaned_entries(
        &self,
        entries: &[LedgerEntry],
    ) -> CoreResult<Vec<IntegrityIssue>> {
        let user_ids: Vec<i64> = {
            let mut ids: Vec<i64> = entries.iter().map(|e| e.user_id).collect();
            ids.sort_unstable();
            ids.dedup();
            ids
        };
        let entry_index: HashMap<i64, Vec<i64>> = entries.iter().fold(HashMap::new(), |mut acc, e| {
            acc.entry(e.user_id).or_default().push(e.id);
            acc
        });

        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare_cached("SELECT 1 FROM users WHERE user_id = ?1")?;
                let mut issues = Vec::new();
                for user_id in user_ids {
                    if !stmt.exists(params![user_id])? {
                        let affected = entry_index.get(&user_id).cloned().unwrap_or_default();
                        issues.push(IntegrityIssue::new(
                            IssueType::OrphanedEntry,
                            format!("entries reference non-existent user {user_id}"),
                            affected,
                            Some("assign to a valid user"),
                        ));
                    }
                }
                Ok(issues)
            })
            .await
    }

    async fn repair_entry(&self, entry_id: i64, issue_type: IssueType) -> RepairRecord {
        let result = self.apply_repair(entry_id, issue_type).await;
        match result {
            Ok(action) => RepairRecord {
                entry_id,
                issue_type,
                action,
                success: true,
            },
            Err(err) => {
                warn!(entry_id, issue = issue_type.as_str(), error = %err, "repair failed");
                RepairRecord {
                    entry_id,
                    issue_type,
                    action: err.to_string(),
                    success: false,
                }
            }
        }
    }

    async fn apply_repair(&self, entry_id: i64, issue_type: IssueType) -> CoreResult<String> {
        let entry = crate::ledger::get_entry(&self.store, entry_id).await?;
        let (action, old_value, new_value) = match issue_type {
            IssueType::MissingTransactionRef => {
                let old = entry.tx_hash.clone().unwrap_or_default();
                self.store
                    .with_tx(|tx| {
                        tx.execute(
                            "UPDATE ledger_entries SET tx_hash = NULL WHERE id = ?1",
                            params![entry_id],
                        )?;
                        Ok(())
                    })
                    .await?;
                (
                    "cleared dangling transaction reference".to_string(),
                    json!({ "tx_hash": old }),
                    json!({ "tx_hash": null }),
                )
            }
            IssueType::FutureTimestamp => {
                let now = Utc::now();
                let old = entry.created_at;
                self.store
                    .with_tx(move |tx| {
                        tx.execute(
                            "UPDATE ledger_entries SET created_at = ?1 WHERE id = ?2",
                            params![ts_to_sql(now), entry_id],
                        )?;
                        Ok(())
                    })
                    .await?;
                (
                    "corrected future timestamp".to_string(),
                    json!({ "created_at": ts_to_sql(old) }),
                    json!({ "created_at": ts_to_sql(now) }),
                )
            }
            IssueType::PnlCalculationError => {
                let (Some(pnl_native), old_base) =
                    (entry.realized_pnl_native, entry.realized_pnl_base)
                else {
                    return Err(crate::error::CoreError::InputInvalid(
                        "entry has no native pnl to recompute from".to_string(),
                    ));
                };
                let corrected = pnl_native
                    .checked_mul(entry.fx_rate_base)
                    .map_err(|e| crate::error::CoreError::Internal(e.to_string()))?;
                self.store
                    .with_tx(move |tx| {
                        tx.execute(
                            "UPDATE ledger_entries SET realized_pnl_base = ?1 WHERE id = ?2",
                            params![corrected.to_string(), entry_id],
                        )?;
                        Ok(())
                    })
                    .await?;
                (
                    "recomputed realized pnl from native amount".to_string(),
                    json!({ "realized_pnl_base": old_base.map(|m| m.to_string()) }),
                    json!({ "realized_pnl_base": corrected.to_string() }),
                )
            }
            other => {
                return Err(crate::error::CoreError::InputInvalid(format!(
                    "no automatic repair for {}",
                    other.as_str()
                )))
            }
        };

        self.system
            .record_event(
                "ledger_repair",
                EventSeverity::Warning,
                Some("integrity_checker"),
                &format!("repaired {} on entry {entry_id}", issue_type.as_str()),
                &action,
                Some(json!({ "old": old_value, "new": new_value })),
                Some(entry.trace_id),
            )
            .await?;
        Ok(action)
    }
}

/// Valid sibling sets for one trace ID: a lone row, or a trade paired with
/// its gas-fee row.
fn check_duplicate_trace_ids(entries: &[LedgerEntry]) -> Vec<IntegrityIssue> {
    let mut by_trace: HashMap<String, Vec<&LedgerEntry>> = HashMap::new();
    for entry in entries {
        by_trace.entry(entry.trace_id.to_string()).or_default().push(entry);
    }

    let mut issues = Vec::new();
    for (trace, group) in by_trace {
        if group.len() == 1 {
            continue;
        }
        let same_scope = group
            .iter()
            .all(|e| e.wallet_address == group[0].wallet_address && e.chain == group[0].chain);
        let valid_pair = group.len() == 2
            && group.iter().any(|e| e.entry_type.is_trade())
            && group.iter().any(|e| e.entry_type == EntryType::GasFee);
        if same_scope && valid_pair {
            continue;
        }
        issues.push(IntegrityIssue::new(
            IssueType::DuplicateTraceId,
            format!("trace id {trace} spans {} non-sibling entries", group.len()),
            group.iter().map(|e| e.id).collect(),
            Some("regenerate trace ids for the unrelated actions"),
        ));
    }
    issues
}

fn check_pnl_calculations(entries: &[LedgerEntry]) -> Vec<IntegrityIssue> {
    entries
        .iter()
        .filter(|e| e.entry_type == EntryType::Sell)
        .filter_map(|e| {
            let (pnl_base, pnl_native) = (e.realized_pnl_base?, e.realized_pnl_native?);
            if pnl_conversion_drift(pnl_base, pnl_native, e.fx_rate_base) {
                Some(IntegrityIssue::new(
                    IssueType::PnlCalculationError,
                    format!("entry {} realized pnl disagrees with fx conversion", e.id),
                    vec![e.id],
                    Some("recompute base pnl from the native amount"),
                ))
            } else {
                None
            }
        })
        .collect()
}

fn pnl_conversion_drift(pnl_base: Money, pnl_native: Money, fx_rate: Money) -> bool {
    match pnl_native.checked_mul(fx_rate) {
        Ok(expected) => match expected.checked_sub(pnl_base) {
            Ok(diff) => diff.abs() > "0.01".parse().expect("constant"),
            Err(_) => true,
        },
        Err(_) => true,
    }
}

/// A rate more than 50% away from the rolling median for its currency.
fn check_fx_rate_anomalies(entries: &[LedgerEntry]) -> Vec<IntegrityIssue> {
    let mut windows: HashMap<&str, VecDeque<Money>> = HashMap::new();
    let mut issues = Vec::new();

    for entry in entries {
        let window = windows.entry(entry.currency.as_str()).or_default();
        if window.len() >= 3 {
            let median = rolling_median(window);
            if let (Ok(diff), Ok(half)) = (
                entry.fx_rate_base.checked_sub(median),
                median.checked_div("2".parse().expect("constant"), RoundingMode::HalfEven),
            ) {
                if diff.abs() > half && !median.is_zero() {
                    issues.push(IntegrityIssue::new(
                        IssueType::FxRateAnomaly,
                        format!(
                            "entry {} fx rate {} deviates >50% from rolling median {} for {}",
                            entry.id, entry.fx_rate_base, median, entry.currency
                        ),
                        vec![entry.id],
                        Some("verify the fx rate against market data"),
                    ));
                }
            }
        }
        window.push_back(entry.fx_rate_base);
        if window.len() > FX_WINDOW {
            window.pop_front();
        }
    }
    issues
}

fn rolling_median(window: &VecDeque<Money>) -> Money {
    let mut sorted: Vec<Money> = window.iter().copied().collect();
    sorted.sort();
    sorted[sorted.len() / 2]
}

/// I3 at every prefix: cumulative sells never exceed cumulative buys.
fn check_balance_continuity(entries: &[LedgerEntry]) -> Vec<IntegrityIssue> {
    let mut balances: HashMap<(String, String), Money> = HashMap::new();
    let mut issues = Vec::new();

    for entry in entries {
        if !entry.entry_type.is_trade() && entry.entry_type != EntryType::Income {
            continue;
        }
        let Some(token) = entry.metadata.token_address() else {
            continue;
        };
        let Some(qty) = entry.metadata.amount_tokens() else {
            continue;
        };
        let key = (entry.wallet_address.clone(), format!("{}:{}", token, entry.chain));
        let balance = balances.entry(key.clone()).or_insert(Money::ZERO);
        let next = if entry.entry_type == EntryType::Sell {
            balance.checked_sub(qty)
        } else {
            balance.checked_add(qty)
        };
        match next {
            Ok(updated) => {
                if updated.is_negative() {
                    issues.push(IntegrityIssue::new(
                        IssueType::NegativeBalance,
                        format!(
                            "entry {} drives {} balance negative ({})",
                            entry.id, key.1, updated
                        ),
                        vec![entry.id],
                        Some("review trade ordering and quantities"),
                    ));
                }
                *balance = updated;
            }
            Err(_) => {
                issues.push(IntegrityIssue::new(
                    IssueType::InvalidAmounts,
                    format!("entry {} token quantity overflows the running balance", entry.id),
                    vec![entry.id],
                    None,
                ));
            }
        }
    }
    issues
}

fn check_timestamp_anomalies(entries: &[LedgerEntry]) -> Vec<IntegrityIssue> {
    let horizon = Utc::now() + Duration::seconds(CLOCK_SKEW_TOLERANCE_SECS);
    entries
        .iter()
        .filter(|e| e.created_at > horizon)
        .map(|e| {
            IntegrityIssue::new(
                IssueType::FutureTimestamp,
                format!("entry {} has future timestamp {}", e.id, e.created_at),
                vec![e.id],
                Some("correct the timestamp to current time"),
            )
        })
        .collect()
}

fn check_amount_validations(entries: &[LedgerEntry]) -> Vec<IntegrityIssue> {
    let mut issues = Vec::new();
    for entry in entries {
        let mut problems = Vec::new();
        if entry.fx_rate_base <= Money::ZERO {
            problems.push(format!("fx rate {}", entry.fx_rate_base));
        }
        // Zero-value approvals are the one legal zero.
        if entry.amount_base.is_zero() && entry.entry_type != EntryType::Approve {
            problems.push("zero base amount".to_string());
        }
        let sign_ok = match entry.entry_type {
            EntryType::Buy | EntryType::Income => !entry.amount_base.is_negative(),
            EntryType::Sell | EntryType::Fee | EntryType::GasFee => {
                !entry.amount_base.is_positive()
            }
            EntryType::Approve => true,
        };
        if !sign_ok {
            problems.push(format!(
                "sign of {} inconsistent with {}",
                entry.amount_base, entry.entry_type
            ));
        }
        if !problems.is_empty() {
            issues.push(IntegrityIssue::new(
                IssueType::InvalidAmounts,
                format!("entry {} has invalid amounts: {}", entry.id, problems.join(", ")),
                vec![entry.id],
                Some("correct the offending amounts"),
            ));
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{raw_entry, test_system, RawEntry};

    async fn checker_with(store: Store) -> IntegrityChecker {
        let system = test_system(store.clone()).await;
        IntegrityChecker::new(store, system)
    }

    #[tokio::test]
    async fn clean_ledger_reports_nothing() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO users (user_id, username, created_at) VALUES (1, 'u', '2024-01-01T00:00:00.000Z')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        raw_entry(&store, RawEntry::buy(1, "t1", "100", "50")).await;
        raw_entry(&store, RawEntry::sell(1, "t2", "40", "30", "2024-01-02T00:00:00.000Z")).await;

        let checker = checker_with(store).await;
        let report = checker.run_check(None, false).await.unwrap();
        assert_eq!(report.total_issues, 0, "issues: {:?}", report.issues);
    }

    #[tokio::test]
    async fn detects_negative_balance_and_orphans() {
        let store = Store::open_in_memory().await.unwrap();
        // No user row: every entry is orphaned. Sell without a prior buy.
        raw_entry(&store, RawEntry::sell(9, "t1", "10", "5", "2024-01-01T00:00:00.000Z")).await;

        let checker = checker_with(store).await;
        let report = checker.run_check(None, false).await.unwrap();
        assert!(report
            .issues
            .iter()
            .any(|i| i.issue_type == IssueType::NegativeBalance));
        assert!(report
            .issues
            .iter()
            .any(|i| i.issue_type == IssueType::OrphanedEntry));
        assert!(report.has_critical());
    }

    #[tokio::test]
    async fn detects_and_repairs_future_timestamps() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO users (user_id, username, created_at) VALUES (1, 'u', '2024-01-01T00:00:00.000Z')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        let future = ts_to_sql(Utc::now() + Duration::days(30));
        let mut entry = RawEntry::buy(1, "t1", "100", "50");
        entry.created_at = future;
        raw_entry(&store, entry).await;

        let checker = checker_with(store.clone()).await;
        let report = checker.run_check(None, true).await.unwrap();
        assert!(report
            .issues
            .iter()
            .any(|i| i.issue_type == IssueType::FutureTimestamp));
        assert!(report.repairs.iter().any(|r| r.success));

        // After repair, the scan is clean and a system event was written.
        let report = checker.run_check(None, false).await.unwrap();
        assert!(!report
            .issues
            .iter()
            .any(|i| i.issue_type == IssueType::FutureTimestamp));
        let events: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM system_events WHERE event_type = 'ledger_repair'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(events, 1);
    }

    #[tokio::test]
    async fn detects_fx_anomaly() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO users (user_id, username, created_at) VALUES (1, 'u', '2024-01-01T00:00:00.000Z')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        for (i, rate) in ["2000", "2010", "1990", "2005"].iter().enumerate() {
            let mut entry = RawEntry::buy(1, &format!("t{i}"), "1", "10");
            entry.fx_rate = rate.to_string();
            entry.created_at = format!("2024-01-0{}T00:00:00.000Z", i + 1);
            raw_entry(&store, entry).await;
        }
        // 8000 is 4x the median: flagged.
        let mut outlier = RawEntry::buy(1, "t9", "1", "10");
        outlier.fx_rate = "8000".to_string();
        outlier.created_at = "2024-01-09T00:00:00.000Z".to_string();
        raw_entry(&store, outlier).await;

        let checker = checker_with(store).await;
        let report = checker.run_check(None, false).await.unwrap();
        assert!(report
            .issues
            .iter()
            .any(|i| i.issue_type == IssueType::FxRateAnomaly));
    }
}
