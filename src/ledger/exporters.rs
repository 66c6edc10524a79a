//! Ledger export to CSV and XLSX, plus CSV re-import.
//!
//! Files are written atomically: the full payload is built in memory,
//! written to a temp file in the destination directory, fsynced, then
//! renamed into place. Readers never observe a partial export.

use chrono::Utc;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::ids::TraceId;
use crate::ledger::{
    insert_entry_tx, query_entries, EntryMetadata, EntryStatus, EntryType, LedgerEntry,
    LedgerFilter, NewLedgerEntry,
};
use crate::money::Money;
use crate::store::{ts_from_sql, ts_to_sql, Store};

/// Fixed export column order. UTF-8, LF line endings, no BOM.
///
/// The trailing `token_quantity` column carries the token amount so that a
/// re-imported ledger replays to identical PnL; consumers reading the fixed
/// prefix by position are unaffected.
pub const EXPORT_HEADER: [&str; 23] = [
    "timestamp",
    "trace_id",
    "entry_type",
    "description",
    "chain",
    "wallet_address",
    "amount_base",
    "amount_native",
    "currency",
    "fx_rate_base",
    "realized_pnl_base",
    "realized_pnl_native",
    "transaction_id",
    "gas_fee_base",
    "gas_fee_native",
    "token_symbol",
    "token_address",
    "dex",
    "pair_address",
    "slippage_percent",
    "notes",
    "created_at",
    "token_quantity",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Xlsx,
}

impl FromStr for ExportFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "xlsx" => Ok(ExportFormat::Xlsx),
            other => Err(CoreError::InputInvalid(format!("unknown export format: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub rows: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub inserted: usize,
    pub skipped: usize,
}

/// Flatten one entry into the fixed 23-column record.
pub fn entry_to_record(entry: &LedgerEntry) -> Vec<String> {
    let opt_money = |m: Option<Money>| m.map(|v| v.to_string()).unwrap_or_default();
    let (gas_base, gas_native) = match &entry.metadata {
        EntryMetadata::Trade {
            gas_fee_base,
            gas_fee_native,
            ..
        } => (*gas_fee_base, *gas_fee_native),
        _ => (None, None),
    };
    let (dex, pair, slippage, notes) = match &entry.metadata {
        EntryMetadata::Trade {
            dex,
            pair_address,
            slippage_percent,
            notes,
            ..
        } => (
            dex.clone(),
            pair_address.clone(),
            *slippage_percent,
            notes.clone(),
        ),
        _ => (entry.dex.clone(), None, None, None),
    };

    vec![
        ts_to_sql(entry.created_at),
        entry.trace_id.to_string(),
        entry.entry_type.as_str().to_string(),
        entry.description.clone(),
        entry.chain.as_str().to_string(),
        entry.wallet_address.clone(),
        entry.amount_base.to_string(),
        entry.amount_native.to_string(),
        entry.currency.clone(),
        entry.fx_rate_base.to_string(),
        opt_money(entry.realized_pnl_base),
        opt_money(entry.realized_pnl_native),
        entry.tx_hash.clone().unwrap_or_default(),
        opt_money(gas_base),
        opt_money(gas_native),
        entry.metadata.token_symbol().unwrap_or_default().to_string(),
        entry.metadata.token_address().unwrap_or_default().to_string(),
        dex.unwrap_or_default(),
        pair.unwrap_or_default(),
        slippage.map(|s| format!("{s:.4}")).unwrap_or_default(),
        notes.unwrap_or_default(),
        ts_to_sql(entry.created_at),
        opt_money(entry.metadata.amount_tokens()),
    ]
}

/// Serialize entries to CSV bytes with the fixed header.
pub fn entries_to_csv(entries: &[LedgerEntry]) -> CoreResult<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer
        .write_record(EXPORT_HEADER)
        .map_err(|e| CoreError::Internal(format!("csv header: {e}")))?;
    for entry in entries {
        writer
            .write_record(entry_to_record(entry))
            .map_err(|e| CoreError::Internal(format!("csv row: {e}")))?;
    }
    writer
        .into_inner()
        .map_err(|e| CoreError::Internal(format!("csv flush: {e}")))
}

/// Export a user's ledger slice; returns the final path and row count.
pub async fn export_ledger(
    store: &Store,
    user_id: i64,
    filter: &LedgerFilter,
    format: ExportFormat,
    export_dir: &Path,
) -> CoreResult<ExportSummary> {
    let entries = query_entries(store, Some(user_id), filter).await?;
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let ext = match format {
        ExportFormat::Csv => "csv",
        ExportFormat::Xlsx => "xlsx",
    };
    let path = export_dir.join(format!("ledger_user_{user_id}_{timestamp}.{ext}"));

    let bytes = match format {
        ExportFormat::Csv => entries_to_csv(&entries)?,
        ExportFormat::Xlsx => entries_to_xlsx(&entries)?,
    };
    let rows = entries.len();
    let target = path.clone();
    tokio::task::spawn_blocking(move || atomic_write(&target, &bytes))
        .await
        .map_err(|e| CoreError::Internal(format!("export task: {e}")))??;

    info!(user_id, rows, path = %path.display(), "ledger export created");
    Ok(ExportSummary { path, rows })
}

fn entries_to_xlsx(entries: &[LedgerEntry]) -> CoreResult<Vec<u8>> {
    use rust_xlsxwriter::{Format, Workbook};

    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();
    let sheet = workbook
        .add_worksheet()
        .set_name("Ledger")
        .map_err(|e| CoreError::Internal(format!("xlsx: {e}")))?;

    for (col, header) in EXPORT_HEADER.iter().enumerate() {
        sheet
            .write_string_with_format(0, col as u16, *header, &bold)
            .map_err(|e| CoreError::Internal(format!("xlsx: {e}")))?;
    }
    for (row, entry) in entries.iter().enumerate() {
        for (col, value) in entry_to_record(entry).into_iter().enumerate() {
            sheet
                .write_string((row + 1) as u32, col as u16, &value)
                .map_err(|e| CoreError::Internal(format!("xlsx: {e}")))?;
        }
    }
    workbook
        .save_to_buffer()
        .map_err(|e| CoreError::Internal(format!("xlsx save: {e}")))
}

/// Write-temp, fsync, rename.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> CoreResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| CoreError::InputInvalid(format!("no parent dir for {}", path.display())))?;
    std::fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("export")
    ));
    {
        use std::io::Write;
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Parse one export record back into an insertable row.
pub fn record_to_new_entry(
    record: &csv::StringRecord,
    fallback_user: i64,
) -> CoreResult<NewLedgerEntry> {
    let field = |idx: usize| record.get(idx).unwrap_or("").trim().to_string();
    let money = |idx: usize| -> CoreResult<Money> {
        field(idx)
            .parse()
            .map_err(|e| CoreError::InputInvalid(format!("column {idx}: {e}")))
    };
    let opt_money = |idx: usize| -> CoreResult<Option<Money>> {
        let raw = field(idx);
        if raw.is_empty() {
            Ok(None)
        } else {
            Ok(Some(raw.parse().map_err(|e| {
                CoreError::InputInvalid(format!("column {idx}: {e}"))
            })?))
        }
    };

    let entry_type: EntryType = field(2).parse()?;
    let token_symbol = field(15);
    let token_address = field(16);
    let amount_base = money(6)?;
    // Older exports lack the trailing quantity column; fall back to the base
    // magnitude so lot accounting still balances.
    let token_quantity = opt_money(22)?.unwrap_or_else(|| amount_base.abs());

    let metadata = if token_address.is_empty() {
        EntryMetadata::Empty
    } else {
        match entry_type {
            EntryType::Buy | EntryType::Sell => EntryMetadata::Trade {
                token_symbol,
                token_address,
                amount_tokens: token_quantity,
                dex: non_empty(field(17)),
                pair_address: non_empty(field(18)),
                slippage_percent: field(19).parse().ok(),
                gas_fee_base: opt_money(13)?,
                gas_fee_native: opt_money(14)?,
                order_id: None,
                notes: non_empty(field(20)),
            },
            EntryType::Fee | EntryType::GasFee => EntryMetadata::GasFee {
                token_symbol,
                token_address,
            },
            EntryType::Approve => EntryMetadata::Approval {
                token_symbol,
                token_address,
                spender: String::new(),
            },
            EntryType::Income => EntryMetadata::Income {
                token_symbol,
                token_address,
                amount_tokens: token_quantity,
                activity_type: "income".to_string(),
            },
        }
    };

    Ok(NewLedgerEntry {
        trace_id: field(1).parse()?,
        user_id: fallback_user,
        wallet_address: field(5),
        chain: field(4).parse()?,
        dex: non_empty(field(17)),
        entry_type,
        description: field(3),
        amount_base,
        amount_native: money(7)?,
        currency: field(8),
        fx_rate_base: money(9)?,
        realized_pnl_base: opt_money(10)?,
        realized_pnl_native: opt_money(11)?,
        tx_hash: non_empty(field(12)),
        block_number: None,
        status: EntryStatus::Confirmed,
        metadata,
        created_at: ts_from_sql(&field(21))?,
    })
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Import export-format CSV, skipping rows whose `(trace_id, entry_type)`
/// already exists. Used by archive restore and replay.
pub async fn import_csv<R: Read>(
    store: &Store,
    reader: R,
    user_id: i64,
) -> CoreResult<ImportSummary> {
    let mut csv_reader = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);
    let mut rows: Vec<NewLedgerEntry> = Vec::new();
    for record in csv_reader.records() {
        let record = record.map_err(|e| CoreError::InputInvalid(format!("csv: {e}")))?;
        rows.push(record_to_new_entry(&record, user_id)?);
    }

    store
        .with_tx(move |tx| {
            let mut summary = ImportSummary::default();
            for row in &rows {
                if trace_exists(tx, row.trace_id, row.entry_type)? {
                    summary.skipped += 1;
                    continue;
                }
                insert_entry_tx(tx, row)?;
                summary.inserted += 1;
            }
            Ok(summary)
        })
        .await
}

fn trace_exists(
    tx: &rusqlite::Transaction,
    trace_id: TraceId,
    entry_type: EntryType,
) -> CoreResult<bool> {
    let mut stmt = tx.prepare_cached(
        "SELECT 1 FROM ledger_entries WHERE trace_id = ?1 AND entry_type = ?2",
    )?;
    Ok(stmt.exists(rusqlite::params![trace_id.to_string(), entry_type.as_str()])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::writer::{TradeKind, TradeParams};
    use crate::testutil::test_writer;
    use crate::ids::ChainId;

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
            amount_native: "1".parse().unwrap(),
            amount_base: base.parse().unwrap(),
            fx_rate_base: "2000".parse().unwrap(),
            gas_fee_native: None,
            gas_fee_base: None,
            dex: Some("uniswap".to_string()),
            pair_address: None,
            slippage_percent: Some(0.5),
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
    async fn csv_has_header_and_matching_line_count() {
        let (writer, store) = test_writer().await;
        writer.write_trade(trade(TradeKind::Buy, "10", "20")).await.unwrap();
        writer.write_trade(trade(TradeKind::Buy, "5", "15")).await.unwrap();

        let entries = query_entries(&store, Some(1), &LedgerFilter::default())
            .await
            .unwrap();
        let bytes = entries_to_csv(&entries).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3); // header + 2 rows
        assert!(lines[0].starts_with("timestamp,trace_id,entry_type"));
        assert!(!text.starts_with('\u{feff}'), "no BOM");
        assert!(!text.contains('\r'), "LF line endings only");
    }

    #[tokio::test]
    async fn export_then_import_into_empty_store_preserves_rows() {
        let (writer, store) = test_writer().await;
        writer.write_trade(trade(TradeKind::Buy, "10", "20")).await.unwrap();
        let mut sell = trade(TradeKind::Sell, "4", "12");
        sell.realized_pnl_base = Some("4".parse().unwrap());
        writer.write_trade(sell).await.unwrap();

        let entries = query_entries(&store, Some(1), &LedgerFilter::default())
            .await
            .unwrap();
        let bytes = entries_to_csv(&entries).unwrap();

        let (_, fresh) = test_writer().await;
        let summary = import_csv(&fresh, bytes.as_slice(), 1).await.unwrap();
        assert_eq!(summary.inserted, entries.len());
        assert_eq!(summary.skipped, 0);

        // A second import is a no-op.
        let again = import_csv(&fresh, entries_to_csv(&entries).unwrap().as_slice(), 1)
            .await
            .unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.skipped, entries.len());

        let restored = query_entries(&fresh, Some(1), &LedgerFilter::default())
            .await
            .unwrap();
        let original_traces: Vec<_> = entries.iter().map(|e| (e.trace_id, e.entry_type)).collect();
        let restored_traces: Vec<_> = restored.iter().map(|e| (e.trace_id, e.entry_type)).collect();
        assert_eq!(original_traces, restored_traces);
        assert_eq!(
            restored[1].realized_pnl_base,
            Some("4".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        atomic_write(&path, b"a,b,c\n").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"a,b,c\n");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
