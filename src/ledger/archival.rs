//! Monthly ledger archival, retention and restore.
//!
//! Archives are gzip-compressed export CSVs with deterministic filenames
//! (`ledger_user_{id}_{YYYYMM}.csv.gz`). Retention deletes archives past the
//! configured age while always preserving the most recent few per user.
//! Restore re-ingests a slice, skipping rows that already exist.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::ledger::exporters::{atomic_write, entries_to_csv, import_csv, ImportSummary, EXPORT_HEADER};
use crate::ledger::{query_entries, users_with_entries, LedgerFilter};
use crate::store::Store;

/// Lines re-read from each archive during verification.
const VERIFY_LINES: usize = 5;

#[derive(Debug, Clone)]
pub struct ArchiveFile {
    pub path: PathBuf,
    pub user_id: i64,
    pub entries: usize,
}

#[derive(Debug, Default)]
pub struct ArchiveReport {
    pub users_archived: usize,
    pub total_entries: usize,
    pub files: Vec<ArchiveFile>,
    pub verification_passed: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub scanned: usize,
    pub deleted: usize,
    pub kept: usize,
    pub freed_bytes: u64,
}

#[derive(Clone)]
pub struct ArchivalManager {
    store: Store,
    config: Arc<CoreConfig>,
}

impl ArchivalManager {
    pub fn new(store: Store, config: Arc<CoreConfig>) -> Self {
        ArchivalManager { store, config }
    }

    /// Archive one calendar month for every user with entries in it.
    pub async fn archive_month(&self, year: i32, month: u32) -> CoreResult<ArchiveReport> {
        let start = month_start(year, month)?;
        let end = next_month_start(year, month)?;
        let mut report = ArchiveReport::default();

        let users = users_with_entries(&self.store, start, end).await?;
        for user_id in users {
            match self.archive_user_month(user_id, year, month, start, end).await {
                Ok(file) => {
                    report.total_entries += file.entries;
                    report.users_archived += 1;
                    report.files.push(file);
                }
                Err(err) => {
                    warn!(user_id, error = %err, "user archive failed");
                    report.errors.push(format!("user {user_id}: {err}"));
                }
            }
        }

        report.verification_passed = true;
        for file in &report.files {
            if let Err(err) = verify_archive(&file.path) {
                report.verification_passed = false;
                report.errors.push(format!("{}: {err}", file.path.display()));
            }
        }

        info!(
            year,
            month,
            users = report.users_archived,
            entries = report.total_entries,
            verified = report.verification_passed,
            "monthly archive completed"
        );
        Ok(report)
    }

    async fn archive_user_month(
        &self,
        user_id: i64,
        year: i32,
        month: u32,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CoreResult<ArchiveFile> {
        let filter = LedgerFilter {
            start: Some(start),
            end: Some(end - chrono::Duration::milliseconds(1)),
            ..Default::default()
        };
        let entries = query_entries(&self.store, Some(user_id), &filter).await?;
        let csv_bytes = entries_to_csv(&entries)?;

        let filename = format!("ledger_user_{user_id}_{year:04}{month:02}.csv.gz");
        let path = self.config.archives_dir.join(filename);
        let compress = self.config.archive_compress;
        let count = entries.len();

        let target = path.clone();
        tokio::task::spawn_blocking(move || -> CoreResult<()> {
            let payload = if compress {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&csv_bytes)?;
                encoder.finish()?
            } else {
                csv_bytes
            };
            atomic_write(&target, &payload)
        })
        .await
        .map_err(|e| CoreError::Internal(format!("archive task: {e}")))??;

        Ok(ArchiveFile {
            path,
            user_id,
            entries: count,
        })
    }

    /// Delete archives older than the retention window, always keeping the
    /// `archive_min_keep` most recent per user regardless of age.
    pub async fn run_retention(&self) -> CoreResult<RetentionReport> {
        let dir = self.config.archives_dir.clone();
        let retention_days = self.config.retention_days as i64;
        let min_keep = self.config.archive_min_keep;

        tokio::task::spawn_blocking(move || -> CoreResult<RetentionReport> {
            let cutoff = Utc::now() - chrono::Duration::days(retention_days);
            let mut by_user: std::collections::HashMap<i64, Vec<(PathBuf, DateTime<Utc>, u64)>> =
                std::collections::HashMap::new();
            let mut report = RetentionReport::default();

            if !dir.exists() {
                return Ok(report);
            }
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                let Some((user_id, stamp)) = parse_archive_filename(&name) else {
                    continue;
                };
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                report.scanned += 1;
                by_user.entry(user_id).or_default().push((entry.path(), stamp, size));
            }

            for (_user, mut files) in by_user {
                files.sort_by(|a, b| b.1.cmp(&a.1));
                for (idx, (path, stamp, size)) in files.into_iter().enumerate() {
                    if idx < min_keep || stamp >= cutoff {
                        report.kept += 1;
                        continue;
                    }
                    match std::fs::remove_file(&path) {
                        Ok(()) => {
                            info!(path = %path.display(), "old archive deleted");
                            report.deleted += 1;
                            report.freed_bytes += size;
                        }
                        Err(err) => {
                            warn!(path = %path.display(), error = %err, "archive delete failed");
                            report.kept += 1;
                        }
                    }
                }
            }
            Ok(report)
        })
        .await
        .map_err(|e| CoreError::Internal(format!("retention task: {e}")))?
    }

    /// Re-ingest an archive, skipping rows whose trace already exists.
    pub async fn restore_archive(&self, path: &Path) -> CoreResult<ImportSummary> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CoreError::InputInvalid(format!("bad archive path: {}", path.display())))?;
        let (user_id, _) = parse_archive_filename(name).ok_or_else(|| {
            CoreError::InputInvalid(format!("unrecognized archive filename: {name}"))
        })?;

        let bytes = std::fs::read(path)?;
        let decoded = decode_maybe_gzip(&bytes)?;
        let summary = import_csv(&self.store, decoded.as_slice(), user_id).await?;
        info!(
            path = %path.display(),
            inserted = summary.inserted,
            skipped = summary.skipped,
            "archive restored"
        );
        Ok(summary)
    }
}

fn decode_maybe_gzip(bytes: &[u8]) -> CoreResult<Vec<u8>> {
    if bytes.starts_with(&[0x1f, 0x8b]) {
        let mut decoder = GzDecoder::new(bytes);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    } else {
        Ok(bytes.to_vec())
    }
}

/// Re-read the header and first few data lines of an archive.
pub fn verify_archive(path: &Path) -> CoreResult<()> {
    let bytes = std::fs::read(path)?;
    let decoded = decode_maybe_gzip(&bytes)?;
    let reader = BufReader::new(decoded.as_slice());
    let mut lines = reader.lines();

    let header = lines
        .next()
        .transpose()?
        .ok_or_else(|| CoreError::IntegrityViolation("archive is empty".to_string()))?;
    let expected = EXPORT_HEADER.join(",");
    if header != expected {
        return Err(CoreError::IntegrityViolation(format!(
            "archive header mismatch in {}",
            path.display()
        )));
    }

    for line in lines.take(VERIFY_LINES) {
        let line = line?;
        let fields = line.split(',').count();
        if fields < EXPORT_HEADER.len() {
            return Err(CoreError::IntegrityViolation(format!(
                "short row in {}",
                path.display()
            )));
        }
    }
    Ok(())
}

/// Parse `ledger_user_{uint}_{YYYYMM}.csv.gz` or
/// `ledger_user_{uint}_{YYYYMMDD}_{HHMMSS}.csv.gz`.
pub fn parse_archive_filename(name: &str) -> Option<(i64, DateTime<Utc>)> {
    let stem = name
        .strip_suffix(".csv.gz")
        .or_else(|| name.strip_suffix(".csv"))?;
    let rest = stem.strip_prefix("ledger_user_")?;
    let mut parts = rest.splitn(2, '_');
    let user_id: i64 = parts.next()?.parse().ok()?;
    let stamp = parts.next()?;

    match stamp.len() {
        6 => {
            let year: i32 = stamp[0..4].parse().ok()?;
            let month: u32 = stamp[4..6].parse().ok()?;
            let date = NaiveDate::from_ymd_opt(year, month, 1)?;
            Some((user_id, Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?)))
        }
        15 => {
            // YYYYMMDD_HHMMSS
            let (date_part, time_part) = stamp.split_once('_')?;
            let date = NaiveDate::from_ymd_opt(
                date_part[0..4].parse().ok()?,
                date_part[4..6].parse().ok()?,
                date_part[6..8].parse().ok()?,
            )?;
            let time = date.and_hms_opt(
                time_part[0..2].parse().ok()?,
                time_part[2..4].parse().ok()?,
                time_part[4..6].parse().ok()?,
            )?;
            Some((user_id, Utc.from_utc_datetime(&time)))
        }
        _ => None,
    }
}

fn month_start(year: i32, month: u32) -> CoreResult<DateTime<Utc>> {
    let date = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| CoreError::InputInvalid(format!("invalid month {year}-{month}")))?;
    Ok(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight")))
}

fn next_month_start(year: i32, month: u32) -> CoreResult<DateTime<Utc>> {
    if month == 12 {
        month_start(year + 1, 1)
    } else {
        month_start(year, month + 1)
    }
}

/// Previous calendar month relative to `now`, for the scheduled job.
pub fn previous_month(now: DateTime<Utc>) -> (i32, u32) {
    if now.month() == 1 {
        (now.year() - 1, 12)
    } else {
        (now.year(), now.month() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{raw_entry, RawEntry};
    use tempfile::TempDir;

    async fn manager_with_tmp() -> (ArchivalManager, Store, TempDir) {
        let store = Store::open_in_memory().await.unwrap();
        let dir = TempDir::new().unwrap();
        let mut config = CoreConfig::default();
        config.archives_dir = dir.path().to_path_buf();
        config.archive_min_keep = 1;
        (
            ArchivalManager::new(store.clone(), Arc::new(config)),
            store,
            dir,
        )
    }

    #[tokio::test]
    async fn archive_month_writes_deterministic_filename() {
        let (manager, store, dir) = manager_with_tmp().await;
        let mut entry = RawEntry::buy(7, "a1", "100", "50");
        entry.created_at = "2024-03-15T12:00:00.000Z".to_string();
        raw_entry(&store, entry).await;

        let report = manager.archive_month(2024, 3).await.unwrap();
        assert_eq!(report.users_archived, 1);
        assert_eq!(report.total_entries, 1);
        assert!(report.verification_passed, "errors: {:?}", report.errors);
        let expected = dir.path().join("ledger_user_7_202403.csv.gz");
        assert!(expected.exists());
        verify_archive(&expected).unwrap();
    }

    #[tokio::test]
    async fn archive_restore_round_trip_preserves_rows() {
        let (manager, store, dir) = manager_with_tmp().await;
        let mut first = RawEntry::buy(7, "a1", "100", "50");
        first.created_at = "2024-03-01T00:00:00.000Z".to_string();
        raw_entry(&store, first).await;
        let mut second = RawEntry::sell(7, "a2", "40", "30", "2024-03-02T00:00:00.000Z");
        second.realized_pnl_base = Some("10".to_string());
        raw_entry(&store, second).await;

        manager.archive_month(2024, 3).await.unwrap();
        let archive = dir.path().join("ledger_user_7_202403.csv.gz");

        let before = query_entries(&store, Some(7), &LedgerFilter::default())
            .await
            .unwrap();

        // Restore into an empty store.
        let fresh = Store::open_in_memory().await.unwrap();
        let mut config = CoreConfig::default();
        config.archives_dir = dir.path().to_path_buf();
        let fresh_manager = ArchivalManager::new(fresh.clone(), Arc::new(config));
        let summary = fresh_manager.restore_archive(&archive).await.unwrap();
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.skipped, 0);

        // Restoring twice skips everything.
        let again = fresh_manager.restore_archive(&archive).await.unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.skipped, 2);

        let after = query_entries(&fresh, Some(7), &LedgerFilter::default())
            .await
            .unwrap();
        let before_ids: Vec<_> = before.iter().map(|e| e.trace_id).collect();
        let after_ids: Vec<_> = after.iter().map(|e| e.trace_id).collect();
        assert_eq!(before_ids, after_ids);
    }

    #[tokio::test]
    async fn retention_keeps_minimum_per_user() {
        let (manager, _store, dir) = manager_with_tmp().await;
        // Three ancient archives; min_keep = 1.
        for month in 1..=3 {
            let path = dir.path().join(format!("ledger_user_7_2020{month:02}.csv.gz"));
            std::fs::write(&path, b"stale").unwrap();
        }
        let report = manager.run_retention().await.unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.deleted, 2);
        assert_eq!(report.kept, 1);
        // The newest survives.
        assert!(dir.path().join("ledger_user_7_202003.csv.gz").exists());
    }

    #[test]
    fn filename_grammar() {
        let (user, stamp) = parse_archive_filename("ledger_user_12_202403.csv.gz").unwrap();
        assert_eq!(user, 12);
        assert_eq!(stamp.to_rfc3339(), "2024-03-01T00:00:00+00:00");

        let (user, stamp) =
            parse_archive_filename("ledger_user_3_20240315_120102.csv.gz").unwrap();
        assert_eq!(user, 3);
        assert_eq!(stamp.format("%Y-%m-%d %H:%M:%S").to_string(), "2024-03-15 12:01:02");

        assert!(parse_archive_filename("notes.txt").is_none());
        assert!(parse_archive_filename("ledger_user_x_202403.csv.gz").is_none());
    }

    #[test]
    fn previous_month_wraps_year() {
        let jan = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        assert_eq!(previous_month(jan), (2023, 12));
        let may = Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap();
        assert_eq!(previous_month(may), (2024, 4));
    }
}
