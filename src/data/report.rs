//! Report aggregation and the daily report store.
//!
//! One CSV store exists per calendar day (`report_YYYYMMDD.csv`); every run
//! appends its records and a summary block to it. The store is a flexible CSV:
//! record rows carry the full measurement, summary rows are `metric,value` pairs
//! tagged with the run id, so a day's file can be split back into runs.
//!
//! While a run is being appended a `<store>.lock` sentinel exists next to the
//! store. A second writer that finds the sentinel fails with [`DaqError::Write`]
//! instead of interleaving rows. The sentinel records the owning PID and its
//! creation time; one left behind by a killed process (owner gone, or older than
//! [`STALE_LOCK_AGE`]) is reclaimed by the next writer.

use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Local, NaiveDate};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A lock sentinel older than this is considered abandoned
pub const STALE_LOCK_AGE: Duration = Duration::from_secs(120);

/// One measured spot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementRecord {
    /// Board under test
    pub board_no: u32,
    /// Channel under test
    pub channel_no: u32,
    /// Spot value as sent in the board frame
    pub spot: u8,
    /// Marker frequency (Hz), NaN if the read failed
    pub freq_hz: f64,
    /// Marker level (dBm), NaN if the read failed
    pub power_dbm: f64,
    /// When the record was taken
    pub timestamp: DateTime<Local>,
}

impl MeasurementRecord {
    /// True if this record holds a real reading
    pub fn is_valid(&self) -> bool {
        self.power_dbm.is_finite()
    }
}

/// Aggregate statistics over the valid records of one run
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReportSummary {
    /// All records, valid or not
    pub records: usize,
    /// Records with a finite power reading
    pub valid: usize,
    /// Highest power (dBm)
    pub max_dbm: f64,
    /// Lowest power (dBm)
    pub min_dbm: f64,
    /// Mean power (dBm), rounded to 0.01
    pub avg_dbm: f64,
    /// `max - min`, the flatness figure (dB)
    pub range_db: f64,
    /// Spot at which `max_dbm` was seen
    pub spot_at_max: u8,
    /// Spot at which `min_dbm` was seen
    pub spot_at_min: u8,
}

/// Power vs spot point for charting
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChartPoint {
    /// Spot value
    pub spot: u8,
    /// Measured power (dBm)
    pub power_dbm: f64,
}

/// Summarise `records`; `None` if none of them holds a valid reading
pub fn summarize(records: &[MeasurementRecord]) -> Option<ReportSummary> {
    let mut valid = records.iter().filter(|r| r.is_valid());
    let first = valid.next()?;

    let mut max = first;
    let mut min = first;
    let mut sum = first.power_dbm;
    let mut count = 1usize;
    for r in valid {
        if r.power_dbm > max.power_dbm {
            max = r;
        }
        if r.power_dbm < min.power_dbm {
            min = r;
        }
        sum += r.power_dbm;
        count += 1;
    }

    let avg = sum / count as f64;
    Some(ReportSummary {
        records: records.len(),
        valid: count,
        max_dbm: max.power_dbm,
        min_dbm: min.power_dbm,
        avg_dbm: (avg * 100.0).round() / 100.0,
        range_db: max.power_dbm - min.power_dbm,
        spot_at_max: max.spot,
        spot_at_min: min.spot,
    })
}

/// Chart series in spot order, skipping missing readings
pub fn chart_points(records: &[MeasurementRecord]) -> Vec<ChartPoint> {
    records
        .iter()
        .filter(|r| r.is_valid())
        .map(|r| ChartPoint {
            spot: r.spot,
            power_dbm: r.power_dbm,
        })
        .collect()
}

/// Where a run's report went
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRef {
    /// Daily store the run was appended to
    pub path: PathBuf,
    /// Run id tagging this run's rows
    pub run_id: Uuid,
    /// Number of record rows written
    pub records: usize,
    /// Summary written with the rows, if any record was valid
    pub summary: Option<ReportSummary>,
    /// Power vs spot series for this run
    pub chart: Vec<ChartPoint>,
}

/// Directory of daily report stores
#[derive(Debug, Clone)]
pub struct ReportStore {
    directory: PathBuf,
}

impl ReportStore {
    /// Store rooted at `directory` (created on first write)
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Report directory
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Store file for `date`
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.directory
            .join(format!("report_{}.csv", date.format("%Y%m%d")))
    }

    /// Most recently modified store in the directory
    ///
    /// Returns [`DaqError::NotFound`] if no store exists yet.
    pub fn latest(&self) -> AppResult<PathBuf> {
        let entries = match std::fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DaqError::NotFound(format!(
                    "report directory {} does not exist",
                    self.directory.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };

        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !(name.starts_with("report_") && name.ends_with(".csv")) {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            match &newest {
                Some((t, _)) if modified < *t => {}
                _ => newest = Some((modified, entry.path())),
            }
        }

        newest.map(|(_, path)| path).ok_or_else(|| {
            DaqError::NotFound(format!("no reports in {}", self.directory.display()))
        })
    }
}

/// Removes the lock sentinel when dropped
struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    fn acquire(store: &Path) -> AppResult<Self> {
        let mut name = store.as_os_str().to_owned();
        name.push(".lock");
        let path = PathBuf::from(name);

        let created = match Self::create(&path) {
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && sentinel_is_stale(&path) => {
                warn!(path = %path.display(), "Reclaiming abandoned store lock");
                if let Err(e) = std::fs::remove_file(&path) {
                    debug!(path = %path.display(), "Stale lock already gone: {}", e);
                }
                Self::create(&path)
            }
            other => other,
        };
        created.map_err(|e| DaqError::Write(format!("cannot lock {}: {}", store.display(), e)))?;

        Ok(Self { path })
    }

    fn create(path: &Path) -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        writeln!(file, "{} {}", std::process::id(), Local::now().to_rfc3339())
    }
}

/// True if the sentinel's owner is gone or it outlived [`STALE_LOCK_AGE`]
///
/// Unparseable content falls back to the file's modification time.
fn sentinel_is_stale(path: &Path) -> bool {
    let content = std::fs::read_to_string(path).unwrap_or_default();
    let mut fields = content.split_whitespace();
    let pid = fields.next().and_then(|p| p.parse::<u32>().ok());
    let created = fields
        .next()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Local));

    if let Some(pid) = pid {
        if !process_alive(pid) {
            return true;
        }
    }

    let age = match created {
        Some(created) => (Local::now() - created).to_std().unwrap_or_default(),
        None => match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => modified.elapsed().unwrap_or_default(),
            Err(_) => return false,
        },
    };
    age > STALE_LOCK_AGE
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

// no cheap liveness probe elsewhere; age alone decides
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), "Could not remove store lock: {}", e);
        }
    }
}

// ============================================================================
// CSV Store
// ============================================================================

#[cfg(feature = "storage_csv")]
impl ReportStore {
    /// Append one run to today's store
    ///
    /// Blocking; call from `spawn_blocking` inside async code.
    ///
    /// # Errors
    /// [`DaqError::Write`] if the directory or store cannot be created, opened,
    /// locked or written. `records` is never consumed.
    pub fn append(&self, run_id: Uuid, records: &[MeasurementRecord]) -> AppResult<ReportRef> {
        self.append_on(Local::now().date_naive(), run_id, records)
    }

    /// Append one run to the store for `date`
    pub fn append_on(
        &self,
        date: NaiveDate,
        run_id: Uuid,
        records: &[MeasurementRecord],
    ) -> AppResult<ReportRef> {
        std::fs::create_dir_all(&self.directory).map_err(|e| {
            DaqError::Write(format!("cannot create {}: {}", self.directory.display(), e))
        })?;

        let path = self.path_for(date);
        let _lock = StoreLock::acquire(&path)?;

        let is_new = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| DaqError::Write(format!("cannot open {}: {}", path.display(), e)))?;

        let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(file);
        let write_err = |e: csv::Error| DaqError::Write(format!("{}: {}", path.display(), e));

        if is_new {
            writer
                .write_record([
                    "kind",
                    "run_id",
                    "timestamp",
                    "board_no",
                    "channel_no",
                    "spot",
                    "freq_hz",
                    "power_dbm",
                ])
                .map_err(write_err)?;
        }

        let run = run_id.to_string();
        for r in records {
            writer
                .write_record([
                    "record".to_string(),
                    run.clone(),
                    r.timestamp.to_rfc3339(),
                    r.board_no.to_string(),
                    r.channel_no.to_string(),
                    format!("{:02X}", r.spot),
                    cell(r.freq_hz),
                    cell(r.power_dbm),
                ])
                .map_err(write_err)?;
        }

        let summary = summarize(records);
        if let Some(s) = &summary {
            let rows = [
                ("max_dbm", s.max_dbm.to_string()),
                ("min_dbm", s.min_dbm.to_string()),
                ("avg_dbm", s.avg_dbm.to_string()),
                ("range_db", s.range_db.to_string()),
                ("spot_at_max", s.spot_at_max.to_string()),
                ("spot_at_min", s.spot_at_min.to_string()),
                ("valid", format!("{}/{}", s.valid, s.records)),
            ];
            for (metric, value) in rows {
                writer
                    .write_record(["summary", run.as_str(), metric, value.as_str()])
                    .map_err(write_err)?;
            }
        }

        let chart = chart_points(records);
        for point in &chart {
            writer
                .write_record([
                    "chart".to_string(),
                    run.clone(),
                    format!("{:02X}", point.spot),
                    point.power_dbm.to_string(),
                ])
                .map_err(write_err)?;
        }

        writer
            .flush()
            .map_err(|e| DaqError::Write(format!("{}: {}", path.display(), e)))?;

        info!(path = %path.display(), run_id = %run_id, records = records.len(), "Report appended");
        Ok(ReportRef {
            path,
            run_id,
            records: records.len(),
            summary,
            chart,
        })
    }
}

#[cfg(not(feature = "storage_csv"))]
impl ReportStore {
    /// Append one run to today's store
    pub fn append(&self, _run_id: Uuid, _records: &[MeasurementRecord]) -> AppResult<ReportRef> {
        Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
    }

    /// Append one run to the store for `date`
    pub fn append_on(
        &self,
        _date: NaiveDate,
        _run_id: Uuid,
        _records: &[MeasurementRecord],
    ) -> AppResult<ReportRef> {
        Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
    }
}

#[cfg(feature = "storage_csv")]
fn cell(value: f64) -> String {
    if value.is_finite() {
        value.to_string()
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(spot: u8, power_dbm: f64) -> MeasurementRecord {
        MeasurementRecord {
            board_no: 1,
            channel_no: 2,
            spot,
            freq_hz: 3.0e9,
            power_dbm,
            timestamp: Local::now(),
        }
    }

    #[test]
    fn test_summary_bounds() {
        let records = vec![record(0x00, -14.0), record(0x05, -12.5), record(0x0A, -17.25)];
        let s = summarize(&records).expect("summary");

        assert_eq!(s.max_dbm, -12.5);
        assert_eq!(s.min_dbm, -17.25);
        assert_eq!(s.range_db, s.max_dbm - s.min_dbm);
        assert_eq!(s.spot_at_max, 0x05);
        assert_eq!(s.spot_at_min, 0x0A);
        assert_eq!(s.avg_dbm, -14.58);
        for r in &records {
            assert!(s.max_dbm >= r.power_dbm && s.min_dbm <= r.power_dbm);
        }
    }

    #[test]
    fn test_summary_skips_missing_values() {
        let records = vec![record(0, f64::NAN), record(5, -20.0)];
        let s = summarize(&records).expect("summary");
        assert_eq!(s.valid, 1);
        assert_eq!(s.records, 2);
        assert_eq!(s.range_db, 0.0);

        assert!(summarize(&[record(0, f64::NAN)]).is_none());
        assert_eq!(chart_points(&records).len(), 1);
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn test_runs_append_to_daily_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ReportStore::new(dir.path());
        let date = NaiveDate::from_ymd_opt(2025, 3, 14).expect("date");

        let a = store
            .append_on(date, Uuid::new_v4(), &[record(0, -10.0), record(5, f64::NAN)])
            .expect("first run");
        let b = store
            .append_on(date, Uuid::new_v4(), &[record(10, -11.0)])
            .expect("second run");
        assert_eq!(a.path, b.path);
        assert!(a.path.ends_with("report_20250314.csv"));

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&a.path)
            .expect("reader");
        let kinds: Vec<String> = reader
            .records()
            .map(|r| r.expect("row")[0].to_string())
            .collect();
        assert_eq!(kinds.iter().filter(|k| *k == "record").count(), 3);
        assert_eq!(kinds.iter().filter(|k| *k == "summary").count(), 14);
        assert_eq!(kinds.iter().filter(|k| *k == "chart").count(), 2);
        assert_eq!(
            a.chart,
            vec![ChartPoint {
                spot: 0,
                power_dbm: -10.0
            }]
        );
        assert!(!dir.path().join("report_20250314.csv.lock").exists());
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn test_locked_store_is_write_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ReportStore::new(dir.path());
        let date = NaiveDate::from_ymd_opt(2025, 3, 14).expect("date");
        std::fs::write(dir.path().join("report_20250314.csv.lock"), b"").expect("lock");

        let records = vec![record(0, -10.0)];
        let err = store.append_on(date, Uuid::new_v4(), &records).unwrap_err();
        assert!(matches!(err, DaqError::Write(_)));
        // caller still owns the records
        assert_eq!(records.len(), 1);
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn test_abandoned_lock_is_reclaimed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ReportStore::new(dir.path());
        let date = NaiveDate::from_ymd_opt(2025, 3, 14).expect("date");
        let lock = dir.path().join("report_20250314.csv.lock");

        // owner still alive but the sentinel is far older than any append
        let old = Local::now() - chrono::Duration::hours(2);
        std::fs::write(&lock, format!("{} {}\n", std::process::id(), old.to_rfc3339()))
            .expect("lock");

        let report = store
            .append_on(date, Uuid::new_v4(), &[record(0, -10.0)])
            .expect("reclaimed");
        assert_eq!(report.records, 1);
        assert!(!lock.exists());
    }

    #[cfg(all(feature = "storage_csv", target_os = "linux"))]
    #[test]
    fn test_lock_of_dead_process_is_reclaimed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ReportStore::new(dir.path());
        let date = NaiveDate::from_ymd_opt(2025, 3, 14).expect("date");
        let lock = dir.path().join("report_20250314.csv.lock");

        let mut child = std::process::Command::new("true").spawn().expect("spawn");
        let pid = child.id();
        child.wait().expect("wait");
        std::fs::write(&lock, format!("{} {}\n", pid, Local::now().to_rfc3339())).expect("lock");

        assert!(store.append_on(date, Uuid::new_v4(), &[record(0, -10.0)]).is_ok());
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn test_fresh_lock_of_live_process_is_respected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ReportStore::new(dir.path());
        let date = NaiveDate::from_ymd_opt(2025, 3, 14).expect("date");
        std::fs::write(
            dir.path().join("report_20250314.csv.lock"),
            format!("{} {}\n", std::process::id(), Local::now().to_rfc3339()),
        )
        .expect("lock");

        let err = store.append_on(date, Uuid::new_v4(), &[record(0, -10.0)]).unwrap_err();
        assert!(matches!(err, DaqError::Write(_)));
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn test_latest_picks_newest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ReportStore::new(dir.path());
        assert!(matches!(store.latest(), Err(DaqError::NotFound(_))));

        let old = NaiveDate::from_ymd_opt(2025, 1, 1).expect("date");
        let new = NaiveDate::from_ymd_opt(2025, 1, 2).expect("date");
        store.append_on(old, Uuid::new_v4(), &[record(0, -1.0)]).expect("old");
        std::thread::sleep(std::time::Duration::from_millis(20));
        let newest = store.append_on(new, Uuid::new_v4(), &[record(0, -1.0)]).expect("new");
        std::fs::write(dir.path().join("notes.txt"), b"ignored").expect("noise");

        assert_eq!(store.latest().expect("latest"), newest.path);
    }
}
