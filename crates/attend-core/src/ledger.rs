//! The attendance ledger: at most one record per identity per calendar day.
//!
//! Each committed mark is appended to `log_YYYYMMDD.csv` in the data
//! directory before `mark` returns. Today's file is read back on open, so a
//! restart does not allow a second mark on the same day.

use crate::clock::Clock;
use crate::error::{AttendError, StorageError};
use crate::guard::AnomalyGuard;
use crate::types::{AttendanceRecord, Factors};
use chrono::{Local, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Attendance summary for one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_enrolled: usize,
    pub present_today: usize,
    pub absent_today: usize,
    /// Percentage of enrolled identities present, `0..=100`.
    pub attendance_rate: f64,
    /// Mean verification score over every loaded record.
    pub average_score: f64,
    pub anomalies_today: usize,
}

type RecordKey = (NaiveDate, String);

pub struct AttendanceLedger {
    clock: Arc<dyn Clock>,
    log_dir: Option<PathBuf>,
    records: Mutex<BTreeMap<RecordKey, AttendanceRecord>>,
}

impl AttendanceLedger {
    /// Ledger with no durable log.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            log_dir: None,
            records: Mutex::new(BTreeMap::new()),
        }
    }

    /// Ledger backed by daily CSV logs in `log_dir`; today's log is loaded.
    pub fn open(clock: Arc<dyn Clock>, log_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let log_dir = log_dir.into();
        let today = clock.today();
        let loaded = read_day(&log_dir, today)?;
        if !loaded.is_empty() {
            tracing::info!(date = %today, records = loaded.len(), "attendance log loaded");
        }
        let records = loaded
            .into_iter()
            .map(|r| ((r.date, r.identity_id.clone()), r))
            .collect();
        Ok(Self {
            clock,
            log_dir: Some(log_dir),
            records: Mutex::new(records),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<RecordKey, AttendanceRecord>> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn log_path(&self, date: NaiveDate) -> Option<PathBuf> {
        self.log_dir.as_deref().map(|d| log_file(d, date))
    }

    /// Commit an attendance mark for today.
    ///
    /// The ledger lock is held from the rate check to the insert, so two
    /// concurrent marks for one identity cannot both pass the daily check.
    pub fn mark(
        &self,
        identity_id: &str,
        factors: Factors,
        location: &str,
        guard: &AnomalyGuard,
    ) -> Result<AttendanceRecord, AttendError> {
        let mut records = self.lock();

        let decision = guard.check_rate_limit(identity_id);
        if !decision.allowed {
            return Err(AttendError::RateLimited(decision.reason));
        }

        let now = self.clock.now();
        let key = (now.date_naive(), identity_id.to_string());
        if records.contains_key(&key) {
            return Err(AttendError::AlreadyMarked(identity_id.to_string()));
        }

        if !factors.face {
            guard.record_attempt(identity_id, false, location);
            return Err(AttendError::FaceRequired);
        }

        let record = AttendanceRecord {
            identity_id: identity_id.to_string(),
            date: key.0,
            marked_at: now,
            verification_score: factors.score(),
        };
        records.insert(key, record.clone());
        guard.record_attempt(identity_id, true, location);

        if let Some(dir) = &self.log_dir {
            if let Err(e) = append_record(dir, &record) {
                tracing::error!(error = %e, identity = identity_id, "attendance log write failed; record kept in memory");
            }
        }

        tracing::info!(
            identity = identity_id,
            score = record.verification_score,
            "attendance marked"
        );
        Ok(record)
    }

    pub fn is_marked(&self, identity_id: &str, date: NaiveDate) -> bool {
        self.lock().contains_key(&(date, identity_id.to_string()))
    }

    /// Records for `date`, earliest first. Days other than today are read
    /// from their log file when one exists.
    pub fn records_on(&self, date: NaiveDate) -> Vec<AttendanceRecord> {
        let mut day: Vec<AttendanceRecord> = self
            .lock()
            .range((date, String::new())..)
            .take_while(|((d, _), _)| *d == date)
            .map(|(_, r)| r.clone())
            .collect();

        if day.is_empty() && date != self.clock.today() {
            if let Some(dir) = &self.log_dir {
                match read_day(dir, date) {
                    Ok(from_disk) => day = from_disk,
                    Err(e) => tracing::warn!(error = %e, %date, "could not read attendance log"),
                }
            }
        }
        day.sort_by_key(|r| r.marked_at);
        day
    }

    pub fn statistics(&self, total_enrolled: usize, guard: &AnomalyGuard) -> Statistics {
        let today = self.clock.today();
        let records = self.lock();
        let present_today = records.keys().filter(|(d, _)| *d == today).count();
        let average_score = if records.is_empty() {
            0.0
        } else {
            records
                .values()
                .map(|r| r.verification_score as f64)
                .sum::<f64>()
                / records.len() as f64
        };
        let attendance_rate = if total_enrolled == 0 {
            0.0
        } else {
            present_today as f64 * 100.0 / total_enrolled as f64
        };
        Statistics {
            total_enrolled,
            present_today,
            absent_today: total_enrolled.saturating_sub(present_today),
            attendance_rate,
            average_score,
            anomalies_today: guard.anomalies_on(today),
        }
    }
}

fn log_file(dir: &Path, date: NaiveDate) -> PathBuf {
    dir.join(format!("log_{}.csv", date.format("%Y%m%d")))
}

#[derive(Debug, Serialize, Deserialize)]
struct LogRow {
    time: String,
    identity_id: String,
    score: u8,
}

fn append_record(dir: &Path, record: &AttendanceRecord) -> Result<(), StorageError> {
    std::fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))?;
    let path = log_file(dir, record.date);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| StorageError::io(&path, e))?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    writer.serialize(LogRow {
        time: record.marked_at.format("%H:%M:%S").to_string(),
        identity_id: record.identity_id.clone(),
        score: record.verification_score,
    })?;
    writer.flush().map_err(|e| StorageError::io(&path, e))?;
    Ok(())
}

fn read_day(dir: &Path, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StorageError> {
    let path = log_file(dir, date);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(&path)?;

    let mut out = Vec::new();
    for row in reader.deserialize::<LogRow>() {
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "skipping malformed log row");
                continue;
            }
        };
        let Some(marked_at) = NaiveTime::parse_from_str(&row.time, "%H:%M:%S")
            .ok()
            .and_then(|t| date.and_time(t).and_local_timezone(Local).earliest())
        else {
            tracing::warn!(time = %row.time, "skipping log row with bad time");
            continue;
        };
        out.push(AttendanceRecord {
            identity_id: row.identity_id,
            date,
            marked_at,
            verification_score: row.score,
        });
    }
    Ok(out)
}
