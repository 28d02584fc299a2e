//! Append-only event log of analysis reports.
//!
//! The log is the only record of job state. Nothing is ever updated in place:
//! the current status of a job is the most recent record whose
//! `(patient_id, exercise_id, video_filename)` matches its key. Records with
//! equal timestamps resolve to the one appended last.

use crate::config::{Config, EventLogBackend};
use crate::models::{FeedbackReport, JobKey};
use anyhow::{Context, Result};
use chrono::SecondsFormat;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Storage port for report records
pub trait EventLog: Send + Sync {
    /// Append one record
    fn append(&self, report: &FeedbackReport) -> Result<()>;

    /// All records for a key, in append order
    fn history_for(&self, key: &JobKey) -> Result<Vec<FeedbackReport>>;

    /// Current status of a job
    fn latest_for(&self, key: &JobKey) -> Result<Option<FeedbackReport>> {
        Ok(latest(self.history_for(key)?))
    }

    /// Current status of every job of a patient, oldest job first
    fn latest_for_patient(&self, patient_id: &str) -> Result<Vec<FeedbackReport>>;
}

/// Pick the most recent record; later entries win timestamp ties
fn latest(records: impl IntoIterator<Item = FeedbackReport>) -> Option<FeedbackReport> {
    records.into_iter().fold(None, |best, record| match best {
        Some(best) if best.timestamp > record.timestamp => Some(best),
        _ => Some(record),
    })
}

/// Collapse a patient's records to the latest one per job key
fn latest_per_key(records: impl IntoIterator<Item = FeedbackReport>) -> Vec<FeedbackReport> {
    let mut order: Vec<JobKey> = Vec::new();
    let mut by_key: HashMap<JobKey, FeedbackReport> = HashMap::new();

    for record in records {
        let key = record.key();
        match by_key.get(&key) {
            Some(current) if current.timestamp > record.timestamp => {}
            Some(_) => {
                by_key.insert(key, record);
            }
            None => {
                order.push(key.clone());
                by_key.insert(key, record);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect()
}

/// Open the event log selected by the configuration
pub fn open_event_log(config: &Config) -> Result<Arc<dyn EventLog>> {
    let path = config.event_log_path();
    let log: Arc<dyn EventLog> = match config.event_log.backend {
        EventLogBackend::Jsonl => Arc::new(JsonlEventLog::open(&path)?),
        EventLogBackend::Sqlite => Arc::new(SqliteEventLog::open(&path)?),
    };

    info!(
        backend = ?config.event_log.backend,
        path = %path.display(),
        "Event log opened"
    );

    Ok(log)
}

// ========== JSON lines file ==========

/// Event log stored as one JSON object per line
pub struct JsonlEventLog {
    path: PathBuf,
    /// Serializes appends from this process
    writer: Mutex<File>,
}

impl JsonlEventLog {
    /// Open (or create) the log file at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create event log directory: {}", parent.display())
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open event log: {}", path.display()))?;

        debug!(path = %path.display(), "Opened JSONL event log");

        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every well-formed record in file order
    fn read_all(&self) -> Result<Vec<FeedbackReport>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to open event log: {}", self.path.display())
                })
            }
        };

        let mut records = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| {
                format!("Failed to read event log: {}", self.path.display())
            })?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<FeedbackReport>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = line_no + 1,
                    error = %e,
                    "Skipping malformed event log line"
                ),
            }
        }

        Ok(records)
    }
}

impl EventLog for JsonlEventLog {
    fn append(&self, report: &FeedbackReport) -> Result<()> {
        let mut line = serde_json::to_string(report).context("Failed to serialize report")?;
        line.push('\n');

        let mut file = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("Event log writer lock poisoned"))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to append to event log: {}", self.path.display()))?;

        Ok(())
    }

    fn history_for(&self, key: &JobKey) -> Result<Vec<FeedbackReport>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|record| record.matches(key))
            .collect())
    }

    fn latest_for_patient(&self, patient_id: &str) -> Result<Vec<FeedbackReport>> {
        Ok(latest_per_key(
            self.read_all()?
                .into_iter()
                .filter(|record| record.patient_id == patient_id),
        ))
    }
}

// ========== SQLite ==========

/// Event log stored in an append-only SQLite table
pub struct SqliteEventLog {
    conn: Mutex<Connection>,
}

impl SqliteEventLog {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create event log directory: {}", parent.display())
            })?;
        }

        debug!(path = %path.display(), "Opening event log database");

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        Self::with_connection(conn)
    }

    /// In-memory database, mostly useful for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS feedback_reports (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                patient_id TEXT NOT NULL,
                exercise_id TEXT NOT NULL,
                video_filename TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                status TEXT NOT NULL,
                body TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_feedback_reports_key
            ON feedback_reports(patient_id, exercise_id, video_filename);",
        )
        .context("Failed to create event log schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn query(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<FeedbackReport>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("Event log connection lock poisoned"))?;

        let mut stmt = conn.prepare(sql)?;
        let bodies = stmt
            .query_map(params, |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        bodies
            .iter()
            .map(|body| serde_json::from_str(body).context("Failed to parse stored report"))
            .collect()
    }
}

impl EventLog for SqliteEventLog {
    fn append(&self, report: &FeedbackReport) -> Result<()> {
        let body = serde_json::to_string(report).context("Failed to serialize report")?;
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("Event log connection lock poisoned"))?;

        conn.execute(
            "INSERT INTO feedback_reports
                (patient_id, exercise_id, video_filename, recorded_at, status, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                report.patient_id,
                report.exercise_id,
                report.video_filename,
                // Fixed width so that text ordering matches time ordering
                report.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                report.status.to_string(),
                body,
            ],
        )
        .context("Failed to insert report")?;

        Ok(())
    }

    fn history_for(&self, key: &JobKey) -> Result<Vec<FeedbackReport>> {
        self.query(
            "SELECT body FROM feedback_reports
             WHERE patient_id = ?1 AND exercise_id = ?2 AND video_filename = ?3
             ORDER BY id ASC",
            params![key.patient_id, key.exercise_id, key.video_filename],
        )
    }

    fn latest_for(&self, key: &JobKey) -> Result<Option<FeedbackReport>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("Event log connection lock poisoned"))?;

        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM feedback_reports
                 WHERE patient_id = ?1 AND exercise_id = ?2 AND video_filename = ?3
                 ORDER BY recorded_at DESC, id DESC
                 LIMIT 1",
                params![key.patient_id, key.exercise_id, key.video_filename],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query latest report")?;

        body.map(|body| serde_json::from_str(&body).context("Failed to parse stored report"))
            .transpose()
    }

    fn latest_for_patient(&self, patient_id: &str) -> Result<Vec<FeedbackReport>> {
        Ok(latest_per_key(self.query(
            "SELECT body FROM feedback_reports WHERE patient_id = ?1 ORDER BY id ASC",
            params![patient_id],
        )?))
    }
}

// ========== In memory ==========

/// Event log kept in process memory
#[derive(Default)]
pub struct MemoryEventLog {
    records: Mutex<Vec<FeedbackReport>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record in append order
    pub fn records(&self) -> Vec<FeedbackReport> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventLog for MemoryEventLog {
    fn append(&self, report: &FeedbackReport) -> Result<()> {
        // A panicking writer cannot leave a half-pushed record behind
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());
        Ok(())
    }

    fn history_for(&self, key: &JobKey) -> Result<Vec<FeedbackReport>> {
        Ok(self
            .records()
            .into_iter()
            .filter(|record| record.matches(key))
            .collect())
    }

    fn latest_for_patient(&self, patient_id: &str) -> Result<Vec<FeedbackReport>> {
        Ok(latest_per_key(
            self.records()
                .into_iter()
                .filter(|record| record.patient_id == patient_id),
        ))
    }
}
