//! Append-only JSON-lines record of every `/generate` interaction.

use crate::{relay::Completion, util::ensure_parent_dir};
use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use std::{
    collections::VecDeque,
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("encode log record: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InteractionRecord {
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub response: String,
    #[serde(default = "unknown_model")]
    pub model: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(default)]
    pub streaming: bool,
}

/// RFC 3339, or an offset-less ISO timestamp taken as UTC.
fn lenient_timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
    let Some(raw) = Option::<String>::deserialize(d)? else {
        return Ok(None);
    };
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .or_else(|_| raw.parse::<NaiveDateTime>().map(|n| n.and_utc()))
        .map(Some)
        .map_err(serde::de::Error::custom)
}

fn unknown_model() -> String {
    "unknown".to_string()
}

fn default_success() -> bool {
    true
}

impl InteractionRecord {
    pub fn new(prompt: &str, c: &Completion, streaming: bool) -> Self {
        Self {
            timestamp: Some(c.timestamp),
            prompt: prompt.to_string(),
            response: c.response.clone(),
            model: c.model.clone(),
            duration_ms: c.duration_ms,
            success: c.success,
            error_reason: c.error_reason.clone(),
            streaming,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LogStats {
    pub total_interactions: u64,
    pub successful_interactions: u64,
    pub failed_interactions: u64,
    pub average_duration_ms: f64,
}

pub struct InteractionLog {
    path: PathBuf,
    // serialises appends so concurrent lines never interleave
    lock: Mutex<()>,
}

impl InteractionLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LogError> {
        let path = path.into();
        let created = ensure_parent_dir(&path).map_err(|source| LogError::Io {
            path: path.clone(),
            source,
        })?;
        if created {
            tracing::info!(path = ?path.parent(), "created log directory");
        }
        Ok(Self { path, lock: Mutex::new(()) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: io::Error) -> LogError {
        LogError::Io { path: self.path.clone(), source }
    }

    pub fn append(&self, record: &InteractionRecord) -> Result<(), LogError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_err(e))?;
        file.write_all(line.as_bytes()).map_err(|e| self.io_err(e))?;
        tracing::debug!(path = ?self.path, "logged interaction");
        Ok(())
    }

    /// Visits every parseable record in file order. A missing file has no records.
    /// Runs without the append lock; a line still being written fails to parse and is skipped.
    fn for_each_record(&self, mut f: impl FnMut(InteractionRecord)) -> Result<(), LogError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(self.io_err(e)),
        };
        for (idx, line) in BufReader::new(file).split(b'\n').enumerate() {
            let line = line.map_err(|e| self.io_err(e))?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<InteractionRecord>(&line) {
                Ok(record) => f(record),
                Err(e) => tracing::warn!(line = idx + 1, error = %e, "failed to parse log line"),
            }
        }
        Ok(())
    }

    /// The last `limit` records, oldest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<InteractionRecord>, LogError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut tail = VecDeque::with_capacity(limit.min(1024));
        self.for_each_record(|record| {
            if tail.len() == limit {
                tail.pop_front();
            }
            tail.push_back(record);
        })?;
        Ok(tail.into())
    }

    pub fn stats(&self) -> Result<LogStats, LogError> {
        let mut stats = LogStats::default();
        let mut total_duration: u64 = 0;
        self.for_each_record(|record| {
            stats.total_interactions += 1;
            if record.success {
                stats.successful_interactions += 1;
            } else {
                stats.failed_interactions += 1;
            }
            total_duration += record.duration_ms;
        })?;
        if stats.total_interactions > 0 {
            let avg = total_duration as f64 / stats.total_interactions as f64;
            stats.average_duration_ms = (avg * 100.0).round() / 100.0;
        }
        Ok(stats)
    }
}
