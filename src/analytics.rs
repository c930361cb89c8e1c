//! Turn analytics
//!
//! Every completed or aborted turn produces exactly one `TurnRecord`. Records
//! are kept in memory for session statistics and optionally appended as JSON
//! lines to a log file.

use crate::events::TurnEndReason;
use crate::profile::Authority;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// One analytics record per turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn_id: u64,
    /// Seconds since the UNIX epoch at record time
    pub timestamp: f64,
    pub profile_name: String,
    pub phase_id: Option<String>,
    pub human_transcript: String,
    pub ai_transcript: String,
    pub interrupt_attempts: u32,
    pub interrupts_accepted: u32,
    pub end_reason: TurnEndReason,
    pub authority_mode: Authority,
    pub sensitivity_value: f32,
    pub transcription_ms: f64,
    pub llm_generation_ms: f64,
    pub total_latency_ms: f64,
    pub confidence_score_at_cutoff: f32,
}

/// Aggregates derived from the record history
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub turns: usize,
    pub interrupt_attempts: u32,
    pub interrupts_accepted: u32,
    pub avg_transcription_ms: f64,
    pub avg_llm_generation_ms: f64,
    pub avg_total_latency_ms: f64,
    pub end_reasons: Vec<(String, usize)>,
}

impl SessionStats {
    /// Aggregate a slice of records
    pub fn from_records(records: &[TurnRecord]) -> Self {
        if records.is_empty() {
            return Self::default();
        }
        let n = records.len() as f64;
        let mut end_reasons: Vec<(String, usize)> = Vec::new();
        for record in records {
            let key = record.end_reason.as_str().to_string();
            if let Some(entry) = end_reasons.iter_mut().find(|(k, _)| *k == key) {
                entry.1 += 1;
            } else {
                end_reasons.push((key, 1));
            }
        }
        Self {
            turns: records.len(),
            interrupt_attempts: records.iter().map(|r| r.interrupt_attempts).sum(),
            interrupts_accepted: records.iter().map(|r| r.interrupts_accepted).sum(),
            avg_transcription_ms: records.iter().map(|r| r.transcription_ms).sum::<f64>() / n,
            avg_llm_generation_ms: records.iter().map(|r| r.llm_generation_ms).sum::<f64>() / n,
            avg_total_latency_ms: records.iter().map(|r| r.total_latency_ms).sum::<f64>() / n,
            end_reasons,
        }
    }
}

struct LogSink {
    path: PathBuf,
    file: File,
}

/// Session-scoped analytics stream
pub struct AnalyticsLog {
    session_id: String,
    records: Mutex<Vec<TurnRecord>>,
    sink: Mutex<Option<LogSink>>,
}

impl AnalyticsLog {
    /// In-memory only
    pub fn new() -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            records: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
        }
    }

    /// Append records as JSON lines to `path` in addition to the in-memory history
    pub fn with_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open analytics log {}", path.display()))?;
        let log = Self::new();
        *log.sink.lock().expect("analytics sink poisoned") = Some(LogSink { path, file });
        Ok(log)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Append one record, stamping `timestamp` if the caller left it zero
    pub fn append(&self, mut record: TurnRecord) -> Result<()> {
        if record.timestamp == 0.0 {
            record.timestamp = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        }
        if let Some(sink) = self.sink.lock().expect("analytics sink poisoned").as_mut() {
            let line = serde_json::to_string(&record).context("Failed to serialize turn record")?;
            writeln!(sink.file, "{}", line)
                .with_context(|| format!("Failed to append to {}", sink.path.display()))?;
        }
        debug!(
            turn = record.turn_id,
            reason = record.end_reason.as_str(),
            "Turn logged"
        );
        self.records
            .lock()
            .expect("analytics records poisoned")
            .push(record);
        Ok(())
    }

    /// Snapshot of the record history
    pub fn records(&self) -> Vec<TurnRecord> {
        self.records
            .lock()
            .expect("analytics records poisoned")
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("analytics records poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregate statistics over every logged turn
    pub fn stats(&self) -> SessionStats {
        SessionStats::from_records(&self.records())
    }
}

impl Default for AnalyticsLog {
    fn default() -> Self {
        Self::new()
    }
}
