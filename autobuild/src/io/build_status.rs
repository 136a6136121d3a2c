//! Persisted build status: an append-only history plus the checkpoint.
//!
//! `status.jsonl` gets one JSON object per processed revision. A torn final
//! line (crash mid-append) is skipped on read and the next append starts on a
//! fresh line, so earlier records stay readable. `checkpoint.json` is written
//! atomically after each append; if the process dies in between, the history
//! is ahead and wins on the next load.

use std::cell::RefCell;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::build_type::BuildType;
use crate::io::config::write_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// First revision seen by a fresh agent; not built.
    Initial,
    Passed,
    Failed,
    TimedOut,
    /// Commit asked to be skipped.
    Skipped,
    /// A newer revision was built instead.
    Superseded,
    /// The build could not be launched.
    Error,
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BuildStatus::Initial => "initial",
            BuildStatus::Passed => "passed",
            BuildStatus::Failed => "failed",
            BuildStatus::TimedOut => "timed_out",
            BuildStatus::Skipped => "skipped",
            BuildStatus::Superseded => "superseded",
            BuildStatus::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub seq: u64,
    pub revision: String,
    pub build_type: BuildType,
    pub status: BuildStatus,
    pub exit_code: Option<i32>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub revision: String,
    pub seq: u64,
    pub updated_at: DateTime<Utc>,
}

/// What to record for one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub revision: String,
    pub build_type: BuildType,
    pub status: BuildStatus,
    pub exit_code: Option<i32>,
    pub duration: Option<Duration>,
    pub log_path: Option<PathBuf>,
}

impl StatusUpdate {
    pub fn new(revision: &str, build_type: BuildType, status: BuildStatus) -> Self {
        Self {
            revision: revision.to_string(),
            build_type,
            status,
            exit_code: None,
            duration: None,
            log_path: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusStore {
    checkpoint_path: PathBuf,
    history_path: PathBuf,
    /// Last checkpoint read or written through this store.
    last: RefCell<Option<Checkpoint>>,
}

impl StatusStore {
    pub fn new(checkpoint_path: impl Into<PathBuf>, history_path: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_path: checkpoint_path.into(),
            history_path: history_path.into(),
            last: RefCell::new(None),
        }
    }

    /// The newest checkpoint from either file, or `None` on a fresh agent.
    pub fn load_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let stored = if self.checkpoint_path.exists() {
            let contents = fs::read_to_string(&self.checkpoint_path)
                .with_context(|| format!("read {}", self.checkpoint_path.display()))?;
            Some(
                serde_json::from_str::<Checkpoint>(&contents)
                    .with_context(|| format!("parse {}", self.checkpoint_path.display()))?,
            )
        } else {
            None
        };
        let from_history = self.history()?.into_iter().last().map(|record| Checkpoint {
            revision: record.revision,
            seq: record.seq,
            updated_at: record.timestamp,
        });
        let checkpoint = match (stored, from_history) {
            (Some(stored), Some(history)) if history.seq > stored.seq => {
                warn!(
                    stored = %stored.revision,
                    history = %history.revision,
                    "checkpoint behind history, using history"
                );
                Some(history)
            }
            (Some(stored), _) => Some(stored),
            (None, history) => history,
        };
        debug!(checkpoint = ?checkpoint.as_ref().map(|c| &c.revision), "checkpoint loaded");
        self.last.replace(checkpoint.clone());
        Ok(checkpoint)
    }

    /// All readable history records, oldest first.
    pub fn history(&self) -> Result<Vec<StatusRecord>> {
        if !self.history_path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.history_path)
            .with_context(|| format!("read {}", self.history_path.display()))?;
        let mut records = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StatusRecord>(line) {
                Ok(record) => records.push(record),
                Err(err) => warn!(
                    path = %self.history_path.display(),
                    line = idx + 1,
                    err = %err,
                    "skipping unreadable status record"
                ),
            }
        }
        Ok(records)
    }

    /// Append a record and advance the checkpoint to its revision.
    ///
    /// Only the first append of a store reads the files back; later appends
    /// continue from the checkpoint it wrote last.
    pub fn record(&self, update: StatusUpdate) -> Result<StatusRecord> {
        let cached = self.last.borrow().clone();
        let previous = match cached {
            Some(checkpoint) => Some(checkpoint),
            None => self.load_checkpoint()?,
        };
        let seq = previous.as_ref().map_or(1, |checkpoint| checkpoint.seq + 1);
        let record = StatusRecord {
            seq,
            revision: update.revision,
            build_type: update.build_type,
            status: update.status,
            exit_code: update.exit_code,
            timestamp: Utc::now(),
            duration_ms: update.duration.map(|d| d.as_millis() as u64),
            log_path: update.log_path,
        };
        self.append(&record)?;
        let checkpoint = Checkpoint {
            revision: record.revision.clone(),
            seq: record.seq,
            updated_at: record.timestamp,
        };
        self.write_checkpoint(previous.as_ref(), &checkpoint)?;
        self.last.replace(Some(checkpoint));
        debug!(seq, revision = %record.revision, status = ?record.status, "status recorded");
        Ok(record)
    }

    fn append(&self, record: &StatusRecord) -> Result<()> {
        if let Some(parent) = self.history_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(record).context("serialize status record")?;
        line.push('\n');
        if needs_line_break(&self.history_path)? {
            line.insert(0, '\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_path)
            .with_context(|| format!("open {}", self.history_path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", self.history_path.display()))?;
        file.sync_data()
            .with_context(|| format!("sync {}", self.history_path.display()))?;
        Ok(())
    }

    fn write_checkpoint(&self, previous: Option<&Checkpoint>, next: &Checkpoint) -> Result<()> {
        if let Some(previous) = previous
            && next.seq <= previous.seq
        {
            bail!(
                "checkpoint would regress from #{} ({}) to #{} ({})",
                previous.seq,
                previous.revision,
                next.seq,
                next.revision
            );
        }
        let mut buf = serde_json::to_string_pretty(next).context("serialize checkpoint")?;
        buf.push('\n');
        write_atomic(&self.checkpoint_path, &buf)
    }
}

/// True if the file exists, is non-empty and does not end with a newline.
fn needs_line_break(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let len = file
        .metadata()
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))
        .with_context(|| format!("seek {}", path.display()))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)
        .with_context(|| format!("read {}", path.display()))?;
    Ok(last[0] != b'\n')
}

/// Find the newest record for `revision`.
pub fn latest_for<'a>(records: &'a [StatusRecord], revision: &str) -> Result<&'a StatusRecord> {
    records
        .iter()
        .rev()
        .find(|record| record.revision == revision)
        .ok_or_else(|| anyhow!("no status recorded for {revision}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> StatusStore {
        StatusStore::new(dir.join("checkpoint.json"), dir.join("status.jsonl"))
    }

    #[test]
    fn fresh_store_has_no_checkpoint() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        assert!(store.load_checkpoint().expect("load").is_none());
        assert!(store.history().expect("history").is_empty());
    }

    #[test]
    fn records_advance_checkpoint_and_survive_reload() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = store(temp.path());
        first
            .record(StatusUpdate::new("c0", BuildType::CONTINUOUS, BuildStatus::Initial))
            .expect("c0");
        let mut failed = StatusUpdate::new("c1", BuildType::CONTINUOUS, BuildStatus::Failed);
        failed.exit_code = Some(2);
        first.record(failed).expect("c1");

        let reopened = store(temp.path());
        let checkpoint = reopened.load_checkpoint().expect("load").expect("checkpoint");
        assert_eq!(checkpoint.revision, "c1");
        assert_eq!(checkpoint.seq, 2);
        let history = reopened.history().expect("history");
        assert_eq!(history.len(), 2);
        let c1 = latest_for(&history, "c1").expect("c1");
        assert_eq!(c1.status, BuildStatus::Failed);
        assert_eq!(c1.exit_code, Some(2));
    }

    #[test]
    fn torn_trailing_line_does_not_corrupt_history() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store
            .record(StatusUpdate::new("c0", BuildType::CONTINUOUS, BuildStatus::Initial))
            .expect("c0");
        let mut file = OpenOptions::new()
            .append(true)
            .open(temp.path().join("status.jsonl"))
            .expect("open");
        file.write_all(b"{\"seq\":2,\"revision\":\"c1\",\"bui")
            .expect("torn write");

        assert_eq!(store.history().expect("history").len(), 1);
        store
            .record(StatusUpdate::new("c1", BuildType::MILESTONE, BuildStatus::Passed))
            .expect("append after torn line");
        let history = store.history().expect("history");
        let revisions: Vec<&str> = history.iter().map(|r| r.revision.as_str()).collect();
        assert_eq!(revisions, vec!["c0", "c1"]);
        assert_eq!(history[1].build_type, BuildType::MILESTONE);
    }

    #[test]
    fn sequence_continues_across_store_instances() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = store(temp.path());
        for revision in ["c0", "c1", "c2"] {
            first
                .record(StatusUpdate::new(revision, BuildType::CONTINUOUS, BuildStatus::Passed))
                .expect("record");
        }
        let second = store(temp.path());
        let record = second
            .record(StatusUpdate::new("c3", BuildType::DAILY, BuildStatus::Failed))
            .expect("c3");
        assert_eq!(record.seq, 4);
        let seqs: Vec<u64> = second
            .history()
            .expect("history")
            .iter()
            .map(|r| r.seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert!(!needs_line_break(&temp.path().join("status.jsonl")).expect("tail"));
    }

    #[test]
    fn history_ahead_of_checkpoint_wins() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store
            .record(StatusUpdate::new("c0", BuildType::CONTINUOUS, BuildStatus::Initial))
            .expect("c0");
        let stale = fs::read_to_string(temp.path().join("checkpoint.json")).expect("read");
        store
            .record(StatusUpdate::new("c1", BuildType::CONTINUOUS, BuildStatus::Passed))
            .expect("c1");
        // Simulate a crash between the history append and the checkpoint write.
        fs::write(temp.path().join("checkpoint.json"), stale).expect("rewind");

        let checkpoint = store.load_checkpoint().expect("load").expect("checkpoint");
        assert_eq!(checkpoint.revision, "c1");
        assert_eq!(checkpoint.seq, 2);
    }

    #[test]
    fn checkpoint_never_regresses() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let newer = Checkpoint {
            revision: "c5".to_string(),
            seq: 5,
            updated_at: Utc::now(),
        };
        let older = Checkpoint {
            revision: "c3".to_string(),
            seq: 3,
            updated_at: Utc::now(),
        };
        assert!(store.write_checkpoint(Some(&newer), &older).is_err());
        store.write_checkpoint(Some(&older), &newer).expect("advance");
    }
}
