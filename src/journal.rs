use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::warn;

use crate::config::AppConfig;
use crate::errors::AppResult;

const DEFAULT_BATCH: usize = 32;
const DEFAULT_MAX_PENDING: usize = 4096;

/// Append-only JSONL record of what happened during collection runs.
///
/// Each line is `{"ts": ..., "event": ..., <payload fields>}`. Lines are
/// encoded on `record` and appended in batches. Before a batch would push the
/// active file past `max_bytes` it is shifted to `<stem>.1.jsonl`, older
/// generations move up by one and the oldest beyond `max_files` is dropped.
/// While appends keep failing at most `max_pending` lines are held; older ones
/// are discarded first.
#[derive(Clone)]
pub struct RunJournal {
    path: PathBuf,
    pending: Arc<Mutex<PendingLines>>,
    batch: usize,
    max_pending: usize,
    max_bytes: u64,
    max_files: usize,
    #[cfg(test)]
    failures: Arc<std::sync::atomic::AtomicUsize>,
}

#[derive(Default)]
struct PendingLines {
    lines: Vec<String>,
    bytes: u64,
}

impl RunJournal {
    pub fn open<P: AsRef<Path>>(path: P, max_bytes: u64, max_files: usize) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        append_handle(&path)?;
        Ok(Self {
            path,
            pending: Arc::new(Mutex::new(PendingLines::default())),
            batch: DEFAULT_BATCH,
            max_pending: DEFAULT_MAX_PENDING,
            max_bytes: max_bytes.max(1),
            max_files: max_files.max(1),
            #[cfg(test)]
            failures: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        })
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        Self::open(
            config.journal_path(),
            config.journal_max_bytes,
            config.journal_max_files,
        )
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Never fails: an unwritable journal is logged and the lines are kept
    /// for the next attempt.
    pub fn record(&self, event: &str, payload: Value) {
        let line = encode_line(event, payload);
        let mut pending = self.pending.lock();
        pending.bytes += line.len() as u64 + 1;
        pending.lines.push(line);
        if pending.lines.len() >= self.batch {
            if let Err(err) = self.append_locked(&mut pending) {
                warn!(error = %err, path = %self.path.display(), "run journal append failed");
            }
        }
        let overflow = pending.lines.len().saturating_sub(self.max_pending);
        if overflow > 0 {
            let dropped: u64 = pending
                .lines
                .drain(..overflow)
                .map(|line| line.len() as u64 + 1)
                .sum();
            pending.bytes -= dropped;
            warn!(
                dropped = overflow,
                kept = pending.lines.len(),
                path = %self.path.display(),
                "run journal buffer full; dropped oldest lines"
            );
        }
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut pending = self.pending.lock();
        self.append_locked(&mut pending)
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().lines.len()
    }

    fn append_locked(&self, pending: &mut PendingLines) -> AppResult<()> {
        if pending.lines.is_empty() {
            return Ok(());
        }
        let current = fs::metadata(&self.path).map(|meta| meta.len()).unwrap_or(0);
        if current > 0 && current + pending.bytes > self.max_bytes {
            self.rotate()?;
        }
        #[cfg(test)]
        self.injected_failure()?;

        let mut writer = BufWriter::new(append_handle(&self.path)?);
        for line in &pending.lines {
            writeln!(writer, "{line}")?;
        }
        writer.flush()?;
        pending.lines.clear();
        pending.bytes = 0;
        Ok(())
    }

    fn rotate(&self) -> io::Result<()> {
        if self.max_files == 1 {
            File::create(&self.path)?;
            return Ok(());
        }
        let oldest = self.generation(self.max_files - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for generation in (1..self.max_files - 1).rev() {
            let from = self.generation(generation);
            if from.exists() {
                fs::rename(&from, self.generation(generation + 1))?;
            }
        }
        fs::rename(&self.path, self.generation(1))
    }

    /// `run-journal.jsonl` -> `run-journal.<n>.jsonl`.
    fn generation(&self, n: usize) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "run-journal".into());
        self.path.with_file_name(format!("{stem}.{n}.jsonl"))
    }
}

fn append_handle(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn encode_line(event: &str, payload: Value) -> String {
    let mut line = Map::new();
    line.insert("ts".into(), Value::String(Utc::now().to_rfc3339()));
    line.insert("event".into(), Value::String(event.to_string()));
    match payload {
        Value::Object(fields) => line.extend(fields),
        Value::Null => {}
        other => {
            line.insert("payload".into(), other);
        }
    }
    Value::Object(line).to_string()
}

#[cfg(test)]
impl RunJournal {
    /// Makes the next `n` appends fail as if the disk were full.
    pub fn fail_next_appends(&self, n: usize) {
        self.failures.store(n, std::sync::atomic::Ordering::SeqCst);
    }

    fn injected_failure(&self) -> io::Result<()> {
        use std::sync::atomic::Ordering;
        let hit = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hit {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "simulated disk full"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    fn lines(path: &Path) -> Vec<Value> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn flattens_payload_into_each_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run-journal.jsonl");
        {
            let journal = RunJournal::open(&path, 1 << 20, 3).unwrap();
            journal.record("run_started", json!({ "cells_total": 4 }));
            journal.flush().unwrap();
        }
        let journal = RunJournal::open(&path, 1 << 20, 3).unwrap();
        journal.record("cell_saturated", json!({ "cell": "r0_c1", "returned": 60 }));
        journal.flush().unwrap();

        let events = lines(&path);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["event"], "run_started");
        assert_eq!(events[0]["cells_total"], 4);
        assert_eq!(events[1]["cell"], "r0_c1");
        assert!(events[1]["ts"].is_string());
    }

    #[test]
    fn rotates_into_numbered_generations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run-journal.jsonl");
        let journal = RunJournal::open(&path, 80, 3).unwrap().with_batch(1);
        for i in 0..5 {
            journal.record("cell_failed", json!({ "cell": format!("r{i}_c0"), "error": "timeout after 30s" }));
        }

        assert_eq!(lines(&path)[0]["cell"], "r4_c0");
        assert_eq!(lines(&dir.path().join("run-journal.1.jsonl"))[0]["cell"], "r3_c0");
        assert_eq!(lines(&dir.path().join("run-journal.2.jsonl"))[0]["cell"], "r2_c0");
        assert!(!dir.path().join("run-journal.3.jsonl").exists());
    }

    #[test]
    fn failed_appends_keep_lines_pending() {
        let dir = tempdir().unwrap();
        let journal = RunJournal::open(dir.path().join("run-journal.jsonl"), 1 << 20, 2)
            .unwrap()
            .with_batch(1);
        journal.fail_next_appends(1);

        journal.record("detail_failed", json!({ "place_id": "p1" }));
        assert_eq!(journal.pending(), 1);
        journal.flush().unwrap();
        assert_eq!(journal.pending(), 0);
        assert_eq!(lines(journal.path())[0]["place_id"], "p1");
    }

    #[test]
    fn unwritable_journal_keeps_only_newest_lines() {
        let dir = tempdir().unwrap();
        let journal = RunJournal::open(dir.path().join("run-journal.jsonl"), 1 << 20, 2)
            .unwrap()
            .with_batch(1)
            .with_max_pending(3);
        journal.fail_next_appends(6);

        for i in 0..6 {
            journal.record("cell_failed", json!({ "cell": format!("r{i}_c0") }));
        }
        assert_eq!(journal.pending(), 3);
        journal.flush().unwrap();

        let cells: Vec<_> = lines(journal.path())
            .iter()
            .map(|line| line["cell"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(cells, vec!["r3_c0", "r4_c0", "r5_c0"]);
    }
}
