use crate::error::LogWriteError;
use crate::record::IngestRecord;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};

/// One journal line: everything needed to reconstruct an arrival after a
/// crash. Appended before the record becomes visible to the accumulator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub sequence: u64,
    pub received_at: DateTime<Utc>,
    pub topic: String,
    pub content: String,
}

impl JournalEntry {
    pub fn from_record(record: &IngestRecord, topic: &str) -> Self {
        Self {
            sequence: record.sequence,
            received_at: record.created_at,
            topic: topic.to_string(),
            content: record.content.clone(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum JournalCommand {
    Append {
        entry: JournalEntry,
        respond_to: oneshot::Sender<Result<(), LogWriteError>>,
    },
}

/// Cheap clonable handle to the journal writer thread.
#[derive(Clone)]
pub struct JournalHandle {
    tx: mpsc::UnboundedSender<JournalCommand>,
}

impl JournalHandle {
    #[cfg(test)]
    pub(crate) fn from_sender(tx: mpsc::UnboundedSender<JournalCommand>) -> Self {
        Self { tx }
    }

    /// Appends one entry and resolves once the line is on stable storage.
    /// `LogWriteError::Closed` means the writer thread is gone; callers treat
    /// that as fatal.
    pub async fn append(&self, entry: JournalEntry) -> Result<(), LogWriteError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(JournalCommand::Append {
                entry,
                respond_to: tx,
            })
            .map_err(|_| LogWriteError::Closed)?;
        rx.await.map_err(|_| LogWriteError::Closed)?
    }
}

/// Opens (or creates) the journal file and spawns the writer thread. Writes
/// are serialized by the thread, so sequence order in the file matches send
/// order even if callers were ever concurrent.
pub fn spawn_journal_writer(path: PathBuf) -> Result<JournalHandle> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open journal {}", path.display()))?;

    let (tx, mut rx) = mpsc::unbounded_channel::<JournalCommand>();

    std::thread::Builder::new()
        .name("journal-writer".to_string())
        .spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    JournalCommand::Append { entry, respond_to } => {
                        let _ = respond_to.send(append_entry(&mut file, &entry));
                    }
                }
            }
            file.sync_data().ok();
        })
        .context("failed to spawn journal writer thread")?;

    Ok(JournalHandle { tx })
}

fn append_entry(file: &mut fs::File, entry: &JournalEntry) -> Result<(), LogWriteError> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    file.write_all(&line)?;
    file.sync_data()?;
    Ok(())
}

/// Reads the journal back in file order. A truncated or corrupt tail line
/// (torn write during a crash) ends the replay cleanly; everything before it
/// is returned.
pub fn replay(path: &Path) -> Result<Vec<JournalEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line.context("read journal line")?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                tracing::warn!(error=%err, recovered = entries.len(), "journal replay stopped at corrupt line");
                break;
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(sequence: u64, content: &str) -> JournalEntry {
        JournalEntry {
            sequence,
            received_at: Utc::now(),
            topic: format!("ingest/dev-1/{sequence}"),
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn replay_returns_appended_entries_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.log");
        let journal = spawn_journal_writer(path.clone()).unwrap();

        for sequence in 1..=5u64 {
            journal.append(entry(sequence, "payload")).await.unwrap();
        }
        drop(journal);

        let entries = replay(&path).unwrap();
        assert_eq!(entries.len(), 5);
        let sequences: Vec<u64> = entries.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn replay_skips_torn_tail_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.log");
        let journal = spawn_journal_writer(path.clone()).unwrap();
        let first = entry(1, "kept");
        let second = entry(2, "also kept");
        journal.append(first.clone()).await.unwrap();
        journal.append(second.clone()).await.unwrap();
        drop(journal);

        // Simulate a crash mid-append: a partial JSON object at the tail.
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"sequence\":3,\"received").unwrap();
        drop(file);

        let entries = replay(&path).unwrap();
        assert_eq!(entries, vec![first, second]);
    }

    #[test]
    fn replay_of_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let entries = replay(&dir.path().join("absent.log")).unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn append_on_stopped_writer_reports_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let journal = JournalHandle { tx };
        let err = journal.append(entry(1, "x")).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
