//! Append-only line store for sample records.
//!
//! One record per line, `<timestamp>::<value>`, opened in append mode. The
//! log is the single source of truth for history replay and point lookups;
//! reads are plain front-to-back scans of the file.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::record::SampleRecord;

pub struct SampleLog {
    path: PathBuf,
    /// Alternate path, consumed the first time the active path fails.
    fallback: Option<PathBuf>,
    file: File,
    len: usize,
}

impl SampleLog {
    /// Opens (creating if absent) the log at `path`. If that fails and the
    /// operator supplied a fallback path, the fallback is tried once. An
    /// unused fallback is kept so a later [`reopen`](Self::reopen) can still
    /// switch to it.
    pub async fn open(path: &Path, fallback: Option<&Path>) -> Result<Self> {
        match Self::open_at(path).await {
            Ok(mut log) => {
                log.fallback = fallback.map(Path::to_path_buf);
                Ok(log)
            }
            Err(err) => match fallback {
                Some(fallback) => {
                    warn!(
                        path = %path.display(),
                        fallback = %fallback.display(),
                        error = %err,
                        "failed to open sample log, trying fallback path"
                    );
                    Self::open_at(fallback).await
                }
                None => Err(err),
            },
        }
    }

    async fn open_at(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .await
            .with_context(|| format!("failed to open sample log at {}", path.display()))?;
        let len = read_records(path).await?.len();
        Ok(Self {
            path: path.to_path_buf(),
            fallback: None,
            file,
            len,
        })
    }

    /// Number of records appended so far (existing lines counted at open).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record as a newline-terminated line and flushes it.
    pub async fn append(&mut self, record: &SampleRecord) -> io::Result<()> {
        self.file
            .write_all(format!("{record}\n").as_bytes())
            .await?;
        self.file.flush().await?;
        self.len += 1;
        Ok(())
    }

    /// Re-opens the append handle after a write failure. When the active
    /// path can no longer be opened, the log switches to the fallback path
    /// and stays there.
    pub async fn reopen(&mut self) -> Result<()> {
        let reopened = match Self::open_at(&self.path).await {
            Ok(log) => log,
            Err(err) => match self.fallback.take() {
                Some(fallback) => {
                    warn!(
                        path = %self.path.display(),
                        fallback = %fallback.display(),
                        error = %err,
                        "failed to reopen sample log, switching to fallback path"
                    );
                    Self::open_at(&fallback).await?
                }
                None => return Err(err),
            },
        };
        self.path = reopened.path;
        self.file = reopened.file;
        self.len = reopened.len;
        Ok(())
    }

    /// Reads every record, front to back, in append order.
    pub async fn read_all(&self) -> io::Result<Vec<SampleRecord>> {
        read_records(&self.path).await
    }

    /// Reads every record after skipping the first `n`.
    pub async fn read_from(&self, n: usize) -> io::Result<Vec<SampleRecord>> {
        let mut records = self.read_all().await?;
        if n >= records.len() {
            return Ok(Vec::new());
        }
        Ok(records.split_off(n))
    }

    /// Linear scan for the record matching (timestamp, value), returning its
    /// position in the log.
    pub async fn find(&self, timestamp: &str, value: i32) -> io::Result<Option<usize>> {
        let position = self
            .read_all()
            .await?
            .iter()
            .position(|record| record.timestamp == timestamp && record.value == value);
        Ok(position)
    }
}

async fn read_records(path: &Path) -> io::Result<Vec<SampleRecord>> {
    let contents = tokio::fs::read_to_string(path).await?;
    let mut records = Vec::new();
    for line in contents.lines() {
        if line.is_empty() {
            continue;
        }
        match SampleRecord::parse_line(line) {
            Ok(record) => records.push(record),
            // A torn final line from a crashed writer should not poison the
            // whole log.
            Err(err) => warn!(path = %path.display(), error = %err, "skipping malformed log line"),
        }
    }
    Ok(records)
}
