// Local upload history: an append-only JSON Lines file with one record per
// successful upload. Records are never updated or removed from here.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Lines, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::api::UploadResult;
use crate::error::StorageError;

/// Durable log entry for one completed upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub url: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
}

impl HistoryRecord {
    /// Records only come out of successful uploads.
    pub fn from_upload(
        upload: &UploadResult,
        captured_at: DateTime<Utc>,
        local_path: Option<PathBuf>,
    ) -> Self {
        Self {
            url: upload.url().to_string(),
            captured_at,
            local_path,
        }
    }
}

pub struct HistoryStore {
    path: PathBuf,
    // Held for the whole open-write-flush sequence of an append.
    writer: Mutex<()>,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &HistoryRecord) -> Result<(), StorageError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| self.write_error(source))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.write_error(source))?;
        // One write call per record so a line is never split between writers.
        file.write_all(line.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|source| self.write_error(source))?;

        info!("recorded {} in {}", record.url, self.path.display());
        Ok(())
    }

    /// Iterate over all records in insertion order. Every call starts from
    /// the beginning of the file; a missing file is an empty history.
    pub fn list(&self) -> Result<HistoryIter, StorageError> {
        let lines = match File::open(&self.path) {
            Ok(file) => Some(BufReader::new(file).lines()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no history at {}", self.path.display());
                None
            }
            Err(source) => {
                return Err(StorageError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        Ok(HistoryIter {
            path: self.path.clone(),
            lines,
            line_no: 0,
        })
    }

    /// The last `n` records, oldest first.
    pub fn recent(&self, n: usize) -> Result<Vec<HistoryRecord>, StorageError> {
        // Grows with the file, not with `n`, which comes straight from the
        // command line.
        let mut window = std::collections::VecDeque::new();
        for record in self.list()? {
            let record = record?;
            if n == 0 {
                continue;
            }
            if window.len() == n {
                window.pop_front();
            }
            window.push_back(record);
        }
        Ok(window.into())
    }

    fn write_error(&self, source: std::io::Error) -> StorageError {
        StorageError::Write {
            path: self.path.clone(),
            source,
        }
    }
}

/// Lazy reader over a history file.
pub struct HistoryIter {
    path: PathBuf,
    lines: Option<Lines<BufReader<File>>>,
    line_no: usize,
}

impl Iterator for HistoryIter {
    type Item = Result<HistoryRecord, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        let lines = self.lines.as_mut()?;
        loop {
            let line = match lines.next()? {
                Ok(line) => line,
                Err(source) => {
                    self.lines = None;
                    return Some(Err(StorageError::Read {
                        path: self.path.clone(),
                        source,
                    }));
                }
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(serde_json::from_str(&line).map_err(|e| StorageError::Corrupt {
                path: self.path.clone(),
                line: self.line_no,
                reason: e.to_string(),
            }));
        }
    }
}
