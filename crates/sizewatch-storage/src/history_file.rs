// JSON-lines history backend. Every append is one line; the file is replayed
// into the in-memory index on open.
use async_trait::async_trait;
use parking_lot::Mutex;
use sizewatch_common::HistoryRecord;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::history::{HistoryIndex, HistoryStore};
use crate::{Result, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncMode {
    #[default]
    None,
    OnAppend,
}

#[derive(Debug)]
pub struct FileHistoryStore {
    path: PathBuf,
    fsync_mode: FsyncMode,
    // Held across the whole append so ts placement and file order agree.
    file: tokio::sync::Mutex<LogFile>,
    index: Mutex<HistoryIndex>,
}

#[derive(Debug)]
struct LogFile {
    file: File,
    // Length covered by complete, indexed lines.
    committed: u64,
}

impl LogFile {
    /// Cut anything past the last committed line, such as the fragment left
    /// by a write that failed partway.
    async fn repair(&mut self, path: &Path) -> Result<()> {
        let len = self.file.metadata().await?.len();
        if len != self.committed {
            tracing::warn!(
                path = %path.display(),
                len,
                committed = self.committed,
                "truncating uncommitted history bytes"
            );
            self.file.set_len(self.committed).await?;
        }
        Ok(())
    }

    async fn write_line(&mut self, line: &[u8], fsync_mode: FsyncMode) -> std::io::Result<()> {
        self.file.write_all(line).await?;
        self.file.flush().await?;
        if fsync_mode == FsyncMode::OnAppend {
            self.file.sync_data().await?;
        }
        Ok(())
    }
}

impl FileHistoryStore {
    /// Open (or create) the history file and replay it.
    ///
    /// A final line without a trailing newline is a torn write from a crash and
    /// is cut off; any other unparsable line is reported as corruption.
    pub async fn open(path: impl AsRef<Path>, fsync_mode: FsyncMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut index = HistoryIndex::default();
        let mut valid_len = 0u64;

        match tokio::fs::read(&path).await {
            Ok(contents) => {
                let mut offset = 0usize;
                for (line_no, line) in contents.split_inclusive(|b| *b == b'\n').enumerate() {
                    let complete = line.ends_with(b"\n");
                    let body = line.strip_suffix(b"\n").unwrap_or(line);
                    if body.iter().all(u8::is_ascii_whitespace) {
                        offset += line.len();
                        if complete {
                            valid_len = offset as u64;
                        }
                        continue;
                    }
                    if !complete {
                        tracing::warn!(
                            path = %path.display(),
                            line = line_no + 1,
                            "dropping torn history line"
                        );
                        break;
                    }
                    match serde_json::from_slice::<HistoryRecord>(body) {
                        Ok(record) => {
                            index.insert(record);
                            offset += line.len();
                            valid_len = offset as u64;
                        }
                        Err(err) => {
                            return Err(StorageError::Corruption(format!(
                                "{} line {}: {err}",
                                path.display(),
                                line_no + 1
                            )));
                        }
                    }
                }
                if valid_len < contents.len() as u64 {
                    let file = OpenOptions::new().write(true).open(&path).await?;
                    file.set_len(valid_len).await?;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        tracing::info!(
            path = %path.display(),
            records = index.len(),
            "history file opened"
        );
        Ok(Self {
            path,
            fsync_mode,
            file: tokio::sync::Mutex::new(LogFile {
                file,
                committed: valid_len,
            }),
            index: Mutex::new(index),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn append(&self, mut record: HistoryRecord) -> Result<HistoryRecord> {
        let mut file = self.file.lock().await;
        file.repair(&self.path).await?;
        record.ts = self.index.lock().next_free_ts(&record.subject, record.ts);
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        if let Err(err) = file.write_line(&line, self.fsync_mode).await {
            // A failed rollback is retried by the next append's repair.
            if let Err(rollback) = file.file.set_len(file.committed).await {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %rollback,
                    "failed to roll back partial history line"
                );
            }
            return Err(err.into());
        }
        file.committed += line.len() as u64;
        // Only index what reached the file.
        self.index.lock().insert(record.clone());
        Ok(record)
    }

    async fn range(&self, subject: &str, from_ts: u64, to_ts: u64) -> Result<Vec<HistoryRecord>> {
        Ok(self.index.lock().range(subject, from_ts, to_ts))
    }

    async fn largest(&self, subject: &str) -> Result<Option<HistoryRecord>> {
        Ok(self.index.lock().largest(subject))
    }

    async fn latest(&self, subject: &str) -> Result<Option<HistoryRecord>> {
        Ok(self.index.lock().latest(subject))
    }

    fn backend_name(&self) -> &'static str {
        "file"
    }

    fn is_durable(&self) -> bool {
        true
    }
}
