//! Durable lease state.
//!
//! The store writes one [`LeaseRecord`] per state change through a
//! [`LeaseBackend`]. [`JournalFile`] appends JSON lines and syncs each write
//! to disk before returning; on load the last record for an address wins.
//! A process that writes the journal holds an exclusive lock on a sibling
//! `.lock` file, so a second writer is refused instead of writing to a file
//! the first one no longer sees. [`MemoryBackend`] keeps records in memory
//! for tests and dry runs.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::lease::{Lease, Reservation};

/// One journal line: the lease plus any run-time reservation on its address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    #[serde(flatten)]
    pub lease: Lease,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation: Option<Reservation>,
}

#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// Every record written so far, oldest first.
    async fn load(&self) -> Result<Vec<LeaseRecord>>;

    /// Durably appends one record. Returns only after the write is synced.
    async fn append(&self, record: &LeaseRecord) -> Result<()>;

    /// Atomically replaces the stored history with `records`.
    async fn compact(&self, records: &[LeaseRecord]) -> Result<()>;
}

/// Append-only JSON-lines lease journal.
#[derive(Debug)]
pub struct JournalFile {
    path: PathBuf,
    writer: Mutex<Option<File>>,
    _lock: Option<std::fs::File>,
}

impl JournalFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: Mutex::new(None),
            _lock: None,
        }
    }

    /// Opens the journal for writing, holding `<path>.lock` until dropped.
    ///
    /// # Errors
    ///
    /// [`Error::JournalInUse`] when another journal holds the lock, for
    /// example a running server.
    pub fn open_exclusive<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut journal = Self::new(path);
        let lock = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(journal.sibling("lock"))?;

        match lock.try_lock() {
            Ok(()) => {}
            Err(std::fs::TryLockError::WouldBlock) => {
                return Err(Error::JournalInUse(journal.path.clone()));
            }
            Err(std::fs::TryLockError::Error(error)) => return Err(error.into()),
        }

        debug!("Locked lease journal {}", journal.path.display());
        journal._lock = Some(lock);
        Ok(journal)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, extension: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".");
        name.push(extension);
        PathBuf::from(name)
    }

    fn temp_path(&self) -> PathBuf {
        self.sibling("tmp")
    }

    async fn open_append(&self) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        Ok(file)
    }

    fn encode_line(record: &LeaseRecord) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        Ok(line)
    }
}

#[async_trait]
impl LeaseBackend for JournalFile {
    async fn load(&self) -> Result<Vec<LeaseRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let mut records = Vec::new();
        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<LeaseRecord>(line) {
                Ok(record) => records.push(record),
                Err(error) => warn!(
                    "Skipping unreadable line {} of {}: {}",
                    number + 1,
                    self.path.display(),
                    error
                ),
            }
        }

        debug!("Loaded {} lease records from {}", records.len(), self.path.display());
        Ok(records)
    }

    async fn append(&self, record: &LeaseRecord) -> Result<()> {
        let line = Self::encode_line(record)?;
        let mut writer = self.writer.lock().await;

        if writer.is_none() {
            *writer = Some(self.open_append().await?);
        }
        let Some(file) = writer.as_mut() else {
            return Err(Error::Persistence("journal is not open".to_string()));
        };

        let result = async {
            file.write_all(&line).await?;
            file.flush().await?;
            file.sync_data().await
        }
        .await;

        if let Err(error) = result {
            // reopen next time; the handle may be past a short write
            *writer = None;
            return Err(error.into());
        }

        Ok(())
    }

    async fn compact(&self, records: &[LeaseRecord]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let temp_path = self.temp_path();

        let mut contents = Vec::new();
        for record in records {
            contents.extend_from_slice(&Self::encode_line(record)?);
        }

        let mut temp = File::create(&temp_path).await?;
        temp.write_all(&contents).await?;
        temp.flush().await?;
        temp.sync_all().await?;
        drop(temp);

        tokio::fs::rename(&temp_path, &self.path).await?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty())
            && let Ok(dir) = File::open(parent).await
            && let Err(error) = dir.sync_all().await
        {
            debug!("Could not sync directory {}: {}", parent.display(), error);
        }

        *writer = None;
        debug!("Compacted {} to {} records", self.path.display(), records.len());
        Ok(())
    }
}

/// In-memory backend; can be told to fail writes.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: Mutex<Vec<LeaseRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<LeaseRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn records(&self) -> Vec<LeaseRecord> {
        self.records.lock().await.clone()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("simulated write failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseBackend for MemoryBackend {
    async fn load(&self) -> Result<Vec<LeaseRecord>> {
        Ok(self.records.lock().await.clone())
    }

    async fn append(&self, record: &LeaseRecord) -> Result<()> {
        self.check_writable()?;
        self.records.lock().await.push(record.clone());
        Ok(())
    }

    async fn compact(&self, records: &[LeaseRecord]) -> Result<()> {
        self.check_writable()?;
        *self.records.lock().await = records.to_vec();
        Ok(())
    }
}
