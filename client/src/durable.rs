//! Durable command log storage.
//!
//! The queue appends a record when a command is enqueued, settled or
//! cancelled, and replays the log on start to recover commands that were in
//! the queue when the process died.
//!
//! The queue never touches the log directly while it holds its own lock.
//! Records go through a `LogWriter`, which performs the file I/O in order on
//! the blocking pool.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tether_engine::LogRecord;
use tokio::sync::{mpsc, oneshot};

use crate::error::{ClientError, Result};

/// Append-only storage for [`LogRecord`]s.
pub trait DurableLog: Send + Sync + 'static {
    /// Append one record. Must be durable once this returns.
    fn append(&self, record: &LogRecord) -> Result<()>;

    /// Every readable record, oldest first.
    ///
    /// Unreadable records are skipped, losing only the command they belonged to.
    fn load(&self) -> Result<Vec<LogRecord>>;

    /// Drop every record. Called when the queue has nothing left to recover.
    fn truncate(&self) -> Result<()>;
}

enum LogOp {
    Append(LogRecord),
    Truncate,
    Sync(oneshot::Sender<()>),
}

/// Ordered, non-blocking front end to a [`DurableLog`].
#[derive(Debug, Clone)]
pub(crate) struct LogWriter {
    tx: mpsc::UnboundedSender<LogOp>,
}

impl LogWriter {
    /// Start the writer task. Must be called from within a Tokio runtime.
    pub(crate) fn spawn(log: Arc<dyn DurableLog>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_records(log, rx));
        Self { tx }
    }

    pub(crate) fn append(&self, record: LogRecord) {
        self.submit(LogOp::Append(record));
    }

    pub(crate) fn truncate(&self) {
        self.submit(LogOp::Truncate);
    }

    /// Resolves once every operation submitted before it has completed.
    pub(crate) async fn sync(&self) {
        let (done, rx) = oneshot::channel();
        self.submit(LogOp::Sync(done));
        let _ = rx.await;
    }

    fn submit(&self, op: LogOp) {
        if self.tx.send(op).is_err() {
            tracing::error!("command log writer stopped, record lost");
        }
    }
}

async fn write_records(log: Arc<dyn DurableLog>, mut rx: mpsc::UnboundedReceiver<LogOp>) {
    while let Some(op) = rx.recv().await {
        let log = log.clone();
        let (op_name, result) = match op {
            LogOp::Sync(done) => {
                let _ = done.send(());
                continue;
            }
            LogOp::Append(record) => (
                "append",
                tokio::task::spawn_blocking(move || log.append(&record)).await,
            ),
            LogOp::Truncate => ("truncate", tokio::task::spawn_blocking(move || log.truncate()).await),
        };
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(op = op_name, error = %e, "command log write failed"),
            Err(e) => tracing::error!(op = op_name, error = %e, "command log task failed"),
        }
    }
}

/// JSON-lines log file.
#[derive(Debug)]
pub struct FileLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileLog {
    /// Use the log file at `path`, creating parent directories as needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DurableLog for FileLog {
    fn append(&self, record: &LogRecord) -> Result<()> {
        let line = record.to_line().map_err(ClientError::Queue)?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        file.sync_data()?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<LogRecord>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match LogRecord::from_line(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::error!(
                        path = %self.path.display(),
                        line = index + 1,
                        error = %e,
                        "skipping unreadable command log record"
                    );
                }
            }
        }
        Ok(records)
    }

    fn truncate(&self) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        File::create(&self.path)?;
        Ok(())
    }
}

/// In-memory log. Survives nothing, but lets a queue be restarted in tests.
#[derive(Debug, Default)]
pub struct MemoryLog {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DurableLog for MemoryLog {
    fn append(&self, record: &LogRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }

    fn load(&self) -> Result<Vec<LogRecord>> {
        Ok(self.records())
    }

    fn truncate(&self) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}
