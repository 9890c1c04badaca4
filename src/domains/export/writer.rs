use async_trait::async_trait;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::domains::export::types::OutputLine;
use crate::errors::{ExportError, ExportResult};

const WRITE_BUFFER_BYTES: usize = 256 * 1024;

/// Append-only destination shared by every page of a job.
///
/// Pages never write concurrently. A page's lines become durable only once
/// `commit` returns; `rollback` discards whatever was written since the last
/// commit and never touches committed pages.
#[async_trait]
pub trait LineSink: Send {
    /// Queue one line. Suspends while the write queue is full.
    async fn write_line(&mut self, line: OutputLine) -> ExportResult<()>;

    /// Flush everything written so far and mark it committed.
    /// Returns the committed length in bytes.
    async fn commit(&mut self) -> ExportResult<u64>;

    /// Drop everything written since the last commit.
    /// Returns the committed length in bytes.
    async fn rollback(&mut self) -> ExportResult<u64>;
}

/// How an output file is opened at job start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SinkMode {
    /// Keep existing content and append after it
    Append,
    /// Start from an empty file, then append
    Truncate,
}

impl Default for SinkMode {
    fn default() -> Self {
        Self::Truncate
    }
}

/// Totals reported when a sink is closed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkStats {
    pub lines_written: usize,
    pub bytes_written: u64,
    pub committed_len: u64,
    pub rollbacks: usize,
}

enum SinkCommand {
    Line(OutputLine),
    Commit(oneshot::Sender<io::Result<u64>>),
    Rollback(oneshot::Sender<io::Result<u64>>),
}

/// File sink whose writes are performed by a dedicated task fed through a
/// bounded channel, so a slow disk pushes back on the row producer instead
/// of growing an unbounded queue.
pub struct FileSink {
    path: PathBuf,
    sender: Option<mpsc::Sender<SinkCommand>>,
    worker: Option<JoinHandle<io::Result<SinkStats>>>,
}

impl FileSink {
    /// Open `path` (creating parent directories) with room for `capacity`
    /// queued lines.
    pub async fn open(path: impl AsRef<Path>, mode: SinkMode, capacity: usize) -> ExportResult<Self> {
        if capacity == 0 {
            return Err(ExportError::config("sink capacity must be positive"));
        }

        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        if mode == SinkMode::Truncate {
            File::create(&path).await?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        let start_len = file.metadata().await?.len();

        log::debug!(
            "Opened sink {} ({:?}, {} bytes present, capacity {})",
            path.display(),
            mode,
            start_len,
            capacity
        );

        Ok(Self::spawn(path, file, start_len, capacity))
    }

    fn spawn<W>(path: PathBuf, target: W, start_len: u64, capacity: usize) -> Self
    where
        W: SinkTarget + 'static,
    {
        let (sender, receiver) = mpsc::channel(capacity);
        let worker = tokio::spawn(run_writer(target, start_len, receiver));

        Self {
            path,
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush outstanding writes, sync the file to disk and stop the writer task.
    pub async fn close(mut self) -> ExportResult<SinkStats> {
        self.sender = None;
        let worker = self
            .worker
            .take()
            .ok_or_else(|| ExportError::SinkClosed("sink already closed".to_string()))?;

        let stats = worker
            .await
            .map_err(|e| ExportError::SinkClosed(format!("writer task failed: {}", e)))??;

        log::debug!(
            "Closed sink {}: {} lines, {} bytes",
            self.path.display(),
            stats.lines_written,
            stats.committed_len
        );
        Ok(stats)
    }

    async fn send(&mut self, command: SinkCommand) -> ExportResult<()> {
        let delivered = match self.sender.as_ref() {
            Some(sender) => sender.send(command).await.is_ok(),
            None => return Err(ExportError::SinkClosed(format!("{} is closed", self.path.display()))),
        };

        if delivered {
            Ok(())
        } else {
            Err(self.worker_failure().await)
        }
    }

    async fn request(&mut self, command: impl FnOnce(oneshot::Sender<io::Result<u64>>) -> SinkCommand) -> ExportResult<u64> {
        let (ack, done) = oneshot::channel();
        self.send(command(ack)).await?;

        match done.await {
            Ok(Ok(len)) => Ok(len),
            Ok(Err(e)) => Err(ExportError::Io(e)),
            Err(_) => Err(self.worker_failure().await),
        }
    }

    /// The writer task has stopped; collect the reason.
    async fn worker_failure(&mut self) -> ExportError {
        self.sender = None;
        match self.worker.take() {
            Some(worker) => match worker.await {
                Ok(Err(e)) => ExportError::Io(e),
                Ok(Ok(_)) => ExportError::SinkClosed(format!("writer for {} stopped", self.path.display())),
                Err(e) => ExportError::SinkClosed(format!("writer task failed: {}", e)),
            },
            None => ExportError::SinkClosed(format!("{} is closed", self.path.display())),
        }
    }
}

#[async_trait]
impl LineSink for FileSink {
    async fn write_line(&mut self, line: OutputLine) -> ExportResult<()> {
        self.send(SinkCommand::Line(line)).await
    }

    async fn commit(&mut self) -> ExportResult<u64> {
        self.request(SinkCommand::Commit).await
    }

    async fn rollback(&mut self) -> ExportResult<u64> {
        self.request(SinkCommand::Rollback).await
    }
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink")
            .field("path", &self.path)
            .field("open", &self.sender.is_some())
            .finish()
    }
}

/// Byte destination behind the writer task
#[async_trait]
trait SinkTarget: AsyncWrite + Unpin + Send {
    /// Cut the destination back to `len` bytes.
    async fn truncate(&mut self, len: u64) -> io::Result<()>;

    async fn sync(&mut self) -> io::Result<()>;
}

#[async_trait]
impl SinkTarget for File {
    async fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len).await
    }

    async fn sync(&mut self) -> io::Result<()> {
        self.sync_all().await
    }
}

fn copy_error(e: &io::Error) -> io::Error {
    io::Error::new(e.kind(), e.to_string())
}

async fn truncate_to<W: SinkTarget>(writer: &mut BufWriter<W>, len: u64) -> io::Result<()> {
    writer.flush().await?;
    writer.get_mut().truncate(len).await
}

/// Drop whatever part of an uncommitted page already reached the target.
/// Buffered bytes are discarded with the writer.
async fn abandon<W: SinkTarget>(writer: &mut BufWriter<W>, committed_len: u64, cause: io::Error) -> io::Error {
    match writer.get_mut().truncate(committed_len).await {
        Ok(()) => log::warn!(
            "Writer failed, output cut back to {} committed bytes: {}",
            committed_len,
            cause
        ),
        Err(e) => log::error!(
            "Writer failed ({}) and truncating to {} bytes failed too: {}",
            cause,
            committed_len,
            e
        ),
    }
    cause
}

async fn run_writer<W: SinkTarget>(
    target: W,
    start_len: u64,
    receiver: mpsc::Receiver<SinkCommand>,
) -> io::Result<SinkStats> {
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER_BYTES, target);
    let mut stats = SinkStats {
        committed_len: start_len,
        ..SinkStats::default()
    };
    let mut pending_bytes: u64 = 0;
    let mut pending_lines: usize = 0;
    let mut commands = ReceiverStream::new(receiver);

    while let Some(command) = commands.next().await {
        match command {
            SinkCommand::Line(line) => {
                if let Err(e) = writer.write_all(line.as_str().as_bytes()).await {
                    return Err(abandon(&mut writer, stats.committed_len, e).await);
                }
                pending_bytes += line.len() as u64;
                pending_lines += 1;
            }
            SinkCommand::Commit(ack) => match writer.flush().await {
                Ok(()) => {
                    stats.committed_len += pending_bytes;
                    stats.bytes_written += pending_bytes;
                    stats.lines_written += pending_lines;
                    pending_bytes = 0;
                    pending_lines = 0;
                    let _ = ack.send(Ok(stats.committed_len));
                }
                Err(e) => {
                    let _ = ack.send(Err(copy_error(&e)));
                    return Err(abandon(&mut writer, stats.committed_len, e).await);
                }
            },
            SinkCommand::Rollback(ack) => {
                match truncate_to(&mut writer, stats.committed_len).await {
                    Ok(()) => {
                        log::debug!(
                            "Rolled back {} uncommitted lines ({} bytes)",
                            pending_lines,
                            pending_bytes
                        );
                        pending_bytes = 0;
                        pending_lines = 0;
                        stats.rollbacks += 1;
                        let _ = ack.send(Ok(stats.committed_len));
                    }
                    Err(e) => {
                        let _ = ack.send(Err(copy_error(&e)));
                        return Err(abandon(&mut writer, stats.committed_len, e).await);
                    }
                }
            }
        }
    }

    // Sender dropped: anything still pending is kept.
    writer.flush().await?;
    writer.get_mut().sync().await?;
    stats.committed_len += pending_bytes;
    stats.bytes_written += pending_bytes;
    stats.lines_written += pending_lines;
    Ok(stats)
}
