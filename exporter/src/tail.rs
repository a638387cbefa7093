//! Tail sources
//!
//! A [`LineSource`] yields lines in delivery order. [`Tailer`] follows a file
//! on disk by polling: appended bytes are split into lines, a truncated file
//! is re-read from the start, and a replaced file (rotation) is reopened.

use crate::error::{ExporterError, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Source of log lines
#[async_trait]
pub trait LineSource: Send {
    /// Next line without its terminator, or `None` once the source is exhausted
    async fn next_line(&mut self) -> Option<String>;
}

#[async_trait]
impl LineSource for mpsc::Receiver<String> {
    async fn next_line(&mut self) -> Option<String> {
        self.recv().await
    }
}

/// Tailing behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailConfig {
    /// Keep waiting for appended data at end of file
    pub follow: bool,
    /// Reattach when the file is replaced or truncated
    pub reopen: bool,
    /// How often the file is inspected for changes
    pub poll_interval: Duration,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            follow: true,
            reopen: true,
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// File identity used to detect replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileId {
    dev: u64,
    ino: u64,
}

#[cfg(unix)]
fn file_id(meta: &std::fs::Metadata) -> Option<FileId> {
    use std::os::unix::fs::MetadataExt;
    Some(FileId {
        dev: meta.dev(),
        ino: meta.ino(),
    })
}

#[cfg(not(unix))]
fn file_id(_meta: &std::fs::Metadata) -> Option<FileId> {
    None
}

/// Polling file tailer
pub struct Tailer {
    path: PathBuf,
    config: TailConfig,
    file: File,
    id: Option<FileId>,
    offset: u64,
    /// Reused read buffer, one chunk long
    chunk: BytesMut,
    partial: BytesMut,
    pending: VecDeque<String>,
    /// Path vanished at the last check; reopen as soon as it reappears
    detached: bool,
    exhausted: bool,
}

impl Tailer {
    /// Open a file for tailing from its first byte
    ///
    /// # Errors
    /// Returns `ExporterError::Tail` if the file cannot be opened.
    pub async fn open(path: impl AsRef<Path>, config: TailConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (file, id) = open_with_id(&path).await?;
        info!(path = %path.display(), "Tailing file");

        Ok(Self {
            path,
            config,
            file,
            id,
            offset: 0,
            chunk: BytesMut::zeroed(READ_CHUNK_BYTES),
            partial: BytesMut::new(),
            pending: VecDeque::new(),
            detached: false,
            exhausted: false,
        })
    }

    /// Read chunks until at least one complete line is pending or the file
    /// has no more data; returns the number of bytes read
    async fn read_available(&mut self) -> std::io::Result<usize> {
        let mut total = 0;
        while self.pending.is_empty() {
            let n = self.file.read(&mut self.chunk[..]).await?;
            if n == 0 {
                break;
            }
            total += n;
            self.offset += n as u64;
            self.partial.extend_from_slice(&self.chunk[..n]);
            self.split_lines();
        }
        Ok(total)
    }

    fn split_lines(&mut self) {
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let raw = self.partial.split_to(pos + 1);
            self.pending.push_back(decode_line(&raw[..pos]));
        }
    }

    fn flush_partial(&mut self) {
        if !self.partial.is_empty() {
            let raw = self.partial.split();
            self.pending.push_back(decode_line(&raw));
        }
    }

    /// Reattach if the path now points at a different or shorter file
    async fn check_reopen(&mut self) -> Result<()> {
        let meta = match fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(err) => {
                if !self.detached {
                    debug!(path = %self.path.display(), error = %err, "File unavailable; waiting");
                }
                self.detached = true;
                return Ok(());
            }
        };

        // A recreated file may reuse the old inode, so a vanished path
        // always means reopen.
        let current_id = file_id(&meta);
        if self.detached || (current_id.is_some() && current_id != self.id) {
            let (file, id) = open_with_id(&self.path).await?;
            info!(path = %self.path.display(), "File replaced; reopening");
            self.flush_partial();
            self.file = file;
            self.id = id;
            self.offset = 0;
            self.detached = false;
            return Ok(());
        }

        if meta.len() < self.offset {
            warn!(
                path = %self.path.display(),
                previous_offset = self.offset,
                current_size = meta.len(),
                "File truncated; reading from start"
            );
            self.file
                .seek(SeekFrom::Start(0))
                .await
                .map_err(|source| ExporterError::Tail {
                    path: self.path.clone(),
                    source,
                })?;
            self.offset = 0;
            self.partial.clear();
        }

        Ok(())
    }
}

#[async_trait]
impl LineSource for Tailer {
    async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Some(line);
            }
            if self.exhausted {
                return None;
            }

            match self.read_available().await {
                Ok(n) if n > 0 => continue,
                Ok(_) => {}
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "Read failed");
                }
            }

            if !self.config.follow {
                self.flush_partial();
                self.exhausted = true;
                continue;
            }

            if self.config.reopen {
                if let Err(err) = self.check_reopen().await {
                    warn!(path = %self.path.display(), error = %err, "Reopen failed; retrying");
                }
                if !self.pending.is_empty() {
                    continue;
                }
            }

            sleep(self.config.poll_interval).await;
        }
    }
}

async fn open_with_id(path: &Path) -> Result<(File, Option<FileId>)> {
    let to_err = |source| ExporterError::Tail {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).await.map_err(to_err)?;
    let meta = file.metadata().await.map_err(to_err)?;
    Ok((file, file_id(&meta)))
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::time::timeout;

    fn fast() -> TailConfig {
        TailConfig {
            poll_interval: Duration::from_millis(10),
            ..TailConfig::default()
        }
    }

    async fn next(tailer: &mut Tailer) -> String {
        timeout(Duration::from_secs(5), tailer.next_line())
            .await
            .expect("timed out waiting for line")
            .expect("source ended")
    }

    fn append(path: &Path, data: &str) {
        let mut f = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(data.as_bytes()).unwrap();
        f.flush().unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Tailer::open(dir.path().join("nope.log"), fast()).await;
        assert!(matches!(result, Err(ExporterError::Tail { .. })));
    }

    #[tokio::test]
    async fn test_reads_existing_lines_without_follow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "one\r\ntwo\nthree").unwrap();

        let config = TailConfig {
            follow: false,
            ..fast()
        };
        let mut tailer = Tailer::open(&path, config).await.unwrap();

        assert_eq!(tailer.next_line().await.as_deref(), Some("one"));
        assert_eq!(tailer.next_line().await.as_deref(), Some("two"));
        assert_eq!(tailer.next_line().await.as_deref(), Some("three"));
        assert_eq!(tailer.next_line().await, None);
    }

    #[tokio::test]
    async fn test_follows_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "first\n").unwrap();

        let mut tailer = Tailer::open(&path, fast()).await.unwrap();
        assert_eq!(next(&mut tailer).await, "first");

        append(&path, "sec");
        append(&path, "ond\n");
        assert_eq!(next(&mut tailer).await, "second");
    }

    #[tokio::test]
    async fn test_truncation_restarts_from_beginning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "a long first line\nanother long line\n").unwrap();

        let mut tailer = Tailer::open(&path, fast()).await.unwrap();
        assert_eq!(next(&mut tailer).await, "a long first line");
        assert_eq!(next(&mut tailer).await, "another long line");

        std::fs::write(&path, "short\n").unwrap();
        assert_eq!(next(&mut tailer).await, "short");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rotation_reopens_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "old\n").unwrap();

        let mut tailer = Tailer::open(&path, fast()).await.unwrap();
        assert_eq!(next(&mut tailer).await, "old");

        std::fs::rename(&path, dir.path().join("access.log.1")).unwrap();
        std::fs::write(&path, "new\n").unwrap();
        assert_eq!(next(&mut tailer).await, "new");
    }

    #[tokio::test]
    async fn test_large_backlog_is_read_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let line = format!("{}\n", "x".repeat(99));
        std::fs::write(&path, line.repeat(200_000)).unwrap();

        let mut tailer = Tailer::open(&path, fast()).await.unwrap();
        assert_eq!(next(&mut tailer).await.len(), 99);

        // Only the first chunk has been read
        assert!(tailer.offset <= READ_CHUNK_BYTES as u64);
        assert!(tailer.pending.len() < READ_CHUNK_BYTES / 100 + 1);
        assert_eq!(tailer.chunk.len(), READ_CHUNK_BYTES);

        // The rest still arrives, in order
        let mut count = 1;
        while count < 200_000 {
            assert_eq!(next(&mut tailer).await.len(), 99);
            count += 1;
            assert!(tailer.pending.len() <= READ_CHUNK_BYTES / 100 + 1);
        }
        assert_eq!(tailer.offset, 200_000 * 100);
    }

    #[tokio::test]
    async fn test_line_longer_than_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let long = "y".repeat(READ_CHUNK_BYTES * 2 + 7);
        std::fs::write(&path, format!("{long}\nshort\n")).unwrap();

        let mut tailer = Tailer::open(&path, fast()).await.unwrap();
        assert_eq!(next(&mut tailer).await, long);
        assert_eq!(next(&mut tailer).await, "short");
    }

    #[tokio::test]
    async fn test_missing_file_is_retried_until_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "before\n").unwrap();

        let mut tailer = Tailer::open(&path, fast()).await.unwrap();
        assert_eq!(next(&mut tailer).await, "before");

        std::fs::remove_file(&path).unwrap();

        // Several poll intervals pass with the path absent
        let waiting = timeout(Duration::from_millis(100), tailer.next_line()).await;
        assert!(waiting.is_err());
        assert!(tailer.detached);

        std::fs::write(&path, "after\n").unwrap();
        assert_eq!(next(&mut tailer).await, "after");
        assert!(!tailer.detached);
    }

    #[tokio::test]
    async fn test_channel_source() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send("line".to_string()).await.unwrap();
        drop(tx);

        assert_eq!(rx.next_line().await.as_deref(), Some("line"));
        assert_eq!(rx.next_line().await, None);
    }
}
