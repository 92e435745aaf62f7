//! Follow a growing log file, `tail -F` style.
//!
//! Lines are delivered in append order starting from the end of the file at
//! open time. Rotation (a new file at the same path), truncation and in-place
//! rewrites are detected on every idle poll; the follower then reopens the
//! path and reads the new content from its beginning.

use std::collections::VecDeque;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::sync::{mpsc, watch};

#[derive(Error, Debug)]
pub enum TailError {
    #[error("log file {0:?} not found")]
    NotFound(PathBuf),

    #[error("log file {path:?} is no longer available: {reason}")]
    SourceLost { path: PathBuf, reason: String },

    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("log follower task failed: {0}")]
    Task(String),
}

/// Polling behaviour of a [`LogFollower`].
#[derive(Debug, Clone, Copy)]
pub struct FollowOptions {
    /// Sleep between checks when no new data is available
    pub poll_interval: Duration,
    /// How long the path may stay missing before the source counts as lost
    pub missing_grace: Duration,
}

impl Default for FollowOptions {
    fn default() -> Self {
        FollowOptions {
            poll_interval: Duration::from_millis(500),
            missing_grace: Duration::from_secs(30),
        }
    }
}

/// Leading bytes remembered to recognise a file rewritten in place.
const HEAD_LEN: u64 = 64;

async fn read_head(path: &Path) -> io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(HEAD_LEN as usize);
    File::open(path).await?.take(HEAD_LEN).read_to_end(&mut head).await?;
    Ok(head)
}

#[cfg(unix)]
fn file_identity(metadata: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn file_identity(_metadata: &std::fs::Metadata) -> Option<u64> {
    None
}

fn take_line(buf: &mut Vec<u8>) -> String {
    let mut bytes = std::mem::take(buf);
    while matches!(bytes.last(), Some(b'\n') | Some(b'\r')) {
        bytes.pop();
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Follows one log file until shutdown or until the file is lost.
pub struct LogFollower {
    path: PathBuf,
    /// `None` while the path could not be reopened after rotation
    reader: Option<BufReader<File>>,
    identity: Option<u64>,
    /// First bytes of the followed file, up to `HEAD_LEN`
    head: Vec<u8>,
    /// File length at the last check
    seen_len: u64,
    /// Bytes consumed from the current handle
    position: u64,
    /// Bytes of a line whose newline has not been written yet
    partial: Vec<u8>,
    /// Lines drained from a rotated-away file, delivered before new ones
    backlog: VecDeque<String>,
    missing_since: Option<Instant>,
    options: FollowOptions,
    shutdown: watch::Receiver<bool>,
}

impl LogFollower {
    /// Open `path` positioned at its current end of data. Fails when the
    /// file does not exist or cannot be read.
    pub async fn open(
        path: impl Into<PathBuf>,
        options: FollowOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, TailError> {
        let path = path.into();
        let io_error = |source: io::Error| match source.kind() {
            io::ErrorKind::NotFound => TailError::NotFound(path.clone()),
            _ => TailError::Io {
                path: path.clone(),
                source,
            },
        };

        let file = File::open(&path).await.map_err(io_error)?;
        let metadata = file.metadata().await.map_err(io_error)?;
        let mut reader = BufReader::new(file);
        let position = reader.seek(SeekFrom::End(0)).await.map_err(io_error)?;
        let head = read_head(&path).await.map_err(io_error)?;

        Ok(LogFollower {
            identity: file_identity(&metadata),
            head,
            seen_len: position,
            path,
            reader: Some(reader),
            position,
            partial: Vec::new(),
            backlog: VecDeque::new(),
            missing_since: None,
            options,
            shutdown,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next complete line without its terminator.
    ///
    /// Returns `Ok(None)` once shutdown is signalled and an error when the
    /// file has become permanently unavailable.
    pub async fn next_line(&mut self) -> Result<Option<String>, TailError> {
        loop {
            if self.is_shutdown() {
                return Ok(None);
            }

            if let Some(line) = self.backlog.pop_front() {
                return Ok(Some(line));
            }

            if let Some(line) = self.read_line().await? {
                return Ok(Some(line));
            }

            if !self.idle().await {
                return Ok(None);
            }

            self.check_source().await?;
        }
    }

    /// Drive the follower into a channel until shutdown, source loss or
    /// the receiver going away.
    pub async fn run(mut self, tx: mpsc::Sender<String>) -> Result<(), TailError> {
        log::info!("Following {:?}", self.path());

        while let Some(line) = self.next_line().await? {
            if tx.send(line).await.is_err() {
                log::info!("Channel closed, stopping log follower");
                break;
            }
        }

        log::info!("Log follower for {:?} stopped", self.path());
        Ok(())
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// One complete line from the current handle, or `None` at end of data.
    async fn read_line(&mut self) -> Result<Option<String>, TailError> {
        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => return Ok(None),
        };

        loop {
            let n = reader
                .read_until(b'\n', &mut self.partial)
                .await
                .map_err(|source| TailError::Io {
                    path: self.path.clone(),
                    source,
                })?;

            if n == 0 {
                return Ok(None);
            }
            self.position += n as u64;

            if self.partial.last() == Some(&b'\n') {
                return Ok(Some(take_line(&mut self.partial)));
            }
        }
    }

    /// Wait one poll interval. `false` when shutdown arrived meanwhile.
    async fn idle(&mut self) -> bool {
        let keep_going = tokio::select! {
            _ = tokio::time::sleep(self.options.poll_interval) => true,
            changed = self.shutdown.changed() => changed.is_ok(),
        };
        keep_going && !self.is_shutdown()
    }

    /// Detect rotation, truncation and disappearance of the path.
    async fn check_source(&mut self) -> Result<(), TailError> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) => return self.note_missing(e.to_string()),
        };
        if self.missing_since.take().is_some() {
            log::info!("{:?} is back", self.path);
        }

        if self.reader.is_none() {
            return self.reopen().await;
        }

        let identity = file_identity(&metadata);
        if identity.is_some() && identity != self.identity {
            log::info!("{:?} was rotated, following the new file", self.path);
            self.drain_current().await?;
            return self.reopen().await;
        }

        if metadata.len() < self.position {
            log::info!("{:?} was truncated, resuming from the start", self.path);
            self.partial.clear();
            return self.reopen().await;
        }

        if metadata.len() != self.seen_len {
            self.seen_len = metadata.len();
            if self.rewritten_in_place().await {
                log::info!("{:?} was rewritten, resuming from the start", self.path);
                self.partial.clear();
                return self.reopen().await;
            }
        }

        Ok(())
    }

    /// Whether the start of the file no longer matches what was followed.
    /// A head shorter than `HEAD_LEN` is extended as the file grows.
    async fn rewritten_in_place(&mut self) -> bool {
        let head = match read_head(&self.path).await {
            Ok(head) => head,
            Err(_) => return false,
        };

        if !head.starts_with(&self.head) {
            return true;
        }
        self.head = head;
        false
    }

    /// Move whatever is left in the old handle into the backlog.
    async fn drain_current(&mut self) -> Result<(), TailError> {
        while let Some(line) = self.read_line().await? {
            self.backlog.push_back(line);
        }
        if !self.partial.is_empty() {
            let line = take_line(&mut self.partial);
            self.backlog.push_back(line);
        }
        Ok(())
    }

    async fn reopen(&mut self) -> Result<(), TailError> {
        self.reader = None;
        self.position = 0;

        let file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) => return self.note_missing(e.to_string()),
        };
        match file.metadata().await {
            Ok(metadata) => {
                self.identity = file_identity(&metadata);
                self.seen_len = metadata.len();
            }
            Err(e) => return self.note_missing(e.to_string()),
        }
        self.head = read_head(&self.path).await.unwrap_or_default();

        self.reader = Some(BufReader::new(file));
        Ok(())
    }

    fn note_missing(&mut self, reason: String) -> Result<(), TailError> {
        let since = match self.missing_since {
            Some(since) => since,
            None => {
                log::warn!("{:?} is unavailable ({}), waiting for it", self.path, reason);
                *self.missing_since.insert(Instant::now())
            }
        };

        if since.elapsed() >= self.options.missing_grace {
            return Err(TailError::SourceLost {
                path: self.path.clone(),
                reason,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn fast() -> FollowOptions {
        FollowOptions {
            poll_interval: Duration::from_millis(20),
            missing_grace: Duration::from_millis(200),
        }
    }

    fn append(path: &Path, data: &str) {
        let mut file = OpenOptions::new().append(true).create(true).open(path).unwrap();
        file.write_all(data.as_bytes()).unwrap();
        file.flush().unwrap();
    }

    async fn next(follower: &mut LogFollower) -> Option<String> {
        timeout(WAIT, follower.next_line()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_missing_file_at_start() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = watch::channel(false);

        let result = LogFollower::open(dir.path().join("auth.log"), fast(), rx).await;
        assert!(matches!(result, Err(TailError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_starts_at_end_of_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, "old line 1\nold line 2\n");

        let (_tx, rx) = watch::channel(false);
        let mut follower = LogFollower::open(&path, fast(), rx).await.unwrap();

        append(&path, "new line\r\n");
        assert_eq!(next(&mut follower).await.as_deref(), Some("new line"));
    }

    #[tokio::test]
    async fn test_partial_line_waits_for_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, "");

        let (_tx, rx) = watch::channel(false);
        let mut follower = LogFollower::open(&path, fast(), rx).await.unwrap();

        append(&path, "Failed password for ro");
        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            append(&writer_path, "ot from 1.2.3.4 port 22 ssh2\n");
        });

        assert_eq!(
            next(&mut follower).await.as_deref(),
            Some("Failed password for root from 1.2.3.4 port 22 ssh2")
        );
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_lines_arrive_in_order_without_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, "");

        let (_tx, rx) = watch::channel(false);
        let mut follower = LogFollower::open(&path, fast(), rx).await.unwrap();

        append(&path, "one\ntwo\n");
        assert_eq!(next(&mut follower).await.as_deref(), Some("one"));
        append(&path, "three\n");
        assert_eq!(next(&mut follower).await.as_deref(), Some("two"));
        assert_eq!(next(&mut follower).await.as_deref(), Some("three"));
    }

    #[tokio::test]
    async fn test_truncation_resumes_with_new_lines_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, "history\n");

        let (_tx, rx) = watch::channel(false);
        let mut follower = LogFollower::open(&path, fast(), rx).await.unwrap();

        append(&path, "before cut A\nbefore cut B\n");
        assert_eq!(next(&mut follower).await.as_deref(), Some("before cut A"));
        assert_eq!(next(&mut follower).await.as_deref(), Some("before cut B"));

        OpenOptions::new().write(true).open(&path).unwrap().set_len(0).unwrap();
        append(&path, "after 1\n");

        assert_eq!(next(&mut follower).await.as_deref(), Some("after 1"));
        append(&path, "after 2\n");
        assert_eq!(next(&mut follower).await.as_deref(), Some("after 2"));
    }

    #[tokio::test]
    async fn test_rewrite_past_old_offset_restarts_from_the_top() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, "alpha original first line\n");

        let (_tx, rx) = watch::channel(false);
        let mut follower = LogFollower::open(&path, fast(), rx).await.unwrap();

        append(&path, "beta\n");
        assert_eq!(next(&mut follower).await.as_deref(), Some("beta"));

        // Longer than what was read so far, so the size alone looks like growth
        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            std::fs::write(
                &writer_path,
                "gamma rewritten log line number one\ndelta second line\n",
            )
            .unwrap();
        });

        assert_eq!(
            next(&mut follower).await.as_deref(),
            Some("gamma rewritten log line number one")
        );
        assert_eq!(next(&mut follower).await.as_deref(), Some("delta second line"));
        writer.await.unwrap();
        assert_eq!(follower.path(), path.as_path());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rotation_drains_old_file_then_follows_new() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.log");
        let rotated = dir.path().join("auth.log.1");
        append(&path, "");

        let (_tx, rx) = watch::channel(false);
        let mut follower = LogFollower::open(&path, fast(), rx).await.unwrap();

        append(&path, "first\n");
        assert_eq!(next(&mut follower).await.as_deref(), Some("first"));

        std::fs::rename(&path, &rotated).unwrap();
        append(&rotated, "late write to old file\n");
        append(&path, "fresh file\n");

        assert_eq!(next(&mut follower).await.as_deref(), Some("late write to old file"));
        assert_eq!(next(&mut follower).await.as_deref(), Some("fresh file"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_follower() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, "");

        let options = FollowOptions {
            poll_interval: Duration::from_secs(60),
            missing_grace: Duration::from_secs(60),
        };
        let (tx, rx) = watch::channel(false);
        let mut follower = LogFollower::open(&path, options, rx).await.unwrap();

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
            tx
        });

        assert_eq!(next(&mut follower).await, None);
        drop(stopper.await.unwrap());
    }

    #[tokio::test]
    async fn test_deleted_file_becomes_source_lost() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, "");

        let (_tx, rx) = watch::channel(false);
        let mut follower = LogFollower::open(&path, fast(), rx).await.unwrap();
        std::fs::remove_file(&path).unwrap();

        let result = timeout(WAIT, follower.next_line()).await.unwrap();
        assert!(matches!(result, Err(TailError::SourceLost { .. })));
    }

    #[tokio::test]
    async fn test_run_feeds_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, "");

        let (stop_tx, stop_rx) = watch::channel(false);
        let follower = LogFollower::open(&path, fast(), stop_rx).await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let task = tokio::spawn(follower.run(tx));

        append(&path, "alpha\nbeta\n");
        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().as_deref(), Some("alpha"));
        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().as_deref(), Some("beta"));

        stop_tx.send(true).unwrap();
        assert!(timeout(WAIT, task).await.unwrap().unwrap().is_ok());
    }
}
