/// Follows the guest console log written by virtlogd.
///
/// The file only appears once the domain has started, so the follower polls
/// for it. Once open it reads new data whenever the filesystem watcher
/// reports a change or the poll tick fires, and forwards complete lines. A
/// rotated log is read to its end before the new file is opened; a truncated
/// one is reread from the start.
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::log_sink::LogSink;

pub struct LogFollower {
    pub path: PathBuf,
    /// Interval for both the existence check and the fallback read tick.
    pub poll: Duration,
    /// Lines longer than this are dropped, complete or not.
    pub max_line_bytes: usize,
    pub sink: LogSink,
}

/// The currently open log file and how far into it we have read.
struct OpenLog {
    reader: BufReader<File>,
    dev: u64,
    ino: u64,
    position: u64,
}

impl OpenLog {
    async fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path).await?;
        let meta = file.metadata().await?;
        Ok(Self {
            reader: BufReader::new(file),
            dev: meta.dev(),
            ino: meta.ino(),
            position: 0,
        })
    }

    fn is_same_file(&self, meta: &std::fs::Metadata) -> bool {
        meta.dev() == self.dev && meta.ino() == self.ino
    }
}

/// Bytes of the line being assembled.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
    /// Set after an overlong line was dropped; cleared at its newline.
    discarding: bool,
}

impl LogFollower {
    /// Runs until `stop` flips to `true` or its sender is dropped.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let (change_tx, mut change_rx) = mpsc::channel::<()>(16);
        // Kept alive for the duration of the loop.
        let _watcher = self.watch(change_tx);

        let mut ticker = tokio::time::interval(self.poll);
        let mut log: Option<OpenLog> = None;
        let mut lines = LineBuffer::default();

        loop {
            if *stop.borrow() {
                break;
            }
            self.sync(&mut log, &mut lines).await;
            tokio::select! {
                Some(()) = change_rx.recv() => {}
                _ = ticker.tick() => {}
                res = stop.changed() => {
                    if res.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(path = %self.path.display(), "Stopped following guest log");
    }

    /// Reads whatever is new, switching files when the path was rotated or
    /// truncated. Errors are logged and retried on the next wakeup.
    async fn sync(&self, log: &mut Option<OpenLog>, lines: &mut LineBuffer) {
        let current = tokio::fs::metadata(&self.path).await.ok();

        if let Some(open) = log.as_mut() {
            let (rotated, truncated) = match &current {
                Some(meta) if !open.is_same_file(meta) => (true, false),
                Some(meta) => (false, meta.len() < open.position),
                None => (false, false),
            };
            if truncated {
                info!(path = %self.path.display(), "Guest log truncated, reopening");
                *log = None;
            } else if let Err(e) = self.drain(open, lines).await {
                warn!(path = %self.path.display(), error = %e, "Failed to read guest log, reopening");
                *log = None;
            } else if rotated {
                info!(path = %self.path.display(), "Guest log rotated, reopening");
                *log = None;
            }
            if log.is_none() {
                self.finish_partial(lines);
            }
        }

        if log.is_none() && current.is_some() {
            let mut open = match OpenLog::open(&self.path).await {
                Ok(open) => open,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Failed to open guest log");
                    return;
                }
            };
            info!(path = %self.path.display(), "Following guest log");
            match self.drain(&mut open, lines).await {
                Ok(()) => *log = Some(open),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Failed to read guest log");
                    self.finish_partial(lines);
                }
            }
        }
    }

    fn watch(&self, change_tx: mpsc::Sender<()>) -> Option<RecommendedWatcher> {
        // The directory is watched so that a file created by rotation is seen.
        let dir = self.path.parent()?.to_path_buf();
        let file_name = self.path.file_name()?.to_os_string();
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                if let Ok(event) = res {
                    if event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(file_name.as_os_str()))
                    {
                        // A dropped wakeup is covered by the poll tick.
                        let _ = change_tx.try_send(());
                    }
                }
            },
            NotifyConfig::default(),
        );

        let mut watcher = match watcher {
            Ok(w) => w,
            Err(e) => {
                warn!(error = %e, "Failed to create file watcher, polling guest log");
                return None;
            }
        };
        if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            warn!(path = %dir.display(), error = %e, "Failed to watch guest log directory, polling");
            return None;
        }
        Some(watcher)
    }

    /// Reads to EOF, forwarding complete lines. A trailing partial line stays
    /// in `lines`, and never holds more than `max_line_bytes` plus one read
    /// buffer.
    async fn drain(&self, log: &mut OpenLog, lines: &mut LineBuffer) -> io::Result<()> {
        loop {
            let (used, complete) = {
                let available = log.reader.fill_buf().await?;
                if available.is_empty() {
                    return Ok(());
                }
                let (chunk, complete) = match available.iter().position(|b| *b == b'\n') {
                    Some(end) => (&available[..=end], true),
                    None => (available, false),
                };
                if !lines.discarding {
                    lines.pending.extend_from_slice(chunk);
                }
                (chunk.len(), complete)
            };
            log.reader.consume(used);
            log.position += used as u64;

            if complete {
                if lines.discarding {
                    lines.discarding = false;
                } else {
                    self.emit(lines);
                }
            } else if !lines.discarding && lines.pending.len() > self.max_line_bytes {
                warn!(path = %self.path.display(), max_line_bytes = self.max_line_bytes, "Dropping overlong guest log line");
                lines.pending.clear();
                lines.discarding = true;
            }
        }
    }

    /// Forwards the unterminated tail of a file we are leaving.
    fn finish_partial(&self, lines: &mut LineBuffer) {
        if !lines.discarding && !lines.pending.is_empty() {
            self.emit(lines);
        }
        lines.pending.clear();
        lines.discarding = false;
    }

    fn emit(&self, lines: &mut LineBuffer) {
        let line = lines.pending.as_slice();
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.len() > self.max_line_bytes {
            warn!(path = %self.path.display(), len = line.len(), "Dropping overlong guest log line");
        } else {
            (self.sink)(&String::from_utf8_lossy(line));
        }
        lines.pending.clear();
    }
}
