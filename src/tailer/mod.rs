// Log tailer - follows the backend's rolling log files
//
// The backend writes append-only logs under <root>/YYYY-MM/YYYY-MM-DD.N.log.
// The tailer starts at the end of the newest file (no backfill) and emits
// every complete line it sees afterwards, across in-place truncation, file
// rotation within a month, and month-directory rollover.
//
// Filesystem notifications are a latency optimization only; the 1-second
// polling loop is the correctness signal, because native watch events are
// unreliable on some platforms.

pub mod parse;

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::bus::EventBus;
use crate::events::GatewayEvent;
use parse::LineParser;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const MONTH_SCAN_INTERVAL: Duration = Duration::from_secs(600);

pub struct LogTailer {
    root: PathBuf,
    bus: EventBus,
    parser: LineParser,
    active_dir: Option<PathBuf>,
    active_file: Option<PathBuf>,
    /// Byte offset of the next unread byte in the active file
    cursor: u64,
    /// Set after warning about a missing/empty log tree, to avoid log spam
    warned_missing: bool,
}

impl LogTailer {
    pub fn new(root: PathBuf, bus: EventBus) -> Self {
        Self {
            root,
            bus,
            parser: LineParser::new(),
            active_dir: None,
            active_file: None,
            cursor: 0,
            warned_missing: false,
        }
    }

    /// Run forever; errors are logged and retried, never fatal
    pub async fn run(mut self) {
        self.try_bootstrap().await;

        // Watcher events funnel into a tiny channel; try_send coalesces
        // bursts into one pending wakeup
        let (fs_tx, mut fs_rx) = mpsc::channel::<()>(8);
        let _watcher = match self.spawn_watcher(fs_tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!(error = %e, "file watching unavailable, relying on polling");
                None
            }
        };

        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut month_scan = tokio::time::interval(MONTH_SCAN_INTERVAL);
        month_scan.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    self.poll().await;
                }
                _ = month_scan.tick() => {
                    self.check_month_transition().await;
                }
                // On a closed watcher channel this arm disables itself and
                // polling carries on alone
                Some(_) = fs_rx.recv() => {
                    self.check_month_transition().await;
                    self.poll().await;
                }
            }
        }
    }

    fn spawn_watcher(&self, tx: mpsc::Sender<()>) -> notify::Result<RecommendedWatcher> {
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<notify::Event, notify::Error>| {
                if result.is_ok() {
                    let _ = tx.try_send(());
                }
            },
            notify::Config::default(),
        )?;
        // Recursive over the root covers both new month directories and
        // writes to the active file
        watcher.watch(&self.root, RecursiveMode::Recursive)?;
        Ok(watcher)
    }

    /// One polling pass: (re)bootstrap if idle, handle rotation, drain new data
    async fn poll(&mut self) {
        if self.active_file.is_none() {
            self.try_bootstrap().await;
            if self.active_file.is_none() {
                return;
            }
        }
        self.check_rotation().await;
        self.drain_active().await;
    }

    async fn try_bootstrap(&mut self) {
        let Some(dir) = latest_month_dir(&self.root) else {
            if !self.warned_missing {
                tracing::warn!(root = %self.root.display(), "no month directory under log root");
                self.warned_missing = true;
            }
            return;
        };
        let Some(file) = newest_log_file(&dir) else {
            if !self.warned_missing {
                tracing::warn!(dir = %dir.display(), "month directory has no log files");
                self.warned_missing = true;
            }
            return;
        };

        // Start at end-of-file: history is not replayed
        let len = match tokio::fs::metadata(&file).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                tracing::warn!(file = %file.display(), error = %e, "cannot stat log file");
                return;
            }
        };

        tracing::info!(file = %file.display(), "tailing backend log");
        self.active_dir = Some(dir);
        self.active_file = Some(file);
        self.cursor = len;
        self.warned_missing = false;
    }

    /// Switch to a strictly newer .log file in the active directory
    async fn check_rotation(&mut self) {
        let (Some(dir), Some(active)) = (self.active_dir.clone(), self.active_file.clone()) else {
            return;
        };

        let Some(newest) = newest_log_file(&dir) else {
            tracing::warn!(dir = %dir.display(), "active directory lost its log files");
            self.active_file = None;
            return;
        };
        if newest == active {
            return;
        }

        let newer = match (file_mtime(&newest), file_mtime(&active)) {
            (Some(new_time), Some(active_time)) => new_time > active_time,
            // Active file vanished; follow the newest
            (Some(_), None) => true,
            _ => false,
        };
        if newer {
            tracing::info!(file = %newest.display(), "rotated to newer log file");
            self.active_file = Some(newest);
            self.cursor = 0;
        }
    }

    /// Read from the cursor to end-of-file and emit complete lines
    async fn drain_active(&mut self) {
        let Some(path) = self.active_file.clone() else {
            return;
        };

        let len = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "log file unreadable");
                self.active_file = None;
                return;
            }
        };

        // Size dropped below the cursor: the file was rewritten in place
        if len < self.cursor {
            self.cursor = 0;
        }
        if len == self.cursor {
            return;
        }

        match read_range(&path, self.cursor, len).await {
            Ok(buf) => {
                let consumed = self.emit_lines(&buf);
                self.cursor += consumed as u64;
            }
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "log read failed");
            }
        }
    }

    /// Publish parsed lines; returns bytes consumed (complete lines only)
    fn emit_lines(&self, buf: &[u8]) -> usize {
        let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') else {
            // Partial line: leave it for the next pass
            return 0;
        };

        let text = String::from_utf8_lossy(&buf[..=last_newline]);
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let Some(parsed) = self.parser.parse(line) else {
                continue;
            };
            self.bus.publish(&GatewayEvent::DebugLog {
                timestamp: parsed.timestamp.clone(),
                level: parsed.level.clone(),
                message: parsed.message.clone(),
                raw: parsed.raw.clone(),
            });
            if let Some(extra) = self.parser.extract(&parsed.message) {
                self.bus.publish(&extra);
            }
        }

        last_newline + 1
    }

    /// Detect and switch to a lexicographically newer month directory
    async fn check_month_transition(&mut self) {
        let Some(active_dir) = self.active_dir.clone() else {
            return;
        };
        let active_name = active_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let Some((name, new_dir)) = latest_month_entry(&self.root) else {
            return;
        };
        if name <= active_name {
            return;
        }

        // Only switch once the new month has a log file to follow
        let Some(new_file) = newest_log_file(&new_dir) else {
            tracing::debug!(dir = %new_dir.display(), "new month directory has no log files yet");
            return;
        };

        tracing::info!(
            old = %active_dir.display(),
            new = %new_dir.display(),
            "month transition detected"
        );
        self.active_dir = Some(new_dir.clone());
        self.active_file = Some(new_file.clone());
        self.cursor = 0;

        self.bus.publish(&GatewayEvent::LmstudioMonthTransition {
            old_directory: active_dir.display().to_string(),
            new_directory: new_dir.display().to_string(),
            new_log_file: new_file.display().to_string(),
        });
    }
}

/// Whether a directory name looks like YYYY-MM
fn is_month_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() == 7
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[4] == b'-'
        && bytes[5..].iter().all(u8::is_ascii_digit)
}

/// Lexicographically greatest YYYY-MM directory under root
fn latest_month_entry(root: &Path) -> Option<(String, PathBuf)> {
    let entries = std::fs::read_dir(root).ok()?;
    entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            is_month_name(&name).then(|| (name, e.path()))
        })
        .max_by(|a, b| a.0.cmp(&b.0))
}

fn latest_month_dir(root: &Path) -> Option<PathBuf> {
    latest_month_entry(root).map(|(_, path)| path)
}

/// Newest *.log in a directory by modification time
fn newest_log_file(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "log").unwrap_or(false))
        .filter_map(|p| file_mtime(&p).map(|mtime| (mtime, p)))
        .max_by_key(|(mtime, _)| *mtime)
        .map(|(_, p)| p)
}

fn file_mtime(path: &Path) -> Option<std::time::SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}

/// Read bytes [start, end) from a file
async fn read_range(path: &Path, start: u64, end: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(start)).await?;
    let mut buf = Vec::with_capacity((end - start) as usize);
    file.take(end - start).read_to_end(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use std::time::SystemTime;

    struct Fixture {
        _root: tempfile::TempDir,
        tailer: LogTailer,
        subscriber: crate::bus::Subscriber,
    }

    fn fixture(month: &str, file: &str, initial: &str) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let month_dir = root.path().join(month);
        fs::create_dir_all(&month_dir).unwrap();
        fs::write(month_dir.join(file), initial).unwrap();

        let bus = EventBus::new();
        let subscriber = bus.subscribe();
        let tailer = LogTailer::new(root.path().to_path_buf(), bus);
        Fixture {
            _root: root,
            tailer,
            subscriber,
        }
    }

    fn append(fixture: &Fixture, month: &str, file: &str, content: &str) {
        let path = fixture._root.path().join(month).join(file);
        let mut handle = fs::OpenOptions::new().append(true).open(path).unwrap();
        handle.write_all(content.as_bytes()).unwrap();
    }

    async fn recv_event(subscriber: &mut crate::bus::Subscriber) -> (String, String) {
        let frame = tokio::time::timeout(Duration::from_secs(1), subscriber.recv())
            .await
            .expect("event expected")
            .unwrap();
        (frame.event.to_string(), frame.data.to_string())
    }

    async fn assert_no_event(subscriber: &mut crate::bus::Subscriber) {
        let result = tokio::time::timeout(Duration::from_millis(50), subscriber.recv()).await;
        assert!(result.is_err(), "expected no event, got {:?}", result);
    }

    #[tokio::test]
    async fn bootstrap_starts_at_end_of_file_without_backfill() {
        let mut fx = fixture(
            "2025-11",
            "2025-11-30.1.log",
            "[2025-11-30 10:00:00][INFO] old line\n",
        );
        fx.tailer.try_bootstrap().await;
        fx.tailer.poll().await;
        assert_no_event(&mut fx.subscriber).await;

        append(
            &fx,
            "2025-11",
            "2025-11-30.1.log",
            "[2025-11-30 10:00:01][INFO] fresh line\n",
        );
        fx.tailer.poll().await;

        let (event, data) = recv_event(&mut fx.subscriber).await;
        assert_eq!(event, "debug_log");
        assert!(data.contains("fresh line"));
        assert_no_event(&mut fx.subscriber).await;
    }

    #[tokio::test]
    async fn partial_lines_wait_for_their_newline() {
        let mut fx = fixture("2025-11", "2025-11-30.1.log", "");
        fx.tailer.try_bootstrap().await;

        append(&fx, "2025-11", "2025-11-30.1.log", "[2025-11-30 10:00:01][INFO] first ha");
        fx.tailer.poll().await;
        assert_no_event(&mut fx.subscriber).await;

        append(&fx, "2025-11", "2025-11-30.1.log", "lf\n");
        fx.tailer.poll().await;
        let (_, data) = recv_event(&mut fx.subscriber).await;
        assert!(data.contains("first half"));
    }

    #[tokio::test]
    async fn each_line_is_emitted_exactly_once() {
        let mut fx = fixture("2025-11", "2025-11-30.1.log", "");
        fx.tailer.try_bootstrap().await;

        append(
            &fx,
            "2025-11",
            "2025-11-30.1.log",
            "[2025-11-30 10:00:01][INFO] one\n[2025-11-30 10:00:02][DEBUG] two\n",
        );
        fx.tailer.poll().await;
        // A second poll with no new data must not re-emit
        fx.tailer.poll().await;

        let (_, first) = recv_event(&mut fx.subscriber).await;
        assert!(first.contains("\"message\":\"one\""));
        let (_, second) = recv_event(&mut fx.subscriber).await;
        assert!(second.contains("\"message\":\"two\""));
        assert_no_event(&mut fx.subscriber).await;
    }

    #[tokio::test]
    async fn size_truncation_resets_the_cursor() {
        let mut fx = fixture(
            "2025-11",
            "2025-11-30.1.log",
            "[2025-11-30 10:00:00][INFO] a very long preexisting line\n",
        );
        fx.tailer.try_bootstrap().await;

        // Rewrite shorter than the cursor: treated as rotation-in-place
        let path = fx._root.path().join("2025-11").join("2025-11-30.1.log");
        fs::write(&path, "[2025-11-30 11:00:00][WARN] rewritten\n").unwrap();
        fx.tailer.poll().await;

        let (_, data) = recv_event(&mut fx.subscriber).await;
        assert!(data.contains("rewritten"));
        assert!(data.contains("\"level\":\"WARN\""));
    }

    #[tokio::test]
    async fn rotation_switches_to_the_newer_file() {
        let mut fx = fixture("2025-11", "2025-11-30.1.log", "");
        fx.tailer.try_bootstrap().await;

        // New rotated file with a strictly later mtime
        let new_path = fx._root.path().join("2025-11").join("2025-11-30.2.log");
        fs::write(&new_path, "[2025-11-30 12:00:00][INFO] from rotated file\n").unwrap();
        let later = SystemTime::now() + Duration::from_secs(5);
        let handle = fs::OpenOptions::new().write(true).open(&new_path).unwrap();
        handle.set_modified(later).unwrap();

        fx.tailer.poll().await;

        let (_, data) = recv_event(&mut fx.subscriber).await;
        assert!(data.contains("from rotated file"));
        assert_eq!(fx.tailer.active_file.as_deref(), Some(new_path.as_path()));
    }

    #[tokio::test]
    async fn month_transition_emits_once_and_follows_the_new_file() {
        let mut fx = fixture("2025-11", "2025-11-30.1.log", "");
        fx.tailer.try_bootstrap().await;

        let december = fx._root.path().join("2025-12");
        fs::create_dir_all(&december).unwrap();
        fs::write(
            december.join("2025-12-01.1.log"),
            "[2025-12-01 00:00:01][INFO] new month line\n",
        )
        .unwrap();

        fx.tailer.check_month_transition().await;
        // A second check finds nothing newer
        fx.tailer.check_month_transition().await;

        let (event, data) = recv_event(&mut fx.subscriber).await;
        assert_eq!(event, "lmstudio_month_transition");
        assert!(data.contains("2025-11"));
        assert!(data.contains("2025-12"));
        assert!(data.contains("2025-12-01.1.log"));

        fx.tailer.poll().await;
        let (event, data) = recv_event(&mut fx.subscriber).await;
        assert_eq!(event, "debug_log");
        assert!(data.contains("new month line"));
        assert_no_event(&mut fx.subscriber).await;
    }

    #[tokio::test]
    async fn missing_root_stays_quiescent_until_it_appears() {
        let root = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let mut subscriber = bus.subscribe();
        let mut tailer = LogTailer::new(root.path().join("missing"), bus);

        tailer.poll().await;
        tailer.poll().await;
        assert_no_event(&mut subscriber).await;

        let month = root.path().join("missing").join("2025-11");
        fs::create_dir_all(&month).unwrap();
        fs::write(month.join("2025-11-30.1.log"), "").unwrap();
        tailer.poll().await;

        append_to(&month.join("2025-11-30.1.log"), "[2025-11-30 10:00:01][ERROR] recovered\n");
        tailer.poll().await;
        let frame = tokio::time::timeout(Duration::from_secs(1), subscriber.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(frame.data.contains("recovered"));
    }

    fn append_to(path: &Path, content: &str) {
        let mut handle = fs::OpenOptions::new().append(true).open(path).unwrap();
        handle.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn month_names_are_strictly_yyyy_mm() {
        assert!(is_month_name("2025-11"));
        assert!(is_month_name("1999-01"));
        assert!(!is_month_name("2025-1"));
        assert!(!is_month_name("2025-112"));
        assert!(!is_month_name("backup"));
        assert!(!is_month_name("2025_11"));
    }
}
