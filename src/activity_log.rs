//! Activity log - append-only local log with batched remote shipping
//!
//! Every relay outcome (forwards, commands, recoveries) lands here as one line.
//! When a log relay URL is configured, lines are also shipped in debounced
//! batches. Upload failures only reach `tracing`, never this log, so a broken
//! relay can't feed itself.

use crate::atomic_file::write_atomic;
use crate::error::Result;
use crate::http::LogRelay;
use crate::settings::SettingsStore;
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

struct Shipper {
    tx: Sender<String>,
    handle: JoinHandle<()>,
}

pub struct ActivityLog {
    path: PathBuf,
    settings: Arc<SettingsStore>,
    file_lock: Mutex<()>,
    shipper: Mutex<Option<Shipper>>,
}

impl ActivityLog {
    pub fn new(path: impl Into<PathBuf>, settings: Arc<SettingsStore>) -> Self {
        Self {
            path: path.into(),
            settings,
            file_lock: Mutex::new(()),
            shipper: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn debug(&self, text: impl AsRef<str>) {
        self.append(LogLevel::Debug, text.as_ref());
    }

    pub fn info(&self, text: impl AsRef<str>) {
        self.append(LogLevel::Info, text.as_ref());
    }

    pub fn warn(&self, text: impl AsRef<str>) {
        self.append(LogLevel::Warn, text.as_ref());
    }

    pub fn error(&self, text: impl AsRef<str>) {
        self.append(LogLevel::Error, text.as_ref());
    }

    /// Append one entry. Debug entries are dropped unless verbose logging is on.
    pub fn append(&self, level: LogLevel, text: &str) {
        if level == LogLevel::Debug && !self.settings.read(|s| s.verbose_logging) {
            return;
        }

        // One entry per line
        let text = text.replace('\n', " | ");
        let line = format!("{} {} {}", Utc::now().to_rfc3339(), level.as_str(), text);

        if let Err(e) = self.write_line(&line) {
            warn!(error = %e, "Failed to append activity log");
        }

        let shipper = self.shipper.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(s) = shipper.as_ref() {
            let _ = s.tx.send(line);
        }
    }

    fn write_line(&self, line: &str) -> Result<()> {
        let _guard = self.file_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Last `n` entries, oldest first
    pub fn tail(&self, n: usize) -> Result<Vec<String>> {
        let _guard = self.file_lock.lock().unwrap_or_else(|e| e.into_inner());
        let lines = self.read_lines()?;
        let skip = lines.len().saturating_sub(n);
        Ok(lines.into_iter().skip(skip).collect())
    }

    /// Keep only the most recent `keep` entries. Returns how many were removed.
    pub fn trim(&self, keep: usize) -> Result<usize> {
        let _guard = self.file_lock.lock().unwrap_or_else(|e| e.into_inner());
        let lines = self.read_lines()?;
        if lines.len() <= keep {
            return Ok(0);
        }

        let removed = lines.len() - keep;
        let mut kept = String::new();
        for line in &lines[removed..] {
            kept.push_str(line);
            kept.push('\n');
        }
        write_atomic(&self.path, kept.as_bytes())?;

        Ok(removed)
    }

    fn read_lines(&self) -> Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(content.lines().map(|l| l.to_string()).collect())
    }

    /// Start shipping new entries to the configured log relay
    pub fn attach_shipper(
        &self,
        relay: Arc<dyn LogRelay>,
        device_id: String,
        debounce: Duration,
        max_batch: usize,
    ) {
        let mut slot = self.shipper.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }

        let (tx, rx) = mpsc::channel::<String>();
        let settings = self.settings.clone();
        let max_batch = max_batch.max(1);

        let handle = std::thread::Builder::new()
            .name("log-shipper".to_string())
            .spawn(move || {
                // Wait for the first line of a batch, then collect until the
                // debounce window closes or the batch is full
                while let Ok(first) = rx.recv() {
                    let mut batch = vec![first];
                    let deadline = Instant::now() + debounce;
                    let mut disconnected = false;

                    while batch.len() < max_batch {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        match rx.recv_timeout(remaining) {
                            Ok(line) => batch.push(line),
                            Err(RecvTimeoutError::Timeout) => break,
                            Err(RecvTimeoutError::Disconnected) => {
                                disconnected = true;
                                break;
                            }
                        }
                    }

                    ship_batch(relay.as_ref(), &settings, &device_id, &batch);
                    if disconnected {
                        break;
                    }
                }
            });

        match handle {
            Ok(handle) => *slot = Some(Shipper { tx, handle }),
            Err(e) => warn!(error = %e, "Failed to start log shipper"),
        }
    }

    /// Flush pending lines and stop the shipper thread
    pub fn detach_shipper(&self) {
        let shipper = self
            .shipper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(Shipper { tx, handle }) = shipper {
            drop(tx);
            let _ = handle.join();
        }
    }
}

fn ship_batch(relay: &dyn LogRelay, settings: &SettingsStore, device_id: &str, batch: &[String]) {
    let url = match settings.read(|s| s.log_relay_url.clone()) {
        Some(u) => u,
        None => return,
    };

    match relay.upload(&url, device_id, batch) {
        Ok(()) => debug!(lines = batch.len(), "Shipped activity log batch"),
        Err(e) => debug!(lines = batch.len(), error = %e, "Log upload failed, dropping batch"),
    }
}

impl Drop for ActivityLog {
    fn drop(&mut self) {
        self.detach_shipper();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tempfile::TempDir;

    struct CapturingRelay {
        batches: Mutex<Vec<(String, Vec<String>)>>,
        fail: bool,
    }

    impl LogRelay for CapturingRelay {
        fn upload(&self, _url: &str, device_id: &str, lines: &[String]) -> Result<()> {
            self.batches
                .lock()
                .unwrap()
                .push((device_id.to_string(), lines.to_vec()));
            if self.fail {
                Err(Error::Transport("503".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn setup(dir: &TempDir) -> (Arc<SettingsStore>, ActivityLog) {
        let settings = Arc::new(SettingsStore::open(dir.path().join("settings.json")).unwrap());
        let log = ActivityLog::new(dir.path().join("activity.log"), settings.clone());
        (settings, log)
    }

    #[test]
    fn test_append_and_tail() {
        let dir = TempDir::new().unwrap();
        let (_settings, log) = setup(&dir);
        log.info("first");
        log.warn("second\nline");
        log.error("third");

        let tail = log.tail(2).unwrap();
        assert_eq!(tail.len(), 2);
        assert!(tail[0].contains("WARN second | line"));
        assert!(tail[1].contains("ERROR third"));
    }

    #[test]
    fn test_debug_requires_verbose() {
        let dir = TempDir::new().unwrap();
        let (settings, log) = setup(&dir);
        log.debug("hidden");
        assert!(log.tail(10).unwrap().is_empty());

        settings.update(|s| s.verbose_logging = true).unwrap();
        log.debug("shown");
        assert_eq!(log.tail(10).unwrap().len(), 1);
    }

    #[test]
    fn test_trim_keeps_most_recent() {
        let dir = TempDir::new().unwrap();
        let (_settings, log) = setup(&dir);
        for i in 0..10 {
            log.info(format!("entry {}", i));
        }

        assert_eq!(log.trim(3).unwrap(), 7);
        let lines = log.tail(100).unwrap();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("entry 7"));
        assert_eq!(log.trim(3).unwrap(), 0);
    }

    #[test]
    fn test_tail_missing_file() {
        let dir = TempDir::new().unwrap();
        let (_settings, log) = setup(&dir);
        assert!(log.tail(5).unwrap().is_empty());
    }

    #[test]
    fn test_shipper_batches_lines() {
        let dir = TempDir::new().unwrap();
        let (settings, log) = setup(&dir);
        settings
            .update(|s| s.log_relay_url = Some("https://logs.example.com".to_string()))
            .unwrap();

        let relay = Arc::new(CapturingRelay {
            batches: Mutex::new(Vec::new()),
            fail: false,
        });
        log.attach_shipper(relay.clone(), "dev-1".to_string(), Duration::from_secs(5), 50);
        log.info("a");
        log.info("b");
        log.info("c");
        log.detach_shipper();

        let batches = relay.batches.lock().unwrap();
        let total: usize = batches.iter().map(|(_, l)| l.len()).sum();
        assert_eq!(total, 3);
        assert_eq!(batches[0].0, "dev-1");
    }

    #[test]
    fn test_shipper_respects_max_batch() {
        let dir = TempDir::new().unwrap();
        let (settings, log) = setup(&dir);
        settings
            .update(|s| s.log_relay_url = Some("https://logs.example.com".to_string()))
            .unwrap();

        let relay = Arc::new(CapturingRelay {
            batches: Mutex::new(Vec::new()),
            fail: false,
        });
        log.attach_shipper(relay.clone(), "dev".to_string(), Duration::from_secs(5), 2);
        for i in 0..5 {
            log.info(format!("line {}", i));
        }
        log.detach_shipper();

        let batches = relay.batches.lock().unwrap();
        assert!(batches.iter().all(|(_, l)| l.len() <= 2));
        assert_eq!(batches.iter().map(|(_, l)| l.len()).sum::<usize>(), 5);
    }

    #[test]
    fn test_upload_failure_not_logged_locally() {
        let dir = TempDir::new().unwrap();
        let (settings, log) = setup(&dir);
        settings
            .update(|s| s.log_relay_url = Some("https://logs.example.com".to_string()))
            .unwrap();

        let relay = Arc::new(CapturingRelay {
            batches: Mutex::new(Vec::new()),
            fail: true,
        });
        log.attach_shipper(relay, "dev".to_string(), Duration::from_millis(5), 50);
        log.info("only entry");
        log.detach_shipper();

        assert_eq!(log.tail(10).unwrap().len(), 1);
    }

    #[test]
    fn test_no_url_means_no_upload() {
        let dir = TempDir::new().unwrap();
        let (_settings, log) = setup(&dir);
        let relay = Arc::new(CapturingRelay {
            batches: Mutex::new(Vec::new()),
            fail: false,
        });
        log.attach_shipper(relay.clone(), "dev".to_string(), Duration::from_millis(5), 50);
        log.info("entry");
        log.detach_shipper();
        assert!(relay.batches.lock().unwrap().is_empty());
    }
}
