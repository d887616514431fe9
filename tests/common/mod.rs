//! Shared doubles for integration tests

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use relay_agent::config::Config;
use relay_agent::error::{Error, Result};
use relay_agent::http::{LogRelay, MailRelay, MailRequest};
use relay_agent::sender::SendPrimitive;
use relay_agent::store::{MessageStore, StoredRecord};
use relay_agent::{Collaborators, Message, MessageClass, RelayAgent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub struct MemoryStore {
    class: MessageClass,
    rows: Mutex<Vec<StoredRecord>>,
    pub fail: AtomicBool,
}

impl MemoryStore {
    pub fn new(class: MessageClass) -> Self {
        Self {
            class,
            rows: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn push(&self, id: i64, sender: &str, body: &str, received_at: DateTime<Utc>, seen: bool) {
        self.rows.lock().unwrap().push(StoredRecord {
            id,
            received_at,
            seen,
            message: Some(Message::new(sender, body, received_at)),
        });
    }
}

impl MessageStore for MemoryStore {
    fn class(&self) -> MessageClass {
        self.class
    }

    fn max_id(&self) -> Result<i64> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Store("unavailable".to_string()));
        }
        Ok(self.rows.lock().unwrap().iter().map(|r| r.id).max().unwrap_or(0))
    }

    fn scan_after(&self, after: i64, limit: Option<usize>) -> Result<Vec<StoredRecord>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Store("unavailable".to_string()));
        }
        let mut rows: Vec<StoredRecord> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.id > after)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.id);
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

#[derive(Default)]
pub struct RecordingSender {
    pub sent: Mutex<Vec<(String, String)>>,
}

impl RecordingSender {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

impl SendPrimitive for RecordingSender {
    fn send(&self, number: &str, text: &str) -> bool {
        self.sent.lock().unwrap().push((number.to_string(), text.to_string()));
        true
    }
}

#[derive(Default)]
pub struct RecordingMail {
    pub requests: Mutex<Vec<(String, MailRequest)>>,
}

impl MailRelay for RecordingMail {
    fn send(&self, url: &str, request: &MailRequest) -> Result<()> {
        self.requests.lock().unwrap().push((url.to_string(), request.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingLogRelay {
    pub lines: Mutex<Vec<String>>,
}

impl LogRelay for RecordingLogRelay {
    fn upload(&self, _url: &str, _device_id: &str, lines: &[String]) -> Result<()> {
        self.lines.lock().unwrap().extend_from_slice(lines);
        Ok(())
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub direct: Arc<MemoryStore>,
    pub enveloped: Arc<MemoryStore>,
    pub sender: Arc<RecordingSender>,
    pub mail: Arc<RecordingMail>,
    pub log_relay: Arc<RecordingLogRelay>,
    pub agent: RelayAgent,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        Self::in_dir(dir)
    }

    /// Build an agent over `dir`, reusing any state already there
    pub fn in_dir(dir: TempDir) -> Self {
        let config = Config::for_test(dir.path());
        let direct = Arc::new(MemoryStore::new(MessageClass::Direct));
        let enveloped = Arc::new(MemoryStore::new(MessageClass::Enveloped));
        let sender = Arc::new(RecordingSender::default());
        let mail = Arc::new(RecordingMail::default());
        let log_relay = Arc::new(RecordingLogRelay::default());

        let agent = RelayAgent::new(
            config,
            Collaborators {
                direct: direct.clone(),
                enveloped: enveloped.clone(),
                sender: sender.clone(),
                mail: mail.clone(),
                log_relay: log_relay.clone(),
            },
        )
        .unwrap();

        Self {
            dir,
            direct,
            enveloped,
            sender,
            mail,
            log_relay,
            agent,
        }
    }
}

/// Poll `cond` until it holds or five seconds pass
pub fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
