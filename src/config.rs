//! Configuration and paths

use std::path::{Path, PathBuf};
use std::time::Duration;

/// All configurable paths and constants
#[derive(Debug, Clone)]
pub struct Config {
    pub state_dir: PathBuf,
    pub settings_file: PathBuf,
    pub watermark_dir: PathBuf,
    pub activity_log_file: PathBuf,
    pub messages_db: PathBuf,
    pub send_sms: PathBuf,
    pub device_id: String,
    pub queue_poll_ms: u64,
    pub arrival_poll_ms: u64,
    pub recheck_attempts: u32,
    pub recheck_interval_ms: u64,
    pub recent_capacity: usize,
    pub sync_interval_secs: u64,
    pub sync_batch_limit: usize,
    pub sync_lookback_hours: i64,
    pub log_debounce_ms: u64,
    pub log_batch_max: usize,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let state_dir = home.join(".relay-agent");

        Self {
            settings_file: state_dir.join("settings.json"),
            watermark_dir: state_dir.join("watermarks"),
            activity_log_file: state_dir.join("activity.log"),
            messages_db: home.join(".relay-agent/mmssms.db"),
            send_sms: PathBuf::from("/usr/local/bin/send-sms"),
            device_id: default_device_id(),
            state_dir,
            queue_poll_ms: 250,
            arrival_poll_ms: 1000,
            recheck_attempts: 10,
            recheck_interval_ms: 500,
            recent_capacity: 100,
            sync_interval_secs: 300,
            sync_batch_limit: 50,
            sync_lookback_hours: 24,
            log_debounce_ms: 2000,
            log_batch_max: 50,
        }
    }
}

impl Config {
    /// Create config for testing with custom paths
    pub fn for_test(temp_dir: &Path) -> Self {
        Self {
            state_dir: temp_dir.join("state"),
            settings_file: temp_dir.join("state/settings.json"),
            watermark_dir: temp_dir.join("state/watermarks"),
            activity_log_file: temp_dir.join("state/activity.log"),
            messages_db: temp_dir.join("mmssms.db"),
            send_sms: temp_dir.join("send-sms"),
            device_id: "test-device".to_string(),
            queue_poll_ms: 20,
            arrival_poll_ms: 50,
            recheck_attempts: 3,
            recheck_interval_ms: 20,
            recent_capacity: 100,
            sync_interval_secs: 300,
            sync_batch_limit: 50,
            sync_lookback_hours: 24,
            log_debounce_ms: 20,
            log_batch_max: 50,
        }
    }

    /// Default config with `RELAY_*` environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("RELAY_STATE_DIR") {
            config = config.with_state_dir(PathBuf::from(dir));
        }
        if let Ok(db) = std::env::var("RELAY_MESSAGES_DB") {
            config.messages_db = PathBuf::from(db);
        }
        if let Ok(send) = std::env::var("RELAY_SEND_SMS") {
            config.send_sms = PathBuf::from(send);
        }
        if let Ok(id) = std::env::var("RELAY_DEVICE_ID") {
            if !id.trim().is_empty() {
                config.device_id = id.trim().to_string();
            }
        }
        config
    }

    /// Re-root every state path under `state_dir`
    pub fn with_state_dir(mut self, state_dir: PathBuf) -> Self {
        self.settings_file = state_dir.join("settings.json");
        self.watermark_dir = state_dir.join("watermarks");
        self.activity_log_file = state_dir.join("activity.log");
        self.state_dir = state_dir;
        self
    }

    pub fn queue_poll(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms)
    }

    pub fn arrival_poll(&self) -> Duration {
        Duration::from_millis(self.arrival_poll_ms)
    }

    pub fn recheck_interval(&self) -> Duration {
        Duration::from_millis(self.recheck_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn sync_lookback(&self) -> chrono::Duration {
        chrono::Duration::hours(self.sync_lookback_hours)
    }

    pub fn log_debounce(&self) -> Duration {
        Duration::from_millis(self.log_debounce_ms)
    }
}

fn default_device_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "relay-agent".to_string())
}

/// Prefix used until the operator changes it
pub const DEFAULT_COMMAND_PREFIX: &str = "Relay";

/// Sender values the envelope decoder emits when the real address is unknown
pub const PLACEHOLDER_SENDERS: &[&str] = &["insert-address-token"];

/// URL schemes accepted for the mail and log relays
pub const ACCEPTED_URL_SCHEMES: &[&str] = &["http://", "https://"];
