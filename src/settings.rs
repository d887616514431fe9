//! Persisted relay settings
//!
//! A single JSON record, cached in memory. Reads clone from the cache and never
//! touch disk. Every mutation runs load-modify-persist as one critical section
//! under the writer lock, and the cache only changes after the write succeeded.

use crate::atomic_file::write_atomic;
use crate::config::DEFAULT_COMMAND_PREFIX;
use crate::error::{Error, Result};
use crate::forward::clean_number;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

/// Operator-controlled relay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    pub command_prefix: String,
    pub mail_relay_url: Option<String>,
    pub log_relay_url: Option<String>,
    /// Phone numbers and email addresses, in insertion order
    pub destinations: Vec<String>,
    /// Alias name -> phone number
    pub aliases: BTreeMap<String, String>,
    pub verbose_logging: bool,
    /// Senders whose content is never forwarded
    pub blocked: Vec<String>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            command_prefix: DEFAULT_COMMAND_PREFIX.to_string(),
            mail_relay_url: None,
            log_relay_url: None,
            destinations: Vec::new(),
            aliases: BTreeMap::new(),
            verbose_logging: false,
            blocked: Vec::new(),
        }
    }
}

impl RelaySettings {
    /// Index of a destination, compared case-insensitively
    pub fn destination_index(&self, value: &str) -> Option<usize> {
        self.destinations
            .iter()
            .position(|d| d.eq_ignore_ascii_case(value))
    }

    /// Stored key of an alias, compared case-insensitively
    pub fn alias_key(&self, name: &str) -> Option<&str> {
        self.aliases
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
            .map(|k| k.as_str())
    }

    pub fn alias_number(&self, name: &str) -> Option<&str> {
        let key = self.alias_key(name)?;
        self.aliases.get(key).map(|n| n.as_str())
    }

    /// Reverse lookup: alias name whose number matches after normalization
    pub fn alias_for_number(&self, number: &str) -> Option<&str> {
        let wanted = clean_number(number);
        if wanted.is_empty() {
            return None;
        }
        self.aliases
            .iter()
            .find(|(_, n)| clean_number(n) == wanted)
            .map(|(k, _)| k.as_str())
    }

    /// Name shown for a sender: its alias when one exists
    pub fn display_name<'a>(&'a self, sender: &'a str) -> &'a str {
        self.alias_for_number(sender).unwrap_or(sender)
    }

    pub fn is_blocked(&self, sender: &str) -> bool {
        let cleaned = clean_number(sender);
        self.blocked.iter().any(|b| {
            b.eq_ignore_ascii_case(sender) || (!cleaned.is_empty() && clean_number(b) == cleaned)
        })
    }

    /// Multi-line human readable summary
    pub fn summary(&self) -> String {
        let list = |items: &[String]| {
            if items.is_empty() {
                "none".to_string()
            } else {
                items.join(", ")
            }
        };
        let aliases: Vec<String> = self
            .aliases
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let url = |u: &Option<String>| u.clone().unwrap_or_else(|| "disabled".to_string());

        format!(
            "prefix: {}\ndestinations ({}): {}\naliases ({}): {}\nmail relay: {}\nlog relay: {}\nverbose: {}\nblocked ({}): {}",
            self.command_prefix,
            self.destinations.len(),
            list(&self.destinations),
            aliases.len(),
            list(&aliases),
            url(&self.mail_relay_url),
            url(&self.log_relay_url),
            if self.verbose_logging { "on" } else { "off" },
            self.blocked.len(),
            list(&self.blocked),
        )
    }
}

/// Cached, lock-guarded settings persisted as JSON
pub struct SettingsStore {
    path: PathBuf,
    cache: RwLock<RelaySettings>,
    writer: Mutex<()>,
}

impl SettingsStore {
    /// Load settings from disk, falling back to defaults when the file is missing
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?
        } else {
            RelaySettings::default()
        };

        if settings.command_prefix.trim().is_empty() {
            return Err(Error::Config("command prefix must not be empty".to_string()));
        }

        Ok(Self {
            path,
            cache: RwLock::new(settings),
            writer: Mutex::new(()),
        })
    }

    /// Clone of the cached settings
    pub fn snapshot(&self) -> RelaySettings {
        self.read(|s| s.clone())
    }

    /// Run `f` against the cached settings
    pub fn read<R>(&self, f: impl FnOnce(&RelaySettings) -> R) -> R {
        let guard = self.cache.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    /// Apply `f` to a copy of the settings and persist it if anything changed.
    ///
    /// Returns `Error::Persist` when the write fails; the cache then keeps its
    /// previous value.
    pub fn update<R>(&self, f: impl FnOnce(&mut RelaySettings) -> R) -> Result<R> {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());

        let current = self.snapshot();
        let mut next = current.clone();
        let result = f(&mut next);

        if next != current {
            self.save(&next)?;
            let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
            *cache = next;
        }

        Ok(result)
    }

    fn save(&self, settings: &RelaySettings) -> Result<()> {
        let json = serde_json::to_string_pretty(settings)?;
        write_atomic(&self.path, json.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_when_missing() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::open(dir.path().join("settings.json")).unwrap();
        let s = store.snapshot();
        assert_eq!(s.command_prefix, DEFAULT_COMMAND_PREFIX);
        assert!(s.destinations.is_empty());
        assert!(!s.verbose_logging);
    }

    #[test]
    fn test_update_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::open(&path).unwrap();

        store
            .update(|s| {
                s.destinations.push("a@b.com".to_string());
                s.aliases.insert("Mom".to_string(), "+15551112222".to_string());
            })
            .unwrap();

        let reloaded = SettingsStore::open(&path).unwrap();
        let s = reloaded.snapshot();
        assert_eq!(s.destinations, vec!["a@b.com".to_string()]);
        assert_eq!(s.alias_number("mom"), Some("+15551112222"));
    }

    #[test]
    fn test_unchanged_update_does_not_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::open(&path).unwrap();
        let n = store.update(|s| s.destinations.len()).unwrap();
        assert_eq!(n, 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_persist_failure_keeps_cache() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "x").unwrap();
        let store = SettingsStore::open(blocker.join("settings.json")).unwrap();

        let err = store
            .update(|s| s.destinations.push("+15550000000".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Persist(_)));
        assert!(store.snapshot().destinations.is_empty());
    }

    #[test]
    fn test_empty_prefix_rejected_on_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"commandPrefix": "  "}"#).unwrap();
        assert!(matches!(SettingsStore::open(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"destinations": ["x@y.com"]}"#).unwrap();
        let s = SettingsStore::open(&path).unwrap().snapshot();
        assert_eq!(s.command_prefix, DEFAULT_COMMAND_PREFIX);
        assert_eq!(s.destinations.len(), 1);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SettingsStore::open(dir.path().join("settings.json")).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .update(|s| s.destinations.push(format!("+1555000{:04}", i)))
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.snapshot().destinations.len(), 8);
    }

    #[test]
    fn test_alias_reverse_lookup_normalizes() {
        let mut s = RelaySettings::default();
        s.aliases.insert("Bob".to_string(), "+1 (555) 123-4567".to_string());
        assert_eq!(s.alias_for_number("+15551234567"), Some("Bob"));
        assert_eq!(s.display_name("+15551234567"), "Bob");
        assert_eq!(s.display_name("+19999999999"), "+19999999999");
        assert_eq!(s.alias_for_number("abc"), None);
    }

    #[test]
    fn test_is_blocked() {
        let mut s = RelaySettings::default();
        s.blocked.push("+15551234567".to_string());
        s.blocked.push("Spam@Example.com".to_string());
        assert!(s.is_blocked("+1 555 123 4567"));
        assert!(s.is_blocked("spam@example.com"));
        assert!(!s.is_blocked("+15550000000"));
    }

    #[test]
    fn test_summary() {
        let mut s = RelaySettings::default();
        s.destinations.push("a@b.com".to_string());
        let summary = s.summary();
        assert!(summary.contains("prefix: Relay"));
        assert!(summary.contains("destinations (1): a@b.com"));
        assert!(summary.contains("mail relay: disabled"));
    }
}
