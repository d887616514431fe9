//! The relay agent: every component wired together
//!
//! ```text
//!  ArrivalMonitor ──(direct rows)───────────────┐
//!        │                                      ▼
//!        └─(envelope change)→ Reconciliation → IntakeQueue → RelayProcessor
//!                                               ▲              ├─ CommandDispatcher
//!  SyncManager ──(recovered rows)───────────────┘              └─ ForwardingEngine
//! ```
//!
//! Settings, the activity log and the recent-id registry are shared by
//! injection; nothing is global.

use crate::activity_log::ActivityLog;
use crate::arrival::ArrivalMonitor;
use crate::config::Config;
use crate::dispatch::{CommandDispatcher, CommandResult};
use crate::error::Result;
use crate::forward::ForwardingEngine;
use crate::http::{HttpRelay, LogRelay, MailRelay};
use crate::message::Message;
use crate::processor::RelayProcessor;
use crate::queue::{IntakeQueue, QueueState};
use crate::recent::RecentRegistry;
use crate::reconcile::{ReconcileConfig, ReconciliationScanner};
use crate::sender::{CommandSender, SendPrimitive};
use crate::settings::SettingsStore;
use crate::sqlite_store::{SqliteDirectStore, SqliteEnvelopeStore};
use crate::store::MessageStore;
use crate::sync::{SyncConfig, SyncManager, SyncReport};
use std::fs;
use std::sync::Arc;
use tracing::info;

/// External collaborators the agent talks to
pub struct Collaborators {
    pub direct: Arc<dyn MessageStore>,
    pub enveloped: Arc<dyn MessageStore>,
    pub sender: Arc<dyn SendPrimitive>,
    pub mail: Arc<dyn MailRelay>,
    pub log_relay: Arc<dyn LogRelay>,
}

impl Collaborators {
    /// SQLite stores, the send CLI and the HTTP relays named by `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        let http = Arc::new(HttpRelay::new()?);
        Ok(Self {
            direct: Arc::new(SqliteDirectStore::new(&config.messages_db)),
            enveloped: Arc::new(SqliteEnvelopeStore::new(&config.messages_db)),
            sender: Arc::new(CommandSender::new(&config.send_sms)),
            mail: http.clone(),
            log_relay: http,
        })
    }
}

pub struct RelayAgent {
    config: Config,
    settings: Arc<SettingsStore>,
    log: Arc<ActivityLog>,
    log_relay: Arc<dyn LogRelay>,
    queue: IntakeQueue,
    processor: Arc<RelayProcessor>,
    dispatcher: Arc<CommandDispatcher>,
    scanner: Arc<ReconciliationScanner>,
    sync: Arc<SyncManager>,
    arrival: Arc<ArrivalMonitor>,
}

impl RelayAgent {
    pub fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        fs::create_dir_all(&config.state_dir)?;
        fs::create_dir_all(&config.watermark_dir)?;

        let settings = Arc::new(SettingsStore::open(&config.settings_file)?);
        let log = Arc::new(ActivityLog::new(&config.activity_log_file, settings.clone()));
        let queue = IntakeQueue::new(config.queue_poll());
        let recent = RecentRegistry::new(config.recent_capacity);

        let Collaborators {
            direct,
            enveloped,
            sender,
            mail,
            log_relay,
        } = collaborators;

        let dispatcher = Arc::new(CommandDispatcher::new(settings.clone(), sender.clone(), log.clone()));
        let forwarder = ForwardingEngine::new(settings.clone(), sender.clone(), mail, log.clone());
        let processor = Arc::new(RelayProcessor::new(
            settings.clone(),
            dispatcher.clone(),
            forwarder,
            sender,
            log.clone(),
        ));

        let scanner = Arc::new(ReconciliationScanner::new(
            enveloped.clone(),
            queue.sender(),
            log.clone(),
            recent.clone(),
            &config.watermark_dir,
            ReconcileConfig {
                recheck_attempts: config.recheck_attempts,
                recheck_interval: config.recheck_interval(),
            },
        )?);

        let sync = Arc::new(SyncManager::new(
            vec![direct.clone(), enveloped.clone()],
            queue.sender(),
            log.clone(),
            recent.clone(),
            &config.watermark_dir,
            SyncConfig {
                interval: config.sync_interval(),
                batch_limit: config.sync_batch_limit,
                lookback: config.sync_lookback(),
            },
        )?);

        let arrival = Arc::new(ArrivalMonitor::new(
            direct,
            enveloped,
            queue.sender(),
            scanner.clone(),
            recent,
            config.arrival_poll(),
        ));

        Ok(Self {
            config,
            settings,
            log,
            log_relay,
            queue,
            processor,
            dispatcher,
            scanner,
            sync,
            arrival,
        })
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn activity_log(&self) -> &Arc<ActivityLog> {
        &self.log
    }

    pub fn queue_state(&self) -> QueueState {
        self.queue.state()
    }

    /// Start every background component. The consumer starts first so nothing
    /// pushed by the scanners waits longer than necessary.
    pub fn start(&self) -> Result<()> {
        self.log.attach_shipper(
            self.log_relay.clone(),
            self.config.device_id.clone(),
            self.config.log_debounce(),
            self.config.log_batch_max,
        );
        self.queue.start(self.processor.clone())?;
        self.scanner.start()?;
        self.sync.start()?;
        self.arrival.start()?;

        info!(state_dir = %self.config.state_dir.display(), "Relay agent started");
        self.log.info("relay agent started");
        Ok(())
    }

    /// Stop producers first, then the consumer. Messages already queued but
    /// not yet handled stay buffered.
    pub fn stop(&self) {
        self.arrival.stop();
        self.sync.stop();
        self.scanner.stop();
        self.queue.stop();
        self.log.info("relay agent stopped");
        self.log.detach_shipper();
        info!("Relay agent stopped");
    }

    /// In-band delivery of a message
    pub fn enqueue(&self, message: Message) -> bool {
        self.queue.enqueue(message)
    }

    /// Change notification for the enveloped store, backed by a bounded re-check
    pub fn trigger_reconciliation(&self) {
        self.scanner.notify();
        self.scanner.request_recheck();
    }

    /// Run a command synchronously, outside the intake queue
    pub fn process(&self, sender: &str, command_text: &str) -> CommandResult {
        self.dispatcher.process(sender, command_text)
    }

    /// Handle queued messages on the calling thread while the agent is stopped
    pub fn drain_pending(&self) -> Result<usize> {
        self.queue.drain(self.processor.as_ref())
    }

    pub fn sync_now(&self) -> SyncReport {
        self.sync.sync_now()
    }

    pub fn sync_status(&self) -> String {
        self.sync.status()
    }

    pub fn reset_sync(&self) -> Result<()> {
        self.sync.reset()
    }

    pub fn config_summary(&self) -> String {
        let summary = self.settings.read(|s| s.summary());
        format!(
            "{}\nqueue: {} (handled {}, failed {})\nreconcile watermark: {}\n{}",
            summary,
            self.queue.state(),
            self.queue.handled_count(),
            self.queue.failed_count(),
            self.scanner.watermark(),
            self.sync.status()
        )
    }
}

impl Drop for RelayAgent {
    fn drop(&mut self) {
        self.arrival.stop();
        self.sync.stop();
        self.scanner.stop();
        self.queue.stop();
    }
}
