//! Reconciliation scanner for enveloped messages
//!
//! Enveloped (multimedia) arrivals only raise a bare change signal, so the
//! content has to be pulled from the store. Two things trigger a scan:
//!
//! - `notify()`: the store's change notification
//! - `request_recheck()`: a bounded retry loop, because the store can lag the
//!   notification by a little and the notification itself is unreliable
//!
//! Both land in a single pending slot consumed by the scanner's own thread.
//! Passes are serialized: the watermark lock is held for the whole pass.
//!
//! Every scanned row advances the watermark, even if it can't be decoded, so
//! nothing is ever rescanned. A store failure aborts the pass and leaves the
//! watermark alone, so the next trigger retries the same range.

use crate::activity_log::ActivityLog;
use crate::error::Result;
use crate::message::is_placeholder_sender;
use crate::queue::IntakeSender;
use crate::recent::RecentRegistry;
use crate::shutdown::StopSignal;
use crate::store::MessageStore;
use crate::watermark::Watermark;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often the idle loop re-checks the stop signal
const IDLE_WAKE: Duration = Duration::from_millis(200);

/// Pending scan request. A re-check subsumes a plain change scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Trigger {
    Changed,
    Recheck,
}

/// What one pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub scanned: usize,
    pub enqueued: usize,
    pub duplicates: usize,
    pub placeholders: usize,
    pub undecoded: usize,
    /// True if the watermark moved forward during this pass
    pub advanced: bool,
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Retries after the immediate attempt
    pub recheck_attempts: u32,
    pub recheck_interval: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            recheck_attempts: 10,
            recheck_interval: Duration::from_millis(500),
        }
    }
}

struct Worker {
    stop: StopSignal,
    handle: JoinHandle<()>,
}

pub struct ReconciliationScanner {
    store: Arc<dyn MessageStore>,
    intake: IntakeSender,
    log: Arc<ActivityLog>,
    config: ReconcileConfig,
    watermark: Mutex<Watermark>,
    recent: RecentRegistry,
    pending: Arc<(Mutex<Option<Trigger>>, Condvar)>,
    worker: Mutex<Option<Worker>>,
}

impl ReconciliationScanner {
    pub fn new(
        store: Arc<dyn MessageStore>,
        intake: IntakeSender,
        log: Arc<ActivityLog>,
        recent: RecentRegistry,
        watermark_dir: &Path,
        config: ReconcileConfig,
    ) -> Result<Self> {
        let name = format!("reconcile-{}", store.class());
        let watermark = Watermark::load(watermark_dir, &name)?;

        Ok(Self {
            store,
            intake,
            log,
            config,
            watermark: Mutex::new(watermark),
            recent,
            pending: Arc::new((Mutex::new(None), Condvar::new())),
            worker: Mutex::new(None),
        })
    }

    /// Current watermark (0 until initialized)
    pub fn watermark(&self) -> i64 {
        self.watermark
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .current()
    }

    /// First run: start at the store's current maximum so history isn't replayed
    fn ensure_initialized(&self, watermark: &mut Watermark) -> Result<()> {
        if watermark.is_initialized() {
            return Ok(());
        }
        let max = self.store.max_id()?;
        watermark.reset(max);
        if let Err(e) = watermark.persist() {
            warn!(error = %e, "Failed to persist initial reconcile watermark");
        }
        info!(class = %self.store.class(), watermark = max, "Initialized reconcile watermark");
        Ok(())
    }

    /// Initialize the watermark now instead of on the first pass
    pub fn initialize(&self) -> Result<i64> {
        let mut watermark = self.watermark.lock().unwrap_or_else(|e| e.into_inner());
        self.ensure_initialized(&mut watermark)?;
        Ok(watermark.current())
    }

    /// One pass over `id > watermark`
    pub fn scan_once(&self) -> Result<ScanOutcome> {
        let mut watermark = self.watermark.lock().unwrap_or_else(|e| e.into_inner());
        self.ensure_initialized(&mut watermark)?;

        let before = watermark.current();
        let rows = match self.store.scan_after(before, None) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(class = %self.store.class(), watermark = before, error = %e, "Reconcile scan failed");
                return Err(e);
            }
        };

        let mut outcome = ScanOutcome::default();

        for row in rows {
            outcome.scanned += 1;
            watermark.advance(row.id);

            if !self.recent.insert(self.store.class(), row.id) {
                outcome.duplicates += 1;
                debug!(id = row.id, "Skipping recently handled record");
                continue;
            }

            let message = match row.message {
                Some(m) => m,
                None => {
                    outcome.undecoded += 1;
                    warn!(id = row.id, "Could not extract enveloped message");
                    self.log.warn(format!("could not extract {} #{}", self.store.class(), row.id));
                    continue;
                }
            };

            if is_placeholder_sender(&message.sender) {
                outcome.placeholders += 1;
                debug!(id = row.id, sender = %message.sender, "Skipping placeholder sender");
                continue;
            }

            info!(id = row.id, sender = %message.sender, "Reconciled enveloped message");
            self.log.debug(format!("queued {} #{} from {}", self.store.class(), row.id, message.sender));
            if self.intake.enqueue(message) {
                outcome.enqueued += 1;
            } else {
                warn!(id = row.id, "Intake queue is gone, dropping record");
            }
        }

        if watermark.current() > before {
            outcome.advanced = true;
            if let Err(e) = watermark.persist() {
                warn!(error = %e, "Failed to persist reconcile watermark");
            }
        }

        Ok(outcome)
    }

    /// Immediate scan, then up to `recheck_attempts` more until the watermark moves.
    ///
    /// Returns true if something new was found. Running out of attempts is not
    /// an error: the record may already have arrived through another path.
    pub fn recheck(&self, stop: &StopSignal) -> bool {
        for attempt in 0..=self.config.recheck_attempts {
            if attempt > 0 && stop.wait(self.config.recheck_interval) {
                return false;
            }
            match self.scan_once() {
                Ok(outcome) if outcome.advanced => {
                    debug!(attempt = attempt, enqueued = outcome.enqueued, "Re-check found new records");
                    return true;
                }
                Ok(_) => {}
                Err(e) => debug!(attempt = attempt, error = %e, "Re-check pass failed"),
            }
        }
        info!(
            attempts = self.config.recheck_attempts + 1,
            "Re-check found nothing new"
        );
        false
    }

    fn post(&self, trigger: Trigger) {
        let (lock, cvar) = &*self.pending;
        let mut slot = lock.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(slot.map_or(trigger, |t| t.max(trigger)));
        cvar.notify_one();
    }

    /// Store change notification
    pub fn notify(&self) {
        self.post(Trigger::Changed);
    }

    /// Explicit re-check request (bounded retry)
    pub fn request_recheck(&self) {
        self.post(Trigger::Recheck);
    }

    fn next_trigger(&self, stop: &StopSignal) -> Option<Trigger> {
        let (lock, cvar) = &*self.pending;
        let mut slot = lock.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if stop.is_stopped() {
                return None;
            }
            if let Some(trigger) = slot.take() {
                return Some(trigger);
            }
            slot = cvar
                .wait_timeout(slot, IDLE_WAKE)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// Start the scanner thread
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return Ok(());
        }

        if let Err(e) = self.initialize() {
            // Retried lazily on the first pass
            warn!(error = %e, "Could not initialize reconcile watermark");
        }

        let stop = StopSignal::new();
        let scanner = self.clone();
        let thread_stop = stop.clone();

        let handle = std::thread::Builder::new()
            .name("reconcile-scanner".to_string())
            .spawn(move || {
                while let Some(trigger) = scanner.next_trigger(&thread_stop) {
                    match trigger {
                        Trigger::Changed => {
                            let _ = scanner.scan_once();
                        }
                        Trigger::Recheck => {
                            scanner.recheck(&thread_stop);
                        }
                    }
                }
                debug!("Reconcile scanner loop exited");
            })?;

        *worker = Some(Worker { stop, handle });
        info!(class = %self.store.class(), "Reconcile scanner started");
        Ok(())
    }

    pub fn stop(&self) {
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(Worker { stop, handle }) = worker {
            stop.stop();
            self.pending.1.notify_all();
            let _ = handle.join();
            info!("Reconcile scanner stopped");
        }
    }
}
