//! Periodic catch-up sync
//!
//! A safety net behind every other intake path. Once per interval it scans
//! both message classes past its own watermarks and recovers records that
//! were never handled: unseen, younger than the lookback window, and not
//! already claimed by another path. Reaching this path means the primary
//! intake missed something, so recoveries are logged at warn level.
//!
//! The watermark always moves to the highest id observed in the pass, whether
//! or not anything was recoverable, so a range is never scanned twice.

use crate::activity_log::ActivityLog;
use crate::error::Result;
use crate::message::{is_placeholder_sender, MessageClass};
use crate::queue::IntakeSender;
use crate::recent::RecentRegistry;
use crate::shutdown::StopSignal;
use crate::store::MessageStore;
use crate::watermark::Watermark;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub interval: Duration,
    /// Maximum rows examined per class per pass
    pub batch_limit: usize,
    /// Records older than this are never recovered
    pub lookback: chrono::Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            batch_limit: 50,
            lookback: chrono::Duration::hours(24),
        }
    }
}

/// Per-class result of one pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSync {
    pub class: MessageClass,
    /// Rows examined past the watermark
    pub found: usize,
    /// Rows pushed to the intake queue
    pub processed: usize,
    pub watermark: i64,
    /// Set when the store could not be scanned this pass
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub classes: Vec<ClassSync>,
    pub duration: Duration,
}

impl SyncReport {
    pub fn get(&self, class: MessageClass) -> Option<&ClassSync> {
        self.classes.iter().find(|c| c.class == class)
    }

    pub fn total_processed(&self) -> usize {
        self.classes.iter().map(|c| c.processed).sum()
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .classes
            .iter()
            .map(|c| match &c.error {
                Some(e) => format!("{}: failed ({})", c.class, e),
                None => format!("{}: found {}, processed {}", c.class, c.found, c.processed),
            })
            .collect();
        write!(f, "{} in {} ms", parts.join("; "), self.duration.as_millis())
    }
}

struct Lane {
    store: Arc<dyn MessageStore>,
    watermark: Watermark,
}

struct Worker {
    stop: StopSignal,
    handle: JoinHandle<()>,
}

pub struct SyncManager {
    /// Holding this lock is what serializes passes
    lanes: Mutex<Vec<Lane>>,
    intake: IntakeSender,
    log: Arc<ActivityLog>,
    recent: RecentRegistry,
    config: SyncConfig,
    last_pass: Mutex<Option<Instant>>,
    worker: Mutex<Option<Worker>>,
}

impl SyncManager {
    pub fn new(
        stores: Vec<Arc<dyn MessageStore>>,
        intake: IntakeSender,
        log: Arc<ActivityLog>,
        recent: RecentRegistry,
        watermark_dir: &Path,
        config: SyncConfig,
    ) -> Result<Self> {
        let mut lanes = Vec::with_capacity(stores.len());
        for store in stores {
            let watermark = Watermark::load(watermark_dir, &format!("sync-{}", store.class()))?;
            lanes.push(Lane { store, watermark });
        }

        Ok(Self {
            lanes: Mutex::new(lanes),
            intake,
            log,
            recent,
            config,
            last_pass: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    /// Initialize any unset watermark to its store's current maximum
    pub fn initialize(&self) -> Result<()> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        let mut first_error = None;
        for lane in lanes.iter_mut() {
            if let Err(e) = ensure_initialized(lane) {
                warn!(class = %lane.store.class(), error = %e, "Could not initialize sync watermark");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn watermark(&self, class: MessageClass) -> Option<i64> {
        let lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        lanes
            .iter()
            .find(|l| l.store.class() == class)
            .and_then(|l| l.watermark.get())
    }

    /// Run one pass now and wait for it
    pub fn sync_now(&self) -> SyncReport {
        self.run_pass_at(Utc::now())
    }

    /// One pass using `now` as the reference time for the lookback window
    pub fn run_pass_at(&self, now: DateTime<Utc>) -> SyncReport {
        let started = Instant::now();
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());

        let classes = lanes
            .iter_mut()
            .map(|lane| self.sync_lane(lane, now))
            .collect();

        *self.last_pass.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());

        let report = SyncReport {
            classes,
            duration: started.elapsed(),
        };
        if report.total_processed() > 0 {
            info!(report = %report, "Catch-up sync recovered messages");
        } else {
            debug!(report = %report, "Catch-up sync pass complete");
        }
        report
    }

    fn sync_lane(&self, lane: &mut Lane, now: DateTime<Utc>) -> ClassSync {
        let class = lane.store.class();
        let mut result = ClassSync {
            class,
            found: 0,
            processed: 0,
            watermark: lane.watermark.current(),
            error: None,
        };

        if let Err(e) = ensure_initialized(lane) {
            result.error = Some(e.to_string());
            return result;
        }

        let before = lane.watermark.current();
        let rows = match lane.store.scan_after(before, Some(self.config.batch_limit)) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(class = %class, watermark = before, error = %e, "Catch-up scan failed");
                result.error = Some(e.to_string());
                result.watermark = before;
                return result;
            }
        };

        for row in rows {
            result.found += 1;
            lane.watermark.advance(row.id);

            if row.seen || now.signed_duration_since(row.received_at) >= self.config.lookback {
                continue;
            }
            if self.recent.contains(class, row.id) {
                continue;
            }

            let message = match row.message {
                Some(m) if !is_placeholder_sender(&m.sender) => m,
                _ => continue,
            };

            if !self.recent.insert(class, row.id) {
                continue;
            }

            warn!(class = %class, id = row.id, sender = %message.sender, "Recovered missed message");
            self.log
                .warn(format!("recovered missed {} #{} from {}", class, row.id, message.sender));
            if self.intake.enqueue(message) {
                result.processed += 1;
            }
        }

        if lane.watermark.current() > before {
            if let Err(e) = lane.watermark.persist() {
                warn!(class = %class, error = %e, "Failed to persist sync watermark");
            }
        }
        result.watermark = lane.watermark.current();
        result
    }

    /// Watermarks and time since the last pass
    pub fn status(&self) -> String {
        let lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        let marks: Vec<String> = lanes
            .iter()
            .map(|l| match l.watermark.get() {
                Some(v) => format!("{}={}", l.store.class(), v),
                None => format!("{}=unset", l.store.class()),
            })
            .collect();
        drop(lanes);

        let last = match *self.last_pass.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(at) => format!("last pass {}s ago", at.elapsed().as_secs()),
            None => "no pass yet".to_string(),
        };

        format!("sync watermarks: {}; {}", marks.join(", "), last)
    }

    /// Re-arm every watermark at its store's current maximum, discarding backlog
    pub fn reset(&self) -> Result<()> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        // All maxima first, so a failing store leaves every watermark untouched
        let maxima = lanes
            .iter()
            .map(|lane| lane.store.max_id())
            .collect::<Result<Vec<_>>>()?;
        for (lane, max) in lanes.iter_mut().zip(maxima) {
            lane.watermark.reset(max);
            lane.watermark.persist()?;
            info!(class = %lane.store.class(), watermark = max, "Sync watermark reset");
        }
        self.log.info("sync watermarks reset");
        Ok(())
    }

    /// Run a pass immediately, then every `interval` until stopped
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return Ok(());
        }

        // Logged per class; each pass retries uninitialized lanes
        let _ = self.initialize();

        let stop = StopSignal::new();
        let manager = self.clone();
        let thread_stop = stop.clone();
        let interval = self.config.interval;

        let handle = std::thread::Builder::new()
            .name("catch-up-sync".to_string())
            .spawn(move || loop {
                manager.sync_now();
                if thread_stop.wait(interval) {
                    break;
                }
            })?;

        *worker = Some(Worker { stop, handle });
        info!(interval_secs = interval.as_secs(), "Catch-up sync started");
        Ok(())
    }

    pub fn stop(&self) {
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(Worker { stop, handle }) = worker {
            stop.stop();
            let _ = handle.join();
            info!("Catch-up sync stopped");
        }
    }
}

fn ensure_initialized(lane: &mut Lane) -> Result<()> {
    if lane.watermark.is_initialized() {
        return Ok(());
    }
    let max = lane.store.max_id()?;
    lane.watermark.reset(max);
    lane.watermark.persist()?;
    info!(class = %lane.store.class(), watermark = max, "Initialized sync watermark");
    Ok(())
}
