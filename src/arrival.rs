//! Arrival monitor
//!
//! Stands in for the platform's arrival broadcasts by polling the stores.
//! New direct rows are delivered straight to the intake queue (the in-band
//! path). For the enveloped store only the maximum id is watched: a change is
//! passed to the reconciliation scanner as a bare notification, followed by an
//! explicit re-check request.

use crate::error::Result;
use crate::message::{is_placeholder_sender, MessageClass};
use crate::queue::IntakeSender;
use crate::recent::RecentRegistry;
use crate::reconcile::ReconciliationScanner;
use crate::shutdown::StopSignal;
use crate::store::MessageStore;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What one poll observed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// Direct messages pushed to the intake queue
    pub delivered: usize,
    /// True when the enveloped store grew and the scanner was notified
    pub envelope_changed: bool,
}

#[derive(Debug, Default)]
struct Marks {
    direct: Option<i64>,
    enveloped: Option<i64>,
}

struct Worker {
    stop: StopSignal,
    handle: JoinHandle<()>,
}

pub struct ArrivalMonitor {
    direct: Arc<dyn MessageStore>,
    enveloped: Arc<dyn MessageStore>,
    intake: IntakeSender,
    scanner: Arc<ReconciliationScanner>,
    recent: RecentRegistry,
    poll_interval: Duration,
    marks: Mutex<Marks>,
    worker: Mutex<Option<Worker>>,
}

impl ArrivalMonitor {
    pub fn new(
        direct: Arc<dyn MessageStore>,
        enveloped: Arc<dyn MessageStore>,
        intake: IntakeSender,
        scanner: Arc<ReconciliationScanner>,
        recent: RecentRegistry,
        poll_interval: Duration,
    ) -> Self {
        Self {
            direct,
            enveloped,
            intake,
            scanner,
            recent,
            poll_interval,
            marks: Mutex::new(Marks::default()),
            worker: Mutex::new(None),
        }
    }

    /// Check both stores once.
    ///
    /// The first successful poll of each store only records its current
    /// maximum, so nothing that predates the monitor is delivered. A failing
    /// store does not keep the other one from being polled; the first error is
    /// returned once both have run.
    pub fn poll_once(&self) -> Result<PollOutcome> {
        let mut marks = self.marks.lock().unwrap_or_else(|e| e.into_inner());
        let mut outcome = PollOutcome::default();

        let direct = self.poll_direct(&mut marks, &mut outcome);
        if let Err(e) = &direct {
            warn!(class = %MessageClass::Direct, error = %e, "Arrival poll failed");
        }
        let enveloped = self.poll_enveloped(&mut marks, &mut outcome);
        if let Err(e) = &enveloped {
            warn!(class = %MessageClass::Enveloped, error = %e, "Arrival poll failed");
        }

        direct.and(enveloped).map(|_| outcome)
    }

    fn poll_direct(&self, marks: &mut Marks, outcome: &mut PollOutcome) -> Result<()> {
        let Some(mark) = marks.direct else {
            marks.direct = Some(self.direct.max_id()?);
            return Ok(());
        };

        for row in self.direct.scan_after(mark, None)? {
            marks.direct = Some(row.id.max(marks.direct.unwrap_or(row.id)));
            let Some(message) = row.message else {
                continue;
            };
            if is_placeholder_sender(&message.sender) {
                continue;
            }
            if !self.recent.insert(MessageClass::Direct, row.id) {
                debug!(id = row.id, "Direct message already handled");
                continue;
            }
            debug!(id = row.id, sender = %message.sender, "Direct message arrived");
            if self.intake.enqueue(message) {
                outcome.delivered += 1;
            }
        }
        Ok(())
    }

    fn poll_enveloped(&self, marks: &mut Marks, outcome: &mut PollOutcome) -> Result<()> {
        let max = self.enveloped.max_id()?;
        match marks.enveloped {
            Some(previous) if max > previous => {
                debug!(previous = previous, max = max, "Enveloped store changed");
                self.scanner.notify();
                self.scanner.request_recheck();
                outcome.envelope_changed = true;
            }
            _ => {}
        }
        marks.enveloped = Some(max.max(marks.enveloped.unwrap_or(max)));
        Ok(())
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return Ok(());
        }

        // Record the current maxima before returning so later arrivals count as new
        let _ = self.poll_once();

        let stop = StopSignal::new();
        let monitor = self.clone();
        let thread_stop = stop.clone();
        let interval = self.poll_interval;

        let handle = std::thread::Builder::new()
            .name("arrival-monitor".to_string())
            .spawn(move || {
                while !thread_stop.wait(interval) {
                    let _ = monitor.poll_once();
                }
            })?;

        *worker = Some(Worker { stop, handle });
        info!(interval_ms = interval.as_millis() as u64, "Arrival monitor started");
        Ok(())
    }

    pub fn stop(&self) {
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(Worker { stop, handle }) = worker {
            stop.stop();
            let _ = handle.join();
            info!("Arrival monitor stopped");
        }
    }
}
