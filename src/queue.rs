//! Message intake queue and its single consumer
//!
//! Every intake path (in-band delivery, reconciliation scans, catch-up sync)
//! pushes onto one queue. A single consumer thread drains it in arrival order,
//! so no two messages are ever handled concurrently.
//!
//! ```text
//!                  start()              (thread up)
//! Stopped ─────────────────→ Starting ─────────────→ Running
//!    ↑                                                  │
//!    │            (worker joined)                       │ stop()
//!    └─────────────────────────── Stopping ←────────────┘
//! ```
//!
//! Messages enqueued while stopped stay buffered until the next `start()`.

use crate::error::{Error, Result};
use crate::message::Message;
use crate::shutdown::StopSignal;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info};

/// Handles one message at a time on the consumer thread
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: Message) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueState::Stopped => write!(f, "Stopped"),
            QueueState::Starting => write!(f, "Starting"),
            QueueState::Running => write!(f, "Running"),
            QueueState::Stopping => write!(f, "Stopping"),
        }
    }
}

/// Producer handle; cheap to clone, never blocks
#[derive(Clone)]
pub struct IntakeSender {
    tx: Sender<Message>,
}

impl IntakeSender {
    /// Push a message. Returns false only if the queue itself is gone.
    pub fn enqueue(&self, message: Message) -> bool {
        self.tx.send(message).is_ok()
    }
}

#[derive(Debug, Default)]
struct Counters {
    handled: AtomicU64,
    failed: AtomicU64,
}

struct Worker {
    stop: StopSignal,
    handle: JoinHandle<()>,
}

pub struct IntakeQueue {
    tx: Sender<Message>,
    rx: Arc<Mutex<Option<Receiver<Message>>>>,
    state: Mutex<QueueState>,
    worker: Mutex<Option<Worker>>,
    counters: Arc<Counters>,
    poll_timeout: Duration,
}

impl IntakeQueue {
    pub fn new(poll_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(Some(rx))),
            state: Mutex::new(QueueState::Stopped),
            worker: Mutex::new(None),
            counters: Arc::new(Counters::default()),
            poll_timeout,
        }
    }

    pub fn sender(&self) -> IntakeSender {
        IntakeSender {
            tx: self.tx.clone(),
        }
    }

    pub fn enqueue(&self, message: Message) -> bool {
        self.tx.send(message).is_ok()
    }

    pub fn state(&self) -> QueueState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: QueueState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Messages the handler completed without error
    pub fn handled_count(&self) -> u64 {
        self.counters.handled.load(Ordering::Relaxed)
    }

    /// Messages whose handler returned an error or panicked
    pub fn failed_count(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    /// Start the consumer thread
    pub fn start(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != QueueState::Stopped {
                return Err(Error::InvalidState {
                    expected: QueueState::Stopped.to_string(),
                    actual: state.to_string(),
                });
            }
            *state = QueueState::Starting;
        }

        let rx = match self.rx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(rx) => rx,
            None => {
                self.set_state(QueueState::Stopped);
                return Err(Error::InvalidState {
                    expected: "idle receiver".to_string(),
                    actual: "receiver in use".to_string(),
                });
            }
        };

        let stop = StopSignal::new();
        let worker_stop = stop.clone();
        let slot = self.rx.clone();
        let counters = self.counters.clone();
        let poll = self.poll_timeout;

        let spawned = std::thread::Builder::new()
            .name("intake-consumer".to_string())
            .spawn(move || {
                consume(&rx, handler.as_ref(), &worker_stop, poll, &counters);
                // Hand the receiver back so buffered messages survive a restart
                *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(rx);
            });

        match spawned {
            Ok(handle) => {
                *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(Worker { stop, handle });
                self.set_state(QueueState::Running);
                info!("Intake consumer started");
                Ok(())
            }
            Err(e) => {
                self.set_state(QueueState::Stopped);
                Err(Error::Io(e))
            }
        }
    }

    /// Handle every buffered message on the calling thread.
    ///
    /// Only valid while stopped; used by one-shot runs that have no consumer.
    pub fn drain(&self, handler: &dyn MessageHandler) -> Result<usize> {
        let state = self.state();
        if state != QueueState::Stopped {
            return Err(Error::InvalidState {
                expected: QueueState::Stopped.to_string(),
                actual: state.to_string(),
            });
        }

        let slot = self.rx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(rx) = slot.as_ref() else {
            return Ok(0);
        };

        let mut count = 0;
        while let Ok(message) = rx.try_recv() {
            handle_one(handler, message, &self.counters);
            count += 1;
        }
        Ok(count)
    }

    /// Signal the consumer and wait for it. An in-flight message finishes first.
    pub fn stop(&self) {
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(Worker { stop, handle }) = worker else {
            return;
        };

        self.set_state(QueueState::Stopping);
        stop.stop();
        if handle.join().is_err() {
            error!("Intake consumer thread panicked");
        }
        self.set_state(QueueState::Stopped);
        info!("Intake consumer stopped");
    }
}

impl Drop for IntakeQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn consume(
    rx: &Receiver<Message>,
    handler: &dyn MessageHandler,
    stop: &StopSignal,
    poll: Duration,
    counters: &Counters,
) {
    while !stop.is_stopped() {
        let message = match rx.recv_timeout(poll) {
            Ok(m) => m,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        handle_one(handler, message, counters);
    }
}

/// Run the handler for one message. Errors and panics are logged, never propagated.
fn handle_one(handler: &dyn MessageHandler, message: Message, counters: &Counters) {
    let sender = message.sender.clone();
    debug!(sender = %sender, "Handling message");

    match catch_unwind(AssertUnwindSafe(|| handler.handle(message))) {
        Ok(Ok(())) => {
            counters.handled.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Err(e)) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(sender = %sender, kind = ?e.kind(), error = %e, "Message handler failed");
        }
        Err(_) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(sender = %sender, "Message handler panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Instant;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<String>>,
    }

    impl MessageHandler for Recording {
        fn handle(&self, message: Message) -> Result<()> {
            if message.body == "panic" {
                panic!("boom");
            }
            if message.body == "fail" {
                return Err(Error::Transport("nope".to_string()));
            }
            self.seen.lock().unwrap().push(message.body);
            Ok(())
        }
    }

    fn msg(body: &str) -> Message {
        Message::new("+15550001111", body, Utc::now())
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_fifo_order() {
        let queue = IntakeQueue::new(Duration::from_millis(10));
        let handler = Arc::new(Recording::default());
        queue.start(handler.clone()).unwrap();
        assert_eq!(queue.state(), QueueState::Running);

        let sender = queue.sender();
        for i in 0..20 {
            assert!(sender.enqueue(msg(&format!("m{}", i))));
        }

        assert!(wait_for(|| handler.seen.lock().unwrap().len() == 20));
        let seen = handler.seen.lock().unwrap().clone();
        let expected: Vec<String> = (0..20).map(|i| format!("m{}", i)).collect();
        assert_eq!(seen, expected);
        queue.stop();
        assert_eq!(queue.state(), QueueState::Stopped);
    }

    #[test]
    fn test_handler_errors_and_panics_do_not_stop_loop() {
        let queue = IntakeQueue::new(Duration::from_millis(10));
        let handler = Arc::new(Recording::default());
        queue.start(handler.clone()).unwrap();

        queue.enqueue(msg("before"));
        queue.enqueue(msg("panic"));
        queue.enqueue(msg("fail"));
        queue.enqueue(msg("after"));

        assert!(wait_for(|| handler.seen.lock().unwrap().len() == 2));
        assert!(wait_for(|| queue.failed_count() == 2));
        assert_eq!(queue.handled_count(), 2);
        assert_eq!(queue.state(), QueueState::Running);
        queue.stop();
    }

    #[test]
    fn test_buffers_while_stopped() {
        let queue = IntakeQueue::new(Duration::from_millis(10));
        let handler = Arc::new(Recording::default());

        queue.enqueue(msg("early"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(handler.seen.lock().unwrap().is_empty());

        queue.start(handler.clone()).unwrap();
        assert!(wait_for(|| handler.seen.lock().unwrap().len() == 1));
        queue.stop();

        queue.enqueue(msg("while stopped"));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(handler.seen.lock().unwrap().len(), 1);

        queue.start(handler.clone()).unwrap();
        assert!(wait_for(|| handler.seen.lock().unwrap().len() == 2));
        queue.stop();
    }

    #[test]
    fn test_double_start_rejected() {
        let queue = IntakeQueue::new(Duration::from_millis(10));
        let handler = Arc::new(Recording::default());
        queue.start(handler.clone()).unwrap();
        assert!(matches!(
            queue.start(handler),
            Err(Error::InvalidState { .. })
        ));
        queue.stop();
    }

    #[test]
    fn test_drain_while_stopped() {
        let queue = IntakeQueue::new(Duration::from_millis(10));
        let handler = Recording::default();
        queue.enqueue(msg("a"));
        queue.enqueue(msg("fail"));
        queue.enqueue(msg("b"));

        assert_eq!(queue.drain(&handler).unwrap(), 3);
        assert_eq!(*handler.seen.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(queue.failed_count(), 1);
        assert_eq!(queue.drain(&handler).unwrap(), 0);
    }

    #[test]
    fn test_drain_rejected_while_running() {
        let queue = IntakeQueue::new(Duration::from_millis(10));
        queue.start(Arc::new(Recording::default())).unwrap();
        assert!(queue.drain(&Recording::default()).is_err());
        queue.stop();
    }

    #[test]
    fn test_stop_when_not_started_is_noop() {
        let queue = IntakeQueue::new(Duration::from_millis(10));
        queue.stop();
        assert_eq!(queue.state(), QueueState::Stopped);
    }
}
