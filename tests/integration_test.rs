//! Integration tests for the relay agent
//!
//! These drive a fully wired agent over in-memory stores and recording
//! collaborators.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{wait_for, Harness};
use relay_agent::message::Attachment;
use relay_agent::queue::QueueState;
use relay_agent::{Message, MessageClass};
use std::sync::Arc;
use std::thread;

/// Command scenario from a clean state
#[test]
fn test_add_destination_scenario() {
    let h = Harness::new();
    assert!(!h.agent.process("+15550001111", "Relay prefix Cmd").is_error);

    let first = h.agent.process("+15550001111", "Cmd add foo@bar.com");
    assert_eq!(first.reply_text, "added foo@bar.com (1 entries total)");
    assert!(!first.is_error);

    let second = h.agent.process("+15550001111", "Cmd add foo@bar.com");
    assert!(second.reply_text.starts_with("exists"));
    assert_eq!(h.agent.settings().snapshot().destinations.len(), 1);
}

/// Settings survive a restart
#[test]
fn test_settings_persist_across_agents() {
    let h = Harness::new();
    h.agent.process("+15550001111", "Relay add +1 555 222 3333");
    h.agent.process("+15550001111", "Relay alias Sam +15554443333");

    let Harness { dir, agent, .. } = h;
    drop(agent);

    let again = Harness::in_dir(dir);
    let settings = again.agent.settings().snapshot();
    assert_eq!(settings.destinations, vec!["+1 555 222 3333".to_string()]);
    assert_eq!(settings.alias_number("sam"), Some("+15554443333"));
}

/// In-band delivery fans out to every destination
#[test]
fn test_enqueued_content_is_forwarded() {
    let h = Harness::new();
    h.agent.process("op", "Relay add +15552223333");
    h.agent.process("op", "Relay add me@example.com");
    h.agent.process("op", "Relay mailrelay https://mail.example.com/hook");
    h.agent.process("op", "Relay alias Ann +15550001111");

    h.agent.start().unwrap();
    assert_eq!(h.agent.queue_state(), QueueState::Running);

    let message = Message::new("+1 (555) 000-1111", "see you at noon", Utc::now())
        .with_attachments(vec![Attachment::bytes("image/png", vec![1, 2, 3])]);
    assert!(h.agent.enqueue(message));

    assert!(wait_for(|| h.mail.requests.lock().unwrap().len() == 1));
    assert!(wait_for(|| h.sender.sent().len() == 1));
    h.agent.stop();

    let (number, text) = h.sender.sent()[0].clone();
    assert_eq!(number, "+15552223333");
    assert_eq!(text, "Ann: see you at noon [1 attachment not relayed]");

    let (url, request) = h.mail.requests.lock().unwrap()[0].clone();
    assert_eq!(url, "https://mail.example.com/hook");
    assert_eq!(request.origin, "Ann");
    assert_eq!(request.destination, "me@example.com");
    assert_eq!(request.images.map(|i| i.len()), Some(1));
}

/// A command arriving as a message is answered by text
#[test]
fn test_command_message_gets_reply() {
    let h = Harness::new();
    h.agent.start().unwrap();
    h.agent.enqueue(Message::new("+15550001111", "relay add a@b.com", Utc::now()));

    assert!(wait_for(|| !h.sender.sent().is_empty()));
    h.agent.stop();

    assert_eq!(
        h.sender.sent()[0],
        ("+15550001111".to_string(), "added a@b.com (1 entries total)".to_string())
    );
    let log = h.agent.activity_log().tail(50).unwrap();
    assert!(log.iter().any(|l| l.contains("command from +15550001111")));
}

/// New rows in the direct store arrive through the monitor exactly once
#[test]
fn test_direct_arrival_forwarded_once() {
    let h = Harness::new();
    h.agent.process("op", "Relay add +15552223333");
    h.direct.push(1, "+15559990000", "history", Utc::now(), false);

    h.agent.start().unwrap();
    h.direct.push(2, "+15559990000", "fresh", Utc::now(), false);

    assert!(wait_for(|| h.sender.sent().len() == 1));
    // The catch-up sync must not forward it again
    let report = h.agent.sync_now();
    assert_eq!(report.total_processed(), 0);
    thread::sleep(std::time::Duration::from_millis(100));
    h.agent.stop();

    let sent = h.sender.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, "+15559990000: fresh");
}

/// Racing reconciliation triggers enqueue the new record once
#[test]
fn test_concurrent_reconciliation_triggers() {
    let h = Arc::new(Harness::new());
    h.agent.process("op", "Relay add +15552223333");
    h.agent.start().unwrap();

    h.enveloped.push(1, "+15557776666", "photo", Utc::now(), false);
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let h = h.clone();
            thread::spawn(move || h.agent.trigger_reconciliation())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(wait_for(|| h.sender.sent().len() == 1));
    thread::sleep(std::time::Duration::from_millis(150));
    h.agent.stop();
    assert_eq!(h.sender.sent().len(), 1);
}

/// Missed records are recovered by sync; old ones are not
#[test]
fn test_sync_recovers_missed_records() {
    let h = Harness::new();
    h.agent.process("op", "Relay add +15552223333");
    // Arms the sync watermarks at the current (empty) maximum
    h.agent.sync_now();

    let now = Utc::now();
    h.direct.push(1, "+15551110000", "missed", now - ChronoDuration::minutes(10), false);
    h.direct.push(2, "+15551110000", "ancient", now - ChronoDuration::hours(30), false);
    h.enveloped.push(1, "+15551110000", "missed picture", now, false);
    h.enveloped.push(2, "+15551110000", "already read", now, true);

    let report = h.agent.sync_now();
    assert_eq!(report.get(MessageClass::Direct).unwrap().found, 2);
    assert_eq!(report.get(MessageClass::Direct).unwrap().processed, 1);
    assert_eq!(report.get(MessageClass::Enveloped).unwrap().processed, 1);

    assert_eq!(h.agent.drain_pending().unwrap(), 2);
    let mut texts: Vec<String> = h.sender.sent().into_iter().map(|(_, t)| t).collect();
    texts.sort();
    assert_eq!(
        texts,
        vec![
            "+15551110000: missed".to_string(),
            "+15551110000: missed picture".to_string()
        ]
    );

    // Nothing new: watermarks hold and nothing is recovered twice
    assert_eq!(h.agent.sync_now().total_processed(), 0);
    assert!(h.agent.sync_status().contains("direct=2"));
}

/// Blocked senders are dropped but still logged
#[test]
fn test_blocked_sender_not_forwarded() {
    let h = Harness::new();
    h.agent.process("op", "Relay add +15552223333");
    h.agent.process("op", "Relay ban +1 555 666 7777");

    h.agent.enqueue(Message::new("+15556667777", "buy now", Utc::now()));
    assert_eq!(h.agent.drain_pending().unwrap(), 1);
    assert!(h.sender.sent().is_empty());

    let log = h.agent.activity_log().tail(5).unwrap();
    assert!(log.iter().any(|l| l.contains("blocked sender +15556667777")));
}

/// Store outages do not stop the agent
#[test]
fn test_store_failure_is_isolated() {
    let h = Harness::new();
    h.agent.sync_now();
    h.direct.fail.store(true, std::sync::atomic::Ordering::SeqCst);
    h.enveloped.push(1, "+15551110000", "still arrives", Utc::now(), false);

    let report = h.agent.sync_now();
    assert!(report.get(MessageClass::Direct).unwrap().error.is_some());
    assert_eq!(report.get(MessageClass::Enveloped).unwrap().processed, 1);
}

/// Activity log lines are shipped once a relay URL is configured
#[test]
fn test_activity_log_shipping() {
    let h = Harness::new();
    h.agent.process("op", "Relay logrelay https://logs.example.com/ingest");
    h.agent.start().unwrap();
    h.agent.process("op", "Relay verbose on");

    assert!(wait_for(|| h
        .log_relay
        .lines
        .lock()
        .unwrap()
        .iter()
        .any(|l| l.contains("verbose on"))));
    h.agent.stop();
}

#[test]
fn test_config_summary() {
    let h = Harness::new();
    h.agent.process("op", "Relay add a@b.com");
    let summary = h.agent.config_summary();
    assert!(summary.contains("prefix: Relay"));
    assert!(summary.contains("destinations (1): a@b.com"));
    assert!(summary.contains("queue: Stopped"));
    assert!(summary.contains("sync watermarks"));
}
