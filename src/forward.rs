//! Fan-out of forwardable content to every configured destination
//!
//! Destinations containing `@` go through the HTTP mail relay; everything else
//! is treated as a phone number and sent via the SMS primitive. Each
//! destination is attempted exactly once, in stored order, regardless of
//! earlier failures.

use crate::activity_log::ActivityLog;
use crate::error::{Error, Result};
use crate::http::{MailImage, MailRelay, MailRequest};
use crate::message::Message;
use crate::sender::SendPrimitive;
use crate::settings::{RelaySettings, SettingsStore};
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of one fan-out, used for logging only
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardResult {
    pub target_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
}

/// Kind of destination, decided by the presence of `@`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    Email,
    Phone,
}

impl DestinationKind {
    pub fn of(destination: &str) -> Self {
        if destination.contains('@') {
            DestinationKind::Email
        } else {
            DestinationKind::Phone
        }
    }
}

/// Strip everything but digits, keeping a `+` only when it leads the input.
///
/// Returns an empty string when no digits remain.
pub fn clean_number(raw: &str) -> String {
    let trimmed = raw.trim();
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return String::new();
    }
    if trimmed.starts_with('+') {
        format!("+{}", digits)
    } else {
        digits
    }
}

pub struct ForwardingEngine {
    settings: Arc<SettingsStore>,
    sender: Arc<dyn SendPrimitive>,
    mail: Arc<dyn MailRelay>,
    log: Arc<ActivityLog>,
}

impl ForwardingEngine {
    pub fn new(
        settings: Arc<SettingsStore>,
        sender: Arc<dyn SendPrimitive>,
        mail: Arc<dyn MailRelay>,
        log: Arc<ActivityLog>,
    ) -> Self {
        Self {
            settings,
            sender,
            mail,
            log,
        }
    }

    /// Relay `message` to every destination in the current settings
    pub fn forward(&self, message: &Message) -> ForwardResult {
        let settings = self.settings.snapshot();
        let display = settings.display_name(&message.sender).to_string();

        let mut result = ForwardResult {
            target_count: settings.destinations.len(),
            ..Default::default()
        };

        for destination in &settings.destinations {
            let outcome = match DestinationKind::of(destination) {
                DestinationKind::Email => self.forward_email(&settings, &display, destination, message),
                DestinationKind::Phone => self.forward_phone(&display, destination, message),
            };

            match outcome {
                Ok(()) => result.success_count += 1,
                Err(e) => {
                    result.failure_count += 1;
                    warn!(destination = %destination, sender = %message.sender, error = %e, "Forward failed");
                    self.log.warn(format!("forward to {} failed: {}", destination, e));
                }
            }
        }

        info!(
            sender = %message.sender,
            targets = result.target_count,
            ok = result.success_count,
            failed = result.failure_count,
            "Forwarded message"
        );
        self.log.info(format!(
            "forwarded from {}: {}/{} delivered",
            display, result.success_count, result.target_count
        ));

        result
    }

    fn forward_email(
        &self,
        settings: &RelaySettings,
        display: &str,
        destination: &str,
        message: &Message,
    ) -> Result<()> {
        let url = settings
            .mail_relay_url
            .as_deref()
            .ok_or_else(|| Error::Transport("no mail relay configured".to_string()))?;

        let images: Vec<MailImage> = message
            .attachments
            .iter()
            .filter(|a| a.is_image())
            .filter_map(MailImage::from_attachment)
            .collect();

        let request = MailRequest {
            origin: display.to_string(),
            destination: destination.to_string(),
            body: message.body.clone(),
            timestamp: message.received_at,
            images: if images.is_empty() { None } else { Some(images) },
        };

        self.mail.send(url, &request)
    }

    fn forward_phone(&self, display: &str, destination: &str, message: &Message) -> Result<()> {
        let number = clean_number(destination);
        if number.is_empty() {
            return Err(Error::Validation(format!("unusable phone number {:?}", destination)));
        }

        let text = phone_body(display, message);
        if self.sender.send(&number, &text) {
            Ok(())
        } else {
            Err(Error::Transport(format!("send to {} rejected", number)))
        }
    }
}

/// Text relayed to phone destinations. Attachments are only annotated.
fn phone_body(display: &str, message: &Message) -> String {
    let mut text = format!("{}: {}", display, message.body);
    let count = message.attachments.len();
    if count > 0 {
        let noun = if count == 1 { "attachment" } else { "attachments" };
        text.push_str(&format!(" [{} {} not relayed]", count, noun));
    }
    text
}
