//! Per-message handling on the intake consumer
//!
//! Classifies each message as a command or forwardable content. Commands are
//! dispatched and the reply goes back to the sender; content is block-checked
//! and fanned out to every destination.

use crate::activity_log::ActivityLog;
use crate::dispatch::CommandDispatcher;
use crate::error::Result;
use crate::forward::{clean_number, DestinationKind, ForwardingEngine};
use crate::message::{is_placeholder_sender, Message};
use crate::queue::MessageHandler;
use crate::sender::SendPrimitive;
use crate::settings::SettingsStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Command,
    Content,
}

pub struct RelayProcessor {
    settings: Arc<SettingsStore>,
    dispatcher: Arc<CommandDispatcher>,
    forwarder: ForwardingEngine,
    sender: Arc<dyn SendPrimitive>,
    log: Arc<ActivityLog>,
}

impl RelayProcessor {
    pub fn new(
        settings: Arc<SettingsStore>,
        dispatcher: Arc<CommandDispatcher>,
        forwarder: ForwardingEngine,
        sender: Arc<dyn SendPrimitive>,
        log: Arc<ActivityLog>,
    ) -> Self {
        Self {
            settings,
            dispatcher,
            forwarder,
            sender,
            log,
        }
    }

    pub fn classify(&self, message: &Message) -> Classification {
        if self.dispatcher.is_command(&message.body) {
            Classification::Command
        } else {
            Classification::Content
        }
    }

    fn handle_command(&self, message: &Message) {
        let result = self.dispatcher.process(&message.sender, &message.body);

        // Replies only go to senders we can text back
        let number = match DestinationKind::of(&message.sender) {
            DestinationKind::Phone => clean_number(&message.sender),
            DestinationKind::Email => String::new(),
        };
        if number.is_empty() {
            debug!(sender = %message.sender, "No reply path for command sender");
            return;
        }

        if !self.sender.send(&number, &result.reply_text) {
            warn!(sender = %message.sender, "Failed to send command reply");
            self.log.warn(format!("reply to {} failed", message.sender));
        }
    }

    fn handle_content(&self, message: &Message) {
        if self.settings.read(|s| s.is_blocked(&message.sender)) {
            info!(sender = %message.sender, "Dropped message from blocked sender");
            self.log.info(format!("dropped message from blocked sender {}", message.sender));
            return;
        }

        let result = self.forwarder.forward(message);
        if result.target_count == 0 {
            self.log.debug(format!("no destinations for message from {}", message.sender));
        }
    }
}

impl MessageHandler for RelayProcessor {
    fn handle(&self, message: Message) -> Result<()> {
        if is_placeholder_sender(&message.sender) {
            debug!("Skipping message with placeholder sender");
            return Ok(());
        }

        match self.classify(&message) {
            Classification::Command => self.handle_command(&message),
            Classification::Content => self.handle_content(&message),
        }
        Ok(())
    }
}
