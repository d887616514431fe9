//! Message model shared by every intake path

use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;

use crate::config::PLACEHOLDER_SENDERS;

/// An incoming message, normalized from whichever path delivered it
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub sender: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn new(sender: impl Into<String>, body: impl Into<String>, received_at: DateTime<Utc>) -> Self {
        Self {
            sender: sender.into(),
            body: body.into(),
            received_at,
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// A multimedia part
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub mime_type: String,
    pub content: AttachmentContent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttachmentContent {
    Bytes(Vec<u8>),
    /// Content lives outside the store row (file on disk)
    Reference(PathBuf),
}

impl Attachment {
    pub fn bytes(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            content: AttachmentContent::Bytes(data),
        }
    }

    pub fn reference(mime_type: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            mime_type: mime_type.into(),
            content: AttachmentContent::Reference(path.into()),
        }
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.to_ascii_lowercase().starts_with("image/")
    }
}

/// The two message classes scanned from external stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    /// Plain text messages; arrival is delivered in-band with payload
    Direct,
    /// Multimedia envelopes; arrival is a bare change signal
    Enveloped,
}

impl MessageClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageClass::Direct => "direct",
            MessageClass::Enveloped => "enveloped",
        }
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// True for empty senders and the decoder's placeholder tokens
pub fn is_placeholder_sender(sender: &str) -> bool {
    let sender = sender.trim();
    sender.is_empty()
        || PLACEHOLDER_SENDERS
            .iter()
            .any(|p| p.eq_ignore_ascii_case(sender))
}
