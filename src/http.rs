//! HTTP mail relay and log relay clients

use crate::error::{Error, Result};
use crate::message::{Attachment, AttachmentContent};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Payload sent to the mail relay for one email destination
#[derive(Debug, Clone, Serialize)]
pub struct MailRequest {
    pub origin: String,
    pub destination: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<MailImage>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MailImage {
    pub mime_type: String,
    /// Base64 encoded content
    pub data: String,
}

impl MailImage {
    /// Encode an attachment; external references are read from disk
    pub fn from_attachment(attachment: &Attachment) -> Option<Self> {
        let bytes = match &attachment.content {
            AttachmentContent::Bytes(b) => b.clone(),
            AttachmentContent::Reference(path) => match std::fs::read(path) {
                Ok(b) => b,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Skipping unreadable attachment");
                    return None;
                }
            },
        };
        Some(Self {
            mime_type: attachment.mime_type.clone(),
            data: BASE64.encode(bytes),
        })
    }
}

/// Delivery of one email through the relay endpoint
pub trait MailRelay: Send + Sync {
    fn send(&self, url: &str, request: &MailRequest) -> Result<()>;
}

/// Batch upload of activity log lines
pub trait LogRelay: Send + Sync {
    fn upload(&self, url: &str, device_id: &str, lines: &[String]) -> Result<()>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LogUpload<'a> {
    device_id: &'a str,
    lines: &'a [String],
}

/// Blocking JSON POST client shared by both relays
#[derive(Clone)]
pub struct HttpRelay {
    client: reqwest::blocking::Client,
}

impl HttpRelay {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    fn post_json<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<()> {
        let response = self.client.post(url).json(body).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!("{} returned {}", url, status)));
        }
        Ok(())
    }
}

impl MailRelay for HttpRelay {
    fn send(&self, url: &str, request: &MailRequest) -> Result<()> {
        self.post_json(url, request)
    }
}

impl LogRelay for HttpRelay {
    fn upload(&self, url: &str, device_id: &str, lines: &[String]) -> Result<()> {
        self.post_json(url, &LogUpload { device_id, lines })
    }
}
