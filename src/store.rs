//! External message stores
//!
//! Both message classes live in append-only stores keyed by a monotonically
//! increasing id. Scanners only ever read `id > watermark` in ascending order.

use crate::error::Result;
use crate::message::{Message, MessageClass};
use chrono::{DateTime, Utc};

/// One row of an external store
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub id: i64,
    pub received_at: DateTime<Utc>,
    /// Seen/read flag as recorded by the store
    pub seen: bool,
    /// Decoded payload. `None` when extraction failed for this row.
    pub message: Option<Message>,
}

impl StoredRecord {
    pub fn sender(&self) -> Option<&str> {
        self.message.as_ref().map(|m| m.sender.as_str())
    }
}

/// Range-scan access to an append-only message store
pub trait MessageStore: Send + Sync {
    fn class(&self) -> MessageClass;

    /// Highest id currently present (0 for an empty store)
    fn max_id(&self) -> Result<i64>;

    /// Rows with `id > after`, ascending, at most `limit` when given
    fn scan_after(&self, after: i64, limit: Option<usize>) -> Result<Vec<StoredRecord>>;
}
