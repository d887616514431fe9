//! Telephony database readers
//!
//! Reads text messages from the `sms` table and multimedia envelopes from the
//! `pdu`/`addr`/`part` tables of a telephony SQLite database.

use crate::error::{Error, Result};
use crate::message::{Attachment, Message, MessageClass};
use crate::store::{MessageStore, StoredRecord};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Table layout the readers expect
pub const TELEPHONY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sms (
    _id INTEGER PRIMARY KEY AUTOINCREMENT,
    address TEXT,
    body TEXT,
    date INTEGER NOT NULL,
    read INTEGER NOT NULL DEFAULT 0,
    type INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS pdu (
    _id INTEGER PRIMARY KEY AUTOINCREMENT,
    date INTEGER NOT NULL,
    read INTEGER NOT NULL DEFAULT 0,
    msg_box INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS addr (
    _id INTEGER PRIMARY KEY AUTOINCREMENT,
    msg_id INTEGER NOT NULL,
    address TEXT,
    type INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS part (
    _id INTEGER PRIMARY KEY AUTOINCREMENT,
    mid INTEGER NOT NULL,
    ct TEXT,
    text TEXT,
    data BLOB,
    _data TEXT
);
"#;

/// `sms.type` for received messages
const SMS_TYPE_INBOX: i32 = 1;
/// `pdu.msg_box` for received envelopes
const PDU_BOX_INBOX: i32 = 1;
/// `addr.type` of the originator address
const ADDR_TYPE_FROM: i32 = 137;

fn open_read_only(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    Ok(conn)
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn secs_to_datetime(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

fn limit_clause(limit: Option<usize>) -> i64 {
    limit.map(|l| l as i64).unwrap_or(-1)
}

/// Reader for plain text messages
pub struct SqliteDirectStore {
    db_path: PathBuf,
}

impl SqliteDirectStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }
}

impl MessageStore for SqliteDirectStore {
    fn class(&self) -> MessageClass {
        MessageClass::Direct
    }

    fn max_id(&self) -> Result<i64> {
        let conn = open_read_only(&self.db_path)?;
        let id: Option<i64> = conn.query_row("SELECT MAX(_id) FROM sms", [], |row| row.get(0))?;
        Ok(id.unwrap_or(0))
    }

    fn scan_after(&self, after: i64, limit: Option<usize>) -> Result<Vec<StoredRecord>> {
        let conn = open_read_only(&self.db_path)?;

        let mut stmt = conn.prepare(
            r#"
            SELECT _id, address, body, date, read
            FROM sms
            WHERE _id > ?1 AND type = ?2
            ORDER BY _id ASC
            LIMIT ?3
            "#,
        )?;

        let rows = stmt.query_map(
            rusqlite::params![after, SMS_TYPE_INBOX, limit_clause(limit)],
            |row| {
                let id: i64 = row.get(0)?;
                let address: Option<String> = row.get(1)?;
                let body: Option<String> = row.get(2)?;
                let date: i64 = row.get(3)?;
                let read: bool = row.get::<_, i32>(4)? != 0;
                Ok((id, address, body, date, read))
            },
        )?;

        let mut records = Vec::new();
        for row in rows {
            let (id, address, body, date, read) = row?;
            let received_at = millis_to_datetime(date);

            // A row without an address can't be attributed to anyone
            let message = address
                .filter(|a| !a.trim().is_empty())
                .map(|a| Message::new(a, body.unwrap_or_default(), received_at));

            records.push(StoredRecord {
                id,
                received_at,
                seen: read,
                message,
            });
        }

        Ok(records)
    }
}

/// Reader for multimedia envelopes
pub struct SqliteEnvelopeStore {
    db_path: PathBuf,
}

impl SqliteEnvelopeStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    /// Decode one envelope into sender, text and attachments
    fn decode(&self, conn: &Connection, id: i64, received_at: DateTime<Utc>) -> Result<Message> {
        let sender: Option<String> = conn
            .query_row(
                "SELECT address FROM addr WHERE msg_id = ?1 AND type = ?2 LIMIT 1",
                rusqlite::params![id, ADDR_TYPE_FROM],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        let sender = sender.ok_or_else(|| Error::Decode(format!("envelope {} has no sender", id)))?;

        let mut stmt = conn.prepare(
            r#"
            SELECT ct, text, data, _data
            FROM part
            WHERE mid = ?1
            ORDER BY _id ASC
            "#,
        )?;

        let parts = stmt.query_map([id], |row| {
            let ct: Option<String> = row.get(0)?;
            let text: Option<String> = row.get(1)?;
            let data: Option<Vec<u8>> = row.get(2)?;
            let path: Option<String> = row.get(3)?;
            Ok((ct, text, data, path))
        })?;

        let mut texts = Vec::new();
        let mut attachments = Vec::new();

        for part in parts {
            let (ct, text, data, path) = part?;
            let ct = ct.unwrap_or_else(|| "application/octet-stream".to_string());

            match ct.to_ascii_lowercase().as_str() {
                "application/smil" => continue,
                "text/plain" => {
                    if let Some(t) = text.filter(|t| !t.is_empty()) {
                        texts.push(t);
                    }
                }
                _ => {
                    if let Some(bytes) = data {
                        attachments.push(Attachment::bytes(ct, bytes));
                    } else if let Some(p) = path {
                        attachments.push(Attachment::reference(ct, p));
                    } else {
                        debug!(id = id, mime = %ct, "Envelope part has no content");
                    }
                }
            }
        }

        Ok(Message::new(sender, texts.join("\n"), received_at).with_attachments(attachments))
    }
}

impl MessageStore for SqliteEnvelopeStore {
    fn class(&self) -> MessageClass {
        MessageClass::Enveloped
    }

    fn max_id(&self) -> Result<i64> {
        let conn = open_read_only(&self.db_path)?;
        let id: Option<i64> = conn.query_row("SELECT MAX(_id) FROM pdu", [], |row| row.get(0))?;
        Ok(id.unwrap_or(0))
    }

    fn scan_after(&self, after: i64, limit: Option<usize>) -> Result<Vec<StoredRecord>> {
        let conn = open_read_only(&self.db_path)?;

        let mut stmt = conn.prepare(
            r#"
            SELECT _id, date, read
            FROM pdu
            WHERE _id > ?1 AND msg_box = ?2
            ORDER BY _id ASC
            LIMIT ?3
            "#,
        )?;

        let heads: Vec<(i64, i64, bool)> = stmt
            .query_map(
                rusqlite::params![after, PDU_BOX_INBOX, limit_clause(limit)],
                |row| {
                    let id: i64 = row.get(0)?;
                    let date: i64 = row.get(1)?;
                    let read: bool = row.get::<_, i32>(2)? != 0;
                    Ok((id, date, read))
                },
            )?
            .collect::<rusqlite::Result<_>>()?;

        let mut records = Vec::with_capacity(heads.len());
        for (id, date, read) in heads {
            let received_at = secs_to_datetime(date);

            let message = match self.decode(&conn, id, received_at) {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!(id = id, error = %e, "Failed to decode envelope");
                    None
                }
            };

            records.push(StoredRecord {
                id,
                received_at,
                seen: read,
                message,
            });
        }

        Ok(records)
    }
}
