//! Relay Agent - SMS/MMS relay daemon
//!
//! Ingests incoming messages, runs operator commands carried in them, and
//! relays everything else to the configured phone and email destinations.
//! Three intake paths (in-band delivery, reconciliation scans, periodic
//! catch-up sync) feed one ordered queue with a single consumer.

pub mod activity_log;
pub mod agent;
pub mod atomic_file;
pub mod arrival;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod forward;
pub mod http;
pub mod message;
pub mod processor;
pub mod queue;
pub mod recent;
pub mod reconcile;
pub mod sender;
pub mod settings;
pub mod shutdown;
pub mod sqlite_store;
pub mod store;
pub mod sync;
pub mod watermark;

pub use agent::{Collaborators, RelayAgent};
pub use dispatch::CommandResult;
pub use error::{Error, ErrorKind, Result};
pub use forward::clean_number;
pub use message::{Attachment, Message, MessageClass};
pub use sync::SyncReport;
