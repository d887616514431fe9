//! Outbound SMS primitive

use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::warn;

/// Hands a text to the platform for sending.
///
/// `true` only means the platform accepted it; there is no delivery guarantee.
pub trait SendPrimitive: Send + Sync {
    fn send(&self, number: &str, text: &str) -> bool;
}

/// Sends through an external CLI invoked as `<program> <number> <text>`
pub struct CommandSender {
    program: PathBuf,
}

impl CommandSender {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl SendPrimitive for CommandSender {
    fn send(&self, number: &str, text: &str) -> bool {
        let output = Command::new(&self.program)
            .arg(number)
            .arg(text)
            .stdin(Stdio::null())
            .output();

        match output {
            Ok(o) if o.status.success() => true,
            Ok(o) => {
                warn!(
                    number = number,
                    status = ?o.status.code(),
                    stderr = %String::from_utf8_lossy(&o.stderr).trim(),
                    "Send command failed"
                );
                false
            }
            Err(e) => {
                warn!(number = number, error = %e, program = %self.program.display(), "Failed to run send command");
                false
            }
        }
    }
}
