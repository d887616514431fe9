//! Operator command dispatch
//!
//! Interprets parsed commands against the settings store. Every mutating
//! command goes through `SettingsStore::update`, so a reply only reports
//! success once the new settings are on disk. A failed write produces a
//! `persist failed` reply, distinct from validation errors.

use crate::activity_log::ActivityLog;
use crate::command::{self, ParsedCommand};
use crate::config::ACCEPTED_URL_SCHEMES;
use crate::error::{ErrorKind, Result};
use crate::forward::{clean_number, DestinationKind};
use crate::sender::SendPrimitive;
use crate::settings::{RelaySettings, SettingsStore};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Allowed command prefixes: alphanumerics plus a few symbols
static PREFIX_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9!#$%&*+\-./:=?@_~]{1,32}$").unwrap());

const DEFAULT_LOG_LINES: usize = 10;
const DEFAULT_LOG_KEEP: usize = 100;

/// Reply to a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub reply_text: String,
    pub is_error: bool,
}

impl CommandResult {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            reply_text: text.into(),
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            reply_text: text.into(),
            is_error: true,
        }
    }

    fn invalid(detail: impl fmt::Display) -> Self {
        Self::error(format!("invalid: {}", detail))
    }

    fn usage(command: CommandName) -> Self {
        Self::error(format!("usage: {}", command.usage()))
    }

    fn from_update(result: Result<CommandResult>) -> Self {
        match result {
            Ok(reply) => reply,
            Err(e) if e.kind() == ErrorKind::Persistence => {
                warn!(error = %e, "Settings write failed");
                Self::error(format!("persist failed: {}", e))
            }
            Err(e) => Self::error(format!("failed: {}", e)),
        }
    }
}

/// Every command the dispatcher understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandName {
    Add,
    Remove,
    List,
    Alias,
    Prefix,
    MailRelay,
    LogRelay,
    Send,
    Log,
    Help,
    Verbose,
    Ban,
    Unban,
}

impl CommandName {
    pub const ALL: [CommandName; 13] = [
        CommandName::Add,
        CommandName::Remove,
        CommandName::List,
        CommandName::Alias,
        CommandName::Prefix,
        CommandName::MailRelay,
        CommandName::LogRelay,
        CommandName::Send,
        CommandName::Log,
        CommandName::Help,
        CommandName::Verbose,
        CommandName::Ban,
        CommandName::Unban,
    ];

    /// Look up a lower-cased command name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == name)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::Add => "add",
            CommandName::Remove => "remove",
            CommandName::List => "list",
            CommandName::Alias => "alias",
            CommandName::Prefix => "prefix",
            CommandName::MailRelay => "mailrelay",
            CommandName::LogRelay => "logrelay",
            CommandName::Send => "send",
            CommandName::Log => "log",
            CommandName::Help => "help",
            CommandName::Verbose => "verbose",
            CommandName::Ban => "ban",
            CommandName::Unban => "unban",
        }
    }

    pub fn usage(&self) -> &'static str {
        match self {
            CommandName::Add => "add <number|email>",
            CommandName::Remove => "remove <number|email>",
            CommandName::List => "list",
            CommandName::Alias => "alias [name [number]] | alias remove <name>",
            CommandName::Prefix => "prefix [new-prefix]",
            CommandName::MailRelay => "mailrelay [url|disable]",
            CommandName::LogRelay => "logrelay [url|disable]",
            CommandName::Send => "send <number|alias> <text>",
            CommandName::Log => "log [n] | log trim [n]",
            CommandName::Help => "help",
            CommandName::Verbose => "verbose [on|off]",
            CommandName::Ban => "ban [number]",
            CommandName::Unban => "unban <number>",
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
enum Endpoint {
    Mail,
    Log,
}

impl Endpoint {
    fn label(&self) -> &'static str {
        match self {
            Endpoint::Mail => "mail relay",
            Endpoint::Log => "log relay",
        }
    }

    fn slot<'a>(&self, settings: &'a mut RelaySettings) -> &'a mut Option<String> {
        match self {
            Endpoint::Mail => &mut settings.mail_relay_url,
            Endpoint::Log => &mut settings.log_relay_url,
        }
    }
}

pub struct CommandDispatcher {
    settings: Arc<SettingsStore>,
    sender: Arc<dyn SendPrimitive>,
    log: Arc<ActivityLog>,
}

impl CommandDispatcher {
    pub fn new(settings: Arc<SettingsStore>, sender: Arc<dyn SendPrimitive>, log: Arc<ActivityLog>) -> Self {
        Self { settings, sender, log }
    }

    /// True when `body` carries the current command prefix
    pub fn is_command(&self, body: &str) -> bool {
        let prefix = self.settings.read(|s| s.command_prefix.clone());
        command::is_command(body, &prefix)
    }

    /// Parse and run a full command body from `sender`
    pub fn process(&self, sender: &str, text: &str) -> CommandResult {
        let prefix = self.settings.read(|s| s.command_prefix.clone());

        let result = match command::parse(text, &prefix) {
            ParsedCommand::Invalid => CommandResult::invalid(format!("empty command, try `{} help`", prefix)),
            ParsedCommand::Command { name, args } => match CommandName::from_name(&name) {
                Some(cmd) => self.dispatch(sender, cmd, &args),
                None => CommandResult::invalid(format!("unknown command `{}`", name)),
            },
        };

        info!(sender = %sender, error = result.is_error, "Command processed");
        let entry = format!("command from {}: {} -> {}", sender, text.trim(), result.reply_text);
        if result.is_error {
            self.log.warn(entry);
        } else {
            self.log.info(entry);
        }

        result
    }

    pub fn dispatch(&self, sender: &str, cmd: CommandName, args: &str) -> CommandResult {
        let args_trimmed = args.trim();
        match cmd {
            CommandName::Add => self.add(args_trimmed),
            CommandName::Remove => self.remove(args_trimmed),
            CommandName::List => CommandResult::ok(self.settings.read(|s| s.summary())),
            CommandName::Alias => self.alias(args_trimmed),
            CommandName::Prefix => self.prefix(args_trimmed),
            CommandName::MailRelay => self.endpoint(Endpoint::Mail, args_trimmed),
            CommandName::LogRelay => self.endpoint(Endpoint::Log, args_trimmed),
            CommandName::Send => self.send(sender, args),
            CommandName::Log => self.log_command(args_trimmed),
            CommandName::Help => self.help(),
            CommandName::Verbose => self.verbose(args_trimmed),
            CommandName::Ban => self.ban(args_trimmed),
            CommandName::Unban => self.unban(args_trimmed),
        }
    }

    fn add(&self, value: &str) -> CommandResult {
        if value.is_empty() {
            return CommandResult::usage(CommandName::Add);
        }
        if DestinationKind::of(value) == DestinationKind::Phone && clean_number(value).is_empty() {
            return CommandResult::invalid(format!("not a phone number or email: {}", value));
        }

        CommandResult::from_update(self.settings.update(|s| {
            let verb = if s.destination_index(value).is_some() {
                "exists"
            } else {
                s.destinations.push(value.to_string());
                "added"
            };
            CommandResult::ok(format!("{} {} ({} entries total)", verb, value, s.destinations.len()))
        }))
    }

    fn remove(&self, value: &str) -> CommandResult {
        if value.is_empty() {
            return CommandResult::usage(CommandName::Remove);
        }

        CommandResult::from_update(self.settings.update(|s| match s.destination_index(value) {
            Some(idx) => {
                let removed = s.destinations.remove(idx);
                CommandResult::ok(format!("removed {} ({} entries total)", removed, s.destinations.len()))
            }
            None => CommandResult::error(format!(
                "not found {} ({} entries total)",
                value,
                s.destinations.len()
            )),
        }))
    }

    fn alias(&self, args: &str) -> CommandResult {
        let args = args.trim();
        if args.is_empty() {
            let aliases = self.settings.read(|s| {
                s.aliases
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
            });
            return if aliases.is_empty() {
                CommandResult::ok("no aliases")
            } else {
                CommandResult::ok(aliases.join("\n"))
            };
        }

        let (first, rest) = command::split_first_word(args);
        if first.eq_ignore_ascii_case("remove") {
            return match rest.trim() {
                "" => CommandResult::usage(CommandName::Alias),
                name => self.alias_remove(name),
            };
        }
        if looks_like_number(first) {
            return self.alias_reverse_lookup(args);
        }
        match rest.trim() {
            "" => self.alias_lookup(first),
            number => self.alias_set(first, number),
        }
    }

    fn alias_lookup(&self, name: &str) -> CommandResult {
        match self.settings.read(|s| s.alias_number(name).map(str::to_string)) {
            Some(number) => CommandResult::ok(format!("{}={}", name, number)),
            None => CommandResult::error(format!("no alias {}", name)),
        }
    }

    fn alias_reverse_lookup(&self, number: &str) -> CommandResult {
        match self.settings.read(|s| s.alias_for_number(number).map(str::to_string)) {
            Some(name) => CommandResult::ok(format!("{} is {}", number, name)),
            None => CommandResult::error(format!("no alias for {}", number)),
        }
    }

    fn alias_set(&self, name: &str, number: &str) -> CommandResult {
        if name.chars().any(|c| c.is_ascii_digit()) {
            return CommandResult::invalid("alias name must not contain digits");
        }
        if DestinationKind::of(number) == DestinationKind::Email {
            return CommandResult::invalid("alias value must be a phone number");
        }
        let cleaned = clean_number(number);
        if cleaned.is_empty() {
            return CommandResult::invalid(format!("not a phone number: {}", number));
        }

        CommandResult::from_update(self.settings.update(|s| {
            // Replace any differently-cased existing key
            if let Some(existing) = s.alias_key(name).map(str::to_string) {
                s.aliases.remove(&existing);
            }
            s.aliases.insert(name.to_string(), cleaned.clone());
            CommandResult::ok(format!("alias {}={}", name, cleaned))
        }))
    }

    fn alias_remove(&self, name: &str) -> CommandResult {
        CommandResult::from_update(self.settings.update(|s| match s.alias_key(name).map(str::to_string) {
            Some(key) => {
                s.aliases.remove(&key);
                CommandResult::ok(format!("alias {} removed", key))
            }
            None => CommandResult::error(format!("no alias {}", name)),
        }))
    }

    fn prefix(&self, value: &str) -> CommandResult {
        if value.is_empty() {
            return CommandResult::ok(format!("prefix: {}", self.settings.read(|s| s.command_prefix.clone())));
        }
        if !PREFIX_PATTERN.is_match(value) {
            return CommandResult::invalid(format!("prefix {:?} not allowed", value));
        }

        CommandResult::from_update(self.settings.update(|s| {
            s.command_prefix = value.to_string();
            CommandResult::ok(format!("prefix changed to {}", value))
        }))
    }

    fn endpoint(&self, endpoint: Endpoint, value: &str) -> CommandResult {
        if value.is_empty() {
            let current = self.settings.read(|s| match endpoint {
                Endpoint::Mail => s.mail_relay_url.clone(),
                Endpoint::Log => s.log_relay_url.clone(),
            });
            return CommandResult::ok(format!(
                "{}: {}",
                endpoint.label(),
                current.unwrap_or_else(|| "disabled".to_string())
            ));
        }

        if value.eq_ignore_ascii_case("disable") {
            return CommandResult::from_update(self.settings.update(|s| {
                *endpoint.slot(s) = None;
                CommandResult::ok(format!("{} disabled", endpoint.label()))
            }));
        }

        if !is_acceptable_url(value) {
            return CommandResult::error(format!("invalid-url: {}", value));
        }

        CommandResult::from_update(self.settings.update(|s| {
            *endpoint.slot(s) = Some(value.to_string());
            CommandResult::ok(format!("{} set to {}", endpoint.label(), value))
        }))
    }

    fn send(&self, from: &str, args: &str) -> CommandResult {
        let Some((target, text)) = command::parse_send_args(args) else {
            return CommandResult::usage(CommandName::Send);
        };

        let resolved = self
            .settings
            .read(|s| s.alias_number(target).map(str::to_string))
            .unwrap_or_else(|| target.to_string());
        let number = clean_number(&resolved);
        if number.is_empty() {
            return CommandResult::invalid(format!("not a phone number: {}", target));
        }

        if self.sender.send(&number, text) {
            info!(from = %from, to = %number, "Sent on behalf of operator");
            CommandResult::ok(format!("sent to {}", number))
        } else {
            CommandResult::error(format!("failed to send to {}", number))
        }
    }

    fn log_command(&self, args: &str) -> CommandResult {
        let mut words = args.split_whitespace();
        let first = words.next();

        if first.is_some_and(|w| w.eq_ignore_ascii_case("trim")) {
            let keep = match words.next().map(str::parse::<usize>) {
                None => DEFAULT_LOG_KEEP,
                Some(Ok(n)) => n,
                Some(Err(_)) => return CommandResult::usage(CommandName::Log),
            };
            return match self.log.trim(keep) {
                Ok(removed) => CommandResult::ok(format!("log trimmed: removed {}, kept at most {}", removed, keep)),
                Err(e) => CommandResult::error(format!("persist failed: {}", e)),
            };
        }

        let count = match first.map(str::parse::<usize>) {
            None => DEFAULT_LOG_LINES,
            Some(Ok(n)) => n,
            Some(Err(_)) => return CommandResult::usage(CommandName::Log),
        };
        match self.log.tail(count) {
            Ok(lines) if lines.is_empty() => CommandResult::ok("log empty"),
            Ok(lines) => CommandResult::ok(lines.join("\n")),
            Err(e) => CommandResult::error(format!("failed to read log: {}", e)),
        }
    }

    fn help(&self) -> CommandResult {
        let prefix = self.settings.read(|s| s.command_prefix.clone());
        let lines: Vec<String> = CommandName::ALL
            .iter()
            .map(|c| format!("{} {}", prefix, c.usage()))
            .collect();
        CommandResult::ok(lines.join("\n"))
    }

    fn verbose(&self, value: &str) -> CommandResult {
        let enable = match value.to_ascii_lowercase().as_str() {
            "" => {
                let on = self.settings.read(|s| s.verbose_logging);
                return CommandResult::ok(format!("verbose: {}", if on { "on" } else { "off" }));
            }
            "on" => true,
            "off" => false,
            _ => return CommandResult::usage(CommandName::Verbose),
        };

        CommandResult::from_update(self.settings.update(|s| {
            s.verbose_logging = enable;
            CommandResult::ok(format!("verbose {}", if enable { "on" } else { "off" }))
        }))
    }

    fn ban(&self, value: &str) -> CommandResult {
        if value.is_empty() {
            let blocked = self.settings.read(|s| s.blocked.clone());
            return if blocked.is_empty() {
                CommandResult::ok("no blocked senders")
            } else {
                CommandResult::ok(format!("blocked: {}", blocked.join(", ")))
            };
        }

        let entry = block_entry(value);
        CommandResult::from_update(self.settings.update(|s| {
            if s.is_blocked(&entry) {
                CommandResult::ok(format!("already banned {}", entry))
            } else {
                s.blocked.push(entry.clone());
                CommandResult::ok(format!("banned {} ({} blocked)", entry, s.blocked.len()))
            }
        }))
    }

    fn unban(&self, value: &str) -> CommandResult {
        if value.is_empty() {
            return CommandResult::usage(CommandName::Unban);
        }

        let entry = block_entry(value);
        CommandResult::from_update(self.settings.update(|s| {
            let before = s.blocked.len();
            let cleaned = clean_number(&entry);
            s.blocked.retain(|b| {
                !(b.eq_ignore_ascii_case(&entry) || (!cleaned.is_empty() && clean_number(b) == cleaned))
            });
            if s.blocked.len() < before {
                CommandResult::ok(format!("unbanned {}", entry))
            } else {
                CommandResult::error(format!("not banned {}", entry))
            }
        }))
    }
}

/// Block-list entries are stored cleaned when they look like phone numbers
fn block_entry(value: &str) -> String {
    match DestinationKind::of(value) {
        DestinationKind::Phone if !clean_number(value).is_empty() => clean_number(value),
        _ => value.to_string(),
    }
}

/// Digits and no letters: the start of a phone number rather than an alias name
fn looks_like_number(word: &str) -> bool {
    word.chars().any(|c| c.is_ascii_digit()) && !word.chars().any(char::is_alphabetic)
}

fn is_acceptable_url(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    !value.chars().any(char::is_whitespace)
        && ACCEPTED_URL_SCHEMES
            .iter()
            .any(|scheme| lower.starts_with(scheme) && lower.len() > scheme.len())
}
