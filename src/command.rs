//! Command tokenizer
//!
//! A body is a command when, trimmed, it starts with the configured prefix
//! (case-insensitive) followed by whitespace or the end of the string.

/// Result of tokenizing a command body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCommand {
    /// Prefix only, or not a command at all
    Invalid,
    Command {
        /// Lower-cased command name
        name: String,
        /// Leading-trimmed remainder, internal whitespace kept verbatim
        args: String,
    },
}

/// Strip `prefix` from the start of `body`; `None` unless a command boundary follows
fn strip_prefix<'a>(body: &'a str, prefix: &str) -> Option<&'a str> {
    let body = body.trim();
    if prefix.is_empty() || body.len() < prefix.len() || !body.is_char_boundary(prefix.len()) {
        return None;
    }

    let (head, rest) = body.split_at(prefix.len());
    if head.to_lowercase() != prefix.to_lowercase() {
        return None;
    }

    match rest.chars().next() {
        None => Some(rest),
        Some(c) if c.is_whitespace() => Some(rest),
        Some(_) => None,
    }
}

pub fn is_command(body: &str, prefix: &str) -> bool {
    strip_prefix(body, prefix).is_some()
}

pub fn parse(body: &str, prefix: &str) -> ParsedCommand {
    let rest = match strip_prefix(body, prefix) {
        Some(r) => r.trim_start(),
        None => return ParsedCommand::Invalid,
    };

    if rest.is_empty() {
        return ParsedCommand::Invalid;
    }

    let (name, args) = split_first_word(rest);
    ParsedCommand::Command {
        name: name.to_lowercase(),
        args: args.to_string(),
    }
}

/// Split `args` of a send command into `(target, text)`; both must be non-empty
pub fn parse_send_args(args: &str) -> Option<(&str, &str)> {
    let (target, text) = split_first_word(args.trim_start());
    if target.is_empty() || text.trim().is_empty() {
        return None;
    }
    Some((target, text))
}

/// Split on the first whitespace run, leading-trimming the remainder
pub fn split_first_word(s: &str) -> (&str, &str) {
    match s.find(char::is_whitespace) {
        Some(idx) => (&s[..idx], s[idx..].trim_start()),
        None => (s, ""),
    }
}
