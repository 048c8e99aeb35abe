//! Wire-protocol constants and line classification helpers.
//!
//! The protocol is line-oriented: a command is a single `\n`-terminated line
//! whose first whitespace-delimited token is the command name.  A trailing
//! `:` on a line announces a data set: subsequent lines are records,
//! terminated by a single blank line.  Replies start with one of the status
//! tokens below and use the same data-set framing.

use std::fmt;
use std::str::FromStr;

/// Protocol version token. A core must report exactly this token during the
/// startup handshake or it is refused.
pub const PROTOCOL_VERSION: &str = "1.0";

pub const SUCCESS_STR: &str = "OK";
pub const FAIL_STR: &str = "FAILURE";
pub const ERROR_STR: &str = "ERROR";
pub const NONE_STR: &str = "NONE";
pub const DENIED_STR: &str = "DENIED";
pub const VALUE_STR: &str = "VALUE";

/// Access levels, ordered. A session starts at `Read` and can only be raised
/// through `authorize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessLevel {
    Read,
    Write,
    Admin,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Read => "read",
            AccessLevel::Write => "write",
            AccessLevel::Admin => "admin",
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(AccessLevel::Read),
            "write" => Ok(AccessLevel::Write),
            "admin" => Ok(AccessLevel::Admin),
            _ => Err(()),
        }
    }
}

/// Split a line into whitespace-delimited tokens.
pub fn tokenize(line: &str) -> Vec<&str> {
    line.split_whitespace().collect()
}

/// Split a command line for command-name lookup. The separators include the
/// data-set colon and the redirection characters so that `add-arcs:` and
/// `dump-graph > f` both resolve to their command name.
pub fn command_words(line: &str) -> Vec<&str> {
    line.split(|c: char| c.is_whitespace() || c == ':' || c == '<' || c == '>')
        .filter(|w| !w.is_empty())
        .collect()
}

/// True if the line announces a data set: it contains a `:` followed by
/// nothing but whitespace. Used both for command lines from clients and for
/// status lines from cores.
pub fn line_indicates_dataset(line: &str) -> bool {
    match line.rfind(':') {
        Some(pos) => line[pos + 1..].chars().all(|c| c.is_whitespace()),
        None => false,
    }
}

/// A line of nothing but whitespace terminates a data set.
pub fn is_blank(line: &str) -> bool {
    line.chars().all(|c| c.is_whitespace())
}

/// Valid graph names match `[A-Za-z_-][A-Za-z0-9_-]*`.
pub fn is_valid_graph_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == '-' || first == '_') {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
