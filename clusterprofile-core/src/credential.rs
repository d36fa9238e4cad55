//! Credential lines and leases.
//!
//! Every credential item is rendered in two forms derived from the same value:
//! - the export form `export NAME="VALUE"`, handed to the shell renderer
//! - the bare form `NAME="VALUE"`, persisted in the cache file
//!
//! Values are double-quoted with `\`, `"`, `$` and `` ` `` escaped, and line
//! breaks written as `\n` / `\r`, so a cached record always stays on one
//! line and parses back to the original value. A multi-line value is exported
//! with ANSI-C quoting (`$'...'`) so the shell sees the real line breaks.
//!
//! This module also provides [`Lease`], the token-plus-expiry record shared by
//! the primary session and the lease-based providers.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use regex::Regex;

use crate::secret::Secret;

/// Fixed-width layout used for every `*_TTL` variable (always UTC).
pub const TTL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Variable recording which profile produced a record. Always emitted first.
pub const PROFILE_VAR: &str = "CLUSTERID_PROFILE";

static ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(?:export\s+)?([A-Za-z_][A-Za-z0-9_]*)="(.*)"$"#)
        .expect("assignment pattern is valid")
});

/// A single named credential value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// `export NAME="VALUE"`, or `export NAME=$'VALUE'` for multi-line values.
    pub fn export_line(&self) -> String {
        if self.value.contains(['\n', '\r']) {
            format!("export {}=$'{}'", self.name, ansi_c_escape(&self.value))
        } else {
            format!("export {}", self.cache_line())
        }
    }

    /// `NAME="VALUE"`
    pub fn cache_line(&self) -> String {
        format!("{}=\"{}\"", self.name, escape(&self.value))
    }
}

/// Render both line forms for a sequence of variables.
pub fn export_lines<'a>(vars: impl IntoIterator<Item = &'a EnvVar>) -> Vec<String> {
    vars.into_iter().map(EnvVar::export_line).collect()
}

/// See [`export_lines`].
pub fn cache_lines<'a>(vars: impl IntoIterator<Item = &'a EnvVar>) -> Vec<String> {
    vars.into_iter().map(EnvVar::cache_line).collect()
}

/// Parse a quoted assignment in either form.
///
/// Returns `None` for lines that are not `NAME="VALUE"` assignments.
pub fn parse_assignment(line: &str) -> Option<EnvVar> {
    let captures = ASSIGNMENT.captures(line.trim())?;
    Some(EnvVar::new(&captures[1], unescape(&captures[2])))
}

/// Find the value assigned to `name` in a set of cached lines.
///
/// The last assignment wins.
pub fn find_value<'a>(lines: impl IntoIterator<Item = &'a String>, name: &str) -> Option<String> {
    lines
        .into_iter()
        .filter_map(|line| parse_assignment(line))
        .filter(|var| var.name == name)
        .last()
        .map(|var| var.value)
}

/// Format an expiry instant with [`TTL_FORMAT`].
pub fn format_ttl(instant: DateTime<Utc>) -> String {
    instant.format(TTL_FORMAT).to_string()
}

/// Parse a value written by [`format_ttl`].
pub fn parse_ttl(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), TTL_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Double-quote a value for the shell, escaped like a cached value.
pub fn shell_quote(value: &str) -> String {
    format!("\"{}\"", escape(value))
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\\' | '"' | '$' | '`' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

fn ansi_c_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\\' | '\'' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some(next) => out.push(next),
                None => out.push(c),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// A backend-issued token and the instant after which it must not be reused.
///
/// A lease without an expiry comes from a statically configured token; it is
/// never reused from the cache and is re-read from configuration instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lease {
    pub token: Secret,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Lease {
    /// A lease that expires `lease_duration` seconds from now.
    ///
    /// Returns `None` if the expiry is not a representable instant.
    pub fn issued_now(token: impl Into<String>, lease_duration: i64) -> Option<Self> {
        let expires_at = Duration::try_seconds(lease_duration)
            .and_then(|duration| Utc::now().checked_add_signed(duration))?;
        Some(Self {
            token: Secret::new(token),
            expires_at: Some(expires_at),
        })
    }

    /// A static token with no expiry tracking.
    pub fn unbounded(token: impl Into<String>) -> Self {
        Self {
            token: Secret::new(token),
            expires_at: None,
        }
    }

    /// Reconstruct a lease from cached lines.
    ///
    /// Returns `None` unless both the token and TTL variables are present and
    /// the TTL is strictly in the future.
    pub fn from_cached(lines: &[String], token_var: &str, ttl_var: &str) -> Option<Self> {
        let token = find_value(lines, token_var).filter(|t| !t.is_empty())?;
        let expires_at = find_value(lines, ttl_var).and_then(|v| parse_ttl(&v))?;
        if Utc::now() < expires_at {
            Some(Self {
                token: Secret::new(token),
                expires_at: Some(expires_at),
            })
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.token.is_empty()
    }

    /// Holds a token that has not expired.
    pub fn is_valid(&self) -> bool {
        !self.is_empty() && self.expires_at.is_none_or(|exp| Utc::now() < exp)
    }

    /// The TTL variable value; empty when the lease has no expiry.
    pub fn ttl_label(&self) -> String {
        self.expires_at.map(format_ttl).unwrap_or_default()
    }

    /// The token, TTL and address variables under the given names.
    pub fn vars(&self, token_var: &str, ttl_var: &str, addr_var: &str, addr: &str) -> Vec<EnvVar> {
        vec![
            EnvVar::new(token_var, self.token.expose()),
            EnvVar::new(ttl_var, self.ttl_label()),
            EnvVar::new(addr_var, addr),
        ]
    }
}
