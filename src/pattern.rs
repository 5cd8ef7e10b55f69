use crate::domain_utils::DomainUtils;
use crate::error::{MxblError, Result};
use crate::matcher::Matcher;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The five pattern dialects an entry can be written in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PatternType {
    Domain,
    Ip,
    Cidr,
    Glob,
    Regex,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::Domain => "DOMAIN",
            PatternType::Ip => "IP",
            PatternType::Cidr => "CIDR",
            PatternType::Glob => "GLOB",
            PatternType::Regex => "REGEX",
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternType {
    type Err = MxblError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DOMAIN" => Ok(PatternType::Domain),
            "IP" => Ok(PatternType::Ip),
            "CIDR" => Ok(PatternType::Cidr),
            "GLOB" => Ok(PatternType::Glob),
            "REGEX" => Ok(PatternType::Regex),
            other => Err(MxblError::Store(format!("unknown pattern type: {other}"))),
        }
    }
}

/// How a match against an entry is handled.
///
/// `Lethal` blocks, `Warn` only logs, `Off` keeps the entry but excludes it
/// from evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Lethal,
    Warn,
    Off,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Lethal => "LETHAL",
            Severity::Warn => "WARN",
            Severity::Off => "OFF",
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, Severity::Off)
    }

    /// Whether moving from `old` to `self` can turn a clean domain dirty or
    /// escalate it, in which case cached clean results must be re-tested.
    pub fn requires_invalidation_from(&self, old: Severity) -> bool {
        matches!(
            (old, *self),
            (Severity::Off, Severity::Warn)
                | (Severity::Off, Severity::Lethal)
                | (Severity::Warn, Severity::Lethal)
        )
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = MxblError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LETHAL" => Ok(Severity::Lethal),
            "WARN" => Ok(Severity::Warn),
            "OFF" => Ok(Severity::Off),
            other => Err(MxblError::Store(format!("unknown severity: {other}"))),
        }
    }
}

/// A pattern's dialect together with its normalized text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSpec {
    pub kind: PatternType,
    pub text: String,
}

impl PatternSpec {
    /// Parse operator input in delimited form.
    ///
    /// `%glob%` and `/regex/` are recognised by their delimiters. Anything else
    /// containing a `/` must be a CIDR range, anything parsing as an address is
    /// an IP, and the rest is a domain. The result is validated by compiling it.
    /// Empty delimited patterns (`%%`, `//`) are rejected: an empty regex would
    /// match every candidate.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(MxblError::invalid_pattern(raw, "empty pattern"));
        }

        let (kind, text) = if let Some(inner) = strip_delimiters(raw, '%') {
            (PatternType::Glob, inner)
        } else if let Some(inner) = strip_delimiters(raw, '/') {
            (PatternType::Regex, inner)
        } else if raw.contains('/') {
            (PatternType::Cidr, raw)
        } else if DomainUtils::is_address(raw) {
            (PatternType::Ip, raw)
        } else {
            (PatternType::Domain, raw)
        };

        Self::new(text, kind)
    }

    /// Build a spec from text and an explicit dialect, normalizing the text
    pub fn new(text: &str, kind: PatternType) -> Result<Self> {
        let matcher = Matcher::compile(text, kind)?;
        Ok(PatternSpec {
            kind,
            text: matcher.source().to_string(),
        })
    }

    pub fn compile(&self) -> Result<Matcher> {
        Matcher::compile(&self.text, self.kind)
    }
}

impl fmt::Display for PatternSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_delimited(f, &self.text, self.kind)
    }
}

fn strip_delimiters(raw: &str, delim: char) -> Option<&str> {
    if raw.len() >= 2 && raw.starts_with(delim) && raw.ends_with(delim) {
        Some(&raw[1..raw.len() - 1])
    } else {
        None
    }
}

fn write_delimited(f: &mut fmt::Formatter<'_>, text: &str, kind: PatternType) -> fmt::Result {
    match kind {
        PatternType::Domain => write!(f, "'{text}'"),
        PatternType::Glob => write!(f, "%{text}%"),
        PatternType::Regex => write!(f, "/{text}/"),
        PatternType::Ip | PatternType::Cidr => f.write_str(text),
    }
}

/// A blocklist entry as held by the pattern store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: u64,
    pub text: String,
    pub kind: PatternType,
    pub severity: Severity,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub hits: u64,
    pub last_hit: Option<DateTime<Utc>>,
    /// Bumped whenever the matcher text changes
    pub version: u64,
}

impl Pattern {
    pub fn spec(&self) -> PatternSpec {
        PatternSpec {
            kind: self.kind,
            text: self.text.clone(),
        }
    }

    pub fn compile(&self) -> Result<Matcher> {
        Matcher::compile(&self.text, self.kind)
    }

    /// Reason handed to moderation actions
    pub fn full_reason(&self) -> String {
        format!("mxbl #{} - {}", self.id, self.reason)
    }

    /// One-line listing relative to `now`
    pub fn summary(&self, now: DateTime<Utc>) -> String {
        let last_hit = match self.last_hit {
            Some(at) => pretty_delta(now - at),
            None => "never".to_string(),
        };
        format!(
            "#{}: {} ({}) added {} by {} with {} hits (last hit: {}) [{}]",
            self.id,
            self.spec(),
            self.reason,
            pretty_delta(now - self.created_at),
            self.created_by,
            self.hits,
            last_hit,
            self.severity
        )
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary(Utc::now()))
    }
}

/// Render an elapsed duration as a short "ago" string using its two most
/// significant units.
pub fn pretty_delta(delta: Duration) -> String {
    let total = delta.num_seconds().max(0);
    let weeks = total / (7 * 86_400);
    let days = (total / 86_400) % 7;
    let hours = (total / 3_600) % 24;
    let minutes = (total / 60) % 60;
    let seconds = total % 60;

    if weeks > 0 {
        format!("{weeks}w{days}d ago")
    } else if days > 0 {
        format!("{days}d{hours}h ago")
    } else if hours > 0 {
        format!("{hours}h{minutes}m ago")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s ago")
    } else {
        format!("{seconds}s ago")
    }
}
