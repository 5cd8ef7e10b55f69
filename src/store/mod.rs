//! Pattern and settings persistence.
//!
//! The engine never writes to storage on its own: it reads listings and asks
//! for hit accounting, and the administrative operations in
//! [`crate::service`] drive the mutations.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::pattern::{Pattern, PatternSpec, Severity};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Fields supplied when a pattern is added
#[derive(Debug, Clone)]
pub struct NewPattern {
    pub spec: PatternSpec,
    pub severity: Severity,
    pub reason: String,
    pub created_by: String,
}

/// Paging and filtering for listings.
///
/// `limit == 0` means no limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListFilter {
    pub include_off: bool,
    pub limit: usize,
    pub offset: usize,
}

impl ListFilter {
    pub fn all() -> Self {
        ListFilter {
            include_off: true,
            ..Default::default()
        }
    }

    pub fn apply(&self, patterns: impl Iterator<Item = Pattern>) -> Vec<Pattern> {
        let filtered = patterns
            .filter(|p| self.include_off || p.severity.is_active())
            .skip(self.offset);
        if self.limit == 0 {
            filtered.collect()
        } else {
            filtered.take(self.limit).collect()
        }
    }
}

/// Ordered pattern storage.
///
/// Every method that names an id fails with
/// [`crate::MxblError::PatternNotFound`] when it does not exist, without
/// changing anything.
pub trait PatternStore: Send + Sync {
    /// Every stored pattern, `Off` ones included, ascending by id
    fn list_ordered(&self) -> Result<Vec<Pattern>>;

    fn list(&self, filter: ListFilter) -> Result<Vec<Pattern>>;

    fn get(&self, id: u64) -> Result<Pattern>;

    fn insert(&self, pattern: NewPattern) -> Result<Pattern>;

    /// Replace the matcher text, keeping id, reason and severity. Returns the
    /// old and new rows.
    fn update_pattern(&self, id: u64, spec: &PatternSpec) -> Result<(Pattern, Pattern)>;

    fn update_reason(&self, id: u64, reason: &str) -> Result<Pattern>;

    /// Change severity, returning the new row and the previous severity
    fn update_severity(&self, id: u64, severity: Severity) -> Result<(Pattern, Severity)>;

    fn delete(&self, id: u64) -> Result<Pattern>;

    fn record_hit(&self, id: u64, at: DateTime<Utc>) -> Result<()>;
}

/// Name/value settings table
pub trait SettingsStore: Send + Sync {
    fn load_settings(&self) -> Result<HashMap<String, String>>;

    fn save_setting(&self, name: &str, value: &str) -> Result<()>;
}
