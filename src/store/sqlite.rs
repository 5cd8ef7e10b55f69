use super::{ListFilter, NewPattern, PatternStore, SettingsStore};
use crate::error::{MxblError, Result};
use crate::pattern::{Pattern, PatternSpec, PatternType, Severity};
use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;

const COLUMNS: &str =
    "id, pattern, pattern_type, reason, severity, added, added_by, hits, last_hit, version";

/// SQLite-backed pattern and settings tables
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open mxbl database: {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        Self::init_database(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_database(conn: &Connection) -> anyhow::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS mxbl (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pattern TEXT NOT NULL,
                pattern_type TEXT NOT NULL,
                reason TEXT NOT NULL DEFAULT '',
                severity TEXT NOT NULL DEFAULT 'WARN',
                added TEXT NOT NULL,
                added_by TEXT NOT NULL,
                hits INTEGER NOT NULL DEFAULT 0,
                last_hit TEXT,
                version INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )
        .context("Failed to create mxbl table")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS settings (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )
        .context("Failed to create settings table")?;

        conn.execute(
            "INSERT OR IGNORE INTO settings (name, value) VALUES ('pause', '0')",
            [],
        )?;

        Ok(())
    }

    fn fetch(conn: &Connection, id: u64) -> Result<Pattern> {
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM mxbl WHERE id = ?"),
            params![id],
            row_to_pattern,
        )
        .optional()?
        .ok_or(MxblError::PatternNotFound(id))
    }
}

fn parse_column<T>(idx: usize, value: &str, parse: impl FnOnce(&str) -> Result<T>) -> rusqlite::Result<T> {
    parse(value).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_time(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_pattern(row: &Row<'_>) -> rusqlite::Result<Pattern> {
    let kind: String = row.get(2)?;
    let severity: String = row.get(4)?;
    let added: String = row.get(5)?;
    let last_hit: Option<String> = row.get(8)?;

    Ok(Pattern {
        id: row.get(0)?,
        text: row.get(1)?,
        kind: parse_column(2, &kind, |s| s.parse::<PatternType>())?,
        reason: row.get(3)?,
        severity: parse_column(4, &severity, |s| s.parse::<Severity>())?,
        created_at: parse_time(5, &added)?,
        created_by: row.get(6)?,
        hits: row.get(7)?,
        last_hit: last_hit.map(|s| parse_time(8, &s)).transpose()?,
        version: row.get(9)?,
    })
}

impl PatternStore for SqliteStore {
    fn list_ordered(&self) -> Result<Vec<Pattern>> {
        self.list(ListFilter::all())
    }

    fn list(&self, filter: ListFilter) -> Result<Vec<Pattern>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM mxbl
             WHERE ?1 OR severity != 'OFF'
             ORDER BY id
             LIMIT ?2 OFFSET ?3"
        ))?;
        let limit: i64 = if filter.limit == 0 { -1 } else { filter.limit as i64 };
        let rows = stmt
            .query_map(
                params![filter.include_off, limit, filter.offset as i64],
                row_to_pattern,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn get(&self, id: u64) -> Result<Pattern> {
        Self::fetch(&self.conn.lock(), id)
    }

    fn insert(&self, new: NewPattern) -> Result<Pattern> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO mxbl (pattern, pattern_type, reason, severity, added, added_by)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                new.spec.text,
                new.spec.kind.as_str(),
                new.reason,
                new.severity.as_str(),
                Utc::now().to_rfc3339(),
                new.created_by,
            ],
        )?;
        let id = conn.last_insert_rowid() as u64;
        Self::fetch(&conn, id)
    }

    fn update_pattern(&self, id: u64, spec: &PatternSpec) -> Result<(Pattern, Pattern)> {
        let conn = self.conn.lock();
        let old = Self::fetch(&conn, id)?;
        conn.execute(
            "UPDATE mxbl SET pattern = ?, pattern_type = ?, version = version + 1 WHERE id = ?",
            params![spec.text, spec.kind.as_str(), id],
        )?;
        let new = Self::fetch(&conn, id)?;
        Ok((old, new))
    }

    fn update_reason(&self, id: u64, reason: &str) -> Result<Pattern> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE mxbl SET reason = ? WHERE id = ?",
            params![reason, id],
        )?;
        if changed == 0 {
            return Err(MxblError::PatternNotFound(id));
        }
        Self::fetch(&conn, id)
    }

    fn update_severity(&self, id: u64, severity: Severity) -> Result<(Pattern, Severity)> {
        let conn = self.conn.lock();
        let old = Self::fetch(&conn, id)?;
        conn.execute(
            "UPDATE mxbl SET severity = ? WHERE id = ?",
            params![severity.as_str(), id],
        )?;
        Ok((Self::fetch(&conn, id)?, old.severity))
    }

    fn delete(&self, id: u64) -> Result<Pattern> {
        let conn = self.conn.lock();
        let old = Self::fetch(&conn, id)?;
        conn.execute("DELETE FROM mxbl WHERE id = ?", params![id])?;
        Ok(old)
    }

    fn record_hit(&self, id: u64, at: DateTime<Utc>) -> Result<()> {
        let changed = self.conn.lock().execute(
            "UPDATE mxbl SET hits = hits + 1, last_hit = ? WHERE id = ?",
            params![at.to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(MxblError::PatternNotFound(id));
        }
        Ok(())
    }
}

impl SettingsStore for SqliteStore {
    fn load_settings(&self) -> Result<HashMap<String, String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT name, value FROM settings")?;
        let settings = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(settings)
    }

    fn save_setting(&self, name: &str, value: &str) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO settings (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            params![name, value],
        )?;
        Ok(())
    }
}
