use super::{ListFilter, NewPattern, PatternStore, SettingsStore};
use crate::error::{MxblError, Result};
use crate::pattern::{Pattern, PatternSpec, Severity};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct Tables {
    patterns: BTreeMap<u64, Pattern>,
    settings: HashMap<String, String>,
    next_id: u64,
}

/// In-process store for tests and one-off runs
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PatternStore for MemoryStore {
    fn list_ordered(&self) -> Result<Vec<Pattern>> {
        Ok(self.tables.read().patterns.values().cloned().collect())
    }

    fn list(&self, filter: ListFilter) -> Result<Vec<Pattern>> {
        let tables = self.tables.read();
        Ok(filter.apply(tables.patterns.values().cloned()))
    }

    fn get(&self, id: u64) -> Result<Pattern> {
        self.tables
            .read()
            .patterns
            .get(&id)
            .cloned()
            .ok_or(MxblError::PatternNotFound(id))
    }

    fn insert(&self, new: NewPattern) -> Result<Pattern> {
        let mut tables = self.tables.write();
        tables.next_id += 1;
        let pattern = Pattern {
            id: tables.next_id,
            text: new.spec.text,
            kind: new.spec.kind,
            severity: new.severity,
            reason: new.reason,
            created_at: Utc::now(),
            created_by: new.created_by,
            hits: 0,
            last_hit: None,
            version: 0,
        };
        tables.patterns.insert(pattern.id, pattern.clone());
        Ok(pattern)
    }

    fn update_pattern(&self, id: u64, spec: &PatternSpec) -> Result<(Pattern, Pattern)> {
        let mut tables = self.tables.write();
        let pattern = tables
            .patterns
            .get_mut(&id)
            .ok_or(MxblError::PatternNotFound(id))?;
        let old = pattern.clone();
        pattern.text = spec.text.clone();
        pattern.kind = spec.kind;
        pattern.version += 1;
        Ok((old, pattern.clone()))
    }

    fn update_reason(&self, id: u64, reason: &str) -> Result<Pattern> {
        let mut tables = self.tables.write();
        let pattern = tables
            .patterns
            .get_mut(&id)
            .ok_or(MxblError::PatternNotFound(id))?;
        pattern.reason = reason.to_string();
        Ok(pattern.clone())
    }

    fn update_severity(&self, id: u64, severity: Severity) -> Result<(Pattern, Severity)> {
        let mut tables = self.tables.write();
        let pattern = tables
            .patterns
            .get_mut(&id)
            .ok_or(MxblError::PatternNotFound(id))?;
        let old = pattern.severity;
        pattern.severity = severity;
        Ok((pattern.clone(), old))
    }

    fn delete(&self, id: u64) -> Result<Pattern> {
        self.tables
            .write()
            .patterns
            .remove(&id)
            .ok_or(MxblError::PatternNotFound(id))
    }

    fn record_hit(&self, id: u64, at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.write();
        let pattern = tables
            .patterns
            .get_mut(&id)
            .ok_or(MxblError::PatternNotFound(id))?;
        pattern.hits += 1;
        pattern.last_hit = Some(at);
        Ok(())
    }
}

impl SettingsStore for MemoryStore {
    fn load_settings(&self) -> Result<HashMap<String, String>> {
        Ok(self.tables.read().settings.clone())
    }

    fn save_setting(&self, name: &str, value: &str) -> Result<()> {
        self.tables
            .write()
            .settings
            .insert(name.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_pattern(raw: &str) -> NewPattern {
        NewPattern {
            spec: PatternSpec::parse(raw).unwrap(),
            severity: Severity::Warn,
            reason: "test".to_string(),
            created_by: "oper".to_string(),
        }
    }

    #[test]
    fn test_ids_are_ascending_and_never_reused() {
        let store = MemoryStore::new();
        let a = store.insert(new_pattern("a.example")).unwrap();
        let b = store.insert(new_pattern("b.example")).unwrap();
        store.delete(b.id).unwrap();
        let c = store.insert(new_pattern("c.example")).unwrap();

        assert!(a.id < b.id && b.id < c.id);
        let ids: Vec<u64> = store.list_ordered().unwrap().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![a.id, c.id]);
    }

    #[test]
    fn test_update_pattern_bumps_version() {
        let store = MemoryStore::new();
        let p = store.insert(new_pattern("a.example")).unwrap();
        let (old, new) = store
            .update_pattern(p.id, &PatternSpec::parse("10.0.0.0/8").unwrap())
            .unwrap();

        assert_eq!(old.text, "a.example");
        assert_eq!(new.text, "10.0.0.0/8");
        assert_eq!(new.version, old.version + 1);
        assert_eq!(new.reason, old.reason);
        assert_eq!(new.severity, old.severity);
    }

    #[test]
    fn test_unknown_id() {
        let store = MemoryStore::new();
        assert_eq!(store.get(42), Err(MxblError::PatternNotFound(42)));
        assert!(store.update_reason(42, "x").is_err());
        assert!(store.update_severity(42, Severity::Off).is_err());
        assert!(store.delete(42).is_err());
        assert!(store.record_hit(42, Utc::now()).is_err());
    }

    #[test]
    fn test_record_hit() {
        let store = MemoryStore::new();
        let p = store.insert(new_pattern("a.example")).unwrap();
        let at = Utc::now();
        store.record_hit(p.id, at).unwrap();
        store.record_hit(p.id, at).unwrap();

        let p = store.get(p.id).unwrap();
        assert_eq!(p.hits, 2);
        assert_eq!(p.last_hit, Some(at));
    }
}
