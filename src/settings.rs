use crate::error::Result;
use crate::store::SettingsStore;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub const PAUSE: &str = "pause";

/// Snapshot of the settings table, loaded on first use and written through
/// on every change.
pub struct Settings {
    store: Arc<dyn SettingsStore>,
    values: RwLock<Option<HashMap<String, String>>>,
}

impl Settings {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self {
            store,
            values: RwLock::new(None),
        }
    }

    /// Re-read the settings table
    pub fn reload(&self) -> Result<()> {
        let values = self.store.load_settings()?;
        *self.values.write() = Some(values);
        Ok(())
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.values.read().is_none() {
            self.reload()?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Option<String>> {
        self.ensure_loaded()?;
        Ok(self
            .values
            .read()
            .as_ref()
            .and_then(|values| values.get(&name.to_lowercase()).cloned()))
    }

    /// All settings, sorted by name
    pub fn all(&self) -> Result<BTreeMap<String, String>> {
        self.ensure_loaded()?;
        Ok(self
            .values
            .read()
            .as_ref()
            .map(|values| values.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    pub fn set(&self, name: &str, value: &str) -> Result<()> {
        let name = name.to_lowercase();
        self.ensure_loaded()?;
        self.store.save_setting(&name, value)?;
        if let Some(values) = self.values.write().as_mut() {
            values.insert(name, value.to_string());
        }
        Ok(())
    }

    /// Whether enforcement is paused (`pause` set to anything but `"0"`).
    ///
    /// An unreadable settings table counts as not paused.
    pub fn paused(&self) -> bool {
        match self.get(PAUSE) {
            Ok(value) => value.map(|v| v.trim() != "0").unwrap_or(false),
            Err(e) => {
                log::warn!("Could not read pause setting, enforcing: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_pause_flag() {
        let store = Arc::new(MemoryStore::new());
        let settings = Settings::new(store.clone());
        assert!(!settings.paused());

        settings.set("PAUSE", "1").unwrap();
        assert!(settings.paused());
        assert_eq!(store.load_settings().unwrap().get("pause").map(String::as_str), Some("1"));

        settings.set("pause", "0").unwrap();
        assert!(!settings.paused());
    }

    #[test]
    fn test_reload_picks_up_external_changes() {
        let store = Arc::new(MemoryStore::new());
        let settings = Settings::new(store.clone());
        assert_eq!(settings.get("pause").unwrap(), None);

        store.save_setting("pause", "1").unwrap();
        assert_eq!(settings.get("pause").unwrap(), None);

        settings.reload().unwrap();
        assert_eq!(settings.get("pause").unwrap().as_deref(), Some("1"));
        assert_eq!(settings.all().unwrap().len(), 1);
    }
}
