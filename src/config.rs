use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/mxbl.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database holding patterns and settings
    pub database: String,
    pub resolver: ResolverConfig,
    pub cache: CacheConfig,
    pub resolution: ResolutionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
    pub max_entries: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    pub on_total_failure: FailurePolicy,
    /// Cache clean verdicts computed when every lookup failed
    pub cache_unresolved: bool,
}

/// What to conclude when no DNS lookup for a domain succeeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Evaluate the bare domain and accept a clean result
    FailOpen,
    /// Evaluate the bare domain and report a clean result as WARN
    FailClosed,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: "/var/lib/mxbl/mxbl.db".to_string(),
            resolver: ResolverConfig::default(),
            cache: CacheConfig::default(),
            resolution: ResolutionConfig::default(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self { timeout_seconds: 5 }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 3600,
            max_entries: 4096,
        }
    }
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            on_total_failure: FailurePolicy::FailOpen,
            cache_unresolved: false,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.resolver.timeout_seconds == 0 {
            anyhow::bail!("resolver.timeout_seconds must be greater than zero");
        }
        if self.cache.max_entries == 0 {
            anyhow::bail!("cache.max_entries must be greater than zero");
        }
        Ok(())
    }

    pub fn resolver_timeout(&self) -> Duration {
        Duration::from_secs(self.resolver.timeout_seconds)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = Config::from_yaml(
            "database: /tmp/mxbl.db\ncache:\n  ttl_seconds: 60\nresolution:\n  on_total_failure: fail_closed\n",
        )
        .unwrap();

        assert_eq!(config.database, "/tmp/mxbl.db");
        assert_eq!(config.cache_ttl(), Duration::from_secs(60));
        assert_eq!(config.cache.max_entries, 4096);
        assert_eq!(config.resolver_timeout(), Duration::from_secs(5));
        assert_eq!(config.resolution.on_total_failure, FailurePolicy::FailClosed);
        assert!(!config.resolution.cache_unresolved);
    }

    #[test]
    fn test_generated_config_round_trips() {
        let config = Config::default();
        let yaml = config.to_yaml().unwrap();
        assert_eq!(Config::from_yaml(&yaml).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::from_yaml("resolver:\n  timeout_seconds: 0\n").is_err());
        assert!(Config::from_yaml("cache:\n  max_entries: 0\n").is_err());
        assert!(Config::from_yaml("resolution:\n  on_total_failure: maybe\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cache:\n  max_entries: 10").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.cache.max_entries, 10);
        assert!(Config::load("/nonexistent/mxbl.yaml").is_err());
    }
}
