use crate::action::ActionSink;
use crate::cache::{CacheEntry, CleanCache};
use crate::domain_utils::DomainUtils;
use crate::engine::{MatchEngine, Verdict};
use crate::error::Result;
use crate::orchestrator::{CheckOptions, Orchestrator};
use crate::pattern::{Pattern, PatternSpec, Severity};
use crate::resolver::Resolver;
use crate::settings::Settings;
use crate::store::{ListFilter, NewPattern, PatternStore, SettingsStore};
use std::sync::Arc;

/// A committed change to the pattern set
#[derive(Debug, Clone)]
pub enum PatternEvent {
    Added(Pattern),
    Edited { old: Pattern, new: Pattern },
    ReasonEdited(Pattern),
    StatusChanged { pattern: Pattern, old: Severity },
    Removed(Pattern),
}

/// The administrative operations over the blocklist.
///
/// Patterns are compiled before anything is written, so a malformed pattern
/// leaves the store untouched. After each committed mutation the compiled
/// matcher is dropped and, where the change can make a clean domain dirty,
/// the clean cache is swept with the changed pattern.
pub struct MxblService {
    store: Arc<dyn PatternStore>,
    engine: Arc<MatchEngine>,
    cache: Arc<CleanCache>,
    settings: Arc<Settings>,
    orchestrator: Orchestrator,
}

impl MxblService {
    /// Wire up a service around one store that holds both patterns and
    /// settings
    pub fn with_store<S>(
        store: Arc<S>,
        resolver: Arc<dyn Resolver>,
        sink: Arc<dyn ActionSink>,
        options: CheckOptions,
        cache_size: usize,
    ) -> Self
    where
        S: PatternStore + SettingsStore + 'static,
    {
        let engine = Arc::new(MatchEngine::new());
        let cache = Arc::new(CleanCache::new(cache_size));
        let settings = Arc::new(Settings::new(store.clone()));
        let orchestrator = Orchestrator::new(
            store.clone(),
            engine.clone(),
            cache.clone(),
            resolver,
            sink,
            settings.clone(),
            options,
        );

        Self {
            store,
            engine,
            cache,
            settings,
            orchestrator,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn add(&self, raw: &str, reason: &str, added_by: &str) -> Result<Pattern> {
        let spec = PatternSpec::parse(raw)?;
        let pattern = self.store.insert(NewPattern {
            spec,
            severity: Severity::Warn,
            reason: reason.to_string(),
            created_by: added_by.to_string(),
        })?;
        log::info!(
            "{added_by} ADD: added pattern {} {} ({reason})",
            pattern.id,
            pattern.spec()
        );
        self.on_pattern_event(&PatternEvent::Added(pattern.clone()));
        Ok(pattern)
    }

    pub fn edit_pattern(&self, id: u64, raw: &str) -> Result<Pattern> {
        let spec = PatternSpec::parse(raw)?;
        let (old, new) = self.store.update_pattern(id, &spec)?;
        log::info!("EDITPATTERN: updated pattern {id} from {} to {}", old.spec(), new.spec());
        self.on_pattern_event(&PatternEvent::Edited {
            old,
            new: new.clone(),
        });
        Ok(new)
    }

    pub fn edit_reason(&self, id: u64, reason: &str) -> Result<Pattern> {
        let pattern = self.store.update_reason(id, reason)?;
        log::info!("EDITREASON: updated pattern {id} {} reason: {reason}", pattern.spec());
        self.on_pattern_event(&PatternEvent::ReasonEdited(pattern.clone()));
        Ok(pattern)
    }

    /// Change severity, returning the updated pattern and the old severity
    pub fn set_severity(&self, id: u64, severity: Severity) -> Result<(Pattern, Severity)> {
        let (pattern, old) = self.store.update_severity(id, severity)?;
        log::info!("SET: pattern {id} {}: {old} -> {severity}", pattern.spec());
        self.on_pattern_event(&PatternEvent::StatusChanged {
            pattern: pattern.clone(),
            old,
        });
        Ok((pattern, old))
    }

    /// Flip between WARN and LETHAL; an OFF pattern comes back as WARN
    pub fn toggle(&self, id: u64) -> Result<(Pattern, Severity)> {
        let next = match self.store.get(id)?.severity {
            Severity::Warn => Severity::Lethal,
            Severity::Lethal | Severity::Off => Severity::Warn,
        };
        self.set_severity(id, next)
    }

    pub fn delete(&self, id: u64) -> Result<Pattern> {
        let pattern = self.store.delete(id)?;
        log::info!("DEL: deleted pattern {id} {} ({})", pattern.spec(), pattern.reason);
        self.on_pattern_event(&PatternEvent::Removed(pattern.clone()));
        Ok(pattern)
    }

    pub fn get(&self, id: u64) -> Result<Pattern> {
        self.store.get(id)
    }

    pub fn list(&self, filter: ListFilter) -> Result<Vec<Pattern>> {
        self.store.list(filter)
    }

    /// Would this email or domain match? No caching, hits or actions.
    pub async fn test(&self, input: &str) -> Result<Verdict> {
        self.orchestrator.test_domain(input).await
    }

    /// Would this email or domain match an ad-hoc pattern?
    pub async fn test_pattern(&self, raw: &str, input: &str) -> Result<Option<String>> {
        let spec = PatternSpec::parse(raw)?;
        self.orchestrator.test_pattern(&spec, input).await
    }

    pub fn cache_show(&self) -> Vec<CacheEntry> {
        self.cache.list()
    }

    pub fn cache_del(&self, domain: &str) -> bool {
        self.cache.evict(&DomainUtils::normalize_host(domain))
    }

    /// React to a committed mutation. Returns the domains evicted from the
    /// clean cache.
    pub fn on_pattern_event(&self, event: &PatternEvent) -> Vec<String> {
        let sweep_with = match event {
            PatternEvent::Added(pattern) => {
                self.engine.forget(pattern.id);
                pattern.severity.is_active().then_some(pattern)
            }
            PatternEvent::Edited { new, .. } => {
                self.engine.forget(new.id);
                new.severity.is_active().then_some(new)
            }
            PatternEvent::StatusChanged { pattern, old } => {
                self.engine.forget(pattern.id);
                pattern
                    .severity
                    .requires_invalidation_from(*old)
                    .then_some(pattern)
            }
            PatternEvent::Removed(pattern) => {
                self.engine.forget(pattern.id);
                None
            }
            PatternEvent::ReasonEdited(_) => None,
        };

        let Some(pattern) = sweep_with else {
            return Vec::new();
        };
        match self.engine.matcher_for(pattern) {
            Ok(matcher) => self.cache.invalidate(&matcher),
            Err(e) => {
                log::error!("Cannot sweep clean cache with pattern #{}: {e}", pattern.id);
                Vec::new()
            }
        }
    }
}
