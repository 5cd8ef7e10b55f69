use crate::action::{ActionSink, Detection, MailEvent};
use crate::cache::CleanCache;
use crate::candidates::CandidateSet;
use crate::config::{Config, FailurePolicy};
use crate::domain_utils::DomainUtils;
use crate::engine::{MatchEngine, Verdict};
use crate::error::{MxblError, Result};
use crate::pattern::PatternSpec;
use crate::resolver::{RecordKind, Resolver};
use crate::settings::Settings;
use crate::store::PatternStore;
use chrono::Utc;
use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CheckOptions {
    pub cache_ttl: Duration,
    pub on_total_failure: FailurePolicy,
    pub cache_unresolved: bool,
}

impl From<&Config> for CheckOptions {
    fn from(config: &Config) -> Self {
        Self {
            cache_ttl: config.cache_ttl(),
            on_total_failure: config.resolution.on_total_failure,
            cache_unresolved: config.resolution.cache_unresolved,
        }
    }
}

impl Default for CheckOptions {
    fn default() -> Self {
        CheckOptions::from(&Config::default())
    }
}

struct Pipeline {
    store: Arc<dyn PatternStore>,
    engine: Arc<MatchEngine>,
    cache: Arc<CleanCache>,
    resolver: Arc<dyn Resolver>,
    options: CheckOptions,
}

type SharedCheck = Shared<BoxFuture<'static, Result<Verdict>>>;

/// Per-domain pipeline: clean cache, DNS, match, cache update, and hand-off
/// of detections to the action sink.
///
/// Concurrent checks of the same domain share one in-flight evaluation.
#[derive(Clone)]
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    sink: Arc<dyn ActionSink>,
    settings: Arc<Settings>,
    inflight: Arc<Mutex<HashMap<String, SharedCheck>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn PatternStore>,
        engine: Arc<MatchEngine>,
        cache: Arc<CleanCache>,
        resolver: Arc<dyn Resolver>,
        sink: Arc<dyn ActionSink>,
        settings: Arc<Settings>,
        options: CheckOptions,
    ) -> Self {
        Self {
            pipeline: Arc::new(Pipeline {
                store,
                engine,
                cache,
                resolver,
                options,
            }),
            sink,
            settings,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run the live pipeline for a mail event and hand any detection to the
    /// action sink. Returns the detection, if there was one.
    pub async fn handle_event(&self, event: MailEvent) -> Result<Option<Detection>> {
        let domain = event
            .domain()
            .ok_or_else(|| MxblError::InvalidAddress(event.email.clone()))?;

        let verdict = self.check_domain(&domain).await?;
        if verdict.is_clean() {
            return Ok(None);
        }

        let paused = self.settings.paused();
        if paused {
            log::debug!("Enforcement paused, logging {domain} only");
        }
        let detection = Detection {
            disposition: Detection::disposition_for(&verdict, paused),
            event,
            domain,
            verdict,
        };
        self.sink.handle(&detection).await;
        Ok(Some(detection))
    }

    /// Cached, coalesced verdict for a domain or email address
    pub async fn check_domain(&self, input: &str) -> Result<Verdict> {
        let domain = DomainUtils::extract_domain(input)
            .ok_or_else(|| MxblError::InvalidAddress(input.to_string()))?;

        let check = {
            let mut inflight = self.inflight.lock();
            if let Some(existing) = inflight.get(&domain).cloned() {
                log::debug!("Joining in-flight check for {domain}");
                existing
            } else {
                let pipeline = self.pipeline.clone();
                let registry = self.inflight.clone();
                let key = domain.clone();
                let check = async move {
                    let result = pipeline.run(&key).await;
                    registry.lock().remove(&key);
                    result
                }
                .boxed()
                .shared();
                inflight.insert(domain, check.clone());
                check
            }
        };

        check.await
    }

    /// Evaluate a domain without touching the clean cache, hit counters or
    /// the action sink
    pub async fn test_domain(&self, input: &str) -> Result<Verdict> {
        let domain = DomainUtils::extract_domain(input)
            .ok_or_else(|| MxblError::InvalidAddress(input.to_string()))?;
        let candidates = self.pipeline.resolve_candidates(&domain).await;
        let patterns = self.pipeline.store.list_ordered()?;
        let verdict = self.pipeline.engine.evaluate(&candidates, &patterns);
        Ok(self.pipeline.apply_failure_policy(verdict, &candidates))
    }

    /// Test a single ad-hoc pattern against a domain, bypassing the store.
    /// Returns the first candidate it matched.
    pub async fn test_pattern(&self, spec: &PatternSpec, input: &str) -> Result<Option<String>> {
        let matcher = spec.compile()?;
        let domain = DomainUtils::extract_domain(input)
            .ok_or_else(|| MxblError::InvalidAddress(input.to_string()))?;
        let candidates = self.pipeline.resolve_candidates(&domain).await;
        Ok(matcher
            .first_match(&candidates)
            .map(|candidate| candidate.value().to_string()))
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }
}

impl Pipeline {
    async fn run(&self, domain: &str) -> Result<Verdict> {
        if self.cache.lookup(domain).is_some() {
            log::debug!("{domain} is cached clean");
            return Ok(Verdict::clean());
        }

        let mut generation = self.cache.generation();
        let candidates = self.resolve_candidates(domain).await;

        loop {
            let patterns = self.store.list_ordered()?;
            let verdict = self.engine.evaluate(&candidates, &patterns);
            let verdict = self.apply_failure_policy(verdict, &candidates);

            if !verdict.is_clean() {
                self.record_hit(&verdict);
                return Ok(verdict);
            }

            if candidates.is_degraded() && !self.options.cache_unresolved {
                log::debug!("Not caching unresolved domain {domain}");
                return Ok(verdict);
            }

            if self.cache.store_if_current(
                domain,
                candidates.clone(),
                self.options.cache_ttl,
                generation,
            ) {
                log::debug!("Cached {domain} as clean ({} candidates)", candidates.len());
                return Ok(verdict);
            }

            log::debug!("Patterns changed while checking {domain}, re-evaluating");
            generation = self.cache.generation();
        }
    }

    fn record_hit(&self, verdict: &Verdict) {
        if let Some(id) = verdict.matched_pattern_id() {
            if let Err(e) = self.store.record_hit(id, Utc::now()) {
                log::error!("Failed to record hit for pattern #{id}: {e}");
            }
        }
    }

    fn apply_failure_policy(&self, verdict: Verdict, candidates: &CandidateSet) -> Verdict {
        if candidates.is_degraded()
            && verdict.is_clean()
            && self.options.on_total_failure == FailurePolicy::FailClosed
        {
            Verdict::unresolved()
        } else {
            verdict
        }
    }

    /// Build the candidate set for a domain: MX hosts, then A and AAAA for
    /// the domain and every MX host. Failed lookups only drop their own
    /// contribution.
    async fn resolve_candidates(&self, domain: &str) -> CandidateSet {
        let mut candidates = CandidateSet::new(domain);
        let mut attempted = 1;
        let mut failed = 0;

        let mx_hosts = match self.resolver.resolve(domain, RecordKind::Mx).await {
            Ok(hosts) => hosts,
            Err(e) => {
                log::debug!("{e}");
                failed += 1;
                Vec::new()
            }
        };

        let mut names = vec![domain.to_string()];
        for host in &mx_hosts {
            if candidates.insert(host) {
                names.push(DomainUtils::normalize_host(host));
            }
        }

        let lookups = names.iter().flat_map(|name| {
            [RecordKind::A, RecordKind::Aaaa]
                .into_iter()
                .map(move |kind| self.resolver.resolve(name, kind))
        });
        for result in join_all(lookups).await {
            attempted += 1;
            match result {
                Ok(addresses) => {
                    for address in &addresses {
                        candidates.insert(address);
                    }
                }
                Err(e) => {
                    log::debug!("{e}");
                    failed += 1;
                }
            }
        }

        if failed == attempted {
            log::warn!("Every lookup for {domain} failed, evaluating the bare domain");
            candidates.mark_degraded();
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{EventKind, RecordingSink};
    use crate::engine::Outcome;
    use crate::pattern::Severity;
    use crate::resolver::mock::MockResolver;
    use crate::pattern::Pattern;
    use crate::store::{ListFilter, MemoryStore, NewPattern};
    use chrono::DateTime;

    struct Harness {
        store: Arc<MemoryStore>,
        cache: Arc<CleanCache>,
        resolver: Arc<MockResolver>,
        sink: Arc<RecordingSink>,
        settings: Arc<Settings>,
        orchestrator: Orchestrator,
    }

    fn harness_with(resolver: MockResolver, options: CheckOptions) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(CleanCache::new(64));
        let resolver = Arc::new(resolver);
        let sink = Arc::new(RecordingSink::new());
        let settings = Arc::new(Settings::new(store.clone()));
        let orchestrator = Orchestrator::new(
            store.clone(),
            Arc::new(MatchEngine::new()),
            cache.clone(),
            resolver.clone(),
            sink.clone(),
            settings.clone(),
            options,
        );
        Harness {
            store,
            cache,
            resolver,
            sink,
            settings,
            orchestrator,
        }
    }

    fn bad_example() -> MockResolver {
        let resolver = MockResolver::new();
        resolver
            .answer("bad.example", RecordKind::Mx, &["mx.bad.example."])
            .answer("mx.bad.example", RecordKind::A, &["10.0.0.5"]);
        resolver
    }

    fn add(store: &MemoryStore, raw: &str, severity: Severity) -> u64 {
        store
            .insert(NewPattern {
                spec: PatternSpec::parse(raw).unwrap(),
                severity,
                reason: "bad provider".to_string(),
                created_by: "oper".to_string(),
            })
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_lethal_mx_address() {
        let h = harness_with(bad_example(), CheckOptions::default());
        let id = add(&h.store, "10.0.0.0/24", Severity::Lethal);

        let verdict = h.orchestrator.check_domain("user@bad.example").await.unwrap();
        assert_eq!(verdict.outcome, Outcome::Lethal);
        assert_eq!(verdict.matched_pattern_id(), Some(id));
        assert_eq!(verdict.matched_value(), Some("10.0.0.5"));

        assert!(h.cache.lookup("bad.example").is_none());
        assert_eq!(h.store.get(id).unwrap().hits, 1);
    }

    #[tokio::test]
    async fn test_clean_result_is_cached() {
        let h = harness_with(bad_example(), CheckOptions::default());
        add(&h.store, "192.0.2.0/24", Severity::Lethal);

        assert!(h.orchestrator.check_domain("bad.example").await.unwrap().is_clean());
        let lookups = h.resolver.calls();
        assert_eq!(lookups, 5);

        let entry = h.cache.lookup("bad.example").expect("cached");
        assert_eq!(entry.candidates.values(), vec!["bad.example", "mx.bad.example", "10.0.0.5"]);

        assert!(h.orchestrator.check_domain("bad.example").await.unwrap().is_clean());
        assert_eq!(h.resolver.calls(), lookups);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_checks_are_coalesced() {
        let resolver = MockResolver::with_delay(Duration::from_millis(50));
        resolver.answer("slow.example", RecordKind::A, &["192.0.2.10"]);
        let h = harness_with(resolver, CheckOptions::default());

        let checks = (0..8).map(|_| h.orchestrator.check_domain("slow.example"));
        let verdicts = join_all(checks).await;

        assert!(verdicts.iter().all(|v| v.as_ref().unwrap().is_clean()));
        assert_eq!(h.resolver.calls(), 3);
        assert_eq!(h.orchestrator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_other_records() {
        let resolver = bad_example();
        resolver.fail("bad.example", RecordKind::A);
        let h = harness_with(resolver, CheckOptions::default());

        h.orchestrator.check_domain("bad.example").await.unwrap();
        let entry = h.cache.lookup("bad.example").unwrap();
        assert!(!entry.candidates.is_degraded());
        assert_eq!(entry.candidates.values(), vec!["bad.example", "mx.bad.example", "10.0.0.5"]);
    }

    #[tokio::test]
    async fn test_total_failure_fail_open() {
        let resolver = MockResolver::new();
        for kind in [RecordKind::Mx, RecordKind::A, RecordKind::Aaaa] {
            resolver.fail("down.example", kind);
        }
        let h = harness_with(resolver, CheckOptions::default());

        let verdict = h.orchestrator.check_domain("down.example").await.unwrap();
        assert!(verdict.is_clean());
        assert!(h.cache.lookup("down.example").is_none());

        let id = add(&h.store, "down.example", Severity::Warn);
        let verdict = h.orchestrator.check_domain("down.example").await.unwrap();
        assert_eq!(verdict.matched_pattern_id(), Some(id));
    }

    #[tokio::test]
    async fn test_total_failure_fail_closed() {
        let resolver = MockResolver::new();
        for kind in [RecordKind::Mx, RecordKind::A, RecordKind::Aaaa] {
            resolver.fail("down.example", kind);
        }
        let options = CheckOptions {
            on_total_failure: FailurePolicy::FailClosed,
            ..CheckOptions::default()
        };
        let h = harness_with(resolver, options);

        let verdict = h.orchestrator.check_domain("down.example").await.unwrap();
        assert_eq!(verdict.outcome, Outcome::Warn);
        assert!(verdict.unresolved);
        assert_eq!(verdict.matched_pattern_id(), None);
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_cache_unresolved_option() {
        let resolver = MockResolver::new();
        for kind in [RecordKind::Mx, RecordKind::A, RecordKind::Aaaa] {
            resolver.fail("down.example", kind);
        }
        let options = CheckOptions {
            cache_unresolved: true,
            ..CheckOptions::default()
        };
        let h = harness_with(resolver, options);

        h.orchestrator.check_domain("down.example").await.unwrap();
        let entry = h.cache.lookup("down.example").unwrap();
        assert!(entry.candidates.is_degraded());
        assert_eq!(entry.candidates.values(), vec!["down.example"]);
    }

    #[tokio::test]
    async fn test_events_reach_sink_with_disposition() {
        let h = harness_with(bad_example(), CheckOptions::default());
        add(&h.store, "mx.bad.example", Severity::Lethal);

        let event = MailEvent::new("alice", "alice@bad.example", EventKind::Registration);
        let detection = h.orchestrator.handle_event(event).await.unwrap().unwrap();
        assert_eq!(detection.disposition, crate::action::Disposition::Enforce);
        assert_eq!(detection.planned_actions().len(), 3);

        h.settings.set("pause", "1").unwrap();
        let event = MailEvent::new("bob", "bob@bad.example", EventKind::EmailChange);
        let detection = h.orchestrator.handle_event(event).await.unwrap().unwrap();
        assert_eq!(detection.disposition, crate::action::Disposition::LogOnly);
        assert_eq!(detection.verdict.outcome, Outcome::Lethal);
        assert!(detection.planned_actions().is_empty());

        assert_eq!(h.sink.detections().len(), 2);
    }

    #[tokio::test]
    async fn test_clean_events_skip_sink() {
        let h = harness_with(bad_example(), CheckOptions::default());
        let event = MailEvent::new("carol", "carol@bad.example", EventKind::Registration);
        assert!(h.orchestrator.handle_event(event).await.unwrap().is_none());
        assert!(h.sink.detections().is_empty());

        let invalid = MailEvent::new("dave", "dave@", EventKind::Registration);
        assert!(matches!(
            h.orchestrator.handle_event(invalid).await,
            Err(MxblError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_test_domain_has_no_side_effects() {
        let h = harness_with(bad_example(), CheckOptions::default());
        let id = add(&h.store, "10.0.0.5", Severity::Warn);

        let verdict = h.orchestrator.test_domain("x@bad.example").await.unwrap();
        assert_eq!(verdict.matched_pattern_id(), Some(id));
        assert_eq!(h.store.get(id).unwrap().hits, 0);

        h.store.delete(id).unwrap();
        assert!(h.orchestrator.test_domain("bad.example").await.unwrap().is_clean());
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_test_pattern_bypasses_store() {
        let h = harness_with(bad_example(), CheckOptions::default());

        let spec = PatternSpec::parse("%mx.*%").unwrap();
        let matched = h.orchestrator.test_pattern(&spec, "bad.example").await.unwrap();
        assert_eq!(matched.as_deref(), Some("mx.bad.example"));

        let spec = PatternSpec::parse("192.0.2.0/24").unwrap();
        assert_eq!(h.orchestrator.test_pattern(&spec, "bad.example").await.unwrap(), None);
        assert!(h.store.list_ordered().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hits_only_for_deciding_pattern() {
        let h = harness_with(bad_example(), CheckOptions::default());
        let warn = add(&h.store, "bad.example", Severity::Warn);
        let lethal = add(&h.store, "10.0.0.0/24", Severity::Lethal);

        let verdict = h.orchestrator.check_domain("bad.example").await.unwrap();
        assert_eq!(verdict.matched_pattern_id(), Some(lethal));

        let lethal = h.store.get(lethal).unwrap();
        assert_eq!(lethal.hits, 1);
        assert!(lethal.last_hit.is_some());
        let warn = h.store.get(warn).unwrap();
        assert_eq!(warn.hits, 0);
        assert!(warn.last_hit.is_none());
    }

    #[tokio::test]
    async fn test_hits_only_for_lowest_warn() {
        let h = harness_with(bad_example(), CheckOptions::default());
        let first = add(&h.store, "%mx.*%", Severity::Warn);
        let second = add(&h.store, "10.0.0.5", Severity::Warn);

        let verdict = h.orchestrator.check_domain("bad.example").await.unwrap();
        assert_eq!(verdict.matched_pattern_id(), Some(first));
        assert_eq!(h.store.get(first).unwrap().hits, 1);
        assert_eq!(h.store.get(second).unwrap().hits, 0);
    }

    /// Hands out one stale listing, then commits a pattern and sweeps the
    /// cache before the caller gets to store its clean result
    struct SweepAfterListing {
        inner: Arc<MemoryStore>,
        cache: Arc<CleanCache>,
        late_pattern: Mutex<Option<&'static str>>,
    }

    impl PatternStore for SweepAfterListing {
        fn list_ordered(&self) -> Result<Vec<Pattern>> {
            let snapshot = self.inner.list_ordered()?;
            if let Some(raw) = self.late_pattern.lock().take() {
                let pattern = self.inner.insert(NewPattern {
                    spec: PatternSpec::parse(raw)?,
                    severity: Severity::Lethal,
                    reason: "added mid-check".to_string(),
                    created_by: "oper".to_string(),
                })?;
                self.cache.invalidate(&pattern.compile()?);
            }
            Ok(snapshot)
        }

        fn list(&self, filter: ListFilter) -> Result<Vec<Pattern>> {
            self.inner.list(filter)
        }

        fn get(&self, id: u64) -> Result<Pattern> {
            self.inner.get(id)
        }

        fn insert(&self, pattern: NewPattern) -> Result<Pattern> {
            self.inner.insert(pattern)
        }

        fn update_pattern(&self, id: u64, spec: &PatternSpec) -> Result<(Pattern, Pattern)> {
            self.inner.update_pattern(id, spec)
        }

        fn update_reason(&self, id: u64, reason: &str) -> Result<Pattern> {
            self.inner.update_reason(id, reason)
        }

        fn update_severity(&self, id: u64, severity: Severity) -> Result<(Pattern, Severity)> {
            self.inner.update_severity(id, severity)
        }

        fn delete(&self, id: u64) -> Result<Pattern> {
            self.inner.delete(id)
        }

        fn record_hit(&self, id: u64, at: DateTime<Utc>) -> Result<()> {
            self.inner.record_hit(id, at)
        }
    }

    #[tokio::test]
    async fn test_sweep_during_check_reevaluates_without_dns() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(CleanCache::new(64));
        let resolver = Arc::new(bad_example());
        let orchestrator = Orchestrator::new(
            Arc::new(SweepAfterListing {
                inner: store.clone(),
                cache: cache.clone(),
                late_pattern: Mutex::new(Some("10.0.0.0/24")),
            }),
            Arc::new(MatchEngine::new()),
            cache.clone(),
            resolver.clone(),
            Arc::new(RecordingSink::new()),
            Arc::new(Settings::new(store.clone())),
            CheckOptions::default(),
        );

        let verdict = orchestrator.check_domain("bad.example").await.unwrap();
        assert_eq!(verdict.outcome, Outcome::Lethal);
        assert_eq!(verdict.matched_value(), Some("10.0.0.5"));
        assert!(cache.is_empty());
        assert_eq!(resolver.calls(), 5);
        assert_eq!(store.list_ordered().unwrap()[0].hits, 1);
    }
}
