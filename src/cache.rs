use crate::candidates::CandidateSet;
use crate::matcher::Matcher;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// A domain previously evaluated clean, with the candidates it was
/// evaluated on
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub domain: String,
    pub candidates: CandidateSet,
    pub expires_at: Instant,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

struct Inner {
    entries: HashMap<String, CacheEntry>,
    generation: u64,
}

/// TTL-bounded cache of clean verdicts.
///
/// Entries keep their candidate sets so a pattern mutation can re-test them
/// without new DNS lookups. Every invalidation sweep runs under the cache
/// lock and bumps a generation counter; writers that evaluated against an
/// older generation are refused by [`CleanCache::store_if_current`].
pub struct CleanCache {
    inner: Mutex<Inner>,
    max_entries: usize,
}

impl CleanCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                generation: 0,
            }),
            max_entries: max_entries.max(1),
        }
    }

    /// Look up a domain, discarding the entry if it has expired
    pub fn lookup(&self, domain: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        match inner.entries.get(domain) {
            Some(entry) if !entry.is_expired(now) => Some(entry.clone()),
            Some(_) => {
                log::debug!("Clean cache entry for {domain} expired");
                inner.entries.remove(domain);
                None
            }
            None => None,
        }
    }

    /// Store a clean result, replacing any previous entry for the domain
    pub fn store(&self, domain: &str, candidates: CandidateSet, ttl: Duration) {
        let mut inner = self.inner.lock();
        self.insert_locked(&mut inner, domain, candidates, ttl);
    }

    /// Store a clean result only if no invalidation sweep has run since
    /// `generation` was observed. Returns whether the entry was written.
    pub fn store_if_current(
        &self,
        domain: &str,
        candidates: CandidateSet,
        ttl: Duration,
        generation: u64,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        self.insert_locked(&mut inner, domain, candidates, ttl);
        true
    }

    fn insert_locked(&self, inner: &mut Inner, domain: &str, candidates: CandidateSet, ttl: Duration) {
        let now = Instant::now();
        if !inner.entries.contains_key(domain) && inner.entries.len() >= self.max_entries {
            inner.entries.retain(|_, entry| !entry.is_expired(now));
            if inner.entries.len() >= self.max_entries {
                let oldest = inner
                    .entries
                    .values()
                    .min_by_key(|entry| entry.expires_at)
                    .map(|entry| entry.domain.clone());
                if let Some(oldest) = oldest {
                    inner.entries.remove(&oldest);
                }
            }
        }

        inner.entries.insert(
            domain.to_string(),
            CacheEntry {
                domain: domain.to_string(),
                candidates,
                expires_at: now + ttl,
            },
        );
    }

    pub fn evict(&self, domain: &str) -> bool {
        self.inner.lock().entries.remove(domain).is_some()
    }

    /// Live entries, sorted by domain
    pub fn list(&self) -> Vec<CacheEntry> {
        let now = Instant::now();
        let mut entries: Vec<CacheEntry> = self
            .inner
            .lock()
            .entries
            .values()
            .filter(|entry| !entry.is_expired(now))
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.domain.cmp(&b.domain));
        entries
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Evict every entry whose stored candidates are now accepted by
    /// `matcher`. Returns the evicted domains.
    pub fn invalidate(&self, matcher: &Matcher) -> Vec<String> {
        let mut inner = self.inner.lock();
        inner.generation += 1;

        let evicted: Vec<String> = inner
            .entries
            .values()
            .filter(|entry| matcher.first_match(&entry.candidates).is_some())
            .map(|entry| entry.domain.clone())
            .collect();
        for domain in &evicted {
            inner.entries.remove(domain);
        }

        if !evicted.is_empty() {
            log::info!(
                "Pattern {} evicted {} clean cache entries: {}",
                matcher.source(),
                evicted.len(),
                evicted.join(", ")
            );
        }
        evicted
    }
}
