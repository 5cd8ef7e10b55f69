use crate::candidates::CandidateSet;
use crate::error::Result;
use crate::matcher::Matcher;
use crate::pattern::{Pattern, Severity};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Clean,
    Warn,
    Lethal,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Clean => "CLEAN",
            Outcome::Warn => "WARN",
            Outcome::Lethal => "LETHAL",
        })
    }
}

/// The entry that decided a verdict and the candidate it accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatternMatch {
    pub pattern: Pattern,
    pub value: String,
}

/// Result of evaluating one domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub outcome: Outcome,
    pub matched: Option<PatternMatch>,
    /// Set when the outcome comes from the fail-closed resolution policy
    /// rather than from a pattern.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub unresolved: bool,
}

impl Verdict {
    pub fn clean() -> Self {
        Verdict {
            outcome: Outcome::Clean,
            matched: None,
            unresolved: false,
        }
    }

    pub fn unresolved() -> Self {
        Verdict {
            outcome: Outcome::Warn,
            matched: None,
            unresolved: true,
        }
    }

    fn matched(pattern: &Pattern, value: &str) -> Self {
        let outcome = match pattern.severity {
            Severity::Lethal => Outcome::Lethal,
            _ => Outcome::Warn,
        };
        Verdict {
            outcome,
            matched: Some(PatternMatch {
                pattern: pattern.clone(),
                value: value.to_string(),
            }),
            unresolved: false,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.outcome == Outcome::Clean
    }

    pub fn matched_pattern_id(&self) -> Option<u64> {
        self.matched.as_ref().map(|m| m.pattern.id)
    }

    pub fn matched_value(&self) -> Option<&str> {
        self.matched.as_ref().map(|m| m.value.as_str())
    }

    pub fn matched_pattern(&self) -> Option<&Pattern> {
        self.matched.as_ref().map(|m| &m.pattern)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.matched {
            Some(m) => write!(f, "{} on {}: {}", self.outcome, m.value, m.pattern),
            None if self.unresolved => write!(f, "{} (domain could not be resolved)", self.outcome),
            None => write!(f, "{}", self.outcome),
        }
    }
}

/// Evaluates candidate sets against the pattern listing.
///
/// Compiled matchers are kept per pattern id together with the pattern
/// version they were built from, so an edited pattern is recompiled on its
/// next use even if a mutation notification was missed.
#[derive(Default)]
pub struct MatchEngine {
    compiled: Mutex<HashMap<u64, (u64, Arc<Matcher>)>>,
}

impl MatchEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matcher_for(&self, pattern: &Pattern) -> Result<Arc<Matcher>> {
        if let Some((version, matcher)) = self.compiled.lock().get(&pattern.id) {
            if *version == pattern.version {
                return Ok(matcher.clone());
            }
        }

        let matcher = Arc::new(pattern.compile()?);
        self.compiled
            .lock()
            .insert(pattern.id, (pattern.version, matcher.clone()));
        Ok(matcher)
    }

    /// Drop the compiled matcher for a pattern that changed or went away
    pub fn forget(&self, id: u64) {
        self.compiled.lock().remove(&id);
    }

    pub fn compiled_len(&self) -> usize {
        self.compiled.lock().len()
    }

    /// Evaluate `candidates` against `patterns`.
    ///
    /// Patterns are scanned in ascending id order whatever order they are
    /// given in, `Off` entries are skipped, the first `Lethal` match ends the
    /// scan and otherwise the lowest-id `Warn` match wins.
    pub fn evaluate(&self, candidates: &CandidateSet, patterns: &[Pattern]) -> Verdict {
        let mut ordered: Vec<&Pattern> = patterns
            .iter()
            .filter(|p| p.severity.is_active())
            .collect();
        ordered.sort_by_key(|p| p.id);

        let mut first_warn: Option<Verdict> = None;

        for pattern in ordered {
            if pattern.severity == Severity::Warn && first_warn.is_some() {
                continue;
            }

            let matcher = match self.matcher_for(pattern) {
                Ok(matcher) => matcher,
                Err(e) => {
                    log::warn!("Skipping pattern #{} that no longer compiles: {e}", pattern.id);
                    continue;
                }
            };

            if let Some(candidate) = matcher.first_match(candidates) {
                log::debug!(
                    "{} matched pattern #{} ({}) on {}",
                    candidates.domain(),
                    pattern.id,
                    pattern.severity,
                    candidate.value()
                );
                let verdict = Verdict::matched(pattern, candidate.value());
                if pattern.severity == Severity::Lethal {
                    return verdict;
                }
                first_warn = Some(verdict);
            }
        }

        first_warn.unwrap_or_else(Verdict::clean)
    }
}
