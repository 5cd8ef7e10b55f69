use async_trait::async_trait;
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::TokioAsyncResolver;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Record types the engine asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Mx,
    A,
    Aaaa,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordKind::Mx => "MX",
            RecordKind::A => "A",
            RecordKind::Aaaa => "AAAA",
        })
    }
}

/// A single lookup that could not be answered
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} lookup for {name} failed: {reason}")]
pub struct ResolutionFailure {
    pub name: String,
    pub kind: RecordKind,
    pub reason: String,
}

/// DNS collaborator.
///
/// MX answers are host names ordered by preference; A and AAAA answers are
/// textual addresses. A name with no records of the requested type is an
/// empty answer, not a failure.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, name: &str, kind: RecordKind) -> Result<Vec<String>, ResolutionFailure>;
}

/// [`Resolver`] backed by hickory and the system resolver configuration
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl DnsResolver {
    pub fn from_system_conf(timeout: Duration) -> anyhow::Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
        Ok(Self { resolver, timeout })
    }

    async fn lookup(&self, name: &str, kind: RecordKind) -> Result<Vec<String>, ResolveError> {
        match kind {
            RecordKind::Mx => {
                let response = self.resolver.mx_lookup(name).await?;
                let mut records: Vec<(u16, String)> = response
                    .iter()
                    .map(|mx| (mx.preference(), mx.exchange().to_utf8()))
                    .collect();
                records.sort_by_key(|(preference, _)| *preference);
                Ok(records.into_iter().map(|(_, host)| host).collect())
            }
            RecordKind::A => {
                let response = self.resolver.ipv4_lookup(name).await?;
                Ok(response.iter().map(|a| a.0.to_string()).collect())
            }
            RecordKind::Aaaa => {
                let response = self.resolver.ipv6_lookup(name).await?;
                Ok(response.iter().map(|aaaa| aaaa.0.to_string()).collect())
            }
        }
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, name: &str, kind: RecordKind) -> Result<Vec<String>, ResolutionFailure> {
        let failure = |reason: String| ResolutionFailure {
            name: name.to_string(),
            kind,
            reason,
        };

        match tokio::time::timeout(self.timeout, self.lookup(name, kind)).await {
            Ok(Ok(records)) => {
                log::debug!("{kind} {name}: {}", records.join(", "));
                Ok(records)
            }
            Ok(Err(e)) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => {
                    log::debug!("{kind} {name}: no records");
                    Ok(Vec::new())
                }
                _ => Err(failure(e.to_string())),
            },
            Err(_) => Err(failure(format!("timed out after {:?}", self.timeout))),
        }
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Static answers keyed by (name, kind); unknown lookups are empty.
    #[derive(Default)]
    pub struct MockResolver {
        answers: Mutex<HashMap<(String, RecordKind), Result<Vec<String>, String>>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl MockResolver {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        pub fn answer(&self, name: &str, kind: RecordKind, records: &[&str]) -> &Self {
            self.answers.lock().insert(
                (name.to_string(), kind),
                Ok(records.iter().map(|r| r.to_string()).collect()),
            );
            self
        }

        pub fn fail(&self, name: &str, kind: RecordKind) -> &Self {
            self.answers
                .lock()
                .insert((name.to_string(), kind), Err("SERVFAIL".to_string()));
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Resolver for MockResolver {
        async fn resolve(&self, name: &str, kind: RecordKind) -> Result<Vec<String>, ResolutionFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let answer = self.answers.lock().get(&(name.to_string(), kind)).cloned();
            match answer {
                Some(Ok(records)) => Ok(records),
                Some(Err(reason)) => Err(ResolutionFailure {
                    name: name.to_string(),
                    kind,
                    reason,
                }),
                None => Ok(Vec::new()),
            }
        }
    }
}
