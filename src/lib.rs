pub mod action;
pub mod cache;
pub mod candidates;
pub mod config;
pub mod domain_utils;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod orchestrator;
pub mod pattern;
pub mod resolver;
pub mod service;
pub mod settings;
pub mod store;

pub use action::{ActionSink, Detection, Disposition, EventKind, LogSink, MailEvent, RecordingSink};
pub use cache::{CacheEntry, CleanCache};
pub use candidates::{Candidate, CandidateSet};
pub use config::{Config, FailurePolicy};
pub use engine::{MatchEngine, Outcome, Verdict};
pub use error::{MxblError, Result};
pub use matcher::Matcher;
pub use orchestrator::{CheckOptions, Orchestrator};
pub use pattern::{Pattern, PatternSpec, PatternType, Severity};
pub use resolver::{DnsResolver, RecordKind, ResolutionFailure, Resolver};
pub use service::{MxblService, PatternEvent};
pub use settings::Settings;
pub use store::{ListFilter, MemoryStore, PatternStore, SettingsStore, SqliteStore};
