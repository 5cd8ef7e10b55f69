use crate::domain_utils::DomainUtils;
use crate::engine::{Outcome, Verdict};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Registration,
    EmailChange,
}

/// An account registering with, or switching to, an email address
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailEvent {
    pub account: String,
    pub email: String,
    pub kind: EventKind,
}

impl MailEvent {
    pub fn new(account: &str, email: &str, kind: EventKind) -> Self {
        Self {
            account: account.to_string(),
            email: email.to_string(),
            kind,
        }
    }

    pub fn domain(&self) -> Option<String> {
        DomainUtils::extract_domain(&self.email)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Enforce,
    LogOnly,
}

/// Something the services side should do about a detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ModerationAction {
    Badmail { mask: String, reason: String },
    Drop { account: String },
    Freeze { account: String, reason: String },
    Notice { account: String, text: String },
}

impl fmt::Display for ModerationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModerationAction::Badmail { mask, reason } => write!(f, "BADMAIL ADD {mask} {reason}"),
            ModerationAction::Drop { account } => write!(f, "FDROP {account}"),
            ModerationAction::Freeze { account, reason } => write!(f, "FREEZE {account} ON {reason}"),
            ModerationAction::Notice { account, text } => write!(f, "NOTICE {account} :{text}"),
        }
    }
}

const DROP_NOTICE: &str = "Your account has been dropped, please register it again with a valid \
                           email address (no disposable/temporary email)";

/// A non-clean verdict for a mail event, ready for the action sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Detection {
    pub event: MailEvent,
    pub domain: String,
    pub verdict: Verdict,
    pub disposition: Disposition,
}

impl Detection {
    pub fn disposition_for(verdict: &Verdict, paused: bool) -> Disposition {
        if verdict.outcome == Outcome::Lethal && !paused {
            Disposition::Enforce
        } else {
            Disposition::LogOnly
        }
    }

    pub fn reason(&self) -> String {
        match self.verdict.matched_pattern() {
            Some(pattern) => pattern.full_reason(),
            None => "mxbl - domain could not be resolved".to_string(),
        }
    }

    /// Actions implied by this detection; empty unless enforcing
    pub fn planned_actions(&self) -> Vec<ModerationAction> {
        if self.disposition != Disposition::Enforce {
            return Vec::new();
        }

        let mask = format!("*@{}", self.domain);
        let reason = self.reason();
        let account = self.event.account.clone();
        let mut actions = vec![ModerationAction::Badmail {
            mask: mask.clone(),
            reason: reason.clone(),
        }];

        match self.event.kind {
            EventKind::Registration => {
                actions.push(ModerationAction::Drop {
                    account: account.clone(),
                });
                actions.push(ModerationAction::Notice {
                    account,
                    text: DROP_NOTICE.to_string(),
                });
            }
            EventKind::EmailChange => actions.push(ModerationAction::Freeze {
                account,
                reason: format!("changed email to {mask} ({reason})"),
            }),
        }
        actions
    }
}

/// Receives every non-clean verdict for a live mail event
#[async_trait]
pub trait ActionSink: Send + Sync {
    async fn handle(&self, detection: &Detection);
}

/// Logs detections and the actions they imply without carrying them out
#[derive(Default)]
pub struct LogSink;

#[async_trait]
impl ActionSink for LogSink {
    async fn handle(&self, detection: &Detection) {
        let label = match detection.disposition {
            Disposition::Enforce => "BAD",
            Disposition::LogOnly => "WARN",
        };
        let what = match detection.event.kind {
            EventKind::Registration => "registered",
            EventKind::EmailChange => "changed email on",
        };
        let matched = detection
            .verdict
            .matched_value()
            .map(|value| format!(" via {value}"))
            .unwrap_or_default();

        log::info!(
            "{label}: {} {what} with *@{}{matched} ({})",
            detection.event.account,
            detection.domain,
            detection.reason()
        );
        for action in detection.planned_actions() {
            log::info!("  -> {action}");
        }
    }
}

/// Keeps detections in memory, for front ends that report them afterwards
#[derive(Default)]
pub struct RecordingSink {
    detections: Mutex<Vec<Detection>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn detections(&self) -> Vec<Detection> {
        self.detections.lock().clone()
    }
}

#[async_trait]
impl ActionSink for RecordingSink {
    async fn handle(&self, detection: &Detection) {
        self.detections.lock().push(detection.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PatternMatch;
    use crate::pattern::{Pattern, PatternType, Severity};
    use chrono::Utc;

    fn lethal_verdict() -> Verdict {
        Verdict {
            outcome: Outcome::Lethal,
            matched: Some(PatternMatch {
                pattern: Pattern {
                    id: 12,
                    text: "10.0.0.0/24".to_string(),
                    kind: PatternType::Cidr,
                    severity: Severity::Lethal,
                    reason: "throwaway provider".to_string(),
                    created_at: Utc::now(),
                    created_by: "oper".to_string(),
                    hits: 0,
                    last_hit: None,
                    version: 0,
                },
                value: "10.0.0.5".to_string(),
            }),
            unresolved: false,
        }
    }

    fn detection(kind: EventKind, paused: bool) -> Detection {
        let verdict = lethal_verdict();
        Detection {
            event: MailEvent::new("alice", "alice@bad.example", kind),
            domain: "bad.example".to_string(),
            disposition: Detection::disposition_for(&verdict, paused),
            verdict,
        }
    }

    #[test]
    fn test_registration_is_dropped() {
        let actions = detection(EventKind::Registration, false).planned_actions();
        assert_eq!(
            actions.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
            vec![
                "BADMAIL ADD *@bad.example mxbl #12 - throwaway provider".to_string(),
                "FDROP alice".to_string(),
                format!("NOTICE alice :{DROP_NOTICE}"),
            ]
        );
    }

    #[test]
    fn test_email_change_is_frozen() {
        let actions = detection(EventKind::EmailChange, false).planned_actions();
        assert_eq!(actions.len(), 2);
        assert_eq!(
            actions[1].to_string(),
            "FREEZE alice ON changed email to *@bad.example (mxbl #12 - throwaway provider)"
        );
    }

    #[test]
    fn test_pause_and_warn_only_log() {
        assert!(detection(EventKind::Registration, true).planned_actions().is_empty());

        let mut warn = lethal_verdict();
        warn.outcome = Outcome::Warn;
        assert_eq!(Detection::disposition_for(&warn, false), Disposition::LogOnly);
    }

    #[test]
    fn test_event_domain() {
        let event = MailEvent::new("bob", "Bob@Mail.Example.", EventKind::Registration);
        assert_eq!(event.domain().as_deref(), Some("mail.example"));
    }
}
