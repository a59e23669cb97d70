//! Keep/move decisions produced by the classifier

use serde::{Deserialize, Serialize};

use super::Uid;

/// What to do with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Keep,
    Move,
}

/// Why a decision was made
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "rule", content = "matched", rename_all = "kebab-case")]
pub enum Reason {
    /// Sender address or domain is whitelisted
    Whitelisted,
    /// Subject contains a protected keyword
    Protected(String),
    /// Message is flagged/starred
    Flagged,
    /// Sender domain matches a trigger domain
    TriggerDomain(String),
    /// Subject contains a trigger keyword
    TriggerKeyword(String),
    /// A List-Unsubscribe header is present
    ListUnsubscribe,
    /// No rule matched
    NoMatch,
}

impl Reason {
    /// Short stable tag, suitable for logs and reports
    pub fn tag(&self) -> &'static str {
        match self {
            Reason::Whitelisted => "whitelisted",
            Reason::Protected(_) => "protected",
            Reason::Flagged => "flagged",
            Reason::TriggerDomain(_) => "trigger-domain",
            Reason::TriggerKeyword(_) => "trigger-keyword",
            Reason::ListUnsubscribe => "list-unsubscribe",
            Reason::NoMatch => "no-match",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reason::Protected(kw) => write!(f, "protected subject '{}'", kw),
            Reason::TriggerDomain(domain) => write!(f, "trigger domain '{}'", domain),
            Reason::TriggerKeyword(kw) => write!(f, "subject keyword '{}'", kw),
            Reason::ListUnsubscribe => f.write_str("List-Unsubscribe header"),
            other => f.write_str(other.tag()),
        }
    }
}

/// Classification result for one message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Verdict {
    pub uid: Uid,
    pub folder: String,
    pub decision: Decision,
    pub reason: Reason,
}

impl Verdict {
    pub fn keep(uid: Uid, folder: impl Into<String>, reason: Reason) -> Self {
        Self {
            uid,
            folder: folder.into(),
            decision: Decision::Keep,
            reason,
        }
    }

    pub fn move_to_review(uid: Uid, folder: impl Into<String>, reason: Reason) -> Self {
        Self {
            uid,
            folder: folder.into(),
            decision: Decision::Move,
            reason,
        }
    }

    pub fn is_move(&self) -> bool {
        self.decision == Decision::Move
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_display() {
        assert_eq!(
            Reason::TriggerKeyword("sale".into()).to_string(),
            "subject keyword 'sale'"
        );
        assert_eq!(Reason::Whitelisted.to_string(), "whitelisted");
        assert_eq!(Reason::TriggerDomain("x.com".into()).tag(), "trigger-domain");
    }

    #[test]
    fn test_verdict_serializes_reason_tag() {
        let verdict = Verdict::move_to_review(Uid::new(3), "INBOX", Reason::ListUnsubscribe);
        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["decision"], "move");
        assert_eq!(json["reason"]["rule"], "list-unsubscribe");
    }
}
