//! Message identifiers, addresses and header records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::SessionError;

/// IMAP UID of a message within its folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uid(pub u32);

impl Uid {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl From<u32> for Uid {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Uid {
    type Err = SessionError;

    /// Parse a UID as returned by a SEARCH response. UIDs are non-zero.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<u32>() {
            Ok(0) | Err(_) => Err(SessionError::InvalidId(s.to_string())),
            Ok(id) => Ok(Self(id)),
        }
    }
}

/// An email address with optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    /// Display name (e.g., "John Doe")
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com")
    pub email: String,
}

impl EmailAddress {
    /// Create a new email address with just the email
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    /// Create a new email address with a display name
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into(),
        }
    }

    /// Parse an email address from a string like "John Doe <john@example.com>"
    pub fn parse(s: &str) -> Self {
        let s = s.trim();

        // Try to parse "Name <email>" format
        if let Some(angle_start) = s.rfind('<')
            && let Some(angle_end) = s.rfind('>')
            && angle_start < angle_end
        {
            let name = s[..angle_start].trim().trim_matches('"').trim();
            let email = s[angle_start + 1..angle_end].trim();
            return Self {
                name: if name.is_empty() {
                    None
                } else {
                    Some(name.to_string())
                },
                email: email.to_string(),
            };
        }

        // Otherwise, treat the whole string as an email
        Self {
            name: None,
            email: s.to_string(),
        }
    }

    /// Lower-cased address, used for whitelist lookups
    pub fn normalized(&self) -> String {
        self.email.to_lowercase()
    }

    /// Lower-cased domain part, or an empty string when there is no `@`
    pub fn domain(&self) -> String {
        match self.email.rsplit_once('@') {
            Some((_, domain)) => domain.to_lowercase(),
            None => String::new(),
        }
    }
}

/// Header fields as returned by a session, before normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedHeaders {
    pub uid: Uid,
    /// Raw From header
    pub from: Option<String>,
    /// Raw Subject header, possibly RFC 2047 encoded
    pub subject: Option<String>,
    /// Raw List-Unsubscribe header
    pub list_unsubscribe: Option<String>,
    /// Whether the \Flagged flag is set
    pub flagged: bool,
    /// Server INTERNALDATE
    pub internal_date: Option<DateTime<Utc>>,
}

impl FetchedHeaders {
    pub fn new(uid: Uid) -> Self {
        Self {
            uid,
            from: None,
            subject: None,
            list_unsubscribe: None,
            flagged: false,
            internal_date: None,
        }
    }

    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn list_unsubscribe(mut self, value: impl Into<String>) -> Self {
        self.list_unsubscribe = Some(value.into());
        self
    }

    pub fn flagged(mut self, flagged: bool) -> Self {
        self.flagged = flagged;
        self
    }

    pub fn internal_date(mut self, date: DateTime<Utc>) -> Self {
        self.internal_date = Some(date);
        self
    }
}

/// Normalized per-message metadata consumed by the classifier.
///
/// Produced once per message by the fetch stage and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRecord {
    pub uid: Uid,
    /// Folder the message was found in
    pub folder: String,
    /// Decoded subject line
    pub subject: String,
    /// Lower-cased sender address
    pub sender: String,
    /// Lower-cased sender domain
    pub sender_domain: String,
    /// Whether a List-Unsubscribe header is present
    pub has_unsubscribe: bool,
    /// Whether the message is flagged/starred
    pub flagged: bool,
    /// When the server received the message
    pub received_at: Option<DateTime<Utc>>,
}

impl HeaderRecord {
    /// Create a new header record builder
    pub fn builder(uid: Uid, folder: impl Into<String>) -> HeaderRecordBuilder {
        HeaderRecordBuilder::new(uid, folder.into())
    }
}

/// Builder for creating HeaderRecord instances
pub struct HeaderRecordBuilder {
    uid: Uid,
    folder: String,
    subject: String,
    sender: Option<EmailAddress>,
    has_unsubscribe: bool,
    flagged: bool,
    received_at: Option<DateTime<Utc>>,
}

impl HeaderRecordBuilder {
    fn new(uid: Uid, folder: String) -> Self {
        Self {
            uid,
            folder,
            subject: String::new(),
            sender: None,
            has_unsubscribe: false,
            flagged: false,
            received_at: None,
        }
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn sender(mut self, sender: EmailAddress) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn has_unsubscribe(mut self, has_unsubscribe: bool) -> Self {
        self.has_unsubscribe = has_unsubscribe;
        self
    }

    pub fn flagged(mut self, flagged: bool) -> Self {
        self.flagged = flagged;
        self
    }

    pub fn received_at(mut self, received_at: Option<DateTime<Utc>>) -> Self {
        self.received_at = received_at;
        self
    }

    pub fn build(self) -> HeaderRecord {
        let (sender, sender_domain) = match &self.sender {
            Some(addr) => (addr.normalized(), addr.domain()),
            None => (String::new(), String::new()),
        };

        HeaderRecord {
            uid: self.uid,
            folder: self.folder,
            subject: self.subject,
            sender,
            sender_domain,
            has_unsubscribe: self.has_unsubscribe,
            flagged: self.flagged,
            received_at: self.received_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_email_with_name() {
        let addr = EmailAddress::parse("John Doe <john@example.com>");
        assert_eq!(addr.name, Some("John Doe".to_string()));
        assert_eq!(addr.email, "john@example.com");
    }

    #[test]
    fn test_parse_email_with_quoted_name() {
        let addr = EmailAddress::parse("\"Doe, John\" <John@Example.COM>");
        assert_eq!(addr.name, Some("Doe, John".to_string()));
        assert_eq!(addr.normalized(), "john@example.com");
        assert_eq!(addr.domain(), "example.com");
    }

    #[test]
    fn test_parse_email_without_name() {
        let addr = EmailAddress::parse("john@example.com");
        assert_eq!(addr.name, None);
        assert_eq!(addr.email, "john@example.com");
    }

    #[test]
    fn test_domain_without_at() {
        assert_eq!(EmailAddress::new("postmaster").domain(), "");
    }

    #[test]
    fn test_parse_uid() {
        assert_eq!("42".parse::<Uid>().unwrap(), Uid::new(42));
        assert!(matches!("0".parse::<Uid>(), Err(SessionError::InvalidId(_))));
        assert!(matches!("abc".parse::<Uid>(), Err(SessionError::InvalidId(_))));
    }

    #[test]
    fn test_header_record_builder_normalizes_sender() {
        let record = HeaderRecord::builder(Uid::new(7), "INBOX")
            .sender(EmailAddress::parse("Shop <Deals@Promo.Example.com>"))
            .subject("Sale")
            .build();

        assert_eq!(record.sender, "deals@promo.example.com");
        assert_eq!(record.sender_domain, "promo.example.com");
        assert_eq!(record.folder, "INBOX");
    }

    #[test]
    fn test_header_record_without_sender() {
        let record = HeaderRecord::builder(Uid::new(1), "INBOX").build();
        assert!(record.sender.is_empty());
        assert!(record.sender_domain.is_empty());
    }
}
