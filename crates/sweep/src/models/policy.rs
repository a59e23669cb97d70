//! Classification policy snapshot

use chrono::{Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Default folder that move verdicts are applied to
pub const DEFAULT_TARGET_FOLDER: &str = "Review/Delete";

/// Immutable policy for one pipeline run.
///
/// Every string set is normalized on construction (trimmed, lower-cased,
/// empty entries dropped), so the classifier can compare without
/// allocating per rule. Build one with [`Policy::builder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Whitelisted sender addresses and domains
    pub whitelist: BTreeSet<String>,
    /// Subject keywords that always keep a message
    pub protected_keywords: BTreeSet<String>,
    /// Subject keywords that trigger a move
    pub trigger_keywords: BTreeSet<String>,
    /// Sender domains (and their subdomains) that trigger a move
    pub trigger_domains: BTreeSet<String>,
    /// Only messages older than this many days are considered
    pub age_days: u32,
    /// Folder that matching messages are moved into
    pub target_folder: String,
    /// Folders to scan, in order
    pub source_folders: Vec<String>,
    /// Simulate moves without touching the mailbox
    pub dry_run: bool,
}

impl Policy {
    /// Create a new policy builder
    pub fn builder() -> PolicyBuilder {
        PolicyBuilder::default()
    }

    /// Date before which messages are candidates, relative to `today`
    pub fn cutoff_date(&self, today: NaiveDate) -> NaiveDate {
        today
            .checked_sub_days(Days::new(u64::from(self.age_days)))
            .unwrap_or(NaiveDate::MIN)
    }

    /// Cutoff relative to the current UTC date
    pub fn cutoff_from_now(&self) -> NaiveDate {
        self.cutoff_date(Utc::now().date_naive())
    }
}

/// Format a date the way IMAP SEARCH BEFORE expects it (e.g. `05-Mar-2024`)
pub fn imap_date(date: NaiveDate) -> String {
    date.format("%d-%b-%Y").to_string()
}

/// Builder for creating Policy instances
#[derive(Debug, Clone)]
pub struct PolicyBuilder {
    whitelist: Vec<String>,
    protected_keywords: Vec<String>,
    trigger_keywords: Vec<String>,
    trigger_domains: Vec<String>,
    age_days: u32,
    target_folder: String,
    source_folders: Vec<String>,
    dry_run: bool,
}

impl Default for PolicyBuilder {
    fn default() -> Self {
        Self {
            whitelist: Vec::new(),
            protected_keywords: Vec::new(),
            trigger_keywords: Vec::new(),
            trigger_domains: Vec::new(),
            age_days: 365,
            target_folder: DEFAULT_TARGET_FOLDER.to_string(),
            source_folders: vec!["INBOX".to_string()],
            dry_run: true,
        }
    }
}

impl PolicyBuilder {
    pub fn whitelist<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist.extend(entries.into_iter().map(Into::into));
        self
    }

    pub fn protected_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protected_keywords.extend(keywords.into_iter().map(Into::into));
        self
    }

    pub fn trigger_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trigger_keywords.extend(keywords.into_iter().map(Into::into));
        self
    }

    pub fn trigger_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trigger_domains.extend(domains.into_iter().map(Into::into));
        self
    }

    pub fn age_days(mut self, age_days: u32) -> Self {
        self.age_days = age_days;
        self
    }

    pub fn target_folder(mut self, folder: impl Into<String>) -> Self {
        self.target_folder = folder.into();
        self
    }

    pub fn source_folders<I, S>(mut self, folders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source_folders = folders.into_iter().map(Into::into).collect();
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn build(self) -> Policy {
        // Folder names are case-sensitive on most servers; only dedupe them
        let mut source_folders: Vec<String> = Vec::new();
        for folder in self.source_folders {
            let folder = folder.trim().to_string();
            if !folder.is_empty() && !source_folders.contains(&folder) {
                source_folders.push(folder);
            }
        }

        Policy {
            whitelist: normalize(self.whitelist),
            protected_keywords: normalize(self.protected_keywords),
            trigger_keywords: normalize(self.trigger_keywords),
            trigger_domains: normalize(
                self.trigger_domains
                    .into_iter()
                    .map(|d| d.trim().trim_start_matches('@').to_string()),
            ),
            age_days: self.age_days,
            target_folder: self.target_folder.trim().to_string(),
            source_folders,
            dry_run: self.dry_run,
        }
    }
}

fn normalize(entries: impl IntoIterator<Item = String>) -> BTreeSet<String> {
    entries
        .into_iter()
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_normalizes_entries() {
        let policy = Policy::builder()
            .whitelist(["  Boss@Work.com ", "", "family.org"])
            .protected_keywords(["Invoice", "invoice", "TAX"])
            .trigger_domains(["@Promo.Example.com"])
            .build();

        assert!(policy.whitelist.contains("boss@work.com"));
        assert!(policy.whitelist.contains("family.org"));
        assert_eq!(policy.whitelist.len(), 2);
        assert_eq!(policy.protected_keywords.len(), 2);
        assert!(policy.trigger_domains.contains("promo.example.com"));
    }

    #[test]
    fn test_source_folders_deduped_in_order() {
        let policy = Policy::builder()
            .source_folders(["INBOX", "Archive", "INBOX", " "])
            .build();
        assert_eq!(policy.source_folders, vec!["INBOX", "Archive"]);
    }

    #[test]
    fn test_cutoff_date() {
        let policy = Policy::builder().age_days(30).build();
        let today = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        assert_eq!(
            policy.cutoff_date(today),
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
        );
    }

    #[test]
    fn test_imap_date() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert_eq!(imap_date(date), "05-Mar-2024");
    }
}
