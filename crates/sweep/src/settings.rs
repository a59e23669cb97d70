//! User configuration
//!
//! Settings are read from `config.json` with `config.local.json` merged
//! on top (see [`config::load_layered`]). Every field has a default, so an
//! empty or missing file gives a usable dry-run configuration.

use anyhow::{Context, Result, bail};
use log::{LevelFilter, debug};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::{DEFAULT_TARGET_FOLDER, Policy};
use crate::pipeline::{MAX_WORKERS, MIN_WORKERS, PipelineConfig, RetryPolicy, optimal_workers};

/// Base configuration file name
pub const CONFIG_FILE: &str = "config.json";
/// Local overrides, merged over the base file
pub const LOCAL_CONFIG_FILE: &str = "config.local.json";

/// A worker count: `"auto"` or a fixed number
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawWorkerCount", into = "RawWorkerCount")]
pub enum WorkerCount {
    /// Half the available CPUs
    #[default]
    Auto,
    Fixed(usize),
}

impl WorkerCount {
    /// Concrete worker count, clamped to `MIN_WORKERS..=MAX_WORKERS`
    pub fn resolve(self) -> usize {
        match self {
            WorkerCount::Fixed(n) => n.clamp(MIN_WORKERS, MAX_WORKERS),
            WorkerCount::Auto => optimal_workers(),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawWorkerCount {
    Number(usize),
    Text(String),
}

impl TryFrom<RawWorkerCount> for WorkerCount {
    type Error = String;

    fn try_from(raw: RawWorkerCount) -> Result<Self, Self::Error> {
        match raw {
            RawWorkerCount::Number(n) => Ok(WorkerCount::Fixed(n)),
            RawWorkerCount::Text(text) if text.trim().eq_ignore_ascii_case("auto") => {
                Ok(WorkerCount::Auto)
            }
            RawWorkerCount::Text(text) => text
                .trim()
                .parse()
                .map(WorkerCount::Fixed)
                .map_err(|_| format!("expected \"auto\" or a number, got {:?}", text)),
        }
    }
}

impl From<WorkerCount> for RawWorkerCount {
    fn from(count: WorkerCount) -> Self {
        match count {
            WorkerCount::Auto => RawWorkerCount::Text("auto".to_string()),
            WorkerCount::Fixed(n) => RawWorkerCount::Number(n),
        }
    }
}

/// Server and folder settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailSettings {
    pub imap_host: String,
    pub imap_port: u16,
    pub source_folders: Vec<String>,
    pub target_folder: String,
}

impl Default for MailSettings {
    fn default() -> Self {
        Self {
            imap_host: "imap.mail.me.com".to_string(),
            imap_port: 993,
            source_folders: vec!["INBOX".to_string(), "Archive".to_string()],
            target_folder: DEFAULT_TARGET_FOLDER.to_string(),
        }
    }
}

/// How a run behaves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupSettings {
    pub age_days: u32,
    pub dry_run: bool,
    pub verbose: bool,
    pub batch_size: usize,
    pub max_workers: WorkerCount,
    pub header_fetch_workers: WorkerCount,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub acquire_timeout_secs: u64,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            age_days: 365,
            dry_run: true,
            verbose: true,
            batch_size: 50,
            max_workers: WorkerCount::Auto,
            header_fetch_workers: WorkerCount::Auto,
            max_attempts: 3,
            backoff_ms: 100,
            max_backoff_ms: 5_000,
            acquire_timeout_secs: 30,
        }
    }
}

/// Where the whitelist comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhitelistSettings {
    /// One address or domain per line; `#` starts a comment line
    pub whitelist_file: PathBuf,
    pub additional_whitelist: Vec<String>,
}

impl Default for WhitelistSettings {
    fn default() -> Self {
        Self {
            whitelist_file: PathBuf::from("whitelist.txt"),
            additional_whitelist: Vec::new(),
        }
    }
}

/// Complete cleanup configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub mail_settings: MailSettings,
    pub cleanup_settings: CleanupSettings,
    /// Subject keywords that mark a message for review
    pub subject_keywords: Vec<String>,
    /// Subject keywords that always keep a message
    pub protect_keywords: Vec<String>,
    /// Sender domains whose mail is marked for review
    pub delete_domains: Vec<String>,
    pub whitelist_settings: WhitelistSettings,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            mail_settings: MailSettings::default(),
            cleanup_settings: CleanupSettings::default(),
            subject_keywords: to_strings(&[
                "unsubscribe",
                "newsletter",
                "nieuwsbrief",
                "promo",
                "promotion",
                "actie",
                "deal",
                "korting",
                "sale",
                "update",
                "digest",
                "marketing",
                "leveringsupdate",
                "tracking",
                "pakket",
                "afgeleverd",
                "bezorgd",
                "shipping",
                "delivered",
                "transactiebevestiging",
                "bevestiging",
                "reactie",
                "kopie",
                "bestelling",
                "order",
                "verzending",
                "bezorging",
                "behandeling",
                "bedankt",
                "thank",
                "confirmation",
                "confirmed",
                "shipment",
                "delivery",
                "processing",
                "wat vond u",
            ]),
            protect_keywords: to_strings(&[
                "factuur",
                "rekening",
                "nota",
                "bill",
                "invoice",
                "belasting",
                "btw",
                "tax",
                "vat",
                "aanslag",
                "incasso",
                "aanmaning",
                "reminder",
                "overdue",
                "refund",
                "terugbetaling",
                "chargeback",
                "saldo",
                "afschrift",
                "account statement",
            ]),
            delete_domains: Vec::new(),
            whitelist_settings: WhitelistSettings::default(),
        }
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl CleanupConfig {
    /// Load `config.json` and `config.local.json` from the mailsweep config
    /// directory (~/.config/mailsweep/)
    pub fn load() -> Result<Self> {
        let dir = config::config_dir().context("Could not determine config directory")?;
        Self::load_from(&dir)
    }

    /// Load `config.json` and `config.local.json` from `dir`
    pub fn load_from(dir: &Path) -> Result<Self> {
        let config: Self = config::load_layered(&dir.join(CONFIG_FILE), &dir.join(LOCAL_CONFIG_FILE))?;
        debug!(
            "Loaded configuration: {} source folder(s), {} trigger keywords",
            config.mail_settings.source_folders.len(),
            config.subject_keywords.len()
        );
        Ok(config)
    }

    /// Parse a configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse configuration JSON")
    }

    /// Log level matching the `verbose` setting
    pub fn log_level(&self) -> LevelFilter {
        if self.cleanup_settings.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        }
    }

    /// Whitelisted addresses and domains from the whitelist file plus
    /// `additional_whitelist`. A missing file only contributes nothing.
    pub fn load_whitelist(&self) -> Result<BTreeSet<String>> {
        let settings = &self.whitelist_settings;
        let mut entries = normalize_entries(settings.additional_whitelist.iter().map(String::as_str));

        match std::fs::read_to_string(&settings.whitelist_file) {
            Ok(content) => entries.extend(parse_whitelist(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(
                    "Whitelist file {} not found",
                    settings.whitelist_file.display()
                );
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!(
                        "Failed to read whitelist file: {}",
                        settings.whitelist_file.display()
                    )
                });
            }
        }

        Ok(entries)
    }

    /// Build the classification policy for a run
    pub fn policy(&self, whitelist: BTreeSet<String>) -> Result<Policy> {
        let mail = &self.mail_settings;
        let policy = Policy::builder()
            .whitelist(whitelist)
            .protected_keywords(&self.protect_keywords)
            .trigger_keywords(&self.subject_keywords)
            .trigger_domains(&self.delete_domains)
            .age_days(self.cleanup_settings.age_days)
            .target_folder(mail.target_folder.as_str())
            .source_folders(&mail.source_folders)
            .dry_run(self.cleanup_settings.dry_run)
            .build();

        if policy.target_folder.is_empty() {
            bail!("mail_settings.target_folder must not be empty");
        }
        if policy.source_folders.is_empty() {
            bail!("mail_settings.source_folders must name at least one folder");
        }
        if policy.source_folders.contains(&policy.target_folder) {
            bail!(
                "target folder {} is also a source folder",
                policy.target_folder
            );
        }
        Ok(policy)
    }

    /// Pipeline sizing: one session per classification worker plus one
    /// per header fetch worker
    pub fn pipeline_config(&self) -> PipelineConfig {
        let cleanup = &self.cleanup_settings;
        let workers = cleanup.max_workers.resolve();
        let fetch_workers = cleanup.header_fetch_workers.resolve();

        PipelineConfig {
            pool_size: workers + fetch_workers,
            classify_workers: workers,
            batch_size: cleanup.batch_size.max(1),
            retry: RetryPolicy {
                max_attempts: cleanup.max_attempts.max(1),
                initial_backoff: Duration::from_millis(cleanup.backoff_ms),
                max_backoff: Duration::from_millis(cleanup.max_backoff_ms.max(cleanup.backoff_ms)),
            },
            acquire_timeout: Duration::from_secs(cleanup.acquire_timeout_secs),
        }
    }
}

/// Parse whitelist file content: one entry per line, blank lines and lines
/// starting with `#` skipped
pub fn parse_whitelist(content: &str) -> BTreeSet<String> {
    normalize_entries(
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.starts_with('#')),
    )
}

fn normalize_entries<'a>(entries: impl Iterator<Item = &'a str>) -> BTreeSet<String> {
    entries
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_defaults() {
        let config = CleanupConfig::default();
        assert_eq!(config.mail_settings.imap_port, 993);
        assert_eq!(config.mail_settings.target_folder, "Review/Delete");
        assert!(config.cleanup_settings.dry_run);
        assert_eq!(config.cleanup_settings.batch_size, 50);
        assert!(config.subject_keywords.contains(&"newsletter".to_string()));
        assert!(config.protect_keywords.contains(&"invoice".to_string()));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = CleanupConfig::from_json(
            r#"{
                "cleanup_settings": {"age_days": 30, "max_workers": 4, "header_fetch_workers": "auto"},
                "delete_domains": ["promo.example.com"]
            }"#,
        )
        .unwrap();

        assert_eq!(config.cleanup_settings.age_days, 30);
        assert_eq!(config.cleanup_settings.max_workers, WorkerCount::Fixed(4));
        assert_eq!(config.cleanup_settings.header_fetch_workers, WorkerCount::Auto);
        assert!(config.cleanup_settings.dry_run);
        assert_eq!(config.mail_settings.source_folders, vec!["INBOX", "Archive"]);
        assert_eq!(config.delete_domains, vec!["promo.example.com"]);
    }

    #[test]
    fn test_worker_count_parsing() {
        let parse = |json: &str| serde_json::from_str::<WorkerCount>(json);
        assert_eq!(parse("\"auto\"").unwrap(), WorkerCount::Auto);
        assert_eq!(parse("\"AUTO\"").unwrap(), WorkerCount::Auto);
        assert_eq!(parse("6").unwrap(), WorkerCount::Fixed(6));
        assert_eq!(parse("\"6\"").unwrap(), WorkerCount::Fixed(6));
        assert!(parse("\"lots\"").is_err());
    }

    #[test]
    fn test_worker_count_resolve_clamps() {
        assert_eq!(WorkerCount::Fixed(4).resolve(), 4);
        assert_eq!(WorkerCount::Fixed(500).resolve(), MAX_WORKERS);
        assert_eq!(WorkerCount::Fixed(0).resolve(), MIN_WORKERS);
        assert_eq!(WorkerCount::Auto.resolve(), optimal_workers());
    }

    #[test]
    fn test_log_level_follows_verbose() {
        let mut config = CleanupConfig::default();
        assert_eq!(config.log_level(), LevelFilter::Debug);

        config.cleanup_settings.verbose = false;
        assert_eq!(config.log_level(), LevelFilter::Info);

        let quiet = CleanupConfig::from_json(r#"{ "cleanup_settings": { "verbose": false } }"#)
            .unwrap();
        assert_eq!(quiet.log_level(), LevelFilter::Info);
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let config = CleanupConfig::from_json(
            r#"{ "cleanup_settings": { "search_timeout": 30, "batch_size": 10 } }"#,
        )
        .unwrap();
        assert_eq!(config.cleanup_settings.batch_size, 10);
    }

    #[test]
    fn test_pipeline_config() {
        let mut config = CleanupConfig::default();
        config.cleanup_settings.max_workers = WorkerCount::Fixed(3);
        config.cleanup_settings.header_fetch_workers = WorkerCount::Fixed(2);
        config.cleanup_settings.max_attempts = 4;

        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.pool_size, 5);
        assert_eq!(pipeline.classify_workers, 3);
        assert_eq!(pipeline.retry.max_attempts, 4);
        assert_eq!(pipeline.retry.initial_backoff, Duration::from_millis(100));
        assert!(pipeline.validate().is_ok());
    }

    #[test]
    fn test_load_from_directory_with_local_override() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"mail_settings": {"source_folders": ["INBOX"]}, "cleanup_settings": {"age_days": 90}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join(LOCAL_CONFIG_FILE),
            r#"{"cleanup_settings": {"dry_run": false}}"#,
        )
        .unwrap();

        let config = CleanupConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.mail_settings.source_folders, vec!["INBOX"]);
        assert_eq!(config.cleanup_settings.age_days, 90);
        assert!(!config.cleanup_settings.dry_run);
    }

    #[test]
    fn test_load_from_empty_directory_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = CleanupConfig::load_from(dir.path()).unwrap();
        assert_eq!(config, CleanupConfig::default());
    }

    #[test]
    fn test_parse_whitelist() {
        let entries = parse_whitelist("# family\nMom@Example.com\n\n  family.org  \n#bank.com\n");
        assert_eq!(
            entries,
            BTreeSet::from(["family.org".to_string(), "mom@example.com".to_string()])
        );
    }

    #[test]
    fn test_load_whitelist_merges_additional_entries() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "friend@example.com").unwrap();

        let mut config = CleanupConfig::default();
        config.whitelist_settings.whitelist_file = file.path().to_path_buf();
        config.whitelist_settings.additional_whitelist = vec![" Work.com ".into(), "".into()];

        let whitelist = config.load_whitelist().unwrap();
        assert_eq!(whitelist.len(), 2);
        assert!(whitelist.contains("work.com"));
        assert!(whitelist.contains("friend@example.com"));
    }

    #[test]
    fn test_missing_whitelist_file() {
        let dir = TempDir::new().unwrap();
        let mut config = CleanupConfig::default();
        config.whitelist_settings.whitelist_file = dir.path().join("nope.txt");
        config.whitelist_settings.additional_whitelist = vec!["boss@work.com".into()];

        let whitelist = config.load_whitelist().unwrap();
        assert_eq!(whitelist, BTreeSet::from(["boss@work.com".to_string()]));
    }

    #[test]
    fn test_policy_from_config() {
        let mut config = CleanupConfig::default();
        config.delete_domains = vec!["@Promo.Example.com".into()];
        config.cleanup_settings.dry_run = false;

        let policy = config
            .policy(BTreeSet::from(["family.org".to_string()]))
            .unwrap();

        assert!(policy.trigger_domains.contains("promo.example.com"));
        assert!(policy.trigger_keywords.contains("wat vond u"));
        assert!(policy.whitelist.contains("family.org"));
        assert_eq!(policy.source_folders, vec!["INBOX", "Archive"]);
        assert!(!policy.dry_run);
    }

    #[test]
    fn test_policy_rejects_target_in_sources() {
        let mut config = CleanupConfig::default();
        config.mail_settings.source_folders = vec!["INBOX".into(), "Review/Delete".into()];
        assert!(config.policy(BTreeSet::new()).is_err());
    }
}
