//! Configuration types.
//!
//! The agent reads one YAML document at startup and shares the result as an
//! immutable `Arc<AgentConfig>` snapshot. Unknown keys are ignored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::task::ShellKind;

/// Default bus endpoint.
pub const DEFAULT_ENDPOINT: &str = "tcp://127.0.0.1:5555";

/// Default capacity of each service worker queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Root configuration document.
#[derive(Debug, Default, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// Process-wide settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    /// Network timeout for mail protocols, in seconds.
    #[serde(default = "default_timeout")]
    pub default_timeout: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Root for downloaded mail, transcripts and logs.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Bus endpoint every topic is multiplexed over.
    #[serde(default = "default_endpoint", alias = "zeromq_endpoint")]
    pub endpoint: String,
    /// Mailbox poll interval; 0 disables polling.
    #[serde(default)]
    pub check_mail_interval_ms: u64,
    #[serde(default)]
    pub shell: ShellKind,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Per-command timeout for job steps. Unbounded when unset.
    #[serde(default)]
    pub command_timeout_secs: Option<u64>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_timeout(),
            log_level: default_log_level(),
            work_dir: default_work_dir(),
            endpoint: default_endpoint(),
            check_mail_interval_ms: 0,
            shell: ShellKind::default(),
            queue_capacity: default_queue_capacity(),
            command_timeout_secs: None,
        }
    }
}

impl GlobalConfig {
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.check_mail_interval_ms > 0).then(|| Duration::from_millis(self.check_mail_interval_ms))
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout.max(1))
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

/// One mail account: where to poll and how to reply.
#[derive(Debug, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    #[serde(default)]
    pub protocol: ProtocolSet,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default = "default_folder")]
    pub default_folder: String,
}

fn default_folder() -> String {
    "inbox".to_string()
}

#[derive(Debug, Default, Deserialize)]
pub struct ProtocolSet {
    pub smtp: Option<SmtpConfig>,
    pub imap: Option<ImapConfig>,
}

/// Transport security for a mail connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum Security {
    #[default]
    Plain,
    Ssl,
}

impl From<String> for Security {
    fn from(value: String) -> Self {
        match value.to_lowercase().as_str() {
            "ssl" | "tls" => Self::Ssl,
            "plain" | "" => Self::Plain,
            other => {
                warn!(security = %other, "Unknown security mode, using plain");
                Self::Plain
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub security: Security,
    #[serde(default = "default_auth_method")]
    pub auth_method: String,
    pub from: Option<Mailbox>,
    #[serde(default)]
    pub to: Vec<Recipient>,
    #[serde(default)]
    pub cc: Vec<Recipient>,
    #[serde(default)]
    pub bcc: Vec<Recipient>,
}

impl SmtpConfig {
    /// Whether the auth method asks for an upgraded (STARTTLS) connection.
    pub fn wants_starttls(&self) -> bool {
        self.auth_method.to_lowercase().contains("start_tls")
    }
}

#[derive(Debug, Deserialize)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub security: Security,
    #[serde(default = "default_auth_method")]
    pub auth_method: String,
    #[serde(default)]
    pub filter: ImapFilterConfig,
}

fn default_auth_method() -> String {
    "login".to_string()
}

/// Which messages a poll cycle downloads.
#[derive(Debug, Deserialize)]
pub struct ImapFilterConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_folders")]
    pub folders: Vec<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub conditions: Vec<SearchCondition>,
}

impl Default for ImapFilterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            folders: default_folders(),
            read_only: false,
            conditions: Vec::new(),
        }
    }
}

fn default_folders() -> Vec<String> {
    vec!["inbox".to_string()]
}

/// A raw search condition; interpreted by `mail::search`.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchCondition {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub value: Option<serde_yaml::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Mailbox {
    #[serde(default)]
    pub name: String,
    pub address: String,
}

/// A recipient entry: a single mailbox or a named group of mailboxes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Recipient {
    Mailbox(Mailbox),
    Group {
        group: String,
        #[serde(default)]
        list: Vec<Mailbox>,
    },
}

impl Recipient {
    /// Flatten to individual mailboxes.
    pub fn mailboxes(&self) -> Vec<&Mailbox> {
        match self {
            Self::Mailbox(m) => vec![m],
            Self::Group { list, .. } => list.iter().collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default = "empty_secret", deserialize_with = "deserialize_secret")]
    pub password: SecretString,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: empty_secret(),
        }
    }
}

fn empty_secret() -> SecretString {
    SecretString::from(String::new())
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

impl AgentConfig {
    /// Load the configuration file, then resolve `${VAR}` passwords using a
    /// `.env` file (work dir first, then the current directory) and the
    /// process environment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml_str(&text)?;

        let overrides = config.load_dotenv();
        config.resolve_secrets(&overrides);

        info!(
            path = %path.display(),
            accounts = config.accounts.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse a configuration document without touching the environment.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        if config.global.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "global.queue_capacity".into(),
                message: "must be greater than zero".into(),
            });
        }
        Ok(config)
    }

    pub fn account_by_name(&self, name: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.name == name)
    }

    fn load_dotenv(&self) -> HashMap<String, String> {
        let candidates = [
            Some(self.global.work_dir.join(".env")),
            std::env::current_dir().ok().map(|d| d.join(".env")),
        ];
        match candidates.into_iter().flatten().find(|p| p.is_file()) {
            Some(path) => read_dotenv(&path),
            None => HashMap::new(),
        }
    }

    /// Replace `${VAR}` passwords with values from `overrides` or the process
    /// environment. Unresolved references are kept verbatim.
    pub fn resolve_secrets(&mut self, overrides: &HashMap<String, String>) {
        for account in &mut self.accounts {
            let raw = account.credentials.password.expose_secret();
            let Some(var) = env_reference(raw) else {
                continue;
            };
            let resolved = overrides
                .get(var)
                .cloned()
                .or_else(|| std::env::var(var).ok());
            match resolved {
                Some(value) => account.credentials.password = SecretString::from(value),
                None => warn!(
                    account = %account.name,
                    variable = %var,
                    "Environment variable not found for account password"
                ),
            }
        }
    }
}

/// `${NAME}` → `Some("NAME")`.
fn env_reference(value: &str) -> Option<&str> {
    value
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .filter(|name| !name.is_empty())
}

/// Read a `.env` file into a map without exporting anything to the process
/// environment. Entries that fail to parse are logged and skipped.
pub fn read_dotenv(path: &Path) -> HashMap<String, String> {
    let entries = match dotenvy::from_path_iter(path) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Couldn't read env file");
            return HashMap::new();
        }
    };
    debug!(path = %path.display(), "Loading .env file");

    let mut vars = HashMap::new();
    for entry in entries {
        match entry {
            Ok((key, value)) => {
                vars.insert(key, value);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Malformed entry in env file"),
        }
    }
    vars
}
