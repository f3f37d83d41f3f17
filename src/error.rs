//! Error types for the remote agent.

use std::path::PathBuf;

/// Coarse classification shared by every fallible operation in the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport-level failure (connect, bind, read, write).
    Network,
    /// The remote side rejected a request.
    Rejection,
    /// Configuration is missing or malformed.
    BadConfig,
    /// Allocation or resource creation failed.
    ResourceExhausted,
    FileAlreadyExists,
    FileOpenFailed,
    FileCreateFailed,
    FileCloseFailed,
    /// Archive could not be expanded.
    ArchiveFailed,
    /// Nothing new to process (not a failure for callers).
    NoNewData,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::Rejection => "rejection",
            Self::BadConfig => "bad_config",
            Self::ResourceExhausted => "resource_exhausted",
            Self::FileAlreadyExists => "file_already_exists",
            Self::FileOpenFailed => "file_open_failed",
            Self::FileCreateFailed => "file_create_failed",
            Self::FileCloseFailed => "file_close_failed",
            Self::ArchiveFailed => "archive_failed",
            Self::NoNewData => "no_new_data",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(e) => e.kind(),
            Self::Bus(e) => e.kind(),
            Self::Mail(e) => e.kind(),
            Self::Archive(e) => e.kind(),
            Self::Task(e) => e.kind(),
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Read { .. } => ErrorKind::FileOpenFailed,
            Self::Parse(_) | Self::InvalidValue { .. } => ErrorKind::BadConfig,
        }
    }
}

/// Message bus errors.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection for {endpoint} has the wrong role")]
    RoleMismatch { endpoint: String },

    #[error("Failed to decode message on topic {topic}: {reason}")]
    Decode { topic: String, reason: String },

    #[error("Failed to encode message on topic {topic}: {reason}")]
    Encode { topic: String, reason: String },

    #[error("Queue for topic {topic} is full")]
    QueueFull { topic: String },

    #[error("Service for topic {topic} is stopped")]
    ServiceStopped { topic: String },

    #[error("Subscription on topic {topic} is already running")]
    AlreadySubscribed { topic: String },
}

impl BusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidEndpoint { .. } | Self::RoleMismatch { .. } => ErrorKind::BadConfig,
            Self::Bind { .. } => ErrorKind::Network,
            Self::Decode { .. } | Self::Encode { .. } => ErrorKind::Unknown,
            Self::QueueFull { .. } => ErrorKind::ResourceExhausted,
            Self::ServiceStopped { .. } | Self::AlreadySubscribed { .. } => ErrorKind::Unknown,
        }
    }
}

/// Mail collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("No new mail for account {account}")]
    NoNewMail { account: String },

    #[error("Network error talking to {host}: {reason}")]
    Network { host: String, reason: String },

    #[error("Server rejected request: {0}")]
    Rejected(String),

    #[error("Bad mail configuration for account {account}: {reason}")]
    BadConfig { account: String, reason: String },

    #[error("Failed to write {path}: {source}")]
    FileCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read attachment {path}: {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Mail error: {0}")]
    Other(String),
}

impl MailError {
    /// Classify free-form protocol error text.
    pub fn classify(host: &str, text: impl Into<String>) -> Self {
        let text = text.into();
        let lower = text.to_lowercase();
        if lower.contains("network") {
            Self::Network {
                host: host.to_string(),
                reason: text,
            }
        } else if lower.contains("rejection") || lower.contains("rejected") {
            Self::Rejected(text)
        } else {
            Self::Other(text)
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoNewMail { .. } => ErrorKind::NoNewData,
            Self::Network { .. } => ErrorKind::Network,
            Self::Rejected(_) => ErrorKind::Rejection,
            Self::BadConfig { .. } => ErrorKind::BadConfig,
            Self::FileCreate { .. } => ErrorKind::FileCreateFailed,
            Self::FileOpen { .. } => ErrorKind::FileOpenFailed,
            Self::Other(_) => ErrorKind::Unknown,
        }
    }

    pub fn is_no_new_mail(&self) -> bool {
        matches!(self, Self::NoNewMail { .. })
    }
}

/// Archive collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open archive {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("Failed to extract archive {path}: {reason}")]
    Extract { path: PathBuf, reason: String },
}

impl ArchiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CreateDir { .. } => ErrorKind::FileCreateFailed,
            Self::Open { .. } => ErrorKind::FileOpenFailed,
            Self::Extract { .. } => ErrorKind::ArchiveFailed,
        }
    }
}

/// Job-description parse errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskParseError {
    #[error("Invalid job description: {0}")]
    Yaml(String),

    #[error("Missing 'name' field in job description")]
    MissingName,

    #[error("'steps' field is missing or not a sequence")]
    InvalidSteps,

    #[error("Step {index} is missing the 'name' field")]
    StepMissingName { index: usize },

    #[error("The 'commands' field of step '{step}' is missing or not a sequence")]
    InvalidCommands { step: String },

    #[error("Invalid value for {field}: expected a scalar")]
    InvalidValue { field: String },

    #[error("Failed to read job description {path}: {reason}")]
    Io { path: PathBuf, reason: String },
}

/// Task engine errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Parse(#[from] TaskParseError),

    #[error("Failed to create transcript {path}: {source}")]
    TranscriptCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write transcript {path}: {source}")]
    TranscriptWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse(TaskParseError::Io { .. }) => ErrorKind::FileOpenFailed,
            Self::Parse(_) => ErrorKind::BadConfig,
            Self::TranscriptCreate { .. } => ErrorKind::FileCreateFailed,
            Self::TranscriptWrite { .. } => ErrorKind::FileCloseFailed,
        }
    }
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;
