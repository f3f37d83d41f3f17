//! Mail collaborator: poll a mailbox for new messages, send results back.
//!
//! The daemon only sees the [`Mailer`] trait. [`ImapSmtpMailer`] is the
//! production implementation: raw IMAP (optionally over rustls) for fetching,
//! lettre for SMTP. Both protocols are blocking and run under
//! `spawn_blocking`.

pub mod imap;
pub mod search;
pub mod smtp;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bus::{BusMessage, CodecError};
use crate::config::AccountConfig;
use crate::error::MailError;

/// A file to attach to an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub path: PathBuf,
    pub mime_type: String,
}

impl Attachment {
    pub fn new(path: impl Into<PathBuf>, mime_type: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mime_type: mime_type.into(),
        }
    }
}

/// Payload of the `mail_send` topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailDispatchRequest {
    pub subject: String,
    pub body: String,
    /// Send only through this account; `None` means every account.
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl MailDispatchRequest {
    /// Whether an account with `name` should send this request.
    pub fn targets(&self, name: &str) -> bool {
        self.account.as_deref().is_none_or(|wanted| wanted == name)
    }
}

impl BusMessage for MailDispatchRequest {
    fn encode(&self) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Mailbox access used by the daemon.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Download messages matching the account's filter into a fresh directory
    /// and return it. `MailError::NoNewMail` when nothing matched.
    async fn fetch_filtered(&self, account: &AccountConfig) -> Result<PathBuf, MailError>;

    /// Send one message through the account's SMTP settings.
    async fn send(
        &self,
        account: &AccountConfig,
        subject: &str,
        body: &str,
        attachments: &[Attachment],
    ) -> Result<(), MailError>;
}

/// IMAP + SMTP implementation of [`Mailer`].
#[derive(Debug, Clone)]
pub struct ImapSmtpMailer {
    work_dir: PathBuf,
    timeout: Duration,
}

impl ImapSmtpMailer {
    pub fn new(work_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            work_dir: work_dir.into(),
            timeout,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}

#[async_trait]
impl Mailer for ImapSmtpMailer {
    async fn fetch_filtered(&self, account: &AccountConfig) -> Result<PathBuf, MailError> {
        let request = imap::FetchRequest::from_account(account, &self.work_dir, self.timeout)?;
        debug!(account = %account.name, query = %request.query, "Polling mailbox");

        let result = tokio::task::spawn_blocking(move || imap::fetch(&request))
            .await
            .map_err(|e| MailError::Other(format!("IMAP task failed: {e}")))?;

        if let Ok(dir) = &result {
            info!(account = %account.name, dir = %dir.display(), "Mail downloaded");
        }
        result
    }

    async fn send(
        &self,
        account: &AccountConfig,
        subject: &str,
        body: &str,
        attachments: &[Attachment],
    ) -> Result<(), MailError> {
        let params = smtp::SmtpParams::from_account(account, self.timeout)?;
        let parts = smtp::read_attachments(attachments).await?;
        let message = smtp::build_message(&params, subject, body, parts)?;

        tokio::task::spawn_blocking(move || smtp::deliver(&params, &message))
            .await
            .map_err(|e| MailError::Other(format!("SMTP task failed: {e}")))??;

        info!(account = %account.name, subject = %subject, "Mail sent");
        Ok(())
    }
}
