//! Outgoing mail via lettre.

use std::path::Path;
use std::time::Duration;

use lettre::message::header::ContentType;
use lettre::message::{Attachment as MimeAttachment, Mailbox as LettreMailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

use super::Attachment;
use crate::config::{AccountConfig, Mailbox, Security};
use crate::error::MailError;

/// SMTP settings detached from the borrowed account config.
#[derive(Debug)]
pub struct SmtpParams {
    pub account: String,
    pub host: String,
    pub port: u16,
    pub security: Security,
    pub starttls: bool,
    pub username: String,
    pub password: SecretString,
    pub from: Mailbox,
    pub to: Vec<Mailbox>,
    pub cc: Vec<Mailbox>,
    pub bcc: Vec<Mailbox>,
    pub timeout: Duration,
}

impl SmtpParams {
    /// Requires `from` and at least one recipient; groups are flattened.
    pub fn from_account(account: &AccountConfig, timeout: Duration) -> Result<Self, MailError> {
        let bad = |reason: &str| MailError::BadConfig {
            account: account.name.clone(),
            reason: reason.to_string(),
        };
        let smtp = account.protocol.smtp.as_ref().ok_or_else(|| bad("no smtp settings"))?;
        let from = smtp.from.clone().ok_or_else(|| bad("smtp.from is not set"))?;

        let flatten = |list: &[crate::config::Recipient]| -> Vec<Mailbox> {
            list.iter()
                .flat_map(|r| r.mailboxes())
                .cloned()
                .collect()
        };
        let (to, cc, bcc) = (flatten(&smtp.to), flatten(&smtp.cc), flatten(&smtp.bcc));
        if to.is_empty() && cc.is_empty() && bcc.is_empty() {
            return Err(bad("no recipients configured"));
        }

        Ok(Self {
            account: account.name.clone(),
            host: smtp.host.clone(),
            port: smtp.port,
            security: smtp.security,
            starttls: smtp.wants_starttls(),
            username: account.credentials.username.clone(),
            password: SecretString::from(account.credentials.password.expose_secret().to_string()),
            from,
            to,
            cc,
            bcc,
            timeout,
        })
    }
}

/// An attachment loaded from disk.
#[derive(Debug)]
pub struct AttachmentPart {
    pub file_name: String,
    pub content_type: ContentType,
    pub bytes: Vec<u8>,
}

/// Read every attachment. An unreadable file fails the whole send.
pub async fn read_attachments(attachments: &[Attachment]) -> Result<Vec<AttachmentPart>, MailError> {
    let mut parts = Vec::with_capacity(attachments.len());
    for attachment in attachments {
        let bytes = tokio::fs::read(&attachment.path)
            .await
            .map_err(|source| MailError::FileOpen {
                path: attachment.path.clone(),
                source,
            })?;
        parts.push(AttachmentPart {
            file_name: file_name(&attachment.path),
            content_type: content_type(&attachment.mime_type),
            bytes,
        });
    }
    Ok(parts)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_string())
}

/// Invalid MIME types fall back to `text/plain`.
fn content_type(mime: &str) -> ContentType {
    ContentType::parse(&mime.to_lowercase()).unwrap_or_else(|_| {
        warn!(mime = %mime, "Invalid attachment MIME type, using text/plain");
        ContentType::TEXT_PLAIN
    })
}

fn mailbox(account: &str, m: &Mailbox) -> Result<LettreMailbox, MailError> {
    let address = m.address.parse().map_err(|e| MailError::BadConfig {
        account: account.to_string(),
        reason: format!("invalid address {}: {e}", m.address),
    })?;
    let name = (!m.name.is_empty()).then(|| m.name.clone());
    Ok(LettreMailbox::new(name, address))
}

/// Plain-text body, plus a multipart/mixed wrapper when there are attachments.
pub fn build_message(
    params: &SmtpParams,
    subject: &str,
    body: &str,
    attachments: Vec<AttachmentPart>,
) -> Result<Message, MailError> {
    let mut builder = Message::builder()
        .from(mailbox(&params.account, &params.from)?)
        .subject(subject);
    for m in &params.to {
        builder = builder.to(mailbox(&params.account, m)?);
    }
    for m in &params.cc {
        builder = builder.cc(mailbox(&params.account, m)?);
    }
    for m in &params.bcc {
        builder = builder.bcc(mailbox(&params.account, m)?);
    }

    let built = if attachments.is_empty() {
        builder
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
    } else {
        let mut multipart = MultiPart::mixed().singlepart(SinglePart::plain(body.to_string()));
        for part in attachments {
            multipart = multipart
                .singlepart(MimeAttachment::new(part.file_name).body(part.bytes, part.content_type));
        }
        builder.multipart(multipart)
    };

    built.map_err(|e| MailError::Other(format!("failed to build message: {e}")))
}

/// Deliver over SMTP (blocking). `ssl` uses implicit TLS, a `start_tls` auth
/// method upgrades a plain connection, anything else stays plain.
pub fn deliver(params: &SmtpParams, message: &Message) -> Result<(), MailError> {
    let network = |e: lettre::transport::smtp::Error| MailError::Network {
        host: params.host.clone(),
        reason: e.to_string(),
    };

    let builder = match (params.security, params.starttls) {
        (Security::Ssl, _) => SmtpTransport::relay(&params.host).map_err(network)?,
        (Security::Plain, true) => SmtpTransport::starttls_relay(&params.host).map_err(network)?,
        (Security::Plain, false) => SmtpTransport::builder_dangerous(&params.host),
    };
    let mut builder = builder.port(params.port).timeout(Some(params.timeout));
    if !params.username.is_empty() {
        builder = builder.credentials(Credentials::new(
            params.username.clone(),
            params.password.expose_secret().to_string(),
        ));
    }
    let transport = builder.build();

    debug!(account = %params.account, host = %params.host, port = params.port, "Submitting message");
    transport.send(message).map_err(|e| {
        if e.is_permanent() || e.is_transient() {
            MailError::Rejected(e.to_string())
        } else {
            network(e)
        }
    })?;
    Ok(())
}
