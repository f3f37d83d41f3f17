//! Routing rules behind the three daemon topics and the mailbox poll.
//!
//! Every handler logs and continues on per-file and per-account failures, so
//! one bad bundle or one broken account never aborts the rest of a batch.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::archive::{self, Extractor};
use crate::bus::ServiceHandle;
use crate::config::AgentConfig;
use crate::error::TaskError;
use crate::mail::{Attachment, MailDispatchRequest, Mailer};
use crate::task::{Runner, Task, TaskReport};

/// MIME type of the transcript attached to result mail.
pub const TRANSCRIPT_MIME: &str = "text/plain";

/// Producer handles for the three topics.
#[derive(Debug, Clone)]
pub struct Outlets {
    pub mail_recv: ServiceHandle<String>,
    pub task_recv: ServiceHandle<String>,
    pub mail_send: ServiceHandle<MailDispatchRequest>,
}

/// Result of one mailbox poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Every account was polled; `enqueued` result directories were queued.
    Completed { enqueued: usize },
    /// A previous poll was still running.
    Skipped,
}

pub struct Router {
    config: Arc<AgentConfig>,
    mailer: Arc<dyn Mailer>,
    extractor: Arc<dyn Extractor>,
    runner: Runner,
    outlets: Outlets,
    poll_guard: Mutex<()>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("accounts", &self.config.accounts.len())
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}

impl Router {
    pub fn new(
        config: Arc<AgentConfig>,
        mailer: Arc<dyn Mailer>,
        extractor: Arc<dyn Extractor>,
        runner: Runner,
        outlets: Outlets,
    ) -> Self {
        Self {
            config,
            mailer,
            extractor,
            runner,
            outlets,
            poll_guard: Mutex::new(()),
        }
    }

    /// `mail_recv`: queue every job file in `dir`, expanding bundles first.
    /// Returns how many paths were queued on `task_recv`.
    pub async fn on_mail_received(&self, dir: &Path) -> usize {
        let entries = match sorted_entries(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Cannot read mail directory");
                return 0;
            }
        };

        let mut queued = 0;
        for path in entries {
            if archive::is_archive(&path) {
                queued += self.expand_bundle(&path).await;
            } else if archive::is_job_file(&path) && is_file(&path).await {
                queued += usize::from(self.queue_job(&path).await);
            }
        }
        debug!(dir = %dir.display(), queued, "Mail directory routed");
        queued
    }

    async fn expand_bundle(&self, bundle: &Path) -> usize {
        let destination = archive::extraction_dir(bundle);
        if let Err(e) = self.extractor.extract(bundle, &destination).await {
            warn!(archive = %bundle.display(), kind = %e.kind(), error = %e, "Skipping bundle");
            return 0;
        }

        let entries = match sorted_entries(&destination).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %destination.display(), error = %e, "Cannot read extracted bundle");
                return 0;
            }
        };

        let mut queued = 0;
        for path in entries {
            if archive::is_job_file(&path) && is_file(&path).await {
                queued += usize::from(self.queue_job(&path).await);
            }
        }
        queued
    }

    async fn queue_job(&self, path: &Path) -> bool {
        match self.outlets.task_recv.enqueue(path_payload(path)).await {
            Ok(()) => {
                info!(job = %path.display(), "Job queued");
                true
            }
            Err(e) => {
                warn!(job = %path.display(), error = %e, "Failed to queue job");
                false
            }
        }
    }

    /// `task_recv`: parse and run one job, then queue its result mail.
    /// Invalid job files are dropped. A task that cannot run at all still gets
    /// a reply, without a transcript.
    pub async fn on_task_received(&self, path: &Path) -> Option<TaskReport> {
        let task = match Task::from_file(path).await {
            Ok(task) => task,
            Err(e) => {
                warn!(job = %path.display(), error = %e, "Dropping invalid job description");
                return None;
            }
        };

        let run_id = Uuid::new_v4();
        info!(run_id = %run_id, task = %task.name, job = %path.display(), "Running task");
        let report = match self.runner.execute(&task).await {
            Ok(report) => report,
            Err(e) => {
                error!(run_id = %run_id, task = %task.name, kind = %e.kind(), error = %e, "Task could not run");
                if let Err(queue_err) = self.outlets.mail_send.enqueue(failure_mail(&task.name, &e)).await {
                    warn!(run_id = %run_id, task = %task.name, error = %queue_err, "Failed to queue failure mail");
                }
                return None;
            }
        };
        info!(run_id = %run_id, task = %task.name, exit_code = report.exit_code, "Task finished");

        let request = result_mail(&report);
        if let Err(e) = self.outlets.mail_send.enqueue(request).await {
            warn!(run_id = %run_id, task = %task.name, error = %e, "Failed to queue result mail");
        }
        Some(report)
    }

    /// `mail_send`: send through every targeted account. Returns how many
    /// accounts sent successfully.
    pub async fn on_mail_send(&self, request: MailDispatchRequest) -> usize {
        let mut matched = 0;
        let mut sent = 0;
        for account in self.config.accounts.iter().filter(|a| request.targets(&a.name)) {
            matched += 1;
            match self
                .mailer
                .send(account, &request.subject, &request.body, &request.attachments)
                .await
            {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(account = %account.name, kind = %e.kind(), error = %e, "Send failed");
                }
            }
        }

        if matched == 0 {
            warn!(
                account = request.account.as_deref().unwrap_or("*"),
                subject = %request.subject,
                "No recipient configuration found"
            );
        }
        sent
    }

    /// Fetch every polling account and queue each result directory on
    /// `mail_recv`. Overlapping calls are skipped, not queued.
    pub async fn poll_mailboxes(&self) -> PollOutcome {
        let Ok(_guard) = self.poll_guard.try_lock() else {
            debug!("Mailbox poll still running, skipping tick");
            return PollOutcome::Skipped;
        };

        let mut enqueued = 0;
        for account in &self.config.accounts {
            if account.protocol.imap.is_none() {
                continue;
            }
            match self.mailer.fetch_filtered(account).await {
                Ok(dir) if dir.as_os_str().is_empty() => {}
                Ok(dir) => match self.outlets.mail_recv.enqueue(path_payload(&dir)).await {
                    Ok(()) => enqueued += 1,
                    Err(e) => {
                        warn!(account = %account.name, error = %e, "Failed to queue mail directory");
                    }
                },
                Err(e) if e.is_no_new_mail() => {
                    debug!(account = %account.name, "No new mail");
                }
                Err(e) => {
                    warn!(account = %account.name, kind = %e.kind(), error = %e, "Mailbox poll failed");
                }
            }
        }
        PollOutcome::Completed { enqueued }
    }
}

/// The result mail for a finished task.
pub fn result_mail(report: &TaskReport) -> MailDispatchRequest {
    MailDispatchRequest {
        subject: report.task_name.clone(),
        body: report.summary(),
        account: None,
        attachments: vec![Attachment::new(report.transcript.clone(), TRANSCRIPT_MIME)],
    }
}

/// Reply for a task that never ran.
pub fn failure_mail(task_name: &str, error: &TaskError) -> MailDispatchRequest {
    MailDispatchRequest {
        subject: task_name.to_string(),
        body: format!("Task '{task_name}' could not run: {error}"),
        account: None,
        attachments: Vec::new(),
    }
}

fn path_payload(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok_and(|m| m.is_file())
}

async fn sorted_entries(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut reader = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}
