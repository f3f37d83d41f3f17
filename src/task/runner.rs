//! Command execution through a shell, and whole-task runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::model::Task;
use super::transcript::Transcript;
use crate::config::GlobalConfig;
use crate::error::TaskError;

/// Shell used to run each command as `<shell> -c "<command>"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    /// Platform default: `/bin/sh` on unix, `cmd /C` on windows.
    #[default]
    Default,
    Sh,
    Bash,
    Zsh,
}

impl ShellKind {
    /// Program and the flag that introduces the command string.
    fn resolve(self) -> Result<(PathBuf, &'static str), String> {
        let name = match self {
            Self::Default if cfg!(windows) => return Ok((PathBuf::from("cmd"), "/C")),
            Self::Default => return Ok((PathBuf::from("/bin/sh"), "-c")),
            Self::Sh => "sh",
            Self::Bash => "bash",
            Self::Zsh => "zsh",
        };
        find_in_path(name)
            .map(|path| (path, "-c"))
            .ok_or_else(|| format!("shell '{name}' not found in PATH"))
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .flat_map(|dir| {
            let plain = dir.join(name);
            let exe = dir.join(format!("{name}.exe"));
            [plain, exe]
        })
        .find(|candidate| candidate.is_file())
}

/// Outcome of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    fn failed(stderr: impl Into<String>) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Outcome of a whole task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub task_name: String,
    /// 0, or the exit code of the first failing command.
    pub exit_code: i32,
    pub failed_step: Option<String>,
    pub transcript: PathBuf,
}

impl TaskReport {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Human-readable one-line summary.
    pub fn summary(&self) -> String {
        match &self.failed_step {
            None if self.success() => format!("Task '{}' finished successfully.", self.task_name),
            step => format!(
                "Task '{}' failed with exit code {} at step '{}'.",
                self.task_name,
                self.exit_code,
                step.as_deref().unwrap_or("unknown")
            ),
        }
    }
}

/// Runs tasks step by step, one command at a time.
#[derive(Debug, Clone)]
pub struct Runner {
    shell: ShellKind,
    log_dir: PathBuf,
    timeout: Option<Duration>,
}

impl Runner {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            shell: ShellKind::Default,
            log_dir: log_dir.into(),
            timeout: None,
        }
    }

    /// Transcripts under `<work_dir>/logs`, shell and timeout from config.
    pub fn from_config(global: &GlobalConfig) -> Self {
        Self::new(global.work_dir.join("logs"))
            .with_shell(global.shell)
            .with_timeout(global.command_timeout())
    }

    pub fn with_shell(mut self, shell: ShellKind) -> Self {
        self.shell = shell;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Run one command with `env` added to the inherited environment.
    ///
    /// Never fails: a missing shell, spawn error or timeout is reported as
    /// exit code -1 with the reason in `stderr`.
    pub async fn execute_command(
        &self,
        command: &str,
        env: &BTreeMap<String, String>,
    ) -> CommandResult {
        let (program, flag) = match self.shell.resolve() {
            Ok(resolved) => resolved,
            Err(reason) => return CommandResult::failed(reason),
        };

        let mut child = match Command::new(&program)
            .arg(flag)
            .arg(command)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return CommandResult::failed(format!(
                    "failed to launch {}: {e}",
                    program.display()
                ));
            }
        };

        let outcome = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, collect(&mut child)).await.ok(),
            None => Some(collect(&mut child).await),
        };

        match outcome {
            Some(result) => result,
            None => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill timed out command");
                }
                let limit = self.timeout.unwrap_or_default();
                CommandResult::failed(format!("command timed out after {}s", limit.as_secs()))
            }
        }
    }

    /// Run every step in order, stopping at the first non-zero exit code.
    pub async fn execute(&self, task: &Task) -> Result<TaskReport, TaskError> {
        let mut transcript = Transcript::create(&self.log_dir, &task.name).await?;
        info!(task = %task.name, steps = task.steps.len(), transcript = %transcript.path().display(), "Task started");
        transcript.info(&format!("Task '{}' started", task.name)).await?;

        let mut failure = None;
        'steps: for step in &task.steps {
            transcript.info(&format!("Step '{}'", step.name)).await?;
            for command in &step.commands {
                debug!(task = %task.name, step = %step.name, command = %command, "Running command");
                transcript.info(&format!("Running command: {command}")).await?;

                let result = self.execute_command(command, &step.environments).await;
                transcript.raw(&result.stdout).await?;
                transcript.raw(&result.stderr).await?;
                transcript.info(&format!("Exit code: {}", result.exit_code)).await?;

                if !result.success() {
                    warn!(task = %task.name, step = %step.name, exit_code = result.exit_code, "Command failed");
                    failure = Some((result.exit_code, step.name.clone()));
                    break 'steps;
                }
            }
        }

        let (exit_code, failed_step) = match failure {
            Some((code, step)) => (code, Some(step)),
            None => (0, None),
        };
        let report = TaskReport {
            task_name: task.name.clone(),
            exit_code,
            failed_step,
            transcript: transcript.path().to_path_buf(),
        };
        transcript.info(&report.summary()).await?;
        transcript.finish().await?;

        info!(task = %task.name, exit_code, "Task finished");
        Ok(report)
    }
}

async fn collect(child: &mut Child) -> CommandResult {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (stdout, stderr) = tokio::join!(read_lines(stdout), read_lines(stderr));

    match child.wait().await {
        Ok(status) => CommandResult {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        },
        Err(e) => CommandResult {
            exit_code: -1,
            stdout,
            stderr: format!("{stderr}failed to wait for command: {e}\n"),
        },
    }
}

async fn read_lines<R: AsyncRead + Unpin>(stream: Option<R>) -> String {
    let mut out = String::new();
    let Some(stream) = stream else {
        return out;
    };
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                out.push_str(text.trim_end_matches(['\n', '\r']));
                out.push('\n');
            }
            Err(e) => {
                debug!(error = %e, "Output stream read failed");
                break;
            }
        }
    }
    out
}
