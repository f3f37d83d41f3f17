//! Per-task execution transcript.

use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use uuid::Uuid;

use crate::error::TaskError;

/// Log file collecting every command and its output for one task run.
#[derive(Debug)]
pub struct Transcript {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Transcript {
    /// Create `<dir>/<task>_<YYYYmmdd_HHMMSS_mmm>.log`. An existing file is
    /// never reused: on a name clash a random suffix is added.
    pub async fn create(dir: &Path, task_name: &str) -> Result<Self, TaskError> {
        let stem = format!(
            "{}_{}",
            sanitize(task_name),
            Local::now().format("%Y%m%d_%H%M%S_%3f")
        );

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| TaskError::TranscriptCreate {
                path: dir.to_path_buf(),
                source,
            })?;

        let mut path = dir.join(format!("{stem}.log"));
        let file = match open_new(&path).await {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                path = dir.join(format!("{stem}_{}.log", Uuid::new_v4().simple()));
                open_new(&path).await
            }
            opened => opened,
        }
        .map_err(|source| TaskError::TranscriptCreate {
            path: path.clone(),
            source,
        })?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Timestamped header line.
    pub async fn info(&mut self, message: &str) -> Result<(), TaskError> {
        let line = format!(
            "[{}][info] {message}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.6f")
        );
        self.write(line.as_bytes()).await
    }

    /// Captured output, written as-is.
    pub async fn raw(&mut self, text: &str) -> Result<(), TaskError> {
        if text.is_empty() {
            return Ok(());
        }
        self.write(text.as_bytes()).await?;
        if !text.ends_with('\n') {
            self.write(b"\n").await?;
        }
        Ok(())
    }

    /// Flush and return the transcript location.
    pub async fn finish(mut self) -> Result<PathBuf, TaskError> {
        self.writer
            .flush()
            .await
            .map_err(|source| TaskError::TranscriptWrite {
                path: self.path.clone(),
                source,
            })?;
        Ok(self.path)
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TaskError> {
        self.writer
            .write_all(bytes)
            .await
            .map_err(|source| TaskError::TranscriptWrite {
                path: self.path.clone(),
                source,
            })
    }
}

async fn open_new(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path).await
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "task".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_sanitized() {
        assert_eq!(sanitize("nightly build/../x"), "nightly_build____x");
        assert_eq!(sanitize(""), "task");
    }

    #[tokio::test]
    async fn writes_headers_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut transcript = Transcript::create(&dir.path().join("logs"), "deploy").await.unwrap();
        transcript.info("Running command: echo hi").await.unwrap();
        transcript.raw("hi").await.unwrap();
        let path = transcript.finish().await.unwrap();

        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("deploy_") && name.ends_with(".log"), "{name}");

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("[info] Running command: echo hi\n"));
        assert!(text.ends_with("hi\n"));
    }

    #[tokio::test]
    async fn same_name_runs_never_share_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut transcripts = Vec::new();
        for i in 0..20 {
            let mut transcript = Transcript::create(dir.path(), "deploy").await.unwrap();
            transcript.info(&format!("run {i}")).await.unwrap();
            transcripts.push(transcript);
        }

        let mut paths = Vec::new();
        for transcript in transcripts {
            paths.push(transcript.finish().await.unwrap());
        }
        let unique: std::collections::HashSet<_> = paths.iter().collect();
        assert_eq!(unique.len(), paths.len());

        for (i, path) in paths.iter().enumerate() {
            let text = std::fs::read_to_string(path).unwrap();
            assert_eq!(text.lines().count(), 1, "{}", path.display());
            assert!(text.contains(&format!("[info] run {i}\n")));
        }
    }

    #[tokio::test]
    async fn create_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();

        let err = Transcript::create(&blocker.join("logs"), "t").await.unwrap_err();
        assert!(matches!(err, TaskError::TranscriptCreate { .. }));
    }
}
