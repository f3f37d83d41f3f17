//! Archive collaborator: expand job bundles.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use crate::error::ArchiveError;

/// Expands an archive into a directory.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, archive: &Path, destination: &Path) -> Result<(), ArchiveError>;
}

/// `.zip` extractor backed by the `zip` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipExtractor;

#[async_trait]
impl Extractor for ZipExtractor {
    async fn extract(&self, archive: &Path, destination: &Path) -> Result<(), ArchiveError> {
        let archive = archive.to_path_buf();
        let destination = destination.to_path_buf();
        tokio::task::spawn_blocking(move || extract_zip(&archive, &destination))
            .await
            .map_err(|e| ArchiveError::Extract {
                path: PathBuf::new(),
                reason: format!("extraction task failed: {e}"),
            })?
    }
}

fn extract_zip(archive: &Path, destination: &Path) -> Result<(), ArchiveError> {
    std::fs::create_dir_all(destination).map_err(|source| ArchiveError::CreateDir {
        path: destination.to_path_buf(),
        source,
    })?;

    let open_err = |reason: String| ArchiveError::Open {
        path: archive.to_path_buf(),
        reason,
    };
    let file = std::fs::File::open(archive).map_err(|e| open_err(e.to_string()))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| open_err(e.to_string()))?;

    // `extract` rejects entries that would escape the destination.
    zip.extract(destination).map_err(|e| ArchiveError::Extract {
        path: archive.to_path_buf(),
        reason: e.to_string(),
    })?;

    info!(archive = %archive.display(), destination = %destination.display(), entries = zip.len(), "Archive extracted");
    Ok(())
}

fn has_extension(path: &Path, wanted: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| wanted.iter().any(|w| e.eq_ignore_ascii_case(w)))
}

/// Job bundles are `.zip` files.
pub fn is_archive(path: &Path) -> bool {
    has_extension(path, &["zip"])
}

/// Job descriptions are `.yaml` / `.yml` files.
pub fn is_job_file(path: &Path) -> bool {
    has_extension(path, &["yaml", "yml"])
}

/// Where an archive found in `dir` is expanded: `<dir>/<archive stem>`.
pub fn extraction_dir(archive: &Path) -> PathBuf {
    let stem = archive
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    archive.with_file_name(stem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, body) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn detection_is_case_insensitive() {
        assert!(is_archive(Path::new("/tmp/Bundle.ZIP")));
        assert!(!is_archive(Path::new("/tmp/bundle.tar")));
        assert!(is_job_file(Path::new("job.yaml")));
        assert!(is_job_file(Path::new("job.YML")));
        assert!(!is_job_file(Path::new("job.json")));
        assert!(!is_job_file(Path::new("yaml")));
    }

    #[test]
    fn extraction_dir_is_a_sibling() {
        assert_eq!(
            extraction_dir(Path::new("/work/mail/jobs.zip")),
            PathBuf::from("/work/mail/jobs")
        );
    }

    #[tokio::test]
    async fn extracts_entries() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("jobs.zip");
        write_zip(&archive, &[("build.yaml", "name: build\n"), ("notes.txt", "x")]);

        let dest = extraction_dir(&archive);
        ZipExtractor.extract(&archive, &dest).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dest.join("build.yaml")).unwrap(),
            "name: build\n"
        );
        assert!(dest.join("notes.txt").exists());
    }

    #[tokio::test]
    async fn corrupt_archive_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bad.zip");
        std::fs::write(&archive, b"definitely not a zip").unwrap();

        let err = ZipExtractor
            .extract(&archive, &dir.path().join("bad"))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Open { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::FileOpenFailed);
    }

    #[tokio::test]
    async fn missing_archive_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let err = ZipExtractor
            .extract(&dir.path().join("none.zip"), &dir.path().join("none"))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Open { .. }));
    }
}
