//! Sandboxed file management.
//!
//! The operations behind the panel's file browser: listing, reading,
//! writing, deleting, directory creation, rename/copy, staged-upload
//! placement, and ZIP extraction. Every operation validates its path(s)
//! against the caller's sandbox scope before touching the filesystem.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use pterolite_sandbox::{SandboxError, SandboxRoots};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

/// Result type for file manager operations.
pub type FileResult<T> = Result<T, FileError>;

/// Errors that can occur during file manager operations.
#[derive(Debug, Error)]
pub enum FileError {
    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The path escapes the caller's sandbox scope.
    #[error(transparent)]
    Denied(#[from] SandboxError),

    /// Archive could not be read or extracted.
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Directory listing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: PathBuf,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
    /// Content type (MIME), guessed from the extension. Files only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Sandboxed file operations for one set of roots.
#[derive(Debug, Clone)]
pub struct FileManager {
    roots: SandboxRoots,
}

impl FileManager {
    pub fn new(roots: SandboxRoots) -> Self {
        Self { roots }
    }

    /// List a directory, creating it on demand.
    pub async fn list(
        &self,
        path: Option<&str>,
        container: Option<&str>,
    ) -> FileResult<Vec<FileEntry>> {
        let dir = self.roots.validate(path, container)?;
        fs::create_dir_all(&dir).await?;

        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let entry_path = entry.path();
            let meta = entry.metadata().await?;

            let content_type = if meta.is_dir() {
                None
            } else {
                Some(
                    mime_guess::from_path(&entry_path)
                        .first_or_octet_stream()
                        .essence_str()
                        .to_string(),
                )
            };

            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: entry_path,
                is_dir: meta.is_dir(),
                size: meta.len(),
                modified: meta.modified().ok().and_then(system_time_to_chrono),
                created: meta.created().ok().and_then(system_time_to_chrono),
                content_type,
            });
        }

        Ok(entries)
    }

    /// Read a file as UTF-8 text.
    pub async fn read(&self, path: &str, container: Option<&str>) -> FileResult<String> {
        let file = self.roots.validate(Some(path), container)?;
        fs::read_to_string(&file)
            .await
            .map_err(|err| not_found_or_io(err, path))
    }

    /// Write text to a file, creating parent directories on demand.
    pub async fn write(
        &self,
        path: &str,
        content: &str,
        container: Option<&str>,
    ) -> FileResult<PathBuf> {
        let file = self.roots.validate(Some(path), container)?;
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&file, content).await?;
        debug!("wrote {} bytes to {}", content.len(), file.display());
        Ok(file)
    }

    /// Delete a file or directory tree. Returns `false` when absent.
    pub async fn remove(&self, path: &str, container: Option<&str>) -> FileResult<bool> {
        let target = self.roots.validate(Some(path), container)?;
        let meta = match fs::metadata(&target).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };

        if meta.is_dir() {
            fs::remove_dir_all(&target).await?;
        } else {
            fs::remove_file(&target).await?;
        }
        debug!("deleted {}", target.display());
        Ok(true)
    }

    /// Create a new directory under a validated parent. Rejects an
    /// already existing target.
    pub async fn mkdir(
        &self,
        parent: Option<&str>,
        name: &str,
        container: Option<&str>,
    ) -> FileResult<PathBuf> {
        let parent = self.roots.validate(parent, container)?;
        // The joined path gets its own validation pass: the name may
        // carry separators or traversal.
        let target = self.validate_joined(&parent, name, container)?;

        if fs::metadata(&target).await.is_ok() {
            return Err(FileError::AlreadyExists(target.display().to_string()));
        }
        fs::create_dir_all(&target).await?;
        debug!("created directory {}", target.display());
        Ok(target)
    }

    /// Rename/move within the scope. Both endpoints are validated.
    pub async fn rename(
        &self,
        src: &str,
        dst: &str,
        container: Option<&str>,
    ) -> FileResult<PathBuf> {
        let src = self.roots.validate(Some(src), container)?;
        let dst = self.roots.validate(Some(dst), container)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&src, &dst).await?;
        Ok(dst)
    }

    /// Copy a file within the scope. Both endpoints are validated.
    pub async fn copy(
        &self,
        src: &str,
        dst: &str,
        container: Option<&str>,
    ) -> FileResult<PathBuf> {
        let src = self.roots.validate(Some(src), container)?;
        let dst = self.roots.validate(Some(dst), container)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&src, &dst).await?;
        Ok(dst)
    }

    /// Move a staged upload into its validated destination directory.
    /// The joined final path is validated again: the client-supplied
    /// filename may carry traversal.
    pub async fn place_upload(
        &self,
        staged: &Path,
        dir: Option<&str>,
        filename: &str,
        container: Option<&str>,
    ) -> FileResult<PathBuf> {
        let target_dir = self.roots.validate(dir, container)?;
        let final_path = self.validate_joined(&target_dir, filename, container)?;

        fs::create_dir_all(&target_dir).await?;
        fs::rename(staged, &final_path).await?;
        debug!("placed upload at {}", final_path.display());
        Ok(final_path)
    }

    /// Extract a ZIP archive into a destination directory inside the
    /// scope. Entries that would land outside the destination are
    /// skipped.
    pub async fn extract_zip(
        &self,
        archive: &str,
        dest: &str,
        container: Option<&str>,
    ) -> FileResult<()> {
        let archive = self.roots.validate(Some(archive), container)?;
        let dest = self.roots.validate(Some(dest), container)?;
        fs::create_dir_all(&dest).await?;

        tokio::task::spawn_blocking(move || extract_zip_blocking(&archive, &dest))
            .await
            .map_err(|err| FileError::Io(std::io::Error::other(err)))?
    }

    fn validate_joined(
        &self,
        base: &Path,
        name: &str,
        container: Option<&str>,
    ) -> FileResult<PathBuf> {
        let joined = base.join(name);
        let validated = self
            .roots
            .validate(Some(&joined.to_string_lossy()), container)?;
        Ok(validated)
    }
}

/// Synchronous ZIP extraction, run on the blocking pool.
fn extract_zip_blocking(archive: &Path, dest: &Path) -> FileResult<()> {
    let file = std::fs::File::open(archive)
        .map_err(|err| not_found_or_io(err, &archive.display().to_string()))?;
    let mut zip = zip::ZipArchive::new(file)?;

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let Some(relative) = entry.enclosed_name() else {
            warn!("skipping zip entry with unsafe path: {}", entry.name());
            continue;
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
        } else {
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = std::fs::File::create(&out_path)?;
            std::io::copy(&mut entry, &mut out)?;
        }
    }

    debug!("extracted {} into {}", archive.display(), dest.display());
    Ok(())
}

fn not_found_or_io(err: std::io::Error, path: &str) -> FileError {
    if err.kind() == std::io::ErrorKind::NotFound {
        FileError::NotFound(path.to_string())
    } else {
        FileError::Io(err)
    }
}

/// Convert system time to chrono DateTime.
fn system_time_to_chrono(time: std::time::SystemTime) -> Option<DateTime<Utc>> {
    time.duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| DateTime::from_timestamp(d.as_secs() as i64, d.subsec_nanos()).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn test_manager() -> (FileManager, TempDir) {
        let dir = TempDir::new().unwrap();
        let roots = SandboxRoots::new(dir.path().join("files"), dir.path().join("containers"));
        (FileManager::new(roots), dir)
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (manager, _dir) = test_manager();

        manager
            .write("notes.txt", "hello world", Some("alpha"))
            .await
            .unwrap();
        let content = manager.read("notes.txt", Some("alpha")).await.unwrap();

        assert_eq!(content, "hello world");
    }

    #[tokio::test]
    async fn test_read_missing_file_is_not_found() {
        let (manager, _dir) = test_manager();
        let err = manager.read("missing.txt", None).await.unwrap_err();
        assert!(matches!(err, FileError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_write_outside_scope_is_denied() {
        let (manager, _dir) = test_manager();
        let err = manager
            .write("../../../etc/owned", "nope", Some("alpha"))
            .await
            .unwrap_err();
        assert!(matches!(err, FileError::Denied(_)));
    }

    #[tokio::test]
    async fn test_container_scopes_are_isolated() {
        let (manager, _dir) = test_manager();
        manager
            .write("secret.txt", "alpha only", Some("alpha"))
            .await
            .unwrap();

        let err = manager
            .read("../alpha/secret.txt", Some("beta"))
            .await
            .unwrap_err();
        assert!(matches!(err, FileError::Denied(_)));
    }

    #[tokio::test]
    async fn test_list_creates_directory_on_demand() {
        let (manager, _dir) = test_manager();
        let entries = manager.list(None, Some("alpha")).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_list_reports_metadata() {
        let (manager, _dir) = test_manager();
        manager.write("a.txt", "abc", None).await.unwrap();
        manager.mkdir(None, "sub", None).await.unwrap();

        let mut entries = manager.list(None, None).await.unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert!(!entries[0].is_dir);
        assert_eq!(entries[0].size, 3);
        assert_eq!(entries[0].content_type.as_deref(), Some("text/plain"));
        assert_eq!(entries[1].name, "sub");
        assert!(entries[1].is_dir);
    }

    #[tokio::test]
    async fn test_remove_file_and_directory() {
        let (manager, _dir) = test_manager();
        manager.write("doomed/deep.txt", "x", None).await.unwrap();

        assert!(manager.remove("doomed", None).await.unwrap());
        assert!(!manager.remove("doomed", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_mkdir_rejects_existing_directory() {
        let (manager, _dir) = test_manager();
        manager.mkdir(None, "data", None).await.unwrap();

        let err = manager.mkdir(None, "data", None).await.unwrap_err();
        assert!(matches!(err, FileError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_mkdir_rejects_traversal_in_name() {
        let (manager, _dir) = test_manager();
        let err = manager
            .mkdir(None, "../../escape", Some("alpha"))
            .await
            .unwrap_err();
        assert!(matches!(err, FileError::Denied(_)));
    }

    #[tokio::test]
    async fn test_rename_and_copy() {
        let (manager, _dir) = test_manager();
        manager.write("old.txt", "content", None).await.unwrap();

        manager.rename("old.txt", "new.txt", None).await.unwrap();
        assert!(matches!(
            manager.read("old.txt", None).await.unwrap_err(),
            FileError::NotFound(_)
        ));

        manager.copy("new.txt", "copy.txt", None).await.unwrap();
        assert_eq!(manager.read("copy.txt", None).await.unwrap(), "content");
        assert_eq!(manager.read("new.txt", None).await.unwrap(), "content");
    }

    #[tokio::test]
    async fn test_place_upload_moves_staged_file() {
        let (manager, dir) = test_manager();
        let staged = dir.path().join("staged-upload");
        std::fs::write(&staged, b"payload").unwrap();

        let placed = manager
            .place_upload(&staged, None, "upload.bin", Some("alpha"))
            .await
            .unwrap();

        assert!(!staged.exists());
        assert_eq!(std::fs::read(&placed).unwrap(), b"payload");
        assert!(placed.ends_with("upload.bin"));
    }

    #[tokio::test]
    async fn test_place_upload_rejects_traversal_filename() {
        let (manager, dir) = test_manager();
        let staged = dir.path().join("staged-upload");
        std::fs::write(&staged, b"payload").unwrap();

        let err = manager
            .place_upload(&staged, None, "../../evil.bin", Some("alpha"))
            .await
            .unwrap_err();
        assert!(matches!(err, FileError::Denied(_)));
        assert!(staged.exists());
    }

    #[tokio::test]
    async fn test_extract_zip() {
        let (manager, _dir) = test_manager();

        // Build a small archive inside the scope.
        let root = manager.roots.validate(None, Some("alpha")).unwrap();
        let archive_path = root.join("bundle.zip");
        let file = std::fs::File::create(&archive_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("readme.txt", options).unwrap();
        writer.write_all(b"hello from zip").unwrap();
        writer.start_file("nested/data.txt", options).unwrap();
        writer.write_all(b"nested data").unwrap();
        writer.finish().unwrap();

        manager
            .extract_zip("bundle.zip", "out", Some("alpha"))
            .await
            .unwrap();

        assert_eq!(
            manager.read("out/readme.txt", Some("alpha")).await.unwrap(),
            "hello from zip"
        );
        assert_eq!(
            manager
                .read("out/nested/data.txt", Some("alpha"))
                .await
                .unwrap(),
            "nested data"
        );
    }

    #[tokio::test]
    async fn test_extract_zip_skips_traversal_entries() {
        let (manager, dir) = test_manager();

        let root = manager.roots.validate(None, Some("alpha")).unwrap();
        let archive_path = root.join("sly.zip");
        let file = std::fs::File::create(&archive_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("ok.txt", options).unwrap();
        writer.write_all(b"fine").unwrap();
        writer.start_file("../../escaped.txt", options).unwrap();
        writer.write_all(b"not fine").unwrap();
        writer.finish().unwrap();

        manager
            .extract_zip("sly.zip", "out", Some("alpha"))
            .await
            .unwrap();

        assert_eq!(
            manager.read("out/ok.txt", Some("alpha")).await.unwrap(),
            "fine"
        );
        // The traversal entry never lands, neither inside nor outside
        // the destination. Two levels above `out` is the containers dir.
        assert!(!root.join("out").join("escaped.txt").exists());
        assert!(!root.join("escaped.txt").exists());
        assert!(!dir.path().join("containers").join("escaped.txt").exists());
    }

    #[tokio::test]
    async fn test_extract_zip_outside_scope_is_denied() {
        let (manager, _dir) = test_manager();
        let err = manager
            .extract_zip("/etc/bundle.zip", "out", Some("alpha"))
            .await
            .unwrap_err();
        assert!(matches!(err, FileError::Denied(_)));
    }
}
