//! Per-tenant path containment.
//!
//! Every file operation and every working-directory argument in the panel
//! passes through [`SandboxRoots::validate`] before anything touches disk.
//! A request is confined either to the shared default directory or, when a
//! container scope is given, to that container's own directory under the
//! container root. Containment is decided on resolved path components,
//! never on raw string prefixes, so sibling directories that share a name
//! prefix (`.../app` vs `.../app2`) cannot be confused.

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Result type for sandbox validation.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Errors raised while validating a requested path.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The resolved path escapes the scope's root directory.
    #[error("access denied: path '{path}' is outside allowed directory '{root}'")]
    Outside { path: String, root: String },

    /// The scope's root directory could not be created or resolved.
    #[error("sandbox root unavailable: {0}")]
    Root(#[source] io::Error),

    /// The requested path could not be resolved against the filesystem.
    #[error("cannot resolve path '{path}': {source}")]
    Resolve { path: String, source: io::Error },
}

/// The filesystem roots requests are confined to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRoots {
    /// Shared directory used when no container scope is given.
    pub default_dir: PathBuf,
    /// Parent directory holding one subdirectory per container.
    pub container_dir: PathBuf,
}

impl SandboxRoots {
    pub fn new(default_dir: impl Into<PathBuf>, container_dir: impl Into<PathBuf>) -> Self {
        Self {
            default_dir: default_dir.into(),
            container_dir: container_dir.into(),
        }
    }

    /// Root directory for a scope, created on demand.
    ///
    /// Creation uses `create_dir_all` so concurrent first-time accesses
    /// for the same container cannot race.
    pub fn root_for(&self, container: Option<&str>) -> SandboxResult<PathBuf> {
        let root = match container {
            Some(name) => self.container_dir.join(name),
            None => self.default_dir.clone(),
        };
        fs::create_dir_all(&root).map_err(SandboxError::Root)?;
        root.canonicalize().map_err(SandboxError::Root)
    }

    /// Validate a requested path against the scope's root and return the
    /// resolved absolute path.
    ///
    /// An empty or absent request resolves to the root itself. Relative
    /// requests anchor at the root. The request is normalized (`.`, `..`)
    /// and symlink-resolved through its deepest existing ancestor before
    /// the component-wise containment check. Violations are reported,
    /// never silently clamped.
    pub fn validate(
        &self,
        requested: Option<&str>,
        container: Option<&str>,
    ) -> SandboxResult<PathBuf> {
        let root = self.root_for(container)?;

        let requested = match requested {
            Some(raw) if !raw.trim().is_empty() => raw,
            _ => return Ok(root),
        };

        let joined = {
            let path = Path::new(requested);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                root.join(path)
            }
        };

        let resolved =
            resolve_path(&normalize(&joined)).map_err(|source| SandboxError::Resolve {
                path: requested.to_string(),
                source,
            })?;

        if resolved.starts_with(&root) {
            debug!("validated '{}' -> {}", requested, resolved.display());
            Ok(resolved)
        } else {
            Err(SandboxError::Outside {
                path: requested.to_string(),
                root: root.display().to_string(),
            })
        }
    }
}

/// Collapse `.` and `..` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Resolve symlinks through the deepest existing ancestor and re-append
/// the components that do not exist yet.
fn resolve_path(path: &Path) -> io::Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut remainder: Vec<std::ffi::OsString> = Vec::new();

    loop {
        match existing.canonicalize() {
            Ok(base) => {
                let mut resolved = base;
                for component in remainder.iter().rev() {
                    resolved.push(component);
                }
                return Ok(resolved);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                match (existing.parent(), existing.file_name()) {
                    (Some(parent), Some(name)) => {
                        remainder.push(name.to_os_string());
                        existing = parent.to_path_buf();
                    }
                    _ => return Err(err),
                }
            }
            Err(err) => return Err(err),
        }
    }
}
