//! Application configuration loading.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use pterolite_sandbox::SandboxRoots;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "PTEROLITE";

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub exec: ExecConfig,
}

/// Filesystem roots the panel operates in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Parent directory holding one subdirectory per container.
    pub container_dir: String,
    /// Shared directory used when no container scope is given.
    pub default_files_dir: String,
    /// Staging directory for uploads before they are placed.
    pub upload_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            container_dir: "/tmp/pterolite-containers".to_string(),
            default_files_dir: "/tmp/pterolite-files".to_string(),
            upload_dir: "/tmp/pterolite-uploads".to_string(),
        }
    }
}

/// Command execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Timeout for one-shot command and script executions, in seconds.
    pub command_timeout_secs: u64,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 30,
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional TOML file plus environment
    /// overrides (`PTEROLITE__PATHS__CONTAINER_DIR=...`).
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = config_file {
            builder = builder.add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }
        let built = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .context("loading configuration")?;

        built.try_deserialize().context("parsing configuration")
    }

    /// The sandbox roots all file and exec operations are confined to.
    pub fn sandbox_roots(&self) -> SandboxRoots {
        SandboxRoots::new(
            expand_path(&self.paths.default_files_dir),
            expand_path(&self.paths.container_dir),
        )
    }

    /// Staging directory for uploads.
    pub fn upload_dir(&self) -> PathBuf {
        expand_path(&self.paths.upload_dir)
    }

    /// One-shot execution timeout.
    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.exec.command_timeout_secs)
    }
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.paths.container_dir, "/tmp/pterolite-containers");
        assert_eq!(config.paths.default_files_dir, "/tmp/pterolite-files");
        assert_eq!(config.paths.upload_dir, "/tmp/pterolite-uploads");
        assert_eq!(config.exec.command_timeout_secs, 30);
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "[paths]\ncontainer_dir = \"/srv/containers\"\n\n[exec]\ncommand_timeout_secs = 5\n"
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.paths.container_dir, "/srv/containers");
        // Unset keys keep their defaults.
        assert_eq!(config.paths.default_files_dir, "/tmp/pterolite-files");
        assert_eq!(config.exec.command_timeout_secs, 5);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = AppConfig::load(Some(Path::new("/nonexistent/pterolite.toml"))).unwrap();
        assert_eq!(config.paths.container_dir, "/tmp/pterolite-containers");
    }

    #[test]
    fn test_sandbox_roots_expand_tilde() {
        let mut config = AppConfig::default();
        config.paths.default_files_dir = "~/files".to_string();
        let roots = config.sandbox_roots();
        assert!(!roots.default_dir.to_string_lossy().starts_with('~'));
    }
}
