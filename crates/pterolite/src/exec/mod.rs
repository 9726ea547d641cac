//! Command and script execution.
//!
//! One-shot executions capture output under a timeout; persistent
//! executions are spawned into their own process group and handed to the
//! process supervisor. Working directories are validated against the
//! caller's sandbox scope before anything is spawned.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use pterolite_sandbox::SandboxRoots;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::supervisor::{LogChannel, ProcessKind, ProcessSpec, ProcessSupervisor};

/// Interpreter used for script execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
    Javascript,
    Python,
}

impl ScriptLanguage {
    fn interpreter(self) -> &'static str {
        match self {
            Self::Javascript => "node",
            Self::Python => "python3",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Self::Javascript => ".js",
            Self::Python => ".py",
        }
    }

    fn kind(self) -> ProcessKind {
        match self {
            Self::Javascript => ProcessKind::Javascript,
            Self::Python => ProcessKind::Python,
        }
    }

    fn default_name(self) -> &'static str {
        match self {
            Self::Javascript => "JavaScript Script",
            Self::Python => "Python Script",
        }
    }
}

/// Captured result of a one-shot execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Launch paths for operator commands and scripts.
#[derive(Clone)]
pub struct Executor {
    supervisor: ProcessSupervisor,
    roots: SandboxRoots,
    command_timeout: Duration,
}

impl Executor {
    pub fn new(
        supervisor: ProcessSupervisor,
        roots: SandboxRoots,
        command_timeout: Duration,
    ) -> Self {
        Self {
            supervisor,
            roots,
            command_timeout,
        }
    }

    /// Run a shell command once and capture its output. The child is
    /// killed when the timeout elapses.
    pub async fn execute(
        &self,
        command: &str,
        working_dir: Option<&str>,
        container: Option<&str>,
    ) -> Result<ExecOutput> {
        let cwd = self.roots.validate(working_dir, container)?;

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command).current_dir(&cwd);
        self.capture(cmd, command).await
    }

    /// Run a script once through a temporary file and capture its output.
    pub async fn execute_script(
        &self,
        language: ScriptLanguage,
        code: &str,
        working_dir: Option<&str>,
        container: Option<&str>,
    ) -> Result<ExecOutput> {
        let cwd = self.roots.validate(working_dir, container)?;
        let script = write_script_file(language, code)?;

        let mut cmd = Command::new(language.interpreter());
        cmd.arg(&script).current_dir(&cwd);
        let result = self.capture(cmd, language.interpreter()).await;

        if let Err(err) = std::fs::remove_file(&script) {
            debug!("could not remove script file {}: {err}", script.display());
        }
        result
    }

    /// Start a persistent shell command in its own process group and
    /// register it with the supervisor. A spawn failure still yields a
    /// record, in `Error` status, so the caller can inspect it.
    pub async fn run(
        &self,
        command: &str,
        working_dir: Option<&str>,
        name: Option<&str>,
        container: Option<&str>,
    ) -> Result<String> {
        let cwd = self.roots.validate(working_dir, container)?;
        let info = ProcessSpec {
            name: name
                .map(str::to_string)
                .unwrap_or_else(|| default_command_name(command)),
            kind: ProcessKind::Command,
            command: command.to_string(),
            working_dir: cwd.clone(),
            container_id: container.map(str::to_string),
            script_file: None,
        };

        let spawned = Command::new("bash")
            .arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn();

        self.finish_launch(spawned, info).await
    }

    /// Start a persistent script process. The script body is written to a
    /// temporary file that the supervisor removes once the process ends.
    pub async fn run_script(
        &self,
        language: ScriptLanguage,
        code: &str,
        working_dir: Option<&str>,
        name: Option<&str>,
        container: Option<&str>,
    ) -> Result<String> {
        let cwd = self.roots.validate(working_dir, container)?;
        let script = write_script_file(language, code)?;
        let info = ProcessSpec {
            name: name
                .map(str::to_string)
                .unwrap_or_else(|| language.default_name().to_string()),
            kind: language.kind(),
            command: format!("{} {}", language.interpreter(), script.display()),
            working_dir: cwd.clone(),
            container_id: container.map(str::to_string),
            script_file: Some(script.clone()),
        };

        let spawned = Command::new(language.interpreter())
            .arg(&script)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn();

        if spawned.is_err() {
            // No waiter will run for this record, so clean up here.
            let _ = std::fs::remove_file(&script);
        }
        self.finish_launch(spawned, info).await
    }

    async fn finish_launch(
        &self,
        spawned: std::io::Result<tokio::process::Child>,
        info: ProcessSpec,
    ) -> Result<String> {
        let name = info.name.clone();
        match spawned {
            Ok(child) => {
                let pid = child.id().unwrap_or_default();
                let command = info.command.clone();
                let id = self.supervisor.register(child, info).await;
                self.supervisor
                    .log(
                        &id,
                        LogChannel::System,
                        format!("Process started: {command} (PID: {pid})"),
                    )
                    .await;
                info!("started process '{name}' ({id}, pid {pid})");
                Ok(id)
            }
            Err(err) => {
                warn!("failed to spawn '{name}': {err}");
                let id = self.supervisor.register_failed(info, &err).await;
                Ok(id)
            }
        }
    }

    async fn capture(&self, mut cmd: Command, label: &str) -> Result<ExecOutput> {
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {label}"))?;

        match tokio::time::timeout(self.command_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(ExecOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code(),
                error: (!output.status.success()).then(|| output.status.to_string()),
            }),
            Ok(Err(err)) => Ok(ExecOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: None,
                error: Some(err.to_string()),
            }),
            // Dropping the wait future kills the child (kill_on_drop).
            Err(_) => Ok(ExecOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: None,
                error: Some(format!(
                    "command timed out after {}s",
                    self.command_timeout.as_secs()
                )),
            }),
        }
    }
}

fn default_command_name(command: &str) -> String {
    let head: String = command.chars().take(50).collect();
    format!("Command: {head}")
}

/// Write script code to a temporary file the interpreter can run.
fn write_script_file(language: ScriptLanguage, code: &str) -> Result<PathBuf> {
    let mut file = tempfile::Builder::new()
        .prefix("pterolite-")
        .suffix(language.extension())
        .tempfile()
        .context("creating script file")?;
    file.write_all(code.as_bytes())
        .context("writing script file")?;
    let (_, path) = file.keep().context("persisting script file")?;
    Ok(path)
}
