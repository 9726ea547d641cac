//! Process supervision for panel-launched commands and scripts.
//!
//! Keeps a registry of spawned child processes, captures their output into
//! bounded per-process buffers, and converges every record to a terminal
//! status even when the first termination signal is ignored or an exit
//! notification is missed.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::Mutex;
use uuid::Uuid;

mod log_buffer;

pub use log_buffer::{LogBuffer, LogChannel, LogEntry, MAX_ENTRIES};

/// Default number of entries returned by log queries.
pub const DEFAULT_LOG_LIMIT: usize = 100;

/// Grace period between SIGTERM and the SIGKILL escalation.
const KILL_GRACE: Duration = Duration::from_secs(3);

/// Exit code recorded when the sweep corrects a stale record.
const SWEEP_EXIT_CODE: i32 = -1;

/// What kind of workload a process record represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    Command,
    Javascript,
    Python,
}

/// Launch information for a registered process. Immutable after
/// registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Human-readable name shown in listings.
    pub name: String,
    pub kind: ProcessKind,
    /// The command line the process was started with.
    pub command: String,
    pub working_dir: PathBuf,
    /// Container scope the process belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Temporary script file removed once the process ends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_file: Option<PathBuf>,
}

/// Lifecycle status of a supervised process.
///
/// Terminal statuses stick, with one exception: a process-exit event
/// overwrites `Killed` with `Finished`, since the exit is authoritative
/// proof the OS process is gone while `Killed` only records that a
/// signal was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Finished,
    Error,
    Killed,
}

impl ProcessStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Registry-facing view of one process. Never exposes the OS handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSummary {
    pub id: String,
    pub info: ProcessSpec,
    pub status: ProcessStatus,
    pub start_time: DateTime<Utc>,
    pub exit_code: Option<i32>,
}

struct ProcessRecord {
    pid: Option<u32>,
    info: ProcessSpec,
    status: ProcessStatus,
    exit_code: Option<i32>,
    start_time: DateTime<Utc>,
    logs: LogBuffer,
}

/// How a signal reached its target.
enum Delivery {
    Group,
    Single,
    Failed(std::io::Error),
}

/// Registry of supervised processes.
///
/// Cloning is cheap and shares the underlying registry.
#[derive(Default)]
pub struct ProcessSupervisor {
    registry: Arc<Mutex<HashMap<String, ProcessRecord>>>,
}

impl Clone for ProcessSupervisor {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly spawned child.
    ///
    /// The record starts in `Running`. The child handle is owned by the
    /// supervisor's waiter task from here on; callers keep only the
    /// returned id. Output is captured line-wise on the stdout and stderr
    /// channels; the waiter records the exit and removes the launch
    /// info's temporary script file, if any.
    pub async fn register(&self, mut child: Child, info: ProcessSpec) -> String {
        let id = Uuid::new_v4().to_string();
        let pid = child.id();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let script_file = info.script_file.clone();

        {
            let mut registry = self.registry.lock().await;
            registry.insert(
                id.clone(),
                ProcessRecord {
                    pid,
                    info,
                    status: ProcessStatus::Running,
                    exit_code: None,
                    start_time: Utc::now(),
                    logs: LogBuffer::new(),
                },
            );
        }

        if let Some(stdout) = stdout {
            self.spawn_reader(id.clone(), LogChannel::Stdout, stdout);
        }
        if let Some(stderr) = stderr {
            self.spawn_reader(id.clone(), LogChannel::Stderr, stderr);
        }

        let supervisor = self.clone();
        let waiter_id = id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => supervisor.on_exit(&waiter_id, status).await,
                Err(err) => supervisor.on_wait_error(&waiter_id, &err).await,
            }
            if let Some(script) = script_file {
                if let Err(err) = tokio::fs::remove_file(&script).await {
                    debug!("could not remove script file {}: {err}", script.display());
                }
            }
        });

        debug!("registered process {id} (pid {pid:?})");
        id
    }

    /// Register a spawn attempt that failed at handle creation.
    ///
    /// The record starts in `Error` so callers can inspect what happened
    /// through the normal listing and log queries.
    pub async fn register_failed(&self, info: ProcessSpec, err: &std::io::Error) -> String {
        let id = Uuid::new_v4().to_string();
        let mut logs = LogBuffer::new();
        logs.push(LogChannel::Error, format!("Process error: {err}"));

        let mut registry = self.registry.lock().await;
        registry.insert(
            id.clone(),
            ProcessRecord {
                pid: None,
                info,
                status: ProcessStatus::Error,
                exit_code: None,
                start_time: Utc::now(),
                logs,
            },
        );

        warn!("registered failed spawn {id}: {err}");
        id
    }

    /// Append a log entry to a process's buffer. Unknown ids are ignored.
    pub async fn log(&self, id: &str, channel: LogChannel, text: impl Into<String>) {
        let mut registry = self.registry.lock().await;
        if let Some(record) = registry.get_mut(id) {
            record.logs.push(channel, text);
        }
    }

    /// Point-in-time snapshot of the most recent `limit` entries for a
    /// process. Unknown ids yield an empty snapshot.
    pub async fn logs(&self, id: &str, limit: usize) -> Vec<LogEntry> {
        let registry = self.registry.lock().await;
        registry
            .get(id)
            .map(|record| record.logs.tail(limit))
            .unwrap_or_default()
    }

    /// Summaries of every registered process.
    pub async fn list(&self) -> HashMap<String, ProcessSummary> {
        let registry = self.registry.lock().await;
        registry
            .iter()
            .map(|(id, record)| {
                (
                    id.clone(),
                    ProcessSummary {
                        id: id.clone(),
                        info: record.info.clone(),
                        status: record.status,
                        start_time: record.start_time,
                        exit_code: record.exit_code,
                    },
                )
            })
            .collect()
    }

    /// Send SIGTERM to a running process, preferring its whole process
    /// group, and schedule the SIGKILL escalation.
    ///
    /// Returns `true` once a signal was delivered; delivery, not process
    /// death, is the success criterion. Unknown ids and records that are
    /// no longer running are a `false` no-op.
    pub async fn kill(&self, id: &str) -> bool {
        let pid = {
            let mut registry = self.registry.lock().await;
            let Some(record) = registry.get_mut(id) else {
                return false;
            };
            if record.status != ProcessStatus::Running {
                return false;
            }
            let Some(pid) = record.pid else {
                record
                    .logs
                    .push(LogChannel::Error, "Failed to kill process: pid unknown");
                return false;
            };

            match signal(pid, libc::SIGTERM) {
                Delivery::Group => record.logs.push(
                    LogChannel::System,
                    format!("Process group killed (SIGTERM) - PID: {pid}"),
                ),
                Delivery::Single => record.logs.push(
                    LogChannel::System,
                    format!("Individual process killed (SIGTERM) - PID: {pid}"),
                ),
                Delivery::Failed(err) => {
                    record
                        .logs
                        .push(LogChannel::Error, format!("Failed to kill process: {err}"));
                    return false;
                }
            }
            record.status = ProcessStatus::Killed;
            pid
        };

        info!("sent SIGTERM to process {id} (pid {pid})");

        let supervisor = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(KILL_GRACE).await;
            supervisor.escalate(&id, pid).await;
        });

        true
    }

    /// Liveness probe independent of the cached status field.
    pub async fn is_alive(&self, id: &str) -> bool {
        let registry = self.registry.lock().await;
        registry
            .get(id)
            .and_then(|record| record.pid)
            .is_some_and(process_exists)
    }

    /// Reconcile records whose cached status is `Running` but whose OS
    /// process has already disappeared (missed exit events, supervisor
    /// restarts). Such records become `Finished` with a sentinel exit
    /// code. Safe to call repeatedly and concurrently with normal event
    /// handling.
    pub async fn sweep(&self) {
        let mut registry = self.registry.lock().await;
        for (id, record) in registry.iter_mut() {
            if record.status != ProcessStatus::Running {
                continue;
            }
            if record.pid.is_some_and(process_exists) {
                continue;
            }
            record.status = ProcessStatus::Finished;
            record.exit_code = Some(SWEEP_EXIT_CODE);
            record
                .logs
                .push(LogChannel::System, "Process detected as finished (cleanup)");
            warn!("process {id} was dead, status corrected by sweep");
        }
    }

    /// Drop a process record and its logs.
    ///
    /// A still-running process gets one best-effort SIGKILL first;
    /// delivery failure is logged, not raised. Removing an unknown id is
    /// a no-op.
    pub async fn remove(&self, id: &str) {
        let mut registry = self.registry.lock().await;
        if let Some(record) = registry.get(id) {
            if record.status == ProcessStatus::Running {
                if let Some(pid) = record.pid {
                    match signal(pid, libc::SIGKILL) {
                        Delivery::Group | Delivery::Single => {
                            debug!("force killed process {id} (pid {pid}) during removal");
                        }
                        Delivery::Failed(err) => {
                            warn!("failed to kill process {id} during removal: {err}");
                        }
                    }
                }
            }
        }
        registry.remove(id);
    }

    fn spawn_reader(
        &self,
        id: String,
        channel: LogChannel,
        stream: impl AsyncRead + Unpin + Send + 'static,
    ) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                supervisor.log(&id, channel, line).await;
            }
        });
    }

    async fn on_exit(&self, id: &str, status: std::process::ExitStatus) {
        let mut registry = self.registry.lock().await;
        let Some(record) = registry.get_mut(id) else {
            return;
        };
        // The exit event wins over an optimistic Killed: the process is
        // demonstrably gone.
        record.status = ProcessStatus::Finished;
        record.exit_code = status.code();
        match status.code() {
            Some(code) => record.logs.push(
                LogChannel::System,
                format!("Process finished with exit code: {code}"),
            ),
            None => record
                .logs
                .push(LogChannel::System, format!("Process finished: {status}")),
        }
    }

    async fn on_wait_error(&self, id: &str, err: &std::io::Error) {
        let mut registry = self.registry.lock().await;
        let Some(record) = registry.get_mut(id) else {
            return;
        };
        if !record.status.is_terminal() {
            record.status = ProcessStatus::Error;
        }
        record
            .logs
            .push(LogChannel::Error, format!("Process error: {err}"));
    }

    /// Deferred SIGKILL for a process that ignored SIGTERM.
    ///
    /// Re-reads the record at the deadline: if the exit event already
    /// flipped the status to `Finished`, the pid may have been recycled
    /// and must not be signalled again.
    async fn escalate(&self, id: &str, pid: u32) {
        let mut registry = self.registry.lock().await;
        let Some(record) = registry.get_mut(id) else {
            return;
        };
        if record.status != ProcessStatus::Killed {
            return;
        }

        match signal(pid, libc::SIGKILL) {
            Delivery::Group => record.logs.push(
                LogChannel::System,
                format!("Process group force killed (SIGKILL) - PID: {pid}"),
            ),
            Delivery::Single => record.logs.push(
                LogChannel::System,
                format!("Individual process force killed (SIGKILL) - PID: {pid}"),
            ),
            Delivery::Failed(err) => record.logs.push(
                LogChannel::Error,
                format!("Failed to force kill process: {err}"),
            ),
        }
    }
}

/// Deliver `sig` to the process group led by `pid`, falling back to the
/// process itself when the group signal cannot be delivered.
fn signal(pid: u32, sig: libc::c_int) -> Delivery {
    let pid = pid as libc::pid_t;
    // Negative pid addresses the whole process group.
    if unsafe { libc::kill(-pid, sig) } == 0 {
        return Delivery::Group;
    }
    if unsafe { libc::kill(pid, sig) } == 0 {
        return Delivery::Single;
    }
    Delivery::Failed(std::io::Error::last_os_error())
}

/// Signal-0 existence probe.
fn process_exists(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}
