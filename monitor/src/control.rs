//! External collaborators: the guard daemon's lifecycle, the privileged
//! override helper and user notifications.
//!
//! The engine only consumes these as opaque operations and reacts to their
//! boolean or outcome result; failures never escalate past an outcome
//! message.

use std::path::Path;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::DaemonSettings;
use crate::model::{DenialRecord, OperationKind};

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("no command configured")]
    EmptyCommand,

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error(
        "{program} exited with {}",
        .code.map_or_else(|| "a signal".to_string(), |code| format!("code {code}"))
    )]
    Failed { program: String, code: Option<i32> },
}

/// Lifecycle of the guard daemon.
#[async_trait]
pub trait DaemonController: Send + Sync {
    /// Whether the daemon process is currently running.
    async fn is_running(&self) -> bool;

    /// Ask the service manager to restart the daemon.
    async fn restart(&self) -> Result<(), ControlError>;
}

/// [`DaemonController`] backed by `pgrep` and a configured restart command.
#[derive(Debug, Clone)]
pub struct ProcessController {
    process_name: String,
    restart_command: Vec<String>,
}

impl ProcessController {
    pub fn new(settings: &DaemonSettings) -> Self {
        Self {
            process_name: settings.process_name.clone(),
            restart_command: settings.restart_command.clone(),
        }
    }
}

#[async_trait]
impl DaemonController for ProcessController {
    async fn is_running(&self) -> bool {
        let args = ["-x".to_string(), self.process_name.clone()];
        match run_status("pgrep", &args).await {
            Ok(status) => status.success(),
            Err(e) => {
                tracing::debug!("Running-state check failed: {e}");
                false
            }
        }
    }

    async fn restart(&self) -> Result<(), ControlError> {
        let (program, args) = self
            .restart_command
            .split_first()
            .ok_or(ControlError::EmptyCommand)?;
        tracing::info!("Restarting daemon via {program}");
        check(program, run_status(program, args).await?)
    }
}

/// Apply an override through the privileged helper: `<helper> <path>`.
pub async fn run_override_helper(helper: &Path, path: &str) -> Result<(), ControlError> {
    let program = helper.display().to_string();
    tracing::info!("Applying override for {path} via {program}");
    let status = run_status(&program, &[path.to_string()]).await?;
    check(&program, status)
}

async fn run_status(program: &str, args: &[String]) -> Result<ExitStatus, ControlError> {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|source| ControlError::Spawn {
            program: program.to_string(),
            source,
        })
}

fn check(program: &str, status: ExitStatus) -> Result<(), ControlError> {
    if status.success() {
        Ok(())
    } else {
        Err(ControlError::Failed {
            program: program.to_string(),
            code: status.code(),
        })
    }
}

/// Receives user-facing alerts from the engine.
pub trait Notifier: Send + Sync {
    /// A denial arrived since the previous reload.
    fn denial(&self, record: &DenialRecord);

    /// A temporary override was removed by its expiry timer.
    fn override_expired(&self, path: &str);
}

/// Human-readable alert text for a denial.
pub fn denial_message(record: &DenialRecord) -> String {
    let action = match record.op {
        OperationKind::Delete => "deleting",
        OperationKind::Rename => "moving",
        OperationKind::Unknown => "modifying",
    };
    format!(
        "Blocked {} from {action} {}",
        record.ancestor,
        record.file_name()
    )
}

/// [`Notifier`] that writes alerts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn denial(&self, record: &DenialRecord) {
        tracing::warn!(
            zone = %record.zone,
            process = %record.process,
            "{}",
            denial_message(record)
        );
    }

    fn override_expired(&self, path: &str) {
        tracing::info!("Override expired, {path} is protected again");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(op: OperationKind) -> DenialRecord {
        DenialRecord {
            ts: 1,
            op,
            path: "/work/src/lib.rs".to_string(),
            dest: None,
            zone: "/work".to_string(),
            process: "rm".to_string(),
            ancestor: "codex".to_string(),
        }
    }

    #[test]
    fn denial_messages_name_agent_and_file() {
        assert_eq!(
            denial_message(&record(OperationKind::Delete)),
            "Blocked codex from deleting lib.rs"
        );
        assert_eq!(
            denial_message(&record(OperationKind::Rename)),
            "Blocked codex from moving lib.rs"
        );
    }

    #[test]
    fn exit_errors_describe_the_code() {
        let err = ControlError::Failed {
            program: "helper".to_string(),
            code: Some(2),
        };
        assert_eq!(err.to_string(), "helper exited with code 2");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn helper_exit_status_is_reported() {
        assert!(run_override_helper(Path::new("true"), "/x").await.is_ok());

        let err = run_override_helper(Path::new("false"), "/x")
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Failed { code: Some(1), .. }), "{err}");
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = run_override_helper(Path::new("/nonexistent/es-guard-override"), "/x")
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Spawn { .. }), "{err}");
    }

    #[tokio::test]
    async fn empty_restart_command_is_rejected() {
        let controller = ProcessController::new(&DaemonSettings {
            restart_command: Vec::new(),
            ..DaemonSettings::default()
        });
        assert!(matches!(
            controller.restart().await,
            Err(ControlError::EmptyCommand)
        ));
    }
}
