//! Orchestration hooks run around listen and revoke
//!
//! A hook redirects cluster routing for a named service to the exposure
//! server (`hijack`) and puts it back afterwards (`restore`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Orchestration errors
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("Failed to run hook {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Hook {program} exited with {status}: {stderr}")]
    HookFailed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("Orchestration timed out after {0:?}")]
    Timeout(Duration),
}

/// Rewrites cluster routing for exposed services
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Route traffic for `service` to `app` on `port`
    async fn hijack(&self, service: &str, app: &str, port: u16) -> Result<(), OrchestrationError>;

    /// Undo a previous hijack of `service`
    async fn restore(&self, service: &str) -> Result<(), OrchestrationError>;
}

/// External program invoked as a hook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Runs configured programs as hooks.
///
/// The service, app and port are passed as `BACKHAUL_SERVICE`,
/// `BACKHAUL_APP` and `BACKHAUL_PORT`. A missing hook is a no-op.
#[derive(Debug, Clone, Default)]
pub struct ExecOrchestrator {
    hijack: Option<HookCommand>,
    restore: Option<HookCommand>,
}

impl ExecOrchestrator {
    pub fn new(hijack: Option<HookCommand>, restore: Option<HookCommand>) -> Self {
        Self { hijack, restore }
    }

    async fn run(hook: &HookCommand, envs: &[(&str, String)]) -> Result<(), OrchestrationError> {
        debug!(program = %hook.program, args = ?hook.args, "Running hook");

        let output = Command::new(&hook.program)
            .args(&hook.args)
            .envs(envs.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| OrchestrationError::Spawn {
                program: hook.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(OrchestrationError::HookFailed {
                program: hook.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Orchestrator for ExecOrchestrator {
    async fn hijack(&self, service: &str, app: &str, port: u16) -> Result<(), OrchestrationError> {
        let Some(hook) = &self.hijack else {
            return Ok(());
        };
        info!(%service, %app, port, "Hijacking service routing");
        Self::run(
            hook,
            &[
                ("BACKHAUL_SERVICE", service.to_string()),
                ("BACKHAUL_APP", app.to_string()),
                ("BACKHAUL_PORT", port.to_string()),
            ],
        )
        .await
    }

    async fn restore(&self, service: &str) -> Result<(), OrchestrationError> {
        let Some(hook) = &self.restore else {
            return Ok(());
        };
        info!(%service, "Restoring service routing");
        Self::run(hook, &[("BACKHAUL_SERVICE", service.to_string())]).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Option<HookCommand> {
        Some(HookCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        })
    }

    #[tokio::test]
    async fn test_hijack_passes_environment() {
        let orchestrator = ExecOrchestrator::new(
            sh(r#"test "$BACKHAUL_SERVICE" = web && test "$BACKHAUL_APP" = expose && test "$BACKHAUL_PORT" = 8080"#),
            None,
        );
        orchestrator.hijack("web", "expose", 8080).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_hook_reports_stderr() {
        let orchestrator = ExecOrchestrator::new(None, sh("echo no such service >&2; exit 3"));
        let err = orchestrator.restore("web").await.unwrap_err();
        match err {
            OrchestrationError::HookFailed { stderr, status, .. } => {
                assert_eq!(stderr, "no such service");
                assert_eq!(status.code(), Some(3));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let orchestrator = ExecOrchestrator::new(
            Some(HookCommand {
                program: "/nonexistent/backhaul-hook".to_string(),
                args: vec![],
            }),
            None,
        );
        let err = orchestrator.hijack("web", "expose", 80).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_unconfigured_hooks_are_noops() {
        let orchestrator = ExecOrchestrator::default();
        orchestrator.hijack("web", "expose", 80).await.unwrap();
        orchestrator.restore("web").await.unwrap();
    }
}
