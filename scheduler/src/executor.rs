use async_trait::async_trait;
use dashmap::DashMap;
use meshos_common::{MeshError, Pid, ProcessSpec, Result};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

/// Result of running a command to completion, or of detaching it
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    /// None while a background process is still running
    pub exit_code: Option<i32>,
    pub output: String,
}

/// Local process-execution collaborator. The real executor (namespaces,
/// cgroups, signal plumbing) is out of scope; the scheduler only needs
/// this surface.
#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    /// Run a command. Foreground commands block until exit; background
    /// commands return immediately and stay killable by pid.
    async fn execute(&self, pid: Pid, spec: &ProcessSpec) -> Result<ExecOutcome>;

    async fn kill(&self, pid: Pid) -> Result<()>;
}

/// Executor backed by host processes via tokio.
#[derive(Default)]
pub struct SystemExecutor {
    children: DashMap<Pid, Child>,
}

impl SystemExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessExecutor for SystemExecutor {
    async fn execute(&self, pid: Pid, spec: &ProcessSpec) -> Result<ExecOutcome> {
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        if spec.background {
            let child = command.spawn().map_err(|e| MeshError::ExecutionFailed {
                reason: format!("{}: {e}", spec.command),
            })?;
            debug!("spawned background process {pid} ({})", spec.command);
            self.children.insert(pid, child);
            return Ok(ExecOutcome {
                exit_code: None,
                output: String::new(),
            });
        }

        let output = command
            .output()
            .await
            .map_err(|e| MeshError::ExecutionFailed {
                reason: format!("{}: {e}", spec.command),
            })?;
        Ok(ExecOutcome {
            exit_code: output.status.code(),
            output: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }

    async fn kill(&self, pid: Pid) -> Result<()> {
        match self.children.remove(&pid) {
            Some((_, mut child)) => {
                child
                    .kill()
                    .await
                    .map_err(|e| MeshError::ExecutionFailed {
                        reason: format!("kill {pid}: {e}"),
                    })
            }
            None => Err(MeshError::ProcessNotFound { pid }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn foreground_command_captures_output() {
        let executor = SystemExecutor::new();
        let spec = ProcessSpec::new("echo", vec!["scheduled".into()]);

        let outcome = executor.execute(1, &spec).await.unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.output.trim(), "scheduled");
    }

    #[tokio::test]
    async fn background_command_can_be_killed() {
        let executor = SystemExecutor::new();
        let mut spec = ProcessSpec::new("sleep", vec!["30".into()]);
        spec.background = true;

        let outcome = executor.execute(2, &spec).await.unwrap();
        assert_eq!(outcome.exit_code, None);
        executor.kill(2).await.unwrap();
        assert!(matches!(
            executor.kill(2).await,
            Err(MeshError::ProcessNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn missing_binary_reports_execution_failure() {
        let executor = SystemExecutor::new();
        let spec = ProcessSpec::new("/nonexistent/bin", vec![]);
        assert!(matches!(
            executor.execute(3, &spec).await,
            Err(MeshError::ExecutionFailed { .. })
        ));
    }
}
