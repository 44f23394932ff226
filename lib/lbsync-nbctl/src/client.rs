//! Command execution against the northbound database

use crate::error::{NbctlError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Extra time the process gets beyond its own `--timeout` before it is killed
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Runs one northbound command and returns its trimmed standard output
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, args: &[String]) -> Result<String>;
}

/// [`CommandRunner`] that spawns the control utility
#[derive(Clone, Debug)]
pub struct NbctlClient {
    program: PathBuf,
    timeout: Duration,
}

impl NbctlClient {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn command_args(&self, args: &[String]) -> Vec<String> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(format!("--timeout={}", self.timeout.as_secs().max(1)));
        full.extend(args.iter().cloned());
        full
    }
}

#[async_trait]
impl CommandRunner for NbctlClient {
    async fn run(&self, args: &[String]) -> Result<String> {
        let full = self.command_args(args);
        debug!("Running {} {}", self.program.display(), full.join(" "));

        let output = Command::new(&self.program)
            .args(&full)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout + KILL_GRACE, output)
            .await
            .map_err(|_| NbctlError::Timeout(self.timeout))?
            .map_err(|source| NbctlError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(NbctlError::Failed {
                args: full.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_argument_comes_first() {
        let client = NbctlClient::new("ovn-nbctl", Duration::from_secs(15));
        let args = client.command_args(&["list".to_string(), "acl".to_string()]);
        assert_eq!(args, vec!["--timeout=15", "list", "acl"]);
    }

    #[test]
    fn test_sub_second_timeout_rounds_up() {
        let client = NbctlClient::new("ovn-nbctl", Duration::from_millis(200));
        assert_eq!(client.command_args(&[])[0], "--timeout=1");
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let client = NbctlClient::new("/nonexistent/ovn-nbctl", Duration::from_secs(1));
        let err = client.run(&["show".to_string()]).await.unwrap_err();
        assert!(matches!(err, NbctlError::Spawn { .. }));
    }
}
