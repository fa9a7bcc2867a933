//! External CLI invocation (sashi, evdevkit, mint scripts).
//!
//! Programs are spawned directly, never through a shell, and arguments are
//! rejected if they carry shell metacharacters.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("no command configured for {0}")]
    NotConfigured(&'static str),
    #[error("invalid characters in argument: {0}")]
    InvalidArgument(String),
    #[error("failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },
    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },
    #[error("{program} exited with {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Trait for running CLI tools, mockable in tests
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError>;
}

/// Runs programs with tokio::process under a fixed timeout
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError> {
        for arg in args {
            if arg.contains(';') || arg.contains('&') || arg.contains('|') || arg.contains('`') {
                return Err(CommandError::InvalidArgument(arg.clone()));
            }
        }

        debug!(program = %program, args = ?args, "running command");
        let child = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| CommandError::Timeout {
                program: program.to_string(),
                secs: self.timeout.as_secs(),
            })?
            .map_err(|e| CommandError::Spawn {
                program: program.to_string(),
                message: e.to_string(),
            })?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Substitute `{name}` placeholders in a configured argv template
pub fn render_template(template: &[String], vars: &HashMap<&str, String>) -> Vec<String> {
    template
        .iter()
        .map(|part| {
            vars.iter().fold(part.clone(), |acc, (k, v)| {
                acc.replace(&format!("{{{}}}", k), v)
            })
        })
        .collect()
}

/// Run a configured argv template, failing on a non-zero exit
pub async fn run_template(
    runner: &dyn CommandRunner,
    what: &'static str,
    template: &[String],
    vars: &HashMap<&str, String>,
) -> Result<CommandOutput, CommandError> {
    let argv = render_template(template, vars);
    let (program, args) = argv.split_first().ok_or(CommandError::NotConfigured(what))?;

    let output = runner.run(program, args).await?;
    if !output.success() {
        return Err(CommandError::Failed {
            program: program.clone(),
            code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output)
}
