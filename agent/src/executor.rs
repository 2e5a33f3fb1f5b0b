use async_trait::async_trait;
use common::config::ExecutorConfig;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{program} exited with {}: {stderr}", exit_description(.code))]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

/// Answers one prompt.
#[async_trait]
pub trait Assistant: Send + Sync {
    async fn ask(&self, prompt: &str) -> Result<String, ExecError>;
}

/// An AI command-line tool, run once per prompt with the prompt as its
/// last argument.
pub struct AiCli {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    working_dir: Option<PathBuf>,
}

impl AiCli {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            working_dir: None,
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(
            config.program.clone(),
            config.args.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl Assistant for AiCli {
    async fn ask(&self, prompt: &str) -> Result<String, ExecError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(prompt)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        log::debug!("running {} {:?}", self.program, self.args);
        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result.map_err(|source| ExecError::Spawn {
                program: self.program.clone(),
                source,
            })?,
            Err(_) => {
                return Err(ExecError::Timeout {
                    program: self.program.clone(),
                    timeout: self.timeout,
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ExecError::Failed {
                program: self.program.clone(),
                code: output.status.code(),
                stderr: if stderr.is_empty() { stdout } else { stderr },
            });
        }
        Ok(stdout)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> AiCli {
        // `sh -c script sh <prompt>` exposes the prompt as $1.
        AiCli::new(
            "sh",
            vec!["-c".into(), script.into(), "sh".into()],
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_prompt_is_last_argument() {
        let answer = sh("echo \"answer to: $1\"").ask("what's new?").await.unwrap();
        assert_eq!(answer, "answer to: what's new?");
    }

    #[tokio::test]
    async fn test_prompt_is_not_shell_expanded() {
        let answer = sh("printf '%s' \"$1\"").ask("$(rm -rf ~); `id`").await.unwrap();
        assert_eq!(answer, "$(rm -rf ~); `id`");
    }

    #[tokio::test]
    async fn test_runs_in_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let answer = sh("pwd")
            .with_working_dir(dir.path())
            .ask("ignored")
            .await
            .unwrap();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(PathBuf::from(answer).canonicalize().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let err = sh("echo 'not logged in' >&2; exit 3").ask("x").await.unwrap_err();
        match err {
            ExecError::Failed { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "not logged in");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout() {
        let cli = AiCli::new("sleep", vec![], Duration::from_millis(200));
        let err = cli.ask("5").await.unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }), "{}", err);
    }

    #[tokio::test]
    async fn test_missing_program() {
        let cli = AiCli::new("/nonexistent/cronagent-ai", vec![], Duration::from_secs(1));
        let err = cli.ask("hi").await.unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }), "{}", err);
    }
}
