use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = SchedulerError> = std::result::Result<T, E>;

/// Failure kinds surfaced by the scheduler layer.
///
/// Every variant carries the native message verbatim so the CLI can print it
/// without further context. Nothing in this layer retries.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unsupported operating system: {0}")]
    UnsupportedPlatform(String),

    #[error("`{command}` failed{}: {stderr}", exit_suffix(.code))]
    NativeCommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("failed to write {}: {source}", .path.display())]
    ArtifactWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("interval of {interval_secs}s is not supported by {backend}: {reason}")]
    UnsupportedInterval {
        interval_secs: u64,
        backend: &'static str,
        reason: String,
    },

    #[error("invalid schedule: {0}")]
    InvalidSpec(String),

    #[error("{0} is not installed; run `cronagent install` first")]
    NotInstalled(String),
}

impl SchedulerError {
    /// Stable snake_case name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerError::UnsupportedPlatform(_) => "unsupported_platform",
            SchedulerError::NativeCommandFailed { .. } => "native_command_failed",
            SchedulerError::ArtifactWriteFailed { .. } => "artifact_write_failed",
            SchedulerError::UnsupportedInterval { .. } => "unsupported_interval",
            SchedulerError::InvalidSpec(_) => "invalid_spec",
            SchedulerError::NotInstalled(_) => "not_installed",
        }
    }

    pub(crate) fn write_failed(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SchedulerError::ArtifactWriteFailed {
            path: path.into(),
            source,
        }
    }
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with exit code {}", code),
        None => String::new(),
    }
}
