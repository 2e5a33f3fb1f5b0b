use serde::Serialize;
use std::fmt;
use std::path::Path;

use crate::error::{Result, SchedulerError};
use crate::runner::{CommandRunner, NativeCommand};

/// Directory systemd creates when it is running as PID 1.
const SYSTEMD_RUNTIME_DIR: &str = "run/systemd/system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    MacOs,
    Linux,
    Windows,
}

impl Platform {
    pub fn detect() -> Result<Self> {
        Self::from_os_name(std::env::consts::OS)
    }

    pub fn from_os_name(os: &str) -> Result<Self> {
        match os {
            "macos" => Ok(Platform::MacOs),
            "linux" => Ok(Platform::Linux),
            "windows" => Ok(Platform::Windows),
            other => Err(SchedulerError::UnsupportedPlatform(other.to_string())),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::MacOs => "macos",
            Platform::Linux => "linux",
            Platform::Windows => "windows",
        };
        write!(f, "{}", name)
    }
}

/// Whether a systemd user manager is available for the current user.
///
/// Absence is an expected outcome that routes to cron, so every failure
/// reads as `false`.
pub fn has_modern_init(runner: &dyn CommandRunner) -> bool {
    has_modern_init_at(Path::new("/"), runner)
}

pub fn has_modern_init_at(root: &Path, runner: &dyn CommandRunner) -> bool {
    if !root.join(SYSTEMD_RUNTIME_DIR).is_dir() {
        log::debug!("systemd is not PID 1; falling back to cron");
        return false;
    }

    let probe = NativeCommand::new("systemctl", ["--user", "show-environment"]);
    match runner.run(&probe) {
        Ok(out) if out.success() => true,
        Ok(out) => {
            log::debug!(
                "systemd user manager unavailable (exit {:?}): {}",
                out.code,
                out.stderr.trim()
            );
            false
        }
        Err(e) => {
            log::debug!("systemd user manager probe failed: {}", e);
            false
        }
    }
}

/// Everything the factory needs to know about the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostProbe {
    pub platform: Platform,
    pub modern_init: bool,
}

impl HostProbe {
    pub fn detect(runner: &dyn CommandRunner) -> Result<Self> {
        let platform = Platform::detect()?;
        let modern_init = platform == Platform::Linux && has_modern_init(runner);
        Ok(Self {
            platform,
            modern_init,
        })
    }
}
