//! One scheduling contract over four native OS facilities.
//!
//! The factory picks a backend once, from the host probe. Nothing above it
//! needs to know which OS it runs on, and nothing here caches OS state:
//! every query goes back to launchd, systemd, crontab or Task Scheduler.

pub mod cron;
pub mod launchd;
pub mod systemd;
pub mod windows;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Result, SchedulerError};
use crate::job::{JobName, ScheduleSpec};
use crate::platform::{HostProbe, Platform};
use crate::runner::CommandRunner;

pub use self::cron::CronScheduler;
pub use self::launchd::LaunchAgentScheduler;
pub use self::systemd::SystemdScheduler;
pub use self::windows::TaskScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulerKind {
    #[serde(rename = "launchd", alias = "launchagent")]
    LaunchAgent,
    #[serde(rename = "systemd")]
    SystemdTimer,
    #[serde(rename = "cron", alias = "crontab")]
    Cron,
    #[serde(rename = "taskschd", alias = "schtasks")]
    TaskScheduler,
}

impl SchedulerKind {
    /// macOS and Windows have exactly one backend. Linux prefers the systemd
    /// user manager and falls back to cron; there is no further chaining.
    pub fn select(probe: &HostProbe) -> Self {
        match probe.platform {
            Platform::MacOs => SchedulerKind::LaunchAgent,
            Platform::Linux if probe.modern_init => SchedulerKind::SystemdTimer,
            Platform::Linux => SchedulerKind::Cron,
            Platform::Windows => SchedulerKind::TaskScheduler,
        }
    }

    pub fn supported_on(&self, platform: Platform) -> bool {
        matches!(
            (self, platform),
            (SchedulerKind::LaunchAgent, Platform::MacOs)
                | (SchedulerKind::SystemdTimer, Platform::Linux)
                | (SchedulerKind::Cron, Platform::Linux)
                | (SchedulerKind::TaskScheduler, Platform::Windows)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            SchedulerKind::LaunchAgent => "launchd",
            SchedulerKind::SystemdTimer => "systemd",
            SchedulerKind::Cron => "cron",
            SchedulerKind::TaskScheduler => "taskschd",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            SchedulerKind::LaunchAgent => "macOS LaunchAgent",
            SchedulerKind::SystemdTimer => "systemd user timer",
            SchedulerKind::Cron => "user crontab",
            SchedulerKind::TaskScheduler => "Windows Task Scheduler",
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for SchedulerKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "launchd" | "launchagent" => Ok(SchedulerKind::LaunchAgent),
            "systemd" => Ok(SchedulerKind::SystemdTimer),
            "cron" | "crontab" => Ok(SchedulerKind::Cron),
            "taskschd" | "schtasks" => Ok(SchedulerKind::TaskScheduler),
            _ => Err(SchedulerError::InvalidSpec(format!(
                "unknown backend {:?} (expected launchd, systemd, cron or taskschd)",
                s
            ))),
        }
    }
}

/// Live snapshot of a job as the OS sees it. Never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub kind: SchedulerKind,
    pub installed: bool,
    pub running: bool,
    pub native_identifier: String,
    pub config_path: String,
    pub detail: Option<String>,
}

impl SchedulerStatus {
    /// The OS still holds a live registration but the artifact is gone,
    /// e.g. a plist deleted without `launchctl unload`.
    pub fn is_orphaned(&self) -> bool {
        self.running && !self.installed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UninstallOutcome {
    Removed,
    AlreadyAbsent,
}

/// A rendered native configuration object: where it lives and what it says.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerArtifact {
    pub location: String,
    pub content: String,
}

/// The uniform contract every backend implements.
///
/// `install` is idempotent: it removes any prior registration for the same
/// job before registering afresh. `uninstall` succeeds with
/// [`UninstallOutcome::AlreadyAbsent`] when nothing is installed.
pub trait Scheduler {
    fn kind(&self) -> SchedulerKind;

    fn job(&self) -> &JobName;

    /// Renders the artifacts `install` would write, without side effects.
    fn render(&self, spec: &ScheduleSpec) -> Result<Vec<SchedulerArtifact>>;

    fn install(&self, spec: &ScheduleSpec) -> Result<()>;

    fn uninstall(&self) -> Result<UninstallOutcome>;

    /// Whether the artifact exists, loaded or not.
    fn is_installed(&self) -> Result<bool>;

    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    fn status(&self) -> Result<SchedulerStatus>;
}

/// Per-user directories the file-based backends write into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerDirs {
    pub launch_agents: PathBuf,
    pub systemd_user: PathBuf,
    pub task_definitions: PathBuf,
}

impl SchedulerDirs {
    pub fn for_current_user() -> Result<Self> {
        Self::from_base_dirs(dirs::home_dir(), dirs::config_dir(), dirs::data_local_dir())
    }

    fn from_base_dirs(
        home: Option<PathBuf>,
        config: Option<PathBuf>,
        data: Option<PathBuf>,
    ) -> Result<Self> {
        let home = home.ok_or_else(|| {
            SchedulerError::UnsupportedPlatform(
                "no home directory for the current user".to_string(),
            )
        })?;
        let config = config.unwrap_or_else(|| home.join(".config"));
        let data = data.unwrap_or_else(|| home.join(".local").join("share"));

        Ok(Self {
            launch_agents: home.join("Library").join("LaunchAgents"),
            systemd_user: config.join("systemd").join("user"),
            task_definitions: data.join(crate::APP_DIR_NAME),
        })
    }

    /// Everything below one root; used by tests and relocated installs.
    pub fn under(root: &Path) -> Self {
        Self {
            launch_agents: root.join("Library").join("LaunchAgents"),
            systemd_user: root.join(".config").join("systemd").join("user"),
            task_definitions: root.join("AppData").join(crate::APP_DIR_NAME),
        }
    }
}

/// Probes the host and builds the matching backend.
pub fn create_scheduler(
    job: JobName,
    backend: Option<SchedulerKind>,
    runner: Arc<dyn CommandRunner>,
) -> Result<Box<dyn Scheduler>> {
    let probe = HostProbe::detect(runner.as_ref())?;
    let kind = match backend {
        Some(kind) if kind.supported_on(probe.platform) => kind,
        Some(kind) => {
            return Err(SchedulerError::UnsupportedPlatform(format!(
                "{} (backend {} is not available there)",
                probe.platform, kind
            )))
        }
        None => SchedulerKind::select(&probe),
    };
    log::debug!("host {:?} -> {} backend", probe, kind);
    Ok(create_for(kind, job, runner, SchedulerDirs::for_current_user()?))
}

/// Builds a backend without probing the host.
pub fn create_for(
    kind: SchedulerKind,
    job: JobName,
    runner: Arc<dyn CommandRunner>,
    dirs: SchedulerDirs,
) -> Box<dyn Scheduler> {
    match kind {
        SchedulerKind::LaunchAgent => {
            Box::new(LaunchAgentScheduler::new(job, dirs.launch_agents, runner))
        }
        SchedulerKind::SystemdTimer => {
            Box::new(SystemdScheduler::new(job, dirs.systemd_user, runner))
        }
        SchedulerKind::Cron => Box::new(CronScheduler::new(job, runner)),
        SchedulerKind::TaskScheduler => {
            Box::new(TaskScheduler::new(job, dirs.task_definitions, runner))
        }
    }
}

pub(crate) fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| SchedulerError::write_failed(dir, e))
}

pub(crate) fn write_file(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    fs::write(path, content).map_err(|e| SchedulerError::write_failed(path, e))?;
    log::info!("wrote {}", path.display());
    Ok(())
}

/// Removes a file, reporting whether it existed.
pub(crate) fn remove_file(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => {
            log::info!("removed {}", path.display());
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(SchedulerError::write_failed(path, e)),
    }
}

pub(crate) fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

pub(crate) fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
pub(crate) fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Unescaped text of every `<tag>...</tag>` in document order.
#[cfg(test)]
pub(crate) fn xml_values(content: &str, tag: &str) -> Vec<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut values = Vec::new();
    let mut rest = content;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(&close) else { break };
        values.push(xml_unescape(&after[..end]));
        rest = &after[end + close.len()..];
    }
    values
}
