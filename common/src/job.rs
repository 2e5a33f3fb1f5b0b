use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, SchedulerError};
use crate::schedule::Interval;

pub const DEFAULT_JOB_NAME: &str = "cronagent";

/// Name of a scheduled job. Ends up in file names, unit names, crontab
/// markers and task names, so only `[A-Za-z0-9_-]` is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobName(String);

impl JobName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(SchedulerError::InvalidSpec(format!(
                "job name {:?} may only contain letters, digits, '-' and '_'",
                name
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobName {
    fn default() -> Self {
        Self(DEFAULT_JOB_NAME.to_string())
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobName {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for JobName {
    type Error = SchedulerError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<JobName> for String {
    fn from(name: JobName) -> Self {
        name.0
    }
}

/// What to install: the worker command line and how often the OS runs it.
///
/// Built once per install call and never mutated. The rendered native
/// artifact is the only persisted form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSpec {
    interpreter: PathBuf,
    script: Option<PathBuf>,
    interval: Interval,
    working_dir: PathBuf,
    extra_args: Vec<String>,
}

impl ScheduleSpec {
    pub fn new(
        interpreter: impl Into<PathBuf>,
        interval: Interval,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            interpreter: interpreter.into(),
            script: None,
            interval,
            working_dir: working_dir.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.script = Some(script.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn interpreter(&self) -> &Path {
        &self.interpreter
    }

    pub fn script(&self) -> Option<&Path> {
        self.script.as_deref()
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn extra_args(&self) -> &[String] {
        &self.extra_args
    }

    /// Where the OS-level stdout/stderr of the worker ends up.
    pub fn log_dir(&self) -> PathBuf {
        self.working_dir.join(crate::LOG_DIR)
    }

    /// Paths must be absolute and valid UTF-8: every artifact is text and
    /// is evaluated from a different working directory than the installer's.
    pub fn validate(&self) -> Result<()> {
        check_path("interpreter", &self.interpreter)?;
        if let Some(script) = &self.script {
            check_path("script", script)?;
        }
        check_path("working directory", &self.working_dir)?;
        if let Some(arg) = self.extra_args.iter().find(|a| a.contains('\n') || a.contains('\0')) {
            return Err(SchedulerError::InvalidSpec(format!(
                "argument {:?} contains a line break or NUL byte",
                arg
            )));
        }
        Ok(())
    }
}

fn check_path(what: &str, path: &Path) -> Result<()> {
    let text = path.to_str().ok_or_else(|| {
        SchedulerError::InvalidSpec(format!("{} path {} is not valid UTF-8", what, path.display()))
    })?;
    if !path.is_absolute() {
        return Err(SchedulerError::InvalidSpec(format!(
            "{} path {} must be absolute",
            what, text
        )));
    }
    if text.contains('\n') || text.contains('\0') {
        return Err(SchedulerError::InvalidSpec(format!(
            "{} path {:?} contains a line break or NUL byte",
            what, text
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abs(p: &str) -> PathBuf {
        if cfg!(windows) {
            PathBuf::from(format!("C:{}", p.replace('/', "\\")))
        } else {
            PathBuf::from(p)
        }
    }

    #[test]
    fn test_job_name_validation() {
        assert!(JobName::new("cronagent").is_ok());
        assert!(JobName::new("agent_2-b").is_ok());
        assert!(JobName::new("").is_err());
        assert!(JobName::new("my agent").is_err());
        assert!(JobName::new("../etc").is_err());
        assert_eq!(JobName::default().as_str(), DEFAULT_JOB_NAME);
    }

    #[test]
    fn test_valid_spec() {
        let spec = ScheduleSpec::new(abs("/usr/bin/python3"), Interval::default(), abs("/opt/agent"))
            .with_script(abs("/opt/agent/run.py"))
            .with_args(["--verbose"]);
        spec.validate().unwrap();
        assert_eq!(spec.interval().as_secs(), 300);
        assert_eq!(spec.log_dir(), abs("/opt/agent").join("logs"));
        assert_eq!(spec.extra_args(), ["--verbose".to_string()]);
    }

    #[test]
    fn test_relative_paths_rejected() {
        let spec = ScheduleSpec::new("python3", Interval::default(), abs("/opt/agent"));
        let err = spec.validate().unwrap_err();
        assert_eq!(err.kind(), "invalid_spec");

        let spec = ScheduleSpec::new(abs("/usr/bin/python3"), Interval::default(), "agent");
        assert!(spec.validate().is_err());

        let spec = ScheduleSpec::new(abs("/usr/bin/python3"), Interval::default(), abs("/opt"))
            .with_script("run.py");
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_line_breaks_rejected() {
        let spec = ScheduleSpec::new(abs("/usr/bin/python3"), Interval::default(), abs("/opt"))
            .with_args(["a\nb"]);
        assert!(spec.validate().is_err());
    }
}
