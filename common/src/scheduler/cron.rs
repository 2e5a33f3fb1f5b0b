//! User crontab backend, the Linux fallback when no systemd user manager
//! is running.
//!
//! The entry is a marker comment followed by one cron line. Everything
//! else in the user's crontab is preserved across install and uninstall.

use std::sync::Arc;

use super::{
    ensure_dir, path_str, Scheduler, SchedulerArtifact, SchedulerKind, SchedulerStatus,
    UninstallOutcome,
};
use crate::error::{Result, SchedulerError};
use crate::invocation::Invocation;
use crate::job::{JobName, ScheduleSpec};
use crate::runner::{CommandRunner, NativeCommand};
use crate::schedule::Interval;

const MARKER_PREFIX: &str = "# cronagent:";
const CRON_LOG_FILE: &str = "cron.log";

pub struct CronScheduler {
    job: JobName,
    marker: String,
    runner: Arc<dyn CommandRunner>,
}

impl CronScheduler {
    pub fn new(job: JobName, runner: Arc<dyn CommandRunner>) -> Self {
        let marker = format!("{}{}", MARKER_PREFIX, job);
        Self {
            job,
            marker,
            runner,
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Current crontab text. A user without a crontab reads as empty.
    fn read_crontab(&self) -> Result<String> {
        let cmd = NativeCommand::new("crontab", ["-l"]);
        let out = self.runner.run(&cmd)?;
        if !out.success() && out.stderr.contains("no crontab for") {
            return Ok(String::new());
        }
        Ok(out.into_result(&cmd)?.stdout)
    }

    fn write_crontab(&self, content: &str) -> Result<()> {
        let cmd = NativeCommand::new("crontab", ["-"]).with_stdin(content);
        self.runner.run(&cmd)?.into_result(&cmd)?;
        Ok(())
    }

    fn render_entry(&self, spec: &ScheduleSpec) -> Result<String> {
        let expr = cron_expression(spec.interval())?;
        let invocation = Invocation::from_spec(spec);
        let command = invocation
            .argv()
            .iter()
            .map(|arg| sh_quote(arg))
            .collect::<Vec<_>>()
            .join(" ");
        let log = spec.log_dir().join(CRON_LOG_FILE);

        let line = format!(
            "{} cd {} && {} >> {} 2>&1",
            expr,
            sh_quote(&invocation.working_dir_str()),
            command,
            sh_quote(&path_str(&log)),
        );
        // cron turns a bare `%` into a newline before the shell sees it.
        Ok(format!("{}\n{}\n", self.marker, line.replace('%', "\\%")))
    }

    /// Drops this job's marker, and the line after it when that line is
    /// one of ours. A marker whose entry was edited away is dropped alone.
    fn strip_entry(&self, crontab: &str) -> Stripped {
        let mut stripped = Stripped::default();
        let mut lines = crontab.lines().peekable();
        while let Some(line) = lines.next() {
            if line.trim_end() == self.marker {
                stripped.marker_found = true;
                if lines.peek().map_or(false, |next| is_own_line(next)) {
                    stripped.entry_found = true;
                    lines.next();
                }
                continue;
            }
            stripped.crontab.push_str(line);
            stripped.crontab.push('\n');
        }
        stripped
    }

    /// The cron line registered for this job, if its marker and line are
    /// both present.
    fn find_entry<'a>(&self, crontab: &'a str) -> Option<&'a str> {
        let mut lines = crontab.lines();
        lines.find(|line| line.trim_end() == self.marker)?;
        lines.next().filter(|line| is_own_line(line))
    }
}

#[derive(Debug, Default)]
struct Stripped {
    crontab: String,
    marker_found: bool,
    entry_found: bool,
}

/// Lines written by `render_entry` end with the redirection into the job's
/// cron log.
fn is_own_line(line: &str) -> bool {
    line.trim_end()
        .ends_with(&format!("/{}' 2>&1", CRON_LOG_FILE))
}

impl Scheduler for CronScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Cron
    }

    fn job(&self) -> &JobName {
        &self.job
    }

    fn render(&self, spec: &ScheduleSpec) -> Result<Vec<SchedulerArtifact>> {
        spec.validate()?;
        Ok(vec![SchedulerArtifact {
            location: crontab_location(),
            content: self.render_entry(spec)?,
        }])
    }

    fn install(&self, spec: &ScheduleSpec) -> Result<()> {
        spec.validate()?;
        let entry = self.render_entry(spec)?;
        ensure_dir(&spec.log_dir())?;

        let stripped = self.strip_entry(&self.read_crontab()?);
        if stripped.entry_found {
            log::info!("replacing existing crontab entry for {}", self.job);
        }
        let mut crontab = stripped.crontab;
        crontab.push_str(&entry);
        self.write_crontab(&crontab)?;

        log::info!("crontab entry for {} installed, runs every {}", self.job, spec.interval());
        Ok(())
    }

    fn uninstall(&self) -> Result<UninstallOutcome> {
        let stripped = self.strip_entry(&self.read_crontab()?);
        if stripped.marker_found {
            self.write_crontab(&stripped.crontab)?;
        }
        if !stripped.entry_found {
            log::info!("no crontab entry for {}", self.job);
            return Ok(UninstallOutcome::AlreadyAbsent);
        }
        log::info!("removed crontab entry for {}", self.job);
        Ok(UninstallOutcome::Removed)
    }

    fn is_installed(&self) -> Result<bool> {
        Ok(self.find_entry(&self.read_crontab()?).is_some())
    }

    /// A crontab entry is active for as long as it exists.
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        log::warn!("cron has no paused state; uninstall {} to stop it", self.job);
        Ok(())
    }

    fn status(&self) -> Result<SchedulerStatus> {
        let crontab = self.read_crontab()?;
        let detail = self.find_entry(&crontab).map(str::to_string);
        let installed = detail.is_some();

        Ok(SchedulerStatus {
            kind: self.kind(),
            installed,
            running: installed,
            native_identifier: self.marker.clone(),
            config_path: crontab_location(),
            detail,
        })
    }
}

/// Maps an interval onto a five-field cron expression.
///
/// Only intervals that repeat evenly within the hour or the day are
/// accepted. Anything else would drift at the boundary, and rounding is
/// left to the caller.
pub fn cron_expression(interval: Interval) -> Result<String> {
    let unsupported = |reason: &str| SchedulerError::UnsupportedInterval {
        interval_secs: interval.as_secs(),
        backend: SchedulerKind::Cron.name(),
        reason: reason.to_string(),
    };

    let minutes = interval
        .whole_minutes()
        .ok_or_else(|| unsupported("cron runs at most once per minute, in whole minutes"))?;

    match minutes {
        1 => Ok("* * * * *".to_string()),
        60 => Ok("0 * * * *".to_string()),
        m if m < 60 && 60 % m == 0 => Ok(format!("*/{} * * * *", m)),
        m if m % 60 == 0 => match m / 60 {
            24 => Ok("0 0 * * *".to_string()),
            h if h < 24 && 24 % h == 0 => Ok(format!("0 */{} * * *", h)),
            _ => Err(unsupported("hourly intervals must divide 24")),
        },
        _ => Err(unsupported(
            "minute intervals must divide 60, longer ones must be whole hours",
        )),
    }
}

/// POSIX single-quoting; the result is one shell word.
fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn crontab_location() -> String {
    format!("crontab:{}", current_user())
}

#[cfg(unix)]
fn current_user() -> String {
    use nix::unistd::{getuid, User};

    match User::from_uid(getuid()) {
        Ok(Some(user)) => user.name,
        _ => std::env::var("USER").unwrap_or_else(|_| getuid().to_string()),
    }
}

#[cfg(not(unix))]
fn current_user() -> String {
    std::env::var("USERNAME").unwrap_or_else(|_| "unknown".to_string())
}

/// Recovers the worker argv from a rendered entry: the words between
/// `cd <dir> &&` and the `>>` redirection.
#[cfg(test)]
pub(crate) fn parse_command_argv(entry: &str) -> Vec<String> {
    let line = entry
        .lines()
        .find(|l| !l.starts_with('#'))
        .expect("cron line")
        .replace("\\%", "%");
    let words = shell_words(&line);
    let start = words.iter().position(|w| w == "&&").expect("&&") + 1;
    let end = words.iter().position(|w| w == ">>").expect(">>");
    words[start..end].to_vec()
}

#[cfg(test)]
fn shell_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut started = false;
    let mut in_quotes = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_quotes = !in_quotes;
                started = true;
            }
            _ if in_quotes => current.push(c),
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    started = true;
                }
            }
            c if c.is_whitespace() => {
                if started {
                    words.push(std::mem::take(&mut current));
                    started = false;
                }
            }
            c => {
                current.push(c);
                started = true;
            }
        }
    }
    if started {
        words.push(current);
    }
    words
}
