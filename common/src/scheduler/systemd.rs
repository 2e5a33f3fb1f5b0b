//! systemd user timer backend.
//!
//! Installs `<job>.service` (oneshot) and `<job>.timer` into the user unit
//! directory and drives them with `systemctl --user`. A oneshot unit is
//! never started again while it is still activating, so runs cannot overlap.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{
    ensure_dir, path_str, remove_file, write_file, Scheduler, SchedulerArtifact, SchedulerKind,
    SchedulerStatus, UninstallOutcome,
};
use crate::error::{Result, SchedulerError};
use crate::invocation::Invocation;
use crate::job::{JobName, ScheduleSpec};
use crate::runner::{CommandOutput, CommandRunner, NativeCommand};

const TIMERS_WANTS_DIR: &str = "timers.target.wants";

pub struct SystemdScheduler {
    job: JobName,
    unit_dir: PathBuf,
    service_path: PathBuf,
    timer_path: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl SystemdScheduler {
    pub fn new(job: JobName, unit_dir: PathBuf, runner: Arc<dyn CommandRunner>) -> Self {
        let service_path = unit_dir.join(format!("{}.service", job));
        let timer_path = unit_dir.join(format!("{}.timer", job));
        Self {
            job,
            unit_dir,
            service_path,
            timer_path,
            runner,
        }
    }

    pub fn service_path(&self) -> &Path {
        &self.service_path
    }

    pub fn timer_path(&self) -> &Path {
        &self.timer_path
    }

    fn service_unit(&self) -> String {
        format!("{}.service", self.job)
    }

    fn timer_unit(&self) -> String {
        format!("{}.timer", self.job)
    }

    /// Left behind by `enable` when the unit file is deleted by hand.
    fn wants_link(&self) -> PathBuf {
        self.unit_dir.join(TIMERS_WANTS_DIR).join(self.timer_unit())
    }

    fn systemctl(&self, args: &[&str]) -> Result<CommandOutput> {
        let args = std::iter::once("--user").chain(args.iter().copied());
        self.runner.run(&NativeCommand::new("systemctl", args))
    }

    fn systemctl_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let cmd = NativeCommand::new(
            "systemctl",
            std::iter::once("--user").chain(args.iter().copied()),
        );
        self.runner.run(&cmd)?.into_result(&cmd)
    }

    fn is_active(&self) -> Result<bool> {
        let out = self.systemctl(&["is-active", &self.timer_unit()])?;
        Ok(out.stdout.trim() == "active")
    }

    fn any_artifact_exists(&self) -> bool {
        self.service_path.exists() || self.timer_path.exists()
    }

    fn render_service(&self, spec: &ScheduleSpec) -> String {
        let invocation = Invocation::from_spec(spec);
        let exec_start = invocation
            .argv()
            .iter()
            .map(|arg| quote_exec_arg(arg))
            .collect::<Vec<_>>()
            .join(" ");
        let log_dir = spec.log_dir();

        format!(
            "[Unit]
Description=cronagent worker ({job})
After=network.target

[Service]
Type=oneshot
WorkingDirectory={workdir}
ExecStart={exec_start}
StandardOutput=append:{stdout}
StandardError=append:{stderr}
",
            job = self.job,
            workdir = escape_specifiers(&invocation.working_dir_str()),
            exec_start = exec_start,
            stdout = escape_specifiers(&path_str(&log_dir.join("stdout.log"))),
            stderr = escape_specifiers(&path_str(&log_dir.join("stderr.log"))),
        )
    }

    fn render_timer(&self, spec: &ScheduleSpec) -> String {
        format!(
            "[Unit]
Description=Run cronagent worker ({job}) every {interval}

[Timer]
OnBootSec=1min
OnUnitActiveSec={secs}s
AccuracySec=1s
Persistent=true
Unit={service}

[Install]
WantedBy=timers.target
",
            job = self.job,
            interval = spec.interval(),
            secs = spec.interval().as_secs(),
            service = self.service_unit(),
        )
    }
}

impl Scheduler for SystemdScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::SystemdTimer
    }

    fn job(&self) -> &JobName {
        &self.job
    }

    fn render(&self, spec: &ScheduleSpec) -> Result<Vec<SchedulerArtifact>> {
        spec.validate()?;
        Ok(vec![
            SchedulerArtifact {
                location: path_str(&self.service_path),
                content: self.render_service(spec),
            },
            SchedulerArtifact {
                location: path_str(&self.timer_path),
                content: self.render_timer(spec),
            },
        ])
    }

    fn install(&self, spec: &ScheduleSpec) -> Result<()> {
        let artifacts = self.render(spec)?;
        let timer = self.timer_unit();

        if self.any_artifact_exists() {
            log::info!("replacing existing {}", timer);
            match self.systemctl(&["disable", "--now", &timer]) {
                Ok(out) if !out.success() => {
                    log::warn!("could not disable previous {}: {}", timer, out.stderr.trim())
                }
                Err(e) => log::warn!("could not disable previous {}: {}", timer, e),
                Ok(_) => {}
            }
        }

        ensure_dir(&spec.log_dir())?;
        for artifact in &artifacts {
            write_file(Path::new(&artifact.location), artifact.content.as_bytes())?;
        }

        self.systemctl_checked(&["daemon-reload"])?;
        self.systemctl_checked(&["enable", "--now", &timer])?;

        log::info!("{} enabled, runs every {}", timer, spec.interval());
        Ok(())
    }

    fn uninstall(&self) -> Result<UninstallOutcome> {
        let timer = self.timer_unit();
        let had_files = self.any_artifact_exists();
        let was_active = self.is_active()?;
        let had_link = self.wants_link().symlink_metadata().is_ok();

        // Always attempt the unregister step. systemctl refuses to disable a
        // timer whose unit file is gone, so a live one is stopped directly.
        let disable = self.systemctl(&["disable", "--now", &timer])?;
        if !disable.success() {
            log::debug!("disable {}: {}", timer, disable.stderr.trim());
            if was_active {
                let stop = self.systemctl(&["stop", &timer])?;
                if !stop.success() {
                    log::warn!("could not stop {}: {}", timer, stop.stderr.trim());
                }
            }
        }

        remove_file(&self.service_path)?;
        remove_file(&self.timer_path)?;
        remove_file(&self.wants_link())?;

        if had_files || had_link {
            self.systemctl_checked(&["daemon-reload"])?;
        }

        if self.is_active()? {
            return Err(SchedulerError::NativeCommandFailed {
                command: format!("systemctl --user disable --now {}", timer),
                code: disable.code,
                stderr: format!("{} is still active", timer),
            });
        }

        if had_files || was_active || had_link {
            Ok(UninstallOutcome::Removed)
        } else {
            log::info!("{} not found", timer);
            Ok(UninstallOutcome::AlreadyAbsent)
        }
    }

    fn is_installed(&self) -> Result<bool> {
        Ok(self.service_path.exists() && self.timer_path.exists())
    }

    fn start(&self) -> Result<()> {
        if !self.is_installed()? {
            return Err(SchedulerError::NotInstalled(self.timer_unit()));
        }
        self.systemctl_checked(&["enable", "--now", &self.timer_unit()])?;
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if !self.is_installed()? {
            return Err(SchedulerError::NotInstalled(self.timer_unit()));
        }
        self.systemctl_checked(&["disable", "--now", &self.timer_unit()])?;
        Ok(())
    }

    fn status(&self) -> Result<SchedulerStatus> {
        let installed = self.is_installed()?;
        let running = self.is_active()?;
        // `systemctl status` exits 3 for inactive units; the text is still useful.
        let detail = if installed || running {
            let out = self.systemctl(&["status", "--no-pager", &self.timer_unit()])?;
            Some(out.stdout.trim().to_string()).filter(|s| !s.is_empty())
        } else {
            None
        };

        Ok(SchedulerStatus {
            kind: self.kind(),
            installed,
            running,
            native_identifier: self.timer_unit(),
            config_path: path_str(&self.timer_path),
            detail,
        })
    }
}

/// `%` starts a specifier in any unit file setting.
fn escape_specifiers(s: &str) -> String {
    s.replace('%', "%%")
}

/// `Exec*=` lines also expand `$VAR`.
fn escape_exec(s: &str) -> String {
    escape_specifiers(s).replace('$', "$$")
}

/// Quotes one `ExecStart=` argument when systemd would otherwise split or
/// reinterpret it.
fn quote_exec_arg(arg: &str) -> String {
    let needs_quotes = arg.is_empty()
        || arg
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\' | ';'));
    let arg = escape_exec(arg);
    if !needs_quotes {
        return arg;
    }
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

/// Splits the `ExecStart=` line of a rendered service back into argv.
#[cfg(test)]
pub(crate) fn parse_exec_start(service: &str) -> Vec<String> {
    let line = service
        .lines()
        .find_map(|l| l.strip_prefix("ExecStart="))
        .expect("ExecStart line");

    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut started = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quotes => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => {
                in_quotes = !in_quotes;
                started = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if started {
                    argv.push(std::mem::take(&mut current));
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
        argv.push(current);
    }
    argv.into_iter()
        .map(|a| a.replace("%%", "%").replace("$$", "$"))
        .collect()
}
