//! Windows Task Scheduler backend.
//!
//! The task definition is written as UTF-16 XML under the user's local app
//! data and registered with `schtasks /Create /XML`, which is the only
//! schtasks form that takes a working directory and an instance policy.

use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{
    path_str, remove_file, write_file, xml_escape, Scheduler, SchedulerArtifact, SchedulerKind,
    SchedulerStatus, UninstallOutcome,
};
use crate::error::{Result, SchedulerError};
use crate::invocation::Invocation;
use crate::job::{JobName, ScheduleSpec};
use crate::runner::{CommandOutput, CommandRunner, NativeCommand};
use crate::schedule::Interval;

const TASK_PREFIX: &str = "CronAgent-";
/// Longest repetition interval Task Scheduler accepts (31 days).
const MAX_REPETITION_MINUTES: u64 = 31 * 24 * 60;

pub struct TaskScheduler {
    job: JobName,
    task_name: String,
    xml_path: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl TaskScheduler {
    pub fn new(job: JobName, task_dir: PathBuf, runner: Arc<dyn CommandRunner>) -> Self {
        let task_name = format!("{}{}", TASK_PREFIX, job);
        let xml_path = task_dir.join(format!("{}.xml", job));
        Self {
            job,
            task_name,
            xml_path,
            runner,
        }
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn xml_path(&self) -> &Path {
        &self.xml_path
    }

    fn schtasks(&self, args: &[&str]) -> Result<CommandOutput> {
        self.runner
            .run(&NativeCommand::new("schtasks", args.iter().copied()))
    }

    fn schtasks_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let cmd = NativeCommand::new("schtasks", args.iter().copied());
        self.runner.run(&cmd)?.into_result(&cmd)
    }

    /// `schtasks /Query` exits non-zero for an unknown task name.
    fn is_registered(&self) -> Result<bool> {
        Ok(self.schtasks(&["/Query", "/TN", &self.task_name])?.success())
    }

    fn register(&self) -> Result<()> {
        let xml = path_str(&self.xml_path);
        self.schtasks_checked(&["/Create", "/TN", &self.task_name, "/XML", &xml, "/F"])?;
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        self.schtasks_checked(&["/Delete", "/TN", &self.task_name, "/F"])?;
        Ok(())
    }

    fn render_xml(&self, spec: &ScheduleSpec) -> Result<String> {
        let minutes = repetition_minutes(spec.interval())?;
        let invocation = Invocation::from_spec(spec);
        let arguments = invocation
            .args()
            .iter()
            .map(|arg| quote_windows_arg(arg))
            .collect::<Vec<_>>()
            .join(" ");
        let start = Local::now().format("%Y-%m-%dT%H:%M:%S");

        Ok(format!(
            r#"<?xml version="1.0" encoding="UTF-16"?>
<Task version="1.2" xmlns="http://schemas.microsoft.com/windows/2004/02/mit/task">
  <RegistrationInfo>
    <Description>cronagent worker ({job}), every {interval}</Description>
  </RegistrationInfo>
  <Triggers>
    <TimeTrigger>
      <Repetition>
        <Interval>PT{minutes}M</Interval>
        <StopAtDurationEnd>false</StopAtDurationEnd>
      </Repetition>
      <StartBoundary>{start}</StartBoundary>
      <Enabled>true</Enabled>
    </TimeTrigger>
  </Triggers>
  <Principals>
    <Principal id="Author">
      <LogonType>InteractiveToken</LogonType>
      <RunLevel>LeastPrivilege</RunLevel>
    </Principal>
  </Principals>
  <Settings>
    <MultipleInstancesPolicy>IgnoreNew</MultipleInstancesPolicy>
    <DisallowStartIfOnBatteries>false</DisallowStartIfOnBatteries>
    <StopIfGoingOnBatteries>false</StopIfGoingOnBatteries>
    <StartWhenAvailable>true</StartWhenAvailable>
    <ExecutionTimeLimit>PT1H</ExecutionTimeLimit>
    <Enabled>true</Enabled>
  </Settings>
  <Actions Context="Author">
    <Exec>
      <Command>{command}</Command>
      <Arguments>{arguments}</Arguments>
      <WorkingDirectory>{workdir}</WorkingDirectory>
    </Exec>
  </Actions>
</Task>
"#,
            job = xml_escape(self.job.as_str()),
            interval = spec.interval(),
            minutes = minutes,
            start = start,
            command = xml_escape(invocation.program()),
            arguments = xml_escape(&arguments),
            workdir = xml_escape(&invocation.working_dir_str()),
        ))
    }
}

impl Scheduler for TaskScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::TaskScheduler
    }

    fn job(&self) -> &JobName {
        &self.job
    }

    fn render(&self, spec: &ScheduleSpec) -> Result<Vec<SchedulerArtifact>> {
        spec.validate()?;
        Ok(vec![SchedulerArtifact {
            location: path_str(&self.xml_path),
            content: self.render_xml(spec)?,
        }])
    }

    fn install(&self, spec: &ScheduleSpec) -> Result<()> {
        spec.validate()?;
        let xml = self.render_xml(spec)?;

        if self.is_registered()? {
            log::info!("replacing existing task {}", self.task_name);
            if let Err(e) = self.delete() {
                log::warn!("could not delete previous task {}: {}", self.task_name, e);
            }
        }

        write_file(&self.xml_path, &utf16_with_bom(&xml))?;
        self.register()?;

        log::info!("task {} registered, runs every {}", self.task_name, spec.interval());
        Ok(())
    }

    fn uninstall(&self) -> Result<UninstallOutcome> {
        let registered = self.is_registered()?;
        if registered {
            self.delete()?;
        }
        let removed = remove_file(&self.xml_path)?;

        if registered || removed {
            Ok(UninstallOutcome::Removed)
        } else {
            log::info!("task {} not found", self.task_name);
            Ok(UninstallOutcome::AlreadyAbsent)
        }
    }

    fn is_installed(&self) -> Result<bool> {
        Ok(self.xml_path.exists())
    }

    fn start(&self) -> Result<()> {
        if !self.is_installed()? {
            return Err(SchedulerError::NotInstalled(self.task_name.clone()));
        }
        if self.is_registered()? {
            self.schtasks_checked(&["/Change", "/TN", &self.task_name, "/ENABLE"])?;
        } else {
            log::info!("re-registering {} from {}", self.task_name, self.xml_path.display());
            self.register()?;
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if !self.is_registered()? {
            return Ok(());
        }
        self.schtasks_checked(&["/Change", "/TN", &self.task_name, "/DISABLE"])?;
        Ok(())
    }

    fn status(&self) -> Result<SchedulerStatus> {
        let installed = self.is_installed()?;
        let query = self.schtasks(&["/Query", "/TN", &self.task_name, "/V", "/FO", "LIST"])?;
        let (running, detail) = if query.success() {
            let fields = list_fields(&query.stdout);
            let enabled = fields
                .iter()
                .any(|(k, v)| k == "Scheduled Task State" && v.eq_ignore_ascii_case("enabled"));
            let detail = fields
                .iter()
                .filter(|(k, _)| {
                    matches!(k.as_str(), "Status" | "Next Run Time" | "Last Run Time" | "Last Result")
                })
                .map(|(k, v)| format!("{}: {}", k, v))
                .collect::<Vec<_>>()
                .join("; ");
            (enabled, Some(detail).filter(|d| !d.is_empty()))
        } else {
            (false, None)
        };

        Ok(SchedulerStatus {
            kind: self.kind(),
            installed,
            running,
            native_identifier: self.task_name.clone(),
            config_path: path_str(&self.xml_path),
            detail,
        })
    }
}

/// Task Scheduler repeats in whole minutes, from one minute to 31 days.
fn repetition_minutes(interval: Interval) -> Result<u64> {
    let unsupported = |reason: &str| SchedulerError::UnsupportedInterval {
        interval_secs: interval.as_secs(),
        backend: SchedulerKind::TaskScheduler.name(),
        reason: reason.to_string(),
    };
    match interval.whole_minutes() {
        None => Err(unsupported("repetition must be a whole number of minutes")),
        Some(m) if m > MAX_REPETITION_MINUTES => Err(unsupported("repetition is capped at 31 days")),
        Some(m) => Ok(m),
    }
}

/// Task Scheduler reads UTF-16 task definitions; the BOM marks byte order.
fn utf16_with_bom(text: &str) -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xFE];
    for unit in text.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes
}

/// Quotes one argument so `CommandLineToArgvW` reads it back unchanged.
fn quote_windows_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '\n', '"']) {
        return arg.to_string();
    }
    let mut quoted = String::from('"');
    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                quoted.push_str(&"\\".repeat(backslashes * 2 + 1));
                quoted.push('"');
                backslashes = 0;
            }
            c => {
                quoted.push_str(&"\\".repeat(backslashes));
                quoted.push(c);
                backslashes = 0;
            }
        }
    }
    quoted.push_str(&"\\".repeat(backslashes * 2));
    quoted.push('"');
    quoted
}

/// `Key: value` pairs from `schtasks /FO LIST` output.
fn list_fields(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// `Command` followed by the split `Arguments` of a rendered definition.
#[cfg(test)]
pub(crate) fn parse_exec(xml: &str) -> Vec<String> {
    let mut argv = super::xml_values(xml, "Command");
    if let Some(arguments) = super::xml_values(xml, "Arguments").first() {
        argv.extend(split_windows_args(arguments));
    }
    argv
}

#[cfg(test)]
fn split_windows_args(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut started = false;
    let mut in_quotes = false;
    let mut backslashes = 0;
    for c in line.chars() {
        match c {
            '\\' => {
                backslashes += 1;
                started = true;
            }
            '"' => {
                current.push_str(&"\\".repeat(backslashes / 2));
                if backslashes % 2 == 1 {
                    current.push('"');
                } else {
                    in_quotes = !in_quotes;
                }
                backslashes = 0;
                started = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                current.push_str(&"\\".repeat(backslashes));
                backslashes = 0;
                if started {
                    args.push(std::mem::take(&mut current));
                    started = false;
                }
            }
            c => {
                current.push_str(&"\\".repeat(backslashes));
                backslashes = 0;
                current.push(c);
                started = true;
            }
        }
    }
    current.push_str(&"\\".repeat(backslashes));
    if started {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{exit, ok, FakeRunner};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TaskState {
        registered: bool,
        enabled: bool,
    }

    /// Emulates the task store behind `schtasks`. `/Create` insists on a
    /// UTF-16 definition file, as the real tool does.
    fn task_store() -> (Arc<Mutex<TaskState>>, Arc<FakeRunner>) {
        let state = Arc::new(Mutex::new(TaskState::default()));
        let store = state.clone();
        let runner = Arc::new(FakeRunner::new(move |cmd| {
            let mut task = store.lock().unwrap();
            let args: Vec<&str> = cmd.args.iter().map(String::as_str).collect();
            let missing = "ERROR: The system cannot find the file specified.";
            let out = match args.as_slice() {
                ["/Query", "/TN", name, "/V", "/FO", "LIST"] if task.registered => ok(&format!(
                    "TaskName:                             \\{}\nStatus:                               Ready\nNext Run Time:                        10/16/2026 10:05:00 AM\nScheduled Task State:                 {}\n",
                    name,
                    if task.enabled { "Enabled" } else { "Disabled" }
                )),
                ["/Query", "/TN", _] if task.registered => ok("Ready"),
                ["/Query", ..] => exit(1, missing),
                ["/Create", "/TN", _, "/XML", path, "/F"] => {
                    let bytes = std::fs::read(path).unwrap_or_default();
                    if bytes.starts_with(&[0xFF, 0xFE]) {
                        task.registered = true;
                        task.enabled = true;
                        ok("SUCCESS: The scheduled task has successfully been created.")
                    } else {
                        exit(1, "ERROR: The task XML is malformed.")
                    }
                }
                ["/Delete", "/TN", _, "/F"] if task.registered => {
                    *task = TaskState::default();
                    ok("SUCCESS")
                }
                ["/Delete", ..] => exit(1, missing),
                ["/Change", "/TN", _, flag] if task.registered => {
                    task.enabled = *flag == "/ENABLE";
                    ok("SUCCESS")
                }
                _ => exit(1, "ERROR: Invalid syntax."),
            };
            Ok(out)
        }));
        (state, runner)
    }

    fn spec(secs: u64) -> ScheduleSpec {
        ScheduleSpec::new(
            "/Program Files/cronagent/cronagent-worker.exe",
            Interval::from_secs(secs).unwrap(),
            "/Users/me/cron agent",
        )
    }

    fn scheduler(root: &Path, runner: Arc<FakeRunner>) -> TaskScheduler {
        TaskScheduler::new(JobName::default(), root.join("AppData/cronagent"), runner)
    }

    fn read_utf16(path: &Path) -> String {
        let bytes = std::fs::read(path).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xFE]);
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&units).unwrap()
    }

    #[test]
    fn test_windows_arg_quoting() {
        assert_eq!(quote_windows_arg("--once"), "--once");
        assert_eq!(quote_windows_arg("C:\\a b\\run.py"), "\"C:\\a b\\run.py\"");
        assert_eq!(quote_windows_arg("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(quote_windows_arg("C:\\dir with space\\"), "\"C:\\dir with space\\\\\"");
        assert_eq!(quote_windows_arg(""), "\"\"");

        let args = ["C:\\a b\\run.py", "say \"hi\"", "C:\\dir with space\\", "", "--once"];
        let line = args
            .iter()
            .map(|a| quote_windows_arg(a))
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(split_windows_args(&line), args);
    }

    #[test]
    fn test_task_definition() {
        let root = tempfile::tempdir().unwrap();
        let (_state, runner) = task_store();
        let s = scheduler(root.path(), runner);

        let xml = s.render(&spec(300).with_script("/Users/me/cron agent/main.py")).unwrap();
        let xml = &xml[0].content;

        assert_eq!(super::super::xml_values(xml, "Interval"), ["PT5M"]);
        assert_eq!(
            super::super::xml_values(xml, "MultipleInstancesPolicy"),
            ["IgnoreNew"]
        );
        assert_eq!(
            super::super::xml_values(xml, "WorkingDirectory"),
            ["/Users/me/cron agent"]
        );
        assert_eq!(
            parse_exec(xml),
            [
                "/Program Files/cronagent/cronagent-worker.exe",
                "/Users/me/cron agent/main.py",
                "--once",
            ]
        );
        let start = &super::super::xml_values(xml, "StartBoundary")[0];
        assert!(chrono::NaiveDateTime::parse_from_str(start, "%Y-%m-%dT%H:%M:%S").is_ok());
    }

    #[test]
    fn test_unsupported_intervals() {
        assert_eq!(repetition_minutes(Interval::from_secs(60).unwrap()).unwrap(), 1);
        assert_eq!(repetition_minutes(Interval::from_secs(5400).unwrap()).unwrap(), 90);
        for secs in [30, 90, 32 * 86400] {
            let err = repetition_minutes(Interval::from_secs(secs).unwrap()).unwrap_err();
            assert_eq!(err.kind(), "unsupported_interval", "{}s", secs);
        }
    }

    #[test]
    fn test_install_writes_utf16_and_registers() {
        let root = tempfile::tempdir().unwrap();
        let (state, runner) = task_store();
        let s = scheduler(root.path(), runner.clone());

        s.install(&spec(300)).unwrap();

        let xml_path = path_str(s.xml_path());
        assert_eq!(
            runner.calls(),
            [
                "schtasks /Query /TN CronAgent-cronagent".to_string(),
                format!("schtasks /Create /TN CronAgent-cronagent /XML {} /F", xml_path),
            ]
        );
        assert!(read_utf16(s.xml_path()).contains("<Interval>PT5M</Interval>"));
        assert!(state.lock().unwrap().registered);

        let status = s.status().unwrap();
        assert!(status.installed);
        assert!(status.running);
        assert_eq!(status.native_identifier, "CronAgent-cronagent");
        assert!(status.detail.unwrap().contains("Status: Ready"));
    }

    #[test]
    fn test_install_twice_replaces_task() {
        let root = tempfile::tempdir().unwrap();
        let (_state, runner) = task_store();
        let s = scheduler(root.path(), runner.clone());

        s.install(&spec(300)).unwrap();
        runner.clear();
        s.install(&spec(600)).unwrap();

        let calls = runner.calls();
        assert_eq!(calls[1], "schtasks /Delete /TN CronAgent-cronagent /F");
        assert!(calls[2].starts_with("schtasks /Create "));
        assert!(read_utf16(s.xml_path()).contains("<Interval>PT10M</Interval>"));
    }

    #[test]
    fn test_stop_and_start() {
        let root = tempfile::tempdir().unwrap();
        let (_state, runner) = task_store();
        let s = scheduler(root.path(), runner);
        s.install(&spec(300)).unwrap();

        s.stop().unwrap();
        let status = s.status().unwrap();
        assert!(status.installed && !status.running);

        s.start().unwrap();
        assert!(s.status().unwrap().running);
    }

    #[test]
    fn test_start_reregisters_from_definition() {
        let root = tempfile::tempdir().unwrap();
        let (state, runner) = task_store();
        let s = scheduler(root.path(), runner);
        s.install(&spec(300)).unwrap();
        *state.lock().unwrap() = TaskState::default();

        s.start().unwrap();
        assert!(state.lock().unwrap().registered);
    }

    #[test]
    fn test_uninstall() {
        let root = tempfile::tempdir().unwrap();
        let (state, runner) = task_store();
        let s = scheduler(root.path(), runner);

        assert_eq!(s.uninstall().unwrap(), UninstallOutcome::AlreadyAbsent);

        s.install(&spec(300)).unwrap();
        assert_eq!(s.uninstall().unwrap(), UninstallOutcome::Removed);
        assert!(!s.xml_path().exists());
        assert!(!state.lock().unwrap().registered);
        assert_eq!(s.uninstall().unwrap(), UninstallOutcome::AlreadyAbsent);
    }

    #[test]
    fn test_uninstall_after_definition_deleted_by_hand() {
        let root = tempfile::tempdir().unwrap();
        let (state, runner) = task_store();
        let s = scheduler(root.path(), runner);
        s.install(&spec(300)).unwrap();
        std::fs::remove_file(s.xml_path()).unwrap();
        assert!(s.status().unwrap().is_orphaned());

        assert_eq!(s.uninstall().unwrap(), UninstallOutcome::Removed);
        assert!(!state.lock().unwrap().registered);
    }

    #[test]
    fn test_start_requires_definition() {
        let root = tempfile::tempdir().unwrap();
        let (_state, runner) = task_store();
        let s = scheduler(root.path(), runner);
        assert_eq!(s.start().unwrap_err().kind(), "not_installed");
    }
}
