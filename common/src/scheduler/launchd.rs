//! macOS LaunchAgent backend.
//!
//! The plist lives in `~/Library/LaunchAgents` and runs in the user's
//! context, so no sudo is needed. launchd never starts a second instance of
//! a label while one is still running.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{
    ensure_dir, path_str, remove_file, write_file, xml_escape, Scheduler, SchedulerArtifact,
    SchedulerKind, SchedulerStatus, UninstallOutcome,
};
use crate::error::{Result, SchedulerError};
use crate::invocation::Invocation;
use crate::job::{JobName, ScheduleSpec};
use crate::runner::{CommandOutput, CommandRunner, NativeCommand};

const LABEL_PREFIX: &str = "com.cronagent.";
const AGENT_PATH: &str = "/opt/homebrew/bin:/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin";

pub struct LaunchAgentScheduler {
    job: JobName,
    label: String,
    plist_path: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl LaunchAgentScheduler {
    pub fn new(job: JobName, agents_dir: PathBuf, runner: Arc<dyn CommandRunner>) -> Self {
        let label = format!("{}{}", LABEL_PREFIX, job);
        let plist_path = agents_dir.join(format!("{}.plist", label));
        Self {
            job,
            label,
            plist_path,
            runner,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn plist_path(&self) -> &Path {
        &self.plist_path
    }

    fn launchctl(&self, args: &[&str]) -> Result<CommandOutput> {
        self.runner
            .run(&NativeCommand::new("launchctl", args.iter().copied()))
    }

    /// `launchctl list <label>` exits non-zero when the label is not loaded.
    fn list(&self) -> Result<CommandOutput> {
        self.launchctl(&["list", self.label.as_str()])
    }

    fn is_loaded(&self) -> Result<bool> {
        Ok(self.list()?.success())
    }

    /// Drops the live registration. Falls back to removing by label when the
    /// plist is already gone, so a manually deleted file never leaves the
    /// job running.
    fn unregister(&self, persist_disabled: bool) -> Result<()> {
        let plist = path_str(&self.plist_path);
        let args: Vec<&str> = if self.plist_path.exists() {
            if persist_disabled {
                vec!["unload", "-w", plist.as_str()]
            } else {
                vec!["unload", plist.as_str()]
            }
        } else {
            vec!["remove", self.label.as_str()]
        };
        let cmd = NativeCommand::new("launchctl", args);
        self.runner.run(&cmd)?.into_result(&cmd)?;
        Ok(())
    }

    fn load(&self) -> Result<()> {
        let plist = path_str(&self.plist_path);
        let cmd = NativeCommand::new("launchctl", ["load", "-w", plist.as_str()]);
        self.runner.run(&cmd)?.into_result(&cmd)?;
        Ok(())
    }

    fn render_plist(&self, spec: &ScheduleSpec) -> String {
        let invocation = Invocation::from_spec(spec);
        let log_dir = spec.log_dir();

        let mut args = String::new();
        for arg in invocation.argv() {
            args.push_str(&format!("        <string>{}</string>\n", xml_escape(arg)));
        }

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{label}</string>
    <key>ProgramArguments</key>
    <array>
{args}    </array>
    <key>StartInterval</key>
    <integer>{interval}</integer>
    <key>RunAtLoad</key>
    <true/>
    <key>WorkingDirectory</key>
    <string>{workdir}</string>
    <key>StandardOutPath</key>
    <string>{stdout}</string>
    <key>StandardErrorPath</key>
    <string>{stderr}</string>
    <key>EnvironmentVariables</key>
    <dict>
        <key>PATH</key>
        <string>{path}</string>
    </dict>
</dict>
</plist>
"#,
            label = xml_escape(&self.label),
            args = args,
            interval = spec.interval().as_secs(),
            workdir = xml_escape(&invocation.working_dir_str()),
            stdout = xml_escape(&path_str(&log_dir.join("stdout.log"))),
            stderr = xml_escape(&path_str(&log_dir.join("stderr.log"))),
            path = AGENT_PATH,
        )
    }
}

impl Scheduler for LaunchAgentScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::LaunchAgent
    }

    fn job(&self) -> &JobName {
        &self.job
    }

    fn render(&self, spec: &ScheduleSpec) -> Result<Vec<SchedulerArtifact>> {
        spec.validate()?;
        Ok(vec![SchedulerArtifact {
            location: path_str(&self.plist_path),
            content: self.render_plist(spec),
        }])
    }

    fn install(&self, spec: &ScheduleSpec) -> Result<()> {
        let artifacts = self.render(spec)?;

        if self.is_loaded()? {
            log::info!("unloading existing LaunchAgent {}", self.label);
            if let Err(e) = self.unregister(false) {
                log::warn!("could not unload previous LaunchAgent: {}", e);
            }
        }

        ensure_dir(&spec.log_dir())?;
        for artifact in &artifacts {
            write_file(Path::new(&artifact.location), artifact.content.as_bytes())?;
        }
        self.load()?;

        log::info!(
            "LaunchAgent {} loaded, runs every {}",
            self.label,
            spec.interval()
        );
        Ok(())
    }

    fn uninstall(&self) -> Result<UninstallOutcome> {
        let loaded = self.is_loaded()?;
        if loaded {
            self.unregister(false)?;
        }
        let removed = remove_file(&self.plist_path)?;

        if loaded || removed {
            Ok(UninstallOutcome::Removed)
        } else {
            log::info!("LaunchAgent {} not found", self.label);
            Ok(UninstallOutcome::AlreadyAbsent)
        }
    }

    fn is_installed(&self) -> Result<bool> {
        Ok(self.plist_path.exists())
    }

    fn start(&self) -> Result<()> {
        if !self.plist_path.exists() {
            return Err(SchedulerError::NotInstalled(format!(
                "LaunchAgent {}",
                self.label
            )));
        }
        // Reload so launchd picks up the plist as it is on disk now.
        if self.is_loaded()? {
            self.unregister(false)?;
        }
        self.load()
    }

    fn stop(&self) -> Result<()> {
        if !self.is_loaded()? {
            log::info!("LaunchAgent {} is not loaded", self.label);
            return Ok(());
        }
        self.unregister(true)
    }

    fn status(&self) -> Result<SchedulerStatus> {
        let listing = self.list()?;
        let running = listing.success();
        Ok(SchedulerStatus {
            kind: self.kind(),
            installed: self.plist_path.exists(),
            running,
            native_identifier: self.label.clone(),
            config_path: path_str(&self.plist_path),
            detail: running.then(|| listing.stdout.trim().to_string()),
        })
    }
}

/// `ProgramArguments` of a rendered plist.
#[cfg(test)]
pub(crate) fn parse_program_arguments(plist: &str) -> Vec<String> {
    let start = plist
        .find("<key>ProgramArguments</key>")
        .expect("ProgramArguments key");
    let array = &plist[start..];
    let end = array.find("</array>").expect("closing array");
    super::xml_values(&array[..end], "string")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Interval;
    use crate::testing::{exit, ok, FakeRunner};
    use std::sync::Mutex;

    /// Emulates launchd's loaded/unloaded state for one label.
    fn launchd() -> Arc<FakeRunner> {
        let loaded = Arc::new(Mutex::new(false));
        Arc::new(FakeRunner::new(move |cmd| {
            let mut loaded = loaded.lock().unwrap();
            let out = match cmd.args[0].as_str() {
                "list" if *loaded => ok("{\n\t\"LastExitStatus\" = 0;\n};\n"),
                "list" => exit(113, "Could not find service in domain"),
                "load" => {
                    *loaded = true;
                    ok("")
                }
                "unload" | "remove" if *loaded => {
                    *loaded = false;
                    ok("")
                }
                _ => exit(5, "Input/output error"),
            };
            Ok(out)
        }))
    }

    fn spec(workdir: &Path) -> ScheduleSpec {
        ScheduleSpec::new("/usr/bin/python3", Interval::from_minutes(5).unwrap(), workdir)
            .with_script(workdir.join("run.py"))
    }

    fn scheduler(root: &Path, runner: Arc<FakeRunner>) -> LaunchAgentScheduler {
        LaunchAgentScheduler::new(
            JobName::default(),
            root.join("Library/LaunchAgents"),
            runner,
        )
    }

    #[test]
    fn test_plist_contents() {
        let root = tempfile::tempdir().unwrap();
        let s = scheduler(root.path(), launchd());
        let plist = s.render_plist(&spec(Path::new("/Users/me/cron agent")));

        assert!(plist.contains("<string>com.cronagent.cronagent</string>"));
        assert!(plist.contains("<key>StartInterval</key>\n    <integer>300</integer>"));
        assert!(plist.contains("<key>RunAtLoad</key>\n    <true/>"));
        assert!(plist.contains("<string>/Users/me/cron agent</string>"));
        assert!(plist.contains("<string>/Users/me/cron agent/logs/stdout.log</string>"));
        assert_eq!(
            parse_program_arguments(&plist),
            ["/usr/bin/python3", "/Users/me/cron agent/run.py", "--once"]
        );
    }

    #[test]
    fn test_plist_escapes_markup() {
        let root = tempfile::tempdir().unwrap();
        let s = scheduler(root.path(), launchd());
        let plist = s.render_plist(&spec(Path::new("/Users/me/R&D <tools>")));
        assert!(plist.contains("/Users/me/R&amp;D &lt;tools&gt;"));
        assert_eq!(
            parse_program_arguments(&plist)[1],
            "/Users/me/R&D <tools>/run.py"
        );
    }

    #[test]
    fn test_install_writes_plist_and_loads() {
        let root = tempfile::tempdir().unwrap();
        let runner = launchd();
        let s = scheduler(root.path(), runner.clone());
        let spec = spec(root.path());

        s.install(&spec).unwrap();

        assert!(s.plist_path().exists());
        assert!(root.path().join("logs").is_dir());
        let plist_arg = path_str(s.plist_path());
        assert_eq!(
            runner.calls(),
            [
                "launchctl list com.cronagent.cronagent".to_string(),
                format!("launchctl load -w {}", plist_arg),
            ]
        );

        let status = s.status().unwrap();
        assert!(status.installed);
        assert!(status.running);
        assert_eq!(status.config_path, plist_arg);
        assert_eq!(status.native_identifier, "com.cronagent.cronagent");
    }

    #[test]
    fn test_install_twice_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let runner = launchd();
        let s = scheduler(root.path(), runner.clone());
        let spec = spec(root.path());

        s.install(&spec).unwrap();
        let once = s.status().unwrap();
        runner.clear();

        s.install(&spec).unwrap();
        assert_eq!(s.status().unwrap(), once);
        // The second install unloads before it loads again.
        let calls = runner.calls();
        assert!(calls[1].starts_with("launchctl unload "));
        assert!(calls[2].starts_with("launchctl load -w "));

        let plists: Vec<_> = std::fs::read_dir(root.path().join("Library/LaunchAgents"))
            .unwrap()
            .collect();
        assert_eq!(plists.len(), 1);
    }

    #[test]
    fn test_uninstall_when_absent() {
        let root = tempfile::tempdir().unwrap();
        let runner = launchd();
        let s = scheduler(root.path(), runner.clone());

        assert!(!s.is_installed().unwrap());
        assert_eq!(s.uninstall().unwrap(), UninstallOutcome::AlreadyAbsent);
        assert!(!s.is_installed().unwrap());
        assert_eq!(runner.calls(), ["launchctl list com.cronagent.cronagent"]);
    }

    #[test]
    fn test_uninstall_after_plist_deleted_removes_live_registration() {
        let root = tempfile::tempdir().unwrap();
        let runner = launchd();
        let s = scheduler(root.path(), runner.clone());
        s.install(&spec(root.path())).unwrap();

        std::fs::remove_file(s.plist_path()).unwrap();
        let status = s.status().unwrap();
        assert!(status.is_orphaned());

        runner.clear();
        assert_eq!(s.uninstall().unwrap(), UninstallOutcome::Removed);
        assert!(runner
            .calls()
            .contains(&"launchctl remove com.cronagent.cronagent".to_string()));
        assert!(!s.status().unwrap().running);
    }

    #[test]
    fn test_stop_keeps_plist_and_start_reloads() {
        let root = tempfile::tempdir().unwrap();
        let runner = launchd();
        let s = scheduler(root.path(), runner.clone());
        s.install(&spec(root.path())).unwrap();

        s.stop().unwrap();
        let status = s.status().unwrap();
        assert!(status.installed);
        assert!(!status.running);
        assert!(runner
            .calls()
            .iter()
            .any(|c| c.starts_with("launchctl unload -w ")));

        s.start().unwrap();
        assert!(s.status().unwrap().running);

        // Stopping twice is fine.
        s.stop().unwrap();
        s.stop().unwrap();
    }

    #[test]
    fn test_start_requires_plist() {
        let root = tempfile::tempdir().unwrap();
        let s = scheduler(root.path(), launchd());
        assert_eq!(s.start().unwrap_err().kind(), "not_installed");
    }

    #[test]
    fn test_load_failure_surfaces_native_message() {
        let root = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new(|cmd| {
            Ok(match cmd.args[0].as_str() {
                "list" => exit(113, "Could not find service"),
                _ => exit(5, "Load failed: 5: Input/output error"),
            })
        }));
        let s = scheduler(root.path(), runner);
        let err = s.install(&spec(root.path())).unwrap_err();
        assert_eq!(err.kind(), "native_command_failed");
        assert!(err.to_string().contains("Input/output error"));
    }
}
