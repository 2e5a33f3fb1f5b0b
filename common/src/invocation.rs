//! The command line every scheduler backend embeds in its artifact.
//!
//! All four backends render from an [`Invocation`] so none of them can drop
//! the run-once flag. Without it the worker would loop on its own and the OS
//! would start overlapping copies of it.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::job::ScheduleSpec;

/// Tells the worker to poll once, process pending items and exit.
pub const RUN_ONCE_FLAG: &str = "--once";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    argv: Vec<String>,
    working_dir: PathBuf,
}

impl Invocation {
    /// `[interpreter, script?, --once, extra args...]`.
    ///
    /// Paths are converted lossily; `ScheduleSpec::validate` rejects
    /// non-UTF-8 paths before anything is rendered.
    pub fn from_spec(spec: &ScheduleSpec) -> Self {
        let mut argv = vec![spec.interpreter().to_string_lossy().into_owned()];
        if let Some(script) = spec.script() {
            argv.push(script.to_string_lossy().into_owned());
        }
        argv.push(RUN_ONCE_FLAG.to_string());
        argv.extend(
            spec.extra_args()
                .iter()
                .filter(|arg| arg.as_str() != RUN_ONCE_FLAG)
                .cloned(),
        );

        Self {
            argv,
            working_dir: spec.working_dir().to_path_buf(),
        }
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub fn args(&self) -> &[String] {
        &self.argv[1..]
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn working_dir_str(&self) -> String {
        self.working_dir.to_string_lossy().into_owned()
    }

    pub fn has_run_once_flag(&self) -> bool {
        self.args().iter().any(|a| a == RUN_ONCE_FLAG)
    }

    /// A directly spawnable command, for running the worker in the
    /// foreground exactly as the OS scheduler would.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(self.program());
        cmd.args(self.args()).current_dir(&self.working_dir);
        cmd
    }
}
