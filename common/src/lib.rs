pub mod config;
pub mod error;
pub mod invocation;
pub mod job;
pub mod platform;
pub mod runner;
pub mod schedule;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use error::{Result, SchedulerError};
pub use invocation::{Invocation, RUN_ONCE_FLAG};
pub use job::{JobName, ScheduleSpec};
pub use platform::{HostProbe, Platform};
pub use runner::{CommandOutput, CommandRunner, NativeCommand, SystemRunner};
pub use schedule::Interval;
pub use scheduler::{
    create_for, create_scheduler, Scheduler, SchedulerArtifact, SchedulerDirs, SchedulerKind,
    SchedulerStatus, UninstallOutcome,
};

// Per-user locations, relative to the platform config/data dirs.
pub const APP_DIR_NAME: &str = "cronagent";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const CONFIG_ENV_VAR: &str = "CRONAGENT_CONFIG";

// Relative to the worker's working directory.
pub const LOG_DIR: &str = "logs";
pub const CONVERSATION_LOG_DIR: &str = "clean_logs";
pub const WORKER_LOG_FILE: &str = "agent.log";

pub const WORKER_BIN_NAME: &str = "cronagent-worker";
