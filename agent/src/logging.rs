use anyhow::Context;
use common::config::LoggingConfig;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::journal::{self, CONVERSATION_TARGET};

/// Files the worker logs into for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub main: PathBuf,
    pub conversations: PathBuf,
}

impl LogPaths {
    pub fn resolve(config: &LoggingConfig, working_dir: &Path, today: chrono::NaiveDate) -> Self {
        Self {
            main: config.log_dir(working_dir).join(common::WORKER_LOG_FILE),
            conversations: config
                .conversation_dir(working_dir)
                .join(journal::log_file_name(today)),
        }
    }
}

pub fn parse_level(level: &str) -> anyhow::Result<log::LevelFilter> {
    log::LevelFilter::from_str(level).map_err(|_| anyhow::anyhow!("Invalid log level: {:?}", level))
}

pub fn setup_logging(config: &LoggingConfig, working_dir: &Path) -> anyhow::Result<LogPaths> {
    let paths = LogPaths::resolve(config, working_dir, chrono::Local::now().date_naive());
    for file in [&paths.main, &paths.conversations] {
        if let Some(dir) = file.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {:?}", dir))?;
        }
    }

    // Main log: everything except conversations
    let main_log = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d][%H:%M:%S"),
                record.target(),
                record.level(),
                message
            ))
        })
        .filter(|metadata| metadata.target() != CONVERSATION_TARGET)
        .chain(std::io::stdout())
        .chain(fern::log_file(&paths.main)?);

    // Conversation log: journal records only, written as-is
    let conversation_log = fern::Dispatch::new()
        .format(|out, message, _| out.finish(format_args!("{}", message)))
        .filter(|metadata| metadata.target() == CONVERSATION_TARGET)
        .chain(fern::log_file(&paths.conversations)?);

    fern::Dispatch::new()
        .level(parse_level(&config.level)?)
        .level_for(CONVERSATION_TARGET, log::LevelFilter::Info)
        .chain(main_log)
        .chain(conversation_log)
        .apply()?;

    Ok(paths)
}
