use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::job::JobName;
use crate::schedule::Interval;
use crate::scheduler::SchedulerKind;

pub const TOKEN_ENV_VAR: &str = "TODOIST_TOKEN";

/// What `cronagent install` registers with the OS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub name: JobName,
    #[serde(default)]
    pub interval: Interval,
    /// Defaults to the worker binary installed next to `cronagent`.
    pub interpreter: Option<PathBuf>,
    pub script: Option<PathBuf>,
    /// Defaults to the directory `cronagent` is run from.
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Skips host detection when set.
    pub backend: Option<SchedulerKind>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            name: JobName::default(),
            interval: Interval::default(),
            interpreter: None,
            script: None,
            working_dir: None,
            args: Vec::new(),
            backend: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoistConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Falls back to `TODOIST_TOKEN`.
    pub token: Option<String>,
    pub project_id: Option<String>,
    /// Todoist filter query, e.g. `"today | overdue"`.
    pub filter: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_api_base() -> String { "https://api.todoist.com/rest/v2".to_string() }
fn default_request_timeout() -> u64 { 30 }

impl Default for TodoistConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            token: None,
            project_id: None,
            filter: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl TodoistConfig {
    pub fn token(&self) -> Option<String> {
        self.token_or(std::env::var(TOKEN_ENV_VAR).ok())
    }

    fn token_or(&self, env: Option<String>) -> Option<String> {
        self.token
            .iter()
            .chain(env.iter())
            .map(|t| t.trim())
            .find(|t| !t.is_empty())
            .map(str::to_string)
    }
}

/// The AI command-line tool each task is handed to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_program")]
    pub program: String,
    /// Passed before the prompt, which is always the last argument.
    #[serde(default = "default_executor_args")]
    pub args: Vec<String>,
    #[serde(default = "default_executor_timeout")]
    pub timeout_secs: u64,
    /// `{content}`, `{description}` and `{task_id}` are substituted.
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,
}

fn default_program() -> String { "cursor-agent".to_string() }
fn default_executor_args() -> Vec<String> { vec!["-p".to_string()] }
fn default_executor_timeout() -> u64 { 300 }
fn default_prompt_template() -> String { "{content}".to_string() }

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_executor_args(),
            timeout_secs: default_executor_timeout(),
            prompt_template: default_prompt_template(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Relative paths resolve against the worker's working directory.
    pub log_dir: Option<PathBuf>,
    pub conversation_dir: Option<PathBuf>,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: None,
            conversation_dir: None,
        }
    }
}

impl LoggingConfig {
    pub fn log_dir(&self, working_dir: &Path) -> PathBuf {
        resolve(working_dir, self.log_dir.as_deref(), crate::LOG_DIR)
    }

    pub fn conversation_dir(&self, working_dir: &Path) -> PathBuf {
        resolve(
            working_dir,
            self.conversation_dir.as_deref(),
            crate::CONVERSATION_LOG_DIR,
        )
    }
}

fn resolve(base: &Path, configured: Option<&Path>, default: &str) -> PathBuf {
    match configured {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => base.join(path),
        None => base.join(default),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub todoist: TodoistConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Detect file type by extension and load
    pub fn from_file(path: &Path) -> Result<Self> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        match ext {
            "yaml" | "yml" => Self::from_yaml_file(path),
            "toml" => Self::from_toml_file(path),
            _ => Err(anyhow::anyhow!(
                "Unsupported config file format: {:?}. Use .yaml, .yml, or .toml",
                path
            )),
        }
    }

    /// `~/.config/cronagent/config.toml` or the platform equivalent.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(crate::APP_DIR_NAME).join(crate::CONFIG_FILE_NAME))
    }

    /// Loads `explicit`, else `$CRONAGENT_CONFIG`, else the default path.
    ///
    /// A named file must exist. A missing default file yields defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os(crate::CONFIG_ENV_VAR).map(PathBuf::from);
        Self::load_from(explicit, from_env, Self::default_path())
    }

    fn load_from(
        explicit: Option<&Path>,
        from_env: Option<PathBuf>,
        default: Option<PathBuf>,
    ) -> Result<Self> {
        if let Some(path) = explicit.map(Path::to_path_buf).or(from_env) {
            log::debug!("loading config from {}", path.display());
            return Self::from_file(&path);
        }
        match default {
            Some(path) if path.exists() => {
                log::debug!("loading config from {}", path.display());
                Self::from_file(&path)
            }
            _ => Ok(Self::default()),
        }
    }
}
