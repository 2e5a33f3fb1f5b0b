pub mod executor;
pub mod journal;
pub mod logging;
pub mod processor;
pub mod todoist;

pub use executor::{AiCli, Assistant, ExecError};
pub use processor::{Processor, RunSummary, TaskBoard};
pub use todoist::{Task, TodoistClient, TodoistError};
