//! One polling pass: every open task goes to the assistant, the exchange is
//! journaled, and the outcome is written back to the task list.

use async_trait::async_trait;
use chrono::Local;
use std::time::Instant;
use uuid::Uuid;

use crate::executor::Assistant;
use crate::journal;
use crate::todoist::{Task, TodoistClient, TodoistError};

/// Todoist caps comment length; longer answers are cut.
const MAX_COMMENT_CHARS: usize = 10_000;

/// Where tasks come from and where results go.
#[async_trait]
pub trait TaskBoard: Send + Sync {
    async fn active_tasks(&self) -> Result<Vec<Task>, TodoistError>;
    async fn add_comment(&self, task_id: &str, content: &str) -> Result<(), TodoistError>;
    async fn close_task(&self, task_id: &str) -> Result<(), TodoistError>;
}

#[async_trait]
impl TaskBoard for TodoistClient {
    async fn active_tasks(&self) -> Result<Vec<Task>, TodoistError> {
        TodoistClient::active_tasks(self).await
    }

    async fn add_comment(&self, task_id: &str, content: &str) -> Result<(), TodoistError> {
        TodoistClient::add_comment(self, task_id, content).await
    }

    async fn close_task(&self, task_id: &str) -> Result<(), TodoistError> {
        TodoistClient::close_task(self, task_id).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

pub struct Processor<B, A> {
    board: B,
    assistant: A,
    prompt_template: String,
}

impl<B: TaskBoard, A: Assistant> Processor<B, A> {
    pub fn new(board: B, assistant: A) -> Self {
        Self {
            board,
            assistant,
            prompt_template: "{content}".to_string(),
        }
    }

    pub fn with_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = template.into();
        self
    }

    /// Processes every open task once. Fails only when the task list
    /// itself cannot be read; per-task failures are counted.
    pub async fn run_once(&self) -> Result<RunSummary, TodoistError> {
        let run_id = Uuid::new_v4();
        log::info!("run {} started", run_id);

        let tasks = self.board.active_tasks().await?;
        let mut summary = RunSummary {
            run_id,
            processed: 0,
            succeeded: 0,
            failed: 0,
        };
        if tasks.is_empty() {
            log::info!("run {}: no open tasks", run_id);
            return Ok(summary);
        }

        for task in &tasks {
            summary.processed += 1;
            match self.process(task).await {
                Ok(()) => summary.succeeded += 1,
                Err(e) => {
                    summary.failed += 1;
                    log::error!("run {}: task {} failed: {:#}", run_id, task.id, e);
                }
            }
        }

        log::info!(
            "run {} finished: {} processed, {} succeeded, {} failed",
            run_id,
            summary.processed,
            summary.succeeded,
            summary.failed
        );
        Ok(summary)
    }

    async fn process(&self, task: &Task) -> anyhow::Result<()> {
        log::info!("processing task {}: {}", task.id, task.content);
        let prompt = render_prompt(&self.prompt_template, task);
        let started = Instant::now();

        match self.assistant.ask(&prompt).await {
            Ok(response) => {
                journal::record(Some(&task.id), &prompt, &response);
                let comment = result_comment(true, &response, started);
                self.board.add_comment(&task.id, &comment).await?;
                self.board.close_task(&task.id).await?;
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                journal::record(Some(&task.id), &prompt, &format!("ERROR: {}", message));
                // The task stays open for the next run.
                let comment = result_comment(false, &message, started);
                if let Err(ce) = self.board.add_comment(&task.id, &comment).await {
                    log::warn!("could not comment on task {}: {}", task.id, ce);
                }
                Err(e.into())
            }
        }
    }
}

/// Substitutes `{content}`, `{description}` and `{task_id}`.
pub fn render_prompt(template: &str, task: &Task) -> String {
    template
        .replace("{content}", &task.content)
        .replace("{description}", &task.description)
        .replace("{task_id}", &task.id)
}

fn result_comment(succeeded: bool, body: &str, started: Instant) -> String {
    let body: String = if body.chars().count() > MAX_COMMENT_CHARS {
        let mut cut: String = body.chars().take(MAX_COMMENT_CHARS).collect();
        cut.push_str("\n[truncated]");
        cut
    } else {
        body.to_string()
    };
    format!(
        "cronagent result\n- status: {}\n- time: {}\n- duration: {:.1}s\n\n{}",
        if succeeded { "succeeded" } else { "failed" },
        Local::now().format("%H:%M:%S"),
        started.elapsed().as_secs_f64(),
        body
    )
}
