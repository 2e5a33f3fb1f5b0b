//! Conversation journal: one plain-text record per prompt/response pair.
//!
//! Records go through the `conversation` log target, which the worker's
//! logger routes to `clean_logs/conversation_<date>.log` with no prefix.
//! The same files are read back for `--stats`.

use chrono::{Local, NaiveDate, NaiveDateTime, Timelike};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const CONVERSATION_TARGET: &str = "conversation";

const RULE_WIDTH: usize = 70;
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const FILE_PREFIX: &str = "conversation_";
const FILE_SUFFIX: &str = ".log";

pub fn log_file_name(date: NaiveDate) -> String {
    format!("{}{}{}", FILE_PREFIX, date.format("%Y-%m-%d"), FILE_SUFFIX)
}

/// Journals one exchange.
pub fn record(task_id: Option<&str>, prompt: &str, response: &str) {
    let entry = format_entry(Local::now().naive_local(), task_id, prompt, response);
    log::info!(target: CONVERSATION_TARGET, "{}", entry);
}

pub fn format_entry(
    at: NaiveDateTime,
    task_id: Option<&str>,
    prompt: &str,
    response: &str,
) -> String {
    let rule = "=".repeat(RULE_WIDTH);
    let task = task_id
        .map(|id| format!(" Task ID: {}", id))
        .unwrap_or_default();
    format!(
        "{rule}\n[{at}]{task}\n\nPROMPT:\n{prompt}\n\nRESPONSE:\n{response}\n{rule}\n",
        rule = rule,
        at = at.format(TIMESTAMP_FORMAT),
        task = task,
        prompt = prompt.trim_end(),
        response = response.trim_end(),
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub at: Option<NaiveDateTime>,
    pub task_id: Option<String>,
    pub prompt: String,
    pub response: String,
}

/// Parses every record in one journal file's text. Malformed blocks are
/// skipped.
pub fn parse_entries(text: &str) -> Vec<Conversation> {
    let rule = "=".repeat(RULE_WIDTH);
    text.split(rule.as_str())
        .filter_map(|block| parse_block(block.trim_matches('\n')))
        .collect()
}

fn parse_block(block: &str) -> Option<Conversation> {
    let (header, body) = block.split_once('\n')?;
    let header = header.strip_prefix('[')?;
    let (at, rest) = header.split_once(']')?;
    let task_id = rest
        .trim()
        .strip_prefix("Task ID:")
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());

    let body = body.trim_start_matches('\n').strip_prefix("PROMPT:\n")?;
    let (prompt, response) = body.split_once("\n\nRESPONSE:\n")?;

    Some(Conversation {
        at: NaiveDateTime::parse_from_str(at.trim(), TIMESTAMP_FORMAT).ok(),
        task_id,
        prompt: prompt.trim().to_string(),
        response: response.trim().to_string(),
    })
}

/// Reads every `conversation_*.log` in `dir`, oldest file first.
pub fn load_dir(dir: &Path) -> io::Result<Vec<Conversation>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX))
                .unwrap_or(false)
        })
        .collect();
    files.sort();

    let mut conversations = Vec::new();
    for file in files {
        conversations.extend(parse_entries(&fs::read_to_string(&file)?));
    }
    Ok(conversations)
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct JournalStats {
    pub total: usize,
    pub first: Option<NaiveDate>,
    pub last: Option<NaiveDate>,
    pub avg_prompt_chars: f64,
    pub avg_response_chars: f64,
    pub per_day: BTreeMap<NaiveDate, usize>,
    pub per_hour: BTreeMap<u32, usize>,
}

impl JournalStats {
    pub fn from_conversations(conversations: &[Conversation]) -> Self {
        if conversations.is_empty() {
            return Self::default();
        }

        let mut stats = Self {
            total: conversations.len(),
            ..Self::default()
        };
        let n = conversations.len() as f64;
        let prompt_chars: usize = conversations.iter().map(|c| c.prompt.chars().count()).sum();
        let response_chars: usize = conversations.iter().map(|c| c.response.chars().count()).sum();
        stats.avg_prompt_chars = prompt_chars as f64 / n;
        stats.avg_response_chars = response_chars as f64 / n;

        for at in conversations.iter().filter_map(|c| c.at) {
            *stats.per_day.entry(at.date()).or_insert(0) += 1;
            *stats.per_hour.entry(at.hour()).or_insert(0) += 1;
        }
        stats.first = stats.per_day.keys().next().copied();
        stats.last = stats.per_day.keys().next_back().copied();
        stats
    }
}

impl fmt::Display for JournalStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.total == 0 {
            return writeln!(f, "No conversations recorded.");
        }
        writeln!(f, "Conversations: {}", self.total)?;
        if let (Some(first), Some(last)) = (self.first, self.last) {
            writeln!(f, "Period: {} - {}", first, last)?;
        }
        writeln!(f, "Average prompt length: {:.0} chars", self.avg_prompt_chars)?;
        writeln!(f, "Average response length: {:.0} chars", self.avg_response_chars)?;

        if !self.per_day.is_empty() {
            writeln!(f, "\nBy day:")?;
            for (day, count) in &self.per_day {
                writeln!(f, "  {}: {} {}", day, "#".repeat(*count), count)?;
            }
            writeln!(f, "\nBy hour:")?;
            for (hour, count) in &self.per_hour {
                writeln!(f, "  {:02}:00-{:02}:59: {}", hour, hour, count)?;
            }
        }
        Ok(())
    }
}
