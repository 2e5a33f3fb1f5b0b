use clap::Parser;
use common::{Config, RUN_ONCE_FLAG};
use cronagent_worker::journal::{self, JournalStats};
use cronagent_worker::logging::setup_logging;
use cronagent_worker::{AiCli, Processor, TodoistClient};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Process the open tasks once and exit
    #[arg(long)]
    once: bool,
    /// Print statistics over the conversation logs and exit
    #[arg(long, conflicts_with = "once")]
    stats: bool,
    /// Config file (.toml, .yaml or .yml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    match run(args).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            log::error!("{:#}", e);
            eprintln!("error: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> anyhow::Result<i32> {
    // The OS scheduler starts us in the job's working directory, which is
    // where .env lives.
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("warning: ignoring .env: {}", e);
        }
    }
    let config = Config::load(args.config.as_deref())?;
    let working_dir = std::env::current_dir()?;

    if args.stats {
        let dir = config.logging.conversation_dir(&working_dir);
        let conversations = if dir.is_dir() {
            journal::load_dir(&dir)?
        } else {
            Vec::new()
        };
        print!("{}", JournalStats::from_conversations(&conversations));
        return Ok(0);
    }

    if !args.once {
        eprintln!(
            "cronagent-worker processes one batch per invocation and leaves timing to the OS scheduler; pass {}",
            RUN_ONCE_FLAG
        );
        return Ok(2);
    }

    let paths = setup_logging(&config.logging, &working_dir)?;
    log::info!("cronagent-worker {} starting", env!("CARGO_PKG_VERSION"));
    log::info!("conversations are journaled to {}", paths.conversations.display());

    let board = TodoistClient::from_config(&config.todoist)?;
    let assistant = AiCli::from_config(&config.executor).with_working_dir(&working_dir);
    let processor = Processor::new(board, assistant)
        .with_prompt_template(config.executor.prompt_template.clone());

    let summary = processor.run_once().await?;
    Ok(if summary.is_success() { 0 } else { 1 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args() {
        Args::command().debug_assert();

        let args = Args::try_parse_from(["cronagent-worker", RUN_ONCE_FLAG]).unwrap();
        assert!(args.once);
        assert!(Args::try_parse_from(["cronagent-worker", "--once", "--stats"]).is_err());
    }
}
