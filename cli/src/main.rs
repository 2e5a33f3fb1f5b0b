use anyhow::Context;
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use common::{
    create_scheduler, Config, Interval, Invocation, JobName, ScheduleSpec, Scheduler,
    SchedulerError, SchedulerKind, SchedulerStatus, SystemRunner, UninstallOutcome,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (.toml, .yaml or .yml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Job name, overriding the config file
    #[arg(short, long, global = true)]
    name: Option<JobName>,
    /// Use this backend instead of detecting one (launchd, systemd, cron, taskschd)
    #[arg(long, global = true)]
    backend: Option<SchedulerKind>,
    /// More log output (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the worker with the OS scheduler
    Install {
        /// Every X duration (e.g. "300", "90s", "5m", "1h")
        #[arg(short, long)]
        every: Option<Interval>,
        /// Program the OS runs (defaults to the bundled worker)
        #[arg(long)]
        interpreter: Option<PathBuf>,
        /// Script passed to the interpreter
        #[arg(long)]
        script: Option<PathBuf>,
        /// Working directory for each run (defaults to the current directory)
        #[arg(long)]
        workdir: Option<PathBuf>,
        /// Print what would be written without installing
        #[arg(long)]
        dry_run: bool,
        /// Extra worker arguments
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Remove the OS scheduler entry
    Uninstall,
    /// Show what the OS reports for the job
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Re-enable an installed job
    Start,
    /// Disable an installed job without removing it
    Stop,
    /// Run the worker once in the foreground
    Run,
    /// Print the backend this host would use
    Backend,
}

/// Command-line values that take precedence over the config file.
#[derive(Default)]
struct SpecOverrides {
    every: Option<Interval>,
    interpreter: Option<PathBuf>,
    script: Option<PathBuf>,
    workdir: Option<PathBuf>,
    args: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            match e.downcast_ref::<SchedulerError>() {
                Some(err) => eprintln!("error[{}]: {}", err.kind(), err),
                None => eprintln!("error: {:#}", e),
            }
            std::process::exit(1);
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(name) = cli.name {
        config.schedule.name = name;
    }
    if cli.backend.is_some() {
        config.schedule.backend = cli.backend;
    }

    let job = config.schedule.name.clone();
    let scheduler = || -> anyhow::Result<Box<dyn Scheduler>> {
        let runner = Arc::new(SystemRunner::new());
        Ok(create_scheduler(job.clone(), config.schedule.backend, runner)?)
    };

    match cli.command {
        Commands::Install {
            every,
            interpreter,
            script,
            workdir,
            dry_run,
            args,
        } => {
            let overrides = SpecOverrides {
                every,
                interpreter,
                script,
                workdir,
                args,
            };
            let spec = build_spec(&config, overrides)?;
            let scheduler = scheduler()?;

            if dry_run {
                for artifact in scheduler.render(&spec)? {
                    println!("# {}", artifact.location);
                    println!("{}", artifact.content);
                }
                return Ok(0);
            }

            println!(
                "Installing {} ({}), every {}",
                job,
                scheduler.kind().description(),
                spec.interval()
            );
            scheduler.install(&spec)?;
            println!("Installed. Logs go to {}", spec.log_dir().display());
            println!("Make sure {} is set in .env or the config file.", common::config::TOKEN_ENV_VAR);
        }
        Commands::Uninstall => match scheduler()?.uninstall()? {
            UninstallOutcome::Removed => println!("Uninstalled {}", job),
            UninstallOutcome::AlreadyAbsent => println!("{} is already absent", job),
        },
        Commands::Status { json } => {
            let status = scheduler()?.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("{}", status_table(&status));
            }
            if status.is_orphaned() {
                eprintln!(
                    "warning: {} is still registered with the OS but {} is gone; run `cronagent uninstall`",
                    status.native_identifier, status.config_path
                );
            }
        }
        Commands::Start => {
            scheduler()?.start()?;
            println!("Started {}", job);
        }
        Commands::Stop => {
            scheduler()?.stop()?;
            println!("Stopped {}", job);
        }
        Commands::Run => {
            let spec = build_spec(&config, SpecOverrides::default())?;
            let invocation = Invocation::from_spec(&spec);
            log::info!("running {:?} in {}", invocation.argv(), spec.working_dir().display());
            let status = invocation
                .command()
                .status()
                .with_context(|| format!("Failed to start {}", invocation.program()))?;
            return Ok(status.code().unwrap_or(1));
        }
        Commands::Backend => {
            let scheduler = scheduler()?;
            println!("{} ({})", scheduler.kind(), scheduler.kind().description());
        }
    }

    Ok(0)
}

fn build_spec(config: &Config, overrides: SpecOverrides) -> anyhow::Result<ScheduleSpec> {
    let cwd = std::env::current_dir().context("Failed to read the current directory")?;
    let schedule = &config.schedule;

    let interpreter = match overrides.interpreter.or_else(|| schedule.interpreter.clone()) {
        Some(path) => absolute(&cwd, path),
        None => bundled_worker()?,
    };
    let workdir = overrides
        .workdir
        .or_else(|| schedule.working_dir.clone())
        .map(|p| absolute(&cwd, p))
        .unwrap_or(cwd.clone());
    let interval = overrides.every.unwrap_or(schedule.interval);
    let args = if overrides.args.is_empty() {
        schedule.args.clone()
    } else {
        overrides.args
    };

    let mut spec = ScheduleSpec::new(interpreter, interval, workdir).with_args(args);
    if let Some(script) = overrides.script.or_else(|| schedule.script.clone()) {
        spec = spec.with_script(absolute(&cwd, script));
    }
    spec.validate()?;
    Ok(spec)
}

/// The worker binary shipped alongside this executable.
fn bundled_worker() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to locate the cronagent executable")?;
    let worker = exe.with_file_name(format!(
        "{}{}",
        common::WORKER_BIN_NAME,
        std::env::consts::EXE_SUFFIX
    ));
    if !worker.exists() {
        log::warn!("{} not found; pass --interpreter", worker.display());
    }
    Ok(worker)
}

fn absolute(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

fn status_table(status: &SchedulerStatus) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Field", "Value"]);
    table.add_row(vec!["Backend", status.kind.description()]);
    table.add_row(vec!["Identifier", status.native_identifier.as_str()]);
    table.add_row(vec!["Config", status.config_path.as_str()]);
    table.add_row(vec!["Installed", yes_no(status.installed)]);
    table.add_row(vec!["Running", yes_no(status.running)]);
    if let Some(detail) = &status.detail {
        table.add_row(vec!["Details", detail.as_str()]);
    }
    table
}
