use std::fmt;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Result, SchedulerError};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A native command as a program plus argument vector. Never goes through a
/// shell, so paths with spaces or quotes reach the OS tool untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCommand {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

impl NativeCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

impl fmt::Display for NativeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turns a non-zero exit into `NativeCommandFailed`.
    pub fn into_result(self, cmd: &NativeCommand) -> Result<CommandOutput> {
        if self.success() {
            return Ok(self);
        }
        let stderr = if self.stderr.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            self.stderr.trim().to_string()
        };
        Err(SchedulerError::NativeCommandFailed {
            command: cmd.to_string(),
            code: self.code,
            stderr,
        })
    }
}

/// Runs native scheduler commands.
///
/// Returns `Err` only when the command could not be run to completion
/// (spawn failure or timeout). A non-zero exit is reported through
/// [`CommandOutput`] because several probes treat it as an answer, not a
/// failure.
pub trait CommandRunner: Send + Sync {
    fn run(&self, cmd: &NativeCommand) -> Result<CommandOutput>;
}

/// Runs commands on the host with a hard timeout.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &NativeCommand) -> Result<CommandOutput> {
        log::debug!("running `{}`", cmd);

        let failed = |stderr: String| SchedulerError::NativeCommandFailed {
            command: cmd.to_string(),
            code: None,
            stderr,
        };

        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| failed(format!("failed to spawn: {}", e)))?;

        // Fed from its own thread so a tool that never reads its input still
        // runs into the timeout below. The pipe closes when the thread ends.
        let feeder = match (cmd.stdin.clone(), child.stdin.take()) {
            (Some(input), Some(mut stdin)) => {
                Some(thread::spawn(move || stdin.write_all(input.as_bytes())))
            }
            _ => None,
        };

        // Drain both pipes concurrently so a chatty tool cannot block on a
        // full pipe while we poll for its exit.
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let start = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if start.elapsed() > self.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    log::warn!("`{}` timed out after {:?}", cmd, self.timeout);
                    return Err(failed(format!("timed out after {:?}", self.timeout)));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(failed(format!("failed to wait: {}", e))),
            }
        };

        if let Some(feeder) = feeder {
            match feeder.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(failed(format!("failed to write stdin: {}", e))),
                Err(_) => return Err(failed("stdin writer panicked".to_string())),
            }
        }

        let output = CommandOutput {
            code: status.code(),
            stdout: stdout.map(join_drain).unwrap_or_default(),
            stderr: stderr.map(join_drain).unwrap_or_default(),
        };
        log::debug!("`{}` exited with {:?}", cmd, output.code);
        Ok(output)
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_drain(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}
