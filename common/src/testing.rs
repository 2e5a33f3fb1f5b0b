//! Test doubles for the native command seam.

use std::sync::Mutex;

use crate::error::Result;
use crate::runner::{CommandOutput, CommandRunner, NativeCommand};

type Handler = Box<dyn Fn(&NativeCommand) -> Result<CommandOutput> + Send + Sync>;

/// Records every command and answers with a scripted handler.
pub struct FakeRunner {
    handler: Handler,
    calls: Mutex<Vec<NativeCommand>>,
}

impl FakeRunner {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&NativeCommand) -> Result<CommandOutput> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(|_| Ok(ok("")))
    }

    /// Rendered command lines, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.commands().iter().map(ToString::to_string).collect()
    }

    pub fn commands(&self) -> Vec<NativeCommand> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, cmd: &NativeCommand) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(cmd.clone());
        (self.handler)(cmd)
    }
}

pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn exit(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        code: Some(code),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}
