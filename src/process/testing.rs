// Scripted runner used by the unit tests of the supervised tasks

use crate::error::{KeeperError, Result};
use crate::process::{CommandOutput, CommandSpec, Runner};
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::time::Instant;

type Responder = Box<dyn Fn(&CommandSpec) -> Result<CommandOutput> + Send + Sync>;

/// One recorded invocation
#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub name: String,
    pub command_line: String,
    pub at: Instant,
}

/// Runner that answers from a closure instead of spawning processes
pub(crate) struct ScriptedRunner {
    calls: Mutex<Vec<Call>>,
    respond: Responder,
}

impl ScriptedRunner {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&CommandSpec) -> Result<CommandOutput> + Send + Sync + 'static,
    {
        Self {
            calls: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        }
    }

    /// Runner where every command succeeds with empty output
    pub fn succeeding() -> Self {
        Self::new(|_| Ok(CommandOutput::default()))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|call| call.command_line)
            .collect()
    }
}

#[async_trait]
impl Runner for ScriptedRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(Call {
            name: command.name().to_string(),
            command_line: command.command_line(),
            at: Instant::now(),
        });
        (self.respond)(command)
    }
}

/// Error returned by scripted commands that should fail
pub(crate) fn exit_failure(command: &CommandSpec) -> KeeperError {
    KeeperError::CommandFailed {
        name: command.name().to_string(),
        status: "exit status: 1".to_string(),
    }
}
