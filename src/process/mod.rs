// Process module - Running external commands and supervising the server

pub mod runner;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use runner::{
    CommandOutput, CommandSpec, ProcessRunner, Runner, DEFAULT_STOP_TIMEOUT, OUTPUT_DRAIN_TIMEOUT,
};
pub use supervisor::{ServerSettings, ServerSupervisor, SupervisorState, DEFAULT_RESTART_COOLDOWN};
