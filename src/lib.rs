// Library exports for Worldkeeper

pub mod app;
pub mod backup;
pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod plugins;
pub mod process;
pub mod shutdown;
