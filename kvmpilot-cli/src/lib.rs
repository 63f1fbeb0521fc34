//! # kvmpilot CLI
//!
//! Argument parsing, configuration and subcommand execution for the
//! `kvmpilot` binary. Kept as a library so the wiring is testable without
//! spawning the binary.

pub mod cli;
pub mod commands;
pub mod config;

pub use cli::{Args, Command};
pub use commands::{run, OutputFormat};
pub use config::{Config, ConnectionConfig, DEFAULT_CONFIG_PATH};
