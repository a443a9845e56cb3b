//! Command-line interface for docker-exec.
//!
//! Provides commands for probing the daemon, listing images and containers,
//! pulling images and running disposable analysis containers.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
