//! docker-exec: run disposable analysis containers against a Docker daemon.
//!
//! This library provides a capability-bounded client over image retrieval,
//! container lifecycle and daemon health, plus a test double so code built
//! on top of it can be tested without a daemon.

pub mod cli;
pub mod error;
pub mod execution;

pub use error::DockerError;
