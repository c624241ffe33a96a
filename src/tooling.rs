//! Tooling
//!
//! Operator facing entry points over the storage engine.

pub mod cli;

pub use cli::{Cli, CliContext, Commands};
