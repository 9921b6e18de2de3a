//! CLI module for the deployer.
//!
//! This module provides the command-line interface for deploying and
//! managing one Cloud Foundry application.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
