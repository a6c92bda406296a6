//! Command-line interface definitions for the `gpulaunch` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `gpulaunch` binary.
#[derive(Debug, Parser)]
#[command(
    name = "gpulaunch",
    about = "Provision a GPU VM and wait until its model services are serving",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Create a GPU instance and follow it through every readiness phase.
    #[command(
        name = "deploy",
        about = "Create a GPU instance and wait until it is ready"
    )]
    Deploy(DeployCommand),
}

/// Arguments for the `gpulaunch deploy` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct DeployCommand {
    /// Suppress relayed progress messages from the instance.
    ///
    /// Phase transitions, warnings and the final report are still printed.
    #[arg(long)]
    pub(crate) silent: bool,
}
