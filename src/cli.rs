//! CLI struct definitions for the phasegate command-line interface.
//!
//! All clap-derived types live here. Dispatch logic lives in `lib.rs`.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "phasegate",
    version = env!("CARGO_PKG_VERSION"),
    about = "Drive task cards through dependency-ordered workflows and phase gates, with resumable checkpoints and a hash-chained evidence trail."
)]
pub(crate) struct Cli {
    /// Project root (defaults to the nearest directory holding `.phasegate/` or `phasegate.toml`).
    #[clap(long, global = true)]
    pub dir: Option<PathBuf>,
    /// Output format.
    #[clap(long, global = true, value_enum, default_value = "text")]
    pub format: OutputFormat,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Show the current phase, workflow states and carried soft items.
    Status,
    /// Print the execution order without running anything.
    #[clap(name = "dry-run")]
    DryRun,
    /// Continue from the checkpoint until a phase does not reach DONE.
    Resume,
    /// Run a single workflow whose dependencies are already done.
    Run {
        /// Workflow id from the plan manifest.
        workflow: String,
    },
    /// Report schema findings for every task card.
    Validate,
    /// Evaluate the current phase gate without running workflows.
    Gate,
    /// Evidence ledger operations.
    Evidence(EvidenceCli),
    /// Archive the checkpoint and start over from the first phase.
    Reset,
}

#[derive(clap::Args, Debug)]
pub(crate) struct EvidenceCli {
    #[clap(subcommand)]
    pub command: EvidenceCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum EvidenceCommand {
    /// Check that every done card has evidence and the hash chain is intact.
    Verify,
}
