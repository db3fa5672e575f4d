//! CLI struct definitions for the modguard command-line interface.
//!
//! All clap-derived types live here. Dispatch logic lives in `lib.rs`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "modguard",
    version = env!("CARGO_PKG_VERSION"),
    about = "Boundary enforcement for modular monoliths: static dependency analysis, contract bindings, durable cross-module events."
)]
pub(crate) struct Cli {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(clap::Args, Debug)]
pub(crate) struct CheckCli {
    /// Project root containing module descriptors (defaults to cwd).
    #[clap(long)]
    pub root: Option<PathBuf>,
    /// Output format: 'text' or 'json'.
    #[clap(long, default_value = "text")]
    pub format: String,
    /// Print every classified edge, not just violations.
    #[clap(long, short = 'v')]
    pub verbose: bool,
}

#[derive(clap::Args, Debug)]
pub(crate) struct GraphCli {
    /// Project root containing module descriptors (defaults to cwd).
    #[clap(long)]
    pub root: Option<PathBuf>,
    /// Output format: 'text', 'json', or 'mermaid'.
    #[clap(long, default_value = "text")]
    pub format: String,
}

#[derive(clap::Args, Debug)]
pub(crate) struct EventsCli {
    #[clap(subcommand)]
    pub command: EventsCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum EventsCommand {
    /// List pending deliveries.
    Pending {
        /// Event store root (defaults to cwd).
        #[clap(long)]
        root: Option<PathBuf>,
    },
    /// List dead-lettered deliveries awaiting operator action.
    Deadletters {
        /// Event store root (defaults to cwd).
        #[clap(long)]
        root: Option<PathBuf>,
    },
    /// Return a dead-lettered delivery to the queue.
    Requeue {
        /// Delivery id to requeue.
        #[clap(long)]
        delivery: String,
        /// Event store root (defaults to cwd).
        #[clap(long)]
        root: Option<PathBuf>,
    },
    /// Per-state delivery counts.
    Stats {
        /// Event store root (defaults to cwd).
        #[clap(long)]
        root: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Run the offline boundary analysis pass (CI gate; non-zero exit on violations).
    Check(CheckCli),

    /// Dump the classified module dependency graph.
    Graph(GraphCli),

    /// Inspect and operate on the durable delivery queue.
    Events(EventsCli),

    /// Print version.
    Version,
}
