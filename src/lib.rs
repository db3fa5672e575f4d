//! modguard: boundary enforcement and inter-module communication for
//! modular monoliths.
//!
//! A single-deployment application decomposed into business modules has no
//! compile-time guard against module A reaching into module B's internals.
//! modguard is the out-of-band enforcement layer:
//!
//! - **Offline analysis** (`check`): loads every module's declared exports
//!   (`module.toml`), extracts cross-module symbol references from source
//!   units, builds a dependency graph, and classifies every edge against
//!   the boundary rules. Pass/fail verdict with a machine-readable
//!   violation report; CI fails the build on any violation.
//! - **Contract Registry**: binds each declared Contract to exactly one
//!   implementation at process start, with a register-then-resolve
//!   two-phase protocol validated before anything runs.
//! - **Event Bus**: same-module listeners run synchronously; cross-module
//!   listeners get durable, at-least-once queued delivery with lease-based
//!   claims, retry with backoff, and operator-driven dead-letter replay.
//!
//! # Boundary rules
//!
//! Contracts, Events, and DTOs exported by a permitted module are legal to
//! reference. A raw persistence entity may be read across a boundary only
//! from a Query unit whose declared return type is a DTO collection.
//! Everything else is a violation.
//!
//! # Crate structure
//!
//! - [`core::descriptor`]: module descriptor store (`module.toml`)
//! - [`core::extract`]: symbol reference extraction (static, parallel)
//! - [`core::graph`]: dependency graph builder
//! - [`core::rules`]: boundary rule checker and violation report
//! - [`core::registry`]: contract registry
//! - [`core::bus`]: event bus and durable delivery queue

pub mod core;

mod cli;

use crate::cli::{Cli, Command, EventsCommand};
use crate::core::{bus, error, graph, rules};
use clap::Parser;
use colored::Colorize;
use std::path::PathBuf;

fn resolve_root(root: Option<PathBuf>) -> Result<PathBuf, error::ModguardError> {
    match root {
        Some(dir) => Ok(dir),
        None => std::env::current_dir().map_err(error::ModguardError::IoError),
    }
}

pub fn run() -> Result<(), error::ModguardError> {
    let cli = Cli::parse();

    match cli.command {
        Command::Version => {
            println!("v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Check(check) => {
            let root = resolve_root(check.root)?;
            let (dep_graph, report) = rules::run_analysis(&root)?;
            match check.format.as_str() {
                "json" => {
                    let body = serde_json::to_string_pretty(&report).map_err(|e| {
                        error::ModguardError::ValidationError(format!("report encode: {}", e))
                    })?;
                    println!("{}", body);
                }
                _ => {
                    print!("{}", rules::render_text(&report));
                    if check.verbose {
                        for edge in &dep_graph.edges {
                            println!(
                                "  edge {} -> {} [{:?}] {:?} ({})",
                                edge.source_module,
                                edge.target_module,
                                edge.kind,
                                edge.verdict,
                                edge.unit
                            );
                        }
                    }
                }
            }
            if !report.passed() {
                // CI contract: non-zero exit when any violation exists.
                return Err(error::ModguardError::ValidationError(format!(
                    "{} boundary violations",
                    report.violations.len()
                )));
            }
            Ok(())
        }
        Command::Graph(graph_cli) => {
            let root = resolve_root(graph_cli.root)?;
            let (dep_graph, _report) = rules::run_analysis(&root)?;
            match graph_cli.format.as_str() {
                "json" => {
                    let body = serde_json::to_string_pretty(&dep_graph).map_err(|e| {
                        error::ModguardError::ValidationError(format!("graph encode: {}", e))
                    })?;
                    println!("{}", body);
                }
                "mermaid" => print!("{}", graph::mermaid(&dep_graph)),
                _ => {
                    for edge in &dep_graph.edges {
                        println!(
                            "{} -> {} [{:?}] {:?} ({})",
                            edge.source_module,
                            edge.target_module,
                            edge.kind,
                            edge.verdict,
                            edge.unit
                        );
                    }
                }
            }
            Ok(())
        }
        Command::Events(events) => match events.command {
            EventsCommand::Pending { root } => {
                let root = resolve_root(root)?;
                print_deliveries(&bus::list_deliveries(&root, Some(bus::DeliveryState::Pending))?);
                Ok(())
            }
            EventsCommand::Deadletters { root } => {
                let root = resolve_root(root)?;
                print_deliveries(&bus::list_deliveries(
                    &root,
                    Some(bus::DeliveryState::DeadLettered),
                )?);
                Ok(())
            }
            EventsCommand::Requeue { delivery, root } => {
                let root = resolve_root(root)?;
                bus::requeue_delivery(&root, &delivery)?;
                println!("Requeued delivery {}", delivery);
                Ok(())
            }
            EventsCommand::Stats { root } => {
                let root = resolve_root(root)?;
                let stats = bus::queue_stats(&root)?;
                if stats.is_empty() {
                    println!("No deliveries recorded.");
                }
                for (state, count) in stats {
                    println!("{:>12}: {}", state, count);
                }
                Ok(())
            }
        },
    }
}

fn print_deliveries(rows: &[bus::DeliveryRow]) {
    if rows.is_empty() {
        println!("{}", "No deliveries.".dimmed());
        return;
    }
    for row in rows {
        println!(
            "{}  seq={} event={} ({}) listener={} attempts={} [{}]",
            row.delivery_id,
            row.seq,
            row.event_id,
            row.event_type,
            row.listener_id,
            row.attempt_count,
            row.state
        );
    }
}
