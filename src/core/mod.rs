//! Core subsystems of the boundary enforcement engine.
//!
//! The offline analysis pipeline (`descriptor` → `extract` → `graph` →
//! `rules`) and the runtime composition layer (`registry`, `bus`) both
//! live here, along with the shared primitives they use.

pub mod bus;
pub mod db;
pub mod descriptor;
pub mod error;
pub mod extract;
pub mod graph;
pub mod output;
pub mod registry;
pub mod rules;
pub mod schemas;
pub mod time;
