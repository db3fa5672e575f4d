//! Boundary Rule Checker.
//!
//! Walks the classified dependency graph and assigns every edge a verdict.
//! Contracts, events, and DTOs are the sanctioned public surfaces; raw
//! entity reads are legal only from Query units whose declared return type
//! is a DTO collection; everything else crossing a module boundary is a
//! violation. The run's verdict is Pass iff the violation set is empty.
//!
//! Violations are data, not errors: the checker always completes the walk
//! and reports every illegal edge, never just the first.

use crate::core::descriptor::DescriptorStore;
use crate::core::error::ModguardError;
use crate::core::extract::{self, SymbolKind};
use crate::core::graph::{self, DependencyGraph, Verdict};
use crate::core::output;
use colored::Colorize;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

pub const REASON_ILLEGAL_DEPENDENCY: &str = "illegal-dependency";
pub const REASON_INTERNAL_SYMBOL: &str = "internal-symbol";
pub const REASON_ENTITY_ACCESS: &str = "entity-access";
pub const REASON_RAW_ENTITY_LEAK: &str = "raw-entity-leak";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Violation {
    pub source_module: String,
    pub target_module: String,
    pub unit: String,
    pub symbol: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub modules: usize,
    pub edges: usize,
    pub violations: Vec<Violation>,
    /// SHA-256 over the classified edge set; identical sources yield
    /// identical fingerprints.
    pub fingerprint: String,
    pub verdict: String,
}

impl AnalysisReport {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Classify every edge in place and collect one violation per illegal edge.
pub fn check_graph(
    store: &DescriptorStore,
    graph: &mut DependencyGraph,
    unit_return_types: &FxHashMap<String, String>,
) -> Vec<Violation> {
    let mut violations = Vec::new();

    for edge in &mut graph.edges {
        let reason = edge_violation(store, edge, unit_return_types);
        match reason {
            None => edge.verdict = Verdict::Legal,
            Some(reason) => {
                edge.verdict = Verdict::Illegal;
                violations.push(Violation {
                    source_module: edge.source_module.clone(),
                    target_module: edge.target_module.clone(),
                    unit: edge.unit.clone(),
                    symbol: edge.symbol.clone(),
                    reason: reason.to_string(),
                });
            }
        }
    }

    violations
}

fn edge_violation(
    store: &DescriptorStore,
    edge: &graph::DependencyEdge,
    unit_return_types: &FxHashMap<String, String>,
) -> Option<&'static str> {
    // The allow-list check dominates: an unsanctioned target module is
    // illegal regardless of what kind of symbol was touched.
    if let Some(source) = store.get(&edge.source_module) {
        if !source.permits(&edge.target_module) {
            return Some(REASON_ILLEGAL_DEPENDENCY);
        }
    }

    match edge.kind {
        SymbolKind::Contract | SymbolKind::Event | SymbolKind::Dto => None,
        SymbolKind::Internal => Some(REASON_INTERNAL_SYMBOL),
        SymbolKind::Entity => {
            if !store.is_query_unit(&edge.unit) {
                return Some(REASON_ENTITY_ACCESS);
            }
            let dto_return = unit_return_types
                .get(&edge.unit)
                .map(|ret| store.is_dto_type(extract::collection_element_type(ret)))
                .unwrap_or(false);
            if dto_return {
                None
            } else {
                Some(REASON_RAW_ENTITY_LEAK)
            }
        }
    }
}

/// The complete offline pass: descriptors → extraction → graph → verdicts.
///
/// A pure function of the current source tree; no state survives the run.
pub fn run_analysis(
    root: &Path,
) -> Result<(DependencyGraph, AnalysisReport), ModguardError> {
    let store = DescriptorStore::load(root)?;
    if store.is_empty() {
        return Err(ModguardError::NotFound(format!(
            "no module descriptors under {}",
            root.display()
        )));
    }

    let extraction = extract::extract_project(&store, root)?;
    let mut dep_graph = graph::build_graph(&store, &extraction);
    let violations = check_graph(&store, &mut dep_graph, &extraction.unit_return_types);

    let report = AnalysisReport {
        modules: store.len(),
        edges: dep_graph.edges.len(),
        fingerprint: fingerprint(&dep_graph),
        verdict: if violations.is_empty() { "pass" } else { "fail" }.to_string(),
        violations,
    };
    Ok((dep_graph, report))
}

/// Deterministic digest of the classified edge set.
pub fn fingerprint(graph: &DependencyGraph) -> String {
    let mut hasher = Sha256::new();
    for edge in &graph.edges {
        hasher.update(edge.source_module.as_bytes());
        hasher.update(b"\0");
        hasher.update(edge.target_module.as_bytes());
        hasher.update(b"\0");
        hasher.update(edge.symbol.as_bytes());
        hasher.update(b"\0");
        hasher.update(format!("{:?}\0{:?}\n", edge.kind, edge.verdict).as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Terminal rendering for the CI surface.
pub fn render_text(report: &AnalysisReport) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Modules: {}  Edges: {}  Fingerprint: {}\n",
        report.modules,
        report.edges,
        &report.fingerprint[..12.min(report.fingerprint.len())]
    ));
    if report.passed() {
        out.push_str(&format!("{}\n", "Boundary check: PASS".green().bold()));
        return out;
    }
    out.push_str(&format!(
        "{} ({} violations: {})\n",
        "Boundary check: FAIL".red().bold(),
        report.violations.len(),
        output::counted_summary(&reason_counts(&report.violations))
    ));
    for v in &report.violations {
        out.push_str(&format!(
            "  {} {} -> {} [{}] {}\n",
            v.reason.red(),
            v.source_module,
            v.target_module,
            v.symbol,
            output::compact_line(&v.unit, 80)
        ));
    }
    out
}

fn reason_counts(violations: &[Violation]) -> Vec<(String, usize)> {
    let mut counts: FxHashMap<&str, usize> = FxHashMap::default();
    for v in violations {
        *counts.entry(v.reason.as_str()).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .map(|(reason, count)| (reason.to_string(), count))
        .collect()
}
