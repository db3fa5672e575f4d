//! Dependency Graph Builder.
//!
//! Aggregates raw symbol references into a directed module graph with one
//! edge per (source module, target module, symbol). Self-references are
//! dropped: a module is always free to use its own internals. The graph is
//! a pure function of one extraction run; nothing carries over between runs.

use crate::core::descriptor::DescriptorStore;
use crate::core::extract::{ExtractionOutput, SymbolKind};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Legal,
    Illegal,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub source_module: String,
    pub target_module: String,
    pub symbol: String,
    pub kind: SymbolKind,
    /// First unit witnessed referencing the symbol, for reporting.
    pub unit: String,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencyGraph {
    pub modules: Vec<String>,
    pub edges: Vec<DependencyEdge>,
}

pub fn build_graph(store: &DescriptorStore, extraction: &ExtractionOutput) -> DependencyGraph {
    let mut seen: FxHashSet<(String, String, String)> = FxHashSet::default();
    let mut edges = Vec::new();

    for reference in &extraction.references {
        if reference.source_module == reference.target_module {
            continue;
        }
        let key = (
            reference.source_module.clone(),
            reference.target_module.clone(),
            reference.symbol.clone(),
        );
        if !seen.insert(key) {
            continue;
        }
        edges.push(DependencyEdge {
            source_module: reference.source_module.clone(),
            target_module: reference.target_module.clone(),
            symbol: reference.symbol.clone(),
            kind: reference.kind,
            unit: reference.source_unit.clone(),
            verdict: Verdict::Pending,
        });
    }

    edges.sort_by(|a, b| {
        (&a.source_module, &a.target_module, &a.symbol)
            .cmp(&(&b.source_module, &b.target_module, &b.symbol))
    });

    DependencyGraph {
        modules: store.modules().iter().map(|m| m.name.clone()).collect(),
        edges,
    }
}

/// Render the module graph as a mermaid diagram for docs and review.
pub fn mermaid(graph: &DependencyGraph) -> String {
    let mut out = String::from("graph TD\n");
    for module in &graph.modules {
        let id = module.replace(|c: char| !c.is_alphanumeric(), "_");
        out.push_str(&format!("  {}[\"{}\"]\n", id, module));
    }
    let mut pairs: Vec<(String, String)> = graph
        .edges
        .iter()
        .map(|e| (e.source_module.clone(), e.target_module.clone()))
        .collect();
    pairs.sort();
    pairs.dedup();
    for (src, dst) in pairs {
        let a = src.replace(|c: char| !c.is_alphanumeric(), "_");
        let b = dst.replace(|c: char| !c.is_alphanumeric(), "_");
        out.push_str(&format!("  {} --> {}\n", a, b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::extract::SymbolReference;

    fn reference(src: &str, dst: &str, symbol: &str, unit: &str) -> SymbolReference {
        SymbolReference {
            source_module: src.to_string(),
            source_unit: unit.to_string(),
            target_module: dst.to_string(),
            symbol: symbol.to_string(),
            kind: SymbolKind::Internal,
        }
    }

    #[test]
    fn self_edges_are_discarded() {
        let extraction = ExtractionOutput {
            references: vec![reference("Billing", "Billing", "Invoice", "a.rs")],
            ..Default::default()
        };
        let store = store_with(&["Billing"]);
        let graph = build_graph(&store, &extraction);
        assert!(graph.edges.is_empty());
    }

    #[test]
    fn edges_dedupe_by_symbol_keeping_first_unit() {
        let extraction = ExtractionOutput {
            references: vec![
                reference("Billing", "Shipping", "Parcel", "a.rs"),
                reference("Billing", "Shipping", "Parcel", "b.rs"),
                reference("Billing", "Shipping", "Carrier", "b.rs"),
            ],
            ..Default::default()
        };
        let store = store_with(&["Billing", "Shipping"]);
        let graph = build_graph(&store, &extraction);
        assert_eq!(graph.edges.len(), 2);
        let parcel = graph.edges.iter().find(|e| e.symbol == "Parcel").unwrap();
        assert_eq!(parcel.unit, "a.rs");
        assert!(graph.edges.iter().all(|e| e.verdict == Verdict::Pending));
    }

    fn store_with(names: &[&str]) -> DescriptorStore {
        use std::fs;
        let tmp = tempfile::tempdir().expect("tempdir");
        for name in names {
            let dir = tmp.path().join(name);
            fs::create_dir_all(&dir).expect("module dir");
            fs::write(
                dir.join("module.toml"),
                format!("[module]\nname = \"{}\"\n", name),
            )
            .expect("descriptor");
        }
        DescriptorStore::load(tmp.path()).expect("store")
    }
}
