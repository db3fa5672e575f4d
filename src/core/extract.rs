//! Symbol Reference Extractor.
//!
//! Scans every source unit of every module and resolves each qualified
//! external reference (`Module::Symbol`) to its owning module, classifying
//! the symbol kind from the target module's declared export tables. Pure
//! static text analysis: no unit is ever executed.
//!
//! Extraction is embarrassingly parallel; units are scanned on the rayon
//! pool and the results joined before graph building.

use crate::core::descriptor::{DescriptorStore, ModuleDescriptor, MODULE_DESCRIPTOR_FILE};
use crate::core::error::ModguardError;
use rayon::prelude::*;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Namespaces that look like modules in qualified references but belong to
/// the host language/runtime. References through them are not cross-module
/// references and never resolve against the descriptor store.
const EXTERNAL_NAMESPACES: &[&str] = &[
    "Self", "Option", "Result", "Vec", "Box", "Arc", "String", "System", "Std",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Contract,
    Event,
    Dto,
    Entity,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolReference {
    pub source_module: String,
    pub source_unit: String,
    pub target_module: String,
    pub symbol: String,
    pub kind: SymbolKind,
}

/// One analysis run's raw extraction result: the reference set plus the
/// statically declared return type of each unit (used by the Query
/// return-type inspection in the rule checker).
#[derive(Debug, Default)]
pub struct ExtractionOutput {
    pub references: Vec<SymbolReference>,
    pub unit_return_types: FxHashMap<String, String>,
}

/// Classify a symbol against the owning module's declared tables.
pub fn classify_symbol(
    store: &DescriptorStore,
    target: &ModuleDescriptor,
    symbol: &str,
) -> SymbolKind {
    if target.exports_contract(symbol) {
        SymbolKind::Contract
    } else if target.exports_event(symbol) {
        SymbolKind::Event
    } else if target.exports_dto(symbol) {
        SymbolKind::Dto
    } else if target.declares_entity(symbol)
        || symbol.ends_with(&store.conventions.entity_suffix)
    {
        SymbolKind::Entity
    } else {
        SymbolKind::Internal
    }
}

/// Extract all symbol references for every module in the store.
///
/// A reference naming a module absent from the store is fatal for the run
/// (`UnresolvedModule`), per the analysis error taxonomy.
pub fn extract_project(
    store: &DescriptorStore,
    root: &Path,
) -> Result<ExtractionOutput, ModguardError> {
    let mut units: Vec<(String, String, PathBuf)> = Vec::new();
    for module in store.modules() {
        let dir = match store.module_dir(&module.name) {
            Some(d) => d.to_path_buf(),
            None => continue,
        };
        let mut files = Vec::new();
        collect_units(&dir, &store.conventions.source_extensions, &mut files)?;
        files.sort();
        for file in files {
            let rel = file
                .strip_prefix(root)
                .unwrap_or(&file)
                .to_string_lossy()
                .replace('\\', "/");
            units.push((module.name.clone(), rel, file));
        }
    }

    let scans: Result<Vec<UnitScan>, ModguardError> = units
        .par_iter()
        .map(|(module, rel, path)| {
            let content = fs::read_to_string(path).map_err(ModguardError::IoError)?;
            scan_unit(store, module, rel, &content)
        })
        .collect();

    let mut out = ExtractionOutput::default();
    for scan in scans? {
        if let Some(ret) = scan.declared_return_type {
            out.unit_return_types.insert(scan.unit.clone(), ret);
        }
        out.references.extend(scan.references);
    }
    Ok(out)
}

struct UnitScan {
    unit: String,
    references: Vec<SymbolReference>,
    declared_return_type: Option<String>,
}

/// Scan a single unit's text for qualified cross-module references.
fn scan_unit(
    store: &DescriptorStore,
    source_module: &str,
    unit: &str,
    content: &str,
) -> Result<UnitScan, ModguardError> {
    let qualified_re = Regex::new(r"\b([A-Z][A-Za-z0-9_]*)::([A-Z][A-Za-z0-9_]*)\b").unwrap();

    let mut seen: FxHashSet<(String, String)> = FxHashSet::default();
    let mut references = Vec::new();

    for cap in qualified_re.captures_iter(content) {
        let target_module = cap[1].to_string();
        let symbol = cap[2].to_string();
        if EXTERNAL_NAMESPACES.contains(&target_module.as_str()) {
            continue;
        }
        if !seen.insert((target_module.clone(), symbol.clone())) {
            continue;
        }
        let target = store.get(&target_module).ok_or_else(|| {
            ModguardError::UnresolvedModule {
                module: target_module.clone(),
                unit: unit.to_string(),
            }
        })?;
        let kind = classify_symbol(store, target, &symbol);
        references.push(SymbolReference {
            source_module: source_module.to_string(),
            source_unit: unit.to_string(),
            target_module,
            symbol,
            kind,
        });
    }

    Ok(UnitScan {
        unit: unit.to_string(),
        references,
        declared_return_type: declared_return_type(content),
    })
}

/// The unit's declared public return type, by signature inspection.
///
/// Takes the first `pub fn` arrow type, falling back to the first `fn`.
/// Values are never inspected; this is the static half of the inter-module
/// read exception.
pub fn declared_return_type(content: &str) -> Option<String> {
    let sig_re = Regex::new(r"(pub\s+)?fn\s+[A-Za-z0-9_]+\s*\([^)]*\)\s*->\s*([^\{;\n]+)").unwrap();
    let mut fallback: Option<String> = None;
    for cap in sig_re.captures_iter(content) {
        let ret = cap[2].trim().to_string();
        if cap.get(1).is_some() {
            return Some(ret);
        }
        if fallback.is_none() {
            fallback = Some(ret);
        }
    }
    fallback
}

/// Strip collection wrappers from a declared return type, yielding the
/// element type that must be a DTO for the read exception to hold.
pub fn collection_element_type(return_type: &str) -> &str {
    let t = return_type.trim();
    for wrapper in ["Vec<", "List<", "Iterable<", "Option<", "HashSet<"] {
        if let Some(inner) = t.strip_prefix(wrapper).and_then(|s| s.strip_suffix('>')) {
            return collection_element_type(inner);
        }
    }
    if let Some(inner) = t.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        return collection_element_type(inner);
    }
    t
}

fn collect_units(
    dir: &Path,
    extensions: &[String],
    out: &mut Vec<PathBuf>,
) -> Result<(), ModguardError> {
    if !dir.is_dir() {
        return Ok(());
    }
    let name = dir.file_name().and_then(|s| s.to_str()).unwrap_or("");
    if name == ".git" || name == "target" || name == "node_modules" {
        return Ok(());
    }
    for entry in fs::read_dir(dir).map_err(ModguardError::IoError)? {
        let entry = entry.map_err(ModguardError::IoError)?;
        let path = entry.path();
        if path.is_dir() {
            collect_units(&path, extensions, out)?;
        } else if path.is_file() {
            if path.file_name().and_then(|s| s.to_str()) == Some(MODULE_DESCRIPTOR_FILE) {
                continue;
            }
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if extensions.iter().any(|e| e == ext) {
                out.push(path);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_element_type_unwraps_nesting() {
        assert_eq!(collection_element_type("Vec<InvoiceDto>"), "InvoiceDto");
        assert_eq!(collection_element_type("Option<Vec<InvoiceDto>>"), "InvoiceDto");
        assert_eq!(collection_element_type("[CustomerDto]"), "CustomerDto");
        assert_eq!(collection_element_type("Invoice"), "Invoice");
    }

    #[test]
    fn declared_return_type_prefers_pub_fn() {
        let src = "fn helper() -> Invoice {}\npub fn list() -> Vec<InvoiceDto> {}\n";
        assert_eq!(declared_return_type(src).as_deref(), Some("Vec<InvoiceDto>"));
    }

    #[test]
    fn declared_return_type_falls_back_to_first_fn() {
        let src = "fn only() -> Invoice {}\n";
        assert_eq!(declared_return_type(src).as_deref(), Some("Invoice"));
    }
}
