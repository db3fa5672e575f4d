//! Module Descriptor Store.
//!
//! Each business module declares its identity in a `module.toml` at its
//! directory root: name, exported contract/event/DTO types, persistence
//! entities, and the allow-list of modules it may depend on. Descriptors are
//! pure data; the store is immutable for the duration of an analysis run.
//!
//! Project-wide analysis conventions (what marks a unit as a Query, which
//! name suffixes denote entities/DTOs, which file extensions are source
//! units) live in an optional `modguard.toml` at the project root.

use crate::core::error::ModguardError;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const MODULE_DESCRIPTOR_FILE: &str = "module.toml";
pub const PROJECT_CONFIG_FILE: &str = "modguard.toml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModuleDescriptor {
    pub name: String,
    #[serde(default)]
    pub exported_contracts: Vec<String>,
    #[serde(default)]
    pub exported_events: Vec<String>,
    #[serde(default)]
    pub exported_dtos: Vec<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub permitted_dependencies: Vec<String>,
}

impl ModuleDescriptor {
    pub fn exports_contract(&self, symbol: &str) -> bool {
        self.exported_contracts.iter().any(|s| s == symbol)
    }

    pub fn exports_event(&self, symbol: &str) -> bool {
        self.exported_events.iter().any(|s| s == symbol)
    }

    pub fn exports_dto(&self, symbol: &str) -> bool {
        self.exported_dtos.iter().any(|s| s == symbol)
    }

    pub fn declares_entity(&self, symbol: &str) -> bool {
        self.entities.iter().any(|s| s == symbol)
    }

    pub fn permits(&self, other: &str) -> bool {
        self.name == other || self.permitted_dependencies.iter().any(|m| m == other)
    }
}

#[derive(Debug, Deserialize)]
struct DescriptorFile {
    module: ModuleDescriptor,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Conventions {
    /// Path fragment marking Query units (e.g. `modules/Billing/queries/...`).
    pub query_path_fragment: String,
    /// File-stem suffix marking Query units (e.g. `InvoiceSummaryQuery`).
    pub query_unit_suffix: String,
    /// Type-name suffix denoting a persistence entity when not declared.
    pub entity_suffix: String,
    /// Type-name suffix denoting a DTO when not declared.
    pub dto_suffix: String,
    /// Extensions of files treated as source units.
    pub source_extensions: Vec<String>,
}

impl Default for Conventions {
    fn default() -> Self {
        Conventions {
            query_path_fragment: "queries/".to_string(),
            query_unit_suffix: "Query".to_string(),
            entity_suffix: "Entity".to_string(),
            dto_suffix: "Dto".to_string(),
            source_extensions: vec!["rs".to_string(), "cs".to_string(), "php".to_string()],
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ProjectConfigFile {
    #[serde(default)]
    conventions: Option<Conventions>,
}

/// Immutable per-run view of every module's declared identity.
#[derive(Debug, Clone)]
pub struct DescriptorStore {
    modules: FxHashMap<String, ModuleDescriptor>,
    module_dirs: FxHashMap<String, PathBuf>,
    pub conventions: Conventions,
}

impl DescriptorStore {
    /// Scan `root` for `module.toml` descriptors and load the project
    /// conventions from `modguard.toml` when present.
    pub fn load(root: &Path) -> Result<Self, ModguardError> {
        let conventions = load_conventions(root)?;
        let mut descriptor_paths = Vec::new();
        collect_descriptors(root, &mut descriptor_paths)?;
        descriptor_paths.sort();

        let mut modules = FxHashMap::default();
        let mut module_dirs = FxHashMap::default();
        for path in descriptor_paths {
            let content = fs::read_to_string(&path).map_err(ModguardError::IoError)?;
            let parsed: DescriptorFile =
                toml::from_str(&content).map_err(|e| ModguardError::DescriptorError {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
            let descriptor = parsed.module;
            if descriptor.name.trim().is_empty() {
                return Err(ModguardError::DescriptorError {
                    path: path.display().to_string(),
                    message: "module name must not be empty".to_string(),
                });
            }
            let dir = path
                .parent()
                .unwrap_or(root)
                .to_path_buf();
            if modules
                .insert(descriptor.name.clone(), descriptor.clone())
                .is_some()
            {
                return Err(ModguardError::DescriptorError {
                    path: path.display().to_string(),
                    message: format!("duplicate module name '{}'", descriptor.name),
                });
            }
            module_dirs.insert(descriptor.name, dir);
        }

        Ok(DescriptorStore {
            modules,
            module_dirs,
            conventions,
        })
    }

    pub fn get(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.modules.get(name)
    }

    pub fn module_dir(&self, name: &str) -> Option<&Path> {
        self.module_dirs.get(name).map(|p| p.as_path())
    }

    /// Modules in deterministic (name) order.
    pub fn modules(&self) -> Vec<&ModuleDescriptor> {
        let mut all: Vec<&ModuleDescriptor> = self.modules.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// The module exporting `event_type`, if any. Event types are owned by
    /// exactly one module; the first declaring module in name order wins.
    pub fn event_owner(&self, event_type: &str) -> Option<&ModuleDescriptor> {
        self.modules().into_iter().find(|m| m.exports_event(event_type))
    }

    /// True if `type_name` is a sanctioned DTO anywhere in the project,
    /// either declared in an export table or by the configured suffix.
    pub fn is_dto_type(&self, type_name: &str) -> bool {
        type_name.ends_with(&self.conventions.dto_suffix)
            || self.modules.values().any(|m| m.exports_dto(type_name))
    }

    /// Query-unit classification per the declared conventions.
    pub fn is_query_unit(&self, unit_rel_path: &str) -> bool {
        let normalized = unit_rel_path.replace('\\', "/");
        if normalized.contains(&self.conventions.query_path_fragment) {
            return true;
        }
        let stem = Path::new(&normalized)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("");
        stem.ends_with(&self.conventions.query_unit_suffix)
    }
}

fn load_conventions(root: &Path) -> Result<Conventions, ModguardError> {
    let config_path = root.join(PROJECT_CONFIG_FILE);
    if !config_path.exists() {
        return Ok(Conventions::default());
    }
    let content = fs::read_to_string(&config_path).map_err(ModguardError::IoError)?;
    let parsed: ProjectConfigFile =
        toml::from_str(&content).map_err(|e| ModguardError::DescriptorError {
            path: config_path.display().to_string(),
            message: e.to_string(),
        })?;
    Ok(parsed.conventions.unwrap_or_default())
}

fn collect_descriptors(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), ModguardError> {
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
            collect_descriptors(&path, out)?;
        } else if path.file_name().and_then(|s| s.to_str()) == Some(MODULE_DESCRIPTOR_FILE) {
            out.push(path);
        }
    }
    Ok(())
}
