//! Contract Registry.
//!
//! Binds each module's declared Contract to exactly one implementation with
//! an explicit two-phase protocol: every `register` happens in the startup
//! window, `validate_all` checks the binding table against the declared
//! exports and seals it, and from then on the registry is read-mostly and
//! `resolve` takes only shared locks.
//!
//! Instances are constructed lazily on first resolve. Singleton bindings
//! cache the instance for the registry's lifetime; Transient bindings run
//! the factory on every resolution.

use crate::core::descriptor::DescriptorStore;
use crate::core::error::ModguardError;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

pub type ContractInstance = Arc<dyn Any + Send + Sync>;
pub type ContractFactory = Arc<dyn Fn() -> ContractInstance + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Singleton,
    Transient,
}

struct Binding {
    module_owner: String,
    lifecycle: Lifecycle,
    factory: ContractFactory,
    cached: Option<ContractInstance>,
}

#[derive(Default)]
pub struct ContractRegistry {
    bindings: RwLock<FxHashMap<String, Binding>>,
    sealed: AtomicBool,
}

impl ContractRegistry {
    pub fn new() -> Self {
        ContractRegistry {
            bindings: RwLock::new(FxHashMap::default()),
            sealed: AtomicBool::new(false),
        }
    }

    /// Bind `contract_id` to an implementation factory. Only legal during
    /// the startup window, and only once per contract id.
    pub fn register(
        &self,
        contract_id: &str,
        module_owner: &str,
        lifecycle: Lifecycle,
        factory: ContractFactory,
    ) -> Result<(), ModguardError> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(ModguardError::ValidationError(format!(
                "registration window closed; cannot bind '{}'",
                contract_id
            )));
        }
        let mut bindings = self.bindings.write().expect("registry lock poisoned");
        if bindings.contains_key(contract_id) {
            return Err(ModguardError::DuplicateBinding(contract_id.to_string()));
        }
        bindings.insert(
            contract_id.to_string(),
            Binding {
                module_owner: module_owner.to_string(),
                lifecycle,
                factory,
                cached: None,
            },
        );
        Ok(())
    }

    /// Resolve the bound instance for `contract_id`, constructing it on
    /// first use for Singleton bindings.
    pub fn resolve(&self, contract_id: &str) -> Result<ContractInstance, ModguardError> {
        let (factory, lifecycle) = {
            let bindings = self.bindings.read().expect("registry lock poisoned");
            let binding = bindings
                .get(contract_id)
                .ok_or_else(|| ModguardError::UnboundContract(contract_id.to_string()))?;
            if binding.lifecycle == Lifecycle::Singleton {
                if let Some(instance) = &binding.cached {
                    return Ok(instance.clone());
                }
            }
            (binding.factory.clone(), binding.lifecycle)
        };

        // The factory runs outside any lock so implementations may resolve
        // their own dependencies during construction.
        let instance = factory();

        if lifecycle == Lifecycle::Singleton {
            let mut bindings = self.bindings.write().expect("registry lock poisoned");
            if let Some(binding) = bindings.get_mut(contract_id) {
                if let Some(existing) = &binding.cached {
                    return Ok(existing.clone());
                }
                binding.cached = Some(instance.clone());
            }
        }
        Ok(instance)
    }

    /// Typed resolve: downcast the bound instance to its concrete type.
    pub fn resolve_as<T: Any + Send + Sync>(
        &self,
        contract_id: &str,
    ) -> Result<Arc<T>, ModguardError> {
        self.resolve(contract_id)?.downcast::<T>().map_err(|_| {
            ModguardError::ValidationError(format!(
                "contract '{}' bound to a different concrete type",
                contract_id
            ))
        })
    }

    pub fn owner_of(&self, contract_id: &str) -> Option<String> {
        let bindings = self.bindings.read().expect("registry lock poisoned");
        bindings.get(contract_id).map(|b| b.module_owner.clone())
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Verify every exported contract across all modules has a binding,
    /// then seal the registry. Fails startup with the aggregated unbound
    /// list; a process must not start in an inconsistent binding state.
    pub fn validate_all(&self, store: &DescriptorStore) -> Result<(), ModguardError> {
        let bindings = self.bindings.read().expect("registry lock poisoned");
        let mut unbound = Vec::new();
        for module in store.modules() {
            for contract in &module.exported_contracts {
                if !bindings.contains_key(contract) {
                    unbound.push(format!("{} (exported by {})", contract, module.name));
                }
            }
        }
        drop(bindings);
        if !unbound.is_empty() {
            return Err(ModguardError::UnboundContracts(unbound));
        }
        self.sealed.store(true, Ordering::Release);
        Ok(())
    }
}
