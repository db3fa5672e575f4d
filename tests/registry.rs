use modguard::core::descriptor::DescriptorStore;
use modguard::core::error::ModguardError;
use modguard::core::registry::{ContractInstance, ContractRegistry, Lifecycle};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

struct BillingService {
    label: String,
}

fn factory_counting(counter: Arc<AtomicUsize>) -> Arc<dyn Fn() -> ContractInstance + Send + Sync> {
    Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Arc::new(BillingService {
            label: "billing".to_string(),
        }) as ContractInstance
    })
}

fn store_with_contracts(root: &Path, entries: &[(&str, &[&str])]) -> DescriptorStore {
    for (name, contracts) in entries {
        let dir = root.join(name);
        fs::create_dir_all(&dir).expect("module dir");
        let list = contracts
            .iter()
            .map(|c| format!("\"{}\"", c))
            .collect::<Vec<_>>()
            .join(", ");
        fs::write(
            dir.join("module.toml"),
            format!("[module]\nname = \"{}\"\nexported_contracts = [{}]\n", name, list),
        )
        .expect("descriptor");
    }
    DescriptorStore::load(root).expect("store")
}

#[test]
fn register_twice_for_same_contract_is_a_duplicate_binding() {
    let registry = ContractRegistry::new();
    let counter = Arc::new(AtomicUsize::new(0));
    registry
        .register("BillingContract", "Billing", Lifecycle::Singleton, factory_counting(counter.clone()))
        .expect("first register");
    let err = registry
        .register("BillingContract", "Billing", Lifecycle::Singleton, factory_counting(counter))
        .expect_err("second register must fail");
    assert!(matches!(err, ModguardError::DuplicateBinding(c) if c == "BillingContract"));
}

#[test]
fn resolve_on_unbound_contract_fails() {
    let registry = ContractRegistry::new();
    let err = registry.resolve("NobodyHome").expect_err("must fail");
    assert!(matches!(err, ModguardError::UnboundContract(c) if c == "NobodyHome"));
}

#[test]
fn singleton_is_constructed_lazily_and_cached() {
    let registry = ContractRegistry::new();
    let counter = Arc::new(AtomicUsize::new(0));
    registry
        .register("BillingContract", "Billing", Lifecycle::Singleton, factory_counting(counter.clone()))
        .expect("register");
    assert_eq!(counter.load(Ordering::SeqCst), 0, "no construction before resolve");

    let first = registry.resolve("BillingContract").expect("resolve");
    let second = registry.resolve("BillingContract").expect("resolve again");
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn transient_constructs_a_fresh_instance_per_resolve() {
    let registry = ContractRegistry::new();
    let counter = Arc::new(AtomicUsize::new(0));
    registry
        .register("BillingContract", "Billing", Lifecycle::Transient, factory_counting(counter.clone()))
        .expect("register");

    let first = registry.resolve("BillingContract").expect("resolve");
    let second = registry.resolve("BillingContract").expect("resolve");
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert!(!Arc::ptr_eq(&first, &second));
}

#[test]
fn resolve_as_downcasts_to_the_concrete_type() {
    let registry = ContractRegistry::new();
    registry
        .register(
            "BillingContract",
            "Billing",
            Lifecycle::Singleton,
            Arc::new(|| {
                Arc::new(BillingService {
                    label: "billing".to_string(),
                }) as ContractInstance
            }),
        )
        .expect("register");
    let service = registry
        .resolve_as::<BillingService>("BillingContract")
        .expect("typed resolve");
    assert_eq!(service.label, "billing");
}

#[test]
fn validate_all_passes_when_every_exported_contract_is_bound() {
    let tmp = tempdir().expect("tempdir");
    let store = store_with_contracts(
        tmp.path(),
        &[("Billing", &["BillingContract"]), ("Customers", &["CustomerContract"])],
    );

    let registry = ContractRegistry::new();
    let counter = Arc::new(AtomicUsize::new(0));
    registry
        .register("BillingContract", "Billing", Lifecycle::Singleton, factory_counting(counter.clone()))
        .expect("register billing");
    registry
        .register("CustomerContract", "Customers", Lifecycle::Singleton, factory_counting(counter))
        .expect("register customers");

    registry.validate_all(&store).expect("startup validation");
    assert!(registry.is_sealed());
}

#[test]
fn validate_all_aggregates_every_unbound_contract() {
    let tmp = tempdir().expect("tempdir");
    let store = store_with_contracts(
        tmp.path(),
        &[("Billing", &["BillingContract"]), ("Customers", &["CustomerContract"])],
    );

    let registry = ContractRegistry::new();
    let err = registry.validate_all(&store).expect_err("must fail");
    match err {
        ModguardError::UnboundContracts(list) => {
            assert_eq!(list.len(), 2);
            assert!(list.iter().any(|c| c.contains("BillingContract")));
            assert!(list.iter().any(|c| c.contains("CustomerContract")));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(!registry.is_sealed());
}

#[test]
fn registration_window_closes_after_validate_all() {
    let tmp = tempdir().expect("tempdir");
    let store = store_with_contracts(tmp.path(), &[("Billing", &[])]);

    let registry = ContractRegistry::new();
    registry.validate_all(&store).expect("seal");

    let counter = Arc::new(AtomicUsize::new(0));
    let err = registry
        .register("LateContract", "Billing", Lifecycle::Singleton, factory_counting(counter))
        .expect_err("late register must fail");
    assert!(matches!(err, ModguardError::ValidationError(_)));
}

#[test]
fn owner_of_reports_the_binding_module() {
    let registry = ContractRegistry::new();
    let counter = Arc::new(AtomicUsize::new(0));
    registry
        .register("BillingContract", "Billing", Lifecycle::Singleton, factory_counting(counter))
        .expect("register");
    assert_eq!(registry.owner_of("BillingContract").as_deref(), Some("Billing"));
    assert_eq!(registry.owner_of("Nothing"), None);
}
