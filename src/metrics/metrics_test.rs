use super::*;

fn create_test_registry() -> (Registry, Metrics) {
    let registry = Registry::new_custom(Some("test".to_string()), None).unwrap();
    let metrics = Metrics::new().unwrap();
    metrics.register(&registry).unwrap();
    (registry, metrics)
}

#[test]
fn test_custom_registry() {
    let (registry, metrics) = create_test_registry();

    metrics.commands_applied.with_label_values(&["add_block", "ok"]).inc();
    let families = registry.gather();
    let names: Vec<_> = families.iter().map(|m| m.get_name()).collect();
    assert!(
        names.contains(&"test_metastore_fsm_commands_total"),
        "Missing test_metastore_fsm_commands_total"
    );
}

#[test]
fn test_double_registration_is_rejected() {
    let (registry, metrics) = create_test_registry();
    assert!(metrics.register(&registry).is_err());
}

#[test]
fn test_encode_metrics_text() {
    let (registry, metrics) = create_test_registry();
    metrics.applied_index.set(42);
    let text = encode_metrics(&registry);
    assert!(text.contains("test_metastore_fsm_applied_index 42"));
}
