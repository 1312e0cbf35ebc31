mod common;

use std::sync::Arc;

use common::{path, Hierarchy, CHILD};
use quota_core::{
    CounterRule, EntityNode, EntityRef, MemoryGraph, MemoryQuotaStore, QuotaEngine, QuotaError,
    QuotaField, QuotaRegistry, QuotaStore, SqliteQuotaStore, UNLIMITED,
};

fn tenant_engine() -> (QuotaEngine, Arc<MemoryGraph>) {
    tenant_engine_with(Arc::new(MemoryQuotaStore::new()))
}

fn tenant_engine_with(store: Arc<dyn QuotaStore>) -> (QuotaEngine, Arc<MemoryGraph>) {
    let registry = QuotaRegistry::new()
        .with_field("tenant", QuotaField::direct("vcpu").with_default_limit(8))
        .and_then(|r| r.with_field("tenant", QuotaField::direct("ram").backend()))
        .and_then(|r| {
            r.with_field(
                "tenant",
                QuotaField::direct("gpu").with_creation_condition(|scope, graph| {
                    graph.attribute(scope, "gpu_enabled") == Some(1)
                }),
            )
        })
        .and_then(|r| {
            r.with_field(
                "tenant",
                QuotaField::counter("nc_vm_count", CounterRule::new(["vm"], path("owner"))),
            )
        })
        .unwrap();
    let graph = Arc::new(MemoryGraph::new());
    let engine = QuotaEngine::new(Arc::new(registry), store, graph.clone());
    (engine, graph)
}

#[test]
fn test_increment_over_limit_is_rejected_and_rolled_back() {
    let h = Hierarchy::new();
    let grandparent = h.create_grandparent();
    let parent = h.create_parent(&grandparent);
    let child = h.create_child(&parent);
    h.engine
        .set_quota_limit(&child, "usage_aggregator_quota", 100)
        .unwrap();
    h.engine
        .set_quota_usage(&child, "usage_aggregator_quota", 95)
        .unwrap();

    let err = h
        .engine
        .add_quota_usage(&child, "usage_aggregator_quota", 10, true)
        .unwrap_err();
    assert!(err.is_validation_error());
    match &err {
        QuotaError::LimitExceeded {
            limit, requested, ..
        } => {
            assert_eq!(*limit, 100);
            assert_eq!(*requested, 105);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.to_string().starts_with("one or more quotas were exceeded"));

    assert_eq!(h.usage(&child, "usage_aggregator_quota"), 95);
    assert_eq!(h.usage(&parent, "usage_aggregator_quota"), 95);
    assert_eq!(h.usage(&grandparent, "usage_aggregator_quota"), 95);
}

#[test]
fn test_unvalidated_increment_may_exceed_limit() {
    let h = Hierarchy::new();
    let child = EntityRef::new(CHILD, "c1");
    h.engine
        .set_quota_limit(&child, "usage_aggregator_quota", 10)
        .unwrap();
    h.engine
        .add_quota_usage(&child, "usage_aggregator_quota", 15, false)
        .unwrap();
    let record = h.engine.get_quota(&child, "usage_aggregator_quota").unwrap();
    assert!(record.is_exceeded());
}

#[test]
fn test_negative_delta_always_applies() {
    let h = Hierarchy::new();
    let child = EntityRef::new(CHILD, "c1");
    h.engine
        .set_quota_limit(&child, "usage_aggregator_quota", 10)
        .unwrap();
    h.engine
        .set_quota_usage(&child, "usage_aggregator_quota", 20)
        .unwrap();
    h.engine
        .add_quota_usage(&child, "usage_aggregator_quota", -5, true)
        .unwrap();
    assert_eq!(h.usage(&child, "usage_aggregator_quota"), 15);
}

#[test]
fn test_unlimited_quota_accepts_any_increment() {
    let h = Hierarchy::new();
    let child = EntityRef::new(CHILD, "c1");
    h.engine
        .add_quota_usage(&child, "usage_aggregator_quota", 1_000_000, true)
        .unwrap();
    assert_eq!(h.usage(&child, "usage_aggregator_quota"), 1_000_000);
}

#[test]
fn test_exact_limit_is_allowed() {
    let (engine, _) = tenant_engine();
    let tenant = EntityRef::new("tenant", "t1");
    engine.add_quota_usage(&tenant, "vcpu", 8, true).unwrap();
    assert_eq!(engine.get_quota_usage(&tenant, "vcpu").unwrap(), 8);
    assert!(engine.add_quota_usage(&tenant, "vcpu", 1, true).is_err());
}

#[test]
fn test_rejected_target_rolls_back_whole_event() {
    let h = Hierarchy::new();
    let grandparent = h.create_grandparent();
    let parent = h.create_parent(&grandparent);
    h.engine
        .update_quota_limit(&parent, "counter_quota", UNLIMITED)
        .unwrap();
    h.engine
        .update_quota_limit(&parent, "delta_quota", 15)
        .unwrap();
    h.create_child(&parent);

    let node = h.child_node(&parent);
    let rejected = node.entity.clone();
    h.graph.insert(node);
    let err = h.engine.entity_created(&rejected).unwrap_err();
    h.graph.remove(&rejected);

    assert!(matches!(err, QuotaError::LimitExceeded { .. }));
    assert_eq!(h.usage(&parent, "counter_quota"), 1);
    assert_eq!(h.usage(&parent, "two_targets_counter_quota"), 1);
    assert_eq!(h.usage(&parent, "delta_quota"), 10);
    assert_eq!(h.usage(&parent, "limit_aggregator_quota"), 5);
    assert!(h.engine.store().list_scope(&rejected).unwrap().is_empty());
}

#[test]
fn test_counter_limit_blocks_creation() {
    let h = Hierarchy::new();
    let grandparent = h.create_grandparent();
    let parent = h.create_parent(&grandparent);
    h.create_child(&parent);
    h.create_child(&parent);

    let node = h.child_node(&parent);
    let third = node.entity.clone();
    h.graph.insert(node);
    let err = h.engine.entity_created(&third).unwrap_err();
    assert!(matches!(
        err,
        QuotaError::LimitExceeded { ref name, .. } if name == "counter_quota"
    ));
    assert_eq!(h.usage(&parent, "counter_quota"), 2);
}

#[test]
fn test_backend_quota_is_read_only_for_admins() {
    let (engine, _) = tenant_engine();
    let tenant = EntityRef::new("tenant", "t1");

    let err = engine.update_quota_limit(&tenant, "ram", 1024).unwrap_err();
    assert!(matches!(err, QuotaError::BackendQuota { .. }));

    engine.set_quota_limit(&tenant, "ram", 1024).unwrap();
    assert_eq!(engine.get_quota_limit(&tenant, "ram").unwrap(), 1024);
}

#[test]
fn test_limit_cannot_drop_below_usage() {
    let (engine, _) = tenant_engine();
    let tenant = EntityRef::new("tenant", "t1");
    engine.add_quota_usage(&tenant, "vcpu", 6, true).unwrap();

    let err = engine.update_quota_limit(&tenant, "vcpu", 4).unwrap_err();
    assert!(matches!(
        err,
        QuotaError::LimitBelowUsage { usage: 6, limit: 4 }
    ));
    assert_eq!(engine.get_quota_limit(&tenant, "vcpu").unwrap(), 8);

    engine.update_quota_limit(&tenant, "vcpu", 6).unwrap();
    engine
        .update_quota_limit(&tenant, "vcpu", UNLIMITED)
        .unwrap();
    assert_eq!(engine.get_quota_limit(&tenant, "vcpu").unwrap(), UNLIMITED);
}

#[test]
fn test_creation_condition_gates_quota() {
    let (engine, graph) = tenant_engine();
    let plain = EntityRef::new("tenant", "plain");
    let gpu = EntityRef::new("tenant", "gpu");
    graph.insert(EntityNode::new(plain.clone()));
    graph.insert(EntityNode::new(gpu.clone()).with_attribute("gpu_enabled", 1));
    engine.entity_created(&plain).unwrap();
    engine.entity_created(&gpu).unwrap();

    let err = engine.get_or_create_quota(&plain, "gpu").unwrap_err();
    assert!(matches!(err, QuotaError::CreationConditionFailed { .. }));
    assert!(engine.store().get(&plain, "gpu").unwrap().is_none());
    assert!(engine.store().get(&gpu, "gpu").unwrap().is_some());

    let names: Vec<String> = engine
        .quotas(&plain)
        .unwrap()
        .into_iter()
        .map(|record| record.name)
        .collect();
    assert!(!names.contains(&"gpu".to_string()));
}

#[test]
fn test_path_to_wrong_scope_type_is_reported() {
    let (engine, graph) = tenant_engine();
    let tenant = EntityRef::new("tenant", "t1");
    let customer = EntityRef::new("customer", "c1");
    graph.insert(EntityNode::new(tenant.clone()));
    graph.insert(EntityNode::new(customer.clone()));
    engine.entity_created(&tenant).unwrap();

    let good = EntityRef::new("vm", "vm1");
    graph.insert(EntityNode::new(good.clone()).with_relation("owner", tenant.clone()));
    engine.entity_created(&good).unwrap();

    let bad = EntityRef::new("vm", "vm2");
    graph.insert(EntityNode::new(bad.clone()).with_relation("owner", customer));
    let err = engine.entity_created(&bad).unwrap_err();
    assert!(matches!(err, QuotaError::ScopeTypeMismatch { .. }));
    assert!(err.is_configuration_error());
    assert_eq!(engine.get_quota_usage(&tenant, "nc_vm_count").unwrap(), 1);
}

#[test]
fn test_overflowing_increment_is_rejected_on_both_stores() {
    let stores: [Arc<dyn QuotaStore>; 2] = [
        Arc::new(MemoryQuotaStore::new()),
        Arc::new(SqliteQuotaStore::in_memory().unwrap()),
    ];
    for store in stores {
        let (engine, _) = tenant_engine_with(store);
        let tenant = EntityRef::new("tenant", "t1");
        engine.set_quota_limit(&tenant, "vcpu", 100).unwrap();
        engine.set_quota_usage(&tenant, "vcpu", 10).unwrap();

        let err = engine
            .add_quota_usage(&tenant, "vcpu", i64::MAX, true)
            .unwrap_err();
        assert!(matches!(
            err,
            QuotaError::LimitExceeded {
                limit: 100,
                requested: i64::MAX,
                ..
            }
        ));
        assert_eq!(engine.get_quota_usage(&tenant, "vcpu").unwrap(), 10);
    }
}

#[test]
fn test_usage_driven_below_zero_still_checks_full_limit() {
    let (engine, _) = tenant_engine();
    let tenant = EntityRef::new("tenant", "t1");
    engine.add_quota_usage(&tenant, "vcpu", -3, true).unwrap();
    assert_eq!(engine.get_quota(&tenant, "vcpu").unwrap().usage, 0);

    let err = engine.add_quota_usage(&tenant, "vcpu", 9, true).unwrap_err();
    assert!(matches!(err, QuotaError::LimitExceeded { requested: 9, .. }));
    engine.add_quota_usage(&tenant, "vcpu", 8, true).unwrap();
}

#[test]
fn test_validate_quota_change_reports_every_violation() {
    let (engine, _) = tenant_engine();
    let tenant = EntityRef::new("tenant", "t1");
    engine.set_quota_usage(&tenant, "vcpu", 6).unwrap();
    engine.set_quota_limit(&tenant, "ram", 1024).unwrap();
    engine.set_quota_usage(&tenant, "ram", 1000).unwrap();

    let err = engine
        .validate_quota_change(
            &tenant,
            &[("vcpu", 4), ("ram", 100), ("nc_vm_count", 1_000)],
        )
        .unwrap_err();
    assert!(err.is_validation_error());
    let QuotaError::QuotasExceeded(violations) = &err else {
        panic!("unexpected error: {err:?}");
    };
    let names: Vec<&str> = violations.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, vec!["vcpu", "ram"]);
    let message = err.to_string();
    assert!(message.starts_with("one or more quotas were exceeded: "));
    assert!(message.contains("vcpu quota limit: 8, requires 10"));
    assert!(message.contains("ram quota limit: 1024, requires 1100"));

    assert_eq!(engine.get_quota_usage(&tenant, "vcpu").unwrap(), 6);
    engine
        .validate_quota_change(&tenant, &[("vcpu", 2), ("ram", -5_000)])
        .unwrap();
    let err = engine
        .validate_quota_change(&tenant, &[("unknown", 1)])
        .unwrap_err();
    assert!(err.is_configuration_error());
}

#[test]
fn test_apply_quota_changes_counts_against_every_scope() {
    let (engine, _) = tenant_engine();
    let first = EntityRef::new("tenant", "t1");
    let second = EntityRef::new("tenant", "t2");
    let scopes = [first.clone(), second.clone()];
    let deltas = [("ram", 512), ("vcpu", 3)];

    engine.increase_quotas_usage(&scopes, &deltas, true).unwrap();
    for scope in &scopes {
        assert_eq!(engine.get_quota_usage(scope, "ram").unwrap(), 512);
        assert_eq!(engine.get_quota_usage(scope, "vcpu").unwrap(), 3);
    }

    engine.apply_quota_changes(&scopes, &deltas, -1, false).unwrap();
    engine.apply_quota_changes(&scopes, &[("vcpu", 2)], 2, true).unwrap();
    assert_eq!(engine.get_quota_usage(&second, "vcpu").unwrap(), 4);

    engine.decrease_quotas_usage(&scopes, &[("vcpu", 4)]).unwrap();
    assert_eq!(engine.get_quota_usage(&first, "vcpu").unwrap(), 0);
    assert_eq!(engine.get_quota_usage(&second, "ram").unwrap(), 0);
}

#[test]
fn test_apply_quota_changes_is_all_or_nothing() {
    let (engine, _) = tenant_engine();
    let first = EntityRef::new("tenant", "t1");
    let second = EntityRef::new("tenant", "t2");
    engine.set_quota_usage(&second, "vcpu", 6).unwrap();

    let err = engine
        .increase_quotas_usage(
            &[first.clone(), second.clone()],
            &[("ram", 512), ("vcpu", 3)],
            true,
        )
        .unwrap_err();
    assert!(matches!(err, QuotaError::LimitExceeded { ref scope, .. } if *scope == second));

    assert_eq!(engine.get_quota_usage(&first, "ram").unwrap(), 0);
    assert_eq!(engine.get_quota_usage(&first, "vcpu").unwrap(), 0);
    assert_eq!(engine.get_quota_usage(&second, "ram").unwrap(), 0);
    assert_eq!(engine.get_quota_usage(&second, "vcpu").unwrap(), 6);
}
