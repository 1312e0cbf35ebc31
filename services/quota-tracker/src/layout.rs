//! Scope types and quota fields of the brokerage inventory.

use quota_core::{
    ChildSelector, CounterRule, MemoryGraph, QuotaError, QuotaField, QuotaRegistry, RelationPath,
    TotalRule,
};

pub const CUSTOMER: &str = "customer";
pub const PROJECT: &str = "project";
pub const SERVICE: &str = "service";
pub const TENANT: &str = "tenant";

/// Resource types counted against projects and customers.
pub const RESOURCE_TYPES: [&str; 2] = ["vm", "volume"];

/// Quotas a tenant mirrors from its cloud backend and a service sums.
pub const BACKEND_QUOTAS: [&str; 3] = ["vcpu", "ram", "storage"];

pub fn registry() -> Result<QuotaRegistry, QuotaError> {
    let mut registry = QuotaRegistry::new();

    registry.register(
        CUSTOMER,
        QuotaField::counter(
            "nc_project_count",
            CounterRule::new([PROJECT], path("customer")?),
        ),
    )?;
    registry.register(CUSTOMER, QuotaField::direct("nc_user_count"))?;
    registry.register(
        CUSTOMER,
        QuotaField::counter(
            "nc_resource_count",
            CounterRule::new(RESOURCE_TYPES, path("project.customer")?),
        ),
    )?;

    registry.register(
        PROJECT,
        QuotaField::counter(
            "nc_resource_count",
            CounterRule::new(RESOURCE_TYPES, path("project")?),
        ),
    )?;
    registry.register(
        PROJECT,
        QuotaField::total("storage", TotalRule::new(["volume"], path("project")?, "size")),
    )?;

    registry.register(
        SERVICE,
        QuotaField::counter("tenant_count", CounterRule::new([TENANT], path("service")?)),
    )?;
    for name in BACKEND_QUOTAS {
        registry.register(
            SERVICE,
            QuotaField::usage_aggregator(name, ChildSelector::new(TENANT, path("service")?)),
        )?;
        registry.register(TENANT, QuotaField::direct(name).backend())?;
    }
    registry.register(
        TENANT,
        QuotaField::counter("instances", CounterRule::new(["vm"], path("tenant")?)),
    )?;

    Ok(registry)
}

/// Declares which relations lead to aggregating parents.
pub fn with_parent_relations(graph: MemoryGraph) -> MemoryGraph {
    graph
        .with_parent_relations(PROJECT, ["customer"])
        .with_parent_relations(TENANT, ["service"])
}

fn path(raw: &str) -> Result<RelationPath, QuotaError> {
    raw.parse()
}
