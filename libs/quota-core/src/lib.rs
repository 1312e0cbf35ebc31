//! Hierarchical quota aggregation and enforcement.
//!
//! Quotas are named `(limit, usage)` records attached to scopes such as
//! customers and projects. Each scope type registers [`QuotaField`]
//! descriptors describing how its quotas behave:
//!
//! * direct quotas are set by callers;
//! * counter and total quotas follow the entities that reference the scope;
//! * aggregator quotas sum a quota over the scope's immediate children, and
//!   changes travel upward one level at a time.
//!
//! The [`QuotaEngine`] applies lifecycle events incrementally and can rebuild
//! every record from source data with [`QuotaEngine::recalculate_all`].
//!
//! # Example
//! ```
//! use std::sync::Arc;
//!
//! use quota_core::{
//!     ChildSelector, EntityNode, EntityRef, MemoryGraph, MemoryQuotaStore, QuotaEngine,
//!     QuotaField, QuotaRegistry,
//! };
//!
//! let mut registry = QuotaRegistry::new();
//! registry.register("project", QuotaField::direct("vms")).unwrap();
//! registry
//!     .register(
//!         "customer",
//!         QuotaField::usage_aggregator("vms", ChildSelector::new("project", "customer".parse().unwrap())),
//!     )
//!     .unwrap();
//!
//! let graph = Arc::new(MemoryGraph::new().with_parent_relations("project", ["customer"]));
//! let customer = EntityRef::new("customer", "acme");
//! let project = EntityRef::new("project", "web");
//! graph.insert(EntityNode::new(customer.clone()));
//! graph.insert(EntityNode::new(project.clone()).with_relation("customer", customer.clone()));
//!
//! let engine = QuotaEngine::new(Arc::new(registry), Arc::new(MemoryQuotaStore::new()), graph);
//! engine.entity_created(&customer).unwrap();
//! engine.entity_created(&project).unwrap();
//! engine.add_quota_usage(&project, "vms", 3, true).unwrap();
//!
//! assert_eq!(engine.get_quota_usage(&customer, "vms").unwrap(), 3);
//! ```

pub mod engine;
pub mod error;
pub mod field;
pub mod graph;
pub mod hooks;
pub mod recalc;
pub mod record;
pub mod registry;
pub mod scope;
pub mod store;

pub use engine::{QuotaEngine, MAX_HIERARCHY_DEPTH};
pub use error::{QuotaError, QuotaViolation};
pub use field::{
    AggregatorRule, ChildSelector, CounterRule, DefaultValue, FieldKind, QuotaField, TotalRule,
};
pub use graph::{EntityNode, MemoryGraph};
pub use hooks::EntityEvent;
pub use recalc::RecalculationReport;
pub use record::{QuotaMeasure, QuotaRecord, UsageUpdate, UNLIMITED};
pub use registry::QuotaRegistry;
pub use scope::{EntityGraph, EntityRef, RelationPath};
pub use store::{MemoryQuotaStore, QuotaStore, SqliteQuotaStore, StorageError};
