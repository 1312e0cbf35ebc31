//! Grandparent -> parent -> child hierarchy shared by the integration tests.
//!
//! Children also point at a `non_quota_parent` that registers no quotas and
//! must be skipped during propagation.

#![allow(dead_code)]

use std::sync::Arc;

use quota_core::{
    ChildSelector, CounterRule, EntityNode, EntityRef, MemoryGraph, MemoryQuotaStore,
    QuotaEngine, QuotaField, QuotaRegistry, QuotaStore, RelationPath, TotalRule,
};

pub const GRANDPARENT: &str = "grandparent";
pub const PARENT: &str = "parent";
pub const CHILD: &str = "child";
pub const SECOND_CHILD: &str = "second_child";
pub const NON_QUOTA_PARENT: &str = "non_quota_parent";

pub fn path(raw: &str) -> RelationPath {
    raw.parse().expect("valid relation path")
}

pub fn registry() -> QuotaRegistry {
    let mut registry = QuotaRegistry::new();
    let fields = [
        (
            GRANDPARENT,
            QuotaField::usage_aggregator(
                "usage_aggregator_quota",
                ChildSelector::new(PARENT, path("parent")),
            ),
        ),
        (
            GRANDPARENT,
            QuotaField::counter("nc_parent_count", CounterRule::new([PARENT], path("parent"))),
        ),
        (
            PARENT,
            QuotaField::counter("counter_quota", CounterRule::new([CHILD], path("parent")))
                .with_default_limit(2),
        ),
        (
            PARENT,
            QuotaField::counter(
                "two_targets_counter_quota",
                CounterRule::new([CHILD, SECOND_CHILD], path("parent")),
            ),
        ),
        (
            PARENT,
            QuotaField::counter(
                "delta_quota",
                CounterRule::new([CHILD], path("parent")).with_weight(|_, _| 10),
            ),
        ),
        (
            PARENT,
            QuotaField::total(
                "total_quota",
                TotalRule::new([SECOND_CHILD], path("parent"), "size"),
            ),
        ),
        (
            PARENT,
            QuotaField::usage_aggregator(
                "usage_aggregator_quota",
                ChildSelector::new(CHILD, path("parent")),
            ),
        ),
        (
            PARENT,
            QuotaField::usage_aggregator(
                "second_usage_aggregator_quota",
                ChildSelector::new(CHILD, path("parent")),
            )
            .with_child_quota("usage_aggregator_quota"),
        ),
        (
            PARENT,
            QuotaField::limit_aggregator(
                "limit_aggregator_quota",
                ChildSelector::new(CHILD, path("parent")),
            ),
        ),
        (CHILD, QuotaField::direct("usage_aggregator_quota")),
        (
            CHILD,
            QuotaField::direct("limit_aggregator_quota").with_default_limit(5),
        ),
    ];
    for (scope_type, field) in fields {
        registry
            .register(scope_type, field)
            .expect("fixture fields are unique");
    }
    registry
}

pub fn graph() -> MemoryGraph {
    MemoryGraph::new()
        .with_parent_relations(PARENT, ["parent"])
        .with_parent_relations(CHILD, ["parent", "non_quota_parent"])
        .with_parent_relations(SECOND_CHILD, ["parent"])
}

pub struct Hierarchy {
    pub engine: QuotaEngine,
    pub graph: Arc<MemoryGraph>,
    next_id: std::cell::Cell<usize>,
}

impl Hierarchy {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryQuotaStore::new()))
    }

    pub fn with_store(store: Arc<dyn QuotaStore>) -> Self {
        let graph = Arc::new(graph());
        let engine = QuotaEngine::new(Arc::new(registry()), store, graph.clone());
        Self {
            engine,
            graph,
            next_id: std::cell::Cell::new(0),
        }
    }

    fn next_ref(&self, entity_type: &str) -> EntityRef {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        EntityRef::new(entity_type, format!("{entity_type}-{id}"))
    }

    /// Inserts the node into the graph and fires the creation hook.
    pub fn create(&self, node: EntityNode) -> EntityRef {
        let entity = node.entity.clone();
        self.graph.insert(node);
        self.engine
            .entity_created(&entity)
            .expect("entity creation hook");
        entity
    }

    pub fn create_grandparent(&self) -> EntityRef {
        let entity = self.next_ref(GRANDPARENT);
        self.create(EntityNode::new(entity))
    }

    pub fn create_parent(&self, grandparent: &EntityRef) -> EntityRef {
        let entity = self.next_ref(PARENT);
        self.create(EntityNode::new(entity).with_relation("parent", grandparent.clone()))
    }

    pub fn child_node(&self, parent: &EntityRef) -> EntityNode {
        EntityNode::new(self.next_ref(CHILD)).with_relation("parent", parent.clone())
    }

    pub fn create_child(&self, parent: &EntityRef) -> EntityRef {
        let node = self.child_node(parent);
        self.create(node)
    }

    pub fn create_second_child(&self, parent: &EntityRef, size: i64) -> EntityRef {
        let node = EntityNode::new(self.next_ref(SECOND_CHILD))
            .with_relation("parent", parent.clone())
            .with_attribute("size", size);
        self.create(node)
    }

    pub fn create_non_quota_parent(&self) -> EntityRef {
        let entity = self.next_ref(NON_QUOTA_PARENT);
        self.graph.insert(EntityNode::new(entity.clone()));
        entity
    }

    /// Fires the deletion hook, then removes the node from the graph.
    pub fn delete(&self, entity: &EntityRef) {
        self.engine
            .entity_deleted(entity)
            .expect("entity deletion hook");
        self.graph.remove(entity);
    }

    pub fn usage(&self, scope: &EntityRef, name: &str) -> i64 {
        self.engine
            .get_quota_usage(scope, name)
            .expect("registered quota")
    }
}
