use std::cell::Cell;
use std::sync::Arc;

use quota_core::{
    ChildSelector, CounterRule, EntityNode, EntityRef, MemoryGraph, MemoryQuotaStore,
    QuotaEngine, QuotaField, QuotaRegistry, QuotaStore, RelationPath, SqliteQuotaStore,
};
use tempfile::TempDir;

/// Entity type counted by the leaf `item_count` quota.
pub const ITEM: &str = "item";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Sqlite,
}

/// Balanced tree of scopes `level0` (root) down to `level{depth - 1}`.
///
/// Every level aggregates `usage` over its children; leaves hold `usage`
/// directly and count `item` entities in `item_count`.
pub struct HierarchyFixture {
    pub engine: QuotaEngine,
    pub graph: Arc<MemoryGraph>,
    pub root: EntityRef,
    pub leaves: Vec<EntityRef>,
    next_item: Cell<usize>,
    _temp_dir: Option<TempDir>,
}

pub fn level_type(level: usize) -> String {
    format!("level{level}")
}

fn parent_path() -> RelationPath {
    "parent".parse().expect("static relation path")
}

fn owner_path() -> RelationPath {
    "owner".parse().expect("static relation path")
}

pub fn registry(depth: usize, leaf_limit: i64) -> QuotaRegistry {
    assert!(depth > 0, "hierarchy needs at least one level");
    let mut registry = QuotaRegistry::new();
    for level in 0..depth - 1 {
        registry
            .register(
                &level_type(level),
                QuotaField::usage_aggregator(
                    "usage",
                    ChildSelector::new(level_type(level + 1), parent_path()),
                ),
            )
            .expect("unique field");
    }
    let leaf = level_type(depth - 1);
    registry
        .register(&leaf, QuotaField::direct("usage").with_default_limit(leaf_limit))
        .expect("unique field");
    registry
        .register(
            &leaf,
            QuotaField::counter("item_count", CounterRule::new([ITEM], owner_path())),
        )
        .expect("unique field");
    registry
}

impl HierarchyFixture {
    pub fn new(depth: usize, fanout: usize, store: StoreKind) -> Self {
        Self::with_leaf_limit(depth, fanout, store, quota_core::UNLIMITED)
    }

    pub fn with_leaf_limit(depth: usize, fanout: usize, store: StoreKind, leaf_limit: i64) -> Self {
        let (store, temp_dir): (Arc<dyn QuotaStore>, Option<TempDir>) = match store {
            StoreKind::Memory => (Arc::new(MemoryQuotaStore::new()), None),
            StoreKind::Sqlite => {
                let temp_dir = TempDir::new().expect("tempdir");
                let store = SqliteQuotaStore::new(temp_dir.path()).expect("sqlite store");
                (Arc::new(store), Some(temp_dir))
            }
        };

        let mut graph = MemoryGraph::new();
        for level in 1..depth {
            graph = graph.with_parent_relations(&level_type(level), ["parent"]);
        }
        let graph = Arc::new(graph);
        let engine = QuotaEngine::new(
            Arc::new(registry(depth, leaf_limit)),
            store,
            graph.clone(),
        );

        let root = EntityRef::new(level_type(0), "0");
        graph.insert(EntityNode::new(root.clone()));
        engine.entity_created(&root).expect("root created");

        let mut current = vec![root.clone()];
        for level in 1..depth {
            let mut next = Vec::with_capacity(current.len() * fanout);
            for parent in &current {
                for index in 0..fanout {
                    let entity = EntityRef::new(level_type(level), format!("{}.{index}", parent.id));
                    graph.insert(
                        EntityNode::new(entity.clone()).with_relation("parent", parent.clone()),
                    );
                    engine.entity_created(&entity).expect("scope created");
                    next.push(entity);
                }
            }
            current = next;
        }

        Self {
            engine,
            graph,
            root,
            leaves: current,
            next_item: Cell::new(0),
            _temp_dir: temp_dir,
        }
    }

    /// Creates an item owned by `leaf` and runs the creation hook.
    pub fn add_item(&self, leaf: &EntityRef) -> Result<EntityRef, quota_core::QuotaError> {
        let id = self.next_item.get();
        self.next_item.set(id + 1);
        let item = EntityRef::new(ITEM, id.to_string());
        self.graph
            .insert(EntityNode::new(item.clone()).with_relation("owner", leaf.clone()));
        if let Err(err) = self.engine.entity_created(&item) {
            self.graph.remove(&item);
            return Err(err);
        }
        Ok(item)
    }

    pub fn remove_item(&self, item: &EntityRef) -> Result<(), quota_core::QuotaError> {
        self.engine.entity_deleted(item)?;
        self.graph.remove(item);
        Ok(())
    }

    pub fn root_usage(&self) -> i64 {
        self.engine
            .get_quota_usage(&self.root, "usage")
            .expect("root usage")
    }
}
