use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::scope::{EntityGraph, EntityRef};

/// One entity as known to [`MemoryGraph`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityNode {
    #[serde(flatten)]
    pub entity: EntityRef,
    #[serde(default)]
    pub relations: BTreeMap<String, EntityRef>,
    #[serde(default)]
    pub attributes: BTreeMap<String, i64>,
}

impl EntityNode {
    pub fn new(entity: EntityRef) -> Self {
        Self {
            entity,
            relations: BTreeMap::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_relation(mut self, relation: impl Into<String>, target: EntityRef) -> Self {
        self.relations.insert(relation.into(), target);
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: i64) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }
}

/// In-process entity graph used by the administrative binary (loaded from an
/// inventory snapshot), by tests and by benches.
///
/// Quota parents are declared per entity type as an ordered list of relation
/// names.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    nodes: RwLock<HashMap<EntityRef, EntityNode>>,
    parent_relations: HashMap<String, Vec<String>>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parent_relations<I, S>(mut self, entity_type: &str, relations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parent_relations.insert(
            entity_type.to_string(),
            relations.into_iter().map(Into::into).collect(),
        );
        self
    }

    pub fn insert(&self, node: EntityNode) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.entity.clone(), node);
    }

    pub fn remove(&self, entity: &EntityRef) -> Option<EntityNode> {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(entity)
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(entity)
    }

    /// Stores a new attribute value and returns the previous one.
    pub fn set_attribute(&self, entity: &EntityRef, name: &str, value: i64) -> Option<i64> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        nodes
            .get_mut(entity)
            .and_then(|node| node.attributes.insert(name.to_string(), value))
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EntityGraph for MemoryGraph {
    fn instances(&self, entity_type: &str) -> Vec<EntityRef> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<EntityRef> = nodes
            .keys()
            .filter(|entity| entity.entity_type == entity_type)
            .cloned()
            .collect();
        found.sort();
        found
    }

    fn related(&self, entity: &EntityRef, relation: &str) -> Option<EntityRef> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        nodes
            .get(entity)
            .and_then(|node| node.relations.get(relation))
            .cloned()
    }

    fn attribute(&self, entity: &EntityRef, name: &str) -> Option<i64> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        nodes
            .get(entity)
            .and_then(|node| node.attributes.get(name))
            .copied()
    }

    fn quota_parents(&self, scope: &EntityRef) -> Vec<EntityRef> {
        let Some(relations) = self.parent_relations.get(&scope.entity_type) else {
            return Vec::new();
        };
        relations
            .iter()
            .filter_map(|relation| self.related(scope, relation))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::RelationPath;

    fn sample_graph() -> MemoryGraph {
        let graph = MemoryGraph::new()
            .with_parent_relations("project", ["customer"])
            .with_parent_relations("vm", ["project", "zone"]);
        let customer = EntityRef::new("customer", "c1");
        let project = EntityRef::new("project", "p1");
        graph.insert(EntityNode::new(customer.clone()));
        graph.insert(EntityNode::new(project.clone()).with_relation("customer", customer));
        graph.insert(
            EntityNode::new(EntityRef::new("vm", "vm1"))
                .with_relation("project", project)
                .with_attribute("cores", 4),
        );
        graph
    }

    #[test]
    fn test_resolve_multi_hop_path() {
        let graph = sample_graph();
        let path: RelationPath = "project.customer".parse().unwrap();
        let resolved = graph.resolve(&EntityRef::new("vm", "vm1"), &path);
        assert_eq!(resolved, Some(EntityRef::new("customer", "c1")));
    }

    #[test]
    fn test_resolve_missing_hop_is_none() {
        let graph = sample_graph();
        let path: RelationPath = "zone.region".parse().unwrap();
        assert_eq!(graph.resolve(&EntityRef::new("vm", "vm1"), &path), None);
    }

    #[test]
    fn test_quota_parents_skip_unset_relations() {
        let graph = sample_graph();
        let parents = graph.quota_parents(&EntityRef::new("vm", "vm1"));
        assert_eq!(parents, vec![EntityRef::new("project", "p1")]);
        assert!(graph
            .quota_parents(&EntityRef::new("customer", "c1"))
            .is_empty());
    }

    #[test]
    fn test_set_attribute_returns_previous() {
        let graph = sample_graph();
        let vm = EntityRef::new("vm", "vm1");
        assert_eq!(graph.set_attribute(&vm, "cores", 8), Some(4));
        assert_eq!(graph.attribute(&vm, "cores"), Some(8));
    }

    #[test]
    fn test_node_deserializes_from_snapshot_json() {
        let node: EntityNode = serde_json::from_str(
            r#"{"type": "volume", "id": "v1",
                "relations": {"project": {"type": "project", "id": "p1"}},
                "attributes": {"size": 1024}}"#,
        )
        .unwrap();
        assert_eq!(node.entity, EntityRef::new("volume", "v1"));
        assert_eq!(node.attributes["size"], 1024);
    }
}
