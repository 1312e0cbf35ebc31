use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::QuotaError;

/// Identity of an entity instance: its type and its id within that type.
///
/// Scopes (entities that own quotas) and counted targets share this
/// representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

/// Chain of relation hops leading from an entity to another, e.g.
/// `project.customer`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelationPath {
    hops: Vec<String>,
}

impl RelationPath {
    pub fn hops(&self) -> &[String] {
        &self.hops
    }
}

impl FromStr for RelationPath {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hops: Vec<String> = s.split('.').map(str::trim).map(String::from).collect();
        if hops.iter().any(String::is_empty) {
            return Err(QuotaError::InvalidPath(s.to_string()));
        }
        Ok(Self { hops })
    }
}

impl fmt::Display for RelationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hops.join("."))
    }
}

/// Read access to the host's entity data.
///
/// Lifecycle hooks must be invoked while the affected entity is still
/// resolvable here, deletions included.
pub trait EntityGraph: Send + Sync {
    /// Every currently existing instance of `entity_type`.
    fn instances(&self, entity_type: &str) -> Vec<EntityRef>;

    /// Follows a single named relation; `None` when the relation is unset.
    fn related(&self, entity: &EntityRef, relation: &str) -> Option<EntityRef>;

    /// Integer attribute of an entity, such as a volume size.
    fn attribute(&self, entity: &EntityRef, name: &str) -> Option<i64>;

    /// Ordered immediate parents of a scope. Empty for roots.
    fn quota_parents(&self, scope: &EntityRef) -> Vec<EntityRef>;

    fn resolve(&self, entity: &EntityRef, path: &RelationPath) -> Option<EntityRef> {
        path.hops()
            .iter()
            .try_fold(entity.clone(), |current, hop| self.related(&current, hop))
    }

    /// Instances of `entity_type` whose `path` resolves to `scope`.
    ///
    /// The default scans all instances; graphs backed by an index should
    /// override it.
    fn referencing(
        &self,
        entity_type: &str,
        path: &RelationPath,
        scope: &EntityRef,
    ) -> Vec<EntityRef> {
        self.instances(entity_type)
            .into_iter()
            .filter(|entity| self.resolve(entity, path).as_ref() == Some(scope))
            .collect()
    }
}
