use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use quota_core::{EntityNode, MemoryGraph};
use serde::{Deserialize, Serialize};

use crate::layout;

/// JSON export of the inventory the quotas are derived from.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct InventorySnapshot {
    #[serde(default)]
    pub entities: Vec<EntityNode>,
}

impl InventorySnapshot {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("unable to read inventory snapshot {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid inventory snapshot {}", path.display()))
    }

    pub fn into_graph(self) -> MemoryGraph {
        let graph = layout::with_parent_relations(MemoryGraph::new());
        for node in self.entities {
            graph.insert(node);
        }
        graph
    }
}
