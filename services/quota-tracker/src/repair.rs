use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use quota_core::{QuotaEngine, QuotaStore, RecalculationReport};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::snapshot::InventorySnapshot;

/// Rebuilds quota records from the latest inventory snapshot, using the
/// process-wide registry.
#[derive(Clone)]
pub struct RepairJob {
    snapshot_path: PathBuf,
    store: Arc<dyn QuotaStore>,
}

impl RepairJob {
    pub fn new(snapshot_path: PathBuf, store: Arc<dyn QuotaStore>) -> Self {
        Self {
            snapshot_path,
            store,
        }
    }

    /// Engine over a freshly loaded snapshot.
    pub fn engine(&self) -> Result<QuotaEngine> {
        let graph = InventorySnapshot::load(&self.snapshot_path)?.into_graph();
        debug!(entities = graph.len(), "loaded inventory snapshot");
        Ok(QuotaEngine::with_global_registry(
            Arc::clone(&self.store),
            Arc::new(graph),
        ))
    }

    pub fn run_once(&self) -> Result<RecalculationReport> {
        self.engine()?
            .recalculate_all()
            .context("quota recalculation failed")
    }

    pub fn start_repair_task(&self, period: Duration) -> JoinHandle<()> {
        let job = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                match job.run_once() {
                    Ok(report) if !report.is_clean() => {
                        info!(
                            created = report.records_created,
                            updated = report.records_updated,
                            "repaired quota drift"
                        );
                    }
                    Ok(_) => {
                        debug!("no quota drift found");
                    }
                    Err(err) => {
                        error!(error = %err, "failed to recalculate quotas");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::layout;
    use quota_core::{registry, EntityRef, MemoryQuotaStore};
    use tempfile::TempDir;

    const SNAPSHOT: &str = r#"{
        "entities": [
            {"type": "customer", "id": "acme"},
            {"type": "project", "id": "web", "relations": {"customer": {"type": "customer", "id": "acme"}}},
            {"type": "project", "id": "api", "relations": {"customer": {"type": "customer", "id": "acme"}}},
            {"type": "vm", "id": "vm-1", "relations": {"project": {"type": "project", "id": "web"}}},
            {
                "type": "volume",
                "id": "vol-1",
                "relations": {"project": {"type": "project", "id": "web"}},
                "attributes": {"size": 20}
            },
            {
                "type": "volume",
                "id": "vol-2",
                "relations": {"project": {"type": "project", "id": "api"}},
                "attributes": {"size": 5}
            }
        ]
    }"#;

    fn job(dir: &TempDir) -> RepairJob {
        let snapshot_path = dir.path().join("inventory.json");
        fs::write(&snapshot_path, SNAPSHOT).unwrap();
        registry::init(layout::registry().unwrap());
        RepairJob::new(snapshot_path, Arc::new(MemoryQuotaStore::new()))
    }

    #[test]
    fn test_run_once_builds_records_from_snapshot() {
        let dir = TempDir::new().unwrap();
        let job = job(&dir);

        let report = job.run_once().unwrap();
        assert_eq!(report.scopes, 3);
        assert!(report.records_created > 0);

        let engine = job.engine().unwrap();
        let customer = EntityRef::new("customer", "acme");
        let web = EntityRef::new("project", "web");
        assert_eq!(
            engine.get_quota_usage(&customer, "nc_project_count").unwrap(),
            2
        );
        assert_eq!(
            engine.get_quota_usage(&customer, "nc_resource_count").unwrap(),
            3
        );
        assert_eq!(engine.get_quota_usage(&web, "storage").unwrap(), 20);

        assert!(job.run_once().unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_repair_task_runs_immediately() {
        let dir = TempDir::new().unwrap();
        let job = job(&dir);

        let handle = job.start_repair_task(Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();

        let customer = EntityRef::new("customer", "acme");
        let engine = job.engine().unwrap();
        assert_eq!(
            engine.get_quota_usage(&customer, "nc_project_count").unwrap(),
            2
        );
    }
}
