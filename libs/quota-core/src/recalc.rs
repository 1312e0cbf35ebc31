//! Full recomputation of quota usage from source data.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::{QuotaEngine, MAX_HIERARCHY_DEPTH};
use crate::field::FieldKind;
use crate::scope::EntityRef;
use crate::QuotaError;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecalculationReport {
    pub scopes: usize,
    pub records_created: usize,
    pub records_updated: usize,
}

impl RecalculationReport {
    pub fn is_clean(&self) -> bool {
        self.records_created == 0 && self.records_updated == 0
    }
}

impl QuotaEngine {
    /// Recomputes every quota of every registered scope, deepest scopes
    /// first so aggregators read corrected children. Overwrites are not
    /// propagated; each level is recomputed on its own. Increments wait
    /// until the run finishes.
    pub fn recalculate_all(&self) -> Result<RecalculationReport, QuotaError> {
        let _guard = self.exclusive();
        let started = Instant::now();
        let mut depths = HashMap::new();
        let mut scopes = Vec::new();

        let mut scope_types: Vec<&str> = self.registry().scope_types().collect();
        scope_types.sort_unstable();
        for scope_type in scope_types {
            for scope in self.graph().instances(scope_type) {
                let depth = self.scope_depth(&scope, &mut depths, 0)?;
                scopes.push((depth, scope));
            }
        }
        scopes.sort_by(|(left_depth, left), (right_depth, right)| {
            right_depth.cmp(left_depth).then_with(|| left.cmp(right))
        });

        let mut report = RecalculationReport {
            scopes: scopes.len(),
            ..RecalculationReport::default()
        };
        for (_, scope) in &scopes {
            self.recalculate_into(scope, &mut report)?;
        }

        info!(
            scopes = report.scopes,
            created = report.records_created,
            updated = report.records_updated,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "recalculated quotas"
        );
        Ok(report)
    }

    /// Recomputes one scope against its current children and targets.
    pub fn recalculate_scope(&self, scope: &EntityRef) -> Result<RecalculationReport, QuotaError> {
        let _guard = self.exclusive();
        let mut report = RecalculationReport {
            scopes: 1,
            ..RecalculationReport::default()
        };
        self.recalculate_into(scope, &mut report)?;
        Ok(report)
    }

    fn recalculate_into(
        &self,
        scope: &EntityRef,
        report: &mut RecalculationReport,
    ) -> Result<(), QuotaError> {
        for field in self.registry().fields(&scope.entity_type) {
            if !field.is_connected_to_scope(scope, self.graph()) {
                continue;
            }

            let (limit, usage) = field.initial_values(scope, self.graph());
            let (record, created) = self
                .store()
                .get_or_create(scope, field.name(), limit, usage)?;
            if created {
                report.records_created += 1;
            }

            let current = match field.kind() {
                FieldKind::Direct => continue,
                FieldKind::Counter(_) | FieldKind::Total(_) => {
                    match field.target_usage(scope, self.graph()) {
                        Some(current) => current,
                        None => continue,
                    }
                }
                FieldKind::Aggregator(_) => self.sum_children(scope, field)?,
            };

            if current != record.usage {
                debug!(
                    scope = %scope,
                    quota = field.name(),
                    stored = record.usage,
                    current,
                    "repaired quota usage"
                );
                self.store().set_usage(scope, field.name(), current)?;
                report.records_updated += 1;
            }
        }
        Ok(())
    }

    fn scope_depth(
        &self,
        scope: &EntityRef,
        memo: &mut HashMap<EntityRef, usize>,
        level: usize,
    ) -> Result<usize, QuotaError> {
        if let Some(depth) = memo.get(scope) {
            return Ok(*depth);
        }
        if level >= MAX_HIERARCHY_DEPTH {
            return Err(QuotaError::HierarchyTooDeep(
                scope.clone(),
                MAX_HIERARCHY_DEPTH,
            ));
        }

        let mut depth = 0;
        for parent in self.graph().quota_parents(scope) {
            depth = depth.max(self.scope_depth(&parent, memo, level + 1)? + 1);
        }
        memo.insert(scope.clone(), depth);
        Ok(depth)
    }
}
