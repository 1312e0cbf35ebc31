use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, error, info, warn};

use crate::error::QuotaViolation;
use crate::field::QuotaField;
use crate::record::{QuotaMeasure, QuotaRecord, UsageUpdate, UNLIMITED};
use crate::registry::{self, QuotaRegistry};
use crate::scope::{EntityGraph, EntityRef};
use crate::store::{QuotaStore, StorageError};
use crate::QuotaError;

/// Upper bound on hierarchy depth; deeper chains are treated as cycles.
pub const MAX_HIERARCHY_DEPTH: usize = 64;

/// Aggregates found missing during propagation, created afterwards from a
/// sum over their children.
type MissingAggregates = Vec<(EntityRef, Arc<QuotaField>)>;

/// Entry point for reading and mutating quotas.
///
/// Every mutating call returns only after the record and all aggregating
/// ancestors have been updated.
pub struct QuotaEngine {
    registry: Arc<QuotaRegistry>,
    store: Arc<dyn QuotaStore>,
    graph: Arc<dyn EntityGraph>,
    /// Held shared by an increment together with its propagation, and
    /// exclusively while an aggregate is summed from its children.
    hierarchy: RwLock<()>,
}

impl QuotaEngine {
    pub fn new(
        registry: Arc<QuotaRegistry>,
        store: Arc<dyn QuotaStore>,
        graph: Arc<dyn EntityGraph>,
    ) -> Self {
        Self {
            registry,
            store,
            graph,
            hierarchy: RwLock::new(()),
        }
    }

    /// Engine over the registry installed with [`registry::init`].
    pub fn with_global_registry(store: Arc<dyn QuotaStore>, graph: Arc<dyn EntityGraph>) -> Self {
        Self::new(registry::global(), store, graph)
    }

    pub fn registry(&self) -> &QuotaRegistry {
        &self.registry
    }

    pub fn store(&self) -> &dyn QuotaStore {
        self.store.as_ref()
    }

    pub fn graph(&self) -> &dyn EntityGraph {
        self.graph.as_ref()
    }

    pub fn field(&self, scope: &EntityRef, name: &str) -> Result<&Arc<QuotaField>, QuotaError> {
        self.registry.field(&scope.entity_type, name)
    }

    fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.hierarchy.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.hierarchy.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the record, creating it from the field defaults if needed.
    pub fn get_or_create_quota(
        &self,
        scope: &EntityRef,
        name: &str,
    ) -> Result<QuotaRecord, QuotaError> {
        let field = self.field(scope, name)?;
        if !field.is_connected_to_scope(scope, self.graph()) {
            return Err(QuotaError::CreationConditionFailed {
                scope: scope.clone(),
                name: name.to_string(),
            });
        }
        self.ensure_quota(scope, field)
    }

    pub(crate) fn ensure_quota(
        &self,
        scope: &EntityRef,
        field: &QuotaField,
    ) -> Result<QuotaRecord, QuotaError> {
        if let Some(existing) = self.store.get(scope, field.name())? {
            return Ok(existing);
        }
        let _guard = self.exclusive();
        self.create_quota(scope, field)
    }

    /// Caller holds the exclusive hierarchy guard, so no increment is between
    /// its store write and its propagation while children are summed.
    fn create_quota(
        &self,
        scope: &EntityRef,
        field: &QuotaField,
    ) -> Result<QuotaRecord, QuotaError> {
        if let Some(existing) = self.store.get(scope, field.name())? {
            return Ok(existing);
        }

        let (limit, mut usage) = field.initial_values(scope, self.graph());
        if field.aggregator().is_some() {
            usage = self.sum_children(scope, field)?;
        }

        let (record, created) = self.store.get_or_create(scope, field.name(), limit, usage)?;
        if created {
            debug!(scope = %scope, quota = field.name(), limit, usage, "created quota");
            let mut missing = Vec::new();
            self.propagate(scope, field.name(), QuotaMeasure::Usage, record.usage, &mut missing)?;
            self.propagate(scope, field.name(), QuotaMeasure::Limit, record.limit, &mut missing)?;
            for (parent, parent_field) in missing {
                self.create_quota(&parent, &parent_field)?;
            }
        }
        Ok(record)
    }

    fn create_missing(&self, missing: MissingAggregates) -> Result<(), QuotaError> {
        if missing.is_empty() {
            return Ok(());
        }
        let _guard = self.exclusive();
        for (scope, field) in missing {
            self.create_quota(&scope, &field)?;
        }
        Ok(())
    }

    pub fn get_quota(&self, scope: &EntityRef, name: &str) -> Result<QuotaRecord, QuotaError> {
        self.get_or_create_quota(scope, name)
    }

    /// Current usage, never reported below zero.
    pub fn get_quota_usage(&self, scope: &EntityRef, name: &str) -> Result<i64, QuotaError> {
        let field = self.field(scope, name)?;
        let usage = match self.store.get(scope, name)? {
            Some(record) => record.usage,
            None => field.default_usage.resolve(scope, self.graph()),
        };
        Ok(usage.max(0))
    }

    /// Stored limit, or the field default when the record does not exist yet.
    pub fn get_quota_limit(&self, scope: &EntityRef, name: &str) -> Result<i64, QuotaError> {
        let field = self.field(scope, name)?;
        Ok(match self.store.get(scope, name)? {
            Some(record) => record.limit,
            None => field.default_limit.resolve(scope, self.graph()),
        })
    }

    /// Unrestricted limit update, used by backend synchronisation.
    pub fn set_quota_limit(&self, scope: &EntityRef, name: &str, limit: i64) -> Result<(), QuotaError> {
        self.get_or_create_quota(scope, name)?;
        let missing = {
            let _guard = self.shared();
            let previous = self.store.set_limit(scope, name, limit)?.unwrap_or(limit);
            if previous != limit {
                info!(scope = %scope, quota = name, previous, limit, "updated quota limit");
            }
            self.propagate_change(scope, name, QuotaMeasure::Limit, previous, limit)?
        };
        self.create_missing(missing)
    }

    /// Administrative limit update: backend quotas are read-only and a finite
    /// limit may not drop below current usage.
    pub fn update_quota_limit(
        &self,
        scope: &EntityRef,
        name: &str,
        limit: i64,
    ) -> Result<(), QuotaError> {
        let field = self.field(scope, name)?;
        if field.is_backend {
            return Err(QuotaError::BackendQuota {
                scope: scope.clone(),
                name: name.to_string(),
            });
        }

        let record = self.get_or_create_quota(scope, name)?;
        if limit != UNLIMITED && record.usage > limit {
            return Err(QuotaError::LimitBelowUsage {
                usage: record.usage,
                limit,
            });
        }
        self.set_quota_limit(scope, name, limit)
    }

    /// Overwrites the usage; negative values are stored as zero.
    pub fn set_quota_usage(&self, scope: &EntityRef, name: &str, usage: i64) -> Result<(), QuotaError> {
        let usage = usage.max(0);
        self.get_or_create_quota(scope, name)?;
        let missing = {
            let _guard = self.shared();
            let previous = self.store.set_usage(scope, name, usage)?.unwrap_or(usage);
            self.propagate_change(scope, name, QuotaMeasure::Usage, previous, usage)?
        };
        self.create_missing(missing)
    }

    /// Applies `delta` to the usage, never taking it below zero. With
    /// `validate`, a positive delta that would exceed a finite limit fails
    /// with [`QuotaError::LimitExceeded`] and leaves the record untouched.
    pub fn add_quota_usage(
        &self,
        scope: &EntityRef,
        name: &str,
        delta: i64,
        validate: bool,
    ) -> Result<(), QuotaError> {
        self.apply_usage_delta(scope, name, delta, validate)?;
        Ok(())
    }

    /// [`Self::add_quota_usage`] returning the change actually stored, which
    /// differs from `delta` when the zero floor applies.
    pub(crate) fn apply_usage_delta(
        &self,
        scope: &EntityRef,
        name: &str,
        delta: i64,
        validate: bool,
    ) -> Result<i64, QuotaError> {
        if delta == 0 {
            return Ok(0);
        }
        self.get_or_create_quota(scope, name)?;

        let (change, missing) = {
            let _guard = self.shared();
            match self.store.add_usage(scope, name, delta, validate)? {
                UsageUpdate::Applied {
                    old_usage,
                    new_usage,
                    ..
                } => {
                    debug!(scope = %scope, quota = name, delta, usage = new_usage, "applied quota delta");
                    let missing =
                        self.propagate_change(scope, name, QuotaMeasure::Usage, old_usage, new_usage)?;
                    (new_usage.saturating_sub(old_usage), missing)
                }
                UsageUpdate::Rejected { usage, limit } => {
                    warn!(scope = %scope, quota = name, delta, usage, limit, "quota limit exceeded");
                    return Err(QuotaError::LimitExceeded {
                        scope: scope.clone(),
                        name: name.to_string(),
                        limit,
                        requested: usage.saturating_add(delta),
                    });
                }
            }
        };
        self.create_missing(missing)?;
        Ok(change)
    }

    /// Checks a batch of deltas against the current limits of `scope`
    /// without applying them. Every violation is reported in one
    /// [`QuotaError::QuotasExceeded`]. Non-positive deltas never fail.
    pub fn validate_quota_change(
        &self,
        scope: &EntityRef,
        deltas: &[(&str, i64)],
    ) -> Result<(), QuotaError> {
        let mut violations = Vec::new();
        for &(name, delta) in deltas {
            if delta <= 0 {
                continue;
            }
            let limit = self.get_quota_limit(scope, name)?;
            if limit == UNLIMITED {
                continue;
            }
            let requested = self.get_quota_usage(scope, name)?.saturating_add(delta);
            if requested > limit {
                violations.push(QuotaViolation {
                    scope: scope.clone(),
                    name: name.to_string(),
                    limit,
                    requested,
                });
            }
        }

        if violations.is_empty() {
            return Ok(());
        }
        warn!(scope = %scope, violations = violations.len(), "quota change rejected");
        Err(QuotaError::QuotasExceeded(violations))
    }

    /// Applies `delta * mult` of every named quota to every scope, for
    /// resources that count against several scopes at once. All-or-nothing:
    /// on failure the changes already made by this call are reverted.
    pub fn apply_quota_changes(
        &self,
        scopes: &[EntityRef],
        deltas: &[(&str, i64)],
        mult: i64,
        validate: bool,
    ) -> Result<(), QuotaError> {
        let mut applied: Vec<(EntityRef, &str, i64)> = Vec::new();
        for &(name, delta) in deltas {
            let delta = delta.saturating_mul(mult);
            for scope in scopes {
                match self.apply_usage_delta(scope, name, delta, validate) {
                    Ok(change) => applied.push((scope.clone(), name, change)),
                    Err(err) => {
                        self.compensate(&applied);
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn increase_quotas_usage(
        &self,
        scopes: &[EntityRef],
        deltas: &[(&str, i64)],
        validate: bool,
    ) -> Result<(), QuotaError> {
        self.apply_quota_changes(scopes, deltas, 1, validate)
    }

    pub fn decrease_quotas_usage(
        &self,
        scopes: &[EntityRef],
        deltas: &[(&str, i64)],
    ) -> Result<(), QuotaError> {
        self.apply_quota_changes(scopes, deltas, -1, false)
    }

    /// Reverts changes in reverse order; failures are logged, not returned.
    pub(crate) fn compensate(&self, applied: &[(EntityRef, &str, i64)]) {
        for (scope, name, change) in applied.iter().rev() {
            let revert = change.saturating_neg();
            warn!(scope = %scope, quota = *name, delta = revert, "reverting quota delta");
            if let Err(err) = self.apply_usage_delta(scope, name, revert, false) {
                error!(scope = %scope, quota = *name, error = %err, "failed to revert quota delta");
            }
        }
    }

    /// Every registered quota of `scope` with its current or default values.
    pub fn quotas(&self, scope: &EntityRef) -> Result<Vec<QuotaRecord>, QuotaError> {
        let mut records = Vec::new();
        for field in self.registry.fields(&scope.entity_type) {
            if !field.is_connected_to_scope(scope, self.graph()) {
                continue;
            }
            let record = match self.store.get(scope, field.name())? {
                Some(record) => record,
                None => {
                    let (limit, usage) = field.initial_values(scope, self.graph());
                    QuotaRecord::new(scope.clone(), field.name(), limit, usage)
                }
            };
            records.push(record);
        }
        Ok(records)
    }

    /// Sums quotas across `scopes`.
    ///
    /// Limit sums are keyed by quota name and collapse to [`UNLIMITED`] if any
    /// summed limit is unlimited; usage sums are keyed `<name>_usage`. When
    /// `names` is `None` every registered quota of each scope is included.
    pub fn get_sum_of_quotas(
        &self,
        scopes: &[EntityRef],
        names: Option<&[&str]>,
        measures: &[QuotaMeasure],
    ) -> Result<BTreeMap<String, i64>, QuotaError> {
        let mut sums: BTreeMap<String, i64> = BTreeMap::new();

        for scope in scopes {
            let names: Vec<&str> = match names {
                Some(names) => names.to_vec(),
                None => self.registry.names(&scope.entity_type),
            };

            for name in names {
                let field = self.field(scope, name)?;
                let (limit, usage) = match self.store.get(scope, name)? {
                    Some(record) => (record.limit, record.usage),
                    None => field.initial_values(scope, self.graph()),
                };

                for measure in measures {
                    match measure {
                        QuotaMeasure::Usage => {
                            let sum = sums.entry(format!("{name}_usage")).or_insert(0);
                            *sum = sum.saturating_add(usage);
                        }
                        QuotaMeasure::Limit => {
                            let sum = sums.entry(name.to_string()).or_insert(0);
                            if *sum == UNLIMITED || limit == UNLIMITED {
                                *sum = UNLIMITED;
                            } else {
                                *sum = sum.saturating_add(limit);
                            }
                        }
                    }
                }
            }
        }

        Ok(sums)
    }

    /// Reports a change of `measure` on a child's quota to every aggregating
    /// ancestor. `old` is 0 for a record that was just created.
    pub fn on_child_quota_changed(
        &self,
        child: &EntityRef,
        name: &str,
        measure: QuotaMeasure,
        old: i64,
        new: i64,
    ) -> Result<(), QuotaError> {
        let missing = {
            let _guard = self.shared();
            self.propagate_change(child, name, measure, old, new)?
        };
        self.create_missing(missing)
    }

    /// Removes a scope's records and withdraws their values from every
    /// aggregating ancestor.
    pub fn on_child_deleted(&self, child: &EntityRef) -> Result<(), QuotaError> {
        let (removed, missing) = {
            let _guard = self.shared();
            let records = self.store.delete_scope(child)?;
            let mut missing = Vec::new();
            for record in &records {
                for measure in [QuotaMeasure::Usage, QuotaMeasure::Limit] {
                    let withdrawn = record.value(measure).saturating_neg();
                    self.propagate(child, &record.name, measure, withdrawn, &mut missing)?;
                }
            }
            (records.len(), missing)
        };
        debug!(scope = %child, removed, "discarded scope quotas");
        self.create_missing(missing)
    }

    fn propagate_change(
        &self,
        child: &EntityRef,
        name: &str,
        measure: QuotaMeasure,
        old: i64,
        new: i64,
    ) -> Result<MissingAggregates, QuotaError> {
        let mut missing = Vec::new();
        self.propagate(child, name, measure, new.saturating_sub(old), &mut missing)?;
        Ok(missing)
    }

    /// Chained upward propagation: each ancestor update is queued as a usage
    /// change of that ancestor's own quota. Ancestors without a record yet
    /// are collected in `missing`; summing their children later picks this
    /// change up.
    fn propagate(
        &self,
        scope: &EntityRef,
        name: &str,
        measure: QuotaMeasure,
        diff: i64,
        missing: &mut MissingAggregates,
    ) -> Result<(), QuotaError> {
        let mut pending = vec![(scope.clone(), name.to_string(), measure, diff, 0usize)];

        while let Some((child, quota, measure, diff, depth)) = pending.pop() {
            if diff == 0 {
                continue;
            }
            if depth >= MAX_HIERARCHY_DEPTH {
                return Err(QuotaError::HierarchyTooDeep(child, MAX_HIERARCHY_DEPTH));
            }

            for parent in self.graph.quota_parents(&child) {
                for field in self.registry.aggregators_over(&parent.entity_type, &quota, measure) {
                    if !field.is_connected_to_scope(&parent, self.graph()) {
                        continue;
                    }

                    match self.store.shift_usage(&parent, field.name(), diff) {
                        Ok(UsageUpdate::Applied {
                            old_usage,
                            new_usage,
                            ..
                        }) => {
                            debug!(
                                child = %child,
                                parent = %parent,
                                quota = field.name(),
                                diff,
                                "propagated quota change"
                            );
                            pending.push((
                                parent.clone(),
                                field.name().to_string(),
                                QuotaMeasure::Usage,
                                new_usage.saturating_sub(old_usage),
                                depth + 1,
                            ));
                        }
                        Ok(UsageUpdate::Rejected { .. }) => {}
                        Err(StorageError::QuotaNotFound { .. }) => {
                            missing.push((parent.clone(), Arc::clone(field)));
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }

        Ok(())
    }

    pub(crate) fn sum_children(
        &self,
        scope: &EntityRef,
        field: &QuotaField,
    ) -> Result<i64, QuotaError> {
        let (Some(rule), Some(child_quota)) = (field.aggregator(), field.child_quota_name()) else {
            return Ok(0);
        };

        let mut total: i64 = 0;
        for child in rule.children.children(scope, self.graph()) {
            if let Some(record) = self.store.get(&child, child_quota)? {
                total = total.saturating_add(record.value(rule.measure));
            }
        }
        Ok(total)
    }
}
