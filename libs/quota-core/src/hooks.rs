//! Incremental update hooks driven by entity lifecycle events.

use tracing::{debug, error};

use crate::engine::QuotaEngine;
use crate::scope::EntityRef;
use crate::QuotaError;

/// Lifecycle notification from the host. Must be delivered while the entity
/// is still resolvable through the engine's graph, deletions included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityEvent {
    Created(EntityRef),
    Deleted(EntityRef),
    AttributeChanged {
        entity: EntityRef,
        attribute: String,
        old: i64,
        new: i64,
    },
}

#[derive(Debug, Clone, Copy)]
enum TargetChange<'a> {
    Created,
    Deleted,
    Attribute { name: &'a str, delta: i64 },
}

impl QuotaEngine {
    pub fn handle(&self, event: &EntityEvent) -> Result<(), QuotaError> {
        match event {
            EntityEvent::Created(entity) => self.entity_created(entity),
            EntityEvent::Deleted(entity) => self.entity_deleted(entity),
            EntityEvent::AttributeChanged {
                entity,
                attribute,
                old,
                new,
            } => self.attribute_changed(entity, attribute, *old, *new),
        }
    }

    /// Creates the quotas of a new scope, then counts the entity in every
    /// counter or total field targeting its type. All-or-nothing: a rejected
    /// increment undoes the increments and records made for this event.
    pub fn entity_created(&self, entity: &EntityRef) -> Result<(), QuotaError> {
        let is_scope = self.registry().is_scope_type(&entity.entity_type);
        if is_scope {
            self.init_scope_quotas(entity)?;
        }

        if let Err(err) = self.apply_target_change(entity, TargetChange::Created) {
            if is_scope {
                if let Err(cleanup) = self.on_child_deleted(entity) {
                    error!(scope = %entity, error = %cleanup, "failed to discard quotas of rejected scope");
                }
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn entity_deleted(&self, entity: &EntityRef) -> Result<(), QuotaError> {
        self.apply_target_change(entity, TargetChange::Deleted)?;
        if self.registry().is_scope_type(&entity.entity_type) {
            self.on_child_deleted(entity)?;
        }
        Ok(())
    }

    /// Shifts total fields tracking `attribute` by `new - old`.
    pub fn attribute_changed(
        &self,
        entity: &EntityRef,
        attribute: &str,
        old: i64,
        new: i64,
    ) -> Result<(), QuotaError> {
        let delta = new.saturating_sub(old);
        if delta == 0 {
            return Ok(());
        }
        self.apply_target_change(
            entity,
            TargetChange::Attribute {
                name: attribute,
                delta,
            },
        )
    }

    /// Eagerly creates every quota the scope is connected to. Returns how
    /// many records were newly created.
    pub fn init_scope_quotas(&self, scope: &EntityRef) -> Result<usize, QuotaError> {
        let mut created = 0;
        for field in self.registry().fields(&scope.entity_type) {
            if !field.is_connected_to_scope(scope, self.graph()) {
                continue;
            }
            if self.store().get(scope, field.name())?.is_none() {
                self.ensure_quota(scope, field)?;
                created += 1;
            }
        }
        debug!(scope = %scope, created, "initialized scope quotas");
        Ok(created)
    }

    fn apply_target_change(
        &self,
        entity: &EntityRef,
        change: TargetChange<'_>,
    ) -> Result<(), QuotaError> {
        let mut applied: Vec<(EntityRef, &str, i64)> = Vec::new();

        for (scope_type, field) in self.registry().fields_targeting(&entity.entity_type) {
            let delta = match change {
                TargetChange::Created => field.weight_of(entity, self.graph()),
                TargetChange::Deleted => field.weight_of(entity, self.graph()).saturating_neg(),
                TargetChange::Attribute { name, delta } => {
                    if field.tracked_attribute() != Some(name) {
                        continue;
                    }
                    delta
                }
            };
            if delta == 0 {
                continue;
            }

            let Some((_, path)) = field.target_path() else {
                continue;
            };
            let Some(scope) = self.graph().resolve(entity, path) else {
                debug!(entity = %entity, quota = field.name(), path = %path, "no scope on path, skipping");
                continue;
            };
            if &scope.entity_type != scope_type {
                self.compensate(&applied);
                return Err(QuotaError::ScopeTypeMismatch {
                    scope,
                    name: field.name().to_string(),
                    expected: scope_type.clone(),
                });
            }
            if !field.is_connected_to_scope(&scope, self.graph()) {
                continue;
            }

            let stored = match self.apply_usage_delta(&scope, field.name(), delta, true) {
                Ok(stored) => stored,
                Err(err) => {
                    self.compensate(&applied);
                    return Err(err);
                }
            };
            applied.push((scope, field.name(), stored));
        }

        Ok(())
    }
}
