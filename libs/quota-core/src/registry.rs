//! Per-scope-type quota field registry.
//!
//! Built once during bootstrap with explicit [`QuotaRegistry::register`]
//! calls, then either handed to a [`crate::QuotaEngine`] directly or
//! installed process-wide with [`init`].

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use tracing::debug;

use crate::field::QuotaField;
use crate::record::QuotaMeasure;
use crate::QuotaError;

#[derive(Debug, Default, Clone)]
pub struct QuotaRegistry {
    fields: HashMap<String, Vec<Arc<QuotaField>>>,
    /// target entity type -> (scope type, counter or total field)
    targets: HashMap<String, Vec<(String, Arc<QuotaField>)>>,
}

impl QuotaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scope_type: &str, field: QuotaField) -> Result<(), QuotaError> {
        let fields = self.fields.entry(scope_type.to_string()).or_default();
        if fields.iter().any(|existing| existing.name() == field.name()) {
            return Err(QuotaError::DuplicateField {
                scope_type: scope_type.to_string(),
                name: field.name().to_string(),
            });
        }

        let field = Arc::new(field);
        if let Some((target_types, _)) = field.target_path() {
            for target_type in target_types {
                self.targets
                    .entry(target_type.clone())
                    .or_default()
                    .push((scope_type.to_string(), Arc::clone(&field)));
            }
        }

        debug!(scope_type, quota = field.name(), kind = ?field.kind(), "registered quota field");
        fields.push(field);
        Ok(())
    }

    /// Chainable form of [`QuotaRegistry::register`] for bootstrap code.
    pub fn with_field(mut self, scope_type: &str, field: QuotaField) -> Result<Self, QuotaError> {
        self.register(scope_type, field)?;
        Ok(self)
    }

    pub fn field(&self, scope_type: &str, name: &str) -> Result<&Arc<QuotaField>, QuotaError> {
        self.fields(scope_type)
            .iter()
            .find(|field| field.name() == name)
            .ok_or_else(|| QuotaError::UnknownQuota {
                scope_type: scope_type.to_string(),
                name: name.to_string(),
            })
    }

    /// Fields of a scope type in registration order.
    pub fn fields(&self, scope_type: &str) -> &[Arc<QuotaField>] {
        self.fields
            .get(scope_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn names(&self, scope_type: &str) -> Vec<&str> {
        self.fields(scope_type)
            .iter()
            .map(|field| field.name())
            .collect()
    }

    pub fn is_scope_type(&self, scope_type: &str) -> bool {
        self.fields.contains_key(scope_type)
    }

    pub fn scope_types(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Counter and total fields counting instances of `entity_type`, paired
    /// with the scope type each is registered on.
    pub fn fields_targeting(&self, entity_type: &str) -> &[(String, Arc<QuotaField>)] {
        self.targets
            .get(entity_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Aggregators on `scope_type` that sum `measure` of the child quota
    /// `child_quota`.
    pub fn aggregators_over<'a>(
        &'a self,
        scope_type: &str,
        child_quota: &'a str,
        measure: QuotaMeasure,
    ) -> impl Iterator<Item = &'a Arc<QuotaField>> + 'a {
        self.fields(scope_type).iter().filter(move |field| {
            field.child_quota_name() == Some(child_quota)
                && field.aggregator().map(|rule| rule.measure) == Some(measure)
        })
    }
}

static GLOBAL_REGISTRY: OnceLock<RwLock<Arc<QuotaRegistry>>> = OnceLock::new();

fn global_slot() -> &'static RwLock<Arc<QuotaRegistry>> {
    GLOBAL_REGISTRY.get_or_init(|| RwLock::new(Arc::new(QuotaRegistry::new())))
}

/// Installs `registry` as the process-wide registry, replacing any previous one.
pub fn init(registry: QuotaRegistry) -> Arc<QuotaRegistry> {
    let registry = Arc::new(registry);
    *global_slot().write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&registry);
    registry
}

/// Process-wide registry; empty until [`init`] runs.
pub fn global() -> Arc<QuotaRegistry> {
    Arc::clone(&global_slot().read().unwrap_or_else(PoisonError::into_inner))
}

pub fn reset() {
    init(QuotaRegistry::new());
}
