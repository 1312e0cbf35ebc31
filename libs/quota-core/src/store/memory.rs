use std::collections::BTreeMap;

use dashmap::DashMap;

use super::{exceeds_after, next_usage, QuotaStore, StorageError};
use crate::record::{QuotaRecord, UsageUpdate, UNLIMITED};
use crate::scope::EntityRef;

/// Process-local store. Each scope's records sit behind one map entry, so the
/// entry guard is the critical section for validating increments.
#[derive(Debug, Default)]
pub struct MemoryQuotaStore {
    scopes: DashMap<EntityRef, BTreeMap<String, QuotaRecord>>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }

    fn increment(
        &self,
        scope: &EntityRef,
        name: &str,
        delta: i64,
        validate: bool,
        floored: bool,
    ) -> Result<UsageUpdate, StorageError> {
        let not_found = || StorageError::QuotaNotFound {
            scope: scope.clone(),
            name: name.to_string(),
        };
        let mut quotas = self.scopes.get_mut(scope).ok_or_else(not_found)?;
        let record = quotas.get_mut(name).ok_or_else(not_found)?;

        let old_usage = record.usage;
        let new_usage = next_usage(old_usage, delta, floored);
        if exceeds_after(new_usage, record.limit, delta, validate) {
            return Ok(UsageUpdate::Rejected {
                usage: old_usage,
                limit: record.limit,
            });
        }
        record.usage = new_usage;

        Ok(UsageUpdate::Applied {
            old_usage,
            new_usage,
            limit: record.limit,
        })
    }
}

impl QuotaStore for MemoryQuotaStore {
    fn get(&self, scope: &EntityRef, name: &str) -> Result<Option<QuotaRecord>, StorageError> {
        Ok(self
            .scopes
            .get(scope)
            .and_then(|quotas| quotas.get(name).cloned()))
    }

    fn get_or_create(
        &self,
        scope: &EntityRef,
        name: &str,
        limit: i64,
        usage: i64,
    ) -> Result<(QuotaRecord, bool), StorageError> {
        let mut quotas = self.scopes.entry(scope.clone()).or_default();
        if let Some(existing) = quotas.get(name) {
            return Ok((existing.clone(), false));
        }
        let record = QuotaRecord::new(scope.clone(), name, limit, usage);
        quotas.insert(name.to_string(), record.clone());
        Ok((record, true))
    }

    fn set_limit(
        &self,
        scope: &EntityRef,
        name: &str,
        limit: i64,
    ) -> Result<Option<i64>, StorageError> {
        let mut quotas = self.scopes.entry(scope.clone()).or_default();
        match quotas.get_mut(name) {
            Some(record) => Ok(Some(std::mem::replace(&mut record.limit, limit))),
            None => {
                quotas.insert(
                    name.to_string(),
                    QuotaRecord::new(scope.clone(), name, limit, 0),
                );
                Ok(None)
            }
        }
    }

    fn set_usage(
        &self,
        scope: &EntityRef,
        name: &str,
        usage: i64,
    ) -> Result<Option<i64>, StorageError> {
        let mut quotas = self.scopes.entry(scope.clone()).or_default();
        match quotas.get_mut(name) {
            Some(record) => Ok(Some(std::mem::replace(&mut record.usage, usage))),
            None => {
                quotas.insert(
                    name.to_string(),
                    QuotaRecord::new(scope.clone(), name, UNLIMITED, usage),
                );
                Ok(None)
            }
        }
    }

    fn add_usage(
        &self,
        scope: &EntityRef,
        name: &str,
        delta: i64,
        validate: bool,
    ) -> Result<UsageUpdate, StorageError> {
        self.increment(scope, name, delta, validate, true)
    }

    fn shift_usage(
        &self,
        scope: &EntityRef,
        name: &str,
        delta: i64,
    ) -> Result<UsageUpdate, StorageError> {
        self.increment(scope, name, delta, false, false)
    }

    fn list_scope(&self, scope: &EntityRef) -> Result<Vec<QuotaRecord>, StorageError> {
        Ok(self
            .scopes
            .get(scope)
            .map(|quotas| quotas.values().cloned().collect())
            .unwrap_or_default())
    }

    fn delete_scope(&self, scope: &EntityRef) -> Result<Vec<QuotaRecord>, StorageError> {
        Ok(self
            .scopes
            .remove(scope)
            .map(|(_, quotas)| quotas.into_values().collect())
            .unwrap_or_default())
    }
}
