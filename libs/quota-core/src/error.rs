use std::fmt;

use thiserror::Error;

use crate::scope::EntityRef;
use crate::store::StorageError;

/// One quota a batch of deltas would push over its limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaViolation {
    pub scope: EntityRef,
    pub name: String,
    pub limit: i64,
    pub requested: i64,
}

impl fmt::Display for QuotaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} quota limit: {}, requires {} ({})",
            self.name, self.limit, self.requested, self.scope
        )
    }
}

fn join_violations(violations: &[QuotaViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("quota {name} is not registered for scope type {scope_type}")]
    UnknownQuota { scope_type: String, name: String },
    #[error("quota {name} is already registered for scope type {scope_type}")]
    DuplicateField { scope_type: String, name: String },
    #[error("cannot create quota {name} for scope {scope}: creation condition failed")]
    CreationConditionFailed { scope: EntityRef, name: String },
    #[error("quota {name} resolved to scope {scope} but is registered for {expected}")]
    ScopeTypeMismatch {
        scope: EntityRef,
        name: String,
        expected: String,
    },
    #[error("invalid relation path: {0:?}")]
    InvalidPath(String),
    #[error("scope hierarchy above {0} is deeper than {1} levels")]
    HierarchyTooDeep(EntityRef, usize),
    #[error("one or more quotas were exceeded: {name} quota limit: {limit}, requires {requested} ({scope})")]
    LimitExceeded {
        scope: EntityRef,
        name: String,
        limit: i64,
        requested: i64,
    },
    #[error("one or more quotas were exceeded: {}", join_violations(.0))]
    QuotasExceeded(Vec<QuotaViolation>),
    #[error("quota {name} of {scope} is controlled by the backend")]
    BackendQuota { scope: EntityRef, name: String },
    #[error("current quota usage {usage} exceeds new limit {limit}")]
    LimitBelowUsage { usage: i64, limit: i64 },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl QuotaError {
    /// Setup bugs; never worth retrying.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            QuotaError::UnknownQuota { .. }
                | QuotaError::DuplicateField { .. }
                | QuotaError::CreationConditionFailed { .. }
                | QuotaError::ScopeTypeMismatch { .. }
                | QuotaError::InvalidPath(_)
                | QuotaError::HierarchyTooDeep(..)
        )
    }

    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            QuotaError::LimitExceeded { .. } | QuotaError::QuotasExceeded(_)
        )
    }
}
