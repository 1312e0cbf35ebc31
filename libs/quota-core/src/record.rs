use std::fmt;

use serde::{Deserialize, Serialize};

use crate::scope::EntityRef;

/// Limit value meaning "no limit"; never fails validation.
pub const UNLIMITED: i64 = -1;

/// Side of a quota record read by aggregators and summations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaMeasure {
    Usage,
    Limit,
}

impl fmt::Display for QuotaMeasure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaMeasure::Usage => f.write_str("usage"),
            QuotaMeasure::Limit => f.write_str("limit"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub scope: EntityRef,
    pub name: String,
    pub limit: i64,
    pub usage: i64,
}

impl QuotaRecord {
    pub fn new(scope: EntityRef, name: impl Into<String>, limit: i64, usage: i64) -> Self {
        Self {
            scope,
            name: name.into(),
            limit,
            usage,
        }
    }

    pub fn value(&self, measure: QuotaMeasure) -> i64 {
        match measure {
            QuotaMeasure::Usage => self.usage,
            QuotaMeasure::Limit => self.limit,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit == UNLIMITED
    }

    /// Whether applying `delta` would break a finite limit.
    pub fn would_exceed(&self, delta: i64) -> bool {
        delta > 0 && !self.is_unlimited() && self.usage.saturating_add(delta) > self.limit
    }

    pub fn is_exceeded(&self) -> bool {
        !self.is_unlimited() && self.usage > self.limit
    }

    pub fn remaining(&self) -> Option<i64> {
        if self.is_unlimited() {
            None
        } else {
            Some((self.limit - self.usage).max(0))
        }
    }

    pub fn usage_percentage(&self) -> f64 {
        if self.is_unlimited() || self.limit == 0 {
            return 0.0;
        }
        (self.usage as f64 / self.limit as f64) * 100.0
    }
}

/// Outcome of an atomic usage increment at the store level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageUpdate {
    Applied { old_usage: i64, new_usage: i64, limit: i64 },
    /// The validated increment was rolled back; values are as stored.
    Rejected { usage: i64, limit: i64 },
}
