//! Declarative quota field descriptors.
//!
//! A [`QuotaField`] says how one named quota of a scope type behaves: its
//! defaults, whether it mirrors a backend, and for derived quotas where its
//! usage comes from.

use std::fmt;
use std::sync::Arc;

use crate::record::{QuotaMeasure, UNLIMITED};
use crate::scope::{EntityGraph, EntityRef, RelationPath};

/// Function of a scope (or target instance) evaluated against the graph.
pub type ScopeFn<T> = Arc<dyn Fn(&EntityRef, &dyn EntityGraph) -> T + Send + Sync>;

/// Replacement for the default "sum of weights" counter computation.
pub type CurrentUsageFn = Arc<dyn Fn(&[String], &EntityRef, &dyn EntityGraph) -> i64 + Send + Sync>;

#[derive(Clone)]
pub enum DefaultValue {
    Constant(i64),
    Computed(ScopeFn<i64>),
}

impl DefaultValue {
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&EntityRef, &dyn EntityGraph) -> i64 + Send + Sync + 'static,
    {
        DefaultValue::Computed(Arc::new(f))
    }

    pub fn resolve(&self, scope: &EntityRef, graph: &dyn EntityGraph) -> i64 {
        match self {
            DefaultValue::Constant(value) => *value,
            DefaultValue::Computed(f) => f(scope, graph),
        }
    }
}

impl From<i64> for DefaultValue {
    fn from(value: i64) -> Self {
        DefaultValue::Constant(value)
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Constant(value) => write!(f, "Constant({value})"),
            DefaultValue::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Counts target instances whose `path` resolves to the scope.
#[derive(Clone)]
pub struct CounterRule {
    pub targets: Vec<String>,
    pub path: RelationPath,
    weight: Option<ScopeFn<i64>>,
    current_usage: Option<CurrentUsageFn>,
}

impl CounterRule {
    pub fn new<I, S>(targets: I, path: RelationPath) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            path,
            weight: None,
            current_usage: None,
        }
    }

    /// Per-instance delta; 1 when unset.
    pub fn with_weight<F>(mut self, weight: F) -> Self
    where
        F: Fn(&EntityRef, &dyn EntityGraph) -> i64 + Send + Sync + 'static,
    {
        self.weight = Some(Arc::new(weight));
        self
    }

    pub fn with_current_usage<F>(mut self, current_usage: F) -> Self
    where
        F: Fn(&[String], &EntityRef, &dyn EntityGraph) -> i64 + Send + Sync + 'static,
    {
        self.current_usage = Some(Arc::new(current_usage));
        self
    }

    fn weight_of(&self, target: &EntityRef, graph: &dyn EntityGraph) -> i64 {
        self.weight.as_ref().map_or(1, |weight| weight(target, graph))
    }
}

/// Sums an integer attribute over target instances referencing the scope.
#[derive(Debug, Clone)]
pub struct TotalRule {
    pub targets: Vec<String>,
    pub path: RelationPath,
    pub target_field: String,
}

impl TotalRule {
    pub fn new<I, S>(targets: I, path: RelationPath, target_field: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            path,
            target_field: target_field.into(),
        }
    }
}

/// Selects a scope's children: instances of `child_type` whose `path`
/// resolves to the scope.
#[derive(Debug, Clone)]
pub struct ChildSelector {
    pub child_type: String,
    pub path: RelationPath,
}

impl ChildSelector {
    pub fn new(child_type: impl Into<String>, path: RelationPath) -> Self {
        Self {
            child_type: child_type.into(),
            path,
        }
    }

    pub fn children(&self, scope: &EntityRef, graph: &dyn EntityGraph) -> Vec<EntityRef> {
        graph.referencing(&self.child_type, &self.path, scope)
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorRule {
    pub children: ChildSelector,
    /// Reads `usage` or `limit` of the children's quota.
    pub measure: QuotaMeasure,
    child_quota_name: Option<String>,
}

impl AggregatorRule {
    pub fn new(children: ChildSelector, measure: QuotaMeasure) -> Self {
        Self {
            children,
            measure,
            child_quota_name: None,
        }
    }

    pub fn with_child_quota(mut self, name: impl Into<String>) -> Self {
        self.child_quota_name = Some(name.into());
        self
    }
}

#[derive(Clone)]
pub enum FieldKind {
    Direct,
    Counter(CounterRule),
    Total(TotalRule),
    Aggregator(AggregatorRule),
}

impl fmt::Debug for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Direct => f.write_str("Direct"),
            FieldKind::Counter(rule) => f
                .debug_struct("Counter")
                .field("targets", &rule.targets)
                .field("path", &rule.path.to_string())
                .finish(),
            FieldKind::Total(rule) => f.debug_tuple("Total").field(rule).finish(),
            FieldKind::Aggregator(rule) => f.debug_tuple("Aggregator").field(rule).finish(),
        }
    }
}

#[derive(Clone)]
pub struct QuotaField {
    name: String,
    pub default_limit: DefaultValue,
    pub default_usage: DefaultValue,
    pub is_backend: bool,
    creation_condition: Option<ScopeFn<bool>>,
    kind: FieldKind,
}

impl QuotaField {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            default_limit: DefaultValue::Constant(UNLIMITED),
            default_usage: DefaultValue::Constant(0),
            is_backend: false,
            creation_condition: None,
            kind,
        }
    }

    pub fn direct(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Direct)
    }

    pub fn counter(name: impl Into<String>, rule: CounterRule) -> Self {
        Self::new(name, FieldKind::Counter(rule))
    }

    pub fn total(name: impl Into<String>, rule: TotalRule) -> Self {
        Self::new(name, FieldKind::Total(rule))
    }

    pub fn usage_aggregator(name: impl Into<String>, children: ChildSelector) -> Self {
        Self::new(
            name,
            FieldKind::Aggregator(AggregatorRule::new(children, QuotaMeasure::Usage)),
        )
    }

    pub fn limit_aggregator(name: impl Into<String>, children: ChildSelector) -> Self {
        Self::new(
            name,
            FieldKind::Aggregator(AggregatorRule::new(children, QuotaMeasure::Limit)),
        )
    }

    pub fn with_default_limit(mut self, limit: impl Into<DefaultValue>) -> Self {
        self.default_limit = limit.into();
        self
    }

    pub fn with_default_usage(mut self, usage: impl Into<DefaultValue>) -> Self {
        self.default_usage = usage.into();
        self
    }

    /// Marks the quota as mirrored from an external backend.
    pub fn backend(mut self) -> Self {
        self.is_backend = true;
        self
    }

    pub fn with_creation_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&EntityRef, &dyn EntityGraph) -> bool + Send + Sync + 'static,
    {
        self.creation_condition = Some(Arc::new(condition));
        self
    }

    /// Remaps the child quota read by an aggregator. No effect on other kinds.
    pub fn with_child_quota(mut self, child_quota: impl Into<String>) -> Self {
        if let FieldKind::Aggregator(rule) = &mut self.kind {
            rule.child_quota_name = Some(child_quota.into());
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn is_connected_to_scope(&self, scope: &EntityRef, graph: &dyn EntityGraph) -> bool {
        self.creation_condition
            .as_ref()
            .map_or(true, |condition| condition(scope, graph))
    }

    pub fn initial_values(&self, scope: &EntityRef, graph: &dyn EntityGraph) -> (i64, i64) {
        (
            self.default_limit.resolve(scope, graph),
            self.default_usage.resolve(scope, graph),
        )
    }

    pub fn aggregator(&self) -> Option<&AggregatorRule> {
        match &self.kind {
            FieldKind::Aggregator(rule) => Some(rule),
            _ => None,
        }
    }

    /// Name of the child quota an aggregator sums.
    pub fn child_quota_name(&self) -> Option<&str> {
        self.aggregator()
            .map(|rule| rule.child_quota_name.as_deref().unwrap_or(&self.name))
    }

    /// Target types and path for counter and total fields.
    pub fn target_path(&self) -> Option<(&[String], &RelationPath)> {
        match &self.kind {
            FieldKind::Counter(rule) => Some((&rule.targets, &rule.path)),
            FieldKind::Total(rule) => Some((&rule.targets, &rule.path)),
            _ => None,
        }
    }

    /// Delta contributed by one target instance.
    pub fn weight_of(&self, target: &EntityRef, graph: &dyn EntityGraph) -> i64 {
        match &self.kind {
            FieldKind::Counter(rule) => rule.weight_of(target, graph),
            FieldKind::Total(rule) => graph.attribute(target, &rule.target_field).unwrap_or(0),
            FieldKind::Direct | FieldKind::Aggregator(_) => 0,
        }
    }

    /// Attribute whose changes shift this field's usage.
    pub fn tracked_attribute(&self) -> Option<&str> {
        match &self.kind {
            FieldKind::Total(rule) => Some(&rule.target_field),
            _ => None,
        }
    }

    /// Usage derived from target instances; `None` for direct and aggregator
    /// fields.
    pub fn target_usage(&self, scope: &EntityRef, graph: &dyn EntityGraph) -> Option<i64> {
        match &self.kind {
            FieldKind::Counter(rule) => {
                if let Some(current_usage) = &rule.current_usage {
                    return Some(current_usage(&rule.targets, scope, graph));
                }
                Some(self.sum_over_targets(&rule.targets, &rule.path, scope, graph))
            }
            FieldKind::Total(rule) => {
                Some(self.sum_over_targets(&rule.targets, &rule.path, scope, graph))
            }
            FieldKind::Direct | FieldKind::Aggregator(_) => None,
        }
    }

    fn sum_over_targets(
        &self,
        targets: &[String],
        path: &RelationPath,
        scope: &EntityRef,
        graph: &dyn EntityGraph,
    ) -> i64 {
        targets
            .iter()
            .flat_map(|target_type| graph.referencing(target_type, path, scope))
            .map(|target| self.weight_of(&target, graph))
            .fold(0, i64::saturating_add)
    }
}

impl fmt::Debug for QuotaField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaField")
            .field("name", &self.name)
            .field("default_limit", &self.default_limit)
            .field("default_usage", &self.default_usage)
            .field("is_backend", &self.is_backend)
            .field("has_creation_condition", &self.creation_condition.is_some())
            .field("kind", &self.kind)
            .finish()
    }
}

impl fmt::Display for QuotaField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
