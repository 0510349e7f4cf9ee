//! Condition evaluation against a read-only contact snapshot.
//!
//! Evaluation is pure: the same expression and snapshot always produce the
//! same answer, nothing here reads a clock, and unresolvable attribute paths
//! never error. They evaluate to `false` and are reported back so the caller
//! can log them.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Conjunction or disjunction of conditions and nested groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    #[serde(default = "default_operator")]
    pub operator: LogicalOperator,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub groups: Vec<ConditionGroup>,
}

fn default_operator() -> LogicalOperator {
    LogicalOperator::All
}

impl ConditionGroup {
    pub fn all(conditions: Vec<Condition>) -> Self {
        Self {
            operator: LogicalOperator::All,
            conditions,
            groups: Vec::new(),
        }
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Self {
            operator: LogicalOperator::Any,
            conditions,
            groups: Vec::new(),
        }
    }

    /// Every condition in this group and its nested groups.
    pub fn iter_conditions(&self) -> Box<dyn Iterator<Item = &Condition> + '_> {
        Box::new(
            self.conditions
                .iter()
                .chain(self.groups.iter().flat_map(|g| g.iter_conditions())),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
    All,
    Any,
}

/// One `(path, comparator, value)` triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub path: String,
    pub comparator: Comparator,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl Condition {
    pub fn new(path: impl Into<String>, comparator: Comparator, value: serde_json::Value) -> Self {
        Self {
            path: path.into(),
            comparator,
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    NotContains,
    IsSet,
    IsNotSet,
}

impl Comparator {
    /// Whether the comparator reads `Condition::value`.
    pub fn takes_value(&self) -> bool {
        !matches!(self, Comparator::IsSet | Comparator::IsNotSet)
    }
}

/// Point-in-time view of a contact, supplied by the contact store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactSnapshot {
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub events: Vec<ContactEvent>,
}

impl ContactSnapshot {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactEvent {
    pub name: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
}

/// Result of evaluating a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub result: bool,
    /// Paths that did not resolve against the snapshot.
    pub unresolved_paths: Vec<String>,
}

/// Stateless evaluator for branch conditions.
#[derive(Debug, Clone, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(&self, group: &ConditionGroup, snapshot: &ContactSnapshot) -> Evaluation {
        let mut unresolved = Vec::new();
        let result = self.evaluate_group(group, snapshot, &mut unresolved);
        unresolved.sort();
        unresolved.dedup();
        Evaluation {
            result,
            unresolved_paths: unresolved,
        }
    }

    /// Every condition and nested group is visited (no short-circuit) so the
    /// unresolved path report is complete.
    fn evaluate_group(
        &self,
        group: &ConditionGroup,
        snapshot: &ContactSnapshot,
        unresolved: &mut Vec<String>,
    ) -> bool {
        let mut results = Vec::with_capacity(group.conditions.len() + group.groups.len());
        for condition in &group.conditions {
            results.push(self.evaluate_condition(condition, snapshot, unresolved));
        }
        for nested in &group.groups {
            results.push(self.evaluate_group(nested, snapshot, unresolved));
        }

        match group.operator {
            LogicalOperator::All => results.iter().all(|r| *r),
            LogicalOperator::Any => results.iter().any(|r| *r),
        }
    }

    fn evaluate_condition(
        &self,
        condition: &Condition,
        snapshot: &ContactSnapshot,
        unresolved: &mut Vec<String>,
    ) -> bool {
        match resolve_path(&condition.path, snapshot) {
            Some(actual) => compare_values(&actual, condition.comparator, &condition.value),
            None => {
                unresolved.push(condition.path.clone());
                condition.comparator == Comparator::IsNotSet
            }
        }
    }
}

/// Resolves a condition path against the snapshot.
///
/// - `tags` is the tag list
/// - `events.<name>.count` counts events with that name
/// - `events.<name>` resolves only if at least one such event exists
/// - `attributes.<key>[.<nested>]` or a bare `<key>[.<nested>]` reads attributes
pub fn resolve_path(path: &str, snapshot: &ContactSnapshot) -> Option<serde_json::Value> {
    let mut segments = path.split('.');
    let root = segments.next().filter(|s| !s.is_empty())?;

    match root {
        "tags" => {
            if segments.next().is_some() {
                return None;
            }
            Some(serde_json::Value::from(snapshot.tags.clone()))
        }
        "events" => {
            let name = segments.next()?;
            let matching: Vec<&ContactEvent> =
                snapshot.events.iter().filter(|e| e.name == name).collect();
            match segments.next() {
                None if matching.is_empty() => None,
                None => Some(serde_json::Value::from(matching.len() as u64)),
                Some("count") if segments.next().is_none() => {
                    Some(serde_json::Value::from(matching.len() as u64))
                }
                Some(_) => None,
            }
        }
        "attributes" => {
            let key = segments.next()?;
            lookup_attribute(snapshot, key, segments)
        }
        key => lookup_attribute(snapshot, key, segments),
    }
}

fn lookup_attribute<'a>(
    snapshot: &ContactSnapshot,
    key: &str,
    rest: impl Iterator<Item = &'a str>,
) -> Option<serde_json::Value> {
    let mut current = snapshot.attributes.get(key)?;
    for segment in rest {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    if current.is_null() {
        None
    } else {
        Some(current.clone())
    }
}

pub fn compare_values(
    actual: &serde_json::Value,
    comparator: Comparator,
    expected: &serde_json::Value,
) -> bool {
    match comparator {
        Comparator::Equals => loosely_equal(actual, expected),
        Comparator::NotEquals => !loosely_equal(actual, expected),
        Comparator::GreaterThan => numeric_cmp(actual, expected) == Some(Ordering::Greater),
        Comparator::GreaterThanOrEqual => matches!(
            numeric_cmp(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Comparator::LessThan => numeric_cmp(actual, expected) == Some(Ordering::Less),
        Comparator::LessThanOrEqual => matches!(
            numeric_cmp(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Comparator::Contains => contains(actual, expected),
        Comparator::NotContains => !contains(actual, expected),
        Comparator::IsSet => !actual.is_null(),
        Comparator::IsNotSet => actual.is_null(),
    }
}

/// Numbers compare by value so `3` equals `3.0`. When one side is a number,
/// a numeric string on the other side is read the same way ordering reads it.
fn loosely_equal(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    if a.is_number() || b.is_number() {
        if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
            return x == y;
        }
    }
    a == b
}

fn contains(actual: &serde_json::Value, expected: &serde_json::Value) -> bool {
    match actual {
        serde_json::Value::Array(items) => items.iter().any(|i| loosely_equal(i, expected)),
        serde_json::Value::String(s) => expected.as_str().is_some_and(|e| s.contains(e)),
        _ => false,
    }
}

fn numeric_cmp(a: &serde_json::Value, b: &serde_json::Value) -> Option<Ordering> {
    let a_num = as_number(a)?;
    let b_num = as_number(b)?;
    a_num.partial_cmp(&b_num)
}

/// Numeric strings ("42") are accepted since imported contact fields are
/// frequently stringly typed.
fn as_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
