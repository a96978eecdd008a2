//! Narrowing constraints attached to tokens and contexts.
//!
//! Stored as a free-form `key → value` map so configuration and audit can
//! carry arbitrary bounds (e.g. `max_bytes`). A handful of keys are
//! interpreted by the engine itself:
//!
//! - `deny_categories` / `allowed_categories`: lists of category names
//! - `denied_permissions` / `allowed_permissions`: lists of permission names
//! - `resource_patterns`: the resource must match at least one pattern.
//!   Merging two different lists keeps both as groups (`[[..], [..]]`) and
//!   the resource must then match a pattern from every group.
//!
//! A bare string is accepted wherever a list is expected. Every other key is
//! carried for the layer above (the bridge enforces byte limits, not the
//! matcher).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::InvalidPatternError;
use super::pattern::{CapabilityPattern, PatternMatcher};
use super::Category;

pub const DENY_CATEGORIES: &str = "deny_categories";
pub const ALLOWED_CATEGORIES: &str = "allowed_categories";
pub const DENIED_PERMISSIONS: &str = "denied_permissions";
pub const ALLOWED_PERMISSIONS: &str = "allowed_permissions";
pub const RESOURCE_PATTERNS: &str = "resource_patterns";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Restrictions(BTreeMap<String, Value>);

impl Restrictions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes a whole category (e.g. all network access).
    pub fn deny_category(self, category: Category) -> Self {
        self.with(DENY_CATEGORIES, Value::from(vec![category.as_str()]))
    }

    /// Keeps only the listed permissions.
    pub fn allow_permissions(self, permissions: &[&str]) -> Self {
        self.with(ALLOWED_PERMISSIONS, Value::from(permissions.to_vec()))
    }

    /// Confines every resource to at least one of `patterns`.
    pub fn limit_resources(self, patterns: &[&str]) -> Self {
        self.with(RESOURCE_PATTERNS, Value::from(patterns.to_vec()))
    }

    /// Adds `key`, merging with any existing value using the narrowing rules.
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        let merged = match self.0.remove(key) {
            Some(existing) => narrow(key, existing, value),
            None => value,
        };
        self.0.insert(key.to_string(), merged);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Numeric bound under `key`, if present and numeric. When conflicting
    /// values were kept side by side, the smallest number among them.
    pub fn numeric(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_f64)
                .reduce(f64::min),
            value => value.as_f64(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Union of both sets; conflicting keys resolve to the tighter value.
    pub fn merge(&self, other: &Restrictions) -> Restrictions {
        let mut merged = self.clone();
        for (key, value) in &other.0 {
            merged.insert(key, value.clone());
        }
        merged
    }

    /// Rejects restriction sets whose interpreted keys are not strings or
    /// lists of strings, or whose `resource_patterns` do not parse.
    pub fn validate(&self) -> Result<(), InvalidPatternError> {
        for key in [
            DENY_CATEGORIES,
            ALLOWED_CATEGORIES,
            DENIED_PERMISSIONS,
            ALLOWED_PERMISSIONS,
        ] {
            if let Some(value) = self.0.get(key) {
                if !is_string_list(value) {
                    return Err(shape_error(key, value));
                }
            }
        }
        if let Some(value) = self.0.get(RESOURCE_PATTERNS) {
            let groups = pattern_groups(value).ok_or_else(|| shape_error(RESOURCE_PATTERNS, value))?;
            for pattern in groups.iter().flatten() {
                CapabilityPattern::parse(pattern)?;
            }
        }
        Ok(())
    }

    /// Does a grant of `permission` in `category` over `resource` survive
    /// these restrictions?
    pub fn permits(&self, category: Category, permission: &str, resource: &str) -> bool {
        if self.0.is_empty() {
            return true;
        }
        if self.excludes(category, permission) {
            return false;
        }
        match self.0.get(RESOURCE_PATTERNS) {
            None => true,
            // Malformed groups match nothing.
            Some(value) => pattern_groups(value).is_some_and(|groups| {
                groups.iter().all(|group| {
                    group
                        .iter()
                        .any(|p| PatternMatcher::matches_for(p, category, resource))
                })
            }),
        }
    }

    /// True if the category or permission is ruled out regardless of
    /// resource. A malformed allow or deny list rules everything out.
    pub fn excludes(&self, category: Category, permission: &str) -> bool {
        let denied = |key: &str, name: &str| {
            self.list(key)
                .is_some_and(|list| list.map_or(true, |items| items.contains(&name)))
        };
        let not_allowed = |key: &str, name: &str| {
            self.list(key)
                .is_some_and(|list| list.map_or(true, |items| !items.contains(&name)))
        };

        denied(DENY_CATEGORIES, category.as_str())
            || not_allowed(ALLOWED_CATEGORIES, category.as_str())
            || denied(DENIED_PERMISSIONS, permission)
            || not_allowed(ALLOWED_PERMISSIONS, permission)
    }

    /// `None` if the key is absent, `Some(None)` if it is not a string or a
    /// list of strings.
    fn list(&self, key: &str) -> Option<Option<Vec<&str>>> {
        self.0.get(key).map(string_list)
    }
}

fn string_list(value: &Value) -> Option<Vec<&str>> {
    match value {
        Value::String(s) => Some(vec![s.as_str()]),
        Value::Array(items) => items.iter().map(Value::as_str).collect(),
        _ => None,
    }
}

fn is_string_list(value: &Value) -> bool {
    string_list(value).is_some()
}

/// `resource_patterns` as groups of alternatives: a string or flat list is a
/// single group, a list of lists is several.
fn pattern_groups(value: &Value) -> Option<Vec<Vec<&str>>> {
    match value {
        Value::Array(items) if items.iter().any(Value::is_array) => {
            items.iter().map(string_list).collect()
        }
        value => string_list(value).map(|group| vec![group]),
    }
}

fn shape_error(key: &str, value: &Value) -> InvalidPatternError {
    InvalidPatternError::new(
        &value.to_string(),
        format!("'{key}' must be a string or a list of strings"),
    )
}

impl FromIterator<(String, Value)> for Restrictions {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut restrictions = Restrictions::new();
        for (key, value) in iter {
            restrictions.insert(&key, value);
        }
        restrictions
    }
}

/// Combines two values for the same key so the result is never looser than
/// either input.
fn narrow(key: &str, existing: Value, incoming: Value) -> Value {
    if existing == incoming {
        return existing;
    }
    if key == RESOURCE_PATTERNS {
        return conjoin_groups(existing, incoming);
    }

    let is_deny_list = key.starts_with("deny_") || key.starts_with("denied_");
    let is_allow_list = key.starts_with("allowed_");

    match (existing, incoming) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) if y < x => Value::Number(b),
            _ => Value::Number(a),
        },
        (Value::Bool(a), Value::Bool(b)) => Value::Bool(a && b),
        (a, b) if is_deny_list => {
            let mut union = into_items(a);
            for item in into_items(b) {
                if !union.contains(&item) {
                    union.push(item);
                }
            }
            Value::Array(union)
        }
        (a, b) if is_allow_list => {
            let b = into_items(b);
            Value::Array(into_items(a).into_iter().filter(|item| b.contains(item)).collect())
        }
        // Unknown shapes are kept side by side for the layer that
        // interprets them.
        (a, b) => Value::Array(vec![a, b]),
    }
}

/// A string becomes a one-element list; anything else that is not a list
/// is kept as a single (invalid) item so `validate` still sees it.
fn into_items(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        other => vec![other],
    }
}

fn into_groups(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) if items.iter().any(Value::is_array) => items
            .into_iter()
            .map(|group| Value::Array(into_items(group)))
            .collect(),
        other => vec![Value::Array(into_items(other))],
    }
}

/// Both inputs must hold, so their groups are concatenated. A group that is
/// a superset of another adds nothing and is dropped.
fn conjoin_groups(existing: Value, incoming: Value) -> Value {
    let mut groups: Vec<Value> = Vec::new();
    for group in into_groups(existing).into_iter().chain(into_groups(incoming)) {
        if !groups.contains(&group) {
            groups.push(group);
        }
    }

    let subset = |a: &Value, b: &Value| match (a, b) {
        (Value::Array(a), Value::Array(b)) => a.iter().all(|item| b.contains(item)),
        _ => false,
    };
    // Keep the first of groups that are equal as sets.
    let redundant = |i: usize| {
        groups.iter().enumerate().any(|(j, other)| {
            j != i && subset(other, &groups[i]) && (j < i || !subset(&groups[i], other))
        })
    };
    let kept: Vec<Value> = (0..groups.len())
        .filter(|i| !redundant(*i))
        .map(|i| groups[i].clone())
        .collect();

    match <[Value; 1]>::try_from(kept) {
        Ok([single]) => single,
        Err(kept) => Value::Array(kept),
    }
}
