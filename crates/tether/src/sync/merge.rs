//! Reconciliation of divergent local and remote copies

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field name reported when two non-object values conflict
const ROOT_FIELD: &str = "$";

/// How a resource type is reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Counters take the max, arrays the union, additive fields the sum;
    /// nested objects merge recursively
    Progress,
    /// Remote values win on collision; local-only keys are kept
    RemoteWins,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub merged: Value,
    /// Top-level fields present on both sides with different values
    pub conflicting_fields: Vec<String>,
}

impl MergeOutcome {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicting_fields.is_empty()
    }
}

/// Merge two copies of a resource under `policy`
pub fn merge(policy: MergePolicy, local: &Value, remote: &Value, additive_fields: &[String]) -> MergeOutcome {
    let merged = match policy {
        MergePolicy::Progress => merge_progress(None, local, remote, additive_fields),
        MergePolicy::RemoteWins => merge_remote_wins(local, remote),
    };

    MergeOutcome {
        merged,
        conflicting_fields: conflicting_fields(local, remote),
    }
}

fn conflicting_fields(local: &Value, remote: &Value) -> Vec<String> {
    match (local, remote) {
        (Value::Object(l), Value::Object(r)) => {
            let mut fields: Vec<String> = l
                .iter()
                .filter(|(key, value)| r.get(*key).is_some_and(|other| other != *value))
                .map(|(key, _)| key.clone())
                .collect();
            fields.sort();
            fields
        }
        _ if local != remote => vec![ROOT_FIELD.to_string()],
        _ => Vec::new(),
    }
}

fn merge_remote_wins(local: &Value, remote: &Value) -> Value {
    match (local, remote) {
        (Value::Object(l), Value::Object(r)) => {
            let mut merged = l.clone();
            merged.extend(r.iter().map(|(k, v)| (k.clone(), v.clone())));
            Value::Object(merged)
        }
        _ => remote.clone(),
    }
}

fn merge_progress(field: Option<&str>, local: &Value, remote: &Value, additive_fields: &[String]) -> Value {
    match (local, remote) {
        (Value::Object(l), Value::Object(r)) => {
            let mut merged = Map::new();
            for (key, value) in l {
                let value = match r.get(key) {
                    Some(other) => merge_progress(Some(key), value, other, additive_fields),
                    None => value.clone(),
                };
                merged.insert(key.clone(), value);
            }
            for (key, value) in r {
                if !l.contains_key(key) {
                    merged.insert(key.clone(), value.clone());
                }
            }
            Value::Object(merged)
        }
        (Value::Number(_), Value::Number(_)) => {
            let additive = field.is_some_and(|f| additive_fields.iter().any(|a| a == f));
            merge_numbers(local, remote, additive)
        }
        (Value::Array(l), Value::Array(r)) => {
            let mut union = l.clone();
            for item in r {
                if !union.contains(item) {
                    union.push(item.clone());
                }
            }
            Value::Array(union)
        }
        (_, Value::Null) => local.clone(),
        _ => remote.clone(),
    }
}

fn merge_numbers(local: &Value, remote: &Value, additive: bool) -> Value {
    if let (Some(l), Some(r)) = (local.as_i64(), remote.as_i64()) {
        return if additive {
            l.checked_add(r).map(Value::from).unwrap_or_else(|| Value::from(l as f64 + r as f64))
        } else {
            Value::from(l.max(r))
        };
    }

    let (l, r) = (
        local.as_f64().unwrap_or_default(),
        remote.as_f64().unwrap_or_default(),
    );
    let result = if additive { l + r } else { l.max(r) };
    serde_json::Number::from_f64(result)
        .map(Value::Number)
        .unwrap_or_else(|| remote.clone())
}
