// SPDX-License-Identifier: MIT

//! Runtime state storage for workflow execution

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::schema::{ReducerType, StateSchema, FATAL_ERRORS};
use crate::stepwise::workflow::error::StateError;

/// Runtime workflow state. Plain data: the schema that governs merges
/// lives in the graph and is passed to `apply`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowState {
    fields: BTreeMap<String, Value>,
}

/// A change to one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "lowercase")]
pub enum FieldUpdate {
    /// Merge a value in using the field's reducer
    Set(Value),
    /// Remove the field
    Clear,
}

/// Partial state returned by a node. Keys that are absent are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    changes: BTreeMap<String, FieldUpdate>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.changes
            .insert(key.into(), FieldUpdate::Set(value.into()));
        self
    }

    pub fn clear(mut self, key: impl Into<String>) -> Self {
        self.changes.insert(key.into(), FieldUpdate::Clear);
        self
    }

    /// Record a fatal error; the `fatalErrors` reducer appends it
    pub fn fatal(self, message: impl Into<String>) -> Self {
        let message: String = message.into();
        self.set(FATAL_ERRORS, Value::Array(vec![Value::String(message)]))
    }

    /// Build an update that sets every key of a JSON object
    pub fn from_object(value: Value) -> Result<Self, StateError> {
        match value {
            Value::Object(map) => Ok(map
                .into_iter()
                .fold(Self::new(), |update, (k, v)| update.set(k, v))),
            other => Err(StateError::NotAnObject(format!("state update, got {}", other))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&FieldUpdate> {
        self.changes.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldUpdate)> {
        self.changes.iter()
    }
}

impl WorkflowState {
    /// Create a new WorkflowState from schema defaults
    pub fn new(schema: &StateSchema) -> Self {
        let fields = schema
            .fields
            .iter()
            .filter_map(|(name, def)| def.default.clone().map(|d| (name.clone(), d)))
            .collect();
        Self { fields }
    }

    /// Create an empty WorkflowState
    pub fn empty() -> Self {
        Self::default()
    }

    /// Apply a partial update. The whole update is type-checked first, so a
    /// rejected update leaves the state untouched.
    pub fn apply(&mut self, update: &StateUpdate, schema: &StateSchema) -> Result<(), StateError> {
        for (key, change) in update.iter() {
            if let (FieldUpdate::Set(value), Some(def)) = (change, schema.get(key)) {
                let ok = match def.reducer {
                    // Append takes single items as well as arrays
                    ReducerType::Append => true,
                    _ => def.field_type.accepts(value),
                };
                if !ok {
                    return Err(StateError::TypeMismatch {
                        field: key.clone(),
                        expected: def.field_type,
                        found: type_name(value).to_string(),
                    });
                }
            }
        }

        for (key, change) in update.iter() {
            match change {
                FieldUpdate::Set(value) => self.reduce(key, value.clone(), schema.reducer(key)),
                FieldUpdate::Clear => {
                    self.fields.remove(key);
                }
            }
        }
        Ok(())
    }

    fn reduce(&mut self, key: &str, value: Value, reducer: ReducerType) {
        match reducer {
            ReducerType::Overwrite => {
                self.fields.insert(key.to_string(), value);
            }
            ReducerType::Append => {
                let arr = self
                    .fields
                    .entry(key.to_string())
                    .or_insert(Value::Array(vec![]));
                if !arr.is_array() {
                    *arr = Value::Array(vec![arr.take()]);
                }
                if let Value::Array(a) = arr {
                    match value {
                        Value::Array(new_items) => a.extend(new_items),
                        other => a.push(other),
                    }
                }
            }
            ReducerType::Max | ReducerType::Min => {
                let current = self.fields.get(key).and_then(Value::as_f64);
                if let Some(new) = value.as_f64() {
                    let replace = match current {
                        None => true,
                        Some(cur) if reducer == ReducerType::Max => new > cur,
                        Some(cur) => new < cur,
                    };
                    if replace {
                        self.fields.insert(key.to_string(), value);
                    }
                }
            }
            ReducerType::Merge => {
                let current = self
                    .fields
                    .entry(key.to_string())
                    .or_insert(Value::Object(Map::new()));
                match (current, value) {
                    (Value::Object(current_obj), Value::Object(new_obj)) => {
                        current_obj.extend(new_obj);
                    }
                    (current, value) => *current = value,
                }
            }
        }
    }

    /// Overwrite a single field, bypassing reducers
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    /// Get a field value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Get a nested field value using dot notation (e.g., "build.exitCode")
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.fields.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                other => other.get(part)?,
            };
        }
        Some(current)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.get(key).is_some_and(|v| !v.is_null())
    }

    /// Accumulated fatal errors, in the order they were recorded
    pub fn fatal_errors(&self) -> Vec<String> {
        match self.fields.get(FATAL_ERRORS) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn has_fatal_errors(&self) -> bool {
        matches!(self.fields.get(FATAL_ERRORS), Some(Value::Array(items)) if !items.is_empty())
    }

    /// Convert state to JSON object
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Get all field names
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
