// SPDX-License-Identifier: MIT

//! State schema definitions

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Reserved field: accumulated fatal error messages
pub const FATAL_ERRORS: &str = "fatalErrors";
/// Reserved field: the owning session id
pub const SESSION_ID: &str = "sessionId";

/// Schema defining the workflow state structure
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct StateSchema {
    /// Field definitions
    #[serde(flatten)]
    pub fields: BTreeMap<String, StateFieldDef>,
}

/// Definition of a single state field
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StateFieldDef {
    /// Type of the field
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Reducer for merging values
    #[serde(default)]
    pub reducer: ReducerType,
    /// Default value
    pub default: Option<Value>,
}

/// Supported field types
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    /// Whether `value` may be stored in a field of this type. `null` is
    /// accepted everywhere as an explicit "no value".
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (FieldType::String, Value::String(_))
                | (FieldType::Number, Value::Number(_))
                | (FieldType::Boolean, Value::Bool(_))
                | (FieldType::Array, Value::Array(_))
                | (FieldType::Object, Value::Object(_))
        )
    }
}

/// Reducer types for merging values into state
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReducerType {
    /// Replace the value (default)
    #[default]
    Overwrite,
    /// Append to array
    Append,
    /// Keep maximum value
    Max,
    /// Keep minimum value
    Min,
    /// Shallow merge objects
    Merge,
}

impl StateSchema {
    /// Schema containing only the reserved fields
    pub fn new() -> Self {
        Self::default()
            .field(SESSION_ID, FieldType::String)
            .field_with(FATAL_ERRORS, FieldType::Array, ReducerType::Append, None)
    }

    /// Declare an overwrite field without a default
    pub fn field(self, name: &str, field_type: FieldType) -> Self {
        self.field_with(name, field_type, ReducerType::Overwrite, None)
    }

    pub fn field_with(
        mut self,
        name: &str,
        field_type: FieldType,
        reducer: ReducerType,
        default: Option<Value>,
    ) -> Self {
        self.fields.insert(
            name.to_string(),
            StateFieldDef {
                field_type,
                reducer,
                default,
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&StateFieldDef> {
        self.fields.get(name)
    }

    pub fn reducer(&self, name: &str) -> ReducerType {
        self.fields
            .get(name)
            .map(|def| def.reducer)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_schema_deserialize() {
        let yaml = r#"
            platform:
              type: string
            buildAttemptCount:
              type: number
              default: 0
            fixesAttempted:
              type: array
              reducer: append
        "#;
        let schema: StateSchema = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(schema.fields.len(), 3);
        assert_eq!(schema.fields["platform"].field_type, FieldType::String);
        assert_eq!(
            schema.fields["buildAttemptCount"].field_type,
            FieldType::Number
        );
        assert_eq!(schema.fields["buildAttemptCount"].default, Some(json!(0)));
        assert_eq!(schema.fields["fixesAttempted"].reducer, ReducerType::Append);
    }

    #[test]
    fn test_reserved_fields() {
        let schema = StateSchema::new();
        assert_eq!(schema.reducer(FATAL_ERRORS), ReducerType::Append);
        assert_eq!(schema.get(SESSION_ID).unwrap().field_type, FieldType::String);
        assert_eq!(schema.reducer("undeclared"), ReducerType::Overwrite);
    }

    #[test]
    fn test_all_reducers() {
        let yaml = r#"
            f1: { type: string, reducer: overwrite }
            f2: { type: array, reducer: append }
            f3: { type: number, reducer: max }
            f4: { type: number, reducer: min }
            f5: { type: object, reducer: merge }
        "#;
        let schema: StateSchema = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(schema.reducer("f1"), ReducerType::Overwrite);
        assert_eq!(schema.reducer("f2"), ReducerType::Append);
        assert_eq!(schema.reducer("f3"), ReducerType::Max);
        assert_eq!(schema.reducer("f4"), ReducerType::Min);
        assert_eq!(schema.reducer("f5"), ReducerType::Merge);
    }

    #[test]
    fn test_field_type_accepts() {
        assert!(FieldType::String.accepts(&json!("iOS")));
        assert!(!FieldType::String.accepts(&json!(1)));
        assert!(FieldType::Number.accepts(&json!(2.5)));
        assert!(FieldType::Boolean.accepts(&json!(false)));
        assert!(FieldType::Array.accepts(&json!([1, "a"])));
        assert!(FieldType::Object.accepts(&json!({"a": 1})));
        assert!(!FieldType::Object.accepts(&json!([])));
        assert!(FieldType::Number.accepts(&Value::Null));
    }
}
