//! Schema definition and validation.
//!
//! Schemas define the structure of collections and enable validation of
//! documents before they are applied. Validation never short-circuits: every
//! field is checked and all failures are reported together.

use crate::document::is_reserved;
use crate::regex_safety;
use crate::value::Value;
use crate::CollectionName;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Field types recognized by the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Array,
    Object,
    Date,
    Null,
    Any,
    /// Passes if any branch passes.
    Union(Vec<FieldType>),
}

impl FieldType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => matches!(value, Value::String(_)),
            FieldType::Number => matches!(value, Value::Number(_)),
            FieldType::Boolean => matches!(value, Value::Bool(_)),
            FieldType::Array => matches!(value, Value::Array(_)),
            FieldType::Object => matches!(value, Value::Object(_)),
            FieldType::Date => matches!(value, Value::Timestamp(_) | Value::Number(_) | Value::String(_)),
            FieldType::Null => matches!(value, Value::Null),
            FieldType::Any => true,
            FieldType::Union(branches) => branches.iter().any(|b| b.matches(value)),
        }
    }

    fn name(&self) -> String {
        match self {
            FieldType::String => "string".into(),
            FieldType::Number => "number".into(),
            FieldType::Boolean => "boolean".into(),
            FieldType::Array => "array".into(),
            FieldType::Object => "object".into(),
            FieldType::Date => "date".into(),
            FieldType::Null => "null".into(),
            FieldType::Any => "any".into(),
            FieldType::Union(branches) => {
                branches.iter().map(FieldType::name).collect::<Vec<_>>().join("|")
            }
        }
    }
}

/// A default value: either a literal or a named thunk evaluated at
/// `apply_defaults` time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DefaultValue {
    Literal(Value),
    /// Current wall-clock milliseconds, supplied by the caller of
    /// `apply_defaults` (the engine core has no clock of its own).
    Now,
}

/// A single field-path error produced by validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

/// The accumulated result of validating a document; never short-circuits.
pub type ValidationResult = Vec<ValidationError>;

/// Definition of a field in a collection schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<FieldDef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Vec<FieldDef>>,
}

impl FieldDef {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            default: None,
            min: None,
            max: None,
            pattern: None,
            enum_values: None,
            items: None,
            properties: None,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            required: false,
            ..Self::required(name, field_type)
        }
    }

    pub fn with_default(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    pub fn with_items(mut self, item: FieldDef) -> Self {
        self.items = Some(Box::new(item));
        self
    }

    pub fn with_properties(mut self, props: Vec<FieldDef>) -> Self {
        self.properties = Some(props);
        self
    }

    /// Validates one value at `path`, appending errors into `out`. Does not
    /// stop at the first failure.
    fn validate(&self, path: &str, value: Option<&Value>, out: &mut ValidationResult) {
        let value = match value {
            None | Some(Value::Null) => {
                if self.required {
                    out.push(ValidationError {
                        path: path.to_string(),
                        message: "missing required field".to_string(),
                    });
                }
                return;
            }
            Some(v) => v,
        };

        if !self.field_type.matches(value) {
            out.push(ValidationError {
                path: path.to_string(),
                message: format!(
                    "expected type {}, got {}",
                    self.field_type.name(),
                    value.kind()
                ),
            });
            return;
        }

        self.validate_range(path, value, out);
        self.validate_pattern(path, value, out);
        self.validate_enum(path, value, out);
        self.validate_nested(path, value, out);
    }

    fn validate_range(&self, path: &str, value: &Value, out: &mut ValidationResult) {
        let length_or_number = match value {
            Value::Number(n) => Some(*n),
            Value::String(s) => Some(s.chars().count() as f64),
            Value::Array(a) => Some(a.len() as f64),
            _ => None,
        };
        if let Some(n) = length_or_number {
            if let Some(min) = self.min {
                if n < min {
                    out.push(ValidationError {
                        path: path.to_string(),
                        message: format!("value {n} is below minimum {min}"),
                    });
                }
            }
            if let Some(max) = self.max {
                if n > max {
                    out.push(ValidationError {
                        path: path.to_string(),
                        message: format!("value {n} exceeds maximum {max}"),
                    });
                }
            }
        }
    }

    fn validate_pattern(&self, path: &str, value: &Value, out: &mut ValidationResult) {
        let Some(pattern) = &self.pattern else { return };
        let Some(s) = value.as_str() else { return };
        match regex_safety::compile_safe(pattern) {
            Some(re) if re.is_match(s) => {}
            _ => out.push(ValidationError {
                path: path.to_string(),
                message: format!("value does not match pattern '{pattern}'"),
            }),
        }
    }

    fn validate_enum(&self, path: &str, value: &Value, out: &mut ValidationResult) {
        let Some(allowed) = &self.enum_values else { return };
        if !allowed.iter().any(|a| a.deep_eq(value)) {
            out.push(ValidationError {
                path: path.to_string(),
                message: "value is not one of the allowed enum values".to_string(),
            });
        }
    }

    fn validate_nested(&self, path: &str, value: &Value, out: &mut ValidationResult) {
        if let (Some(item_def), Value::Array(items)) = (&self.items, value) {
            for (i, item) in items.iter().enumerate() {
                item_def.validate(&format!("{path}.{i}"), Some(item), out);
            }
        }
        if let (Some(props), Value::Object(obj)) = (&self.properties, value) {
            for prop in props {
                prop.validate(&format!("{path}.{}", prop.name), obj.get(&prop.name), out);
            }
        }
    }

    fn apply_defaults(&self, value: Option<Value>, now_millis: i64) -> Value {
        match value {
            Some(Value::Null) | None => match &self.default {
                Some(DefaultValue::Literal(v)) => v.clone(),
                Some(DefaultValue::Now) => Value::Timestamp(now_millis),
                None => value.unwrap_or(Value::Null),
            },
            Some(Value::Object(mut obj)) => {
                if let Some(props) = &self.properties {
                    for prop in props {
                        let existing = obj.remove(&prop.name);
                        obj.insert(prop.name.clone(), prop.apply_defaults(existing, now_millis));
                    }
                }
                Value::Object(obj)
            }
            Some(Value::Array(items)) => {
                if let Some(item_def) = &self.items {
                    Value::Array(
                        items
                            .into_iter()
                            .map(|item| item_def.apply_defaults(Some(item), now_millis))
                            .collect(),
                    )
                } else {
                    Value::Array(items)
                }
            }
            Some(other) => other,
        }
    }
}

/// Schema for a single collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    pub name: CollectionName,
    pub fields: Vec<FieldDef>,
    /// Extra field names required beyond those individually marked required.
    #[serde(default)]
    pub required: Vec<String>,
    /// When false, reject unknown keys other than engine-reserved ones.
    #[serde(default = "default_true")]
    pub additional_properties: bool,
}

fn default_true() -> bool {
    true
}

impl CollectionSchema {
    pub fn new(name: impl Into<CollectionName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
            required: Vec::new(),
            additional_properties: true,
        }
    }

    pub fn with_additional_properties(mut self, allowed: bool) -> Self {
        self.additional_properties = allowed;
        self
    }

    /// Validates `fields` against this schema, returning every error found.
    pub fn validate(&self, fields: &BTreeMap<String, Value>) -> ValidationResult {
        let mut errors = Vec::new();

        for field in &self.fields {
            field.validate(&field.name, fields.get(&field.name), &mut errors);
        }

        for name in &self.required {
            if !self.fields.iter().any(|f| &f.name == name) && !fields.contains_key(name) {
                errors.push(ValidationError {
                    path: name.clone(),
                    message: "missing required field".to_string(),
                });
            }
        }

        if !self.additional_properties {
            let known: std::collections::HashSet<&str> =
                self.fields.iter().map(|f| f.name.as_str()).collect();
            for key in fields.keys() {
                if is_reserved(key) {
                    continue;
                }
                if !known.contains(key.as_str()) {
                    errors.push(ValidationError {
                        path: key.clone(),
                        message: "additional property not allowed".to_string(),
                    });
                }
            }
        }

        errors
    }

    /// Populates absent fields with defaults; thunks receive `now_millis`
    /// from the caller. Nested default objects are produced fresh per call,
    /// so repeated invocations never alias.
    pub fn apply_defaults(
        &self,
        mut fields: BTreeMap<String, Value>,
        now_millis: i64,
    ) -> BTreeMap<String, Value> {
        for field in &self.fields {
            let existing = fields.remove(&field.name);
            if existing.is_none() && field.default.is_none() && !field.required {
                continue;
            }
            fields.insert(field.name.clone(), field.apply_defaults(existing, now_millis));
        }
        fields
    }
}

/// Schema for the entire database: a version plus collection schemas by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub version: u32,
    pub collections: HashMap<CollectionName, CollectionSchema>,
}

impl Schema {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            collections: HashMap::new(),
        }
    }

    pub fn add_collection(&mut self, collection: CollectionSchema) -> &mut Self {
        self.collections.insert(collection.name.clone(), collection);
        self
    }

    pub fn with_collection(mut self, collection: CollectionSchema) -> Self {
        self.add_collection(collection);
        self
    }

    pub fn get_collection(&self, name: &str) -> Option<&CollectionSchema> {
        self.collections.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_schema() -> CollectionSchema {
        CollectionSchema::new(
            "users",
            vec![
                FieldDef::required("name", FieldType::String).with_range(Some(1.0), None),
                FieldDef::required("age", FieldType::Number),
                FieldDef::optional("email", FieldType::String),
            ],
        )
    }

    fn fields(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn validate_valid_payload() {
        let schema = test_schema();
        let doc = fields(&[("name", "Alice".into()), ("age", 30.0.into())]);
        assert!(schema.validate(&doc).is_empty());
    }

    #[test]
    fn validate_accumulates_all_errors() {
        let schema = test_schema();
        let doc = fields(&[("name", "".into())]); // empty name fails min, age missing
        let errors = schema.validate(&doc);
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.path == "name"));
        assert!(errors.iter().any(|e| e.path == "age"));
    }

    #[test]
    fn validate_wrong_type() {
        let schema = test_schema();
        let doc = fields(&[("name", "Alice".into()), ("age", "thirty".into())]);
        let errors = schema.validate(&doc);
        assert!(errors.iter().any(|e| e.path == "age"));
    }

    #[test]
    fn additional_properties_false_rejects_unknown_keys() {
        let schema = test_schema().with_additional_properties(false);
        let doc = fields(&[
            ("name", "Alice".into()),
            ("age", 30.0.into()),
            ("extra", "nope".into()),
        ]);
        let errors = schema.validate(&doc);
        assert!(errors.iter().any(|e| e.path == "extra"));
    }

    #[test]
    fn underscored_keys_always_allowed() {
        let schema = test_schema().with_additional_properties(false);
        let doc = fields(&[
            ("name", "Alice".into()),
            ("age", 30.0.into()),
            ("_internal", "ok".into()),
        ]);
        assert!(schema.validate(&doc).is_empty());
    }

    #[test]
    fn apply_defaults_fills_missing_without_aliasing() {
        let schema = CollectionSchema::new(
            "posts",
            vec![FieldDef::optional("tags", FieldType::Array)
                .with_default(DefaultValue::Literal(Value::Array(vec![])))],
        );
        let a = schema.apply_defaults(BTreeMap::new(), 0);
        let mut b = schema.apply_defaults(BTreeMap::new(), 0);
        if let Some(Value::Array(arr)) = b.get_mut("tags") {
            arr.push(Value::String("x".into()));
        }
        assert_eq!(a.get("tags"), Some(&Value::Array(vec![])));
    }

    #[test]
    fn union_type_passes_if_any_branch_passes() {
        let field = FieldDef::required(
            "id",
            FieldType::Union(vec![FieldType::String, FieldType::Number]),
        );
        let mut errors = Vec::new();
        field.validate("id", Some(&Value::Number(5.0)), &mut errors);
        assert!(errors.is_empty());
    }

    #[test]
    fn enum_constraint() {
        let field = FieldDef::required("status", FieldType::String)
            .with_enum(vec!["active".into(), "inactive".into()]);
        let mut errors = Vec::new();
        field.validate("status", Some(&Value::String("bogus".into())), &mut errors);
        assert_eq!(errors.len(), 1);
    }
}
