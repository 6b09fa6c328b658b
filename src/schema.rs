use serde_json::{json, Map, Value};
use std::fmt::{Display, Formatter};

/// A single constraint violated by a payload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Violation {
    /// Dotted path of the offending value, empty for the root.
    pub path: String,
    /// What is wrong with the value.
    pub message: String,
}

impl Violation {
    /// Creates a new violation.
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl Display for Violation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Error returned when data does not match a schema. Lists every violated constraint.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[error("Validation of {object_name} failed: {}", list_violations(.violations))]
pub struct ValidationError {
    /// The name of the validated object, usually a message name.
    pub object_name: String,
    /// The violated constraints.
    pub violations: Vec<Violation>,
}

impl ValidationError {
    /// Creates a new validation error.
    pub fn new(object_name: impl Into<String>, violations: Vec<Violation>) -> Self {
        Self {
            object_name: object_name.into(),
            violations,
        }
    }
}

fn list_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Validates data against a JSON schema.
///
/// The validation algorithm is provided by the application. [BasicSchemaAssertion] covers the
/// keywords used by [JsonSchema].
pub trait SchemaAssertion: Send + Sync {
    /// Fails with a [ValidationError] listing every violated constraint.
    fn assert(&self, object_name: &str, data: &Value, schema: &Value)
        -> Result<(), ValidationError>;
}

/// A [SchemaAssertion] supporting a practical subset of JSON schema.
///
/// Supported keywords: `type` (single or list), `required`, `properties`,
/// `additionalProperties: false`, `items`, `enum`, `minLength`, `maxLength`, `minimum` and
/// `maximum`. Unknown keywords are ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicSchemaAssertion;

impl SchemaAssertion for BasicSchemaAssertion {
    fn assert(
        &self,
        object_name: &str,
        data: &Value,
        schema: &Value,
    ) -> Result<(), ValidationError> {
        let mut violations = Vec::new();
        check(data, schema, "", &mut violations);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::new(object_name, violations))
        }
    }
}

fn check(data: &Value, schema: &Value, path: &str, violations: &mut Vec<Violation>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema.get("type") {
        let matches = match expected {
            Value::String(name) => has_type(data, name),
            Value::Array(names) => names
                .iter()
                .filter_map(Value::as_str)
                .any(|name| has_type(data, name)),
            _ => true,
        };
        if !matches {
            violations.push(Violation::new(
                path,
                format!("must be of type {expected}, got {}", type_of(data)),
            ));
            return;
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(data) {
            violations.push(Violation::new(path, format!("must be one of {}", json!(allowed))));
        }
    }

    match data {
        Value::String(value) => {
            let length = value.chars().count() as u64;
            if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
                if length < min {
                    violations.push(Violation::new(
                        path,
                        format!("must be at least {min} characters long"),
                    ));
                }
            }
            if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
                if length > max {
                    violations.push(Violation::new(
                        path,
                        format!("must be at most {max} characters long"),
                    ));
                }
            }
        }
        Value::Number(value) => {
            let value = value.as_f64().unwrap_or_default();
            if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
                if value < min {
                    violations.push(Violation::new(path, format!("must be >= {min}")));
                }
            }
            if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
                if value > max {
                    violations.push(Violation::new(path, format!("must be <= {max}")));
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (index, item) in items.iter().enumerate() {
                    check(item, item_schema, &join(path, &index.to_string()), violations);
                }
            }
        }
        Value::Object(object) => check_object(object, schema, path, violations),
        _ => (),
    }
}

fn check_object(
    object: &Map<String, Value>,
    schema: &Map<String, Value>,
    path: &str,
    violations: &mut Vec<Violation>,
) {
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(key) {
                violations.push(Violation::new(join(path, key), "is required"));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    if let Some(properties) = properties {
        for (key, property_schema) in properties {
            if let Some(value) = object.get(key) {
                check(value, property_schema, &join(path, key), violations);
            }
        }
    }

    if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
        for key in object.keys() {
            if !properties.is_some_and(|properties| properties.contains_key(key)) {
                violations.push(Violation::new(join(path, key), "is not allowed"));
            }
        }
    }
}

fn has_type(data: &Value, name: &str) -> bool {
    match name {
        "null" => data.is_null(),
        "boolean" => data.is_boolean(),
        "string" => data.is_string(),
        "number" => data.is_number(),
        "integer" => data.is_i64() || data.is_u64(),
        "array" => data.is_array(),
        "object" => data.is_object(),
        _ => true,
    }
}

fn type_of(data: &Value) -> &'static str {
    match data {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

/// Helpers to write JSON schemas for message payloads.
///
/// # Example
/// ```
/// use augure::JsonSchema;
///
/// let schema = JsonSchema::object(
///     [
///         ("userId", JsonSchema::string()),
///         ("username", JsonSchema::min_length(JsonSchema::string(), 1)),
///         ("age", JsonSchema::nullable(JsonSchema::integer())),
///     ],
///     ["userId", "username"],
/// );
/// assert_eq!(schema["required"][0], "userId");
/// ```
pub struct JsonSchema;

impl JsonSchema {
    /// An object with the given properties, of which `required` are mandatory. Additional
    /// properties are rejected.
    pub fn object<'a>(
        properties: impl IntoIterator<Item = (&'a str, Value)>,
        required: impl IntoIterator<Item = &'a str>,
    ) -> Value {
        let properties: Map<String, Value> = properties
            .into_iter()
            .map(|(key, schema)| (key.to_string(), schema))
            .collect();
        let required: Vec<&str> = required.into_iter().collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }

    /// A string.
    pub fn string() -> Value {
        json!({ "type": "string" })
    }

    /// An integer.
    pub fn integer() -> Value {
        json!({ "type": "integer" })
    }

    /// Any number.
    pub fn number() -> Value {
        json!({ "type": "number" })
    }

    /// A boolean.
    pub fn boolean() -> Value {
        json!({ "type": "boolean" })
    }

    /// An array whose items match `items`.
    pub fn array(items: Value) -> Value {
        json!({ "type": "array", "items": items })
    }

    /// One of the given string values.
    pub fn enum_of<'a>(values: impl IntoIterator<Item = &'a str>) -> Value {
        let values: Vec<&str> = values.into_iter().collect();
        json!({ "type": "string", "enum": values })
    }

    /// Makes a schema accept `null`.
    pub fn nullable(mut schema: Value) -> Value {
        if let Some(Value::String(name)) = schema.get("type").cloned() {
            schema["type"] = json!([name, "null"]);
        }
        schema
    }

    /// Adds a minimum length to a string schema.
    pub fn min_length(mut schema: Value, length: u64) -> Value {
        schema["minLength"] = json!(length);
        schema
    }

    /// An object accepting any payload, for messages without a payload contract.
    pub fn any_object() -> Value {
        json!({ "type": "object" })
    }
}
