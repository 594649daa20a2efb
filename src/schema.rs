//! Data-shape validation capability used at the registry seams.
//!
//! The runtime never inspects payloads itself: aggregate, command, and
//! event configs each carry a [`Schema`] and the pipeline consults it at
//! the gates described in the dispatch flow. Failures carry a
//! machine-readable explanation that ends up in the error payload.

use serde_json::{Value, json};

/// Validates a JSON value, returning `Ok(())` or an explanation of why the
/// value was rejected.
///
/// Implementations are opaque to the runtime. Closures of the matching
/// shape implement the trait directly, so ad-hoc validators can be
/// registered inline.
pub trait Schema: Send + Sync {
    /// Check `value`, returning an explain payload on failure.
    fn validate(&self, value: &Value) -> std::result::Result<(), Value>;
}

impl<F> Schema for F
where
    F: Fn(&Value) -> std::result::Result<(), Value> + Send + Sync,
{
    fn validate(&self, value: &Value) -> std::result::Result<(), Value> {
        self(value)
    }
}

/// Accepts any value. The default for configs registered without a schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unchecked;

impl Schema for Unchecked {
    fn validate(&self, _value: &Value) -> std::result::Result<(), Value> {
        Ok(())
    }
}

/// JSON type tags used by [`ObjectSchema`] field checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonKind {
    /// A JSON string.
    String,
    /// Any JSON number.
    Number,
    /// A JSON boolean.
    Bool,
    /// A JSON object.
    Object,
    /// A JSON array.
    Array,
    /// Any JSON value, including null.
    Any,
}

impl JsonKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            JsonKind::String => value.is_string(),
            JsonKind::Number => value.is_number(),
            JsonKind::Bool => value.is_boolean(),
            JsonKind::Object => value.is_object(),
            JsonKind::Array => value.is_array(),
            JsonKind::Any => true,
        }
    }

    fn name(self) -> &'static str {
        match self {
            JsonKind::String => "string",
            JsonKind::Number => "number",
            JsonKind::Bool => "boolean",
            JsonKind::Object => "object",
            JsonKind::Array => "array",
            JsonKind::Any => "any",
        }
    }
}

/// A structural object validator: named fields with expected JSON types.
///
/// Rejects non-objects outright; unknown fields pass. The explain payload
/// is an array of `{field, error}` records, one per problem.
#[derive(Debug, Clone, Default)]
pub struct ObjectSchema {
    fields: Vec<Field>,
}

#[derive(Debug, Clone)]
struct Field {
    name: String,
    kind: JsonKind,
    required: bool,
}

impl ObjectSchema {
    /// An object schema with no field constraints yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `name` to be present with the given type.
    pub fn required(mut self, name: impl Into<String>, kind: JsonKind) -> Self {
        self.fields.push(Field {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    /// Allow `name` to be absent, but require the given type when present.
    pub fn optional(mut self, name: impl Into<String>, kind: JsonKind) -> Self {
        self.fields.push(Field {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }
}

impl Schema for ObjectSchema {
    fn validate(&self, value: &Value) -> std::result::Result<(), Value> {
        let Some(object) = value.as_object() else {
            return Err(json!([{"error": "expected an object"}]));
        };

        let mut problems = Vec::new();
        for field in &self.fields {
            match object.get(&field.name) {
                None if field.required => {
                    problems.push(json!({"field": field.name, "error": "missing"}));
                }
                Some(v) if !field.kind.matches(v) => {
                    problems.push(json!({
                        "field": field.name,
                        "error": "wrong type",
                        "expected": field.kind.name(),
                    }));
                }
                _ => {}
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Value::Array(problems))
        }
    }
}
