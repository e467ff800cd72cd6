//! Declared value types and named structured-output shapes.
//!
//! Structured step outputs arrive as `(shape name, JSON value)` pairs. A shape
//! is only trusted after it has been checked against the schema registered
//! under that name.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Logical type of a state field or shape member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueType {
    Any,
    Bool,
    Number,
    Integer,
    String,
    Array { items: Box<ValueType> },
    /// Free-form object.
    Object,
    /// Object validated against a registered [`ShapeSchema`].
    Shape { name: String },
    /// Nullable wrapper.
    Optional { inner: Box<ValueType> },
}

impl ValueType {
    pub fn array(items: ValueType) -> Self {
        Self::Array {
            items: Box::new(items),
        }
    }

    pub fn shape(name: impl Into<String>) -> Self {
        Self::Shape { name: name.into() }
    }

    pub fn optional(inner: ValueType) -> Self {
        Self::Optional {
            inner: Box::new(inner),
        }
    }

    /// Infer the logical type of a concrete value. `null` carries no type.
    pub fn infer(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(Self::Bool),
            Value::Number(_) => Some(Self::Number),
            Value::String(_) => Some(Self::String),
            Value::Array(_) => Some(Self::array(Self::Any)),
            Value::Object(_) => Some(Self::Object),
        }
    }

    /// Short name used in validation messages.
    pub fn name(&self) -> String {
        match self {
            Self::Any => "any".into(),
            Self::Bool => "bool".into(),
            Self::Number => "number".into(),
            Self::Integer => "integer".into(),
            Self::String => "string".into(),
            Self::Array { items } => format!("array<{}>", items.name()),
            Self::Object => "object".into(),
            Self::Shape { name } => name.clone(),
            Self::Optional { inner } => format!("{}?", inner.name()),
        }
    }

    pub fn is_nullable(&self) -> bool {
        matches!(self, Self::Any | Self::Optional { .. })
    }

    /// Check `value` against this type, resolving shape references through `shapes`.
    pub fn check(&self, value: &Value, shapes: &ShapeRegistry) -> Result<(), String> {
        match (self, value) {
            (Self::Any, _) => Ok(()),
            (Self::Optional { .. }, Value::Null) => Ok(()),
            (Self::Optional { inner }, v) => inner.check(v, shapes),
            (Self::Bool, Value::Bool(_)) => Ok(()),
            (Self::Number, Value::Number(_)) => Ok(()),
            (Self::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(()),
            (Self::String, Value::String(_)) => Ok(()),
            (Self::Array { items }, Value::Array(values)) => {
                for (i, v) in values.iter().enumerate() {
                    items.check(v, shapes).map_err(|e| format!("[{i}]: {e}"))?;
                }
                Ok(())
            }
            (Self::Object, Value::Object(_)) => Ok(()),
            (Self::Shape { name }, v) => shapes.check(name, v),
            (expected, got) => Err(format!(
                "expected {}, got {}",
                expected.name(),
                json_kind(got)
            )),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One member of a shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeField {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ValueType,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

/// Schema of a named structured output, e.g. `WeatherResponse`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeSchema {
    pub name: String,
    pub fields: Vec<ShapeField>,
    /// Accept keys not listed in `fields`.
    #[serde(default)]
    pub allow_extra: bool,
}

impl ShapeSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            allow_extra: false,
        }
    }

    pub fn field(mut self, name: impl Into<String>, ty: ValueType) -> Self {
        self.fields.push(ShapeField {
            name: name.into(),
            ty,
            required: true,
        });
        self
    }

    pub fn optional_field(mut self, name: impl Into<String>, ty: ValueType) -> Self {
        self.fields.push(ShapeField {
            name: name.into(),
            ty,
            required: false,
        });
        self
    }
}

/// Registry of shapes, keyed by shape name.
#[derive(Debug, Clone, Default)]
pub struct ShapeRegistry {
    shapes: HashMap<String, ShapeSchema>,
}

impl ShapeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: ShapeSchema) {
        self.shapes.insert(schema.name.clone(), schema);
    }

    pub fn with(mut self, schema: ShapeSchema) -> Self {
        self.register(schema);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ShapeSchema> {
        self.shapes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.shapes.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.shapes.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Validate `value` against the shape registered as `name`.
    pub fn check(&self, name: &str, value: &Value) -> Result<(), String> {
        let schema = self
            .shapes
            .get(name)
            .ok_or_else(|| format!("shape '{name}' is not registered"))?;

        let obj = value
            .as_object()
            .ok_or_else(|| format!("expected {name} object, got {}", json_kind(value)))?;

        for field in &schema.fields {
            match obj.get(&field.name) {
                Some(v) => field
                    .ty
                    .check(v, self)
                    .map_err(|e| format!("{name}.{}: {e}", field.name))?,
                None if field.required => {
                    return Err(format!("{name}.{} is required", field.name));
                }
                None => {}
            }
        }

        if !schema.allow_extra {
            if let Some(extra) = obj
                .keys()
                .find(|k| !schema.fields.iter().any(|f| &f.name == *k))
            {
                return Err(format!("{name} has unexpected key '{extra}'"));
            }
        }

        Ok(())
    }
}
