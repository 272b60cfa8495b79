//! Value model shared by the engine and activities.
//!
//! Runtime values travel as `serde_json::Value`; descriptor metadata declares
//! per-attribute types that inputs and pipeline outputs are coerced to.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

/// A named map of runtime values, the currency of every pipeline bucket.
pub type ValueMap = HashMap<String, Value>;

/// Declared type of a pipeline or activity attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Type {
    String,
    #[serde(alias = "int")]
    Integer,
    #[serde(alias = "float64", alias = "double", alias = "number")]
    Float,
    #[serde(alias = "bool")]
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl Type {
    pub fn as_str(&self) -> &'static str {
        match self {
            Type::String => "string",
            Type::Integer => "integer",
            Type::Float => "float",
            Type::Boolean => "boolean",
            Type::Object => "object",
            Type::Array => "array",
            Type::Any => "any",
        }
    }
}

/// A declared attribute: name, type tag and optional default value.
#[derive(Debug, Clone, Deserialize)]
pub struct Attribute {
    pub name: String,
    #[serde(rename = "type", default)]
    pub value_type: Type,
    #[serde(default)]
    pub value: Option<Value>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value_type: Type) -> Self {
        Self {
            name: name.into(),
            value_type,
            value: None,
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }
}

/// Declared input and output attributes, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct IOMetadata {
    pub input: HashMap<String, Attribute>,
    pub output: HashMap<String, Attribute>,
}

impl IOMetadata {
    pub fn new(input: Vec<Attribute>, output: Vec<Attribute>) -> Self {
        Self {
            input: input.into_iter().map(|a| (a.name.clone(), a)).collect(),
            output: output.into_iter().map(|a| (a.name.clone(), a)).collect(),
        }
    }
}

/// Runtime coercion of `serde_json::Value` to declared attribute types.
pub mod coerce {
    use serde_json::{Number, Value};

    use super::Type;
    use crate::error::{PipelineError, PipelineResult};

    fn error(to: &'static str, value: &Value) -> PipelineError {
        PipelineError::Coercion {
            to,
            value: value.to_string(),
        }
    }

    pub fn to_string(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => other.to_string(),
        }
    }

    pub fn to_i64(value: &Value) -> PipelineResult<i64> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| error("integer", value)),
            Value::String(s) => s
                .parse::<i64>()
                .or_else(|_| s.parse::<f64>().map(|f| f as i64))
                .map_err(|_| error("integer", value)),
            Value::Bool(b) => Ok(*b as i64),
            _ => Err(error("integer", value)),
        }
    }

    pub fn to_f64(value: &Value) -> PipelineResult<f64> {
        match value {
            Value::Number(n) => n.as_f64().ok_or_else(|| error("float", value)),
            Value::String(s) => s.parse::<f64>().map_err(|_| error("float", value)),
            Value::Bool(b) => Ok(*b as i64 as f64),
            _ => Err(error("float", value)),
        }
    }

    pub fn to_bool(value: &Value) -> PipelineResult<bool> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0) != 0.0),
            Value::String(s) => s.parse::<bool>().map_err(|_| error("boolean", value)),
            _ => Err(error("boolean", value)),
        }
    }

    /// Coerces `value` to the declared `value_type`, used on pipeline inputs
    /// and on `pipeline.`-routed stage outputs.
    pub fn to_type(value: Value, value_type: Type) -> PipelineResult<Value> {
        match value_type {
            Type::Any => Ok(value),
            Type::String => Ok(Value::String(to_string(&value))),
            Type::Integer => Ok(Value::Number(Number::from(to_i64(&value)?))),
            Type::Float => {
                let f = to_f64(&value)?;
                Number::from_f64(f)
                    .map(Value::Number)
                    .ok_or_else(|| error("float", &value))
            }
            Type::Boolean => Ok(Value::Bool(to_bool(&value)?)),
            Type::Object => match value {
                Value::Object(_) => Ok(value),
                _ => Err(error("object", &value)),
            },
            Type::Array => match value {
                Value::Array(_) => Ok(value),
                _ => Err(error("array", &value)),
            },
        }
    }
}
