//! JSON-Schema-like configuration schema declared by a plugin manifest.
//!
//! Only the subset the runtime enforces is modelled: property types,
//! `required`, `default`, `enum`, `minimum`/`maximum` and
//! `minLength`/`maxLength`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{PluginError, PluginResult};

/// Declared type of a configuration property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl SchemaType {
    /// Check whether a JSON value has this type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }

    /// Convert a raw string (from the environment) into a value of this type.
    pub fn coerce(&self, raw: &str) -> Result<Value, String> {
        let trimmed = raw.trim();
        match self {
            Self::String => Ok(Value::String(raw.to_string())),
            Self::Integer => trimmed
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("'{raw}' is not an integer")),
            Self::Number => trimmed
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("'{raw}' is not a number")),
            Self::Boolean => match trimmed.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
                "false" | "0" | "no" | "off" => Ok(Value::Bool(false)),
                _ => Err(format!("'{raw}' is not a boolean")),
            },
            Self::Object | Self::Array => {
                let value: Value = serde_json::from_str(trimmed)
                    .map_err(|e| format!("'{raw}' is not valid JSON: {e}"))?;
                if self.matches(&value) {
                    Ok(value)
                } else {
                    Err(format!("'{raw}' is not a JSON {self}"))
                }
            }
        }
    }
}

impl std::fmt::Display for SchemaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        };
        f.write_str(name)
    }
}

/// Schema of a single configuration property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub kind: SchemaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, rename = "minLength", skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, rename = "maxLength", skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
}

impl PropertySchema {
    /// Create a property of the given type with no constraints.
    pub fn new(kind: SchemaType) -> Self {
        Self {
            kind,
            description: None,
            default: None,
            allowed: None,
            minimum: None,
            maximum: None,
            min_length: None,
            max_length: None,
        }
    }

    /// Set the default value.
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Set the numeric range.
    pub fn with_range(mut self, minimum: Option<f64>, maximum: Option<f64>) -> Self {
        self.minimum = minimum;
        self.maximum = maximum;
        self
    }

    /// Restrict values to an enumeration.
    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.allowed = Some(values);
        self
    }

    /// Validate a value against this property.
    fn check(&self, field: &str, value: &Value) -> PluginResult<()> {
        if !self.kind.matches(value) {
            return Err(PluginError::validation(field, format!("expected {}", self.kind)));
        }

        if let Some(allowed) = &self.allowed {
            if !allowed.contains(value) {
                return Err(PluginError::validation(field, "value is not one of the allowed values"));
            }
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = self.minimum {
                if n < min {
                    return Err(PluginError::validation(field, format!("must be >= {min}")));
                }
            }
            if let Some(max) = self.maximum {
                if n > max {
                    return Err(PluginError::validation(field, format!("must be <= {max}")));
                }
            }
        }

        if let Some(s) = value.as_str() {
            let len = s.chars().count();
            if let Some(min) = self.min_length {
                if len < min {
                    return Err(PluginError::validation(
                        field,
                        format!("must be at least {min} characters"),
                    ));
                }
            }
            if let Some(max) = self.max_length {
                if len > max {
                    return Err(PluginError::validation(
                        field,
                        format!("must be at most {max} characters"),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Configuration schema of a plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSchema {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
    #[serde(default)]
    pub required: Vec<String>,
}

impl ConfigSchema {
    /// Check if the schema declares nothing.
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty() && self.required.is_empty()
    }

    /// Add a property.
    pub fn property(mut self, name: impl Into<String>, schema: PropertySchema) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    /// Mark a property as required.
    pub fn require(mut self, name: impl Into<String>) -> Self {
        self.required.push(name.into());
        self
    }

    /// Find a property name case-insensitively.
    pub fn property_name(&self, key: &str) -> Option<&str> {
        self.properties.keys().find(|name| name.eq_ignore_ascii_case(key)).map(String::as_str)
    }

    /// Check the schema is internally consistent.
    pub fn check_consistency(&self) -> PluginResult<()> {
        if let Some(t) = &self.schema_type {
            if t != "object" {
                return Err(PluginError::InvalidManifest(format!(
                    "config_schema type must be 'object', got '{t}'"
                )));
            }
        }

        for name in &self.required {
            if !self.properties.contains_key(name) {
                return Err(PluginError::InvalidManifest(format!(
                    "config_schema requires undeclared property '{name}'"
                )));
            }
        }

        for (name, prop) in &self.properties {
            if let Some(default) = &prop.default {
                if !prop.kind.matches(default) {
                    return Err(PluginError::InvalidManifest(format!(
                        "default of '{name}' is not a {}",
                        prop.kind
                    )));
                }
            }
            if let Some(allowed) = &prop.allowed {
                if allowed.is_empty() {
                    return Err(PluginError::InvalidManifest(format!("enum of '{name}' is empty")));
                }
                if let Some(bad) = allowed.iter().find(|v| !prop.kind.matches(v)) {
                    return Err(PluginError::InvalidManifest(format!(
                        "enum value {bad} of '{name}' is not a {}",
                        prop.kind
                    )));
                }
            }
            if let (Some(min), Some(max)) = (prop.minimum, prop.maximum) {
                if min > max {
                    return Err(PluginError::InvalidManifest(format!(
                        "'{name}' has minimum {min} greater than maximum {max}"
                    )));
                }
            }
            if let (Some(min), Some(max)) = (prop.min_length, prop.max_length) {
                if min > max {
                    return Err(PluginError::InvalidManifest(format!(
                        "'{name}' has minLength {min} greater than maxLength {max}"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Defaults declared by the schema.
    pub fn defaults(&self) -> Map<String, Value> {
        self.properties
            .iter()
            .filter_map(|(name, prop)| prop.default.clone().map(|v| (name.clone(), v)))
            .collect()
    }

    /// Coerce an environment string for `key` to its declared type.
    ///
    /// Undeclared keys stay strings.
    pub fn coerce(&self, key: &str, raw: &str) -> PluginResult<Value> {
        match self.properties.get(key) {
            Some(prop) => prop.kind.coerce(raw).map_err(|e| PluginError::validation(key, e)),
            None => Ok(Value::String(raw.to_string())),
        }
    }

    /// Validate merged settings: required keys, types and constraints.
    pub fn validate(&self, settings: &Map<String, Value>) -> PluginResult<()> {
        for name in &self.required {
            match settings.get(name) {
                None | Some(Value::Null) => {
                    return Err(PluginError::validation(name, "required field is missing"));
                }
                Some(_) => {}
            }
        }

        for (name, prop) in &self.properties {
            if let Some(value) = settings.get(name) {
                if value.is_null() && !self.required.contains(name) {
                    continue;
                }
                prop.check(name, value)?;
            }
        }

        Ok(())
    }
}
