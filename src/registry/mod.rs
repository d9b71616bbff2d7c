//! The property registry declares which custom version properties may be
//! supplied, their types and whether they are required. It lives in the store
//! root at `extensions/property-registry/config.json`.
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::metadata::{CustomProperties, PropertyValue};

pub mod packaging;

pub const REGISTRY_PATH: &str = "extensions/property-registry/config.json";
const EXTENSION_NAME: &str = "property-registry";

/// Raised per ingest when supplied properties do not satisfy the registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct PropertyError(String);

impl PropertyError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Raised once, at load time, when the registry itself is malformed.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is not valid JSON: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Invalid(String),
}

fn config_err(msg: impl Into<String>) -> RegistryError {
    RegistryError::Invalid(msg.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    String,
    Number,
    Boolean,
    Object,
}

impl PropertyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::String => "string",
            PropertyType::Number => "number",
            PropertyType::Boolean => "boolean",
            PropertyType::Object => "object",
        }
    }

    fn parse_type(s: &str) -> Option<Self> {
        match s {
            "string" => Some(PropertyType::String),
            "number" => Some(PropertyType::Number),
            "boolean" => Some(PropertyType::Boolean),
            "object" => Some(PropertyType::Object),
            _ => None,
        }
    }

    fn accepts(&self, value: &PropertyValue) -> bool {
        matches!(
            (self, value),
            (PropertyType::String, PropertyValue::String(_))
                | (PropertyType::Number, PropertyValue::Number(_))
                | (PropertyType::Boolean, PropertyValue::Bool(_))
                | (PropertyType::Object, PropertyValue::Object(_))
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDescriptor {
    pub description: String,
    pub kind: PropertyType,
    pub required: bool,
    pub default: Option<Value>,
    /// Only populated for `object` descriptors.
    pub properties: BTreeMap<String, PropertyDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyRegistry {
    properties: BTreeMap<String, PropertyDescriptor>,
}

impl PropertyRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Loads `<store_root>/extensions/property-registry/config.json`. A
    /// missing file yields an empty registry.
    pub async fn load(store_root: &Path) -> Result<Self, RegistryError> {
        let path = store_root.join(REGISTRY_PATH);
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|source| RegistryError::Io {
                path: path.clone(),
                source,
            })?;
        if !exists {
            info!(path = %path.display(), "no property registry found; custom properties will be rejected");
            return Ok(Self::empty());
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| RegistryError::Io {
                path: path.clone(),
                source,
            })?;
        let root: Value = serde_json::from_str(&content).map_err(|source| RegistryError::Parse {
            path: path.clone(),
            source,
        })?;
        let registry = Self::from_json(&root)?;
        info!(properties = registry.len(), "property registry loaded");
        Ok(registry)
    }

    /// Builds a registry from the extension's `config.json` document.
    pub fn from_json(root: &Value) -> Result<Self, RegistryError> {
        let Value::Object(root) = root else {
            return Err(config_err(
                "property-registry/config.json must be a JSON object at root",
            ));
        };
        match root.get("extensionName") {
            Some(Value::String(name)) if name == EXTENSION_NAME => {}
            _ => {
                return Err(config_err(
                    "property-registry/config.json: extensionName must be 'property-registry'",
                ))
            }
        }
        let Some(Value::Object(entries)) = root.get("propertyRegistry") else {
            return Err(config_err(
                "property-registry/config.json must contain an object 'propertyRegistry'",
            ));
        };
        Ok(Self {
            properties: parse_descriptors("", entries)?,
        })
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.get(name)
    }

    /// Checks a version's custom properties. Stops at the first problem.
    pub fn validate(&self, custom: &CustomProperties) -> Result<(), PropertyError> {
        for (key, value) in custom {
            let Some(desc) = self.properties.get(key) else {
                return Err(PropertyError::new(format!(
                    "Unknown property per property-registry: {key}"
                )));
            };
            validate_value(key, value, desc)?;
        }
        for (key, desc) in &self.properties {
            if desc.required && !custom.contains_key(key) {
                return Err(PropertyError::new(format!(
                    "Missing required property per property-registry: {key}"
                )));
            }
        }
        Ok(())
    }
}

fn validate_value(
    path: &str,
    value: &PropertyValue,
    desc: &PropertyDescriptor,
) -> Result<(), PropertyError> {
    if !desc.kind.accepts(value) {
        return Err(PropertyError::new(format!(
            "Property '{path}' must be of type {}",
            desc.kind.as_str()
        )));
    }
    let PropertyValue::Object(fields) = value else {
        return Ok(());
    };
    if let Some(unknown) = fields.keys().find(|k| !desc.properties.contains_key(*k)) {
        return Err(PropertyError::new(format!(
            "Unknown sub-property for '{path}': {unknown}"
        )));
    }
    for (sub_key, sub_desc) in &desc.properties {
        match fields.get(sub_key) {
            Some(sub_value) => validate_value(&format!("{path}.{sub_key}"), sub_value, sub_desc)?,
            None if sub_desc.required => {
                return Err(PropertyError::new(format!(
                    "Missing required sub-property for '{path}': {sub_key}"
                )))
            }
            None => {}
        }
    }
    Ok(())
}

fn parse_descriptors(
    prefix: &str,
    entries: &Map<String, Value>,
) -> Result<BTreeMap<String, PropertyDescriptor>, RegistryError> {
    let mut out = BTreeMap::new();
    for (key, desc) in entries {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        out.insert(key.clone(), parse_descriptor(&name, desc)?);
    }
    Ok(out)
}

fn parse_descriptor(name: &str, desc: &Value) -> Result<PropertyDescriptor, RegistryError> {
    let Value::Object(desc) = desc else {
        return Err(config_err(format!(
            "Descriptor for property '{name}' must be an object"
        )));
    };
    let Some(Value::String(description)) = desc.get("description") else {
        return Err(config_err(format!(
            "Property '{name}' must have textual 'description'"
        )));
    };
    let kind = match desc.get("type") {
        None => PropertyType::String,
        Some(Value::String(t)) => PropertyType::parse_type(t).ok_or_else(|| {
            config_err(format!("Property '{name}' has unsupported type: {t}"))
        })?,
        Some(other) => {
            return Err(config_err(format!(
                "Property '{name}' has unsupported type: {other}"
            )))
        }
    };
    let properties = if kind == PropertyType::Object {
        match desc.get("properties") {
            Some(Value::Object(sub)) if !sub.is_empty() => parse_descriptors(name, sub)?,
            _ => {
                return Err(config_err(format!(
                    "Object-typed property '{name}' must declare a non-empty object 'properties'"
                )))
            }
        }
    } else {
        BTreeMap::new()
    };
    let required = matches!(desc.get("required"), Some(Value::Bool(true)));
    let default = desc.get("default").cloned();
    if required && default.is_some() {
        return Err(config_err(format!(
            "Property '{name}' cannot declare a default when required=true"
        )));
    }
    Ok(PropertyDescriptor {
        description: description.clone(),
        kind,
        required,
        default,
        properties,
    })
}
