//! Per-version metadata: provenance (`version-info`) and free-form custom
//! properties (`object-version-properties`), read from the `<version>.json`
//! sidecar that sits next to a version directory.
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::model::{User, VersionInfo};

const MAILTO_PREFIX: &str = "mailto:";
const VERSION_INFO_KEY: &str = "version-info";
const CUSTOM_PROPERTIES_KEY: &str = "object-version-properties";

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[A-Za-z0-9!#$%&'*+/=?^_`{|}~-]+(?:\.[A-Za-z0-9!#$%&'*+/=?^_`{|}~-]+)*@(?:[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z]{2,}$",
    )
    .expect("valid email regex")
});

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("failed to read version info file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("version info file {} is not valid JSON: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Invalid(String),
    #[error(
        "No version info file {} provided and no default configuration available",
        path.display()
    )]
    NoProvenance { path: PathBuf },
}

fn invalid(msg: impl Into<String>) -> MetadataError {
    MetadataError::Invalid(msg.into())
}

/// A custom property value: string, number, boolean, or a nested object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Object(BTreeMap<String, PropertyValue>),
}

impl PropertyValue {
    /// Converts without coercion. `path` names the value in error messages.
    pub fn from_json(path: &str, value: &Value) -> Result<Self, MetadataError> {
        match value {
            Value::Bool(b) => Ok(PropertyValue::Bool(*b)),
            Value::Number(n) => Ok(PropertyValue::Number(n.clone())),
            Value::String(s) => Ok(PropertyValue::String(s.clone())),
            Value::Object(map) => {
                let mut out = BTreeMap::new();
                for (k, v) in map {
                    out.insert(k.clone(), PropertyValue::from_json(&format!("{path}.{k}"), v)?);
                }
                Ok(PropertyValue::Object(out))
            }
            Value::Null | Value::Array(_) => Err(invalid(format!(
                "Property '{path}' must be a string, number, boolean or object"
            ))),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Bool(_) => "boolean",
            PropertyValue::Number(_) => "number",
            PropertyValue::String(_) => "string",
            PropertyValue::Object(_) => "object",
        }
    }
}

pub type CustomProperties = BTreeMap<String, PropertyValue>;

/// Everything the store needs to know about one version besides its content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionProperties {
    pub info: VersionInfo,
    pub custom: CustomProperties,
}

/// Provenance used for versions that come without a sidecar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DefaultVersionInfo {
    pub username: String,
    pub email: String,
    pub message: String,
}

/// `<parent>/v3` -> `<parent>/v3.json`
pub fn sidecar_path(version_dir: &Path) -> PathBuf {
    let mut name = version_dir
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".json");
    version_dir.with_file_name(name)
}

/// Adds the `mailto:` prefix when missing and checks what follows it.
pub fn normalize_email(email: &str) -> Result<String, MetadataError> {
    let address = if email.starts_with(MAILTO_PREFIX) {
        email.to_string()
    } else {
        format!("{MAILTO_PREFIX}{email}")
    };
    let bare = &address[MAILTO_PREFIX.len()..];
    if !EMAIL_RE.is_match(bare) {
        return Err(invalid(format!("Invalid email address: {address}")));
    }
    Ok(address)
}

#[derive(Debug, Clone, Default)]
pub struct VersionPropertiesReader {
    default: Option<DefaultVersionInfo>,
}

impl VersionPropertiesReader {
    pub fn new(default: Option<DefaultVersionInfo>) -> Self {
        Self { default }
    }

    /// Reads the sidecar belonging to `version_dir`, falling back to the
    /// default provenance when there is none.
    pub async fn read_for_version_dir(
        &self,
        version_dir: &Path,
    ) -> Result<VersionProperties, MetadataError> {
        self.read(&sidecar_path(version_dir)).await
    }

    pub async fn read(&self, file: &Path) -> Result<VersionProperties, MetadataError> {
        let exists = tokio::fs::try_exists(file)
            .await
            .map_err(|source| MetadataError::Io {
                path: file.to_path_buf(),
                source,
            })?;
        if !exists {
            return match &self.default {
                Some(default) => {
                    debug!(file = %file.display(), "no version info file; using default provenance");
                    default_properties(default)
                }
                None => Err(MetadataError::NoProvenance {
                    path: file.to_path_buf(),
                }),
            };
        }

        let content = tokio::fs::read_to_string(file)
            .await
            .map_err(|source| MetadataError::Io {
                path: file.to_path_buf(),
                source,
            })?;
        let root: Value = serde_json::from_str(&content).map_err(|source| MetadataError::Parse {
            path: file.to_path_buf(),
            source,
        })?;
        parse_document(&root)
    }
}

fn default_properties(default: &DefaultVersionInfo) -> Result<VersionProperties, MetadataError> {
    Ok(VersionProperties {
        info: VersionInfo {
            user: User {
                name: default.username.clone(),
                address: normalize_email(&default.email)?,
            },
            message: default.message.clone(),
        },
        custom: CustomProperties::new(),
    })
}

/// Interprets an already parsed sidecar document.
pub fn parse_document(root: &Value) -> Result<VersionProperties, MetadataError> {
    let Value::Object(root) = root else {
        return Err(invalid("Version info JSON must be an object at root"));
    };
    for key in root.keys() {
        if key != VERSION_INFO_KEY && key != CUSTOM_PROPERTIES_KEY {
            return Err(invalid(format!("Unknown property in version info file: {key}")));
        }
    }
    Ok(VersionProperties {
        info: version_info(root)?,
        custom: custom_properties(root)?,
    })
}

fn version_info(root: &Map<String, Value>) -> Result<VersionInfo, MetadataError> {
    let info = require_object(root, VERSION_INFO_KEY, VERSION_INFO_KEY)?;
    let user = require_object(info, "user", "version-info.user")?;
    let name = require_text(user.get("name"), "version-info.user.name")?;
    let email = require_text(user.get("email"), "version-info.user.email")?;
    let message = require_text(info.get("message"), "version-info.message")?;
    Ok(VersionInfo {
        user: User {
            name,
            address: normalize_email(&email)?,
        },
        message,
    })
}

fn custom_properties(root: &Map<String, Value>) -> Result<CustomProperties, MetadataError> {
    match root.get(CUSTOM_PROPERTIES_KEY) {
        None => Ok(CustomProperties::new()),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| -> Result<_, MetadataError> {
                Ok((k.clone(), PropertyValue::from_json(k, v)?))
            })
            .collect(),
        Some(_) => Err(invalid("object-version-properties must be a JSON object")),
    }
}

fn require_object<'a>(
    parent: &'a Map<String, Value>,
    key: &str,
    path: &str,
) -> Result<&'a Map<String, Value>, MetadataError> {
    match parent.get(key) {
        None | Some(Value::Null) => Err(invalid(format!("Missing required property: {path}"))),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(invalid(format!("{path} must be a JSON object"))),
    }
}

fn require_text(node: Option<&Value>, path: &str) -> Result<String, MetadataError> {
    let text = match node {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(_) => {
            return Err(invalid(format!("Property must be a primitive value: {path}")));
        }
    };
    match text {
        Some(t) if !t.trim().is_empty() => Ok(t),
        _ => Err(invalid(format!("Missing required property: {path}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn valid_doc() -> Value {
        json!({
            "version-info": {
                "user": { "name": "Test User", "email": "test.user@mail.com" },
                "message": "Initial version"
            }
        })
    }

    fn message_of(err: MetadataError) -> String {
        err.to_string()
    }

    #[test]
    fn reads_provenance_and_adds_mailto() {
        let props = parse_document(&valid_doc()).unwrap();
        assert_eq!(props.info.user.name, "Test User");
        assert_eq!(props.info.user.address, "mailto:test.user@mail.com");
        assert_eq!(props.info.message, "Initial version");
        assert!(props.custom.is_empty());
    }

    #[test]
    fn keeps_existing_mailto_prefix() {
        assert_eq!(
            normalize_email("mailto:a.b@example.org").unwrap(),
            "mailto:a.b@example.org"
        );
    }

    #[test]
    fn invalid_email_reports_prefixed_address() {
        let mut doc = valid_doc();
        doc["version-info"]["user"]["email"] = json!("invalid-email");
        let err = parse_document(&doc).unwrap_err();
        assert_eq!(message_of(err), "Invalid email address: mailto:invalid-email");
    }

    #[test]
    fn unknown_top_level_key_is_named() {
        let mut doc = valid_doc();
        doc["extra"] = json!(1);
        let err = parse_document(&doc).unwrap_err();
        assert_eq!(message_of(err), "Unknown property in version info file: extra");
    }

    #[test]
    fn missing_or_blank_fields_name_the_dotted_path() {
        let mut doc = valid_doc();
        doc["version-info"]["user"]
            .as_object_mut()
            .unwrap()
            .remove("name");
        assert_eq!(
            message_of(parse_document(&doc).unwrap_err()),
            "Missing required property: version-info.user.name"
        );

        let mut doc = valid_doc();
        doc["version-info"]["message"] = json!("   ");
        assert_eq!(
            message_of(parse_document(&doc).unwrap_err()),
            "Missing required property: version-info.message"
        );

        let doc = json!({ "object-version-properties": {} });
        assert_eq!(
            message_of(parse_document(&doc).unwrap_err()),
            "Missing required property: version-info"
        );
    }

    #[test]
    fn custom_properties_are_returned_verbatim() {
        let mut doc = valid_doc();
        doc["object-version-properties"] = json!({
            "property1": "Value 1",
            "count": 3,
            "nested": { "flag": true }
        });
        let props = parse_document(&doc).unwrap();
        assert_eq!(props.custom.len(), 3);
        assert_eq!(
            props.custom["property1"],
            PropertyValue::String("Value 1".into())
        );
        assert_eq!(props.custom["count"].type_name(), "number");
        let PropertyValue::Object(nested) = &props.custom["nested"] else {
            panic!("expected object");
        };
        assert_eq!(nested["flag"], PropertyValue::Bool(true));
    }

    #[test]
    fn custom_properties_must_be_an_object() {
        let mut doc = valid_doc();
        doc["object-version-properties"] = json!(["a"]);
        assert_eq!(
            message_of(parse_document(&doc).unwrap_err()),
            "object-version-properties must be a JSON object"
        );
    }

    #[test]
    fn null_property_values_are_rejected_with_path() {
        let mut doc = valid_doc();
        doc["object-version-properties"] = json!({ "meta": { "pages": null } });
        assert_eq!(
            message_of(parse_document(&doc).unwrap_err()),
            "Property 'meta.pages' must be a string, number, boolean or object"
        );
    }

    #[test]
    fn sidecar_sits_next_to_version_dir() {
        assert_eq!(
            sidecar_path(Path::new("/batch/obj/v2")),
            PathBuf::from("/batch/obj/v2.json")
        );
    }

    #[tokio::test]
    async fn missing_file_without_default_fails() {
        let td = tempdir().unwrap();
        let reader = VersionPropertiesReader::new(None);
        let err = reader
            .read_for_version_dir(&td.path().join("v1"))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::NoProvenance { .. }));
    }

    #[tokio::test]
    async fn missing_file_uses_default_provenance() {
        let td = tempdir().unwrap();
        let reader = VersionPropertiesReader::new(Some(DefaultVersionInfo {
            username: "ingest".into(),
            email: "ingest@example.org".into(),
            message: "bulk import".into(),
        }));
        let props = reader
            .read_for_version_dir(&td.path().join("v1"))
            .await
            .unwrap();
        assert_eq!(props.info.user.address, "mailto:ingest@example.org");
        assert_eq!(props.info.message, "bulk import");
    }

    #[tokio::test]
    async fn reads_sidecar_from_disk() {
        let td = tempdir().unwrap();
        let file = td.path().join("v1.json");
        std::fs::write(&file, valid_doc().to_string()).unwrap();
        let props = VersionPropertiesReader::default()
            .read_for_version_dir(&td.path().join("v1"))
            .await
            .unwrap();
        assert_eq!(props.info.user.name, "Test User");
    }

    #[tokio::test]
    async fn malformed_json_names_the_file() {
        let td = tempdir().unwrap();
        let file = td.path().join("v1.json");
        std::fs::write(&file, "{ not json").unwrap();
        let err = VersionPropertiesReader::default().read(&file).await.unwrap_err();
        assert!(matches!(err, MetadataError::Parse { .. }));
        assert!(err.to_string().contains("v1.json"));
    }
}
