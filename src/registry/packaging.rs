//! Start-up check of the packaging-format-registry extension.
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use tracing::info;

use super::RegistryError;

const EXTENSION_DIR: &str = "extensions/packaging-format-registry";
const EXTENSION_NAME: &str = "packaging-format-registry";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Some(DigestAlgorithm::Sha256),
            "sha512" => Some(DigestAlgorithm::Sha512),
            _ => None,
        }
    }

    pub fn hex_digest(&self, input: &str) -> String {
        match self {
            DigestAlgorithm::Sha256 => format!("{:x}", Sha256::digest(input.as_bytes())),
            DigestAlgorithm::Sha512 => format!("{:x}", Sha512::digest(input.as_bytes())),
        }
    }
}

struct ManifestEntry {
    name: String,
    version: String,
}

fn invalid(msg: impl Into<String>) -> RegistryError {
    RegistryError::Invalid(msg.into())
}

/// Validates the extension under `<store_root>/extensions/packaging-format-registry`.
/// Stores without the extension pass.
pub async fn validate(store_root: &Path) -> Result<(), RegistryError> {
    let dir = store_root.join(EXTENSION_DIR);
    if !tokio::fs::try_exists(&dir).await.map_err(|source| RegistryError::Io {
        path: dir.clone(),
        source,
    })? {
        return Ok(());
    }

    let config = read_json(&dir.join("config.json")).await?;
    let algorithm = validate_config(&config)?;
    let inventory = read_json(&dir.join("packaging_format_inventory.json")).await?;
    let manifest = read_manifest(&inventory)?;
    let format_dirs = list_dirs(&dir.join("packaging_formats")).await?;
    validate_manifest(algorithm, &manifest, &format_dirs)?;
    info!(formats = manifest.len(), "packaging format registry validated");
    Ok(())
}

async fn read_json(path: &Path) -> Result<Value, RegistryError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_str(&content).map_err(|source| RegistryError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

async fn list_dirs(path: &Path) -> Result<BTreeSet<String>, RegistryError> {
    let io_err = |source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut out = BTreeSet::new();
    if !tokio::fs::try_exists(path).await.map_err(io_err)? {
        return Ok(out);
    }
    let mut rd = tokio::fs::read_dir(path).await.map_err(io_err)?;
    while let Some(entry) = rd.next_entry().await.map_err(io_err)? {
        if entry.file_type().await.map_err(io_err)?.is_dir() {
            out.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(out)
}

fn text<'a>(node: &'a Value, field: &str) -> Option<&'a str> {
    node.get(field).and_then(Value::as_str)
}

fn validate_config(config: &Value) -> Result<DigestAlgorithm, RegistryError> {
    if !config.is_object() {
        return Err(invalid(
            "packaging-format-registry/config.json must be a JSON object",
        ));
    }
    if text(config, "extensionName") != Some(EXTENSION_NAME) {
        return Err(invalid(
            "config.json: extensionName must be 'packaging-format-registry'",
        ));
    }
    let mut algorithm = None;
    for field in ["packagingFormatDigestAlgorithm", "digestAlgorithm"] {
        let value = match text(config, field) {
            Some(v) if !v.trim().is_empty() => v,
            _ => return Err(invalid(format!("config.json: {field} must be set"))),
        };
        let parsed = DigestAlgorithm::parse_name(value).ok_or_else(|| {
            invalid(format!(
                "config.json: {field} must be one of [sha256, sha512]"
            ))
        })?;
        algorithm.get_or_insert(parsed);
    }
    algorithm.ok_or_else(|| invalid("config.json: packagingFormatDigestAlgorithm must be set"))
}

fn read_manifest(inventory: &Value) -> Result<BTreeMap<String, ManifestEntry>, RegistryError> {
    if !inventory.is_object() {
        return Err(invalid(
            "packaging_format_inventory.json must be a JSON object",
        ));
    }
    let Some(Value::Object(entries)) = inventory.get("manifest") else {
        return Err(invalid(
            "packaging_format_inventory.json must contain object 'manifest'",
        ));
    };
    let mut manifest = BTreeMap::new();
    for (id, entry) in entries {
        if !entry.is_object() {
            return Err(invalid(format!("Manifest entry '{id}' must be an object")));
        }
        match (
            text(entry, "name"),
            text(entry, "version"),
            text(entry, "summary"),
        ) {
            (Some(name), Some(version), Some(_)) => {
                manifest.insert(
                    id.clone(),
                    ManifestEntry {
                        name: name.to_string(),
                        version: version.to_string(),
                    },
                );
            }
            _ => {
                return Err(invalid(format!(
                    "Manifest entry '{id}' must contain 'name', 'version', and 'summary'"
                )))
            }
        }
    }
    Ok(manifest)
}

fn validate_manifest(
    algorithm: DigestAlgorithm,
    manifest: &BTreeMap<String, ManifestEntry>,
    format_dirs: &BTreeSet<String>,
) -> Result<(), RegistryError> {
    let mut pairs = HashSet::new();
    for e in manifest.values() {
        if !pairs.insert((e.name.as_str(), e.version.as_str())) {
            return Err(invalid(format!(
                "Duplicate packaging format (name/version) in manifest: {}/{}",
                e.name, e.version
            )));
        }
    }
    if format_dirs.len() != manifest.len() {
        return Err(invalid(format!(
            "Mismatch between number of manifest entries ({}) and packaging_formats directories ({})",
            manifest.len(),
            format_dirs.len()
        )));
    }
    if let Some(id) = manifest.keys().find(|id| !format_dirs.contains(*id)) {
        return Err(invalid(format!(
            "Missing packaging_formats directory for manifest id: {id}"
        )));
    }
    for (id, e) in manifest {
        let expected = algorithm.hex_digest(&format!("{}/{}", e.name, e.version));
        if !expected.eq_ignore_ascii_case(id) {
            return Err(invalid(format!(
                "Manifest id does not match digest of name/version for: {}/{}",
                e.name, e.version
            )));
        }
    }
    Ok(())
}
