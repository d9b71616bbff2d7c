//! A filesystem-backed versioned object store.
//!
//! Layout under the store root:
//!
//! ```text
//! extensions/property-registry/config.json
//! extensions/packaging-format-registry/...
//! layers/<layerId>/<objectKey>/v<N>/...      version content
//! objects/<objectKey>/inventory.json          per-object version history
//! ```
//!
//! Content is copied into the current top layer; a new top layer is started
//! once the current one reaches the configured size.
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::metadata::{CustomProperties, VersionProperties};
use crate::model::{User, VersionInfo};
use crate::provider::{
    CheckFailure, ConsistencyChecker, LayerMaintenance, RepositoryProvider, VersionDescriptor,
};
use crate::registry::{packaging, PropertyRegistry};

const LAYERS_DIR: &str = "layers";
const OBJECTS_DIR: &str = "objects";
const EXTENSIONS_DIR: &str = "extensions";
const INVENTORY_FILE: &str = "inventory.json";
/// Marks a version copy that has not been renamed into place yet.
const STAGING_MARKER: &str = ".tmp-";

/// Id and on-disk size of one storage layer.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LayerInfo {
    pub id: i64,
    pub size_in_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Inventory {
    id: String,
    head: u64,
    versions: Vec<InventoryVersion>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct InventoryVersion {
    number: u64,
    layer: i64,
    created: DateTime<Utc>,
    user: User,
    message: String,
    #[serde(default)]
    properties: CustomProperties,
}

/// Directory name for an object id: bytes outside `[A-Za-z0-9._-]`, and a
/// leading dot, become `%XX`.
pub fn object_key(object_id: &str) -> String {
    let mut key = String::with_capacity(object_id.len());
    for (i, b) in object_id.bytes().enumerate() {
        let plain = b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-');
        if plain && !(i == 0 && b == b'.') {
            key.push(b as char);
        } else {
            let _ = write!(key, "%{b:02X}");
        }
    }
    key
}

pub struct FsRepositoryProvider {
    root: PathBuf,
    layer_threshold_bytes: u64,
    top_layer: RwLock<i64>,
    /// Serializes layer creation; the top-layer lock itself is never held across `.await`.
    rotation: tokio::sync::Mutex<()>,
    registry: Arc<PropertyRegistry>,
}

impl FsRepositoryProvider {
    /// Opens (or initialises) the store at `root`. Registry problems are fatal.
    #[instrument(skip_all, fields(root = %root.as_ref().display()))]
    pub async fn open(root: impl AsRef<Path>, layer_threshold_bytes: u64) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in [LAYERS_DIR, OBJECTS_DIR, EXTENSIONS_DIR] {
            tokio::fs::create_dir_all(root.join(dir))
                .await
                .with_context(|| format!("failed to create {}", root.join(dir).display()))?;
        }
        packaging::validate(&root).await?;
        let registry = Arc::new(PropertyRegistry::load(&root).await?);

        let top = match highest_layer_on_disk(&root.join(LAYERS_DIR)).await? {
            Some(top) => top,
            None => {
                tokio::fs::create_dir_all(root.join(LAYERS_DIR).join("1")).await?;
                1
            }
        };
        info!(top_layer = top, "store opened");
        Ok(Self {
            root,
            layer_threshold_bytes,
            top_layer: RwLock::new(top),
            rotation: tokio::sync::Mutex::new(()),
            registry,
        })
    }

    pub fn registry(&self) -> Arc<PropertyRegistry> {
        self.registry.clone()
    }

    pub fn top_layer(&self) -> i64 {
        *self
            .top_layer
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Numeric layer ids on disk, ascending.
    pub async fn layer_ids(&self) -> Result<Vec<i64>> {
        let mut ids: Vec<i64> = layer_entries(&self.root.join(LAYERS_DIR))
            .await
            .context("failed to list layers")?
            .into_iter()
            .filter_map(|(_, id)| id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Size of one layer, or `None` when it does not exist.
    pub async fn layer_info(&self, id: i64) -> Result<Option<LayerInfo>> {
        let dir = self.layer_dir(id);
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(None);
        }
        Ok(Some(LayerInfo {
            id,
            size_in_bytes: layer_size(dir).await?,
        }))
    }

    pub async fn top_layer_info(&self) -> Result<LayerInfo> {
        let id = self.top_layer();
        self.layer_info(id)
            .await?
            .ok_or_else(|| anyhow!("top layer {id} is missing on disk"))
    }

    /// Starts a new top layer regardless of the threshold.
    pub async fn new_top_layer(&self) -> Result<LayerInfo> {
        let _rotation = self.rotation.lock().await;
        self.start_layer_after(self.top_layer()).await
    }

    /// Creates the layer following `top` (or the highest layer on disk, if that
    /// is further along) and makes it the top layer. Callers hold `rotation`.
    async fn start_layer_after(&self, top: i64) -> Result<LayerInfo> {
        let on_disk = highest_layer_on_disk(&self.root.join(LAYERS_DIR))
            .await
            .context("failed to list layers")?
            .unwrap_or(top);
        let id = top.max(on_disk) + 1;
        tokio::fs::create_dir(self.layer_dir(id))
            .await
            .with_context(|| format!("failed to create layer {id}"))?;
        *self
            .top_layer
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = id;
        info!(old = top, new = id, "started new top layer");
        Ok(LayerInfo {
            id,
            size_in_bytes: 0,
        })
    }

    fn layer_dir(&self, layer: i64) -> PathBuf {
        self.root.join(LAYERS_DIR).join(layer.to_string())
    }

    fn inventory_path(&self, object_id: &str) -> PathBuf {
        self.root
            .join(OBJECTS_DIR)
            .join(object_key(object_id))
            .join(INVENTORY_FILE)
    }

    async fn read_inventory(&self, object_id: &str) -> Result<Option<Inventory>> {
        read_inventory_file(&self.inventory_path(object_id)).await
    }

    async fn write_inventory(&self, inventory: &Inventory) -> Result<()> {
        let path = self.inventory_path(&inventory.id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(inventory)?).await?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    async fn commit(
        &self,
        object_id: &str,
        number: Option<u64>,
        version_dir: &Path,
        properties: &VersionProperties,
    ) -> Result<u64> {
        let mut inventory = self.read_inventory(object_id).await?.unwrap_or(Inventory {
            id: object_id.to_string(),
            head: 0,
            versions: Vec::new(),
        });
        let next = inventory.head + 1;
        let number = number.unwrap_or(next);
        if number != next {
            bail!(
                "cannot add version {number} to object {object_id}: next version is {next}"
            );
        }

        let layer = self.top_layer();
        let object_dir = self.layer_dir(layer).join(object_key(object_id));
        let target = object_dir.join(format!("v{number}"));
        // `number` is past the inventory head, so anything already here is
        // left over from a commit that died before recording it.
        if tokio::fs::try_exists(&target).await? {
            warn!(target = %target.display(), "removing unrecorded version directory");
            tokio::fs::remove_dir_all(&target)
                .await
                .with_context(|| format!("failed to remove stale {}", target.display()))?;
        }

        let staging = object_dir.join(format!("v{number}{STAGING_MARKER}{}", Uuid::new_v4()));
        let source = version_dir.to_path_buf();
        let dest = staging.clone();
        let copied = tokio::task::spawn_blocking(move || copy_tree(&source, &dest))
            .await
            .map_err(|e| anyhow!("copy task failed: {e}"))
            .and_then(|res| {
                res.with_context(|| {
                    format!("failed to copy {} into layer {layer}", version_dir.display())
                })
            });
        let placed = match copied {
            Ok(()) => tokio::fs::rename(&staging, &target)
                .await
                .with_context(|| format!("failed to move version into {}", target.display())),
            Err(err) => Err(err),
        };
        if let Err(err) = placed {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&staging).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(staging = %staging.display(), %cleanup, "could not remove partial copy");
                }
            }
            return Err(err);
        }

        inventory.versions.push(InventoryVersion {
            number,
            layer,
            created: Utc::now(),
            user: properties.info.user.clone(),
            message: properties.info.message.clone(),
            properties: properties.custom.clone(),
        });
        inventory.head = number;
        self.write_inventory(&inventory).await?;
        debug!(object_id, version = number, layer, "version stored");
        Ok(number)
    }

    async fn inventories(&self) -> Result<Vec<Inventory>> {
        let dir = self.root.join(OBJECTS_DIR);
        let mut out = Vec::new();
        let mut rd = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = rd.next_entry().await? {
            if let Some(inv) = read_inventory_file(&entry.path().join(INVENTORY_FILE)).await? {
                out.push(inv);
            }
        }
        Ok(out)
    }
}

async fn read_inventory_file(path: &Path) -> Result<Option<Inventory>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(
            serde_json::from_slice(&bytes)
                .with_context(|| format!("corrupt inventory {}", path.display()))?,
        )),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

/// Every entry of `layers/` paired with its numeric id, if it has one.
async fn layer_entries(layers: &Path) -> std::io::Result<Vec<(String, Option<i64>)>> {
    let mut rd = tokio::fs::read_dir(layers).await?;
    let mut out = Vec::new();
    while let Some(entry) = rd.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let id = if entry.file_type().await?.is_dir() {
            name.parse::<i64>().ok()
        } else {
            None
        };
        out.push((name, id));
    }
    out.sort();
    Ok(out)
}

async fn highest_layer_on_disk(layers: &Path) -> std::io::Result<Option<i64>> {
    Ok(layer_entries(layers)
        .await?
        .into_iter()
        .filter_map(|(_, id)| id)
        .max())
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

async fn layer_size(dir: PathBuf) -> Result<u64> {
    Ok(tokio::task::spawn_blocking(move || tree_size(&dir))
        .await
        .map_err(|e| anyhow!("size task failed: {e}"))??)
}

fn tree_size(dir: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        total += if meta.is_dir() {
            tree_size(&entry.path())?
        } else {
            meta.len()
        };
    }
    Ok(total)
}

#[async_trait]
impl RepositoryProvider for FsRepositoryProvider {
    async fn add_version(
        &self,
        object_id: &str,
        version: u64,
        version_dir: &Path,
        properties: &VersionProperties,
    ) -> Result<()> {
        self.commit(object_id, Some(version), version_dir, properties)
            .await
            .map(|_| ())
    }

    async fn add_head_version(
        &self,
        object_id: &str,
        version_dir: &Path,
        properties: &VersionProperties,
    ) -> Result<()> {
        self.commit(object_id, None, version_dir, properties)
            .await
            .map(|_| ())
    }

    async fn get_object_version(
        &self,
        object_id: &str,
        version: u64,
    ) -> Result<Option<VersionDescriptor>> {
        let Some(inventory) = self.read_inventory(object_id).await? else {
            return Ok(None);
        };
        Ok(inventory
            .versions
            .into_iter()
            .find(|v| v.number == version)
            .map(|v| VersionDescriptor {
                object_id: inventory.id.clone(),
                version: v.number,
                created: v.created,
                info: VersionInfo {
                    user: v.user,
                    message: v.message,
                },
                custom: v.properties,
            }))
    }
}

#[async_trait]
impl LayerMaintenance for FsRepositoryProvider {
    async fn rotate_top_layer_if_needed(&self) -> Result<()> {
        if self.layer_threshold_bytes == 0 {
            return Ok(());
        }
        let _rotation = self.rotation.lock().await;
        let top = self.top_layer();
        let size = layer_size(self.layer_dir(top)).await?;
        if size < self.layer_threshold_bytes {
            debug!(top, size, "top layer below threshold");
            return Ok(());
        }
        self.start_layer_after(top).await.map(|_| ())
    }
}

#[async_trait]
impl ConsistencyChecker for FsRepositoryProvider {
    async fn check_layer_ids(&self) -> std::result::Result<(), CheckFailure> {
        let entries = layer_entries(&self.root.join(LAYERS_DIR))
            .await
            .context("failed to list layers")?;
        if let Some((name, _)) = entries.iter().find(|(_, id)| id.is_none()) {
            return Err(CheckFailure::Mismatch(format!(
                "unexpected entry in layers directory: {name}"
            )));
        }
        let on_disk = entries.iter().filter_map(|(_, id)| *id).max();
        let top = self.top_layer();
        if on_disk != Some(top) {
            return Err(CheckFailure::Mismatch(format!(
                "top layer is {top} but highest layer on disk is {}",
                on_disk.map_or_else(|| "none".to_string(), |id| id.to_string())
            )));
        }
        Ok(())
    }

    async fn check_listing_records(&self, layer_id: i64) -> std::result::Result<(), CheckFailure> {
        let layer_dir = self.layer_dir(layer_id);
        if !tokio::fs::try_exists(&layer_dir)
            .await
            .context("failed to stat layer")?
        {
            return Err(CheckFailure::Error(anyhow!("layer {layer_id} does not exist")));
        }

        let mut recorded = BTreeSet::new();
        for inv in self.inventories().await? {
            let key = object_key(&inv.id);
            for v in inv.versions.iter().filter(|v| v.layer == layer_id) {
                recorded.insert(format!("{key}/v{}", v.number));
            }
        }

        let mut stored = BTreeSet::new();
        let mut objects = tokio::fs::read_dir(&layer_dir)
            .await
            .context("failed to list layer")?;
        while let Some(object) = objects.next_entry().await.context("failed to list layer")? {
            let key = object.file_name().to_string_lossy().into_owned();
            let mut versions = tokio::fs::read_dir(object.path())
                .await
                .context("failed to list object in layer")?;
            while let Some(v) = versions
                .next_entry()
                .await
                .context("failed to list object in layer")?
            {
                let name = v.file_name().to_string_lossy().into_owned();
                if name.contains(STAGING_MARKER) {
                    continue;
                }
                stored.insert(format!("{key}/{name}"));
            }
        }

        let missing: Vec<_> = recorded.difference(&stored).cloned().collect();
        let unrecorded: Vec<_> = stored.difference(&recorded).cloned().collect();
        if missing.is_empty() && unrecorded.is_empty() {
            return Ok(());
        }
        Err(CheckFailure::Mismatch(format!(
            "layer {layer_id}: recorded but missing on disk: {missing:?}; on disk but not recorded: {unrecorded:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::User;
    use std::fs;

    fn props(message: &str) -> VersionProperties {
        VersionProperties {
            info: VersionInfo {
                user: User {
                    name: "Test".into(),
                    address: "mailto:test@example.org".into(),
                },
                message: message.into(),
            },
            custom: CustomProperties::new(),
        }
    }

    fn version_dir(root: &Path, name: &str, content: &[u8]) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(dir.join("data")).unwrap();
        fs::write(dir.join("data/file.bin"), content).unwrap();
        dir
    }

    #[test]
    fn object_keys_are_filesystem_safe() {
        assert_eq!(object_key("obj-A_1.2"), "obj-A_1.2");
        assert_eq!(object_key("urn:nbn:nl/1"), "urn%3Anbn%3Anl%2F1");
        assert_eq!(object_key(".."), "%2E.");
    }

    #[tokio::test]
    async fn versions_are_stored_in_order() {
        let td = tempfile::tempdir().unwrap();
        let store = FsRepositoryProvider::open(td.path().join("vault"), 0).await.unwrap();
        let v1 = version_dir(td.path(), "v1", b"one");
        let v2 = version_dir(td.path(), "v2", b"two");

        assert!(store.add_version("obj-A", 2, &v2, &props("x")).await.is_err());
        store.add_version("obj-A", 1, &v1, &props("first")).await.unwrap();
        store.add_head_version("obj-A", &v2, &props("second")).await.unwrap();
        assert!(store.add_version("obj-A", 2, &v2, &props("again")).await.is_err());

        let d = store.get_object_version("obj-A", 2).await.unwrap().unwrap();
        assert_eq!(d.info.message, "second");
        assert!(store.get_object_version("obj-A", 3).await.unwrap().is_none());
        assert!(store.get_object_version("obj-B", 1).await.unwrap().is_none());
        assert_eq!(
            fs::read(td.path().join("vault/layers/1/obj-A/v2/data/file.bin")).unwrap(),
            b"two"
        );
        // Input is copied, not moved.
        assert!(v1.join("data/file.bin").exists());
    }

    #[tokio::test]
    async fn rotates_layer_at_threshold() {
        let td = tempfile::tempdir().unwrap();
        let store = FsRepositoryProvider::open(td.path().join("vault"), 4).await.unwrap();
        store.rotate_top_layer_if_needed().await.unwrap();
        assert_eq!(store.top_layer(), 1);

        let v1 = version_dir(td.path(), "v1", b"12345");
        store.add_version("obj-A", 1, &v1, &props("m")).await.unwrap();
        store.rotate_top_layer_if_needed().await.unwrap();
        assert_eq!(store.top_layer(), 2);

        let v2 = version_dir(td.path(), "v2", b"x");
        store.add_version("obj-A", 2, &v2, &props("m")).await.unwrap();
        assert!(td.path().join("vault/layers/2/obj-A/v2").is_dir());
        assert_eq!(
            store.get_object_version("obj-A", 1).await.unwrap().unwrap().version,
            1
        );

        let reopened = FsRepositoryProvider::open(td.path().join("vault"), 4).await.unwrap();
        assert_eq!(reopened.top_layer(), 2);
    }

    #[tokio::test]
    async fn layer_ids_check_detects_strays() {
        let td = tempfile::tempdir().unwrap();
        let store = FsRepositoryProvider::open(td.path().join("vault"), 0).await.unwrap();
        store.check_layer_ids().await.unwrap();

        fs::create_dir_all(td.path().join("vault/layers/7")).unwrap();
        assert!(matches!(
            store.check_layer_ids().await,
            Err(CheckFailure::Mismatch(msg)) if msg.contains("highest layer on disk is 7")
        ));
        fs::remove_dir(td.path().join("vault/layers/7")).unwrap();

        fs::write(td.path().join("vault/layers/notes.txt"), "x").unwrap();
        assert!(matches!(
            store.check_layer_ids().await,
            Err(CheckFailure::Mismatch(_))
        ));
    }

    #[tokio::test]
    async fn listing_records_check_compares_both_ways() {
        let td = tempfile::tempdir().unwrap();
        let store = FsRepositoryProvider::open(td.path().join("vault"), 0).await.unwrap();
        let v1 = version_dir(td.path(), "v1", b"one");
        store.add_version("obj-A", 1, &v1, &props("m")).await.unwrap();
        store.check_listing_records(1).await.unwrap();

        fs::create_dir_all(td.path().join("vault/layers/1/obj-B/v1")).unwrap();
        let Err(CheckFailure::Mismatch(msg)) = store.check_listing_records(1).await else {
            panic!("expected mismatch");
        };
        assert!(msg.contains("obj-B/v1"), "{msg}");

        assert!(matches!(
            store.check_listing_records(9).await,
            Err(CheckFailure::Error(_))
        ));
    }

    #[tokio::test]
    async fn malformed_registry_prevents_start() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join(crate::registry::REGISTRY_PATH);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            r#"{"extensionName":"property-registry","propertyRegistry":{"x":{"type":"string"}}}"#,
        )
        .unwrap();
        assert!(FsRepositoryProvider::open(td.path(), 0).await.is_err());
    }

    fn version_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(dir)
            .map(|rd| {
                rd.map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_copy_leaves_nothing_behind_and_can_be_retried() {
        let td = tempfile::tempdir().unwrap();
        let store = FsRepositoryProvider::open(td.path().join("vault"), 0).await.unwrap();
        let v1 = version_dir(td.path(), "v1", b"one");
        std::os::unix::fs::symlink(td.path().join("nowhere"), v1.join("dangling")).unwrap();

        let err = store.add_version("obj-A", 1, &v1, &props("m")).await.unwrap_err();
        assert!(format!("{err:#}").contains("failed to copy"), "{err:#}");
        assert!(version_entries(&td.path().join("vault/layers/1/obj-A")).is_empty());
        assert!(store.get_object_version("obj-A", 1).await.unwrap().is_none());
        store.check_listing_records(1).await.unwrap();

        fs::remove_file(v1.join("dangling")).unwrap();
        store.add_version("obj-A", 1, &v1, &props("m")).await.unwrap();
        assert_eq!(
            version_entries(&td.path().join("vault/layers/1/obj-A")),
            vec!["v1".to_string()]
        );
        store.check_listing_records(1).await.unwrap();
    }

    #[tokio::test]
    async fn unrecorded_version_dir_is_replaced() {
        let td = tempfile::tempdir().unwrap();
        let store = FsRepositoryProvider::open(td.path().join("vault"), 0).await.unwrap();
        let stale = td.path().join("vault/layers/1/obj-A/v1");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("half-written.bin"), b"junk").unwrap();

        let v1 = version_dir(td.path(), "v1", b"one");
        store.add_version("obj-A", 1, &v1, &props("m")).await.unwrap();
        assert!(!stale.join("half-written.bin").exists());
        assert_eq!(fs::read(stale.join("data/file.bin")).unwrap(), b"one");
        store.check_listing_records(1).await.unwrap();
    }

    #[tokio::test]
    async fn layers_can_be_listed_sized_and_started_on_demand() {
        let td = tempfile::tempdir().unwrap();
        let store = FsRepositoryProvider::open(td.path().join("vault"), 0).await.unwrap();
        assert_eq!(store.layer_ids().await.unwrap(), vec![1]);
        assert_eq!(
            store.top_layer_info().await.unwrap(),
            LayerInfo {
                id: 1,
                size_in_bytes: 0
            }
        );

        let v1 = version_dir(td.path(), "v1", b"12345");
        store.add_version("obj-A", 1, &v1, &props("m")).await.unwrap();
        assert_eq!(store.layer_info(1).await.unwrap().unwrap().size_in_bytes, 5);
        assert!(store.layer_info(2).await.unwrap().is_none());

        let created = store.new_top_layer().await.unwrap();
        assert_eq!(created.id, 2);
        assert_eq!(store.top_layer(), 2);
        assert_eq!(store.layer_ids().await.unwrap(), vec![1, 2]);
        store.check_layer_ids().await.unwrap();

        let v2 = version_dir(td.path(), "v2", b"x");
        store.add_version("obj-A", 2, &v2, &props("m")).await.unwrap();
        assert!(td.path().join("vault/layers/2/obj-A/v2").is_dir());
        assert_eq!(store.top_layer_info().await.unwrap().size_in_bytes, 1);
    }

    #[tokio::test]
    async fn new_layer_skips_past_layers_created_elsewhere() {
        let td = tempfile::tempdir().unwrap();
        let store = FsRepositoryProvider::open(td.path().join("vault"), 0).await.unwrap();
        fs::create_dir_all(td.path().join("vault/layers/4")).unwrap();
        assert_eq!(store.new_top_layer().await.unwrap().id, 5);
        store.check_layer_ids().await.unwrap();
    }
}
