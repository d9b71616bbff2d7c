use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::metadata::{CustomProperties, VersionProperties};
use crate::model::VersionInfo;

/// What the store knows about one committed version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionDescriptor {
    pub object_id: String,
    pub version: u64,
    pub created: DateTime<Utc>,
    pub info: VersionInfo,
    #[serde(default)]
    pub custom: CustomProperties,
}

/// The versioned object store. Creates objects on their first version.
#[async_trait]
pub trait RepositoryProvider: Send + Sync {
    /// Commits `version_dir` as version `version`, which must be the object's head + 1.
    async fn add_version(
        &self,
        object_id: &str,
        version: u64,
        version_dir: &Path,
        properties: &VersionProperties,
    ) -> Result<()>;

    /// Commits `version_dir` as the object's next version.
    async fn add_head_version(
        &self,
        object_id: &str,
        version_dir: &Path,
        properties: &VersionProperties,
    ) -> Result<()>;

    async fn get_object_version(
        &self,
        object_id: &str,
        version: u64,
    ) -> Result<Option<VersionDescriptor>>;
}

/// Storage housekeeping run after a fully successful batch.
#[async_trait]
pub trait LayerMaintenance: Send + Sync {
    async fn rotate_top_layer_if_needed(&self) -> Result<()>;
}

/// A consistency check either finds the store consistent, finds a mismatch,
/// or cannot complete.
#[derive(Debug, thiserror::Error)]
pub enum CheckFailure {
    #[error("{0}")]
    Mismatch(String),
    #[error(transparent)]
    Error(#[from] anyhow::Error),
}

#[async_trait]
pub trait ConsistencyChecker: Send + Sync {
    async fn check_layer_ids(&self) -> std::result::Result<(), CheckFailure>;

    async fn check_listing_records(&self, layer_id: i64) -> std::result::Result<(), CheckFailure>;
}
