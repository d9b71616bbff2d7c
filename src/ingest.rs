use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::{IngestError, Result};
use crate::layout::{ordered_versions, VersionScheme};
use crate::metadata::VersionPropertiesReader;
use crate::outbox::BatchOutbox;
use crate::provider::RepositoryProvider;
use crate::registry::PropertyRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
}

/// Collaborators shared by every object task of one job.
#[derive(Clone)]
pub struct IngestContext {
    pub provider: Arc<dyn RepositoryProvider>,
    pub registry: Arc<PropertyRegistry>,
    pub reader: Arc<VersionPropertiesReader>,
    pub scheme: VersionScheme,
    pub outbox: BatchOutbox,
}

/// Commits all versions of one object directory, then relocates it to the
/// outbox.
pub struct ObjectVersionIngestTask {
    ctx: IngestContext,
    object_dir: PathBuf,
    object_id: String,
    status: TaskStatus,
}

impl ObjectVersionIngestTask {
    pub fn new(ctx: IngestContext, object_dir: PathBuf) -> Self {
        let object_id = object_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            ctx,
            object_dir,
            object_id,
            status: TaskStatus::Pending,
        }
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    pub fn object_dir(&self) -> &Path {
        &self.object_dir
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Runs to a terminal status and hands the task back for inspection.
    #[instrument(skip_all, fields(object_id = %self.object_id))]
    pub async fn run(mut self) -> Self {
        self.status = TaskStatus::Running;
        match self.ingest().await {
            Ok(committed) => {
                info!(versions = committed, "object ingested");
                self.ctx
                    .outbox
                    .move_to_processed(&self.object_id, &self.object_dir)
                    .await;
                self.status = TaskStatus::Success;
            }
            Err(err) => {
                warn!(category = %err.category(), error = %err, "object ingest failed");
                self.ctx
                    .outbox
                    .move_to_failed(&self.object_id, &self.object_dir, &err)
                    .await;
                self.status = TaskStatus::Failed;
            }
        }
        self
    }

    async fn ingest(&self) -> Result<usize> {
        let versions = ordered_versions(&self.object_dir, self.ctx.scheme).await?;
        for (number, dir) in &versions {
            let properties = self.ctx.reader.read_for_version_dir(dir).await?;
            self.ctx.registry.validate(&properties.custom)?;

            let committed = match self.ctx.scheme {
                VersionScheme::VNumber => {
                    self.ctx
                        .provider
                        .add_version(&self.object_id, *number, dir, &properties)
                        .await
                }
                VersionScheme::Timestamp => {
                    self.ctx
                        .provider
                        .add_head_version(&self.object_id, dir, &properties)
                        .await
                }
            };
            committed.map_err(|source| IngestError::CommitFailed {
                object_id: self.object_id.clone(),
                version: version_label(self.ctx.scheme, *number),
                source,
            })?;
            debug!(version = number, "version committed");
        }
        Ok(versions.len())
    }
}

fn version_label(scheme: VersionScheme, number: u64) -> String {
    match scheme {
        VersionScheme::VNumber => format!("v{number}"),
        VersionScheme::Timestamp => number.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{DefaultVersionInfo, VersionProperties};
    use crate::provider::VersionDescriptor;
    use async_trait::async_trait;
    use std::fs;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<(String, Option<u64>, PathBuf)>>,
        fail_on: Option<u64>,
    }

    #[async_trait]
    impl RepositoryProvider for Recording {
        async fn add_version(
            &self,
            object_id: &str,
            version: u64,
            version_dir: &Path,
            _properties: &VersionProperties,
        ) -> anyhow::Result<()> {
            if self.fail_on == Some(version) {
                anyhow::bail!("store rejected v{version}");
            }
            self.calls
                .lock()
                .await
                .push((object_id.to_string(), Some(version), version_dir.to_path_buf()));
            Ok(())
        }

        async fn add_head_version(
            &self,
            object_id: &str,
            version_dir: &Path,
            _properties: &VersionProperties,
        ) -> anyhow::Result<()> {
            self.calls
                .lock()
                .await
                .push((object_id.to_string(), None, version_dir.to_path_buf()));
            Ok(())
        }

        async fn get_object_version(
            &self,
            _object_id: &str,
            _version: u64,
        ) -> anyhow::Result<Option<VersionDescriptor>> {
            Ok(None)
        }
    }

    fn context(provider: Arc<Recording>, scheme: VersionScheme, outbox: BatchOutbox) -> IngestContext {
        IngestContext {
            provider,
            registry: Arc::new(PropertyRegistry::empty()),
            reader: Arc::new(VersionPropertiesReader::new(Some(DefaultVersionInfo {
                username: "ingest".into(),
                email: "ingest@example.org".into(),
                message: "bulk".into(),
            }))),
            scheme,
            outbox,
        }
    }

    #[tokio::test]
    async fn commits_in_order_and_moves_to_processed() {
        let td = tempfile::tempdir().unwrap();
        let inbox = td.path().join("inbox/batch");
        for v in ["v2", "v1", "v10"] {
            fs::create_dir_all(inbox.join("obj-A").join(v)).unwrap();
        }
        let outbox = BatchOutbox::new(td.path().join("outbox/batch"));
        outbox.prepare().await.unwrap();
        let provider = Arc::new(Recording::default());

        let task = ObjectVersionIngestTask::new(
            context(provider.clone(), VersionScheme::VNumber, outbox.clone()),
            inbox.join("obj-A"),
        );
        assert_eq!(task.status(), TaskStatus::Pending);
        let task = task.run().await;

        assert_eq!(task.status(), TaskStatus::Success);
        let numbers: Vec<Option<u64>> = provider.calls.lock().await.iter().map(|c| c.1).collect();
        assert_eq!(numbers, vec![Some(1), Some(2), Some(10)]);
        assert!(outbox.processed_path("obj-A").join("v10").is_dir());
    }

    #[tokio::test]
    async fn timestamp_versions_use_head_commits() {
        let td = tempfile::tempdir().unwrap();
        let inbox = td.path().join("inbox/batch");
        for v in ["1700000005000", "1700000000000"] {
            fs::create_dir_all(inbox.join("obj-A").join(v)).unwrap();
        }
        let outbox = BatchOutbox::new(td.path().join("outbox/batch"));
        outbox.prepare().await.unwrap();
        let provider = Arc::new(Recording::default());

        let task = ObjectVersionIngestTask::new(
            context(provider.clone(), VersionScheme::Timestamp, outbox),
            inbox.join("obj-A"),
        )
        .run()
        .await;

        assert_eq!(task.status(), TaskStatus::Success);
        let dirs: Vec<String> = provider
            .calls
            .lock()
            .await
            .iter()
            .map(|c| c.2.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(dirs, vec!["1700000000000", "1700000005000"]);
    }

    #[tokio::test]
    async fn commit_failure_stops_remaining_versions() {
        let td = tempfile::tempdir().unwrap();
        let inbox = td.path().join("inbox/batch");
        for v in ["v1", "v2", "v3"] {
            fs::create_dir_all(inbox.join("obj-A").join(v)).unwrap();
        }
        let outbox = BatchOutbox::new(td.path().join("outbox/batch"));
        outbox.prepare().await.unwrap();
        let provider = Arc::new(Recording {
            fail_on: Some(2),
            ..Default::default()
        });

        let task = ObjectVersionIngestTask::new(
            context(provider.clone(), VersionScheme::VNumber, outbox.clone()),
            inbox.join("obj-A"),
        )
        .run()
        .await;

        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(provider.calls.lock().await.len(), 1);
        assert!(outbox.failed_path("obj-A").is_dir());
        let doc = fs::read_to_string(outbox.error_document_path("obj-A")).unwrap();
        assert!(doc.starts_with("failed to commit version v2 of object obj-A: store rejected v2"));
    }

    #[tokio::test]
    async fn unknown_custom_property_fails_before_commit() {
        let td = tempfile::tempdir().unwrap();
        let inbox = td.path().join("inbox/batch");
        fs::create_dir_all(inbox.join("obj-A/v1")).unwrap();
        fs::write(
            inbox.join("obj-A/v1.json"),
            r#"{"version-info":{"user":{"name":"A","email":"a@b.org"},"message":"m"},"object-version-properties":{"colour":"red"}}"#,
        )
        .unwrap();
        let outbox = BatchOutbox::new(td.path().join("outbox/batch"));
        outbox.prepare().await.unwrap();
        let provider = Arc::new(Recording::default());

        let task = ObjectVersionIngestTask::new(
            context(provider.clone(), VersionScheme::VNumber, outbox.clone()),
            inbox.join("obj-A"),
        )
        .run()
        .await;

        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(provider.calls.lock().await.is_empty());
        let doc = fs::read_to_string(outbox.error_document_path("obj-A")).unwrap();
        assert!(doc.starts_with("Unknown property per property-registry: colour"));
    }
}
