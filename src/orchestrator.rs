//! Runs one import job end to end: layout gate, parallel object ingest,
//! aggregation, maintenance, autoclean and the final status write.
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};

use crate::db::{self, Pool};
use crate::error::IngestError;
use crate::ingest::{IngestContext, ObjectVersionIngestTask, TaskStatus};
use crate::layout::{sorted_entries, BatchLayoutValidator, VersionScheme};
use crate::metadata::VersionPropertiesReader;
use crate::model::{ImportJob, JobStatus};
use crate::outbox::{self, BatchOutbox};
use crate::provider::{LayerMaintenance, RepositoryProvider};
use crate::registry::PropertyRegistry;
use crate::scheduler::{TaskFactory, TaskFuture, TaskSource};

pub const TASKS_THREW_MESSAGE: &str =
    "One or more tasks threw an exception. Check the logs for more information.";
pub const PANICKED_MESSAGE: &str = "Import job aborted unexpectedly. Check the logs for more information.";

pub fn tasks_failed_message(batch_outbox: &Path) -> String {
    format!(
        "One or more tasks failed. Check error documents in '{}'.",
        batch_outbox.display()
    )
}

#[derive(Debug, Clone)]
pub struct ImportSettings {
    pub inbox: PathBuf,
    pub outbox: PathBuf,
    pub valid_object_identifier_pattern: String,
    pub autoclean: bool,
}

/// Where one job reads from and writes to.
#[derive(Debug, Clone)]
struct JobPaths {
    /// The batch root, or the object directory for single-object jobs.
    input: PathBuf,
    outbox: BatchOutbox,
}

pub struct ImportJobOrchestrator {
    pool: Pool,
    provider: Arc<dyn RepositoryProvider>,
    registry: Arc<PropertyRegistry>,
    reader: Arc<VersionPropertiesReader>,
    workers: Arc<Semaphore>,
    maintenance: Option<Arc<dyn LayerMaintenance>>,
    settings: ImportSettings,
}

impl ImportJobOrchestrator {
    pub fn new(
        pool: Pool,
        provider: Arc<dyn RepositoryProvider>,
        registry: Arc<PropertyRegistry>,
        reader: VersionPropertiesReader,
        settings: ImportSettings,
        worker_threads: usize,
    ) -> Self {
        Self {
            pool,
            provider,
            registry,
            reader: Arc::new(reader),
            workers: Arc::new(Semaphore::new(worker_threads.max(1))),
            maintenance: None,
            settings,
        }
    }

    pub fn with_maintenance(mut self, maintenance: Arc<dyn LayerMaintenance>) -> Self {
        self.maintenance = Some(maintenance);
        self
    }

    fn paths(&self, job: &ImportJob) -> JobPaths {
        let input = self.settings.inbox.join(&job.path);
        let batch = if job.single_object {
            Path::new(&job.path)
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default()
        } else {
            PathBuf::from(&job.path)
        };
        JobPaths {
            input,
            outbox: BatchOutbox::new(self.settings.outbox.join(batch)),
        }
    }

    /// Claims and runs `job`. The final status is persisted whatever happens
    /// in between, panics included.
    #[instrument(skip_all, fields(job_id = %job.id, path = %job.path))]
    pub async fn run(&self, mut job: ImportJob) -> Result<ImportJob> {
        if !db::start_import_job(&self.pool, &mut job).await? {
            warn!("import job is no longer pending; skipping");
            return Ok(job);
        }
        info!(single_object = job.single_object, "starting import job");

        match AssertUnwindSafe(self.process(&mut job)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(?err, "import job failed");
                job.fail(format!("{err:#}"));
            }
            Err(_) => {
                error!("import job panicked");
                job.fail(PANICKED_MESSAGE);
            }
        }
        job.finished = Some(Utc::now());
        db::save_import_job(&self.pool, &job).await?;
        info!(status = %job.status, "import job finished");
        Ok(job)
    }

    async fn process(&self, job: &mut ImportJob) -> Result<()> {
        let paths = self.paths(job);
        let scheme = VersionScheme::from_flag(job.accept_timestamp_version_directories);
        let validator = BatchLayoutValidator::new(&self.settings.valid_object_identifier_pattern, scheme)
            .context("invalid object identifier pattern")?
            .with_provider(self.provider.clone());

        let checked = if job.single_object {
            validator.validate_object(&paths.input).await
        } else {
            validator.validate_batch(&paths.input).await
        };
        match checked {
            Ok(()) => {}
            Err(IngestError::LayoutInvalid(violations)) => {
                error!(batch = %paths.input.display(), %violations, "invalid batch layout; leaving input in place");
                job.fail(violations.to_string());
                return Ok(());
            }
            Err(other) => return Err(other.into()),
        }

        paths.outbox.prepare().await?;
        let object_dirs = if job.single_object {
            vec![paths.input.clone()]
        } else {
            sorted_entries(&paths.input).await?
        };

        let ctx = IngestContext {
            provider: self.provider.clone(),
            registry: self.registry.clone(),
            reader: self.reader.clone(),
            scheme,
            outbox: paths.outbox.clone(),
        };
        info!(objects = object_dirs.len(), "dispatching object tasks");
        let handles: Vec<_> = object_dirs
            .into_iter()
            .map(|dir| {
                let ctx = ctx.clone();
                let workers = self.workers.clone();
                tokio::spawn(async move {
                    let _permit = workers
                        .acquire_owned()
                        .await
                        .map_err(IngestError::infrastructure)?;
                    Ok::<_, IngestError>(ObjectVersionIngestTask::new(ctx, dir).run().await)
                })
            })
            .collect();
        let results = futures::future::join_all(handles).await;

        let mut threw = false;
        let mut all_succeeded = true;
        let mut succeeded = Vec::new();
        for result in results {
            match result {
                Ok(Ok(task)) if task.status() == TaskStatus::Success => {
                    succeeded.push(task.object_id().to_string());
                }
                Ok(Ok(task)) => {
                    all_succeeded = false;
                    info!(object_id = task.object_id(), status = ?task.status(), "object task did not succeed");
                }
                Ok(Err(err)) => {
                    threw = true;
                    error!(%err, "object task could not run");
                }
                Err(join_err) => {
                    threw = true;
                    error!(%join_err, "object task panicked");
                }
            }
        }

        if threw {
            job.fail(TASKS_THREW_MESSAGE);
        } else if all_succeeded {
            job.succeed();
            info!("all objects ingested");
            if let Some(maintenance) = &self.maintenance {
                if let Err(err) = maintenance.rotate_top_layer_if_needed().await {
                    warn!(?err, "layer maintenance failed");
                }
            }
        } else {
            job.fail(tasks_failed_message(paths.outbox.root()));
        }

        if self.settings.autoclean {
            // Single-object jobs share their batch roots with other objects.
            let remove_roots = job.status == JobStatus::Success && !job.single_object;
            outbox::autoclean(&paths.outbox, &succeeded, remove_roots, &paths.input).await;
        }
        Ok(())
    }
}

/// Feeds the import poller with the oldest pending job.
pub struct PendingImportJobs {
    pool: Pool,
}

impl PendingImportJobs {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskSource<ImportJob> for PendingImportJobs {
    async fn next_task(&self) -> Result<Option<ImportJob>> {
        db::next_pending_import_job(&self.pool).await
    }
}

pub struct ImportJobTaskFactory {
    orchestrator: Arc<ImportJobOrchestrator>,
}

impl ImportJobTaskFactory {
    pub fn new(orchestrator: Arc<ImportJobOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

impl TaskFactory<ImportJob> for ImportJobTaskFactory {
    fn create(&self, job: ImportJob) -> Result<TaskFuture> {
        let orchestrator = self.orchestrator.clone();
        Ok(async move { orchestrator.run(job).await.map(|_| ()) }.boxed())
    }
}
