//! Relocation of object directories into a batch's outbox, and the autoclean
//! that follows a job.
use anyhow::{Context, Result};
use std::error::Error as _;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, instrument, warn};

use crate::error::IngestError;

pub const PROCESSED_DIR: &str = "processed";
pub const FAILED_DIR: &str = "failed";

/// `<outbox>/<batch>`, holding `processed/` and `failed/`.
#[derive(Debug, Clone)]
pub struct BatchOutbox {
    root: PathBuf,
}

impl BatchOutbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.root.join(PROCESSED_DIR)
    }

    pub fn failed_dir(&self) -> PathBuf {
        self.root.join(FAILED_DIR)
    }

    pub fn processed_path(&self, object_id: &str) -> PathBuf {
        self.processed_dir().join(object_id)
    }

    pub fn failed_path(&self, object_id: &str) -> PathBuf {
        self.failed_dir().join(object_id)
    }

    pub fn error_document_path(&self, object_id: &str) -> PathBuf {
        self.failed_dir().join(format!("{object_id}-error.txt"))
    }

    pub async fn prepare(&self) -> Result<()> {
        for dir in [self.processed_dir(), self.failed_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Moves a successfully ingested object to `processed/<id>`. Failure is
    /// logged and the directory stays where it was.
    pub async fn move_to_processed(&self, object_id: &str, object_dir: &Path) {
        let target = self.processed_path(object_id);
        match tokio::fs::rename(object_dir, &target).await {
            Ok(()) => debug!(object_id, target = %target.display(), "moved to processed"),
            Err(err) => error!(
                object_id,
                from = %object_dir.display(),
                to = %target.display(),
                %err,
                "could not move object to processed outbox; leaving it in place"
            ),
        }
    }

    /// Moves a failed object to `failed/<id>` and writes the error document
    /// next to it. Neither step may mask `cause`, so both only log.
    pub async fn move_to_failed(&self, object_id: &str, object_dir: &Path, cause: &IngestError) {
        let target = self.failed_path(object_id);
        if let Err(err) = tokio::fs::rename(object_dir, &target).await {
            error!(
                object_id,
                from = %object_dir.display(),
                to = %target.display(),
                %err,
                "could not move object to failed outbox; leaving it in place"
            );
        }
        let doc = self.error_document_path(object_id);
        if let Err(err) = tokio::fs::write(&doc, error_document(cause)).await {
            error!(object_id, path = %doc.display(), %err, "could not write error document");
        }
    }

    pub async fn remove_processed(&self, object_id: &str) {
        remove_dir_logged(&self.processed_path(object_id)).await;
    }
}

/// The display message, its causes, then the full debug rendering.
pub fn error_document(cause: &IngestError) -> String {
    let mut doc = format!("{cause}\n");
    let mut source = cause.source();
    while let Some(s) = source {
        doc.push_str(&format!("Caused by: {s}\n"));
        source = s.source();
    }
    doc.push_str(&format!("\n{cause:#?}\n"));
    doc
}

/// Autoclean after a job: drop `processed/<id>` for every succeeded object and,
/// when the whole batch succeeded, the batch's inbox and outbox roots too.
#[instrument(skip_all, fields(outbox = %outbox.root().display()))]
pub async fn autoclean(
    outbox: &BatchOutbox,
    succeeded: &[String],
    batch_succeeded: bool,
    inbox_batch_root: &Path,
) {
    for object_id in succeeded {
        outbox.remove_processed(object_id).await;
    }
    if batch_succeeded {
        remove_dir_logged(inbox_batch_root).await;
        remove_dir_logged(outbox.root()).await;
    }
    info!(
        cleaned = succeeded.len(),
        batch_roots_removed = batch_succeeded,
        "autoclean finished"
    );
}

async fn remove_dir_logged(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(dir = %dir.display(), "removed"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(dir = %dir.display(), %err, "autoclean could not remove directory"),
    }
}
