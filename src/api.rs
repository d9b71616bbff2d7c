//! Job submission and status queries, shared by the CLI and tests.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::db::{self, Pool};
use crate::model::{CheckResult, CheckType, ConsistencyCheck, ImportJob, JobStatus};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("database error: {0:#}")]
    Database(#[from] anyhow::Error),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    pub path: String,
    #[serde(default)]
    pub single_object: bool,
    #[serde(default)]
    pub accept_timestamp_version_directories: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyCheckRequest {
    pub check_type: CheckType,
    #[serde(default)]
    pub layer_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImportJobStatusDto {
    pub id: Uuid,
    pub path: String,
    pub single_object: bool,
    pub accept_timestamp_version_directories: bool,
    pub status: JobStatus,
    pub message: Option<String>,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyCheckDto {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub check_type: CheckType,
    pub layer_id: Option<i64>,
    pub result: Option<CheckResult>,
    pub message: Option<String>,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
}

pub fn import_job_status(job: &ImportJob) -> ImportJobStatusDto {
    ImportJobStatusDto {
        id: job.id,
        path: job.path.clone(),
        single_object: job.single_object,
        accept_timestamp_version_directories: job.accept_timestamp_version_directories,
        status: job.status,
        message: job.message.clone(),
        created: job.created,
        started: job.started,
        finished: job.finished,
    }
}

pub fn consistency_check_status(check: &ConsistencyCheck) -> ConsistencyCheckDto {
    ConsistencyCheckDto {
        id: check.id,
        check_type: check.check_type,
        layer_id: check.layer_id,
        result: check.result,
        message: check.message.clone(),
        created: check.created,
        started: check.started,
        finished: check.finished,
    }
}

/// Resolves `path` against `inbox` and returns it inbox-relative.
fn inbox_relative(inbox: &Path, path: &str) -> Result<PathBuf, SubmitError> {
    if path.trim().is_empty() {
        return Err(SubmitError::InvalidRequest("path must be non-empty".into()));
    }
    let requested = Path::new(path);
    if requested
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(SubmitError::InvalidRequest(format!(
            "path '{path}' must not contain '..'"
        )));
    }
    let relative = if requested.is_absolute() {
        requested
            .strip_prefix(inbox)
            .map_err(|_| {
                SubmitError::InvalidRequest(format!(
                    "path '{path}' is not inside the inbox '{}'",
                    inbox.display()
                ))
            })?
            .to_path_buf()
    } else {
        requested.to_path_buf()
    };
    if relative.as_os_str().is_empty() {
        return Err(SubmitError::InvalidRequest(
            "path must name a directory below the inbox".into(),
        ));
    }
    Ok(relative)
}

/// Registers a PENDING import job for a batch (or a single object) in the inbox.
#[instrument(skip_all, fields(path = %request.path))]
pub async fn submit_import(
    pool: &Pool,
    inbox: &Path,
    request: ImportRequest,
) -> Result<ImportJob, SubmitError> {
    let relative = inbox_relative(inbox, &request.path)?;
    let full = inbox.join(&relative);
    let meta = tokio::fs::metadata(&full).await.map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            SubmitError::InvalidRequest(format!("'{}' does not exist", full.display()))
        } else {
            SubmitError::Io {
                path: full.clone(),
                source,
            }
        }
    })?;
    if !meta.is_dir() {
        return Err(SubmitError::InvalidRequest(format!(
            "'{}' is not a directory",
            full.display()
        )));
    }

    let job = ImportJob::new_pending(
        relative.to_string_lossy(),
        request.single_object,
        request.accept_timestamp_version_directories,
    );
    db::insert_import_job(pool, &job).await?;
    info!(job_id = %job.id, "import job submitted");
    Ok(job)
}

pub async fn get_import(pool: &Pool, id: Uuid) -> Result<Option<ImportJob>, SubmitError> {
    Ok(db::get_import_job(pool, id).await?)
}

pub async fn list_imports(pool: &Pool) -> Result<Vec<ImportJob>, SubmitError> {
    Ok(db::list_import_jobs(pool).await?)
}

#[instrument(skip_all, fields(check_type = request.check_type.as_str()))]
pub async fn submit_consistency_check(
    pool: &Pool,
    request: ConsistencyCheckRequest,
) -> Result<ConsistencyCheck, SubmitError> {
    match (request.check_type, request.layer_id) {
        (CheckType::ListingRecords, None) => {
            return Err(SubmitError::InvalidRequest(
                "LISTING_RECORDS checks require a layer id".into(),
            ))
        }
        (_, Some(id)) if id < 0 => {
            return Err(SubmitError::InvalidRequest(format!(
                "layer id must not be negative: {id}"
            )))
        }
        _ => {}
    }
    let check = ConsistencyCheck::new(request.check_type, request.layer_id);
    db::insert_consistency_check(pool, &check).await?;
    info!(check_id = %check.id, "consistency check submitted");
    Ok(check)
}

pub async fn get_consistency_check(
    pool: &Pool,
    id: Uuid,
) -> Result<Option<ConsistencyCheck>, SubmitError> {
    Ok(db::get_consistency_check(pool, id).await?)
}
