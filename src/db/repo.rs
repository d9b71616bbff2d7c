use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::instrument;
use uuid::Uuid;

use super::model::{consistency_check_from_row, import_job_from_row};
use crate::model::{CheckResult, ConsistencyCheck, ImportJob, JobStatus};

pub type Pool = SqlitePool;

const IMPORT_JOB_COLUMNS: &str = "id, path, single_object, accept_timestamp_version_directories, \
     created, started, finished, status, message";
const CHECK_COLUMNS: &str = "id, check_type, layer_id, created, started, finished, result, message";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Expands a leading `~/` in file-backed SQLite URLs, creates the parent
/// directory, and asks sqlx to create the file. In-memory URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path_part.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let query = match query_part {
        Some(q) if q.contains("mode=") => q.to_string(),
        Some(q) => format!("{q}&mode=rwc"),
        None => "mode=rwc".to_string(),
    };
    format!("sqlite://{expanded}?{query}")
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn insert_import_job(pool: &Pool, job: &ImportJob) -> Result<()> {
    sqlx::query(
        "INSERT INTO import_jobs (id, path, single_object, accept_timestamp_version_directories, created, status) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(job.id.to_string())
    .bind(&job.path)
    .bind(job.single_object)
    .bind(job.accept_timestamp_version_directories)
    .bind(job.created)
    .bind(job.status.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_import_job(pool: &Pool, id: Uuid) -> Result<Option<ImportJob>> {
    let row = sqlx::query(&format!(
        "SELECT {IMPORT_JOB_COLUMNS} FROM import_jobs WHERE id = ?"
    ))
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(import_job_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_import_jobs(pool: &Pool) -> Result<Vec<ImportJob>> {
    let rows = sqlx::query(&format!(
        "SELECT {IMPORT_JOB_COLUMNS} FROM import_jobs ORDER BY created ASC"
    ))
    .fetch_all(pool)
    .await?;
    rows.iter().map(import_job_from_row).collect()
}

/// Oldest job still waiting to run.
#[instrument(skip_all)]
pub async fn next_pending_import_job(pool: &Pool) -> Result<Option<ImportJob>> {
    let row = sqlx::query(&format!(
        "SELECT {IMPORT_JOB_COLUMNS} FROM import_jobs WHERE status = ? ORDER BY created ASC LIMIT 1"
    ))
    .bind(JobStatus::Pending.as_str())
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(import_job_from_row).transpose()
}

/// Moves a PENDING job to RUNNING and stamps its start. Returns false when the
/// job was no longer pending.
#[instrument(skip_all)]
pub async fn start_import_job(pool: &Pool, job: &mut ImportJob) -> Result<bool> {
    let started = Utc::now();
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        "UPDATE import_jobs SET status = ?, started = ? WHERE id = ? AND status = ?",
    )
    .bind(JobStatus::Running.as_str())
    .bind(started)
    .bind(job.id.to_string())
    .bind(JobStatus::Pending.as_str())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    if res.rows_affected() == 0 {
        return Ok(false);
    }
    job.status = JobStatus::Running;
    job.started = Some(started);
    Ok(true)
}

/// Persists the mutable part of a job: timestamps, status and message.
#[instrument(skip_all)]
pub async fn save_import_job(pool: &Pool, job: &ImportJob) -> Result<()> {
    sqlx::query(
        "UPDATE import_jobs SET started = ?, finished = ?, status = ?, message = ? WHERE id = ?",
    )
    .bind(job.started)
    .bind(job.finished)
    .bind(job.status.as_str())
    .bind(&job.message)
    .bind(job.id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// Jobs left RUNNING by a previous process can never finish; fail them.
#[instrument(skip_all)]
pub async fn fail_interrupted_import_jobs(pool: &Pool, message: &str) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE import_jobs SET status = ?, message = ?, finished = ? WHERE status = ?",
    )
    .bind(JobStatus::Failed.as_str())
    .bind(message)
    .bind(Utc::now())
    .bind(JobStatus::Running.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn insert_consistency_check(pool: &Pool, check: &ConsistencyCheck) -> Result<()> {
    sqlx::query(
        "INSERT INTO consistency_checks (id, check_type, layer_id, created) VALUES (?, ?, ?, ?)",
    )
    .bind(check.id.to_string())
    .bind(check.check_type.as_str())
    .bind(check.layer_id)
    .bind(check.created)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_consistency_check(pool: &Pool, id: Uuid) -> Result<Option<ConsistencyCheck>> {
    let row = sqlx::query(&format!(
        "SELECT {CHECK_COLUMNS} FROM consistency_checks WHERE id = ?"
    ))
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(consistency_check_from_row).transpose()
}

/// Oldest unstarted check created at or before `created_before`.
#[instrument(skip_all)]
pub async fn next_due_consistency_check(
    pool: &Pool,
    created_before: DateTime<Utc>,
) -> Result<Option<ConsistencyCheck>> {
    let row = sqlx::query(&format!(
        "SELECT {CHECK_COLUMNS} FROM consistency_checks \
         WHERE started IS NULL AND created <= ? ORDER BY created ASC LIMIT 1"
    ))
    .bind(created_before)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(consistency_check_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn start_consistency_check(pool: &Pool, check: &mut ConsistencyCheck) -> Result<bool> {
    let started = Utc::now();
    let res = sqlx::query(
        "UPDATE consistency_checks SET started = ? WHERE id = ? AND started IS NULL",
    )
    .bind(started)
    .bind(check.id.to_string())
    .execute(pool)
    .await?;
    if res.rows_affected() == 0 {
        return Ok(false);
    }
    check.started = Some(started);
    Ok(true)
}

#[instrument(skip_all)]
pub async fn finish_consistency_check(
    pool: &Pool,
    check: &mut ConsistencyCheck,
    result: CheckResult,
    message: Option<String>,
) -> Result<()> {
    let finished = Utc::now();
    sqlx::query(
        "UPDATE consistency_checks SET finished = ?, result = ?, message = ? WHERE id = ?",
    )
    .bind(finished)
    .bind(result.as_str())
    .bind(&message)
    .bind(check.id.to_string())
    .execute(pool)
    .await?;
    check.finished = Some(finished);
    check.result = Some(result);
    check.message = message;
    Ok(())
}
