//! Row-to-entity mapping for the repository functions.
//!
//! Keep these focused on decoding columns. Business logic lives in higher layers.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::model::{CheckResult, CheckType, ConsistencyCheck, ImportJob, JobStatus};

fn uuid_column(row: &SqliteRow) -> Result<Uuid> {
    let id: String = row.try_get("id")?;
    Uuid::parse_str(&id).with_context(|| format!("row has malformed id {id}"))
}

pub fn import_job_from_row(row: &SqliteRow) -> Result<ImportJob> {
    let id = uuid_column(row)?;
    let status: String = row.try_get("status")?;
    let status = JobStatus::parse_status(&status)
        .ok_or_else(|| anyhow!("import job {} has unknown status {}", id, status))?;
    Ok(ImportJob {
        id,
        path: row.try_get("path")?,
        single_object: row.try_get("single_object")?,
        accept_timestamp_version_directories: row.try_get("accept_timestamp_version_directories")?,
        created: row.try_get::<DateTime<Utc>, _>("created")?,
        started: row.try_get::<Option<DateTime<Utc>>, _>("started")?,
        finished: row.try_get::<Option<DateTime<Utc>>, _>("finished")?,
        status,
        message: row.try_get("message")?,
    })
}

pub fn consistency_check_from_row(row: &SqliteRow) -> Result<ConsistencyCheck> {
    let id = uuid_column(row)?;
    let check_type: String = row.try_get("check_type")?;
    let check_type = CheckType::parse_type(&check_type)
        .ok_or_else(|| anyhow!("consistency check {} has unknown type {}", id, check_type))?;
    let result = match row.try_get::<Option<String>, _>("result")? {
        Some(r) => Some(
            CheckResult::parse_result(&r)
                .ok_or_else(|| anyhow!("consistency check {} has unknown result {}", id, r))?,
        ),
        None => None,
    };
    Ok(ConsistencyCheck {
        id,
        check_type,
        layer_id: row.try_get("layer_id")?,
        created: row.try_get::<DateTime<Utc>, _>("created")?,
        started: row.try_get::<Option<DateTime<Utc>>, _>("started")?,
        finished: row.try_get::<Option<DateTime<Utc>>, _>("finished")?,
        result,
        message: row.try_get("message")?,
    })
}
