use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobStatus::Pending),
            "RUNNING" => Some(JobStatus::Running),
            "SUCCESS" => Some(JobStatus::Success),
            "FAILED" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted request to ingest one batch (or one object) from the inbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportJob {
    pub id: Uuid,
    /// Batch root, relative to the configured inbox.
    pub path: String,
    pub single_object: bool,
    pub accept_timestamp_version_directories: bool,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub message: Option<String>,
}

impl ImportJob {
    pub fn new_pending(
        path: impl Into<String>,
        single_object: bool,
        accept_timestamp_version_directories: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: path.into(),
            single_object,
            accept_timestamp_version_directories,
            created: Utc::now(),
            started: None,
            finished: None,
            status: JobStatus::Pending,
            message: None,
        }
    }

    pub fn succeed(&mut self) {
        self.status = JobStatus::Success;
        self.message = None;
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.message = Some(message.into());
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckType {
    LayerIds,
    ListingRecords,
}

impl CheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckType::LayerIds => "LAYER_IDS",
            CheckType::ListingRecords => "LISTING_RECORDS",
        }
    }

    pub fn parse_type(s: &str) -> Option<Self> {
        match s {
            "LAYER_IDS" => Some(CheckType::LayerIds),
            "LISTING_RECORDS" => Some(CheckType::ListingRecords),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckResult {
    Ok,
    NotOk,
    Error,
}

impl CheckResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckResult::Ok => "OK",
            CheckResult::NotOk => "NOT_OK",
            CheckResult::Error => "ERROR",
        }
    }

    pub fn parse_result(s: &str) -> Option<Self> {
        match s {
            "OK" => Some(CheckResult::Ok),
            "NOT_OK" => Some(CheckResult::NotOk),
            "ERROR" => Some(CheckResult::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsistencyCheck {
    pub id: Uuid,
    pub check_type: CheckType,
    pub layer_id: Option<i64>,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub result: Option<CheckResult>,
    pub message: Option<String>,
}

impl ConsistencyCheck {
    pub fn new(check_type: CheckType, layer_id: Option<i64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            check_type,
            layer_id,
            created: Utc::now(),
            started: None,
            finished: None,
            result: None,
            message: None,
        }
    }
}

/// Committer of a version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub name: String,
    /// Always carries the `mailto:` prefix.
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionInfo {
    pub user: User,
    pub message: String,
}
