//! Configuration loader and validator for the ingest service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::metadata::DefaultVersionInfo;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub ingest: Ingest,
    pub job_polling: Polling,
    pub consistency_checks: ConsistencyChecks,
    pub store: Store,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Overrides the default `sqlite://<data_dir>/ingest.db`.
    #[serde(default)]
    pub database_url: Option<String>,
}

/// Batch ingestion settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ingest {
    pub inbox: PathBuf,
    pub outbox: PathBuf,
    pub valid_object_identifier_pattern: String,
    pub worker_threads: usize,
    #[serde(default)]
    pub autoclean: bool,
    /// Provenance for versions delivered without a sidecar.
    #[serde(default)]
    pub default_version_info: Option<DefaultVersionInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Polling {
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsistencyChecks {
    pub interval_ms: u64,
    /// Checks younger than this are left alone so that in-flight writes settle.
    #[serde(default)]
    pub settle_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Store {
    pub root: PathBuf,
    /// Rotate to a new top layer once it holds this many bytes; 0 disables.
    #[serde(default)]
    pub layer_threshold_bytes: u64,
}

impl Config {
    /// Creates `app.data_dir`, the inbox, the outbox and the store root if missing.
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if !self.app.data_dir.trim().is_empty() {
            fs::create_dir_all(&self.app.data_dir)?;
        }
        fs::create_dir_all(&self.ingest.inbox)?;
        fs::create_dir_all(&self.ingest.outbox)?;
        fs::create_dir_all(&self.store.root)
    }

    /// `DATABASE_URL` wins over `app.database_url`, which wins over the data dir default.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .or_else(|| self.app.database_url.clone())
            .unwrap_or_else(|| format!("sqlite://{}/ingest.db", self.app.data_dir))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.ingest.inbox.as_os_str().is_empty() {
        return Err(ConfigError::Invalid("ingest.inbox must be non-empty"));
    }
    if cfg.ingest.outbox.as_os_str().is_empty() {
        return Err(ConfigError::Invalid("ingest.outbox must be non-empty"));
    }
    if cfg.ingest.inbox == cfg.ingest.outbox {
        return Err(ConfigError::Invalid("ingest.inbox and ingest.outbox must differ"));
    }
    if cfg.ingest.valid_object_identifier_pattern.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "ingest.valid_object_identifier_pattern must be non-empty",
        ));
    }
    if regex::Regex::new(&cfg.ingest.valid_object_identifier_pattern).is_err() {
        return Err(ConfigError::Invalid(
            "ingest.valid_object_identifier_pattern must be a valid regex",
        ));
    }
    if cfg.ingest.worker_threads == 0 {
        return Err(ConfigError::Invalid("ingest.worker_threads must be > 0"));
    }
    if let Some(d) = &cfg.ingest.default_version_info {
        if d.username.trim().is_empty() || d.message.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "ingest.default_version_info needs username and message",
            ));
        }
        if crate::metadata::normalize_email(&d.email).is_err() {
            return Err(ConfigError::Invalid(
                "ingest.default_version_info.email must be a valid address",
            ));
        }
    }

    if cfg.job_polling.interval_ms == 0 {
        return Err(ConfigError::Invalid("job_polling.interval_ms must be > 0"));
    }
    if cfg.consistency_checks.interval_ms == 0 {
        return Err(ConfigError::Invalid(
            "consistency_checks.interval_ms must be > 0",
        ));
    }

    if cfg.store.root.as_os_str().is_empty() {
        return Err(ConfigError::Invalid("store.root must be non-empty"));
    }

    Ok(())
}

/// Returns the example YAML printed by `example-config`.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

ingest:
  inbox: "./data/inbox"
  outbox: "./data/outbox"
  valid_object_identifier_pattern: "[a-zA-Z0-9_.:-]+"
  worker_threads: 4
  autoclean: false
  default_version_info:
    username: "ingest"
    email: "ingest@example.org"
    message: "Imported by batch ingest"

job_polling:
  interval_ms: 1000

consistency_checks:
  interval_ms: 5000
  settle_seconds: 10

store:
  root: "./data/vault"
  layer_threshold_bytes: 1073741824
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    fn invalid_msg(cfg: &Config) -> &'static str {
        match validate(cfg).unwrap_err() {
            ConfigError::Invalid(msg) => msg,
            other => panic!("wrong error: {other}"),
        }
    }

    #[test]
    fn parse_example_ok() {
        validate(&example_cfg()).unwrap();
    }

    #[test]
    fn optional_sections_default() {
        let yaml = r#"
app: { data_dir: "./d" }
ingest:
  inbox: "./in"
  outbox: "./out"
  valid_object_identifier_pattern: "[a-z]+"
  worker_threads: 1
job_polling: { interval_ms: 10 }
consistency_checks: { interval_ms: 10 }
store: { root: "./vault" }
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert!(!cfg.ingest.autoclean);
        assert!(cfg.ingest.default_version_info.is_none());
        assert_eq!(cfg.store.layer_threshold_bytes, 0);
        assert_eq!(cfg.consistency_checks.settle_seconds, 0);
    }

    #[test]
    fn invalid_pattern() {
        let mut cfg = example_cfg();
        cfg.ingest.valid_object_identifier_pattern = "([a-z".into();
        assert!(invalid_msg(&cfg).contains("valid regex"));
    }

    #[test]
    fn invalid_worker_threads_and_intervals() {
        let mut cfg = example_cfg();
        cfg.ingest.worker_threads = 0;
        assert!(invalid_msg(&cfg).contains("worker_threads"));

        let mut cfg = example_cfg();
        cfg.job_polling.interval_ms = 0;
        assert!(invalid_msg(&cfg).contains("job_polling"));

        let mut cfg = example_cfg();
        cfg.consistency_checks.interval_ms = 0;
        assert!(invalid_msg(&cfg).contains("consistency_checks"));
    }

    #[test]
    fn inbox_and_outbox_must_differ() {
        let mut cfg = example_cfg();
        cfg.ingest.outbox = cfg.ingest.inbox.clone();
        assert!(invalid_msg(&cfg).contains("must differ"));
    }

    #[test]
    fn invalid_default_email() {
        let mut cfg = example_cfg();
        if let Some(d) = cfg.ingest.default_version_info.as_mut() {
            d.email = "nobody".into();
        }
        assert!(invalid_msg(&cfg).contains("email"));
    }

    #[test]
    fn ensure_dirs_creates_all_roots() {
        let td = tempdir().unwrap();
        let mut cfg = example_cfg();
        cfg.app.data_dir = td.path().join("data").to_string_lossy().to_string();
        cfg.ingest.inbox = td.path().join("inbox");
        cfg.ingest.outbox = td.path().join("outbox");
        cfg.store.root = td.path().join("vault");
        cfg.ensure_dirs().unwrap();
        assert!(td.path().join("data").exists());
        assert!(td.path().join("inbox").exists());
        assert!(td.path().join("outbox").exists());
        assert!(td.path().join("vault").exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.ingest.worker_threads, 4);
        assert_eq!(cfg.store.layer_threshold_bytes, 1 << 30);
    }
}
