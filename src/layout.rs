//! Pre-flight validation of a batch's on-disk layout. Nothing here moves or
//! deletes anything; a batch either passes as a whole or is rejected with every
//! violation listed.
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::error::{IngestError, Result};
use crate::provider::RepositoryProvider;

const SIDECAR_SUFFIX: &str = ".json";

/// How version directories are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionScheme {
    /// `v1`, `v2`, ...
    VNumber,
    /// Non-negative integers, e.g. epoch millis.
    Timestamp,
}

impl VersionScheme {
    pub fn from_flag(accept_timestamp_version_directories: bool) -> Self {
        if accept_timestamp_version_directories {
            VersionScheme::Timestamp
        } else {
            VersionScheme::VNumber
        }
    }

    pub fn parse(&self, name: &str) -> Option<u64> {
        let digits = match self {
            VersionScheme::VNumber => name.strip_prefix('v')?,
            VersionScheme::Timestamp => name,
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    InvalidObjectDirectory(PathBuf),
    InvalidVersionDirectory(PathBuf),
    NonConsecutiveVersions { object_dir: PathBuf, reason: String },
}

/// Every layout problem found in one batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub struct LayoutViolations {
    pattern: String,
    violations: Vec<Violation>,
}

impl LayoutViolations {
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }
}

fn path_list<'a>(paths: impl Iterator<Item = &'a str>) -> String {
    format!("[{}]", paths.collect::<Vec<_>>().join(", "))
}

impl fmt::Display for LayoutViolations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut objects = Vec::new();
        let mut versions = Vec::new();
        let mut runs = Vec::new();
        for v in &self.violations {
            match v {
                Violation::InvalidObjectDirectory(p) => objects.push(p.display().to_string()),
                Violation::InvalidVersionDirectory(p) => versions.push(p.display().to_string()),
                Violation::NonConsecutiveVersions { object_dir, reason } => {
                    runs.push(format!("{} ({reason})", object_dir.display()))
                }
            }
        }

        let mut parts = Vec::new();
        if !objects.is_empty() {
            parts.push(format!(
                "invalid object directories (name must match configured pattern '{}'): {}",
                self.pattern,
                path_list(objects.iter().map(String::as_str))
            ));
        }
        if !versions.is_empty() {
            parts.push(format!(
                "invalid version directories (name must follow vN pattern or be a number, depending on configuration): {}",
                path_list(versions.iter().map(String::as_str))
            ));
        }
        if !runs.is_empty() {
            parts.push(format!(
                "non-consecutive versions: {}",
                path_list(runs.iter().map(String::as_str))
            ));
        }
        write!(f, "Invalid batch layout: {}", parts.join(", "))
    }
}

/// Version directories and sidecar base names found in one object directory.
#[derive(Debug, Default)]
struct ObjectListing {
    versions: BTreeSet<String>,
    sidecars: BTreeSet<String>,
    others: Vec<PathBuf>,
}

pub struct BatchLayoutValidator {
    pattern: String,
    object_id_re: Regex,
    scheme: VersionScheme,
    provider: Option<Arc<dyn RepositoryProvider>>,
}

impl BatchLayoutValidator {
    pub fn new(pattern: &str, scheme: VersionScheme) -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            pattern: pattern.to_string(),
            object_id_re: anchored(pattern)?,
            scheme,
            provider: None,
        })
    }

    /// Also require each object's first new version to be the store's head + 1.
    pub fn with_provider(mut self, provider: Arc<dyn RepositoryProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn is_valid_object_id(&self, name: &str) -> bool {
        self.object_id_re.is_match(name)
    }

    #[instrument(skip_all, fields(batch = %batch_dir.display()))]
    pub async fn validate_batch(&self, batch_dir: &Path) -> Result<()> {
        let mut violations = Vec::new();
        for entry in sorted_entries(batch_dir).await? {
            self.check_object(&entry, &mut violations).await?;
        }
        self.finish(violations)
    }

    #[instrument(skip_all, fields(object = %object_dir.display()))]
    pub async fn validate_object(&self, object_dir: &Path) -> Result<()> {
        let mut violations = Vec::new();
        self.check_object(object_dir, &mut violations).await?;
        self.finish(violations)
    }

    fn finish(&self, violations: Vec<Violation>) -> Result<()> {
        if violations.is_empty() {
            debug!("batch layout is valid");
            return Ok(());
        }
        Err(IngestError::LayoutInvalid(LayoutViolations {
            pattern: self.pattern.clone(),
            violations,
        }))
    }

    async fn check_object(&self, object_dir: &Path, out: &mut Vec<Violation>) -> Result<()> {
        let is_dir = tokio::fs::metadata(object_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        let name = file_name(object_dir);
        if !is_dir || !self.is_valid_object_id(&name) {
            out.push(Violation::InvalidObjectDirectory(object_dir.to_path_buf()));
            return Ok(());
        }

        let listing = list_object(object_dir).await?;
        let mut names_ok = listing.others.is_empty();
        for other in listing.others {
            out.push(Violation::InvalidVersionDirectory(other));
        }
        for version in &listing.versions {
            if self.scheme.parse(version).is_none() {
                names_ok = false;
                out.push(Violation::InvalidVersionDirectory(object_dir.join(version)));
            }
        }

        if !listing.sidecars.is_empty() {
            for missing in listing
                .versions
                .difference(&listing.sidecars)
                .filter(|v| self.scheme.parse(v).is_some())
            {
                out.push(Violation::InvalidVersionDirectory(object_dir.join(missing)));
            }
            for orphan in listing.sidecars.difference(&listing.versions) {
                out.push(Violation::InvalidVersionDirectory(
                    object_dir.join(format!("{orphan}{SIDECAR_SUFFIX}")),
                ));
            }
        }

        if names_ok {
            let numbers: Vec<u64> = listing
                .versions
                .iter()
                .filter_map(|v| self.scheme.parse(v))
                .collect();
            if let Some(reason) = self.run_problem(&name, numbers).await? {
                out.push(Violation::NonConsecutiveVersions {
                    object_dir: object_dir.to_path_buf(),
                    reason,
                });
            }
        }
        Ok(())
    }

    async fn run_problem(&self, object_id: &str, mut numbers: Vec<u64>) -> Result<Option<String>> {
        numbers.sort_unstable();
        if let Some(w) = numbers.windows(2).find(|w| w[0] == w[1]) {
            return Ok(Some(format!("duplicate version {}", w[0])));
        }
        if self.scheme == VersionScheme::Timestamp {
            return Ok(None);
        }
        let Some(&first) = numbers.first() else {
            return Ok(None);
        };
        if first == 0 {
            return Ok(Some("versions start at v1, found v0".to_string()));
        }
        if let Some(w) = numbers.windows(2).find(|w| w[1] != w[0] + 1) {
            return Ok(Some(format!("gap between v{} and v{}", w[0], w[1])));
        }
        let Some(provider) = &self.provider else {
            return Ok(None);
        };

        let stored = |n: u64| provider.get_object_version(object_id, n);
        let head_present = first <= 1
            || stored(first - 1)
                .await
                .map_err(IngestError::infrastructure)?
                .is_some();
        let first_taken = stored(first)
            .await
            .map_err(IngestError::infrastructure)?
            .is_some();
        if !head_present || first_taken {
            return Ok(Some(format!(
                "first version v{first} does not follow the stored head"
            )));
        }
        Ok(None)
    }
}

fn anchored(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub(crate) async fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut rd = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| IngestError::io(dir, e))?;
    let mut out = Vec::new();
    while let Some(entry) = rd.next_entry().await.map_err(|e| IngestError::io(dir, e))? {
        out.push(entry.path());
    }
    out.sort();
    Ok(out)
}

async fn list_object(object_dir: &Path) -> Result<ObjectListing> {
    let mut listing = ObjectListing::default();
    for entry in sorted_entries(object_dir).await? {
        let name = file_name(&entry);
        let meta = tokio::fs::metadata(&entry)
            .await
            .map_err(|e| IngestError::io(&entry, e))?;
        if meta.is_dir() {
            listing.versions.insert(name);
        } else if let Some(base) = name.strip_suffix(SIDECAR_SUFFIX).filter(|b| !b.is_empty()) {
            listing.sidecars.insert(base.to_string());
        } else {
            listing.others.push(entry);
        }
    }
    Ok(listing)
}

/// Version directory names of `object_dir` in application order. Sidecar
/// files are skipped; a name that does not parse is a layout error.
pub async fn ordered_versions(object_dir: &Path, scheme: VersionScheme) -> Result<Vec<(u64, PathBuf)>> {
    let listing = list_object(object_dir).await?;
    let mut versions = Vec::with_capacity(listing.versions.len());
    for name in listing.versions {
        let dir = object_dir.join(&name);
        match scheme.parse(&name) {
            Some(n) => versions.push((n, dir)),
            None => {
                return Err(IngestError::LayoutInvalid(LayoutViolations {
                    pattern: String::new(),
                    violations: vec![Violation::InvalidVersionDirectory(dir)],
                }))
            }
        }
    }
    versions.sort_by_key(|(n, _)| *n);
    Ok(versions)
}
