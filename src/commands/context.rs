use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cache::{CacheManager, SystemClock};
use crate::config::Config;
use crate::health::{OverallStatus, read_latest_report};
use crate::model::HealthAdvisory;
use crate::net::{ReqwestTransport, RetryExecutor, SourceClient};

pub const DOCUMENTS_DIR: &str = "documents";
pub const HEALTH_DIR: &str = "health";
pub const DOWNLOADS_DIR: &str = "downloads";
pub const RECORDS_DIR: &str = "records";
pub const BATCHES_DIR: &str = "batches";

pub fn documents_dir(cache_root: &Path) -> PathBuf {
    cache_root.join(DOCUMENTS_DIR)
}

pub fn health_dir(cache_root: &Path) -> PathBuf {
    cache_root.join(HEALTH_DIR)
}

/// Services shared by every fund processed in one invocation.
pub struct RunContext {
    pub config: Config,
    pub cache_root: PathBuf,
    pub client: SourceClient,
    pub cache: CacheManager,
}

impl RunContext {
    pub fn open(cache_root: &Path) -> Result<Self> {
        let config = Config::from_env().context("failed to load configuration")?;
        let transport =
            ReqwestTransport::new(config.http_timeout).context("failed to build http transport")?;
        let client = SourceClient::new(Box::new(transport), RetryExecutor::new(config.retry));
        let cache = CacheManager::open(
            &documents_dir(cache_root),
            config.cache_ttl_days,
            Arc::new(SystemClock),
        );

        info!(
            cache_root = %cache_root.display(),
            source = %config.source_base_url,
            max_attempts = config.retry.max_attempts,
            "run context ready"
        );

        Ok(Self {
            config,
            cache_root: cache_root.to_path_buf(),
            client,
            cache,
        })
    }

    pub fn health_dir(&self) -> PathBuf {
        health_dir(&self.cache_root)
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.cache_root.join(DOWNLOADS_DIR)
    }

    pub fn records_dir(&self) -> PathBuf {
        self.cache_root.join(RECORDS_DIR)
    }

    pub fn batches_dir(&self) -> PathBuf {
        self.cache_root.join(BATCHES_DIR)
    }
}

/// Reads the last persisted health report and turns it into the advisory
/// attached to each record. A critical report switches retrieval to
/// degraded mode.
pub fn load_health_advisory(health_dir: &Path) -> Option<HealthAdvisory> {
    let Some(report) = read_latest_report(health_dir) else {
        info!(path = %health_dir.display(), "no health report on record");
        return None;
    };

    let advisory = HealthAdvisory {
        status: report.status.as_str().to_string(),
        checked_at: report.timestamp.clone(),
        degraded_mode: report.status == OverallStatus::Critical,
    };

    match report.status {
        OverallStatus::Healthy => info!(checked_at = %advisory.checked_at, "source healthy at last check"),
        status => warn!(
            status = status.as_str(),
            checked_at = %advisory.checked_at,
            degraded_mode = advisory.degraded_mode,
            errors = report.errors.len(),
            "source health advisory"
        ),
    }
    Some(advisory)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::health::{
        HealthReport, check_structure, classify_endpoint_response, latest_report_path,
        validate_document,
    };
    use crate::util::write_json_pretty;

    fn report_with(status: OverallStatus) -> HealthReport {
        HealthReport {
            timestamp: "2026-03-01T12:00:00Z".to_string(),
            status,
            structure: check_structure("<html><body></body></html>"),
            endpoint: classify_endpoint_response("ERROR", Duration::from_millis(40)),
            document: validate_document(b"", 1024),
            baseline_bootstrapped: false,
            changes: Vec::new(),
            errors: vec!["verFolleto missing".to_string()],
            warnings: Vec::new(),
            recommendations: Vec::new(),
        }
    }

    #[test]
    fn critical_report_turns_on_degraded_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_json_pretty(
            &latest_report_path(dir.path()),
            &report_with(OverallStatus::Critical),
        )
        .expect("write report");

        let advisory = load_health_advisory(dir.path()).expect("advisory");
        assert_eq!(advisory.status, "critical");
        assert!(advisory.degraded_mode);
    }

    #[test]
    fn warning_report_is_advisory_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_json_pretty(
            &latest_report_path(dir.path()),
            &report_with(OverallStatus::Warning),
        )
        .expect("write report");

        let advisory = load_health_advisory(dir.path()).expect("advisory");
        assert!(!advisory.degraded_mode);
        assert!(load_health_advisory(&dir.path().join("missing")).is_none());
    }
}
