use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::cache::{CacheManager, SystemClock};
use crate::cli::StatusArgs;
use crate::commands::context::{documents_dir, health_dir};
use crate::config::Config;
use crate::health::{latest_report_path, read_latest_report};

pub fn run(args: StatusArgs) -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    info!(cache_root = %args.cache_root.display(), "status requested");

    let cache = CacheManager::open(
        &documents_dir(&args.cache_root),
        config.cache_ttl_days,
        Arc::new(SystemClock),
    );
    let mut entries = cache.entries()?;
    entries.sort_by(|left, right| right.downloaded_at.cmp(&left.downloaded_at));

    let now = Utc::now();
    let expired = entries.iter().filter(|entry| entry.is_expired_at(now)).count();
    let total_bytes: u64 = entries.iter().map(|entry| entry.size_bytes).sum();
    info!(
        entries = entries.len(),
        expired,
        cached_mb = %format!("{:.2}", total_bytes as f64 / (1024.0 * 1024.0)),
        "document cache"
    );

    if args.list {
        for entry in &entries {
            info!(
                key = %entry.key().index_key(),
                downloaded_at = %entry.downloaded_at.to_rfc3339(),
                expires_at = %entry.expires_at.to_rfc3339(),
                size_bytes = entry.size_bytes,
                expired = entry.is_expired_at(now),
                "cache entry"
            );
        }
    }

    let health_dir = health_dir(&args.cache_root);
    match read_latest_report(&health_dir) {
        Some(report) => info!(
            status = report.status.as_str(),
            checked_at = %report.timestamp,
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            "last health check"
        ),
        None => warn!(path = %latest_report_path(&health_dir).display(), "no health report found"),
    }

    Ok(())
}
