use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::cache::{CacheManager, SystemClock};
use crate::cli::SweepArgs;
use crate::commands::context::documents_dir;
use crate::config::Config;

/// Drops expired cache entries and their blobs.
pub fn run(args: SweepArgs) -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    let cache = CacheManager::open(
        &documents_dir(&args.cache_root),
        config.cache_ttl_days,
        Arc::new(SystemClock),
    );

    let removed = cache.sweep_expired();
    let remaining = cache.entries()?.len();
    info!(removed, remaining, "sweep finished");
    Ok(())
}
