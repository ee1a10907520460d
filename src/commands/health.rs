use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::cli::HealthArgs;
use crate::commands::context::health_dir;
use crate::config::Config;
use crate::health::HealthMonitor;
use crate::net::{ReqwestTransport, RetryExecutor, RetryPolicy, SourceClient};

pub fn run(args: HealthArgs) -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    let transport =
        ReqwestTransport::new(config.http_timeout).context("failed to build http transport")?;
    // Probes measure single requests.
    let retry = RetryExecutor::with_sleeper(
        RetryPolicy {
            max_attempts: 1,
            backoff_base: config.retry.backoff_base,
        },
        Arc::new(std::thread::sleep),
    );
    let client = SourceClient::new(Box::new(transport), retry);

    let monitor = HealthMonitor::new(
        &client,
        &config.source_base_url,
        config.health_fixture.clone(),
        health_dir(&args.cache_root),
    )
    .with_document_floor(args.document_floor_bytes);
    let report = monitor.run_health_check(args.refresh_baseline)?;

    info!(
        status = report.status.as_str(),
        errors = report.errors.len(),
        warnings = report.warnings.len(),
        changes = report.changes.len(),
        baseline_bootstrapped = report.baseline_bootstrapped,
        "health check finished"
    );
    for recommendation in &report.recommendations {
        info!(recommendation = %recommendation, "recommendation");
    }
    Ok(())
}
