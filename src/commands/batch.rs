use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::cli::BatchArgs;
use crate::commands::context::{RunContext, load_health_advisory};
use crate::commands::process::{FundProcessor, record_path};
use crate::model::FundRecord;
use crate::retriever::ChromeLauncher;
use crate::util::{now_utc_string, utc_compact_string, write_json_atomic, write_json_pretty};

pub const CHECKPOINT_EVERY: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundRequest {
    pub query: String,
    pub series_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub started_at: String,
    pub finished_at: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_secs: f64,
    pub failures_by_kind: BTreeMap<String, usize>,
}

impl BatchSummary {
    pub fn from_records(
        records: &[FundRecord],
        started_at: String,
        elapsed: Duration,
    ) -> Self {
        let mut failures_by_kind = BTreeMap::new();
        for error in records.iter().filter_map(|record| record.error.as_ref()) {
            *failures_by_kind.entry(error.kind.clone()).or_insert(0) += 1;
        }
        let failed = failures_by_kind.values().sum();

        Self {
            started_at,
            finished_at: now_utc_string(),
            total: records.len(),
            succeeded: records.len() - failed,
            failed,
            elapsed_secs: elapsed.as_secs_f64(),
            failures_by_kind,
        }
    }
}

#[derive(Debug, Serialize)]
struct BatchOutput<'r> {
    summary: &'r BatchSummary,
    records: &'r [FundRecord],
}

#[derive(Debug, Serialize)]
struct Checkpoint<'r> {
    saved_at: String,
    completed: usize,
    total: usize,
    records: &'r [FundRecord],
}

#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub delay: Duration,
    pub checkpoint_every: usize,
    pub checkpoint_path: PathBuf,
}

/// Longest accepted pause between funds.
pub const MAX_DELAY_SECS: f64 = 3600.0;

pub fn inter_fund_delay(secs: f64) -> Result<Duration> {
    if !(0.0..=MAX_DELAY_SECS).contains(&secs) {
        bail!("--delay-secs must be between 0 and {MAX_DELAY_SECS}, got {secs}");
    }
    Ok(Duration::from_secs_f64(secs))
}

pub fn run(args: BatchArgs) -> Result<()> {
    let mut requests = match &args.funds_file {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            parse_fund_list(&raw)
        }
        None => Vec::new(),
    };
    requests.extend(args.funds.iter().map(|query| FundRequest {
        query: query.clone(),
        series_code: None,
    }));
    if requests.is_empty() {
        bail!("no funds to process; pass --fund or --funds-file");
    }

    let context = RunContext::open(&args.cache_root)?;
    context.cache.sweep_expired();
    let advisory = load_health_advisory(&context.health_dir());
    let browser = ChromeLauncher;
    let processor = FundProcessor::from_context(&context, &browser, advisory);

    let started_at = now_utc_string();
    let stamp = utc_compact_string(Utc::now());
    let batches_dir = context.batches_dir();
    let records_dir = context.records_dir();
    let plan = BatchPlan {
        delay: inter_fund_delay(args.delay_secs)?,
        checkpoint_every: CHECKPOINT_EVERY,
        checkpoint_path: batches_dir.join(format!("batch_{stamp}_checkpoint.json")),
    };

    info!(funds = requests.len(), delay_secs = args.delay_secs, "starting batch");
    let clock = Instant::now();
    let records = run_batch(
        &requests,
        &plan,
        |request| {
            let record = processor.process(&request.query, request.series_code.as_deref());
            save_record(&records_dir, &record);
            record
        },
        std::thread::sleep,
    )?;

    let summary = BatchSummary::from_records(&records, started_at, clock.elapsed());
    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| batches_dir.join(format!("batch_{stamp}.json")));
    write_json_pretty(
        &output_path,
        &BatchOutput {
            summary: &summary,
            records: &records,
        },
    )?;

    context.cache.log_statistics();
    info!(
        total = summary.total,
        succeeded = summary.succeeded,
        failed = summary.failed,
        elapsed_secs = %format!("{:.1}", summary.elapsed_secs),
        output = %output_path.display(),
        "batch finished"
    );
    Ok(())
}

/// One fund per line, optionally `query | series`. Blank lines and `#`
/// comments are skipped.
pub fn parse_fund_list(raw: &str) -> Vec<FundRequest> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| match line.split_once('|') {
            Some((query, series)) => FundRequest {
                query: query.trim().to_string(),
                series_code: Some(series.trim().to_string()).filter(|series| !series.is_empty()),
            },
            None => FundRequest {
                query: line.to_string(),
                series_code: None,
            },
        })
        .filter(|request| !request.query.is_empty())
        .collect()
}

/// Processes every request in order, sleeping `plan.delay` between funds and
/// writing a checkpoint after every `plan.checkpoint_every` records.
pub fn run_batch<P, S>(
    requests: &[FundRequest],
    plan: &BatchPlan,
    mut process: P,
    mut sleep: S,
) -> Result<Vec<FundRecord>>
where
    P: FnMut(&FundRequest) -> FundRecord,
    S: FnMut(Duration),
{
    let total = requests.len();
    let mut records = Vec::with_capacity(total);

    for (index, request) in requests.iter().enumerate() {
        if index > 0 && !plan.delay.is_zero() {
            sleep(plan.delay);
        }
        info!(position = index + 1, total, query = %request.query, "processing fund");
        records.push(process(request));

        if plan.checkpoint_every > 0 && records.len() % plan.checkpoint_every == 0 {
            write_json_atomic(
                &plan.checkpoint_path,
                &Checkpoint {
                    saved_at: now_utc_string(),
                    completed: records.len(),
                    total,
                    records: &records,
                },
            )?;
            info!(completed = records.len(), total, path = %plan.checkpoint_path.display(), "checkpoint saved");
        }
    }

    Ok(records)
}

fn save_record(records_dir: &Path, record: &FundRecord) {
    let path = record_path(records_dir, &record.fund_query);
    if let Err(error) = write_json_pretty(&path, record) {
        warn!(path = %path.display(), error = %format!("{error:#}"), "failed to write fund record");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RecordError;

    fn record_for(request: &FundRequest) -> FundRecord {
        let mut record = FundRecord::new(&request.query, "2026-03-01T12:00:00Z".to_string());
        if request.query.starts_with("missing") {
            record.error = Some(RecordError {
                kind: "not_found".to_string(),
                message: "no fund matched".to_string(),
            });
        }
        record
    }

    #[test]
    fn fund_list_accepts_comments_and_series() {
        let requests = parse_fund_list("# funds\nFondo Renta | B\n\n8638-K\n  | A\n");
        assert_eq!(
            requests,
            vec![
                FundRequest {
                    query: "Fondo Renta".to_string(),
                    series_code: Some("B".to_string()),
                },
                FundRequest {
                    query: "8638-K".to_string(),
                    series_code: None,
                },
            ]
        );
    }

    #[test]
    fn delay_must_be_finite_and_bounded() {
        assert_eq!(inter_fund_delay(2.0).expect("default"), Duration::from_secs(2));
        assert_eq!(inter_fund_delay(0.0).expect("no pause"), Duration::ZERO);
        for bad in [f64::INFINITY, f64::NAN, -1.0, MAX_DELAY_SECS + 1.0] {
            assert!(inter_fund_delay(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn batch_sleeps_between_funds_and_checkpoints() {
        let dir = tempfile::tempdir().expect("tempdir");
        let requests = (0..23)
            .map(|index| FundRequest {
                query: if index % 5 == 0 {
                    format!("missing {index}")
                } else {
                    format!("fund {index}")
                },
                series_code: None,
            })
            .collect::<Vec<_>>();
        let plan = BatchPlan {
            delay: Duration::from_millis(250),
            checkpoint_every: CHECKPOINT_EVERY,
            checkpoint_path: dir.path().join("checkpoint.json"),
        };
        let mut sleeps = Vec::new();

        let records =
            run_batch(&requests, &plan, record_for, |delay| sleeps.push(delay)).expect("batch");

        assert_eq!(records.len(), 23);
        assert_eq!(sleeps.len(), 22);
        assert!(sleeps.iter().all(|delay| *delay == Duration::from_millis(250)));

        let checkpoint: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(&plan.checkpoint_path).expect("checkpoint written"),
        )
        .expect("checkpoint json");
        assert_eq!(checkpoint["completed"], 20);
        assert_eq!(checkpoint["total"], 23);

        let summary =
            BatchSummary::from_records(&records, "start".to_string(), Duration::from_secs(3));
        assert_eq!(summary.failed, 5);
        assert_eq!(summary.succeeded, 18);
        assert_eq!(summary.failures_by_kind.get("not_found"), Some(&5));
    }
}
