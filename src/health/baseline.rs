use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use super::{BaselineChange, CheckStatus, HealthSnapshot};
use crate::util::write_json_atomic;

pub fn load_baseline(path: &Path) -> Result<Option<HealthSnapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read baseline {}", path.display()))?;
    let snapshot = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse baseline {}", path.display()))?;
    Ok(Some(snapshot))
}

pub fn save_baseline(path: &Path, snapshot: &HealthSnapshot) -> Result<()> {
    write_json_atomic(path, snapshot)
}

fn is_regression(previous: CheckStatus, current: CheckStatus) -> bool {
    previous.worst(current) == current && previous != current
}

/// Drift between a stored snapshot and the current one. Regressions carry the
/// severity of the new status; recoveries are informational.
pub fn compare_with_baseline(
    baseline: &HealthSnapshot,
    current: &HealthSnapshot,
) -> Vec<BaselineChange> {
    let mut changes = Vec::new();

    if baseline.html_hash != current.html_hash {
        changes.push(BaselineChange {
            check: "html_hash".to_string(),
            severity: CheckStatus::Warning,
            previous: baseline.html_hash.clone().unwrap_or_default(),
            current: current.html_hash.clone().unwrap_or_default(),
            message: "disclosures page content changed since baseline".to_string(),
        });
    }

    for (name, &status) in &current.checks {
        let Some(&previous) = baseline.checks.get(name) else {
            continue;
        };
        if previous == status {
            continue;
        }
        let severity = if !is_regression(previous, status) {
            CheckStatus::Ok
        } else if status == CheckStatus::Critical {
            CheckStatus::Critical
        } else {
            CheckStatus::Warning
        };
        changes.push(BaselineChange {
            check: name.clone(),
            severity,
            previous: previous.as_str().to_string(),
            current: status.as_str().to_string(),
            message: format!(
                "{name} moved from {} to {}",
                previous.as_str(),
                status.as_str()
            ),
        });
    }

    if baseline.action_element_count != current.action_element_count {
        changes.push(BaselineChange {
            check: "action_element_count".to_string(),
            severity: CheckStatus::Warning,
            previous: baseline.action_element_count.to_string(),
            current: current.action_element_count.to_string(),
            message: format!(
                "document action elements went from {} to {}",
                baseline.action_element_count, current.action_element_count
            ),
        });
    }

    changes
}
