mod baseline;
mod monitor;
mod probes;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use baseline::{compare_with_baseline, load_baseline, save_baseline};
pub use monitor::{HealthMonitor, latest_report_path, read_latest_report, recommendations_for};
pub use probes::{
    DOCUMENT_SIZE_FLOOR, LATENCY_WARNING_MS, check_structure, classify_endpoint_response,
    validate_document,
};

/// Outcome of a single check. `Error` means the probe itself could not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warning,
    Critical,
    Error,
}

impl CheckStatus {
    /// Precedence when folding statuses: critical, then warning, then error.
    fn rank(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Error => 1,
            Self::Warning => 2,
            Self::Critical => 3,
        }
    }

    pub fn worst(self, other: Self) -> Self {
        if other.rank() > self.rank() { other } else { self }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Warning,
    Critical,
    Error,
}

impl OverallStatus {
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = CheckStatus>,
    {
        match statuses.into_iter().fold(CheckStatus::Ok, CheckStatus::worst) {
            CheckStatus::Ok => Self::Healthy,
            CheckStatus::Warning => Self::Warning,
            CheckStatus::Critical => Self::Critical,
            CheckStatus::Error => Self::Error,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureReport {
    pub status: CheckStatus,
    pub url: Option<String>,
    pub checks: BTreeMap<String, CheckResult>,
    pub html_hash: Option<String>,
    pub action_element_count: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointReport {
    pub status: CheckStatus,
    pub endpoint: Option<String>,
    pub response_preview: Option<String>,
    pub document_path: Option<String>,
    pub latency_ms: Option<u64>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentReport {
    pub status: CheckStatus,
    pub url: Option<String>,
    pub size_bytes: Option<u64>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Structural facts kept between runs to detect drift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub taken_at: String,
    pub html_hash: Option<String>,
    pub action_element_count: usize,
    pub checks: BTreeMap<String, CheckStatus>,
}

impl HealthSnapshot {
    pub fn from_structure(taken_at: &str, structure: &StructureReport) -> Self {
        Self {
            taken_at: taken_at.to_string(),
            html_hash: structure.html_hash.clone(),
            action_element_count: structure.action_element_count,
            checks: structure
                .checks
                .iter()
                .map(|(name, result)| (name.clone(), result.status))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineChange {
    pub check: String,
    pub severity: CheckStatus,
    pub previous: String,
    pub current: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub timestamp: String,
    pub status: OverallStatus,
    pub structure: StructureReport,
    pub endpoint: EndpointReport,
    pub document: DocumentReport,
    pub baseline_bootstrapped: bool,
    pub changes: Vec<BaselineChange>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_status_prefers_critical_then_warning_then_error() {
        use CheckStatus::*;
        assert_eq!(OverallStatus::from_statuses([Ok, Ok]), OverallStatus::Healthy);
        assert_eq!(OverallStatus::from_statuses([Ok, Error]), OverallStatus::Error);
        assert_eq!(OverallStatus::from_statuses([Error, Warning]), OverallStatus::Warning);
        assert_eq!(
            OverallStatus::from_statuses([Warning, Critical, Error]),
            OverallStatus::Critical
        );
    }
}
