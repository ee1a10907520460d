use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info, warn};

use super::{
    CheckStatus, DocumentReport, EndpointReport, HealthReport, HealthSnapshot, OverallStatus,
    StructureReport, baseline, probes,
};
use crate::config::HealthFixture;
use crate::net::SourceClient;
use crate::retriever::{
    DOCUMENT_ENDPOINT_CANDIDATES, resolution_form, resolution_request, resolve_entity_page,
    viewer_url,
};
use crate::util::{ensure_directory, utc_compact_string, write_json_atomic, write_json_pretty};

const BASELINE_FILE_NAME: &str = "baseline.json";
const LATEST_FILE_NAME: &str = "latest.json";
const ALERTS_FILE_NAME: &str = "alerts.log";
const REPORTS_DIR_NAME: &str = "reports";

pub fn latest_report_path(health_dir: &Path) -> PathBuf {
    health_dir.join(LATEST_FILE_NAME)
}

/// Most recent persisted report, if one exists and parses.
pub fn read_latest_report(health_dir: &Path) -> Option<HealthReport> {
    let path = latest_report_path(health_dir);
    let raw = fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(report) => Some(report),
        Err(error) => {
            warn!(path = %path.display(), error = %error, "ignoring unreadable health report");
            None
        }
    }
}

pub fn recommendations_for(status: OverallStatus) -> Vec<String> {
    let lines: &[&str] = match status {
        OverallStatus::Critical => &[
            "Immediate action required: document retrieval is likely broken.",
            "Open the fixture fund's disclosures page in a browser and verify the document link manually.",
            "Contact the maintainers with the latest health report attached.",
        ],
        OverallStatus::Warning => &[
            "Monitor closely: the source changed or responded slowly.",
            "Review the alert log for the specific warnings.",
        ],
        OverallStatus::Error => &[
            "Health probes could not reach the source; check connectivity and rerun.",
        ],
        OverallStatus::Healthy => &[
            "Document retrieval is working correctly.",
            "Continue regular monitoring.",
        ],
    };
    lines.iter().map(|line| line.to_string()).collect()
}

pub struct HealthMonitor<'a> {
    client: &'a SourceClient,
    base_url: String,
    fixture: HealthFixture,
    health_dir: PathBuf,
    document_floor: u64,
}

impl<'a> HealthMonitor<'a> {
    pub fn new(
        client: &'a SourceClient,
        base_url: &str,
        fixture: HealthFixture,
        health_dir: PathBuf,
    ) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
            fixture,
            health_dir,
            document_floor: probes::DOCUMENT_SIZE_FLOOR,
        }
    }

    pub fn with_document_floor(mut self, floor: u64) -> Self {
        self.document_floor = floor;
        self
    }

    pub fn health_dir(&self) -> &Path {
        &self.health_dir
    }

    /// Runs all three probes, compares against the stored baseline, and
    /// persists the report. Probe failures land in the report; only
    /// persistence failures are returned as errors.
    pub fn run_health_check(&self, refresh_baseline: bool) -> Result<HealthReport> {
        ensure_directory(&self.health_dir)?;
        let now = Utc::now();
        let timestamp = now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

        let (structure, page_url) = self.probe_structure();
        let endpoint = self.probe_endpoint(&page_url);
        let document = self.probe_document(endpoint.document_path.as_deref());

        let mut baseline_bootstrapped = false;
        let mut changes = Vec::new();
        if structure.html_hash.is_some() {
            let baseline_path = self.health_dir.join(BASELINE_FILE_NAME);
            let current = HealthSnapshot::from_structure(&timestamp, &structure);
            match baseline::load_baseline(&baseline_path) {
                Ok(Some(stored)) if !refresh_baseline => {
                    changes = baseline::compare_with_baseline(&stored, &current);
                }
                Ok(_) => {
                    baseline::save_baseline(&baseline_path, &current)?;
                    baseline_bootstrapped = true;
                    info!(path = %baseline_path.display(), "health baseline recorded");
                }
                Err(error) => {
                    warn!(error = %format!("{error:#}"), "baseline unreadable, replacing it");
                    baseline::save_baseline(&baseline_path, &current)?;
                    baseline_bootstrapped = true;
                }
            }
        }

        let status = OverallStatus::from_statuses(
            [structure.status, endpoint.status, document.status]
                .into_iter()
                .chain(changes.iter().map(|change| change.severity)),
        );

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        for (probe, probe_errors, probe_warnings) in [
            ("structure", &structure.errors, &structure.warnings),
            ("endpoint", &endpoint.errors, &endpoint.warnings),
            ("document", &document.errors, &document.warnings),
        ] {
            errors.extend(probe_errors.iter().map(|message| format!("{probe}: {message}")));
            warnings.extend(probe_warnings.iter().map(|message| format!("{probe}: {message}")));
        }
        for change in &changes {
            match change.severity {
                CheckStatus::Critical => errors.push(format!("baseline: {}", change.message)),
                CheckStatus::Warning => warnings.push(format!("baseline: {}", change.message)),
                _ => {}
            }
        }

        let report = HealthReport {
            timestamp,
            status,
            structure,
            endpoint,
            document,
            baseline_bootstrapped,
            changes,
            errors,
            warnings,
            recommendations: recommendations_for(status),
        };

        let report_path = self
            .health_dir
            .join(REPORTS_DIR_NAME)
            .join(format!("health_{}.json", utc_compact_string(now)));
        write_json_pretty(&report_path, &report)?;
        write_json_atomic(&latest_report_path(&self.health_dir), &report)?;
        self.append_alerts(&report)?;

        match status {
            OverallStatus::Healthy => info!(report = %report_path.display(), "source healthy"),
            OverallStatus::Critical => error!(
                report = %report_path.display(),
                errors = report.errors.len(),
                "source health critical"
            ),
            _ => warn!(
                report = %report_path.display(),
                status = status.as_str(),
                warnings = report.warnings.len(),
                "source health degraded"
            ),
        }

        Ok(report)
    }

    fn probe_structure(&self) -> (StructureReport, String) {
        let page_url =
            match resolve_entity_page(self.client, &self.base_url, &self.fixture.registry_id) {
                Ok(url) => url,
                Err(error) => {
                    return (
                        unavailable_structure(format!("entity page unavailable: {error}")),
                        crate::retriever::direct_entity_url(
                            &self.base_url,
                            &self.fixture.registry_id,
                            crate::retriever::DISCLOSURES_TAB,
                        ),
                    );
                }
            };

        let report = match self.client.get("health structure probe", &page_url) {
            Ok(response) if response.is_success() => {
                let mut report = probes::check_structure(&response.text());
                report.url = Some(page_url.clone());
                report
            }
            Ok(response) => unavailable_structure(format!(
                "disclosures page returned HTTP {}",
                response.status
            )),
            Err(error) => unavailable_structure(format!("disclosures page unavailable: {error}")),
        };
        (report, page_url)
    }

    fn probe_endpoint(&self, referer: &str) -> EndpointReport {
        let fixture = &self.fixture;
        let form = resolution_form(
            &fixture.check_digit_id,
            &fixture.series_code,
            &fixture.administrator_id,
        );

        let mut failures = Vec::new();
        let mut fallback = None;
        for endpoint in DOCUMENT_ENDPOINT_CANDIDATES {
            let request = resolution_request(&self.base_url, endpoint, &form, referer);
            let response = match self.client.send("health endpoint probe", &request) {
                Ok(response) => response,
                Err(error) => {
                    failures.push(format!("{endpoint}: {error}"));
                    continue;
                }
            };
            if !response.is_success() {
                failures.push(format!("{endpoint}: HTTP {}", response.status));
                continue;
            }

            let mut report = probes::classify_endpoint_response(&response.text(), response.elapsed);
            report.endpoint = Some(endpoint.to_string());
            if report.document_path.is_some() || report.status == CheckStatus::Critical {
                if !failures.is_empty() {
                    report.warnings.extend(
                        failures
                            .iter()
                            .map(|failure| format!("earlier endpoint failed: {failure}")),
                    );
                    report.status = report.status.worst(CheckStatus::Warning);
                }
                return report;
            }
            fallback.get_or_insert(report);
        }

        match fallback {
            Some(mut report) => {
                report.warnings.extend(failures);
                report
            }
            None => EndpointReport {
                status: CheckStatus::Error,
                endpoint: None,
                response_preview: None,
                document_path: None,
                latency_ms: None,
                errors: failures,
                warnings: Vec::new(),
            },
        }
    }

    fn probe_document(&self, path: Option<&str>) -> DocumentReport {
        let Some(path) = path else {
            return DocumentReport {
                status: CheckStatus::Error,
                url: None,
                size_bytes: None,
                errors: vec!["no document path to fetch".to_string()],
                warnings: Vec::new(),
            };
        };

        let url = viewer_url(&self.base_url, path);
        let mut report = match self.client.get("health document probe", &url) {
            Ok(response) if response.is_success() => {
                probes::validate_document(&response.body, self.document_floor)
            }
            Ok(response) => DocumentReport {
                status: CheckStatus::Critical,
                url: None,
                size_bytes: None,
                errors: vec![format!("document viewer returned HTTP {}", response.status)],
                warnings: Vec::new(),
            },
            Err(error) => DocumentReport {
                status: CheckStatus::Error,
                url: None,
                size_bytes: None,
                errors: vec![format!("document download failed: {error}")],
                warnings: Vec::new(),
            },
        };
        report.url = Some(url);
        report
    }

    /// Appends one `timestamp | LEVEL | message` line per error and warning.
    fn append_alerts(&self, report: &HealthReport) -> Result<()> {
        if report.errors.is_empty() && report.warnings.is_empty() {
            return Ok(());
        }

        let path = self.health_dir.join(ALERTS_FILE_NAME);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open alert log {}", path.display()))?;

        let lines = report
            .errors
            .iter()
            .map(|message| ("CRITICAL", message))
            .chain(report.warnings.iter().map(|message| ("WARNING", message)));
        for (level, message) in lines {
            writeln!(file, "{} | {level} | {message}", report.timestamp)
                .with_context(|| format!("failed to append to {}", path.display()))?;
        }
        Ok(())
    }
}

fn unavailable_structure(message: String) -> StructureReport {
    StructureReport {
        status: CheckStatus::Error,
        url: None,
        checks: BTreeMap::new(),
        html_hash: None,
        action_element_count: 0,
        errors: vec![message],
        warnings: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Method;
    use crate::net::fake::{ScriptedTransport, client_with};

    const BASE: &str = "https://cmf.test";

    const FIXTURE_PAGE: &str = r#"<html><head><script>
        function verFolleto(runFondo, serie, rutAdmin) {
            $.post('/603/ver_folleto_fm.php', {pestania: 68, run_fondo: runFondo, serie: serie, rut_admin: rutAdmin});
        }
        </script></head><body>
        <p>Folletos Informativos de Series VIGENTES</p>
        <table>
          <tr><td>A</td><td>01/02/2026</td><td><img src="doc.gif" onclick="verFolleto('76.113.534-5','A','8052')"></td><td>pdf</td></tr>
        </table></body></html>"#;

    const PDF: &[u8] = b"%PDF-1.7 fixture prospectus";

    fn fixture() -> HealthFixture {
        HealthFixture {
            registry_id: "8052".to_string(),
            check_digit_id: "76.113.534-5".to_string(),
            series_code: "A".to_string(),
            administrator_id: "8052".to_string(),
        }
    }

    fn site(page: &str) -> ScriptedTransport {
        ScriptedTransport::new()
            .route(Method::Get, "consulta.php", 200, b"<html></html>")
            .route(Method::Get, "entidad.php", 200, page.as_bytes())
            .route(Method::Post, "/603/ver_folleto_fm.php", 200, b"/docs/fixture.pdf")
            .route(Method::Get, "/docs/fixture.pdf", 200, PDF)
    }

    #[test]
    fn healthy_source_bootstraps_baseline() {
        let dir = tempfile::tempdir().expect("tempdir");
        let client = client_with(site(FIXTURE_PAGE));
        let monitor = HealthMonitor::new(&client, BASE, fixture(), dir.path().join("health"))
            .with_document_floor(8);

        let report = monitor.run_health_check(false).expect("report");

        assert_eq!(report.status, OverallStatus::Healthy, "{:?}", report.errors);
        assert!(report.baseline_bootstrapped);
        assert_eq!(report.endpoint.endpoint.as_deref(), Some("/603/ver_folleto_fm.php"));
        assert_eq!(report.document.size_bytes, Some(PDF.len() as u64));
        assert!(monitor.health_dir().join("baseline.json").exists());
        assert!(!monitor.health_dir().join("alerts.log").exists());
        assert_eq!(
            read_latest_report(monitor.health_dir()).map(|latest| latest.status),
            Some(OverallStatus::Healthy)
        );
    }

    #[test]
    fn missing_action_is_critical_and_alerted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let health_dir = dir.path().join("health");
        let healthy = client_with(site(FIXTURE_PAGE));
        HealthMonitor::new(&healthy, BASE, fixture(), health_dir.clone())
            .with_document_floor(8)
            .run_health_check(false)
            .expect("baseline run");

        let broken_page = FIXTURE_PAGE.replace("verFolleto", "abrirDocumento");
        let broken = client_with(site(&broken_page));
        let report = HealthMonitor::new(&broken, BASE, fixture(), health_dir.clone())
            .with_document_floor(8)
            .run_health_check(false)
            .expect("report");

        assert_eq!(report.status, OverallStatus::Critical);
        assert!(!report.baseline_bootstrapped);
        assert!(
            report
                .errors
                .iter()
                .any(|error| error.contains("client-side action verFolleto not found"))
        );
        assert!(
            report
                .changes
                .iter()
                .any(|change| change.check == "javascript_function"
                    && change.severity == CheckStatus::Critical)
        );
        assert!(report.recommendations[0].starts_with("Immediate action required"));

        let alerts = fs::read_to_string(health_dir.join("alerts.log")).expect("alert log");
        assert!(alerts.lines().any(|line| line.contains(" | CRITICAL | ")));
        let reports = fs::read_dir(health_dir.join("reports")).expect("reports").count();
        assert!(reports >= 1);
    }

    #[test]
    fn unreachable_source_reports_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let client = client_with(ScriptedTransport::new());
        let monitor = HealthMonitor::new(&client, BASE, fixture(), dir.path().join("health"));

        let report = monitor.run_health_check(false).expect("report");

        assert_eq!(report.status, OverallStatus::Error);
        assert_eq!(report.structure.status, CheckStatus::Error);
        assert_eq!(report.document.status, CheckStatus::Error);
        assert!(!monitor.health_dir().join("baseline.json").exists());
    }
}
