use std::collections::BTreeMap;
use std::time::Duration;

use super::{CheckResult, CheckStatus, DocumentReport, EndpointReport, StructureReport};
use crate::retriever::{
    ACTION_FUNCTION, ResolutionBody, classify_resolution_body, count_action_elements,
    has_pdf_signature, has_series_table, parse_action_invocations,
};
use crate::util::sha256_hex;

pub const LATENCY_WARNING_MS: u64 = 5_000;
/// Real prospectuses are well above this; smaller payloads are suspicious.
pub const DOCUMENT_SIZE_FLOOR: u64 = 100 * 1024;

const ENDPOINT_NAME: &str = "ver_folleto_fm.php";
const PARAMETER_TOKENS: [(&str, [&str; 2]); 3] = [
    ("run_fondo", ["runFondo", "run_fondo"]),
    ("serie", ["serie", "serie"]),
    ("rut_admin", ["rutAdmin", "rut_admin"]),
];

fn check(status: CheckStatus, detail: impl Into<String>) -> CheckResult {
    CheckResult {
        status,
        detail: detail.into(),
        count: None,
    }
}

/// Structural assumptions the retriever makes about the disclosures page.
pub fn check_structure(html: &str) -> StructureReport {
    let mut checks = BTreeMap::new();
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if html.contains(ACTION_FUNCTION) {
        checks.insert(
            "javascript_function".to_string(),
            check(CheckStatus::Ok, format!("{ACTION_FUNCTION} present")),
        );
    } else {
        let message = format!("client-side action {ACTION_FUNCTION} not found in page");
        checks.insert(
            "javascript_function".to_string(),
            check(CheckStatus::Critical, message.clone()),
        );
        errors.push(message);
    }

    let element_count = count_action_elements(html);
    let wired = parse_action_invocations(html).len();
    let onclick = if element_count == 0 {
        let message = format!("no element wired to {ACTION_FUNCTION}");
        errors.push(message.clone());
        check(CheckStatus::Critical, message)
    } else if wired == 0 {
        let message = format!(
            "{element_count} elements call {ACTION_FUNCTION} but none pass the three expected arguments"
        );
        warnings.push(message.clone());
        check(CheckStatus::Warning, message)
    } else {
        check(
            CheckStatus::Ok,
            format!("{element_count} wired elements, {wired} distinct series"),
        )
    };
    checks.insert(
        "onclick_attributes".to_string(),
        CheckResult {
            count: Some(element_count),
            ..onclick
        },
    );

    if html.contains(ENDPOINT_NAME) {
        checks.insert(
            "endpoint_reference".to_string(),
            check(CheckStatus::Ok, format!("{ENDPOINT_NAME} referenced")),
        );
    } else {
        let message = format!("document endpoint {ENDPOINT_NAME} not referenced in page");
        errors.push(message.clone());
        checks.insert(
            "endpoint_reference".to_string(),
            check(CheckStatus::Critical, message),
        );
    }

    let missing = PARAMETER_TOKENS
        .iter()
        .filter(|(_, spellings)| !spellings.iter().any(|token| html.contains(token)))
        .map(|(name, _)| *name)
        .collect::<Vec<_>>();
    let found = PARAMETER_TOKENS.len() - missing.len();
    let parameters = match found {
        0 => {
            let message = "none of the expected request parameters appear in page".to_string();
            errors.push(message.clone());
            check(CheckStatus::Critical, message)
        }
        n if n < PARAMETER_TOKENS.len() => {
            let message = format!("missing request parameters: {}", missing.join(", "));
            warnings.push(message.clone());
            check(CheckStatus::Warning, message)
        }
        _ => check(CheckStatus::Ok, "all request parameters present"),
    };
    checks.insert(
        "expected_parameters".to_string(),
        CheckResult {
            count: Some(found),
            ..parameters
        },
    );

    if has_series_table(html) {
        checks.insert(
            "series_table".to_string(),
            check(CheckStatus::Ok, "disclosure table present"),
        );
    } else {
        let message = "disclosure series table not found".to_string();
        warnings.push(message.clone());
        checks.insert(
            "series_table".to_string(),
            check(CheckStatus::Warning, message),
        );
    }

    let status = checks
        .values()
        .map(|result| result.status)
        .fold(CheckStatus::Ok, CheckStatus::worst);

    StructureReport {
        status,
        url: None,
        checks,
        html_hash: Some(sha256_hex(html.as_bytes())),
        action_element_count: element_count,
        errors,
        warnings,
    }
}

pub fn classify_endpoint_response(body: &str, latency: Duration) -> EndpointReport {
    let latency_ms = latency.as_millis() as u64;
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut document_path = None;

    let mut status = match classify_resolution_body(body) {
        ResolutionBody::ErrorMarker => {
            errors.push("endpoint answered ERROR for the fixture fund".to_string());
            CheckStatus::Critical
        }
        ResolutionBody::Path(path) => {
            document_path = Some(path);
            CheckStatus::Ok
        }
        ResolutionBody::Html => {
            warnings.push("endpoint answered with an HTML page".to_string());
            CheckStatus::Warning
        }
        ResolutionBody::Empty => {
            warnings.push("endpoint answered with an empty body".to_string());
            CheckStatus::Warning
        }
        ResolutionBody::Unrecognized(preview) => {
            warnings.push(format!("unexpected endpoint response: {preview}"));
            CheckStatus::Warning
        }
    };

    if latency_ms > LATENCY_WARNING_MS {
        warnings.push(format!("endpoint latency {latency_ms} ms above {LATENCY_WARNING_MS} ms"));
        status = status.worst(CheckStatus::Warning);
    }

    EndpointReport {
        status,
        endpoint: None,
        response_preview: Some(body.trim().chars().take(200).collect()),
        document_path,
        latency_ms: Some(latency_ms),
        errors,
        warnings,
    }
}

pub fn validate_document(bytes: &[u8], size_floor: u64) -> DocumentReport {
    let size = bytes.len() as u64;
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let status = if !has_pdf_signature(bytes) {
        let head = String::from_utf8_lossy(&bytes[..bytes.len().min(16)]).into_owned();
        errors.push(format!("payload does not start with %PDF (starts with {head:?})"));
        CheckStatus::Critical
    } else if size < size_floor {
        warnings.push(format!("document is only {size} bytes, below {size_floor}"));
        CheckStatus::Warning
    } else {
        CheckStatus::Ok
    };

    DocumentReport {
        status,
        url: None,
        size_bytes: Some(size),
        errors,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEALTHY_PAGE: &str = r#"<html><head><script>
        function verFolleto(runFondo, serie, rutAdmin) {
            $.post('/603/ver_folleto_fm.php', {pestania: 68, run_fondo: runFondo, serie: serie, rut_admin: rutAdmin});
        }
        </script></head><body>
        <p>Folletos Informativos de Series VIGENTES</p>
        <table>
          <tr><td>A</td><td>01/02/2026</td><td><img src="doc.gif" onclick="verFolleto('76.113.534-5','A','8052')"></td><td>pdf</td></tr>
        </table></body></html>"#;

    #[test]
    fn healthy_page_passes_every_check() {
        let report = check_structure(HEALTHY_PAGE);
        assert_eq!(report.status, CheckStatus::Ok, "{:?}", report.checks);
        assert_eq!(report.action_element_count, 1);
        assert!(report.errors.is_empty());
        assert_eq!(report.checks["expected_parameters"].count, Some(3));
    }

    #[test]
    fn missing_action_name_is_critical() {
        let page = HEALTHY_PAGE.replace("verFolleto", "openDocument");
        let report = check_structure(&page);

        assert_eq!(report.status, CheckStatus::Critical);
        assert_eq!(
            report.checks["javascript_function"].status,
            CheckStatus::Critical
        );
        assert!(
            report
                .errors
                .iter()
                .any(|error| error.contains("client-side action verFolleto not found"))
        );
    }

    #[test]
    fn partial_parameters_and_missing_table_warn() {
        let page = HEALTHY_PAGE
            .replace("rutAdmin", "adminId")
            .replace("rut_admin", "admin")
            .replace("Folletos Informativos", "Documentos");
        let report = check_structure(&page);

        assert_eq!(report.checks["expected_parameters"].status, CheckStatus::Warning);
        assert_eq!(report.checks["series_table"].status, CheckStatus::Warning);
        assert_eq!(report.status, CheckStatus::Warning);
    }

    #[test]
    fn endpoint_responses_are_graded() {
        let fast = Duration::from_millis(120);
        assert_eq!(classify_endpoint_response("ERROR", fast).status, CheckStatus::Critical);
        let ok = classify_endpoint_response("/603/pages/folleto.php?x=1", fast);
        assert_eq!(ok.status, CheckStatus::Ok);
        assert_eq!(ok.document_path.as_deref(), Some("/603/pages/folleto.php?x=1"));
        assert_eq!(classify_endpoint_response("busy", fast).status, CheckStatus::Warning);

        let slow = classify_endpoint_response("/doc.pdf", Duration::from_millis(5_400));
        assert_eq!(slow.status, CheckStatus::Warning);
        assert_eq!(slow.warnings.len(), 1);
    }

    #[test]
    fn documents_need_signature_and_size() {
        assert_eq!(validate_document(b"<html>", 10).status, CheckStatus::Critical);
        assert_eq!(validate_document(b"%PDF-1.4 tiny", 1024).status, CheckStatus::Warning);
        assert_eq!(validate_document(b"%PDF-1.4 tiny", 4).status, CheckStatus::Ok);
    }
}
