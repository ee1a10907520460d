use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::FundError;
use crate::net::{HttpRequest, SourceClient};

/// Tab value that selects the disclosures view on an entity page.
pub const DISCLOSURES_TAB: &str = "68";
pub const ERROR_MARKER: &str = "ERROR";
pub const PDF_SIGNATURE: &[u8] = b"%PDF";

/// Both resolution endpoints seen on the site. Neither is canonical, so they
/// are probed in order and the first one that answers is remembered.
pub const DOCUMENT_ENDPOINT_CANDIDATES: [&str; 2] =
    ["/603/ver_folleto_fm.php", "/603/pages/ver_folleto_fm.php"];

const LISTING_PATH: &str =
    "/institucional/mercados/consulta.php?mercado=V&Estado=VI&entidad=RGFMU";
const NOT_FOUND_MARKER: &str = "PAGE_NOT_FOUND";

static TAB_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"pestania=\d+").expect("valid tab parameter regex"));
static LINKS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("valid link selector"));

pub fn listing_url(base_url: &str) -> String {
    format!("{base_url}{LISTING_PATH}")
}

/// Token-less entity page URL used when the listing scan finds nothing.
pub fn direct_entity_url(base_url: &str, registry_id: &str, tab: &str) -> String {
    format!(
        "{base_url}/institucional/mercados/entidad.php?mercado=V&rut={registry_id}&tipoentidad=RGFMU&vig=VI&control=svs&pestania={tab}"
    )
}

pub fn with_tab(url: &str, tab: &str) -> String {
    if TAB_PARAM.is_match(url) {
        TAB_PARAM
            .replace(url, format!("pestania={tab}").as_str())
            .into_owned()
    } else if url.contains('?') {
        format!("{url}&pestania={tab}")
    } else {
        format!("{url}?pestania={tab}")
    }
}

/// Entity link from the fund listing page that carries the site's `row` token.
pub fn find_entity_link(listing_html: &str, base_url: &str, registry_id: &str) -> Option<String> {
    let document = Html::parse_document(listing_html);
    let needle = format!("rut={registry_id}");
    let base = Url::parse(&format!("{base_url}/institucional/mercados/")).ok()?;

    document
        .select(&LINKS)
        .filter_map(|link| link.value().attr("href"))
        .filter(|href| href.contains("entidad.php") && href.contains("row="))
        .find(|href| {
            href.split(['?', '&'])
                .any(|param| param == needle.as_str())
        })
        .and_then(|href| base.join(href).ok())
        .map(|url| url.to_string())
}

/// Resolves the disclosures-tab entity page for a fund, preferring the
/// listing link with the row token over the direct URL pattern.
pub fn resolve_entity_page(
    client: &SourceClient,
    base_url: &str,
    registry_id: &str,
) -> Result<String, FundError> {
    match client.get("fund listing", &listing_url(base_url)) {
        Ok(response) if response.is_success() => {
            if let Some(link) = find_entity_link(&response.text(), base_url, registry_id) {
                let url = with_tab(&link, DISCLOSURES_TAB);
                info!(registry_id, url = %url, "entity page found in listing");
                return Ok(url);
            }
            debug!(registry_id, "registry id not present in listing links");
        }
        Ok(response) => warn!(registry_id, status = response.status, "fund listing unavailable"),
        Err(error) => warn!(registry_id, error = %error, "fund listing unavailable"),
    }

    let direct = direct_entity_url(base_url, registry_id, DISCLOSURES_TAB);
    let response = client.get("entity page", &direct)?;
    if !response.is_success() || response.final_url.contains(NOT_FOUND_MARKER) {
        return Err(FundError::SourceUnavailable(format!(
            "no entity page for registry id {registry_id} (status {}, landed on {})",
            response.status, response.final_url
        )));
    }
    info!(registry_id, url = %direct, "using direct entity page url");
    Ok(direct)
}

/// What the resolution endpoint said about a document request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionBody {
    /// The literal error marker: the site has no document for these parameters.
    ErrorMarker,
    /// An HTML page: usually a missing or relocated endpoint.
    Html,
    Empty,
    /// Relative viewer path beginning with `/`.
    Path(String),
    Unrecognized(String),
}

pub fn classify_resolution_body(body: &str) -> ResolutionBody {
    let trimmed = body.trim();
    let lowered = trimmed.to_ascii_lowercase();
    if trimmed.is_empty() {
        ResolutionBody::Empty
    } else if trimmed == ERROR_MARKER {
        ResolutionBody::ErrorMarker
    } else if lowered.starts_with("<!doctype") || lowered.starts_with("<html") {
        ResolutionBody::Html
    } else if trimmed.starts_with('/') || trimmed.contains(".pdf") {
        ResolutionBody::Path(trimmed.to_string())
    } else {
        ResolutionBody::Unrecognized(trimmed.chars().take(120).collect())
    }
}

pub fn has_pdf_signature(bytes: &[u8]) -> bool {
    bytes.starts_with(PDF_SIGNATURE)
}

/// Form fields for the resolution endpoint.
pub fn resolution_form<'a>(
    fund_run: &'a str,
    series_code: &'a str,
    administrator_id: &'a str,
) -> [(&'static str, &'a str); 4] {
    [
        ("pestania", DISCLOSURES_TAB),
        ("run_fondo", fund_run),
        ("serie", series_code),
        ("rut_admin", administrator_id),
    ]
}

pub fn resolution_request(
    base_url: &str,
    endpoint: &str,
    form: &[(&str, &str)],
    referer: &str,
) -> HttpRequest {
    HttpRequest::post_form(format!("{base_url}{endpoint}"), form).with_referer(referer)
}

pub fn viewer_url(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        path.to_string()
    } else if path.starts_with('/') {
        format!("{base_url}{path}")
    } else {
        format!("{base_url}/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tab_parameter_is_replaced_or_appended() {
        assert_eq!(
            with_tab("https://h/entidad.php?rut=1&pestania=1", "68"),
            "https://h/entidad.php?rut=1&pestania=68"
        );
        assert_eq!(with_tab("https://h/entidad.php?rut=1", "68"), "https://h/entidad.php?rut=1&pestania=68");
        assert_eq!(with_tab("https://h/entidad.php", "68"), "https://h/entidad.php?pestania=68");
    }

    #[test]
    fn listing_link_requires_exact_registry_id_and_row_token() {
        let listing = r#"
            <a href="entidad.php?mercado=V&rut=86381&row=AAA&pestania=1">Other</a>
            <a href="entidad.php?mercado=V&rut=8638">No token</a>
            <a href="entidad.php?mercado=V&rut=8638&row=XYZ&pestania=1">Target</a>
        "#;
        let link = find_entity_link(listing, "https://www.cmfchile.cl", "8638").expect("link");
        assert_eq!(
            link,
            "https://www.cmfchile.cl/institucional/mercados/entidad.php?mercado=V&rut=8638&row=XYZ&pestania=1"
        );
        assert!(find_entity_link(listing, "https://www.cmfchile.cl", "999").is_none());
    }

    #[test]
    fn resolution_bodies_are_classified() {
        assert_eq!(classify_resolution_body(" ERROR \n"), ResolutionBody::ErrorMarker);
        assert_eq!(classify_resolution_body(""), ResolutionBody::Empty);
        assert_eq!(
            classify_resolution_body("<!DOCTYPE html><html></html>"),
            ResolutionBody::Html
        );
        assert_eq!(
            classify_resolution_body("/603/pages/folleto.php?id=9"),
            ResolutionBody::Path("/603/pages/folleto.php?id=9".to_string())
        );
        assert!(matches!(
            classify_resolution_body("maintenance"),
            ResolutionBody::Unrecognized(_)
        ));
    }

    #[test]
    fn viewer_url_joins_relative_paths() {
        assert_eq!(viewer_url("https://b", "/x.pdf"), "https://b/x.pdf");
        assert_eq!(viewer_url("https://b", "x.pdf"), "https://b/x.pdf");
        assert_eq!(viewer_url("https://b", "https://c/x.pdf"), "https://c/x.pdf");
    }
}
