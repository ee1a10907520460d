use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::FundError;
use crate::model::{FundIdentity, LocatorSource, SeriesQuote};
use crate::net::SourceClient;

/// Matches at or below this score are rejected.
pub const SIMILARITY_FLOOR: f64 = 30.0;

const LISTING_SCRIPT_PATHS: [&str; 3] = [
    "/institucional/estadisticas/fm.bpr_menu.php",
    "/institucional/estadisticas/fm_patrimonio_menu.php",
    "/institucional/estadisticas/fondos_mutuos.php",
];

static FUND_ARRAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)fondos_(\d+)\s*=\s*new\s+Array\((.*?)\);").expect("valid fund array regex")
});
static QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""([^"]*)""#).expect("valid quoted item regex"));
static WIDE_GAP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s{2,}").expect("valid gap regex"));
static RUN_WITH_DIGIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+-[\dkK]$").expect("valid run regex"));
static BARE_REGISTRY_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)(?:-([\dkK]))?$").expect("valid registry id regex"));

/// A fund entry offered by one of the lookup sources.
#[derive(Debug, Clone, PartialEq)]
pub struct FundListing {
    pub name: String,
    pub check_digit_id: String,
    pub administrator_id: Option<String>,
    pub api_asset_id: Option<String>,
    pub symbol: Option<String>,
}

impl FundListing {
    pub fn registry_id(&self) -> String {
        registry_base(&self.check_digit_id)
    }
}

/// `"8638-K"` and `"8.638-K"` both become `"8638"`.
pub fn registry_base(run: &str) -> String {
    run.split('-')
        .next()
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii_digit)
        .collect()
}

fn normalize_name(value: &str) -> String {
    value
        .to_lowercase()
        .replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// 100 for an exact match, 80 when the query is contained in the candidate,
/// otherwise 60 scaled by the share of query tokens found inside candidate tokens.
pub fn score_name(query: &str, candidate: &str) -> f64 {
    let query = normalize_name(query);
    let candidate = normalize_name(candidate);
    if query.is_empty() || candidate.is_empty() {
        return 0.0;
    }
    if query == candidate {
        return 100.0;
    }
    if candidate.contains(&query) {
        return 80.0;
    }

    let query_tokens = query.split(' ').collect::<Vec<_>>();
    let candidate_tokens = candidate.split(' ').collect::<Vec<_>>();
    let matched = query_tokens
        .iter()
        .filter(|token| candidate_tokens.iter().any(|other| other.contains(*token)))
        .count();
    (matched as f64 / query_tokens.len() as f64) * 60.0
}

pub fn best_match<'a>(query: &str, listings: &'a [FundListing]) -> Option<(&'a FundListing, f64)> {
    let mut best: Option<(&FundListing, f64)> = None;
    for listing in listings {
        let score = score_name(query, &listing.name);
        if best.is_none_or(|(_, top)| score > top) {
            best = Some((listing, score));
        }
    }
    best.filter(|(_, score)| *score > SIMILARITY_FLOOR)
}

/// Funds declared in the listing pages' `fondos_{admin} = new Array(...)`
/// scripts, deduplicated by registry id.
pub fn parse_listing_scripts(html: &str) -> Vec<FundListing> {
    let mut seen = HashSet::new();
    let mut listings = Vec::new();

    for array in FUND_ARRAY.captures_iter(html) {
        let administrator_id = array[1].to_string();
        for item in QUOTED.captures_iter(&array[2]) {
            let item = item[1].trim();
            if item.is_empty() || item.to_lowercase().contains("seleccione") {
                continue;
            }
            let mut parts = WIDE_GAP.splitn(item, 2);
            let (Some(run), Some(name)) = (parts.next(), parts.next()) else {
                continue;
            };
            let (run, name) = (run.trim(), name.trim());
            if !RUN_WITH_DIGIT.is_match(run) || name.chars().count() <= 5 {
                continue;
            }
            let registry_id = registry_base(run);
            if !seen.insert(registry_id) {
                continue;
            }
            listings.push(FundListing {
                name: name.to_string(),
                check_digit_id: run.to_uppercase(),
                administrator_id: Some(administrator_id.clone()),
                api_asset_id: None,
                symbol: None,
            });
        }
    }

    listings
}

/// Fund listing API documents: `{"data": [{"id", "attributes": {...}}]}`.
pub fn parse_api_listing(body: &Value) -> Vec<FundListing> {
    body.get("data")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let attributes = item.get("attributes")?;
                    let name = text_field(attributes, "name")?;
                    let run = text_field(attributes, "run")?;
                    Some(FundListing {
                        name,
                        check_digit_id: run.to_uppercase(),
                        administrator_id: None,
                        api_asset_id: item.get("id").and_then(value_as_text),
                        symbol: text_field(attributes, "symbol"),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn parse_api_series(body: &Value) -> Vec<SeriesQuote> {
    body.get("data")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let attributes = item.get("attributes")?;
                    let last_day = attributes.get("last_day");
                    Some(SeriesQuote {
                        series_code: text_field(attributes, "serie")?,
                        name: text_field(attributes, "name"),
                        symbol: text_field(attributes, "symbol"),
                        last_price: last_day.and_then(|day| number_field(day, "price")),
                        last_price_date: last_day.and_then(|day| text_field(day, "date")),
                        total_assets: number_field(attributes, "total_assets"),
                        net_assets: number_field(attributes, "total_net_assets"),
                        management_fee: number_field(attributes, "fixed_management_fee"),
                        redemption_fee: number_field(attributes, "redemption_fee"),
                        shareholders: number_field(attributes, "shareholders")
                            .filter(|count| *count >= 0.0)
                            .map(|count| count as u64),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn text_field(object: &Value, key: &str) -> Option<String> {
    object.get(key).and_then(value_as_text)
}

fn number_field(object: &Value, key: &str) -> Option<f64> {
    match object.get(key)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().replace(',', ".").parse().ok(),
        _ => None,
    }
}

pub struct FundLocator<'a> {
    client: &'a SourceClient,
    api_base_url: String,
    api_provider_id: u32,
    source_base_url: String,
}

impl<'a> FundLocator<'a> {
    pub fn new(
        client: &'a SourceClient,
        api_base_url: &str,
        api_provider_id: u32,
        source_base_url: &str,
    ) -> Self {
        Self {
            client,
            api_base_url: api_base_url.to_string(),
            api_provider_id,
            source_base_url: source_base_url.to_string(),
        }
    }

    /// Resolves a fund name (or a bare registry id) to a canonical identity.
    /// The listing API is tried first, then the site's script-declared lists.
    pub fn locate(&self, query: &str, series_code: Option<&str>) -> Result<FundIdentity, FundError> {
        let query = query.trim();
        if let Some(captures) = BARE_REGISTRY_ID.captures(query) {
            let mut identity = FundIdentity::direct(&captures[1], series_code);
            identity.fund_query = query.to_string();
            identity.check_digit_id = captures
                .get(2)
                .map(|digit| format!("{}-{}", &captures[1], digit.as_str().to_uppercase()));
            info!(query, registry_id = %identity.registry_id, "query is a registry id");
            return Ok(identity);
        }

        match self.locate_via_api(query, series_code) {
            Ok(Some(identity)) => return Ok(identity),
            Ok(None) => info!(query, "no listing api match, trying site search"),
            Err(error) => warn!(query, error = %error, "listing api unavailable, trying site search"),
        }

        if let Some(identity) = self.locate_via_site_search(query, series_code) {
            return Ok(identity);
        }

        warn!(query, "fund not found");
        Err(FundError::NotFound {
            query: query.to_string(),
        })
    }

    fn locate_via_api(
        &self,
        query: &str,
        series_code: Option<&str>,
    ) -> Result<Option<FundIdentity>, FundError> {
        let url = format!(
            "{}/asset_providers/{}/conceptual_assets",
            self.api_base_url, self.api_provider_id
        );
        let response = self.client.get("fund listing api", &url)?;
        if !response.is_success() {
            return Err(FundError::SourceUnavailable(format!(
                "fund listing api returned HTTP {}",
                response.status
            )));
        }
        let body: Value = serde_json::from_slice(&response.body).map_err(|error| {
            FundError::SourceUnavailable(format!("fund listing api sent invalid json: {error}"))
        })?;

        let listings = parse_api_listing(&body);
        debug!(count = listings.len(), "listing api funds");
        let Some((listing, score)) = best_match(query, &listings) else {
            return Ok(None);
        };
        info!(query, name = %listing.name, run = %listing.check_digit_id, score, "listing api match");

        let series = listing
            .api_asset_id
            .as_deref()
            .map(|asset_id| self.fetch_series(asset_id))
            .unwrap_or_default();

        Ok(Some(identity_from(
            query,
            listing,
            score,
            series_code,
            series,
            LocatorSource::FundApi,
        )))
    }

    fn fetch_series(&self, asset_id: &str) -> Vec<SeriesQuote> {
        let url = format!("{}/conceptual_assets/{asset_id}/real_assets", self.api_base_url);
        let response = match self.client.get("fund series api", &url) {
            Ok(response) if response.is_success() => response,
            Ok(response) => {
                warn!(asset_id, status = response.status, "series lookup failed");
                return Vec::new();
            }
            Err(error) => {
                warn!(asset_id, error = %error, "series lookup failed");
                return Vec::new();
            }
        };
        match serde_json::from_slice::<Value>(&response.body) {
            Ok(body) => {
                let series = parse_api_series(&body);
                info!(asset_id, count = series.len(), "series quotes loaded");
                series
            }
            Err(error) => {
                warn!(asset_id, error = %error, "series response was not json");
                Vec::new()
            }
        }
    }

    fn locate_via_site_search(&self, query: &str, series_code: Option<&str>) -> Option<FundIdentity> {
        for path in LISTING_SCRIPT_PATHS {
            let url = format!("{}{path}", self.source_base_url);
            let listings = match self.client.get("fund list page", &url) {
                Ok(response) if response.is_success() => parse_listing_scripts(&response.text()),
                Ok(response) => {
                    debug!(url = %url, status = response.status, "fund list page unavailable");
                    continue;
                }
                Err(error) => {
                    warn!(url = %url, error = %error, "fund list page unavailable");
                    continue;
                }
            };
            if listings.is_empty() {
                continue;
            }

            info!(url = %url, count = listings.len(), "site search funds");
            return best_match(query, &listings).map(|(listing, score)| {
                info!(query, name = %listing.name, run = %listing.check_digit_id, score, "site search match");
                identity_from(
                    query,
                    listing,
                    score,
                    series_code,
                    Vec::new(),
                    LocatorSource::SiteSearch,
                )
            });
        }
        None
    }
}

fn identity_from(
    query: &str,
    listing: &FundListing,
    score: f64,
    series_code: Option<&str>,
    series: Vec<SeriesQuote>,
    source: LocatorSource,
) -> FundIdentity {
    FundIdentity {
        fund_query: query.to_string(),
        fund_name: Some(listing.name.clone()),
        registry_id: listing.registry_id(),
        check_digit_id: Some(listing.check_digit_id.clone()),
        series_code: series_code.map(ToOwned::to_owned),
        administrator_id: listing.administrator_id.clone(),
        source,
        match_score: Some(score),
        series,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Method;
    use crate::net::fake::{ScriptedTransport, client_with};

    const API: &str = "https://api.test";
    const SITE: &str = "https://cmf.test";

    const LISTING_JSON: &str = r#"{"data": [
        {"id": "186", "attributes": {"name": "Risky Norris", "symbol": "FFMM-FINTUAL-A", "run": "9570-6"}},
        {"id": 187, "attributes": {"name": "Moderate Pitt", "symbol": "FFMM-FINTUAL-B", "run": "9569-2"}},
        {"id": "188", "attributes": {"name": "Sin run"}}
    ]}"#;

    const SERIES_JSON: &str = r#"{"data": [
        {"id": "1", "attributes": {"serie": "A", "name": "Risky Norris A", "symbol": "X",
          "last_day": {"price": 1523.44, "date": "2026-03-02"},
          "total_assets": 1200000000, "total_net_assets": "1180000000.5",
          "fixed_management_fee": 0.0119, "redemption_fee": null, "shareholders": 5321}}
    ]}"#;

    const SCRIPT_PAGE: &str = r#"<script>
        var fondos_96667040 = new Array("Seleccione un fondo...","8638-K   FONDO MUTUO RENTA CHILENA","8638-K   FONDO MUTUO RENTA CHILENA B",
            "bad   ENTRY WITHOUT RUN","9001-3   CORTO");
        var fondos_76113534=new Array("9100-2   FONDO MUTUO DOLAR GLOBAL");
    </script>"#;

    #[test]
    fn scoring_orders_exact_substring_and_token_overlap() {
        assert_eq!(score_name("Risky Norris", "risky  norris"), 100.0);
        assert_eq!(score_name("renta chilena", "Fondo Mutuo Renta Chilena"), 80.0);
        assert_eq!(score_name("dolar global euro yen", "FONDO MUTUO DOLAR GLOBAL"), 30.0);
        assert_eq!(score_name("acciones", "FONDO MUTUO DOLAR GLOBAL"), 0.0);
    }

    #[test]
    fn floor_rejects_weak_matches() {
        let listings = parse_listing_scripts(SCRIPT_PAGE);
        assert!(best_match("acciones asia", &listings).is_none());
        // one of three tokens: 20 points
        assert!(best_match("dolar brasil peru", &listings).is_none());
        let (listing, _) = best_match("dolar global", &listings).expect("match");
        assert_eq!(listing.registry_id(), "9100");
    }

    #[test]
    fn listing_scripts_are_deduplicated_and_validated() {
        let listings = parse_listing_scripts(SCRIPT_PAGE);
        let ids = listings
            .iter()
            .map(|listing| listing.check_digit_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["8638-K", "9100-2"]);
        assert_eq!(listings[0].administrator_id.as_deref(), Some("96667040"));
        assert_eq!(listings[1].administrator_id.as_deref(), Some("76113534"));
    }

    #[test]
    fn api_match_carries_series_quotes() {
        let transport = ScriptedTransport::new()
            .route(Method::Get, "/asset_providers/3/conceptual_assets", 200, LISTING_JSON.as_bytes())
            .route(Method::Get, "/conceptual_assets/186/real_assets", 200, SERIES_JSON.as_bytes());
        let client = client_with(transport);
        let locator = FundLocator::new(&client, API, 3, SITE);

        let identity = locator.locate("risky norris", Some("A")).expect("found");
        assert_eq!(identity.source, LocatorSource::FundApi);
        assert_eq!(identity.registry_id, "9570");
        assert_eq!(identity.check_digit_id.as_deref(), Some("9570-6"));
        let quote = identity.quote().expect("series quote");
        assert_eq!(quote.net_assets, Some(1_180_000_000.5));
        assert_eq!(quote.management_fee, Some(0.0119));
        assert_eq!(quote.redemption_fee, None);
        assert_eq!(quote.shareholders, Some(5321));
    }

    #[test]
    fn site_search_is_used_when_api_fails() {
        let transport = ScriptedTransport::new()
            .route(Method::Get, "/asset_providers/", 503, b"down")
            .route(Method::Get, "fm.bpr_menu.php", 200, b"<html>no scripts</html>")
            .route(Method::Get, "fm_patrimonio_menu.php", 200, SCRIPT_PAGE.as_bytes());
        let client = client_with(transport);
        let locator = FundLocator::new(&client, API, 3, SITE);

        let identity = locator.locate("Renta Chilena", None).expect("found");
        assert_eq!(identity.source, LocatorSource::SiteSearch);
        assert_eq!(identity.registry_id, "8638");
        assert_eq!(identity.administrator_id.as_deref(), Some("96667040"));
    }

    #[test]
    fn nothing_above_floor_is_not_found() {
        let transport = ScriptedTransport::new()
            .route(Method::Get, "/asset_providers/", 200, LISTING_JSON.as_bytes())
            .route(Method::Get, "fondos_mutuos.php", 200, SCRIPT_PAGE.as_bytes());
        let client = client_with(transport);
        let locator = FundLocator::new(&client, API, 3, SITE);

        let error = locator.locate("Acciones Asia Emergente", None).expect_err("not found");
        assert!(matches!(error, FundError::NotFound { .. }));
    }

    #[test]
    fn bare_registry_ids_skip_lookup() {
        let client = client_with(ScriptedTransport::new());
        let locator = FundLocator::new(&client, API, 3, SITE);
        let identity = locator.locate("8638-k", Some("B")).expect("direct");
        assert_eq!(identity.registry_id, "8638");
        assert_eq!(identity.check_digit_id.as_deref(), Some("8638-K"));
        assert_eq!(identity.source, LocatorSource::Direct);
    }
}
