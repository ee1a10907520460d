use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SERIES_CODE: &str = "UNICA";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocatorSource {
    FundApi,
    SiteSearch,
    Direct,
}

/// Canonical fund identity produced by the locator. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundIdentity {
    pub fund_query: String,
    pub fund_name: Option<String>,
    pub registry_id: String,
    pub check_digit_id: Option<String>,
    pub series_code: Option<String>,
    pub administrator_id: Option<String>,
    pub source: LocatorSource,
    pub match_score: Option<f64>,
    #[serde(default)]
    pub series: Vec<SeriesQuote>,
}

impl FundIdentity {
    /// Identity for a caller that already knows the registry id.
    pub fn direct(registry_id: &str, series_code: Option<&str>) -> Self {
        Self {
            fund_query: registry_id.to_string(),
            fund_name: None,
            registry_id: registry_id.to_string(),
            check_digit_id: None,
            series_code: series_code.map(ToOwned::to_owned),
            administrator_id: None,
            source: LocatorSource::Direct,
            match_score: None,
            series: Vec::new(),
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(
            &self.registry_id,
            self.series_code.as_deref().unwrap_or(DEFAULT_SERIES_CODE),
        )
    }

    /// Quote for the requested series, or the first quote when none was requested.
    pub fn quote(&self) -> Option<&SeriesQuote> {
        match &self.series_code {
            Some(code) => self
                .series
                .iter()
                .find(|quote| quote.series_code.eq_ignore_ascii_case(code)),
            None => self.series.first(),
        }
    }
}

/// Per-series figures published by the fund listing API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesQuote {
    pub series_code: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub last_price: Option<f64>,
    pub last_price_date: Option<String>,
    pub total_assets: Option<f64>,
    pub net_assets: Option<f64>,
    pub management_fee: Option<f64>,
    pub redemption_fee: Option<f64>,
    pub shareholders: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub registry_id: String,
    pub series_code: String,
}

impl CacheKey {
    pub fn new(registry_id: &str, series_code: &str) -> Self {
        Self {
            registry_id: registry_id.trim().to_string(),
            series_code: series_code.trim().to_string(),
        }
    }

    /// Index key: `{registry_id}_{series_code}`.
    pub fn index_key(&self) -> String {
        format!("{}_{}", self.registry_id, self.series_code)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub registry_id: String,
    pub series_code: String,
    pub blob_path: String,
    pub downloaded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub size_bytes: u64,
}

impl CacheEntry {
    pub fn key(&self) -> CacheKey {
        CacheKey::new(&self.registry_id, &self.series_code)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentOrigin {
    Cache,
    Network,
    BrowserAutomation,
    LocalFile,
}

impl DocumentOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Network => "network",
            Self::BrowserAutomation => "browser-automation",
            Self::LocalFile => "local-file",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievedDocument {
    pub bytes: Vec<u8>,
    pub source_path: String,
    pub origin: DocumentOrigin,
}

/// Serializable summary of a retrieved document for the output record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub source_path: String,
    pub origin: DocumentOrigin,
    pub size_bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskProfile {
    Low,
    Medium,
    High,
}

impl RiskProfile {
    /// Maps a rung of the 1..=7 regulatory risk scale onto the coarse profile.
    pub fn from_scale(rung: u8) -> Option<Self> {
        match rung {
            1..=2 => Some(Self::Low),
            3..=4 => Some(Self::Medium),
            5..=7 => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestmentHorizon {
    ShortTerm,
    MediumTerm,
    LongTerm,
}

impl InvestmentHorizon {
    pub fn nominal_months(self) -> u32 {
        match self {
            Self::ShortTerm => 12,
            Self::MediumTerm => 24,
            Self::LongTerm => 60,
        }
    }

    pub fn from_months(months: u32) -> Self {
        if months < 12 {
            Self::ShortTerm
        } else if months <= 36 {
            Self::MediumTerm
        } else {
            Self::LongTerm
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetCategory {
    GovernmentFixedIncome,
    CorporateFixedIncome,
    LocalEquity,
    InternationalEquity,
    MutualFunds,
    Derivatives,
    Cash,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioEntry {
    pub label: String,
    /// Fraction of the portfolio, 0.4520 for 45,20%.
    pub weight: f64,
    pub category: AssetCategory,
}

/// Fields mined from a disclosure document. Every field is optional; a value
/// is only present when an extraction rule matched it, and `provenance`
/// records which rule (or upstream component) supplied it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub registry_id: Option<String>,
    pub series_code: Option<String>,
    pub administrator_name: Option<String>,

    pub fund_type: Option<String>,
    pub risk_profile: Option<RiskProfile>,
    pub risk_scale_code: Option<u8>,
    pub risk_tolerance: Option<String>,
    pub ideal_investor_profile: Option<String>,
    pub investment_objective: Option<String>,
    pub investment_horizon: Option<InvestmentHorizon>,
    pub investment_horizon_months: Option<u32>,

    pub redemption_window_days: Option<u32>,
    pub fund_duration: Option<String>,
    pub minimum_investment_amount: Option<f64>,
    pub currency: Option<String>,
    pub management_fee: Option<f64>,
    pub redemption_fee: Option<f64>,
    pub total_annual_cost: Option<f64>,
    pub industry_average_total_annual_cost: Option<f64>,

    pub return_12m: Option<f64>,
    pub return_24m: Option<f64>,
    pub return_36m: Option<f64>,
    pub nominal_returns: BTreeMap<String, f64>,
    pub annualized_returns: BTreeMap<String, f64>,
    pub best_returns: BTreeMap<String, f64>,
    pub worst_returns: BTreeMap<String, f64>,

    pub net_assets: Option<f64>,
    pub net_assets_currency: Option<String>,
    pub portfolio_composition: Vec<PortfolioEntry>,

    pub provenance: BTreeMap<String, String>,
    pub confidence_level: Confidence,
}

impl Default for ExtractionResult {
    fn default() -> Self {
        Self {
            registry_id: None,
            series_code: None,
            administrator_name: None,
            fund_type: None,
            risk_profile: None,
            risk_scale_code: None,
            risk_tolerance: None,
            ideal_investor_profile: None,
            investment_objective: None,
            investment_horizon: None,
            investment_horizon_months: None,
            redemption_window_days: None,
            fund_duration: None,
            minimum_investment_amount: None,
            currency: None,
            management_fee: None,
            redemption_fee: None,
            total_annual_cost: None,
            industry_average_total_annual_cost: None,
            return_12m: None,
            return_24m: None,
            return_36m: None,
            nominal_returns: BTreeMap::new(),
            annualized_returns: BTreeMap::new(),
            best_returns: BTreeMap::new(),
            worst_returns: BTreeMap::new(),
            net_assets: None,
            net_assets_currency: None,
            portfolio_composition: Vec::new(),
            provenance: BTreeMap::new(),
            confidence_level: Confidence::Low,
        }
    }
}

impl ExtractionResult {
    /// Names of every field currently holding a value, in declaration order.
    pub fn populated_fields(&self) -> Vec<&'static str> {
        let checks: [(&'static str, bool); 29] = [
            ("registry_id", self.registry_id.is_some()),
            ("series_code", self.series_code.is_some()),
            ("administrator_name", self.administrator_name.is_some()),
            ("fund_type", self.fund_type.is_some()),
            ("risk_profile", self.risk_profile.is_some()),
            ("risk_scale_code", self.risk_scale_code.is_some()),
            ("risk_tolerance", self.risk_tolerance.is_some()),
            ("ideal_investor_profile", self.ideal_investor_profile.is_some()),
            ("investment_objective", self.investment_objective.is_some()),
            ("investment_horizon", self.investment_horizon.is_some()),
            ("investment_horizon_months", self.investment_horizon_months.is_some()),
            ("redemption_window_days", self.redemption_window_days.is_some()),
            ("fund_duration", self.fund_duration.is_some()),
            ("minimum_investment_amount", self.minimum_investment_amount.is_some()),
            ("currency", self.currency.is_some()),
            ("management_fee", self.management_fee.is_some()),
            ("redemption_fee", self.redemption_fee.is_some()),
            ("total_annual_cost", self.total_annual_cost.is_some()),
            (
                "industry_average_total_annual_cost",
                self.industry_average_total_annual_cost.is_some(),
            ),
            ("return_12m", self.return_12m.is_some()),
            ("return_24m", self.return_24m.is_some()),
            ("return_36m", self.return_36m.is_some()),
            ("nominal_returns", !self.nominal_returns.is_empty()),
            ("annualized_returns", !self.annualized_returns.is_empty()),
            ("best_returns", !self.best_returns.is_empty()),
            ("worst_returns", !self.worst_returns.is_empty()),
            ("net_assets", self.net_assets.is_some()),
            ("net_assets_currency", self.net_assets_currency.is_some()),
            ("portfolio_composition", !self.portfolio_composition.is_empty()),
        ];

        checks
            .into_iter()
            .filter_map(|(name, present)| present.then_some(name))
            .collect()
    }

    pub fn record_provenance(&mut self, field: &str, source: &str) {
        self.provenance.insert(field.to_string(), source.to_string());
    }
}

/// Advisory view of the last persisted health report, attached to each record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthAdvisory {
    pub status: String,
    pub checked_at: String,
    pub degraded_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordError {
    pub kind: String,
    pub message: String,
}

/// One fund's output row, handed to the downstream reporting pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundRecord {
    pub fund_query: String,
    pub processed_at: String,
    pub identity: Option<FundIdentity>,
    pub document: Option<DocumentSummary>,
    pub extraction: ExtractionResult,
    pub error: Option<RecordError>,
    pub warnings: Vec<String>,
    pub health: Option<HealthAdvisory>,
}

impl FundRecord {
    pub fn new(fund_query: &str, processed_at: String) -> Self {
        Self {
            fund_query: fund_query.to_string(),
            processed_at,
            identity: None,
            document: None,
            extraction: ExtractionResult::default(),
            error: None,
            warnings: Vec::new(),
            health: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCheckpoint {
    pub generated_at: String,
    pub processed: usize,
    pub total: usize,
    pub records: Vec<FundRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub started_at: String,
    pub finished_at: String,
    pub elapsed_secs: f64,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub documents_from_cache: usize,
    pub documents_downloaded: usize,
    pub confidence_counts: BTreeMap<String, usize>,
    pub failures: Vec<BatchFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFailure {
    pub fund_query: String,
    pub kind: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_defaults_to_single_series() {
        let identity = FundIdentity::direct(" 8638 ", None);
        assert_eq!(identity.cache_key().index_key(), "8638_UNICA");

        let identity = FundIdentity::direct("8638", Some("B"));
        assert_eq!(identity.cache_key().index_key(), "8638_B");
    }

    #[test]
    fn risk_scale_maps_to_profile() {
        assert_eq!(RiskProfile::from_scale(2), Some(RiskProfile::Low));
        assert_eq!(RiskProfile::from_scale(4), Some(RiskProfile::Medium));
        assert_eq!(RiskProfile::from_scale(7), Some(RiskProfile::High));
        assert_eq!(RiskProfile::from_scale(0), None);
    }

    #[test]
    fn empty_extraction_has_no_populated_fields() {
        let result = ExtractionResult::default();
        assert!(result.populated_fields().is_empty());
        assert_eq!(result.confidence_level, Confidence::Low);

        let json = serde_json::to_value(&result).expect("serialize");
        assert!(json["management_fee"].is_null());
        assert_eq!(json["confidence_level"], "low");
    }

    #[test]
    fn document_origin_serializes_kebab_case() {
        let json = serde_json::to_string(&DocumentOrigin::BrowserAutomation).expect("serialize");
        assert_eq!(json, "\"browser-automation\"");
        assert_eq!(DocumentOrigin::BrowserAutomation.as_str(), "browser-automation");
    }
}
