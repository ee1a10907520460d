use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::net::RetryPolicy;

pub const DEFAULT_SOURCE_BASE_URL: &str = "https://www.cmfchile.cl";
pub const DEFAULT_FUND_API_BASE_URL: &str = "https://fintual.cl/api";
pub const MAX_RETRY_ATTEMPTS: u32 = 10;

/// Known-good fund used by the health monitor's endpoint and document probes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthFixture {
    pub registry_id: String,
    pub check_digit_id: String,
    pub series_code: String,
    pub administrator_id: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub cache_ttl_days: i64,
    pub retry: RetryPolicy,
    pub min_pdf_bytes: usize,
    pub min_text_chars: usize,
    pub ocr_lang: String,
    pub ocr_max_pages: usize,
    pub source_base_url: String,
    pub fund_api_base_url: String,
    pub fund_api_provider_id: u32,
    pub http_timeout: Duration,
    pub health_fixture: HealthFixture,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_ttl_days: 30,
            retry: RetryPolicy::default(),
            min_pdf_bytes: 10 * 1024,
            min_text_chars: 500,
            ocr_lang: "spa".to_string(),
            ocr_max_pages: 3,
            source_base_url: DEFAULT_SOURCE_BASE_URL.to_string(),
            fund_api_base_url: DEFAULT_FUND_API_BASE_URL.to_string(),
            fund_api_provider_id: 3,
            http_timeout: Duration::from_secs(30),
            health_fixture: HealthFixture {
                registry_id: "8052".to_string(),
                check_digit_id: "76.113.534-5".to_string(),
                series_code: "A".to_string(),
                administrator_id: "8052".to_string(),
            },
        }
    }
}

impl Config {
    /// Loads `.env` (if present) and then reads `FUNDSCOPE_*` overrides.
    /// Malformed values are fatal.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let cache_ttl_days = parse_or(&read, "FUNDSCOPE_CACHE_TTL_DAYS", defaults.cache_ttl_days)?;
        if cache_ttl_days < 1 {
            bail!("FUNDSCOPE_CACHE_TTL_DAYS must be at least 1, got {cache_ttl_days}");
        }

        let max_attempts = parse_or(
            &read,
            "FUNDSCOPE_RETRY_MAX_ATTEMPTS",
            defaults.retry.max_attempts,
        )?;
        if !(1..=MAX_RETRY_ATTEMPTS).contains(&max_attempts) {
            bail!(
                "FUNDSCOPE_RETRY_MAX_ATTEMPTS must be between 1 and {MAX_RETRY_ATTEMPTS}, got {max_attempts}"
            );
        }
        let backoff_base = parse_or(
            &read,
            "FUNDSCOPE_RETRY_BACKOFF_BASE",
            defaults.retry.backoff_base,
        )?;
        if !(backoff_base >= 1.0 && backoff_base.is_finite()) {
            bail!("FUNDSCOPE_RETRY_BACKOFF_BASE must be a finite number >= 1.0, got {backoff_base}");
        }

        let http_timeout_secs = parse_or(&read, "FUNDSCOPE_HTTP_TIMEOUT_SECS", 30_u64)?;
        if http_timeout_secs == 0 {
            bail!("FUNDSCOPE_HTTP_TIMEOUT_SECS must be positive");
        }

        let fixture = defaults.health_fixture;
        Ok(Self {
            cache_ttl_days,
            retry: RetryPolicy {
                max_attempts,
                backoff_base,
            },
            min_pdf_bytes: parse_or(&read, "FUNDSCOPE_MIN_PDF_BYTES", defaults.min_pdf_bytes)?,
            min_text_chars: parse_or(&read, "FUNDSCOPE_MIN_TEXT_CHARS", defaults.min_text_chars)?,
            ocr_lang: read("FUNDSCOPE_OCR_LANG").unwrap_or(defaults.ocr_lang),
            ocr_max_pages: parse_or(&read, "FUNDSCOPE_OCR_MAX_PAGES", defaults.ocr_max_pages)?,
            source_base_url: read("FUNDSCOPE_SOURCE_BASE_URL")
                .unwrap_or(defaults.source_base_url)
                .trim_end_matches('/')
                .to_string(),
            fund_api_base_url: read("FUNDSCOPE_FUND_API_BASE_URL")
                .unwrap_or(defaults.fund_api_base_url)
                .trim_end_matches('/')
                .to_string(),
            fund_api_provider_id: parse_or(
                &read,
                "FUNDSCOPE_FUND_API_PROVIDER_ID",
                defaults.fund_api_provider_id,
            )?,
            http_timeout: Duration::from_secs(http_timeout_secs),
            health_fixture: HealthFixture {
                registry_id: read("FUNDSCOPE_HEALTH_FIXTURE_REGISTRY_ID")
                    .unwrap_or(fixture.registry_id),
                check_digit_id: read("FUNDSCOPE_HEALTH_FIXTURE_CHECK_DIGIT_ID")
                    .unwrap_or(fixture.check_digit_id),
                series_code: read("FUNDSCOPE_HEALTH_FIXTURE_SERIES")
                    .unwrap_or(fixture.series_code),
                administrator_id: read("FUNDSCOPE_HEALTH_FIXTURE_ADMIN_ID")
                    .unwrap_or(fixture.administrator_id),
            },
        })
    }
}

fn parse_or<T, R>(read: &R, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    R: Fn(&str) -> Option<String>,
{
    match read(key) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid value for {key}: '{raw}'")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<String, String>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = Config::from_lookup(|_| None).expect("defaults load");
        assert_eq!(config.cache_ttl_days, 30);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.min_pdf_bytes, 10 * 1024);
        assert_eq!(config.source_base_url, DEFAULT_SOURCE_BASE_URL);
    }

    #[test]
    fn overrides_are_parsed_and_urls_trimmed() {
        let config = Config::from_lookup(lookup_from(&[
            ("FUNDSCOPE_CACHE_TTL_DAYS", "7"),
            ("FUNDSCOPE_RETRY_BACKOFF_BASE", "1.5"),
            ("FUNDSCOPE_SOURCE_BASE_URL", "http://localhost:8080/"),
        ]))
        .expect("overrides load");
        assert_eq!(config.cache_ttl_days, 7);
        assert_eq!(config.retry.backoff_base, 1.5);
        assert_eq!(config.source_base_url, "http://localhost:8080");
    }

    #[test]
    fn malformed_values_are_fatal() {
        let error = Config::from_lookup(lookup_from(&[("FUNDSCOPE_CACHE_TTL_DAYS", "soon")]))
            .expect_err("non-numeric ttl must fail");
        assert!(error.to_string().contains("FUNDSCOPE_CACHE_TTL_DAYS"));

        Config::from_lookup(lookup_from(&[("FUNDSCOPE_CACHE_TTL_DAYS", "0")]))
            .expect_err("zero ttl must fail");
        Config::from_lookup(lookup_from(&[("FUNDSCOPE_RETRY_BACKOFF_BASE", "0.5")]))
            .expect_err("shrinking backoff must fail");
        Config::from_lookup(lookup_from(&[("FUNDSCOPE_RETRY_MAX_ATTEMPTS", "1100")]))
            .expect_err("runaway attempt count must fail");
    }
}
