mod actions;
mod browser;
mod source;


use std::cell::Cell;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use crate::cache::CacheManager;
use crate::error::FundError;
use crate::model::{CacheKey, DocumentOrigin, FundIdentity, RetrievedDocument};
use crate::net::SourceClient;

pub use actions::{
    ACTION_FUNCTION, ActionParams, SeriesRow, SeriesSource, count_action_elements,
    discover_series, has_series_table, parse_action_invocations, parse_series_table,
};
pub use browser::{
    BrowserCandidate, BrowserLauncher, BrowserSession, ChromeLauncher, DownloadError,
    DownloadWait, SelectionStrategy, download_with_browser, finalize_download, first_available,
    match_exact_id, match_nearby_text, select_candidate, wait_for_download,
};
pub use source::{
    DISCLOSURES_TAB, DOCUMENT_ENDPOINT_CANDIDATES, ERROR_MARKER, ResolutionBody,
    classify_resolution_body, direct_entity_url, has_pdf_signature, resolution_form,
    resolution_request, resolve_entity_page, viewer_url,
};

#[derive(Debug, Clone)]
pub struct RetrieverOptions {
    pub base_url: String,
    pub download_dir: PathBuf,
    pub settle_timeout: Duration,
    pub download_wait: DownloadWait,
    /// Try the browser before the direct request sequence.
    pub degraded: bool,
}

impl RetrieverOptions {
    pub fn new(base_url: &str, download_dir: PathBuf, min_pdf_bytes: usize) -> Self {
        Self {
            base_url: base_url.to_string(),
            download_dir,
            settle_timeout: Duration::from_secs(20),
            download_wait: DownloadWait::with_min_bytes(min_pdf_bytes as u64),
            degraded: false,
        }
    }
}

/// Request parameters chosen for the resolution endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DocumentRequest {
    fund_run: String,
    series_code: String,
    administrator_id: String,
}

pub struct DocumentRetriever<'a> {
    client: &'a SourceClient,
    cache: &'a CacheManager,
    browser: &'a dyn BrowserLauncher,
    options: RetrieverOptions,
    working_endpoint: Cell<Option<usize>>,
}

impl<'a> DocumentRetriever<'a> {
    pub fn new(
        client: &'a SourceClient,
        cache: &'a CacheManager,
        browser: &'a dyn BrowserLauncher,
        options: RetrieverOptions,
    ) -> Self {
        Self {
            client,
            cache,
            browser,
            options,
            working_endpoint: Cell::new(None),
        }
    }

    /// Cache first, then the direct request sequence and the browser fallback
    /// (in reverse order when degraded). Network results are cached before
    /// they are returned.
    pub fn retrieve(&self, identity: &FundIdentity) -> Result<RetrievedDocument, FundError> {
        let requested_key = identity.cache_key();
        if let Some(document) = self.cached_document(&requested_key) {
            return Ok(document);
        }

        let (document, key) = if self.options.degraded {
            info!(registry_id = %identity.registry_id, "degraded mode, trying browser first");
            match self.fetch_with_browser(identity) {
                Ok(document) => Ok((document, requested_key)),
                Err(browser_error) => self.fetch_direct(identity).map_err(|error| {
                    combine_failures(error, &browser_error)
                }),
            }
        } else {
            match self.fetch_direct(identity) {
                Ok(fetched) => Ok(fetched),
                Err(error @ FundError::NoDocument(_)) => Err(error),
                Err(direct_error) => {
                    warn!(
                        registry_id = %identity.registry_id,
                        error = %direct_error,
                        "direct retrieval failed, falling back to browser"
                    );
                    self.fetch_with_browser(identity)
                        .map(|document| (document, requested_key))
                        .map_err(|browser_error| combine_failures(direct_error, &browser_error))
                }
            }
        }?;
        if document.origin == DocumentOrigin::Cache {
            return Ok(document);
        }

        self.cache.record_download();
        if let Err(error) = self.cache.store(&key, &document.bytes) {
            warn!(key = %key.index_key(), error = %error, "continuing without caching");
        }
        Ok(document)
    }

    fn cached_document(&self, key: &CacheKey) -> Option<RetrievedDocument> {
        let entry = self.cache.lookup(key)?;
        match self.cache.read_blob(&entry) {
            Ok(bytes) if has_pdf_signature(&bytes) => Some(RetrievedDocument {
                bytes,
                source_path: entry.blob_path,
                origin: DocumentOrigin::Cache,
            }),
            Ok(_) => {
                warn!(key = %key.index_key(), "cached blob lacks pdf signature, refetching");
                None
            }
            Err(error) => {
                warn!(key = %key.index_key(), error = %error, "cached blob unreadable, refetching");
                None
            }
        }
    }

    /// Returns the document with the cache key of the series actually requested
    /// from the source.
    fn fetch_direct(
        &self,
        identity: &FundIdentity,
    ) -> Result<(RetrievedDocument, CacheKey), FundError> {
        let base_url = &self.options.base_url;
        let page_url = resolve_entity_page(self.client, base_url, &identity.registry_id)?;
        let page = self.client.get("disclosures page", &page_url)?;
        if !page.is_success() {
            return Err(FundError::SourceUnavailable(format!(
                "disclosures page returned HTTP {}",
                page.status
            )));
        }

        let request = choose_request(identity, &discover_series(&page.text()))?;
        info!(
            registry_id = %identity.registry_id,
            fund_run = %request.fund_run,
            series = %request.series_code,
            administrator_id = %request.administrator_id,
            "document action parameters"
        );

        let key = CacheKey::new(&identity.registry_id, &request.series_code);
        if key != identity.cache_key()
            && let Some(document) = self.cached_document(&key)
        {
            return Ok((document, key));
        }

        let path = self.resolve_document_path(&request, &page_url)?;
        let url = viewer_url(base_url, &path);
        let response = self.client.get("document download", &url)?;
        if !response.is_success() {
            return Err(FundError::SourceUnavailable(format!(
                "document viewer returned HTTP {}",
                response.status
            )));
        }
        if !has_pdf_signature(&response.body) {
            return Err(FundError::InvalidDocument(format!(
                "{url} did not return a pdf ({} bytes)",
                response.body.len()
            )));
        }

        info!(registry_id = %identity.registry_id, size_bytes = response.body.len(), "document downloaded");
        Ok((
            RetrievedDocument {
                bytes: response.body,
                source_path: url,
                origin: DocumentOrigin::Network,
            },
            key,
        ))
    }

    /// Probes the endpoint candidates, starting from the last one that answered.
    fn resolve_document_path(
        &self,
        request: &DocumentRequest,
        referer: &str,
    ) -> Result<String, FundError> {
        let form = resolution_form(
            &request.fund_run,
            &request.series_code,
            &request.administrator_id,
        );
        let start = self.working_endpoint.get().unwrap_or(0);
        let order = (0..DOCUMENT_ENDPOINT_CANDIDATES.len())
            .map(|offset| (start + offset) % DOCUMENT_ENDPOINT_CANDIDATES.len());

        let mut failures = Vec::new();
        let mut html_answers = 0;
        for index in order {
            let endpoint = DOCUMENT_ENDPOINT_CANDIDATES[index];
            let http = resolution_request(&self.options.base_url, endpoint, &form, referer);
            let response = match self.client.send("document resolution", &http) {
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

            match classify_resolution_body(&response.text()) {
                ResolutionBody::Path(path) => {
                    self.working_endpoint.set(Some(index));
                    info!(endpoint, path = %path, "document path resolved");
                    return Ok(path);
                }
                ResolutionBody::ErrorMarker => {
                    self.working_endpoint.set(Some(index));
                    return Err(FundError::NoDocument(format!(
                        "{endpoint} answered {ERROR_MARKER} for series {}",
                        request.series_code
                    )));
                }
                ResolutionBody::Html => {
                    warn!(endpoint, "resolution endpoint answered html");
                    html_answers += 1;
                    failures.push(format!("{endpoint}: html page"));
                }
                other => {
                    warn!(endpoint, response = ?other, "unusable resolution response");
                    failures.push(format!("{endpoint}: {other:?}"));
                }
            }
        }

        // Every endpoint answered with a page instead of a path.
        if html_answers == failures.len() {
            return Err(FundError::NoDocument(format!(
                "every resolution endpoint answered html for series {}",
                request.series_code
            )));
        }

        Err(FundError::SourceUnavailable(format!(
            "no resolution endpoint answered: {}",
            failures.join("; ")
        )))
    }

    fn fetch_with_browser(&self, identity: &FundIdentity) -> Result<RetrievedDocument, FundError> {
        let base_url = &self.options.base_url;
        let page_url = resolve_entity_page(self.client, base_url, &identity.registry_id)
            .unwrap_or_else(|error| {
                warn!(error = %error, "entity page lookup failed, using direct url");
                direct_entity_url(base_url, &identity.registry_id, DISCLOSURES_TAB)
            });

        let path = download_with_browser(
            self.browser,
            &page_url,
            &self.options.download_dir,
            &identity.registry_id,
            identity.series_code.as_deref(),
            self.options.settle_timeout,
            self.options.download_wait,
        )
        .map_err(|error| FundError::SourceUnavailable(format!("browser retrieval failed: {error:#}")))?;

        let bytes = fs::read(&path).map_err(|error| {
            FundError::SourceUnavailable(format!("failed to read {}: {error}", path.display()))
        })?;
        if !has_pdf_signature(&bytes) {
            return Err(FundError::InvalidDocument(format!(
                "browser download {} is not a pdf",
                path.display()
            )));
        }

        info!(registry_id = %identity.registry_id, path = %path.display(), "document downloaded by browser");
        Ok(RetrievedDocument {
            bytes,
            source_path: path.display().to_string(),
            origin: DocumentOrigin::BrowserAutomation,
        })
    }
}

/// Picks the series to request: the requested one if the page offers it,
/// otherwise the first offered.
fn choose_request(
    identity: &FundIdentity,
    series: &SeriesSource,
) -> Result<DocumentRequest, FundError> {
    let wanted = identity.series_code.as_deref();
    let fund_run = identity
        .check_digit_id
        .clone()
        .unwrap_or_else(|| identity.registry_id.clone());

    match series {
        SeriesSource::Actions(actions) => {
            let chosen = wanted
                .and_then(|code| {
                    actions
                        .iter()
                        .find(|action| action.series_code.eq_ignore_ascii_case(code))
                })
                .or_else(|| actions.first())
                .ok_or_else(|| FundError::SourceUnavailable("empty action list".to_string()))?;
            Ok(DocumentRequest {
                fund_run: chosen.fund_run.clone(),
                series_code: chosen.series_code.clone(),
                administrator_id: chosen.administrator_id.clone(),
            })
        }
        SeriesSource::Table(rows) => {
            let series_code = wanted
                .and_then(|code| rows.iter().find(|row| row.series_code.eq_ignore_ascii_case(code)))
                .or_else(|| rows.first())
                .map(|row| row.series_code.clone())
                .unwrap_or_else(|| crate::model::DEFAULT_SERIES_CODE.to_string());
            with_known_administrator(identity, fund_run, series_code)
        }
        SeriesSource::Assumed => with_known_administrator(
            identity,
            fund_run,
            wanted
                .unwrap_or(crate::model::DEFAULT_SERIES_CODE)
                .to_string(),
        ),
    }
}

fn with_known_administrator(
    identity: &FundIdentity,
    fund_run: String,
    series_code: String,
) -> Result<DocumentRequest, FundError> {
    let administrator_id = identity.administrator_id.clone().ok_or_else(|| {
        FundError::SourceUnavailable(format!(
            "page for {} exposes no action parameters and the administrator id is unknown",
            identity.registry_id
        ))
    })?;
    Ok(DocumentRequest {
        fund_run,
        series_code,
        administrator_id,
    })
}

fn combine_failures(primary: FundError, secondary: &FundError) -> FundError {
    match primary {
        FundError::NoDocument(message) => FundError::NoDocument(message),
        FundError::InvalidDocument(message) => {
            FundError::InvalidDocument(format!("{message}; {secondary}"))
        }
        other => FundError::SourceUnavailable(format!("{other}; {secondary}")),
    }
}
