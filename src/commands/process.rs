use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{info, warn};

use crate::cli::ProcessArgs;
use crate::commands::context::{RunContext, load_health_advisory};
use crate::error::FundError;
use crate::extract::{self, ExtractedText, TextOptions};
use crate::locator::FundLocator;
use crate::model::{
    Confidence, DocumentSummary, ExtractionResult, FundIdentity, FundRecord, HealthAdvisory,
    RecordError, RetrievedDocument,
};
use crate::retriever::{BrowserLauncher, ChromeLauncher, DocumentRetriever, RetrieverOptions};
use crate::util::{now_utc_string, safe_file_stem, sha256_hex, write_json_pretty};

const LOCATOR_PROVENANCE: &str = "locator";
const FUND_API_PROVENANCE: &str = "fund_api";

pub type DocumentExtractor = fn(&[u8], &TextOptions) -> Result<(ExtractionResult, ExtractedText)>;

pub fn run(args: ProcessArgs) -> Result<()> {
    let context = RunContext::open(&args.cache_root)?;
    context.cache.sweep_expired();
    let advisory = load_health_advisory(&context.health_dir());
    let browser = ChromeLauncher;
    let processor = FundProcessor::from_context(&context, &browser, advisory);

    let record = processor.process(&args.query, args.series.as_deref());
    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| record_path(&context.records_dir(), &args.query));
    write_json_pretty(&output_path, &record)?;

    context.cache.log_statistics();
    info!(
        query = %args.query,
        output = %output_path.display(),
        error = record.error.as_ref().map(|error| error.kind.as_str()).unwrap_or("none"),
        "fund record written"
    );
    Ok(())
}

pub fn record_path(records_dir: &Path, query: &str) -> PathBuf {
    records_dir.join(format!("{}.json", safe_file_stem(query.trim())))
}

/// Locate, retrieve, extract and assemble one fund. Every failure ends up in
/// the returned record rather than propagating.
pub struct FundProcessor<'a> {
    locator: FundLocator<'a>,
    retriever: DocumentRetriever<'a>,
    text_options: TextOptions,
    advisory: Option<HealthAdvisory>,
    extractor: DocumentExtractor,
}

impl<'a> FundProcessor<'a> {
    pub fn new(
        locator: FundLocator<'a>,
        retriever: DocumentRetriever<'a>,
        text_options: TextOptions,
        advisory: Option<HealthAdvisory>,
    ) -> Self {
        Self {
            locator,
            retriever,
            text_options,
            advisory,
            extractor: extract::extract,
        }
    }

    pub fn from_context(
        context: &'a RunContext,
        browser: &'a dyn BrowserLauncher,
        advisory: Option<HealthAdvisory>,
    ) -> Self {
        let config = &context.config;
        let locator = FundLocator::new(
            &context.client,
            &config.fund_api_base_url,
            config.fund_api_provider_id,
            &config.source_base_url,
        );
        let mut options = RetrieverOptions::new(
            &config.source_base_url,
            context.downloads_dir(),
            config.min_pdf_bytes,
        );
        options.degraded = advisory.as_ref().is_some_and(|advisory| advisory.degraded_mode);
        let retriever = DocumentRetriever::new(&context.client, &context.cache, browser, options);
        Self::new(locator, retriever, TextOptions::from(config), advisory)
    }

    pub fn with_extractor(mut self, extractor: DocumentExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn process(&self, query: &str, series_code: Option<&str>) -> FundRecord {
        let mut record = FundRecord::new(query, now_utc_string());
        record.health = self.advisory.clone();
        if let Some(advisory) = self.advisory.as_ref().filter(|advisory| advisory.status != "healthy") {
            record.warnings.push(format!(
                "source health was {} at {}",
                advisory.status, advisory.checked_at
            ));
        }

        let identity = match self.locator.locate(query, series_code) {
            Ok(identity) => identity,
            Err(error) => {
                record_failure(&mut record, &error);
                return record;
            }
        };
        record.identity = Some(identity.clone());

        let document = match self.retriever.retrieve(&identity) {
            Ok(document) => document,
            Err(error) => {
                record.warnings.push("document unavailable, extraction skipped".to_string());
                record_failure(&mut record, &error);
                return record;
            }
        };
        record.document = Some(summarize(&document));

        match (self.extractor)(&document.bytes, &self.text_options) {
            Ok((extraction, _)) => record.extraction = extraction,
            Err(error) => {
                warn!(query, error = %format!("{error:#}"), "text extraction failed");
                record.error = Some(RecordError {
                    kind: "extraction_failed".to_string(),
                    message: format!("{error:#}"),
                });
            }
        }

        fill_from_identity(&mut record.extraction, &identity);
        if record.extraction.confidence_level == Confidence::Low {
            record.warnings.push(format!(
                "low extraction confidence, {} fields populated",
                record.extraction.populated_fields().len()
            ));
        }

        info!(
            query,
            registry_id = %identity.registry_id,
            origin = document.origin.as_str(),
            fields = record.extraction.populated_fields().len(),
            confidence = ?record.extraction.confidence_level,
            "fund processed"
        );
        record
    }
}

fn record_failure(record: &mut FundRecord, error: &FundError) {
    warn!(query = %record.fund_query, kind = error.kind(), error = %error, "fund processing stopped");
    record.error = Some(RecordError {
        kind: error.kind().to_string(),
        message: error.to_string(),
    });
}

fn summarize(document: &RetrievedDocument) -> DocumentSummary {
    DocumentSummary {
        source_path: document.source_path.clone(),
        origin: document.origin,
        size_bytes: document.bytes.len() as u64,
        sha256: sha256_hex(&document.bytes),
    }
}

/// Echoes the resolved identity into the result and fills fee and asset
/// fields the document did not provide from the listing API's series quote.
/// Document values always win.
pub fn fill_from_identity(result: &mut ExtractionResult, identity: &FundIdentity) {
    result.registry_id = Some(identity.registry_id.clone());
    result.record_provenance("registry_id", LOCATOR_PROVENANCE);
    if let Some(series_code) = &identity.series_code {
        result.series_code = Some(series_code.clone());
        result.record_provenance("series_code", LOCATOR_PROVENANCE);
    }

    let Some(quote) = identity.quote() else {
        return;
    };
    if result.management_fee.is_none()
        && let Some(fee) = quote.management_fee.map(api_fraction)
    {
        result.management_fee = Some(fee);
        result.record_provenance("management_fee", FUND_API_PROVENANCE);
    }
    if result.redemption_fee.is_none()
        && let Some(fee) = quote.redemption_fee.map(api_fraction)
    {
        result.redemption_fee = Some(fee);
        result.record_provenance("redemption_fee", FUND_API_PROVENANCE);
    }
    if result.net_assets.is_none()
        && let Some(net_assets) = quote.net_assets
    {
        result.net_assets = Some(net_assets);
        result.record_provenance("net_assets", FUND_API_PROVENANCE);
    }
}

/// The listing API reports fees either as fractions or as percentages.
fn api_fraction(value: f64) -> f64 {
    if value > 1.0 { value / 100.0 } else { value }
}
