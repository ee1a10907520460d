use std::fs;

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::cli::ExtractArgs;
use crate::commands::context::RECORDS_DIR;
use crate::commands::process::record_path;
use crate::config::Config;
use crate::extract::{TextOptions, extract_fields, extract_text_from_path};
use crate::model::{DocumentOrigin, DocumentSummary, FundRecord};
use crate::retriever::has_pdf_signature;
use crate::util::{now_utc_string, sha256_hex, write_json_pretty};

/// Runs the field extractor over a PDF already on disk.
pub fn run(args: ExtractArgs) -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    let bytes =
        fs::read(&args.pdf).with_context(|| format!("failed to read {}", args.pdf.display()))?;
    if !has_pdf_signature(&bytes) {
        bail!("{} does not start with a pdf signature", args.pdf.display());
    }

    let label = args
        .pdf
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("document")
        .to_string();
    info!(pdf = %args.pdf.display(), size_bytes = bytes.len(), "extracting local document");

    let text = extract_text_from_path(&args.pdf, &TextOptions::from(&config))?;
    if let Some(text_path) = &args.dump_text {
        fs::write(text_path, &text.text)
            .with_context(|| format!("failed to write {}", text_path.display()))?;
    }

    let mut record = FundRecord::new(&label, now_utc_string());
    record.document = Some(DocumentSummary {
        source_path: args.pdf.display().to_string(),
        origin: DocumentOrigin::LocalFile,
        size_bytes: bytes.len() as u64,
        sha256: sha256_hex(&bytes),
    });
    record.extraction = extract_fields(&text.text);

    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| record_path(&args.cache_root.join(RECORDS_DIR), &label));
    write_json_pretty(&output_path, &record)?;

    info!(
        pages = text.page_count,
        text_source = ?text.source,
        fields = record.extraction.populated_fields().len(),
        confidence = ?record.extraction.confidence_level,
        output = %output_path.display(),
        "local extraction finished"
    );
    Ok(())
}
