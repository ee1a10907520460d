use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::util::{non_whitespace_char_count, safe_file_stem, scratch_path};

#[derive(Debug, Clone)]
pub struct TextOptions {
    /// Below this many non-whitespace characters the OCR pass runs.
    pub min_text_chars: usize,
    pub ocr_lang: String,
    pub ocr_max_pages: usize,
}

impl From<&Config> for TextOptions {
    fn from(config: &Config) -> Self {
        Self {
            min_text_chars: config.min_text_chars,
            ocr_lang: config.ocr_lang.clone(),
            ocr_max_pages: config.ocr_max_pages,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TextSource {
    Pdftotext,
    Ocr,
}

#[derive(Debug, Clone)]
pub struct ExtractedText {
    pub text: String,
    pub page_count: usize,
    pub source: TextSource,
}

/// Text of an in-memory PDF. The bytes go through a scratch file because the
/// extraction tools only read from disk.
pub fn extract_text(bytes: &[u8], options: &TextOptions) -> Result<ExtractedText> {
    let scratch = scratch_path("document", "pdf");
    fs::write(&scratch, bytes)
        .with_context(|| format!("failed to write scratch pdf {}", scratch.display()))?;
    let result = extract_text_from_path(&scratch, options);
    let _ = fs::remove_file(&scratch);
    result
}

pub fn extract_text_from_path(pdf_path: &Path, options: &TextOptions) -> Result<ExtractedText> {
    let direct = match extract_pages_with_pdftotext(pdf_path) {
        Ok(pages) => Some(pages),
        Err(error) => {
            warn!(path = %pdf_path.display(), error = %format!("{error:#}"), "pdftotext failed");
            None
        }
    };

    let direct_text = direct.as_ref().map(|pages| pages.join("\n")).unwrap_or_default();
    let direct_chars = non_whitespace_char_count(&direct_text);
    let page_count = direct.as_ref().map(Vec::len).unwrap_or_default();

    if direct.is_some() && direct_chars >= options.min_text_chars {
        debug!(pages = page_count, chars = direct_chars, "direct text extraction sufficient");
        return Ok(ExtractedText {
            text: direct_text,
            page_count,
            source: TextSource::Pdftotext,
        });
    }

    if !command_available("pdftoppm") || !command_available("tesseract") {
        if direct.is_none() {
            bail!(
                "no text could be extracted from {}: pdftotext failed and OCR tools are unavailable",
                pdf_path.display()
            );
        }
        warn!(
            chars = direct_chars,
            floor = options.min_text_chars,
            "text below floor but pdftoppm/tesseract are unavailable"
        );
        return Ok(ExtractedText {
            text: direct_text,
            page_count,
            source: TextSource::Pdftotext,
        });
    }

    info!(
        chars = direct_chars,
        floor = options.min_text_chars,
        max_pages = options.ocr_max_pages,
        "text below floor, running OCR"
    );
    let ocr_pages = (1..=options.ocr_max_pages.max(1))
        .take_while(|page| page_count == 0 || *page <= page_count)
        .map_while(|page| match extract_page_with_ocr(pdf_path, page, &options.ocr_lang) {
            Ok(text) => Some(text),
            Err(error) => {
                debug!(page, error = %format!("{error:#}"), "OCR stopped");
                None
            }
        })
        .collect::<Vec<_>>();
    let ocr_text = ocr_pages.join("\n");

    let (text, source) = choose_longer(direct_text, ocr_text);
    info!(
        source = ?source,
        chars = non_whitespace_char_count(&text),
        "text extraction finished"
    );
    Ok(ExtractedText {
        text,
        page_count: page_count.max(ocr_pages.len()),
        source,
    })
}

/// Keeps whichever extraction carries more non-whitespace content.
pub fn choose_longer(direct: String, ocr: String) -> (String, TextSource) {
    if non_whitespace_char_count(&ocr) > non_whitespace_char_count(&direct) {
        (ocr, TextSource::Ocr)
    } else {
        (direct, TextSource::Pdftotext)
    }
}

/// Splits pdftotext output on form feeds and drops trailing blank pages.
pub fn split_pages(raw: &str) -> Vec<String> {
    let mut pages = raw
        .split('\u{000C}')
        .map(|chunk| chunk.replace('\u{0000}', ""))
        .collect::<Vec<_>>();
    while pages.last().is_some_and(|page| page.trim().is_empty()) {
        pages.pop();
    }
    pages
}

fn command_available(program: &str) -> bool {
    Command::new(program).arg("--version").output().is_ok()
}

/// Whole-document text on stdout, pages separated by form feeds.
fn pdftotext_command(pdf_path: &Path) -> Command {
    let mut command = Command::new("pdftotext");
    command
        .arg("-enc")
        .arg("UTF-8")
        .arg("-f")
        .arg("1")
        .arg(pdf_path)
        .arg("-");
    command
}

fn extract_pages_with_pdftotext(pdf_path: &Path) -> Result<Vec<String>> {
    let output = pdftotext_command(pdf_path)
        .output()
        .with_context(|| format!("failed to execute pdftotext for {}", pdf_path.display()))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "pdftotext returned non-zero exit status for {}: {}",
            pdf_path.display(),
            stderr.trim()
        );
    }

    Ok(split_pages(&String::from_utf8_lossy(&output.stdout)))
}

fn extract_page_with_ocr(pdf_path: &Path, page_number: usize, ocr_lang: &str) -> Result<String> {
    let stem = pdf_path
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("pdf");
    let png_path = scratch_path(&format!("ocr_{}_{page_number}", safe_file_stem(stem)), "png");
    // pdftoppm appends the extension itself.
    let output_root = png_path.with_extension("");

    let rendered = Command::new("pdftoppm")
        .arg("-f")
        .arg(page_number.to_string())
        .arg("-l")
        .arg(page_number.to_string())
        .arg("-singlefile")
        .arg("-png")
        .arg(pdf_path)
        .arg(&output_root)
        .output()
        .with_context(|| format!("failed to execute pdftoppm for {}", pdf_path.display()))?;
    if !rendered.status.success() {
        let stderr = String::from_utf8_lossy(&rendered.stderr);
        bail!(
            "pdftoppm returned non-zero exit status for {} page {}: {}",
            pdf_path.display(),
            page_number,
            stderr.trim()
        );
    }
    if !png_path.exists() {
        bail!(
            "pdftoppm did not produce an image for {} page {}",
            pdf_path.display(),
            page_number
        );
    }

    let recognized = Command::new("tesseract")
        .arg(&png_path)
        .arg("stdout")
        .arg("-l")
        .arg(ocr_lang)
        .output()
        .with_context(|| format!("failed to execute tesseract for {}", png_path.display()))?;
    let _ = fs::remove_file(&png_path);

    if !recognized.status.success() {
        let stderr = String::from_utf8_lossy(&recognized.stderr);
        bail!(
            "tesseract returned non-zero exit status for {} page {}: {}",
            pdf_path.display(),
            page_number,
            stderr.trim()
        );
    }

    Ok(String::from_utf8_lossy(&recognized.stdout)
        .replace('\u{0000}', "")
        .trim()
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_pages_drops_trailing_blank_pages() {
        let pages = split_pages("page one\u{000C}page two\u{0000}\u{000C}  \n\u{000C}");
        assert_eq!(pages, vec!["page one".to_string(), "page two".to_string()]);
    }

    #[test]
    fn pdftotext_reads_every_page() {
        let command = pdftotext_command(Path::new("/tmp/folleto.pdf"));
        let args = command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(args, vec!["-enc", "UTF-8", "-f", "1", "/tmp/folleto.pdf", "-"]);
    }

    #[test]
    fn longer_extraction_wins() {
        let (text, source) = choose_longer("ab".to_string(), "a b c d".to_string());
        assert_eq!(source, TextSource::Ocr);
        assert_eq!(text, "a b c d");

        let (_, source) = choose_longer("abcd".to_string(), "a b".to_string());
        assert_eq!(source, TextSource::Pdftotext);
    }
}
