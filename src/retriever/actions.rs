use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::model::DEFAULT_SERIES_CODE;

/// Client-side function the disclosures tab wires to each document link.
pub const ACTION_FUNCTION: &str = "verFolleto";

static ACTION_INVOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"verFolleto\(\s*'([^']*)'\s*,\s*'([^']*)'\s*,\s*'([^']*)'\s*\)")
        .expect("valid action invocation regex")
});
static TABLE_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)folletos\s+informativos.*vigentes").expect("valid table heading regex")
});
static SHORT_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{2}/\d{2}/\d{4}").expect("valid date regex"));
static ONCLICK: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("[onclick]").expect("valid onclick selector"));
static TABLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table").expect("valid table selector"));
static ROW: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").expect("valid row selector"));
static CELL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("td").expect("valid cell selector"));
static DOC_ICON: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("img[src]").expect("valid image selector"));

/// Parameters of one `verFolleto(runFondo, serie, rutAdmin)` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionParams {
    pub fund_run: String,
    pub series_code: String,
    pub administrator_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesRow {
    pub series_code: String,
    pub filed_on: Option<String>,
}

/// Where the series list for a disclosures page came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeriesSource {
    Actions(Vec<ActionParams>),
    Table(Vec<SeriesRow>),
    Assumed,
}

/// Every action invocation on the page, one per distinct series, in page order.
pub fn parse_action_invocations(html: &str) -> Vec<ActionParams> {
    let document = Html::parse_document(html);
    let mut found: Vec<ActionParams> = Vec::new();

    for element in document.select(&ONCLICK) {
        let Some(onclick) = element.value().attr("onclick") else {
            continue;
        };
        for captures in ACTION_INVOCATION.captures_iter(onclick) {
            let params = ActionParams {
                fund_run: captures[1].trim().to_string(),
                series_code: captures[2].trim().to_string(),
                administrator_id: captures[3].trim().to_string(),
            };
            if params.series_code.is_empty()
                || found
                    .iter()
                    .any(|known| known.series_code == params.series_code)
            {
                continue;
            }
            found.push(params);
        }
    }

    found
}

pub fn count_action_elements(html: &str) -> usize {
    let document = Html::parse_document(html);
    document
        .select(&ONCLICK)
        .filter(|element| {
            element
                .value()
                .attr("onclick")
                .is_some_and(|onclick| onclick.contains(ACTION_FUNCTION))
        })
        .count()
}

/// Table fallback: rows of the "Folletos Informativos ... VIGENTES" table that
/// carry a document icon. The series is the short upper-case cell.
pub fn parse_series_table(html: &str) -> Vec<SeriesRow> {
    let document = Html::parse_document(html);
    let Some(table) = find_disclosure_table(&document) else {
        return Vec::new();
    };

    let mut rows = Vec::new();
    for row in table.select(&ROW) {
        let cells = row.select(&CELL).collect::<Vec<_>>();
        if cells.len() < 4 || !has_document_icon(row) {
            continue;
        }

        let mut series_code = None;
        let mut filed_on = None;
        for cell in &cells {
            let text = element_text(*cell);
            if filed_on.is_none() && SHORT_DATE.is_match(&text) {
                filed_on = Some(text[..10].to_string());
            }
            if is_series_label(&text) {
                series_code = Some(text);
            }
        }

        if series_code.is_some() || filed_on.is_some() {
            rows.push(SeriesRow {
                series_code: series_code.unwrap_or_else(|| DEFAULT_SERIES_CODE.to_string()),
                filed_on,
            });
        }
    }
    rows
}

pub fn has_series_table(html: &str) -> bool {
    find_disclosure_table(&Html::parse_document(html)).is_some()
}

/// Action invocations first, then the table heuristic, then a single assumed series.
pub fn discover_series(html: &str) -> SeriesSource {
    let actions = parse_action_invocations(html);
    if !actions.is_empty() {
        return SeriesSource::Actions(actions);
    }
    let rows = parse_series_table(html);
    if !rows.is_empty() {
        return SeriesSource::Table(rows);
    }
    SeriesSource::Assumed
}

fn find_disclosure_table(document: &Html) -> Option<ElementRef<'_>> {
    let tables = document.select(&TABLE).collect::<Vec<_>>();

    // Innermost table whose own text carries the heading.
    let heading_table = tables
        .iter()
        .filter(|table| TABLE_HEADING.is_match(&element_text(**table)))
        .min_by_key(|table| table.descendants().count())
        .copied();
    if heading_table.is_some_and(|table| table.select(&ROW).any(has_document_icon)) {
        return heading_table;
    }

    // Heading outside any table: take the first table after it in document order.
    let html = document.root_element().html();
    let heading_at = TABLE_HEADING.find(&html)?.start();
    tables.into_iter().find(|table| {
        html.find(&table.html())
            .is_some_and(|position| position > heading_at)
    })
}

fn has_document_icon(row: ElementRef<'_>) -> bool {
    row.select(&DOC_ICON).any(|image| {
        image
            .value()
            .attr("src")
            .is_some_and(|src| src.to_ascii_lowercase().contains("doc.gif"))
    })
}

fn is_series_label(text: &str) -> bool {
    !text.is_empty()
        && text.chars().count() < 20
        && text.chars().any(char::is_alphabetic)
        && !text.chars().any(char::is_lowercase)
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
