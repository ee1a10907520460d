use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use super::numbers::parse_percent_number;
use crate::model::{AssetCategory, PortfolioEntry};

pub const MAX_PORTFOLIO_ENTRIES: usize = 15;
const MIN_LABEL_CHARS: usize = 4;
const SECTION_SCAN_LINES: usize = 40;
const TABLE_SCAN_LINES: usize = 30;

/// Checked in order; the first category with a matching keyword wins.
const CATEGORY_KEYWORDS: [(AssetCategory, &[&str]); 7] = [
    (
        AssetCategory::GovernmentFixedIncome,
        &[
            "tesorería",
            "tesoreria",
            "gobierno",
            "bcp",
            "btu",
            "banco central",
            "treasury",
            "government",
            "soberano",
        ],
    ),
    (
        AssetCategory::CorporateFixedIncome,
        &[
            "corporativo",
            "bonos",
            "pagarés",
            "pagares",
            "depósitos",
            "depositos",
            "corporate",
            "bonds",
            "letras",
        ],
    ),
    (
        AssetCategory::InternationalEquity,
        &["internacional", "extranjero", "eeuu", "usa", "international"],
    ),
    (
        AssetCategory::LocalEquity,
        &["acciones", "equity", "equities", "chilenas"],
    ),
    (
        AssetCategory::MutualFunds,
        &["fondo mutuo", "fondos mutuos", "mutual fund", "cuotas de fondos"],
    ),
    (
        AssetCategory::Derivatives,
        &["derivados", "derivatives", "forwards", "opciones"],
    ),
    (AssetCategory::Cash, &["efectivo", "cash", "liquidez", "caja"]),
];

/// Label words that mark fee, cost or return lines rather than holdings.
const NON_HOLDING_STEMS: [&str; 14] = [
    "remun", "comisi", "rentab", "tac", "iva", "año", "mes", "rescate", "tasa", "riesgo", "máx",
    "max", "gasto", "costo",
];

static INLINE_HOLDING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-zÁÉÍÓÚÑÜáéíóúñü][A-Za-zÁÉÍÓÚÑÜáéíóúñü\s\.]*?)\s+(\d+[.,]?\d*)\s*%\s*$")
        .expect("valid inline holding regex")
});
static SECTION_HOLDING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\S.*?)\s+\$?\s*\d[\d.,]*\s+(\d+[.,]?\d*)\s*%\s*$")
        .expect("valid section holding regex")
});
static SECTION_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)composici[oó]n\s+(?:de\s+la\s+|del\s+)?(?:cartera|portafolio|inversiones)|cartera\s+de\s+inversiones")
        .expect("valid composition heading regex")
});
static TABLE_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:instrumento|activo|tipo\s+de\s+inversi[oó]n)\b.*(?:%|porcentaje)")
        .expect("valid table header regex")
});
static CELL_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s{2,}|\t").expect("valid cell separator regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortfolioStrategy {
    InlinePercent,
    CompositionSection,
    TableHeader,
}

impl PortfolioStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InlinePercent => "inline_percent",
            Self::CompositionSection => "composition_section",
            Self::TableHeader => "table_header",
        }
    }
}

pub fn classify_asset(label: &str) -> AssetCategory {
    let lowered = label.to_lowercase();
    CATEGORY_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|keyword| lowered.contains(keyword)))
        .map(|(category, _)| *category)
        .unwrap_or(AssetCategory::Other)
}

/// Holdings from the first strategy that finds any, deduplicated, sorted by
/// weight and capped.
pub fn extract_portfolio(text: &str) -> Option<(Vec<PortfolioEntry>, PortfolioStrategy)> {
    let lines = text.lines().collect::<Vec<_>>();
    let strategies: [(PortfolioStrategy, fn(&[&str]) -> Vec<(String, f64)>); 3] = [
        (PortfolioStrategy::InlinePercent, inline_holdings),
        (PortfolioStrategy::CompositionSection, section_holdings),
        (PortfolioStrategy::TableHeader, table_holdings),
    ];

    strategies.into_iter().find_map(|(strategy, scan)| {
        let entries = finalize(scan(&lines));
        (!entries.is_empty()).then_some((entries, strategy))
    })
}

fn inline_holdings(lines: &[&str]) -> Vec<(String, f64)> {
    lines
        .iter()
        .filter_map(|line| INLINE_HOLDING.captures(line))
        .filter_map(|captures| holding(&captures[1], &captures[2]))
        .collect()
}

fn section_holdings(lines: &[&str]) -> Vec<(String, f64)> {
    let Some(start) = lines.iter().position(|line| SECTION_HEADING.is_match(line)) else {
        return Vec::new();
    };
    lines
        .iter()
        .skip(start + 1)
        .take(SECTION_SCAN_LINES)
        .filter_map(|line| SECTION_HOLDING.captures(line))
        .filter_map(|captures| holding(&captures[1], &captures[2]))
        .collect()
}

fn table_holdings(lines: &[&str]) -> Vec<(String, f64)> {
    let Some(header) = lines.iter().position(|line| TABLE_HEADER.is_match(line)) else {
        return Vec::new();
    };
    lines
        .iter()
        .skip(header + 1)
        .take(TABLE_SCAN_LINES)
        .filter_map(|line| {
            let cells = CELL_SPLIT
                .split(line.trim())
                .filter(|cell| !cell.is_empty())
                .collect::<Vec<_>>();
            match cells.as_slice() {
                [label, .., last] => holding(label, last),
                _ => None,
            }
        })
        .collect()
}

fn holding(label: &str, weight: &str) -> Option<(String, f64)> {
    let label = label.split_whitespace().collect::<Vec<_>>().join(" ");
    let label = label.trim_end_matches(['.', ':']).trim().to_string();
    if label.chars().count() < MIN_LABEL_CHARS
        || !label.chars().any(char::is_alphabetic)
        || is_non_holding(&label)
    {
        return None;
    }
    let weight = parse_percent_number(weight)?;
    (weight > 0.0 && weight <= 1.0).then_some((label, weight))
}

fn is_non_holding(label: &str) -> bool {
    label
        .to_lowercase()
        .split_whitespace()
        .map(|word| word.trim_matches(|character: char| !character.is_alphanumeric()))
        .any(|word| NON_HOLDING_STEMS.iter().any(|stem| word.starts_with(stem)))
}

fn finalize(raw: Vec<(String, f64)>) -> Vec<PortfolioEntry> {
    let mut seen = HashSet::new();
    let mut entries = raw
        .into_iter()
        .filter(|(label, _)| seen.insert(label.to_lowercase()))
        .map(|(label, weight)| PortfolioEntry {
            category: classify_asset(&label),
            label,
            weight,
        })
        .collect::<Vec<_>>();
    entries.sort_by(|left, right| right.weight.total_cmp(&left.weight));
    entries.truncate(MAX_PORTFOLIO_ENTRIES);
    entries
}
