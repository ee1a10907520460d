mod confidence;
mod numbers;
mod portfolio;
mod rules;
mod text;

use anyhow::Result;
use tracing::info;

use crate::model::ExtractionResult;

pub use confidence::{CONFIDENCE_FIELDS, confidence_for, grade, populated_ratio};
pub use numbers::{parse_amount, parse_decimal, parse_percent_number};
pub use portfolio::{MAX_PORTFOLIO_ENTRIES, PortfolioStrategy, classify_asset, extract_portfolio};
pub use rules::{Field, RULES, apply_rules};
pub use text::{
    ExtractedText, TextOptions, TextSource, choose_longer, extract_text, extract_text_from_path,
    split_pages,
};

/// Mines every field from already extracted document text.
pub fn extract_fields(text: &str) -> ExtractionResult {
    let mut result = ExtractionResult::default();
    apply_rules(text, &mut result);

    if let Some((entries, strategy)) = extract_portfolio(text) {
        result.portfolio_composition = entries;
        result.record_provenance(
            "portfolio_composition",
            &format!("document:portfolio.{}", strategy.as_str()),
        );
    }

    result.confidence_level = confidence_for(&result);
    result
}

/// Text extraction followed by field extraction over a PDF held in memory.
pub fn extract(bytes: &[u8], options: &TextOptions) -> Result<(ExtractionResult, ExtractedText)> {
    let text = extract_text(bytes, options)?;
    let result = extract_fields(&text.text);
    info!(
        pages = text.page_count,
        text_source = ?text.source,
        fields = result.populated_fields().len(),
        confidence = ?result.confidence_level,
        "document fields extracted"
    );
    Ok((result, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssetCategory, Confidence};

    const PROSPECTUS: &str = "\
FOLLETO INFORMATIVO
Administradora: Administradora General de Fondos Ejemplo S.A.
Tipo de fondo: Fondo Mutuo Conservador
Objetivo del fondo: invertir en instrumentos de deuda de corto plazo
emitidos por el Estado y bancos locales.

Perfil de riesgo R2
Plazo de rescate: 10 días hábiles
Remuneración anual máxima: 0,65% IVA incluido
Comisión de colocación diferida al rescate: 1,50%
TAC Serie 0,72%
TAC Industria 1,10%
Rentabilidad últimos 12 meses: 4,35%
Patrimonio total: $ 806.202.087

Composición de la cartera
Bonos Banco Central 1.234.567 45,00%
Depósitos a plazo 987.654 40,00%
Caja y bancos 150.000 15,00%
";

    #[test]
    fn portfolio_block_extracts_sorted_categorized_entries() {
        let result = extract_fields("Treasury Bonds 45,20%\nCorporate Bonds 30,10%\nEquities 24,70%");
        let entries = &result.portfolio_composition;

        assert_eq!(entries.len(), 3);
        let total = entries.iter().map(|entry| entry.weight).sum::<f64>() * 100.0;
        assert!((total - 100.0).abs() <= 1.0);
        assert!(entries.windows(2).all(|pair| pair[0].weight >= pair[1].weight));
        assert_eq!(entries[0].category, AssetCategory::GovernmentFixedIncome);
        assert_eq!(entries[1].category, AssetCategory::CorporateFixedIncome);
        assert_eq!(entries[2].category, AssetCategory::LocalEquity);
        assert_eq!(
            result.provenance.get("portfolio_composition").map(String::as_str),
            Some("document:portfolio.inline_percent")
        );
    }

    #[test]
    fn every_populated_field_has_provenance() {
        let result = extract_fields(PROSPECTUS);
        let populated = result.populated_fields();

        assert!(populated.contains(&"management_fee"));
        assert!(populated.contains(&"portfolio_composition"));
        for field in populated {
            assert!(
                result.provenance.contains_key(field),
                "{field} populated without provenance"
            );
        }
    }

    #[test]
    fn prospectus_fields_and_confidence() {
        let result = extract_fields(PROSPECTUS);

        assert!(result.management_fee.is_some_and(|fee| (fee - 0.0065).abs() < 1e-9));
        assert!(result.total_annual_cost.is_some_and(|tac| (tac - 0.0072).abs() < 1e-9));
        assert_eq!(result.risk_scale_code, Some(2));
        assert_eq!(result.net_assets, Some(806_202_087.0));
        assert_eq!(result.portfolio_composition.len(), 3);
        assert!(result.confidence_level >= Confidence::Medium);
    }

    #[test]
    fn text_without_matches_yields_nulls_and_low_confidence() {
        let result = extract_fields("Documento sin contenido reconocible.\nPágina 1 de 1");

        assert!(result.populated_fields().is_empty());
        assert!(result.provenance.is_empty());
        assert_eq!(result.confidence_level, Confidence::Low);
    }

    #[test]
    fn removing_text_never_raises_confidence() {
        let full = extract_fields(PROSPECTUS);
        let trimmed_text = PROSPECTUS
            .lines()
            .filter(|line| !line.contains('%'))
            .collect::<Vec<_>>()
            .join("\n");
        let trimmed = extract_fields(&trimmed_text);

        assert!(trimmed.populated_fields().len() < full.populated_fields().len());
        assert!(trimmed.confidence_level <= full.confidence_level);
    }
}
