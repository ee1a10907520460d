use crate::model::{Confidence, ExtractionResult};

/// Fields whose presence drives the confidence grade.
pub const CONFIDENCE_FIELDS: [&str; 12] = [
    "administrator_name",
    "fund_type",
    "risk_profile",
    "investment_horizon",
    "management_fee",
    "redemption_fee",
    "total_annual_cost",
    "return_12m",
    "return_24m",
    "return_36m",
    "net_assets",
    "portfolio_composition",
];

const HIGH_RATIO: f64 = 0.7;
const MEDIUM_RATIO: f64 = 0.4;

pub fn populated_ratio(result: &ExtractionResult) -> f64 {
    let populated = result.populated_fields();
    let hits = CONFIDENCE_FIELDS
        .iter()
        .filter(|field| populated.contains(field))
        .count();
    hits as f64 / CONFIDENCE_FIELDS.len() as f64
}

pub fn grade(ratio: f64) -> Confidence {
    if ratio >= HIGH_RATIO {
        Confidence::High
    } else if ratio >= MEDIUM_RATIO {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

pub fn confidence_for(result: &ExtractionResult) -> Confidence {
    grade(populated_ratio(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grade_boundaries() {
        assert_eq!(grade(0.0), Confidence::Low);
        assert_eq!(grade(0.39), Confidence::Low);
        assert_eq!(grade(0.4), Confidence::Medium);
        assert_eq!(grade(0.7), Confidence::High);
        assert_eq!(grade(1.0), Confidence::High);
    }

    #[test]
    fn fields_outside_the_graded_set_do_not_count() {
        let mut result = ExtractionResult {
            fund_duration: Some("Indefinida".to_string()),
            risk_tolerance: Some("Baja".to_string()),
            ..ExtractionResult::default()
        };
        assert_eq!(populated_ratio(&result), 0.0);

        result.management_fee = Some(0.0065);
        assert!((populated_ratio(&result) - 1.0 / 12.0).abs() < 1e-9);
    }

    #[test]
    fn adding_fields_never_lowers_confidence() {
        let mut result = ExtractionResult::default();
        let mut previous = confidence_for(&result);
        let fills: [fn(&mut ExtractionResult); 9] = [
            |r| r.fund_type = Some("Conservador".to_string()),
            |r| r.management_fee = Some(0.01),
            |r| r.redemption_fee = Some(0.02),
            |r| r.return_12m = Some(0.05),
            |r| r.return_24m = Some(0.08),
            |r| r.net_assets = Some(1.0e9),
            |r| r.total_annual_cost = Some(0.012),
            |r| r.administrator_name = Some("Administradora".to_string()),
            |r| r.return_36m = Some(0.1),
        ];
        for fill in fills {
            fill(&mut result);
            let current = confidence_for(&result);
            assert!(current >= previous);
            previous = current;
        }
        assert_eq!(previous, Confidence::High);
    }
}
