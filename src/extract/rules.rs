use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::debug;

use super::numbers::{parse_amount, parse_percent_number};
use crate::model::{ExtractionResult, InvestmentHorizon, RiskProfile};

/// Lines after an anchor that belong to a paragraph-scoped value.
const PARAGRAPH_CONTINUATION_LINES: usize = 4;
const MAX_TEXT_CHARS: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    AdministratorName,
    FundType,
    RiskScale,
    RiskProfile,
    RiskTolerance,
    IdealInvestorProfile,
    InvestmentObjective,
    InvestmentHorizon,
    RedemptionWindowDays,
    FundDuration,
    MinimumInvestment,
    ManagementFee,
    RedemptionFee,
    TotalAnnualCost,
    IndustryAverageTotalAnnualCost,
    Return12m,
    Return24m,
    Return36m,
    NominalReturns,
    AnnualizedReturns,
    BestReturns,
    WorstReturns,
    NetAssets,
}

impl Field {
    /// Map fields collect every match; scalar fields keep the first.
    fn collects_all(self) -> bool {
        matches!(
            self,
            Self::NominalReturns | Self::AnnualizedReturns | Self::BestReturns | Self::WorstReturns
        )
    }

    fn is_populated(self, result: &ExtractionResult) -> bool {
        match self {
            Self::AdministratorName => result.administrator_name.is_some(),
            Self::FundType => result.fund_type.is_some(),
            Self::RiskScale => result.risk_scale_code.is_some(),
            Self::RiskProfile => result.risk_profile.is_some(),
            Self::RiskTolerance => result.risk_tolerance.is_some(),
            Self::IdealInvestorProfile => result.ideal_investor_profile.is_some(),
            Self::InvestmentObjective => result.investment_objective.is_some(),
            Self::InvestmentHorizon => result.investment_horizon.is_some(),
            Self::RedemptionWindowDays => result.redemption_window_days.is_some(),
            Self::FundDuration => result.fund_duration.is_some(),
            Self::MinimumInvestment => result.minimum_investment_amount.is_some(),
            Self::ManagementFee => result.management_fee.is_some(),
            Self::RedemptionFee => result.redemption_fee.is_some(),
            Self::TotalAnnualCost => result.total_annual_cost.is_some(),
            Self::IndustryAverageTotalAnnualCost => {
                result.industry_average_total_annual_cost.is_some()
            }
            Self::Return12m => result.return_12m.is_some(),
            Self::Return24m => result.return_24m.is_some(),
            Self::Return36m => result.return_36m.is_some(),
            Self::NominalReturns => !result.nominal_returns.is_empty(),
            Self::AnnualizedReturns => !result.annualized_returns.is_empty(),
            Self::BestReturns => !result.best_returns.is_empty(),
            Self::WorstReturns => !result.worst_returns.is_empty(),
            Self::NetAssets => result.net_assets.is_some(),
        }
    }
}

/// Where a rule looks for its pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Document,
    /// Each line containing one of the anchors.
    Line,
    /// The anchor line plus the following lines, `n` lines in total.
    Window(usize),
    /// Text after the anchor on its line joined with its continuation lines.
    Paragraph,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Fraction(f64),
    Days(u32),
    Amount { value: f64, currency: Option<String> },
    RiskScale(u8),
    Risk(RiskProfile),
    Horizon { horizon: InvestmentHorizon, months: u32 },
    Period { key: String, value: f64 },
}

#[derive(Debug, Clone, Copy)]
pub enum Normalize {
    /// Group 1 as free text.
    Text,
    /// A fixed label once the pattern fires.
    Label(&'static str),
    /// Group 1 as a percentage, stored as a fraction.
    Percent,
    /// As `Percent`, rejecting zero and negative values.
    PositivePercent,
    Days,
    /// Group 1 currency code, group 2 a `$` sign, group 3 the amount.
    Amount { default_currency: Option<&'static str> },
    RiskScale,
    Risk(RiskProfile),
    Horizon(InvestmentHorizon),
    HorizonMonths,
    HorizonYears,
    /// Group 1 period label, group 2 percentage.
    PeriodReturn,
}

impl Normalize {
    fn apply(self, captures: &Captures<'_>) -> Option<Value> {
        let group = |index: usize| captures.get(index).map(|found| found.as_str());
        match self {
            Self::Text => clean_text(group(1)?).map(Value::Text),
            Self::Label(label) => Some(Value::Text(label.to_string())),
            Self::Percent => parse_percent_number(group(1)?).map(Value::Fraction),
            Self::PositivePercent => parse_percent_number(group(1)?)
                .filter(|value| *value > 0.0)
                .map(Value::Fraction),
            Self::Days => group(1)?.parse().ok().map(Value::Days),
            Self::Amount { default_currency } => {
                let value = parse_amount(group(3)?)?;
                let currency = group(1)
                    .map(str::to_string)
                    .or_else(|| group(2).map(|_| "CLP".to_string()))
                    .or_else(|| default_currency.map(str::to_string));
                Some(Value::Amount { value, currency })
            }
            Self::RiskScale => group(1)?.parse().ok().map(Value::RiskScale),
            Self::Risk(profile) => Some(Value::Risk(profile)),
            Self::Horizon(horizon) => Some(Value::Horizon {
                horizon,
                months: horizon.nominal_months(),
            }),
            Self::HorizonMonths => {
                let months: u32 = group(1)?.parse().ok()?;
                Some(Value::Horizon {
                    horizon: InvestmentHorizon::from_months(months),
                    months,
                })
            }
            Self::HorizonYears => {
                let years: u32 = group(1)?.parse().ok()?;
                let horizon = match years {
                    0..=1 => InvestmentHorizon::ShortTerm,
                    2..=3 => InvestmentHorizon::MediumTerm,
                    _ => InvestmentHorizon::LongTerm,
                };
                Some(Value::Horizon {
                    horizon,
                    months: years.checked_mul(12)?,
                })
            }
            Self::PeriodReturn => Some(Value::Period {
                key: period_key(group(1)?),
                value: parse_percent_number(group(2)?)?,
            }),
        }
    }
}

pub struct FieldRule {
    pub id: &'static str,
    pub field: Field,
    /// Lowercase substrings; a line must contain one of them. Ignored for
    /// document scope.
    pub anchors: &'static [&'static str],
    pub scope: Scope,
    pub pattern: Regex,
    pub normalize: Normalize,
}

impl FieldRule {
    fn new(
        id: &'static str,
        field: Field,
        anchors: &'static [&'static str],
        scope: Scope,
        pattern: &str,
        normalize: Normalize,
    ) -> Self {
        let pattern = Regex::new(pattern)
            .unwrap_or_else(|error| panic!("invalid pattern for rule {id}: {error}"));
        Self {
            id,
            field,
            anchors,
            scope,
            pattern,
            normalize,
        }
    }

    fn segments(&self, text: &str, lines: &[&str], lowered: &[String]) -> Vec<String> {
        match self.scope {
            Scope::Document => vec![text.to_string()],
            Scope::Line => anchor_lines(self.anchors, lowered)
                .map(|index| lines[index].to_string())
                .collect(),
            Scope::Window(size) => anchor_lines(self.anchors, lowered)
                .flat_map(|start| start..(start + size).min(lines.len()))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .map(|index| lines[index].to_string())
                .collect(),
            Scope::Paragraph => anchor_lines(self.anchors, lowered)
                .filter_map(|index| paragraph_after(lines, lowered, index, self.anchors))
                .collect(),
        }
    }

    /// Every value the rule yields over the text, in document order.
    pub fn values(&self, text: &str, lines: &[&str], lowered: &[String]) -> Vec<Value> {
        self.segments(text, lines, lowered)
            .iter()
            .flat_map(|segment| {
                self.pattern
                    .captures_iter(segment)
                    .filter_map(|captures| self.normalize.apply(&captures))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

const ADMIN_LABEL: &[&str] = &["administradora:", "administradora :"];
const ADMIN_LEGAL_NAME: &[&str] = &["administradora general de fondos"];
const HORIZON: &[&str] = &["horizonte"];
const RISK_TOLERANCE: &[&str] = &["tolerancia al riesgo"];
const INVESTOR_PROFILE: &[&str] = &[
    "perfil del inversionista",
    "perfil de inversionista",
    "tipo de inversionista",
    "dirigido a",
];
const OBJECTIVE: &[&str] = &[
    "objetivo del fondo",
    "objetivo de inversión",
    "objetivo de inversion",
    "objetivo:",
];
const REDEMPTION_WINDOW: &[&str] = &[
    "plazo de rescate",
    "plazo de pago",
    "pago de rescates",
    "plazo máximo de pago",
];
const DURATION: &[&str] = &[
    "duración del fondo",
    "duracion del fondo",
    "plazo de duración",
    "plazo de duracion",
];
const MINIMUM_INVESTMENT: &[&str] = &[
    "monto mínimo",
    "monto minimo",
    "inversión mínima",
    "inversion minima",
];
const MANAGEMENT_FEE: &[&str] = &["remun"];
const MANAGEMENT_FEE_LABEL: &[&str] = &["comisión de administración", "comision de administracion"];
const REDEMPTION_FEE: &[&str] = &[
    "comisión máxima",
    "comision maxima",
    "comision rescate",
    "comisión de rescate",
    "comision de rescate",
];
const SERIES_COST: &[&str] = &["tac serie"];
const INDUSTRY_COST: &[&str] = &["tac industria", "tac promedio", "promedio industria"];
const RETURNS: &[&str] = &["rentabilidades anualizadas", "1 año"];
const NOMINAL_RETURNS: &[&str] = &["rentabilidad nominal", "rentabilidades nominales"];
const ANNUALIZED_RETURNS: &[&str] = &["rentabilidades anualizadas", "rentabilidad anualizada"];
const BEST_RETURNS: &[&str] = &["mejor"];
const WORST_RETURNS: &[&str] = &["peor"];
const NET_ASSETS: &[&str] = &["patrimonio serie", "patrimonio total"];

const PERIOD_RETURN: &str =
    r"(?i)(\d+\s+(?:mes(?:es)?|años?)|ytd|año\s+actual)\s*:?\s+(-?\d+[.,]?\d*)\s*%";
const AMOUNT: &str = r"(?:\b(CLP|USD|EUR|UF)\s*)?(\$)?\s*(\d[\d.,]*)";

/// Ordered rule battery. Within a field, earlier rules win.
pub static RULES: LazyLock<Vec<FieldRule>> = LazyLock::new(|| {
    use Field as F;
    use Normalize as N;
    use Scope as S;

    vec![
        FieldRule::new(
            "administrator.label",
            F::AdministratorName,
            ADMIN_LABEL,
            S::Line,
            r"(?i)administradora\s*:\s*(\S[^\n]{2,})",
            N::Text,
        ),
        FieldRule::new(
            "administrator.legal_name",
            F::AdministratorName,
            ADMIN_LEGAL_NAME,
            S::Line,
            r"(?i)(\S[^:\n]*?administradora general de fondos(?:\s+s\.?\s?a\.?)?)",
            N::Text,
        ),
        FieldRule::new(
            "fund_type.conservative",
            F::FundType,
            &[],
            S::Document,
            r"(?i)conservador|capital garantizado|preservation|preservación",
            N::Label("Conservador"),
        ),
        FieldRule::new(
            "fund_type.aggressive",
            F::FundType,
            &[],
            S::Document,
            r"(?i)agresivo|aggressive|growth|crecimiento|accionario",
            N::Label("Agresivo"),
        ),
        FieldRule::new(
            "fund_type.balanced",
            F::FundType,
            &[],
            S::Document,
            r"(?i)balanceado|balanced|mixto|mixed|moderado",
            N::Label("Balanceado"),
        ),
        FieldRule::new(
            "fund_type.dynamic",
            F::FundType,
            &[],
            S::Document,
            r"(?i)dinámico|dynamic|flexible",
            N::Label("Dinámico"),
        ),
        FieldRule::new(
            "fund_type.liquidity",
            F::FundType,
            &[],
            S::Document,
            r"(?i)liquidez|liquidity|money market|monetario|disponible",
            N::Label("Liquidez"),
        ),
        FieldRule::new(
            "risk.scale_code",
            F::RiskScale,
            &[],
            S::Document,
            r"\bR([1-7])\b",
            N::RiskScale,
        ),
        FieldRule::new(
            "risk.keywords_low",
            F::RiskProfile,
            &[],
            S::Document,
            r"(?i)riesgo\s+bajo|bajo\s+riesgo|conservador|risk:\s*low",
            N::Risk(RiskProfile::Low),
        ),
        FieldRule::new(
            "risk.keywords_high",
            F::RiskProfile,
            &[],
            S::Document,
            r"(?i)riesgo\s+alto|alto\s+riesgo|agresivo|risk:\s*high",
            N::Risk(RiskProfile::High),
        ),
        FieldRule::new(
            "risk.keywords_medium",
            F::RiskProfile,
            &[],
            S::Document,
            r"(?i)riesgo\s+medio|riesgo\s+moderado|moderado|risk:\s*medium",
            N::Risk(RiskProfile::Medium),
        ),
        FieldRule::new(
            "risk_tolerance.label",
            F::RiskTolerance,
            RISK_TOLERANCE,
            S::Line,
            r"(?i)tolerancia\s+al\s+riesgo\s*:?\s*(\S[^\n]*)",
            N::Text,
        ),
        FieldRule::new(
            "investor_profile.paragraph",
            F::IdealInvestorProfile,
            INVESTOR_PROFILE,
            S::Paragraph,
            r"(?s)(\S.{9,})",
            N::Text,
        ),
        FieldRule::new(
            "objective.paragraph",
            F::InvestmentObjective,
            OBJECTIVE,
            S::Paragraph,
            r"(?s)(\S.{9,})",
            N::Text,
        ),
        FieldRule::new(
            "horizon.months",
            F::InvestmentHorizon,
            HORIZON,
            S::Line,
            r"(?i)(\d+)\s*meses",
            N::HorizonMonths,
        ),
        FieldRule::new(
            "horizon.years",
            F::InvestmentHorizon,
            HORIZON,
            S::Line,
            r"(?i)(\d+)\s*años?",
            N::HorizonYears,
        ),
        FieldRule::new(
            "horizon.short_term",
            F::InvestmentHorizon,
            HORIZON,
            S::Line,
            r"(?i)corto\s+plazo",
            N::Horizon(InvestmentHorizon::ShortTerm),
        ),
        FieldRule::new(
            "horizon.medium_term",
            F::InvestmentHorizon,
            HORIZON,
            S::Line,
            r"(?i)(?:mediano|medio)\s+plazo",
            N::Horizon(InvestmentHorizon::MediumTerm),
        ),
        FieldRule::new(
            "horizon.long_term",
            F::InvestmentHorizon,
            HORIZON,
            S::Line,
            r"(?i)largo\s+plazo",
            N::Horizon(InvestmentHorizon::LongTerm),
        ),
        FieldRule::new(
            "redemption_window.days",
            F::RedemptionWindowDays,
            REDEMPTION_WINDOW,
            S::Line,
            r"(?i)(\d{1,3})\s*d[ií]as",
            N::Days,
        ),
        FieldRule::new(
            "duration.label",
            F::FundDuration,
            DURATION,
            S::Line,
            r"(?i)duraci[oó]n(?:\s+del\s+fondo)?\s*:?\s*(\S[^\n]*)",
            N::Text,
        ),
        FieldRule::new(
            "minimum_investment.amount",
            F::MinimumInvestment,
            MINIMUM_INVESTMENT,
            S::Line,
            AMOUNT,
            N::Amount {
                default_currency: None,
            },
        ),
        FieldRule::new(
            "management_fee.remuneration",
            F::ManagementFee,
            MANAGEMENT_FEE,
            S::Line,
            r"(\d+[.,]\d+)\s*%?",
            N::Percent,
        ),
        FieldRule::new(
            "management_fee.label",
            F::ManagementFee,
            MANAGEMENT_FEE_LABEL,
            S::Line,
            r"(\d+[.,]\d+)\s*%?",
            N::Percent,
        ),
        FieldRule::new(
            "redemption_fee.maximum",
            F::RedemptionFee,
            REDEMPTION_FEE,
            S::Line,
            r"^\D*(\d+[.,]\d+)",
            N::PositivePercent,
        ),
        FieldRule::new(
            "total_annual_cost.series",
            F::TotalAnnualCost,
            SERIES_COST,
            S::Line,
            r"(?i)tac\s+serie[^\d\n]*(\d+[.,]\d+)",
            N::Percent,
        ),
        FieldRule::new(
            "total_annual_cost.industry",
            F::IndustryAverageTotalAnnualCost,
            INDUSTRY_COST,
            S::Line,
            r"(?i)(?:industria|promedio)[^\d\n]*(\d+[.,]\d+)",
            N::Percent,
        ),
        FieldRule::new(
            "returns.one_year",
            F::Return12m,
            RETURNS,
            S::Window(10),
            r"(?i)\b1\s+año\s+(-?\d+[.,]?\d*)\s*%",
            N::Percent,
        ),
        FieldRule::new(
            "returns.two_years",
            F::Return24m,
            RETURNS,
            S::Window(10),
            r"(?i)\b2\s+años?\s+(-?\d+[.,]?\d*)\s*%",
            N::Percent,
        ),
        FieldRule::new(
            "returns.three_or_five_years",
            F::Return36m,
            RETURNS,
            S::Window(10),
            r"(?i)\b[35]\s+años?\s+(-?\d+[.,]?\d*)\s*%",
            N::Percent,
        ),
        FieldRule::new(
            "returns.nominal_table",
            F::NominalReturns,
            NOMINAL_RETURNS,
            S::Window(8),
            PERIOD_RETURN,
            N::PeriodReturn,
        ),
        FieldRule::new(
            "returns.annualized_table",
            F::AnnualizedReturns,
            ANNUALIZED_RETURNS,
            S::Window(8),
            PERIOD_RETURN,
            N::PeriodReturn,
        ),
        FieldRule::new(
            "returns.best_period",
            F::BestReturns,
            BEST_RETURNS,
            S::Line,
            r"(?i)mejor\s+(mes|trimestre|semestre|año)[^\d\n-]*(-?\d+[.,]?\d*)\s*%",
            N::PeriodReturn,
        ),
        FieldRule::new(
            "returns.worst_period",
            F::WorstReturns,
            WORST_RETURNS,
            S::Line,
            r"(?i)peor\s+(mes|trimestre|semestre|año)[^\d\n-]*(-?\d+[.,]?\d*)\s*%",
            N::PeriodReturn,
        ),
        FieldRule::new(
            "net_assets.amount",
            F::NetAssets,
            NET_ASSETS,
            S::Line,
            AMOUNT,
            N::Amount {
                default_currency: Some("CLP"),
            },
        ),
    ]
});

/// Runs every rule over `text`, filling fields that are still empty.
pub fn apply_rules(text: &str, result: &mut ExtractionResult) {
    let lines = text.lines().collect::<Vec<_>>();
    let lowered = lines
        .iter()
        .map(|line| line.to_lowercase())
        .collect::<Vec<_>>();

    for rule in RULES.iter() {
        let collects_all = rule.field.collects_all();
        if !collects_all && rule.field.is_populated(result) {
            continue;
        }

        let mut fired = false;
        for value in rule.values(text, &lines, &lowered) {
            if assign(result, rule.field, value, rule.id) {
                fired = true;
                if !collects_all {
                    break;
                }
            }
        }
        if fired {
            debug!(rule = rule.id, "extraction rule fired");
        }
    }
}

/// Writes `value` into the field and records the rule as its source.
/// Returns false when the value does not fit the field.
fn assign(result: &mut ExtractionResult, field: Field, value: Value, rule_id: &str) -> bool {
    let source = format!("document:{rule_id}");
    let named = match (field, value) {
        (Field::AdministratorName, Value::Text(text)) => {
            result.administrator_name = Some(text);
            vec!["administrator_name"]
        }
        (Field::FundType, Value::Text(text)) => {
            result.fund_type = Some(text);
            vec!["fund_type"]
        }
        (Field::RiskScale, Value::RiskScale(rung)) => {
            let Some(profile) = RiskProfile::from_scale(rung) else {
                return false;
            };
            result.risk_scale_code = Some(rung);
            let mut named = vec!["risk_scale_code"];
            if result.risk_profile.is_none() {
                result.risk_profile = Some(profile);
                named.push("risk_profile");
            }
            named
        }
        (Field::RiskProfile, Value::Risk(profile)) => {
            result.risk_profile = Some(profile);
            vec!["risk_profile"]
        }
        (Field::RiskTolerance, Value::Text(text)) => {
            result.risk_tolerance = Some(text);
            vec!["risk_tolerance"]
        }
        (Field::IdealInvestorProfile, Value::Text(text)) => {
            result.ideal_investor_profile = Some(text);
            vec!["ideal_investor_profile"]
        }
        (Field::InvestmentObjective, Value::Text(text)) => {
            result.investment_objective = Some(text);
            vec!["investment_objective"]
        }
        (Field::InvestmentHorizon, Value::Horizon { horizon, months }) => {
            result.investment_horizon = Some(horizon);
            result.investment_horizon_months = Some(months);
            vec!["investment_horizon", "investment_horizon_months"]
        }
        (Field::RedemptionWindowDays, Value::Days(days)) => {
            result.redemption_window_days = Some(days);
            vec!["redemption_window_days"]
        }
        (Field::FundDuration, Value::Text(text)) => {
            result.fund_duration = Some(text);
            vec!["fund_duration"]
        }
        (Field::MinimumInvestment, Value::Amount { value, currency }) => {
            result.minimum_investment_amount = Some(value);
            let mut named = vec!["minimum_investment_amount"];
            if currency.is_some() {
                result.currency = currency;
                named.push("currency");
            }
            named
        }
        (Field::ManagementFee, Value::Fraction(fraction)) => {
            result.management_fee = Some(fraction);
            vec!["management_fee"]
        }
        (Field::RedemptionFee, Value::Fraction(fraction)) => {
            result.redemption_fee = Some(fraction);
            vec!["redemption_fee"]
        }
        (Field::TotalAnnualCost, Value::Fraction(fraction)) => {
            result.total_annual_cost = Some(fraction);
            vec!["total_annual_cost"]
        }
        (Field::IndustryAverageTotalAnnualCost, Value::Fraction(fraction)) => {
            result.industry_average_total_annual_cost = Some(fraction);
            vec!["industry_average_total_annual_cost"]
        }
        (Field::Return12m, Value::Fraction(fraction)) => {
            result.return_12m = Some(fraction);
            vec!["return_12m"]
        }
        (Field::Return24m, Value::Fraction(fraction)) => {
            result.return_24m = Some(fraction);
            vec!["return_24m"]
        }
        (Field::Return36m, Value::Fraction(fraction)) => {
            result.return_36m = Some(fraction);
            vec!["return_36m"]
        }
        (Field::NominalReturns, Value::Period { key, value }) => {
            result.nominal_returns.entry(key).or_insert(value);
            vec!["nominal_returns"]
        }
        (Field::AnnualizedReturns, Value::Period { key, value }) => {
            result.annualized_returns.entry(key).or_insert(value);
            vec!["annualized_returns"]
        }
        (Field::BestReturns, Value::Period { key, value }) => {
            result.best_returns.entry(key).or_insert(value);
            vec!["best_returns"]
        }
        (Field::WorstReturns, Value::Period { key, value }) => {
            result.worst_returns.entry(key).or_insert(value);
            vec!["worst_returns"]
        }
        (Field::NetAssets, Value::Amount { value, currency }) => {
            result.net_assets = Some(value);
            let mut named = vec!["net_assets"];
            if currency.is_some() {
                result.net_assets_currency = currency;
                named.push("net_assets_currency");
            }
            named
        }
        (field, value) => {
            debug!(rule = rule_id, ?field, ?value, "rule value does not fit its field");
            return false;
        }
    };

    for name in named {
        result.provenance.entry(name.to_string()).or_insert_with(|| source.clone());
    }
    true
}

fn anchor_lines<'t>(
    anchors: &'static [&'static str],
    lowered: &'t [String],
) -> impl Iterator<Item = usize> + 't {
    lowered
        .iter()
        .enumerate()
        .filter(move |(_, line)| anchors.iter().any(|anchor| line.contains(anchor)))
        .map(|(index, _)| index)
}

/// Anchor remainder plus continuation lines, stopping at a blank line or at
/// a line that opens a new label.
fn paragraph_after(
    lines: &[&str],
    lowered: &[String],
    index: usize,
    anchors: &[&str],
) -> Option<String> {
    let line_lower = &lowered[index];
    let anchor_end = anchors
        .iter()
        .filter_map(|anchor| line_lower.find(anchor).map(|at| at + anchor.len()))
        .min()?;
    let line = lines[index];
    // Lowercasing can shift byte offsets for some characters; fall back to the whole line.
    let rest = line
        .get(anchor_end..)
        .filter(|_| line_lower.len() == line.len())
        .unwrap_or(line);
    let mut parts = vec![rest.trim_start_matches([':', ' ', '\t', '-']).trim().to_string()];

    for next in lines.iter().skip(index + 1).take(PARAGRAPH_CONTINUATION_LINES) {
        let trimmed = next.trim();
        if trimmed.is_empty() || opens_label(trimmed) {
            break;
        }
        parts.push(trimmed.to_string());
    }

    let joined = parts
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (!joined.is_empty()).then_some(joined)
}

fn opens_label(line: &str) -> bool {
    let head = line.split(':').next().unwrap_or_default();
    (line.contains(':') && head.split_whitespace().count() <= 4)
        || (line.len() > 3
            && line
                .chars()
                .filter(|character| character.is_alphabetic())
                .all(char::is_uppercase))
}

fn clean_text(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_matches(|character: char| character == ':' || character == '-');
    let trimmed = trimmed.trim();
    if trimmed.chars().count() < 3 {
        return None;
    }
    Some(trimmed.chars().take(MAX_TEXT_CHARS).collect())
}

/// "1 año" -> "12m", "6 meses" -> "6m", "mes" -> "month".
fn period_key(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let words = lowered.split_whitespace().collect::<Vec<_>>();
    match words.as_slice() {
        [count, unit] => match count.parse::<u32>() {
            Ok(count) if unit.starts_with("mes") => format!("{count}m"),
            Ok(count) if unit.starts_with("año") => format!("{}m", count * 12),
            _ => words.join("_"),
        },
        ["ytd"] => "ytd".to_string(),
        ["mes"] => "month".to_string(),
        ["año"] => "year".to_string(),
        [single] => single.to_string(),
        _ => {
            if lowered.contains("actual") {
                "ytd".to_string()
            } else {
                words.join("_")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(text: &str) -> ExtractionResult {
        let mut result = ExtractionResult::default();
        apply_rules(text, &mut result);
        result
    }

    fn close(left: Option<f64>, right: f64) -> bool {
        left.is_some_and(|value| (value - right).abs() < 1e-9)
    }

    #[test]
    fn rule_ids_are_unique() {
        let ids = RULES.iter().map(|rule| rule.id).collect::<BTreeSet<_>>();
        assert_eq!(ids.len(), RULES.len());
    }

    #[test]
    fn fees_and_costs_become_fractions() {
        let result = run(
            "Remun. Anual Máx. (%) 0,6500\n\
             Comisión máxima de colocación 0,00 2,38\n\
             Comisión de rescate 1,50% antes de 30 días\n\
             TAC Serie A 1,20%   TAC Industria 1,55%",
        );

        assert!(close(result.management_fee, 0.0065));
        assert!(close(result.redemption_fee, 0.015));
        assert!(close(result.total_annual_cost, 0.012));
        assert!(close(result.industry_average_total_annual_cost, 0.0155));
        assert_eq!(
            result.provenance.get("management_fee").map(String::as_str),
            Some("document:management_fee.remuneration")
        );
    }

    #[test]
    fn risk_scale_sets_rung_and_profile() {
        let result = run("Clasificación de riesgo: R5\nFondo de riesgo bajo");
        assert_eq!(result.risk_scale_code, Some(5));
        assert_eq!(result.risk_profile, Some(RiskProfile::High));
        assert_eq!(
            result.provenance.get("risk_profile").map(String::as_str),
            Some("document:risk.scale_code")
        );
    }

    #[test]
    fn risk_keywords_apply_without_scale() {
        let result = run("Este es un fondo de bajo riesgo.");
        assert_eq!(result.risk_scale_code, None);
        assert_eq!(result.risk_profile, Some(RiskProfile::Low));
    }

    #[test]
    fn horizon_prefers_explicit_duration() {
        let months = run("Horizonte de inversión: largo plazo, al menos 18 meses");
        assert_eq!(months.investment_horizon, Some(InvestmentHorizon::MediumTerm));
        assert_eq!(months.investment_horizon_months, Some(18));

        let years = run("Horizonte recomendado 5 años");
        assert_eq!(years.investment_horizon, Some(InvestmentHorizon::LongTerm));
        assert_eq!(years.investment_horizon_months, Some(60));

        let category = run("Horizonte de inversión: corto plazo");
        assert_eq!(category.investment_horizon, Some(InvestmentHorizon::ShortTerm));
        assert_eq!(category.investment_horizon_months, Some(12));
    }

    #[test]
    fn returns_are_read_near_their_heading() {
        let result = run(
            "Rentabilidades anualizadas\n\
             1 Año 0,48%\n\
             2 Años -1,5%\n\
             3 Años 5,10%",
        );
        assert!(close(result.return_12m, 0.0048));
        assert!(close(result.return_24m, -0.015));
        assert!(close(result.return_36m, 0.051));
        assert!(close(result.annualized_returns.get("12m").copied(), 0.0048));
        assert!(close(result.annualized_returns.get("36m").copied(), 0.051));
    }

    #[test]
    fn best_and_worst_periods_are_keyed() {
        let result = run("Mejor mes: 3,2%\nPeor trimestre -4,75%");
        assert!(close(result.best_returns.get("month").copied(), 0.032));
        assert!(close(result.worst_returns.get("trimestre").copied(), -0.0475));
    }

    #[test]
    fn amounts_carry_currency() {
        let result = run(
            "Patrimonio Serie A $806.202.087\n\
             Monto mínimo de inversión: USD 5.000",
        );
        assert_eq!(result.net_assets, Some(806_202_087.0));
        assert_eq!(result.net_assets_currency.as_deref(), Some("CLP"));
        assert_eq!(result.minimum_investment_amount, Some(5_000.0));
        assert_eq!(result.currency.as_deref(), Some("USD"));
    }

    #[test]
    fn paragraphs_follow_their_label() {
        let result = run(
            "Objetivo del fondo: invertir en instrumentos de deuda de corto plazo\n\
             emitidos por el Estado y bancos nacionales.\n\
             \n\
             Perfil del inversionista:\n\
             Personas naturales con tolerancia baja a pérdidas.\n\
             Administradora: Banco Ejemplo Asset Management AGF S.A.\n\
             Tolerancia al riesgo: Baja\n\
             Plazo de rescate: 10 días corridos\n\
             Duración del fondo: Indefinida",
        );

        assert_eq!(
            result.investment_objective.as_deref(),
            Some(
                "invertir en instrumentos de deuda de corto plazo emitidos por el Estado y bancos nacionales."
            )
        );
        assert_eq!(
            result.ideal_investor_profile.as_deref(),
            Some("Personas naturales con tolerancia baja a pérdidas.")
        );
        assert_eq!(
            result.administrator_name.as_deref(),
            Some("Banco Ejemplo Asset Management AGF S.A.")
        );
        assert_eq!(result.risk_tolerance.as_deref(), Some("Baja"));
        assert_eq!(result.redemption_window_days, Some(10));
        assert_eq!(result.fund_duration.as_deref(), Some("Indefinida"));
    }

    #[test]
    fn unmatched_text_leaves_fields_empty() {
        let result = run("Documento sin datos relevantes.");
        assert!(result.populated_fields().is_empty());
        assert!(result.provenance.is_empty());
    }
}
