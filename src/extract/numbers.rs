/// Parses a percentage figure as printed in local documents ("0,65", "-1.2",
/// "45,20") and returns it as a fraction (0.0065, -0.012, 0.452).
pub fn parse_percent_number(raw: &str) -> Option<f64> {
    parse_decimal(raw).map(|value| value / 100.0)
}

/// Decimal with a single separator, either `,` or `.`.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let cleaned = raw.trim().trim_end_matches('%').trim().replace(',', ".");
    if cleaned.is_empty() || cleaned.matches('.').count() > 1 {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|value| value.is_finite())
}

/// Parses a monetary amount with thousands separators ("806.202.087",
/// "1,246,638,652", "1.500.000,50").
///
/// The last separator is treated as decimal only when it is followed by one
/// or two digits; every other separator groups thousands.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let trimmed = raw
        .trim()
        .trim_matches(|character: char| !character.is_ascii_digit());
    if trimmed.is_empty() {
        return None;
    }

    let last_separator = trimmed.rfind(['.', ',']);
    let (integer_part, fraction_part) = match last_separator {
        Some(index) if (1..=2).contains(&(trimmed.len() - index - 1)) => {
            (&trimmed[..index], Some(&trimmed[index + 1..]))
        }
        _ => (trimmed, None),
    };

    let digits = integer_part
        .chars()
        .filter(|character| character.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty()
        || integer_part
            .chars()
            .any(|character| !character.is_ascii_digit() && character != '.' && character != ',')
    {
        return None;
    }

    let number = match fraction_part {
        Some(fraction) => format!("{digits}.{fraction}"),
        None => digits,
    };
    number.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(left: f64, right: f64) -> bool {
        (left - right).abs() < 1e-9
    }

    #[test]
    fn percent_numbers_accept_both_decimal_marks() {
        assert!(parse_percent_number("0,6500").is_some_and(|value| close(value, 0.0065)));
        assert!(parse_percent_number("-1.25%").is_some_and(|value| close(value, -0.0125)));
        assert!(parse_percent_number("45,20").is_some_and(|value| close(value, 0.452)));
        assert_eq!(parse_percent_number("1.2.3"), None);
        assert_eq!(parse_percent_number(""), None);
    }

    #[test]
    fn amounts_strip_thousands_separators() {
        assert_eq!(parse_amount("806.202.087"), Some(806_202_087.0));
        assert_eq!(parse_amount("1,246,638,652"), Some(1_246_638_652.0));
        assert_eq!(parse_amount("1.500.000,50"), Some(1_500_000.5));
        assert_eq!(parse_amount("5000"), Some(5000.0));
        assert_eq!(parse_amount("..."), None);
    }
}
