//! Shared helpers: canonical numeric formatting.

/// Renders a float in the canonical form used by `code()` and diagnostics.
///
/// Integral values (within i64 range) are written as plain integers;
/// everything else uses 17-significant-digit scientific notation with a
/// signed, two-digit exponent, e.g. `1.00000000000000002e-03`. Both forms
/// tokenize back to the exact same f64.
pub fn format_float(value: f64) -> String {
    if value.is_finite() && value == value.trunc() && value.abs() < 1e17 {
        return format!("{}", value as i64);
    }
    let formatted = format!("{:.17e}", value);
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let exp: i32 = exponent.parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, exp.abs())
        }
        None => formatted,
    }
}

#[cfg(test)]
mod tests {
    use super::format_float;

    #[test]
    fn integers_stay_integers() {
        assert_eq!(format_float(0.0), "0");
        assert_eq!(format_float(5.0), "5");
        assert_eq!(format_float(-3.0), "-3");
        assert_eq!(format_float(1e6), "1000000");
    }

    #[test]
    fn fractions_use_scientific_notation() {
        assert_eq!(format_float(-2.5), "-2.50000000000000000e+00");
        assert!(format_float(0.001).ends_with("e-03"));
    }

    #[test]
    fn round_trips_through_parse() {
        for &value in &[0.1, 1.0 / 3.0, 9.87654321e-12, -4.2e17, 123.456] {
            let text = format_float(value);
            assert_eq!(text.parse::<f64>().unwrap(), value, "{text}");
        }
    }
}
