//! Display formatting for costs, durations and counts.

const MISSING: &str = "—";

/// `$0.0123`, or a dash when unknown.
pub fn format_cost(cost: Option<f64>) -> String {
    match cost {
        Some(cost) => format!("${:.4}", cost),
        None => MISSING.to_string(),
    }
}

/// Seconds with one decimal, e.g. `1.2s`.
pub fn format_duration(duration_ms: Option<i64>) -> String {
    match duration_ms {
        Some(ms) => format!("{:.1}s", ms as f64 / 1000.0),
        None => MISSING.to_string(),
    }
}

/// Thousands-separated integer, e.g. `12,345`.
pub fn format_number(value: Option<u64>) -> String {
    let Some(value) = value else {
        return MISSING.to_string();
    };
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Whole minutes and seconds, e.g. `2m 5s`.
pub fn format_elapsed(elapsed_ms: u64) -> String {
    let total_seconds = elapsed_ms / 1000;
    format!("{}m {}s", total_seconds / 60, total_seconds % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_cost() {
        assert_eq!(format_cost(Some(0.012345)), "$0.0123");
        assert_eq!(format_cost(Some(0.0)), "$0.0000");
        assert_eq!(format_cost(None), "—");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Some(1240)), "1.2s");
        assert_eq!(format_duration(Some(0)), "0.0s");
        assert_eq!(format_duration(None), "—");
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(Some(0)), "0");
        assert_eq!(format_number(Some(999)), "999");
        assert_eq!(format_number(Some(1000)), "1,000");
        assert_eq!(format_number(Some(1234567)), "1,234,567");
        assert_eq!(format_number(None), "—");
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(0), "0m 0s");
        assert_eq!(format_elapsed(59_999), "0m 59s");
        assert_eq!(format_elapsed(125_000), "2m 5s");
    }
}
