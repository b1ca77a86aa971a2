pub fn decode_sjis(bytes: &[u8]) -> String {
    let (text, _, had_errors) = encoding_rs::SHIFT_JIS.decode(bytes);
    if had_errors {
        tracing::debug!("shift-jis decode replaced malformed sequences");
    }
    text.into_owned()
}

/// `2025-06-01`, `2025/06/01` and `20250601` all become `20250601`.
pub fn normalize_date(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

// Quotes and blanks, full-width spaces included.
pub fn clean_field(raw: &str) -> String {
    raw.trim_matches(|c: char| c == '"' || c == '\'' || c.is_whitespace())
        .to_string()
}

/// Integer value of a quantity field with leading zeros stripped.
/// Anything that is not a plain integer yields 0.
pub fn parse_count(raw: &str) -> i64 {
    let trimmed = raw.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return 0;
    }
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return 0;
    }
    let value = digits.parse::<i64>().unwrap_or(0);
    if negative { -value } else { value }
}

/// Renders a JSON number as stored text: `12.0` → `12`, `1.5` → `1.5`.
pub fn format_quantity(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}
