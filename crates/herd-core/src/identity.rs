pub const DEFAULT_COUNTRY_CODE: &str = "+254";

/// Canonical sender identity for an inbound SMS number.
///
/// Numbers already carrying an international `+` prefix are kept as-is. Local
/// numbers get `country_code` prepended after their leading zeros are dropped.
pub fn normalize_identity(raw: &str, country_code: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with('+') {
        return trimmed.to_string();
    }
    let code = if country_code.starts_with('+') {
        country_code.to_string()
    } else {
        format!("+{country_code}")
    };
    format!("{code}{}", trimmed.trim_start_matches('0'))
}

/// Splits a recipients field that may be a comma separated string.
pub fn split_recipients(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}
