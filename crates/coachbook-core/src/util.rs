//! Small shared helpers.

/// Trim an optional string, mapping whitespace-only values to `None`.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Whether a value carries an `http://` or `https://` scheme.
pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Shorten arbitrary response text for inclusion in error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(160).collect()
}
