//! Shared utility functions used across the codebase.

/// Parse an environment variable as a boolean, returning `default` if unset.
///
/// Recognises `1`, `true`, `yes`, `y`, `on` (case-insensitive) as `true`;
/// everything else maps to `false`.
pub fn env_var_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        Err(_) => default,
    }
}

/// Find the largest char boundary at or before `max_bytes`.
pub fn safe_truncate_index(s: &str, max_bytes: usize) -> usize {
    if s.len() <= max_bytes {
        return s.len();
    }
    s.char_indices()
        .take_while(|(i, _)| *i < max_bytes)
        .last()
        .map(|(i, c)| {
            let end = i + c.len_utf8();
            if end > max_bytes {
                i
            } else {
                end
            }
        })
        .unwrap_or(0)
}

/// Truncate a string to at most `max_bytes`, safe for UTF-8.
pub fn truncate(s: &str, max_bytes: usize) -> &str {
    &s[..safe_truncate_index(s, max_bytes)]
}

/// Derive a conversation title from the first words of a query.
pub fn derive_title(query: &str, max_chars: usize) -> String {
    let collapsed = query.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let prefix: String = collapsed.chars().take(max_chars).collect();
    format!("{}...", prefix.trim_end())
}
