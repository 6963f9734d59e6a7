//! Isolates the JSON payload inside a raw LLM completion.

const FENCE: &str = "```";

/// Strip LLM formatting around a JSON payload.
///
/// Prefers the interior of the first fenced block, with or without a
/// language tag. Without a fence, takes the span from the first `{` to the
/// last `}`. Never fails: text with neither is returned unchanged and the
/// parse step reports it.
pub fn extract_json(raw: &str) -> String {
    if let Some(inner) = fenced_interior(raw) {
        return strip_backticks(inner);
    }

    match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if start < end => strip_backticks(&raw[start..=end]),
        _ => raw.to_string(),
    }
}

fn strip_backticks(text: &str) -> String {
    text.trim().trim_matches('`').trim().to_string()
}

fn fenced_interior(raw: &str) -> Option<&str> {
    let open = raw.find(FENCE)?;
    let after_open = &raw[open + FENCE.len()..];

    // A language tag is a single word running to the end of the opening line
    let body = match after_open.find('\n') {
        Some(newline) if is_language_tag(&after_open[..newline]) => &after_open[newline + 1..],
        _ => after_open,
    };

    let close = body.find(FENCE)?;
    Some(body[..close].trim())
}

fn is_language_tag(line: &str) -> bool {
    line.trim()
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+'))
}
