//! Extraction of structured data from free-form model replies.

use serde::de::DeserializeOwned;

/// Strip a surrounding markdown code fence, if the reply is wrapped in one.
pub fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (```json, ```markdown, ...).
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    match body.rfind("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

/// Locate the outermost JSON object or array in `raw`.
pub fn extract_json(raw: &str) -> Result<&str, String> {
    let text = strip_fences(raw);
    let start = text
        .find(['{', '['])
        .ok_or_else(|| "response contains no JSON object".to_string())?;
    let close = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text
        .rfind(close)
        .filter(|end| *end > start)
        .ok_or_else(|| "response JSON is not terminated".to_string())?;
    Ok(&text[start..=end])
}

pub fn parse_json<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
    let json = extract_json(raw)?;
    serde_json::from_str(json).map_err(|e| format!("response JSON does not match the schema: {e}"))
}
