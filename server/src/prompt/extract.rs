use once_cell::sync::Lazy;
use regex::Regex;

static RE_JSON_OBJECT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{.*\}").unwrap());

/// Pulls the widest `{ ... }` span out of free-form model output and parses it.
/// Returns `None` when there is no span or it is not valid JSON.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let span = RE_JSON_OBJECT.find(text)?;
    serde_json::from_str(span.as_str()).ok()
}
