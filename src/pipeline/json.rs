//! Pulling JSON out of model replies.

/// Extract a JSON object or array from an LLM reply that may wrap it in
/// prose or a markdown fence.
pub fn extract_json(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return trimmed.to_string();
    }

    // Wrapped in markdown code block
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') || inner.starts_with('[') {
                return inner.to_string();
            }
        }
    }

    // Try to find object bounds, then array bounds
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close))
            && end > start
        {
            return trimmed[start..=end].to_string();
        }
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_object() {
        assert_eq!(extract_json(r#"  {"a":1} "#), r#"{"a":1}"#);
    }

    #[test]
    fn bare_array() {
        assert_eq!(extract_json(r#"[{"id":"1"}]"#), r#"[{"id":"1"}]"#);
    }

    #[test]
    fn fenced_json() {
        let text = "Here you go:\n```json\n{\"results\": []}\n```\nDone.";
        assert_eq!(extract_json(text), "{\"results\": []}");
    }

    #[test]
    fn plain_fence() {
        let text = "```\n[1, 2]\n```";
        assert_eq!(extract_json(text), "[1, 2]");
    }

    #[test]
    fn embedded_in_prose() {
        let text = "Sure! {\"results\": [{\"id\": \"1\"}]} hope that helps";
        assert_eq!(extract_json(text), "{\"results\": [{\"id\": \"1\"}]}");
    }

    #[test]
    fn no_json_returns_trimmed_text() {
        assert_eq!(extract_json("  nothing here "), "nothing here");
    }
}
