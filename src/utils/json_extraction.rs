//! Structured-output extraction from model replies.
//!
//! Replies may wrap their payload in markdown fences or surround it with
//! reasoning text. The JSON extractor tries, in order:
//! 1. a ```json fenced block
//! 2. any fenced block containing an object
//! 3. the whole reply when it starts with `{`
//! 4. the largest valid object anywhere, preferring later ones
//!
//! [`extract_code_block`] does the same for non-JSON artifacts such as
//! Dockerfiles and shell scripts.

use regex::Regex;

/// Outcome of a JSON extraction attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonExtractionResult {
    Success(String),
    /// Looks like JSON but braces never close (reply cut off by max_tokens).
    Truncated { partial_json: String },
    NotFound,
}

impl JsonExtractionResult {
    pub fn into_option(self) -> Option<String> {
        match self {
            JsonExtractionResult::Success(json) => Some(json),
            _ => None,
        }
    }
}

/// Find the byte index of the `}` closing the object that starts at `s[0]`.
///
/// String literals and escape sequences are skipped.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

fn is_valid_json(candidate: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(candidate).is_ok()
}

/// Extract the object inside a ```json fenced block.
pub fn extract_from_json_code_block(content: &str) -> Option<String> {
    let re = Regex::new(r"```json\s*\n?([\s\S]*?)\n?```").ok()?;
    let caps = re.captures(content)?;
    let json_content = caps.get(1)?.as_str().trim();
    if json_content.starts_with('{') {
        if let Some(end) = find_matching_brace(json_content) {
            return Some(json_content[..=end].to_string());
        }
        return Some(json_content.to_string());
    }
    None
}

/// Extract the first object inside any fenced block.
pub fn extract_from_generic_code_block(content: &str) -> Option<String> {
    let re = Regex::new(r"```(?:\w+)?\s*\n?([\s\S]*?)\n?```").ok()?;
    for caps in re.captures_iter(content) {
        let block_content = caps.get(1)?.as_str().trim();
        if let Some(start) = block_content.find('{') {
            if let Some(end) = find_matching_brace(&block_content[start..]) {
                return Some(block_content[start..=start + end].to_string());
            }
        }
    }
    None
}

/// Largest valid JSON object in `content`; later occurrences win ties.
///
/// Reasoning models often quote partial JSON before the real answer, and the
/// real answer is usually both the biggest object and the last one.
pub fn extract_last_valid_json_object(content: &str) -> Option<String> {
    content
        .char_indices()
        .filter(|(_, c)| *c == '{')
        .filter_map(|(start, _)| {
            let substr = &content[start..];
            let end = find_matching_brace(substr)?;
            let candidate = &substr[..=end];
            is_valid_json(candidate).then(|| (start, candidate.to_string()))
        })
        .max_by(|(pos_a, a), (pos_b, b)| a.len().cmp(&b.len()).then(pos_a.cmp(pos_b)))
        .map(|(_, json)| json)
}

/// Try every strategy and report whether the reply was truncated.
pub fn try_extract_json_from_response(content: &str) -> JsonExtractionResult {
    let trimmed = content.trim();

    if let Some(json) = extract_from_json_code_block(trimmed) {
        if is_valid_json(&json) {
            return JsonExtractionResult::Success(json);
        }
    }

    if let Some(json) = extract_from_generic_code_block(trimmed) {
        if is_valid_json(&json) {
            return JsonExtractionResult::Success(json);
        }
    }

    if trimmed.starts_with('{') {
        if let Some(end) = find_matching_brace(trimmed) {
            let candidate = &trimmed[..=end];
            if is_valid_json(candidate) {
                return JsonExtractionResult::Success(candidate.to_string());
            }
        }
    }

    if let Some(json) = extract_last_valid_json_object(trimmed) {
        return JsonExtractionResult::Success(json);
    }

    if let Some(start) = trimmed.find('{') {
        if find_matching_brace(&trimmed[start..]).is_none() {
            return JsonExtractionResult::Truncated {
                partial_json: trimmed[start..].to_string(),
            };
        }
    }

    JsonExtractionResult::NotFound
}

/// Extract the body of the last fenced block tagged with one of `languages`.
///
/// Falls back to the last untagged fence. Tags match case-insensitively.
pub fn extract_code_block(content: &str, languages: &[&str]) -> Option<String> {
    let re = Regex::new(r"```([A-Za-z0-9_+-]*)[ \t]*\r?\n([\s\S]*?)```").ok()?;
    let mut tagged = None;
    let mut untagged = None;
    for caps in re.captures_iter(content) {
        let tag = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let body = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        if languages.iter().any(|l| l.eq_ignore_ascii_case(tag)) {
            tagged = Some(body.to_string());
        } else if tag.is_empty() {
            untagged = Some(body.to_string());
        }
    }
    tagged.or(untagged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_matching_brace_skips_strings() {
        let s = r#"{"a": "}{", "b": {"c": 1}} trailing"#;
        let end = find_matching_brace(s).unwrap();
        assert_eq!(&s[..=end], r#"{"a": "}{", "b": {"c": 1}}"#);
        assert_eq!(find_matching_brace("{\"open\": 1"), None);
    }

    #[test]
    fn test_json_fence_preferred() {
        let reply = "thinking {\"x\": 0}\n```json\n{\"action\": \"list\", \"path\": \".\"}\n```";
        let json = try_extract_json_from_response(reply).into_option().unwrap();
        assert!(json.contains("\"list\""));
    }

    #[test]
    fn test_largest_object_wins() {
        let reply = "Example: {\"a\":1}. Answer: {\"action\":\"finish\",\"finding\":{\"notes\":\"ok\"}}";
        let json = try_extract_json_from_response(reply).into_option().unwrap();
        assert!(json.starts_with("{\"action\":\"finish\""));
    }

    #[test]
    fn test_truncated_and_not_found() {
        assert!(matches!(
            try_extract_json_from_response("here: {\"action\": \"read\", \"path\": \"setup"),
            JsonExtractionResult::Truncated { .. }
        ));
        assert_eq!(
            try_extract_json_from_response("no json at all"),
            JsonExtractionResult::NotFound
        );
    }

    #[test]
    fn test_extract_code_block_by_language() {
        let reply = "```bash\necho hi\n```\nand\n```dockerfile\nFROM python:3.11\nRUN pip install .\n```";
        assert_eq!(
            extract_code_block(reply, &["dockerfile", "docker"]).unwrap(),
            "FROM python:3.11\nRUN pip install .\n"
        );
        assert_eq!(
            extract_code_block(reply, &["bash", "sh"]).unwrap(),
            "echo hi\n"
        );
    }

    #[test]
    fn test_extract_code_block_untagged_fallback() {
        let reply = "```\nFROM ubuntu:22.04\n```";
        assert_eq!(
            extract_code_block(reply, &["dockerfile"]).unwrap(),
            "FROM ubuntu:22.04\n"
        );
        assert!(extract_code_block("plain text", &["dockerfile"]).is_none());
    }
}
