//! Small text helpers for logs, observations and content hashing.

use sha2::{Digest, Sha256};

/// Lines kept from each end of a long observation.
pub const OBSERVATION_EDGE_LINES: usize = 40;

/// Truncate to at most `max` bytes on a char boundary, appending `...`.
pub fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

/// Keep the first and last `edge` lines of long output with a divider between.
pub fn truncate_lines(s: &str, edge: usize) -> String {
    let lines: Vec<&str> = s.lines().collect();
    if lines.len() <= edge * 2 {
        return s.to_string();
    }
    let omitted = lines.len() - edge * 2;
    let mut out = lines[..edge].join("\n");
    out.push_str(&format!("\n... [{} lines omitted] ...\n", omitted));
    out.push_str(&lines[lines.len() - edge..].join("\n"));
    out
}

/// Hex SHA-256 of a string, used to detect byte-identical resubmissions.
pub fn sha256_hex(s: &str) -> String {
    hex::encode(Sha256::digest(s.as_bytes()))
}
