//! Total ordering and nearest-match distance over free-form version strings.
//!
//! A version is split on `.`, `-`, `_` and `+` after dropping a leading `v`.
//! All-digit segments compare numerically, other segments compare lexically
//! (lowercased), and a numeric segment sorts before a textual one. When one
//! key is a prefix of the other the shorter sorts first; fully equal segment
//! lists fall back to the raw string so the order stays total.

use std::cmp::{Ordering, Reverse};
use std::fmt;

/// Penalty for a first differing segment that cannot be compared numerically.
const NON_NUMERIC_GAP: u64 = u64::MAX / 2;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Num(u64),
    Text(String),
}

impl Ord for Segment {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Segment::Num(a), Segment::Num(b)) => a.cmp(b),
            (Segment::Text(a), Segment::Text(b)) => a.cmp(b),
            (Segment::Num(_), Segment::Text(_)) => Ordering::Less,
            (Segment::Text(_), Segment::Num(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for Segment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Parsed version string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionKey {
    raw: String,
    segments: Vec<Segment>,
}

impl VersionKey {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let body = match trimmed.strip_prefix(['v', 'V']) {
            Some(rest) if rest.starts_with(|c: char| c.is_ascii_digit()) => rest,
            _ => trimmed,
        };
        let segments = body
            .split(['.', '-', '_', '+'])
            .filter(|s| !s.is_empty())
            .map(|s| match s.parse::<u64>() {
                Ok(n) if s.chars().all(|c| c.is_ascii_digit()) => Segment::Num(n),
                _ => Segment::Text(s.to_lowercase()),
            })
            .collect();
        Self {
            raw: trimmed.to_string(),
            segments,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Same version regardless of spelling (`v1.2` matches `1.2`).
    pub fn same_version(&self, other: &VersionKey) -> bool {
        self.segments == other.segments
    }

    /// Distance from `self` (the requested version) to `candidate`.
    pub fn distance_to(&self, candidate: &VersionKey) -> VersionDistance {
        let common = self
            .segments
            .iter()
            .zip(&candidate.segments)
            .take_while(|(a, b)| a == b)
            .count();

        let gap = match (self.segments.get(common), candidate.segments.get(common)) {
            (None, None) => 0,
            (Some(Segment::Num(a)), Some(Segment::Num(b))) => a.abs_diff(*b),
            _ => NON_NUMERIC_GAP,
        };

        VersionDistance {
            shared_prefix: Reverse(common),
            gap,
            length_diff: self.segments.len().abs_diff(candidate.segments.len()),
        }
    }
}

impl Ord for VersionKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segments
            .cmp(&other.segments)
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

impl PartialOrd for VersionKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// How far a candidate version is from a requested one; smaller is closer.
///
/// Compared field by field: longer shared prefix first, then the numeric gap
/// at the first differing segment, then the difference in segment count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VersionDistance {
    pub shared_prefix: Reverse<usize>,
    pub gap: u64,
    pub length_diff: usize,
}
