//! Glob patterns for policy subjects and actions.
//!
//! `*` matches any run of characters (including none), `?` matches exactly
//! one. Everything else is literal.

use serde::Serialize;

/// How narrowly a pattern selects. Exact patterns outrank any wildcard
/// pattern; among wildcard patterns the one with more literal characters wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Specificity {
    pub exact: bool,
    pub literal_chars: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    raw: String,
    specificity: Specificity,
}

impl Pattern {
    pub fn new(raw: &str) -> Self {
        let raw = raw.trim().to_string();
        let wildcards = raw.chars().filter(|c| *c == '*' || *c == '?').count();
        let specificity = Specificity {
            exact: wildcards == 0,
            literal_chars: raw.chars().count() - wildcards,
        };
        Self { raw, specificity }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn specificity(&self) -> Specificity {
        self.specificity
    }

    pub fn matches(&self, text: &str) -> bool {
        if self.specificity.exact {
            return self.raw == text;
        }
        glob_match(&self.raw, text)
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            // Let the last star swallow one more character and retry.
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
