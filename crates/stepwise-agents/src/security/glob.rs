//! Glob matching for command allowlists.
//!
//! Patterns are literal text plus `*`, which matches any sequence of
//! characters including the empty one. Every other character, including
//! `?` and `[`, is literal. Matching is anchored to the whole string.

/// Check whether `text` matches `pattern` in full.
///
/// Runs in `O(text * pattern)` worst case using the two-pointer
/// backtracking scheme: on mismatch, resume from the most recent `*` and
/// let it absorb one more character.
#[must_use]
pub fn matches(text: &str, pattern: &str) -> bool {
    let text = text.as_bytes();
    let pattern = pattern.as_bytes();

    let mut ti = 0;
    let mut pi = 0;
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while ti < text.len() {
        if pi < pattern.len() && pattern[pi] == b'*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if pi < pattern.len() && pattern[pi] == text[ti] {
            pi += 1;
            ti += 1;
        } else if let Some(star_at) = star {
            pi = star_at + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }

    pattern[pi..].iter().all(|&b| b == b'*')
}
