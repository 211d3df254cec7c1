//! Temporal filter extraction.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

static YEAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(20\d{2})\b").expect("year pattern is valid"));

/// Collect the distinct 2000s years mentioned in `question`.
///
/// Pure and total; an empty set means no temporal filter.
pub fn extract_years(question: &str) -> BTreeSet<String> {
    YEAR_PATTERN
        .captures_iter(question)
        .filter_map(|captures| captures.get(1))
        .map(|year| year.as_str().to_string())
        .collect()
}
