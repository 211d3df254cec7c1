//! Translation of index filters into Qdrant filter payloads.

use serde_json::{Value, json};

use crate::index::{FieldMatch, IndexFilter};

/// Compose the Qdrant filter payload for a key/membership predicate.
///
/// Values that parse as integers additionally match numeric payloads, so a `year` stored as
/// `2022`, `2022.0` or `"2022"` satisfies the same filter. Qdrant `match` never compares floats,
/// so float payloads are reached through a closed `range` per value.
pub fn build_filter(filter: &IndexFilter) -> Value {
    let values: Vec<&str> = match &filter.matches {
        FieldMatch::Equals(value) => vec![value.trim()],
        FieldMatch::AnyOf(values) => values.iter().map(|value| value.trim()).collect(),
    };
    let integers: Vec<i64> = values
        .iter()
        .filter_map(|value| value.parse::<i64>().ok())
        .collect();

    let keyword = match &filter.matches {
        FieldMatch::Equals(_) => match_condition(&filter.key, json!({ "value": values[0] })),
        FieldMatch::AnyOf(_) => match_condition(&filter.key, json!({ "any": values })),
    };

    if integers.is_empty() {
        return json!({ "must": [keyword] });
    }

    let numeric = match &filter.matches {
        FieldMatch::Equals(_) => match_condition(&filter.key, json!({ "value": integers[0] })),
        FieldMatch::AnyOf(_) => match_condition(&filter.key, json!({ "any": integers })),
    };

    let mut should = vec![keyword, numeric];
    should.extend(
        integers
            .iter()
            .map(|value| range_condition(&filter.key, *value)),
    );
    json!({ "must": [{ "should": should }] })
}

fn range_condition(key: &str, value: i64) -> Value {
    json!({
        "key": key,
        "range": { "gte": value, "lte": value }
    })
}

fn match_condition(key: &str, matcher: Value) -> Value {
    json!({
        "key": key,
        "match": matcher
    })
}
