//! Sensor id helpers.
//!
//! Logical-sensor ids may carry a parameter suffix of the form
//! `name;key=value;key2=value2`. Only logical sensors accept parameters;
//! chain and adaptor ids must always be clean.

use std::collections::HashMap;

/// Strips the parameter suffix from an id, returning the part before the
/// first `;`.
pub fn clean_id(id: &str) -> &str {
    match id.find(';') {
        Some(pos) => &id[..pos],
        None => id,
    }
}

/// True when the id carries no parameter suffix.
pub fn is_clean(id: &str) -> bool {
    !id.contains(';')
}

/// Parses the `key=value` pairs of a parameterized id.
///
/// Malformed segments (no `=`) are skipped; a trailing `;` is tolerated.
pub fn parse_parameters(id: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for segment in id.split(';').skip(1) {
        if let Some((key, value)) = segment.split_once('=') {
            if !key.is_empty() {
                params.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
    }
    params
}
