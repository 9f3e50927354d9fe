//! Placeholder reference rewriting.

use serde_json::Value;

use crate::cache::PlaceholderMap;
use crate::error::ValidationError;
use crate::types::is_placeholder;

/// Rewrites every `reference` naming a placeholder to the identity it resolved to.
///
/// Fails on the first reference to a placeholder whose entry has not been
/// applied yet, or that no entry declares.
pub fn rewrite_references(value: &mut Value, placeholders: &PlaceholderMap) -> Result<usize, ValidationError> {
    let mut rewritten = 0;
    rewrite(value, placeholders, &mut rewritten)?;
    Ok(rewritten)
}

fn rewrite(value: &mut Value, placeholders: &PlaceholderMap, rewritten: &mut usize) -> Result<(), ValidationError> {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if key == "reference"
                    && let Value::String(target) = child
                    && is_placeholder(target)
                {
                    *target = placeholders.resolved(target)?.to_string();
                    *rewritten += 1;
                    continue;
                }
                rewrite(child, placeholders, rewritten)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite(item, placeholders, rewritten)?;
            }
        }
        _ => {}
    }
    Ok(())
}
