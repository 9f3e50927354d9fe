//! Secondary index extraction.
//!
//! The full search-indexing subsystem lives elsewhere; the engine only needs
//! enough index rows to answer identifier matches and to know which index
//! categories a stored resource populates.

use serde_json::Value;

use crate::types::{IndexRow, IndexValue, PartitionId, PersistentId};

use super::hash::SearchHasher;

/// An index value derived from a payload, before hashes and ownership are attached.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractedIndex {
    /// String parameter.
    String {
        /// Search parameter name.
        param: String,
        /// Normalized text.
        value: String,
    },
    /// Token parameter.
    Token {
        /// Search parameter name.
        param: String,
        /// Code system, if any.
        system: Option<String>,
        /// The code.
        value: String,
    },
    /// Date parameter.
    Date {
        /// Search parameter name.
        param: String,
        /// The literal as written.
        value: String,
    },
    /// Quantity parameter.
    Quantity {
        /// Search parameter name.
        param: String,
        /// Numeric value.
        value: f64,
        /// Unit code or display unit.
        unit: Option<String>,
    },
    /// Outgoing reference found at `path`.
    Link {
        /// Element path the reference was found at.
        path: String,
        /// The reference value.
        target: String,
    },
}

impl ExtractedIndex {
    /// Attaches ownership and hashes, producing a storable row.
    pub fn into_row(
        self,
        pid: PersistentId,
        partition: Option<PartitionId>,
        resource_type: &str,
        hasher: &SearchHasher,
    ) -> IndexRow {
        let (param_name, value) = match self {
            ExtractedIndex::String { param, value } => (param, IndexValue::String { value }),
            ExtractedIndex::Token {
                param,
                system,
                value,
            } => {
                let hash_value = hasher.hash_value(partition, resource_type, &param, &value);
                let hash_system_and_value = hasher.hash_system_and_value(
                    partition,
                    resource_type,
                    &param,
                    system.as_deref().unwrap_or_default(),
                    &value,
                );
                (
                    param,
                    IndexValue::Token {
                        system,
                        value,
                        hash_value,
                        hash_system_and_value,
                    },
                )
            }
            ExtractedIndex::Date { param, value } => (param, IndexValue::Date { value }),
            ExtractedIndex::Quantity { param, value, unit } => {
                (param, IndexValue::Quantity { value, unit })
            }
            ExtractedIndex::Link { path, target } => (path, IndexValue::Link { target }),
        };
        IndexRow {
            pid,
            partition,
            resource_type: resource_type.to_string(),
            param_name,
            value,
        }
    }
}

/// Derives index values from a resource payload.
pub trait IndexExtractor: Send + Sync {
    /// Extracts every index value of the payload.
    fn extract(&self, resource_type: &str, resource: &Value) -> Vec<ExtractedIndex>;
}

/// Extracts the common identifying parameters of clinical resources.
///
/// - `identifier` tokens from `identifier[]`
/// - `family`/`given`/`name` strings from `name`
/// - `birthdate`/`date` from `birthDate`, `effectiveDateTime` and `issued`
/// - `value-quantity` from `valueQuantity`
/// - links from every nested `reference`
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicIndexExtractor;

impl BasicIndexExtractor {
    fn identifiers(resource: &Value, out: &mut Vec<ExtractedIndex>) {
        let Some(identifiers) = resource.get("identifier").and_then(Value::as_array) else {
            return;
        };
        for identifier in identifiers {
            let Some(value) = identifier.get("value").and_then(Value::as_str) else {
                continue;
            };
            let system = identifier
                .get("system")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            out.push(ExtractedIndex::Token {
                param: "identifier".to_string(),
                system,
                value: value.to_string(),
            });
        }
    }

    fn names(resource: &Value, out: &mut Vec<ExtractedIndex>) {
        match resource.get("name") {
            Some(Value::String(name)) => out.push(ExtractedIndex::String {
                param: "name".to_string(),
                value: normalize(name),
            }),
            Some(Value::Array(names)) => {
                for name in names {
                    if let Some(family) = name.get("family").and_then(Value::as_str) {
                        out.push(ExtractedIndex::String {
                            param: "family".to_string(),
                            value: normalize(family),
                        });
                    }
                    for given in name
                        .get("given")
                        .and_then(Value::as_array)
                        .into_iter()
                        .flatten()
                        .filter_map(Value::as_str)
                    {
                        out.push(ExtractedIndex::String {
                            param: "given".to_string(),
                            value: normalize(given),
                        });
                    }
                }
            }
            _ => {}
        }
    }

    fn dates(resource: &Value, out: &mut Vec<ExtractedIndex>) {
        for (field, param) in [
            ("birthDate", "birthdate"),
            ("effectiveDateTime", "date"),
            ("issued", "issued"),
        ] {
            if let Some(value) = resource.get(field).and_then(Value::as_str) {
                out.push(ExtractedIndex::Date {
                    param: param.to_string(),
                    value: value.to_string(),
                });
            }
        }
    }

    fn quantities(resource: &Value, out: &mut Vec<ExtractedIndex>) {
        let Some(quantity) = resource.get("valueQuantity") else {
            return;
        };
        if let Some(value) = quantity.get("value").and_then(Value::as_f64) {
            let unit = quantity
                .get("code")
                .or_else(|| quantity.get("unit"))
                .and_then(Value::as_str)
                .map(str::to_string);
            out.push(ExtractedIndex::Quantity {
                param: "value-quantity".to_string(),
                value,
                unit,
            });
        }
    }

    fn links(value: &Value, path: &mut Vec<String>, out: &mut Vec<ExtractedIndex>) {
        match value {
            Value::Object(map) => {
                if let Some(Value::String(target)) = map.get("reference") {
                    out.push(ExtractedIndex::Link {
                        path: path.join("."),
                        target: target.clone(),
                    });
                }
                for (key, child) in map {
                    if key == "reference" {
                        continue;
                    }
                    path.push(key.clone());
                    Self::links(child, path, out);
                    path.pop();
                }
            }
            Value::Array(items) => {
                for item in items {
                    Self::links(item, path, out);
                }
            }
            _ => {}
        }
    }
}

impl IndexExtractor for BasicIndexExtractor {
    fn extract(&self, resource_type: &str, resource: &Value) -> Vec<ExtractedIndex> {
        let mut out = Vec::new();
        Self::identifiers(resource, &mut out);
        Self::names(resource, &mut out);
        Self::dates(resource, &mut out);
        Self::quantities(resource, &mut out);
        let mut path = vec![resource_type.to_string()];
        Self::links(resource, &mut path, &mut out);
        out
    }
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}
