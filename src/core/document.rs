use super::error::{StoreError, StoreResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// A stored document: an ordered JSON object.
pub type Document = Map<String, Value>;

pub const ID_FIELD: &str = "_id";

/// Serialize a value into a document. Anything that is not a JSON object is rejected.
pub fn to_document<T: Serialize>(value: &T) -> StoreResult<Document> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::InvalidDocument(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

pub fn from_document<T: DeserializeOwned>(document: Document) -> StoreResult<T> {
    Ok(serde_json::from_value(Value::Object(document))?)
}

/// Render a filter for trace output.
pub fn query_to_string(query: &Document) -> String {
    serde_json::to_string(query).unwrap_or_default()
}

/// Resolve a dotted path ("condition.wind_speed") inside a document.
fn lookup<'a>(document: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = document.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Equality match of every filter field against the document.
///
/// `{"$in": [..]}` and `{"$ne": ..}` are honored as field conditions; an empty
/// filter matches everything.
pub fn matches(document: &Document, filter: &Document) -> bool {
    filter.iter().all(|(path, expected)| {
        let actual = lookup(document, path);
        match expected {
            Value::Object(cond) if cond.keys().any(|k| k.starts_with('$')) => {
                cond.iter().all(|(op, operand)| match op.as_str() {
                    "$in" => operand
                        .as_array()
                        .is_some_and(|values| actual.is_some_and(|a| values.contains(a))),
                    "$ne" => actual != Some(operand),
                    "$exists" => actual.is_some() == operand.as_bool().unwrap_or(true),
                    _ => false,
                })
            }
            _ => actual == Some(expected),
        }
    })
}

/// Apply an update document. Operator updates (`$set`, `$unset`, `$inc`) modify
/// fields in place; anything else replaces the document while keeping its `_id`.
pub fn apply_update(document: &Document, update: &Document) -> StoreResult<Document> {
    let is_operator = update.keys().any(|k| k.starts_with('$'));
    if !is_operator {
        let mut replaced = update.clone();
        if let Some(id) = document.get(ID_FIELD) {
            replaced.insert(ID_FIELD.to_string(), id.clone());
        }
        return Ok(replaced);
    }

    let mut updated = document.clone();
    for (op, fields) in update {
        let fields = fields.as_object().ok_or_else(|| {
            StoreError::InvalidDocument(format!("{} expects an object", op))
        })?;
        match op.as_str() {
            "$set" => {
                for (k, v) in fields {
                    if k == ID_FIELD {
                        return Err(StoreError::InvalidDocument("_id is immutable".into()));
                    }
                    updated.insert(k.clone(), v.clone());
                }
            }
            "$unset" => {
                for k in fields.keys() {
                    updated.remove(k);
                }
            }
            "$inc" => {
                for (k, delta) in fields {
                    let current = updated.get(k).cloned().unwrap_or(Value::from(0));
                    let next = match (current.as_i64(), delta.as_i64()) {
                        (Some(a), Some(b)) => Value::from(a + b),
                        _ => {
                            let a = current.as_f64().ok_or_else(|| {
                                StoreError::InvalidDocument(format!("field '{}' is not numeric", k))
                            })?;
                            let b = delta.as_f64().ok_or_else(|| {
                                StoreError::InvalidDocument(format!(
                                    "$inc amount for '{}' is not numeric",
                                    k
                                ))
                            })?;
                            Value::from(a + b)
                        }
                    };
                    updated.insert(k.clone(), next);
                }
            }
            other => {
                return Err(StoreError::InvalidDocument(format!(
                    "unsupported update operator '{}'",
                    other
                )));
            }
        }
    }
    Ok(updated)
}
