//! Client-side evaluation of `where` fragments against cached entities.
//!
//! Only what can be decided exactly is evaluated: id equality, scalar
//! equality and the `equals`/`in` operators. Anything else (relation filters,
//! logical combinators, range operators) does not match, which degrades the
//! affected entry to "no optimistic effect" rather than a wrong one.

use qsync_core::ModelMeta;
use serde_json::{Map, Value};

fn is_logical(key: &str) -> bool {
    matches!(key, "AND" | "OR" | "NOT")
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Object(_) | Value::Array(_))
}

/// Lift compound unique selectors (`{ a_b: { a, b } }`) into plain field
/// conditions.
pub fn flatten_where(meta: &ModelMeta, model: &str, filter: &Map<String, Value>) -> Map<String, Value> {
    let Some(info) = meta.model(model) else {
        return filter.clone();
    };
    let mut flat = Map::new();
    for (key, value) in filter {
        match value {
            Value::Object(inner)
                if info.field(key).is_none()
                    && !is_logical(key)
                    && !inner.is_empty()
                    && inner
                        .keys()
                        .all(|f| info.field(f).is_some_and(|fi| !fi.is_relation)) =>
            {
                for (k, v) in inner {
                    flat.insert(k.clone(), v.clone());
                }
            }
            _ => {
                flat.insert(key.clone(), value.clone());
            }
        }
    }
    flat
}

/// Id field values of a `where`, when it pins every id field of the model.
pub fn unique_values(
    meta: &ModelMeta,
    model: &str,
    filter: &Map<String, Value>,
) -> Option<Map<String, Value>> {
    let ids = meta.id_fields(model);
    if ids.is_empty() {
        return None;
    }
    let flat = flatten_where(meta, model, filter);
    let mut values = Map::new();
    for id in ids {
        let value = flat.get(id).filter(|v| is_scalar(v) && !v.is_null())?;
        values.insert(id.clone(), value.clone());
    }
    Some(values)
}

/// Whether `entity` satisfies `filter`. `None` matches everything.
pub fn matches(
    meta: &ModelMeta,
    model: &str,
    entity: &Map<String, Value>,
    filter: Option<&Map<String, Value>>,
) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    if let Some(ids) = unique_values(meta, model, filter) {
        return ids.iter().all(|(k, v)| entity.get(k) == Some(v));
    }
    flatten_where(meta, model, filter)
        .iter()
        .all(|(key, condition)| field_matches(meta, model, entity, key, condition))
}

fn field_matches(
    meta: &ModelMeta,
    model: &str,
    entity: &Map<String, Value>,
    key: &str,
    condition: &Value,
) -> bool {
    if is_logical(key) || meta.field(model, key).is_some_and(|f| f.is_relation) {
        return false;
    }
    let actual = entity.get(key).unwrap_or(&Value::Null);
    match condition {
        Value::Object(op) if op.len() == 1 => match op.iter().next() {
            Some((name, expected)) if name == "equals" => actual == expected,
            Some((name, Value::Array(options))) if name == "in" => options.contains(actual),
            _ => false,
        },
        Value::Object(_) | Value::Array(_) => false,
        scalar => actual == scalar,
    }
}

/// Whether a synthesised entity contradicts a plain equality condition of a
/// query's `where`. Conditions on fields the entity does not carry never
/// contradict.
pub fn contradicts(
    meta: &ModelMeta,
    model: &str,
    entity: &Map<String, Value>,
    query_where: &Map<String, Value>,
) -> bool {
    flatten_where(meta, model, query_where)
        .iter()
        .filter(|(key, value)| {
            is_scalar(value)
                && !is_logical(key)
                && !meta.field(model, key).is_some_and(|f| f.is_relation)
        })
        .any(|(key, expected)| entity.get(key).is_some_and(|actual| actual != expected))
}
