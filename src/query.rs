use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::{
    error::{DbError, Result},
    filter::FilterExpr,
};

/// Sort, pagination, and projection applied after the filter, in that order.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub sort: Option<Map<String, Value>>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    pub projection: Option<Vec<String>>,
}

pub fn run_query(
    records: Vec<Value>,
    filter: &FilterExpr,
    options: &QueryOptions,
) -> Result<Vec<Value>> {
    let mut selected: Vec<Value> = records
        .into_iter()
        .filter(|record| filter.matches(fields_of(record)))
        .collect();

    if let Some(spec) = options.sort.as_ref() {
        let keys = parse_sort_spec(spec)?;
        sort_records(&mut selected, &keys);
    }

    let skip = options.skip.unwrap_or(0);
    let limited: Vec<Value> = match options.limit {
        Some(limit) => selected.into_iter().skip(skip).take(limit).collect(),
        None => selected.into_iter().skip(skip).collect(),
    };

    Ok(match options.projection.as_deref() {
        Some(fields) => limited
            .into_iter()
            .map(|record| project(&record, fields))
            .collect(),
        None => limited,
    })
}

/// Keeps only the named top-level fields, in the requested order. Fields the
/// record does not carry are omitted rather than emitted as null.
pub fn project(record: &Value, fields: &[String]) -> Value {
    let source = fields_of(record);
    let mut projected = Map::new();
    for field in fields {
        if let Some(value) = source.get(field) {
            projected.insert(field.clone(), value.clone());
        }
    }
    Value::Object(projected)
}

pub fn parse_sort_spec(spec: &Map<String, Value>) -> Result<Vec<(String, i64)>> {
    spec.iter()
        .map(|(field, direction)| match direction.as_i64() {
            Some(dir @ (1 | -1)) => Ok((field.clone(), dir)),
            _ => Err(DbError::Validation(format!(
                "sort direction for '{field}' must be 1 or -1"
            ))),
        })
        .collect()
}

/// Stable multi-key sort. Null and absent values order before present values
/// on an ascending key and after them on a descending key.
pub fn sort_records(records: &mut [Value], keys: &[(String, i64)]) {
    records.sort_by(|a, b| {
        for (field, direction) in keys {
            let ordering = compare_field(
                fields_of(a).get(field.as_str()),
                fields_of(b).get(field.as_str()),
            );
            let ordering = if *direction < 0 {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn fields_of(record: &Value) -> &Map<String, Value> {
    static EMPTY: once_cell::sync::Lazy<Map<String, Value>> =
        once_cell::sync::Lazy::new(Map::new);
    record.as_object().unwrap_or(&EMPTY)
}

fn compare_field(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (present(a), present(b)) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(lhs), Some(rhs)) => compare_values(lhs, rhs),
    }
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    let rank = |v: &Value| match v {
        Value::Bool(_) => 0u8,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Array(_) => 3,
        Value::Object(_) => 4,
        Value::Null => 5,
    };
    match (a, b) {
        (Value::Bool(lhs), Value::Bool(rhs)) => lhs.cmp(rhs),
        (Value::Number(lhs), Value::Number(rhs)) => lhs
            .as_f64()
            .partial_cmp(&rhs.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(lhs), Value::String(rhs)) => lhs.cmp(rhs),
        (lhs, rhs) if rank(lhs) != rank(rhs) => rank(lhs).cmp(&rank(rhs)),
        (lhs, rhs) => {
            // Mixed containers: fall back to their serialized form.
            let lhs = serde_json::to_string(lhs).unwrap_or_default();
            let rhs = serde_json::to_string(rhs).unwrap_or_default();
            lhs.cmp(&rhs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Vec<Value> {
        vec![
            json!({"a": 3, "b": "x"}),
            json!({"a": 1, "b": "z"}),
            json!({"b": "y"}),
            json!({"a": 2, "b": "w"}),
        ]
    }

    fn all() -> FilterExpr {
        FilterExpr::parse(&json!({})).unwrap()
    }

    #[test]
    fn sort_ascending_puts_absent_first() {
        let options = QueryOptions {
            sort: Some(json!({"a": 1}).as_object().unwrap().clone()),
            ..Default::default()
        };
        let out = run_query(sample(), &all(), &options).unwrap();
        let order: Vec<Option<i64>> = out.iter().map(|r| r["a"].as_i64()).collect();
        assert_eq!(order, vec![None, Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn sort_descending_puts_absent_last() {
        let options = QueryOptions {
            sort: Some(json!({"a": -1}).as_object().unwrap().clone()),
            ..Default::default()
        };
        let out = run_query(sample(), &all(), &options).unwrap();
        let order: Vec<Option<i64>> = out.iter().map(|r| r["a"].as_i64()).collect();
        assert_eq!(order, vec![Some(3), Some(2), Some(1), None]);
    }

    #[test]
    fn sort_applies_keys_in_order() {
        let records = vec![
            json!({"g": "b", "n": 1}),
            json!({"g": "a", "n": 2}),
            json!({"g": "a", "n": 1}),
        ];
        let options = QueryOptions {
            sort: Some(json!({"g": 1, "n": -1}).as_object().unwrap().clone()),
            ..Default::default()
        };
        let out = run_query(records, &all(), &options).unwrap();
        assert_eq!(out[0], json!({"g": "a", "n": 2}));
        assert_eq!(out[1], json!({"g": "a", "n": 1}));
        assert_eq!(out[2], json!({"g": "b", "n": 1}));
    }

    #[test]
    fn invalid_sort_direction_is_rejected() {
        let options = QueryOptions {
            sort: Some(json!({"a": 2}).as_object().unwrap().clone()),
            ..Default::default()
        };
        let err = run_query(sample(), &all(), &options).unwrap_err();
        assert_eq!(err.kind(), "validation-error");
    }

    #[test]
    fn skip_then_limit() {
        let options = QueryOptions {
            skip: Some(1),
            limit: Some(2),
            ..Default::default()
        };
        let out = run_query(sample(), &all(), &options).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], json!({"a": 1, "b": "z"}));
    }

    #[test]
    fn projection_keeps_requested_order_and_drops_absent() {
        let record = json!({"b": 2, "a": 1, "c": 3});
        let projected = project(&record, &["c".into(), "missing".into(), "a".into()]);
        let keys: Vec<&String> = projected.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["c", "a"]);
        assert_eq!(projected["c"], json!(3));
    }

    #[test]
    fn unfiltered_results_preserve_insertion_order() {
        let out = run_query(sample(), &all(), &QueryOptions::default()).unwrap();
        assert_eq!(out, sample());
    }
}
