use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::error::{DbError, Result};

#[derive(Debug, Clone)]
pub enum FilterExpr {
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
    Comparison { field: String, op: ComparisonOp },
}

#[derive(Debug, Clone)]
pub enum ComparisonOp {
    Equals(Value),
    GreaterThan(f64),
    LessThan(f64),
    GreaterOrEqual(f64),
    LessOrEqual(f64),
    Contains(Value),
    In(Vec<Value>),
    Exists(bool),
}

impl FilterExpr {
    /// Parses a JSON filter document. A top-level object with multiple keys
    /// is an implicit conjunction; unknown operators are rejected here so the
    /// evaluator never sees them.
    pub fn parse(filter: &Value) -> Result<Self> {
        let object = filter
            .as_object()
            .ok_or_else(|| DbError::Validation("filter must be a JSON object".into()))?;

        let mut clauses = Vec::with_capacity(object.len());
        for (key, value) in object {
            match key.as_str() {
                "$and" => clauses.push(Self::And(parse_branches(key, value)?)),
                "$or" => clauses.push(Self::Or(parse_branches(key, value)?)),
                "$not" => clauses.push(Self::Not(Box::new(Self::parse(value)?))),
                other if other.starts_with('$') => {
                    return Err(DbError::Validation(format!(
                        "unknown filter operator '{other}'"
                    )));
                }
                field => parse_field_predicate(field, value, &mut clauses)?,
            }
        }

        Ok(match clauses.len() {
            1 => clauses.into_iter().next().expect("one clause"),
            _ => Self::And(clauses),
        })
    }

    pub fn matches(&self, record: &Map<String, Value>) -> bool {
        match self {
            Self::And(children) => children.iter().all(|child| child.matches(record)),
            Self::Or(children) => children.iter().any(|child| child.matches(record)),
            Self::Not(child) => !child.matches(record),
            Self::Comparison { field, op } => op.holds(record.get(field.as_str())),
        }
    }

    /// Field names referenced anywhere in the tree; feeds the query-pattern
    /// counters that drive opportunistic index builds.
    pub fn referenced_fields(&self) -> BTreeSet<String> {
        let mut fields = BTreeSet::new();
        self.collect_fields(&mut fields);
        fields
    }

    fn collect_fields(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.collect_fields(out);
                }
            }
            Self::Not(child) => child.collect_fields(out),
            Self::Comparison { field, .. } => {
                out.insert(field.clone());
            }
        }
    }
}

impl ComparisonOp {
    fn holds(&self, value: Option<&Value>) -> bool {
        match self {
            Self::Equals(expected) => value == Some(expected),
            Self::GreaterThan(bound) => numeric(value).map(|v| v > *bound).unwrap_or(false),
            Self::LessThan(bound) => numeric(value).map(|v| v < *bound).unwrap_or(false),
            Self::GreaterOrEqual(bound) => numeric(value).map(|v| v >= *bound).unwrap_or(false),
            Self::LessOrEqual(bound) => numeric(value).map(|v| v <= *bound).unwrap_or(false),
            Self::Contains(needle) => match value {
                Some(Value::Array(items)) => items.contains(needle),
                Some(Value::String(haystack)) => needle
                    .as_str()
                    .map(|text| haystack.contains(text))
                    .unwrap_or(false),
                _ => false,
            },
            Self::In(candidates) => value.map(|v| candidates.contains(v)).unwrap_or(false),
            Self::Exists(expected) => value.is_some() == *expected,
        }
    }
}

fn numeric(value: Option<&Value>) -> Option<f64> {
    value.and_then(Value::as_f64)
}

fn parse_branches(combinator: &str, value: &Value) -> Result<Vec<FilterExpr>> {
    let branches = value.as_array().ok_or_else(|| {
        DbError::Validation(format!("{combinator} requires an array of filters"))
    })?;
    branches.iter().map(FilterExpr::parse).collect()
}

fn parse_field_predicate(field: &str, value: &Value, clauses: &mut Vec<FilterExpr>) -> Result<()> {
    let Some(ops) = value.as_object() else {
        // Scalar (or array) leaf: strict equality, no coercion.
        clauses.push(FilterExpr::Comparison {
            field: field.to_string(),
            op: ComparisonOp::Equals(value.clone()),
        });
        return Ok(());
    };

    for (op_name, arg) in ops {
        let op = match op_name.as_str() {
            "$gt" => ComparisonOp::GreaterThan(numeric_arg(op_name, arg)?),
            "$lt" => ComparisonOp::LessThan(numeric_arg(op_name, arg)?),
            "$gte" => ComparisonOp::GreaterOrEqual(numeric_arg(op_name, arg)?),
            "$lte" => ComparisonOp::LessOrEqual(numeric_arg(op_name, arg)?),
            "$contains" => ComparisonOp::Contains(arg.clone()),
            "$in" => {
                let candidates = arg.as_array().ok_or_else(|| {
                    DbError::Validation("$in requires an array argument".into())
                })?;
                ComparisonOp::In(candidates.clone())
            }
            "$exists" => {
                let expected = arg.as_bool().ok_or_else(|| {
                    DbError::Validation("$exists requires a boolean argument".into())
                })?;
                ComparisonOp::Exists(expected)
            }
            other => {
                return Err(DbError::Validation(format!(
                    "unknown filter operator '{other}' on field '{field}'"
                )));
            }
        };
        clauses.push(FilterExpr::Comparison {
            field: field.to_string(),
            op,
        });
    }
    Ok(())
}

fn numeric_arg(op: &str, arg: &Value) -> Result<f64> {
    arg.as_f64()
        .ok_or_else(|| DbError::Validation(format!("{op} requires a numeric argument")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Map<String, Value> {
        value.as_object().expect("object fixture").clone()
    }

    fn matches(filter: Value, rec: Value) -> bool {
        FilterExpr::parse(&filter)
            .expect("filter parses")
            .matches(&record(rec))
    }

    #[test]
    fn equality_is_strict() {
        assert!(matches(json!({"a": 1}), json!({"a": 1, "b": 2})));
        assert!(!matches(json!({"a": "1"}), json!({"a": 1})));
        assert!(!matches(json!({"a": 1}), json!({"b": 1})));
    }

    #[test]
    fn multi_key_object_is_implicit_conjunction() {
        let filter = json!({"a": 1, "b": "x"});
        assert!(matches(filter.clone(), json!({"a": 1, "b": "x"})));
        assert!(!matches(filter, json!({"a": 1, "b": "y"})));
    }

    #[test]
    fn combinators_nest() {
        let filter = json!({"$or": [{"a": {"$gt": 2}}, {"b": "y"}]});
        assert!(matches(filter.clone(), json!({"a": 3})));
        assert!(matches(filter.clone(), json!({"a": 1, "b": "y"})));
        assert!(!matches(filter, json!({"a": 1, "b": "x"})));
    }

    #[test]
    fn not_is_exact_negation() {
        let inner = json!({"a": {"$gte": 10}});
        let negated = json!({"$not": {"a": {"$gte": 10}}});
        for rec in [json!({"a": 9}), json!({"a": 10}), json!({"b": 1}), json!({"a": "x"})] {
            assert_eq!(matches(negated.clone(), rec.clone()), !matches(inner.clone(), rec));
        }
    }

    #[test]
    fn range_operators_require_numeric_values() {
        assert!(matches(json!({"a": {"$gt": 1, "$lte": 3}}), json!({"a": 2})));
        assert!(!matches(json!({"a": {"$gt": 1}}), json!({"a": "2"})));
        assert!(!matches(json!({"a": {"$lt": 5}}), json!({})));
    }

    #[test]
    fn contains_handles_arrays_and_strings() {
        assert!(matches(json!({"tags": {"$contains": "red"}}), json!({"tags": ["red", "blue"]})));
        assert!(matches(json!({"name": {"$contains": "lic"}}), json!({"name": "Alice"})));
        assert!(!matches(json!({"n": {"$contains": "1"}}), json!({"n": 1})));
    }

    #[test]
    fn in_and_exists() {
        assert!(matches(json!({"a": {"$in": [1, 2, 3]}}), json!({"a": 2})));
        assert!(!matches(json!({"a": {"$in": [1, 2]}}), json!({"a": "2"})));
        assert!(matches(json!({"a": {"$exists": true}}), json!({"a": null})));
        assert!(matches(json!({"a": {"$exists": false}}), json!({"b": 1})));
        assert!(!matches(json!({"a": {"$exists": false}}), json!({"a": 1})));
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let err = FilterExpr::parse(&json!({"a": {"$regex": "x"}})).unwrap_err();
        assert_eq!(err.kind(), "validation-error");
        assert!(FilterExpr::parse(&json!({"$nor": []})).is_err());
        assert!(FilterExpr::parse(&json!("a = 1")).is_err());
    }

    #[test]
    fn referenced_fields_are_collected_through_combinators() {
        let expr = FilterExpr::parse(&json!({
            "$or": [{"a": 1}, {"$not": {"b": {"$exists": true}}}],
            "c": {"$gt": 0}
        }))
        .unwrap();
        let fields: Vec<String> = expr.referenced_fields().into_iter().collect();
        assert_eq!(fields, vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(matches(json!({}), json!({"anything": true})));
    }
}
