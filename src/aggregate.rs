use std::collections::HashMap;

use serde_json::{Map, Number, Value};

use crate::{
    error::{DbError, Result},
    filter::FilterExpr,
    index::key_string,
    query::{parse_sort_spec, sort_records},
};

#[derive(Debug, Clone)]
pub enum Stage {
    Match(FilterExpr),
    Group(GroupStage),
    Sort(Vec<(String, i64)>),
    Skip(usize),
    Limit(usize),
}

#[derive(Debug, Clone)]
pub struct GroupStage {
    /// `None` is the single all-records group; otherwise output-key → source
    /// field pairs whose stringified values form the group key.
    id: Option<Vec<(String, String)>>,
    accumulators: Vec<(String, Accumulator)>,
}

#[derive(Debug, Clone)]
pub enum Accumulator {
    SumField(String),
    SumConst(f64),
    Avg(String),
    Count,
    Min(String),
    Max(String),
}

pub fn parse_pipeline(pipeline: &Value) -> Result<Vec<Stage>> {
    let stages = pipeline
        .as_array()
        .ok_or_else(|| DbError::Validation("aggregation pipeline must be a JSON array".into()))?;
    stages.iter().map(parse_stage).collect()
}

pub fn run_pipeline(records: Vec<Value>, stages: &[Stage]) -> Vec<Value> {
    let mut current = records;
    for stage in stages {
        current = match stage {
            Stage::Match(filter) => current
                .into_iter()
                .filter(|record| filter.matches(fields_of(record)))
                .collect(),
            Stage::Group(group) => run_group(&current, group),
            Stage::Sort(keys) => {
                sort_records(&mut current, keys);
                current
            }
            Stage::Skip(n) => current.into_iter().skip(*n).collect(),
            Stage::Limit(n) => current.into_iter().take(*n).collect(),
        };
    }
    current
}

fn parse_stage(stage: &Value) -> Result<Stage> {
    let object = stage
        .as_object()
        .ok_or_else(|| DbError::Validation("each pipeline stage must be a JSON object".into()))?;
    if object.len() != 1 {
        return Err(DbError::Validation(
            "each pipeline stage must have exactly one key".into(),
        ));
    }
    let (name, body) = object.iter().next().expect("one stage key");

    match name.as_str() {
        "$match" => Ok(Stage::Match(FilterExpr::parse(body)?)),
        "$group" => Ok(Stage::Group(parse_group(body)?)),
        "$sort" => {
            let spec = body.as_object().ok_or_else(|| {
                DbError::Validation("$sort requires an object of field directions".into())
            })?;
            Ok(Stage::Sort(parse_sort_spec(spec)?))
        }
        "$skip" => Ok(Stage::Skip(count_arg("$skip", body)?)),
        "$limit" => Ok(Stage::Limit(count_arg("$limit", body)?)),
        other => Err(DbError::Validation(format!(
            "unknown aggregation stage '{other}'"
        ))),
    }
}

fn parse_group(body: &Value) -> Result<GroupStage> {
    let object = body
        .as_object()
        .ok_or_else(|| DbError::Validation("$group requires a JSON object".into()))?;

    let id = match object.get("_id") {
        Some(Value::Null) => None,
        Some(Value::Object(mapping)) => {
            let mut pairs = Vec::with_capacity(mapping.len());
            for (out_key, source) in mapping {
                let field = source.as_str().ok_or_else(|| {
                    DbError::Validation(format!(
                        "$group _id entry '{out_key}' must name a source field"
                    ))
                })?;
                pairs.push((out_key.clone(), field.to_string()));
            }
            Some(pairs)
        }
        Some(_) => {
            return Err(DbError::Validation(
                "$group _id must be null or an object mapping output keys to field names".into(),
            ));
        }
        None => {
            return Err(DbError::Validation("$group requires an _id".into()));
        }
    };

    let mut accumulators = Vec::new();
    for (key, spec) in object {
        if key == "_id" {
            continue;
        }
        accumulators.push((key.clone(), parse_accumulator(key, spec)?));
    }

    Ok(GroupStage { id, accumulators })
}

fn parse_accumulator(out_key: &str, spec: &Value) -> Result<Accumulator> {
    let object = spec.as_object().ok_or_else(|| {
        DbError::Validation(format!("group key '{out_key}' must be an operator object"))
    })?;
    if object.len() != 1 {
        return Err(DbError::Validation(format!(
            "group key '{out_key}' must have exactly one operator"
        )));
    }
    let (op, arg) = object.iter().next().expect("one accumulator key");

    match op.as_str() {
        "$sum" => match arg {
            Value::String(field) => Ok(Accumulator::SumField(field.clone())),
            Value::Number(n) => Ok(Accumulator::SumConst(n.as_f64().unwrap_or(0.0))),
            _ => Err(DbError::Validation(
                "$sum requires a field name or a numeric constant".into(),
            )),
        },
        "$avg" => field_arg("$avg", arg).map(Accumulator::Avg),
        "$count" => match arg {
            Value::Bool(true) => Ok(Accumulator::Count),
            _ => Err(DbError::Validation("$count requires the literal true".into())),
        },
        "$min" => field_arg("$min", arg).map(Accumulator::Min),
        "$max" => field_arg("$max", arg).map(Accumulator::Max),
        other => Err(DbError::Validation(format!(
            "unknown group operator '{other}'"
        ))),
    }
}

fn field_arg(op: &str, arg: &Value) -> Result<String> {
    arg.as_str()
        .map(str::to_string)
        .ok_or_else(|| DbError::Validation(format!("{op} requires a field name")))
}

fn count_arg(stage: &str, arg: &Value) -> Result<usize> {
    arg.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| DbError::Validation(format!("{stage} requires a non-negative integer")))
}

fn run_group(records: &[Value], stage: &GroupStage) -> Vec<Value> {
    // Groups accumulate in first-seen order.
    let mut order: Vec<(Value, Vec<&Map<String, Value>>)> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for record in records {
        let fields = fields_of(record);
        let (key, id_value) = match stage.id.as_ref() {
            None => (String::new(), Value::Null),
            Some(pairs) => {
                let parts: Vec<String> = pairs
                    .iter()
                    .map(|(_, field)| key_string(fields.get(field.as_str())))
                    .collect();
                let key = parts.join("-");
                (key.clone(), Value::String(key))
            }
        };
        let slot = *positions.entry(key).or_insert_with(|| {
            order.push((id_value, Vec::new()));
            order.len() - 1
        });
        order[slot].1.push(fields);
    }

    order
        .into_iter()
        .map(|(id_value, members)| {
            let mut output = Map::new();
            output.insert("_id".to_string(), id_value);
            for (out_key, accumulator) in &stage.accumulators {
                output.insert(out_key.clone(), apply_accumulator(accumulator, &members));
            }
            Value::Object(output)
        })
        .collect()
}

fn apply_accumulator(accumulator: &Accumulator, members: &[&Map<String, Value>]) -> Value {
    fn numerics<'a>(
        members: &'a [&Map<String, Value>],
        field: &'a str,
    ) -> impl Iterator<Item = f64> + 'a {
        members
            .iter()
            .filter_map(move |fields| fields.get(field).and_then(Value::as_f64))
    }
    match accumulator {
        Accumulator::SumField(field) => number(numerics(members, field).sum()),
        Accumulator::SumConst(constant) => number(constant * members.len() as f64),
        Accumulator::Avg(field) => number(numerics(members, field).sum::<f64>() / members.len() as f64),
        Accumulator::Count => Value::Number(Number::from(members.len() as u64)),
        Accumulator::Min(field) => numerics(members, field)
            .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |m| m.min(v))))
            .map(number)
            .unwrap_or(Value::Null),
        Accumulator::Max(field) => numerics(members, field)
            .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |m| m.max(v))))
            .map(number)
            .unwrap_or(Value::Null),
    }
}

fn number(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

fn fields_of(record: &Value) -> &Map<String, Value> {
    static EMPTY: once_cell::sync::Lazy<Map<String, Value>> =
        once_cell::sync::Lazy::new(Map::new);
    record.as_object().unwrap_or(&EMPTY)
}
