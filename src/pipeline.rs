//! Stage interpreter of the embedded engine.
//!
//! Parses a sequence of JSON stage documents and runs it over an in-memory
//! batch of documents. This is what [`crate::engine::Datastore`] uses to
//! answer `aggregate` calls.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::query::{self, Query};
use crate::value::SortKey;

// ---------------------------------------------------------------------------
// Expression
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Expression {
    Literal(Value),
    FieldRef(String),
    Add(Vec<Expression>),
    Subtract(Box<Expression>, Box<Expression>),
    Multiply(Vec<Expression>),
    Divide(Box<Expression>, Box<Expression>),
}

#[derive(Debug, Clone)]
enum GroupKey {
    Null,
    Single(Expression),
    Compound(Vec<(String, Expression)>),
}

#[derive(Debug, Clone)]
enum Accumulator {
    Sum(Expression),
    Avg(Expression),
    Min(Expression),
    Max(Expression),
    Count,
    First(Expression),
    Last(Expression),
    Push(Expression),
    AddToSet(Expression),
}

enum AccumulatorState {
    Sum(f64),
    Avg { sum: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    Count(u64),
    First(Option<Value>),
    Last(Option<Value>),
    Push(Vec<Value>),
    AddToSet(Vec<Value>),
}

#[derive(Debug, Clone)]
enum ProjectionField {
    Include,
    Exclude,
    Compute(Expression),
    Nested(Vec<(String, ProjectionField)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
enum Stage {
    Match(Query),
    Group {
        key: GroupKey,
        accumulators: Vec<(String, Accumulator)>,
    },
    Sort(Vec<(String, SortOrder)>),
    Skip(u64),
    Limit(u64),
    Project(Vec<(String, ProjectionField)>),
    Unwind {
        path: String,
        preserve_null: bool,
    },
}

pub struct Pipeline {
    stages: Vec<Stage>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn resolve_field(doc: &Value, path: &str) -> Value {
    let mut current = doc;
    for part in path.split('.') {
        match current.as_object().and_then(|map| map.get(part)) {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn has_field(doc: &Value, path: &str) -> bool {
    let mut current = doc;
    for part in path.split('.') {
        match current.as_object().and_then(|map| map.get(part)) {
            Some(v) => current = v,
            None => return false,
        }
    }
    true
}

pub(crate) fn set_field(doc: &mut Value, path: &str, value: Value) {
    let Some((head, rest)) = path.split_once('.') else {
        if let Value::Object(map) = doc {
            map.insert(path.to_string(), value);
        }
        return;
    };
    if let Value::Object(map) = doc {
        let child = map
            .entry(head.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !child.is_object() {
            *child = Value::Object(Map::new());
        }
        set_field(child, rest, value);
    }
}

fn number_to_value(n: f64) -> Value {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn single_entry<'a>(map: &'a Map<String, Value>, what: &str) -> Result<(&'a String, &'a Value)> {
    match (map.len(), map.iter().next()) {
        (1, Some(entry)) => Ok(entry),
        _ => Err(Error::InvalidPipeline(format!(
            "{what} must have exactly one key"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Expression parsing & evaluation
// ---------------------------------------------------------------------------

fn expression_list(op: &str, arg: &Value) -> Result<Vec<Expression>> {
    arg.as_array()
        .ok_or_else(|| Error::InvalidPipeline(format!("{op} requires an array")))?
        .iter()
        .map(parse_expression)
        .collect()
}

fn expression_pair(op: &str, arg: &Value) -> Result<(Box<Expression>, Box<Expression>)> {
    let mut exprs = expression_list(op, arg)?;
    if exprs.len() != 2 {
        return Err(Error::InvalidPipeline(format!(
            "{op} requires exactly 2 arguments"
        )));
    }
    let b = exprs.pop().map(Box::new);
    let a = exprs.pop().map(Box::new);
    a.zip(b)
        .ok_or_else(|| Error::InvalidPipeline(format!("{op} requires exactly 2 arguments")))
}

fn parse_expression(val: &Value) -> Result<Expression> {
    match val {
        Value::String(s) if s.starts_with('$') => Ok(Expression::FieldRef(s[1..].to_string())),
        Value::Object(map) if map.len() == 1 => {
            let (key, arg) = single_entry(map, "expression")?;
            match key.as_str() {
                "$add" => Ok(Expression::Add(expression_list(key, arg)?)),
                "$multiply" => Ok(Expression::Multiply(expression_list(key, arg)?)),
                "$subtract" => {
                    let (a, b) = expression_pair(key, arg)?;
                    Ok(Expression::Subtract(a, b))
                }
                "$divide" => {
                    let (a, b) = expression_pair(key, arg)?;
                    Ok(Expression::Divide(a, b))
                }
                _ => Ok(Expression::Literal(val.clone())),
            }
        }
        _ => Ok(Expression::Literal(val.clone())),
    }
}

impl Expression {
    fn eval(&self, doc: &Value) -> Value {
        match self {
            Expression::Literal(v) => v.clone(),
            Expression::FieldRef(path) => resolve_field(doc, path),
            Expression::Add(exprs) => exprs
                .iter()
                .map(|e| e.eval(doc).as_f64())
                .sum::<Option<f64>>()
                .map_or(Value::Null, number_to_value),
            Expression::Multiply(exprs) => exprs
                .iter()
                .map(|e| e.eval(doc).as_f64())
                .product::<Option<f64>>()
                .map_or(Value::Null, number_to_value),
            Expression::Subtract(a, b) => match (a.eval(doc).as_f64(), b.eval(doc).as_f64()) {
                (Some(a), Some(b)) => number_to_value(a - b),
                _ => Value::Null,
            },
            Expression::Divide(a, b) => match (a.eval(doc).as_f64(), b.eval(doc).as_f64()) {
                (Some(a), Some(b)) if b != 0.0 => number_to_value(a / b),
                _ => Value::Null,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Stage parsing
// ---------------------------------------------------------------------------

fn parse_accumulator(val: &Value) -> Result<Accumulator> {
    let obj = val
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline("accumulator must be an object".into()))?;
    let (op, arg) = single_entry(obj, "accumulator")?;
    match op.as_str() {
        "$sum" => Ok(Accumulator::Sum(parse_expression(arg)?)),
        "$avg" => Ok(Accumulator::Avg(parse_expression(arg)?)),
        "$min" => Ok(Accumulator::Min(parse_expression(arg)?)),
        "$max" => Ok(Accumulator::Max(parse_expression(arg)?)),
        "$count" => Ok(Accumulator::Count),
        "$first" => Ok(Accumulator::First(parse_expression(arg)?)),
        "$last" => Ok(Accumulator::Last(parse_expression(arg)?)),
        "$push" => Ok(Accumulator::Push(parse_expression(arg)?)),
        "$addToSet" => Ok(Accumulator::AddToSet(parse_expression(arg)?)),
        _ => Err(Error::InvalidPipeline(format!("unknown accumulator: {op}"))),
    }
}

fn parse_group_stage(val: &Value) -> Result<Stage> {
    let obj = val
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline("$group must be an object".into()))?;

    let id_val = obj
        .get("_id")
        .ok_or_else(|| Error::InvalidPipeline("$group requires '_id' field".into()))?;

    let key = match id_val {
        Value::Null => GroupKey::Null,
        Value::Object(map) if !map.keys().any(|k| k.starts_with('$')) => GroupKey::Compound(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), parse_expression(v)?)))
                .collect::<Result<_>>()?,
        ),
        _ => GroupKey::Single(parse_expression(id_val)?),
    };

    let accumulators = obj
        .iter()
        .filter(|(name, _)| name.as_str() != "_id")
        .map(|(name, spec)| Ok((name.clone(), parse_accumulator(spec)?)))
        .collect::<Result<_>>()?;

    Ok(Stage::Group { key, accumulators })
}

fn parse_sort(val: &Value) -> Result<Vec<(String, SortOrder)>> {
    let obj = val
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline("$sort must be an object".into()))?;
    obj.iter()
        .map(|(field, dir)| {
            let order = match dir.as_i64() {
                Some(1) => SortOrder::Asc,
                Some(-1) => SortOrder::Desc,
                _ => {
                    return Err(Error::InvalidPipeline(
                        "sort direction must be 1 or -1".into(),
                    ));
                }
            };
            Ok((field.clone(), order))
        })
        .collect()
}

fn parse_project(val: &Value) -> Result<Vec<(String, ProjectionField)>> {
    let obj = val
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline("$project must be an object".into()))?;
    let mut fields = Vec::new();
    for (field, spec) in obj {
        let pf = match spec {
            Value::Number(n) if n.as_i64() == Some(1) => ProjectionField::Include,
            Value::Number(n) if n.as_i64() == Some(0) => ProjectionField::Exclude,
            Value::Bool(true) => ProjectionField::Include,
            Value::Bool(false) => ProjectionField::Exclude,
            Value::Object(map) if !map.keys().any(|k| k.starts_with('$')) => {
                ProjectionField::Nested(parse_project(spec)?)
            }
            _ => ProjectionField::Compute(parse_expression(spec)?),
        };
        fields.push((field.clone(), pf));
    }
    Ok(fields)
}

fn parse_unwind(val: &Value) -> Result<(String, bool)> {
    let (path, preserve) = match val {
        Value::String(s) => (s.as_str(), false),
        Value::Object(obj) => {
            let path = obj.get("path").and_then(Value::as_str).ok_or_else(|| {
                Error::InvalidPipeline("$unwind requires 'path' string".into())
            })?;
            let preserve = obj
                .get("preserveNullAndEmptyArrays")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            (path, preserve)
        }
        _ => {
            return Err(Error::InvalidPipeline(
                "$unwind must be a string or object".into(),
            ));
        }
    };
    match path.strip_prefix('$') {
        Some(field) => Ok((field.to_string(), preserve)),
        None => Err(Error::InvalidPipeline(
            "$unwind path must start with $".into(),
        )),
    }
}

fn parse_count(stage: &str, val: &Value) -> Result<u64> {
    val.as_u64()
        .ok_or_else(|| Error::InvalidPipeline(format!("{stage} must be a non-negative integer")))
}

// ---------------------------------------------------------------------------
// Stage execution
// ---------------------------------------------------------------------------

fn exec_match(docs: Vec<Value>, query: &Query) -> Vec<Value> {
    docs.into_iter()
        .filter(|doc| query::matches_value(query, doc))
        .collect()
}

fn initial_state(acc: &Accumulator) -> AccumulatorState {
    match acc {
        Accumulator::Sum(_) => AccumulatorState::Sum(0.0),
        Accumulator::Avg(_) => AccumulatorState::Avg { sum: 0.0, count: 0 },
        Accumulator::Min(_) => AccumulatorState::Min(None),
        Accumulator::Max(_) => AccumulatorState::Max(None),
        Accumulator::Count => AccumulatorState::Count(0),
        Accumulator::First(_) => AccumulatorState::First(None),
        Accumulator::Last(_) => AccumulatorState::Last(None),
        Accumulator::Push(_) => AccumulatorState::Push(Vec::new()),
        Accumulator::AddToSet(_) => AccumulatorState::AddToSet(Vec::new()),
    }
}

fn keep_extreme(current: &mut Option<Value>, val: Value, wanted: std::cmp::Ordering) {
    if val.is_null() {
        return;
    }
    let replace = current
        .as_ref()
        .is_none_or(|cur| SortKey::from_json(&val).cmp(&SortKey::from_json(cur)) == wanted);
    if replace {
        *current = Some(val);
    }
}

fn accumulate(acc: &Accumulator, state: &mut AccumulatorState, doc: &Value) {
    match (acc, state) {
        (Accumulator::Sum(expr), AccumulatorState::Sum(s)) => {
            if let Some(n) = expr.eval(doc).as_f64() {
                *s += n;
            }
        }
        (Accumulator::Avg(expr), AccumulatorState::Avg { sum, count }) => {
            if let Some(n) = expr.eval(doc).as_f64() {
                *sum += n;
                *count += 1;
            }
        }
        (Accumulator::Min(expr), AccumulatorState::Min(current)) => {
            keep_extreme(current, expr.eval(doc), std::cmp::Ordering::Less);
        }
        (Accumulator::Max(expr), AccumulatorState::Max(current)) => {
            keep_extreme(current, expr.eval(doc), std::cmp::Ordering::Greater);
        }
        (Accumulator::Count, AccumulatorState::Count(c)) => *c += 1,
        (Accumulator::First(expr), AccumulatorState::First(current)) => {
            if current.is_none() {
                *current = Some(expr.eval(doc));
            }
        }
        (Accumulator::Last(expr), AccumulatorState::Last(current)) => {
            *current = Some(expr.eval(doc));
        }
        (Accumulator::Push(expr), AccumulatorState::Push(values)) => values.push(expr.eval(doc)),
        (Accumulator::AddToSet(expr), AccumulatorState::AddToSet(values)) => {
            let val = expr.eval(doc);
            let key = SortKey::from_json(&val);
            if !values.iter().any(|v| SortKey::from_json(v) == key) {
                values.push(val);
            }
        }
        _ => {}
    }
}

fn finish(state: AccumulatorState) -> Value {
    match state {
        AccumulatorState::Sum(s) => number_to_value(s),
        AccumulatorState::Avg { sum, count } if count > 0 => number_to_value(sum / count as f64),
        AccumulatorState::Avg { .. } => Value::Null,
        AccumulatorState::Min(v)
        | AccumulatorState::Max(v)
        | AccumulatorState::First(v)
        | AccumulatorState::Last(v) => v.unwrap_or(Value::Null),
        AccumulatorState::Count(c) => Value::Number(c.into()),
        AccumulatorState::Push(v) | AccumulatorState::AddToSet(v) => Value::Array(v),
    }
}

fn exec_group(
    docs: Vec<Value>,
    key: &GroupKey,
    accumulators: &[(String, Accumulator)],
) -> Result<Vec<Value>> {
    let mut groups: HashMap<String, (Value, Vec<AccumulatorState>)> = HashMap::new();
    let mut insertion_order: Vec<String> = Vec::new();

    for doc in &docs {
        let key_val = match key {
            GroupKey::Null => Value::Null,
            GroupKey::Single(expr) => expr.eval(doc),
            GroupKey::Compound(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(name, expr)| (name.clone(), expr.eval(doc)))
                    .collect(),
            ),
        };

        let key_str = serde_json::to_string(&key_val)?;

        let (_, states) = groups.entry(key_str.clone()).or_insert_with(|| {
            insertion_order.push(key_str);
            let initial = accumulators
                .iter()
                .map(|(_, acc)| initial_state(acc))
                .collect();
            (key_val, initial)
        });

        for ((_, acc), state) in accumulators.iter().zip(states.iter_mut()) {
            accumulate(acc, state, doc);
        }
    }

    let mut results = Vec::with_capacity(insertion_order.len());
    for key_str in &insertion_order {
        let Some((key_val, states)) = groups.remove(key_str) else {
            continue;
        };
        let mut doc = Map::new();
        doc.insert("_id".to_string(), key_val);
        for ((name, _), state) in accumulators.iter().zip(states) {
            doc.insert(name.clone(), finish(state));
        }
        results.push(Value::Object(doc));
    }

    Ok(results)
}

fn exec_sort(mut docs: Vec<Value>, sort_fields: &[(String, SortOrder)]) -> Vec<Value> {
    docs.sort_by(|a, b| {
        for (field, order) in sort_fields {
            let cmp = SortKey::from_json(&resolve_field(a, field))
                .cmp(&SortKey::from_json(&resolve_field(b, field)));
            let cmp = match order {
                SortOrder::Asc => cmp,
                SortOrder::Desc => cmp.reverse(),
            };
            if cmp.is_ne() {
                return cmp;
            }
        }
        std::cmp::Ordering::Equal
    });
    docs
}

fn is_inclusion(fields: &[(String, ProjectionField)]) -> bool {
    fields.iter().any(|(name, pf)| match pf {
        ProjectionField::Include => name != "_id",
        ProjectionField::Compute(_) => true,
        ProjectionField::Nested(sub) => is_inclusion(sub),
        ProjectionField::Exclude => false,
    })
}

fn project_value(doc: &Value, fields: &[(String, ProjectionField)], top_level: bool) -> Value {
    match doc {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .filter(|item| item.is_object())
                .map(|item| project_value(item, fields, top_level))
                .collect(),
        ),
        Value::Object(_) => Value::Object(project_object(doc, fields, top_level)),
        other => other.clone(),
    }
}

fn project_object(
    doc: &Value,
    fields: &[(String, ProjectionField)],
    top_level: bool,
) -> Map<String, Value> {
    let mut result = Value::Object(Map::new());

    if is_inclusion(fields) {
        let id_excluded = fields
            .iter()
            .any(|(name, pf)| name == "_id" && matches!(pf, ProjectionField::Exclude));
        if top_level && !id_excluded && has_field(doc, "_id") {
            set_field(&mut result, "_id", resolve_field(doc, "_id"));
        }

        for (name, pf) in fields {
            match pf {
                ProjectionField::Include if has_field(doc, name) => {
                    set_field(&mut result, name, resolve_field(doc, name));
                }
                ProjectionField::Compute(expr) => {
                    set_field(&mut result, name, expr.eval(doc));
                }
                ProjectionField::Nested(sub) if has_field(doc, name) => {
                    let projected = project_value(&resolve_field(doc, name), sub, false);
                    set_field(&mut result, name, projected);
                }
                _ => {}
            }
        }
    } else {
        result = doc.clone();
        for (name, pf) in fields {
            match pf {
                ProjectionField::Exclude => {
                    if let Some(map) = result.as_object_mut() {
                        map.remove(name.as_str());
                    }
                }
                ProjectionField::Nested(sub) if has_field(doc, name) => {
                    let projected = project_value(&resolve_field(doc, name), sub, false);
                    set_field(&mut result, name, projected);
                }
                _ => {}
            }
        }
    }

    match result {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn exec_project(docs: Vec<Value>, fields: &[(String, ProjectionField)]) -> Vec<Value> {
    docs.iter()
        .map(|doc| Value::Object(project_object(doc, fields, true)))
        .collect()
}

fn exec_unwind(docs: Vec<Value>, path: &str, preserve_null: bool) -> Vec<Value> {
    let mut result = Vec::new();
    for doc in docs {
        match resolve_field(&doc, path) {
            Value::Array(arr) if !arr.is_empty() => {
                for item in arr {
                    let mut new_doc = doc.clone();
                    set_field(&mut new_doc, path, item);
                    result.push(new_doc);
                }
            }
            Value::Array(_) | Value::Null => {
                if preserve_null {
                    result.push(doc);
                }
            }
            // Non-array, non-null: pass through unchanged
            _ => result.push(doc),
        }
    }
    result
}

// ---------------------------------------------------------------------------
// Pipeline parsing & execution
// ---------------------------------------------------------------------------

impl Pipeline {
    pub fn parse(stage_docs: &[Value]) -> Result<Self> {
        let mut stages = Vec::with_capacity(stage_docs.len());
        for stage_val in stage_docs {
            let obj = stage_val.as_object().ok_or_else(|| {
                Error::InvalidPipeline("each pipeline stage must be an object".into())
            })?;
            let (stage_name, stage_body) = single_entry(obj, "pipeline stage")?;

            let stage = match stage_name.as_str() {
                "$match" => Stage::Match(query::parse_query(stage_body)?),
                "$group" => parse_group_stage(stage_body)?,
                "$sort" => Stage::Sort(parse_sort(stage_body)?),
                "$skip" => Stage::Skip(parse_count("$skip", stage_body)?),
                "$limit" => Stage::Limit(parse_count("$limit", stage_body)?),
                "$project" => Stage::Project(parse_project(stage_body)?),
                "$unwind" => {
                    let (path, preserve_null) = parse_unwind(stage_body)?;
                    Stage::Unwind {
                        path,
                        preserve_null,
                    }
                }
                _ => {
                    return Err(Error::InvalidPipeline(format!(
                        "unknown stage: {stage_name}"
                    )));
                }
            };
            stages.push(stage);
        }

        Ok(Pipeline { stages })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn execute(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        let mut current = docs;
        for stage in &self.stages {
            current = match stage {
                Stage::Match(query) => exec_match(current, query),
                Stage::Group { key, accumulators } => exec_group(current, key, accumulators)?,
                Stage::Sort(fields) => exec_sort(current, fields),
                Stage::Skip(n) => current.into_iter().skip(*n as usize).collect(),
                Stage::Limit(n) => current.into_iter().take(*n as usize).collect(),
                Stage::Project(fields) => exec_project(current, fields),
                Stage::Unwind {
                    path,
                    preserve_null,
                } => exec_unwind(current, path, *preserve_null),
            };
        }
        Ok(current)
    }
}

/// Convenience for tests and callers holding a JSON array of stages.
pub fn run(stages: &Value, docs: Vec<Value>) -> Result<Vec<Value>> {
    let arr = stages
        .as_array()
        .ok_or_else(|| Error::InvalidPipeline("pipeline must be an array".into()))?;
    Pipeline::parse(arr)?.execute(docs)
}

// ===========================================================================
// Tests
// ===========================================================================
