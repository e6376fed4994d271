use regex::{Regex, RegexBuilder};
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::value::SortKey;

// ---------------------------------------------------------------------------
// Query AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum QueryOp {
    Eq(SortKey),
    Ne(SortKey),
    Gt(SortKey),
    Gte(SortKey),
    Lt(SortKey),
    Lte(SortKey),
    In(Vec<SortKey>),
    Nin(Vec<SortKey>),
    Exists(bool),
    Regex(Regex),
}

#[derive(Debug, Clone)]
pub enum Query {
    Field { field: String, op: QueryOp },
    And(Vec<Query>),
    Or(Vec<Query>),
    All,
}

// ---------------------------------------------------------------------------
// Parsing: JSON → Query AST
// ---------------------------------------------------------------------------

pub fn parse_query(query: &JsonValue) -> Result<Query> {
    let obj = query
        .as_object()
        .ok_or_else(|| Error::InvalidQuery("query must be a JSON object".into()))?;

    let mut conditions: Vec<Query> = Vec::new();

    for (key, value) in obj {
        match key.as_str() {
            "$and" | "$or" => {
                let arr = value
                    .as_array()
                    .ok_or_else(|| Error::InvalidQuery(format!("{key} must be an array")))?;
                let subs = arr.iter().map(parse_query).collect::<Result<Vec<_>>>()?;
                conditions.push(if key == "$and" {
                    Query::And(subs)
                } else {
                    Query::Or(subs)
                });
            }
            field => match value.as_object() {
                Some(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                    let options = ops.get("$options").and_then(JsonValue::as_str);
                    for (op_key, op_val) in ops {
                        if op_key == "$options" {
                            continue;
                        }
                        conditions.push(Query::Field {
                            field: field.to_string(),
                            op: parse_op(op_key, op_val, options)?,
                        });
                    }
                }
                // Shorthand for $eq, including plain sub-document equality
                _ => conditions.push(Query::Field {
                    field: field.to_string(),
                    op: QueryOp::Eq(SortKey::from_json(value)),
                }),
            },
        }
    }

    Ok(match conditions.len() {
        0 => Query::All,
        1 => conditions.remove(0),
        _ => Query::And(conditions),
    })
}

fn parse_op(op_key: &str, op_val: &JsonValue, options: Option<&str>) -> Result<QueryOp> {
    let list = |name: &str| -> Result<Vec<SortKey>> {
        let arr = op_val
            .as_array()
            .ok_or_else(|| Error::InvalidQuery(format!("{name} must be an array")))?;
        Ok(arr.iter().map(SortKey::from_json).collect())
    };

    match op_key {
        "$eq" => Ok(QueryOp::Eq(SortKey::from_json(op_val))),
        "$ne" => Ok(QueryOp::Ne(SortKey::from_json(op_val))),
        "$gt" => Ok(QueryOp::Gt(SortKey::from_json(op_val))),
        "$gte" => Ok(QueryOp::Gte(SortKey::from_json(op_val))),
        "$lt" => Ok(QueryOp::Lt(SortKey::from_json(op_val))),
        "$lte" => Ok(QueryOp::Lte(SortKey::from_json(op_val))),
        "$in" => Ok(QueryOp::In(list("$in")?)),
        "$nin" => Ok(QueryOp::Nin(list("$nin")?)),
        "$exists" => {
            let b = op_val
                .as_bool()
                .ok_or_else(|| Error::InvalidQuery("$exists must be a boolean".into()))?;
            Ok(QueryOp::Exists(b))
        }
        "$regex" => {
            let pattern = op_val
                .as_str()
                .ok_or_else(|| Error::InvalidQuery("$regex must be a string".into()))?;
            let flags = options.unwrap_or("");
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(flags.contains('i'))
                .multi_line(flags.contains('m'))
                .build()
                .map_err(|e| Error::InvalidQuery(format!("invalid $regex: {e}")))?;
            Ok(QueryOp::Regex(regex))
        }
        _ => Err(Error::InvalidQuery(format!("unknown operator: {op_key}"))),
    }
}

// ---------------------------------------------------------------------------
// Filter: evaluate a query against a single document
// ---------------------------------------------------------------------------

/// Resolve a field path (with dot notation) directly on a &Value.
fn resolve_field_ref<'a>(data: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut current = data;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

pub fn matches_value(query: &Query, data: &JsonValue) -> bool {
    match query {
        Query::All => true,
        Query::Field { field, op } => {
            let field_val = resolve_field_ref(data, field);
            match op {
                QueryOp::Exists(expected) => field_val.is_some() == *expected,
                QueryOp::Nin(vals) => field_val
                    .map(SortKey::from_json)
                    .is_none_or(|iv| !vals.contains(&iv)),
                QueryOp::Ne(v) => field_val.map(SortKey::from_json).is_none_or(|iv| iv != *v),
                QueryOp::Regex(re) => field_val
                    .and_then(JsonValue::as_str)
                    .is_some_and(|s| re.is_match(s)),
                _ => {
                    let Some(val) = field_val else {
                        return false;
                    };
                    let iv = SortKey::from_json(val);
                    match op {
                        QueryOp::Eq(v) => iv == *v,
                        QueryOp::Gt(v) => iv > *v,
                        QueryOp::Gte(v) => iv >= *v,
                        QueryOp::Lt(v) => iv < *v,
                        QueryOp::Lte(v) => iv <= *v,
                        QueryOp::In(vals) => vals.contains(&iv),
                        QueryOp::Exists(_) | QueryOp::Nin(_) | QueryOp::Ne(_) | QueryOp::Regex(_) => {
                            unreachable!()
                        }
                    }
                }
            }
        }
        Query::And(subs) => subs.iter().all(|s| matches_value(s, data)),
        Query::Or(subs) => subs.iter().any(|s| matches_value(s, data)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matches(query: JsonValue, doc: JsonValue) -> bool {
        matches_value(&parse_query(&query).unwrap(), &doc)
    }

    #[test]
    fn simple_eq() {
        assert!(matches(json!({"name": "Alice"}), json!({"name": "Alice"})));
        assert!(!matches(json!({"name": "Alice"}), json!({"name": "Bob"})));
    }

    #[test]
    fn range() {
        let q = json!({"age": {"$gte": 18, "$lt": 65}});
        assert!(matches(q.clone(), json!({"age": 30})));
        assert!(!matches(q.clone(), json!({"age": 10})));
        assert!(!matches(q, json!({"age": 70})));
    }

    #[test]
    fn date_range() {
        let q = json!({"created_at": {"$gte": "2024-01-01", "$lt": "2025-01-01"}});
        assert!(matches(q.clone(), json!({"created_at": "2024-06-15"})));
        assert!(!matches(q, json!({"created_at": "2023-06-15"})));
    }

    #[test]
    fn or() {
        let q = json!({"$or": [{"status": "active"}, {"priority": {"$gte": 5}}]});
        assert!(matches(q.clone(), json!({"status": "active", "priority": 1})));
        assert!(matches(q.clone(), json!({"status": "closed", "priority": 10})));
        assert!(!matches(q, json!({"status": "closed", "priority": 1})));
    }

    #[test]
    fn ne_and_nin_match_missing_fields() {
        assert!(matches(json!({"tag": {"$ne": "x"}}), json!({})));
        assert!(matches(json!({"tag": {"$nin": ["x", "y"]}}), json!({"tag": "z"})));
        assert!(!matches(json!({"tag": {"$nin": ["x", "y"]}}), json!({"tag": "y"})));
    }

    #[test]
    fn regex_with_options() {
        let q = json!({"name": {"$regex": "^al", "$options": "i"}});
        assert!(matches(q.clone(), json!({"name": "Alice"})));
        assert!(!matches(q.clone(), json!({"name": "Bob"})));
        assert!(!matches(q, json!({"name": 42})));
    }

    #[test]
    fn unknown_operator_errors() {
        assert!(matches!(
            parse_query(&json!({"a": {"$near": 1}})),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn invalid_regex_errors() {
        assert!(parse_query(&json!({"a": {"$regex": "("}})).is_err());
    }
}
