//! Stage compiler: operator descriptors in, stage documents out.
//!
//! Every function builds its whole stage before returning, so a failing
//! descriptor never yields a partial document.

use serde_json::{Value, json};

use crate::document::Document;
use crate::error::{Error, Result};
use crate::operators::{Group, GroupId, Matcher, Projection, Sort};
use crate::schema::{FieldResolver, Schema};

pub struct StageCompiler {
    schema: Schema,
}

fn check_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::MalformedDescriptor(format!(
            "{kind} requires a field name"
        )));
    }
    Ok(())
}

fn check_operator(kind: &str, op: &str) -> Result<()> {
    if !op.starts_with('$') || op.len() < 2 {
        return Err(Error::MalformedDescriptor(format!(
            "{kind} operator must start with '$', got '{op}'"
        )));
    }
    Ok(())
}

fn stage(name: &str, body: impl Into<Value>) -> Value {
    json!({ name: body.into() })
}

impl StageCompiler {
    pub fn new(schema: Schema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// `{"$project": {...}}`. Field names go through the schema only when
    /// this is the pipeline's first stage; later stages see the output of
    /// earlier ones, which has no static schema.
    pub fn project(&self, projections: &[Projection], first_stage: bool) -> Result<Value> {
        let mut body = Document::new();
        for projection in projections {
            body.merge(self.projection(projection, first_stage)?);
        }
        Ok(stage("$project", body))
    }

    fn projection(&self, projection: &Projection, first_stage: bool) -> Result<Document> {
        let source = projection.source_field();
        check_name("projection", source)?;
        let name = if first_stage {
            self.schema.resolve(source)?
        } else {
            source
        };

        if !projection.children().is_empty() {
            let mut nested = Document::new();
            for child in projection.children() {
                nested.merge(self.projection(child, first_stage)?);
            }
            Ok(Document::with(name, nested))
        } else if let Some(value) = projection.projected_value() {
            Ok(Document::with(name, value.clone()))
        } else {
            Ok(Document::with(name, if projection.is_suppressed() { 0 } else { 1 }))
        }
    }

    /// `{"$group": {"_id": <id>, out: {op: operand}, ...}}`
    pub fn group(&self, id: &GroupId, groupings: &[Group]) -> Result<Value> {
        let id_expr = match id {
            GroupId::Field(field) => {
                check_name("group id", field)?;
                Value::String(format!("${field}"))
            }
            GroupId::Composite(keys) => {
                if keys.is_empty() {
                    return Err(Error::MalformedDescriptor(
                        "composite group id requires at least one key".into(),
                    ));
                }
                let mut id_doc = Document::new();
                for key in keys {
                    check_name("group key", key.name())?;
                    id_doc.insert(key.name(), key.source_field());
                }
                id_doc.into_value()
            }
            GroupId::Null => Value::Null,
        };

        let mut body = Document::with("_id", id_expr);
        for grouping in groupings {
            check_name("grouping", grouping.name())?;
            let accumulator = grouping.accumulator().ok_or_else(|| {
                Error::MalformedDescriptor(format!(
                    "grouping '{}' has no accumulator",
                    grouping.name()
                ))
            })?;
            check_operator("accumulator", accumulator.operation())?;
            body.insert(
                grouping.name(),
                Document::with(accumulator.operation(), accumulator.operand().clone()),
            );
        }
        Ok(stage("$group", body))
    }

    /// `{"$match": {field: {op: operand}, ...}}`
    pub fn matching(&self, matchers: &[Matcher]) -> Result<Value> {
        let mut body = Document::new();
        for matcher in matchers {
            check_name("matcher", matcher.field())?;
            check_operator("matcher", matcher.operation())?;
            body.insert(
                matcher.field(),
                Document::with(matcher.operation(), matcher.operand().clone()),
            );
        }
        Ok(stage("$match", body))
    }

    /// `{"$sort": {field: 1|-1, ...}}`, keys in the order given.
    pub fn sort(&self, sorts: &[Sort]) -> Result<Value> {
        let mut body = Document::new();
        for sort in sorts {
            check_name("sort", sort.field())?;
            body.insert(sort.field(), sort.direction().as_i32());
        }
        Ok(stage("$sort", body))
    }

    pub fn skip(&self, n: u64) -> Result<Value> {
        Ok(stage("$skip", n))
    }

    pub fn limit(&self, n: u64) -> Result<Value> {
        if n == 0 {
            return Err(Error::MalformedDescriptor(
                "$limit must be positive".into(),
            ));
        }
        Ok(stage("$limit", n))
    }

    pub fn unwind(&self, field: &str) -> Result<Value> {
        check_name("unwind", field)?;
        Ok(stage("$unwind", format!("${field}")))
    }
}
