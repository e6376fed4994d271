//! Operator descriptors: immutable values describing one aggregation intent
//! each. They carry no behavior; [`crate::compiler`] turns them into stage
//! documents.

use serde_json::Value;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

/// One field of a `$project` stage.
///
/// When `children` is non-empty the node projects a sub-document and the
/// replacement value and suppression flag are ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    source_field: String,
    projected: Option<Value>,
    suppressed: bool,
    children: Vec<Projection>,
}

impl Projection {
    /// Include `field` as-is.
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            source_field: field.into(),
            projected: None,
            suppressed: false,
            children: Vec::new(),
        }
    }

    /// Emit `field` with the value of another field of the input document.
    pub fn renamed(field: impl Into<String>, from: &str) -> Self {
        Self::literal(field, format!("${from}"))
    }

    /// Emit `field` with a literal value or expression.
    pub fn literal(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            projected: Some(value.into()),
            ..Self::new(field)
        }
    }

    /// Project a sub-document of `field`.
    pub fn nested(field: impl Into<String>, children: Vec<Projection>) -> Self {
        Self {
            children,
            ..Self::new(field)
        }
    }

    /// Exclude this field from the output.
    pub fn suppress(mut self) -> Self {
        self.suppressed = true;
        self
    }

    pub fn source_field(&self) -> &str {
        &self.source_field
    }

    pub fn projected_value(&self) -> Option<&Value> {
        self.projected.as_ref()
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    pub fn children(&self) -> &[Projection] {
        &self.children
    }
}

// ---------------------------------------------------------------------------
// Accumulator & Group
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Accumulator {
    operation: String,
    operand: Value,
}

impl Accumulator {
    pub fn new(operation: impl Into<String>, operand: impl Into<Value>) -> Self {
        Self {
            operation: operation.into(),
            operand: operand.into(),
        }
    }

    fn over_field(operation: &str, field: &str) -> Self {
        Self::new(operation, format!("${field}"))
    }

    pub fn sum(field: &str) -> Self {
        Self::over_field("$sum", field)
    }

    /// `{$sum: value}`; `sum_literal(1)` counts documents.
    pub fn sum_literal(value: impl Into<Value>) -> Self {
        Self::new("$sum", value)
    }

    pub fn avg(field: &str) -> Self {
        Self::over_field("$avg", field)
    }

    pub fn min(field: &str) -> Self {
        Self::over_field("$min", field)
    }

    pub fn max(field: &str) -> Self {
        Self::over_field("$max", field)
    }

    pub fn first(field: &str) -> Self {
        Self::over_field("$first", field)
    }

    pub fn last(field: &str) -> Self {
        Self::over_field("$last", field)
    }

    pub fn push(field: &str) -> Self {
        Self::over_field("$push", field)
    }

    pub fn add_to_set(field: &str) -> Self {
        Self::over_field("$addToSet", field)
    }

    pub fn count() -> Self {
        Self::new("$count", Value::Object(Default::default()))
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn operand(&self) -> &Value {
        &self.operand
    }
}

/// A named group output (`grouping`) or a component of a composite group
/// key (`key` / `key_from`).
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    name: String,
    source_field: String,
    accumulator: Option<Accumulator>,
}

impl Group {
    pub fn grouping(name: impl Into<String>, accumulator: Accumulator) -> Self {
        let name = name.into();
        Self {
            source_field: format!("${name}"),
            name,
            accumulator: Some(accumulator),
        }
    }

    /// Key component named after the field it reads.
    pub fn key(name: &str) -> Self {
        Self::key_from(name, name)
    }

    pub fn key_from(name: impl Into<String>, source_field: &str) -> Self {
        Self {
            name: name.into(),
            source_field: format!("${source_field}"),
            accumulator: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_field(&self) -> &str {
        &self.source_field
    }

    pub fn accumulator(&self) -> Option<&Accumulator> {
        self.accumulator.as_ref()
    }
}

/// The `_id` expression of a `$group` stage.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupId {
    /// `"$field"`
    Field(String),
    /// `{name: sourceField, ...}`
    Composite(Vec<Group>),
    /// `null`: one group over the whole input.
    Null,
}

impl From<&str> for GroupId {
    fn from(field: &str) -> Self {
        GroupId::Field(field.to_string())
    }
}

impl From<String> for GroupId {
    fn from(field: String) -> Self {
        GroupId::Field(field)
    }
}

impl From<Vec<Group>> for GroupId {
    fn from(keys: Vec<Group>) -> Self {
        GroupId::Composite(keys)
    }
}

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Matcher {
    field: String,
    operation: String,
    operand: Value,
}

impl Matcher {
    pub fn new(
        field: impl Into<String>,
        operation: impl Into<String>,
        operand: impl Into<Value>,
    ) -> Self {
        Self {
            field: field.into(),
            operation: operation.into(),
            operand: operand.into(),
        }
    }

    pub fn eq(field: impl Into<String>, operand: impl Into<Value>) -> Self {
        Self::new(field, "$eq", operand)
    }

    pub fn ne(field: impl Into<String>, operand: impl Into<Value>) -> Self {
        Self::new(field, "$ne", operand)
    }

    pub fn gt(field: impl Into<String>, operand: impl Into<Value>) -> Self {
        Self::new(field, "$gt", operand)
    }

    pub fn gte(field: impl Into<String>, operand: impl Into<Value>) -> Self {
        Self::new(field, "$gte", operand)
    }

    pub fn lt(field: impl Into<String>, operand: impl Into<Value>) -> Self {
        Self::new(field, "$lt", operand)
    }

    pub fn lte(field: impl Into<String>, operand: impl Into<Value>) -> Self {
        Self::new(field, "$lte", operand)
    }

    pub fn in_<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::new(field, "$in", values.into_iter().map(Into::into).collect::<Vec<_>>())
    }

    pub fn nin<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::new(field, "$nin", values.into_iter().map(Into::into).collect::<Vec<_>>())
    }

    pub fn exists(field: impl Into<String>, exists: bool) -> Self {
        Self::new(field, "$exists", exists)
    }

    pub fn regex(field: impl Into<String>, pattern: &str) -> Self {
        Self::new(field, "$regex", pattern)
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn operand(&self) -> &Value {
        &self.operand
    }
}

// ---------------------------------------------------------------------------
// Sort
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn as_i32(self) -> i32 {
        match self {
            Direction::Ascending => 1,
            Direction::Descending => -1,
        }
    }
}

impl TryFrom<i64> for Direction {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            1 => Ok(Direction::Ascending),
            -1 => Ok(Direction::Descending),
            other => Err(Error::MalformedDescriptor(format!(
                "sort direction must be 1 or -1, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    field: String,
    direction: Direction,
}

impl Sort {
    pub fn new(field: impl Into<String>, direction: Direction) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }

    pub fn ascending(field: impl Into<String>) -> Self {
        Self::new(field, Direction::Ascending)
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self::new(field, Direction::Descending)
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}
