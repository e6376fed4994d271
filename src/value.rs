use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use serde_json::Value as JsonValue;

/// Comparable view of a JSON value, used by `$match`, `$sort`, `$min`/`$max`
/// and `$addToSet`.
///
/// Ordering across types: null < bool < number < date < string. Date-shaped
/// strings compare as millisecond timestamps.
#[derive(Debug, Clone)]
pub enum SortKey {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    DateTime(i64),
    String(String),
}

impl Eq for SortKey {}

impl Hash for SortKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            SortKey::Null => {}
            SortKey::Boolean(b) => b.hash(state),
            SortKey::Integer(i) => i.hash(state),
            SortKey::Float(f) => f.to_bits().hash(state),
            SortKey::DateTime(ms) => ms.hash(state),
            SortKey::String(s) => s.hash(state),
        }
    }
}

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        use SortKey::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,

            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Boolean(_), _) => Ordering::Less,
            (_, Boolean(_)) => Ordering::Greater,

            (Integer(a), Integer(b)) => a.cmp(b),
            (Integer(a), Float(b)) => (*a as f64).total_cmp(b),
            (Float(a), Integer(b)) => a.total_cmp(&(*b as f64)),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Integer(_) | Float(_), _) => Ordering::Less,
            (_, Integer(_) | Float(_)) => Ordering::Greater,

            (DateTime(a), DateTime(b)) => a.cmp(b),
            (DateTime(_), _) => Ordering::Less,
            (_, DateTime(_)) => Ordering::Greater,

            (String(a), String(b)) => a.cmp(b),
        }
    }
}

impl SortKey {
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => SortKey::Null,
            JsonValue::Bool(b) => SortKey::Boolean(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SortKey::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    SortKey::Float(f)
                } else {
                    SortKey::Null
                }
            }
            JsonValue::String(s) => Self::parse_string(s),
            // Arrays and sub-documents compare by their serialized form
            other => SortKey::String(other.to_string()),
        }
    }

    pub fn parse_string(s: &str) -> Self {
        // Only strings starting with YYYY-MM are worth a date parse.
        let b = s.as_bytes();
        if b.len() < 10
            || !b[..4].iter().all(u8::is_ascii_digit)
            || b[4] != b'-'
            || !b[5..7].iter().all(u8::is_ascii_digit)
        {
            return SortKey::String(s.to_string());
        }

        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
            return SortKey::DateTime(dt.timestamp_millis());
        }
        for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
            if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, format) {
                return SortKey::DateTime(dt.and_utc().timestamp_millis());
            }
        }
        if let Some(dt) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
        {
            return SortKey::DateTime(dt.and_utc().timestamp_millis());
        }
        SortKey::String(s.to_string())
    }
}
