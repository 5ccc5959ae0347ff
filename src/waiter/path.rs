//! Extract Paths
//!
//! A small path language for pulling status values out of control-plane
//! responses:
//!
//! - `Status` / `DBCluster.Status` - field access
//! - `DBClusters[0].Status` - index (negative counts from the end)
//! - `DBClusters[].Status` - projection over a list, flattening nested lists
//! - `length(DBClusters)` - element count of a list, string or object

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(i64),
    Flatten,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Path(Vec<Segment>),
    Length(Vec<Segment>),
}

/// Parsed path expression; serialized as its source text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExtractPath {
    source: String,
    expr: Expr,
}

impl ExtractPath {
    /// Parse a path expression
    pub fn parse(source: &str) -> Result<Self> {
        let trimmed = source.trim();
        let expr = match trimmed
            .strip_prefix("length(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            Some(inner) => Expr::Length(parse_segments(source, inner.trim())?),
            None => Expr::Path(parse_segments(source, trimmed)?),
        };

        Ok(Self {
            source: trimmed.to_string(),
            expr,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Evaluate against a response. `None` when the path does not resolve.
    pub fn evaluate(&self, root: &Value) -> Option<Value> {
        match &self.expr {
            Expr::Path(segments) => walk(root, segments).into_value(),
            Expr::Length(segments) => {
                let len = match walk(root, segments) {
                    Cursor::One(Some(Value::Array(items))) => items.len(),
                    Cursor::One(Some(Value::Object(map))) => map.len(),
                    Cursor::One(Some(Value::String(s))) => s.chars().count(),
                    Cursor::Many(items) => items.len(),
                    Cursor::One(_) => return None,
                };
                Some(Value::from(len as u64))
            }
        }
    }

    /// Evaluate and render scalar results as strings; lists yield one
    /// string per scalar element.
    pub fn evaluate_strings(&self, root: &Value) -> Vec<String> {
        match self.evaluate(root) {
            Some(Value::Array(items)) => items.iter().filter_map(scalar_string).collect(),
            Some(other) => scalar_string(&other).into_iter().collect(),
            None => Vec::new(),
        }
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl std::fmt::Display for ExtractPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

impl TryFrom<String> for ExtractPath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ExtractPath> for String {
    fn from(value: ExtractPath) -> Self {
        value.source
    }
}

impl std::str::FromStr for ExtractPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// =============================================================================
// Parsing
// =============================================================================

fn parse_segments(source: &str, body: &str) -> Result<Vec<Segment>> {
    let invalid = |reason: &str| Error::InvalidPath {
        path: source.to_string(),
        reason: reason.to_string(),
    };

    if body.is_empty() {
        return Err(invalid("empty path"));
    }

    let mut segments = Vec::new();
    for part in body.split('.') {
        if part.is_empty() {
            return Err(invalid("empty segment"));
        }

        let (name, mut rest) = match part.find('[') {
            Some(pos) => part.split_at(pos),
            None => (part, ""),
        };

        if !name.is_empty() {
            if name.contains(|c: char| matches!(c, ']' | '(' | ')') || c.is_whitespace()) {
                return Err(invalid("unexpected character in field name"));
            }
            segments.push(Segment::Field(name.to_string()));
        }

        while !rest.is_empty() {
            let close = rest.find(']').ok_or_else(|| invalid("unclosed '['"))?;
            let inner = &rest[1..close];
            if inner.is_empty() {
                segments.push(Segment::Flatten);
            } else {
                let index = inner
                    .parse::<i64>()
                    .map_err(|_| invalid("index must be an integer"))?;
                segments.push(Segment::Index(index));
            }
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return Err(invalid("expected '[' or '.' after ']'"));
            }
        }
    }

    Ok(segments)
}

// =============================================================================
// Evaluation
// =============================================================================

enum Cursor<'a> {
    One(Option<&'a Value>),
    Many(Vec<&'a Value>),
}

impl Cursor<'_> {
    fn into_value(self) -> Option<Value> {
        match self {
            Cursor::One(Some(Value::Null)) | Cursor::One(None) => None,
            Cursor::One(Some(v)) => Some(v.clone()),
            Cursor::Many(items) => Some(Value::Array(items.into_iter().cloned().collect())),
        }
    }
}

fn index_of(items: &[Value], index: i64) -> Option<&Value> {
    let len = items.len() as i64;
    let resolved = if index < 0 { len + index } else { index };
    if resolved < 0 {
        return None;
    }
    items.get(resolved as usize)
}

fn walk<'a>(root: &'a Value, segments: &[Segment]) -> Cursor<'a> {
    let mut cursor = Cursor::One(Some(root));

    for segment in segments {
        cursor = match (cursor, segment) {
            (Cursor::One(value), Segment::Field(name)) => {
                Cursor::One(value.and_then(|v| v.get(name.as_str())))
            }
            (Cursor::One(value), Segment::Index(i)) => Cursor::One(
                value
                    .and_then(Value::as_array)
                    .and_then(|items| index_of(items, *i)),
            ),
            (Cursor::One(value), Segment::Flatten) => match value {
                Some(Value::Array(items)) => Cursor::Many(items.iter().collect()),
                _ => Cursor::One(None),
            },
            (Cursor::Many(items), Segment::Field(name)) => Cursor::Many(
                items
                    .into_iter()
                    .filter_map(|v| v.get(name.as_str()))
                    .filter(|v| !v.is_null())
                    .collect(),
            ),
            (Cursor::Many(items), Segment::Index(i)) => Cursor::Many(
                items
                    .into_iter()
                    .filter_map(|v| v.as_array().and_then(|inner| index_of(inner, *i)))
                    .collect(),
            ),
            (Cursor::Many(items), Segment::Flatten) => {
                let mut flattened = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Array(inner) => flattened.extend(inner.iter()),
                        other => flattened.push(other),
                    }
                }
                Cursor::Many(flattened)
            }
        };
    }

    cursor
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn clusters() -> Value {
        json!({
            "DBClusters": [
                {"DBClusterIdentifier": "a", "Status": "available", "Members": [{"Id": 1}, {"Id": 2}]},
                {"DBClusterIdentifier": "b", "Status": "creating", "Members": [{"Id": 3}]}
            ],
            "Marker": null
        })
    }

    #[test]
    fn test_field_and_index() {
        let path = ExtractPath::parse("DBClusters[0].Status").unwrap();
        assert_eq!(path.evaluate(&clusters()), Some(json!("available")));

        let last = ExtractPath::parse("DBClusters[-1].DBClusterIdentifier").unwrap();
        assert_eq!(last.evaluate(&clusters()), Some(json!("b")));

        let missing = ExtractPath::parse("DBClusters[5].Status").unwrap();
        assert_eq!(missing.evaluate(&clusters()), None);
    }

    #[test]
    fn test_projection() {
        let path = ExtractPath::parse("DBClusters[].Status").unwrap();
        assert_eq!(path.evaluate(&clusters()), Some(json!(["available", "creating"])));

        let nested = ExtractPath::parse("DBClusters[].Members[].Id").unwrap();
        assert_eq!(nested.evaluate(&clusters()), Some(json!([1, 2, 3])));
    }

    #[test]
    fn test_projection_over_empty_list() {
        let path = ExtractPath::parse("DBClusters[].Status").unwrap();
        assert_eq!(path.evaluate(&json!({"DBClusters": []})), Some(json!([])));
    }

    #[test]
    fn test_length() {
        let path = ExtractPath::parse("length(DBClusters)").unwrap();
        assert_eq!(path.evaluate(&clusters()), Some(json!(2)));
        assert_eq!(path.evaluate(&json!({"DBClusters": []})), Some(json!(0)));
        assert_eq!(path.evaluate(&json!({})), None);
    }

    #[test]
    fn test_null_is_unresolved() {
        let path = ExtractPath::parse("Marker").unwrap();
        assert_eq!(path.evaluate(&clusters()), None);
    }

    #[test]
    fn test_evaluate_strings() {
        let path = ExtractPath::parse("DBClusters[].DBClusterIdentifier").unwrap();
        assert_eq!(path.evaluate_strings(&clusters()), vec!["a", "b"]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(ExtractPath::parse("").is_err());
        assert!(ExtractPath::parse("a..b").is_err());
        assert!(ExtractPath::parse("a[").is_err());
        assert!(ExtractPath::parse("a[x]").is_err());
        assert!(ExtractPath::parse("a[0]b").is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let path: ExtractPath = serde_json::from_value(json!("DBClusters[].Status")).unwrap();
        assert_eq!(serde_json::to_value(&path).unwrap(), json!("DBClusters[].Status"));
        assert!(serde_json::from_value::<ExtractPath>(json!("a[")).is_err());
    }
}
