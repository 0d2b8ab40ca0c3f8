//! Field-path navigation over YAML documents
//!
//! Supported syntax:
//! - dotted keys: `metadata.labels.env`
//! - integer indices: `spec.containers[1].image`
//! - key-value selectors: `spec.containers[name=foo].image`
//! - quoted keys: `metadata.annotations['config.kubernetes.io/path']`
//!
//! Bracket forms are normalized into separate path components, so
//! `a.b[1]` and `a.b.[1]` navigate the same way.

use serde_yaml::Value;

use crate::error::{PorchError, Result};

/// One step of a field path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
    Select { key: String, value: String },
}

/// A parsed field path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<Segment>,
}

impl FieldPath {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: &str| PorchError::ParseFailed {
            path: input.to_string(),
            reason: reason.to_string(),
        };

        let mut segments = Vec::new();
        let mut chars = input.trim().chars().peekable();
        let mut key = String::new();

        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    if !key.is_empty() {
                        segments.push(Segment::Key(std::mem::take(&mut key)));
                    }
                }
                '[' => {
                    if !key.is_empty() {
                        segments.push(Segment::Key(std::mem::take(&mut key)));
                    }
                    let mut inner = String::new();
                    let mut closed = false;
                    let quote = chars.peek().copied().filter(|q| *q == '\'' || *q == '"');
                    if let Some(q) = quote {
                        chars.next();
                        for c in chars.by_ref() {
                            if c == q {
                                break;
                            }
                            inner.push(c);
                        }
                        if chars.next() != Some(']') {
                            return Err(invalid("unterminated quoted key"));
                        }
                        segments.push(Segment::Key(inner));
                        continue;
                    }
                    for c in chars.by_ref() {
                        if c == ']' {
                            closed = true;
                            break;
                        }
                        inner.push(c);
                    }
                    if !closed {
                        return Err(invalid("missing ']'"));
                    }
                    segments.push(parse_bracket(inner.trim()).ok_or_else(|| invalid("empty brackets"))?);
                }
                _ => key.push(c),
            }
        }
        if !key.is_empty() {
            segments.push(Segment::Key(key));
        }
        if segments.is_empty() {
            return Err(invalid("empty field path"));
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Value at this path, if every step resolves
    pub fn get<'v>(&self, root: &'v Value) -> Option<&'v Value> {
        let mut current = root;
        for segment in &self.segments {
            current = step(current, segment)?;
        }
        Some(current)
    }

    /// Scalar value at this path rendered as a string
    pub fn get_string(&self, root: &Value) -> Option<String> {
        scalar_to_string(self.get(root)?)
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Key(k) if k.contains(['.', '[', ']']) => write!(f, "['{k}']")?,
                Segment::Key(k) => {
                    if i > 0 {
                        f.write_str(".")?;
                    }
                    f.write_str(k)?;
                }
                Segment::Index(n) => write!(f, "[{n}]")?,
                Segment::Select { key, value } => write!(f, "[{key}={value}]")?,
            }
        }
        Ok(())
    }
}

fn parse_bracket(inner: &str) -> Option<Segment> {
    if inner.is_empty() {
        return None;
    }
    if let Ok(index) = inner.parse::<usize>() {
        return Some(Segment::Index(index));
    }
    match inner.split_once('=') {
        Some((key, value)) => Some(Segment::Select {
            key: key.trim().to_string(),
            value: value.trim().trim_matches(['\'', '"']).to_string(),
        }),
        None => Some(Segment::Key(inner.to_string())),
    }
}

fn step<'v>(node: &'v Value, segment: &Segment) -> Option<&'v Value> {
    match (node, segment) {
        (Value::Mapping(map), Segment::Key(key)) => map.get(key.as_str()),
        (Value::Sequence(items), Segment::Key(key)) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        (Value::Sequence(items), Segment::Index(i)) => items.get(*i),
        (Value::Sequence(items), Segment::Select { key, value }) => items.iter().find(|item| {
            item.get(key.as_str())
                .and_then(scalar_to_string)
                .is_some_and(|v| v == *value)
        }),
        (Value::Tagged(tagged), _) => step(&tagged.value, segment),
        _ => None,
    }
}

/// Render a scalar node as a string; `None` for mappings and sequences
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        Value::Tagged(tagged) => scalar_to_string(&tagged.value),
        Value::Sequence(_) | Value::Mapping(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod() -> Value {
        serde_yaml::from_str(
            r"
metadata:
  name: web
  labels:
    env: dev
  annotations:
    config.kubernetes.io/path: web.yaml
spec:
  containers:
  - name: foo
    image: nginx:1
  - name: bar
    image: redis:7
  replicas: 3
",
        )
        .unwrap()
    }

    #[test]
    fn test_dotted_lookup() {
        let path = FieldPath::parse("metadata.labels.env").unwrap();
        assert_eq!(path.get_string(&pod()).as_deref(), Some("dev"));
    }

    #[test]
    fn test_index_lookup() {
        let path = FieldPath::parse("spec.containers[1].image").unwrap();
        assert_eq!(path.get_string(&pod()).as_deref(), Some("redis:7"));
    }

    #[test]
    fn test_selector_lookup() {
        let path = FieldPath::parse("spec.containers[name=foo].image").unwrap();
        assert_eq!(path.get_string(&pod()).as_deref(), Some("nginx:1"));
    }

    #[test]
    fn test_quoted_key_lookup() {
        let path = FieldPath::parse("metadata.annotations['config.kubernetes.io/path']").unwrap();
        assert_eq!(path.get_string(&pod()).as_deref(), Some("web.yaml"));
    }

    #[test]
    fn test_brackets_normalize_into_components() {
        let a = FieldPath::parse("spec.containers[0].name").unwrap();
        let b = FieldPath::parse("spec.containers.[0].name").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.segments().len(), 4);
    }

    #[test]
    fn test_number_rendered() {
        let path = FieldPath::parse("spec.replicas").unwrap();
        assert_eq!(path.get_string(&pod()).as_deref(), Some("3"));
    }

    #[test]
    fn test_missing_path() {
        let path = FieldPath::parse("spec.containers[name=baz].image").unwrap();
        assert!(path.get(&pod()).is_none());
        assert!(FieldPath::parse("spec.containers[1").is_err());
        assert!(FieldPath::parse("").is_err());
    }

    #[test]
    fn test_display() {
        let path = FieldPath::parse("spec.containers[name=foo].image").unwrap();
        assert_eq!(path.to_string(), "spec.containers[name=foo].image");
    }
}
