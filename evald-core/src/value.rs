//! Engine-agnostic model of an evaluated value, as consumed by the
//! [`formatter`](crate::formatter).

use std::fmt;
use std::sync::Arc;

/// A value that can be enumerated, but whose enumeration may fail.
pub trait Iterable: fmt::Debug + fmt::Display + Send + Sync {
    fn elements(&self) -> Result<Vec<Value>, String>;
}

/// Deepest container nesting an engine should build. Rendering, cloning and
/// dropping values all recurse once per level.
pub const MAX_NESTING: usize = 128;

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Char(char),
    List(Vec<Value>),
    /// Insertion-ordered key/value pairs.
    Map(Vec<(Value, Value)>),
    Iterable(Arc<dyn Iterable>),
    /// Backend value with nothing but a textual representation.
    Opaque(String),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Char(_) => "char",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Iterable(_) => "iterable",
            Value::Opaque(_) => "opaque",
        }
    }

    /// Container nesting depth: 0 for scalars, 1 for a flat list or map.
    /// Walks the value without recursion.
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack = vec![(self, 0)];
        while let Some((value, depth)) = stack.pop() {
            match value {
                Value::List(items) => {
                    deepest = deepest.max(depth + 1);
                    stack.extend(items.iter().map(|item| (item, depth + 1)));
                }
                Value::Map(entries) => {
                    deepest = deepest.max(depth + 1);
                    for (key, val) in entries {
                        stack.push((key, depth + 1));
                        stack.push((val, depth + 1));
                    }
                }
                _ => deepest = deepest.max(depth),
            }
        }
        deepest
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(entries) => !entries.is_empty(),
            Value::Char(_) | Value::Iterable(_) | Value::Opaque(_) => true,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Iterable(a), Value::Iterable(b)) => Arc::ptr_eq(a, b),
            (Value::Opaque(a), Value::Opaque(b)) => a == b,
            _ => false,
        }
    }
}

/// Plain textual representation: strings and chars unquoted, containers
/// rendered the way the formatter renders them.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => f.write_str(s),
            Value::Char(c) => write!(f, "{c}"),
            Value::List(_) | Value::Map(_) => {
                f.write_str(&crate::formatter::format_value(Some(self)))
            }
            Value::Iterable(it) => write!(f, "{it}"),
            Value::Opaque(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<char> for Value {
    fn from(c: char) -> Self {
        Value::Char(c)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}
