//! # Result Formatter
//!
//! Renders a produced value as a literal-like display string. Only used when
//! the engine reports a value; plain output is passed through untouched.
//!
//! | value              | rendering                    |
//! |--------------------|------------------------------|
//! | absent / null      | `null`                       |
//! | bool               | `true` / `false`             |
//! | string             | `"a \"b\""` (only `"` escaped) |
//! | char               | `'x'`, `'\n'`, `'\x1b'`      |
//! | list / iterable    | `{ 1, "a" }`, empty `{  }`   |
//! | map                | `{{ k, v }, { k2, v2 }}`, empty `{}` |
//! | anything else      | its `Display` representation |

use std::fmt::{self, Write};

use crate::value::Value;

pub fn format_value(value: Option<&Value>) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = write_value(&mut out, value);
    out
}

pub fn write_value<W: Write>(out: &mut W, value: Option<&Value>) -> fmt::Result {
    let Some(value) = value else {
        return out.write_str("null");
    };

    match value {
        Value::Null => out.write_str("null"),
        Value::Bool(true) => out.write_str("true"),
        Value::Bool(false) => out.write_str("false"),
        Value::Str(s) => write!(out, "\"{}\"", s.replace('"', "\\\"")),
        Value::Char(c) => write_char(out, *c),
        Value::List(items) => write_sequence(out, items),
        Value::Map(entries) => {
            out.write_str("{")?;
            for (i, (key, val)) in entries.iter().enumerate() {
                if i != 0 {
                    out.write_str(", ")?;
                }
                out.write_str("{ ")?;
                write_value(out, Some(key))?;
                out.write_str(", ")?;
                write_value(out, Some(val))?;
                out.write_str(" }")?;
            }
            out.write_str("}")
        }
        // Something that claims to be iterable may still refuse to iterate.
        Value::Iterable(it) => match it.elements() {
            Ok(items) => write_sequence(out, &items),
            Err(_) => write!(out, "{it}"),
        },
        Value::Int(_) | Value::Float(_) | Value::Opaque(_) => write!(out, "{value}"),
    }
}

fn write_sequence<W: Write>(out: &mut W, items: &[Value]) -> fmt::Result {
    out.write_str("{ ")?;
    for (i, item) in items.iter().enumerate() {
        if i != 0 {
            out.write_str(", ")?;
        }
        write_value(out, Some(item))?;
    }
    out.write_str(" }")
}

fn write_char<W: Write>(out: &mut W, c: char) -> fmt::Result {
    if c == '\'' {
        return out.write_str("'\\''");
    }
    if u32::from(c) > 32 {
        return write!(out, "'{c}'");
    }
    match c {
        '\u{07}' => out.write_str("'\\a'"),
        '\u{08}' => out.write_str("'\\b'"),
        '\n' => out.write_str("'\\n'"),
        '\u{0b}' => out.write_str("'\\v'"),
        '\r' => out.write_str("'\\r'"),
        '\u{0c}' => out.write_str("'\\f'"),
        '\t' => out.write_str("'\\t'"),
        _ => write!(out, "'\\x{:02x}'", u32::from(c)),
    }
}
