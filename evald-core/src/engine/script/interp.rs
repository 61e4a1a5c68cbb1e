//! Tree-walking interpreter for parsed scripts.
//!
//! All variables live in one flat scope owned by the session, so bindings
//! made by one request are visible to the next.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use thiserror::Error;

use super::lexer::Operator;
use super::parser::{Expr, Stmt, Target};
use crate::engine::{EngineError, EvalContext};
use crate::value::{MAX_NESTING, Value};

/// Largest list `range` will build.
const MAX_RANGE_LEN: i64 = 1_000_000;
/// Granularity at which `sleep` notices cancellation.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("evaluation cancelled")]
    Cancelled,
    #[error("{0}")]
    Error(String),
}

impl From<EngineError> for RuntimeError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Cancelled => RuntimeError::Cancelled,
            other => RuntimeError::Error(other.to_string()),
        }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

fn fail<T>(message: impl Into<String>) -> RuntimeResult<T> {
    Err(RuntimeError::Error(message.into()))
}

#[derive(Debug, Default)]
pub struct Interpreter {
    vars: HashMap<String, Value>,
}

impl Interpreter {
    /// Runs a program, returning the value of its tail expression if any.
    pub fn run(&mut self, program: &[Stmt], ctx: &EvalContext) -> RuntimeResult<Option<Value>> {
        let mut produced = None;
        for stmt in program {
            ctx.checkpoint()?;
            match stmt {
                Stmt::Tail(expr) => produced = self.eval_tail(expr, ctx)?,
                other => self.execute(other, ctx)?,
            }
        }
        Ok(produced)
    }

    fn execute_block(&mut self, block: &[Stmt], ctx: &EvalContext) -> RuntimeResult<()> {
        for stmt in block {
            ctx.checkpoint()?;
            self.execute(stmt, ctx)?;
        }
        Ok(())
    }

    fn execute(&mut self, stmt: &Stmt, ctx: &EvalContext) -> RuntimeResult<()> {
        match stmt {
            Stmt::Let(name, expr) => {
                let value = self.eval(expr, ctx)?;
                self.vars.insert(name.clone(), value);
            }
            Stmt::Assign(Target::Name(name), expr) => {
                if !self.vars.contains_key(name) {
                    return fail(format!("undefined variable `{name}`"));
                }
                let value = self.eval(expr, ctx)?;
                self.vars.insert(name.clone(), value);
            }
            Stmt::Assign(Target::Index(name, index), expr) => {
                let index = self.eval(index, ctx)?;
                let value = self.eval(expr, ctx)?;
                let Some(container) = self.vars.get_mut(name) else {
                    return fail(format!("undefined variable `{name}`"));
                };
                assign_index(container, index, value)?;
            }
            Stmt::If(condition, then_branch, else_branch) => {
                if self.eval(condition, ctx)?.is_truthy() {
                    self.execute_block(then_branch, ctx)?;
                } else if let Some(else_branch) = else_branch {
                    self.execute_block(else_branch, ctx)?;
                }
            }
            Stmt::While(condition, body) => {
                while self.eval(condition, ctx)?.is_truthy() {
                    ctx.checkpoint()?;
                    self.execute_block(body, ctx)?;
                }
            }
            Stmt::Expr(expr) | Stmt::Tail(expr) => {
                self.eval(expr, ctx)?;
            }
        }
        Ok(())
    }

    /// A trailing call to a builtin that returns nothing produces no value.
    fn eval_tail(&mut self, expr: &Expr, ctx: &EvalContext) -> RuntimeResult<Option<Value>> {
        if let Expr::Call(name, _) = expr {
            if is_void_builtin(name) {
                self.eval(expr, ctx)?;
                return Ok(None);
            }
        }
        self.eval(expr, ctx).map(Some)
    }

    fn eval(&mut self, expr: &Expr, ctx: &EvalContext) -> RuntimeResult<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Var(name) => match self.vars.get(name) {
                Some(value) => Ok(value.clone()),
                None => fail(format!("undefined variable `{name}`")),
            },
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item, ctx).and_then(nestable))
                .collect::<RuntimeResult<Vec<_>>>()
                .map(Value::List),
            Expr::Map(entries) => {
                let mut map = Value::Map(Vec::with_capacity(entries.len()));
                for (key, value) in entries {
                    let key = self.eval(key, ctx)?;
                    let value = self.eval(value, ctx)?;
                    assign_index(&mut map, key, value)?;
                }
                Ok(map)
            }
            Expr::Unary(op, operand) => {
                let operand = self.eval(operand, ctx)?;
                unary(*op, operand)
            }
            Expr::Binary(lhs, Operator::And, rhs) => {
                if !self.eval(lhs, ctx)?.is_truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.eval(rhs, ctx)?.is_truthy()))
            }
            Expr::Binary(lhs, Operator::Or, rhs) => {
                if self.eval(lhs, ctx)?.is_truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.eval(rhs, ctx)?.is_truthy()))
            }
            Expr::Binary(lhs, op, rhs) => {
                let lhs = self.eval(lhs, ctx)?;
                let rhs = self.eval(rhs, ctx)?;
                binary(*op, lhs, rhs)
            }
            Expr::Index(base, index) => {
                let base = self.eval(base, ctx)?;
                let index = self.eval(index, ctx)?;
                lookup(&base, &index)
            }
            Expr::Call(name, args) => {
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg, ctx))
                    .collect::<RuntimeResult<Vec<_>>>()?;
                call_builtin(name, args, ctx)
            }
        }
    }
}

fn unary(op: Operator, operand: Value) -> RuntimeResult<Value> {
    match (op, operand) {
        (Operator::Not, value) => Ok(Value::Bool(!value.is_truthy())),
        (Operator::Minus, Value::Int(i)) => match i.checked_neg() {
            Some(negated) => Ok(Value::Int(negated)),
            None => fail("integer overflow"),
        },
        (Operator::Minus, Value::Float(x)) => Ok(Value::Float(-x)),
        (op, value) => fail(format!("cannot apply `{op}` to {}", value.type_name())),
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(x) => Some(*x),
        _ => None,
    }
}

fn checked_int(op: Operator, a: i64, b: i64) -> RuntimeResult<Value> {
    if matches!(op, Operator::Divide | Operator::Percent) && b == 0 {
        return fail("division by zero");
    }
    let result = match op {
        Operator::Plus => a.checked_add(b),
        Operator::Minus => a.checked_sub(b),
        Operator::Multiply => a.checked_mul(b),
        Operator::Divide => a.checked_div(b),
        Operator::Percent => a.checked_rem(b),
        _ => unreachable!("non-arithmetic operator {op}"),
    };
    result.map(Value::Int).ok_or_else(|| RuntimeError::Error("integer overflow".to_string()))
}

fn binary(op: Operator, lhs: Value, rhs: Value) -> RuntimeResult<Value> {
    match op {
        Operator::EqualEqual => return Ok(Value::Bool(lhs == rhs)),
        Operator::NotEqual => return Ok(Value::Bool(lhs != rhs)),
        Operator::Less | Operator::LessEqual | Operator::Greater | Operator::GreaterEqual => {
            return compare(op, &lhs, &rhs);
        }
        _ => {}
    }

    match (op, lhs, rhs) {
        (_, Value::Int(a), Value::Int(b)) => checked_int(op, a, b),
        (Operator::Plus, Value::Str(mut a), b) => {
            a.push_str(&b.to_string());
            Ok(Value::Str(a))
        }
        (Operator::Plus, Value::List(mut a), Value::List(b)) => {
            a.extend(b);
            Ok(Value::List(a))
        }
        (op, a, b) => match (as_float(&a), as_float(&b)) {
            (Some(x), Some(y)) => Ok(Value::Float(match op {
                Operator::Plus => x + y,
                Operator::Minus => x - y,
                Operator::Multiply => x * y,
                Operator::Divide => x / y,
                _ => x % y,
            })),
            _ => fail(format!(
                "cannot apply `{op}` to {} and {}",
                a.type_name(),
                b.type_name()
            )),
        },
    }
}

fn compare(op: Operator, lhs: &Value, rhs: &Value) -> RuntimeResult<Value> {
    let ordering = match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
        (Value::Char(a), Value::Char(b)) => a.partial_cmp(b),
        (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
        (a, b) => match (as_float(a), as_float(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => {
                return fail(format!(
                    "cannot compare {} and {}",
                    lhs.type_name(),
                    rhs.type_name()
                ));
            }
        },
    };
    let Some(ordering) = ordering else {
        return Ok(Value::Bool(false));
    };
    Ok(Value::Bool(match op {
        Operator::Less => ordering.is_lt(),
        Operator::LessEqual => ordering.is_le(),
        Operator::Greater => ordering.is_gt(),
        _ => ordering.is_ge(),
    }))
}

fn list_index(len: usize, index: &Value) -> RuntimeResult<usize> {
    match index {
        Value::Int(i) if *i >= 0 && (*i as usize) < len => Ok(*i as usize),
        Value::Int(i) => fail(format!("index {i} out of range for length {len}")),
        other => fail(format!("cannot index with {}", other.type_name())),
    }
}

fn lookup(base: &Value, index: &Value) -> RuntimeResult<Value> {
    match base {
        Value::List(items) => Ok(items[list_index(items.len(), index)?].clone()),
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            Ok(Value::Char(chars[list_index(chars.len(), index)?]))
        }
        Value::Map(entries) => entries
            .iter()
            .find(|(key, _)| key == index)
            .map(|(_, value)| value.clone())
            .ok_or_else(|| RuntimeError::Error(format!("key {index} not found"))),
        other => fail(format!("cannot index into {}", other.type_name())),
    }
}

/// Admits `value` as an element of a container.
fn nestable(value: Value) -> RuntimeResult<Value> {
    if value.depth() >= MAX_NESTING {
        return fail(format!("values nested deeper than {MAX_NESTING} levels"));
    }
    Ok(value)
}

fn assign_index(container: &mut Value, index: Value, value: Value) -> RuntimeResult<()> {
    let value = nestable(value)?;
    match container {
        Value::List(items) => {
            let slot = list_index(items.len(), &index)?;
            items[slot] = value;
        }
        Value::Map(entries) => match entries.iter_mut().find(|(key, _)| *key == index) {
            Some((_, existing)) => *existing = value,
            None => entries.push((nestable(index)?, value)),
        },
        other => return fail(format!("cannot assign into {}", other.type_name())),
    }
    Ok(())
}

fn is_void_builtin(name: &str) -> bool {
    matches!(name, "print" | "eprint" | "sleep" | "block")
}

fn arity(name: &str, args: &[Value], expected: usize) -> RuntimeResult<()> {
    if args.len() == expected {
        Ok(())
    } else {
        fail(format!(
            "`{name}` takes {expected} argument(s), got {}",
            args.len()
        ))
    }
}

fn millis(name: &str, value: &Value) -> RuntimeResult<Duration> {
    match value {
        Value::Int(ms) if *ms >= 0 => Ok(Duration::from_millis(*ms as u64)),
        other => fail(format!("`{name}` expects a non-negative int, got {other}")),
    }
}

fn joined(args: &[Value]) -> String {
    args.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

fn call_builtin(name: &str, args: Vec<Value>, ctx: &EvalContext) -> RuntimeResult<Value> {
    match name {
        // Both streams land in the same capture buffer.
        "print" | "eprint" => {
            ctx.output().writeln(&joined(&args));
            Ok(Value::Null)
        }
        "len" => {
            arity(name, &args, 1)?;
            let len = match &args[0] {
                Value::Str(s) => s.chars().count(),
                Value::List(items) => items.len(),
                Value::Map(entries) => entries.len(),
                other => return fail(format!("`len` of {}", other.type_name())),
            };
            Ok(Value::Int(len as i64))
        }
        "str" => {
            arity(name, &args, 1)?;
            Ok(Value::Str(args[0].to_string()))
        }
        "type" => {
            arity(name, &args, 1)?;
            Ok(Value::from(args[0].type_name()))
        }
        "range" => {
            let (start, end) = match args.as_slice() {
                [Value::Int(end)] => (0, *end),
                [Value::Int(start), Value::Int(end)] => (*start, *end),
                _ => return fail("`range` expects one or two ints"),
            };
            if end.saturating_sub(start) > MAX_RANGE_LEN {
                return fail(format!("`range` longer than {MAX_RANGE_LEN}"));
            }
            Ok(Value::List((start..end).map(Value::Int).collect()))
        }
        "push" => {
            arity(name, &args, 2)?;
            let mut args = args.into_iter();
            match (args.next(), args.next()) {
                (Some(Value::List(mut items)), Some(item)) => {
                    items.push(nestable(item)?);
                    Ok(Value::List(items))
                }
                (Some(other), _) => fail(format!("`push` onto {}", other.type_name())),
                _ => fail("`push` takes 2 argument(s)"),
            }
        }
        "keys" => {
            arity(name, &args, 1)?;
            match &args[0] {
                Value::Map(entries) => Ok(Value::List(
                    entries.iter().map(|(key, _)| key.clone()).collect(),
                )),
                other => fail(format!("`keys` of {}", other.type_name())),
            }
        }
        "chr" => {
            arity(name, &args, 1)?;
            match &args[0] {
                Value::Int(code) => u32::try_from(*code)
                    .ok()
                    .and_then(char::from_u32)
                    .map(Value::Char)
                    .ok_or_else(|| RuntimeError::Error(format!("invalid code point {code}"))),
                other => fail(format!("`chr` of {}", other.type_name())),
            }
        }
        "ord" => {
            arity(name, &args, 1)?;
            match &args[0] {
                Value::Char(c) => Ok(Value::Int(i64::from(u32::from(*c)))),
                other => fail(format!("`ord` of {}", other.type_name())),
            }
        }
        "error" => fail(joined(&args)),
        "sleep" => {
            arity(name, &args, 1)?;
            let duration = millis(name, &args[0])?;
            let started = Instant::now();
            loop {
                ctx.checkpoint()?;
                let elapsed = started.elapsed();
                if elapsed >= duration {
                    return Ok(Value::Null);
                }
                std::thread::sleep(SLEEP_SLICE.min(duration - elapsed));
            }
        }
        // Ignores cancellation entirely.
        "block" => {
            arity(name, &args, 1)?;
            std::thread::sleep(millis(name, &args[0])?);
            Ok(Value::Null)
        }
        _ => fail(format!("unknown function `{name}`")),
    }
}
